//! HTTPS service that runs reports on request.
//!
//! A [`Server`] terminates TLS and hands every request to a [`Router`], which
//! dispatches on pathname and method, converts failures into JSON error
//! responses and writes one structured record per request phase through a
//! [`Log`]. The only route, `POST /`, runs a report through a
//! [`ReportRunner`].

pub mod config;
pub mod log;
pub mod report;
pub mod router;
pub mod routes;
pub mod serialize;
pub mod server;
pub mod shutdown;
pub mod telemetry;

pub use config::{Cli, Config};
pub use log::{Log, LogSink, MemorySink, NullSink, TracingSink};
pub use report::{ProcessRunner, ReportError, ReportRunner};
pub use router::{RouteError, RouteTable, Router};
pub use routes::AppState;
pub use server::{Server, ServerError, ServerOptions, ServerState};
