//! Tracing setup: structured JSON logs, plus OpenTelemetry spans when a
//! collector is configured.
//!
//! # Telemetry invariants
//!
//! - Request and response bodies never appear in operational events; request
//!   records carry the run request only under the `body` field.
//! - Log level is configurable via `--log-level` or `RUST_LOG` (default: `info`).

pub mod init;

pub use init::{init_telemetry, shutdown_telemetry};
