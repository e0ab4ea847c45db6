//! The service's route table.

mod run;
pub mod state;

use http::{Method, Request};

use crate::log::Log;
use crate::router::{RequestBody, RouteError, RouteTable};

pub use state::AppState;

/// Build the route table: `POST /` runs a report.
///
/// # Errors
///
/// Returns a [`RouteError`] if the table is inconsistent.
pub fn table(state: AppState) -> Result<RouteTable, RouteError> {
    RouteTable::builder()
        .route("/", Method::POST, move |request: Request<RequestBody>, log: Log| {
            run::run(state.clone(), request, log)
        })
        .build()
}
