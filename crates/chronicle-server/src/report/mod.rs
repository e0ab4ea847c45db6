//! Report-execution collaborator.
//!
//! The HTTP layer only knows the [`ReportRunner`] contract: given a report
//! identifier and optional parameters, produce a JSON result or fail.
//! [`ProcessRunner`] is the implementation the binary uses.

mod process;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub use process::ProcessRunner;

/// Errors produced while running a report.
#[derive(Debug, Error)]
pub enum ReportError {
    /// The report program could not be started or talked to.
    #[error("failed to run report {report}: {source}")]
    Io {
        report: String,
        #[source]
        source: std::io::Error,
    },

    /// The report exited unsuccessfully.
    #[error("report {report} failed ({status}): {stderr}")]
    Failed {
        report: String,
        status: String,
        stderr: String,
    },

    /// The report resolves outside the configured reports directory.
    #[error("report {report} is outside the reports directory")]
    Forbidden { report: String },

    /// The report wrote something other than JSON.
    #[error("report {report} produced invalid output: {source}")]
    Output {
        report: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Runs reports on behalf of request handlers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReportRunner: Send + Sync {
    /// Run `report` with `parameters` and return what it produced.
    async fn run(&self, report: &str, parameters: Option<Value>) -> Result<Value, ReportError>;
}
