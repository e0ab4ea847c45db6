//! Wire types and request-level errors shared across `chronicle-server` crates.

pub mod error;
pub mod protocol;

pub use error::ServiceError;
pub use protocol::{ErrorResponse, RunRequest, RunResponse, JSON_CONTENT_TYPE};
