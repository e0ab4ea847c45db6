//! Request and response bodies of the public HTTPS API.
//!
//! Every body is JSON. Failures always use [`ErrorResponse`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ServiceError;

/// The only content-type the API accepts and produces.
pub const JSON_CONTENT_TYPE: &str = "application/json";

const INVALID: &str = "Invalid request:";

// ---------------------------------------------------------------------------
// Run endpoint
// ---------------------------------------------------------------------------

/// Request body for `POST /`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    /// Identifier of the report to run.
    pub report: String,
    /// Passed through to the report untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

impl RunRequest {
    /// Parse and validate a raw request body.
    ///
    /// An empty body is read as `{}`. A `report` that is falsy (`null`,
    /// `false`, `0` or `""`) counts as undefined.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Validation`] describing the first problem found.
    pub fn from_body(body: &[u8]) -> Result<Self, ServiceError> {
        let value: Value = if body.iter().all(u8::is_ascii_whitespace) {
            Value::Object(Default::default())
        } else {
            serde_json::from_slice(body)
                .map_err(|_| invalid("body must be valid JSON."))?
        };
        Self::from_value(value)
    }

    /// Validate an already parsed body.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Validation`] describing the first problem found.
    pub fn from_value(value: Value) -> Result<Self, ServiceError> {
        let Value::Object(mut body) = value else {
            return Err(invalid("body must be an object."));
        };
        let report = match body.remove("report") {
            None => return Err(invalid("report field must be defined.")),
            Some(v) if is_falsy(&v) => return Err(invalid("report field must be defined.")),
            Some(Value::String(s)) => s,
            Some(_) => return Err(invalid("report field must be a string.")),
        };
        Ok(Self {
            report,
            parameters: body.remove("parameters"),
        })
    }
}

fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(false) => true,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn invalid(reason: &str) -> ServiceError {
    ServiceError::Validation(format!("{INVALID} {reason}"))
}

/// Successful response body for `POST /`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResponse {
    /// Whatever the report produced.
    pub result: Value,
}

// ---------------------------------------------------------------------------
// Error response
// ---------------------------------------------------------------------------

/// Error body returned on any failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Human-readable description safe to expose to callers.
    pub error: String,
}

impl ErrorResponse {
    /// Construct an [`ErrorResponse`] from a message.
    pub fn new(error: impl Into<String>) -> Self {
        Self { error: error.into() }
    }
}

impl From<&ServiceError> for ErrorResponse {
    fn from(e: &ServiceError) -> Self {
        Self::new(e.to_string())
    }
}
