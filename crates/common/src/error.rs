//! Request-level error taxonomy.

use thiserror::Error;

/// Boxed error carried by [`ServiceError::Internal`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Every failure a single request can end in.
///
/// `Display` is the message sent to the client in the `error` field, so it
/// never carries more than the failure's own message.
///
/// Variants map to HTTP status codes:
/// - [`ServiceError::NotFound`] → 404
/// - [`ServiceError::MethodNotAllowed`] → 405
/// - [`ServiceError::UnsupportedMediaType`] → 415
/// - [`ServiceError::Validation`] → 400
/// - [`ServiceError::PayloadTooLarge`] → 413
/// - [`ServiceError::Internal`] → 500
#[derive(Debug, Error)]
pub enum ServiceError {
    /// No route is registered for the pathname.
    #[error("{pathname} not found")]
    NotFound { pathname: String },

    /// The pathname exists but does not accept the method.
    #[error("{method} not allowed for {pathname}")]
    MethodNotAllowed {
        method: String,
        pathname: String,
        /// Methods registered for the pathname, in registration order.
        allow: Vec<String>,
    },

    /// The request content-type is not the one the handler accepts.
    #[error("{0}")]
    UnsupportedMediaType(String),

    /// The request body does not have the expected shape.
    #[error("{0}")]
    Validation(String),

    /// The request body exceeded the configured limit.
    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    /// Anything else a handler failed with.
    #[error(transparent)]
    Internal(BoxError),
}

impl ServiceError {
    /// Wrap an arbitrary failure as [`ServiceError::Internal`].
    pub fn internal(error: impl Into<BoxError>) -> Self {
        ServiceError::Internal(error.into())
    }

    /// Returns the HTTP status code that should be sent for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            ServiceError::NotFound { .. } => 404,
            ServiceError::MethodNotAllowed { .. } => 405,
            ServiceError::UnsupportedMediaType(_) => 415,
            ServiceError::Validation(_) => 400,
            ServiceError::PayloadTooLarge { .. } => 413,
            ServiceError::Internal(_) => 500,
        }
    }

    /// Message of the error log record written when this error ends a request.
    pub fn log_message(&self) -> &'static str {
        match self {
            ServiceError::NotFound { .. } => "Not found.",
            ServiceError::MethodNotAllowed { .. } => "Method not allowed.",
            ServiceError::UnsupportedMediaType(_) => "Unsupported media type.",
            ServiceError::Validation(_) => "Invalid request.",
            ServiceError::PayloadTooLarge { .. } => "Payload too large.",
            ServiceError::Internal(_) => "Internal server error.",
        }
    }
}
