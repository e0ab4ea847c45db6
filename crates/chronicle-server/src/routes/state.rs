//! Shared state injected into every route handler.

use std::sync::Arc;

use crate::report::{ProcessRunner, ReportRunner};

/// Largest request body accepted unless configured otherwise.
pub const DEFAULT_BODY_LIMIT: usize = 1024 * 1024;

/// State shared across all request handlers.
///
/// Cheap to clone: the runner is behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    /// Runs the reports named in requests.
    pub runner: Arc<dyn ReportRunner>,
    /// Maximum request body size in bytes.
    pub body_limit: usize,
}

impl AppState {
    pub fn new(runner: Arc<dyn ReportRunner>, body_limit: usize) -> Self {
        Self { runner, body_limit }
    }
}

impl Default for AppState {
    /// Process-backed runner without an interpreter and the default body limit.
    fn default() -> Self {
        Self::new(Arc::new(ProcessRunner::new()), DEFAULT_BODY_LIMIT)
    }
}
