//! Path/method dispatch with uniform error handling and request logging.
//!
//! # Dispatch
//! For every request the [`Router`]:
//! 1. assigns a fresh correlation id and logs `Request received.`;
//! 2. resolves the pathname (query ignored) and method against the
//!    [`RouteTable`];
//! 3. awaits the matched [`Handler`], catching returned errors and panics;
//! 4. turns any failure into a JSON `{"error": ...}` response with the
//!    matching status and logs it;
//! 5. logs `Response sent.` once the response body has been released.
//!
//! The route table is immutable once built and shared read-only across
//! concurrent dispatches.

mod body;

use std::any::Any;
use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use common::error::BoxError;
use common::{ErrorResponse, ServiceError, JSON_CONTENT_TYPE};
use futures_util::FutureExt;
use http::header::{ALLOW, CONTENT_TYPE};
use http::{HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::log::{Fields, Log};
use crate::serialize::{ErrorSummary, RequestSummary, ResponseSummary};

pub use body::LoggedBody;

/// Request body as seen by handlers.
pub type RequestBody = UnsyncBoxBody<Bytes, BoxError>;

/// What a handler completes with.
pub type HandlerResult = Result<Response<Full<Bytes>>, ServiceError>;

pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// Request-processing logic bound to one `(pathname, method)` pair.
///
/// The [`Log`] passed in already carries the serialized request.
///
/// Implemented for every `Fn(Request<RequestBody>, Log) -> impl Future<Output = HandlerResult>`,
/// so handlers that finish immediately (`std::future::ready`) and handlers
/// that suspend are registered the same way.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, request: Request<RequestBody>, log: Log) -> HandlerFuture;
}

impl<F, Fut> Handler for F
where
    F: Fn(Request<RequestBody>, Log) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, request: Request<RequestBody>, log: Log) -> HandlerFuture {
        Box::pin(self(request, log))
    }
}

/// Errors detected while building a [`RouteTable`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("{method} {pathname} is registered twice")]
    Duplicate { pathname: String, method: Method },

    #[error("pathname must start with '/': {0:?}")]
    InvalidPathname(String),
}

/// Methods registered for one pathname, in registration order.
#[derive(Clone, Default)]
struct Methods(Vec<(Method, Arc<dyn Handler>)>);

impl Methods {
    fn get(&self, method: &Method) -> Option<&Arc<dyn Handler>> {
        self.0.iter().find(|(m, _)| m == method).map(|(_, h)| h)
    }

    fn allow(&self) -> Vec<String> {
        self.0.iter().map(|(m, _)| m.to_string()).collect()
    }
}

/// Immutable mapping from exact pathname to method to handler.
#[derive(Clone, Default)]
pub struct RouteTable {
    paths: HashMap<String, Methods>,
}

impl RouteTable {
    pub fn builder() -> RouteTableBuilder {
        RouteTableBuilder::default()
    }

    /// Methods registered for `pathname`, in registration order.
    pub fn allowed(&self, pathname: &str) -> Option<Vec<String>> {
        self.paths.get(pathname).map(Methods::allow)
    }
}

/// Collects routes; problems surface from [`RouteTableBuilder::build`].
#[derive(Default)]
pub struct RouteTableBuilder {
    paths: HashMap<String, Methods>,
    error: Option<RouteError>,
}

impl RouteTableBuilder {
    /// Register `pathname` without any method.
    ///
    /// Every request to it is answered with 405 and an empty `Allow`.
    pub fn path(mut self, pathname: &str) -> Self {
        if self.check(pathname) {
            self.paths.entry(pathname.to_owned()).or_default();
        }
        self
    }

    pub fn route(mut self, pathname: &str, method: Method, handler: impl Handler) -> Self {
        if !self.check(pathname) {
            return self;
        }
        let methods = self.paths.entry(pathname.to_owned()).or_default();
        if methods.get(&method).is_some() {
            self.error.get_or_insert(RouteError::Duplicate {
                pathname: pathname.to_owned(),
                method,
            });
            return self;
        }
        methods.0.push((method, Arc::new(handler)));
        self
    }

    /// # Errors
    ///
    /// Returns the first [`RouteError`] met while registering routes.
    pub fn build(self) -> Result<RouteTable, RouteError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(RouteTable { paths: self.paths }),
        }
    }

    fn check(&mut self, pathname: &str) -> bool {
        if pathname.starts_with('/') {
            return true;
        }
        self.error
            .get_or_insert_with(|| RouteError::InvalidPathname(pathname.to_owned()));
        false
    }
}

/// Dispatches requests to the handlers of a [`RouteTable`].
#[derive(Clone)]
pub struct Router {
    routes: Arc<RouteTable>,
    log: Log,
}

impl Router {
    pub fn new(routes: RouteTable, log: Log) -> Self {
        Self {
            routes: Arc::new(routes),
            log,
        }
    }

    /// Handle one request. Never fails: every error becomes a response.
    pub async fn dispatch<B>(&self, request: Request<B>) -> Response<LoggedBody>
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let summary = RequestSummary::new(Uuid::new_v4(), &request);
        let log = self.log.child("request", &summary);
        log.info(Fields::new(), "Request received.");

        let head = request.method() == Method::HEAD;
        let response = match self.call(request, log.clone()).await {
            Ok(response) => response,
            Err(error) => {
                log.error(
                    Fields::new().with("error", ErrorSummary::new(&error)),
                    error.log_message(),
                );
                error_response(&error)
            }
        };

        let sent = ResponseSummary::new(&response);
        response.map(|body| LoggedBody::new(body, log, sent, head))
    }

    async fn call<B>(&self, request: Request<B>, log: Log) -> HandlerResult
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let pathname = request.uri().path().to_owned();
        let methods = self
            .routes
            .paths
            .get(&pathname)
            .ok_or_else(|| ServiceError::NotFound { pathname: pathname.clone() })?;
        let handler = methods.get(request.method()).ok_or_else(|| ServiceError::MethodNotAllowed {
            method: request.method().to_string(),
            pathname: pathname.clone(),
            allow: methods.allow(),
        })?;

        let request = request.map(|body| body.map_err(Into::into).boxed_unsync());
        let future = panic::catch_unwind(AssertUnwindSafe(|| handler.call(request, log)))
            .map_err(panicked)?;
        AssertUnwindSafe(future)
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(panicked(payload)))
    }
}

impl<B> tower::Service<Request<B>> for Router
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    type Response = Response<LoggedBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<B>) -> Self::Future {
        let router = self.clone();
        Box::pin(async move { Ok(router.dispatch(request).await) })
    }
}

/// Build a JSON response.
///
/// # Errors
///
/// Returns [`ServiceError::Internal`] if `body` cannot be serialised.
pub fn json(status: StatusCode, body: &impl Serialize) -> HandlerResult {
    let bytes = serde_json::to_vec(body).map_err(ServiceError::internal)?;
    let mut response = Response::new(Full::new(Bytes::from(bytes)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
    Ok(response)
}

fn error_response(error: &ServiceError) -> Response<Full<Bytes>> {
    let status =
        StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = json(status, &ErrorResponse::from(error)).unwrap_or_else(|_| {
        let mut empty = Response::new(Full::default());
        *empty.status_mut() = status;
        empty
    });
    if let ServiceError::MethodNotAllowed { allow, .. } = error {
        if let Ok(value) = HeaderValue::from_str(&allow.join(",")) {
            response.headers_mut().insert(ALLOW, value);
        }
    }
    response
}

#[derive(Debug, Error)]
#[error("{0}")]
struct HandlerPanic(String);

fn panicked(payload: Box<dyn Any + Send>) -> ServiceError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_owned());
    ServiceError::internal(HandlerPanic(message))
}
