//! TLS server with an explicit listen/close lifecycle.
//!
//! # Lifecycle
//! ```text
//! Idle ──listen──▶ Listening ──close──▶ Closing ──drained──▶ Closed
//! ```
//! - [`Server::listen`] binds and starts accepting; only valid from `Idle`.
//! - [`Server::close`] stops accepting, lets every open connection finish the
//!   request it is serving and resolves once all of them are gone. Later
//!   calls wait for the same drain.
//! - A closed server cannot be reopened.
//!
//! Connections are tracked with a [`TaskTracker`]; its length is the live
//! connection count.

mod connection;
pub mod tls;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::router::Router;

/// Interface used when [`Server::listen`] is given none.
pub const ALL_INTERFACES: &str = "0.0.0.0";

/// Errors raised by [`Server`] construction and lifecycle calls.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Key or certificate missing or unusable.
    #[error("invalid server configuration: {0}")]
    Config(String),

    /// The listener could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The call is not valid in the server's current state.
    #[error("{0}")]
    State(String),

    /// Server internals could not be inspected.
    #[error("failed to query server: {0}")]
    Query(String),
}

/// Where the server is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Idle,
    Listening,
    Closing,
    Closed,
}

/// TLS material for [`Server::new`]. Both fields are required.
#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    /// PEM-encoded private key.
    pub key: Option<Vec<u8>>,
    /// PEM-encoded certificate chain.
    pub cert: Option<Vec<u8>>,
}

enum Lifecycle {
    Idle,
    Listening {
        addr: SocketAddr,
        accept: JoinHandle<()>,
    },
    Closing {
        addr: SocketAddr,
    },
    Closed,
}

struct Inner {
    router: Router,
    acceptor: TlsAcceptor,
    lifecycle: Mutex<Lifecycle>,
    /// Fired by the first `close`.
    shutdown: CancellationToken,
    /// Fired once the drain has finished.
    closed: CancellationToken,
    connections: TaskTracker,
}

/// HTTPS server dispatching every request to a [`Router`].
pub struct Server {
    inner: Arc<Inner>,
}

impl Server {
    /// Validate the TLS material and create an idle server.
    ///
    /// No socket is opened until [`Server::listen`].
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Config`] if the key or certificate is missing,
    /// empty or cannot be parsed.
    pub fn new(options: ServerOptions, router: Router) -> Result<Self, ServerError> {
        let key = required(options.key, "key")?;
        let cert = required(options.cert, "cert")?;
        let config = tls::build_server_config(&cert, &key)?;

        Ok(Self {
            inner: Arc::new(Inner {
                router,
                acceptor: TlsAcceptor::from(config),
                lifecycle: Mutex::new(Lifecycle::Idle),
                shutdown: CancellationToken::new(),
                closed: CancellationToken::new(),
                connections: TaskTracker::new(),
            }),
        })
    }

    /// Bind `host:port` (all interfaces when `host` is `None`) and start
    /// accepting connections. Port `0` picks a free port; see
    /// [`Server::address`].
    ///
    /// # Errors
    ///
    /// - [`ServerError::State`] unless the server is idle.
    /// - [`ServerError::Bind`] if the address cannot be bound.
    pub async fn listen(&self, port: u16, host: Option<&str>) -> Result<(), ServerError> {
        if !matches!(*self.lock(), Lifecycle::Idle) {
            return Err(ServerError::State("server is already listening or closed".into()));
        }

        let host = host.unwrap_or(ALL_INTERFACES);
        let bind_error = |source: std::io::Error| ServerError::Bind {
            addr: format!("{host}:{port}"),
            source,
        };
        let listener = TcpListener::bind((host, port)).await.map_err(bind_error)?;
        let addr = listener.local_addr().map_err(bind_error)?;

        let mut lifecycle = self.lock();
        if !matches!(*lifecycle, Lifecycle::Idle) {
            // Lost a race with a concurrent `listen`; dropping the listener releases the port.
            return Err(ServerError::State("server is already listening or closed".into()));
        }
        let accept = tokio::spawn(accept_loop(listener, Arc::clone(&self.inner)));
        *lifecycle = Lifecycle::Listening { addr, accept };
        info!(%addr, "listening");
        Ok(())
    }

    /// Local address while listening or draining; `None` otherwise.
    pub fn address(&self) -> Option<SocketAddr> {
        match *self.lock() {
            Lifecycle::Listening { addr, .. } | Lifecycle::Closing { addr } => Some(addr),
            Lifecycle::Idle | Lifecycle::Closed => None,
        }
    }

    /// Number of connections currently open.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Query`] if the server state has been poisoned by
    /// a panic.
    pub fn connections(&self) -> Result<usize, ServerError> {
        let _lifecycle = self
            .inner
            .lifecycle
            .lock()
            .map_err(|_| ServerError::Query("server state is poisoned".into()))?;
        Ok(self.inner.connections.len())
    }

    pub fn state(&self) -> ServerState {
        match *self.lock() {
            Lifecycle::Idle => ServerState::Idle,
            Lifecycle::Listening { .. } => ServerState::Listening,
            Lifecycle::Closing { .. } => ServerState::Closing,
            Lifecycle::Closed => ServerState::Closed,
        }
    }

    /// Stop accepting and wait for every open connection to finish.
    ///
    /// In-flight requests are never cancelled. The drain runs on its own
    /// task, so dropping the returned future does not stop it. Calling
    /// `close` while a close is already under way, or after it finished,
    /// waits for that close.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::State`] if the server never listened.
    pub async fn close(&self) -> Result<(), ServerError> {
        let accept = {
            let mut lifecycle = self.lock();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Closed) {
                Lifecycle::Idle => {
                    *lifecycle = Lifecycle::Idle;
                    return Err(ServerError::State("server is not listening".into()));
                }
                Lifecycle::Listening { addr, accept } => {
                    *lifecycle = Lifecycle::Closing { addr };
                    Some(accept)
                }
                other => {
                    *lifecycle = other;
                    None
                }
            }
        };

        if let Some(accept) = accept {
            tokio::spawn(drain(Arc::clone(&self.inner), accept));
        }
        self.inner.closed.cancelled().await;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.inner.lock()
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Stop the accept loop, wait for tracked connections, then mark the server
/// closed and wake every `close` caller.
async fn drain(inner: Arc<Inner>, accept: JoinHandle<()>) {
    info!(connections = inner.connections.len(), "closing");
    inner.shutdown.cancel();
    if let Err(e) = accept.await {
        warn!(error = %e, "accept loop ended abnormally");
    }
    inner.connections.close();
    inner.connections.wait().await;

    *inner.lock() = Lifecycle::Closed;
    inner.closed.cancel();
    info!("closed");
}

fn required(value: Option<Vec<u8>>, name: &str) -> Result<Vec<u8>, ServerError> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ServerError::Config(format!("{name} must be defined"))),
    }
}

/// Accept until shutdown, handing each connection to its own tracked task.
///
/// Returning drops the listener, which releases the port.
async fn accept_loop(listener: TcpListener, inner: Arc<Inner>) {
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted connection");
                    inner.connections.spawn(connection::serve(
                        stream,
                        peer,
                        inner.acceptor.clone(),
                        inner.router.clone(),
                        inner.shutdown.clone(),
                    ));
                }
                Err(e) => warn!(error = %e, "accept error"),
            },
        }
    }
    debug!("listener released");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use futures_util::FutureExt;

    use crate::log::Log;
    use crate::router::RouteTable;

    const CERT: &[u8] = include_bytes!("../../tests/credentials/certificate.pem");
    const KEY: &[u8] = include_bytes!("../../tests/credentials/privateKey.pem");

    fn router() -> Router {
        Router::new(RouteTable::default(), Log::none())
    }

    fn options() -> ServerOptions {
        ServerOptions {
            key: Some(KEY.to_vec()),
            cert: Some(CERT.to_vec()),
        }
    }

    #[test]
    fn missing_key_is_config_error() {
        let opts = ServerOptions { key: None, ..options() };
        let err = Server::new(opts, router()).err().unwrap();
        assert!(matches!(err, ServerError::Config(ref m) if m == "key must be defined"));
    }

    #[test]
    fn missing_cert_is_config_error() {
        let opts = ServerOptions { cert: Some(Vec::new()), ..options() };
        let err = Server::new(opts, router()).err().unwrap();
        assert!(matches!(err, ServerError::Config(ref m) if m == "cert must be defined"));
    }

    #[tokio::test]
    async fn address_follows_lifecycle() {
        let server = Server::new(options(), router()).unwrap();
        assert_eq!(server.state(), ServerState::Idle);
        assert!(server.address().is_none());

        server.listen(0, Some("127.0.0.1")).await.unwrap();
        assert_eq!(server.state(), ServerState::Listening);
        let addr = server.address().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
        assert_eq!(server.connections().unwrap(), 0);

        server.close().await.unwrap();
        assert_eq!(server.state(), ServerState::Closed);
        assert!(server.address().is_none());
        assert_eq!(server.connections().unwrap(), 0);
    }

    #[tokio::test]
    async fn listen_twice_is_state_error() {
        let server = Server::new(options(), router()).unwrap();
        server.listen(0, Some("127.0.0.1")).await.unwrap();
        let err = server.listen(0, Some("127.0.0.1")).await.unwrap_err();
        assert!(matches!(err, ServerError::State(_)));
        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_from_idle_is_state_error() {
        let server = Server::new(options(), router()).unwrap();
        assert!(matches!(server.close().await, Err(ServerError::State(_))));
        assert_eq!(server.state(), ServerState::Idle);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let server = Server::new(options(), router()).unwrap();
        server.listen(0, Some("127.0.0.1")).await.unwrap();
        let (a, b) = tokio::join!(server.close(), server.close());
        assert!(a.is_ok());
        assert!(b.is_ok());
        server.close().await.unwrap();
        assert_eq!(server.state(), ServerState::Closed);
    }

    #[tokio::test]
    async fn abandoned_close_still_drains() {
        let server = Server::new(options(), router()).unwrap();
        server.listen(0, Some("127.0.0.1")).await.unwrap();

        // Poll the first close once, then drop it.
        assert!(server.close().now_or_never().is_none());

        tokio::time::timeout(Duration::from_secs(3), server.close())
            .await
            .expect("close did not finish")
            .unwrap();
        assert_eq!(server.state(), ServerState::Closed);
    }

    #[tokio::test]
    async fn reopen_after_close_is_state_error() {
        let server = Server::new(options(), router()).unwrap();
        server.listen(0, Some("127.0.0.1")).await.unwrap();
        server.close().await.unwrap();
        let err = server.listen(0, Some("127.0.0.1")).await.unwrap_err();
        assert!(matches!(err, ServerError::State(_)));
    }

    #[tokio::test]
    async fn port_in_use_is_bind_error() {
        let first = Server::new(options(), router()).unwrap();
        first.listen(0, Some("127.0.0.1")).await.unwrap();
        let port = first.address().unwrap().port();

        let second = Server::new(options(), router()).unwrap();
        let err = second.listen(port, Some("127.0.0.1")).await.unwrap_err();
        assert!(matches!(err, ServerError::Bind { .. }));
        assert_eq!(second.state(), ServerState::Idle);

        first.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_releases_port() {
        let server = Server::new(options(), router()).unwrap();
        server.listen(0, Some("127.0.0.1")).await.unwrap();
        let addr = server.address().unwrap();
        server.close().await.unwrap();
        TcpListener::bind(addr).await.unwrap();
    }
}
