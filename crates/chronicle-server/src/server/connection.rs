//! Serving one accepted TCP connection: TLS handshake, then HTTP/1.1.

use std::convert::Infallible;
use std::net::SocketAddr;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::router::Router;
use crate::serialize::ConnectInfo;

/// Drive `stream` until the client is done with it.
///
/// Once `shutdown` fires the connection finishes the request in flight, if
/// any, and then closes. A handshake still in progress is abandoned.
pub(crate) async fn serve(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    router: Router,
    shutdown: CancellationToken,
) {
    let tls = tokio::select! {
        res = acceptor.accept(stream) => match res {
            Ok(tls) => tls,
            Err(e) => {
                debug!(%peer, error = %e, "TLS handshake failed");
                return;
            }
        },
        _ = shutdown.cancelled() => return,
    };

    let service = service_fn(move |mut request: Request<Incoming>| {
        request.extensions_mut().insert(ConnectInfo(peer));
        let router = router.clone();
        async move { Ok::<_, Infallible>(router.dispatch(request).await) }
    });

    let conn = http1::Builder::new().serve_connection(TokioIo::new(tls), service);
    let mut conn = std::pin::pin!(conn);
    let result = tokio::select! {
        res = conn.as_mut() => res,
        _ = shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };
    if let Err(e) = result {
        debug!(%peer, error = %e, "connection error");
    }
    debug!(%peer, "connection closed");
}
