//! Orderly shutdown at the process boundary.

use std::any::Any;
use std::future::Future;

use tracing::{error, info};

use crate::server::{Server, ServerError};

/// Wait for a termination request and return the name of the signal.
///
/// Resolves on `SIGINT` or `SIGTERM`; on non-Unix targets, on ctrl-c.
///
/// # Errors
///
/// Returns an error if the signal handlers cannot be installed.
#[cfg(unix)]
pub async fn signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    Ok(tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
    })
}

#[cfg(not(unix))]
pub async fn signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}

/// Close `server`, logging the open connection count before and after.
///
/// # Errors
///
/// Propagates the [`ServerError`] from querying or closing the server.
pub async fn stop(server: &Server) -> Result<(), ServerError> {
    info!(connections = server.connections()?, "Stopping server ...");
    server.close().await?;
    info!(connections = server.connections()?, "Server stopped.");
    Ok(())
}

/// Wait for `trigger`, then stop `server` however it resolved.
///
/// A failed trigger is logged as `Uncaught exception.` and returned once the
/// server has drained.
///
/// # Errors
///
/// Returns the trigger's error, or the [`ServerError`] from stopping.
pub async fn run_until<T, E>(
    server: &Server,
    trigger: impl Future<Output = Result<T, E>>,
) -> anyhow::Result<T>
where
    E: Into<anyhow::Error>,
{
    let outcome = trigger.await.map_err(Into::into);
    if let Err(e) = &outcome {
        error!(error = ?e, "Uncaught exception.");
    }
    stop(server).await?;
    outcome
}

/// Log every panic as `Uncaught exception.` through `tracing`.
///
/// Panics inside request handlers are still turned into 500 responses; this
/// only adds the fatal record.
pub fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let location = info.location().map(ToString::to_string);
        error!(
            panic = panic_message(info.payload()),
            location = location.as_deref().unwrap_or("unknown"),
            "Uncaught exception."
        );
    }));
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("panic")
}
