//! `chronicle-server` binary entry point.
//!
//! Startup sequence:
//! 1. Parse flags and load [`Config`] (flags over `CHRONICLE_*` variables).
//! 2. Initialise the telemetry pipeline.
//! 3. Read the TLS key and certificate.
//! 4. Build the route table and start the TLS server.
//! 5. On `SIGINT`/`SIGTERM`, drain the server and exit 0. A fault after
//!    the server started drains it too, then exits 1; a startup fault exits 1.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use chronicle_server::log::{Log, TracingSink};
use chronicle_server::report::ProcessRunner;
use chronicle_server::router::Router;
use chronicle_server::routes::{self, AppState};
use chronicle_server::server::{Server, ServerOptions};
use chronicle_server::{shutdown, telemetry, Cli, Config};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let cfg = match Config::load(&cli) {
        Ok(cfg) => cfg,
        Err(e) => {
            // Telemetry is not yet up; write to stderr directly.
            eprintln!("ERROR: configuration invalid: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = telemetry::init_telemetry(&cfg.log_level, cfg.otlp_endpoint.as_deref()) {
        eprintln!("ERROR: {e:#}");
        return ExitCode::FAILURE;
    }
    shutdown::install_panic_hook();

    let code = match run(cfg).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = ?e, "Server failed.");
            ExitCode::FAILURE
        }
    };
    telemetry::shutdown_telemetry();
    code
}

async fn run(cfg: Config) -> Result<()> {
    info!(
        arch = std::env::consts::ARCH,
        os = std::env::consts::OS,
        version = env!("CARGO_PKG_VERSION"),
        cwd = ?std::env::current_dir().ok(),
        argv = ?std::env::args().collect::<Vec<_>>(),
        "Runtime info."
    );
    info!(
        key = %cfg.key,
        cert = %cfg.cert,
        port = cfg.port,
        interface = %cfg.interface,
        body_limit = cfg.body_limit,
        report_interpreter = ?cfg.report_interpreter,
        reports_dir = ?cfg.reports_dir,
        "Arguments."
    );

    info!(path = %cfg.key, "Reading key ...");
    let key = read(&cfg.key).await?;
    info!("Key read.");
    info!(path = %cfg.cert, "Reading cert ...");
    let cert = read(&cfg.cert).await?;
    info!("Cert read.");

    let mut runner = match &cfg.report_interpreter {
        Some(interpreter) => ProcessRunner::with_interpreter(interpreter),
        None => ProcessRunner::new(),
    };
    if let Some(dir) = &cfg.reports_dir {
        runner = runner.reports_dir(dir);
    }
    let state = AppState::new(Arc::new(runner), cfg.body_limit);
    let router = Router::new(routes::table(state)?, Log::new(Arc::new(TracingSink)));

    let server = Server::new(
        ServerOptions {
            key: Some(key),
            cert: Some(cert),
        },
        router,
    )?;
    info!("Starting server ...");
    server.listen(cfg.port, Some(&cfg.interface)).await?;
    info!(address = ?server.address(), "Server started.");

    shutdown::run_until(&server, async {
        let signal = shutdown::signal()
            .await
            .context("failed to install signal handlers")?;
        info!(signal, "Received signal.");
        anyhow::Ok(())
    })
    .await
}

async fn read(path: impl AsRef<Path>) -> Result<Vec<u8>> {
    let path = path.as_ref();
    tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))
}
