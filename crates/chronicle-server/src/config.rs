//! Configuration loading and validation.
//!
//! Values are layered: built-in defaults, then `CHRONICLE_*` environment
//! variables, then command-line flags. The process exits with a clear error
//! message if the result is incomplete or invalid.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use config::Environment;
use serde::Deserialize;

use crate::routes::state::DEFAULT_BODY_LIMIT;
use crate::server::ALL_INTERFACES;

/// Prefix of the environment variables read by [`Config::load`].
pub const ENV_PREFIX: &str = "CHRONICLE";

/// Command-line flags. Anything given here overrides the environment.
#[derive(Debug, Clone, Default, Parser)]
#[command(name = "chronicle-server", version, about)]
pub struct Cli {
    /// Path to the PEM-encoded TLS private key.
    #[arg(short, long, value_name = "path")]
    pub key: Option<String>,

    /// Path to the PEM-encoded TLS certificate chain.
    #[arg(short, long, value_name = "path")]
    pub cert: Option<String>,

    /// Port to listen on [default: 8443].
    #[arg(short, long, value_name = "port")]
    pub port: Option<u16>,

    /// Interface to listen on [default: all].
    #[arg(short, long, value_name = "interface")]
    pub interface: Option<String>,

    /// Tracing filter directive (e.g. `info`, `debug`).
    #[arg(long, value_name = "level")]
    pub log_level: Option<String>,

    /// OTLP/gRPC collector endpoint; spans are not exported without one.
    #[arg(long, value_name = "url")]
    pub otlp_endpoint: Option<String>,

    /// Program that reports are handed to as a script, e.g. `sh`.
    #[arg(long, value_name = "path")]
    pub report_interpreter: Option<String>,

    /// Directory that every report must resolve inside.
    #[arg(long, value_name = "dir")]
    pub reports_dir: Option<String>,

    /// Largest accepted request body in bytes.
    #[arg(long, value_name = "bytes")]
    pub body_limit: Option<u64>,
}

/// Validated service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Path to the TLS private key. **Required.**
    #[serde(default)]
    pub key: String,

    /// Path to the TLS certificate chain. **Required.**
    #[serde(default)]
    pub cert: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_interface")]
    pub interface: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub otlp_endpoint: Option<String>,

    #[serde(default)]
    pub report_interpreter: Option<PathBuf>,

    /// When set, reports outside this directory are refused.
    #[serde(default)]
    pub reports_dir: Option<PathBuf>,

    #[serde(default = "default_body_limit")]
    pub body_limit: usize,
}

fn default_port() -> u16 {
    8443
}
fn default_interface() -> String {
    ALL_INTERFACES.into()
}
fn default_log_level() -> String {
    "info".into()
}
fn default_body_limit() -> usize {
    DEFAULT_BODY_LIMIT
}

impl Config {
    /// Load and validate configuration from the process environment and `cli`.
    ///
    /// # Errors
    ///
    /// Returns an error if a value cannot be parsed or a required one is
    /// missing.
    pub fn load(cli: &Cli) -> Result<Self> {
        Self::from_sources(cli, Environment::with_prefix(ENV_PREFIX))
    }

    fn from_sources(cli: &Cli, env: Environment) -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(env)
            .set_override_option("key", cli.key.clone())?
            .set_override_option("cert", cli.cert.clone())?
            .set_override_option("port", cli.port.map(i64::from))?
            .set_override_option("interface", cli.interface.clone())?
            .set_override_option("log_level", cli.log_level.clone())?
            .set_override_option("otlp_endpoint", cli.otlp_endpoint.clone())?
            .set_override_option("report_interpreter", cli.report_interpreter.clone())?
            .set_override_option("reports_dir", cli.reports_dir.clone())?
            .set_override_option("body_limit", cli.body_limit)?
            .build()
            .context("failed to build configuration")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        c.validate()?;
        Ok(c)
    }

    fn validate(&self) -> Result<()> {
        if self.key.trim().is_empty() {
            anyhow::bail!("--key must be specified");
        }
        if self.cert.trim().is_empty() {
            anyhow::bail!("--cert must be specified");
        }
        if self.body_limit == 0 {
            anyhow::bail!("--body-limit must be > 0");
        }
        Ok(())
    }
}
