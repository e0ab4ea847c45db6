//! rustls server configuration from PEM-encoded key and certificate bytes.

use std::io::BufReader;
use std::sync::Arc;

use rustls::ServerConfig;

use super::ServerError;

/// Build a [`rustls::ServerConfig`] from PEM-encoded certificate and private key bytes.
///
/// Uses the ring provider. Only `http/1.1` is offered over ALPN.
///
/// # Errors
///
/// Returns [`ServerError::Config`] if the certificate or key cannot be parsed,
/// or if rustls rejects the configuration.
pub fn build_server_config(cert_pem: &[u8], key_pem: &[u8]) -> Result<Arc<ServerConfig>, ServerError> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_pem))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::Config(format!("failed to parse TLS certificate chain: {e}")))?;
    if certs.is_empty() {
        return Err(ServerError::Config("no certificate found in PEM data".into()));
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(key_pem))
        .map_err(|e| ServerError::Config(format!("failed to read TLS private key: {e}")))?
        .ok_or_else(|| ServerError::Config("no private key found in PEM data".into()))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ServerError::Config(format!("unsupported TLS protocol versions: {e}")))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Config(format!("failed to build rustls ServerConfig: {e}")))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}
