// ABOUTME: Client-side TLS for the line and XML stream transports
// ABOUTME: rustls with the ring provider and the bundled webpki roots

use anyhow::{Context, Result};
use rustls::pki_types::ServerName;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

pub fn connector() -> Result<TlsConnector> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .context("Failed to configure TLS protocol versions")?
    .with_root_certificates(roots)
    .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Upgrade an established TCP stream, verifying the certificate against `host`
pub async fn upgrade(host: &str, tcp: TcpStream) -> Result<TlsStream<TcpStream>> {
    let name = ServerName::try_from(host.to_string())
        .with_context(|| format!("Invalid TLS server name: {}", host))?;
    connector()?
        .connect(name, tcp)
        .await
        .with_context(|| format!("TLS handshake with {} failed", host))
}
