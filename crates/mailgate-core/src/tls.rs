//! TLS acceptor shared by the SMTP and IMAP listeners

use anyhow::{anyhow, Result};
use mailgate_common::config::TlsConfig;
use rustls::pki_types::CertificateDer;
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

/// Load the certificate chain and key and build an acceptor
pub fn create_tls_acceptor(tls_config: &TlsConfig) -> Result<TlsAcceptor> {
    let cert_file = File::open(&tls_config.cert_path)
        .map_err(|e| anyhow!("Failed to open certificate file: {}", e))?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs: Vec<CertificateDer<'static>> = certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow!("Failed to parse certificates: {}", e))?;

    if certs.is_empty() {
        return Err(anyhow!("No certificates found in certificate file"));
    }

    info!(count = certs.len(), "Loaded TLS certificates");

    let key_file =
        File::open(&tls_config.key_path).map_err(|e| anyhow!("Failed to open key file: {}", e))?;
    let mut key_reader = BufReader::new(key_file);
    let key = private_key(&mut key_reader)
        .map_err(|e| anyhow!("Failed to read private key: {}", e))?
        .ok_or_else(|| anyhow!("No private key found in key file"))?;

    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| anyhow!("Failed to create TLS config: {}", e))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

/// Acceptor for the optional `[tls]` section. A broken configuration
/// disables STARTTLS instead of stopping the server.
pub fn acceptor_from_config(tls_config: Option<&TlsConfig>) -> Option<TlsAcceptor> {
    let tls_config = tls_config?;
    match create_tls_acceptor(tls_config) {
        Ok(acceptor) => {
            info!("TLS configured successfully");
            Some(acceptor)
        }
        Err(e) => {
            warn!(error = %e, "Failed to initialize TLS, STARTTLS disabled");
            None
        }
    }
}
