//! TLS configuration for the RTR-over-TLS listener.

use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;

use log::error;
use tokio_rustls::rustls::{Certificate, PrivateKey, ServerConfig};
use tokio_rustls::TlsAcceptor;

use crate::error::ExitError;

/// Builds a `TlsAcceptor` from a PEM certificate chain and PKCS#8 key.
pub fn server_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, ExitError> {
    let certs = rustls_pemfile::certs(&mut io::BufReader::new(
        File::open(cert_path).map_err(|err| {
            error!("Failed to open TLS certificate file '{}': {}.", cert_path.display(), err);
            ExitError::Generic
        })?
    )).map_err(|err| {
        error!("Failed to read TLS certificate file '{}': {}.", cert_path.display(), err);
        ExitError::Generic
    })?.into_iter().map(Certificate).collect();

    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut io::BufReader::new(
        File::open(key_path).map_err(|err| {
            error!("Failed to open TLS key file '{}': {}.", key_path.display(), err);
            ExitError::Generic
        })?
    )).map_err(|err| {
        error!("Failed to read TLS key file '{}': {}.", key_path.display(), err);
        ExitError::Generic
    })?;
    if keys.is_empty() {
        error!("TLS key file '{}' does not contain any usable keys.", key_path.display());
        return Err(ExitError::Generic);
    }
    if keys.len() != 1 {
        error!("TLS key file '{}' contains multiple keys.", key_path.display());
        return Err(ExitError::Generic);
    }
    let key = PrivateKey(keys.pop().unwrap());

    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| {
            error!("Failed to create RTR TLS server config: {}", err);
            ExitError::Generic
        })?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
