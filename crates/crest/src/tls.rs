//! Server-side TLS setup from PEM certificate and key files.

use std::{fs::File, io::BufReader, path::Path, sync::Arc};

use tokio_rustls::{
    TlsAcceptor,
    rustls::{self, pki_types::CertificateDer},
};

use crate::{Result, WsError};

/// Builds a TLS acceptor from a PEM certificate chain and a matching PEM
/// private key.
///
/// rustls never compresses and client certificates are not requested, which
/// matches the transport contract: no TLS compression, no mTLS.
pub(crate) fn acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let mut cert_reader = BufReader::new(File::open(cert_path)?);
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut cert_reader).collect::<std::io::Result<_>>()?;
    if certs.is_empty() {
        return Err(WsError::Config(format!(
            "no certificates found in {}",
            cert_path.display()
        )));
    }

    let mut key_reader = BufReader::new(File::open(key_path)?);
    let key = rustls_pemfile::private_key(&mut key_reader)?.ok_or_else(|| {
        WsError::Config(format!("no private key found in {}", key_path.display()))
    })?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
