//! TCP and TLS connection setup.

use std::path::Path;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};

use super::DriverError;
use crate::config::ServerAddr;

/// An open connection that has not started IRC registration.
pub enum Stream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

/// Open a connection to `server`, negotiating TLS when asked. A client
/// certificate in `certfile` (PEM, certificate chain and key) is offered
/// for SASL EXTERNAL.
pub async fn connect(
    server: &ServerAddr,
    tls: bool,
    insecure: bool,
    certfile: Option<&Path>,
) -> Result<Stream, DriverError> {
    let tcp = TcpStream::connect((server.host.as_str(), server.port))
        .await
        .map_err(|e| DriverError::ConnectionLost(format!("TCP connect to {server} failed: {e}")))?;
    tracing::debug!(%server, tls, "TCP connected");
    if !tls {
        return Ok(Stream::Plain(tcp));
    }

    let config = client_config(insecure, certfile)?;
    let connector = TlsConnector::from(Arc::new(config));
    let name = ServerName::try_from(server.host.clone())
        .map_err(|e| DriverError::Tls(format!("invalid server name {}: {e}", server.host)))?;
    let stream = connector
        .connect(name, tcp)
        .await
        .map_err(|e| DriverError::Tls(format!("TLS handshake with {server} failed: {e}")))?;
    tracing::debug!(%server, "TLS handshake complete");
    Ok(Stream::Tls(Box::new(stream)))
}

fn install_crypto_provider() {
    // Fails harmlessly when a provider is already installed.
    let _ = rustls::crypto::ring::default_provider().install_default();
}

pub fn client_config(insecure: bool, certfile: Option<&Path>) -> Result<rustls::ClientConfig, DriverError> {
    install_crypto_provider();
    let builder = if insecure {
        tracing::warn!("TLS certificate verification is disabled");
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
    } else {
        let roots = rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        rustls::ClientConfig::builder().with_root_certificates(roots)
    };
    match certfile {
        Some(path) => {
            let (chain, key) = load_identity(path)?;
            builder
                .with_client_auth_cert(chain, key)
                .map_err(|e| DriverError::Tls(format!("unusable client certificate {}: {e}", path.display())))
        }
        None => Ok(builder.with_no_client_auth()),
    }
}

fn load_identity(path: &Path) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), DriverError> {
    let tls_err = |what: &str| DriverError::Tls(format!("{what} in {}", path.display()));
    let pem = std::fs::read(path).map_err(|e| tls_err(&format!("cannot read certificate ({e})")))?;
    let chain = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_err(&format!("bad certificate ({e})")))?;
    if chain.is_empty() {
        return Err(tls_err("no certificate"));
    }
    let key = rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|e| tls_err(&format!("bad private key ({e})")))?
        .ok_or_else(|| tls_err("no private key"))?;
    Ok((chain, key))
}

#[derive(Debug)]
struct InsecureVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::CryptoProvider::get_default()
            .map(|p| p.signature_verification_algorithms.supported_schemes())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configs_build_without_a_client_certificate() {
        assert!(client_config(false, None).is_ok());
        assert!(client_config(true, None).is_ok());
    }

    #[test]
    fn unreadable_certificates_are_tls_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.pem");
        assert!(matches!(client_config(false, Some(&missing)), Err(DriverError::Tls(_))));
        let empty = dir.path().join("empty.pem");
        std::fs::write(&empty, "").unwrap();
        assert!(matches!(client_config(false, Some(&empty)), Err(DriverError::Tls(_))));
    }
}
