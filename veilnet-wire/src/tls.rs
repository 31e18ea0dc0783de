//! Optional TLS wrapping (`spec.md` §4.4): DPI resistance and link-layer
//! cover only. No confidentiality or authenticity guarantee of this
//! system depends on it — that all comes from the ratchet AEAD.
//!
//! Grounded on `freeq_sdk::client`'s `tokio_rustls::TlsConnector` usage,
//! including its install-once crypto provider and insecure-verifier
//! escape hatch (useful for nodes behind self-signed or ephemeral certs,
//! since peer authentication here is carried by `IK_pub`, not the
//! certificate chain).

use std::sync::{Arc, Once};

use tokio::net::TcpStream;
use tokio_rustls::rustls;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::WireError;

static INSTALL_CRYPTO_PROVIDER: Once = Once::new();

fn ensure_crypto_provider() {
    INSTALL_CRYPTO_PROVIDER.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Connect over TCP and wrap in TLS as a client. `insecure` skips server
/// certificate verification entirely — only ever appropriate when the
/// peer's identity is going to be authenticated by the ratchet's `IK_pub`
/// binding regardless.
pub async fn connect_tls(addr: &str, server_name: &str, insecure: bool) -> Result<tokio_rustls::client::TlsStream<TcpStream>, WireError> {
    ensure_crypto_provider();
    let tcp = TcpStream::connect(addr).await?;
    let config = if insecure { insecure_client_config() } else { default_client_config() };
    let connector = TlsConnector::from(Arc::new(config));
    let dns_name = rustls::pki_types::ServerName::try_from(server_name.to_string())
        .map_err(|e| WireError::Tls(format!("invalid server name {server_name}: {e}")))?;
    connector
        .connect(dns_name, tcp)
        .await
        .map_err(|e| WireError::Tls(format!("TLS handshake failed: {e}")))
}

/// Accept a TCP connection and wrap it in TLS as a server, using a
/// locally generated self-signed certificate (no external CA dependency
/// for a peer-to-peer node).
pub async fn accept_tls(tcp: TcpStream, acceptor: &TlsAcceptor) -> Result<tokio_rustls::server::TlsStream<TcpStream>, WireError> {
    acceptor.accept(tcp).await.map_err(|e| WireError::Tls(format!("TLS accept failed: {e}")))
}

fn default_client_config() -> rustls::ClientConfig {
    let root_store = rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth()
}

fn insecure_client_config() -> rustls::ClientConfig {
    ensure_crypto_provider();
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerify))
        .with_no_client_auth()
}

/// Self-signed certificate and key for a server-side TLS acceptor.
/// Persisted alongside the node's other state so restarts keep the same
/// certificate (avoids churn in peers pinning it).
pub fn acceptor_from_cert(cert_der: Vec<u8>, key_der: rustls::pki_types::PrivateKeyDer<'static>) -> Result<TlsAcceptor, WireError> {
    ensure_crypto_provider();
    let cert = rustls::pki_types::CertificateDer::from(cert_der);
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key_der)
        .map_err(|e| WireError::Tls(format!("invalid server certificate: {e}")))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[derive(Debug)]
struct NoVerify;

impl rustls::client::danger::ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::CryptoProvider::get_default()
            .expect("crypto provider installed at startup")
            .signature_verification_algorithms
            .supported_schemes()
    }
}
