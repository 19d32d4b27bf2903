//! Transport dialing: plain TCP or TLS with an explicit trust policy.
//!
//! Hubs and TVs on the local network present self-signed certificates, so
//! sessions targeting them default to [`TlsPolicy::AcceptInvalidCerts`].
//! The policy is a visible field on every config, never an implicit choice.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{self, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::error::LocalError;

/// How the peer certificate is checked on TLS connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsPolicy {
    /// Verify the chain against the bundled web PKI roots.
    VerifyPeer,
    /// Skip certificate verification. Handshake signatures are still checked.
    #[default]
    AcceptInvalidCerts,
}

impl TlsPolicy {
    /// Returns `true` if certificate verification is disabled.
    #[must_use]
    pub const fn accepts_invalid_certs(self) -> bool {
        matches!(self, Self::AcceptInvalidCerts)
    }
}

/// Byte stream a session runs on, plain or TLS.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Boxed transport, so plain and TLS sessions share one code path.
pub type BoxedTransport = Box<dyn Transport>;

/// Verifier that trusts any certificate but still checks signatures.
#[derive(Debug)]
struct AcceptAnyCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Builds a TLS connector for `policy`.
///
/// # Errors
///
/// Returns [`LocalError::Tls`] if the crypto provider rejects the default
/// protocol versions.
pub fn connector(policy: TlsPolicy) -> Result<TlsConnector, LocalError> {
    let provider = Arc::new(crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| LocalError::Tls(e.to_string()))?;

    let config = match policy {
        TlsPolicy::VerifyPeer => {
            let roots = rustls::RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            };
            builder.with_root_certificates(roots).with_no_client_auth()
        }
        TlsPolicy::AcceptInvalidCerts => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert { provider }))
            .with_no_client_auth(),
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Dials `host:port`, wrapping the socket in TLS when `secure` is set.
///
/// # Errors
///
/// Returns [`LocalError::Io`] if the TCP connect or TLS handshake fails, and
/// [`LocalError::Tls`] if `host` is not a valid server name.
pub async fn dial(
    host: &str,
    port: u16,
    secure: bool,
    policy: TlsPolicy,
) -> Result<BoxedTransport, LocalError> {
    let tcp = TcpStream::connect((host, port)).await?;
    let _ = tcp.set_nodelay(true);

    if !secure {
        return Ok(Box::new(tcp));
    }

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| LocalError::Tls(format!("invalid server name {host:?}: {e}")))?;
    let tls = connector(policy)?.connect(server_name, tcp).await?;
    tracing::debug!(host, port, ?policy, "tls session established");
    Ok(Box::new(tls))
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_accepts_local_certs() {
        assert_eq!(TlsPolicy::default(), TlsPolicy::AcceptInvalidCerts);
        assert!(TlsPolicy::default().accepts_invalid_certs());
        assert!(!TlsPolicy::VerifyPeer.accepts_invalid_certs());
    }

    #[test]
    fn connectors_build_for_both_policies() {
        assert!(connector(TlsPolicy::VerifyPeer).is_ok());
        assert!(connector(TlsPolicy::AcceptInvalidCerts).is_ok());
    }

    #[tokio::test]
    async fn dial_refused_port_is_io_error() {
        let Ok(listener) = tokio::net::TcpListener::bind("127.0.0.1:0").await else {
            panic!("bind failed");
        };
        let Ok(addr) = listener.local_addr() else {
            panic!("no local addr");
        };
        drop(listener);

        let result = dial("127.0.0.1", addr.port(), false, TlsPolicy::VerifyPeer).await;
        assert!(matches!(result, Err(LocalError::Io(_))));
    }
}
