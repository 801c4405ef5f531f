//! rustls client configurations for the printer broker.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::warn;

use crate::trust::CertificateVerifier;

/// How the broker's certificate is judged.
#[derive(Debug, Clone)]
pub enum TlsPolicy {
    /// Accept only what the pinned-root predicate accepts (LAN printers).
    Pinned(CertificateVerifier),
    /// Standard validation against bundled public roots (cloud broker).
    PublicRoots,
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Build the client configuration for `policy`.
pub fn client_config(policy: &TlsPolicy) -> Result<Arc<ClientConfig>, rustls::Error> {
    let provider = provider();
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?;

    let config = match policy {
        TlsPolicy::Pinned(predicate) => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(PinnedServerVerifier {
                predicate: predicate.clone(),
                provider,
            }))
            .with_no_client_auth(),
        TlsPolicy::PublicRoots => {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder.with_root_certificates(roots).with_no_client_auth()
        }
    };

    Ok(Arc::new(config))
}

/// Configuration for the one unverified handshake that captures a printer's certificate.
pub(crate) fn capture_config() -> Result<Arc<ClientConfig>, rustls::Error> {
    let provider = provider();
    let config = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(CaptureVerifier { provider }))
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Parse a host name or IP literal into a TLS server name.
pub(crate) fn server_name(host: &str) -> Result<ServerName<'static>, String> {
    ServerName::try_from(host)
        .map(|name| name.to_owned())
        .map_err(|e| format!("invalid host {host:?}: {e}"))
}

/// Adapts [`CertificateVerifier`] to rustls.
#[derive(Debug)]
struct PinnedServerVerifier {
    predicate: CertificateVerifier,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let intermediates: Vec<&[u8]> = intermediates.iter().map(|c| c.as_ref()).collect();
        match self.predicate.verify(end_entity.as_ref(), &intermediates) {
            Ok(()) => Ok(ServerCertVerified::assertion()),
            Err(err) => {
                warn!(device = self.predicate.device_id(), error = %err, "rejected printer certificate");
                Err(rustls::Error::General(err.to_string()))
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
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
        verify_tls13_signature(
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

/// Accepts any certificate; handshake signatures are still checked so the
/// captured certificate belongs to the peer.
#[derive(Debug)]
struct CaptureVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for CaptureVerifier {
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
        verify_tls12_signature(
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
        verify_tls13_signature(
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::{build_verifier, TrustRoot};
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

    fn pinned_policy() -> TlsPolicy {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, "01P00C490700226");
        let key = KeyPair::generate().unwrap();
        let der = params.self_signed(&key).unwrap().der().to_vec();
        TlsPolicy::Pinned(build_verifier(
            TrustRoot::from_der(der).unwrap(),
            "01P00C490700226",
        ))
    }

    #[test]
    fn test_builds_pinned_and_public_configs() {
        assert!(client_config(&pinned_policy()).is_ok());
        assert!(client_config(&TlsPolicy::PublicRoots).is_ok());
        assert!(capture_config().is_ok());
    }

    #[test]
    fn test_server_name_accepts_ip_and_host() {
        assert!(server_name("192.168.0.33").is_ok());
        assert!(server_name("us.mqtt.bambulab.com").is_ok());
        assert!(server_name("not a host").is_err());
    }
}
