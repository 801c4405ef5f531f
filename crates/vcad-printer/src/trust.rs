//! Trust-on-first-use pinning of the printer's TLS identity.
//!
//! Printers present a self-signed certificate whose common name is the
//! device serial. Trust is anchored to a single pinned certificate, either
//! loaded from caller-supplied CA material or captured from a first,
//! unverified handshake. Public CA hierarchies are never consulted.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use base64::prelude::*;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};
use x509_parser::extensions::GeneralName;
use x509_parser::pem::Pem;
use x509_parser::prelude::*;

use crate::config::PrinterConfig;
use crate::error::TrustError;
use crate::tls;

/// Longest issuer path walked from the presented certificate to the root.
const MAX_CHAIN_DEPTH: usize = 8;

/// The pinned certificate every later handshake is checked against.
#[derive(Clone, PartialEq, Eq)]
pub struct TrustRoot {
    der: Vec<u8>,
}

impl std::fmt::Debug for TrustRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustRoot")
            .field("common_name", &self.common_name())
            .field("len", &self.der.len())
            .finish()
    }
}

impl TrustRoot {
    /// Adopt a DER-encoded certificate.
    pub fn from_der(der: Vec<u8>) -> Result<Self, TrustError> {
        X509Certificate::from_der(&der)
            .map_err(|e| TrustError::InvalidCa(format!("not an X.509 certificate: {e}")))?;
        Ok(Self { der })
    }

    /// Adopt the first `CERTIFICATE` block of a PEM document.
    pub fn from_pem(pem: &[u8]) -> Result<Self, TrustError> {
        for block in Pem::iter_from_buffer(pem) {
            let block = block.map_err(|e| TrustError::InvalidCa(format!("bad PEM: {e}")))?;
            if block.label == "CERTIFICATE" {
                return Self::from_der(block.contents);
            }
        }
        Err(TrustError::InvalidCa("no CERTIFICATE block found".into()))
    }

    /// Load CA material from disk. PEM and raw DER are both accepted.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrustError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .map_err(|e| TrustError::InvalidCa(format!("{}: {e}", path.display())))?;

        if bytes.starts_with(b"-----BEGIN") {
            Self::from_pem(&bytes)
        } else {
            Self::from_der(bytes)
        }
    }

    /// DER bytes of the pinned certificate.
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Render as PEM, suitable for passing back later as CA material.
    pub fn to_pem(&self) -> String {
        let encoded = BASE64_STANDARD.encode(&self.der);
        let mut pem = String::from("-----BEGIN CERTIFICATE-----\n");
        for line in encoded.as_bytes().chunks(64) {
            pem.push_str(&String::from_utf8_lossy(line));
            pem.push('\n');
        }
        pem.push_str("-----END CERTIFICATE-----\n");
        pem
    }

    /// Subject common name, usually the printer serial.
    pub fn common_name(&self) -> Option<String> {
        let (_, cert) = X509Certificate::from_der(&self.der).ok()?;
        common_name(&cert)
    }
}

/// Resolve the trust root for a LAN printer.
///
/// Uses `ca_path` when given; otherwise performs one unverified handshake with
/// the printer's broker and pins the certificate it presents. Never retries.
pub async fn resolve_trust_root(
    config: &PrinterConfig,
    ca_path: Option<&Path>,
    capture_timeout: Duration,
) -> Result<TrustRoot, TrustError> {
    match ca_path {
        Some(path) => {
            let root = TrustRoot::load(path)?;
            debug!(path = %path.display(), cn = ?root.common_name(), "loaded pinned certificate");
            Ok(root)
        }
        None => {
            let root =
                fetch_device_certificate(config.broker_host(), config.broker_port(), capture_timeout)
                    .await?;
            info!(
                host = config.broker_host(),
                cn = ?root.common_name(),
                "pinned certificate presented by printer"
            );
            Ok(root)
        }
    }
}

/// Handshake with `host:port` without verifying it and return the leaf certificate.
pub async fn fetch_device_certificate(
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<TrustRoot, TrustError> {
    let config = tls::capture_config().map_err(|e| TrustError::Unreachable(e.to_string()))?;
    let connector = TlsConnector::from(config);
    let server_name = tls::server_name(host).map_err(TrustError::Unreachable)?;

    let handshake = async {
        let tcp = TcpStream::connect((host, port)).await?;
        connector.connect(server_name, tcp).await
    };

    let stream = tokio::time::timeout(timeout, handshake)
        .await
        .map_err(|_| {
            TrustError::Unreachable(format!("no handshake with {host}:{port} within {timeout:?}"))
        })?
        .map_err(|e| TrustError::Unreachable(format!("{host}:{port}: {e}")))?;

    let (_, session) = stream.get_ref();
    let leaf = session
        .peer_certificates()
        .and_then(|certs| certs.first())
        .ok_or_else(|| TrustError::Unreachable("printer presented no certificate".into()))?;

    TrustRoot::from_der(leaf.as_ref().to_vec())
}

/// Verification predicate run on every handshake anchored to a [`TrustRoot`].
#[derive(Debug, Clone)]
pub struct CertificateVerifier {
    root: Arc<TrustRoot>,
    device_id: String,
}

/// Build the predicate for `device_id` anchored at `root`.
pub fn build_verifier(root: TrustRoot, device_id: &str) -> CertificateVerifier {
    CertificateVerifier::new(root, device_id)
}

impl CertificateVerifier {
    /// Create a verifier.
    pub fn new(root: TrustRoot, device_id: &str) -> Self {
        Self {
            root: Arc::new(root),
            device_id: device_id.to_string(),
        }
    }

    /// The pinned root.
    pub fn root(&self) -> &TrustRoot {
        &self.root
    }

    /// Device id a SAN-less certificate must name.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Check a presented certificate.
    ///
    /// A certificate without DNS subject-alternative-names is accepted iff its
    /// common name equals the device id. A certificate with SANs must chain
    /// to the pinned root.
    pub fn verify(&self, leaf_der: &[u8], intermediates: &[&[u8]]) -> Result<(), TrustError> {
        let (_, leaf) = X509Certificate::from_der(leaf_der)
            .map_err(|e| TrustError::ChainInvalid(format!("unparsable certificate: {e}")))?;

        if dns_names(&leaf) == 0 {
            let found = common_name(&leaf).unwrap_or_default();
            if found == self.device_id {
                return Ok(());
            }
            return Err(TrustError::IdentityMismatch {
                expected: self.device_id.clone(),
                found,
            });
        }

        self.verify_chain(&leaf, leaf_der, intermediates)
    }

    fn verify_chain(
        &self,
        leaf: &X509Certificate<'_>,
        leaf_der: &[u8],
        intermediates: &[&[u8]],
    ) -> Result<(), TrustError> {
        let (_, root) = X509Certificate::from_der(self.root.der())
            .map_err(|e| TrustError::ChainInvalid(format!("unparsable trust root: {e}")))?;

        if leaf_der == self.root.der() {
            return ensure_valid(leaf);
        }

        let pool: Vec<X509Certificate<'_>> = intermediates
            .iter()
            .filter_map(|der| X509Certificate::from_der(der).ok().map(|(_, cert)| cert))
            .collect();

        let mut current = leaf;
        for _ in 0..MAX_CHAIN_DEPTH {
            ensure_valid(current)?;
            if issued_by(current, &root) {
                return ensure_valid(&root);
            }
            current = pool
                .iter()
                .find(|candidate| issued_by(current, candidate))
                .ok_or_else(|| {
                    TrustError::ChainInvalid(format!(
                        "no path from {} to the pinned root",
                        current.subject()
                    ))
                })?;
        }

        Err(TrustError::ChainInvalid(format!(
            "chain longer than {MAX_CHAIN_DEPTH} certificates"
        )))
    }
}

fn common_name(cert: &X509Certificate<'_>) -> Option<String> {
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string)
}

fn dns_names(cert: &X509Certificate<'_>) -> usize {
    match cert.subject_alternative_name() {
        Ok(Some(san)) => san
            .value
            .general_names
            .iter()
            .filter(|name| matches!(name, GeneralName::DNSName(_)))
            .count(),
        _ => 0,
    }
}

fn issued_by(child: &X509Certificate<'_>, parent: &X509Certificate<'_>) -> bool {
    child.issuer().as_raw() == parent.subject().as_raw()
        && child.verify_signature(Some(parent.public_key())).is_ok()
}

fn ensure_valid(cert: &X509Certificate<'_>) -> Result<(), TrustError> {
    if cert.validity().is_valid() {
        Ok(())
    } else {
        Err(TrustError::ChainInvalid(format!(
            "{} is outside its validity period",
            cert.subject()
        )))
    }
}
