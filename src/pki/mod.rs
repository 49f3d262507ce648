//! Serving certificate for the webhook listener
//!
//! The injector has no external CA. At startup it generates a self-signed
//! certificate covering its in-cluster service names, writes it next to the
//! key for the TLS listener, and hands the certificate PEM to the bootstrap
//! module so the API server can be told to trust it.

use std::fs;
use std::path::{Path, PathBuf};

use rcgen::{
    CertificateParams, DistinguishedName, DnType, DnValue, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose,
};
use thiserror::Error;
use ::time::{Duration, OffsetDateTime};
use tracing::debug;
use x509_parser::prelude::*;

/// Certificate file name inside the cert directory
pub const TLS_CERT_FILE: &str = "tls.crt";
/// Private key file name inside the cert directory
pub const TLS_KEY_FILE: &str = "tls.key";

/// Four years
const VALIDITY: Duration = Duration::days(4 * 365 + 1);

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Certificate parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),
}

impl From<PkiError> for crate::Error {
    fn from(e: PkiError) -> Self {
        match e {
            PkiError::Io(e) => crate::Error::Io(e),
            other => crate::Error::pki(other.to_string()),
        }
    }
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Parse PEM-encoded data and return the DER bytes
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

/// DNS names a pod-facing service answers to, shortest first
pub fn service_dns_names(service: &str, namespace: &str) -> Vec<String> {
    vec![
        service.to_string(),
        format!("{service}.{namespace}"),
        format!("{service}.{namespace}.svc"),
    ]
}

/// A freshly generated self-signed certificate and its key
pub struct ServingCertificate {
    cert_pem: String,
    key_pem: String,
}

impl ServingCertificate {
    /// Generate a certificate for `service` in `namespace`
    ///
    /// The SANs cover the short, namespaced and `.svc` service names plus the
    /// loopback address for local probing.
    pub fn generate(service: &str, namespace: &str) -> Result<Self> {
        let mut sans = service_dns_names(service, namespace);
        sans.push("127.0.0.1".to_string());

        let mut params = CertificateParams::new(sans).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("invalid subject alt name: {}", e))
        })?;

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(format!("{service}.{namespace}.svc")),
        );
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String("Infisical".to_string()),
        );
        params.distinguished_name = dn;

        // Self-signed leaf: the API server pins it through the CA bundle
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + VALIDITY;

        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate serving key: {}", e))
        })?;

        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to self-sign: {}", e))
        })?;

        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }

    /// Certificate in PEM format; also the CA bundle for the webhook registration
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Private key in PEM format
    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// Write `tls.crt` and `tls.key` into `dir`, creating it if needed
    ///
    /// Returns the certificate path.
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;

        let cert_path = dir.join(TLS_CERT_FILE);
        let key_path = dir.join(TLS_KEY_FILE);

        // Key first, so readiness (keyed on the cert) never sees half the pair
        fs::write(&key_path, &self.key_pem)?;
        restrict_permissions(&key_path)?;
        fs::write(&cert_path, &self.cert_pem)?;

        debug!(cert = %cert_path.display(), key = %key_path.display(), "Wrote TLS material");
        Ok(cert_path)
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

/// What a certificate claims, as read back from its DER encoding
#[derive(Clone, Debug)]
pub struct CertificateInfo {
    /// DNS subject alternative names
    pub dns_names: Vec<String>,
    /// IP subject alternative names, formatted
    pub ip_addresses: Vec<String>,
    /// Start of validity
    pub not_before: OffsetDateTime,
    /// End of validity
    pub not_after: OffsetDateTime,
}

/// Inspect a PEM certificate
pub fn inspect(cert_pem: &str) -> Result<CertificateInfo> {
    let der = parse_pem(cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

    let mut dns_names = Vec::new();
    let mut ip_addresses = Vec::new();

    let san = cert
        .subject_alternative_name()
        .map_err(|e| PkiError::ParseError(format!("invalid SAN extension: {}", e)))?;
    if let Some(san) = san {
        for name in &san.value.general_names {
            match name {
                GeneralName::DNSName(dns) => dns_names.push(dns.to_string()),
                GeneralName::IPAddress(bytes) => {
                    if let Ok(octets) = <[u8; 4]>::try_from(*bytes) {
                        ip_addresses.push(std::net::Ipv4Addr::from(octets).to_string());
                    } else if let Ok(octets) = <[u8; 16]>::try_from(*bytes) {
                        ip_addresses.push(std::net::Ipv6Addr::from(octets).to_string());
                    }
                }
                _ => {}
            }
        }
    }

    let validity = cert.validity();
    Ok(CertificateInfo {
        dns_names,
        ip_addresses,
        not_before: validity.not_before.to_datetime(),
        not_after: validity.not_after.to_datetime(),
    })
}
