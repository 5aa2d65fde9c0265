//! Key, CSR and certificate handling.
//!
//! rcgen builds and signs, x509-parser reads. Everything crosses the API as
//! PEM text.

use chrono::{DateTime, Utc};
use rcgen::{
    CertificateParams, CertificateSigningRequestParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, BasicConstraints, Issuer, KeyPair, KeyUsagePurpose,
};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use x509_parser::prelude::*;

use warden_common::{Classify, ErrorClass};

use crate::api::{KeyAlgorithm, KeyUsage};

/// Validity used when a request names none (90 days).
pub const DEFAULT_CERT_DURATION: Duration = Duration::from_secs(90 * 24 * 3600);

/// Shortest validity a request may ask for.
pub const MIN_CERT_DURATION: Duration = Duration::from_secs(3600);

#[derive(Debug, Error)]
pub enum PkiError {
    #[error("invalid certificate signing request: {0}")]
    InvalidCsr(String),

    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("invalid private key: {0}")]
    InvalidKey(String),

    #[error("unsupported key algorithm: {0:?}")]
    UnsupportedKeyAlgorithm(KeyAlgorithm),

    #[error("requested duration {requested:?} is shorter than the minimum {minimum:?}")]
    DurationTooShort { requested: Duration, minimum: Duration },

    #[error("signing failed: {0}")]
    Signing(String),
}

impl Classify for PkiError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Configuration
    }

    fn reason(&self) -> &'static str {
        match self {
            PkiError::InvalidCsr(_) => "InvalidCSR",
            PkiError::InvalidCertificate(_) => "InvalidCertificate",
            PkiError::InvalidKey(_) => "InvalidKey",
            PkiError::UnsupportedKeyAlgorithm(_) => "UnsupportedKeyAlgorithm",
            PkiError::DurationTooShort { .. } => "InvalidDuration",
            PkiError::Signing(_) => "SigningFailed",
        }
    }
}

// ============================================================================
// Parsed views
// ============================================================================

/// What a CSR asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrInfo {
    pub common_name: Option<String>,
    pub dns_names: Vec<String>,
    pub der: Vec<u8>,
}

impl CsrInfo {
    /// DNS identifiers to put in an ACME order: SANs plus the common name.
    pub fn identifiers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .dns_names
            .iter()
            .chain(self.common_name.iter())
            .map(|n| n.to_ascii_lowercase())
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    pub common_name: Option<String>,
    pub dns_names: Vec<String>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub is_ca: bool,
}

fn pem_contents(text: &str, what: &str) -> Result<Vec<u8>, String> {
    ::pem::parse(text)
        .map(|p| p.contents().to_vec())
        .map_err(|e| format!("{what} is not valid PEM: {e}"))
}

fn timestamp(ts: i64) -> Result<DateTime<Utc>, PkiError> {
    DateTime::from_timestamp(ts, 0)
        .ok_or_else(|| PkiError::InvalidCertificate(format!("timestamp {ts} out of range")))
}

/// Parse a PEM CSR.
pub fn parse_csr(csr_pem: &str) -> Result<CsrInfo, PkiError> {
    let der = pem_contents(csr_pem, "request").map_err(PkiError::InvalidCsr)?;
    let (_, csr) = X509CertificationRequest::from_der(&der)
        .map_err(|e| PkiError::InvalidCsr(e.to_string()))?;

    let common_name = csr
        .certification_request_info
        .subject
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);

    let mut dns_names = Vec::new();
    if let Some(extensions) = csr.requested_extensions() {
        for extension in extensions {
            if let ParsedExtension::SubjectAlternativeName(san) = extension {
                for name in &san.general_names {
                    if let GeneralName::DNSName(dns) = name {
                        dns_names.push(dns.to_string());
                    }
                }
            }
        }
    }

    if common_name.is_none() && dns_names.is_empty() {
        return Err(PkiError::InvalidCsr(
            "request names neither a common name nor DNS names".to_string(),
        ));
    }

    Ok(CsrInfo {
        common_name,
        dns_names,
        der,
    })
}

/// Parse the first certificate of a PEM chain.
pub fn parse_certificate(chain_pem: &str) -> Result<CertificateInfo, PkiError> {
    let blocks = ::pem::parse_many(chain_pem).map_err(|e| PkiError::InvalidCertificate(e.to_string()))?;
    let leaf = blocks
        .first()
        .ok_or_else(|| PkiError::InvalidCertificate("no PEM block found".to_string()))?;
    let (_, cert) = X509Certificate::from_der(leaf.contents())
        .map_err(|e| PkiError::InvalidCertificate(e.to_string()))?;

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);

    let mut dns_names = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                dns_names.push(dns.to_string());
            }
        }
    }

    Ok(CertificateInfo {
        common_name,
        dns_names,
        not_before: timestamp(cert.validity().not_before.timestamp())?,
        not_after: timestamp(cert.validity().not_after.timestamp())?,
        is_ca: cert.is_ca(),
    })
}

// ============================================================================
// Generation
// ============================================================================

/// Generate a private key. RSA is not available with the ring backend.
pub fn generate_private_key(algorithm: KeyAlgorithm) -> Result<KeyPair, PkiError> {
    let key = match algorithm {
        KeyAlgorithm::Ecdsa => KeyPair::generate(),
        KeyAlgorithm::Ed25519 => KeyPair::generate_for(&rcgen::PKCS_ED25519),
        KeyAlgorithm::Rsa => return Err(PkiError::UnsupportedKeyAlgorithm(algorithm)),
    };
    key.map_err(|e| PkiError::InvalidKey(e.to_string()))
}

pub fn load_private_key(key_pem: &str) -> Result<KeyPair, PkiError> {
    KeyPair::from_pem(key_pem).map_err(|e| PkiError::InvalidKey(e.to_string()))
}

/// Build a PEM CSR for `dns_names` (and `common_name`) signed by `key`.
pub fn build_csr(key: &KeyPair, common_name: Option<&str>, dns_names: &[String]) -> Result<String, PkiError> {
    let mut params = CertificateParams::new(dns_names.to_vec()).map_err(|e| PkiError::InvalidCsr(e.to_string()))?;

    let mut dn = DistinguishedName::new();
    if let Some(cn) = common_name {
        dn.push(DnType::CommonName, DnValue::Utf8String(cn.to_string()));
    }
    params.distinguished_name = dn;

    let csr = params
        .serialize_request(key)
        .map_err(|e| PkiError::InvalidCsr(e.to_string()))?;
    csr.pem().map_err(|e| PkiError::InvalidCsr(e.to_string()))
}

// ============================================================================
// Signing
// ============================================================================

/// How the issued certificate should look.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningOptions {
    pub duration: Duration,
    pub usages: Vec<KeyUsage>,
    pub is_ca: bool,
    /// Latest allowed expiry, e.g. the signing CA's own expiry
    pub not_after_limit: Option<DateTime<Utc>>,
}

impl SigningOptions {
    pub fn new(duration_seconds: Option<u64>, usages: &[KeyUsage], is_ca: bool) -> Result<Self, PkiError> {
        let duration = duration_seconds
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_CERT_DURATION);
        if duration < MIN_CERT_DURATION {
            return Err(PkiError::DurationTooShort {
                requested: duration,
                minimum: MIN_CERT_DURATION,
            });
        }
        Ok(Self {
            duration,
            usages: usages.to_vec(),
            is_ca,
            not_after_limit: None,
        })
    }

    fn apply(&self, params: &mut CertificateParams) -> Result<(), PkiError> {
        let now = Utc::now();
        let mut not_after = now
            + chrono::Duration::from_std(self.duration).map_err(|e| PkiError::Signing(e.to_string()))?;
        if let Some(limit) = self.not_after_limit {
            not_after = not_after.min(limit);
        }

        params.not_before = offset(now)?;
        params.not_after = offset(not_after)?;
        params.is_ca = if self.is_ca {
            IsCa::Ca(BasicConstraints::Unconstrained)
        } else {
            IsCa::NoCa
        };

        let usages = if self.usages.is_empty() {
            vec![KeyUsage::DigitalSignature, KeyUsage::KeyEncipherment, KeyUsage::ServerAuth]
        } else {
            self.usages.clone()
        };
        params.key_usages = usages.iter().filter_map(|u| key_usage(*u)).collect();
        params.extended_key_usages = usages.iter().filter_map(|u| extended_key_usage(*u)).collect();
        if self.is_ca && !params.key_usages.contains(&KeyUsagePurpose::KeyCertSign) {
            params.key_usages.push(KeyUsagePurpose::KeyCertSign);
        }
        Ok(())
    }
}

fn offset(at: DateTime<Utc>) -> Result<::time::OffsetDateTime, PkiError> {
    ::time::OffsetDateTime::from_unix_timestamp(at.timestamp()).map_err(|e| PkiError::Signing(e.to_string()))
}

fn key_usage(usage: KeyUsage) -> Option<KeyUsagePurpose> {
    match usage {
        KeyUsage::DigitalSignature => Some(KeyUsagePurpose::DigitalSignature),
        KeyUsage::KeyEncipherment => Some(KeyUsagePurpose::KeyEncipherment),
        KeyUsage::CertSign => Some(KeyUsagePurpose::KeyCertSign),
        KeyUsage::CrlSign => Some(KeyUsagePurpose::CrlSign),
        KeyUsage::ServerAuth | KeyUsage::ClientAuth => None,
    }
}

fn extended_key_usage(usage: KeyUsage) -> Option<ExtendedKeyUsagePurpose> {
    match usage {
        KeyUsage::ServerAuth => Some(ExtendedKeyUsagePurpose::ServerAuth),
        KeyUsage::ClientAuth => Some(ExtendedKeyUsagePurpose::ClientAuth),
        _ => None,
    }
}

fn csr_params(csr_pem: &str) -> Result<CertificateSigningRequestParams, PkiError> {
    CertificateSigningRequestParams::from_pem(csr_pem).map_err(|e| PkiError::InvalidCsr(e.to_string()))
}

/// Issue a certificate for `csr_pem` signed by the CA in `ca_cert_pem`/`ca_key_pem`.
pub fn sign_with_ca(
    csr_pem: &str,
    ca_cert_pem: &str,
    ca_key_pem: &str,
    options: &SigningOptions,
) -> Result<String, PkiError> {
    let mut csr = csr_params(csr_pem)?;
    options.apply(&mut csr.params)?;

    let ca_key = load_private_key(ca_key_pem)?;
    let issuer = Issuer::from_ca_cert_pem(ca_cert_pem, &ca_key)
        .map_err(|e| PkiError::InvalidCertificate(format!("signing CA: {e}")))?;

    let cert = csr.signed_by(&issuer).map_err(|e| PkiError::Signing(e.to_string()))?;
    debug!(duration_secs = options.duration.as_secs(), "Signed certificate with CA");
    Ok(cert.pem())
}

/// Issue a certificate for `csr_pem` signed by its own `key_pem`.
pub fn sign_self(csr_pem: &str, key_pem: &str, options: &SigningOptions) -> Result<String, PkiError> {
    let mut csr = csr_params(csr_pem)?;
    options.apply(&mut csr.params)?;

    let key = load_private_key(key_pem)?;
    let cert = csr
        .params
        .self_signed(&key)
        .map_err(|e| PkiError::Signing(e.to_string()))?;
    debug!(duration_secs = options.duration.as_secs(), "Self-signed certificate");
    Ok(cert.pem())
}

/// Check that a CA certificate and key parse and can be used for signing.
pub fn verify_ca_pair(ca_cert_pem: &str, ca_key_pem: &str) -> Result<CertificateInfo, PkiError> {
    let info = parse_certificate(ca_cert_pem)?;
    if !info.is_ca {
        return Err(PkiError::InvalidCertificate("certificate is not a CA".to_string()));
    }
    let key = load_private_key(ca_key_pem)?;
    Issuer::from_ca_cert_pem(ca_cert_pem, &key)
        .map_err(|e| PkiError::InvalidCertificate(format!("signing CA: {e}")))?;
    Ok(info)
}

/// A self-signed CA, for tests and bootstrapping.
#[cfg(test)]
pub(crate) fn test_ca(common_name: &str) -> (String, String) {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    let now = ::time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + ::time::Duration::days(365);
    let cert = params.self_signed(&key).unwrap();
    (cert.pem(), key.serialize_pem())
}

/// A fresh key and CSR for `names`, for tests.
#[cfg(test)]
pub(crate) fn test_csr(names: &[&str]) -> (String, String) {
    let key = KeyPair::generate().unwrap();
    let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
    let csr = build_csr(&key, names.first().map(String::as_str), &names).unwrap();
    (csr, key.serialize_pem())
}
