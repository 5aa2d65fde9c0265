use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use warden_common::{Condition, IssuerRef};

use super::{impl_resource, KeyUsage, ObjectMeta};

/// Desired certificate, kept valid and renewed into a Secret.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Certificate {
    pub metadata: ObjectMeta,
    pub spec: CertificateSpec,
    #[serde(default)]
    pub status: CertificateStatus,
}

impl_resource!(Certificate, "Certificate", CertificateStatus);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSpec {
    pub secret_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub common_name: Option<String>,
    #[serde(default)]
    pub dns_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renew_before_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub usages: Vec<KeyUsage>,
    pub issuer_ref: IssuerRef,
    #[serde(default)]
    pub private_key: PrivateKeySpec,
}

impl CertificateSpec {
    /// Identifiers requested, common name included, sorted and deduplicated.
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

    /// Digest of the fields that shape an issued certificate other than its
    /// identifiers. Stored on the Secret so a changed spec is noticed.
    pub fn issuance_hash(&self) -> String {
        let fields = serde_json::json!({
            "issuerRef": self.issuer_ref,
            "durationSeconds": self.duration_seconds,
            "usages": self.usages,
            "privateKey": self.private_key,
        });
        let digest = Sha256::digest(fields.to_string().as_bytes());
        digest[..8].iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrivateKeySpec {
    #[serde(default)]
    pub algorithm: KeyAlgorithm,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyAlgorithm {
    #[default]
    Ecdsa,
    Ed25519,
    Rsa,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_after: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renewal_time: Option<DateTime<Utc>>,
    /// Number of successful issuances
    #[serde(default)]
    pub revision: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failed_issuance_attempts: u32,
}
