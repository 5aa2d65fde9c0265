use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use warden_common::{find_condition, Condition, ConditionStatus, IssuerRef};

use super::{impl_resource, ObjectMeta, CONDITION_READY, REASON_DENIED, REASON_FAILED, REASON_ISSUED};

/// A single signing request against one issuer.
///
/// The spec is immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateRequest {
    pub metadata: ObjectMeta,
    pub spec: CertificateRequestSpec,
    #[serde(default)]
    pub status: CertificateRequestStatus,
}

impl_resource!(CertificateRequest, "CertificateRequest", CertificateRequestStatus);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRequestSpec {
    /// PEM-encoded PKCS#10 request
    pub request: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub usages: Vec<KeyUsage>,
    pub issuer_ref: IssuerRef,
    #[serde(default)]
    pub is_ca: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyUsage {
    DigitalSignature,
    KeyEncipherment,
    CertSign,
    CrlSign,
    ServerAuth,
    ClientAuth,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRequestStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// PEM chain, leaf first
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_time: Option<DateTime<Utc>>,
    /// Transient signing failures seen so far
    #[serde(default)]
    pub retry_count: u32,
}

impl CertificateRequest {
    /// Ready reason, if the Ready condition is set.
    pub fn ready_reason(&self) -> Option<&str> {
        find_condition(&self.status.conditions, CONDITION_READY).map(|c| c.reason.as_str())
    }

    pub fn is_issued(&self) -> bool {
        find_condition(&self.status.conditions, CONDITION_READY)
            .is_some_and(|c| c.status == ConditionStatus::True && c.reason == REASON_ISSUED)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.ready_reason(), Some(REASON_FAILED) | Some(REASON_DENIED))
    }

    /// Issued, failed and denied requests are never reconciled again.
    pub fn is_terminal(&self) -> bool {
        self.is_issued() || self.is_failed()
    }
}
