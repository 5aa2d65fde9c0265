//! Resource types reconciled by Warden.
//!
//! Every resource is `{ metadata, spec, status }` (Secrets carry `data`
//! instead of spec/status). Specs are written by users, statuses only by
//! the controller that owns the kind.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use warden_common::ObjectKey;

// Defined before the submodules so they can use it.
macro_rules! impl_resource {
    ($ty:ty, $kind:literal, $status:ty) => {
        impl $crate::api::Resource for $ty {
            const KIND: &'static str = $kind;

            fn meta(&self) -> &$crate::api::ObjectMeta {
                &self.metadata
            }

            fn meta_mut(&mut self) -> &mut $crate::api::ObjectMeta {
                &mut self.metadata
            }
        }

        impl $crate::api::HasStatus for $ty {
            type Status = $status;

            fn status(&self) -> &Self::Status {
                &self.status
            }

            fn status_mut(&mut self) -> &mut Self::Status {
                &mut self.status
            }
        }
    };
}

pub(crate) use impl_resource;

pub mod acme;
pub mod certificate;
pub mod certificate_request;
pub mod issuer;
pub mod secret;

pub use acme::{
    AuthorizationRecord, Challenge, ChallengeSpec, ChallengeState, ChallengeStatus, ChallengeType,
    Order, OrderSpec, OrderState, OrderStatus,
};
pub use certificate::{Certificate, CertificateSpec, CertificateStatus, KeyAlgorithm, PrivateKeySpec};
pub use certificate_request::{
    CertificateRequest, CertificateRequestSpec, CertificateRequestStatus, KeyUsage,
};
pub use issuer::{
    AcmeIssuer, AcmeIssuerStatus, CaIssuer, Dns01SolverConfig, Http01SolverConfig, Issuer,
    IssuerSpec, IssuerStatus, IssuerType, SelfSignedIssuer, SolverRule, SolverSelector,
    VaultIssuer,
};
pub use secret::Secret;

// ============================================================================
// Well-known names
// ============================================================================

pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_ISSUING: &str = "Issuing";
pub const CONDITION_DENIED: &str = "Denied";

pub const REASON_PENDING: &str = "Pending";
pub const REASON_ISSUED: &str = "Issued";
pub const REASON_FAILED: &str = "Failed";
pub const REASON_DENIED: &str = "Denied";

pub const TLS_CERT_KEY: &str = "tls.crt";
pub const TLS_PRIVATE_KEY: &str = "tls.key";
pub const CA_CERT_KEY: &str = "ca.crt";
pub const ACME_CREDENTIALS_KEY: &str = "credentials.json";
pub const VAULT_TOKEN_KEY: &str = "token";

/// Request annotation naming the secret that holds the request's private key.
pub const PRIVATE_KEY_SECRET_ANNOTATION: &str = "warden.io/private-key-secret-name";

/// Secret annotations recording what the stored certificate was issued for.
pub const ISSUER_NAME_ANNOTATION: &str = "warden.io/issuer-name";
pub const ISSUER_KIND_ANNOTATION: &str = "warden.io/issuer-kind";
pub const ISSUER_GROUP_ANNOTATION: &str = "warden.io/issuer-group";
pub const ISSUANCE_HASH_ANNOTATION: &str = "warden.io/issuance-hash";

/// Finalizer that keeps a presented challenge around until it is cleaned up.
pub const ACME_FINALIZER: &str = "acme.warden.io/finalizer";

// ============================================================================
// Metadata
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<ObjectKey>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    /// Assigned by the store on every write
    #[serde(default)]
    pub resource_version: u64,
    /// Bumped by the store when the spec changes
    #[serde(default)]
    pub generation: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    pub fn with_owner(mut self, owner: ObjectKey) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }
}

// ============================================================================
// Resource traits
// ============================================================================

/// A stored object of a fixed kind.
pub trait Resource: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: &'static str;

    fn meta(&self) -> &ObjectMeta;

    fn meta_mut(&mut self) -> &mut ObjectMeta;

    fn key(&self) -> ObjectKey {
        let meta = self.meta();
        ObjectKey::new(Self::KIND, meta.namespace.clone(), meta.name.clone())
    }
}

/// A resource with a controller-owned status.
pub trait HasStatus: Resource {
    type Status: Clone + fmt::Debug + Default + PartialEq + Serialize + DeserializeOwned + Send + Sync;

    fn status(&self) -> &Self::Status;

    fn status_mut(&mut self) -> &mut Self::Status;
}
