//! Issuer backends and the registry that resolves them.
//!
//! A backend implements one [`IssuerType`]. The registry maps
//! `(group, type)` to a backend, so a request's [`IssuerRef`] is resolved in
//! four steps:
//!
//! 1. the group/kind must be served by some backend (`UnknownIssuerKind`)
//! 2. the Issuer object must exist (`IssuerNotFound`, retried)
//! 3. a backend must exist for its configuration (`UnknownIssuerKind`)
//! 4. the Issuer must be Ready (`IssuerNotReady`, retried)

pub mod acme;
pub mod ca;
pub mod selfsigned;
pub mod vault;

pub use acme::{order_name, AcmeBackend};
pub(crate) use acme::acme_config;
pub use ca::CaBackend;
pub use selfsigned::SelfSignedBackend;
pub use vault::VaultBackend;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use warden_common::{
    is_condition_true, Classify, ErrorClass, IssuerRef, ObjectKey, DEFAULT_ISSUER_GROUP,
    DEFAULT_ISSUER_KIND,
};

use crate::acme::AcmeClientError;
use crate::api::{CertificateRequest, Issuer, IssuerType, Secret, CONDITION_READY};
use crate::pki::PkiError;
use crate::store::{Api, StoreError};

// ============================================================================
// Errors and outcomes
// ============================================================================

#[derive(Debug, Error)]
pub enum IssuerError {
    #[error("issuer kind {0} is not supported")]
    UnknownIssuerKind(String),

    #[error("issuer {0} not found")]
    IssuerNotFound(ObjectKey),

    #[error("issuer {0} is not ready")]
    IssuerNotReady(ObjectKey),

    #[error("secret {0} not found")]
    SecretNotFound(ObjectKey),

    #[error("secret {secret} has no {field:?} entry")]
    SecretField { secret: ObjectKey, field: &'static str },

    #[error("request is missing the {0:?} annotation")]
    MissingAnnotation(&'static str),

    /// The signing authority refused the request; detail is verbatim
    #[error("{0}")]
    Denied(String),

    #[error("upstream unavailable: {0}")]
    Upstream(String),

    #[error(transparent)]
    Pki(#[from] PkiError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Acme(#[from] AcmeClientError),
}

impl IssuerError {
    /// Retry hint for rate limits.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            IssuerError::Acme(AcmeClientError::RateLimited { retry_after, .. }) => *retry_after,
            _ => None,
        }
    }
}

impl Classify for IssuerError {
    fn class(&self) -> ErrorClass {
        match self {
            IssuerError::UnknownIssuerKind(_)
            | IssuerError::SecretField { .. }
            | IssuerError::MissingAnnotation(_) => ErrorClass::Configuration,
            IssuerError::IssuerNotFound(_)
            | IssuerError::IssuerNotReady(_)
            | IssuerError::SecretNotFound(_)
            | IssuerError::Upstream(_) => ErrorClass::Transient,
            IssuerError::Denied(_) => ErrorClass::Terminal,
            IssuerError::Pki(e) => e.class(),
            IssuerError::Store(e) => e.class(),
            IssuerError::Acme(e) => e.class(),
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            IssuerError::UnknownIssuerKind(_) => "UnknownIssuerKind",
            IssuerError::IssuerNotFound(_) => "IssuerNotFound",
            IssuerError::IssuerNotReady(_) => "IssuerNotReady",
            IssuerError::SecretNotFound(_) => "SecretNotFound",
            IssuerError::SecretField { .. } => "SecretMissingField",
            IssuerError::MissingAnnotation(_) => "MissingAnnotation",
            IssuerError::Denied(_) => "Denied",
            IssuerError::Upstream(_) => "UpstreamUnavailable",
            IssuerError::Pki(e) => e.reason(),
            IssuerError::Store(e) => e.reason(),
            IssuerError::Acme(e) => e.reason(),
        }
    }
}

/// Result of one signing attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignOutcome {
    Issued {
        certificate: String,
        ca: Option<String>,
    },
    /// Not done yet. With no `requeue`, the request waits for a change
    /// (e.g. to an owned Order).
    Pending {
        reason: String,
        message: String,
        requeue: Option<Duration>,
    },
    Failed {
        reason: String,
        message: String,
    },
}

/// One issuer type.
#[async_trait]
pub trait IssuerBackend: Send + Sync {
    fn issuer_type(&self) -> IssuerType;

    /// Bring `issuer` to Ready. Only `issuer.status` is changed, and running
    /// it again on a ready issuer changes nothing.
    async fn setup(&self, issuer: &mut Issuer) -> Result<(), IssuerError>;

    async fn sign(&self, issuer: &Issuer, request: &CertificateRequest) -> Result<SignOutcome, IssuerError>;
}

/// Read `field` of secret `name` in `namespace`.
pub(crate) async fn secret_field(
    secrets: &Api<Secret>,
    namespace: &str,
    name: &str,
    field: &'static str,
) -> Result<String, IssuerError> {
    let key = Api::<Secret>::key(namespace, name);
    let secret = secrets
        .get_key(&key)
        .await?
        .ok_or_else(|| IssuerError::SecretNotFound(key.clone()))?;
    secret
        .get(field)
        .map(str::to_string)
        .ok_or(IssuerError::SecretField { secret: key, field })
}

// ============================================================================
// Registry
// ============================================================================

pub struct IssuerRegistry {
    backends: HashMap<(String, IssuerType), Arc<dyn IssuerBackend>>,
    issuers: Api<Issuer>,
}

impl IssuerRegistry {
    pub fn new(issuers: Api<Issuer>) -> Self {
        Self {
            backends: HashMap::new(),
            issuers,
        }
    }

    /// Register `backend` for Warden's own issuer group.
    pub fn register(&mut self, backend: Arc<dyn IssuerBackend>) {
        self.register_in(DEFAULT_ISSUER_GROUP, backend);
    }

    pub fn register_in(&mut self, group: &str, backend: Arc<dyn IssuerBackend>) {
        debug!(group, issuer_type = %backend.issuer_type(), "Registered issuer backend");
        self.backends.insert((group.to_string(), backend.issuer_type()), backend);
    }

    fn serves_group(&self, group: &str) -> bool {
        self.backends.keys().any(|(g, _)| g == group)
    }

    /// Backend for an Issuer object of Warden's own group.
    pub fn backend_for(&self, issuer: &Issuer) -> Result<Arc<dyn IssuerBackend>, IssuerError> {
        let issuer_type = issuer.spec.issuer_type();
        self.backends
            .get(&(DEFAULT_ISSUER_GROUP.to_string(), issuer_type))
            .cloned()
            .ok_or_else(|| IssuerError::UnknownIssuerKind(format!("{DEFAULT_ISSUER_GROUP}/{issuer_type}")))
    }

    /// Resolve a request's issuer reference to a ready issuer and its backend.
    pub async fn resolve(
        &self,
        namespace: &str,
        issuer_ref: &IssuerRef,
    ) -> Result<(Issuer, Arc<dyn IssuerBackend>), IssuerError> {
        if issuer_ref.kind != DEFAULT_ISSUER_KIND || !self.serves_group(&issuer_ref.group) {
            return Err(IssuerError::UnknownIssuerKind(format!(
                "{}.{}",
                issuer_ref.kind, issuer_ref.group
            )));
        }

        let key = issuer_ref.key_in(namespace);
        let issuer = self
            .issuers
            .get_key(&key)
            .await?
            .ok_or_else(|| IssuerError::IssuerNotFound(key.clone()))?;

        let issuer_type = issuer.spec.issuer_type();
        let backend = self
            .backends
            .get(&(issuer_ref.group.clone(), issuer_type))
            .cloned()
            .ok_or_else(|| IssuerError::UnknownIssuerKind(format!("{}/{}", issuer_ref.group, issuer_type)))?;

        if !is_condition_true(&issuer.status.conditions, CONDITION_READY) {
            return Err(IssuerError::IssuerNotReady(key));
        }

        Ok((issuer, backend))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{IssuerSpec, ObjectMeta, SelfSignedIssuer, VaultIssuer};
    use crate::store::{MemoryStore, ResourceStore};
    use warden_common::{set_condition, ConditionStatus};

    fn issuer(name: &str, spec: IssuerSpec, ready: bool) -> Issuer {
        let mut issuer = Issuer {
            metadata: ObjectMeta::new("default", name),
            spec,
            status: Default::default(),
        };
        if ready {
            set_condition(&mut issuer.status.conditions, CONDITION_READY, ConditionStatus::True, "IsReady", "");
        }
        issuer
    }

    async fn registry() -> (IssuerRegistry, Api<Issuer>) {
        let store: Arc<dyn ResourceStore> = Arc::new(MemoryStore::new());
        let issuers = Api::<Issuer>::new(store.clone());
        let mut registry = IssuerRegistry::new(issuers.clone());
        registry.register(Arc::new(SelfSignedBackend::new(store)));
        (registry, issuers)
    }

    #[tokio::test]
    async fn test_resolution_order() {
        let (registry, issuers) = registry().await;

        let foreign = IssuerRef {
            name: "x".to_string(),
            kind: "Issuer".to_string(),
            group: "example.org".to_string(),
        };
        let err = registry.resolve("default", &foreign).await.err().unwrap();
        assert!(matches!(err, IssuerError::UnknownIssuerKind(_)));
        assert_eq!(err.class(), ErrorClass::Configuration);

        let err = registry.resolve("default", &IssuerRef::issuer("missing")).await.err().unwrap();
        assert!(matches!(err, IssuerError::IssuerNotFound(_)));
        assert!(err.class().is_retryable());

        let vault = IssuerSpec::Vault(VaultIssuer {
            server: "https://vault".to_string(),
            path: "pki/sign/web".to_string(),
            token_secret_name: "vault-token".to_string(),
            ca_bundle: None,
        });
        issuers.create(&issuer("vault", vault, true)).await.unwrap();
        let err = registry.resolve("default", &IssuerRef::issuer("vault")).await.err().unwrap();
        assert!(matches!(err, IssuerError::UnknownIssuerKind(_)));

        issuers
            .create(&issuer("pending", IssuerSpec::SelfSigned(SelfSignedIssuer {}), false))
            .await
            .unwrap();
        let err = registry.resolve("default", &IssuerRef::issuer("pending")).await.err().unwrap();
        assert!(matches!(err, IssuerError::IssuerNotReady(_)));

        issuers
            .create(&issuer("ready", IssuerSpec::SelfSigned(SelfSignedIssuer {}), true))
            .await
            .unwrap();
        let (found, backend) = registry.resolve("default", &IssuerRef::issuer("ready")).await.unwrap();
        assert_eq!(found.metadata.name, "ready");
        assert_eq!(backend.issuer_type(), IssuerType::SelfSigned);
    }
}
