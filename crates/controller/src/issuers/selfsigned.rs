use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use warden_common::{set_condition, ConditionStatus};

use super::{secret_field, IssuerBackend, IssuerError, SignOutcome};
use crate::api::{
    CertificateRequest, Issuer, IssuerType, Secret, CONDITION_READY, PRIVATE_KEY_SECRET_ANNOTATION,
    TLS_PRIVATE_KEY,
};
use crate::pki::{self, SigningOptions};
use crate::store::{Api, ResourceStore};

/// Signs each request with its own private key.
///
/// The key is found through the request's
/// `warden.io/private-key-secret-name` annotation.
pub struct SelfSignedBackend {
    secrets: Api<Secret>,
}

impl SelfSignedBackend {
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self {
            secrets: Api::new(store),
        }
    }
}

#[async_trait]
impl IssuerBackend for SelfSignedBackend {
    fn issuer_type(&self) -> IssuerType {
        IssuerType::SelfSigned
    }

    async fn setup(&self, issuer: &mut Issuer) -> Result<(), IssuerError> {
        set_condition(
            &mut issuer.status.conditions,
            CONDITION_READY,
            ConditionStatus::True,
            "IsReady",
            "",
        );
        Ok(())
    }

    async fn sign(&self, _issuer: &Issuer, request: &CertificateRequest) -> Result<SignOutcome, IssuerError> {
        let secret_name = request
            .metadata
            .annotations
            .get(PRIVATE_KEY_SECRET_ANNOTATION)
            .filter(|name| !name.is_empty())
            .ok_or(IssuerError::MissingAnnotation(PRIVATE_KEY_SECRET_ANNOTATION))?;

        let key_pem = secret_field(
            &self.secrets,
            &request.metadata.namespace,
            secret_name,
            TLS_PRIVATE_KEY,
        )
        .await?;

        let options = SigningOptions::new(
            request.spec.duration_seconds,
            &request.spec.usages,
            request.spec.is_ca,
        )?;
        let certificate = pki::sign_self(&request.spec.request, &key_pem, &options)?;
        debug!(request = %request.metadata.name, "Issued self-signed certificate");

        Ok(SignOutcome::Issued {
            ca: Some(certificate.clone()),
            certificate,
        })
    }
}
