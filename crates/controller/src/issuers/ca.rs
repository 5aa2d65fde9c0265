use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use warden_common::{set_condition, ConditionStatus};

use super::{secret_field, IssuerBackend, IssuerError, SignOutcome};
use crate::api::{
    CertificateRequest, Issuer, IssuerSpec, IssuerType, Secret, CONDITION_READY, TLS_CERT_KEY,
    TLS_PRIVATE_KEY,
};
use crate::pki::{self, SigningOptions};
use crate::store::{Api, ResourceStore};

const REASON_KEY_PAIR_VERIFIED: &str = "KeyPairVerified";
const REASON_GET_KEY_PAIR: &str = "ErrGetKeyPair";
const REASON_INVALID_KEY_PAIR: &str = "ErrInvalidKeyPair";

/// Signs with a CA certificate and key held in a Secret.
pub struct CaBackend {
    secrets: Api<Secret>,
}

impl CaBackend {
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self {
            secrets: Api::new(store),
        }
    }

    async fn key_pair(&self, namespace: &str, secret_name: &str) -> Result<(String, String), IssuerError> {
        let cert = secret_field(&self.secrets, namespace, secret_name, TLS_CERT_KEY).await?;
        let key = secret_field(&self.secrets, namespace, secret_name, TLS_PRIVATE_KEY).await?;
        Ok((cert, key))
    }
}

fn secret_name(issuer: &Issuer) -> Result<&str, IssuerError> {
    match &issuer.spec {
        IssuerSpec::Ca(ca) => Ok(&ca.secret_name),
        other => Err(IssuerError::UnknownIssuerKind(other.issuer_type().to_string())),
    }
}

#[async_trait]
impl IssuerBackend for CaBackend {
    fn issuer_type(&self) -> IssuerType {
        IssuerType::Ca
    }

    async fn setup(&self, issuer: &mut Issuer) -> Result<(), IssuerError> {
        let secret_name = secret_name(issuer)?.to_string();
        let conditions = &mut issuer.status.conditions;

        let (cert, key) = match self.key_pair(&issuer.metadata.namespace, &secret_name).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(secret = %secret_name, error = %e, "Cannot read CA key pair");
                set_condition(
                    conditions,
                    CONDITION_READY,
                    ConditionStatus::False,
                    REASON_GET_KEY_PAIR,
                    format!("Error getting keypair for CA issuer: {e}"),
                );
                return Err(e);
            }
        };

        if let Err(e) = pki::verify_ca_pair(&cert, &key) {
            set_condition(
                conditions,
                CONDITION_READY,
                ConditionStatus::False,
                REASON_INVALID_KEY_PAIR,
                format!("Error verifying keypair for CA issuer: {e}"),
            );
            return Ok(());
        }

        set_condition(
            conditions,
            CONDITION_READY,
            ConditionStatus::True,
            REASON_KEY_PAIR_VERIFIED,
            "Signing CA verified",
        );
        Ok(())
    }

    async fn sign(&self, issuer: &Issuer, request: &CertificateRequest) -> Result<SignOutcome, IssuerError> {
        let secret_name = secret_name(issuer)?;
        let (ca_cert, ca_key) = self.key_pair(&issuer.metadata.namespace, secret_name).await?;

        let mut options = SigningOptions::new(
            request.spec.duration_seconds,
            &request.spec.usages,
            request.spec.is_ca,
        )?;
        options.not_after_limit = Some(pki::parse_certificate(&ca_cert)?.not_after);

        let certificate = pki::sign_with_ca(&request.spec.request, &ca_cert, &ca_key, &options)?;
        debug!(request = %request.metadata.name, issuer = %issuer.metadata.name, "Issued certificate from CA");

        Ok(SignOutcome::Issued {
            certificate,
            ca: Some(ca_cert),
        })
    }
}
