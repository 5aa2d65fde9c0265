//! Vault PKI backend.
//!
//! Setup probes `GET /v1/sys/health`; signing posts the CSR to
//! `POST /v1/<path>` with the token from the issuer's token secret.
//! Server errors and network failures are retried. A 4xx answer is the
//! CA refusing the request and ends it, with Vault's error text kept as is.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use warden_common::{set_condition, ConditionStatus};

use super::{secret_field, IssuerBackend, IssuerError, SignOutcome};
use crate::api::{
    CertificateRequest, Issuer, IssuerSpec, IssuerType, Secret, VaultIssuer, CONDITION_READY,
    VAULT_TOKEN_KEY,
};
use crate::pki::{PkiError, DEFAULT_CERT_DURATION};
use crate::store::{Api, ResourceStore};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Health codes of an initialized, unsealed node: active, standby,
/// DR secondary, performance standby.
const HEALTHY: [u16; 4] = [200, 429, 472, 473];

#[derive(Debug, Serialize)]
struct SignRequest<'a> {
    csr: &'a str,
    ttl: String,
}

#[derive(Debug, Deserialize)]
struct SignResponse {
    data: SignData,
}

#[derive(Debug, Deserialize)]
struct SignData {
    certificate: String,
    #[serde(default)]
    issuing_ca: Option<String>,
    #[serde(default)]
    ca_chain: Vec<String>,
}

pub struct VaultBackend {
    secrets: Api<Secret>,
}

impl VaultBackend {
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self {
            secrets: Api::new(store),
        }
    }

    fn client(config: &VaultIssuer) -> Result<Client, IssuerError> {
        let mut builder = Client::builder().timeout(REQUEST_TIMEOUT);
        if let Some(bundle) = &config.ca_bundle {
            let root = reqwest::Certificate::from_pem(bundle.as_bytes())
                .map_err(|e| PkiError::InvalidCertificate(format!("caBundle: {e}")))?;
            builder = builder.add_root_certificate(root);
        }
        builder
            .build()
            .map_err(|e| IssuerError::Upstream(format!("cannot build HTTP client: {e}")))
    }

    async fn probe(config: &VaultIssuer) -> Result<(), IssuerError> {
        let url = Self::url(config, "sys/health");
        let response = Self::client(config)?
            .get(&url)
            .send()
            .await
            .map_err(|e| IssuerError::Upstream(format!("GET {url}: {e}")))?;
        let status = response.status().as_u16();
        if HEALTHY.contains(&status) {
            Ok(())
        } else {
            Err(IssuerError::Upstream(format!("GET {url} returned {status}")))
        }
    }

    fn url(config: &VaultIssuer, path: &str) -> String {
        format!(
            "{}/v1/{}",
            config.server.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

fn config(issuer: &Issuer) -> Result<&VaultIssuer, IssuerError> {
    match &issuer.spec {
        IssuerSpec::Vault(vault) => Ok(vault),
        other => Err(IssuerError::UnknownIssuerKind(other.issuer_type().to_string())),
    }
}

#[async_trait]
impl IssuerBackend for VaultBackend {
    fn issuer_type(&self) -> IssuerType {
        IssuerType::Vault
    }

    async fn setup(&self, issuer: &mut Issuer) -> Result<(), IssuerError> {
        let config = config(issuer)?.clone();

        match Self::probe(&config).await {
            Ok(()) => {
                set_condition(
                    &mut issuer.status.conditions,
                    CONDITION_READY,
                    ConditionStatus::True,
                    "VaultVerified",
                    "Vault verified",
                );
                Ok(())
            }
            Err(e) => {
                warn!(server = %config.server, error = %e, "Vault health check failed");
                set_condition(
                    &mut issuer.status.conditions,
                    CONDITION_READY,
                    ConditionStatus::False,
                    "VaultError",
                    format!("Failed to verify Vault is initialized and unsealed: {e}"),
                );
                Err(e)
            }
        }
    }

    async fn sign(&self, issuer: &Issuer, request: &CertificateRequest) -> Result<SignOutcome, IssuerError> {
        let config = config(issuer)?;
        let token = secret_field(
            &self.secrets,
            &issuer.metadata.namespace,
            &config.token_secret_name,
            VAULT_TOKEN_KEY,
        )
        .await?;

        let ttl = request
            .spec
            .duration_seconds
            .unwrap_or(DEFAULT_CERT_DURATION.as_secs());
        let url = Self::url(config, &config.path);

        let response = Self::client(config)?
            .post(&url)
            .header("X-Vault-Token", token.trim())
            .json(&SignRequest {
                csr: &request.spec.request,
                ttl: format!("{ttl}s"),
            })
            .send()
            .await
            .map_err(|e| IssuerError::Upstream(format!("POST {url}: {e}")))?;

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(IssuerError::Upstream(format!("POST {url} returned {status}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IssuerError::Denied(body));
        }

        let signed: SignResponse = response
            .json()
            .await
            .map_err(|e| IssuerError::Upstream(format!("unreadable Vault response: {e}")))?;
        debug!(request = %request.metadata.name, "Vault signed certificate");

        let data = signed.data;
        let root = data
            .ca_chain
            .last()
            .cloned()
            .or_else(|| data.issuing_ca.clone());
        let mut chain = vec![data.certificate.trim().to_string()];
        chain.extend(
            data.ca_chain
                .iter()
                .filter(|c| Some(*c) != root.as_ref())
                .map(|c| c.trim().to_string()),
        );

        Ok(SignOutcome::Issued {
            certificate: chain.join("\n") + "\n",
            ca: root,
        })
    }
}
