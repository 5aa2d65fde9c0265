//! HTTP-01 challenges.
//!
//! The key authorization must be served at
//! `http://<name>/.well-known/acme-challenge/<token>`. Serving is done by a
//! [`Http01Provisioner`]: either the in-process [`ChallengeManager`], which an
//! HTTP front end consults per request, or a webhook that configures an
//! external one.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::{Solver, SolverError};
use crate::api::Challenge;

/// HTTP-01 challenge path prefix
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

#[async_trait]
pub trait Http01Provisioner: Send + Sync {
    async fn present(&self, domain: &str, token: &str, key: &str) -> Result<(), SolverError>;

    async fn cleanup(&self, domain: &str, token: &str) -> Result<(), SolverError>;
}

// ============================================================================
// In-process token store
// ============================================================================

/// Pending HTTP-01 responses, token to key authorization.
///
/// Clones share state, so one handle can be given to the solver and another
/// to whatever serves `/.well-known/acme-challenge/`.
#[derive(Debug, Clone, Default)]
pub struct ChallengeManager {
    challenges: Arc<DashMap<String, String>>,
}

impl ChallengeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Response for a challenge token, if one is pending.
    pub fn get_response(&self, token: &str) -> Option<String> {
        let result = self.challenges.get(token).map(|v| v.clone());
        trace!(token = %token, found = result.is_some(), "ACME challenge lookup");
        result
    }

    /// Token of a challenge request path, e.g. for routing in a front end.
    pub fn extract_token(path: &str) -> Option<&str> {
        path.strip_prefix(ACME_CHALLENGE_PREFIX)
    }

    pub fn pending_count(&self) -> usize {
        self.challenges.len()
    }

    /// A solver that provisions into this store and self-checks on `port`.
    pub fn into_solver(self, port: u16) -> Http01Solver {
        Http01Solver::new(Arc::new(self), port, Duration::from_secs(10))
    }
}

#[async_trait]
impl Http01Provisioner for ChallengeManager {
    async fn present(&self, domain: &str, token: &str, key: &str) -> Result<(), SolverError> {
        debug!(domain, token, "Registering HTTP-01 challenge response");
        self.challenges.insert(token.to_string(), key.to_string());
        Ok(())
    }

    async fn cleanup(&self, domain: &str, token: &str) -> Result<(), SolverError> {
        if self.challenges.remove(token).is_some() {
            debug!(domain, token, "Removed HTTP-01 challenge response");
        }
        Ok(())
    }
}

// ============================================================================
// Webhook provisioner
// ============================================================================

#[derive(Serialize)]
struct Http01Payload<'a> {
    domain: &'a str,
    token: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    key: Option<&'a str>,
}

/// Delegates serving to an external component: `POST <url>/present` and
/// `POST <url>/cleanup` with `{domain, token, key}`.
#[derive(Debug, Clone)]
pub struct WebhookHttp01Provisioner {
    client: reqwest::Client,
    url: String,
}

impl WebhookHttp01Provisioner {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn call(&self, action: &str, payload: &Http01Payload<'_>) -> Result<(), SolverError> {
        let response = self
            .client
            .post(format!("{}/{}", self.url, action))
            .json(payload)
            .send()
            .await
            .map_err(|e| SolverError::Provision(format!("http01 webhook {action}: {e}")))?;
        if !response.status().is_success() {
            return Err(SolverError::Provision(format!(
                "http01 webhook {action} returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Http01Provisioner for WebhookHttp01Provisioner {
    async fn present(&self, domain: &str, token: &str, key: &str) -> Result<(), SolverError> {
        self.call(
            "present",
            &Http01Payload {
                domain,
                token,
                key: Some(key),
            },
        )
        .await
    }

    async fn cleanup(&self, domain: &str, token: &str) -> Result<(), SolverError> {
        self.call(
            "cleanup",
            &Http01Payload {
                domain,
                token,
                key: None,
            },
        )
        .await
    }
}

// ============================================================================
// Solver
// ============================================================================

pub struct Http01Solver {
    provisioner: Arc<dyn Http01Provisioner>,
    client: reqwest::Client,
    port: u16,
    timeout: Duration,
}

impl Http01Solver {
    pub fn new(provisioner: Arc<dyn Http01Provisioner>, port: u16, timeout: Duration) -> Self {
        Self {
            provisioner,
            client: reqwest::Client::new(),
            port,
            timeout,
        }
    }

    fn check_url(&self, challenge: &Challenge) -> String {
        format!(
            "http://{}:{}{}{}",
            challenge.spec.dns_name, self.port, ACME_CHALLENGE_PREFIX, challenge.spec.token
        )
    }
}

#[async_trait]
impl Solver for Http01Solver {
    async fn present(&self, challenge: &Challenge) -> Result<(), SolverError> {
        self.provisioner
            .present(&challenge.spec.dns_name, &challenge.spec.token, &challenge.spec.key)
            .await
    }

    async fn check(&self, challenge: &Challenge) -> Result<(), SolverError> {
        let url = self.check_url(challenge);
        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| SolverError::NotPropagated(format!("GET {url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SolverError::NotPropagated(format!("GET {url} returned {status}")));
        }
        let body = response
            .text()
            .await
            .map_err(|e| SolverError::NotPropagated(format!("GET {url}: {e}")))?;
        if body.trim() != challenge.spec.key {
            return Err(SolverError::NotPropagated(format!(
                "GET {url} served an unexpected key authorization"
            )));
        }
        trace!(url = %url, "HTTP-01 self-check passed");
        Ok(())
    }

    async fn cleanup(&self, challenge: &Challenge) -> Result<(), SolverError> {
        self.provisioner
            .cleanup(&challenge.spec.dns_name, &challenge.spec.token)
            .await
    }
}
