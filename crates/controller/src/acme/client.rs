//! The ACME protocol seam.
//!
//! Controllers talk to ACME servers only through [`AcmeClient`]. Every call
//! is a single request/response (no waiting, no polling), so a pass stays
//! short and all scheduling stays with the controller.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use warden_common::{Classify, ErrorClass};

use crate::api::{ChallengeState, ChallengeType, OrderState};

/// Problem type an ACME server returns when a rate limit is hit.
pub const RATE_LIMITED_PROBLEM: &str = "urn:ietf:params:acme:error:rateLimited";

#[derive(Debug, Error)]
pub enum AcmeClientError {
    /// Network failure or server-side error; worth retrying
    #[error("ACME request failed: {0}")]
    Transient(String),

    #[error("ACME rate limit hit: {detail}")]
    RateLimited {
        detail: String,
        retry_after: Option<Duration>,
    },

    /// The server refused the request; the detail is the server's own text
    #[error("{0}")]
    Rejected(String),
}

impl Classify for AcmeClientError {
    fn class(&self) -> ErrorClass {
        match self {
            AcmeClientError::Transient(_) | AcmeClientError::RateLimited { .. } => {
                ErrorClass::Transient
            }
            AcmeClientError::Rejected(_) => ErrorClass::Terminal,
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            AcmeClientError::Transient(_) => "ACMERequestFailed",
            AcmeClientError::RateLimited { .. } => "RateLimited",
            AcmeClientError::Rejected(_) => "ACMERejected",
        }
    }
}

/// A registered account. `credentials` is the serialized account key and is
/// what gets persisted in the issuer's key secret.
#[derive(Clone, PartialEq, Eq)]
pub struct AccountHandle {
    pub server_url: String,
    pub account_url: String,
    pub credentials: String,
}

impl std::fmt::Debug for AccountHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountHandle")
            .field("server_url", &self.server_url)
            .field("account_url", &self.account_url)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationState {
    Pending,
    Valid,
    Invalid,
    Deactivated,
    Expired,
    Revoked,
}

impl AuthorizationState {
    /// Any final state other than valid.
    pub fn is_failed(self) -> bool {
        matches!(
            self,
            AuthorizationState::Invalid
                | AuthorizationState::Deactivated
                | AuthorizationState::Expired
                | AuthorizationState::Revoked
        )
    }
}

impl std::fmt::Display for AuthorizationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AuthorizationState::Pending => "pending",
            AuthorizationState::Valid => "valid",
            AuthorizationState::Invalid => "invalid",
            AuthorizationState::Deactivated => "deactivated",
            AuthorizationState::Expired => "expired",
            AuthorizationState::Revoked => "revoked",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeDetails {
    pub challenge_type: ChallengeType,
    pub url: String,
    pub token: String,
    pub status: ChallengeState,
    pub key_authorization: String,
    /// Problem detail reported by the server, verbatim
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationDetails {
    pub url: String,
    /// DNS name without any `*.` prefix
    pub identifier: String,
    pub wildcard: bool,
    pub status: AuthorizationState,
    /// Only the challenge types Warden can solve
    pub challenges: Vec<ChallengeDetails>,
}

impl AuthorizationDetails {
    pub fn challenge(&self, challenge_type: ChallengeType) -> Option<&ChallengeDetails> {
        self.challenges.iter().find(|c| c.challenge_type == challenge_type)
    }

    /// First error detail reported on any of the challenges.
    pub fn error(&self) -> Option<&str> {
        self.challenges.iter().find_map(|c| c.error.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderDetails {
    pub url: String,
    pub status: OrderState,
    pub finalize_url: String,
    pub certificate_url: Option<String>,
    pub authorizations: Vec<AuthorizationDetails>,
    pub error: Option<String>,
}

impl OrderDetails {
    pub fn authorization(&self, url: &str) -> Option<&AuthorizationDetails> {
        self.authorizations.iter().find(|a| a.url == url)
    }
}

/// Single-request ACME operations.
#[async_trait]
pub trait AcmeClient: Send + Sync {
    /// Register (or look up) an account. With `credentials` from an earlier
    /// registration the same account is returned without creating a new one.
    async fn register_account(
        &self,
        server_url: &str,
        email: Option<&str>,
        credentials: Option<&str>,
    ) -> Result<AccountHandle, AcmeClientError>;

    async fn create_order(
        &self,
        account: &AccountHandle,
        identifiers: &[String],
    ) -> Result<OrderDetails, AcmeClientError>;

    async fn get_order(
        &self,
        account: &AccountHandle,
        order_url: &str,
    ) -> Result<OrderDetails, AcmeClientError>;

    /// Tell the server the challenge at `challenge_url` is ready for validation.
    async fn accept_challenge(
        &self,
        account: &AccountHandle,
        order_url: &str,
        challenge_url: &str,
    ) -> Result<(), AcmeClientError>;

    /// Submit the CSR of a ready order. Returns the order's new state.
    async fn finalize_order(
        &self,
        account: &AccountHandle,
        order_url: &str,
        csr_der: &[u8],
    ) -> Result<OrderState, AcmeClientError>;

    /// PEM chain of a valid order, `None` while the server is still processing.
    async fn download_certificate(
        &self,
        account: &AccountHandle,
        order_url: &str,
    ) -> Result<Option<String>, AcmeClientError>;
}
