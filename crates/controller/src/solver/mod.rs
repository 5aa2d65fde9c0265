//! Challenge solvers.
//!
//! A [`Solver`] makes one challenge type provable: it presents the
//! artifact, checks that the artifact is visible the way the ACME server
//! will see it, and removes it again. Every call does one bounded piece of
//! work and returns; retrying and scheduling belong to the Challenge
//! controller.

pub mod dns01;
pub mod http01;

pub use dns01::{
    challenge_record_name, dns01_value, Dns01Solver, DnsProvider, HickoryTxtResolver,
    MemoryDnsProvider, TxtResolver, WebhookDnsProvider,
};
pub use http01::{
    ChallengeManager, Http01Provisioner, Http01Solver, WebhookHttp01Provisioner,
    ACME_CHALLENGE_PREFIX,
};

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use warden_common::{Classify, ErrorClass};

use crate::api::{Challenge, ChallengeType};

#[derive(Debug, Error)]
pub enum SolverError {
    #[error("no solver registered for {0} challenges")]
    NoSolver(ChallengeType),

    #[error("unknown DNS provider {0:?}")]
    UnknownProvider(String),

    #[error("challenge has no dns01 solver configuration")]
    MissingConfig,

    #[error("provisioning failed: {0}")]
    Provision(String),

    /// Artifact not (yet) visible
    #[error("{0}")]
    NotPropagated(String),
}

impl Classify for SolverError {
    fn class(&self) -> ErrorClass {
        match self {
            SolverError::NoSolver(_) | SolverError::UnknownProvider(_) | SolverError::MissingConfig => {
                ErrorClass::Configuration
            }
            SolverError::Provision(_) | SolverError::NotPropagated(_) => ErrorClass::Transient,
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            SolverError::NoSolver(_) => "NoSolver",
            SolverError::UnknownProvider(_) => "UnknownDNSProvider",
            SolverError::MissingConfig => "MissingSolverConfig",
            SolverError::Provision(_) => "PresentError",
            SolverError::NotPropagated(_) => "SelfCheckFailed",
        }
    }
}

#[async_trait]
pub trait Solver: Send + Sync {
    /// Put the challenge artifact in place. Presenting twice is harmless.
    async fn present(&self, challenge: &Challenge) -> Result<(), SolverError>;

    /// One propagation check, bounded in time.
    async fn check(&self, challenge: &Challenge) -> Result<(), SolverError>;

    /// Remove the artifact. Removing an absent artifact succeeds.
    async fn cleanup(&self, challenge: &Challenge) -> Result<(), SolverError>;
}

/// Routes each challenge to the solver for its type.
#[derive(Clone, Default)]
pub struct SolverDispatcher {
    http01: Option<Arc<dyn Solver>>,
    dns01: Option<Arc<dyn Solver>>,
}

impl SolverDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_http01(mut self, solver: Arc<dyn Solver>) -> Self {
        self.http01 = Some(solver);
        self
    }

    pub fn with_dns01(mut self, solver: Arc<dyn Solver>) -> Self {
        self.dns01 = Some(solver);
        self
    }

    pub fn solver_for(&self, challenge: &Challenge) -> Result<&dyn Solver, SolverError> {
        let solver = match challenge.spec.type_ {
            ChallengeType::Http01 => self.http01.as_deref(),
            ChallengeType::Dns01 => self.dns01.as_deref(),
        };
        solver.ok_or(SolverError::NoSolver(challenge.spec.type_))
    }
}

impl std::fmt::Debug for SolverDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SolverDispatcher")
            .field("http01", &self.http01.is_some())
            .field("dns01", &self.dns01.is_some())
            .finish()
    }
}

#[cfg(test)]
pub(crate) fn test_challenge(type_: ChallengeType, dns_name: &str, token: &str, key: &str) -> Challenge {
    use crate::api::{ChallengeSpec, Dns01SolverConfig, Http01SolverConfig, ObjectMeta, SolverRule};
    use warden_common::IssuerRef;

    let solver = match type_ {
        ChallengeType::Http01 => SolverRule {
            http01: Some(Http01SolverConfig::default()),
            ..Default::default()
        },
        ChallengeType::Dns01 => SolverRule {
            dns01: Some(Dns01SolverConfig {
                provider: "memory".to_string(),
            }),
            ..Default::default()
        },
    };
    Challenge {
        metadata: ObjectMeta::new("default", format!("web-1-{token}")),
        spec: ChallengeSpec {
            url: format!("https://acme.test/chall/{token}"),
            authorization_url: format!("https://acme.test/authz/{token}"),
            order_url: "https://acme.test/order/1".to_string(),
            dns_name: dns_name.to_string(),
            wildcard: false,
            type_,
            token: token.to_string(),
            key: key.to_string(),
            solver,
            issuer_ref: IssuerRef::issuer("le"),
        },
        status: Default::default(),
    }
}
