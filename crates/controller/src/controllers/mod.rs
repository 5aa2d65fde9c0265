//! The five reconcilers and what they share.
//!
//! Every reconciler follows the same pass shape: read the object, clone it,
//! run one step against the backend or solver on the clone, surface errors
//! as events, write the status only if it changed, and return the next
//! [`Action`](crate::controller::Action). Cross-object progress is carried by ownership: an Order is
//! owned by its request and a Challenge by its Order, so a change below
//! wakes the object above.

pub mod certificate;
pub mod certificate_request;
pub mod challenge;
pub mod issuer;
pub mod order;

pub use certificate::CertificateController;
pub use certificate_request::CertificateRequestController;
pub use challenge::ChallengeController;
pub use issuer::IssuerController;
pub use order::OrderController;

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use warden_common::{Backoff, Classify, ErrorClass};
use warden_config::Config;

use crate::acme::{AcmeClient, AcmeClientError};
use crate::controller::{Controller, ControllerOptions, ReconcileError};
use crate::events::EventRecorder;
use crate::issuers::{AcmeBackend, CaBackend, IssuerError, IssuerRegistry, SelfSignedBackend, VaultBackend};
use crate::pki::PkiError;
use crate::renewal::FAILURE_BACKOFF;
use crate::solver::{SolverDispatcher, SolverError};
use crate::status::StatusWriter;
use crate::store::{Api, ResourceStore, StoreError};

// ============================================================================
// Errors
// ============================================================================

/// Anything a single pass can fail with.
#[derive(Debug, Error)]
pub enum PassError {
    #[error(transparent)]
    Issuer(#[from] IssuerError),

    #[error(transparent)]
    Acme(#[from] AcmeClientError),

    #[error(transparent)]
    Solver(#[from] SolverError),

    #[error(transparent)]
    Pki(#[from] PkiError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("no configured solver can validate {0}")]
    NoSolver(String),
}

impl Classify for PassError {
    fn class(&self) -> ErrorClass {
        match self {
            PassError::Issuer(e) => e.class(),
            PassError::Acme(e) => e.class(),
            PassError::Solver(e) => e.class(),
            PassError::Pki(e) => e.class(),
            PassError::Store(e) => e.class(),
            PassError::NoSolver(_) => ErrorClass::Configuration,
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            PassError::Issuer(e) => e.reason(),
            PassError::Acme(e) => e.reason(),
            PassError::Solver(e) => e.reason(),
            PassError::Pki(e) => e.reason(),
            PassError::Store(e) => e.reason(),
            PassError::NoSolver(_) => "NoSolverFound",
        }
    }
}

impl PassError {
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            PassError::Issuer(e) => e.retry_after(),
            PassError::Acme(AcmeClientError::RateLimited { retry_after, .. }) => *retry_after,
            _ => None,
        }
    }
}

impl From<PassError> for ReconcileError {
    fn from(error: PassError) -> Self {
        if let Some(after) = error.retry_after() {
            return ReconcileError::RetryAfter {
                message: error.to_string(),
                after,
            };
        }
        match error {
            PassError::Store(e) | PassError::Issuer(IssuerError::Store(e)) => ReconcileError::Store(e),
            other => ReconcileError::Transient(other.to_string()),
        }
    }
}

// ============================================================================
// Shared context
// ============================================================================

/// Time-related policy threaded into the reconcilers.
#[derive(Debug, Clone)]
pub struct Timing {
    pub self_check_timeout: Duration,
    pub renew_before_floor: Duration,
    pub failure_backoff: Backoff,
    /// How often an issuer that set up cleanly but is not Ready is revisited
    pub issuer_resync: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            self_check_timeout: Duration::from_secs(10),
            renew_before_floor: Duration::from_secs(300),
            failure_backoff: FAILURE_BACKOFF,
            issuer_resync: Duration::from_secs(60),
        }
    }
}

impl Timing {
    pub fn from_config(config: &Config) -> Self {
        Self {
            self_check_timeout: config.self_check_timeout(),
            renew_before_floor: config.renew_before_floor(),
            failure_backoff: Backoff::new(config.failure_backoff_initial(), config.failure_backoff_max()),
            ..Self::default()
        }
    }
}

pub struct Context {
    pub store: Arc<dyn ResourceStore>,
    pub registry: IssuerRegistry,
    pub acme: Arc<AcmeBackend>,
    pub solvers: SolverDispatcher,
    pub recorder: Arc<dyn EventRecorder>,
    pub status: StatusWriter,
    pub timing: Timing,
}

impl Context {
    /// Context with every built-in issuer backend registered.
    pub fn new(
        store: Arc<dyn ResourceStore>,
        acme_client: Arc<dyn AcmeClient>,
        solvers: SolverDispatcher,
        recorder: Arc<dyn EventRecorder>,
        config: &Config,
    ) -> Self {
        let acme = Arc::new(AcmeBackend::new(Arc::clone(&store), acme_client));

        let mut registry = IssuerRegistry::new(Api::new(Arc::clone(&store)));
        registry.register(Arc::new(SelfSignedBackend::new(Arc::clone(&store))));
        registry.register(Arc::new(CaBackend::new(Arc::clone(&store))));
        registry.register(Arc::new(VaultBackend::new(Arc::clone(&store))));
        registry.register(acme.clone());

        Self {
            store,
            registry,
            acme,
            solvers,
            recorder,
            status: StatusWriter::new(config.controller.status_write, config.controller.field_manager.clone()),
            timing: Timing::from_config(config),
        }
    }
}

/// Run all five controllers until `shutdown` is cancelled.
pub async fn run_all(context: Arc<Context>, options: ControllerOptions, shutdown: CancellationToken) {
    let store = Arc::clone(&context.store);

    tokio::join!(
        Controller::new(
            Arc::new(IssuerController::new(Arc::clone(&context))),
            Arc::clone(&store),
            options.clone(),
        )
        .run(shutdown.clone()),
        Controller::new(
            Arc::new(CertificateController::new(Arc::clone(&context))),
            Arc::clone(&store),
            options.clone(),
        )
        .run(shutdown.clone()),
        Controller::new(
            Arc::new(CertificateRequestController::new(Arc::clone(&context))),
            Arc::clone(&store),
            options.clone(),
        )
        .run(shutdown.clone()),
        Controller::new(
            Arc::new(OrderController::new(Arc::clone(&context))),
            Arc::clone(&store),
            options.clone(),
        )
        .run(shutdown.clone()),
        Controller::new(
            Arc::new(ChallengeController::new(Arc::clone(&context))),
            store,
            options,
        )
        .run(shutdown),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_becomes_retry_after() {
        let error = PassError::from(IssuerError::from(AcmeClientError::RateLimited {
            detail: "too many orders".to_string(),
            retry_after: Some(Duration::from_secs(60)),
        }));
        let reconcile = ReconcileError::from(error);
        assert_eq!(reconcile.retry_after(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_store_errors_keep_their_identity() {
        let key = warden_common::ObjectKey::new("Order", "default", "web-1");
        let error = PassError::from(IssuerError::from(StoreError::Conflict {
            key,
            current: 2,
            given: 1,
        }));
        assert!(matches!(ReconcileError::from(error), ReconcileError::Store(e) if e.is_conflict()));
    }

    #[test]
    fn test_no_solver_is_configuration() {
        let error = PassError::NoSolver("*.example.com".to_string());
        assert_eq!(error.class(), ErrorClass::Configuration);
    }
}
