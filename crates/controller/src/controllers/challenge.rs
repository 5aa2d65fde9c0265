//! Challenge reconciler.
//!
//! Drives a single challenge: present the artifact, wait until the
//! self-check sees it, accept it at the ACME server, then poll until the
//! server decides. Until acceptance the artifact is presented again on each
//! pass, so one removed from outside comes back. It is removed once, as
//! soon as the challenge is decided or deleted; the finalizer keeps a
//! deleted Challenge around until that has happened.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

use warden_common::{Classify, ObjectKey};

use super::{Context, PassError};
use crate::acme::AcmeClientError;
use crate::api::{Challenge, ChallengeState, Resource, ACME_FINALIZER};
use crate::controller::{Action, ReconcileError, Reconciler};
use crate::solver::SolverError;
use crate::store::{Api, StoreError};

pub struct ChallengeController {
    context: Arc<Context>,
    challenges: Api<Challenge>,
}

impl ChallengeController {
    pub fn new(context: Arc<Context>) -> Self {
        let challenges = Api::new(Arc::clone(&context.store));
        Self { context, challenges }
    }

    async fn cleanup(&self, challenge: &Challenge) -> Result<(), SolverError> {
        self.context.solvers.solver_for(challenge)?.cleanup(challenge).await
    }

    /// Persist the decided status with the artifact marked gone, then
    /// remove it. A pass that fails to write never cleans up, and a pass
    /// that wrote never runs again, so cleanup is attempted at most once
    /// and a failure is reported but not retried.
    async fn finish(&self, challenge: &Challenge, mut updated: Challenge) -> Result<Action, ReconcileError> {
        let presented = updated.status.presented;
        updated.status.presented = false;
        updated.status.processing = false;
        self.context.status.write(&self.challenges, challenge, &updated).await?;

        if presented {
            if let Err(e) = self.cleanup(challenge).await {
                warn!(challenge = %challenge.key(), error = %e, "Failed to clean up challenge");
                self.context
                    .recorder
                    .warning(&challenge.key(), "CleanUpError", &format!("Error cleaning up challenge: {e}"));
            }
        }
        Ok(Action::await_change())
    }

    /// Best-effort cleanup of a deleted Challenge, then drop the finalizer.
    async fn finalize(&self, challenge: Challenge) -> Result<Action, ReconcileError> {
        if !challenge.metadata.has_finalizer(ACME_FINALIZER) {
            return Ok(Action::await_change());
        }
        if challenge.status.presented {
            if let Err(e) = self.cleanup(&challenge).await {
                warn!(challenge = %challenge.key(), error = %e, "Cleanup of deleted challenge failed, removing finalizer anyway");
            }
        }

        let mut released = challenge;
        released.metadata.finalizers.retain(|f| f != ACME_FINALIZER);
        match self.challenges.update(&released).await {
            Ok(_) | Err(StoreError::NotFound(_)) => Ok(Action::await_change()),
            Err(e) => Err(e.into()),
        }
    }

    async fn step(&self, challenge: &Challenge, updated: &mut Challenge) -> Result<Step, PassError> {
        let key = challenge.key();
        let spec = &challenge.spec;
        let (issuer, _) = self
            .context
            .registry
            .resolve(&challenge.metadata.namespace, &spec.issuer_ref)
            .await?;
        let account = self.context.acme.account(&issuer).await?;
        let client = self.context.acme.client();
        let solver = self.context.solvers.solver_for(challenge)?;

        updated.status.processing = true;
        if updated.status.state.is_none() {
            updated.status.state = Some(ChallengeState::Pending);
        }

        if !challenge.status.accepted {
            // Re-presented on every pass so a lost artifact is put back.
            solver.present(challenge).await?;
            updated.status.presented = true;
            if updated.status.presented_at.is_none() {
                updated.status.presented_at = Some(Utc::now());
                self.context.recorder.normal(
                    &key,
                    "Presented",
                    &format!("Presented challenge using {} challenge mechanism", spec.type_),
                );
            }

            let timeout = self.context.timing.self_check_timeout;
            let checked = match tokio::time::timeout(timeout, solver.check(challenge)).await {
                Ok(result) => result,
                Err(_) => Err(SolverError::NotPropagated(format!(
                    "self-check timed out after {}s",
                    timeout.as_secs()
                ))),
            };
            if let Err(e) = checked {
                debug!(challenge = %key, error = %e, "Self-check failed");
                updated.status.self_check_attempts += 1;
                updated.status.reason = format!("{}: {e}", e.reason());
                return Ok(Step::Continue(Action::backoff()));
            }

            client.accept_challenge(&account, &spec.order_url, &spec.url).await?;
            info!(challenge = %key, domain = %spec.dns_name, "Accepted challenge");
            updated.status.accepted = true;
            updated.status.state = Some(ChallengeState::Processing);
            updated.status.reason = "Waiting for authorization from the ACME server".to_string();
        }

        let order = client.get_order(&account, &spec.order_url).await?;
        let remote = order
            .authorization(&spec.authorization_url)
            .and_then(|a| a.challenges.iter().find(|c| c.url == spec.url))
            .ok_or_else(|| AcmeClientError::Rejected(format!("challenge {} is no longer part of its order", spec.url)))?;

        match remote.status {
            ChallengeState::Valid => {
                updated.status.state = Some(ChallengeState::Valid);
                updated.status.reason = "Successfully authorized domain".to_string();
                self.context
                    .recorder
                    .normal(&key, "DomainVerified", "Domain has been verified");
                Ok(Step::Decided)
            }
            ChallengeState::Invalid => {
                let reason = remote
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("authorization for {} failed", spec.dns_name));
                self.context.recorder.warning(&key, "DomainVerificationFailed", &reason);
                updated.status.state = Some(ChallengeState::Invalid);
                updated.status.reason = reason;
                Ok(Step::Decided)
            }
            ChallengeState::Pending | ChallengeState::Processing => Ok(Step::Continue(Action::backoff())),
        }
    }
}

enum Step {
    Continue(Action),
    Decided,
}

#[async_trait]
impl Reconciler for ChallengeController {
    fn kind(&self) -> &'static str {
        Challenge::KIND
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let Some(challenge) = self.challenges.get_key(key).await? else {
            return Ok(Action::await_change());
        };
        if challenge.metadata.is_deleting() {
            return self.finalize(challenge).await;
        }
        if !challenge.metadata.has_finalizer(ACME_FINALIZER) {
            let mut guarded = challenge;
            guarded.metadata.finalizers.push(ACME_FINALIZER.to_string());
            self.challenges.update(&guarded).await?;
            return Ok(Action::await_change());
        }

        let mut updated = challenge.clone();
        let next = if challenge.status.is_terminal() {
            if !(challenge.status.presented || challenge.status.processing) {
                return Ok(Action::await_change());
            }
            Step::Decided
        } else {
            match self.step(&challenge, &mut updated).await {
                Ok(step) => step,
                Err(e) if e.class().is_retryable() => {
                    warn!(challenge = %key, error = %e, "Challenge pass failed, will retry");
                    updated.status.reason = e.to_string();
                    self.context.status.write(&self.challenges, &challenge, &updated).await?;
                    return Err(e.into());
                }
                Err(e) => {
                    self.context.recorder.warning(key, e.reason(), &e.to_string());
                    updated.status.state = Some(ChallengeState::Invalid);
                    updated.status.reason = e.to_string();
                    Step::Decided
                }
            }
        };

        match next {
            Step::Continue(action) => {
                self.context.status.write(&self.challenges, &challenge, &updated).await?;
                Ok(action)
            }
            Step::Decided => self.finish(&challenge, updated).await,
        }
    }
}
