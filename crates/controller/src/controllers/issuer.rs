use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use warden_common::{is_condition_true, set_condition, Classify, ConditionStatus, ObjectKey};

use super::{Context, PassError};
use crate::api::{Issuer, Resource, CONDITION_READY};
use crate::controller::{Action, ReconcileError, Reconciler};
use crate::store::Api;

const REASON_INIT_FAILED: &str = "ErrInitIssuer";

/// Brings Issuers to Ready through their backend's setup.
pub struct IssuerController {
    context: Arc<Context>,
    issuers: Api<Issuer>,
}

impl IssuerController {
    pub fn new(context: Arc<Context>) -> Self {
        let issuers = Api::new(Arc::clone(&context.store));
        Self { context, issuers }
    }
}

#[async_trait]
impl Reconciler for IssuerController {
    fn kind(&self) -> &'static str {
        Issuer::KIND
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let Some(issuer) = self.issuers.get_key(key).await? else {
            self.context.acme.forget(key);
            return Ok(Action::await_change());
        };

        let mut updated = issuer.clone();
        let result = match self.context.registry.backend_for(&issuer) {
            Ok(backend) => backend.setup(&mut updated).await,
            Err(e) => {
                set_condition(
                    &mut updated.status.conditions,
                    CONDITION_READY,
                    ConditionStatus::False,
                    e.reason(),
                    e.to_string(),
                );
                Err(e)
            }
        };

        if let Err(e) = &result {
            self.context
                .recorder
                .warning(key, REASON_INIT_FAILED, &format!("Error initializing issuer: {e}"));
        }

        self.context.status.write(&self.issuers, &issuer, &updated).await?;

        match result {
            Ok(()) if is_condition_true(&updated.status.conditions, CONDITION_READY) => Ok(Action::await_change()),
            // Nothing in the store wakes an issuer when its secrets appear
            Ok(()) => Ok(Action::requeue(self.context.timing.issuer_resync)),
            Err(e) if e.class().is_retryable() => Err(PassError::from(e).into()),
            Err(e) => {
                debug!(issuer = %key, error = %e, "Issuer cannot be set up until it changes");
                Ok(Action::await_change())
            }
        }
    }
}
