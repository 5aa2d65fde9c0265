//! Order reconciler.
//!
//! Creates the order at the ACME server once, then only re-fetches it. While
//! the order is pending it makes sure every open authorization has exactly
//! one Challenge; once ready it finalizes with the request's CSR and
//! downloads the chain. A failed authorization or an invalid Challenge fails
//! the whole order.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

use warden_common::{Classify, ObjectKey};

use super::{Context, PassError};
use crate::acme::{select_solver, AccountHandle, AuthorizationDetails, AuthorizationState, OrderDetails};
use crate::api::{
    AcmeIssuer, AuthorizationRecord, Challenge, ChallengeSpec, ChallengeState, ObjectMeta, Order,
    OrderState, OrderStatus, Resource, ACME_FINALIZER,
};
use crate::controller::{Action, ReconcileError, Reconciler};
use crate::issuers::acme_config;
use crate::pki;
use crate::store::{Api, StoreError};

/// Name of the Challenge for the `index`th authorization of `order`.
pub fn challenge_name(order: &str, index: usize) -> String {
    format!("{order}-{index}")
}

pub struct OrderController {
    context: Arc<Context>,
    orders: Api<Order>,
    challenges: Api<Challenge>,
}

fn fail(status: &mut OrderStatus, state: OrderState, reason: String) {
    status.state = Some(state);
    status.reason = reason;
    if status.failure_time.is_none() {
        status.failure_time = Some(Utc::now());
    }
}

fn invalid_reason(details: &OrderDetails) -> String {
    details
        .error
        .clone()
        .or_else(|| details.authorizations.iter().find_map(|a| a.error().map(str::to_string)))
        .unwrap_or_else(|| format!("order {} was marked invalid by the ACME server", details.url))
}

fn display_identifier(authorization: &AuthorizationDetails) -> String {
    if authorization.wildcard {
        format!("*.{}", authorization.identifier)
    } else {
        authorization.identifier.clone()
    }
}

impl OrderController {
    pub fn new(context: Arc<Context>) -> Self {
        let store = Arc::clone(&context.store);
        Self {
            context,
            orders: Api::new(Arc::clone(&store)),
            challenges: Api::new(store),
        }
    }

    /// Delete the Challenges of a finished order. Their finalizers hold them
    /// until the solver artifacts are gone.
    async fn release_challenges(&self, order: &Order) -> Result<(), StoreError> {
        for challenge in self.challenges.list_owned(&order.key()).await? {
            if challenge.metadata.is_deleting() {
                continue;
            }
            debug!(order = %order.metadata.name, challenge = %challenge.metadata.name, "Deleting challenge");
            self.challenges
                .delete_if_exists(&challenge.metadata.namespace, &challenge.metadata.name)
                .await?;
        }
        Ok(())
    }

    async fn step(&self, order: &Order, updated: &mut Order) -> Result<Action, PassError> {
        let (issuer, _) = self
            .context
            .registry
            .resolve(&order.metadata.namespace, &order.spec.issuer_ref)
            .await?;
        let config = acme_config(&issuer)?;
        let account = self.context.acme.account(&issuer).await?;
        let client = self.context.acme.client();

        let details = match &order.status.url {
            Some(url) => client.get_order(&account, url).await?,
            None => {
                let details = client.create_order(&account, &order.spec.dns_names).await?;
                info!(order = %order.metadata.name, url = %details.url, "Created ACME order");
                updated.status.url = Some(details.url.clone());
                updated.status.finalize_url = Some(details.finalize_url.clone());
                updated.status.authorizations = details
                    .authorizations
                    .iter()
                    .map(|a| AuthorizationRecord {
                        url: a.url.clone(),
                        identifier: a.identifier.clone(),
                        wildcard: a.wildcard,
                        initial_state: a.status.to_string(),
                    })
                    .collect();
                details
            }
        };

        updated.status.state = Some(details.status);
        if details.certificate_url.is_some() {
            updated.status.certificate_url = details.certificate_url.clone();
        }

        match details.status {
            OrderState::Pending => self.sync_challenges(order, config, &details, updated).await,
            OrderState::Ready => {
                let csr = pki::parse_csr(&order.spec.request)?;
                let state = client.finalize_order(&account, &details.url, &csr.der).await?;
                debug!(order = %order.metadata.name, %state, "Finalized order");
                updated.status.state = Some(state);
                if state == OrderState::Valid {
                    self.download(&account, &details.url, updated).await
                } else {
                    Ok(Action::backoff())
                }
            }
            OrderState::Processing => Ok(Action::backoff()),
            OrderState::Valid => self.download(&account, &details.url, updated).await,
            OrderState::Invalid | OrderState::Errored => {
                let reason = invalid_reason(&details);
                self.context.recorder.warning(&order.key(), "OrderInvalid", &reason);
                fail(&mut updated.status, OrderState::Invalid, reason);
                Ok(Action::await_change())
            }
        }
    }

    async fn download(&self, account: &AccountHandle, url: &str, updated: &mut Order) -> Result<Action, PassError> {
        match self.context.acme.client().download_certificate(account, url).await? {
            Some(chain) => {
                info!(order = %updated.metadata.name, "Downloaded certificate");
                updated.status.certificate = Some(chain);
                Ok(Action::await_change())
            }
            None => Ok(Action::backoff()),
        }
    }

    /// Make sure every open authorization has a Challenge, and fail the
    /// order if any of them cannot succeed any more.
    async fn sync_challenges(
        &self,
        order: &Order,
        config: &AcmeIssuer,
        details: &OrderDetails,
        updated: &mut Order,
    ) -> Result<Action, PassError> {
        let existing = self.challenges.list_owned(&order.key()).await?;
        let mut waiting = false;

        for (index, authorization) in details.authorizations.iter().enumerate() {
            if authorization.status == AuthorizationState::Valid {
                continue;
            }
            if authorization.status.is_failed() {
                let reason = authorization.error().map(str::to_string).unwrap_or_else(|| {
                    format!(
                        "authorization for {} is {}",
                        display_identifier(authorization),
                        authorization.status
                    )
                });
                fail(&mut updated.status, OrderState::Invalid, reason);
                return Ok(Action::await_change());
            }

            let name = challenge_name(&order.metadata.name, index);
            match existing.iter().find(|c| c.metadata.name == name) {
                Some(challenge) if challenge.status.state == Some(ChallengeState::Invalid) => {
                    fail(&mut updated.status, OrderState::Invalid, challenge.status.reason.clone());
                    return Ok(Action::await_change());
                }
                Some(challenge) => waiting |= !challenge.status.is_terminal(),
                None => {
                    self.create_challenge(order, config, authorization, &name).await?;
                    waiting = true;
                }
            }
        }

        // All challenges passed but the server has not moved the order on yet
        Ok(if waiting { Action::await_change() } else { Action::backoff() })
    }

    async fn create_challenge(
        &self,
        order: &Order,
        config: &AcmeIssuer,
        authorization: &AuthorizationDetails,
        name: &str,
    ) -> Result<(), PassError> {
        let (rule, challenge_type) = select_solver(&config.solvers, authorization, &order.metadata.labels)
            .ok_or_else(|| PassError::NoSolver(display_identifier(authorization)))?;
        let offered = authorization
            .challenge(challenge_type)
            .ok_or_else(|| PassError::NoSolver(display_identifier(authorization)))?;

        let mut metadata = ObjectMeta::new(order.metadata.namespace.clone(), name)
            .with_owner(order.key())
            .with_labels(order.metadata.labels.clone());
        metadata.finalizers.push(ACME_FINALIZER.to_string());

        let challenge = Challenge {
            metadata,
            spec: ChallengeSpec {
                url: offered.url.clone(),
                authorization_url: authorization.url.clone(),
                order_url: order.status.url.clone().unwrap_or_else(|| authorization.url.clone()),
                dns_name: authorization.identifier.clone(),
                wildcard: authorization.wildcard,
                type_: challenge_type,
                token: offered.token.clone(),
                key: offered.key_authorization.clone(),
                solver: rule.clone(),
                issuer_ref: order.spec.issuer_ref.clone(),
            },
            status: Default::default(),
        };

        match self.challenges.create(&challenge).await {
            Ok(_) => {
                info!(order = %order.metadata.name, challenge = %name, %challenge_type, "Created challenge");
                Ok(())
            }
            Err(StoreError::AlreadyExists(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Reconciler for OrderController {
    fn kind(&self) -> &'static str {
        Order::KIND
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let Some(order) = self.orders.get_key(key).await? else {
            return Ok(Action::await_change());
        };
        if order.status.is_terminal() {
            self.release_challenges(&order).await?;
            return Ok(Action::await_change());
        }

        let mut updated = order.clone();
        let next = match self.step(&order, &mut updated).await {
            Ok(action) => Ok(action),
            Err(e) if e.class().is_retryable() => {
                warn!(order = %key, error = %e, "Order pass failed, will retry");
                Err(e.into())
            }
            Err(e) => {
                self.context.recorder.warning(key, e.reason(), &e.to_string());
                fail(&mut updated.status, OrderState::Errored, e.to_string());
                Ok(Action::await_change())
            }
        };

        self.context.status.write(&self.orders, &order, &updated).await?;
        next
    }
}
