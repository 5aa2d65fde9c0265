//! [`AcmeClient`] over `instant-acme`.

use async_trait::async_trait;
use dashmap::DashMap;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeStatus as AcmeChallengeStatus,
    ChallengeType as AcmeChallengeType, Identifier, NewAccount, NewOrder,
    OrderStatus as AcmeOrderStatus,
};
use std::time::Duration;
use tracing::{debug, info};

use super::client::{
    AccountHandle, AcmeClient, AcmeClientError, AuthorizationDetails, AuthorizationState,
    ChallengeDetails, OrderDetails, RATE_LIMITED_PROBLEM,
};
use crate::api::{ChallengeState, ChallengeType, OrderState};

/// Production ACME client. Accounts are cached by account URL so repeated
/// passes do not re-read credentials.
pub struct InstantAcmeClient {
    accounts: DashMap<String, Account>,
    rate_limit_backoff: Duration,
}

impl InstantAcmeClient {
    pub fn new(rate_limit_backoff: Duration) -> Self {
        Self {
            accounts: DashMap::new(),
            rate_limit_backoff,
        }
    }

    async fn account(&self, handle: &AccountHandle) -> Result<Account, AcmeClientError> {
        if let Some(account) = self.accounts.get(&handle.account_url) {
            return Ok(account.clone());
        }

        let credentials: AccountCredentials = serde_json::from_str(&handle.credentials)
            .map_err(|e| AcmeClientError::Rejected(format!("stored account credentials are unreadable: {e}")))?;
        let account = Account::from_credentials(credentials)
            .await
            .map_err(|e| self.map_error(e))?;
        self.accounts.insert(handle.account_url.clone(), account.clone());
        Ok(account)
    }

    fn map_error(&self, error: instant_acme::Error) -> AcmeClientError {
        match error {
            instant_acme::Error::Api(problem) => {
                let detail = problem
                    .detail
                    .clone()
                    .unwrap_or_else(|| problem.r#type.clone().unwrap_or_default());
                if problem.r#type.as_deref() == Some(RATE_LIMITED_PROBLEM) {
                    AcmeClientError::RateLimited {
                        detail,
                        retry_after: Some(self.rate_limit_backoff),
                    }
                } else if problem.status.is_some_and(|s| s >= 500) {
                    AcmeClientError::Transient(detail)
                } else {
                    AcmeClientError::Rejected(detail)
                }
            }
            other => AcmeClientError::Transient(other.to_string()),
        }
    }

    async fn order_details(
        &self,
        order: &mut instant_acme::Order,
    ) -> Result<OrderDetails, AcmeClientError> {
        let url = order.url().to_string();
        let authorization_urls = order.state().authorizations.clone();
        let authorizations = order.authorizations().await.map_err(|e| self.map_error(e))?;

        let state = order.state();
        let status = order_state(state.status);
        let finalize_url = state.finalize.clone();
        let certificate_url = state.certificate.clone();
        let error = state.error.as_ref().and_then(|p| p.detail.clone());

        let mut details = Vec::with_capacity(authorizations.len());
        for (authz_url, authz) in authorization_urls.into_iter().zip(authorizations.iter()) {
            let Identifier::Dns(identifier) = &authz.identifier;
            let challenges: Vec<ChallengeDetails> = authz
                .challenges
                .iter()
                .filter_map(|c| {
                    let challenge_type = match c.r#type {
                        AcmeChallengeType::Http01 => ChallengeType::Http01,
                        AcmeChallengeType::Dns01 => ChallengeType::Dns01,
                        _ => return None,
                    };
                    Some(ChallengeDetails {
                        challenge_type,
                        url: c.url.clone(),
                        token: c.token.clone(),
                        status: challenge_state(c.status),
                        key_authorization: order.key_authorization(c).as_str().to_string(),
                        error: c.error.as_ref().and_then(|p| p.detail.clone()),
                    })
                })
                .collect();
            // Wildcard authorizations only ever offer dns-01
            let wildcard = !challenges.is_empty()
                && challenges.iter().all(|c| c.challenge_type == ChallengeType::Dns01)
                && authz.challenges.iter().all(|c| c.r#type != AcmeChallengeType::Http01);

            details.push(AuthorizationDetails {
                url: authz_url,
                identifier: identifier.trim_start_matches("*.").to_string(),
                wildcard,
                status: authorization_state(authz.status),
                challenges,
            });
        }

        Ok(OrderDetails {
            url,
            status,
            finalize_url,
            certificate_url,
            authorizations: details,
            error,
        })
    }
}

fn order_state(status: AcmeOrderStatus) -> OrderState {
    match status {
        AcmeOrderStatus::Pending => OrderState::Pending,
        AcmeOrderStatus::Ready => OrderState::Ready,
        AcmeOrderStatus::Processing => OrderState::Processing,
        AcmeOrderStatus::Valid => OrderState::Valid,
        AcmeOrderStatus::Invalid => OrderState::Invalid,
    }
}

fn authorization_state(status: AuthorizationStatus) -> AuthorizationState {
    match status {
        AuthorizationStatus::Pending => AuthorizationState::Pending,
        AuthorizationStatus::Valid => AuthorizationState::Valid,
        AuthorizationStatus::Invalid => AuthorizationState::Invalid,
        AuthorizationStatus::Revoked => AuthorizationState::Revoked,
        AuthorizationStatus::Expired => AuthorizationState::Expired,
        #[allow(unreachable_patterns)]
        _ => AuthorizationState::Deactivated,
    }
}

fn challenge_state(status: AcmeChallengeStatus) -> ChallengeState {
    match status {
        AcmeChallengeStatus::Pending => ChallengeState::Pending,
        AcmeChallengeStatus::Processing => ChallengeState::Processing,
        AcmeChallengeStatus::Valid => ChallengeState::Valid,
        AcmeChallengeStatus::Invalid => ChallengeState::Invalid,
    }
}

#[async_trait]
impl AcmeClient for InstantAcmeClient {
    async fn register_account(
        &self,
        server_url: &str,
        email: Option<&str>,
        credentials: Option<&str>,
    ) -> Result<AccountHandle, AcmeClientError> {
        if let Some(credentials) = credentials {
            let parsed: AccountCredentials = serde_json::from_str(credentials)
                .map_err(|e| AcmeClientError::Rejected(format!("stored account credentials are unreadable: {e}")))?;
            let account = Account::from_credentials(parsed)
                .await
                .map_err(|e| self.map_error(e))?;
            let account_url = account.id().to_string();
            debug!(server = server_url, account = %account_url, "Reusing ACME account");
            self.accounts.insert(account_url.clone(), account);
            return Ok(AccountHandle {
                server_url: server_url.to_string(),
                account_url,
                credentials: credentials.to_string(),
            });
        }

        let contact = email.map(|e| format!("mailto:{e}"));
        let contact_refs: Vec<&str> = contact.iter().map(String::as_str).collect();
        let new_account = NewAccount {
            contact: &contact_refs,
            terms_of_service_agreed: true,
            only_return_existing: false,
        };

        let (account, created) = Account::create(&new_account, server_url, None)
            .await
            .map_err(|e| self.map_error(e))?;
        let credentials = serde_json::to_string(&created)
            .map_err(|e| AcmeClientError::Transient(format!("cannot serialize account credentials: {e}")))?;
        let account_url = account.id().to_string();
        info!(server = server_url, account = %account_url, "Registered ACME account");

        self.accounts.insert(account_url.clone(), account);
        Ok(AccountHandle {
            server_url: server_url.to_string(),
            account_url,
            credentials,
        })
    }

    async fn create_order(
        &self,
        account: &AccountHandle,
        identifiers: &[String],
    ) -> Result<OrderDetails, AcmeClientError> {
        let account = self.account(account).await?;
        let identifiers: Vec<Identifier> = identifiers.iter().map(|n| Identifier::Dns(n.clone())).collect();
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(|e| self.map_error(e))?;
        debug!(order = order.url(), "Created ACME order");
        self.order_details(&mut order).await
    }

    async fn get_order(
        &self,
        account: &AccountHandle,
        order_url: &str,
    ) -> Result<OrderDetails, AcmeClientError> {
        let account = self.account(account).await?;
        let mut order = account
            .order(order_url.to_string())
            .await
            .map_err(|e| self.map_error(e))?;
        self.order_details(&mut order).await
    }

    async fn accept_challenge(
        &self,
        account: &AccountHandle,
        order_url: &str,
        challenge_url: &str,
    ) -> Result<(), AcmeClientError> {
        let account = self.account(account).await?;
        let mut order = account
            .order(order_url.to_string())
            .await
            .map_err(|e| self.map_error(e))?;
        order
            .set_challenge_ready(challenge_url)
            .await
            .map_err(|e| self.map_error(e))
    }

    async fn finalize_order(
        &self,
        account: &AccountHandle,
        order_url: &str,
        csr_der: &[u8],
    ) -> Result<OrderState, AcmeClientError> {
        let account = self.account(account).await?;
        let mut order = account
            .order(order_url.to_string())
            .await
            .map_err(|e| self.map_error(e))?;
        order.finalize(csr_der).await.map_err(|e| self.map_error(e))?;
        Ok(order_state(order.state().status))
    }

    async fn download_certificate(
        &self,
        account: &AccountHandle,
        order_url: &str,
    ) -> Result<Option<String>, AcmeClientError> {
        let account = self.account(account).await?;
        let mut order = account
            .order(order_url.to_string())
            .await
            .map_err(|e| self.map_error(e))?;
        order.certificate().await.map_err(|e| self.map_error(e))
    }
}
