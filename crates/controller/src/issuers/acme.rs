//! ACME backend.
//!
//! Setup registers (or re-opens) the issuer's account and stores the
//! credentials in the issuer's key secret. Signing does not talk to the
//! ACME server at all: it makes sure one Order exists for the request and
//! reports that Order's progress. The Order and Challenge controllers drive
//! the protocol through [`AcmeBackend::account`] and [`AcmeBackend::client`].

use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, warn};

use warden_common::{set_condition, ConditionStatus, ObjectKey};

use super::{secret_field, IssuerBackend, IssuerError, SignOutcome};
use crate::acme::{AccountHandle, AcmeClient};
use crate::api::{
    AcmeIssuer, AcmeIssuerStatus, CertificateRequest, Issuer, IssuerSpec, IssuerType, ObjectMeta,
    Order, OrderSpec, OrderState, Resource, Secret, ACME_CREDENTIALS_KEY, CONDITION_READY,
    REASON_FAILED, REASON_PENDING,
};
use crate::pki;
use crate::store::{Api, ResourceStore, StoreError};

const REASON_ACCOUNT_REGISTERED: &str = "ACMEAccountRegistered";
const REASON_REGISTER_FAILED: &str = "ErrRegisterACMEAccount";

/// Order name for a request: stable for a given CSR, so a request never
/// gets a second Order.
pub fn order_name(request_name: &str, csr_pem: &str) -> String {
    let digest = Sha256::digest(csr_pem.as_bytes());
    let hash: String = digest[..4].iter().map(|b| format!("{b:02x}")).collect();
    format!("{request_name}-{hash}")
}

pub(crate) fn acme_config(issuer: &Issuer) -> Result<&AcmeIssuer, IssuerError> {
    match &issuer.spec {
        IssuerSpec::Acme(acme) => Ok(acme),
        other => Err(IssuerError::UnknownIssuerKind(other.issuer_type().to_string())),
    }
}

pub struct AcmeBackend {
    client: Arc<dyn AcmeClient>,
    secrets: Api<Secret>,
    orders: Api<Order>,
    accounts: DashMap<ObjectKey, AccountHandle>,
}

impl AcmeBackend {
    pub fn new(store: Arc<dyn ResourceStore>, client: Arc<dyn AcmeClient>) -> Self {
        Self {
            client,
            secrets: Api::new(Arc::clone(&store)),
            orders: Api::new(store),
            accounts: DashMap::new(),
        }
    }

    pub fn client(&self) -> &dyn AcmeClient {
        self.client.as_ref()
    }

    /// Drop the cached account of a deleted issuer.
    pub fn forget(&self, issuer: &ObjectKey) {
        self.accounts.remove(issuer);
    }

    /// Account of a ready ACME issuer.
    ///
    /// Served from the cache when possible; otherwise re-opened from the
    /// stored credentials. Never creates an account.
    pub async fn account(&self, issuer: &Issuer) -> Result<AccountHandle, IssuerError> {
        let config = acme_config(issuer)?;
        let key = issuer.key();
        if let Some(handle) = self.accounts.get(&key) {
            if handle.server_url == config.server {
                return Ok(handle.clone());
            }
        }

        let credentials = secret_field(
            &self.secrets,
            &issuer.metadata.namespace,
            &config.private_key_secret_name,
            ACME_CREDENTIALS_KEY,
        )
        .await
        .map_err(|e| match e {
            IssuerError::SecretNotFound(_) | IssuerError::SecretField { .. } => {
                IssuerError::IssuerNotReady(key.clone())
            }
            other => other,
        })?;

        let handle = self
            .client
            .register_account(&config.server, config.email.as_deref(), Some(&credentials))
            .await?;
        self.accounts.insert(key, handle.clone());
        Ok(handle)
    }

    async fn stored_credentials(&self, issuer: &Issuer, config: &AcmeIssuer) -> Result<Option<String>, IssuerError> {
        match secret_field(
            &self.secrets,
            &issuer.metadata.namespace,
            &config.private_key_secret_name,
            ACME_CREDENTIALS_KEY,
        )
        .await
        {
            Ok(credentials) => Ok(Some(credentials)),
            Err(IssuerError::SecretNotFound(_)) | Err(IssuerError::SecretField { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn persist_credentials(&self, namespace: &str, name: &str, credentials: &str) -> Result<(), StoreError> {
        match self.secrets.get(namespace, name).await? {
            Some(mut secret) => {
                secret
                    .data
                    .insert(ACME_CREDENTIALS_KEY.to_string(), credentials.to_string());
                self.secrets.update(&secret).await?;
            }
            None => {
                let secret = Secret::new(ObjectMeta::new(namespace, name)).with(ACME_CREDENTIALS_KEY, credentials);
                self.secrets.create(&secret).await?;
            }
        }
        Ok(())
    }

    /// Re-open the stored account, or register a new one and store it.
    async fn register(&self, issuer: &Issuer, config: &AcmeIssuer) -> Result<AccountHandle, IssuerError> {
        let stored = self.stored_credentials(issuer, config).await?;

        if let Some(credentials) = &stored {
            let handle = self
                .client
                .register_account(&config.server, config.email.as_deref(), Some(credentials))
                .await?;
            if handle.server_url == config.server {
                return Ok(handle);
            }
            info!(
                issuer = %issuer.metadata.name,
                from = %handle.server_url,
                to = %config.server,
                "ACME server changed, registering a new account"
            );
        }

        let handle = self
            .client
            .register_account(&config.server, config.email.as_deref(), None)
            .await?;
        self.persist_credentials(
            &issuer.metadata.namespace,
            &config.private_key_secret_name,
            &handle.credentials,
        )
        .await?;
        info!(issuer = %issuer.metadata.name, account = %handle.account_url, "Registered ACME account");
        Ok(handle)
    }
}

#[async_trait]
impl IssuerBackend for AcmeBackend {
    fn issuer_type(&self) -> IssuerType {
        IssuerType::Acme
    }

    async fn setup(&self, issuer: &mut Issuer) -> Result<(), IssuerError> {
        let config = acme_config(issuer)?.clone();

        match self.register(issuer, &config).await {
            Ok(handle) => {
                issuer.status.acme = Some(AcmeIssuerStatus {
                    uri: handle.account_url.clone(),
                    last_registered_email: config.email.clone(),
                });
                set_condition(
                    &mut issuer.status.conditions,
                    CONDITION_READY,
                    ConditionStatus::True,
                    REASON_ACCOUNT_REGISTERED,
                    "The ACME account was registered with the ACME server",
                );
                self.accounts.insert(issuer.key(), handle);
                Ok(())
            }
            Err(e) => {
                warn!(issuer = %issuer.metadata.name, server = %config.server, error = %e, "ACME account registration failed");
                self.accounts.remove(&issuer.key());
                set_condition(
                    &mut issuer.status.conditions,
                    CONDITION_READY,
                    ConditionStatus::False,
                    REASON_REGISTER_FAILED,
                    format!("Failed to register ACME account: {e}"),
                );
                Err(e)
            }
        }
    }

    async fn sign(&self, issuer: &Issuer, request: &CertificateRequest) -> Result<SignOutcome, IssuerError> {
        let csr = pki::parse_csr(&request.spec.request)?;
        let namespace = &request.metadata.namespace;
        let name = order_name(&request.metadata.name, &request.spec.request);

        let order = match self.orders.get(namespace, &name).await? {
            Some(order) => order,
            None => {
                let order = Order {
                    metadata: ObjectMeta::new(namespace.clone(), name.clone())
                        .with_owner(request.key())
                        .with_labels(request.metadata.labels.clone()),
                    spec: OrderSpec {
                        request: request.spec.request.clone(),
                        dns_names: csr.identifiers(),
                        issuer_ref: request.spec.issuer_ref.clone(),
                        duration_seconds: request.spec.duration_seconds,
                    },
                    status: Default::default(),
                };
                match self.orders.create(&order).await {
                    Ok(created) => {
                        debug!(order = %name, issuer = %issuer.metadata.name, "Created Order");
                        created
                    }
                    Err(StoreError::AlreadyExists(key)) => self
                        .orders
                        .get_key(&key)
                        .await?
                        .ok_or(StoreError::NotFound(key))?,
                    Err(e) => return Err(e.into()),
                }
            }
        };

        Ok(order_outcome(&order))
    }
}

/// What an Order's status means for the request it serves.
fn order_outcome(order: &Order) -> SignOutcome {
    let name = &order.metadata.name;
    match (order.status.state, &order.status.certificate) {
        (Some(OrderState::Valid), Some(certificate)) => SignOutcome::Issued {
            certificate: certificate.clone(),
            ca: None,
        },
        (Some(state), _) if state.is_failed() => SignOutcome::Failed {
            reason: REASON_FAILED.to_string(),
            message: format!(
                "Failed to wait for order resource {name} to become ready: order is in {state} state: {}",
                order.status.reason
            ),
        },
        (state, _) => SignOutcome::Pending {
            reason: REASON_PENDING.to_string(),
            message: format!(
                "Waiting on certificate issuance from order {name}: {}",
                state.map(|s| s.to_string()).unwrap_or_default()
            ),
            requeue: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::CertificateRequestSpec;
    use crate::store::MemoryStore;
    use crate::testing::MockAcmeClient;
    use warden_common::{find_condition, is_condition_true, IssuerRef};

    fn issuer(server: &str) -> Issuer {
        Issuer {
            metadata: ObjectMeta::new("default", "le"),
            spec: IssuerSpec::Acme(AcmeIssuer {
                server: server.to_string(),
                email: Some("ops@example.com".to_string()),
                private_key_secret_name: "le-account".to_string(),
                solvers: Vec::new(),
            }),
            status: Default::default(),
        }
    }

    fn request(csr: &str) -> CertificateRequest {
        CertificateRequest {
            metadata: ObjectMeta::new("default", "web-1"),
            spec: CertificateRequestSpec {
                request: csr.to_string(),
                duration_seconds: None,
                usages: Vec::new(),
                issuer_ref: IssuerRef::issuer("le"),
                is_ca: false,
            },
            status: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_setup_registers_and_persists_account() {
        let store = Arc::new(MemoryStore::new());
        let client = Arc::new(MockAcmeClient::new());
        let backend = AcmeBackend::new(store.clone(), client.clone());

        let mut issuer = issuer("https://acme.test/directory");
        backend.setup(&mut issuer).await.unwrap();

        assert!(is_condition_true(&issuer.status.conditions, CONDITION_READY));
        let uri = issuer.status.acme.as_ref().unwrap().uri.clone();
        let secret = Api::<Secret>::new(store).get("default", "le-account").await.unwrap().unwrap();
        assert!(secret.get(ACME_CREDENTIALS_KEY).is_some());
        assert_eq!(client.calls("register_account"), 1);
        assert!(uri.starts_with("https://acme.test/directory/acct/"));
    }

    #[tokio::test]
    async fn test_reregistration_returns_same_account() {
        let store = Arc::new(MemoryStore::new());
        let client = Arc::new(MockAcmeClient::new());

        let mut first = issuer("https://acme.test/directory");
        AcmeBackend::new(store.clone(), client.clone())
            .setup(&mut first)
            .await
            .unwrap();

        // A fresh backend (e.g. after a restart) finds the stored credentials
        let mut second = issuer("https://acme.test/directory");
        AcmeBackend::new(store.clone(), client.clone())
            .setup(&mut second)
            .await
            .unwrap();

        assert_eq!(first.status.acme, second.status.acme);
        assert!(is_condition_true(&second.status.conditions, CONDITION_READY));
        assert_eq!(client.calls("register_account"), 2);
    }

    #[tokio::test]
    async fn test_unusable_credentials_fail_setup() {
        let store = Arc::new(MemoryStore::new());
        Api::<Secret>::new(store.clone())
            .create(&Secret::new(ObjectMeta::new("default", "le-account")).with(ACME_CREDENTIALS_KEY, "{}"))
            .await
            .unwrap();
        let backend = AcmeBackend::new(store, Arc::new(MockAcmeClient::new()));

        let mut issuer = issuer("https://acme.test/directory");
        assert!(backend.setup(&mut issuer).await.is_err());
        let ready = find_condition(&issuer.status.conditions, CONDITION_READY).unwrap();
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason, REASON_REGISTER_FAILED);
    }

    #[tokio::test]
    async fn test_sign_creates_one_order_per_request() {
        let store = Arc::new(MemoryStore::new());
        let backend = AcmeBackend::new(store.clone(), Arc::new(MockAcmeClient::new()));
        let (csr, _) = pki::test_csr(&["www.example.com", "example.com"]);
        let request = request(&csr);
        let issuer = issuer("https://acme.test/directory");

        for _ in 0..3 {
            let outcome = backend.sign(&issuer, &request).await.unwrap();
            assert!(matches!(outcome, SignOutcome::Pending { requeue: None, .. }));
        }

        let orders = Api::<Order>::new(store).list(Some("default")).await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].metadata.name, order_name("web-1", &csr));
        assert_eq!(orders[0].metadata.owner, Some(request.key()));
        assert_eq!(orders[0].spec.dns_names, vec!["example.com", "www.example.com"]);
    }

    #[test]
    fn test_order_outcome_mapping() {
        let mut order = Order {
            metadata: ObjectMeta::new("default", "web-1-abcd0123"),
            spec: OrderSpec {
                request: String::new(),
                dns_names: vec!["example.com".to_string()],
                issuer_ref: IssuerRef::issuer("le"),
                duration_seconds: None,
            },
            status: Default::default(),
        };

        order.status.state = Some(OrderState::Valid);
        assert!(matches!(order_outcome(&order), SignOutcome::Pending { .. }));

        order.status.certificate = Some("CHAIN".to_string());
        assert_eq!(
            order_outcome(&order),
            SignOutcome::Issued {
                certificate: "CHAIN".to_string(),
                ca: None
            }
        );

        order.status.state = Some(OrderState::Invalid);
        order.status.reason = "urn:ietf:params:acme:error:unauthorized".to_string();
        let SignOutcome::Failed { message, .. } = order_outcome(&order) else {
            panic!("expected failure");
        };
        assert!(message.ends_with("order is in invalid state: urn:ietf:params:acme:error:unauthorized"));
    }

    #[test]
    fn test_order_name_is_stable() {
        assert_eq!(order_name("web-1", "csr"), order_name("web-1", "csr"));
        assert_ne!(order_name("web-1", "csr"), order_name("web-1", "other"));
        assert_eq!(order_name("web-1", "csr").len(), "web-1-".len() + 8);
    }
}
