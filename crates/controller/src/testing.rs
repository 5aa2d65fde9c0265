//! In-process fakes for the ACME server and solvers, with call counters,
//! and a [`TestEnv`] that wires them into a full controller context.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use warden_common::ObjectKey;
use warden_config::Config;

use crate::acme::{
    AccountHandle, AcmeClient, AcmeClientError, AuthorizationDetails, AuthorizationState,
    ChallengeDetails, OrderDetails,
};
use crate::api::{
    AcmeIssuer, Certificate, CertificateRequest, Challenge, ChallengeState, ChallengeType, Issuer,
    IssuerSpec, ObjectMeta, Order, OrderState, Resource, Secret, SelfSignedIssuer, SolverRule,
};
use crate::controller::Reconciler;
use crate::controllers::{
    CertificateController, CertificateRequestController, ChallengeController, Context,
    IssuerController, OrderController,
};
use crate::events::MemoryRecorder;
use crate::pki::{self, SigningOptions};
use crate::solver::{Solver, SolverDispatcher, SolverError};
use crate::store::{Api, MemoryStore};

#[derive(Serialize, Deserialize)]
struct MockCredentials {
    server: String,
    account: String,
}

/// What the server decides once a challenge is accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Valid,
    Invalid(String),
}

struct MockOrder {
    details: OrderDetails,
    certificate: Option<String>,
}

#[derive(Default)]
struct MockState {
    next_id: u32,
    accounts: HashMap<String, String>,
    orders: HashMap<String, MockOrder>,
    calls: HashMap<&'static str, usize>,
}

/// A scripted ACME server.
pub struct MockAcmeClient {
    state: Mutex<MockState>,
    outcome: Mutex<ValidationOutcome>,
    rate_limited: AtomicBool,
    ca: (String, String),
}

impl MockAcmeClient {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            outcome: Mutex::new(ValidationOutcome::Valid),
            rate_limited: AtomicBool::new(false),
            ca: pki::test_ca("Mock ACME CA"),
        }
    }

    pub fn set_outcome(&self, outcome: ValidationOutcome) {
        *self.outcome.lock() = outcome;
    }

    /// Make order creation fail with a rate limit until reset.
    pub fn set_rate_limited(&self, limited: bool) {
        self.rate_limited.store(limited, Ordering::SeqCst);
    }

    /// Number of calls to `operation` so far.
    pub fn calls(&self, operation: &str) -> usize {
        self.state.lock().calls.get(operation).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.state.lock().calls.values().sum()
    }

    pub fn order_count(&self) -> usize {
        self.state.lock().orders.len()
    }

    fn count(state: &mut MockState, operation: &'static str) {
        *state.calls.entry(operation).or_default() += 1;
    }

    fn unknown_order(url: &str) -> AcmeClientError {
        AcmeClientError::Rejected(format!("order {url} does not exist"))
    }
}

fn refresh_order_state(order: &mut OrderDetails) {
    if order.status != OrderState::Pending {
        return;
    }
    if let Some(failed) = order.authorizations.iter().find(|a| a.status.is_failed()) {
        order.status = OrderState::Invalid;
        order.error = failed.error().map(str::to_string);
    } else if order
        .authorizations
        .iter()
        .all(|a| a.status == AuthorizationState::Valid)
    {
        order.status = OrderState::Ready;
    }
}

#[async_trait]
impl AcmeClient for MockAcmeClient {
    async fn register_account(
        &self,
        server_url: &str,
        _email: Option<&str>,
        credentials: Option<&str>,
    ) -> Result<AccountHandle, AcmeClientError> {
        let mut state = self.state.lock();
        Self::count(&mut state, "register_account");

        if let Some(credentials) = credentials {
            let stored: MockCredentials = serde_json::from_str(credentials)
                .map_err(|e| AcmeClientError::Rejected(format!("malformed credentials: {e}")))?;
            if state.accounts.get(credentials) != Some(&stored.account) {
                return Err(AcmeClientError::Rejected("account does not exist".to_string()));
            }
            return Ok(AccountHandle {
                server_url: stored.server,
                account_url: stored.account,
                credentials: credentials.to_string(),
            });
        }

        state.next_id += 1;
        let account = format!("{server_url}/acct/{}", state.next_id);
        let credentials = serde_json::to_string(&MockCredentials {
            server: server_url.to_string(),
            account: account.clone(),
        })
        .map_err(|e| AcmeClientError::Transient(e.to_string()))?;
        state.accounts.insert(credentials.clone(), account.clone());

        Ok(AccountHandle {
            server_url: server_url.to_string(),
            account_url: account,
            credentials,
        })
    }

    async fn create_order(
        &self,
        account: &AccountHandle,
        identifiers: &[String],
    ) -> Result<OrderDetails, AcmeClientError> {
        let mut state = self.state.lock();
        Self::count(&mut state, "create_order");
        if self.rate_limited.load(Ordering::SeqCst) {
            return Err(AcmeClientError::RateLimited {
                detail: "too many new orders recently".to_string(),
                retry_after: Some(Duration::from_secs(60)),
            });
        }

        state.next_id += 1;
        let url = format!("{}/order/{}", account.server_url, state.next_id);
        let authorizations = identifiers
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let wildcard = name.starts_with("*.");
                let authz_url = format!("{url}/authz/{i}");
                let token = format!("token-{}-{i}", state.next_id);
                let mut types = vec![ChallengeType::Dns01];
                if !wildcard {
                    types.insert(0, ChallengeType::Http01);
                }
                AuthorizationDetails {
                    identifier: name.trim_start_matches("*.").to_string(),
                    wildcard,
                    status: AuthorizationState::Pending,
                    challenges: types
                        .into_iter()
                        .map(|challenge_type| ChallengeDetails {
                            challenge_type,
                            url: format!("{authz_url}/{challenge_type}"),
                            token: token.clone(),
                            status: ChallengeState::Pending,
                            key_authorization: format!("{token}.thumbprint"),
                            error: None,
                        })
                        .collect(),
                    url: authz_url,
                }
            })
            .collect();

        let details = OrderDetails {
            finalize_url: format!("{url}/finalize"),
            url: url.clone(),
            status: OrderState::Pending,
            certificate_url: None,
            authorizations,
            error: None,
        };
        state.orders.insert(
            url,
            MockOrder {
                details: details.clone(),
                certificate: None,
            },
        );
        Ok(details)
    }

    async fn get_order(
        &self,
        _account: &AccountHandle,
        order_url: &str,
    ) -> Result<OrderDetails, AcmeClientError> {
        let mut state = self.state.lock();
        Self::count(&mut state, "get_order");
        state
            .orders
            .get(order_url)
            .map(|o| o.details.clone())
            .ok_or_else(|| Self::unknown_order(order_url))
    }

    async fn accept_challenge(
        &self,
        _account: &AccountHandle,
        order_url: &str,
        challenge_url: &str,
    ) -> Result<(), AcmeClientError> {
        let outcome = self.outcome.lock().clone();
        let mut state = self.state.lock();
        Self::count(&mut state, "accept_challenge");
        let order = state
            .orders
            .get_mut(order_url)
            .ok_or_else(|| Self::unknown_order(order_url))?;

        let authorization = order
            .details
            .authorizations
            .iter_mut()
            .find(|a| a.challenges.iter().any(|c| c.url == challenge_url))
            .ok_or_else(|| AcmeClientError::Rejected(format!("challenge {challenge_url} does not exist")))?;
        for challenge in authorization.challenges.iter_mut().filter(|c| c.url == challenge_url) {
            match &outcome {
                ValidationOutcome::Valid => challenge.status = ChallengeState::Valid,
                ValidationOutcome::Invalid(detail) => {
                    challenge.status = ChallengeState::Invalid;
                    challenge.error = Some(detail.clone());
                }
            }
        }
        authorization.status = match outcome {
            ValidationOutcome::Valid => AuthorizationState::Valid,
            ValidationOutcome::Invalid(_) => AuthorizationState::Invalid,
        };

        refresh_order_state(&mut order.details);
        Ok(())
    }

    async fn finalize_order(
        &self,
        _account: &AccountHandle,
        order_url: &str,
        csr_der: &[u8],
    ) -> Result<OrderState, AcmeClientError> {
        let mut state = self.state.lock();
        Self::count(&mut state, "finalize_order");
        let order = state
            .orders
            .get_mut(order_url)
            .ok_or_else(|| Self::unknown_order(order_url))?;
        if order.details.status != OrderState::Ready {
            return Err(AcmeClientError::Rejected("order is not ready".to_string()));
        }

        let csr = pem::encode(&pem::Pem::new("CERTIFICATE REQUEST", csr_der.to_vec()));
        let options = SigningOptions::new(None, &[], false)
            .map_err(|e| AcmeClientError::Transient(e.to_string()))?;
        let certificate = pki::sign_with_ca(&csr, &self.ca.0, &self.ca.1, &options)
            .map_err(|e| AcmeClientError::Rejected(e.to_string()))?;

        order.certificate = Some(format!("{}\n{}", certificate.trim_end(), self.ca.0));
        order.details.status = OrderState::Valid;
        order.details.certificate_url = Some(format!("{order_url}/cert"));
        Ok(OrderState::Valid)
    }

    async fn download_certificate(
        &self,
        _account: &AccountHandle,
        order_url: &str,
    ) -> Result<Option<String>, AcmeClientError> {
        let mut state = self.state.lock();
        Self::count(&mut state, "download_certificate");
        state
            .orders
            .get(order_url)
            .map(|o| o.certificate.clone())
            .ok_or_else(|| Self::unknown_order(order_url))
    }
}

/// A solver that records its calls. Presented artifacts are tracked per
/// challenge, and the self-check fails for any artifact that is not live.
#[derive(Default)]
pub struct MockSolver {
    presents: AtomicUsize,
    checks: AtomicUsize,
    cleanups: AtomicUsize,
    failing_check: AtomicBool,
    failing_cleanup: AtomicBool,
    artifacts: Mutex<HashSet<String>>,
    store: Option<Arc<MemoryStore>>,
    presented_at_cleanup: Mutex<Vec<bool>>,
}

impl MockSolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Solver that reads the stored Challenge when cleaning up.
    pub fn observing(store: Arc<MemoryStore>) -> Self {
        Self {
            store: Some(store),
            ..Self::default()
        }
    }

    pub fn set_check_passes(&self, passes: bool) {
        self.failing_check.store(!passes, Ordering::SeqCst);
    }

    pub fn set_cleanup_fails(&self, fails: bool) {
        self.failing_cleanup.store(fails, Ordering::SeqCst);
    }

    /// Drop every artifact behind the controller's back.
    pub fn lose_artifacts(&self) {
        self.artifacts.lock().clear();
    }

    pub fn live_artifacts(&self) -> usize {
        self.artifacts.lock().len()
    }

    pub fn presents(&self) -> usize {
        self.presents.load(Ordering::SeqCst)
    }

    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }

    pub fn cleanups(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }

    /// Stored `status.presented` seen by each cleanup call.
    pub fn presented_at_cleanup(&self) -> Vec<bool> {
        self.presented_at_cleanup.lock().clone()
    }
}

#[async_trait]
impl Solver for MockSolver {
    async fn present(&self, challenge: &Challenge) -> Result<(), SolverError> {
        self.presents.fetch_add(1, Ordering::SeqCst);
        self.artifacts.lock().insert(challenge.spec.url.clone());
        Ok(())
    }

    async fn check(&self, challenge: &Challenge) -> Result<(), SolverError> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        if self.failing_check.load(Ordering::SeqCst) {
            return Err(SolverError::NotPropagated(format!(
                "{} not reachable yet",
                challenge.spec.dns_name
            )));
        }
        if !self.artifacts.lock().contains(&challenge.spec.url) {
            return Err(SolverError::NotPropagated(format!(
                "no artifact served for {}",
                challenge.spec.dns_name
            )));
        }
        Ok(())
    }

    async fn cleanup(&self, challenge: &Challenge) -> Result<(), SolverError> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        if let Some(store) = &self.store {
            if let Ok(Some(stored)) = Api::<Challenge>::new(store.clone()).get_key(&challenge.key()).await {
                self.presented_at_cleanup.lock().push(stored.status.presented);
            }
        }
        if self.failing_cleanup.load(Ordering::SeqCst) {
            return Err(SolverError::Provision("solver backend unavailable".to_string()));
        }
        self.artifacts.lock().remove(&challenge.spec.url);
        Ok(())
    }
}

// ============================================================================
// Test environment
// ============================================================================

/// Passes run by [`TestEnv::settle`], in this order each round.
const SETTLE_KINDS: [&str; 4] = [
    Certificate::KIND,
    CertificateRequest::KIND,
    Order::KIND,
    Challenge::KIND,
];

const SETTLE_ROUNDS: usize = 8;

/// Memory store, scripted ACME server and recording solver behind a real
/// [`Context`]. Passes are driven by hand, so scenarios are deterministic.
pub struct TestEnv {
    pub store: Arc<MemoryStore>,
    pub acme: Arc<MockAcmeClient>,
    pub solver: Arc<MockSolver>,
    pub recorder: Arc<MemoryRecorder>,
    pub context: Arc<Context>,
}

impl TestEnv {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let acme = Arc::new(MockAcmeClient::new());
        let solver = Arc::new(MockSolver::observing(store.clone()));
        let recorder = Arc::new(MemoryRecorder::new());
        let solvers = SolverDispatcher::new()
            .with_http01(solver.clone())
            .with_dns01(solver.clone());
        let context = Arc::new(Context::new(
            store.clone(),
            acme.clone(),
            solvers,
            recorder.clone(),
            &Config::default(),
        ));
        Self {
            store,
            acme,
            solver,
            recorder,
            context,
        }
    }

    pub fn issuers(&self) -> Api<Issuer> {
        Api::new(self.store.clone())
    }

    pub fn certificates(&self) -> Api<Certificate> {
        Api::new(self.store.clone())
    }

    pub fn requests(&self) -> Api<CertificateRequest> {
        Api::new(self.store.clone())
    }

    pub fn orders(&self) -> Api<Order> {
        Api::new(self.store.clone())
    }

    pub fn challenges(&self) -> Api<Challenge> {
        Api::new(self.store.clone())
    }

    pub fn secrets(&self) -> Api<Secret> {
        Api::new(self.store.clone())
    }

    async fn ready_issuer(&self, name: &str, spec: IssuerSpec) {
        let issuer = self
            .issuers()
            .create(&Issuer {
                metadata: ObjectMeta::new("default", name),
                spec,
                status: Default::default(),
            })
            .await
            .unwrap();
        IssuerController::new(self.context.clone())
            .reconcile(&issuer.key())
            .await
            .unwrap();
    }

    pub async fn ready_self_signed_issuer(&self, name: &str) {
        self.ready_issuer(name, IssuerSpec::SelfSigned(SelfSignedIssuer {}))
            .await;
    }

    /// ACME issuer with a single default HTTP-01 rule.
    pub async fn ready_acme_issuer(&self, name: &str) {
        let rule = SolverRule {
            http01: Some(Default::default()),
            ..Default::default()
        };
        self.ready_acme_issuer_with(name, vec![rule]).await;
    }

    pub async fn ready_acme_issuer_with(&self, name: &str, solvers: Vec<SolverRule>) {
        let spec = IssuerSpec::Acme(AcmeIssuer {
            server: "https://acme.test/directory".to_string(),
            email: Some("ops@example.com".to_string()),
            private_key_secret_name: format!("{name}-account"),
            solvers,
        });
        self.ready_issuer(name, spec).await;
    }

    async fn keys<K: Resource>(&self) -> Vec<ObjectKey> {
        Api::<K>::new(self.store.clone())
            .list(None)
            .await
            .unwrap()
            .iter()
            .map(Resource::key)
            .collect()
    }

    /// One pass over every object of `kind`. Pass errors are ignored.
    pub async fn reconcile_all(&self, kind: &str) {
        let context = self.context.clone();
        let (reconciler, keys): (Arc<dyn Reconciler>, Vec<ObjectKey>) = if kind == Issuer::KIND {
            (Arc::new(IssuerController::new(context)), self.keys::<Issuer>().await)
        } else if kind == Certificate::KIND {
            (Arc::new(CertificateController::new(context)), self.keys::<Certificate>().await)
        } else if kind == CertificateRequest::KIND {
            (
                Arc::new(CertificateRequestController::new(context)),
                self.keys::<CertificateRequest>().await,
            )
        } else if kind == Order::KIND {
            (Arc::new(OrderController::new(context)), self.keys::<Order>().await)
        } else if kind == Challenge::KIND {
            (Arc::new(ChallengeController::new(context)), self.keys::<Challenge>().await)
        } else {
            panic!("no reconciler for {kind}");
        };

        for key in keys {
            let _ = reconciler.reconcile(&key).await;
        }
    }

    /// Run a fixed number of rounds over everything but issuers, which
    /// the `ready_*` helpers already set up.
    pub async fn settle(&self) {
        for _ in 0..SETTLE_ROUNDS {
            for kind in SETTLE_KINDS {
                self.reconcile_all(kind).await;
            }
        }
    }
}
