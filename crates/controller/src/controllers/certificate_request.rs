//! CertificateRequest reconciler.
//!
//! Resolves the request's issuer, asks its backend to sign, and records the
//! outcome. Issued, failed and denied requests are final: they are never
//! handed to a backend again.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};

use warden_common::{set_condition, Classify, ConditionStatus, ErrorClass, ObjectKey};

use super::{Context, PassError};
use crate::api::{
    CertificateRequest, Resource, CONDITION_DENIED, CONDITION_READY, REASON_DENIED, REASON_FAILED,
    REASON_ISSUED, REASON_PENDING,
};
use crate::controller::{Action, ReconcileError, Reconciler};
use crate::issuers::{IssuerError, SignOutcome};
use crate::store::Api;

pub struct CertificateRequestController {
    context: Arc<Context>,
    requests: Api<CertificateRequest>,
}

impl CertificateRequestController {
    pub fn new(context: Arc<Context>) -> Self {
        let requests = Api::new(Arc::clone(&context.store));
        Self { context, requests }
    }

    async fn sign(&self, request: &CertificateRequest) -> Result<SignOutcome, IssuerError> {
        let (issuer, backend) = self
            .context
            .registry
            .resolve(&request.metadata.namespace, &request.spec.issuer_ref)
            .await?;
        debug!(issuer = %issuer.metadata.name, issuer_type = %backend.issuer_type(), "Signing request");
        backend.sign(&issuer, request).await
    }
}

fn fail(request: &mut CertificateRequest, reason: &str, message: &str) {
    let status = &mut request.status;
    set_condition(
        &mut status.conditions,
        CONDITION_READY,
        ConditionStatus::False,
        reason,
        message,
    );
    if status.failure_time.is_none() {
        status.failure_time = Some(Utc::now());
    }
}

#[async_trait]
impl Reconciler for CertificateRequestController {
    fn kind(&self) -> &'static str {
        CertificateRequest::KIND
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let Some(request) = self.requests.get_key(key).await? else {
            return Ok(Action::await_change());
        };
        if request.is_terminal() {
            return Ok(Action::await_change());
        }

        let recorder = &self.context.recorder;
        let mut updated = request.clone();

        let next = match self.sign(&request).await {
            Ok(SignOutcome::Issued { certificate, ca }) => {
                updated.status.certificate = Some(certificate);
                updated.status.ca = ca;
                set_condition(
                    &mut updated.status.conditions,
                    CONDITION_READY,
                    ConditionStatus::True,
                    REASON_ISSUED,
                    "Certificate fetched from issuer successfully",
                );
                info!(request = %key, "Certificate issued");
                recorder.normal(key, "CertificateIssued", "Certificate fetched from issuer successfully");
                Ok(Action::await_change())
            }
            Ok(SignOutcome::Pending { reason, message, requeue }) => {
                set_condition(
                    &mut updated.status.conditions,
                    CONDITION_READY,
                    ConditionStatus::False,
                    &reason,
                    message,
                );
                Ok(requeue.map_or(Action::await_change(), Action::requeue))
            }
            Ok(SignOutcome::Failed { reason, message }) => {
                recorder.warning(key, &reason, &message);
                fail(&mut updated, &reason, &message);
                Ok(Action::await_change())
            }
            Err(e) => {
                recorder.warning(key, e.reason(), &e.to_string());
                match e.class() {
                    ErrorClass::Transient => {
                        set_condition(
                            &mut updated.status.conditions,
                            CONDITION_READY,
                            ConditionStatus::False,
                            REASON_PENDING,
                            e.to_string(),
                        );
                        updated.status.retry_count += 1;
                        Err(PassError::from(e).into())
                    }
                    _ if matches!(e, IssuerError::Denied(_)) => {
                        set_condition(
                            &mut updated.status.conditions,
                            CONDITION_DENIED,
                            ConditionStatus::True,
                            REASON_DENIED,
                            e.to_string(),
                        );
                        fail(&mut updated, REASON_DENIED, &e.to_string());
                        Ok(Action::await_change())
                    }
                    _ => {
                        fail(&mut updated, REASON_FAILED, &e.to_string());
                        Ok(Action::await_change())
                    }
                }
            }
        };

        self.context.status.write(&self.requests, &request, &updated).await?;
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{
        CertificateRequestSpec, ObjectMeta, Secret, PRIVATE_KEY_SECRET_ANNOTATION, TLS_PRIVATE_KEY,
    };
    use crate::pki;
    use crate::testing::{TestEnv, ValidationOutcome};
    use warden_common::{find_condition, IssuerRef};

    fn request(name: &str, csr: &str, issuer: &str) -> CertificateRequest {
        CertificateRequest {
            metadata: ObjectMeta::new("default", name),
            spec: CertificateRequestSpec {
                request: csr.to_string(),
                duration_seconds: None,
                usages: Vec::new(),
                issuer_ref: IssuerRef::issuer(issuer),
                is_ca: false,
            },
            status: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_missing_issuer_stays_pending_and_retries() {
        let env = TestEnv::new();
        let (csr, _) = pki::test_csr(&["example.com"]);
        let created = env.requests().create(&request("web-1", &csr, "nowhere")).await.unwrap();
        let controller = CertificateRequestController::new(env.context.clone());

        assert!(controller.reconcile(&created.key()).await.is_err());
        let stored = env.requests().get_key(&created.key()).await.unwrap().unwrap();
        assert_eq!(stored.ready_reason(), Some(REASON_PENDING));
        assert_eq!(stored.status.retry_count, 1);
        assert_eq!(env.recorder.with_reason("IssuerNotFound").len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_issuer_group_fails_once() {
        let env = TestEnv::new();
        let (csr, _) = pki::test_csr(&["example.com"]);
        let mut foreign = request("web-1", &csr, "x");
        foreign.spec.issuer_ref.group = "example.org".to_string();
        let created = env.requests().create(&foreign).await.unwrap();
        let controller = CertificateRequestController::new(env.context.clone());

        assert_eq!(controller.reconcile(&created.key()).await.unwrap(), Action::AwaitChange);
        let writes = env.store.status_writes();
        controller.reconcile(&created.key()).await.unwrap();
        assert_eq!(env.store.status_writes(), writes);

        let stored = env.requests().get_key(&created.key()).await.unwrap().unwrap();
        assert!(stored.is_failed());
        assert!(stored.status.failure_time.is_some());
    }

    #[tokio::test]
    async fn test_self_signed_request_is_issued() {
        let env = TestEnv::new();
        env.ready_self_signed_issuer("selfsigned").await;
        let (csr, key) = pki::test_csr(&["self.example.com"]);
        Api::<Secret>::new(env.store.clone())
            .create(&Secret::new(ObjectMeta::new("default", "web-key")).with(TLS_PRIVATE_KEY, key))
            .await
            .unwrap();

        let mut signed = request("web-1", &csr, "selfsigned");
        signed
            .metadata
            .annotations
            .insert(PRIVATE_KEY_SECRET_ANNOTATION.to_string(), "web-key".to_string());
        let created = env.requests().create(&signed).await.unwrap();

        CertificateRequestController::new(env.context.clone())
            .reconcile(&created.key())
            .await
            .unwrap();

        let stored = env.requests().get_key(&created.key()).await.unwrap().unwrap();
        assert!(stored.is_issued());
        assert_eq!(stored.status.certificate, stored.status.ca);
    }

    #[tokio::test]
    async fn test_invalid_challenge_fails_request_without_further_acme_calls() {
        let env = TestEnv::new();
        env.ready_acme_issuer("le").await;
        env.acme.set_outcome(ValidationOutcome::Invalid(
            "Invalid response from http://example.com/.well-known/acme-challenge/token: 404".to_string(),
        ));
        let (csr, _) = pki::test_csr(&["example.com"]);
        let created = env.requests().create(&request("web-1", &csr, "le")).await.unwrap();

        env.settle().await;

        let stored = env.requests().get_key(&created.key()).await.unwrap().unwrap();
        let ready = find_condition(&stored.status.conditions, CONDITION_READY).unwrap();
        assert_eq!(ready.reason, REASON_FAILED);
        assert!(ready.message.contains("404"));
        assert_eq!(env.recorder.with_reason(REASON_FAILED).len(), 1);
        assert_eq!(env.solver.cleanups(), 1);

        // Further passes touch neither the ACME server nor the status
        let calls = env.acme.total_calls();
        let writes = env.store.status_writes();
        env.settle().await;
        assert_eq!(env.acme.total_calls(), calls);
        assert_eq!(env.store.status_writes(), writes);
        assert_eq!(env.solver.cleanups(), 1);
    }

    #[tokio::test]
    async fn test_acme_request_is_issued_with_one_order() {
        let env = TestEnv::new();
        env.ready_acme_issuer("le").await;
        let (csr, _) = pki::test_csr(&["example.com", "www.example.com"]);
        let created = env.requests().create(&request("web-1", &csr, "le")).await.unwrap();

        env.settle().await;

        let stored = env.requests().get_key(&created.key()).await.unwrap().unwrap();
        assert!(stored.is_issued(), "conditions: {:?}", stored.status.conditions);
        let info = pki::parse_certificate(stored.status.certificate.as_deref().unwrap()).unwrap();
        let mut names = info.dns_names;
        names.sort();
        assert_eq!(names, vec!["example.com", "www.example.com"]);

        assert_eq!(env.acme.calls("create_order"), 1);
        assert_eq!(env.acme.order_count(), 1);
        assert_eq!(env.acme.calls("accept_challenge"), 2);
        assert_eq!(env.solver.presents(), 2);
        assert_eq!(env.solver.cleanups(), 2);
    }

    #[tokio::test]
    async fn test_rate_limit_defers_with_hint() {
        let env = TestEnv::new();
        env.ready_acme_issuer("le").await;
        env.acme.set_rate_limited(true);
        let (csr, _) = pki::test_csr(&["example.com"]);
        env.requests().create(&request("web-1", &csr, "le")).await.unwrap();

        env.reconcile_all(CertificateRequest::KIND).await;
        let orders = env.orders().list(Some("default")).await.unwrap();
        let err = super::super::OrderController::new(env.context.clone())
            .reconcile(&orders[0].key())
            .await
            .unwrap_err();
        assert_eq!(err.retry_after(), Some(std::time::Duration::from_secs(60)));

        let order = env.orders().get_key(&orders[0].key()).await.unwrap().unwrap();
        assert!(order.status.url.is_none());
        assert!(!order.status.is_terminal());
    }
}
