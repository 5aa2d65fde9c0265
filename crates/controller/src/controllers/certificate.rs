//! Certificate reconciler.
//!
//! Keeps a Secret holding a valid key pair for the Certificate's spec. Each
//! pass compares the Secret against the spec and the renewal time; when
//! issuance is needed it works through one CertificateRequest per revision,
//! named `<certificate>-<revision>`, signed with a key held in
//! `<certificate>-next-key` until the request is issued.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use warden_common::{
    find_condition, remove_condition, set_condition, Classify, ConditionStatus, ObjectKey,
};

use super::{Context, PassError};
use crate::api::{
    Certificate, CertificateRequest, CertificateRequestSpec, CertificateSpec, ObjectMeta, Resource,
    Secret, CA_CERT_KEY, CONDITION_ISSUING, CONDITION_READY, ISSUANCE_HASH_ANNOTATION,
    ISSUER_GROUP_ANNOTATION, ISSUER_KIND_ANNOTATION, ISSUER_NAME_ANNOTATION,
    PRIVATE_KEY_SECRET_ANNOTATION, REASON_FAILED, TLS_CERT_KEY, TLS_PRIVATE_KEY,
};
use crate::controller::{Action, ReconcileError, Reconciler};
use crate::pki::{self, CertificateInfo};
use crate::renewal::{next_attempt_after_failure, renewal_time_for};
use crate::store::{Api, StoreError};

/// Why a certificate is being issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssuanceTrigger {
    DoesNotExist,
    MissingData,
    InvalidCertificate,
    SpecChanged,
    Renewing,
}

impl IssuanceTrigger {
    pub fn reason(self) -> &'static str {
        match self {
            IssuanceTrigger::DoesNotExist => "DoesNotExist",
            IssuanceTrigger::MissingData => "MissingData",
            IssuanceTrigger::InvalidCertificate => "InvalidCertificate",
            IssuanceTrigger::SpecChanged => "SpecChanged",
            IssuanceTrigger::Renewing => "Renewing",
        }
    }

    fn message(self) -> &'static str {
        match self {
            IssuanceTrigger::DoesNotExist => "Issuing certificate as Secret does not exist",
            IssuanceTrigger::MissingData => "Issuing certificate as Secret does not contain a key pair",
            IssuanceTrigger::InvalidCertificate => "Issuing certificate as Secret contains an invalid certificate",
            IssuanceTrigger::SpecChanged => "Issuing certificate as Secret does not match the certificate spec",
            IssuanceTrigger::Renewing => "Renewing certificate as renewal was scheduled",
        }
    }
}

/// Identifiers a certificate covers, common name included.
fn certificate_identifiers(info: &CertificateInfo) -> Vec<String> {
    let mut names: Vec<String> = info
        .dns_names
        .iter()
        .chain(info.common_name.iter())
        .map(|n| n.to_ascii_lowercase())
        .collect();
    names.sort();
    names.dedup();
    names
}

/// Annotations written on the Secret alongside a key pair issued for `spec`.
pub fn issuance_annotations(spec: &CertificateSpec) -> [(&'static str, String); 4] {
    [
        (ISSUER_NAME_ANNOTATION, spec.issuer_ref.name.clone()),
        (ISSUER_KIND_ANNOTATION, spec.issuer_ref.kind.clone()),
        (ISSUER_GROUP_ANNOTATION, spec.issuer_ref.group.clone()),
        (ISSUANCE_HASH_ANNOTATION, spec.issuance_hash()),
    ]
}

/// Parse the certificate in `secret` and check it against `certificate`'s
/// spec. Renewal timing is not considered here.
pub fn evaluate(certificate: &Certificate, secret: Option<&Secret>) -> Result<CertificateInfo, IssuanceTrigger> {
    let secret = secret.ok_or(IssuanceTrigger::DoesNotExist)?;
    let (Some(chain), Some(_)) = (secret.get(TLS_CERT_KEY), secret.get(TLS_PRIVATE_KEY)) else {
        return Err(IssuanceTrigger::MissingData);
    };
    let info = pki::parse_certificate(chain).map_err(|_| IssuanceTrigger::InvalidCertificate)?;
    if certificate_identifiers(&info) != certificate.spec.identifiers() {
        return Err(IssuanceTrigger::SpecChanged);
    }
    let issued_for_spec = issuance_annotations(&certificate.spec)
        .iter()
        .all(|(key, value)| secret.metadata.annotations.get(*key) == Some(value));
    if !issued_for_spec {
        return Err(IssuanceTrigger::SpecChanged);
    }
    Ok(info)
}

fn next_key_name(certificate: &Certificate) -> String {
    format!("{}-next-key", certificate.metadata.name)
}

fn request_name(certificate: &Certificate, revision: u32) -> String {
    format!("{}-{revision}", certificate.metadata.name)
}

/// A request still describes what the certificate asks for.
fn request_matches(request: &CertificateRequest, certificate: &Certificate) -> bool {
    let spec = &certificate.spec;
    request.spec.issuer_ref == spec.issuer_ref
        && request.spec.duration_seconds == spec.duration_seconds
        && request.spec.usages == spec.usages
        && pki::parse_csr(&request.spec.request).is_ok_and(|csr| csr.identifiers() == spec.identifiers())
}

pub struct CertificateController {
    context: Arc<Context>,
    certificates: Api<Certificate>,
    requests: Api<CertificateRequest>,
    secrets: Api<Secret>,
}

impl CertificateController {
    pub fn new(context: Arc<Context>) -> Self {
        let store = Arc::clone(&context.store);
        Self {
            context,
            certificates: Api::new(Arc::clone(&store)),
            requests: Api::new(Arc::clone(&store)),
            secrets: Api::new(store),
        }
    }

    fn renewal_time(&self, certificate: &Certificate, info: &CertificateInfo) -> DateTime<Utc> {
        renewal_time_for(
            info.not_before,
            info.not_after,
            certificate.spec.renew_before_seconds.map(Duration::from_secs),
            self.context.timing.renew_before_floor,
        )
    }

    async fn step(&self, certificate: &Certificate, updated: &mut Certificate) -> Result<Action, PassError> {
        let now = Utc::now();
        let namespace = &certificate.metadata.namespace;
        let secret = self.secrets.get(namespace, &certificate.spec.secret_name).await?;

        let trigger = match evaluate(certificate, secret.as_ref()) {
            Ok(info) => {
                let renewal = self.renewal_time(certificate, &info);
                let status = &mut updated.status;
                status.not_before = Some(info.not_before);
                status.not_after = Some(info.not_after);
                status.renewal_time = Some(renewal);

                if info.not_after <= now {
                    set_condition(
                        &mut status.conditions,
                        CONDITION_READY,
                        ConditionStatus::False,
                        "Expired",
                        format!("Certificate expired on {}", info.not_after.to_rfc3339()),
                    );
                } else {
                    set_condition(
                        &mut status.conditions,
                        CONDITION_READY,
                        ConditionStatus::True,
                        "Ready",
                        "Certificate is up to date and has not expired",
                    );
                }
                if renewal > now {
                    remove_condition(&mut status.conditions, CONDITION_ISSUING);
                    return Ok(Action::requeue_at(renewal));
                }
                IssuanceTrigger::Renewing
            }
            Err(trigger) => {
                set_condition(
                    &mut updated.status.conditions,
                    CONDITION_READY,
                    ConditionStatus::False,
                    trigger.reason(),
                    trigger.message(),
                );
                trigger
            }
        };

        // A changed spec is worth trying at once; anything else waits out the backoff
        if trigger != IssuanceTrigger::SpecChanged && certificate.status.failed_issuance_attempts > 0 {
            if let Some(last_failure) = certificate.status.last_failure_time {
                let next_attempt = next_attempt_after_failure(
                    &self.context.timing.failure_backoff,
                    last_failure,
                    certificate.status.failed_issuance_attempts,
                );
                if next_attempt > now {
                    debug!(certificate = %certificate.key(), %next_attempt, "Backing off after failed issuance");
                    return Ok(Action::requeue_at(next_attempt));
                }
            }
        }

        set_condition(
            &mut updated.status.conditions,
            CONDITION_ISSUING,
            ConditionStatus::True,
            trigger.reason(),
            trigger.message(),
        );

        let key_pem = self.next_private_key(certificate).await?;
        let revision = certificate.status.revision + 1;
        let name = request_name(certificate, revision);

        let Some(request) = self.requests.get(namespace, &name).await? else {
            self.create_request(certificate, &name, &key_pem).await?;
            return Ok(Action::await_change());
        };

        if !request_matches(&request, certificate) {
            info!(certificate = %certificate.key(), request = %name, "Request is out of date, replacing it");
            self.requests.delete_if_exists(namespace, &name).await?;
            return Ok(Action::await_change());
        }

        if request.is_issued() {
            return self.install(certificate, updated, &request, &key_pem, revision).await;
        }

        if request.is_failed() {
            let message = find_condition(&request.status.conditions, CONDITION_READY)
                .map(|c| c.message.clone())
                .unwrap_or_default();
            warn!(certificate = %certificate.key(), request = %name, %message, "Issuance failed");
            let status = &mut updated.status;
            status.last_failure_time = Some(now);
            status.failed_issuance_attempts += 1;
            set_condition(
                &mut status.conditions,
                CONDITION_ISSUING,
                ConditionStatus::False,
                REASON_FAILED,
                format!("The certificate request has failed to complete and will be retried: {message}"),
            );
            self.context.recorder.warning(
                &certificate.key(),
                REASON_FAILED,
                &format!("The certificate request {name} has failed: {message}"),
            );
            self.requests.delete_if_exists(namespace, &name).await?;

            let next_attempt = next_attempt_after_failure(
                &self.context.timing.failure_backoff,
                now,
                status.failed_issuance_attempts,
            );
            return Ok(Action::requeue_at(next_attempt));
        }

        Ok(Action::await_change())
    }

    /// PEM key the next request is signed with, generated once per issuance.
    async fn next_private_key(&self, certificate: &Certificate) -> Result<String, PassError> {
        let namespace = &certificate.metadata.namespace;
        let name = next_key_name(certificate);
        let existing = self.secrets.get(namespace, &name).await?;
        if let Some(key) = existing.as_ref().and_then(|s| s.get(TLS_PRIVATE_KEY)) {
            return Ok(key.to_string());
        }

        let key_pem = pki::generate_private_key(certificate.spec.private_key.algorithm)?.serialize_pem();
        match existing {
            Some(secret) => {
                self.secrets.update(&secret.with(TLS_PRIVATE_KEY, key_pem.clone())).await?;
            }
            None => {
                let secret = Secret::new(ObjectMeta::new(namespace.clone(), name).with_owner(certificate.key()))
                    .with(TLS_PRIVATE_KEY, key_pem.clone());
                self.secrets.create(&secret).await?;
            }
        }
        debug!(certificate = %certificate.key(), "Generated next private key");
        Ok(key_pem)
    }

    async fn create_request(&self, certificate: &Certificate, name: &str, key_pem: &str) -> Result<(), PassError> {
        let spec = &certificate.spec;
        let key = pki::load_private_key(key_pem)?;
        let csr = pki::build_csr(&key, spec.common_name.as_deref(), &spec.dns_names)?;

        let mut metadata = ObjectMeta::new(certificate.metadata.namespace.clone(), name)
            .with_owner(certificate.key())
            .with_labels(certificate.metadata.labels.clone());
        metadata
            .annotations
            .insert(PRIVATE_KEY_SECRET_ANNOTATION.to_string(), next_key_name(certificate));

        let request = CertificateRequest {
            metadata,
            spec: CertificateRequestSpec {
                request: csr,
                duration_seconds: spec.duration_seconds,
                usages: spec.usages.clone(),
                issuer_ref: spec.issuer_ref.clone(),
                is_ca: false,
            },
            status: Default::default(),
        };

        match self.requests.create(&request).await {
            Ok(_) | Err(StoreError::AlreadyExists(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.context.recorder.normal(
            &certificate.key(),
            "Requested",
            &format!("Created new CertificateRequest resource {name}"),
        );
        Ok(())
    }

    /// Write the issued key pair and record the new revision.
    async fn install(
        &self,
        certificate: &Certificate,
        updated: &mut Certificate,
        request: &CertificateRequest,
        key_pem: &str,
        revision: u32,
    ) -> Result<Action, PassError> {
        let namespace = &certificate.metadata.namespace;
        let chain = request.status.certificate.clone().unwrap_or_default();
        let info = pki::parse_certificate(&chain)?;

        let secret_name = &certificate.spec.secret_name;
        let annotations = issuance_annotations(&certificate.spec)
            .map(|(key, value)| (key.to_string(), value));
        match self.secrets.get(namespace, secret_name).await? {
            Some(mut secret) => {
                secret.metadata.annotations.extend(annotations);
                secret.data.insert(TLS_CERT_KEY.to_string(), chain);
                secret.data.insert(TLS_PRIVATE_KEY.to_string(), key_pem.to_string());
                match &request.status.ca {
                    Some(ca) => secret.data.insert(CA_CERT_KEY.to_string(), ca.clone()),
                    None => secret.data.remove(CA_CERT_KEY),
                };
                self.secrets.update(&secret).await?;
            }
            None => {
                let mut metadata = ObjectMeta::new(namespace.clone(), secret_name.clone());
                metadata.annotations.extend(annotations);
                let mut secret = Secret::new(metadata)
                    .with(TLS_CERT_KEY, chain)
                    .with(TLS_PRIVATE_KEY, key_pem);
                if let Some(ca) = &request.status.ca {
                    secret = secret.with(CA_CERT_KEY, ca.clone());
                }
                self.secrets.create(&secret).await?;
            }
        }

        let renewal = self.renewal_time(certificate, &info);
        let status = &mut updated.status;
        status.revision = revision;
        status.not_before = Some(info.not_before);
        status.not_after = Some(info.not_after);
        status.renewal_time = Some(renewal);
        status.last_failure_time = None;
        status.failed_issuance_attempts = 0;
        set_condition(
            &mut status.conditions,
            CONDITION_READY,
            ConditionStatus::True,
            "Ready",
            "Certificate is up to date and has not expired",
        );
        remove_condition(&mut status.conditions, CONDITION_ISSUING);

        self.secrets
            .delete_if_exists(namespace, &next_key_name(certificate))
            .await?;
        for older in self.requests.list_owned(&certificate.key()).await? {
            if older.metadata.name != request.metadata.name {
                self.requests.delete_if_exists(namespace, &older.metadata.name).await?;
            }
        }

        info!(certificate = %certificate.key(), revision, renewal = %renewal, "Certificate issued");
        self.context
            .recorder
            .normal(&certificate.key(), "Issuing", "The certificate has been successfully issued");
        Ok(Action::requeue_at(renewal))
    }
}

#[async_trait]
impl Reconciler for CertificateController {
    fn kind(&self) -> &'static str {
        Certificate::KIND
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let Some(certificate) = self.certificates.get_key(key).await? else {
            return Ok(Action::await_change());
        };

        let mut updated = certificate.clone();
        let next = match self.step(&certificate, &mut updated).await {
            Ok(action) => Ok(action),
            Err(e) if e.class().is_retryable() => {
                warn!(certificate = %key, error = %e, "Certificate pass failed, will retry");
                Err(e.into())
            }
            Err(e) => {
                self.context.recorder.warning(key, e.reason(), &e.to_string());
                set_condition(
                    &mut updated.status.conditions,
                    CONDITION_READY,
                    ConditionStatus::False,
                    e.reason(),
                    e.to_string(),
                );
                remove_condition(&mut updated.status.conditions, CONDITION_ISSUING);
                Ok(Action::await_change())
            }
        };

        self.context.status.write(&self.certificates, &certificate, &updated).await?;
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{CertificateSpec, KeyAlgorithm, PrivateKeySpec};
    use crate::pki::SigningOptions;
    use crate::testing::TestEnv;
    use warden_common::{is_condition_true, IssuerRef};

    fn certificate(name: &str, names: &[&str], issuer: IssuerRef) -> Certificate {
        Certificate {
            metadata: ObjectMeta::new("default", name),
            spec: CertificateSpec {
                secret_name: format!("{name}-tls"),
                common_name: None,
                dns_names: names.iter().map(|n| n.to_string()).collect(),
                duration_seconds: None,
                renew_before_seconds: None,
                usages: Vec::new(),
                issuer_ref: issuer,
                private_key: PrivateKeySpec::default(),
            },
            status: Default::default(),
        }
    }

    fn key_pair_secret(names: &[&str], issued_for: &Certificate) -> Secret {
        let (csr, key) = pki::test_csr(names);
        let options = SigningOptions::new(None, &[], false).unwrap();
        let cert = pki::sign_self(&csr, &key, &options).unwrap();
        let mut metadata = ObjectMeta::new("default", "web-tls");
        for (annotation, value) in issuance_annotations(&issued_for.spec) {
            metadata.annotations.insert(annotation.to_string(), value);
        }
        Secret::new(metadata)
            .with(TLS_CERT_KEY, cert)
            .with(TLS_PRIVATE_KEY, key)
    }

    #[test]
    fn test_evaluate_triggers() {
        let cert = certificate("web", &["example.com"], IssuerRef::issuer("selfsigned"));

        assert_eq!(evaluate(&cert, None), Err(IssuanceTrigger::DoesNotExist));

        let empty = Secret::new(ObjectMeta::new("default", "web-tls"));
        assert_eq!(evaluate(&cert, Some(&empty)), Err(IssuanceTrigger::MissingData));

        let garbage = empty.clone().with(TLS_CERT_KEY, "junk").with(TLS_PRIVATE_KEY, "junk");
        assert_eq!(evaluate(&cert, Some(&garbage)), Err(IssuanceTrigger::InvalidCertificate));

        let other = key_pair_secret(&["other.example.com"], &cert);
        assert_eq!(evaluate(&cert, Some(&other)), Err(IssuanceTrigger::SpecChanged));

        let matching = key_pair_secret(&["example.com"], &cert);
        assert!(evaluate(&cert, Some(&matching)).is_ok());

        let mut unannotated = matching.clone();
        unannotated.metadata.annotations.clear();
        assert_eq!(evaluate(&cert, Some(&unannotated)), Err(IssuanceTrigger::SpecChanged));

        let mut longer = cert.clone();
        longer.spec.duration_seconds = Some(86_400);
        assert_eq!(evaluate(&longer, Some(&matching)), Err(IssuanceTrigger::SpecChanged));
    }

    #[tokio::test]
    async fn test_self_signed_certificate_is_issued_into_secret() {
        let env = TestEnv::new();
        env.ready_self_signed_issuer("selfsigned").await;
        let created = env
            .certificates()
            .create(&certificate("web", &["example.com", "www.example.com"], IssuerRef::issuer("selfsigned")))
            .await
            .unwrap();

        env.settle().await;

        let stored = env.certificates().get_key(&created.key()).await.unwrap().unwrap();
        assert!(is_condition_true(&stored.status.conditions, CONDITION_READY));
        assert!(find_condition(&stored.status.conditions, CONDITION_ISSUING).is_none());
        assert_eq!(stored.status.revision, 1);
        assert!(stored.status.renewal_time.unwrap() < stored.status.not_after.unwrap());

        let secret = env.secrets().get("default", "web-tls").await.unwrap().unwrap();
        let info = pki::parse_certificate(secret.get(TLS_CERT_KEY).unwrap()).unwrap();
        let mut names = info.dns_names.clone();
        names.sort();
        assert_eq!(names, vec!["example.com", "www.example.com"]);
        assert!(secret.get(CA_CERT_KEY).is_some());
        assert!(env.secrets().get("default", "web-next-key").await.unwrap().is_none());

        // Up to date: more passes neither issue nor write
        let writes = env.store.status_writes();
        env.settle().await;
        assert_eq!(env.store.status_writes(), writes);
        assert_eq!(env.requests().list(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_spec_change_reissues() {
        let env = TestEnv::new();
        env.ready_self_signed_issuer("selfsigned").await;
        let created = env
            .certificates()
            .create(&certificate("web", &["example.com"], IssuerRef::issuer("selfsigned")))
            .await
            .unwrap();
        env.settle().await;

        let mut changed = env.certificates().get_key(&created.key()).await.unwrap().unwrap();
        changed.spec.dns_names.push("api.example.com".to_string());
        env.certificates().update(&changed).await.unwrap();
        env.settle().await;

        let stored = env.certificates().get_key(&created.key()).await.unwrap().unwrap();
        assert_eq!(stored.status.revision, 2);
        let secret = env.secrets().get("default", "web-tls").await.unwrap().unwrap();
        let info = pki::parse_certificate(secret.get(TLS_CERT_KEY).unwrap()).unwrap();
        assert!(info.dns_names.contains(&"api.example.com".to_string()));

        let requests = env.requests().list(None).await.unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].metadata.name, "web-2");
    }

    #[tokio::test]
    async fn test_issuer_change_reissues() {
        let env = TestEnv::new();
        env.ready_self_signed_issuer("selfsigned").await;
        env.ready_self_signed_issuer("selfsigned-2").await;
        let created = env
            .certificates()
            .create(&certificate("web", &["example.com"], IssuerRef::issuer("selfsigned")))
            .await
            .unwrap();
        env.settle().await;
        let first = env.secrets().get("default", "web-tls").await.unwrap().unwrap();
        assert_eq!(first.metadata.annotations[ISSUER_NAME_ANNOTATION], "selfsigned");

        let mut changed = env.certificates().get_key(&created.key()).await.unwrap().unwrap();
        changed.spec.issuer_ref = IssuerRef::issuer("selfsigned-2");
        env.certificates().update(&changed).await.unwrap();
        env.settle().await;

        let stored = env.certificates().get_key(&created.key()).await.unwrap().unwrap();
        assert_eq!(stored.status.revision, 2);
        assert!(is_condition_true(&stored.status.conditions, CONDITION_READY));
        let secret = env.secrets().get("default", "web-tls").await.unwrap().unwrap();
        assert_eq!(secret.metadata.annotations[ISSUER_NAME_ANNOTATION], "selfsigned-2");
        assert_ne!(secret.get(TLS_CERT_KEY), first.get(TLS_CERT_KEY));

        // The Secret now matches the spec again
        env.settle().await;
        let again = env.certificates().get_key(&created.key()).await.unwrap().unwrap();
        assert_eq!(again.status.revision, 2);
    }

    #[tokio::test]
    async fn test_failed_issuance_backs_off() {
        let env = TestEnv::new();
        let mut foreign = IssuerRef::issuer("elsewhere");
        foreign.group = "example.org".to_string();
        let created = env
            .certificates()
            .create(&certificate("web", &["example.com"], foreign))
            .await
            .unwrap();

        env.settle().await;

        let stored = env.certificates().get_key(&created.key()).await.unwrap().unwrap();
        assert_eq!(stored.status.failed_issuance_attempts, 1);
        assert!(stored.status.last_failure_time.is_some());
        let issuing = find_condition(&stored.status.conditions, CONDITION_ISSUING).unwrap();
        assert_eq!(issuing.status, ConditionStatus::False);
        assert_eq!(issuing.reason, REASON_FAILED);

        // Still inside the backoff window, so no new request
        assert!(env.requests().list(None).await.unwrap().is_empty());
        let action = CertificateController::new(env.context.clone())
            .reconcile(&created.key())
            .await
            .unwrap();
        assert!(matches!(action, Action::Requeue(_)));
        assert!(env.requests().list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rsa_key_is_a_configuration_error() {
        let env = TestEnv::new();
        env.ready_self_signed_issuer("selfsigned").await;
        let mut cert = certificate("web", &["example.com"], IssuerRef::issuer("selfsigned"));
        cert.spec.private_key.algorithm = KeyAlgorithm::Rsa;
        let created = env.certificates().create(&cert).await.unwrap();

        let action = CertificateController::new(env.context.clone())
            .reconcile(&created.key())
            .await
            .unwrap();
        assert_eq!(action, Action::AwaitChange);

        let stored = env.certificates().get_key(&created.key()).await.unwrap().unwrap();
        let ready = find_condition(&stored.status.conditions, CONDITION_READY).unwrap();
        assert_eq!(ready.reason, "UnsupportedKeyAlgorithm");
        assert!(env.requests().list(None).await.unwrap().is_empty());
    }
}
