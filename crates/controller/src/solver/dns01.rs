//! DNS-01 challenges.
//!
//! The record `_acme-challenge.<name>` must carry a TXT value of
//! base64url(sha256(key authorization)). Records are written by a named
//! [`DnsProvider`] and the self-check queries every configured nameserver.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use dashmap::DashMap;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::{Solver, SolverError};
use crate::api::Challenge;

/// Fully qualified record name for `dns_name`.
pub fn challenge_record_name(dns_name: &str) -> String {
    format!(
        "_acme-challenge.{}.",
        dns_name.trim_start_matches("*.").trim_end_matches('.')
    )
}

/// TXT value proving `key_authorization`.
pub fn dns01_value(key_authorization: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(key_authorization.as_bytes()))
}

#[async_trait]
pub trait DnsProvider: Send + Sync {
    async fn present(&self, fqdn: &str, value: &str) -> Result<(), SolverError>;

    async fn cleanup(&self, fqdn: &str, value: &str) -> Result<(), SolverError>;
}

/// TXT lookups for the propagation check.
#[async_trait]
pub trait TxtResolver: Send + Sync {
    /// TXT values at `fqdn` as seen by each queried nameserver.
    async fn lookup(&self, fqdn: &str) -> Result<Vec<Vec<String>>, SolverError>;
}

// ============================================================================
// Providers
// ============================================================================

/// In-process zone. Doubles as the resolver for its own records.
#[derive(Debug, Clone, Default)]
pub struct MemoryDnsProvider {
    records: Arc<DashMap<String, Vec<String>>>,
}

impl MemoryDnsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self, fqdn: &str) -> Vec<String> {
        self.records.get(fqdn).map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl DnsProvider for MemoryDnsProvider {
    async fn present(&self, fqdn: &str, value: &str) -> Result<(), SolverError> {
        let mut values = self.records.entry(fqdn.to_string()).or_default();
        if !values.iter().any(|v| v == value) {
            values.push(value.to_string());
        }
        Ok(())
    }

    async fn cleanup(&self, fqdn: &str, value: &str) -> Result<(), SolverError> {
        if let Some(mut values) = self.records.get_mut(fqdn) {
            values.retain(|v| v != value);
        }
        self.records.remove_if(fqdn, |_, values| values.is_empty());
        Ok(())
    }
}

#[async_trait]
impl TxtResolver for MemoryDnsProvider {
    async fn lookup(&self, fqdn: &str) -> Result<Vec<Vec<String>>, SolverError> {
        Ok(vec![self.records(fqdn)])
    }
}

#[derive(Serialize)]
struct DnsPayload<'a> {
    fqdn: &'a str,
    value: &'a str,
}

/// Delegates record management: `POST <url>/present` and
/// `POST <url>/cleanup` with `{fqdn, value}`.
#[derive(Debug, Clone)]
pub struct WebhookDnsProvider {
    client: reqwest::Client,
    url: String,
}

impl WebhookDnsProvider {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn call(&self, action: &str, fqdn: &str, value: &str) -> Result<(), SolverError> {
        let response = self
            .client
            .post(format!("{}/{}", self.url, action))
            .json(&DnsPayload { fqdn, value })
            .send()
            .await
            .map_err(|e| SolverError::Provision(format!("dns01 webhook {action}: {e}")))?;
        if !response.status().is_success() {
            return Err(SolverError::Provision(format!(
                "dns01 webhook {action} returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DnsProvider for WebhookDnsProvider {
    async fn present(&self, fqdn: &str, value: &str) -> Result<(), SolverError> {
        self.call("present", fqdn, value).await
    }

    async fn cleanup(&self, fqdn: &str, value: &str) -> Result<(), SolverError> {
        self.call("cleanup", fqdn, value).await
    }
}

// ============================================================================
// Resolver
// ============================================================================

/// Queries each configured nameserver separately, or the system resolver
/// when none are configured.
pub struct HickoryTxtResolver {
    resolvers: Vec<(String, TokioAsyncResolver)>,
}

impl HickoryTxtResolver {
    pub fn new(nameservers: &[SocketAddr], timeout: Duration) -> Result<Self, SolverError> {
        let mut opts = ResolverOpts::default();
        opts.timeout = timeout;
        opts.attempts = 1;

        let resolvers = if nameservers.is_empty() {
            let resolver = TokioAsyncResolver::tokio_from_system_conf()
                .map_err(|e| SolverError::Provision(format!("system resolver: {e}")))?;
            vec![("system".to_string(), resolver)]
        } else {
            nameservers
                .iter()
                .map(|addr| {
                    let group = NameServerConfigGroup::from_ips_clear(&[addr.ip()], addr.port(), true);
                    let config = ResolverConfig::from_parts(None, vec![], group);
                    (addr.to_string(), TokioAsyncResolver::tokio(config, opts.clone()))
                })
                .collect()
        };
        Ok(Self { resolvers })
    }
}

#[async_trait]
impl TxtResolver for HickoryTxtResolver {
    async fn lookup(&self, fqdn: &str) -> Result<Vec<Vec<String>>, SolverError> {
        let mut answers = Vec::with_capacity(self.resolvers.len());
        for (name, resolver) in &self.resolvers {
            match resolver.txt_lookup(fqdn).await {
                Ok(lookup) => answers.push(lookup.iter().map(|txt| txt.to_string()).collect()),
                Err(e) => match e.kind() {
                    ResolveErrorKind::NoRecordsFound { .. } => answers.push(Vec::new()),
                    _ => {
                        return Err(SolverError::NotPropagated(format!(
                            "TXT lookup of {fqdn} at {name} failed: {e}"
                        )))
                    }
                },
            }
        }
        Ok(answers)
    }
}

// ============================================================================
// Solver
// ============================================================================

pub struct Dns01Solver {
    providers: HashMap<String, Arc<dyn DnsProvider>>,
    resolver: Arc<dyn TxtResolver>,
}

impl Dns01Solver {
    pub fn new(resolver: Arc<dyn TxtResolver>) -> Self {
        Self {
            providers: HashMap::new(),
            resolver,
        }
    }

    pub fn with_provider(mut self, name: impl Into<String>, provider: Arc<dyn DnsProvider>) -> Self {
        self.providers.insert(name.into(), provider);
        self
    }

    fn provider(&self, challenge: &Challenge) -> Result<&dyn DnsProvider, SolverError> {
        let config = challenge.spec.solver.dns01.as_ref().ok_or(SolverError::MissingConfig)?;
        self.providers
            .get(&config.provider)
            .map(|p| p.as_ref())
            .ok_or_else(|| SolverError::UnknownProvider(config.provider.clone()))
    }
}

#[async_trait]
impl Solver for Dns01Solver {
    async fn present(&self, challenge: &Challenge) -> Result<(), SolverError> {
        let fqdn = challenge_record_name(&challenge.spec.dns_name);
        debug!(fqdn = %fqdn, "Presenting DNS-01 record");
        self.provider(challenge)?
            .present(&fqdn, &dns01_value(&challenge.spec.key))
            .await
    }

    async fn check(&self, challenge: &Challenge) -> Result<(), SolverError> {
        let fqdn = challenge_record_name(&challenge.spec.dns_name);
        let expected = dns01_value(&challenge.spec.key);

        let answers = self.resolver.lookup(&fqdn).await?;
        if answers.is_empty() || answers.iter().any(|values| !values.contains(&expected)) {
            return Err(SolverError::NotPropagated(format!(
                "TXT record {fqdn} does not yet carry the expected value on every nameserver"
            )));
        }
        trace!(fqdn = %fqdn, "DNS-01 self-check passed");
        Ok(())
    }

    async fn cleanup(&self, challenge: &Challenge) -> Result<(), SolverError> {
        let fqdn = challenge_record_name(&challenge.spec.dns_name);
        self.provider(challenge)?
            .cleanup(&fqdn, &dns01_value(&challenge.spec.key))
            .await
    }
}
