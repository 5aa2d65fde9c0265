//! Cross-field validation and linting.
//!
//! Range checks live on the types as `validator` attributes. This module
//! holds the checks that look at more than one field, and the lints that
//! flag legal but questionable settings.

use std::net::SocketAddr;

use crate::{Config, Http01Provisioning, StatusWriteStrategy};

/// Non-fatal finding about a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationWarning {
    pub message: String,
}

impl ValidationWarning {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Checks that span fields. Returns the first problem found.
pub(crate) fn check_semantics(config: &Config) -> Result<(), String> {
    if config.backoff.initial_millis > config.backoff.max_secs * 1000 {
        return Err(format!(
            "backoff initial-millis ({}) exceeds max-secs ({})",
            config.backoff.initial_millis, config.backoff.max_secs
        ));
    }

    if config.renewal.failure_backoff_initial_secs > config.renewal.failure_backoff_max_secs {
        return Err(format!(
            "renewal failure-backoff-initial-secs ({}) exceeds failure-backoff-max-secs ({})",
            config.renewal.failure_backoff_initial_secs, config.renewal.failure_backoff_max_secs
        ));
    }

    for server in &config.acme.nameservers {
        if server.parse::<SocketAddr>().is_err() {
            return Err(format!(
                "acme nameserver '{}' is not an ip:port address",
                server
            ));
        }
    }

    if config.solvers.http01 == Http01Provisioning::Webhook && config.solvers.http01_webhook_url.is_none() {
        return Err("solvers http01 \"webhook\" requires http01-webhook-url".to_string());
    }

    for url in [&config.solvers.http01_webhook_url, &config.solvers.dns01_webhook_url]
        .into_iter()
        .flatten()
    {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(format!("solver webhook URL '{}' must be http(s)", url));
        }
    }

    Ok(())
}

/// Lint configuration for questionable settings.
pub fn lint_config(config: &Config) -> Vec<ValidationWarning> {
    let mut warnings = Vec::new();

    if config.controller.status_write == StatusWriteStrategy::Update {
        warnings.push(ValidationWarning::new(
            "status-write \"update\" replaces the whole status; fields set by other writers are overwritten",
        ));
    }

    if config.acme.nameservers.is_empty() {
        warnings.push(ValidationWarning::new(
            "No acme nameservers configured; DNS-01 self-checks use the system resolver, which may cache negative answers",
        ));
    }

    if config.solvers.dns01_webhook_url.is_none() {
        warnings.push(ValidationWarning::new(
            "No dns01-webhook-url configured; only the in-memory DNS provider is available",
        ));
    }

    if config.acme.self_check_timeout_secs >= config.controller.pass_timeout_secs {
        warnings.push(ValidationWarning::new(format!(
            "self-check-timeout-secs ({}) is not shorter than pass-timeout-secs ({}); a slow probe consumes the whole pass",
            config.acme.self_check_timeout_secs, config.controller.pass_timeout_secs
        )));
    }

    warnings
}
