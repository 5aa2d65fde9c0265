//! Controller, backoff, ACME, renewal and solver block parsing.

use anyhow::{anyhow, Result};
use tracing::trace;

use crate::*;

use super::{get_string_args, get_string_entry, get_u64_entry};

/// Parse controller configuration block
pub fn parse_controller(node: &::kdl::KdlNode) -> Result<ControllerSettings> {
    trace!("Parsing controller configuration block");

    let status_write = match get_string_entry(node, "status-write") {
        Some(s) => StatusWriteStrategy::from_str_loose(&s).ok_or_else(|| {
            anyhow!(
                "Unknown status-write strategy '{}'. Expected \"update\" or \"apply\"",
                s
            )
        })?,
        None => StatusWriteStrategy::default(),
    };

    let config = ControllerSettings {
        workers: get_u64_entry(node, "workers")?
            .map(|v| v as usize)
            .unwrap_or_else(default_workers),
        pass_timeout_secs: get_u64_entry(node, "pass-timeout-secs")?
            .unwrap_or_else(default_pass_timeout_secs),
        status_write,
        field_manager: get_string_entry(node, "field-manager").unwrap_or_else(default_field_manager),
    };

    trace!(
        workers = config.workers,
        pass_timeout_secs = config.pass_timeout_secs,
        status_write = ?config.status_write,
        "Parsed controller configuration"
    );

    Ok(config)
}

/// Parse backoff configuration block
pub fn parse_backoff(node: &::kdl::KdlNode) -> Result<BackoffSettings> {
    Ok(BackoffSettings {
        initial_millis: get_u64_entry(node, "initial-millis")?
            .unwrap_or_else(default_backoff_initial_millis),
        max_secs: get_u64_entry(node, "max-secs")?.unwrap_or_else(default_backoff_max_secs),
    })
}

/// Parse ACME configuration block
pub fn parse_acme(node: &::kdl::KdlNode) -> Result<AcmeSettings> {
    trace!("Parsing ACME configuration block");

    let http01_port = match get_u64_entry(node, "http01-port")? {
        Some(port) => u16::try_from(port)
            .map_err(|_| anyhow!("'http01-port' must be a valid port, got {}", port))?,
        None => default_http01_port(),
    };

    let config = AcmeSettings {
        self_check_timeout_secs: get_u64_entry(node, "self-check-timeout-secs")?
            .unwrap_or_else(default_self_check_timeout_secs),
        http01_port,
        rate_limit_backoff_secs: get_u64_entry(node, "rate-limit-backoff-secs")?
            .unwrap_or_else(default_rate_limit_backoff_secs),
        nameservers: get_string_args(node, "nameservers"),
    };

    trace!(
        http01_port = config.http01_port,
        nameservers = config.nameservers.len(),
        "Parsed ACME configuration"
    );

    Ok(config)
}

/// Parse renewal configuration block
pub fn parse_renewal(node: &::kdl::KdlNode) -> Result<RenewalSettings> {
    Ok(RenewalSettings {
        renew_before_floor_secs: get_u64_entry(node, "renew-before-floor-secs")?
            .unwrap_or_else(default_renew_before_floor_secs),
        failure_backoff_initial_secs: get_u64_entry(node, "failure-backoff-initial-secs")?
            .unwrap_or_else(default_failure_backoff_initial_secs),
        failure_backoff_max_secs: get_u64_entry(node, "failure-backoff-max-secs")?
            .unwrap_or_else(default_failure_backoff_max_secs),
    })
}

/// Parse solvers configuration block
pub fn parse_solvers(node: &::kdl::KdlNode) -> Result<SolverSettings> {
    let http01 = match get_string_entry(node, "http01").as_deref() {
        None | Some("memory") => Http01Provisioning::Memory,
        Some("webhook") => Http01Provisioning::Webhook,
        Some(other) => {
            return Err(anyhow!(
                "Unknown http01 provisioner '{}'. Expected \"memory\" or \"webhook\"",
                other
            ))
        }
    };

    Ok(SolverSettings {
        http01,
        http01_webhook_url: get_string_entry(node, "http01-webhook-url"),
        dns01_webhook_url: get_string_entry(node, "dns01-webhook-url"),
    })
}
