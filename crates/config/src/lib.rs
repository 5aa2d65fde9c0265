//! Configuration for the Warden certificate controller.
//!
//! Configuration is a KDL document. Every block and every value is
//! optional; anything left out takes the default shown below.
//!
//! ```kdl
//! controller {
//!     workers 2
//!     pass-timeout-secs 120
//!     status-write "apply"       // or "update"
//!     field-manager "warden"
//! }
//! backoff {
//!     initial-millis 1000
//!     max-secs 10
//! }
//! acme {
//!     self-check-timeout-secs 10
//!     http01-port 80
//!     rate-limit-backoff-secs 60
//!     nameservers "8.8.8.8:53" "1.1.1.1:53"
//! }
//! renewal {
//!     renew-before-floor-secs 300
//!     failure-backoff-initial-secs 3600
//!     failure-backoff-max-secs 115200
//! }
//! solvers {
//!     http01 "memory"            // or "webhook"
//!     http01-webhook-url "http://solver.internal/http01"
//!     dns01-webhook-url "http://solver.internal/dns01"
//! }
//! ```

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};
use validator::Validate;

mod kdl;
pub mod validate;

pub use validate::{lint_config, ValidationWarning};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    #[diagnostic(code(warden::config::io))]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Parse(#[from] ::kdl::KdlError),

    #[error("invalid configuration: {0}")]
    #[diagnostic(
        code(warden::config::invalid),
        help("see the crate documentation for the accepted blocks and values")
    )]
    Invalid(String),
}

// ============================================================================
// Configuration types
// ============================================================================

/// How a controller persists status changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusWriteStrategy {
    /// Replace the status subresource, guarded by the resource version
    Update,
    /// Merge-patch only the changed status fields under a field manager
    #[default]
    Apply,
}

impl StatusWriteStrategy {
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "update" => Some(Self::Update),
            "apply" | "server-side-apply" | "ssa" => Some(Self::Apply),
            _ => None,
        }
    }
}

/// Which HTTP-01 provisioner the solver uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Http01Provisioning {
    /// In-process token table, served by an embedding HTTP server
    #[default]
    Memory,
    /// External provisioner reached over HTTP
    Webhook,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct Config {
    #[validate(nested)]
    pub controller: ControllerSettings,
    #[validate(nested)]
    pub backoff: BackoffSettings,
    #[validate(nested)]
    pub acme: AcmeSettings,
    #[validate(nested)]
    pub renewal: RenewalSettings,
    pub solvers: SolverSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ControllerSettings {
    /// Concurrent passes per resource kind
    #[validate(range(min = 1, max = 64))]
    pub workers: usize,
    /// Upper bound on one reconciliation pass
    #[validate(range(min = 1, max = 3600))]
    pub pass_timeout_secs: u64,
    pub status_write: StatusWriteStrategy,
    #[validate(length(min = 1, max = 128))]
    pub field_manager: String,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            pass_timeout_secs: default_pass_timeout_secs(),
            status_write: StatusWriteStrategy::default(),
            field_manager: default_field_manager(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BackoffSettings {
    #[validate(range(min = 10, max = 60000))]
    pub initial_millis: u64,
    #[validate(range(min = 1, max = 3600))]
    pub max_secs: u64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial_millis: default_backoff_initial_millis(),
            max_secs: default_backoff_max_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AcmeSettings {
    /// Timeout of one self-check probe
    #[validate(range(min = 1, max = 300))]
    pub self_check_timeout_secs: u64,
    /// Port the HTTP-01 self-check connects to
    #[validate(range(min = 1))]
    pub http01_port: u16,
    /// Delay used when the ACME server rate-limits without a hint
    #[validate(range(min = 1, max = 86400))]
    pub rate_limit_backoff_secs: u64,
    /// Resolvers consulted by the DNS-01 self-check (`ip:port`); empty = system
    pub nameservers: Vec<String>,
}

impl Default for AcmeSettings {
    fn default() -> Self {
        Self {
            self_check_timeout_secs: default_self_check_timeout_secs(),
            http01_port: default_http01_port(),
            rate_limit_backoff_secs: default_rate_limit_backoff_secs(),
            nameservers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RenewalSettings {
    /// Lower bound on the default renew-before window
    #[validate(range(min = 1))]
    pub renew_before_floor_secs: u64,
    #[validate(range(min = 1))]
    pub failure_backoff_initial_secs: u64,
    #[validate(range(min = 1))]
    pub failure_backoff_max_secs: u64,
}

impl Default for RenewalSettings {
    fn default() -> Self {
        Self {
            renew_before_floor_secs: default_renew_before_floor_secs(),
            failure_backoff_initial_secs: default_failure_backoff_initial_secs(),
            failure_backoff_max_secs: default_failure_backoff_max_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SolverSettings {
    pub http01: Http01Provisioning,
    pub http01_webhook_url: Option<String>,
    pub dns01_webhook_url: Option<String>,
}

// Default value functions

pub(crate) fn default_workers() -> usize {
    2
}

pub(crate) fn default_pass_timeout_secs() -> u64 {
    120
}

pub(crate) fn default_field_manager() -> String {
    "warden".to_string()
}

pub(crate) fn default_backoff_initial_millis() -> u64 {
    1000
}

pub(crate) fn default_backoff_max_secs() -> u64 {
    10
}

pub(crate) fn default_self_check_timeout_secs() -> u64 {
    10
}

pub(crate) fn default_http01_port() -> u16 {
    80
}

pub(crate) fn default_rate_limit_backoff_secs() -> u64 {
    60
}

pub(crate) fn default_renew_before_floor_secs() -> u64 {
    300
}

pub(crate) fn default_failure_backoff_initial_secs() -> u64 {
    3600
}

pub(crate) fn default_failure_backoff_max_secs() -> u64 {
    32 * 3600
}

// ============================================================================
// Loading
// ============================================================================

impl Config {
    /// Parse and validate a KDL document.
    pub fn from_kdl(text: &str) -> Result<Self, ConfigError> {
        let document: ::kdl::KdlDocument = text.parse()?;
        let config = kdl::parse_document(&document).map_err(|e| ConfigError::Invalid(format!("{e:#}")))?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration from a file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_kdl(&text)?;

        debug!(
            workers = config.controller.workers,
            pass_timeout_secs = config.controller.pass_timeout_secs,
            status_write = ?config.controller.status_write,
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Range checks from the derive plus cross-field checks.
    pub fn validate_all(&self) -> Result<(), ConfigError> {
        self.validate()
            .map_err(|e| ConfigError::Invalid(e.to_string().replace('\n', "; ")))?;
        validate::check_semantics(self).map_err(ConfigError::Invalid)
    }

    pub fn pass_timeout(&self) -> Duration {
        Duration::from_secs(self.controller.pass_timeout_secs)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff.initial_millis)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff.max_secs)
    }

    pub fn self_check_timeout(&self) -> Duration {
        Duration::from_secs(self.acme.self_check_timeout_secs)
    }

    pub fn rate_limit_backoff(&self) -> Duration {
        Duration::from_secs(self.acme.rate_limit_backoff_secs)
    }

    pub fn renew_before_floor(&self) -> Duration {
        Duration::from_secs(self.renewal.renew_before_floor_secs)
    }

    pub fn failure_backoff_initial(&self) -> Duration {
        Duration::from_secs(self.renewal.failure_backoff_initial_secs)
    }

    pub fn failure_backoff_max(&self) -> Duration {
        Duration::from_secs(self.renewal.failure_backoff_max_secs)
    }
}
