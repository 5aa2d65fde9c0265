//! Warden - certificate controller entry point
//!
//! Loads a KDL configuration and a set of resource manifests into the
//! in-memory store, then runs every controller until interrupted.

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use serde_json::Value;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use warden_common::Backoff;
use warden_config::{lint_config, Config, Http01Provisioning};
use warden_controller::acme::InstantAcmeClient;
use warden_controller::api::{
    Certificate, CertificateRequest, Challenge, Issuer, Order, Resource, Secret,
};
use warden_controller::solver::{
    ChallengeManager, Dns01Solver, HickoryTxtResolver, Http01Solver, MemoryDnsProvider,
    SolverDispatcher, WebhookDnsProvider, WebhookHttp01Provisioner,
};
use warden_controller::{
    run_all, Context, ControllerOptions, MemoryStore, ResourceStore, TracingRecorder,
};

/// Warden - declarative certificate issuance
#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "WARDEN_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose", global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long = "log-format", value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controllers (default)
    Run {
        /// JSON file holding an array of resources to load at startup
        #[arg(short = 'm', long = "manifests")]
        manifests: Option<PathBuf>,
    },
    /// Validate configuration file and exit
    CheckConfig,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    kind: String,
    #[serde(flatten)]
    object: Value,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    match cli.command {
        Some(Commands::CheckConfig) => check_config(cli.config.as_deref()),
        Some(Commands::Run { manifests }) => run(cli.config.as_deref(), manifests.as_deref()).await,
        None => run(cli.config.as_deref(), None).await,
    }
}

fn init_logging(verbose: bool, format: LogFormat) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load configuration file {}", path.display())),
        None => {
            info!("No configuration file given, using defaults");
            Ok(Config::default())
        }
    }
}

/// Validate configuration and exit
fn check_config(path: Option<&Path>) -> Result<()> {
    let config = load_config(path)?;

    let warnings = lint_config(&config);
    for warning in &warnings {
        warn!("{}", warning.message);
    }

    info!("Configuration test successful:");
    info!("  - {} worker(s) per controller", config.controller.workers);
    info!("  - pass timeout {}s", config.controller.pass_timeout_secs);
    info!("  - {} warning(s)", warnings.len());

    println!(
        "warden: configuration {} test is successful",
        path.map(|p| p.display().to_string())
            .unwrap_or_else(|| "(defaults)".to_string())
    );
    Ok(())
}

async fn run(config_path: Option<&Path>, manifests: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    for warning in lint_config(&config) {
        warn!("{}", warning.message);
    }

    let store = Arc::new(MemoryStore::new());
    if let Some(path) = manifests {
        let loaded = load_manifests(store.as_ref(), path).await?;
        info!(count = loaded, path = %path.display(), "Loaded manifests");
    }

    let solvers = build_solvers(&config)?;
    let context = Arc::new(Context::new(
        store,
        Arc::new(InstantAcmeClient::new(config.rate_limit_backoff())),
        solvers,
        Arc::new(TracingRecorder),
        &config,
    ));

    let options = ControllerOptions {
        workers: config.controller.workers,
        pass_timeout: config.pass_timeout(),
        backoff: Backoff::new(config.backoff_initial(), config.backoff_max()),
    };

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received interrupt, shutting down");
        }
        signal.cancel();
    });

    info!(
        version = env!("CARGO_PKG_VERSION"),
        workers = options.workers,
        "Starting Warden controllers"
    );
    run_all(context, options, shutdown).await;
    info!("Warden stopped");
    Ok(())
}

async fn load_manifests(store: &dyn ResourceStore, path: &Path) -> Result<usize> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read manifests from {}", path.display()))?;
    let manifests: Vec<Manifest> =
        serde_json::from_str(&text).context("Manifests must be a JSON array of resources")?;

    let known = [
        Issuer::KIND,
        Certificate::KIND,
        CertificateRequest::KIND,
        Order::KIND,
        Challenge::KIND,
        Secret::KIND,
    ];
    let count = manifests.len();
    for manifest in manifests {
        let Some(kind) = known.iter().find(|k| **k == manifest.kind) else {
            bail!("unknown resource kind {:?}", manifest.kind);
        };
        store
            .create(kind, manifest.object)
            .await
            .with_context(|| format!("Failed to load {kind} manifest"))?;
    }
    Ok(count)
}

fn build_solvers(config: &Config) -> Result<SolverDispatcher> {
    let timeout = config.self_check_timeout();
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("Failed to build HTTP client")?;

    let http01 = match config.solvers.http01 {
        Http01Provisioning::Memory => {
            warn!(
                port = config.acme.http01_port,
                "HTTP-01 tokens are held in memory; an embedding server must serve them"
            );
            ChallengeManager::new().into_solver(config.acme.http01_port)
        }
        Http01Provisioning::Webhook => {
            let url = config
                .solvers
                .http01_webhook_url
                .clone()
                .context("http01 \"webhook\" requires http01-webhook-url")?;
            Http01Solver::new(
                Arc::new(WebhookHttp01Provisioner::new(client.clone(), url)),
                config.acme.http01_port,
                timeout,
            )
        }
    };

    let nameservers = config
        .acme
        .nameservers
        .iter()
        .map(|ns| ns.parse::<SocketAddr>())
        .collect::<Result<Vec<_>, _>>()
        .context("Invalid nameserver address")?;
    let resolver = HickoryTxtResolver::new(&nameservers, timeout)?;

    let mut dns01 = Dns01Solver::new(Arc::new(resolver)).with_provider("memory", Arc::new(MemoryDnsProvider::new()));
    if let Some(url) = &config.solvers.dns01_webhook_url {
        dns01 = dns01.with_provider("webhook", Arc::new(WebhookDnsProvider::new(client, url.clone())));
    }

    Ok(SolverDispatcher::new()
        .with_http01(Arc::new(http01))
        .with_dns01(Arc::new(dns01)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use warden_controller::Api;

    fn manifest_file(json: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn test_manifests_are_loaded_by_kind() {
        let file = manifest_file(
            r#"[
                {"kind": "Issuer", "metadata": {"name": "selfsigned", "namespace": "default"},
                 "spec": {"selfSigned": {}}},
                {"kind": "Secret", "metadata": {"name": "web-tls", "namespace": "default"}, "data": {}}
            ]"#,
        );
        let store = Arc::new(MemoryStore::new());

        let count = load_manifests(store.as_ref(), file.path()).await.unwrap();
        assert_eq!(count, 2);
        let secrets = Api::<Secret>::new(store.clone()).list(None).await.unwrap();
        assert_eq!(secrets[0].key().name, "web-tls");
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_manifest_kind_is_rejected() {
        let file = manifest_file(r#"[{"kind": "Gateway", "metadata": {"name": "x"}}]"#);
        let store = MemoryStore::new();

        let err = load_manifests(&store, file.path()).await.unwrap_err();
        assert!(err.to_string().contains("Gateway"));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_solvers_follow_configuration() {
        let mut config = Config::default();
        config.acme.nameservers = vec!["127.0.0.1:5353".to_string()];
        assert!(build_solvers(&config).is_ok());

        config.solvers.http01 = Http01Provisioning::Webhook;
        let err = build_solvers(&config).err().unwrap();
        assert!(err.to_string().contains("http01-webhook-url"));

        config.solvers.http01_webhook_url = Some("http://solver.internal/http01".to_string());
        config.acme.nameservers = vec!["not-an-address".to_string()];
        assert!(build_solvers(&config).is_err());
    }
}
