//! WolfElect - Lease-Based Leader Election
//!
//! Runs one election candidate: holds or waits for the lease, keeps the
//! leader marker and status record in line with the lease holder, and
//! serves its state over HTTP.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfelect::api::HttpServer;
use wolfelect::config::{StoreBackend, WolfElectConfig};
use wolfelect::store::{MemoryStore, ObjectStore, SqliteStore};
use wolfelect::supervisor::Supervisor;

/// WolfElect - Lease-Based Leader Election
#[derive(Parser)]
#[command(name = "wolfelect")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (defaults apply when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the election and run until signalled
    Run {
        /// Candidate identity (overrides config and POD_NAME)
        #[arg(long)]
        identity: Option<String>,

        /// Namespace (overrides config and POD_NAMESPACE)
        #[arg(long)]
        namespace: Option<String>,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfelect.toml")]
        output: PathBuf,

        /// Candidate identity
        #[arg(long)]
        identity: Option<String>,

        /// Namespace
        #[arg(long, default_value = "default")]
        namespace: String,
    },

    /// Validate configuration file
    Validate,

    /// Query a running candidate's election status
    Status {
        /// Node address to query
        #[arg(short, long, default_value = "localhost:8080")]
        address: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;
    let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    init_logging(level, &config.logging.format);

    match cli.command {
        Commands::Run { identity, namespace } => run(config, identity, namespace).await,
        Commands::Init {
            output,
            identity,
            namespace,
        } => run_init(output, identity, namespace),
        Commands::Validate => run_validate(config),
        Commands::Status { address } => run_status(address).await,
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "compact" {
        registry.with(tracing_subscriber::fmt::layer().compact()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<WolfElectConfig> {
    match path {
        Some(path) => WolfElectConfig::from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display())),
        None => Ok(WolfElectConfig::default()),
    }
}

fn open_store(config: &WolfElectConfig) -> anyhow::Result<Arc<dyn ObjectStore>> {
    match config.store.backend {
        StoreBackend::Sqlite => {
            let store = SqliteStore::open(
                &config.store.path,
                config.namespace(),
                Duration::from_millis(config.store.busy_timeout_ms),
            )
            .with_context(|| format!("failed to open store at {}", config.store.path.display()))?;
            tracing::info!(
                "Using SQLite store at {} (namespace {})",
                config.store.path.display(),
                config.namespace()
            );
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory store: leadership is not shared with other processes");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// Run the election until a shutdown signal arrives
async fn run(
    mut config: WolfElectConfig,
    identity: Option<String>,
    namespace: Option<String>,
) -> anyhow::Result<()> {
    config.resolve(identity, namespace);
    if let Err(e) = config.validate() {
        tracing::error!("{}", e);
        return Err(e.into());
    }

    tracing::info!(
        "Starting candidate {} in namespace {}",
        config.identity(),
        config.namespace()
    );

    let store = open_store(&config)?;
    let supervisor = Supervisor::new(&config, store);
    let shutdown = supervisor.shutdown_token();

    let http_server = HttpServer::new(
        config.api.clone(),
        supervisor.engine(),
        config.namespace().to_string(),
    );
    let http_shutdown = shutdown.clone();
    let http_handle = tokio::spawn(async move {
        if let Err(e) = http_server.start(http_shutdown).await {
            tracing::error!("HTTP server error: {}", e);
        }
    });

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        match wait_for_shutdown_signal().await {
            Ok(()) => tracing::info!("Received shutdown signal"),
            Err(e) => tracing::error!("Failed to listen for shutdown signals: {}", e),
        }
        signal_shutdown.cancel();
    });

    supervisor.run().await;

    // Stop the API even if the supervisor ended on its own
    shutdown.cancel();
    if let Err(e) = http_handle.await {
        tracing::error!("HTTP server task failed: {}", e);
    }

    tracing::info!("WolfElect shutdown complete");
    Ok(())
}

/// Waits for SIGINT, SIGTERM or SIGQUIT
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

/// Waits for Ctrl-C
#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

/// Query a running node
async fn run_status(address: String) -> anyhow::Result<()> {
    let url = format!("http://{}/status", address);

    let response = reqwest::get(&url)
        .await
        .with_context(|| format!("failed to get status from {}", url))?;
    let status: serde_json::Value = response
        .json()
        .await
        .context("status response is not JSON")?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

/// Initialize configuration file
fn run_init(output: PathBuf, identity: Option<String>, namespace: String) -> anyhow::Result<()> {
    let mut config = WolfElectConfig::default();
    config.node.identity = identity;
    config.node.namespace = Some(namespace);

    let content = format!(
        "# WolfElect Configuration\n\
         # node.identity may be left unset and provided through POD_NAME\n\n{}",
        config.to_toml()?
    );

    if output.exists() {
        anyhow::bail!("{} already exists", output.display());
    }
    std::fs::write(&output, content)
        .with_context(|| format!("failed to write {}", output.display()))?;

    println!("Configuration written to {}", output.display());
    Ok(())
}

/// Validate configuration
fn run_validate(mut config: WolfElectConfig) -> anyhow::Result<()> {
    config.resolve(None, None);
    match config.validate() {
        Ok(()) => {
            println!("✓ Configuration is valid");
            println!("  Identity:        {}", config.identity());
            println!("  Namespace:       {}", config.namespace());
            println!("  Lease:           {}", config.election.lease_name);
            println!(
                "  Timings:         lease {}s, renew deadline {}s, retry {}s",
                config.election.lease_duration_secs,
                config.election.renew_deadline_secs,
                config.election.retry_period_secs
            );
            println!("  Marker:          {}={}", config.marker.key, config.marker.value);
            println!("  Status record:   {}", config.status.record_name);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e.into())
        }
    }
}
