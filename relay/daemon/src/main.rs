//! Relay Daemon - Chat Turn Streaming Server
//!
//! Accepts turn requests on a Unix socket and streams each reply back as
//! server-sent events, saving the conversation as it goes.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults
//! relay-daemon
//!
//! # Custom socket path and model
//! relay-daemon --socket-path /tmp/relay.sock --model qwen3
//!
//! # Keep conversations on disk and strip <think> segments
//! relay-daemon --data-dir ~/.local/share/chat-relay --reasoning
//!
//! # Verbose logging
//! RUST_LOG=debug relay-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown

mod server;

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info, warn};

use relay_core::{
    default_config_path, load_config_from_path, ActiveRequestGauge, ConfigOverrides,
    ConversationStore, EndOfStreamSave, FileStore, HealthStatus, InMemoryStore, ModelTransport,
    OllamaSource, PersistenceHealth, ReasoningFilter, RelayConfig, TokenSource, TurnCoordinator,
    WorkerPools,
};

use server::{DaemonServer, ServerConfig};

/// How often persistence health is reported
const HEALTH_REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Relay Daemon - streams chat turns from a local model
#[derive(Parser, Debug)]
#[command(name = "relay-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Unix socket path for client connections
    #[arg(short = 's', long, env = "RELAY_SOCKET", value_name = "PATH")]
    socket_path: Option<PathBuf>,

    /// Configuration file path
    #[arg(short = 'c', long, env = "RELAY_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Model to query (overrides config)
    #[arg(short = 'm', long)]
    model: Option<String>,

    /// Strip reasoning segments from replies (overrides config)
    #[arg(long)]
    reasoning: bool,

    /// Directory for stored conversations (overrides config)
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "RELAY_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(ref model) = self.model {
            overrides = overrides.with_model(model.clone());
        }
        if self.reasoning {
            overrides = overrides.with_reasoning_enabled(true);
        }
        if let Some(ref dir) = self.data_dir {
            overrides = overrides.with_data_dir(dir.clone());
        }
        overrides
    }
}

/// Get the default socket path
///
/// Uses XDG_RUNTIME_DIR if available, otherwise /tmp/chat-relay-$UID/
fn default_socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir)
            .join("chat-relay")
            .join("relay.sock")
    } else {
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/chat-relay-{uid}/relay.sock"))
    }
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("relay_daemon={level},relay_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

/// Open the configured conversation store
fn open_store(config: &RelayConfig) -> Result<Arc<dyn ConversationStore>> {
    match config.storage.data_dir {
        Some(ref dir) => {
            let store = FileStore::open(dir)
                .with_context(|| format!("Failed to open conversation store at {dir:?}"))?;
            info!(path = ?dir, "Conversations stored on disk");
            Ok(Arc::new(store))
        }
        None => {
            warn!("No data directory configured, conversations are kept in memory only");
            Ok(Arc::new(InMemoryStore::new()))
        }
    }
}

/// Wire up the turn pipeline
async fn build_coordinator(
    config: &RelayConfig,
    pools: Arc<WorkerPools>,
    health: Arc<PersistenceHealth>,
) -> Result<TurnCoordinator> {
    let store = open_store(config)?;

    let source = OllamaSource::new(&config.backend)?;
    if source.health_check().await {
        info!(
            host = %config.backend.host,
            port = config.backend.port,
            model = %config.backend.model,
            "Backend reachable"
        );
    } else {
        warn!(
            host = %config.backend.host,
            port = config.backend.port,
            "Backend not reachable yet, turns will fail until it is"
        );
    }

    let transport = ModelTransport::new(
        Arc::new(source),
        ReasoningFilter::new(config.reasoning.clone()),
        ActiveRequestGauge::global(),
        Arc::clone(&pools),
    )
    .with_channel_capacity(config.pools.branch_capacity);

    let sink = Arc::new(EndOfStreamSave::new(
        Arc::clone(&store),
        health,
        Arc::clone(&pools),
    ));

    Ok(TurnCoordinator::new(store, transport, sink, pools)
        .with_limits(config.limits.clone())
        .with_branch_capacity(config.pools.branch_capacity))
}

/// Periodically log in-flight requests and persistence health
fn spawn_health_reporter(health: Arc<PersistenceHealth>) {
    tokio::spawn(async move {
        let gauge = ActiveRequestGauge::global();
        let mut interval = tokio::time::interval(HEALTH_REPORT_INTERVAL);
        interval.tick().await;

        loop {
            interval.tick().await;
            let recent = health.recent_failures();
            match health.status() {
                HealthStatus::Healthy => debug!(
                    active_requests = gauge.get(),
                    recent_failures = recent,
                    "Persistence healthy"
                ),
                HealthStatus::Warning => warn!(
                    active_requests = gauge.get(),
                    recent_failures = recent,
                    total_failures = health.total_failures(),
                    "Persistence degraded"
                ),
                HealthStatus::Critical => error!(
                    active_requests = gauge.get(),
                    recent_failures = recent,
                    total_failures = health.total_failures(),
                    "Persistence critical"
                ),
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!("Relay Daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());

    let config_path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(config_path).context("Failed to load configuration")?;
    args.overrides().apply(&mut config);
    config.validate().context("Invalid configuration")?;
    info!(
        source = ?config.source(),
        model = %config.backend.model,
        reasoning = config.reasoning.enabled,
        "Configuration loaded"
    );

    let socket_path = args.socket_path.clone().unwrap_or_else(default_socket_path);
    info!(socket_path = ?socket_path, "Socket path");

    let pools = Arc::new(WorkerPools::build(&config.pools).context("Failed to start worker pools")?);
    let health = Arc::new(PersistenceHealth::new(config.health.clone()));
    let coordinator = build_coordinator(&config, pools, Arc::clone(&health)).await?;
    spawn_health_reporter(Arc::clone(&health));

    let shutdown = Arc::new(AtomicBool::new(false));
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    let shutdown_clone = Arc::clone(&shutdown);
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
            _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
        }
        shutdown_clone.store(true, Ordering::SeqCst);
    });

    let mut server = DaemonServer::new(socket_path.clone(), coordinator, ServerConfig::default());
    let result = server.run(shutdown).await;

    info!("Shutting down...");

    if socket_path.exists() {
        if let Err(e) = fs::remove_file(&socket_path) {
            warn!(error = %e, "Failed to remove socket file");
        }
    }

    if health.total_failures() > 0 {
        warn!(
            total_failures = health.total_failures(),
            "Some replies were not persisted during this run"
        );
    }

    match result {
        Ok(()) => {
            info!("Relay daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}
