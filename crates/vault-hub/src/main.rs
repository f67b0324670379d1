use anyhow::Context;
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod api;
mod hub;
mod state;
mod watcher;

use hub::HubState;

#[derive(Clone, Debug)]
pub struct Config {
    pub addr: String,
    pub vault: PathBuf,
    pub extension: String,
    pub debounce: Duration,
    pub update_interval: Duration,
    pub ping_interval: Duration,
    pub write_timeout: Duration,
    pub activity_cap: usize,
    pub debug: bool,
}

#[cfg(test)]
impl Config {
    pub fn for_tests(vault: impl Into<PathBuf>) -> Self {
        Config {
            addr: "127.0.0.1:0".to_string(),
            vault: vault.into(),
            extension: "md".to_string(),
            debounce: Duration::from_millis(50),
            update_interval: Duration::ZERO,
            ping_interval: Duration::ZERO,
            write_timeout: Duration::from_secs(1),
            activity_cap: state::DEFAULT_ACTIVITY_CAP,
            debug: false,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "vault-hub")]
struct Args {
    /// Listen address; defaults from VAULT_HUB_ADDR or PORT.
    #[arg(long, default_value = "")]
    addr: String,
    /// Vault root holding the stage directories; defaults from VAULT_PATH.
    #[arg(long, default_value = "")]
    vault: String,
    /// Document extension eligible for pipeline tracking.
    #[arg(long, default_value = "md")]
    extension: String,
    /// Debounce window for raw filesystem events, in milliseconds.
    #[arg(long, default_value_t = 500)]
    debounce_ms: u64,
    /// Seconds between periodic snapshot refreshes (0 disables).
    #[arg(long, default_value_t = 5)]
    update_interval: u64,
    /// Seconds between WebSocket pings (0 disables).
    #[arg(long, default_value_t = 10)]
    ping_interval: u64,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    /// Entries retained in the recent-activity feed.
    #[arg(long, default_value_t = 10)]
    activity_cap: usize,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config();
    init_logging(&config);

    std::fs::create_dir_all(&config.vault)
        .with_context(|| format!("create vault root {}", config.vault.display()))?;
    // The detector compares event paths against the root, so it must be
    // canonical.
    let vault = config
        .vault
        .canonicalize()
        .with_context(|| format!("resolve vault root {}", config.vault.display()))?;
    let config = Config { vault, ..config };

    let addr: SocketAddr = config
        .addr
        .parse()
        .with_context(|| format!("invalid listen address {}", config.addr))?;

    let hub = Arc::new(HubState::new(config.clone()));
    // Seed counts from disk before accepting any viewer.
    watcher::reconcile_all(&hub).await;
    tokio::spawn(watcher::run(hub.clone()));
    hub.clone().start_refresh();

    let app = router(hub.clone());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(event = "hub_start", addr = %config.addr, vault = %config.vault.display());

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "hub_shutdown");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("serve")?;
    Ok(())
}

fn router(hub: Arc<HubState>) -> Router {
    Router::new()
        .route("/ws", get(hub::ws_handler))
        .route("/api/health", get(api::health))
        .route("/api/status", get(api::status))
        .route("/api/folders", get(api::folders))
        .route("/api/files/move", post(api::move_file))
        .route("/api/files/:folder", get(api::list_files).post(api::upload_file))
        .route(
            "/api/files/:folder/:filename",
            get(api::read_file).delete(api::delete_file),
        )
        .with_state(hub)
}

fn load_config() -> Config {
    let args = Args::parse();
    Config {
        addr: resolve_addr(&args.addr),
        vault: PathBuf::from(resolve_vault(&args.vault)),
        extension: args.extension,
        debounce: Duration::from_millis(args.debounce_ms),
        update_interval: Duration::from_secs(args.update_interval),
        ping_interval: Duration::from_secs(args.ping_interval),
        write_timeout: Duration::from_secs(args.write_timeout),
        activity_cap: args.activity_cap,
        debug: args.debug || env_true("VAULT_HUB_DEBUG"),
    }
}

fn init_logging(config: &Config) {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("VAULT_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn resolve_addr(addr_flag: &str) -> String {
    if !addr_flag.trim().is_empty() {
        return addr_flag.to_string();
    }
    if let Ok(value) = std::env::var("VAULT_HUB_ADDR") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    if let Ok(port) = std::env::var("PORT") {
        if !port.trim().is_empty() {
            return format!("127.0.0.1:{}", port.trim());
        }
    }
    "127.0.0.1:3001".to_string()
}

fn resolve_vault(vault_flag: &str) -> String {
    if !vault_flag.trim().is_empty() {
        return vault_flag.to_string();
    }
    if let Ok(value) = std::env::var("VAULT_PATH") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    ".".to_string()
}
