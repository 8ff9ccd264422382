//! # marquee-daemon
//!
//! The Marquee hub daemon.
//!
//! This daemon is responsible for:
//! - Discovering, loading and managing catalog extensions
//! - Persisting which extensions are enabled, and in what order (SQLite)
//! - Periodically rescanning package directories
//! - Exposing extension management and catalog queries over JSON-RPC
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     marquee-daemon                        │
//! │                                                           │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐       │
//! │  │  Extension  │  │   Refresh   │  │    State    │       │
//! │  │  Registry   │  │    Loop     │  │   (SQLite)  │       │
//! │  └─────────────┘  └─────────────┘  └─────────────┘       │
//! │         │                                                 │
//! │  ┌─────────────┐  ┌─────────────────────────────────┐    │
//! │  │ Aggregator  │──│        JSON-RPC API Server      │    │
//! │  └─────────────┘  └─────────────────────────────────┘    │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Running
//!
//! ```bash
//! cargo run --bin marquee-daemon
//!
//! # With debug logging
//! RUST_LOG=debug cargo run --bin marquee-daemon
//! ```

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use marquee_daemon::api::{self, ApiImpl};
use marquee_daemon::config::Config;
use marquee_daemon::refresh::RefreshManager;
use marquee_daemon::state::SqliteStateStore;
use marquee_extension_host::{Aggregator, ExecutionGateway, ExtensionRegistry};
use marquee_runtime::discovery::search_dirs;
use marquee_runtime::ModuleLoader;

#[tokio::main]
async fn main() -> Result<()> {
    let (config, config_error) = match Config::load_default() {
        Ok(cfg) => (cfg, None),
        Err(e) => (Config::default(), Some(e)),
    };

    marquee_daemon::init_logging(&config.daemon.log_level)?;

    info!("Starting marquee-daemon v{}", env!("CARGO_PKG_VERSION"));
    if let Some(e) = config_error {
        warn!("Failed to load config, using defaults: {:#}", e);
    }

    let state_path = config.state_path()?;
    let store = Arc::new(SqliteStateStore::open_at(&state_path)?);

    let loader = ModuleLoader::new(marquee_daemon::builtin_modules())
        .with_allowed_roots(config.extensions.allowed_roots.clone());
    let registry = Arc::new(ExtensionRegistry::new(loader, store));

    for summary in marquee_daemon::register_builtins(&registry).await? {
        info!("Built-in extension {} is {}", summary.id, summary.state);
    }

    let dirs = search_dirs(&config.extensions.directories);
    info!("Extension search path: {:?}", dirs);

    let mut refresh_manager = RefreshManager::new(
        Arc::clone(&registry),
        dirs,
        config.extensions.refresh_interval(),
    );
    refresh_manager.trigger().await;
    refresh_manager.start();
    let refresh_manager = Arc::new(RwLock::new(refresh_manager));

    let gateway = ExecutionGateway::new(config.extensions.call_timeout());
    let aggregator = Arc::new(
        Aggregator::new(Arc::clone(&registry), gateway)
            .with_max_fan_out(config.extensions.max_fan_out),
    );

    let api = ApiImpl::new(aggregator).with_refresh_manager(Arc::clone(&refresh_manager));
    let (server_handle, addr) = api::start_server(&config.daemon.bind_address, api).await?;

    info!(
        "Daemon startup complete: {} extension(s) known",
        registry.snapshot().len()
    );
    info!("Listening on: {}", addr);
    info!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;

    info!("Shutting down...");

    refresh_manager.write().await.shutdown().await;
    server_handle.stop()?;
    server_handle.stopped().await;

    info!("Daemon stopped");
    Ok(())
}
