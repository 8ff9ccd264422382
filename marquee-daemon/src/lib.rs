//! Marquee daemon library
//!
//! This module exports the internal components of the daemon for testing purposes.

pub mod api;
pub mod config;
pub mod refresh;
pub mod state;

use anyhow::{Context, Result};
use marquee_extension_host::{ExtensionRegistry, ExtensionSummary};
use marquee_runtime::{BuiltinModule, BuiltinModules, ExtensionManifest};
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` wins over `default_level`.
pub fn init_logging(default_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))
}

/// Extensions compiled into the daemon.
pub fn builtin_modules() -> BuiltinModules {
    BuiltinModules::new().with(
        BuiltinModule::new(ext_sample::MODULE_NAME)
            .with_entry_point(ext_sample::ENTRY_POINT, &ext_sample::MarqueeSampleMain),
    )
}

/// Register the manifests of everything in [`builtin_modules`].
pub async fn register_builtins(registry: &ExtensionRegistry) -> Result<Vec<ExtensionSummary>> {
    let manifest = ExtensionManifest::from_str(ext_sample::BUILTIN_MANIFEST)
        .context("Failed to parse built-in sample manifest")?;
    let summary = registry
        .register_builtin(manifest)
        .await
        .context("Failed to register built-in sample extension")?;
    Ok(vec![summary])
}
