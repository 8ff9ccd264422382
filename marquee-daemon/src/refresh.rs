//! Background discovery loop.
//!
//! The `RefreshManager` rescans the package directories on a fixed interval
//! so packages dropped into (or removed from) a watched directory are picked
//! up without restarting the daemon. A pass can also be triggered by hand,
//! e.g. from the `extensions.refresh` API method.

use chrono::{DateTime, Utc};
use marquee_extension_host::{ExtensionRegistry, RefreshReport};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

/// Longest interval between scheduled passes.
pub const MAX_PERIOD: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// The most recent discovery pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshStatus {
    pub report: RefreshReport,
    pub finished_at: DateTime<Utc>,
}

pub struct RefreshManager {
    registry: Arc<ExtensionRegistry>,
    dirs: Arc<Vec<PathBuf>>,
    period: Duration,
    last: Arc<RwLock<Option<RefreshStatus>>>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl RefreshManager {
    /// `period` is capped at [`MAX_PERIOD`].
    pub fn new(registry: Arc<ExtensionRegistry>, dirs: Vec<PathBuf>, period: Duration) -> Self {
        Self {
            registry,
            dirs: Arc::new(dirs),
            period: period.min(MAX_PERIOD),
            last: Arc::new(RwLock::new(None)),
            shutdown_tx: None,
            task: None,
        }
    }

    pub fn directories(&self) -> &[PathBuf] {
        &self.dirs
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Spawn the periodic loop. The first scheduled pass runs one period
    /// from now. Calling this while running does nothing.
    pub fn start(&mut self) {
        if self.task.is_some() {
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);

        let registry = Arc::clone(&self.registry);
        let dirs = Arc::clone(&self.dirs);
        let last = Arc::clone(&self.last);
        let period = self.period;

        info!(
            "Starting refresh loop over {} director(ies) every {:?}",
            dirs.len(),
            period
        );

        self.task = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_pass(&registry, &dirs, &last).await;
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Refresh loop received shutdown signal");
                        break;
                    }
                }
            }
            debug!("Refresh loop stopped");
        }));
    }

    /// Run one pass now and return its report.
    pub async fn trigger(&self) -> RefreshReport {
        run_pass(&self.registry, &self.dirs, &self.last).await
    }

    pub async fn last_status(&self) -> Option<RefreshStatus> {
        self.last.read().await.clone()
    }

    /// Stop the loop and wait for it to exit.
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Refresh loop ended abnormally: {}", e);
            }
        }
    }
}

async fn run_pass(
    registry: &ExtensionRegistry,
    dirs: &[PathBuf],
    last: &RwLock<Option<RefreshStatus>>,
) -> RefreshReport {
    let report = registry.refresh(dirs).await;
    info!(
        "Refresh complete: {} discovered, {} installed, {} failed, {} removed",
        report.discovered, report.installed, report.failed, report.removed
    );
    *last.write().await = Some(RefreshStatus {
        report: report.clone(),
        finished_at: Utc::now(),
    });
    report
}
