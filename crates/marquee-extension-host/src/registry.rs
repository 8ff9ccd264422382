//! Extension registry.
//!
//! The registry is the authoritative catalog of extensions and their
//! lifecycle state. Writers are serialized through one async mutex and
//! publish a new record list on every change; readers take a
//! [`RegistrySnapshot`] and never see a half-applied transition.

use crate::store::{StateStore, StoredState};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use marquee_runtime::discovery::discover_packages;
use marquee_runtime::{
    CapabilitySet, DefaultResolver, ExtensionFailure, ExtensionManifest, LoadError,
    LoadedExtension, ManifestReader, ModuleLoader, PackageResolver, ResolvedPackage,
};
use marquee_extension_core::CapabilityKind;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Discovered,
    ManifestValidated,
    Loaded,
    Enabled,
    Disabled,
    Failed,
}

impl LifecycleState {
    /// Whether the state machine has an edge from `self` to `next`.
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Discovered, ManifestValidated)
                | (Discovered, Failed)
                | (ManifestValidated, Loaded)
                | (ManifestValidated, Disabled)
                | (ManifestValidated, Failed)
                | (Loaded, Enabled)
                | (Loaded, Failed)
                | (Enabled, Disabled)
                | (Disabled, Loaded)
                | (Disabled, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Discovered => "discovered",
            LifecycleState::ManifestValidated => "manifest_validated",
            LifecycleState::Loaded => "loaded",
            LifecycleState::Enabled => "enabled",
            LifecycleState::Disabled => "disabled",
            LifecycleState::Failed => "failed",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an extension entered the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionSource {
    /// Explicit install request.
    Installed,
    /// Found by a directory scan.
    Discovered,
    /// Compiled into the host.
    Builtin,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Extension not found: {0}")]
    NotFound(String),

    #[error("Extension already installed: {0}")]
    AlreadyInstalled(String),

    #[error("Cannot {action} extension {id} while it is {state}")]
    InvalidTransition {
        id: String,
        state: LifecycleState,
        action: &'static str,
    },
}

/// A registry entry. Records are immutable; every transition publishes a
/// new one.
#[derive(Debug)]
pub struct ExtensionRecord {
    key: String,
    manifest: Option<ExtensionManifest>,
    state: LifecycleState,
    instance: Option<Arc<LoadedExtension>>,
    failure: Option<ExtensionFailure>,
    source: ExtensionSource,
    locator: String,
    package: Option<Arc<ResolvedPackage>>,
    position: u64,
    installed_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ExtensionRecord {
    /// The manifest id, or the package locator when the manifest was
    /// unreadable.
    pub fn id(&self) -> &str {
        &self.key
    }

    pub fn manifest(&self) -> Option<&ExtensionManifest> {
        self.manifest.as_ref()
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// The live instance; present only while enabled.
    pub fn instance(&self) -> Option<&Arc<LoadedExtension>> {
        self.instance.as_ref()
    }

    pub fn failure(&self) -> Option<&ExtensionFailure> {
        self.failure.as_ref()
    }

    pub fn source(&self) -> ExtensionSource {
        self.source
    }

    pub fn locator(&self) -> &str {
        &self.locator
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn is_enabled(&self) -> bool {
        self.state == LifecycleState::Enabled
    }

    /// Whether this record is enabled and its instance provides `kind`.
    pub fn provides(&self, kind: CapabilityKind) -> bool {
        self.is_enabled()
            && self
                .instance
                .as_ref()
                .is_some_and(|instance| instance.capabilities().has(kind))
    }

    fn transitioned(
        &self,
        state: LifecycleState,
        instance: Option<Arc<LoadedExtension>>,
        failure: Option<ExtensionFailure>,
    ) -> Self {
        Self {
            key: self.key.clone(),
            manifest: self.manifest.clone(),
            state,
            instance,
            failure,
            source: self.source,
            locator: self.locator.clone(),
            package: self.package.clone(),
            position: self.position,
            installed_at: self.installed_at,
            updated_at: Utc::now(),
        }
    }

    pub fn summary(&self) -> ExtensionSummary {
        let manifest = self.manifest.as_ref();
        ExtensionSummary {
            id: self.key.clone(),
            name: manifest.map(|m| m.name.clone()),
            version: manifest.map(|m| m.version.clone()),
            author: manifest.map(|m| m.author.clone()),
            description: manifest.and_then(|m| m.description.clone()),
            api_version: manifest.map(|m| m.api_version),
            state: self.state,
            source: self.source,
            capabilities: self
                .instance
                .as_ref()
                .map(|i| i.capabilities().names().into_iter().map(String::from).collect())
                .unwrap_or_else(|| manifest.map(|m| m.capabilities.clone()).unwrap_or_default()),
            failure: self.failure.as_ref().map(|f| f.to_string()),
            failure_kind: self.failure.as_ref().map(|f| f.kind().to_string()),
            locator: self.locator.clone(),
            position: self.position,
            installed_at: self.installed_at,
            updated_at: self.updated_at,
        }
    }
}

/// Serializable view of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionSummary {
    pub id: String,
    pub name: Option<String>,
    pub version: Option<String>,
    pub author: Option<String>,
    pub description: Option<String>,
    pub api_version: Option<u32>,
    pub state: LifecycleState,
    pub source: ExtensionSource,
    pub capabilities: Vec<String>,
    pub failure: Option<String>,
    pub failure_kind: Option<String>,
    pub locator: String,
    pub position: u64,
    pub installed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Counts from one discovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshReport {
    pub discovered: usize,
    pub installed: usize,
    pub failed: usize,
    pub removed: usize,
}

/// Immutable point-in-time view of the registry, in install order.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    records: Arc<Vec<Arc<ExtensionRecord>>>,
}

impl RegistrySnapshot {
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ExtensionRecord>> {
        self.records.iter()
    }

    pub fn get(&self, id: &str) -> Option<&Arc<ExtensionRecord>> {
        self.records.iter().find(|r| r.key == id)
    }

    /// Enabled records providing `kind`, in install order.
    pub fn providing(&self, kind: CapabilityKind) -> Vec<Arc<ExtensionRecord>> {
        self.records
            .iter()
            .filter(|r| r.provides(kind))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

struct WriterState {
    next_position: Option<u64>,
}

/// Walks a record through the state machine.
struct Lifecycle<'a> {
    id: &'a str,
    state: LifecycleState,
}

impl<'a> Lifecycle<'a> {
    fn start(id: &'a str, state: LifecycleState) -> Self {
        Self { id, state }
    }

    fn step(&mut self, next: LifecycleState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {} -> {}",
            self.state,
            next
        );
        debug!("Extension {}: {} -> {}", self.id, self.state, next);
        self.state = next;
    }
}

/// Registry of extensions and their lifecycle state.
pub struct ExtensionRegistry {
    records: ArcSwap<Vec<Arc<ExtensionRecord>>>,
    writer: Mutex<WriterState>,
    reader: ManifestReader,
    loader: ModuleLoader,
    store: Arc<dyn StateStore>,
    required: CapabilitySet,
}

impl ExtensionRegistry {
    /// Create an empty registry resolving packages with [`DefaultResolver`].
    pub fn new(loader: ModuleLoader, store: Arc<dyn StateStore>) -> Self {
        Self {
            records: ArcSwap::from_pointee(Vec::new()),
            writer: Mutex::new(WriterState {
                next_position: None,
            }),
            reader: ManifestReader::new(Arc::new(DefaultResolver::new())),
            loader,
            store,
            required: CapabilitySet::new(),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn PackageResolver>) -> Self {
        self.reader = ManifestReader::new(resolver);
        self
    }

    /// Capabilities every loaded extension must provide. Empty accepts any.
    pub fn with_required_capabilities(mut self, required: CapabilitySet) -> Self {
        self.required = required;
        self
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            records: self.records.load_full(),
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<ExtensionRecord>> {
        self.records.load().iter().find(|r| r.key == id).cloned()
    }

    pub fn list_extensions(&self) -> Vec<ExtensionSummary> {
        self.records.load().iter().map(|r| r.summary()).collect()
    }

    /// Install and enable the package at `locator`.
    ///
    /// Read and load failures produce a `Failed` record rather than an
    /// error. Installing an id that is already present and not failed is
    /// rejected.
    pub async fn install(&self, locator: &str) -> Result<ExtensionSummary, RegistryError> {
        let mut writer = self.writer.lock().await;
        let record = self
            .install_locked(&mut writer, locator, ExtensionSource::Installed)
            .await?;
        Ok(record.summary())
    }

    /// Register a package compiled into the host.
    pub async fn register_builtin(
        &self,
        manifest: ExtensionManifest,
    ) -> Result<ExtensionSummary, RegistryError> {
        let mut writer = self.writer.lock().await;
        let locator = manifest.source.clone();
        let record = self
            .admit(&mut writer, manifest, None, &locator, ExtensionSource::Builtin)
            .await?;
        Ok(record.summary())
    }

    /// Re-load and enable a disabled extension. Enabling an enabled
    /// extension is a no-op.
    pub async fn enable(&self, id: &str) -> Result<ExtensionSummary, RegistryError> {
        let _writer = self.writer.lock().await;
        let record = self
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        let manifest = match (record.state, record.manifest.as_ref()) {
            (LifecycleState::Enabled, _) => return Ok(record.summary()),
            (LifecycleState::Disabled, Some(manifest)) => manifest,
            (state, _) => {
                return Err(RegistryError::InvalidTransition {
                    id: id.to_string(),
                    state,
                    action: "enable",
                })
            }
        };

        let mut lifecycle = Lifecycle::start(id, LifecycleState::Disabled);
        let next = match self.load(manifest, record.package.as_deref()) {
            Ok(loaded) => {
                lifecycle.step(LifecycleState::Loaded);
                lifecycle.step(LifecycleState::Enabled);
                info!("Enabled extension {}", id);
                record.transitioned(lifecycle.state, Some(Arc::new(loaded)), None)
            }
            Err(e) => {
                warn!("Failed to re-load extension {}: {}", id, e);
                lifecycle.step(LifecycleState::Failed);
                record.transitioned(lifecycle.state, None, Some(e.into()))
            }
        };

        let next = self.publish_record(next);
        self.persist(&next).await;
        Ok(next.summary())
    }

    /// Drop an enabled extension's instance. Disabling a disabled extension
    /// is a no-op.
    pub async fn disable(&self, id: &str) -> Result<ExtensionSummary, RegistryError> {
        let _writer = self.writer.lock().await;
        let record = self
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        match record.state {
            LifecycleState::Disabled => Ok(record.summary()),
            LifecycleState::Enabled => {
                let mut lifecycle = Lifecycle::start(id, record.state);
                lifecycle.step(LifecycleState::Disabled);
                let next = self.publish_record(record.transitioned(lifecycle.state, None, None));
                info!("Disabled extension {}", id);
                self.persist(&next).await;
                Ok(next.summary())
            }
            state => Err(RegistryError::InvalidTransition {
                id: id.to_string(),
                state,
                action: "disable",
            }),
        }
    }

    /// Remove an extension in any state.
    pub async fn uninstall(&self, id: &str) -> Result<(), RegistryError> {
        let _writer = self.writer.lock().await;
        let record = self
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        if record.is_enabled() {
            debug!("Extension {}: disabling before removal", id);
        }
        self.publish(|records| records.retain(|r| r.key != id));

        if record.manifest.is_some() {
            if let Err(e) = self.store.remove(id).await {
                error!("Failed to remove persisted state for {}: {}", id, e);
            }
        }

        info!("Uninstalled extension {}", id);
        Ok(())
    }

    /// Scan `dirs`, install packages not seen before and drop discovered
    /// extensions whose package directory is gone.
    pub async fn refresh(&self, dirs: &[PathBuf]) -> RefreshReport {
        let mut writer = self.writer.lock().await;
        let packages = discover_packages(dirs);
        let mut report = RefreshReport {
            discovered: packages.len(),
            ..Default::default()
        };

        let vanished: HashSet<String> = self
            .records
            .load()
            .iter()
            .filter(|r| r.source == ExtensionSource::Discovered && !Path::new(&r.locator).exists())
            .map(|r| r.key.clone())
            .collect();
        if !vanished.is_empty() {
            self.publish(|records| records.retain(|r| !vanished.contains(&r.key)));
            for id in &vanished {
                info!("Removed extension {}: package no longer present", id);
            }
            report.removed = vanished.len();
        }

        let current = self.records.load_full();
        let known_locators: HashSet<&str> = current.iter().map(|r| r.locator.as_str()).collect();
        let known_ids: HashSet<&str> = current.iter().map(|r| r.key.as_str()).collect();

        let persisted: HashMap<String, u64> = match self.store.load_all().await {
            Ok(states) => states.into_iter().map(|s| (s.id, s.position)).collect(),
            Err(e) => {
                error!("Failed to load persisted extension state: {}", e);
                HashMap::new()
            }
        };

        let mut fresh: Vec<_> = packages
            .into_iter()
            .filter(|p| !known_locators.contains(p.locator().as_str()))
            .filter(|p| match &p.manifest {
                Ok(manifest) if known_ids.contains(manifest.id.as_str()) => {
                    debug!(
                        "Skipping {:?}: extension {} is already registered",
                        p.path, manifest.id
                    );
                    false
                }
                _ => true,
            })
            .collect();
        // Previously seen extensions come back in their persisted order.
        fresh.sort_by_key(|p| {
            p.manifest
                .as_ref()
                .ok()
                .and_then(|m| persisted.get(&m.id).copied())
                .unwrap_or(u64::MAX)
        });

        for package in fresh {
            let locator = package.locator();
            let result = match package.manifest {
                Ok(manifest) => {
                    self.admit(
                        &mut writer,
                        manifest,
                        Some(ResolvedPackage::local(package.path)),
                        &locator,
                        ExtensionSource::Discovered,
                    )
                    .await
                }
                Err(e) => {
                    self.record_failure(&mut writer, &locator, e.into(), ExtensionSource::Discovered)
                        .await
                }
            };
            match result {
                Ok(record) if record.state == LifecycleState::Failed => report.failed += 1,
                Ok(_) => report.installed += 1,
                Err(e) => debug!("Skipping {}: {}", locator, e),
            }
        }

        info!(
            "Extension refresh: {} discovered, {} installed, {} failed, {} removed",
            report.discovered, report.installed, report.failed, report.removed
        );
        report
    }

    async fn install_locked(
        &self,
        writer: &mut WriterState,
        locator: &str,
        source: ExtensionSource,
    ) -> Result<Arc<ExtensionRecord>, RegistryError> {
        match self.reader.read_retained(locator).await {
            Ok((manifest, package)) => {
                self.admit(writer, manifest, Some(package), locator, source)
                    .await
            }
            Err(failure) => self.record_failure(writer, locator, failure, source).await,
        }
    }

    /// Record a package whose manifest could not be read, keyed by locator.
    async fn record_failure(
        &self,
        writer: &mut WriterState,
        locator: &str,
        failure: ExtensionFailure,
        source: ExtensionSource,
    ) -> Result<Arc<ExtensionRecord>, RegistryError> {
        self.ensure_replaceable(locator)?;
        warn!("Failed to read extension package {}: {}", locator, failure);

        let mut lifecycle = Lifecycle::start(locator, LifecycleState::Discovered);
        lifecycle.step(LifecycleState::Failed);

        let now = Utc::now();
        let record = ExtensionRecord {
            key: locator.to_string(),
            manifest: None,
            state: lifecycle.state,
            instance: None,
            failure: Some(failure),
            source,
            locator: locator.to_string(),
            package: None,
            position: self.allocate_position(writer, None).await,
            installed_at: now,
            updated_at: now,
        };
        Ok(self.publish_record(record))
    }

    /// Validate, load and publish a package whose manifest has been read.
    async fn admit(
        &self,
        writer: &mut WriterState,
        manifest: ExtensionManifest,
        package: Option<ResolvedPackage>,
        locator: &str,
        source: ExtensionSource,
    ) -> Result<Arc<ExtensionRecord>, RegistryError> {
        self.ensure_replaceable(&manifest.id)?;

        let id = manifest.id.clone();
        let mut lifecycle = Lifecycle::start(&id, LifecycleState::Discovered);
        lifecycle.step(LifecycleState::ManifestValidated);

        let persisted = self.load_persisted(&id).await;
        let restore_disabled = source != ExtensionSource::Installed
            && persisted.as_ref().is_some_and(|s| !s.is_enabled);
        let position = self.allocate_position(writer, persisted.as_ref()).await;
        let package = package.map(Arc::new);

        let (instance, failure) = if let Err(e) = ModuleLoader::check_manifest(&manifest) {
            warn!("Extension {} rejected: {}", id, e);
            lifecycle.step(LifecycleState::Failed);
            (None, Some(ExtensionFailure::from(e)))
        } else if restore_disabled {
            lifecycle.step(LifecycleState::Disabled);
            info!("Extension {} restored as disabled", id);
            (None, None)
        } else {
            match self.load(&manifest, package.as_deref()) {
                Ok(loaded) => {
                    lifecycle.step(LifecycleState::Loaded);
                    lifecycle.step(LifecycleState::Enabled);
                    info!(
                        "Installed extension {} v{} ({:?})",
                        manifest.name, manifest.version, source
                    );
                    (Some(Arc::new(loaded)), None)
                }
                Err(e) => {
                    warn!("Failed to load extension {}: {}", id, e);
                    lifecycle.step(LifecycleState::Failed);
                    (None, Some(ExtensionFailure::from(e)))
                }
            }
        };

        let now = Utc::now();
        let record = ExtensionRecord {
            key: id.clone(),
            manifest: Some(manifest),
            state: lifecycle.state,
            instance,
            failure,
            source,
            locator: locator.to_string(),
            package,
            position,
            installed_at: now,
            updated_at: now,
        };

        let record = self.publish_record(record);
        self.persist(&record).await;
        Ok(record)
    }

    fn load(
        &self,
        manifest: &ExtensionManifest,
        package: Option<&ResolvedPackage>,
    ) -> Result<LoadedExtension, LoadError> {
        let root = package.map(|p| p.root().to_path_buf()).unwrap_or_default();
        self.loader.load_instance(manifest, &root, &self.required)
    }

    fn ensure_replaceable(&self, key: &str) -> Result<(), RegistryError> {
        match self.get(key) {
            Some(existing) if existing.state != LifecycleState::Failed => {
                Err(RegistryError::AlreadyInstalled(key.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn allocate_position(
        &self,
        writer: &mut WriterState,
        persisted: Option<&StoredState>,
    ) -> u64 {
        let next = match writer.next_position {
            Some(next) => next,
            None => match self.store.load_all().await {
                Ok(states) => states.iter().map(|s| s.position + 1).max().unwrap_or(0),
                Err(e) => {
                    error!("Failed to load persisted extension state: {}", e);
                    0
                }
            },
        };

        let (position, next) = match persisted {
            Some(state) => (state.position, next.max(state.position + 1)),
            None => (next, next + 1),
        };
        writer.next_position = Some(next);
        position
    }

    async fn load_persisted(&self, id: &str) -> Option<StoredState> {
        match self.store.load(id).await {
            Ok(state) => state,
            Err(e) => {
                error!("Failed to load persisted state for {}: {}", id, e);
                None
            }
        }
    }

    async fn persist(&self, record: &ExtensionRecord) {
        if record.manifest.is_none() || record.state == LifecycleState::Failed {
            return;
        }
        let state = StoredState {
            id: record.key.clone(),
            is_enabled: record.is_enabled(),
            position: record.position,
        };
        if let Err(e) = self.store.save(&state).await {
            error!("Failed to persist state for {}: {}", record.key, e);
        }
    }

    fn publish(&self, update: impl FnOnce(&mut Vec<Arc<ExtensionRecord>>)) {
        let mut records: Vec<_> = self.records.load().iter().cloned().collect();
        update(&mut records);
        self.records.store(Arc::new(records));
    }

    /// Publish `record`, replacing the record with the same key or a failed
    /// record for the same locator in place.
    fn publish_record(&self, record: ExtensionRecord) -> Arc<ExtensionRecord> {
        let record = Arc::new(record);
        let published = Arc::clone(&record);
        self.publish(move |records| {
            let existing = records.iter().position(|r| r.key == record.key).or_else(|| {
                records.iter().position(|r| {
                    r.manifest.is_none()
                        && r.state == LifecycleState::Failed
                        && r.locator == record.locator
                })
            });
            match existing {
                Some(index) => records[index] = record,
                None => records.push(record),
            }
        });
        published
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        use LifecycleState::*;

        assert!(Discovered.can_transition_to(ManifestValidated));
        assert!(ManifestValidated.can_transition_to(Disabled));
        assert!(Enabled.can_transition_to(Disabled));
        assert!(Disabled.can_transition_to(Loaded));
        assert!(Loaded.can_transition_to(Failed));

        assert!(!Failed.can_transition_to(Enabled));
        assert!(!Failed.can_transition_to(Disabled));
        assert!(!Discovered.can_transition_to(Enabled));
        assert!(!Enabled.can_transition_to(Loaded));
    }

    #[test]
    fn test_state_names() {
        assert_eq!(LifecycleState::ManifestValidated.to_string(), "manifest_validated");
        assert_eq!(LifecycleState::Failed.as_str(), "failed");
    }
}
