//! Execution gateway.
//!
//! Every call into extension code goes through [`ExecutionGateway::invoke`],
//! which checks the API version, runs the call on its own task under a
//! timeout and turns errors and panics into a [`CallOutcome`].

use marquee_extension_core::{ExtensionError, HOST_API_VERSION};
use marquee_runtime::loader::panic_message;
use marquee_runtime::{Capability, ExtensionManifest, LoadedExtension};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Default per-call timeout.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallErrorKind {
    IncompatibleVersion,
    Timeout,
    ExecutionFailure,
}

/// A failed extension call.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct CallError {
    pub kind: CallErrorKind,
    pub message: String,
    /// The underlying extension error or panic text, when there is one.
    pub cause: Option<String>,
}

impl CallError {
    fn new(kind: CallErrorKind, message: impl Into<String>, cause: Option<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause,
        }
    }
}

/// Result of a single extension call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum CallOutcome<T> {
    Success(T),
    Error(CallError),
}

impl<T> CallOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, CallOutcome::Success(_))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            CallOutcome::Success(value) => Some(value),
            CallOutcome::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&CallError> {
        match self {
            CallOutcome::Success(_) => None,
            CallOutcome::Error(error) => Some(error),
        }
    }

    pub fn into_result(self) -> Result<T, CallError> {
        match self {
            CallOutcome::Success(value) => Ok(value),
            CallOutcome::Error(error) => Err(error),
        }
    }
}

/// Fault boundary around extension calls.
#[derive(Debug, Clone)]
pub struct ExecutionGateway {
    timeout: Duration,
}

impl Default for ExecutionGateway {
    fn default() -> Self {
        Self::new(DEFAULT_CALL_TIMEOUT)
    }
}

impl ExecutionGateway {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Call `action` with the extension's `C` interface.
    ///
    /// The call runs on its own task. The task keeps `extension` alive until
    /// it finishes, so a call that times out is abandoned with its code still
    /// loaded. Registry state is never touched here.
    pub async fn invoke<C, T, F, Fut>(
        &self,
        extension: Arc<LoadedExtension>,
        manifest: &ExtensionManifest,
        action: F,
    ) -> CallOutcome<T>
    where
        C: Capability,
        T: Send + 'static,
        F: FnOnce(Arc<C::Handle>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, ExtensionError>> + Send + 'static,
    {
        let id = manifest.id.as_str();

        if manifest.api_version > HOST_API_VERSION {
            return CallOutcome::Error(CallError::new(
                CallErrorKind::IncompatibleVersion,
                format!(
                    "{} targets API version {}, host supports up to {}",
                    id, manifest.api_version, HOST_API_VERSION
                ),
                None,
            ));
        }

        let started = Instant::now();
        let task = tokio::spawn(async move {
            let extension = extension;
            match C::project(extension.instance()) {
                Some(handle) => action(handle).await.map_err(Some),
                None => Err(None),
            }
        });

        let outcome = match tokio::time::timeout(self.timeout, task).await {
            Err(_) => {
                warn!(
                    "Extension {} did not answer within {:?}; abandoning call",
                    id, self.timeout
                );
                CallOutcome::Error(CallError::new(
                    CallErrorKind::Timeout,
                    format!("{} timed out after {} ms", id, self.timeout.as_millis()),
                    None,
                ))
            }
            Ok(Err(join_error)) => {
                let cause = if join_error.is_panic() {
                    panic_message(join_error.into_panic().as_ref())
                } else {
                    join_error.to_string()
                };
                warn!("Extension {} panicked: {}", id, cause);
                CallOutcome::Error(CallError::new(
                    CallErrorKind::ExecutionFailure,
                    format!("{id} panicked"),
                    Some(cause),
                ))
            }
            Ok(Ok(Err(None))) => CallOutcome::Error(CallError::new(
                CallErrorKind::ExecutionFailure,
                format!("{} does not implement {}", id, C::KIND),
                None,
            )),
            Ok(Ok(Err(Some(error)))) => {
                warn!("Extension {} failed: {}", id, error);
                let message = match &error {
                    ExtensionError::Rejected(_) => format!("{id} rejected the call"),
                    _ => format!("{id} failed"),
                };
                CallOutcome::Error(CallError::new(
                    CallErrorKind::ExecutionFailure,
                    message,
                    Some(error.to_string()),
                ))
            }
            Ok(Ok(Ok(value))) => CallOutcome::Success(value),
        };

        debug!(
            "Call to {} ({}) finished in {:?}: {}",
            id,
            C::KIND,
            started.elapsed(),
            if outcome.is_success() { "ok" } else { "error" }
        );

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use marquee_extension_core::{
        CapabilityKind, CatalogItem, Extension, ExtensionEntryPoint, MediaType, MovieCatalog,
        TvCatalog,
    };
    use marquee_runtime::{
        BuiltinModule, BuiltinModules, CapabilitySet, ModuleLoader, MovieCatalogCapability,
        TvCatalogCapability,
    };

    #[derive(Default)]
    struct Scripted;

    #[async_trait]
    impl MovieCatalog for Scripted {
        async fn list_popular(&self, page: u32) -> marquee_extension_core::Result<Vec<CatalogItem>> {
            match page {
                1 => Ok(vec![CatalogItem::new("1", "Alien", MediaType::Movie)]),
                2 => Err(ExtensionError::Rejected("blocked host".to_string())),
                3 => panic!("page three is cursed"),
                _ => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(vec![])
                }
            }
        }

        async fn search(&self, _query: &str, _page: u32) -> marquee_extension_core::Result<Vec<CatalogItem>> {
            Ok(vec![])
        }
    }

    impl Extension for Scripted {
        fn as_movie_catalog(self: Arc<Self>) -> Option<Arc<dyn MovieCatalog>> {
            Some(self)
        }
    }

    fn create_scripted() -> Arc<dyn Extension> {
        Arc::new(Scripted)
    }

    static SCRIPTED: ExtensionEntryPoint =
        ExtensionEntryPoint::new(&[CapabilityKind::MovieCatalog], create_scripted);

    fn fixture() -> (Arc<LoadedExtension>, ExtensionManifest) {
        let manifest = ExtensionManifest::from_str(
            "[extension]\nid = \"ext.scripted\"\napi_version = 1\nentry_point = \"Main\"\nsource = \"builtin:scripted\"\n",
        )
        .unwrap();
        let loader = ModuleLoader::new(
            BuiltinModules::new()
                .with(BuiltinModule::new("scripted").with_entry_point("Main", &SCRIPTED)),
        );
        let loaded = loader
            .load_instance(&manifest, std::path::Path::new("."), &CapabilitySet::new())
            .unwrap();
        (Arc::new(loaded), manifest)
    }

    async fn popular(
        gateway: &ExecutionGateway,
        page: u32,
    ) -> CallOutcome<Vec<CatalogItem>> {
        let (loaded, manifest) = fixture();
        gateway
            .invoke::<MovieCatalogCapability, _, _, _>(loaded, &manifest, move |c: Arc<dyn MovieCatalog>| async move {
                c.list_popular(page).await
            })
            .await
    }

    #[tokio::test]
    async fn test_success() {
        let outcome = popular(&ExecutionGateway::default(), 1).await;
        assert_eq!(outcome.value().unwrap()[0].title, "Alien");
    }

    #[tokio::test]
    async fn test_rejection_is_execution_failure() {
        let outcome = popular(&ExecutionGateway::default(), 2).await;
        let error = outcome.error().unwrap();
        assert_eq!(error.kind, CallErrorKind::ExecutionFailure);
        assert!(error.cause.as_deref().unwrap().contains("blocked host"));
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let outcome = popular(&ExecutionGateway::default(), 3).await;
        let error = outcome.error().unwrap();
        assert_eq!(error.kind, CallErrorKind::ExecutionFailure);
        assert_eq!(error.cause.as_deref(), Some("page three is cursed"));
    }

    #[tokio::test]
    async fn test_timeout() {
        let gateway = ExecutionGateway::new(Duration::from_millis(50));
        let outcome = popular(&gateway, 4).await;
        assert_eq!(outcome.error().unwrap().kind, CallErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_incompatible_version_skips_action() {
        let (loaded, mut manifest) = fixture();
        manifest.api_version = HOST_API_VERSION + 1;
        let called = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&called);

        let outcome = ExecutionGateway::default()
            .invoke::<MovieCatalogCapability, _, _, _>(loaded, &manifest, move |c: Arc<dyn MovieCatalog>| async move {
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
                c.list_popular(1).await
            })
            .await;

        assert_eq!(outcome.error().unwrap().kind, CallErrorKind::IncompatibleVersion);
        assert!(!called.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_missing_capability() {
        let (loaded, manifest) = fixture();
        let outcome = ExecutionGateway::default()
            .invoke::<TvCatalogCapability, _, _, _>(loaded, &manifest, |c: Arc<dyn TvCatalog>| async move {
                c.list_popular(1).await
            })
            .await;
        assert_eq!(outcome.error().unwrap().kind, CallErrorKind::ExecutionFailure);
    }
}
