//! Fan-out/fan-in over every enabled extension providing a capability.

use crate::gateway::{CallError, CallErrorKind, CallOutcome, ExecutionGateway};
use crate::registry::ExtensionRegistry;
use futures::stream::{self, StreamExt};
use marquee_extension_core::{CatalogItem, ExtensionError, MovieCatalog, TvCatalog};
use marquee_runtime::{Capability, MovieCatalogCapability, TvCatalogCapability};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Default number of extensions queried at once.
pub const DEFAULT_MAX_FAN_OUT: usize = 8;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AggregateError {
    #[error("All {0} extension(s) failed")]
    AllFailed(usize),
}

/// One extension's share of an aggregate query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionOutcome<T> {
    pub extension_id: String,
    pub outcome: CallOutcome<Vec<T>>,
}

/// Per-extension outcomes in snapshot order, plus every successful item
/// concatenated in that same order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult<T> {
    pub outcomes: Vec<ExtensionOutcome<T>>,
    pub merged: Vec<T>,
}

impl<T> AggregateResult<T> {
    pub fn empty() -> Self {
        Self {
            outcomes: Vec::new(),
            merged: Vec::new(),
        }
    }

    pub fn outcome(&self, extension_id: &str) -> Option<&CallOutcome<Vec<T>>> {
        self.outcomes
            .iter()
            .find(|o| o.extension_id == extension_id)
            .map(|o| &o.outcome)
    }

    pub fn success_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.outcome.is_success()).count()
    }

    pub fn failure_count(&self) -> usize {
        self.outcomes.len() - self.success_count()
    }

    /// True when at least one extension answered.
    pub fn has_usable_data(&self) -> bool {
        self.success_count() > 0
    }

    /// True when there were participants and none of them answered.
    pub fn all_failed(&self) -> bool {
        !self.outcomes.is_empty() && !self.has_usable_data()
    }

    /// Fail only when every participant failed. An empty participant set is
    /// an empty success.
    pub fn into_result(self) -> Result<Self, AggregateError> {
        if self.all_failed() {
            Err(AggregateError::AllFailed(self.outcomes.len()))
        } else {
            Ok(self)
        }
    }
}

/// Queries every enabled extension implementing a capability.
pub struct Aggregator {
    registry: Arc<ExtensionRegistry>,
    gateway: ExecutionGateway,
    max_fan_out: usize,
}

impl Aggregator {
    pub fn new(registry: Arc<ExtensionRegistry>, gateway: ExecutionGateway) -> Self {
        Self {
            registry,
            gateway,
            max_fan_out: DEFAULT_MAX_FAN_OUT,
        }
    }

    /// Bound the number of concurrent extension calls. Zero is treated as one.
    pub fn with_max_fan_out(mut self, max_fan_out: usize) -> Self {
        self.max_fan_out = max_fan_out.max(1);
        self
    }

    pub fn registry(&self) -> &Arc<ExtensionRegistry> {
        &self.registry
    }

    /// Dispatch `action` to every enabled extension providing `C`.
    ///
    /// Works against a snapshot taken on entry, so extensions uninstalled
    /// mid-query still complete. Never fails; see
    /// [`AggregateResult::into_result`].
    pub async fn query_all<C, T, F, Fut>(&self, action: F) -> AggregateResult<T>
    where
        C: Capability,
        T: Clone + Send + 'static,
        F: Fn(Arc<C::Handle>) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<T>, ExtensionError>> + Send + 'static,
    {
        let participants = self.registry.snapshot().providing(C::KIND);
        if participants.is_empty() {
            debug!("No enabled extensions provide {}", C::KIND);
            return AggregateResult::empty();
        }

        debug!(
            "Querying {} extension(s) for {} (fan-out {})",
            participants.len(),
            C::KIND,
            self.max_fan_out
        );

        let outcomes: Vec<ExtensionOutcome<T>> = stream::iter(participants)
            .map(|record| {
                let gateway = self.gateway.clone();
                let action = action.clone();
                async move {
                    let outcome = match (record.instance(), record.manifest()) {
                        (Some(instance), Some(manifest)) => {
                            gateway
                                .invoke::<C, _, _, _>(Arc::clone(instance), manifest, action)
                                .await
                        }
                        _ => CallOutcome::Error(CallError {
                            kind: CallErrorKind::ExecutionFailure,
                            message: format!("{} is not loaded", record.id()),
                            cause: None,
                        }),
                    };
                    ExtensionOutcome {
                        extension_id: record.id().to_string(),
                        outcome,
                    }
                }
            })
            .buffered(self.max_fan_out)
            .collect()
            .await;

        let merged = outcomes
            .iter()
            .filter_map(|o| o.outcome.value())
            .flat_map(|items| items.iter().cloned())
            .collect();

        AggregateResult { outcomes, merged }
    }

    pub async fn popular_movies(&self, page: u32) -> AggregateResult<CatalogItem> {
        self.query_all::<MovieCatalogCapability, _, _, _>(move |catalog: Arc<dyn MovieCatalog>| async move {
            catalog.list_popular(page).await
        })
        .await
    }

    pub async fn search_movies(&self, query: &str, page: u32) -> AggregateResult<CatalogItem> {
        let query = query.to_string();
        self.query_all::<MovieCatalogCapability, _, _, _>(move |catalog: Arc<dyn MovieCatalog>| {
            let query = query.clone();
            async move { catalog.search(&query, page).await }
        })
        .await
    }

    pub async fn popular_tv(&self, page: u32) -> AggregateResult<CatalogItem> {
        self.query_all::<TvCatalogCapability, _, _, _>(move |catalog: Arc<dyn TvCatalog>| async move {
            catalog.list_popular(page).await
        })
        .await
    }

    pub async fn search_tv(&self, query: &str, page: u32) -> AggregateResult<CatalogItem> {
        let query = query.to_string();
        self.query_all::<TvCatalogCapability, _, _, _>(move |catalog: Arc<dyn TvCatalog>| {
            let query = query.clone();
            async move { catalog.search(&query, page).await }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(id: &str) -> ExtensionOutcome<u32> {
        ExtensionOutcome {
            extension_id: id.to_string(),
            outcome: CallOutcome::Error(CallError {
                kind: CallErrorKind::Timeout,
                message: "slow".to_string(),
                cause: None,
            }),
        }
    }

    #[test]
    fn test_empty_is_success() {
        let result = AggregateResult::<u32>::empty();
        assert!(!result.all_failed());
        assert!(!result.has_usable_data());
        assert!(result.into_result().is_ok());
    }

    #[test]
    fn test_all_failed() {
        let result = AggregateResult {
            outcomes: vec![failed("a"), failed("b")],
            merged: Vec::<u32>::new(),
        };
        assert!(result.all_failed());
        assert_eq!(result.into_result(), Err(AggregateError::AllFailed(2)));
    }

    #[test]
    fn test_partial_failure_is_usable() {
        let result = AggregateResult {
            outcomes: vec![
                failed("a"),
                ExtensionOutcome {
                    extension_id: "b".to_string(),
                    outcome: CallOutcome::Success(vec![7]),
                },
            ],
            merged: vec![7],
        };
        assert!(result.has_usable_data());
        assert_eq!(result.failure_count(), 1);
        assert_eq!(result.outcome("b").and_then(|o| o.value()), Some(&vec![7]));
        assert!(result.into_result().is_ok());
    }
}
