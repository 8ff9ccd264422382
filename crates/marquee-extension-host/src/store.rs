//! Persistence hook for lifecycle state.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

/// What the registry remembers about an extension across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredState {
    pub id: String,
    pub is_enabled: bool,
    /// Install position, used to keep discovery order stable.
    pub position: u64,
}

#[derive(Error, Debug)]
#[error("State store error: {0}")]
pub struct StoreError(pub String);

/// Key-value persistence of [`StoredState`] by extension id.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, id: &str) -> Result<Option<StoredState>, StoreError>;

    async fn load_all(&self) -> Result<Vec<StoredState>, StoreError>;

    async fn save(&self, state: &StoredState) -> Result<(), StoreError>;

    async fn remove(&self, id: &str) -> Result<(), StoreError>;
}

/// In-memory store, for tests and hosts without persistence.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    states: RwLock<HashMap<String, StoredState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store, e.g. with state carried over from a previous run.
    pub fn with_states(states: impl IntoIterator<Item = StoredState>) -> Self {
        Self {
            states: RwLock::new(states.into_iter().map(|s| (s.id.clone(), s)).collect()),
        }
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, id: &str) -> Result<Option<StoredState>, StoreError> {
        Ok(self.states.read().await.get(id).cloned())
    }

    async fn load_all(&self) -> Result<Vec<StoredState>, StoreError> {
        let mut states: Vec<_> = self.states.read().await.values().cloned().collect();
        states.sort_by_key(|s| s.position);
        Ok(states)
    }

    async fn save(&self, state: &StoredState) -> Result<(), StoreError> {
        self.states
            .write()
            .await
            .insert(state.id.clone(), state.clone());
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        self.states.write().await.remove(id);
        Ok(())
    }
}
