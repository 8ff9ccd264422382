//! # marquee-extension-host
//!
//! Host side of the Marquee extension system.
//!
//! - [`ExtensionRegistry`] owns the lifecycle of every extension
//! - [`ExecutionGateway`] runs single calls under a version check, timeout
//!   and fault boundary
//! - [`Aggregator`] fans a capability request out to all enabled extensions
//!   and merges what comes back
//!
//! ## Example
//!
//! ```ignore
//! use marquee_extension_host::{Aggregator, ExecutionGateway, ExtensionRegistry, MemoryStateStore};
//! use marquee_runtime::{BuiltinModules, ModuleLoader};
//! use std::sync::Arc;
//!
//! let registry = Arc::new(ExtensionRegistry::new(
//!     ModuleLoader::new(BuiltinModules::new()),
//!     Arc::new(MemoryStateStore::new()),
//! ));
//! registry.install("/path/to/package").await?;
//!
//! let aggregator = Aggregator::new(registry, ExecutionGateway::default());
//! let popular = aggregator.popular_movies(1).await;
//! for item in &popular.merged {
//!     println!("{}", item.title);
//! }
//! ```

pub mod aggregator;
pub mod gateway;
pub mod registry;
pub mod store;

pub use aggregator::{AggregateError, AggregateResult, Aggregator, ExtensionOutcome};
pub use gateway::{CallError, CallErrorKind, CallOutcome, ExecutionGateway};
pub use registry::{
    ExtensionRecord, ExtensionRegistry, ExtensionSource, ExtensionSummary, LifecycleState,
    RefreshReport, RegistryError, RegistrySnapshot,
};
pub use store::{MemoryStateStore, StateStore, StoreError, StoredState};
