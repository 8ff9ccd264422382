//! # marquee-extension-core
//!
//! Core traits and types shared by the Marquee host and its catalog extensions.
//!
//! Extension authors depend on this crate only. It defines:
//!
//! - [`CatalogItem`] - A movie or show returned by an extension
//! - [`Extension`] - The base trait every extension implements
//! - Capability traits: [`MovieCatalog`], [`TvCatalog`]
//! - [`ExtensionEntryPoint`] - The no-argument constructor the host resolves by name
//! - [`export_extension!`] - Exports an entry point from a `cdylib`

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// The extension API version this host build implements.
///
/// Extensions declare the version they were built against in their manifest;
/// anything newer than this is refused.
pub const HOST_API_VERSION: u32 = 1;

/// Version of this crate, stamped into every entry point so the host can
/// refuse code built against a different core layout.
pub const CORE_VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// Error Types
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtensionError {
    /// The extension refused the operation for security reasons.
    #[error("Operation rejected: {0}")]
    Rejected(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Failed to parse upstream response: {0}")]
    Parse(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Provider error: {0}")]
    Provider(String),
}

pub type Result<T> = std::result::Result<T, ExtensionError>;

// ============================================================================
// Catalog Types
// ============================================================================

/// Kind of media a catalog item describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Movie,
    Tv,
}

/// A movie or show supplied by an extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogItem {
    /// Identifier local to the extension that produced it.
    pub id: String,
    pub title: String,
    pub media_type: MediaType,
    pub overview: Option<String>,
    pub poster_url: Option<String>,
    pub release_date: Option<NaiveDate>,
    /// Average rating on a 0-10 scale.
    pub rating: Option<f32>,
    pub url: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl CatalogItem {
    pub fn new(id: impl Into<String>, title: impl Into<String>, media_type: MediaType) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            media_type,
            overview: None,
            poster_url: None,
            release_date: None,
            rating: None,
            url: None,
            metadata: HashMap::new(),
        }
    }
}

// ============================================================================
// Capabilities
// ============================================================================

/// Names of the capability interfaces an extension may implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    MovieCatalog,
    TvCatalog,
}

impl CapabilityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityKind::MovieCatalog => "movie_catalog",
            CapabilityKind::TvCatalog => "tv_catalog",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "movie_catalog" => Some(CapabilityKind::MovieCatalog),
            "tv_catalog" => Some(CapabilityKind::TvCatalog),
            _ => None,
        }
    }
}

impl std::fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extensions that list and search movies.
///
/// Pages are 1-based. Implementations must be safe to call concurrently.
#[async_trait]
pub trait MovieCatalog: Send + Sync {
    async fn list_popular(&self, page: u32) -> Result<Vec<CatalogItem>>;

    async fn search(&self, query: &str, page: u32) -> Result<Vec<CatalogItem>>;
}

/// Extensions that list and search TV shows.
#[async_trait]
pub trait TvCatalog: Send + Sync {
    async fn list_popular(&self, page: u32) -> Result<Vec<CatalogItem>>;

    async fn search(&self, query: &str, page: u32) -> Result<Vec<CatalogItem>>;
}

/// Base trait for all extensions.
///
/// An extension exposes each capability it implements by overriding the
/// matching `as_*` projection. The host never downcasts; a projection that
/// returns `None` means the capability is not implemented.
pub trait Extension: Send + Sync + 'static {
    fn as_movie_catalog(self: Arc<Self>) -> Option<Arc<dyn MovieCatalog>> {
        None
    }

    fn as_tv_catalog(self: Arc<Self>) -> Option<Arc<dyn TvCatalog>> {
        None
    }
}

// ============================================================================
// Entry Points
// ============================================================================

/// Constructor signature for an extension entry point.
pub type CreateFn = fn() -> Arc<dyn Extension>;

/// The symbol an extension exports under the name given as `entry_point` in
/// its manifest.
///
/// The host resolves this declaration, checks `core_version` and the declared
/// capabilities, then calls `create` with no arguments.
#[repr(C)]
#[derive(Debug)]
pub struct ExtensionEntryPoint {
    pub core_version: &'static str,
    pub capabilities: &'static [CapabilityKind],
    pub create: CreateFn,
}

impl ExtensionEntryPoint {
    pub const fn new(capabilities: &'static [CapabilityKind], create: CreateFn) -> Self {
        Self {
            core_version: CORE_VERSION,
            capabilities,
            create,
        }
    }

    pub fn declares(&self, kind: CapabilityKind) -> bool {
        self.capabilities.contains(&kind)
    }
}

/// Export an entry point from an extension library.
///
/// ```ignore
/// #[derive(Default)]
/// struct MyExtension;
/// impl Extension for MyExtension { /* ... */ }
///
/// marquee_extension_core::export_extension!(MyMain, MyExtension, [CapabilityKind::MovieCatalog]);
/// ```
///
/// The manifest then names `MyMain` as its `entry_point`. The extension type
/// must implement `Default`.
#[macro_export]
macro_rules! export_extension {
    ($symbol:ident, $ty:ty, [$($cap:expr),* $(,)?]) => {
        #[no_mangle]
        #[allow(non_upper_case_globals)]
        pub static $symbol: $crate::ExtensionEntryPoint = $crate::ExtensionEntryPoint::new(&[$($cap),*], {
            fn __marquee_create() -> ::std::sync::Arc<dyn $crate::Extension> {
                ::std::sync::Arc::new(<$ty as ::std::default::Default>::default())
            }
            __marquee_create
        });
    };
}

// ============================================================================
// Re-exports
// ============================================================================

pub mod prelude {
    pub use crate::{
        CapabilityKind, CatalogItem, Extension, ExtensionEntryPoint, ExtensionError, MediaType,
        MovieCatalog, Result, TvCatalog, HOST_API_VERSION,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct MoviesOnly;

    #[async_trait]
    impl MovieCatalog for MoviesOnly {
        async fn list_popular(&self, page: u32) -> Result<Vec<CatalogItem>> {
            Ok(vec![CatalogItem::new(
                format!("m-{page}"),
                "Movie",
                MediaType::Movie,
            )])
        }

        async fn search(&self, _query: &str, _page: u32) -> Result<Vec<CatalogItem>> {
            Err(ExtensionError::NotSupported("search".to_string()))
        }
    }

    impl Extension for MoviesOnly {
        fn as_movie_catalog(self: Arc<Self>) -> Option<Arc<dyn MovieCatalog>> {
            Some(self)
        }
    }

    export_extension!(TestMoviesOnly, MoviesOnly, [CapabilityKind::MovieCatalog]);

    #[test]
    fn test_capability_kind_roundtrip() {
        for kind in [CapabilityKind::MovieCatalog, CapabilityKind::TvCatalog] {
            assert_eq!(CapabilityKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(CapabilityKind::parse("music"), None);
    }

    #[test]
    fn test_exported_entry_point() {
        assert_eq!(TestMoviesOnly.core_version, CORE_VERSION);
        assert!(TestMoviesOnly.declares(CapabilityKind::MovieCatalog));
        assert!(!TestMoviesOnly.declares(CapabilityKind::TvCatalog));
    }

    #[tokio::test]
    async fn test_projection() {
        let ext = (TestMoviesOnly.create)();
        assert!(ext.clone().as_tv_catalog().is_none());

        let movies = ext.as_movie_catalog().unwrap();
        let items = movies.list_popular(2).await.unwrap();
        assert_eq!(items[0].id, "m-2");
    }
}
