//! JSON-RPC API handlers for marquee-daemon.
//!
//! Extension management:
//! - `extensions.list` / `extensions.install` / `extensions.enable`
//! - `extensions.disable` / `extensions.uninstall` / `extensions.refresh`
//!
//! Catalog queries, fanned out to every enabled extension:
//! - `catalog.popular` / `catalog.search`

use std::sync::Arc;

use jsonrpsee::core::RpcResult;
use jsonrpsee::proc_macros::rpc;
use jsonrpsee::types::ErrorObjectOwned;
use marquee_extension_core::{CatalogItem, MediaType};
use marquee_extension_host::{
    AggregateError, AggregateResult, Aggregator, ExtensionRegistry, ExtensionSummary,
    RefreshReport, RegistryError,
};
use tokio::sync::RwLock;
use tracing::debug;

use crate::refresh::RefreshManager;

pub const EXTENSION_NOT_FOUND: i32 = -32010;
pub const EXTENSION_ALREADY_INSTALLED: i32 = -32011;
pub const INVALID_TRANSITION: i32 = -32012;
pub const ALL_EXTENSIONS_FAILED: i32 = -32020;
pub const REFRESH_UNAVAILABLE: i32 = -32030;

#[rpc(server)]
pub trait MarqueeApi {
    /// Every known extension, in install order.
    #[method(name = "extensions.list")]
    async fn list_extensions(&self) -> RpcResult<Vec<ExtensionSummary>>;

    /// Install the package at `locator` (path, `file://` or `http(s)://` URI).
    ///
    /// A package that fails to load is still recorded and comes back with
    /// state `failed`.
    #[method(name = "extensions.install")]
    async fn install_extension(&self, locator: String) -> RpcResult<ExtensionSummary>;

    #[method(name = "extensions.enable")]
    async fn enable_extension(&self, id: String) -> RpcResult<ExtensionSummary>;

    #[method(name = "extensions.disable")]
    async fn disable_extension(&self, id: String) -> RpcResult<ExtensionSummary>;

    #[method(name = "extensions.uninstall")]
    async fn uninstall_extension(&self, id: String) -> RpcResult<()>;

    /// Rescan the package directories now.
    #[method(name = "extensions.refresh")]
    async fn refresh_extensions(&self) -> RpcResult<RefreshReport>;

    #[method(name = "catalog.popular")]
    async fn catalog_popular(
        &self,
        media_type: MediaType,
        page: u32,
    ) -> RpcResult<AggregateResult<CatalogItem>>;

    #[method(name = "catalog.search")]
    async fn catalog_search(
        &self,
        media_type: MediaType,
        query: String,
        page: u32,
    ) -> RpcResult<AggregateResult<CatalogItem>>;
}

/// Implementation of the Marquee API.
pub struct ApiImpl {
    registry: Arc<ExtensionRegistry>,
    aggregator: Arc<Aggregator>,
    refresh_manager: Option<Arc<RwLock<RefreshManager>>>,
}

impl ApiImpl {
    pub fn new(aggregator: Arc<Aggregator>) -> Self {
        Self {
            registry: Arc::clone(aggregator.registry()),
            aggregator,
            refresh_manager: None,
        }
    }

    pub fn with_refresh_manager(mut self, manager: Arc<RwLock<RefreshManager>>) -> Self {
        self.refresh_manager = Some(manager);
        self
    }
}

fn registry_error(err: RegistryError) -> ErrorObjectOwned {
    let code = match err {
        RegistryError::NotFound(_) => EXTENSION_NOT_FOUND,
        RegistryError::AlreadyInstalled(_) => EXTENSION_ALREADY_INSTALLED,
        RegistryError::InvalidTransition { .. } => INVALID_TRANSITION,
    };
    ErrorObjectOwned::owned(code, err.to_string(), None::<()>)
}

/// All participants failing is an error; the per-extension outcomes ride
/// along as error data.
fn aggregate_response(
    result: AggregateResult<CatalogItem>,
) -> RpcResult<AggregateResult<CatalogItem>> {
    let outcomes = result.all_failed().then(|| result.outcomes.clone());
    result.into_result().map_err(|err: AggregateError| {
        ErrorObjectOwned::owned(ALL_EXTENSIONS_FAILED, err.to_string(), outcomes)
    })
}

#[jsonrpsee::core::async_trait]
impl MarqueeApiServer for ApiImpl {
    async fn list_extensions(&self) -> RpcResult<Vec<ExtensionSummary>> {
        Ok(self.registry.list_extensions())
    }

    async fn install_extension(&self, locator: String) -> RpcResult<ExtensionSummary> {
        debug!("API install request for {}", locator);
        self.registry.install(&locator).await.map_err(registry_error)
    }

    async fn enable_extension(&self, id: String) -> RpcResult<ExtensionSummary> {
        self.registry.enable(&id).await.map_err(registry_error)
    }

    async fn disable_extension(&self, id: String) -> RpcResult<ExtensionSummary> {
        self.registry.disable(&id).await.map_err(registry_error)
    }

    async fn uninstall_extension(&self, id: String) -> RpcResult<()> {
        self.registry.uninstall(&id).await.map_err(registry_error)
    }

    async fn refresh_extensions(&self) -> RpcResult<RefreshReport> {
        match self.refresh_manager {
            Some(ref manager) => Ok(manager.read().await.trigger().await),
            None => Err(ErrorObjectOwned::owned(
                REFRESH_UNAVAILABLE,
                "Refresh manager not available".to_string(),
                None::<()>,
            )),
        }
    }

    async fn catalog_popular(
        &self,
        media_type: MediaType,
        page: u32,
    ) -> RpcResult<AggregateResult<CatalogItem>> {
        let result = match media_type {
            MediaType::Movie => self.aggregator.popular_movies(page).await,
            MediaType::Tv => self.aggregator.popular_tv(page).await,
        };
        aggregate_response(result)
    }

    async fn catalog_search(
        &self,
        media_type: MediaType,
        query: String,
        page: u32,
    ) -> RpcResult<AggregateResult<CatalogItem>> {
        let result = match media_type {
            MediaType::Movie => self.aggregator.search_movies(&query, page).await,
            MediaType::Tv => self.aggregator.search_tv(&query, page).await,
        };
        aggregate_response(result)
    }
}
