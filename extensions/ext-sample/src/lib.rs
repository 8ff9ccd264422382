//! # ext-sample
//!
//! A sample catalog extension for testing and development.
//!
//! Returns static fixture data and never touches the network. It implements
//! both `MovieCatalog` and `TvCatalog`, and is usable two ways:
//!
//! - compiled into the host as the `builtin:sample` module, using
//!   [`MarqueeSampleMain`] and [`BUILTIN_MANIFEST`]
//! - built as a `cdylib` and installed as a package with the `manifest.toml`
//!   next to this crate

use async_trait::async_trait;
use chrono::NaiveDate;
use marquee_extension_core::prelude::*;
use marquee_extension_core::export_extension;
use std::sync::Arc;

/// Name of the built-in module the host registers this extension under.
pub const MODULE_NAME: &str = "sample";

/// Entry point symbol, as named in the manifest.
pub const ENTRY_POINT: &str = "MarqueeSampleMain";

/// Manifest used when the extension is compiled into the host.
pub const BUILTIN_MANIFEST: &str = r#"
[extension]
id = "app.marquee.sample"
name = "Sample Catalog"
version = "0.1.0"
author = "marquee-app"
description = "Static movies and shows for testing"
api_version = 1
entry_point = "MarqueeSampleMain"
source = "builtin:sample"
capabilities = ["movie_catalog", "tv_catalog"]
"#;

/// Items per page.
const PAGE_SIZE: usize = 4;

/// A catalog extension that serves static data.
#[derive(Default)]
pub struct SampleCatalog;

impl SampleCatalog {
    pub fn new() -> Self {
        Self
    }

    fn movies() -> Vec<CatalogItem> {
        [
            ("tt0083658", "Blade Runner", 1982, 6, 25, 8.1, "A blade runner must pursue and terminate four replicants."),
            ("tt0062622", "2001: A Space Odyssey", 1968, 4, 2, 8.3, "A voyage to Jupiter with the sentient computer HAL."),
            ("tt0078748", "Alien", 1979, 5, 25, 8.5, "The crew of a commercial spacecraft encounters a deadly lifeform."),
            ("tt0133093", "The Matrix", 1999, 3, 31, 8.7, "A hacker learns the true nature of his reality."),
            ("tt0816692", "Interstellar", 2014, 11, 7, 8.7, "Explorers travel through a wormhole in search of a new home."),
            ("tt0118884", "Contact", 1997, 7, 11, 7.5, "A radio astronomer receives the first message from the stars."),
        ]
        .into_iter()
        .map(|(id, title, y, m, d, rating, overview)| {
            let mut item = CatalogItem::new(id, title, MediaType::Movie);
            item.overview = Some(overview.to_string());
            item.release_date = NaiveDate::from_ymd_opt(y, m, d);
            item.rating = Some(rating);
            item.url = Some(format!("https://www.imdb.com/title/{id}/"));
            item.metadata
                .insert("provider".to_string(), "sample".to_string());
            item
        })
        .collect()
    }

    fn shows() -> Vec<CatalogItem> {
        [
            ("tt0306414", "The Wire", 2002, 6, 2, 9.3),
            ("tt0903747", "Breaking Bad", 2008, 1, 20, 9.5),
            ("tt0141842", "The Sopranos", 1999, 1, 10, 9.2),
            ("tt0348914", "Deadwood", 2004, 3, 21, 8.6),
            ("tt0411008", "Lost", 2004, 9, 22, 8.3),
        ]
        .into_iter()
        .map(|(id, title, y, m, d, rating)| {
            let mut item = CatalogItem::new(id, title, MediaType::Tv);
            item.release_date = NaiveDate::from_ymd_opt(y, m, d);
            item.rating = Some(rating);
            item.url = Some(format!("https://www.imdb.com/title/{id}/"));
            item.metadata
                .insert("provider".to_string(), "sample".to_string());
            item
        })
        .collect()
    }
}

/// Pages are 1-based; page 0 is rejected.
fn paginate(mut items: Vec<CatalogItem>, page: u32) -> Result<Vec<CatalogItem>> {
    if page == 0 {
        return Err(ExtensionError::Rejected("page numbers start at 1".to_string()));
    }
    let start = (page as usize - 1) * PAGE_SIZE;
    if start >= items.len() {
        return Ok(Vec::new());
    }
    let end = (start + PAGE_SIZE).min(items.len());
    Ok(items.drain(start..end).collect())
}

fn matching(items: Vec<CatalogItem>, query: &str) -> Vec<CatalogItem> {
    let query = query.trim().to_lowercase();
    items
        .into_iter()
        .filter(|item| item.title.to_lowercase().contains(&query))
        .collect()
}

fn by_rating(mut items: Vec<CatalogItem>) -> Vec<CatalogItem> {
    items.sort_by(|a, b| {
        b.rating
            .partial_cmp(&a.rating)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    items
}

#[async_trait]
impl MovieCatalog for SampleCatalog {
    async fn list_popular(&self, page: u32) -> Result<Vec<CatalogItem>> {
        paginate(by_rating(Self::movies()), page)
    }

    async fn search(&self, query: &str, page: u32) -> Result<Vec<CatalogItem>> {
        paginate(matching(Self::movies(), query), page)
    }
}

#[async_trait]
impl TvCatalog for SampleCatalog {
    async fn list_popular(&self, page: u32) -> Result<Vec<CatalogItem>> {
        paginate(by_rating(Self::shows()), page)
    }

    async fn search(&self, query: &str, page: u32) -> Result<Vec<CatalogItem>> {
        paginate(matching(Self::shows(), query), page)
    }
}

impl Extension for SampleCatalog {
    fn as_movie_catalog(self: Arc<Self>) -> Option<Arc<dyn MovieCatalog>> {
        Some(self)
    }

    fn as_tv_catalog(self: Arc<Self>) -> Option<Arc<dyn TvCatalog>> {
        Some(self)
    }
}

export_extension!(
    MarqueeSampleMain,
    SampleCatalog,
    [CapabilityKind::MovieCatalog, CapabilityKind::TvCatalog]
);

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_popular_movies_paged_by_rating() {
        let catalog = SampleCatalog::new();

        let first = MovieCatalog::list_popular(&catalog, 1).await.unwrap();
        assert_eq!(first.len(), PAGE_SIZE);
        assert!(first[0].rating >= first[1].rating);

        let second = MovieCatalog::list_popular(&catalog, 2).await.unwrap();
        assert_eq!(second.len(), 2);

        let past_end = MovieCatalog::list_popular(&catalog, 3).await.unwrap();
        assert!(past_end.is_empty());
    }

    #[tokio::test]
    async fn test_page_zero_rejected() {
        let catalog = SampleCatalog::new();
        let result = TvCatalog::list_popular(&catalog, 0).await;
        assert!(matches!(result, Err(ExtensionError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_search_is_case_insensitive() {
        let catalog = SampleCatalog::new();

        let movies = MovieCatalog::search(&catalog, "matrix", 1).await.unwrap();
        assert_eq!(movies.len(), 1);
        assert_eq!(movies[0].title, "The Matrix");

        let shows = TvCatalog::search(&catalog, "THE", 1).await.unwrap();
        assert_eq!(shows.len(), 2);
        assert!(shows.iter().all(|s| s.media_type == MediaType::Tv));
    }

    #[test]
    fn test_entry_point_declares_both_capabilities() {
        assert!(MarqueeSampleMain.declares(CapabilityKind::MovieCatalog));
        assert!(MarqueeSampleMain.declares(CapabilityKind::TvCatalog));

        let instance = (MarqueeSampleMain.create)();
        assert!(instance.clone().as_movie_catalog().is_some());
        assert!(instance.as_tv_catalog().is_some());
    }
}
