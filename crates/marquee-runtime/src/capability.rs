//! Capability interfaces the host can query extensions through.
//!
//! A capability pairs a [`CapabilityKind`] name with the trait object an
//! extension hands out for it. The loader uses the names to check an entry
//! point's declaration; the aggregator uses the typed projection to reach the
//! trait methods.

use marquee_extension_core::{CapabilityKind, Extension, MovieCatalog, TvCatalog};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// A typed capability interface.
pub trait Capability: Send + Sync + 'static {
    /// The trait object callers receive.
    type Handle: ?Sized + Send + Sync + 'static;

    const KIND: CapabilityKind;

    /// Project an instance onto this capability, if it implements it.
    fn project(instance: &Arc<dyn Extension>) -> Option<Arc<Self::Handle>>;
}

/// Movie listing and search.
pub struct MovieCatalogCapability;

impl Capability for MovieCatalogCapability {
    type Handle = dyn MovieCatalog;

    const KIND: CapabilityKind = CapabilityKind::MovieCatalog;

    fn project(instance: &Arc<dyn Extension>) -> Option<Arc<Self::Handle>> {
        Arc::clone(instance).as_movie_catalog()
    }
}

/// TV show listing and search.
pub struct TvCatalogCapability;

impl Capability for TvCatalogCapability {
    type Handle = dyn TvCatalog;

    const KIND: CapabilityKind = CapabilityKind::TvCatalog;

    fn project(instance: &Arc<dyn Extension>) -> Option<Arc<Self::Handle>> {
        Arc::clone(instance).as_tv_catalog()
    }
}

/// Check whether a live instance implements the named capability.
pub fn implements(instance: &Arc<dyn Extension>, kind: CapabilityKind) -> bool {
    match kind {
        CapabilityKind::MovieCatalog => MovieCatalogCapability::project(instance).is_some(),
        CapabilityKind::TvCatalog => TvCatalogCapability::project(instance).is_some(),
    }
}

/// All capability kinds the host knows about.
pub const ALL_KINDS: [CapabilityKind; 2] = [CapabilityKind::MovieCatalog, CapabilityKind::TvCatalog];

/// A set of capabilities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    capabilities: HashSet<CapabilityKind>,
}

impl CapabilitySet {
    /// Create an empty capability set.
    pub fn new() -> Self {
        Self {
            capabilities: HashSet::new(),
        }
    }

    /// Create a capability set from capability names.
    ///
    /// Returns the first name the host does not recognize as the error.
    pub fn from_strings<I, S>(strings: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut capabilities = HashSet::new();
        for s in strings {
            let s = s.as_ref();
            match CapabilityKind::parse(s) {
                Some(kind) => {
                    capabilities.insert(kind);
                }
                None => return Err(s.to_string()),
            }
        }
        Ok(Self { capabilities })
    }

    /// The capabilities a live instance actually projects to.
    pub fn of_instance(instance: &Arc<dyn Extension>) -> Self {
        ALL_KINDS
            .into_iter()
            .filter(|kind| implements(instance, *kind))
            .collect()
    }

    /// Add a capability to the set.
    pub fn add(&mut self, cap: CapabilityKind) {
        self.capabilities.insert(cap);
    }

    /// Check if the set contains a capability.
    pub fn has(&self, cap: CapabilityKind) -> bool {
        self.capabilities.contains(&cap)
    }

    /// Check if this set is a superset of another.
    pub fn contains_all(&self, other: &CapabilitySet) -> bool {
        other.capabilities.is_subset(&self.capabilities)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CapabilityKind> {
        self.capabilities.iter()
    }

    /// Capability names in a stable order, for display.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.capabilities.iter().map(|c| c.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}

impl FromIterator<CapabilityKind> for CapabilitySet {
    fn from_iter<T: IntoIterator<Item = CapabilityKind>>(iter: T) -> Self {
        Self {
            capabilities: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use marquee_extension_core::{CatalogItem, Result};

    struct TvOnly;

    #[async_trait]
    impl TvCatalog for TvOnly {
        async fn list_popular(&self, _page: u32) -> Result<Vec<CatalogItem>> {
            Ok(vec![])
        }

        async fn search(&self, _query: &str, _page: u32) -> Result<Vec<CatalogItem>> {
            Ok(vec![])
        }
    }

    impl Extension for TvOnly {
        fn as_tv_catalog(self: Arc<Self>) -> Option<Arc<dyn TvCatalog>> {
            Some(self)
        }
    }

    #[test]
    fn test_from_strings() {
        let set = CapabilitySet::from_strings(["movie_catalog", "tv_catalog"]).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.names(), vec!["movie_catalog", "tv_catalog"]);

        let err = CapabilitySet::from_strings(["movie_catalog", "music"]).unwrap_err();
        assert_eq!(err, "music");
    }

    #[test]
    fn test_of_instance() {
        let instance: Arc<dyn Extension> = Arc::new(TvOnly);
        let set = CapabilitySet::of_instance(&instance);

        assert!(set.has(CapabilityKind::TvCatalog));
        assert!(!set.has(CapabilityKind::MovieCatalog));
        assert!(TvCatalogCapability::project(&instance).is_some());
        assert!(MovieCatalogCapability::project(&instance).is_none());
    }

    #[test]
    fn test_contains_all() {
        let both: CapabilitySet = ALL_KINDS.into_iter().collect();
        let movies: CapabilitySet = [CapabilityKind::MovieCatalog].into_iter().collect();

        assert!(both.contains_all(&movies));
        assert!(!movies.contains_all(&both));
        assert!(movies.contains_all(&CapabilitySet::new()));
    }
}
