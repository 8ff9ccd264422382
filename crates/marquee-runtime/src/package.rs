//! Package resolution.
//!
//! Turns an install request (a path, a `file://` URI or an `http(s)://` URI)
//! into a locally readable package directory. Remote packages are downloaded
//! into a scratch directory that is removed when the [`ResolvedPackage`] is
//! dropped, so holding on to it is how a caller retains the copy.

use crate::error::LoadError;
use crate::manifest::{read_manifest, ArtifactSource, MANIFEST_FILE};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

/// A package available on the local filesystem.
#[derive(Debug)]
pub struct ResolvedPackage {
    path: PathBuf,
    scratch: Option<TempDir>,
}

impl ResolvedPackage {
    /// A package that already lives on disk and is not owned by the resolver.
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            scratch: None,
        }
    }

    /// A package materialized into a scratch directory.
    pub fn scratch(dir: TempDir) -> Self {
        Self {
            path: dir.path().to_path_buf(),
            scratch: Some(dir),
        }
    }

    /// The package directory (or manifest file) to read from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory artifacts are resolved against.
    pub fn root(&self) -> &Path {
        if self.path.is_dir() {
            &self.path
        } else {
            self.path.parent().unwrap_or(&self.path)
        }
    }

    /// Whether the package is a temporary copy.
    pub fn is_scratch(&self) -> bool {
        self.scratch.is_some()
    }
}

/// Resolves install requests to local packages.
#[async_trait]
pub trait PackageResolver: Send + Sync {
    async fn resolve(&self, locator: &str) -> Result<ResolvedPackage, LoadError>;
}

/// Resolver for local paths, `file://` and `http(s)://` locators.
pub struct DefaultResolver {
    http_client: reqwest::Client,
}

impl DefaultResolver {
    pub fn new() -> Self {
        Self {
            http_client: reqwest::Client::new(),
        }
    }

    fn resolve_local(&self, path: &str) -> Result<ResolvedPackage, LoadError> {
        let path = PathBuf::from(path);
        if !path.exists() {
            return Err(LoadError::SourceUnavailable(format!(
                "{} does not exist",
                path.display()
            )));
        }
        Ok(ResolvedPackage::local(path))
    }

    /// Download `{base}/manifest.toml` and, for library packages, the
    /// artifact it names.
    async fn resolve_remote(&self, base: &str) -> Result<ResolvedPackage, LoadError> {
        let base = base.trim_end_matches('/');
        let scratch = TempDir::new()
            .map_err(|e| LoadError::SourceUnavailable(format!("scratch directory: {}", e)))?;

        info!("Fetching extension package from {}", base);

        let manifest_path = scratch.path().join(MANIFEST_FILE);
        self.download(&format!("{base}/{MANIFEST_FILE}"), &manifest_path)
            .await?;

        // An unreadable manifest is reported by the manifest reader, not here.
        if let Ok(manifest) = read_manifest(&manifest_path) {
            if let ArtifactSource::Library(relative) = manifest.artifact() {
                if !is_plain_relative(&relative) {
                    return Err(LoadError::IllegalAccess(format!(
                        "artifact path {} escapes the package",
                        relative.display()
                    )));
                }
                let target = scratch.path().join(&relative);
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await.map_err(|e| {
                        LoadError::SourceUnavailable(format!("{}: {}", parent.display(), e))
                    })?;
                }
                let url = format!("{base}/{}", relative.to_string_lossy().replace('\\', "/"));
                self.download(&url, &target).await?;
            }
        }

        Ok(ResolvedPackage::scratch(scratch))
    }

    async fn download(&self, url: &str, target: &Path) -> Result<(), LoadError> {
        debug!("Downloading {} to {:?}", url, target);

        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(|e| LoadError::SourceUnavailable(format!("{url}: {e}")))?;

        if !response.status().is_success() {
            return Err(LoadError::SourceUnavailable(format!(
                "{url}: HTTP {}",
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| LoadError::SourceUnavailable(format!("{url}: {e}")))?;

        tokio::fs::write(target, &bytes)
            .await
            .map_err(|e| LoadError::SourceUnavailable(format!("{}: {}", target.display(), e)))
    }
}

impl Default for DefaultResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PackageResolver for DefaultResolver {
    async fn resolve(&self, locator: &str) -> Result<ResolvedPackage, LoadError> {
        if locator.starts_with("http://") || locator.starts_with("https://") {
            self.resolve_remote(locator).await
        } else if let Some(path) = locator.strip_prefix("file://") {
            self.resolve_local(path)
        } else {
            self.resolve_local(locator)
        }
    }
}

/// True for relative paths made only of normal components.
pub fn is_plain_relative(path: &Path) -> bool {
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_local_directory() {
        let dir = TempDir::new().unwrap();
        let resolver = DefaultResolver::new();

        let package = resolver
            .resolve(dir.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(package.path(), dir.path());
        assert_eq!(package.root(), dir.path());
        assert!(!package.is_scratch());

        let uri = format!("file://{}", dir.path().display());
        assert!(resolver.resolve(&uri).await.is_ok());
    }

    #[tokio::test]
    async fn test_resolve_missing_path() {
        let resolver = DefaultResolver::new();
        let result = resolver.resolve("/definitely/not/a/package").await;
        assert!(matches!(result, Err(LoadError::SourceUnavailable(_))));
    }

    #[test]
    fn test_scratch_removed_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().to_path_buf();
        let package = ResolvedPackage::scratch(dir);
        assert!(package.is_scratch());
        assert!(path.exists());

        drop(package);
        assert!(!path.exists());
    }

    #[test]
    fn test_is_plain_relative() {
        assert!(is_plain_relative(Path::new("libext.so")));
        assert!(is_plain_relative(Path::new("lib/x86_64/libext.so")));
        assert!(!is_plain_relative(Path::new("../libext.so")));
        assert!(!is_plain_relative(Path::new("/usr/lib/libext.so")));
        assert!(!is_plain_relative(Path::new("")));
    }
}
