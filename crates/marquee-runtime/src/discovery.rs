//! Extension discovery from well-known paths.
//!
//! Packages are discovered from the following locations (in order):
//!
//! 1. Directories passed in by the host configuration
//! 2. `$XDG_DATA_HOME/marquee/extensions/` (user extensions)
//! 3. `$XDG_DATA_DIRS/marquee/extensions/` (system extensions)
//!
//! Each package is a directory containing a `manifest.toml` file. Earlier
//! locations win when two packages share an id.

use crate::error::ManifestError;
use crate::manifest::{read_manifest, ExtensionManifest, MANIFEST_FILE};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A package found on disk.
#[derive(Debug, Clone)]
pub struct DiscoveredPackage {
    /// Path to the package directory.
    pub path: PathBuf,

    /// The manifest, or why it could not be read.
    pub manifest: Result<ExtensionManifest, ManifestError>,
}

impl DiscoveredPackage {
    /// Locator string used to install this package.
    pub fn locator(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }
}

/// Get the user extensions directory.
pub fn user_extensions_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("com", "marquee-app", "marquee")
        .map(|dirs| dirs.data_dir().join("extensions"))
}

/// Get the system extensions directories.
pub fn system_extensions_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();

    if let Ok(data_dirs) = std::env::var("XDG_DATA_DIRS") {
        for dir in data_dirs.split(':').filter(|d| !d.is_empty()) {
            let ext_dir = PathBuf::from(dir).join("marquee/extensions");
            if ext_dir.exists() {
                dirs.push(ext_dir);
            }
        }
    }

    for dir in ["/usr/local/share/marquee/extensions", "/usr/share/marquee/extensions"] {
        let path = PathBuf::from(dir);
        if path.exists() && !dirs.contains(&path) {
            dirs.push(path);
        }
    }

    dirs
}

/// The configured directories followed by the well-known ones.
pub fn search_dirs(configured: &[PathBuf]) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = configured.to_vec();
    if let Some(user_dir) = user_extensions_dir() {
        if !dirs.contains(&user_dir) {
            dirs.push(user_dir);
        }
    }
    for dir in system_extensions_dirs() {
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    }
    dirs
}

/// Discover packages in the given directories, in priority order.
pub fn discover_packages(dirs: &[PathBuf]) -> Vec<DiscoveredPackage> {
    let mut packages = Vec::new();
    let mut seen_ids = HashSet::new();

    for dir in dirs {
        debug!("Scanning extensions directory: {:?}", dir);
        discover_in_directory(dir, &mut packages, &mut seen_ids);
    }

    info!("Discovered {} extension package(s)", packages.len());
    packages
}

/// Discover packages in a specific directory.
pub fn discover_in_directory(
    dir: &Path,
    packages: &mut Vec<DiscoveredPackage>,
    seen_ids: &mut HashSet<String>,
) {
    if !dir.exists() {
        return;
    }

    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            warn!("Failed to read extensions directory {:?}: {}", dir, e);
            return;
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    // read_dir order is platform dependent; keep install order reproducible.
    paths.sort();

    for path in paths {
        if !path.join(MANIFEST_FILE).exists() {
            debug!("Skipping {:?}: no {}", path, MANIFEST_FILE);
            continue;
        }

        match read_manifest(&path) {
            Ok(manifest) => {
                if !seen_ids.insert(manifest.id.clone()) {
                    debug!("Skipping duplicate extension: {}", manifest.id);
                    continue;
                }

                info!(
                    "Discovered extension: {} v{} at {:?}",
                    manifest.name, manifest.version, path
                );
                packages.push(DiscoveredPackage {
                    path,
                    manifest: Ok(manifest),
                });
            }
            Err(e) => {
                warn!("Failed to read manifest in {:?}: {}", path, e);
                packages.push(DiscoveredPackage {
                    path,
                    manifest: Err(e),
                });
            }
        }
    }
}
