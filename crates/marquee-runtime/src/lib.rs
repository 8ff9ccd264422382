//! # marquee-runtime
//!
//! Loading side of the Marquee extension system.
//!
//! This crate provides:
//! - Manifest reading and validation
//! - Package resolution (local paths, `file://` and `http(s)://` locators)
//! - Extension discovery from well-known directories
//! - Module loading into per-extension contexts (native libraries and
//!   compiled-in modules)
//!
//! ## Package Structure
//!
//! A package is a directory containing:
//! - `manifest.toml` - Extension identity, API version and entry point
//! - the artifact named by `source` (a shared library), unless the source is
//!   a `builtin:<module>` reference

pub mod capability;
pub mod discovery;
pub mod error;
pub mod loader;
pub mod manifest;
pub mod package;

pub use capability::{Capability, CapabilitySet, MovieCatalogCapability, TvCatalogCapability};
pub use discovery::{discover_packages, DiscoveredPackage};
pub use error::{ExtensionFailure, LoadError, ManifestError};
pub use loader::{BuiltinModule, BuiltinModules, LoadedExtension, ModuleLoader};
pub use manifest::{read_manifest, ArtifactSource, ExtensionManifest, ManifestReader};
pub use package::{DefaultResolver, PackageResolver, ResolvedPackage};
