//! Extension manifest reading.
//!
//! Each package has a `manifest.toml` describing the extension's identity,
//! the API version it was built against and the entry point to instantiate.
//!
//! ```toml
//! [extension]
//! id = "ext.a"
//! name = "Extension A"
//! version = "1.0.0"
//! author = "someone"
//! api_version = 1
//! entry_point = "MainA"
//! source = "libext_a.so"
//! capabilities = ["movie_catalog"]
//! ```
//!
//! Reading never instantiates code and never returns a raw I/O or parse
//! error: everything is folded into [`ManifestError`].

use crate::capability::CapabilitySet;
use crate::error::{ExtensionFailure, ManifestError};
use crate::package::{PackageResolver, ResolvedPackage};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// File name of the manifest inside a package directory.
pub const MANIFEST_FILE: &str = "manifest.toml";

/// Prefix of a `source` that names a compiled-in module.
pub const BUILTIN_PREFIX: &str = "builtin:";

/// Validated, immutable extension descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionManifest {
    /// Globally unique identifier, typically a reverse-domain namespace.
    pub id: String,

    pub name: String,

    /// Version string (semver).
    pub version: String,

    pub author: String,

    pub description: Option<String>,

    /// API version the extension was built against.
    pub api_version: u32,

    /// Name of the entry point symbol to instantiate.
    pub entry_point: String,

    /// Locator of the loadable artifact, relative to the package.
    pub source: String,

    /// Capabilities the extension declares. Informational until load time.
    pub capabilities: Vec<String>,
}

/// Where an extension's code lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactSource {
    /// A module compiled into the host binary.
    Builtin(String),

    /// A shared library, relative to the package directory.
    Library(PathBuf),
}

impl ExtensionManifest {
    /// Parse a manifest from TOML text.
    pub fn from_str(content: &str) -> Result<Self, ManifestError> {
        let table: toml::Table = content
            .parse()
            .map_err(|e: toml::de::Error| ManifestError::Unreadable(e.to_string()))?;

        let empty = toml::Table::new();
        let section = match table.get("extension") {
            Some(toml::Value::Table(section)) => section,
            Some(_) => {
                return Err(ManifestError::Unreadable(
                    "[extension] must be a table".to_string(),
                ))
            }
            None => &empty,
        };

        let id = required_string(section, "id")?;
        let entry_point = required_string(section, "entry_point")?;
        let api_version = parse_api_version(section.get("api_version"))?;

        let name = optional_string(section, "name")?.unwrap_or_else(|| id.clone());
        let version = optional_string(section, "version")?.unwrap_or_else(|| "0.0.0".to_string());
        let author = optional_string(section, "author")?.unwrap_or_else(|| "unknown".to_string());
        let description = optional_string(section, "description")?;
        let source =
            optional_string(section, "source")?.unwrap_or_else(|| format!("{BUILTIN_PREFIX}{id}"));

        let capabilities = match section.get("capabilities") {
            None => Vec::new(),
            Some(toml::Value::Array(values)) => values
                .iter()
                .map(|v| {
                    v.as_str().map(str::to_string).ok_or_else(|| {
                        ManifestError::Unreadable("capabilities must be strings".to_string())
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(_) => {
                return Err(ManifestError::Unreadable(
                    "capabilities must be an array".to_string(),
                ))
            }
        };

        Ok(Self {
            id,
            name,
            version,
            author,
            description,
            api_version,
            entry_point,
            source,
            capabilities,
        })
    }

    /// Where the extension's code lives.
    pub fn artifact(&self) -> ArtifactSource {
        match self.source.strip_prefix(BUILTIN_PREFIX) {
            Some(module) => ArtifactSource::Builtin(module.to_string()),
            None => ArtifactSource::Library(PathBuf::from(&self.source)),
        }
    }

    /// Declared capabilities; the first unknown name is returned as the error.
    pub fn capability_set(&self) -> Result<CapabilitySet, String> {
        CapabilitySet::from_strings(&self.capabilities)
    }
}

fn required_string(section: &toml::Table, field: &str) -> Result<String, ManifestError> {
    match section.get(field) {
        None => Err(ManifestError::MissingField(field.to_string())),
        Some(toml::Value::String(s)) if s.trim().is_empty() => {
            Err(ManifestError::MissingField(field.to_string()))
        }
        Some(toml::Value::String(s)) => Ok(s.trim().to_string()),
        Some(other) => Err(ManifestError::Unreadable(format!(
            "{field} must be a string, found {}",
            other.type_str()
        ))),
    }
}

fn optional_string(section: &toml::Table, field: &str) -> Result<Option<String>, ManifestError> {
    match section.get(field) {
        None => Ok(None),
        Some(toml::Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(toml::Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(other) => Err(ManifestError::Unreadable(format!(
            "{field} must be a string, found {}",
            other.type_str()
        ))),
    }
}

fn parse_api_version(value: Option<&toml::Value>) -> Result<u32, ManifestError> {
    match value {
        None => Err(ManifestError::MissingField("api_version".to_string())),
        Some(toml::Value::Integer(n)) => {
            u32::try_from(*n).map_err(|_| ManifestError::MalformedVersion(n.to_string()))
        }
        Some(toml::Value::String(s)) if s.trim().is_empty() => {
            Err(ManifestError::MissingField("api_version".to_string()))
        }
        Some(toml::Value::String(s)) => s
            .trim()
            .parse::<u32>()
            .map_err(|_| ManifestError::MalformedVersion(s.clone())),
        Some(other) => Err(ManifestError::MalformedVersion(other.to_string())),
    }
}

/// Read the manifest of a local package.
///
/// `location` is either a package directory or the manifest file itself.
pub fn read_manifest(location: &Path) -> Result<ExtensionManifest, ManifestError> {
    let manifest_path = if location.is_dir() {
        location.join(MANIFEST_FILE)
    } else {
        location.to_path_buf()
    };

    debug!("Reading manifest from {:?}", manifest_path);

    let bytes = std::fs::read(&manifest_path).map_err(|e| {
        ManifestError::Unreadable(format!("{}: {}", manifest_path.display(), e))
    })?;
    let content = String::from_utf8(bytes)
        .map_err(|e| ManifestError::Unreadable(format!("not UTF-8: {}", e)))?;

    ExtensionManifest::from_str(&content)
}

/// Reads manifests from any locator the resolver understands.
///
/// Remote packages are materialized into a scratch directory for the duration
/// of the read; [`ManifestReader::read_retained`] hands that directory to the
/// caller instead of deleting it.
#[derive(Clone)]
pub struct ManifestReader {
    resolver: Arc<dyn PackageResolver>,
}

impl ManifestReader {
    pub fn new(resolver: Arc<dyn PackageResolver>) -> Self {
        Self { resolver }
    }

    /// Read a manifest; any scratch copy is removed before returning.
    pub async fn read(&self, locator: &str) -> Result<ExtensionManifest, ExtensionFailure> {
        let (manifest, _package) = self.read_retained(locator).await?;
        Ok(manifest)
    }

    /// Read a manifest and keep the resolved package for loading.
    ///
    /// On failure the package is dropped, which removes any scratch copy.
    pub async fn read_retained(
        &self,
        locator: &str,
    ) -> Result<(ExtensionManifest, ResolvedPackage), ExtensionFailure> {
        let package = self.resolver.resolve(locator).await?;
        let manifest = read_manifest(package.path())?;
        Ok((manifest, package))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_manifest() {
        let toml = r#"
[extension]
id = "ext.a"
name = "Extension A"
version = "1.2.0"
author = "Jane"
description = "Popular movies"
api_version = 1
entry_point = "MainA"
source = "libext_a.so"
capabilities = ["movie_catalog"]
"#;

        let manifest = ExtensionManifest::from_str(toml).unwrap();
        assert_eq!(manifest.id, "ext.a");
        assert_eq!(manifest.name, "Extension A");
        assert_eq!(manifest.api_version, 1);
        assert_eq!(manifest.entry_point, "MainA");
        assert_eq!(
            manifest.artifact(),
            ArtifactSource::Library(PathBuf::from("libext_a.so"))
        );
        assert_eq!(manifest.capability_set().unwrap().len(), 1);
    }

    #[test]
    fn test_optional_fields_default() {
        let toml = r#"
[extension]
id = "ext.min"
api_version = 1
entry_point = "Main"
"#;

        let manifest = ExtensionManifest::from_str(toml).unwrap();
        assert_eq!(manifest.name, "ext.min");
        assert_eq!(manifest.version, "0.0.0");
        assert_eq!(manifest.author, "unknown");
        assert!(manifest.description.is_none());
        assert_eq!(
            manifest.artifact(),
            ArtifactSource::Builtin("ext.min".to_string())
        );
    }

    #[test]
    fn test_missing_required_fields() {
        let cases = [
            ("api_version = 1\nentry_point = \"Main\"", "id"),
            ("id = \"x\"\napi_version = 1", "entry_point"),
            ("id = \"x\"\nentry_point = \"Main\"", "api_version"),
            ("id = \"\"\napi_version = 1\nentry_point = \"Main\"", "id"),
        ];

        for (body, field) in cases {
            let toml = format!("[extension]\n{body}\n");
            assert_eq!(
                ExtensionManifest::from_str(&toml),
                Err(ManifestError::MissingField(field.to_string())),
                "case: {body}"
            );
        }
    }

    #[test]
    fn test_missing_section_reports_id() {
        assert_eq!(
            ExtensionManifest::from_str("title = \"nothing here\""),
            Err(ManifestError::MissingField("id".to_string()))
        );
    }

    #[test]
    fn test_api_version_forms() {
        let parse = |v: &str| {
            ExtensionManifest::from_str(&format!(
                "[extension]\nid = \"x\"\nentry_point = \"M\"\napi_version = {v}\n"
            ))
        };

        assert_eq!(parse("\"2\"").unwrap().api_version, 2);
        assert!(matches!(parse("\"one\""), Err(ManifestError::MalformedVersion(_))));
        assert!(matches!(parse("1.5"), Err(ManifestError::MalformedVersion(_))));
        assert!(matches!(parse("-1"), Err(ManifestError::MalformedVersion(_))));
        assert!(matches!(parse("true"), Err(ManifestError::MalformedVersion(_))));
    }

    #[test]
    fn test_garbage_is_unreadable() {
        assert!(matches!(
            ExtensionManifest::from_str("this is [not toml"),
            Err(ManifestError::Unreadable(_))
        ));
    }

    #[test]
    fn test_read_manifest_from_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(MANIFEST_FILE),
            "[extension]\nid = \"ext.dir\"\napi_version = 1\nentry_point = \"Main\"\n",
        )
        .unwrap();

        let manifest = read_manifest(dir.path()).unwrap();
        assert_eq!(manifest.id, "ext.dir");

        let missing = read_manifest(&dir.path().join("nope"));
        assert!(matches!(missing, Err(ManifestError::Unreadable(_))));
    }
}
