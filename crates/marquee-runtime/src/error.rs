//! Error types for reading and loading extensions.

use thiserror::Error;

/// Failures while extracting metadata from a package.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManifestError {
    /// A required manifest field is absent or empty.
    #[error("Manifest is missing required field: {0}")]
    MissingField(String),

    /// `api_version` is not a non-negative integer.
    #[error("Malformed api_version: {0}")]
    MalformedVersion(String),

    /// The manifest could not be read or parsed at all.
    #[error("Manifest is unreadable: {0}")]
    Unreadable(String),
}

/// Failures while turning a validated manifest into a live instance.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// The package or its artifact does not exist or cannot be read.
    #[error("Package source unavailable: {0}")]
    SourceUnavailable(String),

    /// The entry point does not provide the required capability.
    #[error("Capability mismatch: {0}")]
    CapabilityMismatch(String),

    /// The entry point symbol is not exported by the code unit.
    #[error("Entry point not found: {0}")]
    SymbolNotFound(String),

    /// The code unit could not be mapped or its constructor failed.
    #[error("Instantiation failed: {0}")]
    InstantiationFailure(String),

    /// The artifact lies outside the locations the host may load from.
    #[error("Illegal access: {0}")]
    IllegalAccess(String),

    /// The extension was built against a newer API than the host supports.
    #[error("Extension targets API version {declared}, host supports up to {supported}")]
    IncompatibleVersion { declared: u32, supported: u32 },
}

/// Why an extension could not be brought up, as recorded by the registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtensionFailure {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Load(#[from] LoadError),
}

impl ExtensionFailure {
    pub fn is_incompatible_version(&self) -> bool {
        matches!(self, ExtensionFailure::Load(LoadError::IncompatibleVersion { .. }))
    }

    /// Short machine-readable name of the failure.
    pub fn kind(&self) -> &'static str {
        match self {
            ExtensionFailure::Manifest(ManifestError::MissingField(_)) => "missing_field",
            ExtensionFailure::Manifest(ManifestError::MalformedVersion(_)) => "malformed_version",
            ExtensionFailure::Manifest(ManifestError::Unreadable(_)) => "unreadable",
            ExtensionFailure::Load(LoadError::SourceUnavailable(_)) => "source_unavailable",
            ExtensionFailure::Load(LoadError::CapabilityMismatch(_)) => "capability_mismatch",
            ExtensionFailure::Load(LoadError::SymbolNotFound(_)) => "symbol_not_found",
            ExtensionFailure::Load(LoadError::InstantiationFailure(_)) => "instantiation_failure",
            ExtensionFailure::Load(LoadError::IllegalAccess(_)) => "illegal_access",
            ExtensionFailure::Load(LoadError::IncompatibleVersion { .. }) => "incompatible_version",
        }
    }
}
