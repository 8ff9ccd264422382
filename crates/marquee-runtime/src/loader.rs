//! Module loading.
//!
//! Every extension is loaded into its own context: a native shared library
//! opened through its own handle (symbols stay local to that handle), or a
//! compiled-in [`BuiltinModule`] whose symbol table is private to the module.
//! Two extensions exporting the same entry point name never see each other's
//! symbol.

use crate::capability::{implements, Capability, CapabilitySet};
use crate::error::LoadError;
use crate::manifest::{ArtifactSource, ExtensionManifest};
use crate::package::is_plain_relative;
use libloading::Library;
use marquee_extension_core::{
    CapabilityKind, CreateFn, Extension, ExtensionEntryPoint, CORE_VERSION, HOST_API_VERSION,
};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A compiled-in module exposing entry points by name.
#[derive(Debug, Clone)]
pub struct BuiltinModule {
    name: String,
    symbols: HashMap<String, &'static ExtensionEntryPoint>,
}

impl BuiltinModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            symbols: HashMap::new(),
        }
    }

    /// Export an entry point under `symbol`.
    pub fn with_entry_point(
        mut self,
        symbol: impl Into<String>,
        entry: &'static ExtensionEntryPoint,
    ) -> Self {
        self.symbols.insert(symbol.into(), entry);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn resolve(&self, symbol: &str) -> Option<&'static ExtensionEntryPoint> {
        self.symbols.get(symbol).copied()
    }
}

/// The set of compiled-in modules the host can load from.
#[derive(Debug, Clone, Default)]
pub struct BuiltinModules {
    modules: HashMap<String, Arc<BuiltinModule>>,
}

impl BuiltinModules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, module: BuiltinModule) {
        self.modules
            .insert(module.name.clone(), Arc::new(module));
    }

    pub fn with(mut self, module: BuiltinModule) -> Self {
        self.register(module);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<BuiltinModule>> {
        self.modules.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }
}

/// What keeps an instance's code available.
enum LoadingContext {
    Native { library: Library, path: PathBuf },
    Builtin(Arc<BuiltinModule>),
}

impl LoadingContext {
    fn kind(&self) -> &'static str {
        match self {
            LoadingContext::Native { .. } => "native",
            LoadingContext::Builtin(_) => "builtin",
        }
    }
}

impl std::fmt::Debug for LoadingContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadingContext::Native { path, .. } => f.debug_tuple("Native").field(path).finish(),
            LoadingContext::Builtin(module) => f.debug_tuple("Builtin").field(&module.name).finish(),
        }
    }
}

/// A live extension instance and the context its code lives in.
pub struct LoadedExtension {
    // Dropped before `context` so native code outlives the instance.
    instance: Arc<dyn Extension>,
    capabilities: CapabilitySet,
    entry_point: String,
    context: LoadingContext,
}

impl LoadedExtension {
    pub fn instance(&self) -> &Arc<dyn Extension> {
        &self.instance
    }

    /// Capabilities the entry point declared and the instance implements.
    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    /// `"native"` or `"builtin"`.
    pub fn context_kind(&self) -> &'static str {
        self.context.kind()
    }

    /// Project the instance onto a typed capability.
    pub fn project<C: Capability>(&self) -> Option<Arc<C::Handle>> {
        C::project(&self.instance)
    }
}

impl std::fmt::Debug for LoadedExtension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedExtension")
            .field("entry_point", &self.entry_point)
            .field("capabilities", &self.capabilities.names())
            .field("context", &self.context)
            .finish()
    }
}

/// Entry point fields copied out of the loading context.
struct ResolvedEntry {
    capabilities: Vec<CapabilityKind>,
    create: CreateFn,
}

impl ResolvedEntry {
    fn from_static(entry: &ExtensionEntryPoint) -> Self {
        Self {
            capabilities: entry.capabilities.to_vec(),
            create: entry.create,
        }
    }
}

/// Loads extension code units and instantiates their entry points.
#[derive(Debug, Clone, Default)]
pub struct ModuleLoader {
    builtins: BuiltinModules,
    allowed_roots: Vec<PathBuf>,
}

impl ModuleLoader {
    pub fn new(builtins: BuiltinModules) -> Self {
        Self {
            builtins,
            allowed_roots: Vec::new(),
        }
    }

    /// Restrict native artifacts to these directories. Empty means any
    /// location inside the package.
    pub fn with_allowed_roots(mut self, roots: Vec<PathBuf>) -> Self {
        self.allowed_roots = roots;
        self
    }

    pub fn builtins(&self) -> &BuiltinModules {
        &self.builtins
    }

    /// Checks that need only the manifest: the API version and the
    /// capability names. Returns the capabilities the manifest declares.
    pub fn check_manifest(manifest: &ExtensionManifest) -> Result<CapabilitySet, LoadError> {
        if manifest.api_version > HOST_API_VERSION {
            return Err(LoadError::IncompatibleVersion {
                declared: manifest.api_version,
                supported: HOST_API_VERSION,
            });
        }

        manifest.capability_set().map_err(|name| {
            LoadError::CapabilityMismatch(format!("unknown capability '{name}' in manifest"))
        })
    }

    /// Load the code unit named by `manifest` and instantiate its entry point.
    ///
    /// `package_root` is the directory relative artifact paths resolve
    /// against. `expected` lists the capabilities the caller requires; an
    /// empty set accepts any capability the host knows, as long as the entry
    /// point declares at least one.
    pub fn load_instance(
        &self,
        manifest: &ExtensionManifest,
        package_root: &Path,
        expected: &CapabilitySet,
    ) -> Result<LoadedExtension, LoadError> {
        let declared_in_manifest = Self::check_manifest(manifest)?;

        let (context, entry) = match manifest.artifact() {
            ArtifactSource::Builtin(module) => self.open_builtin(&module, &manifest.entry_point)?,
            ArtifactSource::Library(relative) => {
                self.open_native(package_root, &relative, &manifest.entry_point)?
            }
        };

        let declared: CapabilitySet = entry.capabilities.iter().copied().collect();
        if declared.is_empty() {
            return Err(LoadError::CapabilityMismatch(format!(
                "{} declares no capabilities",
                manifest.entry_point
            )));
        }
        for required in [expected, &declared_in_manifest] {
            if let Some(missing) = required.iter().find(|kind| !declared.has(**kind)) {
                return Err(LoadError::CapabilityMismatch(format!(
                    "{} does not declare {}",
                    manifest.entry_point, missing
                )));
            }
        }

        let instance = instantiate(entry.create, &manifest.entry_point)?;

        if let Some(missing) = declared.iter().find(|kind| !implements(&instance, **kind)) {
            warn!(
                "Extension {} declares {} but does not implement it",
                manifest.id, missing
            );
            return Err(LoadError::CapabilityMismatch(format!(
                "{} declares {} but the instance does not implement it",
                manifest.entry_point, missing
            )));
        }

        info!(
            "Loaded extension {} ({} context, capabilities: {:?})",
            manifest.id,
            context.kind(),
            declared.names()
        );

        Ok(LoadedExtension {
            instance,
            capabilities: declared,
            entry_point: manifest.entry_point.clone(),
            context,
        })
    }

    fn open_builtin(
        &self,
        module: &str,
        symbol: &str,
    ) -> Result<(LoadingContext, ResolvedEntry), LoadError> {
        let module = self
            .builtins
            .get(module)
            .ok_or_else(|| LoadError::SourceUnavailable(format!("no built-in module '{module}'")))?;

        let entry = module.resolve(symbol).ok_or_else(|| {
            LoadError::SymbolNotFound(format!("{} in built-in module {}", symbol, module.name))
        })?;
        debug!(
            "Resolved {} in built-in module {}: {:?}",
            symbol, module.name, entry
        );
        check_core_version(symbol, entry.core_version)?;

        Ok((
            LoadingContext::Builtin(Arc::clone(&module)),
            ResolvedEntry::from_static(entry),
        ))
    }

    fn open_native(
        &self,
        package_root: &Path,
        relative: &Path,
        symbol: &str,
    ) -> Result<(LoadingContext, ResolvedEntry), LoadError> {
        if !is_plain_relative(relative) {
            return Err(LoadError::IllegalAccess(format!(
                "artifact path {} escapes the package",
                relative.display()
            )));
        }

        let path = package_root.join(relative);
        if !path.is_file() {
            return Err(LoadError::SourceUnavailable(format!(
                "{} does not exist",
                path.display()
            )));
        }
        std::fs::File::open(&path)
            .map_err(|e| LoadError::SourceUnavailable(format!("{}: {}", path.display(), e)))?;

        let canonical = path
            .canonicalize()
            .map_err(|e| LoadError::SourceUnavailable(format!("{}: {}", path.display(), e)))?;
        let canonical_root = package_root.canonicalize().map_err(|e| {
            LoadError::SourceUnavailable(format!("{}: {}", package_root.display(), e))
        })?;

        if !canonical.starts_with(&canonical_root) {
            return Err(LoadError::IllegalAccess(format!(
                "{} resolves outside the package",
                path.display()
            )));
        }

        let allowed = self.allowed_roots.is_empty()
            || self.allowed_roots.iter().any(|root| {
                root.canonicalize()
                    .map(|root| canonical.starts_with(root))
                    .unwrap_or(false)
            });
        if !allowed {
            return Err(LoadError::IllegalAccess(format!(
                "{} is not within an allowed extension root",
                canonical.display()
            )));
        }

        debug!("Opening native library {:?}", canonical);

        // SAFETY: loading runs the library's initializers. The artifact has
        // been confined to the package and the allowed roots above.
        let library = unsafe { Library::new(&canonical) }.map_err(|e| {
            LoadError::InstantiationFailure(format!("failed to load {}: {}", canonical.display(), e))
        })?;

        // SAFETY: the symbol is the address of an `ExtensionEntryPoint`
        // static exported by `export_extension!`.
        let entry_ptr = unsafe {
            library
                .get::<*const ExtensionEntryPoint>(symbol.as_bytes())
                .map(|sym| *sym)
        }
        .map_err(|e| LoadError::SymbolNotFound(format!("{symbol}: {e}")))?;

        if entry_ptr.is_null() {
            return Err(LoadError::SymbolNotFound(format!("{symbol} is null")));
        }

        // SAFETY: non-null and valid while `library` is mapped. Only the
        // version is read before it has been compared with ours.
        let entry = unsafe { &*entry_ptr };
        check_core_version(symbol, entry.core_version)?;
        let resolved = ResolvedEntry::from_static(entry);

        Ok((
            LoadingContext::Native {
                library,
                path: canonical,
            },
            resolved,
        ))
    }
}

fn check_core_version(symbol: &str, core_version: &str) -> Result<(), LoadError> {
    if core_version == CORE_VERSION {
        Ok(())
    } else {
        Err(LoadError::InstantiationFailure(format!(
            "{symbol} was built against core {core_version}, host uses {CORE_VERSION}"
        )))
    }
}

fn instantiate(create: CreateFn, symbol: &str) -> Result<Arc<dyn Extension>, LoadError> {
    panic::catch_unwind(AssertUnwindSafe(create)).map_err(|payload| {
        let message = panic_message(payload.as_ref());
        warn!("Constructor {} panicked: {}", symbol, message);
        LoadError::InstantiationFailure(format!("{symbol} panicked: {message}"))
    })
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use marquee_extension_core::{CatalogItem, MediaType, MovieCatalog, Result};
    use tempfile::TempDir;

    #[derive(Default)]
    struct Movies;

    #[async_trait]
    impl MovieCatalog for Movies {
        async fn list_popular(&self, _page: u32) -> Result<Vec<CatalogItem>> {
            Ok(vec![CatalogItem::new("1", "Heat", MediaType::Movie)])
        }

        async fn search(&self, _query: &str, _page: u32) -> Result<Vec<CatalogItem>> {
            Ok(vec![])
        }
    }

    impl Extension for Movies {
        fn as_movie_catalog(self: Arc<Self>) -> Option<Arc<dyn MovieCatalog>> {
            Some(self)
        }
    }

    #[derive(Default)]
    struct Hollow;

    impl Extension for Hollow {}

    fn create_movies() -> Arc<dyn Extension> {
        Arc::new(Movies)
    }

    fn create_hollow() -> Arc<dyn Extension> {
        Arc::new(Hollow)
    }

    fn create_panicking() -> Arc<dyn Extension> {
        panic!("constructor exploded")
    }

    static MOVIES: ExtensionEntryPoint =
        ExtensionEntryPoint::new(&[CapabilityKind::MovieCatalog], create_movies);
    static HOLLOW: ExtensionEntryPoint =
        ExtensionEntryPoint::new(&[CapabilityKind::MovieCatalog], create_hollow);
    static PANICKING: ExtensionEntryPoint =
        ExtensionEntryPoint::new(&[CapabilityKind::MovieCatalog], create_panicking);
    static UNDECLARED: ExtensionEntryPoint = ExtensionEntryPoint::new(&[], create_movies);

    fn loader() -> ModuleLoader {
        ModuleLoader::new(
            BuiltinModules::new().with(
                BuiltinModule::new("test")
                    .with_entry_point("Movies", &MOVIES)
                    .with_entry_point("Hollow", &HOLLOW)
                    .with_entry_point("Panicking", &PANICKING)
                    .with_entry_point("Undeclared", &UNDECLARED),
            ),
        )
    }

    fn manifest(entry_point: &str, source: &str) -> ExtensionManifest {
        ExtensionManifest::from_str(&format!(
            "[extension]\nid = \"ext.test\"\napi_version = 1\nentry_point = \"{entry_point}\"\nsource = \"{source}\"\n"
        ))
        .unwrap()
    }

    fn movies_only() -> CapabilitySet {
        [CapabilityKind::MovieCatalog].into_iter().collect()
    }

    #[tokio::test]
    async fn test_load_builtin() {
        let dir = TempDir::new().unwrap();
        let loaded = loader()
            .load_instance(&manifest("Movies", "builtin:test"), dir.path(), &movies_only())
            .unwrap();

        assert_eq!(loaded.context_kind(), "builtin");
        assert!(loaded.capabilities().has(CapabilityKind::MovieCatalog));

        let catalog = loaded
            .project::<crate::capability::MovieCatalogCapability>()
            .unwrap();
        let items = catalog.list_popular(1).await.unwrap();
        assert_eq!(items[0].title, "Heat");
    }

    #[test]
    fn test_two_loads_are_independent() {
        let dir = TempDir::new().unwrap();
        let loader = loader();
        let m = manifest("Movies", "builtin:test");

        let a = loader.load_instance(&m, dir.path(), &movies_only()).unwrap();
        let b = loader.load_instance(&m, dir.path(), &movies_only()).unwrap();
        assert!(!Arc::ptr_eq(a.instance(), b.instance()));
    }

    #[test]
    fn test_incompatible_version() {
        let dir = TempDir::new().unwrap();
        let mut m = manifest("Movies", "builtin:test");
        m.api_version = 99;

        let err = loader()
            .load_instance(&m, dir.path(), &movies_only())
            .unwrap_err();
        assert_eq!(
            err,
            LoadError::IncompatibleVersion {
                declared: 99,
                supported: HOST_API_VERSION
            }
        );
    }

    #[test]
    fn test_missing_module_and_symbol() {
        let dir = TempDir::new().unwrap();
        let loader = loader();

        let err = loader
            .load_instance(&manifest("Movies", "builtin:other"), dir.path(), &movies_only())
            .unwrap_err();
        assert!(matches!(err, LoadError::SourceUnavailable(_)));

        let err = loader
            .load_instance(&manifest("Nope", "builtin:test"), dir.path(), &movies_only())
            .unwrap_err();
        assert!(matches!(err, LoadError::SymbolNotFound(_)));
    }

    #[test]
    fn test_capability_mismatch() {
        let dir = TempDir::new().unwrap();
        let loader = loader();
        let tv: CapabilitySet = [CapabilityKind::TvCatalog].into_iter().collect();

        let err = loader
            .load_instance(&manifest("Movies", "builtin:test"), dir.path(), &tv)
            .unwrap_err();
        assert!(matches!(err, LoadError::CapabilityMismatch(_)));

        let err = loader
            .load_instance(&manifest("Hollow", "builtin:test"), dir.path(), &movies_only())
            .unwrap_err();
        assert!(matches!(err, LoadError::CapabilityMismatch(_)));

        let err = loader
            .load_instance(&manifest("Undeclared", "builtin:test"), dir.path(), &CapabilitySet::new())
            .unwrap_err();
        assert!(matches!(err, LoadError::CapabilityMismatch(_)));
    }

    #[test]
    fn test_unknown_manifest_capability() {
        let dir = TempDir::new().unwrap();
        let mut m = manifest("Movies", "builtin:test");
        m.capabilities = vec!["music".to_string()];

        let err = loader()
            .load_instance(&m, dir.path(), &CapabilitySet::new())
            .unwrap_err();
        assert!(matches!(err, LoadError::CapabilityMismatch(_)));
    }

    #[test]
    fn test_panicking_constructor() {
        let dir = TempDir::new().unwrap();
        let err = loader()
            .load_instance(&manifest("Panicking", "builtin:test"), dir.path(), &movies_only())
            .unwrap_err();

        match err {
            LoadError::InstantiationFailure(message) => {
                assert!(message.contains("constructor exploded"))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_native_path_escape() {
        let dir = TempDir::new().unwrap();
        let err = loader()
            .load_instance(&manifest("Main", "../libevil.so"), dir.path(), &movies_only())
            .unwrap_err();
        assert!(matches!(err, LoadError::IllegalAccess(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_native_symlink_escape() {
        let outside = TempDir::new().unwrap();
        let package = TempDir::new().unwrap();
        let target = outside.path().join("libreal.so");
        std::fs::write(&target, b"\x7fELF").unwrap();
        std::os::unix::fs::symlink(&target, package.path().join("libext.so")).unwrap();

        let err = loader()
            .load_instance(&manifest("Main", "libext.so"), package.path(), &movies_only())
            .unwrap_err();
        assert!(matches!(err, LoadError::IllegalAccess(_)));
    }

    #[test]
    fn test_native_outside_allowed_roots() {
        let allowed = TempDir::new().unwrap();
        let package = TempDir::new().unwrap();
        std::fs::write(package.path().join("libext.so"), b"not a library").unwrap();

        let loader = loader().with_allowed_roots(vec![allowed.path().to_path_buf()]);
        let err = loader
            .load_instance(&manifest("Main", "libext.so"), package.path(), &movies_only())
            .unwrap_err();
        assert!(matches!(err, LoadError::IllegalAccess(_)));
    }

    #[test]
    fn test_native_missing_artifact() {
        let dir = TempDir::new().unwrap();
        let err = loader()
            .load_instance(&manifest("Main", "libmissing.so"), dir.path(), &movies_only())
            .unwrap_err();
        assert!(matches!(err, LoadError::SourceUnavailable(_)));
    }

    #[test]
    fn test_native_garbage_library() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("libgarbage.so"), b"definitely not ELF").unwrap();

        let err = loader()
            .load_instance(&manifest("Main", "libgarbage.so"), dir.path(), &movies_only())
            .unwrap_err();
        assert!(matches!(err, LoadError::InstantiationFailure(_)));
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("boom"));
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
