//! Capability Registry - Content Type to Provider Resolution
//!
//! A descriptor bundles the content types it handles, the readers that turn
//! source objects into provider input, and a factory for the provider
//! itself. Lookups walk descriptors in registration order.
//!
//! A descriptor whose provider fails to construct is logged once and then
//! excluded from every later lookup. It never takes the registry down.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::content::{ContentType, ContentTypeCatalog};
use crate::providers::GraphicalProvider;
use crate::ENGINE_VERSION;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("No provider registered for content type {0}")]
    ProviderNotFound(String),

    #[error("Provider {provider} has no reader for {kind} sources")]
    ReaderNotFound { provider: String, kind: SourceKind },

    #[error("Provider {id} is misconfigured: {reason}")]
    Configuration { id: String, reason: String },

    #[error("Failed to read source: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid provider manifest {path}: {source}")]
    Manifest {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Runtime kind of a source object, used for reader dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    File,
    Text,
    Bytes,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourceKind::File => "file",
            SourceKind::Text => "text",
            SourceKind::Bytes => "bytes",
        };
        f.write_str(name)
    }
}

/// Something the consumer wants shown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    File(PathBuf),
    Text(String),
    Bytes(Vec<u8>),
}

impl Source {
    pub fn kind(&self) -> SourceKind {
        match self {
            Source::File(_) => SourceKind::File,
            Source::Text(_) => SourceKind::Text,
            Source::Bytes(_) => SourceKind::Bytes,
        }
    }
}

/// What a reader hands to a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderInput {
    Bytes(Vec<u8>),
    Location(PathBuf),
}

impl ProviderInput {
    pub fn into_bytes(self) -> io::Result<Vec<u8>> {
        match self {
            ProviderInput::Bytes(bytes) => Ok(bytes),
            ProviderInput::Location(path) => fs::read(path),
        }
    }
}

/// Converts sources of the declared kinds into provider input.
pub trait Reader: Send + Sync {
    fn name(&self) -> &str;
    fn accepts(&self) -> &[SourceKind];
    fn convert(&self, source: &Source) -> Result<ProviderInput, RegistryError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Graphical,
}

pub trait ContentProvider: Send + Sync {
    fn name(&self) -> &str;

    fn as_graphical(&self) -> Option<&dyn GraphicalProvider> {
        None
    }

    fn satisfies(&self, capability: Capability) -> bool {
        match capability {
            Capability::Graphical => self.as_graphical().is_some(),
        }
    }
}

pub type ProviderFactory = Arc<dyn Fn() -> Result<Arc<dyn ContentProvider>, RegistryError> + Send + Sync>;

pub struct ProviderDescriptor {
    id: String,
    name: String,
    associations: Vec<ContentType>,
    readers: Vec<Arc<dyn Reader>>,
    dispatch: HashMap<SourceKind, usize>,
    factory: ProviderFactory,
    instance: OnceLock<Option<Arc<dyn ContentProvider>>>,
}

impl ProviderDescriptor {
    pub fn builder(id: impl Into<String>, factory: ProviderFactory) -> DescriptorBuilder {
        let id = id.into();
        DescriptorBuilder {
            name: id.clone(),
            id,
            associations: Vec::new(),
            readers: Vec::new(),
            factory,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn associations(&self) -> &[ContentType] {
        &self.associations
    }

    pub fn reader_names(&self) -> Vec<&str> {
        self.readers.iter().map(|r| r.name()).collect()
    }

    /// The first registered reader that declared `kind`.
    pub fn resolve_reader(&self, kind: SourceKind) -> Option<Arc<dyn Reader>> {
        self.dispatch.get(&kind).map(|&idx| self.readers[idx].clone())
    }

    pub fn can_read(&self, kind: SourceKind) -> bool {
        self.dispatch.contains_key(&kind)
    }

    pub fn read(&self, source: &Source) -> Result<ProviderInput, RegistryError> {
        let reader = self.resolve_reader(source.kind()).ok_or_else(|| RegistryError::ReaderNotFound {
            provider: self.id.clone(),
            kind: source.kind(),
        })?;
        reader.convert(source)
    }

    /// Instantiates the provider on first use. `None` if construction
    /// failed, now or on an earlier call.
    pub fn provider(&self) -> Option<Arc<dyn ContentProvider>> {
        self.instance
            .get_or_init(|| match (self.factory)() {
                Ok(provider) => Some(provider),
                Err(err) => {
                    error!(
                        op = "registry::instantiate",
                        descriptor = %self.id,
                        error = %err,
                        "Could not instantiate content provider; excluding it"
                    );
                    None
                }
            })
            .clone()
    }

    pub fn graphical(&self) -> Option<Arc<dyn ContentProvider>> {
        self.provider().filter(|p| p.satisfies(Capability::Graphical))
    }
}

impl fmt::Debug for ProviderDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderDescriptor")
            .field("id", &self.id)
            .field("associations", &self.associations)
            .field("readers", &self.reader_names())
            .finish()
    }
}

pub struct DescriptorBuilder {
    id: String,
    name: String,
    associations: Vec<ContentType>,
    readers: Vec<Arc<dyn Reader>>,
    factory: ProviderFactory,
}

impl DescriptorBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn associate(mut self, content_type: ContentType) -> Self {
        self.associations.push(content_type);
        self
    }

    pub fn reader(mut self, reader: Arc<dyn Reader>) -> Self {
        self.readers.push(reader);
        self
    }

    pub fn build(self) -> ProviderDescriptor {
        let mut dispatch = HashMap::new();
        for (idx, reader) in self.readers.iter().enumerate() {
            for kind in reader.accepts() {
                dispatch.entry(*kind).or_insert(idx);
            }
        }
        ProviderDescriptor {
            id: self.id,
            name: self.name,
            associations: self.associations,
            readers: self.readers,
            dispatch,
            factory: self.factory,
            instance: OnceLock::new(),
        }
    }
}

/// Named provider factories and readers that manifests may refer to.
#[derive(Default)]
pub struct ProviderKinds {
    providers: HashMap<String, ProviderFactory>,
    readers: HashMap<String, Arc<dyn Reader>>,
}

impl ProviderKinds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provider(mut self, kind: &str, factory: ProviderFactory) -> Self {
        self.providers.insert(kind.to_string(), factory);
        self
    }

    pub fn reader(mut self, reader: Arc<dyn Reader>) -> Self {
        self.readers.insert(reader.name().to_string(), reader);
        self
    }

    pub fn get_provider(&self, kind: &str) -> Option<ProviderFactory> {
        self.providers.get(kind).cloned()
    }

    pub fn get_reader(&self, name: &str) -> Option<Arc<dyn Reader>> {
        self.readers.get(name).cloned()
    }
}

/// Declarative form of a descriptor, one JSON file per provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderManifest {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_engine_min_version")]
    pub engine_min_version: String,
    pub associations: Vec<String>,
    #[serde(default)]
    pub readers: Vec<String>,
    pub provider: String,
    /// Registers into the debug slot instead of the type-based list.
    #[serde(default)]
    pub debug: bool,
}

fn default_engine_min_version() -> String {
    crate::MIN_ENGINE_VERSION.to_string()
}

impl ProviderManifest {
    /// Builds the descriptor. Unknown types and readers are skipped with a
    /// warning; an unknown provider kind or an engine version mismatch
    /// yields a descriptor whose factory fails.
    pub fn into_descriptor(self, catalog: &ContentTypeCatalog, kinds: &ProviderKinds) -> ProviderDescriptor {
        let factory = match check_engine_version(&self.id, &self.engine_min_version) {
            Err(err) => failing_factory(err),
            Ok(()) => kinds.get_provider(&self.provider).unwrap_or_else(|| {
                failing_factory(RegistryError::Configuration {
                    id: self.id.clone(),
                    reason: format!("unknown provider kind '{}'", self.provider),
                })
            }),
        };

        let mut builder = ProviderDescriptor::builder(self.id.clone(), factory);
        if let Some(name) = self.name {
            builder = builder.name(name);
        }
        for type_id in &self.associations {
            match catalog.get(type_id) {
                Some(ty) => builder = builder.associate(ty.clone()),
                None => warn!(op = "registry::manifest", descriptor = %self.id, content_type = %type_id, "Unknown content type; association skipped"),
            }
        }
        for reader_name in &self.readers {
            match kinds.get_reader(reader_name) {
                Some(reader) => builder = builder.reader(reader),
                None => warn!(op = "registry::manifest", descriptor = %self.id, reader = %reader_name, "Unknown reader; skipped"),
            }
        }
        builder.build()
    }
}

fn failing_factory(err: RegistryError) -> ProviderFactory {
    let message = err.to_string();
    let id = match &err {
        RegistryError::Configuration { id, .. } => id.clone(),
        _ => String::new(),
    };
    Arc::new(move || -> Result<Arc<dyn ContentProvider>, RegistryError> {
        Err(RegistryError::Configuration {
            id: id.clone(),
            reason: message.clone(),
        })
    })
}

fn check_engine_version(id: &str, required: &str) -> Result<(), RegistryError> {
    let config_error = |reason: String| RegistryError::Configuration {
        id: id.to_string(),
        reason,
    };
    let engine = semver::Version::parse(ENGINE_VERSION).map_err(|_| config_error("invalid engine version".into()))?;
    let min = semver::Version::parse(required).map_err(|_| config_error(format!("invalid engineMinVersion '{required}'")))?;
    if engine < min {
        return Err(config_error(format!("requires engine >= {min}, current is {engine}")));
    }
    Ok(())
}

#[derive(Default)]
pub struct ProviderRegistry {
    descriptors: Vec<ProviderDescriptor>,
    debug: Option<ProviderDescriptor>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: ProviderDescriptor) {
        self.descriptors.push(descriptor);
    }

    pub fn register_debug(&mut self, descriptor: ProviderDescriptor) {
        self.debug = Some(descriptor);
    }

    /// The descriptor used for live runtime objects rather than files.
    pub fn debug_provider(&self) -> Option<&ProviderDescriptor> {
        self.debug.as_ref()
    }

    pub fn list(&self) -> &[ProviderDescriptor] {
        &self.descriptors
    }

    /// First descriptor associated with `target` or one of its ancestors
    /// whose provider satisfies `required`.
    pub fn find_provider(&self, target: &ContentType, required: Capability) -> Option<&ProviderDescriptor> {
        let found = self.descriptors.iter().find(|descriptor| {
            descriptor.associations.iter().any(|assoc| target.is_kind_of(assoc))
                && descriptor.provider().is_some_and(|p| p.satisfies(required))
        });
        if found.is_none() {
            debug!(op = "registry::find_provider", content_type = %target, "No provider found");
        }
        found
    }

    /// Adds every `*.json` manifest in `dir`. Unreadable or invalid files
    /// are logged and skipped. Returns how many descriptors were added.
    pub fn load_from_dir(
        &mut self,
        dir: &Path,
        catalog: &ContentTypeCatalog,
        kinds: &ProviderKinds,
    ) -> Result<usize, RegistryError> {
        if !dir.exists() {
            return Ok(0);
        }
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|e| e == "json"))
            .collect();
        paths.sort();

        let mut added = 0;
        for path in paths {
            match read_manifest(&path) {
                Ok(manifest) => {
                    let debug_slot = manifest.debug;
                    let descriptor = manifest.into_descriptor(catalog, kinds);
                    if debug_slot {
                        self.register_debug(descriptor);
                    } else {
                        self.register(descriptor);
                    }
                    added += 1;
                }
                Err(err) => {
                    warn!(op = "registry::load_from_dir", path = %path.display(), error = %err, "Skipping provider manifest");
                }
            }
        }
        Ok(added)
    }
}

fn read_manifest(path: &Path) -> Result<ProviderManifest, RegistryError> {
    let content = fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|source| RegistryError::Manifest {
        path: path.display().to_string(),
        source,
    })
}
