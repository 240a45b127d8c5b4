//! GraphView Core - Graph Descriptions to Images
//!
//! Layout is delegated to Graphviz `dot`, an external and untrusted tool.
//!
//! # Guarantees
//! 1. A render never outlives its timeout; the tool's process group is killed
//! 2. Temporary files are removed on every exit path
//! 3. Output decides success, not the exit code
//! 4. A superseded request's result is never shown
//! 5. One render at a time, process-wide

pub mod content;
pub mod registry;
pub mod readers;
pub mod process;
pub mod prefs;
pub mod tool;
pub mod render;
pub mod invoker;
pub mod providers;
pub mod placeholder;
pub mod scheduler;
pub mod view;
pub mod hashing;

pub use content::{ContentType, ContentTypeCatalog};
pub use registry::{Capability, ContentProvider, ProviderDescriptor, ProviderRegistry, RegistryError, Source};
pub use process::{CancellationToken, ProcessCommand, ProcessOutcome, SupervisorError};
pub use prefs::{JsonFilePreferences, MemoryPreferences, PreferenceStore};
pub use tool::{ToolLocator, ToolMode};
pub use render::{FailureKind, GraphicFormat, RenderError, RenderFailure, RenderRequest, RenderResult, RenderedImage};
pub use invoker::RenderInvoker;
pub use providers::{builtin_kinds, default_registry, GraphicalProvider, SaveError};
pub use scheduler::{
    new_render_lock, ChannelContext, Delivery, ExecutionContext, InlineContext, ReloadKind, RenderConsumer,
    RenderLock, RenderSession, Scheduler,
};
pub use view::GraphicalView;
pub use hashing::{compute_render_hash, sha256_hex};

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
/// Oldest engine a provider manifest may require by default.
pub const MIN_ENGINE_VERSION: &str = "1.0.0";
