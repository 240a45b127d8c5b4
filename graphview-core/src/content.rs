//! Content Types - Hierarchical Classifiers
//!
//! A content type names the semantic format of a source. Types form a tree:
//! `graphviz.dot` is-a `text`, `image.png` is-a `image`.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

pub const TEXT: &str = "text";
pub const IMAGE: &str = "image";
pub const DOT: &str = "graphviz.dot";

/// An immutable content classifier. Cheap to clone.
#[derive(Clone)]
pub struct ContentType {
    inner: Arc<ContentTypeInner>,
}

struct ContentTypeInner {
    id: String,
    parent: Option<ContentType>,
}

impl ContentType {
    pub fn root(id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ContentTypeInner { id: id.into(), parent: None }),
        }
    }

    pub fn child_of(id: impl Into<String>, parent: &ContentType) -> Self {
        Self {
            inner: Arc::new(ContentTypeInner {
                id: id.into(),
                parent: Some(parent.clone()),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn parent(&self) -> Option<&ContentType> {
        self.inner.parent.as_ref()
    }

    /// True when `other` is this type or one of its ancestors.
    pub fn is_kind_of(&self, other: &ContentType) -> bool {
        let mut current = Some(self);
        while let Some(ty) = current {
            if ty.id() == other.id() {
                return true;
            }
            current = ty.parent();
        }
        false
    }
}

impl PartialEq for ContentType {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for ContentType {}

impl fmt::Debug for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.parent() {
            Some(parent) => write!(f, "ContentType({} < {})", self.id(), parent.id()),
            None => write!(f, "ContentType({})", self.id()),
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Known content types plus file-extension detection.
pub struct ContentTypeCatalog {
    types: HashMap<String, ContentType>,
    extensions: HashMap<String, ContentType>,
}

impl ContentTypeCatalog {
    pub fn new() -> Self {
        Self {
            types: HashMap::new(),
            extensions: HashMap::new(),
        }
    }

    /// Registers a type under `parent` (which must already be known).
    /// Returns `None` if the parent is unknown.
    pub fn register(&mut self, id: &str, parent: Option<&str>, extensions: &[&str]) -> Option<ContentType> {
        let ty = match parent {
            Some(parent_id) => ContentType::child_of(id, self.types.get(parent_id)?),
            None => ContentType::root(id),
        };
        self.types.insert(id.to_string(), ty.clone());
        for ext in extensions {
            self.extensions.insert(ext.to_ascii_lowercase(), ty.clone());
        }
        Some(ty)
    }

    pub fn get(&self, id: &str) -> Option<&ContentType> {
        self.types.get(id)
    }

    /// Detects the content type of a file by its extension.
    pub fn detect(&self, path: &Path) -> Option<&ContentType> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        self.extensions.get(&ext)
    }

    pub fn list(&self) -> Vec<&ContentType> {
        let mut all: Vec<_> = self.types.values().collect();
        all.sort_by(|a, b| a.id().cmp(b.id()));
        all
    }
}

impl Default for ContentTypeCatalog {
    /// The built-in hierarchy: DOT documents and the raster formats the
    /// image provider understands.
    fn default() -> Self {
        let mut catalog = Self::new();
        catalog.register(TEXT, None, &["txt"]);
        catalog.register(DOT, Some(TEXT), &["dot", "gv"]);
        catalog.register(IMAGE, None, &[]);
        catalog.register("image.png", Some(IMAGE), &["png"]);
        catalog.register("image.jpeg", Some(IMAGE), &["jpg", "jpeg"]);
        catalog.register("image.gif", Some(IMAGE), &["gif"]);
        catalog.register("image.bmp", Some(IMAGE), &["bmp"]);
        catalog.register("image.tiff", Some(IMAGE), &["tif", "tiff"]);
        catalog
    }
}
