//! Graphical Providers
//!
//! `DotProvider` lays graphs out through the external tool. `ImageProvider`
//! shows content that is already a raster image.

use std::fs;
use std::io::{self, Cursor};
use std::path::Path;
use std::sync::Arc;

use image::DynamicImage;
use thiserror::Error;

use crate::content::{ContentTypeCatalog, DOT, IMAGE};
use crate::invoker::RenderInvoker;
use crate::process::CancellationToken;
use crate::readers::{BytesReader, FileBytesReader, FileLocationReader, TextBytesReader};
use crate::registry::{
    ContentProvider, ProviderDescriptor, ProviderFactory, ProviderKinds, ProviderRegistry, RegistryError,
};
use crate::render::{FailureKind, GraphicFormat, RenderError, RenderFailure, RenderRequest, RenderResult, RenderedImage};

pub const DOT_PROVIDER: &str = "graphviz-dot";
pub const IMAGE_PROVIDER: &str = "image";

#[derive(Debug, Error)]
pub enum SaveError {
    #[error("Invalid file path {path}: {reason}")]
    InvalidDestination { path: String, reason: String },

    #[error("Unsupported format {format}. Supported formats are: {supported}")]
    UnsupportedFormat { format: String, supported: String },

    #[error("Nothing loaded to save")]
    NothingLoaded,

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Image conversion failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("Error saving image: {0}")]
    Io(#[from] io::Error),
}

/// A provider that turns its input into a displayable image.
pub trait GraphicalProvider: Send + Sync {
    /// Produces the image for `request`. May run on a worker thread.
    fn load_image(&self, request: &RenderRequest, cancel: &CancellationToken) -> RenderResult;

    /// Writes `input` to `destination` in `format`. Returns a non-fatal
    /// warning, if any.
    fn save_image(&self, input: &[u8], destination: &Path, format: GraphicFormat) -> Result<Option<String>, SaveError>;

    fn supported_formats(&self) -> Vec<GraphicFormat> {
        GraphicFormat::RASTER.to_vec()
    }
}

pub struct DotProvider {
    invoker: Arc<RenderInvoker>,
}

impl DotProvider {
    pub fn new(invoker: Arc<RenderInvoker>) -> Self {
        Self { invoker }
    }
}

impl ContentProvider for DotProvider {
    fn name(&self) -> &str {
        DOT_PROVIDER
    }

    fn as_graphical(&self) -> Option<&dyn GraphicalProvider> {
        Some(self)
    }
}

impl GraphicalProvider for DotProvider {
    fn load_image(&self, request: &RenderRequest, cancel: &CancellationToken) -> RenderResult {
        self.invoker
            .render_cancellable(&request.input, request.format, request.width, request.height, cancel)
    }

    fn save_image(&self, input: &[u8], destination: &Path, format: GraphicFormat) -> Result<Option<String>, SaveError> {
        if format == GraphicFormat::Dot {
            fs::write(destination, input)?;
            return Ok(None);
        }
        Ok(self.invoker.generate(input, format, 0, 0, destination)?)
    }

    fn supported_formats(&self) -> Vec<GraphicFormat> {
        let mut formats = GraphicFormat::RASTER.to_vec();
        formats.push(GraphicFormat::Dot);
        formats
    }
}

/// Shows raster input as-is and converts it on save.
pub struct ImageProvider;

impl ContentProvider for ImageProvider {
    fn name(&self) -> &str {
        IMAGE_PROVIDER
    }

    fn as_graphical(&self) -> Option<&dyn GraphicalProvider> {
        Some(self)
    }
}

impl GraphicalProvider for ImageProvider {
    fn load_image(&self, request: &RenderRequest, _cancel: &CancellationToken) -> RenderResult {
        let probed = image::ImageReader::new(Cursor::new(&request.input))
            .with_guessed_format()
            .map_err(image::ImageError::IoError)
            .and_then(|reader| {
                let format = reader.format();
                reader.into_dimensions().map(|dims| (format, dims))
            });
        match probed {
            Ok((format, (width, height))) => RenderResult::Image(RenderedImage {
                bytes: request.input.clone(),
                width,
                height,
                format: format.and_then(graphic_format).unwrap_or(request.format),
                warning: None,
            }),
            Err(err) => RenderResult::Failure(RenderFailure::new(
                FailureKind::Internal,
                format!("Could not decode image: {err}"),
            )),
        }
    }

    fn save_image(&self, input: &[u8], destination: &Path, format: GraphicFormat) -> Result<Option<String>, SaveError> {
        let target = format.image_format().ok_or_else(|| SaveError::UnsupportedFormat {
            format: format.to_string(),
            supported: format_list(&self.supported_formats()),
        })?;
        let decoded = image::load_from_memory(input)?;
        let decoded = match format {
            // JPEG has no alpha channel.
            GraphicFormat::Jpeg => DynamicImage::ImageRgb8(decoded.to_rgb8()),
            _ => decoded,
        };
        decoded.save_with_format(destination, target)?;
        Ok(None)
    }
}

fn graphic_format(format: image::ImageFormat) -> Option<GraphicFormat> {
    match format {
        image::ImageFormat::Png => Some(GraphicFormat::Png),
        image::ImageFormat::Jpeg => Some(GraphicFormat::Jpeg),
        image::ImageFormat::Gif => Some(GraphicFormat::Gif),
        image::ImageFormat::Tiff => Some(GraphicFormat::Tiff),
        image::ImageFormat::Bmp => Some(GraphicFormat::Bitmap),
        _ => None,
    }
}

pub fn format_list(formats: &[GraphicFormat]) -> String {
    formats.iter().map(|f| f.extension()).collect::<Vec<_>>().join(", ")
}

/// Provider kinds and readers that manifests can name.
pub fn builtin_kinds(invoker: Arc<RenderInvoker>) -> ProviderKinds {
    let dot: ProviderFactory = Arc::new(move || -> Result<Arc<dyn ContentProvider>, RegistryError> {
        Ok(Arc::new(DotProvider::new(invoker.clone())))
    });
    let image: ProviderFactory =
        Arc::new(|| -> Result<Arc<dyn ContentProvider>, RegistryError> { Ok(Arc::new(ImageProvider)) });

    ProviderKinds::new()
        .provider(DOT_PROVIDER, dot)
        .provider(IMAGE_PROVIDER, image)
        .reader(Arc::new(FileBytesReader))
        .reader(Arc::new(FileLocationReader))
        .reader(Arc::new(TextBytesReader))
        .reader(Arc::new(BytesReader))
}

/// The DOT and image descriptors, plus a DOT debug descriptor for
/// in-memory text.
pub fn default_registry(catalog: &ContentTypeCatalog, kinds: &ProviderKinds) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    let reader = |name: &str| kinds.get_reader(name);

    if let (Some(dot_type), Some(factory)) = (catalog.get(DOT), kinds.get_provider(DOT_PROVIDER)) {
        let mut builder = ProviderDescriptor::builder("graphviz.dot", factory.clone())
            .name("Graphviz DOT")
            .associate(dot_type.clone());
        for name in [crate::readers::FILE_BYTES, crate::readers::TEXT_BYTES, crate::readers::BYTES] {
            if let Some(r) = reader(name) {
                builder = builder.reader(r);
            }
        }
        registry.register(builder.build());

        let mut debug = ProviderDescriptor::builder("graphviz.debug", factory).name("Graphviz DOT (live value)");
        for name in [crate::readers::TEXT_BYTES, crate::readers::BYTES] {
            if let Some(r) = reader(name) {
                debug = debug.reader(r);
            }
        }
        registry.register_debug(debug.build());
    }

    if let (Some(image_type), Some(factory)) = (catalog.get(IMAGE), kinds.get_provider(IMAGE_PROVIDER)) {
        let mut builder = ProviderDescriptor::builder("image", factory)
            .name("Raster image")
            .associate(image_type.clone());
        for name in [crate::readers::FILE_BYTES, crate::readers::BYTES] {
            if let Some(r) = reader(name) {
                builder = builder.reader(r);
            }
        }
        registry.register(builder.build());
    }

    registry
}
