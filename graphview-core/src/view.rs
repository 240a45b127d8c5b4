//! Graphical View
//!
//! Consumer-side entry point: picks a provider and reader for a source,
//! submits the render to a session and saves the loaded content on request.
//! The source is read on the render worker, never on the calling thread.
//! A source nobody can render is skipped silently.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::content::{ContentType, ContentTypeCatalog};
use crate::process::CancellationToken;
use crate::providers::{format_list, SaveError};
use crate::registry::{Capability, ContentProvider, ProviderDescriptor, ProviderRegistry, Reader, RegistryError, Source};
use crate::render::{FailureKind, GraphicFormat, RenderFailure, RenderRequest, RenderResult};
use crate::scheduler::{ExecutionContext, ReloadKind, RenderConsumer, RenderLock, RenderSession, Renderer, Scheduler};

#[derive(Clone)]
struct Loaded {
    descriptor: String,
    provider: Arc<dyn ContentProvider>,
    reader: Arc<dyn Reader>,
    source: Arc<Source>,
}

impl Loaded {
    /// Blocking: a file source is read here.
    fn input(&self) -> Result<Vec<u8>, RegistryError> {
        Ok(self.reader.convert(&self.source)?.into_bytes()?)
    }
}

pub struct GraphicalView {
    registry: Arc<ProviderRegistry>,
    catalog: Arc<ContentTypeCatalog>,
    session: RenderSession,
    lock: RenderLock,
    size: Mutex<(i32, i32)>,
    loaded: Mutex<Option<Loaded>>,
}

impl GraphicalView {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        catalog: Arc<ContentTypeCatalog>,
        scheduler: &Scheduler,
        consumer: Arc<dyn RenderConsumer>,
        context: Arc<dyn ExecutionContext>,
    ) -> Self {
        let nothing: Renderer = Arc::new(|_: &RenderRequest, _: &CancellationToken| {
            RenderResult::Failure(RenderFailure::new(FailureKind::Internal, "Nothing loaded"))
        });
        Self {
            registry,
            catalog,
            session: scheduler.session(consumer, context, nothing),
            lock: scheduler.render_lock().clone(),
            size: Mutex::new((0, 0)),
            loaded: Mutex::new(None),
        }
    }

    /// Size of the display area in pixels, passed to the next render.
    pub fn set_size(&self, width: i32, height: i32) {
        *self.size.lock() = (width, height);
    }

    pub fn session(&self) -> &RenderSession {
        &self.session
    }

    /// Shows a file, detecting its content type from the name. The file is
    /// read on the render worker.
    pub fn show_file(&self, path: &Path, reload: ReloadKind) -> bool {
        let Some(content_type) = self.catalog.detect(path) else {
            debug!(op = "view::show", path = %path.display(), "Unknown content type; skipped");
            return false;
        };
        let content_type = content_type.clone();
        self.show(Source::File(path.to_path_buf()), &content_type, reload)
    }

    /// Returns `false` when no provider or reader handles the source.
    pub fn show(&self, source: Source, content_type: &ContentType, reload: ReloadKind) -> bool {
        let Some(descriptor) = self.registry.find_provider(content_type, Capability::Graphical) else {
            return false;
        };
        self.load(descriptor, source, reload)
    }

    /// Shows a live value through the debug descriptor.
    pub fn show_value(&self, source: Source, reload: ReloadKind) -> bool {
        let Some(descriptor) = self.registry.debug_provider() else {
            debug!(op = "view::show_value", "No debug provider registered; skipped");
            return false;
        };
        self.load(descriptor, source, reload)
    }

    fn load(&self, descriptor: &ProviderDescriptor, source: Source, reload: ReloadKind) -> bool {
        let Some(reader) = descriptor.resolve_reader(source.kind()) else {
            debug!(
                op = "view::load",
                provider = %descriptor.id(),
                kind = %source.kind(),
                "No reader for source; skipped"
            );
            return false;
        };
        let Some(provider) = descriptor.graphical() else {
            return false;
        };

        let loaded = Loaded {
            descriptor: descriptor.id().to_string(),
            provider,
            reader,
            source: Arc::new(source),
        };
        *self.loaded.lock() = Some(loaded.clone());

        let (width, height) = *self.size.lock();
        let request = RenderRequest::new(Vec::new(), GraphicFormat::Png, width, height);
        let renderer: Renderer = Arc::new(move |request: &RenderRequest, cancel: &CancellationToken| {
            let Some(graphical) = loaded.provider.as_graphical() else {
                return RenderResult::Failure(RenderFailure::new(
                    FailureKind::Internal,
                    format!("{} cannot draw images", loaded.provider.name()),
                ));
            };
            let input = match loaded.input() {
                Ok(input) => input,
                Err(err) => {
                    warn!(op = "view::read", descriptor = %loaded.descriptor, error = %err, "Could not read source");
                    return RenderResult::Failure(RenderFailure::new(
                        FailureKind::Io,
                        format!("Could not read source: {err}"),
                    ));
                }
            };
            let request = RenderRequest {
                id: request.id,
                input,
                format: request.format,
                width: request.width,
                height: request.height,
                submitted_at: request.submitted_at,
            };
            graphical.load_image(&request, cancel)
        });
        self.session.submit_with(request, reload, renderer);
        true
    }

    /// Formats the loaded content can be saved in.
    pub fn supported_formats(&self) -> Vec<GraphicFormat> {
        self.loaded
            .lock()
            .as_ref()
            .and_then(|loaded| loaded.provider.as_graphical().map(|g| g.supported_formats()))
            .unwrap_or_default()
    }

    /// Writes the loaded content to `destination`, creating missing parent
    /// directories. Runs under the render lock and blocks on file I/O, so
    /// call it off the consumer's primary context.
    pub fn save(&self, destination: &Path, format: GraphicFormat) -> Result<Option<String>, SaveError> {
        let loaded = self.loaded.lock().clone().ok_or(SaveError::NothingLoaded)?;
        let graphical = loaded.provider.as_graphical().ok_or(SaveError::NothingLoaded)?;

        let supported = graphical.supported_formats();
        if !supported.contains(&format) {
            return Err(SaveError::UnsupportedFormat {
                format: format.to_string(),
                supported: format_list(&supported),
            });
        }
        prepare_destination(destination)?;

        let started_at = Instant::now();
        let _guard = self.lock.lock();
        let input = loaded.input()?;
        let warning = graphical.save_image(&input, destination, format)?;
        info!(
            op = "view::save",
            result = "ok",
            descriptor = %loaded.descriptor,
            format = %format,
            path = %destination.display(),
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "Image saved"
        );
        Ok(warning)
    }
}

fn prepare_destination(destination: &Path) -> Result<(), SaveError> {
    let invalid = |reason: &str| SaveError::InvalidDestination {
        path: destination.display().to_string(),
        reason: reason.to_string(),
    };
    if destination.is_dir() {
        return Err(invalid("is a directory"));
    }
    let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return Ok(());
    };
    if parent.exists() {
        if !parent.is_dir() {
            return Err(invalid("parent is not a directory"));
        }
        return Ok(());
    }
    fs::create_dir_all(parent).map_err(|err| invalid(&format!("could not create parent directory: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{IMAGE, TEXT};
    use crate::invoker::RenderInvoker;
    use crate::prefs::MemoryPreferences;
    use crate::providers::{builtin_kinds, default_registry, ImageProvider};
    use crate::registry::{ProviderInput, SourceKind};
    use crate::scheduler::{new_render_lock, Delivery, InlineContext};
    use image::{Rgba, RgbaImage};
    use std::io::Cursor;
    use std::sync::mpsc::{self, Receiver, Sender};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Sink(Mutex<Sender<Delivery>>);

    impl RenderConsumer for Sink {
        fn clear_image(&self) {}

        fn show(&self, delivery: Delivery) {
            let _ = self.0.lock().send(delivery);
        }
    }

    fn view(scheduler: &Scheduler) -> (GraphicalView, Receiver<Delivery>) {
        let catalog = ContentTypeCatalog::default();
        let invoker = Arc::new(RenderInvoker::new(Arc::new(MemoryPreferences::new())));
        let registry = default_registry(&catalog, &builtin_kinds(invoker));
        let (tx, rx) = mpsc::channel();
        let view = GraphicalView::new(
            Arc::new(registry),
            Arc::new(catalog),
            scheduler,
            Arc::new(Sink(Mutex::new(tx))),
            Arc::new(InlineContext),
        );
        (view, rx)
    }

    fn png() -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        RgbaImage::from_pixel(3, 2, Rgba([0, 0, 0, 255]))
            .write_to(&mut buf, image::ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_unhandled_content_is_skipped() {
        let scheduler = Scheduler::new(new_render_lock()).unwrap();
        let (view, rx) = view(&scheduler);
        let text = ContentTypeCatalog::default().get(TEXT).cloned().unwrap();
        assert!(!view.show(Source::Text("hello".into()), &text, ReloadKind::Implicit));
        assert!(!view.show_file(Path::new("notes.unknown"), ReloadKind::Implicit));
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
        assert!(matches!(view.save(Path::new("x.png"), GraphicFormat::Png), Err(SaveError::NothingLoaded)));
    }

    #[test]
    fn test_missing_reader_is_skipped() {
        let scheduler = Scheduler::new(new_render_lock()).unwrap();
        let (view, _rx) = view(&scheduler);
        let image = ContentTypeCatalog::default().get(IMAGE).cloned().unwrap();
        // The image descriptor has no text reader.
        assert!(!view.show(Source::Text("x".into()), &image, ReloadKind::Implicit));
    }

    #[test]
    fn test_image_bytes_render_and_save() {
        let scheduler = Scheduler::new(new_render_lock()).unwrap();
        let (view, rx) = view(&scheduler);
        let image = ContentTypeCatalog::default().get(IMAGE).cloned().unwrap();
        assert!(view.show(Source::Bytes(png()), &image, ReloadKind::Implicit));

        let delivery = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let shown = delivery.result.image().unwrap();
        assert_eq!((shown.width, shown.height), (3, 2));

        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a/b/out.bmp");
        view.save(&nested, GraphicFormat::Bitmap).unwrap();
        assert!(nested.is_file());

        let err = view.save(&dir.path().join("out.dot"), GraphicFormat::Dot).unwrap_err();
        assert!(matches!(err, SaveError::UnsupportedFormat { .. }));
    }

    /// Reads files like `FileBytesReader` and records the reading thread.
    struct RecordingReader(Mutex<Vec<std::thread::ThreadId>>);

    impl Reader for RecordingReader {
        fn name(&self) -> &str {
            "recording"
        }

        fn accepts(&self) -> &[SourceKind] {
            &[SourceKind::File]
        }

        fn convert(&self, source: &Source) -> Result<ProviderInput, RegistryError> {
            self.0.lock().push(std::thread::current().id());
            crate::readers::FileBytesReader.convert(source)
        }
    }

    #[test]
    fn test_file_is_read_on_the_worker() {
        let catalog = ContentTypeCatalog::default();
        let reader = Arc::new(RecordingReader(Mutex::new(Vec::new())));
        let factory: crate::registry::ProviderFactory =
            Arc::new(|| -> Result<Arc<dyn ContentProvider>, RegistryError> { Ok(Arc::new(ImageProvider)) });
        let mut registry = ProviderRegistry::new();
        registry.register(
            ProviderDescriptor::builder("recorded.image", factory)
                .associate(catalog.get(IMAGE).cloned().unwrap())
                .reader(reader.clone())
                .build(),
        );

        let scheduler = Scheduler::new(new_render_lock()).unwrap();
        let (tx, rx) = mpsc::channel();
        let view = GraphicalView::new(
            Arc::new(registry),
            Arc::new(catalog),
            &scheduler,
            Arc::new(Sink(Mutex::new(tx))),
            Arc::new(InlineContext),
        );

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("picture.png");
        fs::write(&path, png()).unwrap();
        assert!(view.show_file(&path, ReloadKind::Implicit));
        assert!(reader.0.lock().is_empty());

        let delivery = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(delivery.result.is_image());
        let readers = reader.0.lock().clone();
        assert_eq!(readers.len(), 1);
        assert_ne!(readers[0], std::thread::current().id());
    }

    #[test]
    fn test_unreadable_file_is_delivered_as_failure() {
        let scheduler = Scheduler::new(new_render_lock()).unwrap();
        let (view, rx) = view(&scheduler);
        let dir = TempDir::new().unwrap();

        assert!(view.show_file(&dir.path().join("missing.png"), ReloadKind::Implicit));
        let delivery = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(delivery.result.failure().unwrap().kind, FailureKind::Io);

        let err = view.save(&dir.path().join("out.png"), GraphicFormat::Png).unwrap_err();
        assert!(matches!(err, SaveError::Registry(RegistryError::Io(_))));
    }

    #[test]
    fn test_save_rejects_bad_destinations() {
        let scheduler = Scheduler::new(new_render_lock()).unwrap();
        let (view, _rx) = view(&scheduler);
        let image = ContentTypeCatalog::default().get(IMAGE).cloned().unwrap();
        view.show(Source::Bytes(png()), &image, ReloadKind::Implicit);

        let dir = TempDir::new().unwrap();
        let err = view.save(dir.path(), GraphicFormat::Png).unwrap_err();
        assert!(matches!(err, SaveError::InvalidDestination { .. }));

        let file = dir.path().join("plain");
        fs::write(&file, b"x").unwrap();
        let err = view.save(&file.join("out.png"), GraphicFormat::Png).unwrap_err();
        assert!(matches!(err, SaveError::InvalidDestination { .. }));
    }
}
