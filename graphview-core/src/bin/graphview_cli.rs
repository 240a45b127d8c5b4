//! GraphView CLI - Bridge interface for scripts and editors
//!
//! Commands: providers, locate, render, save, prefs
//! Outputs JSON to stdout, logs to stderr
//! Exit codes: 0 success, 1 usage or configuration error, 2 render/save failure

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing_subscriber::{filter::LevelFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use graphview_core::{
    builtin_kinds, compute_render_hash, default_registry, placeholder, sha256_hex, ContentTypeCatalog, Delivery,
    GraphicFormat, GraphicalView, InlineContext, JsonFilePreferences, PreferenceStore, ProviderRegistry,
    ReloadKind, RenderConsumer, RenderInvoker, RenderResult, Scheduler, ToolLocator, ENGINE_VERSION,
};

#[derive(Parser)]
#[command(name = "graphview-cli")]
#[command(about = "GraphView CLI - Render Graphviz documents to images")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Preferences file (JSON object)
    #[arg(long)]
    prefs: Option<PathBuf>,

    /// Directory of provider manifests to add to the built-in providers
    #[arg(long)]
    providers_dir: Option<PathBuf>,

    /// Bundled dot executable, used in BUNDLE mode or as the last resort
    #[arg(long)]
    bundled_dot: Option<PathBuf>,

    /// Tool timeout in milliseconds
    #[arg(long, default_value_t = 90_000)]
    timeout_ms: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered providers
    Providers,

    /// Show which dot executable would be used
    Locate,

    /// Render a file and print the image as base64
    Render {
        #[arg(short, long)]
        input: PathBuf,

        #[arg(short, long, default_value_t = 0)]
        width: i32,

        #[arg(long, default_value_t = 0)]
        height: i32,

        /// Attach a diagnostic placeholder image on failure
        #[arg(long)]
        placeholder: bool,
    },

    /// Save a file in the format given by the output extension
    Save {
        #[arg(short, long)]
        input: PathBuf,

        #[arg(short, long)]
        output: PathBuf,
    },

    /// Read or write a preference
    Prefs {
        #[command(subcommand)]
        action: PrefsAction,
    },
}

#[derive(Subcommand)]
enum PrefsAction {
    Get { key: String },
    Set { key: String, value: String },
}

/// Forwards deliveries to the main thread.
struct ChannelConsumer {
    visible: bool,
    placeholder: Option<(i32, i32)>,
    deliveries: Mutex<Sender<Delivery>>,
}

impl RenderConsumer for ChannelConsumer {
    fn is_visible(&self) -> bool {
        self.visible
    }

    fn clear_image(&self) {}

    fn placeholder_size(&self) -> Option<(i32, i32)> {
        self.placeholder
    }

    fn show(&self, delivery: Delivery) {
        let _ = self.deliveries.lock().send(delivery);
    }
}

struct App {
    prefs: Arc<JsonFilePreferences>,
    invoker: Arc<RenderInvoker>,
    catalog: Arc<ContentTypeCatalog>,
    registry: Arc<ProviderRegistry>,
    timeout: Duration,
}

impl App {
    fn build(cli: &Cli) -> Result<Self, String> {
        let prefs = Arc::new(JsonFilePreferences::new(
            cli.prefs.clone().unwrap_or_else(JsonFilePreferences::default_location),
        ));
        let mut locator = ToolLocator::new();
        if let Some(bundled) = &cli.bundled_dot {
            locator = locator.with_bundled(bundled);
        }
        let timeout = Duration::from_millis(cli.timeout_ms);
        let invoker = Arc::new(
            RenderInvoker::new(prefs.clone())
                .with_locator(locator)
                .with_timeout(timeout),
        );

        let catalog = ContentTypeCatalog::default();
        let kinds = builtin_kinds(invoker.clone());
        let mut registry = default_registry(&catalog, &kinds);
        if let Some(dir) = &cli.providers_dir {
            registry
                .load_from_dir(dir, &catalog, &kinds)
                .map_err(|e| format!("Failed to load providers: {e}"))?;
        }

        Ok(Self {
            prefs,
            invoker,
            catalog: Arc::new(catalog),
            registry: Arc::new(registry),
            timeout,
        })
    }

    fn view(
        &self,
        scheduler: &Scheduler,
        visible: bool,
        placeholder: Option<(i32, i32)>,
    ) -> (GraphicalView, Receiver<Delivery>) {
        let (tx, rx) = mpsc::channel();
        let consumer = ChannelConsumer {
            visible,
            placeholder,
            deliveries: Mutex::new(tx),
        };
        let view = GraphicalView::new(
            self.registry.clone(),
            self.catalog.clone(),
            scheduler,
            Arc::new(consumer),
            Arc::new(InlineContext),
        );
        (view, rx)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    let app = match App::build(&cli) {
        Ok(app) => app,
        Err(e) => {
            print_json(&json!({ "success": false, "error": e }));
            return ExitCode::FAILURE;
        }
    };

    match &cli.command {
        Commands::Providers => {
            let mut providers: Vec<Value> = app.registry.list().iter().map(describe).collect();
            if let Some(debug) = app.registry.debug_provider() {
                let mut entry = describe(debug);
                entry["debug"] = json!(true);
                providers.push(entry);
            }
            print_json(&json!(providers));
            ExitCode::SUCCESS
        }

        Commands::Locate => match app.invoker.locator().resolve(app.prefs.as_ref()) {
            Ok(tool) => {
                print_json(&json!({
                    "success": true,
                    "mode": tool.mode,
                    "path": tool.path.display().to_string(),
                }));
                ExitCode::SUCCESS
            }
            Err(e) => {
                print_json(&json!({ "success": false, "error": e.to_string() }));
                ExitCode::FAILURE
            }
        },

        Commands::Render {
            input,
            width,
            height,
            placeholder,
        } => render(&app, input, *width, *height, *placeholder),

        Commands::Save { input, output } => save(&app, input, output),

        Commands::Prefs { action } => match action {
            PrefsAction::Get { key } => {
                print_json(&json!({ "key": key, "value": app.prefs.get(key) }));
                ExitCode::SUCCESS
            }
            PrefsAction::Set { key, value } => match app.prefs.set(key, value) {
                Ok(()) => {
                    print_json(&json!({ "success": true, "key": key, "value": value }));
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    print_json(&json!({ "success": false, "error": e.to_string() }));
                    ExitCode::FAILURE
                }
            },
        },
    }
}

fn render(app: &App, input: &Path, width: i32, height: i32, with_placeholder: bool) -> ExitCode {
    let source = match fs::read(input) {
        Ok(bytes) => bytes,
        Err(e) => {
            print_json(&json!({ "success": false, "error": format!("Cannot read {}: {e}", input.display()) }));
            return ExitCode::FAILURE;
        }
    };

    let scheduler = match Scheduler::new(graphview_core::new_render_lock()) {
        Ok(s) => s,
        Err(e) => {
            print_json(&json!({ "success": false, "error": format!("Cannot start render worker: {e}") }));
            return ExitCode::FAILURE;
        }
    };
    let size = with_placeholder.then_some((width, height));
    let (view, rx) = app.view(&scheduler, true, size);
    view.set_size(width, height);

    if !view.show_file(input, ReloadKind::Explicit) {
        print_json(&json!({
            "success": false,
            "error": format!("No graphical provider for {}", input.display()),
        }));
        return ExitCode::FAILURE;
    }

    let delivery = match rx.recv_timeout(app.timeout + Duration::from_secs(5)) {
        Ok(delivery) => delivery,
        Err(_) => {
            print_json(&json!({ "success": false, "error": "No render result received" }));
            return ExitCode::from(2);
        }
    };

    match delivery.result {
        RenderResult::Image(image) => {
            print_json(&json!({
                "success": true,
                "request_id": delivery.request_id.to_string(),
                "width": image.width,
                "height": image.height,
                "format": image.format,
                "sha256": sha256_hex(&image.bytes),
                "render_hash": compute_render_hash(&source, image.format, width, height, ENGINE_VERSION),
                "warning": image.warning,
                "data_base64": STANDARD.encode(&image.bytes),
            }));
            ExitCode::SUCCESS
        }
        RenderResult::Failure(failure) => {
            print_json(&json!({
                "success": false,
                "request_id": delivery.request_id.to_string(),
                "kind": failure.kind,
                "error": failure.message,
                "diagnostic_output": failure.diagnostic_output,
                "placeholder_text": with_placeholder.then(|| placeholder::failure_text(&failure)),
                "placeholder_base64": delivery.placeholder.map(|image| STANDARD.encode(&image.bytes)),
            }));
            ExitCode::from(2)
        }
    }
}

fn save(app: &App, input: &Path, output: &Path) -> ExitCode {
    let format = output
        .extension()
        .and_then(|e| e.to_str())
        .and_then(GraphicFormat::by_extension);
    let Some(format) = format else {
        print_json(&json!({
            "success": false,
            "error": format!("Cannot tell the image format from {}", output.display()),
        }));
        return ExitCode::FAILURE;
    };

    let scheduler = match Scheduler::new(graphview_core::new_render_lock()) {
        Ok(s) => s,
        Err(e) => {
            print_json(&json!({ "success": false, "error": format!("Cannot start render worker: {e}") }));
            return ExitCode::FAILURE;
        }
    };
    // Invisible: loading must not trigger a display render.
    let (view, _rx) = app.view(&scheduler, false, None);
    if !view.show_file(input, ReloadKind::Explicit) {
        print_json(&json!({
            "success": false,
            "error": format!("No graphical provider for {}", input.display()),
        }));
        return ExitCode::FAILURE;
    }

    match view.save(output, format) {
        Ok(warning) => {
            print_json(&json!({
                "success": true,
                "path": output.display().to_string(),
                "format": format,
                "warning": warning,
            }));
            ExitCode::SUCCESS
        }
        Err(e) => {
            print_json(&json!({ "success": false, "error": e.to_string() }));
            ExitCode::from(2)
        }
    }
}

fn describe(descriptor: &graphview_core::ProviderDescriptor) -> Value {
    json!({
        "id": descriptor.id(),
        "name": descriptor.name(),
        "content_types": descriptor.associations().iter().map(|t| t.id().to_string()).collect::<Vec<_>>(),
        "readers": descriptor.reader_names(),
    })
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => eprintln!("Failed to encode output: {e}"),
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();
    let fmt_layer = fmt::layer().compact().with_target(false).with_writer(std::io::stderr);
    // A second install only fails in tests; logging is optional here.
    let _ = tracing_subscriber::registry().with(env_filter).with(fmt_layer).try_init();
}
