//! Contract Invariant Tests
//!
//! These tests verify the non-negotiable guarantees against a fake `dot`
//! shell script.

#![cfg(unix)]

use std::fs;
use std::io::Cursor;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use image::{Rgba, RgbaImage};
use parking_lot::Mutex;
use tempfile::TempDir;

use graphview_core::{
    builtin_kinds, content::DOT, default_registry, new_render_lock,
    tool::{DOT_MANUAL_PATH, DOT_SEARCH_METHOD},
    CancellationToken, Capability, ContentTypeCatalog, Delivery, FailureKind, GraphicFormat, GraphicalView,
    InlineContext, MemoryPreferences, ProviderRegistry, ReloadKind, RenderConsumer, RenderInvoker, RenderResult,
    Scheduler, Source,
};

const WAIT: Duration = Duration::from_secs(10);

/// Writes `small.png` (3x2), `big.png` (5x4) and an executable `dot` into a
/// fresh directory. The script sees `$DIR`, `$OUT` and `$IN`, and records
/// its arguments in `$DIR/args.txt` before running `body`.
fn fake_dot(body: &str) -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("small.png"), png(3, 2)).unwrap();
    fs::write(dir.path().join("big.png"), png(5, 4)).unwrap();

    let script = format!(
        "#!/bin/sh\nDIR='{}'\nOUT=\"\"\nIN=\"\"\nfor a in \"$@\"; do\n  case \"$a\" in\n    -o*) OUT=\"${{a#-o}}\" ;;\n  esac\n  IN=\"$a\"\ndone\nprintf '%s\\n' \"$@\" > \"$DIR/args.txt\"\n{}\n",
        dir.path().display(),
        body
    );
    let path = dir.path().join("dot");
    fs::write(&path, script).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    (dir, path)
}

fn png(width: u32, height: u32) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    RgbaImage::from_pixel(width, height, Rgba([0, 128, 255, 255]))
        .write_to(&mut buf, image::ImageFormat::Png)
        .unwrap();
    buf.into_inner()
}

fn prefs_for(tool: &Path) -> Arc<MemoryPreferences> {
    Arc::new(
        MemoryPreferences::new()
            .with(DOT_SEARCH_METHOD, "MANUAL")
            .with(DOT_MANUAL_PATH, tool.to_str().unwrap()),
    )
}

fn recorded_args(dir: &Path) -> Vec<String> {
    fs::read_to_string(dir.join("args.txt"))
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

fn leftover_temp_files(dir: &Path) -> Vec<String> {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("graphviz"))
        .collect()
}

struct TestConsumer {
    visible: bool,
    deliveries: Mutex<Sender<Delivery>>,
}

impl RenderConsumer for TestConsumer {
    fn is_visible(&self) -> bool {
        self.visible
    }

    fn clear_image(&self) {}

    fn show(&self, delivery: Delivery) {
        let _ = self.deliveries.lock().send(delivery);
    }
}

fn dot_view(invoker: RenderInvoker, scheduler: &Scheduler, visible: bool) -> (GraphicalView, Receiver<Delivery>) {
    let catalog = ContentTypeCatalog::default();
    let registry = default_registry(&catalog, &builtin_kinds(Arc::new(invoker)));
    let (tx, rx) = mpsc::channel();
    let view = GraphicalView::new(
        Arc::new(registry),
        Arc::new(catalog),
        scheduler,
        Arc::new(TestConsumer {
            visible,
            deliveries: Mutex::new(tx),
        }),
        Arc::new(InlineContext),
    );
    (view, rx)
}

#[test]
fn invariant_nonzero_exit_with_output_is_image() {
    let (dir, tool) = fake_dot("cp \"$DIR/small.png\" \"$OUT\"\necho 'Warning: a -> b unknown attribute' >&2\nexit 3");
    let invoker = RenderInvoker::new(prefs_for(&tool)).with_temp_dir(dir.path());

    let result = invoker.render(b"digraph { a -> b }", GraphicFormat::Png, 0, 0);
    let image = result.image().expect("output present means success");
    assert_eq!((image.width, image.height), (3, 2));
    let warning = image.warning.as_deref().unwrap();
    assert!(warning.starts_with("Graphviz exit code: 3."));
    assert!(warning.contains("unknown attribute"));
}

#[test]
fn invariant_empty_or_missing_output_is_failure() {
    let (dir, tool) = fake_dot(": > \"$OUT\"\nexit 0");
    let invoker = RenderInvoker::new(prefs_for(&tool)).with_temp_dir(dir.path());
    let result = invoker.render(b"digraph {}", GraphicFormat::Png, 0, 0);
    assert_eq!(result.failure().unwrap().kind, FailureKind::NoOutputProduced);

    let (dir, tool) = fake_dot("echo 'syntax error in line 1' >&2\nexit 0");
    let invoker = RenderInvoker::new(prefs_for(&tool));
    let missing = dir.path().join("never-written.png");
    let err = invoker.generate(b"digraph {", GraphicFormat::Png, 0, 0, &missing).unwrap_err();
    assert_eq!(err.kind(), FailureKind::NoOutputProduced);
    assert_eq!(String::from_utf8_lossy(err.stderr()).trim(), "syntax error in line 1");
}

#[test]
fn invariant_timeout_kills_tool() {
    let (dir, tool) = fake_dot("echo $$ > \"$DIR/pid\"\necho partial >&2\nexec sleep 30");
    let invoker = RenderInvoker::new(prefs_for(&tool))
        .with_temp_dir(dir.path())
        .with_timeout(Duration::from_millis(500));

    let started = Instant::now();
    let result = invoker.render(b"digraph {}", GraphicFormat::Png, 0, 0);
    assert!(started.elapsed() < Duration::from_secs(10));

    let failure = result.failure().unwrap();
    assert_eq!(failure.kind, FailureKind::ToolTimedOut);
    assert!(failure.diagnostic_output.contains("partial"));
    assert_eq!(failure.input_excerpt, "digraph {}");

    let pid: i32 = fs::read_to_string(dir.path().join("pid")).unwrap().trim().parse().unwrap();
    assert!(nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_err());
}

#[test]
fn invariant_size_hint_omitted_for_non_positive_dimensions() {
    let (dir, tool) = fake_dot("cp \"$DIR/small.png\" \"$OUT\"");
    let invoker = RenderInvoker::new(prefs_for(&tool)).with_temp_dir(dir.path());

    for (w, h) in [(0, 100), (100, 0), (-1, -1)] {
        assert!(invoker.render(b"graph {}", GraphicFormat::Png, w, h).is_image());
        assert!(
            recorded_args(dir.path()).iter().all(|a| !a.starts_with("-Gsize")),
            "size hint passed for {w}x{h}"
        );
    }

    assert!(invoker.render(b"graph {}", GraphicFormat::Png, 192, 96).is_image());
    let args = recorded_args(dir.path());
    assert!(args[0].starts_with("-o"));
    assert_eq!(args[1], "-Tpng");
    assert_eq!(args[2], "-Gsize=2,1");
    assert!(args[3].ends_with(".dot"));
}

#[test]
fn invariant_temp_files_removed_after_every_invocation() {
    let (tool_dir, tool) = fake_dot(
        "case \"$(cat \"$IN\")\" in\n  *hang*) exec sleep 30 ;;\n  *empty*) : > \"$OUT\" ;;\n  *fail*) echo broken >&2; exit 1 ;;\n  *) cp \"$DIR/small.png\" \"$OUT\" ;;\nesac",
    );
    let temp = TempDir::new().unwrap();
    let invoker = RenderInvoker::new(prefs_for(&tool))
        .with_temp_dir(temp.path())
        .with_timeout(Duration::from_millis(400));

    let inputs: [&[u8]; 5] = [b"ok", b"empty", b"fail", b"hang", b"ok again"];
    for input in inputs {
        invoker.render(input, GraphicFormat::Png, 10, 10);
    }
    let target = tool_dir.path().join("saved.png");
    invoker.generate(b"ok", GraphicFormat::Png, 0, 0, &target).unwrap();

    assert!(leftover_temp_files(temp.path()).is_empty(), "{:?}", leftover_temp_files(temp.path()));
}

#[test]
fn invariant_missing_tool_never_spawns() {
    let temp = TempDir::new().unwrap();
    let prefs = Arc::new(
        MemoryPreferences::new()
            .with(DOT_SEARCH_METHOD, "MANUAL")
            .with(DOT_MANUAL_PATH, "/nonexistent/graphviz/dot"),
    );
    let invoker = RenderInvoker::new(prefs).with_temp_dir(temp.path());
    let failure = invoker.render(b"digraph {}", GraphicFormat::Png, 0, 0).failure().cloned().unwrap();
    assert_eq!(failure.kind, FailureKind::ToolNotFound);
    assert!(failure.message.contains("graphviz.org"));
    assert!(leftover_temp_files(temp.path()).is_empty());
}

#[test]
fn invariant_render_is_deterministic() {
    let (dir, tool) = fake_dot("cp \"$DIR/big.png\" \"$OUT\"");
    let invoker = RenderInvoker::new(prefs_for(&tool)).with_temp_dir(dir.path());
    let first = invoker.render(b"digraph { a }", GraphicFormat::Png, 300, 200);
    let second = invoker.render(b"digraph { a }", GraphicFormat::Png, 300, 200);
    assert_eq!(first.image().unwrap().bytes, second.image().unwrap().bytes);
}

#[test]
fn invariant_subtype_resolves_to_parent_provider() {
    let mut catalog = ContentTypeCatalog::default();
    let cluster = catalog.register("graphviz.dot.cluster", Some(DOT), &["cluster"]).unwrap();
    let invoker = Arc::new(RenderInvoker::new(Arc::new(MemoryPreferences::new())));
    let registry = default_registry(&catalog, &builtin_kinds(invoker));

    let descriptor = registry.find_provider(&cluster, Capability::Graphical).unwrap();
    assert_eq!(descriptor.id(), "graphviz.dot");
    assert_eq!(catalog.detect(Path::new("g.CLUSTER")), Some(&cluster));
}

#[test]
fn invariant_manifests_extend_registry() {
    let manifests = TempDir::new().unwrap();
    fs::write(
        manifests.path().join("a-custom.json"),
        r#"{"id": "custom.dot", "associations": ["graphviz.dot"], "readers": ["file-location"], "provider": "graphviz-dot"}"#,
    )
    .unwrap();
    fs::write(
        manifests.path().join("b-unknown-kind.json"),
        r#"{"id": "bad", "associations": ["text"], "readers": ["text-bytes"], "provider": "nope"}"#,
    )
    .unwrap();
    fs::write(manifests.path().join("c-garbage.json"), "{ not json").unwrap();
    fs::write(manifests.path().join("notes.txt"), "ignored").unwrap();

    let catalog = ContentTypeCatalog::default();
    let invoker = Arc::new(RenderInvoker::new(Arc::new(MemoryPreferences::new())));
    let mut registry = ProviderRegistry::new();
    let added = registry
        .load_from_dir(manifests.path(), &catalog, &builtin_kinds(invoker))
        .unwrap();
    assert_eq!(added, 2);

    let dot = registry.find_provider(catalog.get(DOT).unwrap(), Capability::Graphical).unwrap();
    assert_eq!(dot.id(), "custom.dot");
    assert_eq!(dot.reader_names(), vec!["file-location"]);

    // The misconfigured descriptor is excluded from lookups.
    let text = catalog.get("text").unwrap();
    assert!(registry.find_provider(text, Capability::Graphical).is_none());
}

#[test]
fn invariant_superseded_result_never_delivered() {
    let (_dir, tool) = fake_dot(
        "if grep -q slow \"$IN\"; then\n  sleep 1\n  cp \"$DIR/small.png\" \"$OUT\"\nelse\n  cp \"$DIR/big.png\" \"$OUT\"\nfi",
    );
    let scheduler = Scheduler::new(new_render_lock()).unwrap();
    let invoker = RenderInvoker::new(prefs_for(&tool));
    let (view, rx) = dot_view(invoker, &scheduler, true);
    let dot = ContentTypeCatalog::default().get(DOT).cloned().unwrap();

    assert!(view.show(Source::Text("digraph { slow }".into()), &dot, ReloadKind::Implicit));
    thread::sleep(Duration::from_millis(400));
    assert!(view.show(Source::Text("digraph { fast }".into()), &dot, ReloadKind::Implicit));

    let delivery = rx.recv_timeout(WAIT).unwrap();
    let image = delivery.result.image().unwrap();
    assert_eq!((image.width, image.height), (5, 4));
    assert!(rx.recv_timeout(Duration::from_millis(1500)).is_err());
}

#[test]
fn invariant_kill_on_cancel_stops_running_tool() {
    let (dir, tool) = fake_dot("echo $$ > \"$DIR/pid\"\nexec sleep 30");
    let invoker = RenderInvoker::new(prefs_for(&tool)).with_kill_on_cancel(true);
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        trigger.cancel();
    });
    let started = Instant::now();
    let result = invoker.render_cancellable(b"digraph {}", GraphicFormat::Png, 0, 0, &cancel);
    canceller.join().unwrap();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(result.failure().unwrap().kind, FailureKind::Cancelled);
    let pid: i32 = fs::read_to_string(dir.path().join("pid")).unwrap().trim().parse().unwrap();
    assert!(nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_err());
}

#[test]
fn invariant_save_creates_parents_and_passes_dot_through() {
    let (dir, tool) = fake_dot("cp \"$DIR/small.png\" \"$OUT\"");
    let scheduler = Scheduler::new(new_render_lock()).unwrap();
    let (view, rx) = dot_view(RenderInvoker::new(prefs_for(&tool)), &scheduler, false);

    let source = dir.path().join("graph.gv");
    fs::write(&source, "digraph { a -> b }").unwrap();
    assert!(view.show_file(&source, ReloadKind::Explicit));

    let out = dir.path().join("exports/nested/graph.gif");
    view.save(&out, GraphicFormat::Gif).unwrap();
    assert!(out.is_file());
    assert!(recorded_args(dir.path()).contains(&"-Tgif".to_string()));

    let copy = dir.path().join("exports/graph.dot");
    view.save(&copy, GraphicFormat::Dot).unwrap();
    assert_eq!(fs::read_to_string(&copy).unwrap(), "digraph { a -> b }");

    // Invisible view: the load itself never rendered.
    assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());
}

#[test]
fn invariant_failure_is_delivered_not_raised() {
    let (_dir, tool) = fake_dot("echo 'syntax error near line 1' >&2\nexit 1");
    let scheduler = Scheduler::new(new_render_lock()).unwrap();
    let (view, rx) = dot_view(RenderInvoker::new(prefs_for(&tool)), &scheduler, true);
    let dot = ContentTypeCatalog::default().get(DOT).cloned().unwrap();

    view.show(Source::Bytes(b"digraph {".to_vec()), &dot, ReloadKind::Implicit);
    let delivery = rx.recv_timeout(WAIT).unwrap();
    match delivery.result {
        RenderResult::Failure(failure) => {
            assert_eq!(failure.kind, FailureKind::NoOutputProduced);
            assert!(failure.summary().contains("syntax error near line 1"));
        }
        RenderResult::Image(_) => panic!("expected a failure"),
    }
}
