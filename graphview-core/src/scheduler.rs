//! Render Scheduler - Debounced, Single-Flight Rendering
//!
//! One worker thread per `Scheduler`. Each session holds at most one pending
//! request; submitting replaces it (latest wins) and restarts the debounce
//! delay. Renders from every session run under the shared `RenderLock`.
//!
//! CRITICAL: a session's generation is bumped on every submit. The worker
//! checks it before and after rendering, and the delivery closure checks it
//! again on the consumer's context. A superseded result is never shown.

use std::collections::HashMap;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::placeholder;
use crate::process::CancellationToken;
use crate::render::{FailureKind, RenderFailure, RenderRequest, RenderResult, RenderedImage};

/// Held for the duration of every render and save, across all sessions.
pub type RenderLock = Arc<Mutex<()>>;

pub fn new_render_lock() -> RenderLock {
    Arc::new(Mutex::new(()))
}

pub type Renderer = Arc<dyn Fn(&RenderRequest, &CancellationToken) -> RenderResult + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadKind {
    /// Content changed underneath the view (editor keystrokes, selection).
    Implicit,
    /// The user asked for a reload.
    Explicit,
}

impl ReloadKind {
    pub fn delay(self) -> Duration {
        match self {
            ReloadKind::Implicit => Duration::from_millis(100),
            ReloadKind::Explicit => Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Scheduled,
    Running,
}

type Task = Box<dyn FnOnce() + Send>;

/// Where deliveries run. A UI would post to its event loop.
pub trait ExecutionContext: Send + Sync {
    fn dispatch(&self, task: Task);
}

/// Runs tasks immediately on the calling (worker) thread.
pub struct InlineContext;

impl ExecutionContext for InlineContext {
    fn dispatch(&self, task: Task) {
        task();
    }
}

/// Queues tasks until the owning thread pumps them.
pub struct ChannelContext {
    sender: Sender<Task>,
    receiver: Mutex<Receiver<Task>>,
}

impl ChannelContext {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            sender,
            receiver: Mutex::new(receiver),
        }
    }

    /// Runs every queued task. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let receiver = self.receiver.lock();
        let mut ran = 0;
        while let Ok(task) = receiver.try_recv() {
            task();
            ran += 1;
        }
        ran
    }

    /// Blocks up to `timeout` for one task and runs it.
    pub fn run_next(&self, timeout: Duration) -> bool {
        let task = self.receiver.lock().recv_timeout(timeout);
        match task {
            Ok(task) => {
                task();
                true
            }
            Err(_) => false,
        }
    }
}

impl Default for ChannelContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext for ChannelContext {
    fn dispatch(&self, task: Task) {
        // The receiver lives as long as the context; a send error means it
        // is being torn down.
        let _ = self.sender.send(task);
    }
}

/// A rendered (or failed) request handed to the consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub request_id: Uuid,
    pub result: RenderResult,
    /// Diagnostic image for a failure, when the consumer asked for one.
    pub placeholder: Option<RenderedImage>,
}

/// The display side of a session. Called on the session's context, except
/// `is_visible` and `placeholder_size` which the worker calls.
pub trait RenderConsumer: Send + Sync {
    fn is_visible(&self) -> bool {
        true
    }

    /// Drops whatever image is currently shown.
    fn clear_image(&self);

    /// Size of the diagnostic image to draw on failure, or `None` if the
    /// consumer does not want one.
    fn placeholder_size(&self) -> Option<(i32, i32)> {
        None
    }

    fn show(&self, delivery: Delivery);
}

struct Control {
    generation: u64,
    state: SessionState,
    cancel: CancellationToken,
}

struct SessionInner {
    id: u64,
    consumer: Arc<dyn RenderConsumer>,
    context: Arc<dyn ExecutionContext>,
    renderer: Renderer,
    control: Mutex<Control>,
}

impl SessionInner {
    fn is_current(&self, generation: u64) -> bool {
        self.control.lock().generation == generation
    }

    /// Supersedes all earlier work. Returns the new generation and token.
    fn supersede(&self, next: SessionState) -> (u64, CancellationToken) {
        let mut control = self.control.lock();
        control.cancel.cancel();
        control.generation += 1;
        control.cancel = CancellationToken::new();
        control.state = next;
        (control.generation, control.cancel.clone())
    }

    fn transition(&self, generation: u64, state: SessionState) -> bool {
        let mut control = self.control.lock();
        if control.generation != generation {
            return false;
        }
        control.state = state;
        true
    }
}

struct Pending {
    session: Arc<SessionInner>,
    request: RenderRequest,
    renderer: Renderer,
    generation: u64,
    cancel: CancellationToken,
    due: Instant,
}

#[derive(Default)]
struct Queue {
    pending: HashMap<u64, Pending>,
    next_session: u64,
    shutdown: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    wake: Condvar,
    lock: RenderLock,
}

pub struct Scheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(lock: RenderLock) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            wake: Condvar::new(),
            lock,
        });
        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name("graphview-render".to_string())
            .spawn(move || worker_loop(&worker_shared))?;
        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn render_lock(&self) -> &RenderLock {
        &self.shared.lock
    }

    /// Opens a session for one consumer. `renderer` is used by `submit`.
    pub fn session(
        &self,
        consumer: Arc<dyn RenderConsumer>,
        context: Arc<dyn ExecutionContext>,
        renderer: Renderer,
    ) -> RenderSession {
        let id = {
            let mut queue = self.shared.queue.lock();
            queue.next_session += 1;
            queue.next_session
        };
        RenderSession {
            inner: Arc::new(SessionInner {
                id,
                consumer,
                context,
                renderer,
                control: Mutex::new(Control {
                    generation: 0,
                    state: SessionState::Idle,
                    cancel: CancellationToken::new(),
                }),
            }),
            shared: self.shared.clone(),
        }
    }

    /// Stops the worker after the unit in progress, if any. Pending
    /// requests are dropped.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock();
            queue.shutdown = true;
            for pending in queue.pending.values() {
                pending.cancel.cancel();
            }
            queue.pending.clear();
        }
        self.shared.wake.notify_all();
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!(op = "scheduler::shutdown", "Render worker panicked");
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// One consumer's handle on the scheduler. Dropping it discards pending
/// work and suppresses any in-flight result.
pub struct RenderSession {
    inner: Arc<SessionInner>,
    shared: Arc<Shared>,
}

impl RenderSession {
    pub fn submit(&self, request: RenderRequest, reload: ReloadKind) -> Uuid {
        self.submit_with(request, reload, self.inner.renderer.clone())
    }

    /// Like `submit`, with a renderer for this request only.
    pub fn submit_with(&self, request: RenderRequest, reload: ReloadKind, renderer: Renderer) -> Uuid {
        let request_id = request.id;
        let mut queue = self.shared.queue.lock();
        if queue.shutdown {
            warn!(op = "scheduler::submit", session = self.inner.id, "Scheduler is shut down; request dropped");
            return request_id;
        }
        let (generation, cancel) = self.inner.supersede(SessionState::Scheduled);
        let replaced = queue.pending.insert(
            self.inner.id,
            Pending {
                session: self.inner.clone(),
                request,
                renderer,
                generation,
                cancel,
                due: Instant::now() + reload.delay(),
            },
        );
        drop(queue);
        self.shared.wake.notify_all();

        debug!(
            op = "scheduler::submit",
            session = self.inner.id,
            request_id = %request_id,
            generation,
            replaced = replaced.is_some(),
            delay_ms = reload.delay().as_millis() as u64,
            "Render scheduled"
        );
        request_id
    }

    /// Cancels pending and in-flight work without scheduling anything new.
    pub fn cancel(&self) {
        let mut queue = self.shared.queue.lock();
        queue.pending.remove(&self.inner.id);
        self.inner.supersede(SessionState::Idle);
    }

    pub fn state(&self) -> SessionState {
        self.inner.control.lock().state
    }
}

impl Drop for RenderSession {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let pending = {
            let mut queue = shared.queue.lock();
            loop {
                if queue.shutdown {
                    return;
                }
                let next = queue.pending.iter().min_by_key(|(_, p)| p.due).map(|(id, p)| (*id, p.due));
                match next {
                    None => shared.wake.wait(&mut queue),
                    Some((id, due)) if due <= Instant::now() => {
                        if let Some(pending) = queue.pending.remove(&id) {
                            break pending;
                        }
                    }
                    Some((_, due)) => {
                        shared.wake.wait_until(&mut queue, due);
                    }
                }
            }
        };
        run_unit(shared, pending);
    }
}

fn run_unit(shared: &Shared, pending: Pending) {
    let Pending {
        session,
        request,
        renderer,
        generation,
        cancel,
        ..
    } = pending;

    if !session.consumer.is_visible() {
        if session.transition(generation, SessionState::Idle) {
            debug!(op = "scheduler::run", session = session.id, request_id = %request.id, "Target not visible; request dropped");
        }
        return;
    }
    if !session.transition(generation, SessionState::Running) {
        return;
    }

    let started_at = Instant::now();
    let result = {
        let _guard = shared.lock.lock();
        if cancel.is_cancelled() || !session.is_current(generation) {
            debug!(op = "scheduler::run", session = session.id, request_id = %request.id, "Superseded before start");
            return;
        }
        render_guarded(&renderer, &request, &cancel)
    };

    let delivered = session.transition(generation, SessionState::Idle);
    let outcome = if result.is_image() { "ok" } else { "error" };
    info!(
        op = "scheduler::run",
        session = session.id,
        request_id = %request.id,
        result = outcome,
        stale = !delivered,
        elapsed_ms = started_at.elapsed().as_millis() as u64,
        "Render unit finished"
    );
    if !delivered {
        return;
    }

    let placeholder = match (&result, session.consumer.placeholder_size()) {
        (RenderResult::Failure(failure), Some((width, height))) => {
            match placeholder::render_failure(failure, width, height) {
                Ok(image) => Some(image),
                Err(err) => {
                    warn!(op = "scheduler::placeholder", error = %err, "Could not draw placeholder image");
                    None
                }
            }
        }
        _ => None,
    };

    let target = session.clone();
    let request_id = request.id;
    session.context.dispatch(Box::new(move || {
        if !target.is_current(generation) {
            debug!(op = "scheduler::deliver", session = target.id, request_id = %request_id, "Stale result suppressed");
            return;
        }
        if !result.is_image() {
            target.consumer.clear_image();
        }
        target.consumer.show(Delivery {
            request_id,
            result,
            placeholder,
        });
    }));
}

fn render_guarded(renderer: &Renderer, request: &RenderRequest, cancel: &CancellationToken) -> RenderResult {
    panic::catch_unwind(AssertUnwindSafe(|| renderer(request, cancel))).unwrap_or_else(|payload| {
        let detail = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        RenderResult::Failure(RenderFailure::new(
            FailureKind::Internal,
            format!("Renderer panicked: {detail}"),
        ))
    })
}
