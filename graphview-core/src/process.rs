//! Process Supervisor - Bounded-Time Subprocess Execution
//!
//! Runs an external command with a hard deadline. stdout and stderr are
//! drained on their own threads while the process runs, so a tool that
//! fills a pipe buffer can never wedge the caller. On timeout the whole
//! process group is killed and reaped before returning.

use std::ffi::OsString;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(90_000);

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const DRAIN_CHUNK: usize = 8 * 1024;

type Sink = Box<dyn Write + Send>;
type Source = Box<dyn Read + Send>;

/// Shared cancellation flag. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Everything observed about one finished (or killed) process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// `None` when the process was ended by a signal.
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Empty command line")]
    EmptyCommand,

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Process did not finish within {}ms", timeout.as_millis())]
    TimedOut {
        timeout: Duration,
        outcome: ProcessOutcome,
    },

    #[error("Process cancelled")]
    Cancelled { outcome: ProcessOutcome },

    #[error("Failed waiting for process: {0}")]
    Wait(#[source] io::Error),
}

impl SupervisorError {
    /// True when the executable itself could not be found.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SupervisorError::Spawn { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }

    /// Whatever the process wrote before it was stopped.
    pub fn partial_outcome(&self) -> Option<&ProcessOutcome> {
        match self {
            SupervisorError::TimedOut { outcome, .. } | SupervisorError::Cancelled { outcome } => Some(outcome),
            _ => None,
        }
    }
}

/// Builder for one supervised invocation.
pub struct ProcessCommand {
    program: PathBuf,
    args: Vec<OsString>,
    current_dir: Option<PathBuf>,
    timeout: Duration,
    stdout_sink: Option<Sink>,
    stderr_sink: Option<Sink>,
    stdin_source: Option<Source>,
    cancel: Option<CancellationToken>,
}

enum Exit {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
    WaitFailed(io::Error),
}

impl ProcessCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            timeout: DEFAULT_TIMEOUT,
            stdout_sink: None,
            stderr_sink: None,
            stdin_source: None,
            cancel: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Copies everything the process writes on stdout to `sink` as well as
    /// capturing it.
    pub fn forward_stdout(mut self, sink: impl Write + Send + 'static) -> Self {
        self.stdout_sink = Some(Box::new(sink));
        self
    }

    pub fn forward_stderr(mut self, sink: impl Write + Send + 'static) -> Self {
        self.stderr_sink = Some(Box::new(sink));
        self
    }

    /// Feeds `source` to the process's stdin. Without a source stdin is null.
    pub fn stdin(mut self, source: impl Read + Send + 'static) -> Self {
        self.stdin_source = Some(Box::new(source));
        self
    }

    /// Kills the process as soon as `token` is cancelled.
    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn run(self) -> Result<ProcessOutcome, SupervisorError> {
        let ProcessCommand {
            program,
            args,
            current_dir,
            timeout,
            stdout_sink,
            stderr_sink,
            stdin_source,
            cancel,
        } = self;

        let started_at = Instant::now();
        let mut command = Command::new(&program);
        command
            .args(&args)
            .stdin(if stdin_source.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &current_dir {
            command.current_dir(dir);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group, so a timeout can take down anything the tool forked.
            command.process_group(0);
        }

        let mut child = command.spawn().map_err(|source| {
            warn!(
                op = "process::run",
                result = "spawn_error",
                program = %program.display(),
                error = %source,
                "Failed to start external process"
            );
            SupervisorError::Spawn {
                program: program.display().to_string(),
                source,
            }
        })?;
        debug!(
            op = "process::run",
            pid = child.id(),
            program = %program.display(),
            timeout_ms = timeout.as_millis() as u64,
            "External process started"
        );

        if let (Some(mut pipe), Some(mut source)) = (child.stdin.take(), stdin_source) {
            // Not joined: a source that blocks forever must not hold up the caller.
            thread::spawn(move || {
                if let Err(err) = io::copy(&mut source, &mut pipe) {
                    debug!(op = "process::stdin", error = %err, "stdin forwarding stopped");
                }
            });
        }
        let stdout_thread = child.stdout.take().map(|pipe| drain(pipe, stdout_sink));
        let stderr_thread = child.stderr.take().map(|pipe| drain(pipe, stderr_sink));

        let exit = wait_with_deadline(&mut child, started_at, timeout, cancel.as_ref());
        if matches!(exit, Exit::Exited(_)) && sweep_group(child.id()) {
            debug!(op = "process::run", "Killed processes left behind by the tool");
        }

        let mut outcome = ProcessOutcome {
            exit_code: None,
            stdout: join_drain(stdout_thread),
            stderr: join_drain(stderr_thread),
            timed_out: false,
        };
        let elapsed_ms = started_at.elapsed().as_millis() as u64;

        match exit {
            Exit::Exited(status) => {
                outcome.exit_code = status.code();
                debug!(
                    op = "process::run",
                    result = "exited",
                    exit_code = outcome.exit_code.map(i64::from).unwrap_or(-1),
                    elapsed_ms,
                    stdout_bytes = outcome.stdout.len(),
                    stderr_bytes = outcome.stderr.len(),
                    "External process finished"
                );
                Ok(outcome)
            }
            Exit::TimedOut => {
                outcome.timed_out = true;
                warn!(
                    op = "process::run",
                    result = "timed_out",
                    program = %program.display(),
                    elapsed_ms,
                    "External process killed after timeout"
                );
                Err(SupervisorError::TimedOut { timeout, outcome })
            }
            Exit::Cancelled => {
                debug!(op = "process::run", result = "cancelled", elapsed_ms, "External process killed on cancel");
                Err(SupervisorError::Cancelled { outcome })
            }
            Exit::WaitFailed(err) => Err(SupervisorError::Wait(err)),
        }
    }
}

/// Runs `command[0]` with the remaining elements as arguments.
pub fn run(
    command: &[String],
    working_directory: Option<&Path>,
    timeout: Duration,
) -> Result<ProcessOutcome, SupervisorError> {
    let (program, args) = command.split_first().ok_or(SupervisorError::EmptyCommand)?;
    let mut process = ProcessCommand::new(program).args(args).timeout(timeout);
    if let Some(dir) = working_directory {
        process = process.current_dir(dir);
    }
    process.run()
}

fn wait_with_deadline(
    child: &mut Child,
    started_at: Instant,
    timeout: Duration,
    cancel: Option<&CancellationToken>,
) -> Exit {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Exit::Exited(status),
            Ok(None) => {}
            Err(err) => {
                terminate(child);
                return Exit::WaitFailed(err);
            }
        }
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            terminate(child);
            return Exit::Cancelled;
        }
        if started_at.elapsed() >= timeout {
            terminate(child);
            return Exit::TimedOut;
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R, mut sink: Option<Sink>) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut captured = Vec::new();
        let mut buf = [0u8; DRAIN_CHUNK];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    captured.extend_from_slice(&buf[..n]);
                    let failed = match sink.as_mut() {
                        Some(out) => out.write_all(&buf[..n]).is_err(),
                        None => false,
                    };
                    if failed {
                        debug!(op = "process::drain", "Forwarding sink failed; capturing only");
                        sink = None;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!(op = "process::drain", error = %err, "Pipe read failed");
                    break;
                }
            }
        }
        if let Some(out) = sink.as_mut() {
            let _ = out.flush();
        }
        captured
    })
}

fn join_drain(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle.map(|h| h.join().unwrap_or_default()).unwrap_or_default()
}

/// Kills the child's process group (or the child alone off unix) and reaps it.
fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Err(err) = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL) {
            debug!(op = "process::terminate", error = %err, "killpg failed; killing child only");
            let _ = child.kill();
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.kill();
    }
    let _ = child.wait();
}

/// Kills stragglers the tool left in its group after it exited. Returns
/// whether a live group was found.
///
/// The leader is already reaped here, so its pid is free for reuse once the
/// group is empty. The null-signal check skips the kill for an empty group;
/// a reuse between the check and the kill remains possible but needs the pid
/// to come round again within that window.
#[cfg(unix)]
fn sweep_group(pgid: u32) -> bool {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let group = Pid::from_raw(pgid as i32);
    if killpg(group, None).is_err() {
        return false;
    }
    if let Err(err) = killpg(group, Signal::SIGKILL) {
        debug!(op = "process::sweep", error = %err, "Group vanished before the sweep");
        return false;
    }
    true
}

#[cfg(not(unix))]
fn sweep_group(_pgid: u32) -> bool {
    false
}
