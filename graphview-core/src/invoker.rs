//! Render Invoker - One Tool Run per Render
//!
//! CRITICAL: temporary files are RAII guards. They are removed on every exit
//! path, including early returns and panics.
//!
//! Success is decided by the output file alone: present and non-empty. A
//! non-zero exit code or stderr chatter with usable output is a warning.

use std::env;
use std::ffi::OsString;
use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::Builder;
use tracing::{info, warn};

use crate::prefs::PreferenceStore;
use crate::process::{CancellationToken, ProcessCommand, ProcessOutcome, SupervisorError, DEFAULT_TIMEOUT};
use crate::render::{bounded_text, GraphicFormat, RenderError, RenderResult, RenderedImage};
use crate::tool::{extra_arguments, ToolLocator};

/// Pixels per inch used to turn a pixel size into the tool's inch-based size.
pub const DPI: f64 = 96.0;

pub const TMP_FILE_PREFIX: &str = "graphviz";
const DOT_EXTENSION: &str = ".dot";

pub struct RenderInvoker {
    prefs: Arc<dyn PreferenceStore>,
    locator: ToolLocator,
    timeout: Duration,
    temp_dir: Option<PathBuf>,
    kill_on_cancel: bool,
}

impl RenderInvoker {
    pub fn new(prefs: Arc<dyn PreferenceStore>) -> Self {
        Self {
            prefs,
            locator: ToolLocator::new(),
            timeout: DEFAULT_TIMEOUT,
            temp_dir: None,
            kill_on_cancel: false,
        }
    }

    pub fn with_locator(mut self, locator: ToolLocator) -> Self {
        self.locator = locator;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Directory for the per-render temp files (system temp dir otherwise).
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    /// When set, a cancelled render also kills a tool that is already
    /// running. Otherwise cancellation is only checked before launch and
    /// the caller suppresses the late result.
    pub fn with_kill_on_cancel(mut self, kill: bool) -> Self {
        self.kill_on_cancel = kill;
        self
    }

    pub fn preferences(&self) -> &Arc<dyn PreferenceStore> {
        &self.prefs
    }

    pub fn locator(&self) -> &ToolLocator {
        &self.locator
    }

    pub fn render(&self, input: &[u8], format: GraphicFormat, width: i32, height: i32) -> RenderResult {
        self.render_cancellable(input, format, width, height, &CancellationToken::new())
    }

    pub fn render_cancellable(
        &self,
        input: &[u8],
        format: GraphicFormat,
        width: i32,
        height: i32,
        cancel: &CancellationToken,
    ) -> RenderResult {
        let started_at = Instant::now();
        match self.try_render(input, format, width, height, cancel) {
            Ok(image) => {
                let result = if image.warning.is_some() { "ok_with_warning" } else { "ok" };
                info!(
                    op = "invoker::render",
                    result,
                    format = %format,
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    image_bytes = image.bytes.len(),
                    width = image.width,
                    height = image.height,
                    "Graphviz render finished"
                );
                RenderResult::Image(image)
            }
            Err(err) => {
                let failure = err.into_failure(input);
                warn!(
                    op = "invoker::render",
                    result = "error",
                    kind = ?failure.kind,
                    format = %format,
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    error = %failure.message,
                    stderr = %failure.diagnostic_output,
                    "Graphviz render failed"
                );
                RenderResult::Failure(failure)
            }
        }
    }

    /// Renders straight into `output`. Returns the tool's warning, if any.
    pub fn generate(
        &self,
        input: &[u8],
        format: GraphicFormat,
        width: i32,
        height: i32,
        output: &Path,
    ) -> Result<Option<String>, RenderError> {
        let run = self.run_tool(input, format, width, height, output, &CancellationToken::new())?;
        Ok(run.warning)
    }

    fn try_render(
        &self,
        input: &[u8],
        format: GraphicFormat,
        width: i32,
        height: i32,
        cancel: &CancellationToken,
    ) -> Result<RenderedImage, RenderError> {
        let output = Builder::new()
            .prefix(TMP_FILE_PREFIX)
            .suffix(&format!(".{}", format.extension()))
            .tempfile_in(self.temp_dir())?
            .into_temp_path();
        let run = self.run_tool(input, format, width, height, &output, cancel)?;
        let bytes = fs::read(&output)?;
        let (image_width, image_height) = probe_dimensions(&bytes);
        Ok(RenderedImage {
            bytes,
            width: image_width,
            height: image_height,
            format,
            warning: run.warning,
        })
    }

    fn run_tool(
        &self,
        input: &[u8],
        format: GraphicFormat,
        width: i32,
        height: i32,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<ToolRun, RenderError> {
        let tool = self.locator.resolve(self.prefs.as_ref())?;

        let mut input_file = Builder::new()
            .prefix(TMP_FILE_PREFIX)
            .suffix(DOT_EXTENSION)
            .tempfile_in(self.temp_dir())?;
        input_file.write_all(input)?;
        input_file.flush()?;

        if cancel.is_cancelled() {
            return Err(RenderError::Cancelled);
        }

        let extra = extra_arguments(self.prefs.as_ref());
        let args = dot_arguments(&extra, output, format.extension(), width, height, input_file.path());
        let mut command = ProcessCommand::new(&tool.path).args(args).timeout(self.timeout);
        if let Some(dir) = tool.directory() {
            command = command.current_dir(dir);
        }
        if self.kill_on_cancel {
            command = command.cancel_on(cancel.clone());
        }

        let outcome = command.run().map_err(|err| self.classify(err))?;

        let produced = fs::metadata(output).map(|meta| meta.is_file() && meta.len() > 0).unwrap_or(false);
        if !produced {
            return Err(RenderError::NoOutputProduced {
                exit_code: outcome.exit_code,
                stderr: outcome.stderr,
            });
        }

        let warning = tool_warning(&outcome);
        if let Some(text) = &warning {
            warn!(op = "invoker::run_tool", result = "ok_with_warning", warning = %text, "Graphviz reported problems");
        }
        Ok(ToolRun { warning })
    }

    fn classify(&self, err: SupervisorError) -> RenderError {
        if err.is_not_found() {
            return RenderError::ToolNotFound(err.to_string());
        }
        match err {
            SupervisorError::TimedOut { outcome, .. } => RenderError::ToolTimedOut {
                timeout_ms: self.timeout.as_millis() as u64,
                stderr: outcome.stderr,
            },
            SupervisorError::Cancelled { .. } => RenderError::Cancelled,
            SupervisorError::Spawn { source, .. } | SupervisorError::Wait(source) => RenderError::Io(source),
            SupervisorError::EmptyCommand => {
                RenderError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command line"))
            }
        }
    }

    fn temp_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(env::temp_dir)
    }
}

struct ToolRun {
    warning: Option<String>,
}

/// `[extra...] -o<output> -T<format> [-Gsize=<w>,<h>] <input>`
///
/// The size hint is in inches and left out when either dimension is not
/// positive.
pub fn dot_arguments(
    extra: &[String],
    output: &Path,
    format: &str,
    width: i32,
    height: i32,
    input: &Path,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = extra.iter().map(OsString::from).collect();

    let mut out_arg = OsString::from("-o");
    out_arg.push(output.as_os_str());
    args.push(out_arg);
    args.push(OsString::from(format!("-T{format}")));

    if width > 0 && height > 0 {
        let width_in = f64::from(width) / DPI;
        let height_in = f64::from(height) / DPI;
        args.push(OsString::from(format!("-Gsize={width_in},{height_in}")));
    }

    args.push(input.as_os_str().to_os_string());
    args
}

fn tool_warning(outcome: &ProcessOutcome) -> Option<String> {
    let stderr = bounded_text(&outcome.stderr);
    let details = if stderr.trim().is_empty() {
        String::new()
    } else {
        format!(" dot produced the following error output:\n{stderr}")
    };
    match outcome.exit_code {
        Some(0) if details.is_empty() => None,
        Some(0) => Some(details.trim_start().to_string()),
        Some(code) => Some(format!("Graphviz exit code: {code}.{details}")),
        None => Some(format!("Graphviz terminated by a signal.{details}")),
    }
}

fn probe_dimensions(bytes: &[u8]) -> (u32, u32) {
    image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()
        .and_then(|reader| reader.into_dimensions().ok())
        .unwrap_or_else(|| {
            tracing::debug!(op = "invoker::probe_dimensions", "Output is not a decodable raster image");
            (0, 0)
        })
}
