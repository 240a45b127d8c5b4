//! Render Data Model
//!
//! Requests flow down to the external tool, results flow back up. A result
//! is produced exactly once per request that runs to completion.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Upper bound for stderr and input text carried in a failure.
pub const MAX_DIAGNOSTIC_LEN: usize = 4 * 64 * 1024;

/// Output formats a provider can render or save to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum GraphicFormat {
    Jpeg,
    Png,
    Gif,
    Tiff,
    Bitmap,
    /// Pass-through of the graph description itself.
    Dot,
}

impl GraphicFormat {
    pub const RASTER: [GraphicFormat; 5] = [
        GraphicFormat::Bitmap,
        GraphicFormat::Gif,
        GraphicFormat::Tiff,
        GraphicFormat::Jpeg,
        GraphicFormat::Png,
    ];

    /// File extension, which is also the token passed to the tool's `-T` flag.
    pub fn extension(self) -> &'static str {
        match self {
            GraphicFormat::Jpeg => "jpg",
            GraphicFormat::Png => "png",
            GraphicFormat::Gif => "gif",
            GraphicFormat::Tiff => "tif",
            GraphicFormat::Bitmap => "bmp",
            GraphicFormat::Dot => "dot",
        }
    }

    pub fn by_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(GraphicFormat::Jpeg),
            "png" => Some(GraphicFormat::Png),
            "gif" => Some(GraphicFormat::Gif),
            "tif" | "tiff" => Some(GraphicFormat::Tiff),
            "bmp" => Some(GraphicFormat::Bitmap),
            "dot" => Some(GraphicFormat::Dot),
            _ => None,
        }
    }

    /// The `image` crate codec for raster formats.
    pub fn image_format(self) -> Option<image::ImageFormat> {
        match self {
            GraphicFormat::Jpeg => Some(image::ImageFormat::Jpeg),
            GraphicFormat::Png => Some(image::ImageFormat::Png),
            GraphicFormat::Gif => Some(image::ImageFormat::Gif),
            GraphicFormat::Tiff => Some(image::ImageFormat::Tiff),
            GraphicFormat::Bitmap => Some(image::ImageFormat::Bmp),
            GraphicFormat::Dot => None,
        }
    }
}

impl fmt::Display for GraphicFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// One render of one version of the content. Never mutated; a newer
/// request supersedes it instead.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub id: Uuid,
    pub input: Vec<u8>,
    pub format: GraphicFormat,
    pub width: i32,
    pub height: i32,
    pub submitted_at: DateTime<Utc>,
}

impl RenderRequest {
    pub fn new(input: Vec<u8>, format: GraphicFormat, width: i32, height: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            input,
            format,
            width,
            height,
            submitted_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedImage {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: GraphicFormat,
    /// Set when the tool produced output but also complained (non-zero exit
    /// or stderr text).
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ToolNotFound,
    ToolTimedOut,
    NoOutputProduced,
    Cancelled,
    Io,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Captured stderr of the tool, bounded.
    pub diagnostic_output: String,
    /// The start of the rendered input, bounded.
    pub input_excerpt: String,
}

impl RenderFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            diagnostic_output: String::new(),
            input_excerpt: String::new(),
        }
    }

    /// Multi-line summary suitable for a placeholder image or a log line.
    pub fn summary(&self) -> String {
        let mut out = self.message.clone();
        if !self.diagnostic_output.is_empty() {
            out.push('\n');
            out.push_str(self.diagnostic_output.trim_end());
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderResult {
    Image(RenderedImage),
    Failure(RenderFailure),
}

impl RenderResult {
    pub fn is_image(&self) -> bool {
        matches!(self, RenderResult::Image(_))
    }

    pub fn image(&self) -> Option<&RenderedImage> {
        match self {
            RenderResult::Image(image) => Some(image),
            RenderResult::Failure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&RenderFailure> {
        match self {
            RenderResult::Image(_) => None,
            RenderResult::Failure(failure) => Some(failure),
        }
    }
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("dot not found. Install Graphviz from graphviz.org, update the PATH or set the tool path in the preferences ({0})")]
    ToolNotFound(String),

    #[error("Graphviz process did not finish within {timeout_ms}ms")]
    ToolTimedOut { timeout_ms: u64, stderr: Vec<u8> },

    #[error("Graphviz produced no output (exit code {exit_code:?})")]
    NoOutputProduced { exit_code: Option<i32>, stderr: Vec<u8> },

    #[error("Render cancelled")]
    Cancelled,

    #[error("I/O error while rendering: {0}")]
    Io(#[from] std::io::Error),
}

impl RenderError {
    pub fn kind(&self) -> FailureKind {
        match self {
            RenderError::ToolNotFound(_) => FailureKind::ToolNotFound,
            RenderError::ToolTimedOut { .. } => FailureKind::ToolTimedOut,
            RenderError::NoOutputProduced { .. } => FailureKind::NoOutputProduced,
            RenderError::Cancelled => FailureKind::Cancelled,
            RenderError::Io(_) => FailureKind::Io,
        }
    }

    pub fn stderr(&self) -> &[u8] {
        match self {
            RenderError::ToolTimedOut { stderr, .. } | RenderError::NoOutputProduced { stderr, .. } => stderr,
            _ => &[],
        }
    }

    /// Converts into a failure carrying the bounded stderr and input.
    pub fn into_failure(self, input: &[u8]) -> RenderFailure {
        RenderFailure {
            kind: self.kind(),
            message: self.to_string(),
            diagnostic_output: bounded_text(self.stderr()),
            input_excerpt: bounded_text(input),
        }
    }
}

/// Lossy UTF-8 of at most [`MAX_DIAGNOSTIC_LEN`] bytes.
pub fn bounded_text(bytes: &[u8]) -> String {
    let end = bytes.len().min(MAX_DIAGNOSTIC_LEN);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
