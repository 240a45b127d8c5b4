//! Tool Resolution - Where Is `dot`?
//!
//! The search mode, the manual path and extra command-line arguments are
//! preferences, looked up fresh for each render.

use std::env;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::prefs::PreferenceStore;
use crate::render::RenderError;

pub const DOT_SEARCH_METHOD: &str = "dotSearchMethod";
pub const DOT_MANUAL_PATH: &str = "dotManualPath";
pub const COMMAND_LINE: &str = "commandLineExtension";
pub const DOT_FILE_NAME: &str = "dot";

/// How the tool executable is chosen.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum ToolMode {
    /// Manual path, then PATH lookup, then the bundled copy.
    #[default]
    #[serde(rename = "AUTO")]
    Automatic,
    #[serde(rename = "BUNDLE")]
    Bundle,
    #[serde(rename = "DETECT")]
    Detect,
    #[serde(rename = "MANUAL")]
    Manual,
}

impl ToolMode {
    /// Parses a stored preference value; anything unknown is `Automatic`.
    pub fn from_preference(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some("BUNDLE") => ToolMode::Bundle,
            Some("DETECT") => ToolMode::Detect,
            Some("MANUAL") => ToolMode::Manual,
            _ => ToolMode::Automatic,
        }
    }

    pub fn as_preference(self) -> &'static str {
        match self {
            ToolMode::Automatic => "AUTO",
            ToolMode::Bundle => "BUNDLE",
            ToolMode::Detect => "DETECT",
            ToolMode::Manual => "MANUAL",
        }
    }
}

impl fmt::Display for ToolMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_preference())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTool {
    pub path: PathBuf,
    pub mode: ToolMode,
}

impl ResolvedTool {
    /// The tool runs with its own directory as working directory.
    pub fn directory(&self) -> Option<&Path> {
        self.path.parent().filter(|dir| !dir.as_os_str().is_empty())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ToolLocator {
    bundled: Option<PathBuf>,
    search_path: Option<OsString>,
}

impl ToolLocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Path of a copy of the tool shipped with the application.
    pub fn with_bundled(mut self, path: impl Into<PathBuf>) -> Self {
        self.bundled = Some(path.into());
        self
    }

    /// Overrides the `PATH` value used for detection.
    pub fn with_search_path(mut self, search_path: impl Into<OsString>) -> Self {
        self.search_path = Some(search_path.into());
        self
    }

    /// Looks `dot` up in the search path. First executable match wins.
    pub fn detect(&self) -> Option<PathBuf> {
        let search_path = self.search_path.clone().or_else(|| env::var_os("PATH"))?;
        let names = [DOT_FILE_NAME.to_string(), format!("{DOT_FILE_NAME}.exe")];
        env::split_paths(&search_path)
            .flat_map(|dir| names.iter().map(move |name| dir.join(name)))
            .find(|candidate| is_executable(candidate))
    }

    pub fn resolve(&self, prefs: &dyn PreferenceStore) -> Result<ResolvedTool, RenderError> {
        let mode = ToolMode::from_preference(prefs.get(DOT_SEARCH_METHOD).as_deref());
        let manual = prefs
            .get(DOT_MANUAL_PATH)
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);

        let candidate = match mode {
            ToolMode::Manual => manual,
            ToolMode::Detect => self.detect(),
            ToolMode::Bundle => self.bundled.clone(),
            // A stale candidate falls through to the next one.
            ToolMode::Automatic => manual
                .filter(|path| path.is_file())
                .or_else(|| self.detect())
                .or_else(|| self.bundled.clone().filter(|path| path.is_file())),
        };

        let path = candidate.ok_or_else(|| RenderError::ToolNotFound(format!("no executable found in {mode} mode")))?;
        if !path.is_file() {
            return Err(RenderError::ToolNotFound(format!(
                "could not find Graphviz dot at \"{}\"",
                path.display()
            )));
        }
        debug!(op = "tool::resolve", mode = %mode, path = %path.display(), "Resolved Graphviz executable");
        Ok(ResolvedTool { path, mode })
    }
}

/// User-configured arguments placed before the standard ones.
pub fn extra_arguments(prefs: &dyn PreferenceStore) -> Vec<String> {
    prefs
        .get(COMMAND_LINE)
        .map(|line| line.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
