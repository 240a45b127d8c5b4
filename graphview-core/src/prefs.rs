//! Preference Store - Named Key/Value Settings
//!
//! Values are read at invocation time and never cached beyond one render,
//! so an edit takes effect on the next render.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum PrefsError {
    #[error("Preference file error: {0}")]
    Io(#[from] io::Error),

    #[error("Preference file is not a JSON object of strings: {0}")]
    Format(#[from] serde_json::Error),
}

pub trait PreferenceStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<(), PrefsError>;
}

#[derive(Default)]
pub struct MemoryPreferences {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, key: &str, value: &str) -> Self {
        self.values.write().insert(key.to_string(), value.to_string());
        self
    }
}

impl PreferenceStore for MemoryPreferences {
    fn get(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PrefsError> {
        self.values.write().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// A flat JSON object on disk, re-read on every lookup.
pub struct JsonFilePreferences {
    path: PathBuf,
}

impl JsonFilePreferences {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<config dir>/graphview/preferences.json`, falling back to the
    /// working directory when the platform has no config dir.
    pub fn default_location() -> PathBuf {
        dirs::config_dir()
            .map(|dir| dir.join("graphview"))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("preferences.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, String>, PrefsError> {
        match fs::read_to_string(&self.path) {
            Ok(content) if content.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(err) => Err(err.into()),
        }
    }
}

impl PreferenceStore for JsonFilePreferences {
    fn get(&self, key: &str) -> Option<String> {
        match self.load() {
            Ok(mut values) => values.remove(key),
            Err(err) => {
                warn!(
                    op = "prefs::get",
                    path = %self.path.display(),
                    error = %err,
                    "Ignoring unreadable preference file"
                );
                None
            }
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PrefsError> {
        let mut values = self.load()?;
        values.insert(key.to_string(), value.to_string());
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&self.path, serde_json::to_string_pretty(&values)?)?;
        Ok(())
    }
}
