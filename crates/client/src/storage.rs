//! Persistent key/value storage.
//!
//! Values are JSON files in the platform-appropriate config directory:
//! - Linux: `~/.config/cinebudget/`
//! - macOS: `~/Library/Application Support/cinebudget/`
//! - Windows: `%APPDATA%\cinebudget\`

use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};

/// JSON file storage rooted at one directory.
#[derive(Debug, Clone)]
pub struct Storage {
    dir: PathBuf,
}

impl Storage {
    /// Storage rooted at `dir`; the directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Storage in the platform config directory, if the platform has one.
    pub fn default_location() -> Option<Self> {
        Some(Self::new(dirs::config_dir()?.join("cinebudget")))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Save a value. Returns `true` if the operation succeeded.
    pub fn save<T: Serialize>(&self, key: &str, value: &T) -> bool {
        match serde_json::to_string(value) {
            Ok(json) => self.save_raw(key, &json),
            Err(e) => {
                tracing::warn!(key, error = %e, "failed to serialize stored value");
                false
            }
        }
    }

    /// Load a value.
    ///
    /// Returns `None` if the key doesn't exist or deserialization fails.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let json = std::fs::read_to_string(self.file_path(key)).ok()?;
        match serde_json::from_str(&json) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key, error = %e, "ignoring unreadable stored value");
                None
            }
        }
    }

    /// Remove a value. Missing keys are not an error.
    pub fn remove(&self, key: &str) {
        let path = self.file_path(key);
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove stored value");
            }
        }
    }

    fn file_path(&self, key: &str) -> PathBuf {
        // Sanitize key to be a valid filename
        let safe_key = key.replace(['/', '\\', ':', '*', '?', '"', '<', '>', '|'], "_");
        self.dir.join(format!("{}.json", safe_key))
    }

    fn save_raw(&self, key: &str, value: &str) -> bool {
        if let Err(e) = std::fs::create_dir_all(&self.dir) {
            tracing::warn!(dir = %self.dir.display(), error = %e, "failed to create storage directory");
            return false;
        }
        let path = self.file_path(key);
        match std::fs::write(&path, value) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to write stored value");
                false
            }
        }
    }
}
