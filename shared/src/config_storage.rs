//! Configuration storage for scanner calibration data.
//!
//! Provides centralized storage for per-model calibration caches so a scan at
//! an already-calibrated setting can skip the calibration sequence.
//! All config is stored in ~/.scan_config/ by default.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Configuration storage manager for scanner calibration data.
///
/// Manages loading and saving of model-specific calibration files
/// from a centralized directory (defaults to ~/.scan_config/).
#[derive(Debug, Clone)]
pub struct ConfigStorage {
    /// Root directory for all configuration (e.g., ~/.scan_config)
    root_path: PathBuf,
}

impl ConfigStorage {
    /// Create a new config storage with default path (~/.scan_config)
    pub fn new() -> std::io::Result<Self> {
        let home = std::env::var("HOME")
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::NotFound, "HOME not set"))?;
        let root_path = PathBuf::from(home).join(".scan_config");
        Ok(Self { root_path })
    }

    /// Create a new config storage with custom root path
    pub fn with_path(root_path: PathBuf) -> Self {
        Self { root_path }
    }

    /// Get the root configuration path
    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    fn calibration_dir(&self) -> PathBuf {
        self.root_path.join("calibration")
    }

    /// Cache filename for a scanner model; spaces become underscores.
    fn calibration_filename(&self, model: &str) -> PathBuf {
        let model_safe = model.replace(' ', "_");
        self.calibration_dir().join(format!("{model_safe}.json"))
    }

    /// Get the calibration cache for a model.
    ///
    /// Returns None if no cache exists.
    /// Returns Some(Err) if the file exists but cannot be loaded.
    pub fn get_calibration_cache<T: DeserializeOwned>(
        &self,
        model: &str,
    ) -> Option<Result<T, std::io::Error>> {
        let path = self.calibration_filename(model);

        if !path.exists() {
            return None;
        }

        Some(load_json(&path))
    }

    /// Save the calibration cache for a model.
    ///
    /// Creates the calibration directory if it doesn't exist.
    /// Returns the path where the cache was saved.
    pub fn save_calibration_cache<T: Serialize>(
        &self,
        model: &str,
        cache: &T,
    ) -> std::io::Result<PathBuf> {
        let dir = self.calibration_dir();
        std::fs::create_dir_all(&dir)?;

        let path = self.calibration_filename(model);
        save_json(&path, cache)?;
        Ok(path)
    }

    /// List all models with a stored calibration cache.
    pub fn list_calibration_caches(&self) -> std::io::Result<Vec<String>> {
        let dir = self.calibration_dir();

        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut models = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();

            if path.extension().and_then(|s| s.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    models.push(stem.replace('_', " "));
                }
            }
        }

        models.sort();
        Ok(models)
    }

    /// Delete the calibration cache for a model.
    ///
    /// Returns Ok(true) if the file was deleted, Ok(false) if it didn't exist.
    pub fn delete_calibration_cache(&self, model: &str) -> std::io::Result<bool> {
        let path = self.calibration_filename(model);

        if !path.exists() {
            return Ok(false);
        }

        std::fs::remove_file(path)?;
        Ok(true)
    }
}

fn save_json<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    std::fs::write(path, json)
}

fn load_json<T: DeserializeOwned>(path: &Path) -> std::io::Result<T> {
    let json = std::fs::read_to_string(path)?;
    serde_json::from_str(&json).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}
