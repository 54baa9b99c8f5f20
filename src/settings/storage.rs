//! Settings Storage
//!
//! A single JSON document on disk. Writes go to a sibling temp file first and
//! are renamed into place, so a crash never leaves a half-written file.

use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

use super::UiSettings;
use crate::types::{AppError, AppResult};

pub struct SettingsStore {
    path: PathBuf,
    defaults: UiSettings,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>, defaults: UiSettings) -> Self {
        Self {
            path: path.into(),
            defaults,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Saved settings, or the defaults when nothing usable is on disk
    pub async fn load(&self) -> UiSettings {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return self.defaults.clone(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read settings file");
                return self.defaults.clone();
            }
        };
        match serde_json::from_str(&content) {
            Ok(settings) => settings,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ignoring malformed settings file");
                self.defaults.clone()
            }
        }
    }

    pub async fn save(&self, settings: &UiSettings) -> AppResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| AppError::Internal(format!("Failed to create settings directory: {}", e)))?;
        }

        let content = serde_json::to_string_pretty(settings)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to write settings: {}", e)))?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to write settings: {}", e)))?;

        info!(path = %self.path.display(), provider = %settings.provider, "Settings saved");
        Ok(())
    }
}
