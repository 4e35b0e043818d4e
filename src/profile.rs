//! Display name persistence
//!
//! The profile is a small TOML file with a single `user_name` key.

use log::debug;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("Failed to access profile: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse profile: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to encode profile: {0}")]
    Encode(#[from] toml::ser::Error),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Profile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProfileStore {
    path: PathBuf,
}

impl ProfileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The stored display name, if any
    pub fn load_display_name(&self) -> Result<Option<String>, ProfileError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)?;
        let profile: Profile = toml::from_str(&content)?;
        Ok(profile.user_name.filter(|name| !name.trim().is_empty()))
    }

    pub fn save_display_name(&self, name: &str) -> Result<(), ProfileError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let profile = Profile {
            user_name: Some(name.to_string()),
        };
        std::fs::write(&self.path, toml::to_string(&profile)?)?;
        debug!("Saved display name to {}", self.path.display());
        Ok(())
    }
}
