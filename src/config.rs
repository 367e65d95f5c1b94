//! Options persistence.
//!
//! Settings are stored as JSON in the XDG config directory and shared
//! across threads behind a `SettingsHandle`. The pipeline only reads them;
//! the UI layer owns mutation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Thumbnail heights selectable in the UI.
pub const THUMB_HEIGHTS: &[u32] = &[80, 120, 180, 240, 320, 480];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortBy {
    Name,
    Date,
    Size,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Height of single-image thumbnails in pixels.
    pub thumb_height: u32,
    /// Upscale images smaller than the viewport.
    pub enlarge_smaller: bool,
    /// Include dot-files when listing folders.
    pub show_hidden: bool,
    /// Build montage thumbnails for subfolders.
    pub show_folder_thumbs: bool,
    pub sort_by: SortBy,
    pub sort_order: SortOrder,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            thumb_height: 180,
            enlarge_smaller: false,
            show_hidden: false,
            show_folder_thumbs: false,
            sort_by: SortBy::Name,
            sort_order: SortOrder::Asc,
        }
    }
}

/// Shared, read-mostly view of the settings.
pub type SettingsHandle = Arc<RwLock<Settings>>;

pub fn settings_handle(settings: Settings) -> SettingsHandle {
    Arc::new(RwLock::new(settings))
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("", "", "lumo").context("Failed to determine project directories")
}

pub fn config_file() -> Result<PathBuf> {
    Ok(project_dirs()?.config_dir().join("options.json"))
}

/// Root under which the per-height thumbnail caches live.
pub fn default_cache_root() -> Result<PathBuf> {
    Ok(project_dirs()?.cache_dir().join("thumbs"))
}

/// Load settings from the platform config file, falling back to defaults
/// when the file is missing or unparsable.
pub fn load_settings() -> Settings {
    match config_file() {
        Ok(path) => read_settings(&path),
        Err(e) => {
            warn!(error = ?e, "No config directory, using default settings");
            Settings::default()
        }
    }
}

pub fn save_settings(settings: &Settings) -> Result<()> {
    write_settings(&config_file()?, settings)
}

fn read_settings(path: &Path) -> Settings {
    match std::fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
            warn!(?path, error = ?e, "Could not parse options, using defaults");
            Settings::default()
        }),
        Err(_) => Settings::default(),
    }
}

fn write_settings(path: &Path, settings: &Settings) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
    }
    let json = serde_json::to_string_pretty(settings)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {:?}", path))?;
    Ok(())
}
