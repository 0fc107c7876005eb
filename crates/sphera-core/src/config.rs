//! Engine configuration
//!
//! Session settings the host persists between runs: cache location,
//! rendering preset, gains and transport flags. Loading is forgiving: a
//! missing or unparsable file falls back to defaults with a warning, so a
//! bad config never blocks recording.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::convolver::IrPreset;

/// Persisted engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory for pre-render caches
    pub cache_dir: Option<PathBuf>,
    /// Rendering preset for convolved playback and export
    pub preset: IrPreset,
    /// Recorder input gain in dB
    pub recording_gain_db: f32,
    /// Playback gain in dB
    pub playback_gain_db: f32,
    /// Loop playback
    pub loop_playback: bool,
    /// Convolved (vs direct) playback
    pub convolved_playback: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            preset: IrPreset::Binaural,
            recording_gain_db: 0.0,
            playback_gain_db: 0.0,
            loop_playback: false,
            convolved_playback: true,
        }
    }
}

/// Load a configuration from a YAML file, falling back to defaults when
/// the file is missing or invalid.
pub fn load_config<T>(path: &Path) -> T
where
    T: DeserializeOwned + Default,
{
    if !path.exists() {
        log::info!("Config {} does not exist, using defaults", path.display());
        return T::default();
    }

    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_yaml::from_str::<T>(&contents) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("Failed to parse {}: {}; using defaults", path.display(), e);
                T::default()
            }
        },
        Err(e) => {
            log::warn!("Failed to read {}: {}; using defaults", path.display(), e);
            T::default()
        }
    }
}

/// Save a configuration as YAML, creating parent directories as needed.
pub fn save_config<T>(config: &T, path: &Path) -> Result<()>
where
    T: Serialize,
{
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {}", parent.display()))?;
    }
    let yaml = serde_yaml::to_string(config).context("serializing config")?;
    std::fs::write(path, yaml).with_context(|| format!("writing config {}", path.display()))?;
    log::info!("Saved config to {}", path.display());
    Ok(())
}
