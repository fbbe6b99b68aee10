//! Configuration file discovery and command line overrides.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use segue_core::EngineConfig;
use tracing::debug;

const CONFIG_FILE: &str = "config.json";

/// `config.json` in the platform config directory.
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("com", "segue", "Segue").map(|dirs| dirs.config_dir().join(CONFIG_FILE))
}

/// Load the configuration at `path`. A missing file means defaults unless
/// the path was given explicitly.
pub fn load(path: Option<&Path>, explicit: bool) -> Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    if !explicit && !path.exists() {
        debug!("No configuration at {}, using defaults", path.display());
        return Ok(EngineConfig::default());
    }
    let config = EngineConfig::load(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    debug!("Loaded configuration from {}", path.display());
    Ok(config)
}

/// Settings given on the command line; they win over the file.
#[derive(Debug, Default)]
pub struct Overrides {
    pub crossfade_secs: Option<f64>,
    pub volume: Option<f32>,
    pub loudness_normalization: Option<bool>,
}

impl Overrides {
    pub fn apply(&self, mut config: EngineConfig) -> Result<EngineConfig> {
        if let Some(crossfade) = self.crossfade_secs {
            config.crossfade_secs = crossfade;
        }
        if let Some(volume) = self.volume {
            config.volume = volume;
        }
        if let Some(normalize) = self.loudness_normalization {
            config.loudness_normalization = normalize;
        }
        Ok(config.validated()?)
    }
}
