//! Engine configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{EffectSpec, Error, Result};

/// Shortest chunk length the engine accepts, in seconds.
pub const MIN_BUFFER_TIME_SECS: f64 = 0.4;

/// Longest chunk length the engine accepts, in seconds.
pub const MAX_BUFFER_TIME_SECS: f64 = 2.0;

/// Resampler quality used when the file rate differs from the output rate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResamplerQuality {
    Low,
    #[default]
    High,
}

impl ResamplerQuality {
    /// Input chunk size handed to the FFT resampler.
    pub const fn chunk_size(self) -> usize {
        match self {
            Self::Low => 512,
            Self::High => 1024,
        }
    }

    /// Number of FFT sub-chunks per input chunk.
    pub const fn sub_chunks(self) -> usize {
        match self {
            Self::Low => 1,
            Self::High => 2,
        }
    }
}

/// Tunables of the playback engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Target length of one decoded chunk, in seconds.
    pub buffer_time_secs: f64,
    /// Amount of audio each node keeps queued ahead of the playhead.
    pub sustained_buffered_secs: f64,
    /// Idle time after which the output device is suspended.
    pub idle_suspend_secs: f64,
    /// Crossfade length between consecutive tracks; zero disables fading.
    pub crossfade_secs: f64,
    pub loudness_normalization: bool,
    pub resampler_quality: ResamplerQuality,
    pub effects: Vec<EffectSpec>,
    /// Interval between time update events.
    pub time_update_interval_ms: u64,
    /// Master output volume (0.0 to 1.0).
    pub volume: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_time_secs: MIN_BUFFER_TIME_SECS,
            sustained_buffered_secs: 2.5,
            idle_suspend_secs: 20.0,
            crossfade_secs: 0.0,
            loudness_normalization: true,
            resampler_quality: ResamplerQuality::default(),
            effects: Vec::new(),
            time_update_interval_ms: 32,
            volume: 0.85,
        }
    }
}

impl EngineConfig {
    /// Read a configuration file, falling back to defaults for missing keys.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::StorageAccessFailure(format!("Failed to read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&text)?;
        config.validated()
    }

    /// Write the configuration as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Clamp values into their supported ranges and reject nonsense.
    pub fn validated(mut self) -> Result<Self> {
        if !self.buffer_time_secs.is_finite()
            || !self.sustained_buffered_secs.is_finite()
            || !self.crossfade_secs.is_finite()
            || !self.idle_suspend_secs.is_finite()
        {
            return Err(Error::InvalidArgument(
                "configuration times must be finite".to_string(),
            ));
        }
        self.buffer_time_secs = self
            .buffer_time_secs
            .clamp(MIN_BUFFER_TIME_SECS, MAX_BUFFER_TIME_SECS);
        self.sustained_buffered_secs = self.sustained_buffered_secs.max(self.buffer_time_secs);
        self.crossfade_secs = self.crossfade_secs.clamp(0.0, 12.0);
        self.idle_suspend_secs = self.idle_suspend_secs.max(0.0);
        self.volume = self.volume.clamp(0.0, 1.0);
        if self.time_update_interval_ms == 0 {
            self.time_update_interval_ms = 32;
        }
        Ok(self)
    }

    /// Number of chunks each node keeps queued.
    pub fn sustained_buffer_count(&self) -> usize {
        (self.sustained_buffered_secs / self.buffer_time_secs).ceil() as usize
    }

    /// Smallest refill request worth sending to the decode side.
    pub fn min_buffers_to_request(&self) -> usize {
        self.sustained_buffer_count().div_ceil(4)
    }

    pub fn idle_suspend_after(&self) -> Duration {
        Duration::from_secs_f64(self.idle_suspend_secs)
    }

    pub const fn time_update_interval(&self) -> Duration {
        Duration::from_millis(self.time_update_interval_ms)
    }
}
