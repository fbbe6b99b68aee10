//! Track identity and metadata exchanged with the metadata store.

use serde::{Deserialize, Serialize};

/// Caller-provided identity of the track being loaded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackInfo {
    /// Key under which the metadata store knows the track.
    pub key: String,
    /// Gain established during an earlier playthrough, if any.
    pub established_gain: Option<f32>,
}

impl TrackInfo {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            established_gain: None,
        }
    }

    pub const fn with_established_gain(mut self, gain: f32) -> Self {
        self.established_gain = Some(gain);
        self
    }
}

/// Metadata reported once a source has been demuxed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackMetadata {
    /// Duration in seconds.
    pub duration: f64,
    pub established_gain: Option<f32>,
}
