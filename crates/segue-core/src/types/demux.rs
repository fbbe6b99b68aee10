//! Container-level facts about a loaded file.

use serde::{Deserialize, Serialize};

/// Immutable description of a demuxed file, produced once per load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemuxData {
    /// Short codec name (`"wav"`, `"flac"`, `"mp3"`, ...).
    pub codec: String,
    /// Track duration in seconds.
    pub duration: f64,
    pub sample_rate: u32,
    pub channel_count: u16,
    /// Byte offset of the first audio packet.
    pub data_start: u64,
    /// Byte offset one past the last audio packet.
    pub data_end: u64,
    /// Loudness normalization gain established by an earlier full analysis.
    pub established_gain: Option<f32>,
}

impl DemuxData {
    /// Number of frames the whole track spans at its native rate.
    pub fn frame_count(&self) -> u64 {
        (self.duration * f64::from(self.sample_rate)).round() as u64
    }

    /// Size of the audio payload in bytes.
    pub const fn data_len(&self) -> u64 {
        self.data_end.saturating_sub(self.data_start)
    }
}
