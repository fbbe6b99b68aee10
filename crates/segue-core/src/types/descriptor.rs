//! Descriptor of one decoded, processed and classified chunk of audio.

use serde::{Deserialize, Serialize};

/// Loudness estimate attached to a decoded chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LoudnessInfo {
    /// Linear normalization gain, absent when no estimate exists.
    pub gain: Option<f32>,
}

impl LoudnessInfo {
    pub const fn new(gain: Option<f32>) -> Self {
        Self { gain }
    }

    pub const fn unknown() -> Self {
        Self { gain: None }
    }
}

/// One decoded chunk as described by the decode side.
///
/// The sample memory travels next to the descriptor, one plane per channel,
/// each holding at least `length` frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferDescriptor {
    /// Number of valid frames.
    pub length: usize,
    /// Track time of the first frame, in seconds.
    pub start_time: f64,
    /// Track time one past the last frame, in seconds.
    pub end_time: f64,
    pub loudness_info: LoudnessInfo,
    pub sample_rate: u32,
    pub channel_count: u16,
    /// Wall time spent decoding and processing this chunk.
    pub decoding_latency_ms: f64,
    /// Chunk lies wholly in the crossfade-out tail.
    pub is_background_buffer: bool,
    /// Final chunk of the track's audible span.
    pub is_last_buffer: bool,
}

impl BufferDescriptor {
    /// Playback duration of the chunk in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.length as f64 / f64::from(self.sample_rate)
    }
}
