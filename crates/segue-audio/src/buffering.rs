//! Buffering constants and the sizing rules derived from them.

use std::time::Duration;

/// Bytes per stored sample.
pub const FLOAT32_BYTES: usize = 4;

/// Rendering quantum of the output hardware, in frames.
pub const OUTPUT_BLOCK_SIZE: usize = 128;

/// Scheduling must finish within this share of the lookahead.
pub const SCHEDULE_AHEAD_RATIO: f64 = 0.75;

/// Number of rendering quanta covered by the initial lookahead.
pub const INITIAL_SCHEDULE_AHEAD_BLOCKS: usize = 12;

/// Audio kept in history for visualization, in seconds.
pub const VISUALIZATION_SECONDS: f64 = 0.5;

/// Frames a decoder may need to look back after a seek.
pub const DECODER_LOOKBACK_FRAMES: u32 = 2048;

/// Largest window served to visualizers.
pub const MAX_ANALYSER_SIZE: usize = 65536;

/// Expensive calls (seek, load, replace) closer together than this are coalesced.
pub const EXPENSIVE_CALL_THROTTLE: Duration = Duration::from_millis(100);

/// Round a fractional sample count to a whole one.
pub fn round_sample_time(samples: f64) -> f64 {
    samples.round()
}

/// Frames in one chunk for the given output rate.
pub fn buffer_frame_count(buffer_time: f64, sample_rate: u32) -> usize {
    (buffer_time * f64::from(sample_rate)).round() as usize
}

/// Chunks needed to keep [`VISUALIZATION_SECONDS`] of history.
pub fn visualization_buffer_count(buffer_time: f64) -> usize {
    (VISUALIZATION_SECONDS / buffer_time).ceil() as usize
}

/// Initial lookahead in seconds for the given output rate.
pub fn initial_schedule_ahead(sample_rate: u32) -> f64 {
    round_sample_time((OUTPUT_BLOCK_SIZE * INITIAL_SCHEDULE_AHEAD_BLOCKS) as f64)
        / f64::from(sample_rate)
}

/// Lookahead needed so that a scheduling pass of `elapsed_secs` stays within
/// [`SCHEDULE_AHEAD_RATIO`], aligned up to whole rendering quanta.
pub fn schedule_ahead_for(elapsed_secs: f64, sample_rate: u32) -> f64 {
    let samples = elapsed_secs / SCHEDULE_AHEAD_RATIO * f64::from(sample_rate);
    let blocks = (samples / OUTPUT_BLOCK_SIZE as f64).ceil();
    blocks * OUTPUT_BLOCK_SIZE as f64 / f64::from(sample_rate)
}

/// Latest position a seek may target so that at least one full chunk remains.
pub fn max_seek_time(duration: f64, buffer_time: f64, sample_rate: u32) -> f64 {
    let tail = buffer_time + f64::from(DECODER_LOOKBACK_FRAMES) / f64::from(sample_rate);
    (duration - tail).max(0.0)
}

/// Convert decibels to a linear gain factor.
pub fn decibels_to_gain(decibels: f32) -> f32 {
    10f32.powf(decibels / 20.0)
}

/// Soft limits of the two pooled resource kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLimits {
    pub max_containers: usize,
    pub max_memory: usize,
}

impl PoolLimits {
    /// Limits for a node population sustaining `sustained` chunks each.
    pub const fn for_layout(channel_count: usize, sustained: usize, visualization: usize) -> Self {
        let max_containers = 2 * sustained + visualization;
        let max_memory = max_containers * channel_count * (channel_count + 1)
            + (sustained + visualization) * channel_count;
        Self {
            max_containers,
            max_memory,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_schedule_ahead() {
        let ahead = initial_schedule_ahead(48000);
        assert!((ahead - 0.032).abs() < 1e-9);
    }

    #[test]
    fn test_schedule_ahead_is_block_aligned() {
        let ahead = schedule_ahead_for(0.05, 44100);
        let samples = ahead * 44100.0;
        assert!((samples / OUTPUT_BLOCK_SIZE as f64).fract().abs() < 1e-6);
        assert!(ahead * SCHEDULE_AHEAD_RATIO >= 0.05);
    }

    #[test]
    fn test_max_seek_time() {
        let max = max_seek_time(100.0, 0.4, 48000);
        assert!((max - (100.0 - 0.4 - 2048.0 / 48000.0)).abs() < 1e-9);
        assert!(max_seek_time(0.1, 0.4, 48000).abs() < f64::EPSILON);
    }

    #[test]
    fn test_pool_limits() {
        let limits = PoolLimits::for_layout(2, 7, 2);
        assert_eq!(limits.max_containers, 16);
        assert_eq!(limits.max_memory, 16 * 2 * 3 + 9 * 2);
    }

    #[test]
    fn test_decibels_to_gain() {
        assert!((decibels_to_gain(0.0) - 1.0).abs() < 1e-6);
        assert!((decibels_to_gain(-20.0) - 0.1).abs() < 1e-6);
    }
}
