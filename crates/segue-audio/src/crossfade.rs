//! Crossfade classification and fade curves.

use std::f64::consts::FRAC_PI_2;

/// Role of a decoded chunk relative to the track's fade-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkClass {
    /// Ordinary body of the track.
    Normal,
    /// Straddles the fade-out boundary; the last chunk of the audible span.
    Last,
    /// Lies wholly in the fade-out tail and plays under the next track.
    Background,
}

/// Classify the chunk `[start, end)` of a track of `duration` seconds.
///
/// With a positive `crossfade`, chunks starting after `duration - crossfade`
/// are background and the chunk reaching that boundary is the last one.
/// Without crossfade every chunk is normal; the caller marks the final one.
pub fn classify_chunk(start: f64, end: f64, duration: f64, crossfade: f64) -> ChunkClass {
    if crossfade <= 0.0 {
        return ChunkClass::Normal;
    }
    let fade_out_start = duration - crossfade;
    if start > fade_out_start {
        ChunkClass::Background
    } else if end >= fade_out_start {
        ChunkClass::Last
    } else {
        ChunkClass::Normal
    }
}

/// Per-pipeline crossfade settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Crossfader {
    duration: f64,
    fade_in_enabled: bool,
}

impl Default for Crossfader {
    fn default() -> Self {
        Self::new(0.0)
    }
}

impl Crossfader {
    pub const fn new(duration: f64) -> Self {
        Self {
            duration,
            fade_in_enabled: false,
        }
    }

    pub const fn duration(&self) -> f64 {
        self.duration
    }

    pub fn set_duration(&mut self, duration: f64) {
        self.duration = duration.max(0.0);
    }

    pub const fn set_fade_in_enabled(&mut self, enabled: bool) {
        self.fade_in_enabled = enabled;
    }

    pub const fn fade_in_enabled(&self) -> bool {
        self.fade_in_enabled
    }

    /// Crossfade length usable for a track; too short tracks do not fade.
    pub fn effective_duration(&self, track_duration: f64) -> f64 {
        if self.duration > 0.0 && track_duration > 2.0 * self.duration {
            self.duration
        } else {
            0.0
        }
    }

    /// Classify a chunk; `at_end` marks the final decoded chunk.
    pub fn classify(&self, start: f64, end: f64, track_duration: f64, at_end: bool) -> ChunkClass {
        let crossfade = self.effective_duration(track_duration);
        if crossfade > 0.0 {
            classify_chunk(start, end, track_duration, crossfade)
        } else if at_end {
            ChunkClass::Last
        } else {
            ChunkClass::Normal
        }
    }

    /// Extra chunks to decode once the last chunk was seen, covering the tail.
    pub fn tail_buffer_count(&self, track_duration: f64, buffer_time: f64) -> usize {
        let crossfade = self.effective_duration(track_duration);
        if crossfade <= 0.0 || buffer_time <= 0.0 {
            return 0;
        }
        (crossfade / buffer_time).ceil() as usize
    }

    /// Apply equal-power fade curves to a chunk starting at `start_time`.
    pub fn apply(
        &self,
        planes: &mut [&mut [f32]],
        start_time: f64,
        sample_rate: u32,
        track_duration: f64,
    ) {
        let crossfade = self.effective_duration(track_duration);
        if crossfade <= 0.0 || sample_rate == 0 {
            return;
        }
        let frames = planes.iter().map(|p| p.len()).min().unwrap_or(0);
        let end_time = start_time + frames as f64 / f64::from(sample_rate);
        let fade_out_start = track_duration - crossfade;
        let fades_in = self.fade_in_enabled && start_time < crossfade;
        let fades_out = end_time > fade_out_start;
        if !fades_in && !fades_out {
            return;
        }

        for frame in 0..frames {
            let t = start_time + frame as f64 / f64::from(sample_rate);
            let mut gain = 1.0;
            if fades_in && t < crossfade {
                gain *= (t / crossfade * FRAC_PI_2).sin();
            }
            if fades_out && t > fade_out_start {
                let x = ((t - fade_out_start) / crossfade).min(1.0);
                gain *= (x * FRAC_PI_2).cos();
            }
            let gain = gain as f32;
            for plane in planes.iter_mut() {
                plane[frame] *= gain;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_classification_examples() {
        assert_eq!(classify_chunk(10.0, 15.0, 100.0, 5.0), ChunkClass::Normal);
        assert_eq!(classify_chunk(94.0, 97.0, 100.0, 5.0), ChunkClass::Last);
        assert_eq!(classify_chunk(97.0, 100.0, 100.0, 5.0), ChunkClass::Background);
        assert_eq!(classify_chunk(90.0, 95.0, 100.0, 5.0), ChunkClass::Last);
    }

    #[test]
    fn test_no_crossfade_marks_only_final_chunk() {
        let crossfader = Crossfader::new(0.0);
        assert_eq!(crossfader.classify(99.6, 100.0, 100.0, false), ChunkClass::Normal);
        assert_eq!(crossfader.classify(99.6, 100.0, 100.0, true), ChunkClass::Last);
    }

    #[test]
    fn test_short_track_does_not_fade() {
        let crossfader = Crossfader::new(5.0);
        assert_eq!(crossfader.classify(4.0, 6.0, 8.0, false), ChunkClass::Normal);
        assert_eq!(crossfader.tail_buffer_count(8.0, 0.4), 0);
        assert_eq!(crossfader.tail_buffer_count(100.0, 0.4), 13);
    }

    #[test]
    fn test_fade_in_starts_silent() {
        let mut crossfader = Crossfader::new(1.0);
        crossfader.set_fade_in_enabled(true);
        let mut plane = vec![1.0f32; 100];
        crossfader.apply(&mut [&mut plane], 0.0, 100, 10.0);
        assert!(plane[0].abs() < 1e-6);
        assert!(plane[50] > 0.6 && plane[50] < 0.8);
        assert!(plane[99] > 0.99);
    }

    #[test]
    fn test_fade_out_reaches_silence() {
        let crossfader = Crossfader::new(1.0);
        let mut plane = vec![1.0f32; 100];
        crossfader.apply(&mut [&mut plane], 9.0, 100, 10.0);
        assert!(plane[0] > 0.99);
        assert!(plane[99] < 0.02);
    }

    proptest! {
        #[test]
        fn test_exactly_one_straddling_chunk(
            duration in 20.0f64..600.0,
            crossfade in 0.5f64..8.0,
            chunk in 0.4f64..2.0,
        ) {
            let mut last = 0;
            let mut start = 0.0;
            while start < duration {
                let end = (start + chunk).min(duration);
                let class = classify_chunk(start, end, duration, crossfade);
                if class == ChunkClass::Last {
                    last += 1;
                }
                if class == ChunkClass::Background {
                    prop_assert!(start > duration - crossfade);
                }
                start = end;
            }
            prop_assert_eq!(last, 1);
        }
    }
}
