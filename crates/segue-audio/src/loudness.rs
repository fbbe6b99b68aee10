//! Streaming loudness estimation for normalization.
//!
//! Samples are K-weighted per channel and accumulated into 100 ms energy
//! blocks. Every 400 ms window the gated integrated loudness of the retained
//! history (8 s) is turned into a gain towards [`TARGET_LOUDNESS_LUFS`]. Once a
//! full history has been seen the gain is latched as the track's established
//! gain.

use std::collections::VecDeque;
use std::f64::consts::PI;

use segue_core::{Error, Result};
use tracing::trace;

/// Loudness every track is normalized towards.
pub const TARGET_LOUDNESS_LUFS: f64 = -18.0;

/// Audio retained for the loudness estimate, in seconds.
pub const MAX_HISTORY_SECS: f64 = 8.0;

/// Gain is re-evaluated once per window.
pub const WINDOW_SECS: f64 = 0.4;

const SUB_BLOCK_SECS: f64 = 0.1;
const SUB_BLOCKS_PER_WINDOW: usize = 4;
const ABSOLUTE_GATE_LUFS: f64 = -70.0;
const RELATIVE_GATE_LU: f64 = -10.0;
const MIN_GAIN: f32 = 0.1;
const MAX_GAIN: f32 = 4.0;

#[derive(Debug, Clone, Copy)]
struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
    z1: f64,
    z2: f64,
}

impl Biquad {
    const fn new(b: [f64; 3], a: [f64; 3]) -> Self {
        Self {
            b0: b[0],
            b1: b[1],
            b2: b[2],
            a1: a[1],
            a2: a[2],
            z1: 0.0,
            z2: 0.0,
        }
    }

    fn process(&mut self, x: f64) -> f64 {
        let y = self.b0 * x + self.z1;
        self.z1 = self.b1 * x - self.a1 * y + self.z2;
        self.z2 = self.b2 * x - self.a2 * y;
        y
    }
}

/// Two-stage K-weighting filter (high shelf followed by high pass).
#[derive(Debug, Clone, Copy)]
struct KWeighting {
    shelf: Biquad,
    highpass: Biquad,
}

impl KWeighting {
    fn new(sample_rate: u32) -> Self {
        let rate = f64::from(sample_rate);

        let f0 = 1_681.974_450_955_533;
        let gain_db = 3.999_843_853_973_347;
        let q = 0.707_175_236_955_419_6;
        let k = (PI * f0 / rate).tan();
        let vh = 10f64.powf(gain_db / 20.0);
        let vb = vh.powf(0.499_666_774_154_541_6);
        let a0 = 1.0 + k / q + k * k;
        let shelf = Biquad::new(
            [
                (vh + vb * k / q + k * k) / a0,
                2.0 * (k * k - vh) / a0,
                (vh - vb * k / q + k * k) / a0,
            ],
            [1.0, 2.0 * (k * k - 1.0) / a0, (1.0 - k / q + k * k) / a0],
        );

        let f0 = 38.135_470_876_024_44;
        let q = 0.500_327_037_323_877_3;
        let k = (PI * f0 / rate).tan();
        let a0 = 1.0 + k / q + k * k;
        let highpass = Biquad::new(
            [1.0, -2.0, 1.0],
            [1.0, 2.0 * (k * k - 1.0) / a0, (1.0 - k / q + k * k) / a0],
        );

        Self { shelf, highpass }
    }

    fn process(&mut self, x: f64) -> f64 {
        self.highpass.process(self.shelf.process(x))
    }
}

/// Channel weight of the loudness sum (surround channels count more, LFE not at all).
fn channel_weight(channel: usize, channel_count: usize) -> f64 {
    match (channel_count, channel) {
        (6, 3) => 0.0,
        (5, 3 | 4) | (6, 4 | 5) => 1.41,
        _ => 1.0,
    }
}

/// Owned analysis state; dropping or destroying it releases everything.
#[derive(Debug)]
struct AnalysisHandle {
    filters: Vec<KWeighting>,
    weights: Vec<f64>,
    sub_block_frames: usize,
    sub_block_energy: f64,
    sub_block_fill: usize,
    history: VecDeque<f64>,
    max_history_blocks: usize,
}

impl AnalysisHandle {
    fn new(channel_count: u16, sample_rate: u32) -> Self {
        let channels = usize::from(channel_count);
        let sub_block_frames = ((f64::from(sample_rate) * SUB_BLOCK_SECS).round() as usize).max(1);
        Self {
            filters: vec![KWeighting::new(sample_rate); channels],
            weights: (0..channels).map(|c| channel_weight(c, channels)).collect(),
            sub_block_frames,
            sub_block_energy: 0.0,
            sub_block_fill: 0,
            history: VecDeque::new(),
            max_history_blocks: (MAX_HISTORY_SECS / SUB_BLOCK_SECS).round() as usize,
        }
    }

    fn add(&mut self, planes: &[&[f32]], frames: usize) {
        for frame in 0..frames {
            let mut energy = 0.0;
            for (channel, plane) in planes.iter().enumerate().take(self.filters.len()) {
                let x = f64::from(plane.get(frame).copied().unwrap_or(0.0));
                let y = self.filters[channel].process(x);
                energy += self.weights[channel] * y * y;
            }
            self.sub_block_energy += energy;
            self.sub_block_fill += 1;
            if self.sub_block_fill == self.sub_block_frames {
                self.history
                    .push_back(self.sub_block_energy / self.sub_block_frames as f64);
                if self.history.len() > self.max_history_blocks {
                    self.history.pop_front();
                }
                self.sub_block_energy = 0.0;
                self.sub_block_fill = 0;
            }
        }
    }

    /// Gated integrated loudness over the retained history, in LUFS.
    fn integrated_loudness(&self) -> Option<f64> {
        if self.history.len() < SUB_BLOCKS_PER_WINDOW {
            return None;
        }
        let blocks: Vec<f64> = self
            .history
            .iter()
            .copied()
            .collect::<Vec<_>>()
            .windows(SUB_BLOCKS_PER_WINDOW)
            .map(|w| w.iter().sum::<f64>() / SUB_BLOCKS_PER_WINDOW as f64)
            .filter(|&z| block_loudness(z) > ABSOLUTE_GATE_LUFS)
            .collect();
        if blocks.is_empty() {
            return None;
        }
        let relative_gate =
            block_loudness(blocks.iter().sum::<f64>() / blocks.len() as f64) + RELATIVE_GATE_LU;
        let gated: Vec<f64> = blocks
            .into_iter()
            .filter(|&z| block_loudness(z) > relative_gate)
            .collect();
        if gated.is_empty() {
            return None;
        }
        Some(block_loudness(gated.iter().sum::<f64>() / gated.len() as f64))
    }

    fn clear(&mut self) {
        for filter in &mut self.filters {
            filter.shelf.z1 = 0.0;
            filter.shelf.z2 = 0.0;
            filter.highpass.z1 = 0.0;
            filter.highpass.z2 = 0.0;
        }
        self.sub_block_energy = 0.0;
        self.sub_block_fill = 0;
        self.history.clear();
    }
}

fn block_loudness(mean_square: f64) -> f64 {
    if mean_square <= 0.0 {
        return f64::NEG_INFINITY;
    }
    -0.691 + 10.0 * mean_square.log10()
}

fn loudness_to_gain(lufs: f64) -> f32 {
    let gain = 10f64.powf((TARGET_LOUDNESS_LUFS - lufs) / 20.0) as f32;
    gain.clamp(MIN_GAIN, MAX_GAIN)
}

/// Sliding-window loudness analyzer producing normalization gains.
#[derive(Debug)]
pub struct LoudnessAnalyzer {
    handle: Option<AnalysisHandle>,
    channel_count: u16,
    sample_rate: u32,
    frames_added: u64,
    window_frames: usize,
    frames_in_window: usize,
    previous_gain: Option<f32>,
    established_gain: Option<f32>,
}

impl LoudnessAnalyzer {
    pub fn new(channel_count: u16, sample_rate: u32) -> Self {
        Self {
            handle: Some(AnalysisHandle::new(channel_count, sample_rate)),
            channel_count,
            sample_rate,
            frames_added: 0,
            window_frames: window_frames(sample_rate),
            frames_in_window: 0,
            previous_gain: None,
            established_gain: None,
        }
    }

    pub const fn channel_count(&self) -> u16 {
        self.channel_count
    }

    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn handle_mut(&mut self) -> Result<&mut AnalysisHandle> {
        self.handle
            .as_mut()
            .ok_or_else(|| Error::InvalidState("loudness analyzer is destroyed".into()))
    }

    /// Feed `frames` frames of planar audio and return the current gain.
    ///
    /// The gain only changes when a window boundary is crossed; in between the
    /// previous value is returned. After the established gain latched it is
    /// returned unconditionally.
    pub fn add_frames(&mut self, planes: &[&[f32]], frames: usize) -> Result<Option<f32>> {
        self.handle_mut()?.add(planes, frames);
        self.frames_added += frames as u64;
        if self.established_gain.is_some() {
            return Ok(self.established_gain);
        }

        self.frames_in_window += frames;
        if self.frames_in_window >= self.window_frames {
            self.frames_in_window %= self.window_frames;
            let loudness = self.handle_mut()?.integrated_loudness();
            if let Some(lufs) = loudness {
                let gain = loudness_to_gain(lufs);
                trace!("Loudness {lufs:.2} LUFS -> gain {gain:.3}");
                self.previous_gain = Some(gain);
            }
        }

        if self.frames_added >= established_after_frames(self.sample_rate) {
            if let Some(gain) = self.previous_gain {
                self.established_gain = Some(gain);
            }
        }
        Ok(self.previous_gain)
    }

    pub const fn has_established_gain(&self) -> bool {
        self.established_gain.is_some()
    }

    pub const fn established_gain(&self) -> Option<f32> {
        self.established_gain
    }

    /// Adopt a gain established by an earlier full analysis of the same track.
    pub fn set_established_gain(&mut self, gain: f32) {
        if gain.is_finite() && gain > 0.0 {
            self.established_gain = Some(gain);
            self.previous_gain = Some(gain);
        }
    }

    /// Forget all history, including the established gain.
    pub fn reset(&mut self) -> Result<()> {
        self.handle_mut()?.clear();
        self.frames_added = 0;
        self.frames_in_window = 0;
        self.previous_gain = None;
        self.established_gain = None;
        Ok(())
    }

    /// Re-create the analysis handle for a new channel layout or rate.
    pub fn reinitialize(&mut self, channel_count: u16, sample_rate: u32) {
        *self = Self::new(channel_count, sample_rate);
    }

    /// Release the analysis handle; later calls fail with `InvalidState`.
    pub fn destroy(&mut self) {
        self.handle = None;
    }

    pub const fn is_destroyed(&self) -> bool {
        self.handle.is_none()
    }
}

fn window_frames(sample_rate: u32) -> usize {
    ((f64::from(sample_rate) * WINDOW_SECS).round() as usize).max(1)
}

fn established_after_frames(sample_rate: u32) -> u64 {
    (MAX_HISTORY_SECS * f64::from(sample_rate)).ceil() as u64
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

    use super::*;

    const RATE: u32 = 8000;

    fn sine(frames: usize, amplitude: f32, offset: usize) -> Vec<f32> {
        (0..frames)
            .map(|i| {
                let t = (i + offset) as f32 / RATE as f32;
                amplitude * (2.0 * std::f32::consts::PI * 1000.0 * t).sin()
            })
            .collect()
    }

    fn feed(analyzer: &mut LoudnessAnalyzer, seconds: f64, amplitude: f32) -> Option<f32> {
        let chunk = (RATE as f64 * WINDOW_SECS) as usize;
        let chunks = (seconds / WINDOW_SECS).round() as usize;
        let mut gain = None;
        for i in 0..chunks {
            let plane = sine(chunk, amplitude, i * chunk);
            gain = analyzer.add_frames(&[&plane], chunk).unwrap();
        }
        gain
    }

    #[test]
    fn test_no_gain_before_first_window() {
        let mut analyzer = LoudnessAnalyzer::new(1, RATE);
        let plane = sine(100, 0.5, 0);
        assert_eq!(analyzer.add_frames(&[&plane], 100).unwrap(), None);
    }

    #[test]
    fn test_quiet_audio_is_boosted() {
        let mut quiet = LoudnessAnalyzer::new(1, RATE);
        let mut loud = LoudnessAnalyzer::new(1, RATE);
        let quiet_gain = feed(&mut quiet, 2.0, 0.02).unwrap();
        let loud_gain = feed(&mut loud, 2.0, 0.9).unwrap();
        assert!(quiet_gain > loud_gain);
        assert!(loud_gain < 1.0);
    }

    #[test]
    fn test_silence_yields_no_estimate() {
        let mut analyzer = LoudnessAnalyzer::new(1, RATE);
        assert_eq!(feed(&mut analyzer, 1.2, 0.0), None);
    }

    #[test]
    fn test_gain_established_after_full_history() {
        let mut analyzer = LoudnessAnalyzer::new(1, RATE);
        feed(&mut analyzer, 4.0, 0.3);
        assert!(!analyzer.has_established_gain());
        feed(&mut analyzer, 4.4, 0.3);
        assert!(analyzer.has_established_gain());
        let established = analyzer.established_gain();
        assert_eq!(feed(&mut analyzer, 0.8, 0.9), established);
    }

    #[test]
    fn test_reset_clears_established_gain() {
        let mut analyzer = LoudnessAnalyzer::new(1, RATE);
        analyzer.set_established_gain(0.5);
        assert!(analyzer.has_established_gain());
        analyzer.reset().unwrap();
        assert!(!analyzer.has_established_gain());
    }

    #[test]
    fn test_destroyed_analyzer_is_invalid_state() {
        let mut analyzer = LoudnessAnalyzer::new(2, RATE);
        analyzer.destroy();
        assert!(analyzer.is_destroyed());
        let plane = vec![0.0; 10];
        assert!(matches!(
            analyzer.add_frames(&[&plane, &plane], 10),
            Err(Error::InvalidState(_))
        ));
        analyzer.reinitialize(2, RATE);
        assert!(!analyzer.is_destroyed());
    }
}
