//! Decode-side processing of one loaded file.
//!
//! A [`DecodePipeline`] owns the codec and everything between it and a
//! finished chunk: channel mixing, resampling, effects, loudness analysis and
//! crossfade classification. Chunks are produced by a fill loop that can be
//! driven to completion with [`DecodePipeline::fill_buffers`] or advanced one
//! chunk at a time with [`DecodePipeline::step_fill`], so the decode worker can
//! interleave control messages between chunks.

use std::time::Instant;

use segue_core::{
    BufferDescriptor, DemuxData, EffectSpec, Error, LoudnessInfo, ResamplerQuality, Result,
};
use tracing::{debug, trace};

use crate::cancel::CancellationToken;
use crate::codec::AudioCodec;
use crate::crossfade::{ChunkClass, Crossfader};
use crate::effects::EffectChain;
use crate::loudness::LoudnessAnalyzer;
use crate::mix::ChannelMixer;
use crate::pool::SampleMemory;
use crate::resample::Resampler;

/// Output layout and processing options shared by all pipelines.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioConfiguration {
    pub sample_rate: u32,
    pub channel_count: u16,
    /// Frames per decoded chunk.
    pub buffer_frame_count: usize,
    pub crossfade_secs: f64,
    pub loudness_normalization: bool,
    pub resampler_quality: ResamplerQuality,
}

impl AudioConfiguration {
    /// Length of one chunk in seconds.
    pub fn buffer_time(&self) -> f64 {
        self.buffer_frame_count as f64 / f64::from(self.sample_rate)
    }
}

/// Raw sample planes available to the decode side.
///
/// Planes arrive from the rendering context with each fill request; when they
/// run out fresh ones are allocated. Leftovers travel back once a loop ends.
#[derive(Debug, Default)]
pub struct MemorySupply {
    planes: Vec<SampleMemory>,
    frame_count: usize,
    allocated: usize,
}

impl MemorySupply {
    pub const fn new(frame_count: usize) -> Self {
        Self {
            planes: Vec::new(),
            frame_count,
            allocated: 0,
        }
    }

    /// Change the plane length; planes of another length are dropped.
    pub fn set_frame_count(&mut self, frame_count: usize) {
        self.frame_count = frame_count;
        self.planes.retain(|p| p.frames() == frame_count);
    }

    pub fn extend(&mut self, planes: impl IntoIterator<Item = SampleMemory>) {
        let frame_count = self.frame_count;
        self.planes
            .extend(planes.into_iter().filter(|p| p.frames() == frame_count));
    }

    /// Take one plane per channel.
    pub fn take(&mut self, channels: usize) -> Vec<SampleMemory> {
        (0..channels)
            .map(|_| {
                self.planes.pop().unwrap_or_else(|| {
                    self.allocated += 1;
                    SampleMemory::new(self.frame_count)
                })
            })
            .collect()
    }

    pub fn give_back(&mut self, planes: Vec<SampleMemory>) {
        self.extend(planes);
    }

    /// Hand every held plane back to its owner.
    pub fn drain(&mut self) -> Vec<SampleMemory> {
        std::mem::take(&mut self.planes)
    }

    pub fn len(&self) -> usize {
        self.planes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.planes.is_empty()
    }

    /// Planes this supply had to allocate itself.
    pub const fn allocated(&self) -> usize {
        self.allocated
    }
}

/// Result of advancing a fill loop by one chunk.
#[derive(Debug)]
pub enum FillStep {
    /// A chunk is ready; ownership of its planes moves to the receiver.
    Delivered {
        descriptor: BufferDescriptor,
        memory: Vec<SampleMemory>,
    },
    /// The loop reached its target or the end of the track.
    Finished { ended: bool },
    /// The loop observed cancellation and acknowledged it.
    Cancelled,
}

/// Summary of a completed [`DecodePipeline::fill_buffers`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FillOutcome {
    pub delivered: usize,
    pub ended: bool,
    pub cancelled: bool,
}

#[derive(Debug)]
struct FillLoop {
    /// Chunks to deliver; grows when the crossfade tail must be decoded.
    target: usize,
    filled: usize,
    token: CancellationToken,
}

struct DecodedChunk {
    length: usize,
    start_time: f64,
    end_time: f64,
    gain: Option<f32>,
}

/// Codec plus processing chain of one loaded file.
pub struct DecodePipeline {
    codec: Box<dyn AudioCodec>,
    demux: DemuxData,
    config: AudioConfiguration,
    resampler: Option<Resampler>,
    effects: EffectChain,
    loudness: LoudnessAnalyzer,
    crossfader: Crossfader,
    /// Processed frames waiting to be cut into chunks, in output layout.
    pending: Vec<Vec<f32>>,
    scratch: Vec<Vec<f32>>,
    /// Track time of the first pending frame.
    position_time: f64,
    codec_ended: bool,
    ended: bool,
    established_gain: Option<f32>,
    gain_to_report: Option<f32>,
    fill: Option<FillLoop>,
}

impl DecodePipeline {
    pub fn new(
        codec: Box<dyn AudioCodec>,
        config: &AudioConfiguration,
        effects: &[EffectSpec],
    ) -> Result<Self> {
        let demux = codec.demux_data().clone();
        if demux.sample_rate == 0 || demux.channel_count == 0 {
            return Err(Error::DecodeFailure(format!(
                "Invalid {} file: no audio format",
                demux.codec
            )));
        }
        let mut crossfader = Crossfader::new(config.crossfade_secs);
        crossfader.set_fade_in_enabled(false);
        let mut pipeline = Self {
            codec,
            resampler: None,
            effects: EffectChain::new(effects),
            loudness: LoudnessAnalyzer::new(config.channel_count, config.sample_rate),
            crossfader,
            pending: Vec::new(),
            scratch: Vec::new(),
            position_time: 0.0,
            codec_ended: false,
            ended: false,
            established_gain: demux.established_gain,
            gain_to_report: None,
            fill: None,
            config: *config,
            demux,
        };
        pipeline.rebuild_chain()?;
        Ok(pipeline)
    }

    fn rebuild_chain(&mut self) -> Result<()> {
        let channels = usize::from(self.config.channel_count);
        self.resampler = if self.demux.sample_rate == self.config.sample_rate {
            None
        } else {
            Some(Resampler::new(
                self.demux.sample_rate,
                self.config.sample_rate,
                channels,
                self.config.resampler_quality,
            )?)
        };
        self.loudness
            .reinitialize(self.config.channel_count, self.config.sample_rate);
        if let Some(gain) = self.established_gain {
            self.loudness.set_established_gain(gain);
        }
        self.pending = vec![Vec::new(); channels];
        Ok(())
    }

    pub const fn demux_data(&self) -> &DemuxData {
        &self.demux
    }

    pub const fn duration(&self) -> f64 {
        self.demux.duration
    }

    pub const fn config(&self) -> &AudioConfiguration {
        &self.config
    }

    pub const fn is_ended(&self) -> bool {
        self.ended
    }

    pub const fn is_filling(&self) -> bool {
        self.fill.is_some()
    }

    pub const fn crossfader_mut(&mut self) -> &mut Crossfader {
        &mut self.crossfader
    }

    pub const fn established_gain(&self) -> Option<f32> {
        self.established_gain
    }

    /// Adopt a gain established during an earlier playthrough.
    pub fn set_established_gain(&mut self, gain: f32) {
        self.established_gain = Some(gain);
        self.demux.established_gain = Some(gain);
        self.loudness.set_established_gain(gain);
    }

    /// Gain latched by this pipeline's own analysis, returned exactly once.
    pub const fn take_established_gain_report(&mut self) -> Option<f32> {
        self.gain_to_report.take()
    }

    pub fn set_effects(&mut self, effects: &[EffectSpec]) {
        self.effects = EffectChain::new(effects);
    }

    /// Switch to a new output layout; buffered frames are discarded.
    pub fn reconfigure(&mut self, config: &AudioConfiguration) -> Result<()> {
        if self.fill.is_some() {
            return Err(Error::InvalidState(
                "cannot reconfigure during a buffer fill loop".into(),
            ));
        }
        self.config = *config;
        self.crossfader.set_duration(config.crossfade_secs);
        self.rebuild_chain()
    }

    /// Reposition the decoder; returns the track time decoding resumes from.
    pub fn seek(&mut self, time: f64) -> Result<f64> {
        if self.fill.is_some() {
            return Err(Error::InvalidState(
                "seek requested during a buffer fill loop".into(),
            ));
        }
        let target = time.clamp(0.0, self.demux.duration);
        let point = self.codec.seek(target)?;
        for plane in &mut self.pending {
            plane.clear();
        }
        self.scratch.clear();
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
        self.effects.reset();
        self.loudness.reset()?;
        if let Some(gain) = self.established_gain {
            self.loudness.set_established_gain(gain);
        }
        self.crossfader.set_fade_in_enabled(false);
        self.codec_ended = false;
        self.ended = false;
        self.position_time = point.time;
        debug!(
            "Pipeline seeked to {:.3}s (byte {})",
            point.time, point.offset
        );
        Ok(point.time)
    }

    /// Begin a fill loop of `total` chunks.
    pub fn start_fill(&mut self, total: usize, token: CancellationToken) -> Result<()> {
        if self.fill.is_some() {
            return Err(Error::InvalidState("invalid parallel buffer fill loop".into()));
        }
        self.fill = Some(FillLoop {
            target: total,
            filled: 0,
            token,
        });
        Ok(())
    }

    /// Advance the current fill loop by one chunk.
    pub fn step_fill(&mut self, supply: &mut MemorySupply) -> Result<FillStep> {
        let mut fill = self
            .fill
            .take()
            .ok_or_else(|| Error::InvalidState("no buffer fill loop in progress".into()))?;

        if fill.token.is_cancelled() {
            fill.token.acknowledge();
            return Ok(FillStep::Cancelled);
        }
        if self.ended || fill.filled >= fill.target {
            return Ok(FillStep::Finished { ended: self.ended });
        }

        let started = Instant::now();
        let mut memory = supply.take(usize::from(self.config.channel_count));
        let decoded = match self.decode_next_buffer(&mut memory) {
            Ok(decoded) => decoded,
            Err(e) => {
                supply.give_back(memory);
                return Err(e);
            }
        };
        let Some(chunk) = decoded else {
            supply.give_back(memory);
            return Ok(FillStep::Finished { ended: true });
        };

        if fill.token.is_cancelled() {
            supply.give_back(memory);
            fill.token.acknowledge();
            return Ok(FillStep::Cancelled);
        }

        let class = match self.crossfader.classify(
            chunk.start_time,
            chunk.end_time,
            self.demux.duration,
            self.ended,
        ) {
            ChunkClass::Normal if self.ended => ChunkClass::Last,
            class => class,
        };
        if class == ChunkClass::Last {
            fill.target += self
                .crossfader
                .tail_buffer_count(self.demux.duration, self.config.buffer_time());
        }
        fill.filled += 1;

        let descriptor = BufferDescriptor {
            length: chunk.length,
            start_time: chunk.start_time,
            end_time: chunk.end_time,
            loudness_info: LoudnessInfo::new(chunk.gain),
            sample_rate: self.config.sample_rate,
            channel_count: self.config.channel_count,
            decoding_latency_ms: started.elapsed().as_secs_f64() * 1000.0,
            is_background_buffer: class == ChunkClass::Background,
            is_last_buffer: class == ChunkClass::Last,
        };
        trace!(
            "Chunk [{:.3}, {:.3}) {:?} in {:.2} ms",
            descriptor.start_time,
            descriptor.end_time,
            class,
            descriptor.decoding_latency_ms
        );

        self.fill = Some(fill);
        Ok(FillStep::Delivered { descriptor, memory })
    }

    /// Run a whole fill loop, handing each chunk to `callback`.
    pub fn fill_buffers<F>(
        &mut self,
        total: usize,
        supply: &mut MemorySupply,
        token: &CancellationToken,
        mut callback: F,
    ) -> Result<FillOutcome>
    where
        F: FnMut(BufferDescriptor, Vec<SampleMemory>),
    {
        self.start_fill(total, token.clone())?;
        let mut outcome = FillOutcome::default();
        loop {
            match self.step_fill(supply)? {
                FillStep::Delivered { descriptor, memory } => {
                    outcome.delivered += 1;
                    callback(descriptor, memory);
                }
                FillStep::Finished { ended } => {
                    outcome.ended = ended;
                    return Ok(outcome);
                }
                FillStep::Cancelled => {
                    outcome.cancelled = true;
                    return Ok(outcome);
                }
            }
        }
    }

    fn pending_frames(&self) -> usize {
        self.pending.first().map_or(0, Vec::len)
    }

    /// Decode until more than `needed` frames are pending or the codec ends,
    /// so the chunk holding the final frame is known when it is cut.
    fn refill_pending(&mut self, needed: usize) -> Result<()> {
        let channels = usize::from(self.config.channel_count);
        while self.pending_frames() <= needed && !self.codec_ended {
            self.scratch.iter_mut().for_each(Vec::clear);
            let frames = self.codec.decode_into(&mut self.scratch)?;
            let converted = if frames == 0 {
                self.codec_ended = true;
                trace!("Codec exhausted at byte {}", self.codec.position());
                match self.resampler.as_mut() {
                    Some(resampler) => resampler.flush()?,
                    None => break,
                }
            } else {
                let mixed = ChannelMixer::new(self.scratch.len(), channels).mix(&self.scratch);
                match self.resampler.as_mut() {
                    Some(resampler) => resampler.process(&mixed)?,
                    None => mixed,
                }
            };
            for (pending, plane) in self.pending.iter_mut().zip(converted) {
                pending.extend_from_slice(&plane);
            }
        }
        Ok(())
    }

    fn decode_next_buffer(&mut self, memory: &mut [SampleMemory]) -> Result<Option<DecodedChunk>> {
        let needed = self.config.buffer_frame_count;
        self.refill_pending(needed)?;
        let available = self.pending_frames();
        if available == 0 {
            self.ended = true;
            return Ok(None);
        }

        let length = available.min(needed);
        for (plane, destination) in self.pending.iter_mut().zip(memory.iter_mut()) {
            let n = length.min(destination.frames());
            destination.as_mut_slice()[..n].copy_from_slice(&plane[..n]);
            plane.drain(..length);
        }

        let mut planes: Vec<&mut [f32]> = memory
            .iter_mut()
            .map(|m| {
                let n = length.min(m.frames());
                &mut m.as_mut_slice()[..n]
            })
            .collect();
        self.effects.process(&mut planes);

        let gain = if self.config.loudness_normalization {
            let views: Vec<&[f32]> = planes.iter().map(|p| &**p).collect();
            let gain = self.loudness.add_frames(&views, length)?;
            if self.established_gain.is_none() && self.loudness.has_established_gain() {
                self.established_gain = self.loudness.established_gain();
                self.gain_to_report = self.established_gain;
                debug!("Loudness gain established: {:?}", self.established_gain);
            }
            gain
        } else {
            None
        };

        let start_time = self.position_time;
        let chunk_secs = length as f64 / f64::from(self.config.sample_rate);
        let end_time = (start_time + chunk_secs)
            .min(self.demux.duration)
            .max(start_time);
        self.crossfader.apply(
            &mut planes,
            start_time,
            self.config.sample_rate,
            self.demux.duration,
        );
        self.position_time += chunk_secs;
        self.ended = self.codec_ended && self.pending_frames() == 0;

        Ok(Some(DecodedChunk {
            length,
            start_time,
            end_time,
            gain,
        }))
    }

    /// Release the loudness analysis handle; the pipeline is unusable after.
    pub fn destroy(&mut self) {
        self.fill = None;
        self.loudness.destroy();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

    use super::*;
    use crate::testing::ToneCodec;

    fn config(crossfade: f64) -> AudioConfiguration {
        AudioConfiguration {
            sample_rate: 8000,
            channel_count: 2,
            buffer_frame_count: 3200,
            crossfade_secs: crossfade,
            loudness_normalization: true,
            resampler_quality: ResamplerQuality::Low,
        }
    }

    fn pipeline(duration: f64, crossfade: f64) -> DecodePipeline {
        let codec = ToneCodec::new(8000, 2, duration);
        DecodePipeline::new(Box::new(codec), &config(crossfade), &[]).unwrap()
    }

    fn collect(pipeline: &mut DecodePipeline, total: usize) -> (Vec<BufferDescriptor>, FillOutcome) {
        let mut supply = MemorySupply::new(3200);
        let token = CancellationToken::new();
        let mut descriptors = Vec::new();
        let outcome = pipeline
            .fill_buffers(total, &mut supply, &token, |d, _| descriptors.push(d))
            .unwrap();
        (descriptors, outcome)
    }

    #[test]
    fn test_chunks_are_contiguous() {
        let mut pipeline = pipeline(10.0, 0.0);
        let (descriptors, outcome) = collect(&mut pipeline, 5);
        assert_eq!(outcome.delivered, 5);
        assert!(!outcome.ended);
        for pair in descriptors.windows(2) {
            assert!((pair[0].end_time - pair[1].start_time).abs() < 1e-9);
        }
        assert!(descriptors.iter().all(|d| d.length == 3200));
    }

    #[test]
    fn test_final_chunk_is_last_without_crossfade() {
        let mut pipeline = pipeline(1.0, 0.0);
        let (descriptors, outcome) = collect(&mut pipeline, 10);
        assert!(outcome.ended);
        assert_eq!(descriptors.len(), 3);
        assert_eq!(descriptors[2].length, 1600);
        assert!(descriptors[2].is_last_buffer);
        assert!(descriptors[..2].iter().all(|d| !d.is_last_buffer));
    }

    #[test]
    fn test_crossfade_extends_target_for_tail() {
        let mut pipeline = pipeline(10.0, 1.0);
        pipeline.seek(8.0).unwrap();
        let (descriptors, _) = collect(&mut pipeline, 1);
        // [8.0, 8.4) is normal, so a single chunk is delivered.
        assert_eq!(descriptors.len(), 1);
        assert!(!descriptors[0].is_last_buffer);

        let (descriptors, outcome) = collect(&mut pipeline, 2);
        // [8.4, 8.8) normal, [8.8, 9.2) last, then ceil(1.0 / 0.4) tail chunks.
        assert!(descriptors[1].is_last_buffer);
        assert!(descriptors[2..].iter().all(|d| d.is_background_buffer));
        assert_eq!(descriptors.len(), 4);
        assert!(outcome.ended);
    }

    #[test]
    fn test_parallel_fill_is_invalid_state() {
        let mut pipeline = pipeline(10.0, 0.0);
        pipeline.start_fill(2, CancellationToken::new()).unwrap();
        assert!(matches!(
            pipeline.start_fill(2, CancellationToken::new()),
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(pipeline.seek(1.0), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_cancellation_stops_delivery_and_acknowledges() {
        let mut pipeline = pipeline(10.0, 0.0);
        let mut supply = MemorySupply::new(3200);
        let token = CancellationToken::new();
        let canceller = token.clone();
        let mut delivered = Vec::new();
        let outcome = pipeline
            .fill_buffers(5, &mut supply, &token, |d, memory| {
                delivered.push(d);
                drop(memory);
                canceller.cancel();
            })
            .unwrap();
        assert!(outcome.cancelled);
        assert_eq!(delivered.len(), 1);
        assert!(token.is_acknowledged());
        assert!(!pipeline.is_filling());
    }

    #[test]
    fn test_seek_resets_end_and_disables_fade_in() {
        let mut pipeline = pipeline(1.0, 0.0);
        collect(&mut pipeline, 10);
        assert!(pipeline.is_ended());
        pipeline.crossfader_mut().set_fade_in_enabled(true);
        let base = pipeline.seek(0.5).unwrap();
        assert!((base - 0.5).abs() < 1e-9);
        assert!(!pipeline.is_ended());
        assert!(!pipeline.crossfader_mut().fade_in_enabled());
        let (descriptors, _) = collect(&mut pipeline, 1);
        assert!((descriptors[0].start_time - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_established_gain_reported_once() {
        let mut pipeline = pipeline(12.0, 0.0);
        collect(&mut pipeline, 25);
        let first = pipeline.take_established_gain_report();
        assert!(first.is_some());
        assert!(pipeline.take_established_gain_report().is_none());
        // Seeking keeps the latched gain.
        pipeline.seek(1.0).unwrap();
        assert_eq!(pipeline.established_gain(), first);
    }

    #[test]
    fn test_resampled_chunks_keep_output_rate() {
        let codec = ToneCodec::new(11025, 1, 2.0);
        let mut pipeline = DecodePipeline::new(Box::new(codec), &config(0.0), &[]).unwrap();
        let (descriptors, outcome) = collect(&mut pipeline, 10);
        assert!(outcome.ended);
        let frames: usize = descriptors.iter().map(|d| d.length).sum();
        assert_eq!(frames, 16_000);
        assert!(descriptors.iter().all(|d| d.sample_rate == 8000 && d.channel_count == 2));
    }
}
