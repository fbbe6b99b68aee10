//! Sample rate conversion using rubato.

use rubato::{FftFixedIn, Resampler as RubatoResampler};
use segue_core::{Error, ResamplerQuality, Result};
use tracing::debug;

/// Streaming planar resampler from the file rate to the output rate.
///
/// The FFT resampler's algorithmic delay is trimmed from the head and the
/// tail is flushed so that a track keeps its exact length after conversion.
pub struct Resampler {
    #[allow(clippy::struct_field_names)]
    resampler: FftFixedIn<f32>,
    input_rate: u32,
    output_rate: u32,
    channels: usize,
    chunk_size: usize,
    /// Input frames waiting for a full chunk.
    input_buffer: Vec<Vec<f32>>,
    /// Delay frames still to be discarded from the output.
    delay_remaining: usize,
    frames_in: u64,
    frames_out: u64,
}

impl Resampler {
    /// Create a new resampler.
    pub fn new(
        input_rate: u32,
        output_rate: u32,
        channels: usize,
        quality: ResamplerQuality,
    ) -> Result<Self> {
        let resampler = FftFixedIn::new(
            input_rate as usize,
            output_rate as usize,
            quality.chunk_size(),
            quality.sub_chunks(),
            channels,
        )
        .map_err(|e| Error::DecodeFailure(format!("Failed to create resampler: {e}")))?;

        debug!(
            "Resampler created: {}Hz -> {}Hz, {} channels",
            input_rate, output_rate, channels
        );

        let chunk_size = resampler.input_frames_next();
        let delay_remaining = resampler.output_delay();
        Ok(Self {
            resampler,
            input_rate,
            output_rate,
            channels,
            chunk_size,
            input_buffer: vec![Vec::new(); channels],
            delay_remaining,
            frames_in: 0,
            frames_out: 0,
        })
    }

    /// Check if resampling is needed.
    pub const fn needs_resampling(&self) -> bool {
        self.input_rate != self.output_rate
    }

    /// Get the input sample rate.
    pub const fn input_rate(&self) -> u32 {
        self.input_rate
    }

    /// Get the output sample rate.
    pub const fn output_rate(&self) -> u32 {
        self.output_rate
    }

    /// Get the number of channels.
    pub const fn channels(&self) -> usize {
        self.channels
    }

    fn ratio(&self) -> f64 {
        f64::from(self.output_rate) / f64::from(self.input_rate)
    }

    /// Resample planar input; returns whatever full chunks produced.
    pub fn process(&mut self, input: &[Vec<f32>]) -> Result<Vec<Vec<f32>>> {
        if !self.needs_resampling() {
            return Ok(input.to_vec());
        }

        for (buffer, plane) in self.input_buffer.iter_mut().zip(input) {
            buffer.extend_from_slice(plane);
        }
        self.frames_in += input.first().map_or(0, Vec::len) as u64;

        let mut output = vec![Vec::new(); self.channels];
        while self.input_buffer[0].len() >= self.chunk_size {
            let chunk: Vec<Vec<f32>> = self
                .input_buffer
                .iter_mut()
                .map(|ch| ch.drain(..self.chunk_size).collect())
                .collect();
            let resampled = self
                .resampler
                .process(&chunk, None)
                .map_err(|e| Error::DecodeFailure(format!("Resample failed: {e}")))?;
            self.append(&resampled, &mut output, None);
        }
        Ok(output)
    }

    /// Drain the buffered input and the resampler delay at end of stream.
    pub fn flush(&mut self) -> Result<Vec<Vec<f32>>> {
        let mut output = vec![Vec::new(); self.channels];
        if !self.needs_resampling() {
            for (out, buffer) in output.iter_mut().zip(&mut self.input_buffer) {
                out.append(buffer);
            }
            return Ok(output);
        }

        let expected = (self.frames_in as f64 * self.ratio()).round() as u64;
        // A few padded chunks always cover the delay line.
        let mut rounds = 0;
        while self.frames_out < expected && rounds < 8 {
            let chunk: Vec<Vec<f32>> = self
                .input_buffer
                .iter_mut()
                .map(|ch| {
                    let mut data = std::mem::take(ch);
                    data.resize(self.chunk_size, 0.0);
                    data
                })
                .collect();
            let resampled = self
                .resampler
                .process(&chunk, None)
                .map_err(|e| Error::DecodeFailure(format!("Resample failed: {e}")))?;
            self.append(&resampled, &mut output, Some(expected));
            rounds += 1;
        }
        Ok(output)
    }

    fn append(&mut self, resampled: &[Vec<f32>], output: &mut [Vec<f32>], limit: Option<u64>) {
        let produced = resampled.first().map_or(0, Vec::len);
        let skip = self.delay_remaining.min(produced);
        self.delay_remaining -= skip;
        let mut take = produced - skip;
        if let Some(limit) = limit {
            take = take.min(limit.saturating_sub(self.frames_out) as usize);
        }
        for (out, plane) in output.iter_mut().zip(resampled) {
            out.extend_from_slice(&plane[skip..skip + take]);
        }
        self.frames_out += take as u64;
    }

    /// Reset the resampler state.
    pub fn reset(&mut self) {
        self.resampler.reset();
        self.input_buffer.iter_mut().for_each(Vec::clear);
        self.delay_remaining = self.resampler.output_delay();
        self.frames_in = 0;
        self.frames_out = 0;
    }
}
