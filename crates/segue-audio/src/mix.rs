//! Channel layout conversion.

/// Converts planar audio between channel counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelMixer {
    input_channels: usize,
    output_channels: usize,
}

impl ChannelMixer {
    pub const fn new(input_channels: usize, output_channels: usize) -> Self {
        Self {
            input_channels,
            output_channels,
        }
    }

    pub const fn is_passthrough(&self) -> bool {
        self.input_channels == self.output_channels
    }

    pub const fn output_channels(&self) -> usize {
        self.output_channels
    }

    /// Mix `input` planes into `output_channels` planes.
    ///
    /// Mono is copied to every output, any layout folds down to mono by
    /// averaging, and other conversions keep the shared channels, folding the
    /// extra inputs into the front pair.
    pub fn mix(&self, input: &[Vec<f32>]) -> Vec<Vec<f32>> {
        if self.is_passthrough() || input.is_empty() {
            return input.to_vec();
        }
        let frames = input[0].len();

        if input.len() == 1 {
            return vec![input[0].clone(); self.output_channels];
        }

        if self.output_channels == 1 {
            let scale = 1.0 / input.len() as f32;
            let mono = (0..frames)
                .map(|i| input.iter().map(|plane| plane[i]).sum::<f32>() * scale)
                .collect();
            return vec![mono];
        }

        let mut output: Vec<Vec<f32>> = (0..self.output_channels)
            .map(|c| input.get(c).cloned().unwrap_or_else(|| vec![0.0; frames]))
            .collect();
        if input.len() > self.output_channels {
            for (extra_index, extra) in input.iter().enumerate().skip(self.output_channels) {
                let target = extra_index % 2;
                for (sample, value) in output[target].iter_mut().zip(extra) {
                    *sample += value * std::f32::consts::FRAC_1_SQRT_2;
                }
            }
        } else {
            // Missing surround channels get the front pair average.
            for channel in input.len()..self.output_channels {
                for i in 0..frames {
                    output[channel][i] = (input[0][i] + input[1][i]) * 0.5;
                }
            }
        }
        output
    }
}
