//! Sums scheduled units into the interleaved device buffer.

use super::{PlaybackUnit, UnitId};

#[derive(Debug)]
struct ActiveUnit {
    unit: PlaybackUnit,
    start_frame: u64,
    /// First container frame to play.
    first_frame: usize,
    stop_frame: Option<u64>,
}

impl ActiveUnit {
    /// Clock frame right after the unit's last sample.
    fn natural_end(&self) -> u64 {
        let playable = self.unit.frames.saturating_sub(self.first_frame);
        self.start_frame + playable as u64
    }
}

/// Frame clock and unit mixer shared by the device callback and its owner.
#[derive(Debug)]
pub struct UnitMixer {
    units: Vec<ActiveUnit>,
    frame: u64,
    sample_rate: u32,
    channels: usize,
    volume: f32,
    finished: Vec<UnitId>,
}

impl UnitMixer {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            units: Vec::new(),
            frame: 0,
            sample_rate: sample_rate.max(1),
            channels: usize::from(channels.max(1)),
            volume: 1.0,
            finished: Vec::new(),
        }
    }

    pub fn current_time(&self) -> f64 {
        self.frame as f64 / f64::from(self.sample_rate)
    }

    pub const fn current_frame(&self) -> u64 {
        self.frame
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    pub const fn set_volume(&mut self, volume: f32) {
        self.volume = volume;
    }

    fn to_frame(&self, time: f64) -> u64 {
        (time.max(0.0) * f64::from(self.sample_rate)).round() as u64
    }

    pub fn add(&mut self, unit: PlaybackUnit) {
        let start_frame = self.to_frame(unit.when).max(self.frame);
        let first_frame =
            ((unit.offset.max(0.0) * f64::from(self.sample_rate)).round() as usize).min(unit.frames);
        self.units.push(ActiveUnit {
            unit,
            start_frame,
            first_frame,
            stop_frame: None,
        });
    }

    /// Stop `id` at clock time `when`. A unit that would not sound before
    /// its stop is dropped at once, releasing its container.
    pub fn stop(&mut self, id: UnitId, when: f64) {
        let stop_frame = self.to_frame(when).max(self.frame);
        let Some(index) = self.units.iter().position(|u| u.unit.id == id) else {
            return;
        };
        if stop_frame <= self.frame || stop_frame <= self.units[index].start_frame {
            self.units.remove(index);
        } else {
            self.units[index].stop_frame = Some(stop_frame);
        }
    }

    pub fn set_gain(&mut self, id: UnitId, gain: f32) {
        if let Some(active) = self.units.iter_mut().find(|u| u.unit.id == id) {
            active.unit.gain = gain;
        }
    }

    pub fn take_finished(&mut self) -> Vec<UnitId> {
        std::mem::take(&mut self.finished)
    }

    /// Drop every unit and restart the clock.
    pub fn clear(&mut self, sample_rate: u32, channels: u16) {
        *self = Self {
            volume: self.volume,
            ..Self::new(sample_rate, channels)
        };
    }

    /// Render the next `out.len() / channels` frames and advance the clock.
    pub fn render(&mut self, out: &mut [f32]) {
        out.fill(0.0);
        let channels = self.channels;
        let frames = out.len() / channels;
        let block_start = self.frame;
        let block_end = block_start + frames as u64;

        for active in &self.units {
            let end = active
                .stop_frame
                .map_or(active.natural_end(), |stop| stop.min(active.natural_end()));
            let from = active.start_frame.max(block_start);
            let to = end.min(block_end);
            if from >= to {
                continue;
            }
            let buffer = &active.unit.buffer;
            let source_channels = buffer.channel_count();
            if source_channels == 0 {
                continue;
            }
            let gain = active.unit.gain * self.volume;
            for clock in from..to {
                let source_frame = active.first_frame + (clock - active.start_frame) as usize;
                let out_frame = (clock - block_start) as usize;
                for channel in 0..channels {
                    let plane = buffer.channel(channel % source_channels);
                    if let Some(sample) = plane.get(source_frame) {
                        out[out_frame * channels + channel] += sample * gain;
                    }
                }
            }
        }

        // Soft clipping using tanh for smooth limiting
        for sample in out.iter_mut() {
            if sample.abs() > 0.9 {
                *sample = sample.tanh();
            }
        }

        let finished = &mut self.finished;
        self.units.retain(|active| {
            let natural_end = active.natural_end();
            match active.stop_frame {
                Some(stop) if stop <= block_end && stop < natural_end => false,
                _ if natural_end <= block_end => {
                    finished.push(active.unit.id);
                    false
                }
                _ => true,
            }
        });
        self.frame = block_end;
    }
}
