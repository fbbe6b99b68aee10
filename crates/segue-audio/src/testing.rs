//! Synthetic codecs for unit tests.

use std::f32::consts::TAU;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use segue_core::{DemuxData, Error, Result};

use crate::codec::{AudioCodec, CodecFactory, SeekPoint};
use crate::source::FileView;

const PACKET_FRAMES: usize = 1000;

/// Generates a 440 Hz tone of fixed length.
pub struct ToneCodec {
    demux: DemuxData,
    total_frames: usize,
    frame: usize,
}

impl ToneCodec {
    pub fn new(sample_rate: u32, channel_count: u16, duration: f64) -> Self {
        let total_frames = (duration * f64::from(sample_rate)).round() as usize;
        Self {
            demux: DemuxData {
                codec: "tone".to_string(),
                duration,
                sample_rate,
                channel_count,
                data_start: 0,
                data_end: (total_frames * 4 * usize::from(channel_count)) as u64,
                established_gain: None,
            },
            total_frames,
            frame: 0,
        }
    }
}

impl AudioCodec for ToneCodec {
    fn demux_data(&self) -> &DemuxData {
        &self.demux
    }

    fn decode_into(&mut self, planes: &mut Vec<Vec<f32>>) -> Result<usize> {
        let frames = PACKET_FRAMES.min(self.total_frames - self.frame);
        planes.resize_with(usize::from(self.demux.channel_count), Vec::new);
        let rate = self.demux.sample_rate as f32;
        for plane in planes.iter_mut() {
            plane.extend(
                (self.frame..self.frame + frames).map(|i| (TAU * 440.0 * i as f32 / rate).sin() * 0.25),
            );
        }
        self.frame += frames;
        Ok(frames)
    }

    fn seek(&mut self, time: f64) -> Result<SeekPoint> {
        let rate = f64::from(self.demux.sample_rate);
        self.frame = ((time * rate).round() as usize).min(self.total_frames);
        Ok(SeekPoint {
            time: self.frame as f64 / rate,
            offset: self.position(),
        })
    }

    fn position(&self) -> u64 {
        (self.frame * 4 * usize::from(self.demux.channel_count)) as u64
    }
}

/// Opens tone codecs; the file view's first byte is the duration in seconds.
/// An empty view fails to open.
#[derive(Clone, Default)]
pub struct ToneFactory {
    pub opened: Arc<AtomicUsize>,
}

impl CodecFactory for ToneFactory {
    fn open(&self, view: &FileView) -> Result<Box<dyn AudioCodec>> {
        let seconds = view
            .bytes()
            .first()
            .copied()
            .ok_or_else(|| Error::DecodeFailure("Invalid tone file".into()))?;
        self.opened.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(ToneCodec::new(8000, 2, f64::from(seconds))))
    }
}
