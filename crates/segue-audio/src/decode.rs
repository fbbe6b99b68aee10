//! Audio decoding using symphonia.

use std::io::{Cursor, Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use segue_core::{DemuxData, Error, Result};
use symphonia::core::{
    audio::Signal,
    codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL},
    errors::Error as SymphoniaError,
    formats::{FormatOptions, FormatReader, SeekMode, SeekTo},
    io::{MediaSource, MediaSourceStream, MediaSourceStreamOptions},
    meta::MetadataOptions,
    probe::Hint,
    units::{Time, TimeBase},
};
use tracing::{debug, error, trace};

use crate::codec::{AudioCodec, SeekPoint};
use crate::source::FileView;

/// In-memory media source that publishes its read position.
struct CountingSource {
    inner: Cursor<Bytes>,
    position: Arc<AtomicU64>,
    len: u64,
}

impl Read for CountingSource {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.position.store(self.inner.position(), Ordering::Relaxed);
        Ok(n)
    }
}

impl Seek for CountingSource {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let at = self.inner.seek(pos)?;
        self.position.store(at, Ordering::Relaxed);
        Ok(at)
    }
}

impl MediaSource for CountingSource {
    fn is_seekable(&self) -> bool {
        true
    }

    fn byte_len(&self) -> Option<u64> {
        Some(self.len)
    }
}

fn time_to_secs(time: Time) -> f64 {
    time.seconds as f64 + time.frac
}

/// Symphonia-backed demuxer and decoder for one file.
pub struct SymphoniaCodec {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    time_base: Option<TimeBase>,
    demux: DemuxData,
    position: Arc<AtomicU64>,
    /// Frames to drop after an accurate seek landed early.
    skip_frames: usize,
}

impl SymphoniaCodec {
    /// Probe and open the first audio track of `view`.
    pub fn open(view: &FileView, codec: &str) -> Result<Self> {
        let position = Arc::new(AtomicU64::new(0));
        let source = CountingSource {
            inner: Cursor::new(view.bytes().clone()),
            position: Arc::clone(&position),
            len: view.len(),
        };
        let mss = MediaSourceStream::new(Box::new(source), MediaSourceStreamOptions::default());

        let mut hint = Hint::new();
        hint.with_extension(codec);

        let format_opts = FormatOptions {
            enable_gapless: true,
            ..Default::default()
        };
        let metadata_opts = MetadataOptions::default();

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &format_opts, &metadata_opts)
            .map_err(|e| Error::DecodeFailure(format!("Invalid {codec} file: {e}")))?;

        let format = probed.format;

        // Find the first audio track
        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| Error::DecodeFailure(format!("No audio track in {codec} file")))?;

        let track_id = track.id;
        let params = &track.codec_params;
        let sample_rate = params
            .sample_rate
            .ok_or_else(|| Error::DecodeFailure(format!("Unknown sample rate in {codec} file")))?;
        let channel_count = params.channels.map_or(2, |c| c.count() as u16);
        let time_base = params.time_base;
        let duration = match (time_base, params.n_frames) {
            (Some(tb), Some(n)) => time_to_secs(tb.calc_time(n)),
            (None, Some(n)) => n as f64 / f64::from(sample_rate),
            _ => {
                return Err(Error::DecodeFailure(format!(
                    "Unknown duration in {codec} file"
                )))
            }
        };

        debug!(
            "Audio track: id={}, codec={}, sample_rate={}, channels={}, duration={:.2}s",
            track_id, codec, sample_rate, channel_count, duration
        );

        let decoder = symphonia::default::get_codecs()
            .make(params, &DecoderOptions::default())
            .map_err(|e| Error::CodecUnsupported(format!("No decoder for {codec}: {e}")))?;

        let demux = DemuxData {
            codec: codec.to_string(),
            duration,
            sample_rate,
            channel_count,
            data_start: position.load(Ordering::Relaxed),
            data_end: view.len(),
            established_gain: None,
        };

        Ok(Self {
            format,
            decoder,
            track_id,
            time_base,
            demux,
            position,
            skip_frames: 0,
        })
    }

    fn ts_to_secs(&self, ts: u64) -> f64 {
        self.time_base.map_or_else(
            || ts as f64 / f64::from(self.demux.sample_rate),
            |tb| time_to_secs(tb.calc_time(ts)),
        )
    }
}

impl AudioCodec for SymphoniaCodec {
    fn demux_data(&self) -> &DemuxData {
        &self.demux
    }

    fn decode_into(&mut self, planes: &mut Vec<Vec<f32>>) -> Result<usize> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(0); // End of stream
                }
                Err(e) => {
                    return Err(Error::DecodeFailure(format!("Failed to read packet: {e}")));
                }
            };

            // Skip packets for other tracks
            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::DecodeError(e)) => {
                    // Log and skip corrupt frames
                    error!("Decode error (skipping): {e}");
                    continue;
                }
                Err(e) => {
                    return Err(Error::DecodeFailure(format!("Decode failed: {e}")));
                }
            };

            let mut buffer = decoded.make_equivalent::<f32>();
            decoded.convert(&mut buffer);
            let frames = buffer.frames();
            let skip = self.skip_frames.min(frames);
            self.skip_frames -= skip;
            if skip == frames {
                trace!("Dropped {frames} frames before seek target");
                continue;
            }

            let channels = buffer.spec().channels.count();
            planes.resize_with(channels, Vec::new);
            for (channel, plane) in planes.iter_mut().enumerate() {
                plane.extend_from_slice(&buffer.chan(channel)[skip..frames]);
            }
            return Ok(frames - skip);
        }
    }

    fn seek(&mut self, time: f64) -> Result<SeekPoint> {
        let seeked = self
            .format
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time: Time::from(time.max(0.0)),
                    track_id: Some(self.track_id),
                },
            )
            .map_err(|e| Error::DecodeFailure(format!("Seek failed: {e}")))?;

        // Reset decoder state
        self.decoder.reset();

        let landed = self.ts_to_secs(seeked.actual_ts);
        let target = self.ts_to_secs(seeked.required_ts);
        self.skip_frames =
            ((target - landed).max(0.0) * f64::from(self.demux.sample_rate)).round() as usize;
        trace!("Seek to {time:.3}s landed at {landed:.3}s");

        Ok(SeekPoint {
            time: target,
            offset: self.position(),
        })
    }

    fn position(&self) -> u64 {
        self.position.load(Ordering::Relaxed)
    }
}
