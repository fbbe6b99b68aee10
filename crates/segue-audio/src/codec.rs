//! Codec seam between the decode pipeline and concrete decoders.

use segue_core::{DemuxData, Error, Result};
use tracing::debug;

use crate::decode::SymphoniaCodec;
use crate::source::FileView;

/// Where a seek actually landed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeekPoint {
    /// Track time of the next decoded frame, in seconds.
    pub time: f64,
    /// File position after the seek, in bytes.
    pub offset: u64,
}

/// A demuxer plus decoder for one loaded file.
pub trait AudioCodec: Send {
    /// Container facts gathered while opening the file.
    fn demux_data(&self) -> &DemuxData;

    /// Decode the next packet, appending planar samples in the file's channel
    /// layout to `planes`. Returns the number of frames appended; zero means
    /// end of data.
    fn decode_into(&mut self, planes: &mut Vec<Vec<f32>>) -> Result<usize>;

    /// Reposition so the next decoded frame is at `time` seconds.
    fn seek(&mut self, time: f64) -> Result<SeekPoint>;

    /// Current position in the file, in bytes.
    fn position(&self) -> u64;
}

/// Opens codecs for file views; shared by every source of a decode context.
pub trait CodecFactory: Send + Sync {
    fn open(&self, view: &FileView) -> Result<Box<dyn AudioCodec>>;
}

/// Factory backed by symphonia's format readers and decoders.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCodecFactory;

impl CodecFactory for DefaultCodecFactory {
    fn open(&self, view: &FileView) -> Result<Box<dyn AudioCodec>> {
        let codec = view.sniff_codec().ok_or_else(|| {
            Error::CodecUnsupported(format!(
                "Unrecognized audio container: {}",
                view.name().unwrap_or("<memory>")
            ))
        })?;
        debug!("Sniffed codec {codec} for {}", view.name().unwrap_or("<memory>"));
        Ok(Box::new(SymphoniaCodec::open(view, codec)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_unknown_container_is_unsupported() {
        let view = FileView::new(Bytes::from_static(b"not audio at all"), None);
        let result = DefaultCodecFactory.open(&view);
        assert!(matches!(result, Err(Error::CodecUnsupported(_))));
    }

    #[test]
    fn test_truncated_file_is_decode_failure() {
        let view = FileView::new(Bytes::from_static(b"fLaC\0\0"), None);
        let result = DefaultCodecFactory.open(&view);
        assert!(matches!(result, Err(Error::DecodeFailure(_))));
    }
}
