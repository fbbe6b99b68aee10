//! Core domain types for Segue.

pub mod demux;
pub mod descriptor;
pub mod effects;
pub mod track;

pub use demux::DemuxData;
pub use descriptor::{BufferDescriptor, LoudnessInfo};
pub use effects::EffectSpec;
pub use track::{TrackInfo, TrackMetadata};
