//! # segue-audio
//!
//! Gapless audio buffering and scheduling engine for Segue.
//!
//! Features:
//! - Decode worker thread producing fixed-length chunks from pooled memory
//! - Sample-accurate chunk scheduling against the output clock
//! - Gapless track transitions and crossfades
//! - Streaming loudness normalization
//! - symphonia decoding, rubato resampling, cpal output

pub mod buffering;
pub mod cancel;
pub mod chunk;
pub mod codec;
pub mod crossfade;
pub mod decode;
pub mod effects;
pub mod engine;
pub mod events;
pub mod loudness;
pub mod message;
pub mod metadata;
pub mod mix;
pub mod node;
pub mod output;
pub mod pipeline;
pub mod player;
pub mod pool;
pub mod resample;
pub mod source;
pub mod worker;

#[cfg(test)]
mod testing;

pub use codec::{AudioCodec, CodecFactory, DefaultCodecFactory};
pub use engine::{PlaybackEngine, SourceNodeHandle};
pub use events::{EngineEvent, NodeEvent};
pub use message::{DecodeLink, NodeId};
pub use metadata::{MemoryMetadataStore, MetadataStore};
pub use output::{CpalOutput, OutputDevice, OutputState, VirtualClockHandle, VirtualOutput};
pub use player::{AudioPlayer, NodeStatus, PlayerCommand};
pub use source::AudioSource;
pub use worker::DecodeWorker;
