//! Events the engine reports to its owner.

use segue_core::ErrorKind;

use crate::message::NodeId;

/// Something that happened to one source node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    TimeUpdate {
        current_time: f64,
        duration: f64,
        /// An `Ended` event follows immediately.
        will_end: bool,
        has_ended: bool,
    },
    /// The track turned out shorter than its header claimed.
    DurationChange { duration: f64 },
    Ended { had_gapless_continuation: bool },
    /// A user seek started from `from`.
    Seeking { from: f64 },
    /// The first chunk after a user seek is scheduled at clock `scheduled_start`.
    SeekComplete { scheduled_start: f64 },
    ReplacementLoaded { scheduled_start: f64 },
    /// The first chunk of a load started playing.
    InitialPlaythrough,
    /// The last chunk of the track is queued; a good time to preload the next one.
    LastBufferQueued,
    CanPlay,
    Error { kind: ErrorKind, message: String },
}

/// Engine-wide notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Node { node: NodeId, event: NodeEvent },
    /// The output device was reopened; its clock restarted.
    OutputReset,
    /// The output device was suspended after sitting idle.
    OutputSuspended,
    /// The render thread stopped and will not recover.
    Fatal { message: String },
}
