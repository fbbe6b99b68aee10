//! Messages between the rendering context and the decode worker.

use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use segue_core::{
    BufferDescriptor, EffectSpec, Error, ErrorKind, Result, TrackInfo, TrackMetadata,
};

use crate::pipeline::AudioConfiguration;
use crate::pool::SampleMemory;
use crate::source::AudioSource;

/// Identifies a source node on both sides of the link.
pub type NodeId = i64;

/// Node id of engine-wide calls.
pub const GLOBAL_NODE: NodeId = -1;

/// Request counters of a node at the time a request was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestStamp {
    pub seek: u64,
    pub replacement: u64,
}

/// What the first chunk of a fill loop answers.
#[derive(Debug, Clone, PartialEq)]
pub enum FillType {
    Normal,
    Seek {
        request_id: u64,
        base_time: f64,
        is_user_seek: bool,
    },
    Replacement {
        request_id: u64,
        base_time: f64,
        gapless_preload: bool,
        metadata: TrackMetadata,
    },
}

/// Rendering context to decode worker.
#[derive(Debug, Clone)]
pub enum Request {
    Configure(AudioConfiguration),
    SetEffects(Vec<EffectSpec>),
    Ping,
    Register {
        node: NodeId,
    },
    LoadSource {
        stamp: RequestStamp,
        source: AudioSource,
        track: Option<TrackInfo>,
    },
    LoadReplacement {
        stamp: RequestStamp,
        source: AudioSource,
        track: Option<TrackInfo>,
        seek_time: f64,
        gapless_preload: bool,
        count: usize,
    },
    Seek {
        stamp: RequestStamp,
        time: f64,
        count: usize,
        is_user_seek: bool,
    },
    /// Decode `count` chunks into the transferred memory.
    FillBuffers {
        stamp: RequestStamp,
        count: usize,
    },
    CancelAllOperations,
    Destroy,
}

/// Decode worker to rendering context.
#[derive(Debug, Clone)]
pub enum Response {
    SourceLoaded {
        stamp: RequestStamp,
        metadata: TrackMetadata,
    },
    /// One chunk; its planes travel in the envelope.
    BufferFilled {
        stamp: RequestStamp,
        descriptor: BufferDescriptor,
        fill_type: FillType,
    },
    /// A fill loop stopped; unused memory travels back in the envelope.
    FillFinished {
        stamp: RequestStamp,
        ended: bool,
    },
    Failed {
        stamp: RequestStamp,
        kind: ErrorKind,
        message: String,
    },
    Destroyed,
}

impl Response {
    pub fn failed(stamp: RequestStamp, error: &Error) -> Self {
        Self::Failed {
            stamp,
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// A message addressed to a node plus memory whose ownership moves with it.
#[derive(Debug)]
pub struct Envelope<M> {
    pub node_id: NodeId,
    pub message: M,
    pub transferred: Vec<SampleMemory>,
}

impl<M> Envelope<M> {
    pub const fn new(node_id: NodeId, message: M) -> Self {
        Self {
            node_id,
            message,
            transferred: Vec::new(),
        }
    }

    pub fn with_memory(mut self, memory: Vec<SampleMemory>) -> Self {
        self.transferred = memory;
        self
    }
}

/// Rendering-side end of the decode link.
#[derive(Debug, Clone)]
pub struct DecodeLink {
    requests: Sender<Envelope<Request>>,
    responses: Receiver<Envelope<Response>>,
}

/// Decode-side end of the decode link.
#[derive(Debug)]
pub struct DecodePeer {
    requests: Receiver<Envelope<Request>>,
    responses: Sender<Envelope<Response>>,
}

impl DecodeLink {
    pub fn pair() -> (Self, DecodePeer) {
        let (request_tx, request_rx) = unbounded();
        let (response_tx, response_rx) = unbounded();
        (
            Self {
                requests: request_tx,
                responses: response_rx,
            },
            DecodePeer {
                requests: request_rx,
                responses: response_tx,
            },
        )
    }

    pub fn send(&self, node_id: NodeId, message: Request) -> Result<()> {
        self.send_envelope(Envelope::new(node_id, message))
    }

    pub fn send_with_memory(
        &self,
        node_id: NodeId,
        message: Request,
        memory: Vec<SampleMemory>,
    ) -> Result<()> {
        self.send_envelope(Envelope::new(node_id, message).with_memory(memory))
    }

    fn send_envelope(&self, envelope: Envelope<Request>) -> Result<()> {
        self.requests
            .send(envelope)
            .map_err(|_| Error::Internal("decode worker is gone".into()))
    }

    pub fn try_recv(&self) -> Option<Envelope<Response>> {
        self.responses.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<Envelope<Response>> {
        self.responses.recv_timeout(timeout).ok()
    }
}

impl DecodePeer {
    /// `None` once the rendering side hung up.
    pub fn recv(&self) -> Option<Envelope<Request>> {
        self.requests.recv().ok()
    }

    /// `Ok(None)` when nothing is queued, `Err` once the rendering side hung up.
    pub fn try_recv(&self) -> Result<Option<Envelope<Request>>> {
        match self.requests.try_recv() {
            Ok(envelope) => Ok(Some(envelope)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                Err(Error::Internal("rendering context is gone".into()))
            }
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Envelope<Request>>> {
        match self.requests.recv_timeout(timeout) {
            Ok(envelope) => Ok(Some(envelope)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::Internal("rendering context is gone".into()))
            }
        }
    }

    /// Returns false when the rendering side is gone; the memory is dropped.
    pub fn send(&self, node_id: NodeId, message: Response, memory: Vec<SampleMemory>) -> bool {
        self.responses
            .send(Envelope::new(node_id, message).with_memory(memory))
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

    use super::*;

    #[test]
    fn test_memory_moves_with_envelope() {
        let (link, peer) = DecodeLink::pair();
        link.send_with_memory(
            3,
            Request::FillBuffers {
                stamp: RequestStamp::default(),
                count: 2,
            },
            vec![SampleMemory::new(16), SampleMemory::new(16)],
        )
        .unwrap();
        let envelope = peer.try_recv().unwrap().unwrap();
        assert_eq!(envelope.node_id, 3);
        assert_eq!(envelope.transferred.len(), 2);
        assert!(matches!(envelope.message, Request::FillBuffers { count: 2, .. }));
    }

    #[test]
    fn test_disconnect_is_reported() {
        let (link, peer) = DecodeLink::pair();
        drop(link);
        assert!(peer.try_recv().is_err());
        assert!(peer.recv().is_none());
    }

    #[test]
    fn test_failed_carries_kind() {
        let response = Response::failed(
            RequestStamp { seek: 2, replacement: 1 },
            &Error::CodecUnsupported("opus".into()),
        );
        match response {
            Response::Failed { stamp, kind, message } => {
                assert_eq!(stamp.seek, 2);
                assert_eq!(kind, ErrorKind::CodecUnsupported);
                assert!(message.contains("opus"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
