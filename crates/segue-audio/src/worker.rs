//! The decode context: one thread serving every source node's decode requests.
//!
//! Each registered node owns a [`DecodeSource`] holding its pipeline and the
//! memory it was handed. Fill loops advance one chunk per worker iteration, so
//! a cancel or destroy queued behind a long fill is handled between chunks.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use segue_core::{EffectSpec, Error, Result, TrackInfo, TrackMetadata};
use tracing::{debug, error, info, trace, warn};

use crate::cancel::CancellationToken;
use crate::codec::CodecFactory;
use crate::message::{
    DecodePeer, Envelope, FillType, NodeId, Request, RequestStamp, Response, GLOBAL_NODE,
};
use crate::metadata::MetadataStore;
use crate::pipeline::{AudioConfiguration, DecodePipeline, FillStep, MemorySupply};
use crate::pool::SampleMemory;
use crate::source::AudioSource;

/// Longest a destroy waits for a cancelled loop to acknowledge.
const ACKNOWLEDGE_TIMEOUT: Duration = Duration::from_millis(500);

struct ActiveFill {
    stamp: RequestStamp,
    token: CancellationToken,
    /// Sent with the first chunk only.
    fill_type: Option<FillType>,
}

/// Decode-side state of one node.
#[derive(Default)]
struct DecodeSource {
    pipeline: Option<DecodePipeline>,
    track: Option<TrackInfo>,
    supply: MemorySupply,
    fill: Option<ActiveFill>,
}

impl DecodeSource {
    fn new(frame_count: usize) -> Self {
        Self {
            supply: MemorySupply::new(frame_count),
            ..Self::default()
        }
    }
}

/// Everything the decode thread owns.
pub struct DecodeContext {
    peer: DecodePeer,
    factory: Arc<dyn CodecFactory>,
    metadata: Arc<dyn MetadataStore>,
    config: Option<AudioConfiguration>,
    effects: Vec<EffectSpec>,
    sources: HashMap<NodeId, DecodeSource>,
}

impl DecodeContext {
    pub fn new(
        peer: DecodePeer,
        factory: Arc<dyn CodecFactory>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        Self {
            peer,
            factory,
            metadata,
            config: None,
            effects: Vec::new(),
            sources: HashMap::new(),
        }
    }

    /// Serve requests until the rendering side hangs up.
    pub fn run(mut self) {
        info!("Decode worker started");
        loop {
            loop {
                match self.peer.try_recv() {
                    Ok(Some(envelope)) => self.handle(envelope),
                    Ok(None) => break,
                    Err(_) => {
                        debug!("Request channel closed, shutting down");
                        return;
                    }
                }
            }

            if self.has_active_fills() {
                self.step();
            } else if let Some(envelope) = self.peer.recv() {
                self.handle(envelope);
            } else {
                debug!("Request channel closed, shutting down");
                return;
            }
        }
    }

    pub fn has_active_fills(&self) -> bool {
        self.sources.values().any(|s| s.fill.is_some())
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Dispatch one request.
    pub fn handle(&mut self, envelope: Envelope<Request>) {
        let Envelope {
            node_id,
            message,
            transferred,
        } = envelope;

        match message {
            Request::Configure(config) => self.configure(config),
            Request::SetEffects(effects) => {
                for pipeline in self.sources.values_mut().filter_map(|s| s.pipeline.as_mut()) {
                    pipeline.set_effects(&effects);
                }
                self.effects = effects;
            }
            Request::Ping => trace!("Ping from node {node_id}"),
            Request::Register { node } => {
                let frames = self.config.map_or(0, |c| c.buffer_frame_count);
                self.sources
                    .entry(node)
                    .or_insert_with(|| DecodeSource::new(frames));
                debug!("Registered node {node}");
            }
            Request::LoadSource {
                stamp,
                source,
                track,
            } => self.load_source(node_id, stamp, &source, track),
            Request::LoadReplacement {
                stamp,
                source,
                track,
                seek_time,
                gapless_preload,
                count,
            } => self.load_replacement(
                node_id,
                stamp,
                &source,
                track,
                seek_time,
                gapless_preload,
                count,
            ),
            Request::Seek {
                stamp,
                time,
                count,
                is_user_seek,
            } => self.seek(node_id, stamp, time, count, is_user_seek),
            Request::FillBuffers { stamp, count } => {
                self.fill_buffers(node_id, stamp, count, transferred);
                return;
            }
            Request::CancelAllOperations => {
                if let Some(source) = self.sources.get_mut(&node_id) {
                    cancel_fill(&self.peer, node_id, source, Duration::ZERO);
                }
            }
            Request::Destroy => self.destroy(node_id),
        }

        if !transferred.is_empty() {
            if let Some(source) = self.sources.get_mut(&node_id) {
                source.supply.extend(transferred);
            }
        }
    }

    fn configure(&mut self, config: AudioConfiguration) {
        debug!(
            "Decode configuration: {} Hz, {} channels, {} frames per chunk",
            config.sample_rate, config.channel_count, config.buffer_frame_count
        );
        self.config = Some(config);
        for (&node_id, source) in &mut self.sources {
            cancel_fill(&self.peer, node_id, source, Duration::ZERO);
            source.supply.set_frame_count(config.buffer_frame_count);
            if let Some(pipeline) = source.pipeline.as_mut() {
                if let Err(e) = pipeline.reconfigure(&config) {
                    error!("Failed to reconfigure node {node_id}: {e}");
                    source.pipeline = None;
                    let _ = self.peer.send(
                        node_id,
                        Response::failed(RequestStamp::default(), &e),
                        Vec::new(),
                    );
                }
            }
        }
    }

    fn open_pipeline(
        &self,
        source: &AudioSource,
        track: Option<&TrackInfo>,
    ) -> Result<DecodePipeline> {
        let config = self
            .config
            .ok_or_else(|| Error::InvalidState("decode context is not configured".into()))?;
        let view = source.open()?;
        let codec = self.factory.open(&view)?;
        let mut pipeline = DecodePipeline::new(codec, &config, &self.effects)?;
        let known_gain = track.and_then(|t| {
            t.established_gain
                .or_else(|| self.metadata.established_gain(&t.key))
        });
        if let Some(gain) = known_gain {
            pipeline.set_established_gain(gain);
        }
        debug!(
            "Loaded {} ({:.2}s, {} Hz, {} ch)",
            source.describe(),
            pipeline.duration(),
            pipeline.demux_data().sample_rate,
            pipeline.demux_data().channel_count
        );
        Ok(pipeline)
    }

    fn fail(&self, node_id: NodeId, stamp: RequestStamp, e: &Error) {
        error!("Node {node_id} decode request failed: {e}");
        let _ = self.peer.send(node_id, Response::failed(stamp, e), Vec::new());
    }

    fn load_source(
        &mut self,
        node_id: NodeId,
        stamp: RequestStamp,
        source: &AudioSource,
        track: Option<TrackInfo>,
    ) {
        match source_entry(&mut self.sources, self.config, node_id) {
            Ok(state) => release_pipeline(&self.peer, node_id, state),
            Err(e) => return self.fail(node_id, stamp, &e),
        }
        let pipeline = match self.open_pipeline(source, track.as_ref()) {
            Ok(pipeline) => pipeline,
            Err(e) => return self.fail(node_id, stamp, &e),
        };
        let metadata = TrackMetadata {
            duration: pipeline.duration(),
            established_gain: pipeline.established_gain(),
        };
        if let Some(state) = self.sources.get_mut(&node_id) {
            state.pipeline = Some(pipeline);
            state.track = track;
        }
        let _ = self
            .peer
            .send(node_id, Response::SourceLoaded { stamp, metadata }, Vec::new());
    }

    #[allow(clippy::too_many_arguments)]
    fn load_replacement(
        &mut self,
        node_id: NodeId,
        stamp: RequestStamp,
        source: &AudioSource,
        track: Option<TrackInfo>,
        seek_time: f64,
        gapless_preload: bool,
        count: usize,
    ) {
        match source_entry(&mut self.sources, self.config, node_id) {
            Ok(state) => cancel_fill(&self.peer, node_id, state, Duration::ZERO),
            Err(e) => return self.fail(node_id, stamp, &e),
        }
        let mut pipeline = match self.open_pipeline(source, track.as_ref()) {
            Ok(pipeline) => pipeline,
            Err(e) => return self.fail(node_id, stamp, &e),
        };
        let base_time = match pipeline.seek(seek_time) {
            Ok(base_time) => base_time,
            Err(e) => return self.fail(node_id, stamp, &e),
        };
        pipeline
            .crossfader_mut()
            .set_fade_in_enabled(gapless_preload);
        let fill_type = FillType::Replacement {
            request_id: stamp.replacement,
            base_time,
            gapless_preload,
            metadata: TrackMetadata {
                duration: pipeline.duration(),
                established_gain: pipeline.established_gain(),
            },
        };
        if let Some(state) = self.sources.get_mut(&node_id) {
            if let Some(mut old) = state.pipeline.replace(pipeline) {
                old.destroy();
            }
            state.track = track;
            start_fill(&self.peer, node_id, state, stamp, count, fill_type);
        }
    }

    fn seek(
        &mut self,
        node_id: NodeId,
        stamp: RequestStamp,
        time: f64,
        count: usize,
        is_user_seek: bool,
    ) {
        let peer = &self.peer;
        let result = source_entry(&mut self.sources, self.config, node_id).and_then(|state| {
            cancel_fill(peer, node_id, state, Duration::ZERO);
            let pipeline = state
                .pipeline
                .as_mut()
                .ok_or_else(|| Error::DecodeFailure("source is not loaded".into()))?;
            let base_time = pipeline.seek(time)?;
            let fill_type = FillType::Seek {
                request_id: stamp.seek,
                base_time,
                is_user_seek,
            };
            start_fill(peer, node_id, state, stamp, count, fill_type);
            Ok(())
        });
        if let Err(e) = result {
            self.fail(node_id, stamp, &e);
        }
    }

    fn fill_buffers(
        &mut self,
        node_id: NodeId,
        stamp: RequestStamp,
        count: usize,
        memory: Vec<SampleMemory>,
    ) {
        let peer = &self.peer;
        let result = source_entry(&mut self.sources, self.config, node_id).and_then(|state| {
            state.supply.extend(memory);
            if state.fill.is_some() {
                return Err(Error::InvalidState("invalid parallel buffer fill loop".into()));
            }
            let ended = state.pipeline.as_ref().map_or(true, DecodePipeline::is_ended);
            if ended {
                let leftover = state.supply.drain();
                let _ = peer.send(node_id, Response::FillFinished { stamp, ended: true }, leftover);
                return Ok(());
            }
            start_fill(peer, node_id, state, stamp, count, FillType::Normal);
            Ok(())
        });
        if let Err(e) = result {
            self.fail(node_id, stamp, &e);
        }
    }

    fn destroy(&mut self, node_id: NodeId) {
        if let Some(mut state) = self.sources.remove(&node_id) {
            cancel_fill(&self.peer, node_id, &mut state, ACKNOWLEDGE_TIMEOUT);
            if let Some(mut pipeline) = state.pipeline.take() {
                pipeline.destroy();
            }
            let leftover = state.supply.drain();
            let _ = self.peer.send(node_id, Response::Destroyed, leftover);
            debug!("Destroyed decode source of node {node_id}");
        } else {
            let _ = self.peer.send(node_id, Response::Destroyed, Vec::new());
        }
    }

    /// Handle queued requests and run fills until nothing is left to do.
    /// Returns false if there was no work at all.
    pub fn run_until_idle(&mut self) -> bool {
        let mut worked = false;
        loop {
            if let Ok(Some(envelope)) = self.peer.try_recv() {
                self.handle(envelope);
            } else if self.has_active_fills() {
                self.step();
            } else {
                return worked;
            }
            worked = true;
        }
    }

    /// Advance every active fill loop by one chunk.
    pub fn step(&mut self) {
        let peer = &self.peer;
        let metadata = &self.metadata;
        for (&node_id, state) in &mut self.sources {
            let (Some(fill), Some(pipeline)) = (state.fill.as_mut(), state.pipeline.as_mut())
            else {
                continue;
            };
            let stamp = fill.stamp;
            match pipeline.step_fill(&mut state.supply) {
                Ok(FillStep::Delivered { descriptor, memory }) => {
                    let fill_type = fill.fill_type.take().unwrap_or(FillType::Normal);
                    let _ = peer.send(
                        node_id,
                        Response::BufferFilled {
                            stamp,
                            descriptor,
                            fill_type,
                        },
                        memory,
                    );
                    if let (Some(gain), Some(track)) =
                        (pipeline.take_established_gain_report(), state.track.as_ref())
                    {
                        if let Err(e) = metadata.set_established_gain(&track.key, gain) {
                            warn!("Failed to store established gain for {}: {e}", track.key);
                        }
                    }
                }
                Ok(FillStep::Finished { ended }) => {
                    state.fill = None;
                    let leftover = state.supply.drain();
                    let _ = peer.send(node_id, Response::FillFinished { stamp, ended }, leftover);
                }
                Ok(FillStep::Cancelled) => {
                    state.fill = None;
                    let leftover = state.supply.drain();
                    let _ = peer.send(
                        node_id,
                        Response::FillFinished {
                            stamp,
                            ended: false,
                        },
                        leftover,
                    );
                }
                Err(e) => {
                    state.fill = None;
                    error!("Node {node_id} decode failed: {e}");
                    let leftover = state.supply.drain();
                    let _ = peer.send(node_id, Response::failed(stamp, &e), leftover);
                }
            }
        }
    }
}

/// State of `node_id`, created on first use.
fn source_entry(
    sources: &mut HashMap<NodeId, DecodeSource>,
    config: Option<AudioConfiguration>,
    node_id: NodeId,
) -> Result<&mut DecodeSource> {
    if node_id == GLOBAL_NODE {
        return Err(Error::InvalidState("node request sent as global".into()));
    }
    let frames = config.map_or(0, |c| c.buffer_frame_count);
    Ok(sources
        .entry(node_id)
        .or_insert_with(|| DecodeSource::new(frames)))
}

fn start_fill(
    peer: &DecodePeer,
    node_id: NodeId,
    state: &mut DecodeSource,
    stamp: RequestStamp,
    count: usize,
    fill_type: FillType,
) {
    let Some(pipeline) = state.pipeline.as_mut() else {
        return;
    };
    let token = CancellationToken::new();
    if let Err(e) = pipeline.start_fill(count, token.clone()) {
        let _ = peer.send(node_id, Response::failed(stamp, &e), Vec::new());
        return;
    }
    trace!("Node {node_id} fill of {count} chunks started");
    state.fill = Some(ActiveFill {
        stamp,
        token,
        fill_type: Some(fill_type),
    });
}

/// Cancel the node's fill loop, let it acknowledge and return its memory.
fn cancel_fill(peer: &DecodePeer, node_id: NodeId, state: &mut DecodeSource, wait: Duration) {
    let Some(fill) = state.fill.take() else {
        return;
    };
    fill.token.cancel();
    if let Some(pipeline) = state.pipeline.as_mut() {
        if pipeline.is_filling() {
            match pipeline.step_fill(&mut state.supply) {
                Ok(FillStep::Cancelled) => {}
                Ok(other) => warn!("Cancelled fill of node {node_id} still stepped: {other:?}"),
                Err(e) => warn!("Cancelled fill of node {node_id} failed: {e}"),
            }
        }
    }
    if !fill.token.wait_acknowledged(wait) {
        warn!("Fill loop of node {node_id} did not acknowledge cancellation");
    }
    trace!("Node {node_id} fill cancelled");
    let leftover = state.supply.drain();
    let _ = peer.send(
        node_id,
        Response::FillFinished {
            stamp: fill.stamp,
            ended: false,
        },
        leftover,
    );
}

/// Cancel and drop the node's pipeline, keeping the node registered.
fn release_pipeline(peer: &DecodePeer, node_id: NodeId, state: &mut DecodeSource) {
    cancel_fill(peer, node_id, state, Duration::ZERO);
    if let Some(mut pipeline) = state.pipeline.take() {
        pipeline.destroy();
    }
    state.track = None;
}

/// Handle of the decode thread.
pub struct DecodeWorker {
    handle: Option<JoinHandle<()>>,
}

impl DecodeWorker {
    /// Spawn the decode thread; it exits once the link's rendering end drops.
    pub fn spawn(
        peer: DecodePeer,
        factory: Arc<dyn CodecFactory>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Result<Self> {
        let context = DecodeContext::new(peer, factory, metadata);
        let handle = std::thread::Builder::new()
            .name("segue-decode".to_string())
            .spawn(move || context.run())
            .map_err(|e| Error::Internal(format!("Failed to spawn decode thread: {e}")))?;
        Ok(Self {
            handle: Some(handle),
        })
    }

    /// Wait for the thread to exit.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Decode thread panicked");
            }
        }
    }
}
