//! Playback engine: owns the output device, the buffer pool, the link to the
//! decode worker and every source node.
//!
//! The engine is single-threaded. [`PlaybackEngine::poll`] routes decode
//! responses and finished units to their nodes, runs coalesced calls whose
//! time has come, emits periodic time updates and suspends the output once
//! nothing has played for a while.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use segue_core::{EffectSpec, EngineConfig, Error, ErrorKind, Result, TrackInfo};
use tracing::{debug, error, info, trace, warn};

use crate::buffering::{
    buffer_frame_count, initial_schedule_ahead, max_seek_time, schedule_ahead_for,
    visualization_buffer_count, PoolLimits,
};
use crate::chunk::ScheduledChunk;
use crate::events::{EngineEvent, NodeEvent};
use crate::message::{DecodeLink, Envelope, NodeId, Request, Response, GLOBAL_NODE};
use crate::node::SourceNode;
use crate::output::{OutputDevice, OutputState, PlaybackUnit, UnitId};
use crate::pipeline::AudioConfiguration;
use crate::pool::{BufferPool, PoolShape, PoolStats};
use crate::source::AudioSource;

/// Attempts made to reopen a failed output before giving up.
const OUTPUT_RESET_ATTEMPTS: usize = 2;

/// State shared by every node: the output clock, the pool and the link.
pub struct EngineContext {
    output: Box<dyn OutputDevice>,
    pub(crate) pool: BufferPool,
    link: DecodeLink,
    events: Sender<EngineEvent>,
    config: EngineConfig,
    sample_rate: u32,
    channel_count: usize,
    buffer_frame_count: usize,
    buffer_time: f64,
    visualization_buffer_count: usize,
    schedule_ahead: f64,
    hardware_latency: f64,
    stopped_since: Option<Instant>,
    output_generation: u64,
    format_generation: u64,
    clock_before_reset: f64,
    unit_owners: HashMap<UnitId, NodeId>,
    next_unit_id: UnitId,
}

impl EngineContext {
    fn new(
        output: Box<dyn OutputDevice>,
        link: DecodeLink,
        config: EngineConfig,
        events: Sender<EngineEvent>,
    ) -> Result<Self> {
        let mut ctx = Self {
            output,
            pool: BufferPool::new(),
            link,
            events,
            config,
            sample_rate: 0,
            channel_count: 0,
            buffer_frame_count: 0,
            buffer_time: 0.0,
            visualization_buffer_count: 0,
            schedule_ahead: 0.0,
            hardware_latency: 0.0,
            stopped_since: Some(Instant::now()),
            output_generation: 0,
            format_generation: 0,
            clock_before_reset: 0.0,
            unit_owners: HashMap::new(),
            next_unit_id: 1,
        };
        ctx.apply_output_format();
        ctx.output.set_volume(ctx.config.volume);
        ctx.send(GLOBAL_NODE, Request::Configure(ctx.audio_configuration()))?;
        ctx.send(GLOBAL_NODE, Request::SetEffects(ctx.config.effects.clone()))?;
        Ok(ctx)
    }

    /// Derive chunk sizes from the output's format and reshape the pool.
    fn apply_output_format(&mut self) {
        self.sample_rate = self.output.sample_rate();
        self.channel_count = usize::from(self.output.channel_count());
        self.buffer_frame_count = buffer_frame_count(self.config.buffer_time_secs, self.sample_rate);
        self.buffer_time = self.buffer_frame_count as f64 / f64::from(self.sample_rate);
        self.visualization_buffer_count = visualization_buffer_count(self.buffer_time);
        self.schedule_ahead = self
            .schedule_ahead
            .max(initial_schedule_ahead(self.sample_rate));
        self.hardware_latency = self.hardware_latency.min(self.max_latency());
        self.pool.configure(
            PoolShape::new(
                self.output.channel_count(),
                self.sample_rate,
                self.buffer_frame_count,
            ),
            PoolLimits::for_layout(
                self.channel_count,
                self.config.sustained_buffer_count(),
                self.visualization_buffer_count,
            ),
        );
        info!(
            "Output format: {} Hz, {} channels, {} frames per chunk",
            self.sample_rate, self.channel_count, self.buffer_frame_count
        );
    }

    fn audio_configuration(&self) -> AudioConfiguration {
        AudioConfiguration {
            sample_rate: self.sample_rate,
            channel_count: self.output.channel_count(),
            buffer_frame_count: self.buffer_frame_count,
            crossfade_secs: self.config.crossfade_secs,
            loudness_normalization: self.config.loudness_normalization,
            resampler_quality: self.config.resampler_quality,
        }
    }

    pub fn now(&self) -> f64 {
        self.output.current_time()
    }

    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub const fn channel_count(&self) -> usize {
        self.channel_count
    }

    pub const fn buffer_time(&self) -> f64 {
        self.buffer_time
    }

    pub const fn schedule_ahead(&self) -> f64 {
        self.schedule_ahead
    }

    pub const fn hardware_latency(&self) -> f64 {
        self.hardware_latency
    }

    pub fn max_latency(&self) -> f64 {
        self.buffer_time / 2.0
    }

    pub fn sustained_buffer_count(&self) -> usize {
        self.config.sustained_buffer_count()
    }

    pub fn min_buffers_to_request(&self) -> usize {
        self.config.min_buffers_to_request()
    }

    pub const fn visualization_buffer_count(&self) -> usize {
        self.visualization_buffer_count
    }

    pub fn max_seek_time(&self, duration: f64) -> f64 {
        max_seek_time(duration, self.buffer_time, self.sample_rate)
    }

    pub(crate) const fn output_generation(&self) -> u64 {
        self.output_generation
    }

    pub(crate) const fn format_generation(&self) -> u64 {
        self.format_generation
    }

    /// Clock time the output had reached right before its last reset.
    pub(crate) const fn clock_before_reset(&self) -> f64 {
        self.clock_before_reset
    }

    pub(crate) fn send(&self, node: NodeId, request: Request) -> Result<()> {
        self.link.send(node, request)
    }

    /// Send a request along with `planes` pooled sample planes.
    pub(crate) fn send_with_memory(
        &mut self,
        node: NodeId,
        request: Request,
        planes: usize,
    ) -> Result<()> {
        let memory = (0..planes)
            .map(|_| self.pool.alloc_memory())
            .collect::<Result<Vec<_>>>()?;
        self.link.send_with_memory(node, request, memory)
    }

    pub(crate) fn emit(&self, node: NodeId, event: NodeEvent) {
        trace!("Node {node}: {event:?}");
        let _ = self.events.send(EngineEvent::Node { node, event });
    }

    fn emit_engine(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    /// Schedule `chunk` on the output. A device failure is logged and leaves
    /// the chunk without a unit; the next resume reopens the device.
    pub(crate) fn start_unit(
        &mut self,
        node: NodeId,
        chunk: &ScheduledChunk,
        when: f64,
        gain: f32,
    ) -> Option<UnitId> {
        let buffer = chunk.buffer()?;
        let id = self.next_unit_id;
        self.next_unit_id += 1;
        let unit = PlaybackUnit {
            id,
            buffer: std::sync::Arc::clone(buffer),
            frames: chunk.length,
            when,
            offset: chunk.played_so_far,
            gain,
        };
        match self.output.start_unit(unit) {
            Ok(()) => {
                self.unit_owners.insert(id, node);
                Some(id)
            }
            Err(e) => {
                warn!("Failed to start playback unit: {e}");
                None
            }
        }
    }

    pub(crate) fn stop_unit(&mut self, unit: UnitId, when: f64) {
        self.unit_owners.remove(&unit);
        self.output.stop_unit(unit, when);
    }

    /// Stop a unit right away unless an output reset already dropped it.
    pub(crate) fn release_unit(&mut self, unit: UnitId) {
        if self.unit_owners.remove(&unit).is_some() {
            let now = self.now();
            self.output.stop_unit(unit, now);
        }
    }

    pub(crate) fn set_unit_gain(&mut self, unit: UnitId, gain: f32) {
        self.output.set_unit_gain(unit, gain);
    }

    pub(crate) fn playback_started(&mut self) {
        self.stopped_since = None;
    }

    pub(crate) fn playback_stopped(&mut self) {
        self.stopped_since.get_or_insert_with(Instant::now);
    }

    /// Make sure the output is usable before scheduling on it. A suspended or
    /// closed device is reopened rather than resumed, as is a running one
    /// that sat idle for longer than the suspend timeout. Counts as activity
    /// for the idle timer.
    pub(crate) fn resume(&mut self) {
        let idle_too_long = self
            .stopped_since
            .is_some_and(|since| since.elapsed() > self.config.idle_suspend_after());
        match self.output.state() {
            OutputState::Running if !idle_too_long => {}
            state => {
                debug!("Resuming output from {state:?}");
                self.reset_output();
            }
        }
        if self.stopped_since.is_some() {
            self.stopped_since = Some(Instant::now());
        }
    }

    /// Reopen the output, retrying once. Nodes catch up through the
    /// generation counters.
    fn reset_output(&mut self) -> bool {
        self.clock_before_reset = self.output.current_time();
        let format = (self.output.sample_rate(), self.output.channel_count());
        let mut reset = false;
        for attempt in 1..=OUTPUT_RESET_ATTEMPTS {
            match self.output.reset() {
                Ok(()) => {
                    reset = true;
                    break;
                }
                Err(e) if attempt < OUTPUT_RESET_ATTEMPTS => {
                    warn!("Output reset failed, retrying: {e}");
                }
                Err(e) => error!("Output reset failed: {e}"),
            }
        }
        if !reset {
            return false;
        }

        self.unit_owners.clear();
        self.output.set_volume(self.config.volume);
        self.output_generation += 1;
        self.emit_engine(EngineEvent::OutputReset);

        if (self.output.sample_rate(), self.output.channel_count()) != format {
            self.change_output_format();
        }
        true
    }

    /// Reshape the pool, reconfigure the decode worker and make every node
    /// rebuild its queue in the new format.
    fn change_output_format(&mut self) {
        self.apply_output_format();
        self.format_generation += 1;
        if let Err(e) = self.send(GLOBAL_NODE, Request::Configure(self.audio_configuration())) {
            error!("Failed to reconfigure decode worker: {e}");
        }
    }

    /// Raise the lookahead if scheduling took longer than its budget. The
    /// lookahead never shrinks.
    pub(crate) fn record_scheduling_time(&mut self, elapsed_ms: f64) {
        let needed = schedule_ahead_for(elapsed_ms / 1000.0, self.sample_rate);
        if needed > self.schedule_ahead {
            warn!(
                "Scheduling took {elapsed_ms:.2}ms, raising lookahead to {:.1}ms",
                needed * 1000.0
            );
            self.schedule_ahead = needed;
        }
    }
}

/// Owner of the rendering side.
pub struct PlaybackEngine {
    ctx: EngineContext,
    nodes: BTreeMap<NodeId, SourceNode>,
    next_node_id: NodeId,
    events: Receiver<EngineEvent>,
    last_time_update: Instant,
}

impl PlaybackEngine {
    /// Create the engine and configure the decode worker behind `link`.
    pub fn new(output: Box<dyn OutputDevice>, link: DecodeLink, config: EngineConfig) -> Result<Self> {
        let config = config.validated()?;
        let (event_tx, event_rx) = unbounded();
        info!(
            "Playback engine on {} ({} Hz, {} channels)",
            output.device_name(),
            output.sample_rate(),
            output.channel_count()
        );
        Ok(Self {
            ctx: EngineContext::new(output, link, config, event_tx)?,
            nodes: BTreeMap::new(),
            next_node_id: 0,
            events: event_rx,
            last_time_update: Instant::now(),
        })
    }

    /// Receiver of engine events; clones share one queue.
    pub fn events(&self) -> Receiver<EngineEvent> {
        self.events.clone()
    }

    pub fn try_recv_event(&self) -> Option<EngineEvent> {
        self.events.try_recv().ok()
    }

    pub fn create_node(&mut self) -> Result<NodeId> {
        let id = self.next_node_id;
        self.next_node_id += 1;
        let node = SourceNode::new(id, &mut self.ctx)?;
        self.nodes.insert(id, node);
        debug!("Created node {id}");
        Ok(id)
    }

    pub fn node(&mut self, id: NodeId) -> Option<SourceNodeHandle<'_>> {
        let ctx = &mut self.ctx;
        self.nodes
            .get_mut(&id)
            .filter(|node| !node.is_destroyed())
            .map(|node| SourceNodeHandle { node, ctx })
    }

    pub fn node_ref(&self, id: NodeId) -> Option<&SourceNode> {
        self.nodes.get(&id).filter(|node| !node.is_destroyed())
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub fn destroy_node(&mut self, id: NodeId) -> Result<()> {
        if let Some(mut node) = self.nodes.remove(&id) {
            node.destroy(&mut self.ctx)?;
        }
        Ok(())
    }

    /// Wait up to `timeout` for a decode response, then [`poll`](Self::poll).
    pub fn poll_timeout(&mut self, timeout: Duration) -> Result<()> {
        let timeout = timeout.min(self.next_wakeup());
        if let Some(envelope) = self.ctx.link.recv_timeout(timeout) {
            self.dispatch(envelope)?;
        }
        self.poll()
    }

    /// Time until the engine has timer work to do.
    pub fn next_wakeup(&self) -> Duration {
        let now = Instant::now();
        let time_update = (self.last_time_update + self.ctx.config.time_update_interval())
            .saturating_duration_since(now);
        self.nodes
            .values()
            .filter_map(SourceNode::next_deferred_due)
            .map(|due| due.saturating_duration_since(now))
            .fold(time_update, Duration::min)
    }

    /// Process everything that is ready. Only programming errors are
    /// returned; decode and device failures are reported as events.
    pub fn poll(&mut self) -> Result<()> {
        while let Some(envelope) = self.ctx.link.try_recv() {
            self.dispatch(envelope)?;
        }

        for unit in self.ctx.output.take_finished() {
            let Some(node_id) = self.ctx.unit_owners.remove(&unit) else {
                continue;
            };
            if let Some(node) = self.nodes.get_mut(&node_id) {
                node.source_ended(&mut self.ctx, unit)?;
            }
        }

        for node in self.nodes.values_mut() {
            node.run_deferred(&mut self.ctx)?;
        }

        if self.last_time_update.elapsed() >= self.ctx.config.time_update_interval() {
            self.last_time_update = Instant::now();
            for node in self.nodes.values_mut() {
                if node.has_source() && !node.is_paused() {
                    node.time_update(&self.ctx);
                }
            }
        }

        self.check_output();
        self.sync_nodes()
    }

    fn dispatch(&mut self, envelope: Envelope<Response>) -> Result<()> {
        let Envelope {
            node_id,
            message,
            transferred,
        } = envelope;
        if node_id == GLOBAL_NODE {
            self.ctx.pool.free_transfer_list(transferred);
            if let Response::Failed { kind, message, .. } = message {
                if kind == ErrorKind::InvalidState {
                    return Err(Error::InvalidState(message));
                }
                error!("Decode worker error: {message}");
            }
            return Ok(());
        }
        match self.nodes.get_mut(&node_id) {
            Some(node) => node.receive(&mut self.ctx, message, transferred),
            None => {
                trace!("Response for unknown node {node_id}");
                self.ctx.pool.free_transfer_list(transferred);
                Ok(())
            }
        }
    }

    /// Suspend an idle output; reopen a failed one that still has work.
    fn check_output(&mut self) {
        let rendering = self.nodes.values().any(SourceNode::is_rendering);
        match self.ctx.output.state() {
            OutputState::Running if !rendering => {
                let idle = self
                    .ctx
                    .stopped_since
                    .is_some_and(|since| since.elapsed() >= self.ctx.config.idle_suspend_after());
                if idle {
                    match self.ctx.output.suspend() {
                        Ok(()) => {
                            debug!("Output idle, suspending");
                            self.ctx.emit_engine(EngineEvent::OutputSuspended);
                        }
                        Err(e) => warn!("Failed to suspend output: {e}"),
                    }
                }
            }
            OutputState::Closed if rendering => {
                warn!("Output closed during playback, reopening");
                self.ctx.resume();
            }
            _ => {}
        }
    }

    fn sync_nodes(&mut self) -> Result<()> {
        for node in self.nodes.values_mut() {
            node.sync_output(&mut self.ctx)?;
        }
        self.nodes.retain(|_, node| !node.is_destroyed());
        Ok(())
    }

    pub fn current_time(&self) -> f64 {
        self.ctx.now()
    }

    pub const fn schedule_ahead(&self) -> f64 {
        self.ctx.schedule_ahead()
    }

    /// Feed a measured scheduling pass, in milliseconds.
    pub fn record_scheduling_time(&mut self, elapsed_ms: f64) {
        self.ctx.record_scheduling_time(elapsed_ms);
    }

    /// Set the output latency compensated for by visualization. Non-finite
    /// values are ignored; others are clamped to half a chunk.
    pub fn set_hardware_latency(&mut self, seconds: f64) {
        if !seconds.is_finite() {
            return;
        }
        self.ctx.hardware_latency = seconds.clamp(0.0, self.ctx.max_latency());
    }

    pub const fn hardware_latency(&self) -> f64 {
        self.ctx.hardware_latency()
    }

    pub fn max_latency(&self) -> f64 {
        self.ctx.max_latency()
    }

    pub const fn buffer_time(&self) -> f64 {
        self.ctx.buffer_time()
    }

    pub const fn sample_rate(&self) -> u32 {
        self.ctx.sample_rate()
    }

    pub const fn channel_count(&self) -> usize {
        self.ctx.channel_count()
    }

    pub fn output_state(&self) -> OutputState {
        self.ctx.output.state()
    }

    pub fn device_name(&self) -> String {
        self.ctx.output.device_name()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.ctx.pool.stats()
    }

    pub const fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    pub fn set_volume(&mut self, volume: f32) {
        let volume = volume.clamp(0.0, 1.0);
        self.ctx.config.volume = volume;
        self.ctx.output.set_volume(volume);
    }

    pub fn set_effects(&mut self, effects: Vec<EffectSpec>) -> Result<()> {
        self.ctx.config.effects.clone_from(&effects);
        self.ctx.send(GLOBAL_NODE, Request::SetEffects(effects))
    }

    /// Ask the decode worker for a sign of life.
    pub fn ping(&self) -> Result<()> {
        self.ctx.send(GLOBAL_NODE, Request::Ping)
    }

    /// Bring the output back if it is suspended or failed.
    pub fn resume(&mut self) -> Result<()> {
        self.ctx.resume();
        self.sync_nodes()
    }

    /// Reopen the output, e.g. after the system default device changed.
    pub fn reset_output(&mut self) -> Result<()> {
        self.ctx.reset_output();
        self.sync_nodes()
    }

    /// Re-read the output format and rebuild every node's pending chunks,
    /// even when the device did not reopen.
    pub fn reconfigure_output(&mut self) -> Result<()> {
        self.ctx.change_output_format();
        self.sync_nodes()
    }
}

/// Borrowed access to one node together with the engine state it needs.
pub struct SourceNodeHandle<'a> {
    node: &'a mut SourceNode,
    ctx: &'a mut EngineContext,
}

impl SourceNodeHandle<'_> {
    pub const fn id(&self) -> NodeId {
        self.node.id()
    }

    pub fn node(&self) -> &SourceNode {
        self.node
    }

    /// Load `source` and start at `start_fraction` of its duration once loaded.
    pub fn load(
        &mut self,
        source: AudioSource,
        start_fraction: f64,
        track: Option<TrackInfo>,
    ) -> Result<()> {
        self.node.load(self.ctx, source, start_fraction, track)
    }

    /// Swap in `source` at `seek_time`. With `gapless_preload`, the current
    /// track plays out first and the new one follows without a gap.
    pub fn replace(
        &mut self,
        source: AudioSource,
        seek_time: f64,
        gapless_preload: bool,
        track: Option<TrackInfo>,
    ) -> Result<()> {
        self.node
            .replace(self.ctx, source, seek_time, gapless_preload, track)
    }

    pub fn set_current_time(&mut self, time: f64) -> Result<()> {
        self.node.set_current_time(self.ctx, time)
    }

    pub fn play(&mut self) -> Result<()> {
        self.node.play(self.ctx)
    }

    pub fn pause(&mut self) {
        self.node.pause(self.ctx);
    }

    pub fn unload(&mut self) -> Result<()> {
        self.node.unload(self.ctx)
    }

    pub fn destroy(self) -> Result<()> {
        self.node.destroy(self.ctx)
    }

    pub const fn current_time(&self) -> f64 {
        self.node.current_time()
    }

    pub const fn duration(&self) -> f64 {
        self.node.duration()
    }

    pub const fn is_paused(&self) -> bool {
        self.node.is_paused()
    }

    pub const fn is_seeking(&self) -> bool {
        self.node.is_seeking()
    }

    pub const fn is_replacing(&self) -> bool {
        self.node.is_replacing()
    }

    pub const fn has_gapless_preload(&self) -> bool {
        self.node.has_gapless_preload()
    }

    /// See [`SourceNode::upcoming_samples`].
    pub fn upcoming_samples(&self, out: &mut [f32]) -> bool {
        self.node.upcoming_samples(self.ctx, out)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

    use super::*;
    use crate::message::{DecodePeer, RequestStamp};
    use crate::metadata::MemoryMetadataStore;
    use crate::output::{VirtualClockHandle, VirtualOutput};
    use crate::testing::ToneFactory;
    use crate::worker::DecodeContext;
    use proptest::prelude::*;
    use std::sync::Arc;

    struct Harness {
        engine: PlaybackEngine,
        decode: DecodeContext,
        clock: VirtualClockHandle,
    }

    impl Harness {
        fn new(config: EngineConfig) -> Self {
            let (output, clock) = VirtualOutput::new(8000, 2);
            let (link, peer) = DecodeLink::pair();
            let decode = DecodeContext::new(
                peer,
                Arc::new(ToneFactory::default()),
                Arc::new(MemoryMetadataStore::new()),
            );
            let engine = PlaybackEngine::new(Box::new(output), link, config).unwrap();
            Self {
                engine,
                decode,
                clock,
            }
        }

        fn settle(&mut self) {
            for _ in 0..8 {
                self.decode.run_until_idle();
                self.engine.poll().unwrap();
            }
        }

        /// Advance the output clock in small steps, letting both sides react.
        fn advance(&mut self, seconds: f64) {
            let steps = (seconds / 0.05).round() as usize;
            for _ in 0..steps {
                self.clock.advance(0.05);
                self.settle();
            }
        }

        fn node_events(&self) -> Vec<NodeEvent> {
            let mut events = Vec::new();
            while let Some(event) = self.engine.try_recv_event() {
                if let EngineEvent::Node { event, .. } = event {
                    if !matches!(event, NodeEvent::TimeUpdate { .. }) {
                        events.push(event);
                    }
                }
            }
            events
        }
    }

    fn tone(seconds: u8) -> AudioSource {
        AudioSource::memory(vec![seconds])
    }

    fn loaded(seconds: u8) -> (Harness, NodeId) {
        let mut h = Harness::new(EngineConfig::default());
        let id = h.engine.create_node().unwrap();
        h.engine
            .node(id)
            .unwrap()
            .load(tone(seconds), 0.0, None)
            .unwrap();
        h.settle();
        (h, id)
    }

    #[test]
    fn test_load_fills_queue_and_reports_can_play() {
        let (h, id) = loaded(5);
        let node = h.engine.node_ref(id).unwrap();
        assert!(node.has_source());
        assert!((node.duration() - 5.0).abs() < 1e-9);
        assert_eq!(node.queued_chunks().count(), 7);
        assert!(h.node_events().contains(&NodeEvent::CanPlay));
    }

    #[test]
    fn test_first_chunk_of_load_is_announced() {
        let (mut h, id) = loaded(3);
        let events = h.node_events();
        let can_play = events.iter().position(|e| *e == NodeEvent::CanPlay).unwrap();
        let loaded_at = events
            .iter()
            .position(|e| matches!(e, NodeEvent::ReplacementLoaded { .. }))
            .unwrap();
        assert!(can_play < loaded_at);
        assert!(!events.iter().any(|e| matches!(e, NodeEvent::SeekComplete { .. })));

        std::thread::sleep(EXPENSIVE_CALL_THROTTLE_FOR_TESTS);
        h.engine.node(id).unwrap().set_current_time(1.0).unwrap();
        h.settle();
        let events = h.node_events();
        assert!(events.iter().any(|e| matches!(e, NodeEvent::SeekComplete { .. })));
        assert!(!events.iter().any(|e| matches!(e, NodeEvent::ReplacementLoaded { .. })));
    }

    #[test]
    fn test_play_chains_chunks_back_to_back() {
        let (mut h, id) = loaded(5);
        h.engine.node(id).unwrap().play().unwrap();
        h.settle();
        let started = h.clock.started_units();
        assert_eq!(started.len(), 7);
        for pair in started.windows(2) {
            let expected = pair[0].when + pair[0].frames as f64 / 8000.0;
            assert!((pair[1].when - expected).abs() < 1e-9);
        }
        assert!(h.node_events().contains(&NodeEvent::InitialPlaythrough));
    }

    #[test]
    fn test_queue_times_are_contiguous_while_playing() {
        let (mut h, id) = loaded(6);
        h.engine.node(id).unwrap().play().unwrap();
        h.advance(2.0);
        let node = h.engine.node_ref(id).unwrap();
        let chunks: Vec<_> = node.queued_chunks().collect();
        assert!(!chunks.is_empty());
        for pair in chunks.windows(2) {
            assert!(pair[0].started.unwrap() <= pair[1].started.unwrap());
            assert!((pair[0].end_time - pair[1].start_time).abs() < 1e-6);
        }
        let played: f64 = node
            .history_chunks()
            .chain(node.queued_chunks())
            .map(|c| c.played_so_far)
            .sum();
        assert!(played <= node.duration());
    }

    #[test]
    fn test_plays_to_end() {
        let (mut h, id) = loaded(1);
        h.engine.node(id).unwrap().play().unwrap();
        h.advance(1.5);
        let events = h.node_events();
        assert!(events.contains(&NodeEvent::LastBufferQueued));
        assert!(events.contains(&NodeEvent::Ended {
            had_gapless_continuation: false
        }));
        let node = h.engine.node_ref(id).unwrap();
        assert!(node.has_ended());
        assert!((node.current_time() - 1.0).abs() < 1e-9);
        assert_eq!(h.clock.active_unit_count(), 0);
    }

    #[test]
    fn test_seek_is_clamped_and_completes() {
        let (mut h, id) = loaded(3);
        h.engine.node(id).unwrap().play().unwrap();
        h.advance(0.2);
        std::thread::sleep(EXPENSIVE_CALL_THROTTLE_FOR_TESTS);
        h.engine.node(id).unwrap().set_current_time(100.0).unwrap();
        let max = h.engine.ctx.max_seek_time(3.0);
        assert!((h.engine.node_ref(id).unwrap().current_time() - max).abs() < 1e-9);
        h.settle();
        let events = h.node_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, NodeEvent::Seeking { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, NodeEvent::SeekComplete { .. })));
        let node = h.engine.node_ref(id).unwrap();
        let first = node.queued_chunks().next().unwrap();
        assert!((first.start_time - max).abs() < 1e-3);
    }

    const EXPENSIVE_CALL_THROTTLE_FOR_TESTS: Duration = Duration::from_millis(120);

    #[test]
    fn test_rapid_seeks_are_coalesced() {
        let (mut h, id) = loaded(5);
        std::thread::sleep(EXPENSIVE_CALL_THROTTLE_FOR_TESTS);
        h.engine.node(id).unwrap().set_current_time(1.0).unwrap();
        h.engine.node(id).unwrap().set_current_time(2.0).unwrap();
        h.engine.node(id).unwrap().set_current_time(3.0).unwrap();
        h.settle();
        std::thread::sleep(EXPENSIVE_CALL_THROTTLE_FOR_TESTS);
        h.settle();
        let node = h.engine.node_ref(id).unwrap();
        let first = node.queued_chunks().next().unwrap();
        assert!((first.start_time - 3.0).abs() < 1e-3);
    }

    #[test]
    fn test_non_finite_seek_is_rejected() {
        let (mut h, id) = loaded(2);
        let err = h
            .engine
            .node(id)
            .unwrap()
            .set_current_time(f64::NAN)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_negative_and_infinite_seeks() {
        let (mut h, id) = loaded(4);
        std::thread::sleep(EXPENSIVE_CALL_THROTTLE_FOR_TESTS);
        h.engine.node(id).unwrap().set_current_time(-3.0).unwrap();
        assert_eq!(h.engine.node_ref(id).unwrap().current_time(), 0.0);
        h.settle();
        let first = h.engine.node_ref(id).unwrap().queued_chunks().next().unwrap();
        assert!(first.start_time.abs() < 1e-3);

        let err = h
            .engine
            .node(id)
            .unwrap()
            .set_current_time(f64::INFINITY)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(h.engine.node_ref(id).unwrap().current_time(), 0.0);
    }

    #[test]
    fn test_seeks_while_playing_recycle_containers() {
        let (mut h, id) = loaded(20);
        h.engine.node(id).unwrap().play().unwrap();
        h.advance(0.2);
        let before = h.engine.pool_stats();
        for i in 0..6 {
            std::thread::sleep(EXPENSIVE_CALL_THROTTLE_FOR_TESTS);
            h.engine
                .node(id)
                .unwrap()
                .set_current_time(2.0 + f64::from(i))
                .unwrap();
            h.settle();
            h.advance(0.1);
        }
        let after = h.engine.pool_stats();
        let limits = PoolLimits::for_layout(
            h.engine.ctx.channel_count(),
            h.engine.ctx.sustained_buffer_count(),
            h.engine.ctx.visualization_buffer_count(),
        );
        assert!(
            after.containers_allocated <= limits.max_containers,
            "before={before:?} after={after:?}"
        );
        assert!(after.containers_allocated < before.containers_allocated + 6);
        let node = h.engine.node_ref(id).unwrap();
        assert!((node.queued_chunks().next().unwrap().start_time - 7.0).abs() < 1e-3);
    }

    #[test]
    fn test_gapless_replace_continues_without_gap() {
        let (mut h, id) = loaded(1);
        h.engine.node(id).unwrap().play().unwrap();
        h.settle();
        assert!(h.node_events().contains(&NodeEvent::LastBufferQueued));
        let old_units = h.clock.started_units();
        let old_end = old_units
            .iter()
            .map(|u| u.when + u.frames as f64 / 8000.0)
            .fold(0.0, f64::max);

        std::thread::sleep(EXPENSIVE_CALL_THROTTLE_FOR_TESTS);
        h.engine
            .node(id)
            .unwrap()
            .replace(tone(2), 0.0, true, None)
            .unwrap();
        h.settle();
        assert!(h.engine.node_ref(id).unwrap().has_gapless_preload());
        let first_new = &h.clock.started_units()[old_units.len()];
        assert!((first_new.when - old_end).abs() < 1e-9);

        h.advance(1.2);
        let events = h.node_events();
        let ended = events
            .iter()
            .position(|e| {
                *e == NodeEvent::Ended {
                    had_gapless_continuation: true,
                }
            })
            .unwrap();
        assert!(matches!(
            events[ended + 1],
            NodeEvent::ReplacementLoaded { .. }
        ));
        let node = h.engine.node_ref(id).unwrap();
        assert!((node.duration() - 2.0).abs() < 1e-9);
        assert!(!node.has_ended());
        assert!(node.current_time() < 0.5);
    }

    #[test]
    fn test_replace_without_source_loads() {
        let mut h = Harness::new(EngineConfig::default());
        let id = h.engine.create_node().unwrap();
        h.engine
            .node(id)
            .unwrap()
            .replace(tone(4), 1.0, false, None)
            .unwrap();
        h.settle();
        let node = h.engine.node_ref(id).unwrap();
        assert!((node.duration() - 4.0).abs() < 1e-9);
        assert!((node.current_time() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_pause_keeps_position() {
        let (mut h, id) = loaded(5);
        h.engine.node(id).unwrap().play().unwrap();
        h.advance(1.0);
        h.engine.node(id).unwrap().pause();
        let paused_at = h.engine.node_ref(id).unwrap().current_time();
        h.advance(1.0);
        h.engine.node(id).unwrap().play().unwrap();
        h.settle();
        let node = h.engine.node_ref(id).unwrap();
        assert!((node.current_time() - paused_at).abs() < 0.01);
        assert!(paused_at > 0.5);
    }

    #[test]
    fn test_idle_output_is_suspended_and_reset_on_play() {
        let config = EngineConfig {
            idle_suspend_secs: 0.2,
            ..EngineConfig::default()
        };
        let mut h = Harness::new(config);
        let id = h.engine.create_node().unwrap();
        h.engine
            .node(id)
            .unwrap()
            .load(tone(3), 0.0, None)
            .unwrap();
        h.settle();
        std::thread::sleep(Duration::from_millis(300));
        h.engine.poll().unwrap();
        assert_eq!(h.clock.state(), OutputState::Suspended);
        assert!(std::iter::from_fn(|| h.engine.try_recv_event())
            .any(|e| e == EngineEvent::OutputSuspended));

        h.engine.node(id).unwrap().play().unwrap();
        h.settle();
        assert_eq!(h.clock.state(), OutputState::Running);
        assert_eq!(h.clock.reset_count(), 1);
        assert!(h.clock.active_unit_count() > 0);
    }

    #[test]
    fn test_failed_reset_is_retried_once() {
        let (mut h, id) = loaded(3);
        h.clock.fail_resets(1);
        h.clock.close();
        h.engine.node(id).unwrap().play().unwrap();
        h.settle();
        assert_eq!(h.clock.state(), OutputState::Running);
        assert_eq!(h.clock.reset_count(), 1);
    }

    #[test]
    fn test_output_reset_re_anchors_playing_node() {
        let (mut h, id) = loaded(5);
        h.engine.node(id).unwrap().play().unwrap();
        h.advance(0.5);
        let before = h.engine.node_ref(id).unwrap().current_time();
        h.engine.reset_output().unwrap();
        h.settle();
        assert!(h.clock.active_unit_count() > 0);
        h.advance(0.2);
        let after = h.engine.node_ref(id).unwrap().current_time();
        assert!(after >= before - 0.05);
    }

    #[test]
    fn test_format_change_reconfigures_and_reseeks() {
        let (mut h, id) = loaded(5);
        h.engine.node(id).unwrap().play().unwrap();
        h.advance(0.5);
        h.clock.set_format_on_reset(16000, 2);
        h.engine.reset_output().unwrap();
        h.settle();
        assert_eq!(h.engine.sample_rate(), 16000);
        let node = h.engine.node_ref(id).unwrap();
        assert!(node.queued_chunks().count() > 0);
        assert!(h.clock.active_unit_count() > 0);
        assert_eq!(
            h.engine.pool_stats().containers_allocated,
            node.queued_chunks().count()
        );
    }

    #[test]
    fn test_explicit_reconfigure_rebuilds_queue() {
        let (mut h, id) = loaded(5);
        h.engine.node(id).unwrap().play().unwrap();
        h.advance(0.5);
        let before = h.engine.node_ref(id).unwrap().current_time();
        h.engine.reconfigure_output().unwrap();
        assert!(!h.clock.stopped_units().is_empty());
        h.settle();
        assert_eq!(h.clock.reset_count(), 1);
        let node = h.engine.node_ref(id).unwrap();
        assert!(node.queued_chunks().count() > 0);
        assert!(h.clock.active_unit_count() > 0);
        assert!(node.current_time() >= before - 0.05);
    }

    #[test]
    fn test_destroyed_node_is_removed() {
        let (mut h, id) = loaded(2);
        h.engine.node(id).unwrap().destroy().unwrap();
        h.settle();
        assert!(h.engine.node(id).is_none());
        assert!(h.engine.node_ids().is_empty());
        assert_eq!(h.decode.source_count(), 0);
    }

    #[test]
    fn test_hardware_latency_is_clamped() {
        let mut h = Harness::new(EngineConfig::default());
        h.engine.set_hardware_latency(10.0);
        assert!((h.engine.hardware_latency() - h.engine.max_latency()).abs() < 1e-12);
        h.engine.set_hardware_latency(f64::INFINITY);
        assert!((h.engine.hardware_latency() - h.engine.max_latency()).abs() < 1e-12);
        h.engine.set_hardware_latency(-1.0);
        assert_eq!(h.engine.hardware_latency(), 0.0);
    }

    #[test]
    fn test_upcoming_samples() {
        let (mut h, id) = loaded(3);
        let mut out = vec![1.0; 1024];
        assert!(h.engine.node(id).unwrap().upcoming_samples(&mut out));
        assert!(out.iter().all(|s| *s == 0.0));

        h.engine.node(id).unwrap().play().unwrap();
        h.advance(0.5);
        assert!(h.engine.node(id).unwrap().upcoming_samples(&mut out));
        assert!(out.iter().any(|s| s.abs() > 0.01));

        let mut too_long = vec![0.0; 70_000];
        assert!(!h.engine.node(id).unwrap().upcoming_samples(&mut too_long));
    }

    /// Engine driven by a hand-written decode side.
    fn scripted() -> (PlaybackEngine, DecodePeer, VirtualClockHandle) {
        let (output, clock) = VirtualOutput::new(8000, 2);
        let (link, peer) = DecodeLink::pair();
        let engine = PlaybackEngine::new(Box::new(output), link, EngineConfig::default()).unwrap();
        (engine, peer, clock)
    }

    fn drain(peer: &DecodePeer) -> Vec<Envelope<Request>> {
        std::iter::from_fn(|| peer.try_recv().unwrap()).collect()
    }

    #[test]
    fn test_stale_chunk_is_discarded_and_memory_recycled() {
        let (mut engine, peer, _clock) = scripted();
        let id = engine.create_node().unwrap();
        engine
            .node(id)
            .unwrap()
            .load(tone(3), 0.0, None)
            .unwrap();
        let load_stamp = drain(&peer)
            .into_iter()
            .find_map(|e| match e.message {
                Request::LoadSource { stamp, .. } => Some(stamp),
                _ => None,
            })
            .unwrap();
        peer.send(
            id,
            Response::SourceLoaded {
                stamp: load_stamp,
                metadata: segue_core::TrackMetadata {
                    duration: 3.0,
                    established_gain: None,
                },
            },
            Vec::new(),
        );
        engine.poll().unwrap();
        // Loading seeks, which supersedes the load's stamp.
        assert!(engine.node_ref(id).unwrap().stamp() != load_stamp);

        let free_before = engine.pool_stats().memory_free;
        let memory = vec![
            crate::pool::SampleMemory::new(3200),
            crate::pool::SampleMemory::new(3200),
        ];
        peer.send(
            id,
            Response::BufferFilled {
                stamp: load_stamp,
                descriptor: segue_core::BufferDescriptor {
                    length: 3200,
                    start_time: 0.0,
                    end_time: 0.4,
                    loudness_info: segue_core::LoudnessInfo::unknown(),
                    sample_rate: 8000,
                    channel_count: 2,
                    decoding_latency_ms: 0.0,
                    is_background_buffer: false,
                    is_last_buffer: false,
                },
                fill_type: crate::message::FillType::Normal,
            },
            memory,
        );
        engine.poll().unwrap();
        let node = engine.node_ref(id).unwrap();
        assert_eq!(node.queued_chunks().count(), 0);
        assert_eq!(engine.pool_stats().memory_free, free_before + 2);
    }

    #[test]
    fn test_invalid_state_from_worker_is_fatal() {
        let (mut engine, peer, _clock) = scripted();
        let id = engine.create_node().unwrap();
        peer.send(
            id,
            Response::Failed {
                stamp: RequestStamp::default(),
                kind: ErrorKind::InvalidState,
                message: "parallel fill".into(),
            },
            Vec::new(),
        );
        let err = engine.poll().unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_decode_failure_is_reported_to_node() {
        let mut h = Harness::new(EngineConfig::default());
        let id = h.engine.create_node().unwrap();
        h.engine
            .node(id)
            .unwrap()
            .load(AudioSource::memory(Vec::new()), 0.0, None)
            .unwrap();
        h.settle();
        let events = h.node_events();
        assert!(events.iter().any(|e| matches!(
            e,
            NodeEvent::Error {
                kind: ErrorKind::DecodeFailure,
                ..
            }
        )));
        assert!(!h.engine.node_ref(id).unwrap().has_source());
    }

    #[derive(Debug, Clone)]
    enum Step {
        Advance(f64),
        Seek(f64),
        Play,
        Pause,
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            (0.0f64..0.6).prop_map(Step::Advance),
            (-5.0f64..30.0).prop_map(Step::Seek),
            Just(Step::Play),
            Just(Step::Pause),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn test_queue_stays_ordered(steps in prop::collection::vec(step(), 1..8)) {
            let (mut h, id) = loaded(20);
            for step in steps {
                match step {
                    Step::Advance(seconds) => h.advance(seconds),
                    Step::Seek(time) => h.engine.node(id).unwrap().set_current_time(time).unwrap(),
                    Step::Play => h.engine.node(id).unwrap().play().unwrap(),
                    Step::Pause => h.engine.node(id).unwrap().pause(),
                }
                h.settle();
                let node = h.engine.node_ref(id).unwrap();
                let starts: Vec<f64> = node.queued_chunks().filter_map(|c| c.started).collect();
                prop_assert!(starts.windows(2).all(|w| w[0] <= w[1] + 1e-9), "{starts:?}");
                for chunk in node.queued_chunks().chain(node.history_chunks()) {
                    prop_assert!(chunk.played_so_far <= chunk.duration + 1e-9);
                }
            }
        }

        #[test]
        fn test_seek_is_clamped_to_playable_range(time in -50.0f64..50.0) {
            let (mut h, id) = loaded(5);
            h.engine.node(id).unwrap().set_current_time(time).unwrap();
            let max = h.engine.ctx.max_seek_time(5.0);
            let current = h.engine.node_ref(id).unwrap().current_time();
            prop_assert!((current - time.clamp(0.0, max)).abs() < 1e-9);
        }

        #[test]
        fn test_schedule_ahead_never_shrinks(samples in prop::collection::vec(0.0f64..200.0, 1..20)) {
            let (mut engine, _peer, _clock) = scripted();
            let mut previous = engine.schedule_ahead();
            for ms in samples {
                engine.record_scheduling_time(ms);
                let current = engine.schedule_ahead();
                prop_assert!(current >= previous);
                prop_assert!(current * 0.75 * 1000.0 >= ms - 1e-9);
                previous = current;
            }
        }
    }
}
