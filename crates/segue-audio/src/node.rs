//! Source node: one logical track slot on the rendering side.
//!
//! A node keeps a queue of decoded chunks scheduled back to back on the
//! output clock, a short history of played chunks for visualization and the
//! request counters that let it discard answers to requests it has since
//! superseded. Chunks of a crossfade tail play on a separate list so they
//! never hold back the end of the track.

use std::collections::VecDeque;
use std::time::Instant;

use segue_core::{BufferDescriptor, Error, ErrorKind, Result, TrackInfo, TrackMetadata};
use tracing::{debug, error, trace, warn};

use crate::buffering::{EXPENSIVE_CALL_THROTTLE, MAX_ANALYSER_SIZE};
use crate::chunk::ScheduledChunk;
use crate::engine::EngineContext;
use crate::events::NodeEvent;
use crate::message::{FillType, NodeId, Request, RequestStamp, Response, GLOBAL_NODE};
use crate::output::UnitId;
use crate::pool::SampleMemory;
use crate::source::AudioSource;

/// Where playback begins once a load completes.
#[derive(Debug, Clone, Copy, PartialEq)]
enum StartPosition {
    /// Share of the track's duration.
    Fraction(f64),
    Seconds(f64),
}

#[derive(Debug, Clone)]
enum DeferredCall {
    Seek(f64),
    Load {
        source: AudioSource,
        start: StartPosition,
        track: Option<TrackInfo>,
    },
    Replace {
        source: AudioSource,
        seek_time: f64,
        gapless_preload: bool,
        track: Option<TrackInfo>,
    },
}

#[derive(Debug)]
struct PendingCall {
    due: Instant,
    call: DeferredCall,
}

/// A replacement whose first chunk is queued behind the current track.
#[derive(Debug, Clone, Copy)]
struct GaplessPreload {
    scheduled_start: f64,
    base_time: f64,
    metadata: TrackMetadata,
}

/// What to announce once the first chunk of a fill is scheduled.
enum AfterSchedule {
    Nothing,
    SeekComplete,
    ReplacementLoaded,
    StorePreload {
        base_time: f64,
        metadata: TrackMetadata,
    },
}

#[derive(Debug)]
pub struct SourceNode {
    id: NodeId,
    stamp: RequestStamp,
    queue: VecDeque<ScheduledChunk>,
    tail: VecDeque<ScheduledChunk>,
    history: VecDeque<ScheduledChunk>,

    current_time: f64,
    /// Track time at which `queue[0]` begins.
    base_time: f64,
    duration: f64,
    base_gain: f32,
    /// `base_gain` came from a loudness estimate rather than the default.
    base_gain_known: bool,

    have_source: bool,
    paused: bool,
    sources_stopped: bool,
    destroyed: bool,
    loading_next: bool,
    awaiting_fill: bool,
    decode_exhausted: bool,
    pending_seek: bool,
    last_chunk_queued: bool,

    initial_playthrough_emitted: bool,
    current_seek_emitted: bool,
    last_buffer_loaded_emitted: bool,
    ended_emitted: bool,

    start_position: StartPosition,
    gapless_preload: Option<GaplessPreload>,
    last_expensive_call: Option<Instant>,
    pending_call: Option<PendingCall>,
    output_generation: u64,
    format_generation: u64,
}

impl SourceNode {
    pub(crate) fn new(id: NodeId, ctx: &mut EngineContext) -> Result<Self> {
        ctx.send(GLOBAL_NODE, Request::Register { node: id })?;
        Ok(Self {
            id,
            stamp: RequestStamp::default(),
            queue: VecDeque::new(),
            tail: VecDeque::new(),
            history: VecDeque::new(),
            current_time: 0.0,
            base_time: 0.0,
            duration: 0.0,
            base_gain: 1.0,
            base_gain_known: false,
            have_source: false,
            paused: true,
            sources_stopped: true,
            destroyed: false,
            loading_next: false,
            awaiting_fill: false,
            decode_exhausted: false,
            pending_seek: false,
            last_chunk_queued: false,
            initial_playthrough_emitted: false,
            current_seek_emitted: false,
            last_buffer_loaded_emitted: false,
            ended_emitted: false,
            start_position: StartPosition::Seconds(0.0),
            gapless_preload: None,
            last_expensive_call: None,
            pending_call: None,
            output_generation: ctx.output_generation(),
            format_generation: ctx.format_generation(),
        })
    }

    pub const fn id(&self) -> NodeId {
        self.id
    }

    pub const fn current_time(&self) -> f64 {
        self.current_time
    }

    pub const fn duration(&self) -> f64 {
        self.duration
    }

    pub const fn base_gain(&self) -> f32 {
        self.base_gain
    }

    pub const fn is_paused(&self) -> bool {
        self.paused
    }

    pub const fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub const fn has_source(&self) -> bool {
        self.have_source
    }

    /// A seek was requested and its first chunk has not arrived yet.
    pub const fn is_seeking(&self) -> bool {
        self.pending_seek
    }

    /// A load or replacement is in flight.
    pub const fn is_replacing(&self) -> bool {
        self.loading_next
    }

    pub const fn has_ended(&self) -> bool {
        self.ended_emitted
    }

    pub const fn has_gapless_preload(&self) -> bool {
        self.gapless_preload.is_some()
    }

    pub const fn stamp(&self) -> RequestStamp {
        self.stamp
    }

    pub fn queued_chunks(&self) -> impl Iterator<Item = &ScheduledChunk> {
        self.queue.iter()
    }

    pub fn tail_chunks(&self) -> impl Iterator<Item = &ScheduledChunk> {
        self.tail.iter()
    }

    pub fn history_chunks(&self) -> impl Iterator<Item = &ScheduledChunk> {
        self.history.iter()
    }

    /// Some unit of this node is scheduled on the output.
    pub fn is_rendering(&self) -> bool {
        !self.sources_stopped || self.tail.iter().any(|chunk| chunk.unit.is_some())
    }

    const fn is_seekable(&self) -> bool {
        !self.destroyed && !self.loading_next && self.gapless_preload.is_none()
    }

    /// Seconds of `queue[0]` heard by clock time `now`.
    fn delta(&self, now: f64) -> f64 {
        let Some(first) = self.queue.front() else {
            return 0.0;
        };
        if self.paused || self.sources_stopped {
            return first.played_so_far;
        }
        match first.started {
            Some(started) if now >= started => {
                (now - started + first.played_so_far).min(first.duration)
            }
            _ => first.played_so_far,
        }
    }

    // Public operations, reached through `SourceNodeHandle`.

    pub(crate) fn load(
        &mut self,
        ctx: &mut EngineContext,
        source: AudioSource,
        fraction: f64,
        track: Option<TrackInfo>,
    ) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }
        if !fraction.is_finite() {
            return Err(Error::InvalidArgument(format!(
                "start fraction must be finite, got {fraction}"
            )));
        }
        self.nullify_pending_requests(ctx)?;
        self.loading_next = true;
        let call = DeferredCall::Load {
            source,
            start: StartPosition::Fraction(fraction.clamp(0.0, 1.0)),
            track,
        };
        match self.throttle(call) {
            Some(call) => self.execute(ctx, call),
            None => Ok(()),
        }
    }

    pub(crate) fn replace(
        &mut self,
        ctx: &mut EngineContext,
        source: AudioSource,
        seek_time: f64,
        gapless_preload: bool,
        track: Option<TrackInfo>,
    ) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }
        if !seek_time.is_finite() {
            return Err(Error::InvalidArgument(format!(
                "seek time must be finite, got {seek_time}"
            )));
        }
        self.loading_next = true;
        let call = DeferredCall::Replace {
            source,
            seek_time: seek_time.max(0.0),
            gapless_preload,
            track,
        };
        match self.throttle(call) {
            Some(call) => self.execute(ctx, call),
            None => Ok(()),
        }
    }

    /// Seek to `time`, coalescing calls closer together than the throttle.
    pub(crate) fn set_current_time(&mut self, ctx: &mut EngineContext, time: f64) -> Result<()> {
        self.seek_to(ctx, time, true)
    }

    pub(crate) fn play(&mut self, ctx: &mut EngineContext) -> Result<()> {
        if self.destroyed || !self.paused {
            return Ok(());
        }
        if self.duration > 0.0 && self.current_time > 0.0 && self.current_time >= self.duration {
            return Ok(());
        }
        self.paused = false;
        if !self.queue.is_empty() && self.sources_stopped && self.have_source {
            ctx.resume();
            if !self.sync_output(ctx)? {
                let when = ctx.now() + ctx.schedule_ahead();
                self.start_sources(ctx, when)?;
            }
        }
        self.time_update(ctx);
        Ok(())
    }

    pub(crate) fn pause(&mut self, ctx: &mut EngineContext) {
        if self.destroyed || self.paused {
            return;
        }
        let now = ctx.now();
        self.stop_sources(ctx, now, false);
        self.stop_tail(ctx, now);
        self.paused = true;
        self.time_update(ctx);
    }

    pub(crate) fn unload(&mut self, ctx: &mut EngineContext) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }
        self.pending_call = None;
        self.reset_state(ctx)
    }

    pub(crate) fn destroy(&mut self, ctx: &mut EngineContext) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }
        self.pending_call = None;
        self.reset_state(ctx)?;
        self.destroyed = true;
        debug!("Node {} destroyed", self.id);
        ctx.send(self.id, Request::Destroy)
    }

    /// Mono mixdown of what the listener hears from now on, compensated for
    /// hardware latency. Returns false when not enough audio is queued.
    pub(crate) fn upcoming_samples(&self, ctx: &EngineContext, out: &mut [f32]) -> bool {
        if out.len() > MAX_ANALYSER_SIZE {
            return false;
        }
        if self.sources_stopped || self.paused {
            out.fill(0.0);
            return true;
        }
        if self.queue.is_empty() {
            return false;
        }

        let sample_rate = f64::from(ctx.sample_rate());
        let heard = self.delta(ctx.now()) - ctx.hardware_latency();
        let mut frame = (heard * sample_rate).round() as i64;
        let mut chunks: Vec<&ScheduledChunk> = Vec::with_capacity(self.queue.len() + 1);
        if let Some(previous) = self.history.back() {
            frame += previous.length as i64;
            chunks.push(previous);
        }
        chunks.extend(self.queue.iter());
        let Ok(mut frame) = usize::try_from(frame) else {
            return false;
        };

        let mut written = 0;
        for chunk in chunks {
            if frame >= chunk.length {
                frame -= chunk.length;
                continue;
            }
            let planes = chunk.channel_data();
            if planes.is_empty() {
                return false;
            }
            let gain = chunk.gain(self.base_gain) / planes.len() as f32;
            let count = (chunk.length - frame).min(out.len() - written);
            for (i, sample) in out[written..written + count].iter_mut().enumerate() {
                let sum: f32 = planes
                    .iter()
                    .map(|plane| plane.as_slice().get(frame + i).copied().unwrap_or(0.0))
                    .sum();
                *sample = sum * gain;
            }
            written += count;
            frame = 0;
            if written == out.len() {
                return true;
            }
        }
        false
    }

    // Throttling of expensive calls.

    fn throttle(&mut self, call: DeferredCall) -> Option<DeferredCall> {
        let now = Instant::now();
        let ready = self
            .last_expensive_call
            .map_or(true, |last| now.duration_since(last) > EXPENSIVE_CALL_THROTTLE);
        self.last_expensive_call = Some(now);
        if ready {
            self.pending_call = None;
            return Some(call);
        }
        let due = self
            .pending_call
            .as_ref()
            .map_or(now + EXPENSIVE_CALL_THROTTLE, |pending| pending.due);
        trace!("Node {} deferring {call:?}", self.id);
        self.pending_call = Some(PendingCall { due, call });
        None
    }

    pub(crate) fn next_deferred_due(&self) -> Option<Instant> {
        self.pending_call.as_ref().map(|pending| pending.due)
    }

    /// Run a coalesced call whose time has come.
    pub(crate) fn run_deferred(&mut self, ctx: &mut EngineContext) -> Result<()> {
        let now = Instant::now();
        if !self.pending_call.as_ref().is_some_and(|p| p.due <= now) {
            return Ok(());
        }
        match self.pending_call.take() {
            Some(pending) => {
                self.last_expensive_call = Some(now);
                self.execute(ctx, pending.call)
            }
            None => Ok(()),
        }
    }

    fn execute(&mut self, ctx: &mut EngineContext, call: DeferredCall) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }
        match call {
            DeferredCall::Seek(time) => self.seek(ctx, time, true),
            DeferredCall::Load {
                source,
                start,
                track,
            } => self.actual_load(ctx, source, start, track),
            DeferredCall::Replace {
                source,
                seek_time,
                gapless_preload,
                track,
            } => self.actual_replace(ctx, source, seek_time, gapless_preload, track),
        }
    }

    // Requests to the decode side.

    fn nullify_pending_requests(&mut self, ctx: &mut EngineContext) -> Result<()> {
        self.stamp.seek += 1;
        self.stamp.replacement += 1;
        self.awaiting_fill = false;
        self.pending_seek = false;
        ctx.send(self.id, Request::CancelAllOperations)
    }

    fn actual_load(
        &mut self,
        ctx: &mut EngineContext,
        source: AudioSource,
        start: StartPosition,
        track: Option<TrackInfo>,
    ) -> Result<()> {
        self.reset_state(ctx)?;
        self.loading_next = true;
        self.start_position = start;
        if let StartPosition::Seconds(seconds) = start {
            self.current_time = seconds;
            self.base_time = seconds;
        }
        self.stamp.replacement += 1;
        debug!("Node {} loading {}", self.id, source.describe());
        ctx.send(
            self.id,
            Request::LoadSource {
                stamp: self.stamp,
                source,
                track,
            },
        )
    }

    fn actual_replace(
        &mut self,
        ctx: &mut EngineContext,
        source: AudioSource,
        seek_time: f64,
        gapless_preload: bool,
        track: Option<TrackInfo>,
    ) -> Result<()> {
        if !self.have_source {
            return self.actual_load(ctx, source, StartPosition::Seconds(seek_time), track);
        }
        let gapless_preload = gapless_preload && !self.ended_emitted;
        self.gapless_preload = None;
        self.ended_emitted = false;
        self.decode_exhausted = false;
        self.stamp.replacement += 1;
        let count = ctx.sustained_buffer_count();
        debug!(
            "Node {} replacing with {} (gapless: {gapless_preload})",
            self.id,
            source.describe()
        );
        ctx.send_with_memory(
            self.id,
            Request::LoadReplacement {
                stamp: self.stamp,
                source,
                track,
                seek_time,
                gapless_preload,
                count,
            },
            count * ctx.channel_count(),
        )?;
        self.awaiting_fill = true;
        Ok(())
    }

    fn seek_to(&mut self, ctx: &mut EngineContext, time: f64, throttled: bool) -> Result<()> {
        if !self.is_seekable() {
            return Ok(());
        }
        if !time.is_finite() {
            return Err(Error::InvalidArgument(format!(
                "seek time must be finite, got {time}"
            )));
        }
        let mut time = time.max(0.0);
        if self.have_source {
            time = time.min(ctx.max_seek_time(self.duration));
        }
        self.current_time = time;
        self.base_time = time - self.delta(ctx.now());
        self.time_update(ctx);
        if !self.have_source {
            return Ok(());
        }
        self.nullify_pending_requests(ctx)?;

        if !throttled {
            return self.seek(ctx, time, false);
        }
        match self.throttle(DeferredCall::Seek(time)) {
            Some(DeferredCall::Seek(time)) => self.seek(ctx, time, true),
            _ => Ok(()),
        }
    }

    fn seek(&mut self, ctx: &mut EngineContext, time: f64, is_user_seek: bool) -> Result<()> {
        if !self.is_seekable() {
            return Ok(());
        }
        self.stamp.seek += 1;
        self.decode_exhausted = false;
        let count = ctx.sustained_buffer_count();
        ctx.send_with_memory(
            self.id,
            Request::Seek {
                stamp: self.stamp,
                time,
                count,
                is_user_seek,
            },
            count * ctx.channel_count(),
        )?;
        self.awaiting_fill = true;
        self.pending_seek = true;
        if is_user_seek && !self.current_seek_emitted {
            self.current_seek_emitted = true;
            ctx.emit(
                self.id,
                NodeEvent::Seeking {
                    from: self.current_time,
                },
            );
        }
        Ok(())
    }

    fn request_more_buffers(&mut self, ctx: &mut EngineContext) -> Result<()> {
        if !self.have_source
            || self.destroyed
            || self.loading_next
            || self.awaiting_fill
            || self.decode_exhausted
            || self.ended_emitted
            || self.pending_call.is_some()
        {
            return Ok(());
        }
        let sustained = ctx.sustained_buffer_count();
        if self.queue.len() >= sustained {
            return Ok(());
        }
        let count = sustained - self.queue.len();
        if count < ctx.min_buffers_to_request() {
            return Ok(());
        }
        ctx.send_with_memory(
            self.id,
            Request::FillBuffers {
                stamp: self.stamp,
                count,
            },
            count * ctx.channel_count(),
        )?;
        self.awaiting_fill = true;
        Ok(())
    }

    // Responses from the decode side.

    pub(crate) fn receive(
        &mut self,
        ctx: &mut EngineContext,
        message: Response,
        transferred: Vec<SampleMemory>,
    ) -> Result<()> {
        match message {
            Response::SourceLoaded { stamp, metadata } => {
                if stamp == self.stamp && !self.destroyed {
                    self.source_loaded(ctx, metadata)?;
                } else {
                    trace!("Node {} ignoring stale load", self.id);
                }
                ctx.pool.free_transfer_list(transferred);
                Ok(())
            }
            Response::BufferFilled {
                stamp,
                descriptor,
                fill_type,
            } => {
                if stamp != self.stamp || self.destroyed {
                    trace!("Node {} ignoring stale chunk", self.id);
                    ctx.pool.free_transfer_list(transferred);
                    return Ok(());
                }
                self.buffer_filled(ctx, &descriptor, fill_type, transferred)
            }
            Response::FillFinished { stamp, ended } => {
                ctx.pool.free_transfer_list(transferred);
                if stamp != self.stamp || self.destroyed {
                    return Ok(());
                }
                self.awaiting_fill = false;
                if ended {
                    self.decode_exhausted = true;
                    if self.queue.is_empty() && self.have_source && !self.loading_next {
                        return self.ended(ctx);
                    }
                    return Ok(());
                }
                self.request_more_buffers(ctx)
            }
            Response::Failed {
                stamp,
                kind,
                message,
            } => {
                ctx.pool.free_transfer_list(transferred);
                if kind == ErrorKind::InvalidState {
                    return Err(Error::InvalidState(message));
                }
                if stamp != self.stamp || self.destroyed {
                    debug!("Node {} ignoring stale failure: {message}", self.id);
                    return Ok(());
                }
                error!("Node {} decode failed: {message}", self.id);
                self.pending_call = None;
                self.reset_state(ctx)?;
                ctx.emit(self.id, NodeEvent::Error { kind, message });
                Ok(())
            }
            Response::Destroyed => {
                ctx.pool.free_transfer_list(transferred);
                Ok(())
            }
        }
    }

    fn source_loaded(&mut self, ctx: &mut EngineContext, metadata: TrackMetadata) -> Result<()> {
        self.loading_next = false;
        self.have_source = true;
        self.duration = metadata.duration;
        self.set_established_gain(metadata.established_gain);
        let start = match self.start_position {
            StartPosition::Fraction(fraction) => fraction * self.duration,
            StartPosition::Seconds(seconds) => seconds,
        };
        self.current_time = start.clamp(0.0, ctx.max_seek_time(self.duration));
        self.base_time = self.current_time;
        debug!(
            "Node {} loaded: {:.3}s, starting at {:.3}s",
            self.id, self.duration, self.current_time
        );
        self.seek(ctx, self.current_time, false)?;
        self.time_update(ctx);
        ctx.emit(self.id, NodeEvent::CanPlay);
        Ok(())
    }

    fn set_established_gain(&mut self, gain: Option<f32>) {
        self.base_gain = gain.unwrap_or(1.0);
        self.base_gain_known = gain.is_some();
    }

    fn apply_seek(&mut self, base_time: f64) {
        self.ended_emitted = false;
        self.last_buffer_loaded_emitted = false;
        self.last_chunk_queued = false;
        self.current_seek_emitted = false;
        self.pending_seek = false;
        self.base_time = base_time;
        self.current_time = base_time;
    }

    fn apply_replacement(&mut self, metadata: TrackMetadata, base_time: f64) {
        self.duration = metadata.duration;
        self.set_established_gain(metadata.established_gain);
        self.initial_playthrough_emitted = false;
        self.apply_seek(base_time);
    }

    fn buffer_filled(
        &mut self,
        ctx: &mut EngineContext,
        descriptor: &BufferDescriptor,
        fill_type: FillType,
        memory: Vec<SampleMemory>,
    ) -> Result<()> {
        if usize::from(descriptor.channel_count) != ctx.channel_count()
            || descriptor.sample_rate != ctx.sample_rate()
        {
            debug!("Node {} dropping chunk of a previous output format", self.id);
            ctx.pool.free_transfer_list(memory);
            return Ok(());
        }

        let mut stop_current = false;
        let after = match fill_type {
            FillType::Normal => AfterSchedule::Nothing,
            FillType::Seek {
                request_id,
                base_time,
                is_user_seek,
            } => {
                if request_id != self.stamp.seek {
                    ctx.pool.free_transfer_list(memory);
                    return Ok(());
                }
                stop_current = true;
                self.apply_seek(base_time);
                // Loads and reseeks after a format change announce their
                // first chunk like a replacement.
                if is_user_seek {
                    AfterSchedule::SeekComplete
                } else {
                    AfterSchedule::ReplacementLoaded
                }
            }
            FillType::Replacement {
                request_id,
                base_time,
                gapless_preload,
                metadata,
            } => {
                if request_id != self.stamp.replacement {
                    ctx.pool.free_transfer_list(memory);
                    return Ok(());
                }
                self.loading_next = false;
                if gapless_preload && !self.queue.is_empty() {
                    AfterSchedule::StorePreload {
                        base_time,
                        metadata,
                    }
                } else {
                    stop_current = true;
                    self.apply_replacement(metadata, base_time);
                    AfterSchedule::ReplacementLoaded
                }
            }
        };

        ctx.resume();
        if self.sync_output(ctx)? {
            ctx.pool.free_transfer_list(memory);
            return Ok(());
        }

        let mut container = ctx.pool.alloc_container()?;
        for (channel, plane) in memory.iter().enumerate().take(container.channel_count()) {
            let valid = descriptor.length.min(plane.frames());
            container.copy_to_channel(&plane.as_slice()[..valid], channel);
        }
        let mut chunk = ScheduledChunk::new(descriptor, container, memory);

        if chunk.is_last_for_track && chunk.end_time < self.duration - ctx.buffer_time() {
            self.duration = chunk.end_time;
            self.time_update(ctx);
            ctx.emit(
                self.id,
                NodeEvent::DurationChange {
                    duration: self.duration,
                },
            );
        }

        if !self.base_gain_known {
            if let Some(gain) = chunk.loudness_gain() {
                self.base_gain = gain;
                self.base_gain_known = true;
                if !stop_current && !self.sources_stopped {
                    self.reschedule_loudness(ctx);
                }
            }
        }

        let scheduling_began = Instant::now();
        let now = ctx.now();
        let scheduled_start;
        if chunk.is_background && self.last_chunk_queued && !stop_current {
            scheduled_start = self.tail_start(now);
            if !self.sources_stopped {
                Self::start_chunk(ctx, self.id, self.base_gain, &mut chunk, scheduled_start);
            }
            self.tail.push_back(chunk);
        } else if stop_current {
            scheduled_start = now + ctx.schedule_ahead();
            self.stop_sources(ctx, scheduled_start, true);
            self.stop_tail(ctx, scheduled_start);
            self.retire_tail(ctx);
            while let Some(old) = self.queue.pop_front() {
                self.push_history(ctx, old);
            }
            self.queue.push_back(chunk);
            self.start_sources(ctx, scheduled_start)?;
        } else if self.sources_stopped {
            scheduled_start = now + ctx.schedule_ahead();
            self.queue.push_back(chunk);
            self.start_sources(ctx, scheduled_start)?;
        } else {
            scheduled_start = self.last_source_ends(now);
            Self::start_chunk(ctx, self.id, self.base_gain, &mut chunk, scheduled_start);
            self.queue.push_back(chunk);
        }

        match after {
            AfterSchedule::Nothing => {}
            AfterSchedule::SeekComplete => {
                ctx.emit(self.id, NodeEvent::SeekComplete { scheduled_start });
            }
            AfterSchedule::ReplacementLoaded => {
                ctx.emit(self.id, NodeEvent::ReplacementLoaded { scheduled_start });
            }
            AfterSchedule::StorePreload {
                base_time,
                metadata,
            } => {
                self.gapless_preload = Some(GaplessPreload {
                    scheduled_start,
                    base_time,
                    metadata,
                });
            }
        }

        ctx.record_scheduling_time(scheduling_began.elapsed().as_secs_f64() * 1000.0);

        if self
            .queue
            .back()
            .is_some_and(|chunk| chunk.is_last_for_track)
        {
            self.last_chunk_queued = true;
            if !self.last_buffer_loaded_emitted {
                self.last_buffer_loaded_emitted = true;
                ctx.emit(self.id, NodeEvent::LastBufferQueued);
            }
        }
        Ok(())
    }

    // Scheduling on the output clock.

    fn start_chunk(
        ctx: &mut EngineContext,
        node: NodeId,
        base_gain: f32,
        chunk: &mut ScheduledChunk,
        when: f64,
    ) -> f64 {
        chunk.started = Some(when);
        chunk.unit = ctx.start_unit(node, chunk, when, chunk.gain(base_gain));
        when + chunk.remaining()
    }

    fn start_sources(&mut self, ctx: &mut EngineContext, when: f64) -> Result<()> {
        if self.paused {
            return Ok(());
        }
        if !self.sources_stopped {
            return Err(Error::InvalidState(format!(
                "node {} started its sources twice",
                self.id
            )));
        }
        self.sources_stopped = false;
        ctx.playback_started();

        let mut when = when;
        for chunk in &mut self.queue {
            when = Self::start_chunk(ctx, self.id, self.base_gain, chunk, when);
        }
        let mut tail_when = self
            .queue
            .iter()
            .rev()
            .find(|chunk| chunk.is_last_for_track)
            .and_then(ScheduledChunk::ends_at)
            .unwrap_or(when);
        for chunk in &mut self.tail {
            tail_when = Self::start_chunk(ctx, self.id, self.base_gain, chunk, tail_when);
        }

        if !self.initial_playthrough_emitted && !self.queue.is_empty() {
            self.initial_playthrough_emitted = true;
            ctx.emit(self.id, NodeEvent::InitialPlaythrough);
        }
        Ok(())
    }

    fn stop_chunk(ctx: &mut EngineContext, chunk: &mut ScheduledChunk, when: f64) {
        let Some(unit) = chunk.unit.take() else {
            return;
        };
        if let Some(started) = chunk.started {
            if when >= started + chunk.remaining() {
                chunk.played_so_far = chunk.duration;
            } else if when >= started {
                chunk.played_so_far += when - started;
            }
        }
        ctx.stop_unit(unit, when);
    }

    /// Stop every queued chunk at `when`. With `destroy_never_played`,
    /// chunks that would not have started by then are dropped.
    fn stop_sources(&mut self, ctx: &mut EngineContext, when: f64, destroy_never_played: bool) {
        ctx.playback_stopped();
        self.sources_stopped = true;
        let mut keep = self.queue.len();
        for (i, chunk) in self.queue.iter_mut().enumerate() {
            if destroy_never_played && chunk.started.map_or(true, |started| started > when) {
                keep = i;
                break;
            }
            Self::stop_chunk(ctx, chunk, when);
        }
        for mut chunk in self.queue.drain(keep..) {
            if let Some(unit) = chunk.unit.take() {
                ctx.stop_unit(unit, when);
            }
            chunk.retire(&mut ctx.pool);
        }
    }

    fn stop_tail(&mut self, ctx: &mut EngineContext, when: f64) {
        for chunk in &mut self.tail {
            Self::stop_chunk(ctx, chunk, when);
        }
    }

    fn retire_tail(&mut self, ctx: &mut EngineContext) {
        for mut chunk in self.tail.drain(..) {
            chunk.retire(&mut ctx.pool);
        }
    }

    fn retire_queue(&mut self, ctx: &mut EngineContext) {
        for mut chunk in self.queue.drain(..) {
            chunk.retire(&mut ctx.pool);
        }
    }

    fn push_history(&mut self, ctx: &mut EngineContext, chunk: ScheduledChunk) {
        self.history.push_back(chunk);
        while self.history.len() > ctx.visualization_buffer_count() {
            if let Some(mut old) = self.history.pop_front() {
                old.retire(&mut ctx.pool);
            }
        }
    }

    fn last_source_ends(&self, now: f64) -> f64 {
        self.queue
            .back()
            .and_then(ScheduledChunk::ends_at)
            .map_or(now, |ends| ends.max(now))
    }

    fn tail_start(&self, now: f64) -> f64 {
        self.tail
            .back()
            .and_then(ScheduledChunk::ends_at)
            .or_else(|| {
                self.queue
                    .iter()
                    .rev()
                    .find(|chunk| chunk.is_last_for_track)
                    .and_then(ScheduledChunk::ends_at)
            })
            .map_or(now, |start| start.max(now))
    }

    fn reschedule_loudness(&self, ctx: &mut EngineContext) {
        for chunk in self.queue.iter().chain(self.tail.iter()) {
            if let (Some(unit), None) = (chunk.unit, chunk.loudness_gain()) {
                ctx.set_unit_gain(unit, self.base_gain);
            }
        }
    }

    /// A unit owned by this node played to its end.
    pub(crate) fn source_ended(&mut self, ctx: &mut EngineContext, unit: UnitId) -> Result<()> {
        if let Some(index) = self.tail.iter().position(|c| c.unit == Some(unit)) {
            if let Some(mut chunk) = self.tail.remove(index) {
                chunk.unit = None;
                chunk.retire(&mut ctx.pool);
            }
            return Ok(());
        }
        let Some(index) = self.queue.iter().position(|c| c.unit == Some(unit)) else {
            trace!("Node {} ignoring unknown unit {unit}", self.id);
            return Ok(());
        };
        if index > 0 {
            warn!("Node {}: chunk {index} finished before the queue head", self.id);
            let now = ctx.now();
            for mut skipped in self.queue.drain(..index) {
                if let Some(unit) = skipped.unit.take() {
                    ctx.stop_unit(unit, now);
                }
                self.base_time += skipped.duration;
                skipped.retire(&mut ctx.pool);
            }
        }
        let Some(mut chunk) = self.queue.pop_front() else {
            return Ok(());
        };
        chunk.unit = None;
        chunk.played_so_far = chunk.duration;
        self.base_time += chunk.duration;
        let last_for_track = chunk.is_last_for_track;
        self.push_history(ctx, chunk);

        let ended = if self.should_end(last_for_track) {
            self.ended(ctx)
        } else {
            Ok(())
        };
        ctx.send(self.id, Request::Ping)?;
        self.request_more_buffers(ctx)?;
        self.time_update(ctx);
        ended
    }

    fn should_end(&self, last_for_track: bool) -> bool {
        self.base_time >= self.duration
            || (last_for_track && (self.queue.is_empty() || self.gapless_preload.is_some()))
            || (self.decode_exhausted && self.queue.is_empty())
    }

    fn ended(&mut self, ctx: &mut EngineContext) -> Result<()> {
        if self.ended_emitted || self.destroyed || self.loading_next {
            return Ok(());
        }
        self.ended_emitted = true;
        self.current_time = self.duration;

        if let Some(preload) = self.gapless_preload.take() {
            debug!("Node {} continuing gaplessly", self.id);
            self.emit_time(ctx, true);
            ctx.emit(
                self.id,
                NodeEvent::Ended {
                    had_gapless_continuation: true,
                },
            );
            self.apply_replacement(preload.metadata, preload.base_time);
            ctx.emit(
                self.id,
                NodeEvent::ReplacementLoaded {
                    scheduled_start: preload.scheduled_start,
                },
            );
            if self.queue.iter().any(|chunk| chunk.is_last_for_track) {
                self.last_chunk_queued = true;
                self.last_buffer_loaded_emitted = true;
                ctx.emit(self.id, NodeEvent::LastBufferQueued);
            }
            return Ok(());
        }

        self.nullify_pending_requests(ctx)?;
        let now = ctx.now();
        self.stop_sources(ctx, now, false);
        self.retire_queue(ctx);
        self.base_time = self.duration;
        self.emit_time(ctx, true);
        ctx.emit(
            self.id,
            NodeEvent::Ended {
                had_gapless_continuation: false,
            },
        );
        Ok(())
    }

    fn emit_time(&self, ctx: &EngineContext, will_end: bool) {
        ctx.emit(
            self.id,
            NodeEvent::TimeUpdate {
                current_time: self.current_time,
                duration: self.duration,
                will_end,
                has_ended: self.ended_emitted,
            },
        );
    }

    pub(crate) fn time_update(&mut self, ctx: &EngineContext) {
        if self.destroyed || self.loading_next {
            return;
        }
        let mut time = self.base_time + self.delta(ctx.now());
        if self.have_source {
            time = time.min(self.duration);
        }
        self.current_time = time.max(0.0);
        self.emit_time(ctx, false);
    }

    fn reset_state(&mut self, ctx: &mut EngineContext) -> Result<()> {
        self.gapless_preload = None;
        self.nullify_pending_requests(ctx)?;
        let now = ctx.now();
        self.stop_sources(ctx, now, false);
        self.stop_tail(ctx, now);
        self.retire_queue(ctx);
        self.retire_tail(ctx);
        for mut chunk in self.history.drain(..) {
            chunk.retire(&mut ctx.pool);
        }
        self.current_time = 0.0;
        self.base_time = 0.0;
        self.duration = 0.0;
        self.set_established_gain(None);
        self.have_source = false;
        self.loading_next = false;
        self.decode_exhausted = false;
        self.last_chunk_queued = false;
        self.initial_playthrough_emitted = false;
        self.current_seek_emitted = false;
        self.last_buffer_loaded_emitted = false;
        self.ended_emitted = false;
        Ok(())
    }

    // Output device changes.

    /// Catch up with output resets. Returns true when the node had to drop
    /// its buffers because the output format changed.
    pub(crate) fn sync_output(&mut self, ctx: &mut EngineContext) -> Result<bool> {
        if self.format_generation != ctx.format_generation() {
            self.format_generation = ctx.format_generation();
            self.output_generation = ctx.output_generation();
            self.reset_audio_buffers(ctx)?;
            return Ok(true);
        }
        if self.output_generation != ctx.output_generation() {
            self.output_generation = ctx.output_generation();
            self.adopt_output(ctx)?;
        }
        Ok(false)
    }

    /// Re-anchor on the restarted clock of a reset output with the same format.
    fn adopt_output(&mut self, ctx: &mut EngineContext) -> Result<()> {
        let cut = ctx.clock_before_reset();
        let was_running = !self.sources_stopped;
        for chunk in self.queue.iter_mut().chain(self.tail.iter_mut()) {
            if chunk.unit.take().is_some() {
                if let Some(started) = chunk.started {
                    if cut >= started {
                        chunk.played_so_far =
                            (chunk.played_so_far + cut - started).min(chunk.duration);
                    }
                }
            }
            chunk.started = None;
        }
        self.sources_stopped = true;
        if was_running && !self.paused {
            let when = ctx.now() + ctx.schedule_ahead();
            self.start_sources(ctx, when)?;
        }
        Ok(())
    }

    /// Drop buffers decoded for a previous output format and decode again
    /// from the current position.
    fn reset_audio_buffers(&mut self, ctx: &mut EngineContext) -> Result<()> {
        for chunk in self.queue.iter_mut().chain(self.tail.iter_mut()) {
            if let Some(unit) = chunk.unit.take() {
                ctx.release_unit(unit);
            }
            chunk.started = None;
        }
        self.sources_stopped = true;
        if self.is_seekable() && self.have_source {
            let time = self.current_time;
            return self.seek_to(ctx, time, false);
        }
        if !self.have_source && !self.loading_next {
            return Ok(());
        }
        warn!("Node {} destroyed by an output format change", self.id);
        self.destroy(ctx)
    }
}
