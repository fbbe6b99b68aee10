//! Threaded front end: a [`PlaybackEngine`] and its decode worker running
//! behind a command channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::{Mutex, RwLock};
use segue_core::{EffectSpec, EngineConfig, Error, Result, TrackInfo};
use tracing::{debug, error, info, warn};

use crate::codec::{CodecFactory, DefaultCodecFactory};
use crate::engine::{PlaybackEngine, SourceNodeHandle};
use crate::events::{EngineEvent, NodeEvent};
use crate::message::{DecodeLink, NodeId};
use crate::metadata::{MemoryMetadataStore, MetadataStore};
use crate::output::{CpalOutput, OutputDevice};
use crate::source::AudioSource;
use crate::worker::DecodeWorker;

/// Longest the render thread waits on the decode side before checking commands.
const COMMAND_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long callers wait for a reply from the render thread.
const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// Commands to control the render thread.
#[derive(Debug)]
pub enum PlayerCommand {
    CreateNode(Sender<Result<NodeId>>),
    Load {
        node: NodeId,
        source: AudioSource,
        start_fraction: f64,
        track: Option<TrackInfo>,
    },
    Replace {
        node: NodeId,
        source: AudioSource,
        seek_time: f64,
        gapless_preload: bool,
        track: Option<TrackInfo>,
    },
    Seek { node: NodeId, time: f64 },
    Play(NodeId),
    Pause(NodeId),
    Unload(NodeId),
    Destroy(NodeId),
    SetVolume(f32),
    SetEffects(Vec<EffectSpec>),
    SetHardwareLatency(f64),
    ResetOutput,
    UpcomingSamples {
        node: NodeId,
        len: usize,
        reply: Sender<Option<Vec<f32>>>,
    },
    Shutdown,
}

/// Last published state of one node.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct NodeStatus {
    pub current_time: f64,
    pub duration: f64,
    pub paused: bool,
    pub seeking: bool,
    pub ended: bool,
    /// The next track is decoded and will follow without a gap.
    pub gapless_preload: bool,
}

type StatusMap = Arc<RwLock<HashMap<NodeId, NodeStatus>>>;

/// Handle of a running player. Dropping it stops both threads.
pub struct AudioPlayer {
    command_tx: Sender<PlayerCommand>,
    event_rx: Receiver<EngineEvent>,
    statuses: StatusMap,
    volume: Arc<Mutex<f32>>,
    thread: Option<JoinHandle<()>>,
}

impl AudioPlayer {
    /// Start a player on the default output device.
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_output(
            config,
            Arc::new(DefaultCodecFactory),
            Arc::new(MemoryMetadataStore::new()),
            |volume| Ok(Box::new(CpalOutput::new(volume)?) as Box<dyn OutputDevice>),
        )
    }

    /// Start a player whose output is built by `make_output` on the render
    /// thread, since device streams cannot cross threads.
    pub fn with_output<F>(
        config: EngineConfig,
        factory: Arc<dyn CodecFactory>,
        metadata: Arc<dyn MetadataStore>,
        make_output: F,
    ) -> Result<Self>
    where
        F: FnOnce(f32) -> Result<Box<dyn OutputDevice>> + Send + 'static,
    {
        let config = config.validated()?;
        let (command_tx, command_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        let (ready_tx, ready_rx) = bounded(1);

        let statuses = StatusMap::default();
        let volume = Arc::new(Mutex::new(config.volume));
        let statuses_clone = Arc::clone(&statuses);

        let thread = std::thread::Builder::new()
            .name("segue-render".to_string())
            .spawn(move || {
                let setup = RenderSetup {
                    config,
                    factory,
                    metadata,
                    commands: command_rx,
                    events: event_tx,
                    statuses: statuses_clone,
                };
                setup.run(make_output, &ready_tx);
            })
            .map_err(|e| Error::AudioOutput(format!("Failed to spawn render thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(Error::Internal("Render thread exited during startup".into()));
            }
        }

        Ok(Self {
            command_tx,
            event_rx,
            statuses,
            volume,
            thread: Some(thread),
        })
    }

    /// Send a command to the render thread.
    pub fn send_command(&self, command: PlayerCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .map_err(|e| Error::AudioOutput(format!("Failed to send command: {e}")))
    }

    fn request<T>(&self, command: PlayerCommand, reply: &Receiver<T>) -> Result<T> {
        self.send_command(command)?;
        reply
            .recv_timeout(REPLY_TIMEOUT)
            .map_err(|e| Error::AudioOutput(format!("Render thread did not reply: {e}")))
    }

    pub fn create_node(&self) -> Result<NodeId> {
        let (tx, rx) = bounded(1);
        self.request(PlayerCommand::CreateNode(tx), &rx)?
    }

    pub fn load(
        &self,
        node: NodeId,
        source: AudioSource,
        start_fraction: f64,
        track: Option<TrackInfo>,
    ) -> Result<()> {
        self.send_command(PlayerCommand::Load {
            node,
            source,
            start_fraction,
            track,
        })
    }

    pub fn replace(
        &self,
        node: NodeId,
        source: AudioSource,
        seek_time: f64,
        gapless_preload: bool,
        track: Option<TrackInfo>,
    ) -> Result<()> {
        self.send_command(PlayerCommand::Replace {
            node,
            source,
            seek_time,
            gapless_preload,
            track,
        })
    }

    pub fn seek(&self, node: NodeId, time: f64) -> Result<()> {
        self.send_command(PlayerCommand::Seek { node, time })
    }

    pub fn play(&self, node: NodeId) -> Result<()> {
        self.send_command(PlayerCommand::Play(node))
    }

    pub fn pause(&self, node: NodeId) -> Result<()> {
        self.send_command(PlayerCommand::Pause(node))
    }

    pub fn unload(&self, node: NodeId) -> Result<()> {
        self.send_command(PlayerCommand::Unload(node))
    }

    pub fn destroy_node(&self, node: NodeId) -> Result<()> {
        self.send_command(PlayerCommand::Destroy(node))
    }

    /// Set the master volume (0.0 to 1.0).
    pub fn set_volume(&self, volume: f32) -> Result<()> {
        let volume = volume.clamp(0.0, 1.0);
        *self.volume.lock() = volume;
        self.send_command(PlayerCommand::SetVolume(volume))
    }

    pub fn volume(&self) -> f32 {
        *self.volume.lock()
    }

    pub fn set_effects(&self, effects: Vec<EffectSpec>) -> Result<()> {
        self.send_command(PlayerCommand::SetEffects(effects))
    }

    pub fn set_hardware_latency(&self, seconds: f64) -> Result<()> {
        self.send_command(PlayerCommand::SetHardwareLatency(seconds))
    }

    pub fn reset_output(&self) -> Result<()> {
        self.send_command(PlayerCommand::ResetOutput)
    }

    /// Interleaved samples about to be heard on `node`, or `None` when
    /// `len` exceeds what the node keeps around.
    pub fn upcoming_samples(&self, node: NodeId, len: usize) -> Result<Option<Vec<f32>>> {
        let (tx, rx) = bounded(1);
        self.request(
            PlayerCommand::UpcomingSamples {
                node,
                len,
                reply: tx,
            },
            &rx,
        )
    }

    /// State of `node` as of the render thread's last pass.
    pub fn status(&self, node: NodeId) -> Option<NodeStatus> {
        self.statuses.read().get(&node).copied()
    }

    pub fn events(&self) -> Receiver<EngineEvent> {
        self.event_rx.clone()
    }

    pub fn try_recv_event(&self) -> Option<EngineEvent> {
        self.event_rx.try_recv().ok()
    }

    /// Receive events, blocking until one is available.
    pub fn recv_event(&self) -> Option<EngineEvent> {
        self.event_rx.recv().ok()
    }

    pub fn recv_event_timeout(&self, timeout: Duration) -> Option<EngineEvent> {
        self.event_rx.recv_timeout(timeout).ok()
    }
}

impl Drop for AudioPlayer {
    fn drop(&mut self) {
        let _ = self.command_tx.send(PlayerCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Render thread panicked");
            }
        }
    }
}

/// Everything the render thread needs before it owns an engine.
struct RenderSetup {
    config: EngineConfig,
    factory: Arc<dyn CodecFactory>,
    metadata: Arc<dyn MetadataStore>,
    commands: Receiver<PlayerCommand>,
    events: Sender<EngineEvent>,
    statuses: StatusMap,
}

impl RenderSetup {
    fn run<F>(self, make_output: F, ready: &Sender<Result<()>>)
    where
        F: FnOnce(f32) -> Result<Box<dyn OutputDevice>>,
    {
        let output = match make_output(self.config.volume) {
            Ok(output) => output,
            Err(e) => {
                error!("Failed to initialize audio output: {e}");
                let _ = ready.send(Err(e));
                return;
            }
        };
        let (link, peer) = DecodeLink::pair();
        let decode = match DecodeWorker::spawn(peer, self.factory, self.metadata) {
            Ok(decode) => decode,
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };
        let engine = match PlaybackEngine::new(output, link, self.config) {
            Ok(engine) => engine,
            Err(e) => {
                let _ = ready.send(Err(e));
                decode.join();
                return;
            }
        };
        let _ = ready.send(Ok(()));

        let render = RenderLoop {
            engine_events: engine.events(),
            engine,
            commands: self.commands,
            events: self.events.clone(),
            statuses: self.statuses,
        };
        if let Err(e) = render.run() {
            error!("Render thread stopped: {e}");
            let _ = self.events.send(EngineEvent::Fatal {
                message: e.to_string(),
            });
        }
        // The engine is gone by now, which closes the decode link.
        decode.join();
        info!("Render thread exited");
    }
}

struct RenderLoop {
    engine: PlaybackEngine,
    engine_events: Receiver<EngineEvent>,
    commands: Receiver<PlayerCommand>,
    events: Sender<EngineEvent>,
    statuses: StatusMap,
}

impl RenderLoop {
    fn run(mut self) -> Result<()> {
        info!("Render thread started on {}", self.engine.device_name());
        loop {
            loop {
                match self.commands.try_recv() {
                    Ok(PlayerCommand::Shutdown) | Err(TryRecvError::Disconnected) => {
                        debug!("Render thread shutting down");
                        self.publish_status();
                        return Ok(());
                    }
                    Ok(command) => self.handle(command)?,
                    Err(TryRecvError::Empty) => break,
                }
            }

            self.engine.poll_timeout(COMMAND_POLL_INTERVAL)?;
            self.forward_events();
            self.publish_status();

            if self.engine.node_ids().is_empty() {
                // Nothing to render; wait for a command instead of spinning.
                match self.commands.recv_timeout(COMMAND_POLL_INTERVAL * 5) {
                    Ok(PlayerCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                        return Ok(());
                    }
                    Ok(command) => self.handle(command)?,
                    Err(RecvTimeoutError::Timeout) => {}
                }
            }
        }
    }

    /// Run one command. Programming errors stop the thread; anything else
    /// is reported as an event.
    fn handle(&mut self, command: PlayerCommand) -> Result<()> {
        let (node, result) = match command {
            PlayerCommand::CreateNode(reply) => {
                match self.engine.create_node() {
                    Err(e) if e.is_fatal() => return Err(e),
                    result => {
                        let _ = reply.send(result);
                    }
                }
                return Ok(());
            }
            PlayerCommand::UpcomingSamples { node, len, reply } => {
                let samples = self.engine.node(node).and_then(|handle| {
                    let mut out = vec![0.0; len];
                    handle.upcoming_samples(&mut out).then_some(out)
                });
                let _ = reply.send(samples);
                return Ok(());
            }
            PlayerCommand::Load {
                node,
                source,
                start_fraction,
                track,
            } => (
                node,
                self.with_node(node, |h| h.load(source, start_fraction, track)),
            ),
            PlayerCommand::Replace {
                node,
                source,
                seek_time,
                gapless_preload,
                track,
            } => (
                node,
                self.with_node(node, |h| h.replace(source, seek_time, gapless_preload, track)),
            ),
            PlayerCommand::Seek { node, time } => {
                (node, self.with_node(node, |h| h.set_current_time(time)))
            }
            PlayerCommand::Play(node) => (node, self.with_node(node, |h| h.play())),
            PlayerCommand::Pause(node) => (
                node,
                self.with_node(node, |h| {
                    h.pause();
                    Ok(())
                }),
            ),
            PlayerCommand::Unload(node) => (node, self.with_node(node, |h| h.unload())),
            PlayerCommand::Destroy(node) => (node, self.engine.destroy_node(node)),
            PlayerCommand::SetVolume(volume) => {
                self.engine.set_volume(volume);
                return Ok(());
            }
            PlayerCommand::SetEffects(effects) => {
                return Self::report_global(self.engine.set_effects(effects));
            }
            PlayerCommand::SetHardwareLatency(seconds) => {
                self.engine.set_hardware_latency(seconds);
                return Ok(());
            }
            PlayerCommand::ResetOutput => {
                return Self::report_global(self.engine.reset_output());
            }
            PlayerCommand::Shutdown => return Ok(()),
        };

        match result {
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!("Command for node {node} failed: {e}");
                let _ = self.events.send(EngineEvent::Node {
                    node,
                    event: NodeEvent::Error {
                        kind: e.kind(),
                        message: e.to_string(),
                    },
                });
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    fn with_node(
        &mut self,
        node: NodeId,
        f: impl FnOnce(&mut SourceNodeHandle<'_>) -> Result<()>,
    ) -> Result<()> {
        match self.engine.node(node) {
            Some(mut handle) => f(&mut handle),
            None => Err(Error::InvalidArgument(format!("Unknown node {node}"))),
        }
    }

    fn report_global(result: Result<()>) -> Result<()> {
        match result {
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!("Engine command failed: {e}");
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    fn forward_events(&self) {
        while let Ok(event) = self.engine_events.try_recv() {
            let _ = self.events.send(event);
        }
    }

    fn publish_status(&self) {
        let statuses = self
            .engine
            .node_ids()
            .into_iter()
            .filter_map(|id| {
                let node = self.engine.node_ref(id)?;
                Some((
                    id,
                    NodeStatus {
                        current_time: node.current_time(),
                        duration: node.duration(),
                        paused: node.is_paused(),
                        seeking: node.is_seeking(),
                        ended: node.has_ended(),
                        gapless_preload: node.has_gapless_preload(),
                    },
                ))
            })
            .collect();
        *self.statuses.write() = statuses;
    }
}
