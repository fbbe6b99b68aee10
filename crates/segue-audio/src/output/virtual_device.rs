//! Manually clocked output device for tests and offline rendering.

use std::sync::Arc;

use parking_lot::Mutex;
use segue_core::{Error, Result};

use super::{OutputDevice, OutputState, PlaybackUnit, UnitId, UnitMixer};

/// Record of a unit start, as seen by the device.
#[derive(Debug, Clone, PartialEq)]
pub struct StartedUnit {
    pub id: UnitId,
    pub when: f64,
    pub offset: f64,
    pub frames: usize,
    pub gain: f32,
}

#[derive(Debug)]
struct Shared {
    mixer: UnitMixer,
    state: OutputState,
    sample_rate: u32,
    channels: u16,
    /// Format adopted by the next reset.
    next_format: Option<(u32, u16)>,
    started: Vec<StartedUnit>,
    stopped: Vec<(UnitId, f64)>,
    resets: usize,
    failing_resets: usize,
}

/// Output whose clock only moves when its [`VirtualClockHandle`] advances it.
pub struct VirtualOutput {
    shared: Arc<Mutex<Shared>>,
}

/// Test-side control of a [`VirtualOutput`].
#[derive(Clone)]
pub struct VirtualClockHandle {
    shared: Arc<Mutex<Shared>>,
}

impl VirtualOutput {
    pub fn new(sample_rate: u32, channels: u16) -> (Self, VirtualClockHandle) {
        let shared = Arc::new(Mutex::new(Shared {
            mixer: UnitMixer::new(sample_rate, channels),
            state: OutputState::Running,
            sample_rate,
            channels,
            next_format: None,
            started: Vec::new(),
            stopped: Vec::new(),
            resets: 0,
            failing_resets: 0,
        }));
        (
            Self {
                shared: Arc::clone(&shared),
            },
            VirtualClockHandle { shared },
        )
    }
}

impl VirtualClockHandle {
    /// Render `seconds` of audio; returns interleaved samples. A suspended or
    /// closed device renders nothing and its clock stands still.
    pub fn advance(&self, seconds: f64) -> Vec<f32> {
        let mut shared = self.shared.lock();
        if shared.state != OutputState::Running {
            return Vec::new();
        }
        let frames = (seconds * f64::from(shared.sample_rate)).round() as usize;
        let mut out = vec![0.0; frames * usize::from(shared.channels)];
        shared.mixer.render(&mut out);
        out
    }

    pub fn current_time(&self) -> f64 {
        self.shared.lock().mixer.current_time()
    }

    pub fn state(&self) -> OutputState {
        self.shared.lock().state
    }

    /// Simulate the device going away.
    pub fn close(&self) {
        self.shared.lock().state = OutputState::Closed;
    }

    /// Change the format the device comes back with after its next reset.
    pub fn set_format_on_reset(&self, sample_rate: u32, channels: u16) {
        self.shared.lock().next_format = Some((sample_rate, channels));
    }

    /// Make the next `count` reset calls fail.
    pub fn fail_resets(&self, count: usize) {
        self.shared.lock().failing_resets = count;
    }

    pub fn started_units(&self) -> Vec<StartedUnit> {
        self.shared.lock().started.clone()
    }

    pub fn stopped_units(&self) -> Vec<(UnitId, f64)> {
        self.shared.lock().stopped.clone()
    }

    pub fn active_unit_count(&self) -> usize {
        self.shared.lock().mixer.unit_count()
    }

    pub fn reset_count(&self) -> usize {
        self.shared.lock().resets
    }
}

impl OutputDevice for VirtualOutput {
    fn current_time(&self) -> f64 {
        self.shared.lock().mixer.current_time()
    }

    fn sample_rate(&self) -> u32 {
        self.shared.lock().sample_rate
    }

    fn channel_count(&self) -> u16 {
        self.shared.lock().channels
    }

    fn state(&self) -> OutputState {
        self.shared.lock().state
    }

    fn device_name(&self) -> String {
        String::from("virtual")
    }

    fn suspend(&mut self) -> Result<()> {
        let mut shared = self.shared.lock();
        if shared.state == OutputState::Running {
            shared.state = OutputState::Suspended;
        }
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        let mut shared = self.shared.lock();
        match shared.state {
            OutputState::Closed => Err(Error::AudioOutput("Output device is closed".into())),
            _ => {
                shared.state = OutputState::Running;
                Ok(())
            }
        }
    }

    fn reset(&mut self) -> Result<()> {
        let mut shared = self.shared.lock();
        if shared.failing_resets > 0 {
            shared.failing_resets -= 1;
            shared.state = OutputState::Closed;
            return Err(Error::AudioOutput("virtual reset failure".into()));
        }
        if let Some((sample_rate, channels)) = shared.next_format.take() {
            shared.sample_rate = sample_rate;
            shared.channels = channels;
        }
        let (sample_rate, channels) = (shared.sample_rate, shared.channels);
        shared.mixer.clear(sample_rate, channels);
        shared.state = OutputState::Running;
        shared.resets += 1;
        Ok(())
    }

    fn start_unit(&mut self, unit: PlaybackUnit) -> Result<()> {
        let mut shared = self.shared.lock();
        if shared.state == OutputState::Closed {
            return Err(Error::AudioOutput("Output device is closed".into()));
        }
        shared.started.push(StartedUnit {
            id: unit.id,
            when: unit.when,
            offset: unit.offset,
            frames: unit.frames,
            gain: unit.gain,
        });
        shared.mixer.add(unit);
        Ok(())
    }

    fn stop_unit(&mut self, id: UnitId, when: f64) {
        let mut shared = self.shared.lock();
        shared.stopped.push((id, when));
        shared.mixer.stop(id, when);
    }

    fn set_unit_gain(&mut self, id: UnitId, gain: f32) {
        self.shared.lock().mixer.set_gain(id, gain);
    }

    fn take_finished(&mut self) -> Vec<UnitId> {
        self.shared.lock().mixer.take_finished()
    }

    fn set_volume(&mut self, volume: f32) {
        self.shared.lock().mixer.set_volume(volume);
    }
}
