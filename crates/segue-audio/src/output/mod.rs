//! Output devices: a hardware clock plus scheduled playback units.
//!
//! A unit plays a span of one [`SampleContainer`] starting at a clock time.
//! Units that play to their natural end are reported through
//! [`OutputDevice::take_finished`]; units stopped early never are.

mod cpal_device;
mod mixer;
mod virtual_device;

use std::sync::Arc;

use segue_core::Result;

use crate::pool::SampleContainer;

pub use cpal_device::{default_device_name, list_output_devices, CpalOutput};
pub use mixer::UnitMixer;
pub use virtual_device::{StartedUnit, VirtualClockHandle, VirtualOutput};

/// Identifies one scheduled playback unit.
pub type UnitId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputState {
    #[default]
    Running,
    Suspended,
    /// The device went away or failed; only a reset brings it back.
    Closed,
}

/// Play `frames` frames of `buffer` from `offset` seconds in, at clock `when`.
#[derive(Debug, Clone)]
pub struct PlaybackUnit {
    pub id: UnitId,
    pub buffer: Arc<SampleContainer>,
    pub frames: usize,
    pub when: f64,
    pub offset: f64,
    pub gain: f32,
}

/// The clocked output the engine schedules against.
pub trait OutputDevice {
    /// Clock time in seconds; only advances while running.
    fn current_time(&self) -> f64;

    fn sample_rate(&self) -> u32;

    fn channel_count(&self) -> u16;

    fn state(&self) -> OutputState;

    fn device_name(&self) -> String {
        String::from("unknown")
    }

    fn suspend(&mut self) -> Result<()>;

    fn resume(&mut self) -> Result<()>;

    /// Reopen the device. The clock restarts, every unit is dropped and the
    /// channel count or sample rate may change.
    fn reset(&mut self) -> Result<()>;

    fn start_unit(&mut self, unit: PlaybackUnit) -> Result<()>;

    /// Silence a unit from clock time `when`; it will not be reported finished.
    fn stop_unit(&mut self, id: UnitId, when: f64);

    fn set_unit_gain(&mut self, id: UnitId, gain: f32);

    /// Units that played to their end since the last call.
    fn take_finished(&mut self) -> Vec<UnitId>;

    fn set_volume(&mut self, volume: f32);
}
