//! Audio output using cpal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    Device, SampleFormat, Stream, StreamConfig,
};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use segue_core::{Error, Result};
use tracing::{debug, error, info, warn};

use super::{OutputDevice, OutputState, PlaybackUnit, UnitId, UnitMixer};

struct OpenStream {
    stream: Stream,
    sample_rate: u32,
    channels: u16,
    device_name: String,
}

/// Default output device driven by a cpal stream.
///
/// The stream callback renders the shared [`UnitMixer`]; the frame counter it
/// advances is the clock. `cpal::Stream` is not `Send`, so this type lives on
/// the thread that created it.
pub struct CpalOutput {
    stream: Option<OpenStream>,
    mixer: Arc<Mutex<UnitMixer>>,
    failed: Arc<AtomicBool>,
    finished_tx: Sender<UnitId>,
    finished_rx: Receiver<UnitId>,
    state: OutputState,
    volume: f32,
}

impl CpalOutput {
    /// Open the default output device.
    pub fn new(volume: f32) -> Result<Self> {
        let (finished_tx, finished_rx) = unbounded();
        let mut output = Self {
            stream: None,
            mixer: Arc::new(Mutex::new(UnitMixer::new(48000, 2))),
            failed: Arc::new(AtomicBool::new(false)),
            finished_tx,
            finished_rx,
            state: OutputState::Closed,
            volume,
        };
        output.open()?;
        Ok(output)
    }

    fn open(&mut self) -> Result<()> {
        self.stream = None;
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| Error::AudioOutput("No output device found".to_string()))?;

        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        info!("Using audio output device: {device_name}");

        // Get supported config
        let supported_config = device
            .default_output_config()
            .map_err(|e| Error::AudioOutput(format!("Failed to get output config: {e}")))?;

        debug!("Supported output config: {:?}", supported_config);

        let sample_format = supported_config.sample_format();
        let config: StreamConfig = supported_config.into();
        let sample_rate = config.sample_rate.0;
        let channels = config.channels;

        {
            let mut mixer = self.mixer.lock();
            mixer.clear(sample_rate, channels);
            mixer.set_volume(self.volume);
        }
        self.failed.store(false, Ordering::Release);

        let stream = match sample_format {
            SampleFormat::F32 => self.build_stream::<f32>(&device, &config)?,
            SampleFormat::I16 => self.build_stream::<i16>(&device, &config)?,
            SampleFormat::U16 => self.build_stream::<u16>(&device, &config)?,
            _ => {
                return Err(Error::AudioOutput(format!(
                    "Unsupported sample format: {sample_format:?}"
                )));
            }
        };

        stream
            .play()
            .map_err(|e| Error::AudioOutput(format!("Failed to start stream: {e}")))?;

        debug!("Output config: {sample_rate}Hz, {channels} channels");
        self.stream = Some(OpenStream {
            stream,
            sample_rate,
            channels,
            device_name,
        });
        self.state = OutputState::Running;
        Ok(())
    }

    fn build_stream<T: cpal::SizedSample + cpal::FromSample<f32>>(
        &self,
        device: &Device,
        config: &StreamConfig,
    ) -> Result<Stream> {
        let mixer = Arc::clone(&self.mixer);
        let finished_tx = self.finished_tx.clone();
        let failed = Arc::clone(&self.failed);
        let mut scratch: Vec<f32> = Vec::new();

        let err_fn = move |err| {
            error!("Audio stream error: {err}");
            failed.store(true, Ordering::Release);
        };

        device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    scratch.resize(data.len(), 0.0);
                    let finished = {
                        let mut mixer = mixer.lock();
                        mixer.render(&mut scratch);
                        mixer.take_finished()
                    };
                    for (sample, value) in data.iter_mut().zip(&scratch) {
                        *sample = T::from_sample(*value);
                    }
                    for id in finished {
                        let _ = finished_tx.send(id);
                    }
                },
                err_fn,
                None,
            )
            .map_err(|e| Error::AudioOutput(format!("Failed to build stream: {e}")))
    }
}

impl OutputDevice for CpalOutput {
    fn current_time(&self) -> f64 {
        self.mixer.lock().current_time()
    }

    fn sample_rate(&self) -> u32 {
        self.stream.as_ref().map_or(48000, |s| s.sample_rate)
    }

    fn channel_count(&self) -> u16 {
        self.stream.as_ref().map_or(2, |s| s.channels)
    }

    fn state(&self) -> OutputState {
        if self.stream.is_none() || self.failed.load(Ordering::Acquire) {
            OutputState::Closed
        } else {
            self.state
        }
    }

    fn device_name(&self) -> String {
        self.stream
            .as_ref()
            .map_or_else(|| "none".to_string(), |s| s.device_name.clone())
    }

    fn suspend(&mut self) -> Result<()> {
        if self.state != OutputState::Running {
            return Ok(());
        }
        if let Some(open) = &self.stream {
            open.stream
                .pause()
                .map_err(|e| Error::AudioOutput(format!("Failed to pause stream: {e}")))?;
        }
        self.state = OutputState::Suspended;
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        if self.state() == OutputState::Closed {
            return Err(Error::AudioOutput("Output device is closed".to_string()));
        }
        if self.state == OutputState::Running {
            return Ok(());
        }
        if let Some(open) = &self.stream {
            open.stream
                .play()
                .map_err(|e| Error::AudioOutput(format!("Failed to resume stream: {e}")))?;
        }
        self.state = OutputState::Running;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        warn!("Resetting audio output");
        while self.finished_rx.try_recv().is_ok() {}
        self.open()
    }

    fn start_unit(&mut self, unit: PlaybackUnit) -> Result<()> {
        if self.stream.is_none() {
            return Err(Error::AudioOutput("Output device is closed".to_string()));
        }
        self.mixer.lock().add(unit);
        Ok(())
    }

    fn stop_unit(&mut self, id: UnitId, when: f64) {
        self.mixer.lock().stop(id, when);
    }

    fn set_unit_gain(&mut self, id: UnitId, gain: f32) {
        self.mixer.lock().set_gain(id, gain);
    }

    fn take_finished(&mut self) -> Vec<UnitId> {
        self.finished_rx.try_iter().collect()
    }

    fn set_volume(&mut self, volume: f32) {
        self.volume = volume;
        self.mixer.lock().set_volume(volume);
    }
}

/// List available output devices.
pub fn list_output_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();

    let devices: Vec<String> = host
        .output_devices()
        .map_err(|e| Error::AudioOutput(format!("Failed to list devices: {e}")))?
        .filter_map(|d| d.name().ok())
        .collect();

    Ok(devices)
}

/// Get the default output device name.
pub fn default_device_name() -> Option<String> {
    let host = cpal::default_host();
    host.default_output_device().and_then(|d| d.name().ok())
}
