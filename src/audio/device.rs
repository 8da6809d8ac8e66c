//! Audio device boundary
//!
//! The relay only needs two things from the platform: "call this renderer
//! on every output tick" and "call this capture on every input tick". The
//! [`AudioBackend`] trait is that seam; [`CpalBackend`] is the production
//! implementation.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::{bounded, Sender};
use std::thread::{self, JoinHandle};

use crate::audio::capture::{AudioCapture, BoxedSink};
use crate::audio::playback::OutputRenderer;
use crate::config::AudioConfig;
use crate::error::AudioError;

/// A running device stream. Stopping (or dropping) it guarantees the
/// callback will not run again.
pub trait StreamHandle: Send {
    fn stop(&mut self);
    fn is_running(&self) -> bool;
}

/// Device configuration boundary
pub trait AudioBackend: Send {
    /// Start an output stream in the relay's format, rendering through `renderer`
    fn start_playback(&mut self, renderer: OutputRenderer)
        -> Result<Box<dyn StreamHandle>, AudioError>;

    /// Start an input stream in the capture's format, forwarding through `capture`
    fn start_capture(
        &mut self,
        capture: AudioCapture<BoxedSink>,
    ) -> Result<Box<dyn StreamHandle>, AudioError>;
}

/// Summary of an available device
#[derive(Debug, Clone, serde::Serialize)]
pub struct DeviceInfo {
    pub name: String,
    pub is_input: bool,
    pub is_output: bool,
    pub is_default: bool,
}

/// List all available audio devices
pub fn list_devices() -> Vec<DeviceInfo> {
    let host = cpal::default_host();
    let mut devices: Vec<DeviceInfo> = Vec::new();

    let default_input_name = host.default_input_device().and_then(|d| d.name().ok());
    let default_output_name = host.default_output_device().and_then(|d| d.name().ok());

    if let Ok(inputs) = host.input_devices() {
        for device in inputs {
            if let Ok(name) = device.name() {
                devices.push(DeviceInfo {
                    is_default: default_input_name.as_ref() == Some(&name),
                    name,
                    is_input: true,
                    is_output: false,
                });
            }
        }
    }

    if let Ok(outputs) = host.output_devices() {
        for device in outputs {
            if let Ok(name) = device.name() {
                let is_default = default_output_name.as_ref() == Some(&name);
                if let Some(existing) = devices.iter_mut().find(|d| d.name == name) {
                    existing.is_output = true;
                    existing.is_default |= is_default;
                } else {
                    devices.push(DeviceInfo {
                        name,
                        is_input: false,
                        is_output: true,
                        is_default,
                    });
                }
            }
        }
    }

    devices
}

fn find_device(name: Option<&str>, input: bool) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();

    let Some(name) = name else {
        let default = if input {
            host.default_input_device()
        } else {
            host.default_output_device()
        };
        return default.ok_or_else(|| {
            AudioError::DeviceNotFound(format!(
                "No default {} device",
                if input { "input" } else { "output" }
            ))
        });
    };

    let devices = if input {
        host.input_devices()
    } else {
        host.output_devices()
    }
    .map_err(|e| AudioError::CpalError(e.to_string()))?;

    for device in devices {
        if device.name().map(|n| n == name).unwrap_or(false) {
            return Ok(device);
        }
    }
    Err(AudioError::DeviceNotFound(name.to_string()))
}

/// cpal-backed device layer
pub struct CpalBackend {
    output_device: Option<String>,
    input_device: Option<String>,
    buffer_frames: Option<u32>,
}

impl CpalBackend {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            output_device: config.output_device.clone(),
            input_device: config.input_device.clone(),
            buffer_frames: config.io_buffer_frames,
        }
    }

    fn buffer_size(&self) -> cpal::BufferSize {
        match self.buffer_frames {
            Some(frames) => cpal::BufferSize::Fixed(frames),
            None => cpal::BufferSize::Default,
        }
    }
}

impl AudioBackend for CpalBackend {
    fn start_playback(
        &mut self,
        mut renderer: OutputRenderer,
    ) -> Result<Box<dyn StreamHandle>, AudioError> {
        let device_name = self.output_device.clone();
        let buffer_size = self.buffer_size();
        let sample_rate = renderer.relay().format().sample_rate.round() as u32;

        spawn_stream_thread("relay-playback", move || {
            let device = find_device(device_name.as_deref(), false)?;
            let channels = device.default_output_config()?.channels();
            let config = StreamConfig {
                channels,
                sample_rate: cpal::SampleRate(sample_rate),
                buffer_size,
            };
            tracing::info!(
                device = %device.name().unwrap_or_default(),
                sample_rate,
                channels,
                "Opening output stream"
            );

            let stream = device.build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    renderer.render_interleaved(data, channels as usize);
                },
                |err| tracing::error!("Output stream error: {}", err),
                None,
            )?;
            stream.play()?;
            Ok(stream)
        })
    }

    fn start_capture(
        &mut self,
        mut capture: AudioCapture<BoxedSink>,
    ) -> Result<Box<dyn StreamHandle>, AudioError> {
        let device_name = self.input_device.clone();
        let buffer_size = self.buffer_size();
        let sample_rate = capture.format().sample_rate.round() as u32;

        spawn_stream_thread("relay-capture", move || {
            let device = find_device(device_name.as_deref(), true)?;
            let channels = device.default_input_config()?.channels();
            let config = StreamConfig {
                channels,
                sample_rate: cpal::SampleRate(sample_rate),
                buffer_size,
            };
            tracing::info!(
                device = %device.name().unwrap_or_default(),
                sample_rate,
                channels,
                "Opening input stream"
            );

            let stream = device.build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    capture.capture_interleaved(data, channels as usize);
                },
                |err| tracing::error!("Input stream error: {}", err),
                None,
            )?;
            stream.play()?;
            Ok(stream)
        })
    }
}

/// Handle to a cpal stream living on its own thread
struct CpalStreamHandle {
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl StreamHandle for CpalStreamHandle {
    fn stop(&mut self) {
        // Dropping the sender wakes the stream thread, which drops the stream.
        self.stop_tx.take();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    fn is_running(&self) -> bool {
        self.thread.is_some()
    }
}

impl Drop for CpalStreamHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// cpal streams are not `Send`, so each one is built and kept on a
/// dedicated thread until its handle is stopped. Build errors are reported
/// back before this returns.
fn spawn_stream_thread<F>(name: &str, build: F) -> Result<Box<dyn StreamHandle>, AudioError>
where
    F: FnOnce() -> Result<cpal::Stream, AudioError> + Send + 'static,
{
    let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
    let (stop_tx, stop_rx) = bounded::<()>(1);

    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || match build() {
            Ok(stream) => {
                let _ = ready_tx.send(Ok(()));
                let _ = stop_rx.recv();
                drop(stream);
            }
            Err(e) => {
                let _ = ready_tx.send(Err(e));
            }
        })
        .map_err(|e| AudioError::StreamError(e.to_string()))?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(Box::new(CpalStreamHandle {
            stop_tx: Some(stop_tx),
            thread: Some(handle),
        })),
        Ok(Err(e)) => {
            let _ = handle.join();
            Err(e)
        }
        Err(_) => {
            let _ = handle.join();
            Err(AudioError::StreamError("stream thread exited".into()))
        }
    }
}
