//! Microphone audio capture using cpal.
//!
//! Captures audio at the device's native sample rate, downmixes to mono,
//! resamples to the configured input rate, and re-chunks the stream into
//! fixed-size [`AudioFrame`]s for the session channel.

use crate::config::AudioConfig;
use crate::error::{Result, SessionError};
use async_trait::async_trait;
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::thread::JoinHandle;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// A fixed-length block of mono PCM samples in `[-1, 1]`.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Channel count of `samples` (always 1 after capture downmix).
    pub channels: u16,
    /// When the last sample of this frame was captured.
    pub captured_at: Instant,
}

/// Re-chunks an arbitrary-length sample stream into fixed-size frames.
#[derive(Debug)]
pub struct FrameAssembler {
    frame_samples: usize,
    sample_rate: u32,
    pending: Vec<f32>,
}

impl FrameAssembler {
    pub fn new(frame_samples: usize, sample_rate: u32) -> Self {
        let frame_samples = frame_samples.max(1);
        Self {
            frame_samples,
            sample_rate,
            pending: Vec::with_capacity(frame_samples * 2),
        }
    }

    /// Append samples, returning every frame that became complete.
    pub fn push(&mut self, samples: &[f32]) -> Vec<AudioFrame> {
        self.pending.extend_from_slice(samples);
        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_samples {
            let rest = self.pending.split_off(self.frame_samples);
            let samples = std::mem::replace(&mut self.pending, rest);
            frames.push(AudioFrame {
                samples,
                sample_rate: self.sample_rate,
                channels: 1,
                captured_at: Instant::now(),
            });
        }
        frames
    }

    /// Samples buffered towards the next frame.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Keeps a capture pipeline alive; stopping it releases the device.
///
/// Dropping the handle also stops capture, so a torn-down session never
/// leaves a live microphone stream behind.
pub struct CaptureHandle {
    stop_tx: Option<crossbeam_channel::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    /// Wrap a stop signal and the (optional) thread holding the device.
    pub fn new(stop_tx: crossbeam_channel::Sender<()>, worker: Option<JoinHandle<()>>) -> Self {
        Self {
            stop_tx: Some(stop_tx),
            worker,
        }
    }

    /// Stop capture and wait for the device thread to release the stream.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.try_send(());
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("capture thread panicked during shutdown");
            }
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Source of microphone frames.
#[async_trait]
pub trait MicrophoneSource: Send + Sync {
    /// Acquire the microphone and start delivering frames to `frames`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Device`] if the microphone is unavailable.
    async fn open(&self, frames: mpsc::Sender<AudioFrame>) -> Result<CaptureHandle>;
}

/// Audio capture from the system microphone via cpal.
pub struct CpalMicrophone {
    config: AudioConfig,
}

impl CpalMicrophone {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// List available input devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_input_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| SessionError::Device(format!("cannot enumerate devices: {e}")))?;

        let mut names = Vec::new();
        for device in devices {
            if let Ok(desc) = device.description() {
                names.push(desc.name().to_owned());
            }
        }
        Ok(names)
    }
}

#[async_trait]
impl MicrophoneSource for CpalMicrophone {
    async fn open(&self, frames: mpsc::Sender<AudioFrame>) -> Result<CaptureHandle> {
        let config = self.config.clone();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);

        // cpal streams are !Send; the stream lives and dies on this thread.
        let worker = std::thread::Builder::new()
            .name("civic-voice-capture".into())
            .spawn(move || {
                let stream = match build_input_stream(&config, frames) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(SessionError::Device(format!(
                        "failed to start input stream: {e}"
                    ))));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Hold the stream until stop is signalled or the handle is dropped.
                let _ = stop_rx.recv();
                drop(stream);
                info!("audio capture stopped");
            })
            .map_err(|e| SessionError::Device(format!("cannot spawn capture thread: {e}")))?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(CaptureHandle::new(stop_tx, Some(worker))),
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(e)
            }
            Err(_) => {
                let _ = worker.join();
                Err(SessionError::Device(
                    "capture thread exited before reporting".into(),
                ))
            }
        }
    }
}

fn build_input_stream(config: &AudioConfig, tx: mpsc::Sender<AudioFrame>) -> Result<cpal::Stream> {
    let host = cpal::default_host();

    let device = if let Some(ref name) = config.input_device {
        host.input_devices()
            .map_err(|e| SessionError::Device(format!("cannot enumerate devices: {e}")))?
            .find(|d| {
                d.description()
                    .ok()
                    .map(|desc| desc.name() == name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| SessionError::Device(format!("input device '{name}' not found")))?
    } else {
        host.default_input_device()
            .ok_or_else(|| SessionError::Device("no default input device".into()))?
    };

    let device_name = device
        .description()
        .map(|d| d.name().to_owned())
        .unwrap_or_else(|_| "<unknown>".into());
    info!("using input device: {device_name}");

    let default_config = device
        .default_input_config()
        .map_err(|e| SessionError::Device(format!("no default input config: {e}")))?;

    let native_rate = default_config.sample_rate();
    let native_channels = default_config.channels();
    let target_rate = config.input_sample_rate;

    let stream_config = StreamConfig {
        channels: native_channels,
        sample_rate: native_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    info!(
        "native input config: {}Hz, {} channels -> {}Hz mono frames of {} samples",
        native_rate, native_channels, target_rate, config.frame_samples
    );

    let mut assembler = FrameAssembler::new(config.frame_samples, target_rate);

    device
        .build_input_stream(
            &stream_config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                let mono = super::to_mono(data, native_channels);
                let samples = super::resample(&mono, native_rate, target_rate);
                for frame in assembler.push(&samples) {
                    // Never block the audio thread; stale audio has no value.
                    if tx.try_send(frame).is_err() {
                        debug!("frame channel full, dropping frame");
                    }
                }
            },
            move |err| {
                error!("audio input stream error: {err}");
            },
            None,
        )
        .map_err(|e| SessionError::Device(format!("failed to build input stream: {e}")))
}
