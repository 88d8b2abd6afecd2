//! Audio playback to system speakers via cpal.
//!
//! [`CpalOutput`] keeps one output stream running for the lifetime of the
//! process and mixes scheduled buffers by absolute output-sample position.
//! Its clock is the number of samples played divided by the sample rate.
//! Sessions come and go over one output, so an ending session cancels
//! whatever it still has queued.

use crate::audio::codec::DecodedBuffer;
use crate::audio::scheduler::BufferHandle;
use crate::config::AudioConfig;
use crate::error::{Result, SessionError};
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Notifies the owning session that one buffer finished playing.
#[derive(Debug)]
pub struct PlaybackCompletion {
    handle: BufferHandle,
    tx: mpsc::UnboundedSender<BufferHandle>,
}

impl PlaybackCompletion {
    pub fn new(handle: BufferHandle, tx: mpsc::UnboundedSender<BufferHandle>) -> Self {
        Self { handle, tx }
    }

    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    /// Report completion. A session that already ended simply never hears it.
    pub fn notify(self) {
        let _ = self.tx.send(self.handle);
    }
}

/// A speaker that can play buffers at absolute positions on its own clock.
pub trait AudioOutput: Send + Sync {
    /// Current output position.
    fn clock(&self) -> Duration;

    /// Play `buffer` starting at `start` and call `done` when it ends.
    fn play_at(&self, start: Duration, buffer: DecodedBuffer, done: PlaybackCompletion);

    /// Drop every queued or playing buffer without reporting completion.
    fn cancel_all(&self);
}

struct Voice {
    start_frame: u64,
    samples: Arc<[f32]>,
    done: Option<PlaybackCompletion>,
}

/// Sample-accurate mixer shared between the session and the audio thread.
struct Mixer {
    sample_rate: u32,
    frames_played: u64,
    voices: VecDeque<Voice>,
}

impl Mixer {
    fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            frames_played: 0,
            voices: VecDeque::new(),
        }
    }

    fn clock(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        let nanos = self.frames_played.saturating_mul(1_000_000_000) / u64::from(self.sample_rate);
        Duration::from_nanos(nanos)
    }

    /// First frame at or after `start`. Inverts [`Mixer::clock`] exactly.
    fn frame_at(&self, start: Duration) -> u64 {
        let frames = (start.as_nanos() * u128::from(self.sample_rate)).div_ceil(1_000_000_000);
        u64::try_from(frames).unwrap_or(u64::MAX)
    }

    /// Queue a voice. It never starts before the last queued voice ends or
    /// before the frame about to be rendered.
    fn schedule(&mut self, start: Duration, samples: Arc<[f32]>, done: PlaybackCompletion) {
        let queue_end = self
            .voices
            .back()
            .map_or(0, |v| v.start_frame + v.samples.len() as u64);
        let start_frame = self
            .frame_at(start)
            .max(queue_end)
            .max(self.frames_played);
        self.voices.push_back(Voice {
            start_frame,
            samples,
            done: Some(done),
        });
    }

    /// Fill `out` with mono samples; voices are disjoint and in start order.
    fn render(&mut self, out: &mut [f32]) {
        for sample in out.iter_mut() {
            let frame = self.frames_played;
            *sample = 0.0;
            while let Some(voice) = self.voices.front_mut() {
                let end = voice.start_frame + voice.samples.len() as u64;
                if frame >= end {
                    if let Some(done) = voice.done.take() {
                        done.notify();
                    }
                    self.voices.pop_front();
                    continue;
                }
                if frame >= voice.start_frame {
                    *sample = voice.samples[(frame - voice.start_frame) as usize];
                }
                break;
            }
            self.frames_played += 1;
        }
    }

    fn cancel_all(&mut self) -> usize {
        let dropped = self.voices.len();
        self.voices.clear();
        dropped
    }
}

/// Continuous speaker output via cpal.
pub struct CpalOutput {
    mixer: Arc<Mutex<Mixer>>,
    sample_rate: u32,
    stop_tx: crossbeam_channel::Sender<()>,
    worker: Option<JoinHandle<()>>,
}

impl CpalOutput {
    /// Open the output device and start the (initially silent) stream.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Device`] if no output device is available or
    /// the stream cannot be started.
    pub fn open(config: &AudioConfig) -> Result<Self> {
        let sample_rate = config.output_sample_rate;
        let mixer = Arc::new(Mutex::new(Mixer::new(sample_rate)));
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<()>>(1);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);

        let thread_mixer = Arc::clone(&mixer);
        let thread_config = config.clone();
        let worker = std::thread::Builder::new()
            .name("civic-voice-playback".into())
            .spawn(move || {
                let stream = match build_output_stream(&thread_config, thread_mixer) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(SessionError::Device(format!(
                        "failed to start output stream: {e}"
                    ))));
                    return;
                }
                let _ = ready_tx.send(Ok(()));
                let _ = stop_rx.recv();
                drop(stream);
                info!("audio playback stopped");
            })
            .map_err(|e| SessionError::Device(format!("cannot spawn playback thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                mixer,
                sample_rate,
                stop_tx,
                worker: Some(worker),
            }),
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(e)
            }
            Err(_) => {
                let _ = worker.join();
                Err(SessionError::Device(
                    "playback thread exited before reporting".into(),
                ))
            }
        }
    }

    /// List available output devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_output_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
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

impl CpalOutput {
    fn mixer(&self) -> MutexGuard<'_, Mixer> {
        match self.mixer.lock() {
            Ok(m) => m,
            Err(p) => p.into_inner(),
        }
    }
}

impl AudioOutput for CpalOutput {
    fn clock(&self) -> Duration {
        self.mixer().clock()
    }

    fn play_at(&self, start: Duration, buffer: DecodedBuffer, done: PlaybackCompletion) {
        let samples: Arc<[f32]> = if buffer.sample_rate == self.sample_rate {
            buffer.samples
        } else {
            super::resample(&buffer.samples, buffer.sample_rate, self.sample_rate).into()
        };
        self.mixer().schedule(start, samples, done);
    }

    fn cancel_all(&self) {
        let dropped = self.mixer().cancel_all();
        if dropped > 0 {
            debug!(dropped, "cancelled queued playback");
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        let _ = self.stop_tx.try_send(());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("playback thread panicked during shutdown");
            }
        }
    }
}

fn build_output_stream(config: &AudioConfig, mixer: Arc<Mutex<Mixer>>) -> Result<cpal::Stream> {
    let host = cpal::default_host();

    let device = if let Some(ref name) = config.output_device {
        host.output_devices()
            .map_err(|e| SessionError::Device(format!("cannot enumerate devices: {e}")))?
            .find(|d| {
                d.description()
                    .ok()
                    .map(|desc| desc.name() == name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| SessionError::Device(format!("output device '{name}' not found")))?
    } else {
        host.default_output_device()
            .ok_or_else(|| SessionError::Device("no default output device".into()))?
    };

    let device_name = device
        .description()
        .map(|d| d.name().to_owned())
        .unwrap_or_else(|_| "<unknown>".into());
    info!("using output device: {device_name}");

    let stream_config = StreamConfig {
        channels: 1,
        sample_rate: config.output_sample_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                let mut mixer = match mixer.lock() {
                    Ok(m) => m,
                    Err(_) => {
                        data.fill(0.0);
                        return;
                    }
                };
                mixer.render(data);
            },
            move |err| {
                error!("audio output stream error: {err}");
            },
            None,
        )
        .map_err(|e| SessionError::Device(format!("failed to build output stream: {e}")))
}
