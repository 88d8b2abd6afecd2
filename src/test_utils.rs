//! Shared test doubles for the session core.
//!
//! Scripted transport, microphone and a manually clocked speaker, so the
//! controller can be driven deterministically without devices or network.

use crate::audio::capture::{AudioFrame, CaptureHandle, MicrophoneSource};
use crate::audio::codec::{self, DecodedBuffer, MediaBlob};
use crate::audio::playback::{AudioOutput, PlaybackCompletion};
use crate::audio::scheduler::BufferHandle;
use crate::channel::protocol::FunctionResponse;
use crate::channel::{ChannelEvent, ChannelEventSender, ChannelHandle, SessionSetup, SessionTransport};
use crate::error::{Result, SessionError};
use async_trait::async_trait;
use base64::Engine as _;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}

pub fn handle(raw: u64) -> BufferHandle {
    BufferHandle::from_raw(raw)
}

/// A mono frame of `len` quiet samples at 16kHz.
pub fn test_frame(len: usize) -> AudioFrame {
    AudioFrame {
        samples: vec![0.01; len],
        sample_rate: 16_000,
        channels: 1,
        captured_at: Instant::now(),
    }
}

/// An inbound 24kHz PCM chunk of `samples` samples.
pub fn pcm_chunk(samples: usize) -> MediaBlob {
    MediaBlob {
        mime_type: "audio/pcm;rate=24000".into(),
        data: base64::engine::general_purpose::STANDARD
            .encode(codec::pcm16_from_f32(&vec![0.1; samples])),
    }
}

/// Everything the session sent over mock channels.
#[derive(Debug, Clone, Default)]
pub struct ChannelLog {
    pub audio: Vec<MediaBlob>,
    pub tool_responses: Vec<Vec<FunctionResponse>>,
    pub closed: usize,
}

/// Transport whose opens succeed unless told to fail, recording every
/// channel's event sender for later injection.
#[derive(Default)]
pub struct ScriptedTransport {
    failures: AtomicUsize,
    fatal: AtomicBool,
    attempts: AtomicUsize,
    senders: Mutex<Vec<ChannelEventSender>>,
    log: Arc<Mutex<ChannelLog>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` open attempts.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Make scripted failures permanent (config) rather than connection errors.
    pub fn set_fatal(&self, fatal: bool) {
        self.fatal.store(fatal, Ordering::SeqCst);
    }

    /// Open attempts, successful or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Successful opens.
    pub fn open_count(&self) -> usize {
        lock(&self.senders).len()
    }

    /// Emit on the most recently opened channel.
    pub fn emit(&self, event: ChannelEvent) -> bool {
        let senders = lock(&self.senders);
        senders.last().is_some_and(|s| s.emit(event))
    }

    /// Emit on the `index`-th successfully opened channel.
    pub fn emit_on(&self, index: usize, event: ChannelEvent) -> bool {
        let senders = lock(&self.senders);
        senders.get(index).is_some_and(|s| s.emit(event))
    }

    pub fn log(&self) -> ChannelLog {
        lock(&self.log).clone()
    }
}

#[async_trait]
impl SessionTransport for ScriptedTransport {
    async fn open(
        &self,
        _setup: &SessionSetup,
        events: ChannelEventSender,
    ) -> Result<Box<dyn ChannelHandle>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            if self.fatal.load(Ordering::SeqCst) {
                return Err(SessionError::Config("scripted rejection".into()));
            }
            return Err(SessionError::Connection("scripted failure".into()));
        }
        events.emit(ChannelEvent::Opened);
        lock(&self.senders).push(events);
        Ok(Box::new(MockChannel {
            log: Arc::clone(&self.log),
        }))
    }
}

struct MockChannel {
    log: Arc<Mutex<ChannelLog>>,
}

#[async_trait]
impl ChannelHandle for MockChannel {
    fn send_audio(&self, media: MediaBlob) -> Result<()> {
        lock(&self.log).audio.push(media);
        Ok(())
    }

    fn send_tool_response(&self, responses: Vec<FunctionResponse>) -> Result<()> {
        lock(&self.log).tool_responses.push(responses);
        Ok(())
    }

    async fn close(&mut self) {
        lock(&self.log).closed += 1;
    }
}

/// Microphone that hands out stop-signal handles without touching devices.
#[derive(Default)]
pub struct MockMicrophone {
    fail: AtomicBool,
    stops: Mutex<Vec<crossbeam_channel::Receiver<()>>>,
    frames: Mutex<Option<mpsc::Sender<AudioFrame>>>,
}

impl MockMicrophone {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> usize {
        lock(&self.stops).len()
    }

    /// Captures opened and not yet stopped.
    pub fn active_captures(&self) -> usize {
        lock(&self.stops).iter().filter(|rx| rx.is_empty()).count()
    }

    /// Deliver a frame as if the device produced it.
    pub fn push_frame(&self, frame: AudioFrame) -> bool {
        lock(&self.frames)
            .as_ref()
            .is_some_and(|tx| tx.try_send(frame).is_ok())
    }
}

#[async_trait]
impl MicrophoneSource for MockMicrophone {
    async fn open(&self, frames: mpsc::Sender<AudioFrame>) -> Result<CaptureHandle> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SessionError::Device("permission denied".into()));
        }
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        lock(&self.stops).push(stop_rx);
        *lock(&self.frames) = Some(frames);
        Ok(CaptureHandle::new(stop_tx, None))
    }
}

/// Speaker with a settable clock; buffers finish only when told to.
#[derive(Default)]
pub struct ManualOutput {
    clock: Mutex<Duration>,
    pending: Mutex<Vec<(Duration, DecodedBuffer, PlaybackCompletion)>>,
    starts: Mutex<Vec<Duration>>,
    cancels: AtomicUsize,
}

impl ManualOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_clock(&self, now: Duration) {
        *lock(&self.clock) = now;
    }

    /// Start times of every buffer played so far.
    pub fn scheduled_starts(&self) -> Vec<Duration> {
        lock(&self.starts).clone()
    }

    /// Buffers still queued on the speaker.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    /// Report every pending buffer finished, in scheduling order.
    pub fn finish_all(&self) {
        let pending: Vec<_> = lock(&self.pending).drain(..).collect();
        for (_, _, done) in pending {
            done.notify();
        }
    }
}

impl AudioOutput for ManualOutput {
    fn clock(&self) -> Duration {
        *lock(&self.clock)
    }

    fn play_at(&self, start: Duration, buffer: DecodedBuffer, done: PlaybackCompletion) {
        lock(&self.starts).push(start);
        lock(&self.pending).push((start, buffer, done));
    }

    fn cancel_all(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        lock(&self.pending).clear();
    }
}
