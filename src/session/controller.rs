//! The voice session state machine.
//!
//! A [`SessionController`] owns everything belonging to one voice session:
//! the remote channel, the capture pipeline, the playback scheduler, the
//! tool bridge and the session timers. All of it is mutated from a single
//! event loop reacting to user commands, channel events, captured frames,
//! playback completions and timer deadlines. Once the controller reaches
//! [`SessionPhase::Ended`] it is discarded; the runtime builds a fresh one
//! for the next session.

use super::status::{SessionPhase, StatusBoard, StatusMessages};
use super::timers::{SessionTimers, TimerKind};
use crate::audio::capture::{AudioFrame, CaptureHandle, MicrophoneSource};
use crate::audio::codec;
use crate::audio::playback::AudioOutput;
use crate::audio::scheduler::{BufferHandle, PlaybackScheduler};
use crate::channel::{
    ChannelEvent, ChannelEventSender, ChannelHandle, EpochEvent, SessionSetup, SessionTransport,
    ToolInvocation,
};
use crate::config::VoiceConfig;
use crate::error::Result;
use crate::tickets::{TicketIdGenerator, TicketStore};
use crate::tools::{ToolBridge, complaint_tool_declaration};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

/// Captured frames waiting to be sent; older audio is dropped beyond this.
const FRAME_QUEUE: usize = 8;

/// User-initiated commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    /// Open (pre-warm) the remote channel without capturing.
    Start,
    /// Start streaming the microphone, opening the channel first if needed.
    BeginCapture,
    /// End the session.
    Stop,
}

/// Why a session reached [`SessionPhase::Ended`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    UserStopped,
    TimedOut,
    /// A ticket was logged and trailing playback drained, or the channel
    /// closed after the ticket.
    Completed,
    DeviceError,
    /// Reconnecting hit a failure that retrying cannot fix.
    ConnectionFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

/// Snapshot of the controller's session state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub connection: ConnectionState,
    pub recording: bool,
    pub pending_close: bool,
    pub next_playback_time: Duration,
    pub active_output_buffers: Vec<BufferHandle>,
}

/// Long-lived collaborators shared by every session.
#[derive(Clone)]
pub struct SessionDeps {
    pub transport: Arc<dyn SessionTransport>,
    pub microphone: Arc<dyn MicrophoneSource>,
    pub output: Arc<dyn AudioOutput>,
    pub store: TicketStore,
    pub status: StatusBoard,
}

/// Summary returned when a session's event loop exits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub id: Uuid,
    pub end_reason: Option<EndReason>,
    pub tickets: Vec<String>,
    /// The command sender went away; no further sessions will be requested.
    pub shutdown: bool,
}

pub struct SessionController {
    id: Uuid,
    config: VoiceConfig,
    setup: SessionSetup,
    deps: SessionDeps,
    messages: StatusMessages,

    phase: SessionPhase,
    connection: ConnectionState,
    recording: bool,
    pending_close: bool,

    channel: Option<Box<dyn ChannelHandle>>,
    epoch: u64,
    capture: Option<CaptureHandle>,
    scheduler: PlaybackScheduler,
    bridge: ToolBridge,
    timers: SessionTimers,

    end_reason: Option<EndReason>,
    tickets_logged: Vec<String>,
    shutdown: bool,

    event_tx: mpsc::UnboundedSender<EpochEvent>,
    event_rx: mpsc::UnboundedReceiver<EpochEvent>,
    frame_tx: mpsc::Sender<AudioFrame>,
    frame_rx: mpsc::Receiver<AudioFrame>,
    done_rx: mpsc::UnboundedReceiver<BufferHandle>,
}

impl SessionController {
    pub fn new(config: VoiceConfig, deps: SessionDeps) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE);
        let (done_tx, done_rx) = mpsc::unbounded_channel();

        let setup = SessionSetup::from_config(&config, vec![complaint_tool_declaration()]);
        let bridge = ToolBridge::new(
            deps.store.clone(),
            TicketIdGenerator::new(config.tickets.id_prefix.clone()),
        );
        let scheduler = PlaybackScheduler::new(Arc::clone(&deps.output), done_tx);
        let messages = StatusMessages::new(config.remote.agent_name.clone());

        Self {
            id: Uuid::new_v4(),
            config,
            setup,
            deps,
            messages,
            phase: SessionPhase::Idle,
            connection: ConnectionState::Disconnected,
            recording: false,
            pending_close: false,
            channel: None,
            epoch: 0,
            capture: None,
            scheduler,
            bridge,
            timers: SessionTimers::new(),
            end_reason: None,
            tickets_logged: Vec::new(),
            shutdown: false,
            event_tx,
            event_rx,
            frame_tx,
            frame_rx,
            done_rx,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        self.end_reason
    }

    pub fn tickets_logged(&self) -> &[String] {
        &self.tickets_logged
    }

    pub fn has_channel(&self) -> bool {
        self.channel.is_some()
    }

    pub fn is_timer_armed(&self, kind: TimerKind) -> bool {
        self.timers.is_armed(kind)
    }

    pub fn armed_timers(&self) -> usize {
        self.timers.armed_count()
    }

    pub fn state(&self) -> SessionState {
        SessionState {
            connection: self.connection,
            recording: self.recording,
            pending_close: self.pending_close,
            next_playback_time: self.scheduler.next_playback_time(),
            active_output_buffers: self.scheduler.active().iter().map(|b| b.handle).collect(),
        }
    }

    /// Drive the session until it ends or the command sender is dropped.
    pub async fn run(mut self, commands: &mut mpsc::Receiver<SessionCommand>) -> SessionReport {
        let span = info_span!("session", id = %self.id);
        async move {
            info!("session ready");
            while self.phase != SessionPhase::Ended {
                let deadline = self.timers.next_deadline();
                tokio::select! {
                    cmd = commands.recv() => match cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => {
                            self.shutdown = true;
                            self.finish(EndReason::UserStopped).await;
                        }
                    },
                    Some(event) = self.event_rx.recv() => self.handle_channel_event(event).await,
                    Some(frame) = self.frame_rx.recv() => self.handle_frame(frame),
                    Some(handle) = self.done_rx.recv() => self.handle_playback_done(handle),
                    () = sleep_until_deadline(deadline) => self.handle_due_timers().await,
                }
            }
            SessionReport {
                id: self.id,
                end_reason: self.end_reason,
                tickets: self.tickets_logged.clone(),
                shutdown: self.shutdown,
            }
        }
        .instrument(span)
        .await
    }

    pub async fn handle_command(&mut self, cmd: SessionCommand) {
        debug!(?cmd, phase = ?self.phase, "command");
        match cmd {
            SessionCommand::Start => self.start().await,
            SessionCommand::BeginCapture => self.begin_capture().await,
            SessionCommand::Stop => self.stop().await,
        }
    }

    /// Open the remote channel ahead of capture.
    ///
    /// A failure here is reported on the status board and not retried.
    pub async fn start(&mut self) {
        if self.phase != SessionPhase::Idle || self.channel.is_some() {
            return;
        }
        self.set_status(SessionPhase::Connecting, self.messages.connecting());
        match self.open_channel().await {
            Ok(()) => self.phase = SessionPhase::Idle,
            Err(e) => {
                warn!("initial connect failed: {e}");
                self.phase = SessionPhase::Idle;
                self.deps
                    .status
                    .set_error(self.phase, self.messages.connection_failed());
            }
        }
    }

    /// Attach the microphone and start streaming.
    pub async fn begin_capture(&mut self) {
        if self.phase != SessionPhase::Idle || self.recording {
            return;
        }
        if self.channel.is_none() {
            self.start().await;
            if self.channel.is_none() {
                return;
            }
        }

        match self.deps.microphone.open(self.frame_tx.clone()).await {
            Ok(handle) => {
                self.capture = Some(handle);
                self.recording = true;
                self.timers
                    .arm(TimerKind::MaxDuration, self.config.session.max_duration());
                self.set_status(SessionPhase::Listening, self.messages.listening());
                info!("capture started");
            }
            Err(e) => {
                warn!("microphone unavailable: {e}");
                self.finish(EndReason::DeviceError).await;
            }
        }
    }

    /// End the session. Safe to call in any state, any number of times.
    pub async fn stop(&mut self) {
        self.finish(EndReason::UserStopped).await;
    }

    async fn open_channel(&mut self) -> Result<()> {
        if let Some(mut old) = self.channel.take() {
            old.close().await;
        }
        self.epoch += 1;
        self.connection = ConnectionState::Connecting;
        let events = ChannelEventSender::new(self.epoch, self.event_tx.clone());
        match self.deps.transport.open(&self.setup, events).await {
            Ok(handle) => {
                self.channel = Some(handle);
                self.connection = ConnectionState::Open;
                info!(epoch = self.epoch, "channel open");
                Ok(())
            }
            Err(e) => {
                self.connection = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    async fn finish(&mut self, reason: EndReason) {
        if self.phase == SessionPhase::Ended {
            return;
        }
        self.timers.cancel_all();

        if let Some(capture) = self.capture.take() {
            capture.stop();
        }
        self.recording = false;

        // The output outlives this session; unplayed speech must not bleed
        // into the next one.
        if !self.scheduler.is_drained() {
            debug!(buffers = self.scheduler.active_count(), "cancelling queued speech");
        }
        self.deps.output.cancel_all();

        if let Some(mut channel) = self.channel.take() {
            self.connection = ConnectionState::Closing;
            channel.close().await;
        }
        self.connection = ConnectionState::Disconnected;
        // Anything still queued from the closed channel is now stale.
        self.epoch += 1;

        self.end_reason = Some(reason);
        let logged = !self.tickets_logged.is_empty();
        match reason {
            EndReason::DeviceError => self
                .deps
                .status
                .set_error(SessionPhase::Ended, self.messages.microphone_error()),
            EndReason::ConnectionFailed => self
                .deps
                .status
                .set_error(SessionPhase::Ended, self.messages.connection_failed()),
            EndReason::TimedOut => self.set_status(SessionPhase::Ended, self.messages.timed_out()),
            EndReason::UserStopped | EndReason::Completed if logged => {
                self.set_status(SessionPhase::Ended, self.messages.ticket_logged());
            }
            EndReason::UserStopped | EndReason::Completed => {
                self.set_status(SessionPhase::Ended, self.messages.ended());
            }
        }
        info!(?reason, tickets = self.tickets_logged.len(), "session ended");
    }

    async fn handle_channel_event(&mut self, event: EpochEvent) {
        if event.epoch != self.epoch || self.phase == SessionPhase::Ended {
            debug!(epoch = event.epoch, current = self.epoch, "ignoring stale channel event");
            return;
        }
        match event.event {
            ChannelEvent::Opened => {
                let message = if self.recording {
                    self.messages.reconnected()
                } else {
                    self.messages.idle()
                };
                self.set_status(self.phase, message);
            }
            ChannelEvent::ToolCall(calls) => self.handle_tool_calls(&calls),
            ChannelEvent::AudioChunk(blob) => self.handle_audio(&blob.data, &blob.mime_type),
            ChannelEvent::TurnComplete => {
                debug!("remote turn complete");
                self.maybe_arm_close_grace();
            }
            ChannelEvent::Error(message) => warn!(epoch = event.epoch, "remote channel error: {message}"),
            ChannelEvent::Closed { reason } => self.handle_channel_closed(&reason).await,
        }
    }

    fn handle_tool_calls(&mut self, calls: &[ToolInvocation]) {
        let outcome = self.bridge.handle_batch(calls);

        if !outcome.tickets.is_empty() {
            self.tickets_logged.extend(outcome.tickets.iter().cloned());
            // Only a call made during capture closes the session; one on a
            // pre-warmed channel is logged and acknowledged.
            if self.config.session.end_session_on_ticket && self.recording && !self.pending_close {
                self.pending_close = true;
                let phase = if self.phase == SessionPhase::Listening {
                    SessionPhase::AwaitingClose
                } else {
                    self.phase
                };
                self.set_status(phase, self.messages.ticket_logged());
            }
        }

        if outcome.responses.is_empty() {
            return;
        }
        match &self.channel {
            Some(channel) => {
                if let Err(e) = channel.send_tool_response(outcome.responses) {
                    warn!("tool acknowledgement not delivered: {e}");
                }
            }
            None => warn!("tool acknowledgement dropped, no open channel"),
        }
    }

    fn handle_audio(&mut self, data: &str, mime_type: &str) {
        let buffer =
            match codec::decode_chunk(data, mime_type, self.config.audio.output_sample_rate) {
                Ok(buffer) => buffer,
                Err(e) => {
                    warn!("dropping inbound audio: {e}");
                    return;
                }
            };
        if buffer.is_empty() {
            return;
        }

        if self.pending_close {
            // Trailing speech; hold teardown until it has played.
            self.timers.cancel(TimerKind::CloseGrace);
        } else {
            self.set_status(self.phase, self.messages.speaking());
        }

        let slot = self.scheduler.enqueue(buffer);
        debug!(buffer = %slot.handle, start = ?slot.start, end = ?slot.end, "speech scheduled");
    }

    async fn handle_channel_closed(&mut self, reason: &str) {
        self.channel = None;
        self.connection = ConnectionState::Disconnected;

        if self.recording && !self.pending_close {
            info!(%reason, "channel dropped while recording, reconnecting");
            self.timers
                .arm(TimerKind::Reconnect, self.config.session.reconnect_delay());
            self.set_status(SessionPhase::Reconnecting, self.messages.reconnecting());
        } else if self.recording {
            info!(%reason, "channel closed after ticket");
            self.finish(EndReason::Completed).await;
        } else {
            info!(%reason, "idle channel closed");
        }
    }

    fn handle_frame(&mut self, frame: AudioFrame) {
        if !self.recording {
            return;
        }
        let Some(channel) = &self.channel else {
            return;
        };
        if let Err(e) = channel.send_audio(codec::encode_frame(&frame)) {
            if e.is_transient() {
                debug!("dropping frame: {e}");
            } else {
                warn!("dropping frame: {e}");
            }
        }
    }

    fn handle_playback_done(&mut self, handle: BufferHandle) {
        if self.scheduler.complete(handle).is_none() {
            return;
        }
        debug!(buffer = %handle, remaining = self.scheduler.active_count(), "playback finished");
        if !self.scheduler.is_drained() || self.phase == SessionPhase::Ended {
            return;
        }
        if self.pending_close {
            self.set_status(self.phase, self.messages.ticket_logged());
            self.maybe_arm_close_grace();
        } else if self.recording {
            self.set_status(self.phase, self.messages.listening());
        }
    }

    fn maybe_arm_close_grace(&mut self) {
        if self.pending_close
            && self.scheduler.is_drained()
            && !self.timers.is_armed(TimerKind::CloseGrace)
        {
            self.timers
                .arm(TimerKind::CloseGrace, self.config.session.close_grace());
        }
    }

    async fn handle_due_timers(&mut self) {
        for kind in self.timers.take_due(Instant::now()) {
            if self.phase == SessionPhase::Ended {
                break;
            }
            match kind {
                TimerKind::MaxDuration => {
                    info!("maximum session duration reached");
                    self.finish(EndReason::TimedOut).await;
                }
                TimerKind::Reconnect => self.reconnect().await,
                TimerKind::CloseGrace => self.finish(EndReason::Completed).await,
            }
        }
    }

    async fn reconnect(&mut self) {
        if !self.recording || self.pending_close || self.channel.is_some() {
            return;
        }
        match self.open_channel().await {
            Ok(()) => {
                self.phase = SessionPhase::Listening;
                info!(epoch = self.epoch, "reconnected");
            }
            Err(e) if e.is_transient() => {
                warn!("reconnect failed: {e}");
                self.timers
                    .arm(TimerKind::Reconnect, self.config.session.reconnect_delay());
            }
            Err(e) => {
                warn!("reconnect abandoned: {e}");
                self.finish(EndReason::ConnectionFailed).await;
            }
        }
    }

    fn set_status(&mut self, phase: SessionPhase, message: String) {
        self.phase = phase;
        self.deps.status.set(phase, message);
    }

    /// Process everything already queued, including due timers.
    #[cfg(test)]
    pub(crate) async fn settle(&mut self) {
        loop {
            if let Ok(event) = self.event_rx.try_recv() {
                self.handle_channel_event(event).await;
            } else if let Ok(frame) = self.frame_rx.try_recv() {
                self.handle_frame(frame);
            } else if let Ok(handle) = self.done_rx.try_recv() {
                self.handle_playback_done(handle);
            } else if self
                .timers
                .next_deadline()
                .is_some_and(|at| at <= Instant::now())
            {
                self.handle_due_timers().await;
            } else {
                break;
            }
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
