//! Duplex channel to the remote conversational engine.
//!
//! A [`SessionTransport`] opens channels; each open channel is a
//! [`ChannelHandle`] for outbound traffic plus a stream of [`EpochEvent`]s
//! for inbound traffic. Every channel gets its own epoch so the owner can
//! discard late events from a connection it already replaced.

pub mod protocol;
pub mod websocket;

use crate::audio::codec::MediaBlob;
use crate::config::VoiceConfig;
use crate::error::Result;
use async_trait::async_trait;
use protocol::{FunctionDeclaration, FunctionResponse};
use tokio::sync::mpsc;

pub use websocket::WebSocketTransport;

/// A structured request from the remote engine to run a named tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Map<String, serde_json::Value>,
}

/// Inbound events surfaced by an open channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The channel is open and the setup message was sent.
    Opened,
    /// One or more tool invocations, in the order the engine sent them.
    ToolCall(Vec<ToolInvocation>),
    /// Encoded synthesized speech.
    AudioChunk(MediaBlob),
    /// The engine finished its current turn.
    TurnComplete,
    /// Non-fatal problem reported by the engine or the transport.
    Error(String),
    /// The channel closed without the owner asking for it.
    Closed { reason: String },
}

/// A [`ChannelEvent`] tagged with the epoch of the channel that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochEvent {
    pub epoch: u64,
    pub event: ChannelEvent,
}

/// Emits events for one channel epoch into the owner's event queue.
#[derive(Debug, Clone)]
pub struct ChannelEventSender {
    epoch: u64,
    tx: mpsc::UnboundedSender<EpochEvent>,
}

impl ChannelEventSender {
    pub fn new(epoch: u64, tx: mpsc::UnboundedSender<EpochEvent>) -> Self {
        Self { epoch, tx }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Deliver an event. Returns `false` once the owner has gone away.
    pub fn emit(&self, event: ChannelEvent) -> bool {
        self.tx
            .send(EpochEvent {
                epoch: self.epoch,
                event,
            })
            .is_ok()
    }
}

/// Everything the remote engine needs when a channel opens.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSetup {
    pub model: String,
    pub system_instruction: String,
    pub voice_name: String,
    pub tools: Vec<FunctionDeclaration>,
    /// Rate tagged on outbound audio.
    pub input_sample_rate: u32,
}

impl SessionSetup {
    /// Build the setup for `config` declaring the given tools.
    pub fn from_config(config: &VoiceConfig, tools: Vec<FunctionDeclaration>) -> Self {
        Self {
            model: config.remote.model.clone(),
            system_instruction: config.remote.system_instruction.clone(),
            voice_name: config.remote.voice_name.clone(),
            tools,
            input_sample_rate: config.audio.input_sample_rate,
        }
    }
}

/// Opens channels to the remote engine.
#[async_trait]
pub trait SessionTransport: Send + Sync {
    /// Connect, send `setup`, and start delivering inbound traffic to `events`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SessionError::Connection`] if the channel cannot be
    /// opened.
    async fn open(
        &self,
        setup: &SessionSetup,
        events: ChannelEventSender,
    ) -> Result<Box<dyn ChannelHandle>>;
}

/// Outbound side of one open channel.
#[async_trait]
pub trait ChannelHandle: Send {
    /// Queue one encoded audio frame. Frames are dropped rather than queued
    /// without bound.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SessionError::Send`] if the channel is no longer usable
    /// or its audio queue is full.
    fn send_audio(&self, media: MediaBlob) -> Result<()>;

    /// Queue a batched tool acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SessionError::Send`] if the channel is no longer usable.
    fn send_tool_response(&self, responses: Vec<FunctionResponse>) -> Result<()>;

    /// Close the channel. Emits no further events.
    async fn close(&mut self);
}
