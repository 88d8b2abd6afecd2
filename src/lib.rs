//! Civic Voice: real-time voice intake of municipal complaints.
//!
//! A citizen talks to a remote conversational agent over a duplex channel;
//! when the agent has gathered the details it invokes a tool that logs a
//! service ticket, which an operator dashboard sees immediately.
//!
//! # Architecture
//!
//! One [`session::SessionController`] per voice session orchestrates:
//! - **Audio capture**: microphone frames via `cpal`, resampled to 16kHz mono
//! - **Encoding**: PCM16 little-endian, base64 framed
//! - **Remote channel**: WebSocket to the session service (`tokio-tungstenite`)
//! - **Tool bridge**: `log_complaint` invocations become [`tickets::Ticket`]s
//! - **Playback**: inbound speech scheduled gap-free on a continuous `cpal` stream
//!
//! Channel drops while recording are retried at a fixed delay; a logged
//! ticket ends the session once the agent's closing speech has played.

pub mod app_dirs;
pub mod audio;
pub mod channel;
pub mod config;
pub mod error;
pub mod session;
pub mod tickets;
pub mod tools;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::VoiceConfig;
pub use error::{Result, SessionError};
pub use session::{SessionClient, SessionController, SessionPhase, SessionRuntime};
pub use tickets::{Ticket, TicketStore};
