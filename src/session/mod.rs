//! Voice session lifecycle: controller, runtime, status and timers.

pub mod controller;
pub mod runtime;
pub mod status;
pub mod timers;

pub use controller::{
    ConnectionState, EndReason, SessionCommand, SessionController, SessionDeps, SessionReport,
    SessionState,
};
pub use runtime::{SessionClient, SessionRuntime};
pub use status::{SessionPhase, StatusBoard, StatusMessages, StatusSnapshot};
