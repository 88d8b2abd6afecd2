//! Human-readable session status published to the UI.

use std::sync::Arc;
use tokio::sync::watch;

/// Externally visible state of the session controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionPhase {
    Idle,
    Connecting,
    Listening,
    /// A ticket was logged; trailing speech is still playing.
    AwaitingClose,
    Reconnecting,
    Ended,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub message: String,
    pub is_error: bool,
    pub phase: SessionPhase,
}

/// Latest-value status channel shared by the runtime and its observers.
#[derive(Debug, Clone)]
pub struct StatusBoard {
    tx: Arc<watch::Sender<StatusSnapshot>>,
}

impl StatusBoard {
    pub fn new(initial: impl Into<String>) -> Self {
        let (tx, _) = watch::channel(StatusSnapshot {
            message: initial.into(),
            is_error: false,
            phase: SessionPhase::Idle,
        });
        Self { tx: Arc::new(tx) }
    }

    pub fn set(&self, phase: SessionPhase, message: impl Into<String>) {
        self.publish(phase, message.into(), false);
    }

    pub fn set_error(&self, phase: SessionPhase, message: impl Into<String>) {
        self.publish(phase, message.into(), true);
    }

    fn publish(&self, phase: SessionPhase, message: String, is_error: bool) {
        self.tx.send_replace(StatusSnapshot {
            message,
            is_error,
            phase,
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> StatusSnapshot {
        self.tx.borrow().clone()
    }
}

/// Status strings, personalised with the agent's name.
#[derive(Debug, Clone)]
pub struct StatusMessages {
    agent: String,
}

impl StatusMessages {
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
        }
    }

    pub fn idle(&self) -> String {
        format!("Press Start to speak with {}", self.agent)
    }

    pub fn connecting(&self) -> String {
        format!("Connecting to {}...", self.agent)
    }

    pub fn listening(&self) -> String {
        "Listening...".to_owned()
    }

    pub fn speaking(&self) -> String {
        format!("{} is speaking...", self.agent)
    }

    pub fn reconnecting(&self) -> String {
        "Reconnecting...".to_owned()
    }

    pub fn reconnected(&self) -> String {
        format!("Reconnected. {} is listening.", self.agent)
    }

    pub fn ticket_logged(&self) -> String {
        "Ticket logged. Thank you.".to_owned()
    }

    pub fn timed_out(&self) -> String {
        "Time limit reached.".to_owned()
    }

    pub fn ended(&self) -> String {
        "Session ended".to_owned()
    }

    pub fn connection_failed(&self) -> String {
        "Connection failed".to_owned()
    }

    pub fn microphone_error(&self) -> String {
        "Microphone error".to_owned()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[tokio::test]
    async fn subscribers_see_latest_status() {
        let board = StatusBoard::new("ready");
        let mut rx = board.subscribe();
        board.set(SessionPhase::Listening, "Listening...");
        board.set_error(SessionPhase::Ended, "Microphone error");

        rx.changed().await.unwrap();
        let snap = rx.borrow_and_update().clone();
        assert_eq!(snap.message, "Microphone error");
        assert!(snap.is_error);
        assert_eq!(snap.phase, SessionPhase::Ended);
    }

    #[test]
    fn publish_without_subscribers_is_kept() {
        let board = StatusBoard::new("ready");
        board.set(SessionPhase::Connecting, "Connecting...");
        assert_eq!(board.current().phase, SessionPhase::Connecting);
        assert!(!board.current().is_error);
    }

    #[test]
    fn messages_use_agent_name() {
        let m = StatusMessages::new("Maya");
        assert_eq!(m.idle(), "Press Start to speak with Maya");
        assert_eq!(m.speaking(), "Maya is speaking...");
        assert_eq!(m.reconnected(), "Reconnected. Maya is listening.");
    }
}
