//! Long-lived session host.
//!
//! [`SessionRuntime`] owns the collaborators that outlive a single session
//! and builds a fresh [`SessionController`] for every session. UI code
//! drives it through the cloneable [`SessionClient`].

use super::controller::{SessionCommand, SessionController, SessionDeps, SessionReport};
use super::status::{StatusBoard, StatusMessages, StatusSnapshot};
use crate::audio::capture::MicrophoneSource;
use crate::audio::playback::AudioOutput;
use crate::channel::SessionTransport;
use crate::config::VoiceConfig;
use crate::error::{Result, SessionError};
use crate::tickets::TicketStore;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::info;

const COMMAND_QUEUE: usize = 16;

pub struct SessionRuntime {
    config: VoiceConfig,
    deps: SessionDeps,
    commands: mpsc::Receiver<SessionCommand>,
}

/// Command handle for a running [`SessionRuntime`].
#[derive(Clone)]
pub struct SessionClient {
    commands: mpsc::Sender<SessionCommand>,
    status: StatusBoard,
    store: TicketStore,
}

impl SessionRuntime {
    pub fn new(
        config: VoiceConfig,
        transport: Arc<dyn SessionTransport>,
        microphone: Arc<dyn MicrophoneSource>,
        output: Arc<dyn AudioOutput>,
        store: TicketStore,
    ) -> (Self, SessionClient) {
        let status = StatusBoard::new(StatusMessages::new(config.remote.agent_name.clone()).idle());
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let client = SessionClient {
            commands: tx,
            status: status.clone(),
            store: store.clone(),
        };
        let deps = SessionDeps {
            transport,
            microphone,
            output,
            store,
            status,
        };
        (
            Self {
                config,
                deps,
                commands: rx,
            },
            client,
        )
    }

    /// Run sessions back to back until every [`SessionClient`] is dropped.
    ///
    /// Only the first session pre-warms its channel; later ones connect
    /// when capture begins.
    pub async fn run(mut self) -> Vec<SessionReport> {
        let mut reports = Vec::new();
        let mut prewarm = self.config.session.prewarm;
        loop {
            let mut controller = SessionController::new(self.config.clone(), self.deps.clone());
            if prewarm {
                controller.start().await;
                prewarm = false;
            }
            let report = controller.run(&mut self.commands).await;
            info!(
                session = %report.id,
                reason = ?report.end_reason,
                tickets = report.tickets.len(),
                "session finished"
            );
            let shutdown = report.shutdown;
            reports.push(report);
            if shutdown {
                break;
            }
        }
        reports
    }
}

impl SessionClient {
    async fn send(&self, cmd: SessionCommand) -> Result<()> {
        self.commands
            .send(cmd)
            .await
            .map_err(|_| SessionError::Channel("session runtime has stopped".into()))
    }

    /// Pre-warm the remote channel.
    pub async fn start(&self) -> Result<()> {
        self.send(SessionCommand::Start).await
    }

    /// Begin streaming the microphone.
    pub async fn begin_capture(&self) -> Result<()> {
        self.send(SessionCommand::BeginCapture).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.send(SessionCommand::Stop).await
    }

    pub fn status(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.subscribe()
    }

    pub fn current_status(&self) -> StatusSnapshot {
        self.status.current()
    }

    pub fn tickets(&self) -> &TicketStore {
        &self.store
    }
}
