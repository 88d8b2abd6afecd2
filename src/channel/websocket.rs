//! WebSocket transport for the bidirectional session service.
//!
//! Each open channel owns one spawned pump task that multiplexes inbound
//! frames and outbound JSON over the socket. Outbound audio goes through a
//! small bounded queue and is dropped when the socket falls behind; tool
//! acknowledgements use their own unbounded queue and are never dropped.
//! The owner stops the pump with a cancellation token.

use super::protocol::{self, FunctionResponse};
use super::{ChannelEvent, ChannelEventSender, ChannelHandle, SessionSetup, SessionTransport};
use crate::audio::codec::MediaBlob;
use crate::config::RemoteConfig;
use crate::error::{Result, SessionError};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// How long `close` waits for the pump to send its close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Encoded audio frames waiting for the socket writer.
const AUDIO_QUEUE: usize = 8;

/// Opens WebSocket channels to a configured endpoint.
pub struct WebSocketTransport {
    url: String,
    endpoint: String,
    connect_timeout: Duration,
}

impl WebSocketTransport {
    /// Build a transport for `config.endpoint`, appending `?key=` when an
    /// API key is configured.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Config`] if the endpoint is not a valid URL.
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let mut url = url::Url::parse(&config.endpoint)
            .map_err(|e| SessionError::Config(format!("invalid endpoint '{}': {e}", config.endpoint)))?;
        if let Some(key) = config.api_key.as_deref().filter(|k| !k.is_empty()) {
            url.query_pairs_mut().append_pair("key", key);
        }
        Ok(Self {
            url: url.into(),
            endpoint: config.endpoint.clone(),
            connect_timeout: config.connect_timeout(),
        })
    }

    /// Endpoint without credentials, safe to log.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl SessionTransport for WebSocketTransport {
    async fn open(
        &self,
        setup: &SessionSetup,
        events: ChannelEventSender,
    ) -> Result<Box<dyn ChannelHandle>> {
        let epoch = events.epoch();
        info!(epoch, endpoint = %self.endpoint, "opening remote channel");

        let (mut ws, _) = tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| {
                SessionError::Connection(format!(
                    "connect timed out after {}ms",
                    self.connect_timeout.as_millis()
                ))
            })?
            .map_err(|e| SessionError::Connection(format!("connect: {e}")))?;

        let setup_json = protocol::setup_message(setup)?;
        ws.send(Message::Text(setup_json))
            .await
            .map_err(|e| SessionError::Connection(format!("send setup: {e}")))?;

        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_QUEUE);
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        events.emit(ChannelEvent::Opened);
        let task = tokio::spawn(pump(
            ws,
            Outbound {
                audio: audio_rx,
                acks: ack_rx,
            },
            cancel.clone(),
            events,
        ));

        Ok(Box::new(WebSocketChannel {
            epoch,
            audio: audio_tx,
            acks: ack_tx,
            cancel,
            task: Some(task),
        }))
    }
}

struct WebSocketChannel {
    epoch: u64,
    audio: mpsc::Sender<String>,
    acks: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// Pump side of the outbound queues.
struct Outbound {
    audio: mpsc::Receiver<String>,
    acks: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl ChannelHandle for WebSocketChannel {
    fn send_audio(&self, media: MediaBlob) -> Result<()> {
        let json = protocol::realtime_input_message(&media)?;
        self.audio.try_send(json).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                SessionError::Send(format!("channel {} audio queue full", self.epoch))
            }
            mpsc::error::TrySendError::Closed(_) => {
                SessionError::Send(format!("channel {} is closed", self.epoch))
            }
        })
    }

    fn send_tool_response(&self, responses: Vec<FunctionResponse>) -> Result<()> {
        self.acks
            .send(protocol::tool_response_message(&responses)?)
            .map_err(|_| SessionError::Send(format!("channel {} is closed", self.epoch)))
    }

    async fn close(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if tokio::time::timeout(CLOSE_TIMEOUT, task).await.is_err() {
                warn!(epoch = self.epoch, "channel pump did not stop in time");
            }
        }
    }
}

impl Drop for WebSocketChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn pump(
    ws: WsStream,
    mut outbound: Outbound,
    cancel: CancellationToken,
    events: ChannelEventSender,
) {
    let epoch = events.epoch();
    let (mut write, mut read) = ws.split();

    let reason = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                debug!(epoch, "channel closed by owner");
                return;
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => dispatch(&text, &events),
                    Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => dispatch(text, &events),
                        Err(_) => debug!(epoch, "ignoring non-UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break match frame {
                            Some(f) => format!("closed by server ({}): {}", u16::from(f.code), f.reason),
                            None => "closed by server".to_owned(),
                        };
                    }
                    Some(Ok(_)) => {} // Ping/Pong handled by tungstenite.
                    Some(Err(e)) => break format!("read error: {e}"),
                    None => break "connection closed".to_owned(),
                }
            }
            Some(json) = outbound.acks.recv() => {
                if let Err(e) = write.send(Message::Text(json)).await {
                    break format!("send error: {e}");
                }
            }
            Some(json) = outbound.audio.recv() => {
                if let Err(e) = write.send(Message::Text(json)).await {
                    break format!("send error: {e}");
                }
            }
        }
    };

    if !cancel.is_cancelled() {
        info!(epoch, %reason, "remote channel dropped");
        events.emit(ChannelEvent::Closed { reason });
    }
}

fn dispatch(text: &str, events: &ChannelEventSender) {
    match protocol::decode_server_message(text) {
        Ok(decoded) => {
            for event in decoded {
                events.emit(event);
            }
        }
        Err(e) => debug!(epoch = events.epoch(), "ignoring unparseable server message: {e}"),
    }
}
