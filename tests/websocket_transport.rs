//! WebSocket transport against a local `tokio-tungstenite` server.
//!
//! The server side plays the remote session service: it checks the setup
//! message, pushes a tool call with trailing audio, and records what the
//! client sends back.

use civic_voice::SessionError;
use civic_voice::audio::codec::MediaBlob;
use civic_voice::channel::protocol::FunctionResponse;
use civic_voice::channel::{
    ChannelEvent, ChannelEventSender, EpochEvent, SessionSetup, SessionTransport,
    WebSocketTransport,
};
use civic_voice::config::{RemoteConfig, VoiceConfig};
use civic_voice::tools::complaint_tool_declaration;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

async fn listen() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind local listener");
    let addr = listener.local_addr().expect("local addr");
    (listener, addr)
}

async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = listener.accept().await.expect("accept");
    accept_async(stream).await.expect("websocket handshake")
}

/// Next JSON payload from the client, skipping control frames.
async fn next_json(ws: &mut WebSocketStream<TcpStream>) -> Value {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(&text).expect("client sent JSON");
            }
            Some(Ok(Message::Binary(bytes))) => {
                return serde_json::from_slice(&bytes).expect("client sent JSON");
            }
            Some(Ok(_)) => {}
            other => panic!("client stream ended early: {other:?}"),
        }
    }
}

fn transport(addr: SocketAddr) -> WebSocketTransport {
    let config = RemoteConfig {
        endpoint: format!("ws://{addr}/"),
        api_key: Some("test-key".into()),
        ..RemoteConfig::default()
    };
    WebSocketTransport::new(&config).expect("transport")
}

fn setup() -> SessionSetup {
    SessionSetup::from_config(&VoiceConfig::default(), vec![complaint_tool_declaration()])
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<EpochEvent>) -> EpochEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for channel event")
        .expect("event channel closed")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn full_round_trip() {
    let (listener, addr) = listen().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let mut received = vec![next_json(&mut ws).await];

        ws.send(Message::Text(json!({"setupComplete": {}}).to_string()))
            .await
            .expect("send setupComplete");
        let turn = json!({
            "toolCall": {"functionCalls": [{
                "id": "fc-1",
                "name": "log_complaint",
                "args": {"category": "Water", "location": "Zone 4"}
            }]},
            "serverContent": {"modelTurn": {"parts": [
                {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAAA"}}
            ]}}
        });
        ws.send(Message::Binary(serde_json::to_vec(&turn).expect("encode")))
            .await
            .expect("send turn");

        received.push(next_json(&mut ws).await);
        received.push(next_json(&mut ws).await);
        ws.close(None).await.expect("close");
        received
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut channel = transport(addr)
        .open(&setup(), ChannelEventSender::new(3, tx))
        .await
        .expect("open channel");

    let opened = recv(&mut rx).await;
    assert_eq!(opened.epoch, 3);
    assert_eq!(opened.event, ChannelEvent::Opened);

    match recv(&mut rx).await.event {
        ChannelEvent::ToolCall(calls) => {
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].id, "fc-1");
            assert_eq!(calls[0].arguments["location"], "Zone 4");
        }
        other => panic!("expected tool call before audio, got {other:?}"),
    }
    match recv(&mut rx).await.event {
        ChannelEvent::AudioChunk(blob) => assert_eq!(blob.data, "AAAA"),
        other => panic!("expected audio chunk, got {other:?}"),
    }

    channel
        .send_audio(MediaBlob {
            mime_type: "audio/pcm;rate=16000".into(),
            data: "AQID".into(),
        })
        .expect("send audio");
    channel
        .send_tool_response(vec![FunctionResponse {
            id: "fc-1".into(),
            name: "log_complaint".into(),
            response: json!({"result": "success", "ticketId": "MAH-1234"}),
        }])
        .expect("send ack");

    assert!(matches!(
        recv(&mut rx).await.event,
        ChannelEvent::Closed { .. }
    ));

    let received = server.await.expect("server task");
    let setup = &received[0]["setup"];
    assert_eq!(setup["model"], VoiceConfig::default().remote.model);
    assert_eq!(
        setup["tools"][0]["functionDeclarations"][0]["name"],
        "log_complaint"
    );
    // Audio and acknowledgements travel on separate queues; either may land first.
    let sent = |key: &str| {
        received[1..]
            .iter()
            .find(|m| m.get(key).is_some())
            .unwrap_or_else(|| panic!("no {key} message"))
    };
    assert_eq!(
        sent("realtimeInput")["realtimeInput"]["mediaChunks"][0]["mimeType"],
        "audio/pcm;rate=16000"
    );
    assert_eq!(
        sent("toolResponse")["toolResponse"]["functionResponses"][0]["response"]["ticketId"],
        "MAH-1234"
    );

    // The pump has exited; further sends fail instead of queueing.
    channel.close().await;
    assert!(matches!(
        channel.send_audio(MediaBlob {
            mime_type: "audio/pcm;rate=16000".into(),
            data: String::new(),
        }),
        Err(SessionError::Send(_))
    ));
}

#[tokio::test]
async fn owner_close_is_silent() {
    let (listener, addr) = listen().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let _setup = next_json(&mut ws).await;
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) => return true,
                Some(Ok(_)) => {}
                _ => return false,
            }
        }
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut channel = transport(addr)
        .open(&setup(), ChannelEventSender::new(1, tx))
        .await
        .expect("open channel");
    assert_eq!(recv(&mut rx).await.event, ChannelEvent::Opened);

    channel.close().await;

    let saw_close = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server finished")
        .expect("server task");
    assert!(saw_close);
    assert!(rx.try_recv().is_err(), "owner close must not emit Closed");
}
