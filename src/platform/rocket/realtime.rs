// ABOUTME: RocketChat realtime API (DDP over WebSocket)
// ABOUTME: Logs in with a SHA-256 digest, subscribes to room message streams and answers pings

use anyhow::{bail, Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use luabot_core::event::{InboundEvent, TransportSignal};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

type WebSocketStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;
type WsWrite = SplitSink<WebSocketStream, Message>;
type WsRead = SplitStream<WebSocketStream>;

const MESSAGE_STREAM: &str = "stream-room-messages";

pub fn login_request(email: &str, password: &str) -> Value {
    let digest = format!("{:x}", Sha256::digest(password.as_bytes()));
    json!({
        "msg": "method",
        "method": "login",
        "id": "login",
        "params": [{
            "user": {"email": email},
            "password": {"digest": digest, "algorithm": "sha-256"},
        }],
    })
}

pub fn send_message_request(room_id: &str, text: &str) -> Value {
    json!({
        "msg": "method",
        "method": "sendMessage",
        "id": uuid::Uuid::new_v4().to_string(),
        "params": [{"_id": uuid::Uuid::new_v4().to_string(), "rid": room_id, "msg": text}],
    })
}

/// The chat message carried by a stream-room-messages update, if any
pub fn room_message(frame: &Value) -> Option<&Value> {
    if frame.get("msg")?.as_str()? != "changed" {
        return None;
    }
    if frame.get("collection")?.as_str()? != MESSAGE_STREAM {
        return None;
    }
    frame.pointer("/fields/args/0")
}

async fn write_frame(write: &mut WsWrite, frame: &Value) -> Result<()> {
    write
        .send(Message::Text(frame.to_string().into()))
        .await
        .context("Failed to write to RocketChat websocket")
}

/// Read frames until one satisfies `done`, answering pings on the way
async fn wait_for(read: &mut WsRead, write: &mut WsWrite, done: impl Fn(&Value) -> bool) -> Result<Value> {
    while let Some(frame) = read.next().await {
        let Message::Text(text) = frame.context("RocketChat websocket error")? else {
            continue;
        };
        let Ok(frame) = serde_json::from_str::<Value>(text.as_str()) else {
            continue;
        };
        if frame.get("msg").and_then(Value::as_str) == Some("ping") {
            write_frame(write, &json!({"msg": "pong"})).await?;
            continue;
        }
        if done(&frame) {
            return Ok(frame);
        }
    }
    bail!("RocketChat websocket closed during handshake")
}

/// Open a realtime session. Returns the frame sender used for outgoing
/// messages; room messages and the final disconnect go to `events`.
pub async fn open(
    ws_url: &str,
    email: &str,
    password: &str,
    room_ids: &[String],
    events: mpsc::Sender<TransportSignal>,
) -> Result<mpsc::UnboundedSender<Value>> {
    let (stream, _) = connect_async(ws_url)
        .await
        .with_context(|| format!("Failed to connect to {}", ws_url))?;
    let (mut write, mut read) = stream.split();

    write_frame(&mut write, &json!({"msg": "connect", "version": "1", "support": ["1"]})).await?;
    wait_for(&mut read, &mut write, |f| f.get("msg").and_then(Value::as_str) == Some("connected")).await?;

    write_frame(&mut write, &login_request(email, password)).await?;
    let result = wait_for(&mut read, &mut write, |f| {
        f.get("msg").and_then(Value::as_str) == Some("result") && f.get("id").and_then(Value::as_str) == Some("login")
    })
    .await?;
    if let Some(error) = result.get("error") {
        bail!("Realtime login failed: {}", error);
    }

    for room_id in room_ids {
        let sub = json!({
            "msg": "sub",
            "id": uuid::Uuid::new_v4().to_string(),
            "name": MESSAGE_STREAM,
            "params": [room_id, false],
        });
        write_frame(&mut write, &sub).await?;
    }

    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<Value>();
    tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            if let Err(e) = write_frame(&mut write, &frame).await {
                tracing::warn!(error = %e, "RocketChat write failed");
                break;
            }
        }
    });

    let pong = frame_tx.clone();
    tokio::spawn(async move {
        let reason = loop {
            let frame = match read.next().await {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(_))) | None => break "websocket closed".to_string(),
                Some(Ok(_)) => continue,
                Some(Err(e)) => break e.to_string(),
            };
            let Ok(frame) = serde_json::from_str::<Value>(frame.as_str()) else {
                continue;
            };
            if frame.get("msg").and_then(Value::as_str) == Some("ping") {
                let _ = pong.send(json!({"msg": "pong"}));
                continue;
            }
            if let Some(message) = room_message(&frame) {
                let event = InboundEvent::new("message", message.clone());
                if events.send(TransportSignal::Event(event)).await.is_err() {
                    return;
                }
            }
        };
        let _ = events.send(TransportSignal::Disconnected(reason)).await;
    });

    Ok(frame_tx)
}
