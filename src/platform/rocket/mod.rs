// ABOUTME: RocketChat backend: REST login and room directory, DDP realtime message stream
// ABOUTME: Deduplicates repeated message deliveries and enriches them with channel and user names

pub mod realtime;
pub mod rest;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use luabot_core::config::{BackendKind, CommonClientOption};
use luabot_core::coord::Coordinator;
use luabot_core::event::{InboundEvent, MessageEvent, TransportSignal};
use luabot_core::log_relay::Logger;
use mlua::{Function, Lua};
use regex::Regex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::mpsc;

use super::options::OptionReader;
use super::{call_on_match, str_field, BackendBase, ChatBackend, Transport};
use rest::RocketRest;

#[derive(Clone)]
pub struct RocketSettings {
    pub url: String,
    pub name: String,
    pub email: String,
    pub password: String,
    pub channels: Vec<String>,
}

impl std::fmt::Debug for RocketSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocketSettings")
            .field("url", &self.url)
            .field("name", &self.name)
            .field("email", &self.email)
            .field("password", &"[REDACTED]")
            .field("channels", &self.channels)
            .finish()
    }
}

/// `ws(s)://host[:port]/websocket` for an `http(s)://` server URL
pub fn websocket_url(server: &str) -> Result<String> {
    let parsed = url::Url::parse(server).with_context(|| format!("Invalid RocketChat url '{}'", server))?;
    let scheme = match parsed.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => return Err(anyhow!("Unsupported RocketChat url scheme '{}'", other)),
    };
    let host = parsed
        .host_str()
        .ok_or_else(|| anyhow!("RocketChat url '{}' has no host", server))?;
    Ok(match parsed.port() {
        Some(port) => format!("{}://{}:{}/websocket", scheme, host, port),
        None => format!("{}://{}/websocket", scheme, host),
    })
}

pub struct RocketTransport {
    settings: RocketSettings,
    frames: Mutex<Option<mpsc::UnboundedSender<Value>>>,
}

impl RocketTransport {
    pub fn new(settings: RocketSettings) -> Self {
        Self {
            settings,
            frames: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Transport for RocketTransport {
    async fn connect(&self) -> Result<mpsc::Receiver<TransportSignal>> {
        let settings = &self.settings;
        let ws_url = websocket_url(&settings.url)?;

        tracing::info!(name = %settings.name, "Logging in to RocketChat (REST)");
        let rest = RocketRest::new(&settings.url)?;
        let auth = rest.login(&settings.email, &settings.password).await?;

        let mut rooms = rest.list(&auth, "/channels.list", "channels").await?;
        rooms.extend(rest.list(&auth, "/groups.list", "groups").await?);
        let room_ids: Vec<String> = settings
            .channels
            .iter()
            .filter_map(|channel| {
                let name = channel.trim_start_matches('#');
                let found = rooms.iter().find(|(n, _)| n == name).map(|(_, id)| id.clone());
                if found.is_none() {
                    tracing::warn!(channel = %name, "RocketChat channel not found; not subscribing");
                }
                found
            })
            .collect();

        let (tx, rx) = mpsc::channel(256);
        let connected = json!({
            "user_id": auth.user_id,
            "channels": rooms
                .iter()
                .map(|(name, id)| json!({"_id": id, "name": name}))
                .collect::<Vec<_>>(),
        });
        tx.send(TransportSignal::Event(InboundEvent::new("connected", connected)))
            .await
            .map_err(|_| anyhow!("event receiver dropped"))?;

        tracing::info!(url = %ws_url, rooms = room_ids.len(), "Connecting to RocketChat realtime API");
        let frames = realtime::open(&ws_url, &settings.email, &settings.password, &room_ids, tx).await?;
        *self.frames.lock().unwrap_or_else(PoisonError::into_inner) = Some(frames);
        Ok(rx)
    }

    async fn send(&self, target: &str, message: &str) -> Result<()> {
        let frames = self
            .frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| anyhow!("RocketChat is not connected"))?;
        frames
            .send(realtime::send_message_request(target, message))
            .map_err(|_| anyhow!("RocketChat connection closed"))
    }
}

/// Room name/ID maps and the last delivered message ID
#[derive(Debug, Default)]
pub struct RocketRooms {
    c2id: HashMap<String, String>,
    id2c: HashMap<String, String>,
    last_message_id: Option<String>,
}

impl RocketRooms {
    pub fn add(&mut self, name: &str, id: &str) {
        self.c2id.insert(name.to_string(), id.to_string());
        self.id2c.insert(id.to_string(), name.to_string());
    }

    pub fn room_id(&self, name: &str) -> Option<&str> {
        self.c2id.get(name.trim_start_matches('#')).map(String::as_str)
    }

    pub fn room_name(&self, id: &str) -> Option<&str> {
        self.id2c.get(id).map(String::as_str)
    }
}

pub struct RocketBackend {
    base: BackendBase,
    name: String,
    rooms: Arc<RwLock<RocketRooms>>,
}

impl RocketBackend {
    pub fn from_options(
        reader: &OptionReader<'_>,
        common: CommonClientOption,
        logger: Logger,
        coordinator: Arc<Coordinator>,
    ) -> mlua::Result<Self> {
        let required = reader.required(&["url", "name", "email", "password", "channels"])?;
        let settings = RocketSettings {
            url: required[0].clone(),
            name: required[1].clone(),
            email: required[2].clone(),
            password: required[3].clone(),
            channels: reader.list("channels")?,
        };
        websocket_url(&settings.url).map_err(|e| mlua::Error::RuntimeError(format!("{:#}", e)))?;
        let name = settings.name.clone();
        let base = BackendBase::new(
            BackendKind::Rocket,
            common,
            logger,
            coordinator,
            Arc::new(RocketTransport::new(settings)),
        );
        Ok(Self::with_base(base, name))
    }

    pub fn with_base(base: BackendBase, name: impl Into<String>) -> Self {
        Self {
            base,
            name: name.into(),
            rooms: Arc::new(RwLock::new(RocketRooms::default())),
        }
    }

    pub fn rooms(&self) -> &Arc<RwLock<RocketRooms>> {
        &self.rooms
    }

    /// Script-facing message: `{id, channel_id, channel, text, timestamp, user}`
    fn enrich(&self, raw: &Value) -> Value {
        let channel_id = str_field(raw, "rid");
        let channel = self
            .rooms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .room_name(channel_id)
            .unwrap_or("")
            .to_string();
        let user = raw.get("u").cloned().unwrap_or(Value::Null);
        json!({
            "id": str_field(raw, "_id"),
            "channel_id": channel_id,
            "channel": channel,
            "text": str_field(raw, "msg"),
            "timestamp": timestamp(raw),
            "user": {
                "id": str_field(&user, "_id"),
                "username": str_field(&user, "username"),
                "name": str_field(&user, "name"),
            },
        })
    }
}

/// RFC 3339 rendering of the DDP `ts.$date` millisecond stamp
fn timestamp(raw: &Value) -> String {
    raw.pointer("/ts/$date")
        .and_then(Value::as_i64)
        .and_then(chrono::DateTime::from_timestamp_millis)
        .map(|at| at.to_rfc3339())
        .unwrap_or_default()
}

impl ChatBackend for RocketBackend {
    fn base(&self) -> &BackendBase {
        &self.base
    }

    fn resolve_target(&self, target: &str) -> String {
        self.rooms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .room_id(target)
            .map(str::to_string)
            .unwrap_or_else(|| target.to_string())
    }

    fn respond(&self, lua: &Lua, pattern: Regex, function: Function) -> mlua::Result<()> {
        let key = Arc::new(lua.create_registry_value(function)?);
        let name = self.name.clone();
        let mention = Regex::new(&format!(r"@{}\s+", regex::escape(&name)))
            .map_err(|e| mlua::Error::RuntimeError(e.to_string()))?;
        self.base.register(
            "message",
            Arc::new(move |lua: &Lua, payload: &Value| {
                let text = str_field(payload, "text");
                if !mention.is_match(text) {
                    return Ok(());
                }
                let user = payload.get("user").map(|u| str_field(u, "username")).unwrap_or("");
                if user == name {
                    return Ok(());
                }
                let channel = str_field(payload, "channel");
                call_on_match(lua, &key, &pattern, text, || {
                    MessageEvent::new(user, channel, text, payload.clone())
                })
            }),
        );
        Ok(())
    }

    fn observe(&self, event: InboundEvent) -> Option<InboundEvent> {
        match event.event_type.as_str() {
            "connected" => {
                let mut rooms = self.rooms.write().unwrap_or_else(PoisonError::into_inner);
                let channels = event.payload.get("channels").and_then(Value::as_array);
                for channel in channels.into_iter().flatten() {
                    let (name, id) = (str_field(channel, "name"), str_field(channel, "_id"));
                    if !id.is_empty() {
                        self.base.logger().info(format!("{}(id:{})", name, id));
                        rooms.add(name, id);
                    }
                }
                Some(event)
            }
            "message" => {
                let id = str_field(&event.payload, "_id").to_string();
                {
                    let mut rooms = self.rooms.write().unwrap_or_else(PoisonError::into_inner);
                    if !id.is_empty() && rooms.last_message_id.as_deref() == Some(id.as_str()) {
                        return None;
                    }
                    rooms.last_message_id = Some(id);
                }
                let payload = self.enrich(&event.payload);
                Some(InboundEvent::new("message", payload))
            }
            _ => Some(event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_url() {
        assert_eq!(websocket_url("http://localhost:3000").unwrap(), "ws://localhost:3000/websocket");
        assert_eq!(websocket_url("https://chat.example.com/").unwrap(), "wss://chat.example.com/websocket");
        assert!(websocket_url("ftp://chat.example.com").is_err());
        assert!(websocket_url("not a url").is_err());
    }

    #[test]
    fn test_room_lookup_strips_hash() {
        let mut rooms = RocketRooms::default();
        rooms.add("general", "GENERAL");
        assert_eq!(rooms.room_id("#general"), Some("GENERAL"));
        assert_eq!(rooms.room_id("general"), Some("GENERAL"));
        assert_eq!(rooms.room_name("GENERAL"), Some("general"));
        assert_eq!(rooms.room_id("random"), None);
    }

    #[test]
    fn test_timestamp_from_date_millis() {
        let raw = json!({"ts": {"$date": 1_700_000_000_000i64}});
        assert_eq!(timestamp(&raw), "2023-11-14T22:13:20+00:00");
        assert_eq!(timestamp(&json!({})), "");
    }
}
