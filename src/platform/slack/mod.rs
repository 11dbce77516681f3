// ABOUTME: Slack backend: name/ID directory, message filtering and target resolution
// ABOUTME: The directory is filled from the connected event and kept current from channel events

#[cfg(feature = "slack")]
pub mod transport;

use luabot_core::config::{BackendKind, CommonClientOption};
use luabot_core::coord::Coordinator;
use luabot_core::event::{InboundEvent, MessageEvent};
use luabot_core::log_relay::Logger;
use mlua::{Function, Lua};
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use super::options::OptionReader;
use super::{call_on_match, str_field, BackendBase, ChatBackend};

/// Messages stamped earlier than this after serve starts are replays
const STARTUP_GRACE_SECS: f64 = 3.0;

/// Channel, DM, group and user IDs: a type letter followed by upper-case alphanumerics
fn looks_like_id(target: &str) -> bool {
    let mut chars = target.chars();
    matches!(chars.next(), Some('C' | 'D' | 'G' | 'U'))
        && target.len() >= 3
        && chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
}

/// Bidirectional channel and user name caches plus the bot's own ID
#[derive(Debug, Default)]
pub struct SlackDirectory {
    pub self_id: String,
    channel_ids: HashMap<String, String>,
    channel_names: HashMap<String, String>,
    user_ids: HashMap<String, String>,
    user_names: HashMap<String, String>,
}

impl SlackDirectory {
    pub fn add_channel(&mut self, id: &str, name: &str) {
        self.channel_ids.insert(name.to_string(), id.to_string());
        self.channel_names.insert(id.to_string(), name.to_string());
    }

    pub fn rename_channel(&mut self, id: &str, name: &str) {
        if let Some(old) = self.channel_names.get(id).cloned() {
            self.channel_ids.remove(&old);
        }
        self.add_channel(id, name);
    }

    pub fn remove_channel(&mut self, id: &str) {
        if let Some(old) = self.channel_names.remove(id) {
            self.channel_ids.remove(&old);
        }
    }

    pub fn add_user(&mut self, id: &str, name: &str) {
        self.user_ids.insert(name.to_string(), id.to_string());
        self.user_names.insert(id.to_string(), name.to_string());
    }

    pub fn channel_name(&self, id: &str) -> Option<&str> {
        self.channel_names.get(id).map(String::as_str)
    }

    pub fn user_name(&self, id: &str) -> Option<&str> {
        self.user_names.get(id).map(String::as_str)
    }

    /// IDs pass through; `#name` is looked up as a channel, anything else as
    /// a user; unknown names are returned unchanged
    pub fn resolve(&self, target: &str) -> String {
        if looks_like_id(target) {
            return target.to_string();
        }
        if let Some(name) = target.strip_prefix('#') {
            if let Some(id) = self.channel_ids.get(name) {
                return id.clone();
            }
        }
        self.user_ids
            .get(target)
            .cloned()
            .unwrap_or_else(|| target.to_string())
    }

    /// Load the `connected` payload
    pub fn load(&mut self, connected: &Value) {
        if let Some(id) = connected.pointer("/self/id").and_then(Value::as_str) {
            self.self_id = id.to_string();
        }
        for (field, is_channel) in [("channels", true), ("users", false)] {
            let Some(items) = connected.get(field).and_then(Value::as_array) else {
                continue;
            };
            for item in items {
                let (id, name) = (str_field(item, "id"), str_field(item, "name"));
                if id.is_empty() {
                    continue;
                }
                if is_channel {
                    self.add_channel(id, name);
                } else {
                    self.add_user(id, name);
                }
            }
        }
    }
}

pub struct SlackBackend {
    base: BackendBase,
    directory: Arc<RwLock<SlackDirectory>>,
    started_at: Mutex<Option<f64>>,
}

impl SlackBackend {
    pub fn from_options(
        reader: &OptionReader<'_>,
        common: CommonClientOption,
        logger: Logger,
        coordinator: Arc<Coordinator>,
    ) -> mlua::Result<Self> {
        let required = reader.required(&["token", "app_token"])?;
        let transport = Self::transport(&required[0], &required[1])?;
        Ok(Self::with_base(BackendBase::new(
            BackendKind::Slack,
            common,
            logger,
            coordinator,
            transport,
        )))
    }

    #[cfg(feature = "slack")]
    fn transport(token: &str, app_token: &str) -> mlua::Result<Arc<dyn super::Transport>> {
        let transport = transport::SlackTransport::new(token, app_token)
            .map_err(|e| mlua::Error::RuntimeError(format!("{:#}", e)))?;
        Ok(Arc::new(transport))
    }

    #[cfg(not(feature = "slack"))]
    fn transport(_token: &str, _app_token: &str) -> mlua::Result<Arc<dyn super::Transport>> {
        Err(mlua::Error::RuntimeError(
            "Slack support was not compiled in (enable the 'slack' feature)".to_string(),
        ))
    }

    pub fn with_base(base: BackendBase) -> Self {
        Self {
            base,
            directory: Arc::new(RwLock::new(SlackDirectory::default())),
            started_at: Mutex::new(None),
        }
    }

    pub fn directory(&self) -> &Arc<RwLock<SlackDirectory>> {
        &self.directory
    }

    /// Start the replay grace window at `at` (seconds since the epoch)
    pub fn mark_started(&self, at: f64) {
        *self.started_at.lock().unwrap_or_else(PoisonError::into_inner) = Some(at);
    }

    fn within_grace(&self, payload: &Value) -> bool {
        let Some(started) = *self.started_at.lock().unwrap_or_else(PoisonError::into_inner) else {
            return false;
        };
        match str_field(payload, "ts").parse::<f64>() {
            Ok(ts) => ts - started < STARTUP_GRACE_SECS,
            Err(_) => false,
        }
    }
}

impl ChatBackend for SlackBackend {
    fn base(&self) -> &BackendBase {
        &self.base
    }

    fn resolve_target(&self, target: &str) -> String {
        self.directory
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .resolve(target)
    }

    fn respond(&self, lua: &Lua, pattern: Regex, function: Function) -> mlua::Result<()> {
        let key = Arc::new(lua.create_registry_value(function)?);
        let directory = self.directory.clone();
        self.base.register(
            "message",
            Arc::new(move |lua: &Lua, payload: &Value| {
                let subtype = str_field(payload, "subtype");
                if !(subtype.is_empty() || subtype == "me_message") {
                    return Ok(());
                }
                let (from, target) = {
                    let directory = directory.read().unwrap_or_else(PoisonError::into_inner);
                    let user = str_field(payload, "user");
                    if user == directory.self_id {
                        return Ok(());
                    }
                    let channel = str_field(payload, "channel");
                    let from = directory.user_name(user).unwrap_or(user).to_string();
                    let target = match directory.channel_name(channel) {
                        Some(name) => format!("#{}", name),
                        None => channel.to_string(),
                    };
                    (from, target)
                };
                let text = str_field(payload, "text");
                call_on_match(lua, &key, &pattern, text, || {
                    MessageEvent::new(from, target, text, payload.clone())
                })
            }),
        );
        Ok(())
    }

    fn on_serve_start(&self) {
        self.mark_started(chrono::Utc::now().timestamp() as f64);
    }

    fn observe(&self, event: InboundEvent) -> Option<InboundEvent> {
        if event.event_type == "message" {
            return (!self.within_grace(&event.payload)).then_some(event);
        }
        let logger = self.base.logger();
        let mut directory = self.directory.write().unwrap_or_else(PoisonError::into_inner);
        match event.event_type.as_str() {
            "connected" => {
                directory.load(&event.payload);
                let channels: Vec<&str> = event
                    .payload
                    .get("channels")
                    .and_then(Value::as_array)
                    .map(|cs| cs.iter().map(|c| str_field(c, "name")).collect())
                    .unwrap_or_default();
                logger.info(format!(
                    "Connected to {} (channels: {})",
                    str_field(&event.payload, "team"),
                    channels.join(",")
                ));
            }
            "channel_created" => {
                let channel = event.payload.get("channel").cloned().unwrap_or(Value::Null);
                let (id, name) = (str_field(&channel, "id"), str_field(&channel, "name"));
                logger.info(format!("Channel created: {} (ID:{})", name, id));
                directory.add_channel(id, name);
            }
            "channel_rename" => {
                let channel = event.payload.get("channel").cloned().unwrap_or(Value::Null);
                let (id, name) = (str_field(&channel, "id"), str_field(&channel, "name"));
                logger.info(format!(
                    "Channel renamed: ID:{} {} -> {}",
                    id,
                    directory.channel_name(id).unwrap_or(""),
                    name
                ));
                directory.rename_channel(id, name);
            }
            "channel_deleted" => {
                let id = str_field(&event.payload, "channel").to_string();
                logger.info(format!(
                    "Channel deleted: {} (ID:{})",
                    directory.channel_name(&id).unwrap_or(""),
                    id
                ));
                directory.remove_channel(&id);
            }
            _ => {}
        }
        Some(event)
    }
}
