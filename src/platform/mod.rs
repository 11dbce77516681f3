// ABOUTME: Chat backend abstraction shared by IRC, Slack, Hipchat, Rocket and Null
// ABOUTME: Backends filter and normalize transport events, then dispatch to script handlers

pub mod base;
pub mod hipchat;
pub mod irc;
pub mod null;
pub mod options;
pub mod rocket;
pub mod slack;
pub mod tls;

pub use base::{BackendBase, Outgoing};

use anyhow::Result;
use async_trait::async_trait;
use luabot_core::config::{BackendKind, CommonClientOption};
use luabot_core::coord::Coordinator;
use luabot_core::event::{InboundEvent, MessageEvent, TransportSignal};
use luabot_core::log_relay::Logger;
use mlua::{Function, Lua, RegistryKey, Table};
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::engine::convert::json_to_lua;
use crate::engine::userdata::LuaMessageEvent;
use options::OptionReader;

/// Registered handler. Holds only a registry key, so the engine is passed
/// in at dispatch time and never owned by the backend.
pub type EventHandler = Arc<dyn Fn(&Lua, &Value) -> mlua::Result<()> + Send + Sync>;

/// Wire connection behind a backend.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Log in, subscribe and start reading. Events arrive on the returned
    /// receiver until the connection drops.
    async fn connect(&self) -> Result<mpsc::Receiver<TransportSignal>>;

    /// Deliver one message to a backend-native target
    async fn send(&self, target: &str, message: &str) -> Result<()>;
}

/// One chat network connection as scripts see it.
pub trait ChatBackend: Send + Sync {
    fn base(&self) -> &BackendBase;

    fn kind(&self) -> BackendKind {
        self.base().kind()
    }

    fn logger(&self) -> Logger {
        self.base().logger().clone()
    }

    fn common_option(&self) -> &CommonClientOption {
        self.base().common_option()
    }

    /// Translate a logical target (channel name, user name) into what the
    /// transport expects
    fn resolve_target(&self, target: &str) -> String {
        target.to_string()
    }

    /// Queue a message; delivered in order once the serve loop runs
    fn say(&self, target: &str, message: &str) {
        self.base().queue(self.resolve_target(target), message);
    }

    /// Register a raw handler for a backend event type
    fn on(&self, lua: &Lua, event_type: &str, function: Function) -> mlua::Result<()> {
        self.base().register(event_type, payload_handler(lua, function)?);
        Ok(())
    }

    /// Register a handler for messages matching `pattern` that pass the
    /// backend's self-authorship filter
    fn respond(&self, lua: &Lua, pattern: Regex, function: Function) -> mlua::Result<()>;

    /// Update backend state from an event before dispatch. Returning None
    /// suppresses the event.
    fn observe(&self, event: InboundEvent) -> Option<InboundEvent> {
        Some(event)
    }

    fn on_serve_start(&self) {}

    /// Observe then dispatch one event. Returns the number of handlers that failed.
    fn handle_event(&self, lua: &Lua, event: InboundEvent) -> usize {
        match self.observe(event) {
            Some(event) => self.base().dispatch(lua, &event),
            None => 0,
        }
    }

    /// Connect and run the event loop until `quit`
    fn serve(&self, lua: &Lua, main_handler: Option<Function>) -> Result<()> {
        base::serve(self, lua, main_handler)
    }

    fn quit(&self) {
        self.base().quit();
    }
}

/// Build the backend for `kind` from the newbot options table
pub fn build(
    kind: BackendKind,
    table: &Table,
    common: CommonClientOption,
    logger: Logger,
    coordinator: Arc<Coordinator>,
) -> mlua::Result<Arc<dyn ChatBackend>> {
    let reader = OptionReader::new(kind, table);
    let backend: Arc<dyn ChatBackend> = match kind {
        BackendKind::Irc => Arc::new(irc::IrcBackend::from_options(&reader, common, logger, coordinator)?),
        BackendKind::Slack => Arc::new(slack::SlackBackend::from_options(&reader, common, logger, coordinator)?),
        BackendKind::Hipchat => Arc::new(hipchat::HipchatBackend::from_options(&reader, common, logger, coordinator)?),
        BackendKind::Rocket => Arc::new(rocket::RocketBackend::from_options(&reader, common, logger, coordinator)?),
        BackendKind::Null => Arc::new(null::NullBackend::new(common, logger, coordinator)),
    };
    Ok(backend)
}

/// Handler that passes the event payload to `function` as a Lua value
pub fn payload_handler(lua: &Lua, function: Function) -> mlua::Result<EventHandler> {
    let key = Arc::new(lua.create_registry_value(function)?);
    Ok(Arc::new(move |lua: &Lua, payload: &Value| {
        let function: Function = lua.registry_value(&key)?;
        function.call::<()>(json_to_lua(lua, payload)?)
    }))
}

/// Match `text` against `pattern` and, on a hit, call the stored function with
/// the match table (index 1 is the whole match) and the message event
pub fn call_on_match(
    lua: &Lua,
    key: &RegistryKey,
    pattern: &Regex,
    text: &str,
    event: impl FnOnce() -> MessageEvent,
) -> mlua::Result<()> {
    let Some(captures) = pattern.captures(text) else {
        return Ok(());
    };
    let matches = lua.create_table_with_capacity(captures.len(), 0)?;
    for (i, group) in captures.iter().enumerate() {
        matches.raw_set(i + 1, group.map(|m| m.as_str()).unwrap_or(""))?;
    }
    let function: Function = lua.registry_value(key)?;
    function.call::<()>((matches, LuaMessageEvent(event())))
}

/// String field of a JSON payload, empty when absent
pub(crate) fn str_field<'a>(payload: &'a Value, key: &str) -> &'a str {
    payload.get(key).and_then(Value::as_str).unwrap_or("")
}
