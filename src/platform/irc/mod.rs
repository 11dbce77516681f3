// ABOUTME: IRC backend: PRIVMSG matching with own-nick suppression
// ABOUTME: Tracks the nick the server actually assigned so echoes are still recognised after a rename

pub mod transport;

pub use transport::{IrcLine, IrcSettings, IrcTransport};

use luabot_core::config::{BackendKind, CommonClientOption};
use luabot_core::coord::Coordinator;
use luabot_core::event::{InboundEvent, MessageEvent};
use luabot_core::log_relay::Logger;
use mlua::{Function, Lua};
use regex::Regex;
use serde_json::Value;
use std::sync::{Arc, PoisonError, RwLock};

use super::options::OptionReader;
use super::{call_on_match, payload_handler, str_field, BackendBase, ChatBackend};

pub const DEFAULT_CONN: &str = "127.0.0.1:6667";

pub struct IrcBackend {
    base: BackendBase,
    nick: Arc<RwLock<String>>,
}

impl IrcBackend {
    pub fn from_options(
        reader: &OptionReader<'_>,
        common: CommonClientOption,
        logger: Logger,
        coordinator: Arc<Coordinator>,
    ) -> mlua::Result<Self> {
        let required = reader.required(&["nickname", "username"])?;
        let (server, channels) = IrcSettings::parse_conn(&reader.string_or("conn", DEFAULT_CONN)?);
        let settings = IrcSettings {
            server,
            channels,
            nickname: required[0].clone(),
            username: required[1].clone(),
            password: reader.string("password")?,
            use_tls: reader.flag("useTLS")?,
        };
        Ok(Self::new(settings, common, logger, coordinator))
    }

    pub fn new(settings: IrcSettings, common: CommonClientOption, logger: Logger, coordinator: Arc<Coordinator>) -> Self {
        let nick = Arc::new(RwLock::new(settings.nickname.clone()));
        Self {
            base: BackendBase::new(
                BackendKind::Irc,
                common,
                logger,
                coordinator,
                Arc::new(IrcTransport::new(settings)),
            ),
            nick,
        }
    }

    /// Swap the transport, keeping identity; used to run against scripted connections
    pub fn with_base(base: BackendBase, nickname: &str) -> Self {
        Self {
            base,
            nick: Arc::new(RwLock::new(nickname.to_string())),
        }
    }

    pub fn current_nick(&self) -> String {
        self.nick.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl ChatBackend for IrcBackend {
    fn base(&self) -> &BackendBase {
        &self.base
    }

    fn on(&self, lua: &Lua, event_type: &str, function: Function) -> mlua::Result<()> {
        // Numerics and commands are matched case-insensitively
        self.base
            .register(event_type.to_ascii_uppercase(), payload_handler(lua, function)?);
        Ok(())
    }

    fn respond(&self, lua: &Lua, pattern: Regex, function: Function) -> mlua::Result<()> {
        let key = Arc::new(lua.create_registry_value(function)?);
        let nick = self.nick.clone();
        self.base.register(
            "PRIVMSG",
            Arc::new(move |lua: &Lua, payload: &Value| {
                let own = nick.read().unwrap_or_else(PoisonError::into_inner).clone();
                let sender = str_field(payload, "nick");
                if sender.eq_ignore_ascii_case(&own) {
                    return Ok(());
                }
                let text = str_field(payload, "message");
                call_on_match(lua, &key, &pattern, text, || {
                    let first = payload
                        .get("arguments")
                        .and_then(|a| a.get(0))
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    // A private message is answered to its sender
                    let target = if first.eq_ignore_ascii_case(&own) { sender } else { first };
                    MessageEvent::new(sender, target, text, payload.clone())
                })
            }),
        );
        Ok(())
    }

    fn observe(&self, event: InboundEvent) -> Option<InboundEvent> {
        match event.event_type.as_str() {
            "001" => {
                if let Some(assigned) = event
                    .payload
                    .get("arguments")
                    .and_then(|a| a.get(0))
                    .and_then(Value::as_str)
                {
                    *self.nick.write().unwrap_or_else(PoisonError::into_inner) = assigned.to_string();
                }
            }
            "NICK" => {
                let mut nick = self.nick.write().unwrap_or_else(PoisonError::into_inner);
                if str_field(&event.payload, "nick").eq_ignore_ascii_case(&nick) {
                    *nick = str_field(&event.payload, "message").to_string();
                }
            }
            _ => {}
        }
        Some(event)
    }
}
