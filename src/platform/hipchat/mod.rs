// ABOUTME: Hipchat backend: responds only when mentioned, never to its own messages
// ABOUTME: Learns its display and mention names from the roster on connect

pub mod xmpp;

pub use xmpp::{XmppSettings, XmppTransport};

use luabot_core::config::{BackendKind, CommonClientOption};
use luabot_core::coord::Coordinator;
use luabot_core::event::{InboundEvent, MessageEvent};
use luabot_core::log_relay::Logger;
use mlua::{Function, Lua};
use regex::Regex;
use serde_json::Value;
use std::sync::{Arc, PoisonError, RwLock};

use super::options::OptionReader;
use super::{call_on_match, str_field, BackendBase, ChatBackend};

/// Names the server knows the bot by, with the mention pattern compiled once
#[derive(Debug, Clone, Default)]
pub struct HipchatIdentity {
    pub name: String,
    pub mention_name: String,
    mention: Option<Regex>,
}

impl HipchatIdentity {
    pub fn new(name: impl Into<String>, mention_name: impl Into<String>) -> Self {
        let mention_name = mention_name.into();
        let mention = (!mention_name.is_empty())
            .then(|| Regex::new(&format!(r"@{}\s+", regex::escape(&mention_name))).ok())
            .flatten();
        Self {
            name: name.into(),
            mention_name,
            mention,
        }
    }

    /// True when `body` contains `@mention_name` followed by whitespace
    pub fn is_mentioned_in(&self, body: &str) -> bool {
        self.mention.as_ref().is_some_and(|re| re.is_match(body))
    }
}

pub struct HipchatBackend {
    base: BackendBase,
    identity: Arc<RwLock<HipchatIdentity>>,
}

impl HipchatBackend {
    pub fn from_options(
        reader: &OptionReader<'_>,
        common: CommonClientOption,
        logger: Logger,
        coordinator: Arc<Coordinator>,
    ) -> mlua::Result<Self> {
        let required = reader.required(&["user", "password"])?;
        let settings = XmppSettings {
            user: required[0].clone(),
            password: required[1].clone(),
            host: reader.string_or("host", "chat.hipchat.com")?,
            conf: reader.string_or("conf", "conf.hipchat.com")?,
            resource: reader.string_or("resource", "bot")?,
            auth_type: reader.string_or("auth_type", "plain")?,
            room_jids: reader.list("room_jids")?,
        };
        let base = BackendBase::new(
            BackendKind::Hipchat,
            common,
            logger,
            coordinator,
            Arc::new(XmppTransport::new(settings)),
        );
        Ok(Self::with_base(base))
    }

    pub fn with_base(base: BackendBase) -> Self {
        Self {
            base,
            identity: Arc::new(RwLock::new(HipchatIdentity::default())),
        }
    }

    pub fn identity(&self) -> HipchatIdentity {
        self.identity.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl ChatBackend for HipchatBackend {
    fn base(&self) -> &BackendBase {
        &self.base
    }

    fn respond(&self, lua: &Lua, pattern: Regex, function: Function) -> mlua::Result<()> {
        let key = Arc::new(lua.create_registry_value(function)?);
        let identity = self.identity.clone();
        self.base.register(
            "message",
            Arc::new(move |lua: &Lua, payload: &Value| {
                let body = str_field(payload, "body");
                let Some((room, user)) = str_field(payload, "from").split_once('/') else {
                    return Ok(());
                };
                {
                    let identity = identity.read().unwrap_or_else(PoisonError::into_inner);
                    if !identity.is_mentioned_in(body) || user == identity.name {
                        return Ok(());
                    }
                }
                call_on_match(lua, &key, &pattern, body, || {
                    MessageEvent::new(user, room, body, payload.clone())
                })
            }),
        );
        Ok(())
    }

    fn observe(&self, event: InboundEvent) -> Option<InboundEvent> {
        if event.event_type == "connected" {
            let identity = HipchatIdentity::new(
                str_field(&event.payload, "name"),
                str_field(&event.payload, "mention_name"),
            );
            self.base.logger().info(format!(
                "name={}, mention name={}",
                identity.name, identity.mention_name
            ));
            *self.identity.write().unwrap_or_else(PoisonError::into_inner) = identity;
        }
        Some(event)
    }
}
