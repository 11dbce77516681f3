// ABOUTME: The bot handle returned by luabot.newbot
// ABOUTME: Wraps a backend; only the main engine may serve it, other engines get a detached handle

use luabot_core::config::BackendKind;
use mlua::{Function, Lua, Table, UserData, UserDataFields, UserDataMethods};
use regex::Regex;
use std::sync::Arc;

use super::userdata::LuaLogger;
use super::{EngineFactory, Purpose};
use crate::logging::resolve_log_option;
use crate::platform::{self, options::common_option, ChatBackend};
use crate::services;

pub struct LuaBot {
    backend: Arc<dyn ChatBackend>,
    factory: Arc<EngineFactory>,
    purpose: Purpose,
}

impl LuaBot {
    pub fn backend(&self) -> &Arc<dyn ChatBackend> {
        &self.backend
    }

    fn serve(&self, lua: &Lua, handler: Option<Function>) -> mlua::Result<()> {
        if !self.purpose.is_main() {
            return Err(mlua::Error::RuntimeError(format!(
                "serve is only available in the main engine (this is a {} engine)",
                self.purpose
            )));
        }
        let logger = self.backend.logger();
        services::start(&self.factory, self.backend.common_option(), &logger)
            .map_err(|e| mlua::Error::RuntimeError(format!("{:#}", e)))?;
        self.backend
            .serve(lua, handler)
            .map_err(|e| mlua::Error::RuntimeError(format!("{:#}", e)))
    }
}

impl UserData for LuaBot {
    fn add_fields<F: UserDataFields<Self>>(fields: &mut F) {
        fields.add_field_method_get("kind", |_, this| Ok(this.backend.kind().as_str()));
        fields.add_field_method_get("logger", |_, this| Ok(LuaLogger(this.backend.logger())));
    }

    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("say", |_, this, (target, message): (String, String)| {
            if this.purpose.is_main() {
                this.backend.say(&target, &message);
            } else {
                this.backend.logger().warn(format!(
                    "say from a {} engine is dropped; use notifymain instead",
                    this.purpose
                ));
            }
            Ok(())
        });

        methods.add_method("on", |lua, this, (event_type, function): (String, Function)| {
            this.backend.on(lua, &event_type, function)
        });

        methods.add_method("respond", |lua, this, (pattern, function): (String, Function)| {
            let pattern = Regex::new(&pattern)
                .map_err(|e| mlua::Error::RuntimeError(format!("invalid pattern '{}': {}", pattern, e)))?;
            this.backend.respond(lua, pattern, function)
        });

        methods.add_method("serve", |lua, this, handler: Option<Function>| this.serve(lua, handler));

        methods.add_method("quit", |_, this, ()| {
            this.backend.quit();
            Ok(())
        });
    }
}

/// `luabot.newbot(kind, options)`
pub fn new_bot(
    lua: &Lua,
    factory: &Arc<EngineFactory>,
    purpose: Purpose,
    kind: &str,
    options: Option<Table>,
) -> mlua::Result<LuaBot> {
    let kind: BackendKind = kind.parse().map_err(mlua::Error::external)?;
    let options = match options {
        Some(options) => options,
        None => lua.create_table()?,
    };

    let resolved = resolve_log_option(lua, options.get("log")?, purpose.is_main())
        .map_err(|e| mlua::Error::RuntimeError(format!("invalid log option: {:#}", e)))?;
    let logger = if purpose.is_main() {
        let logger = luabot_core::log_relay::Logger::new(resolved.sink, factory.relay().clone())
            .with_origin(purpose.as_str());
        factory.set_root_logger(logger.clone());
        logger
    } else {
        factory.logger().with_origin(purpose.as_str())
    };

    let mut common = common_option(factory.script(), &options)?;
    common.logger = Some(logger.clone());

    let backend = platform::build(kind, &options, common, logger, factory.coordinator().clone())?;
    if let Some(queue) = resolved.script_queue {
        backend.base().set_script_log(queue);
    }
    tracing::debug!(backend = %kind, purpose = %purpose, "Bot created");

    Ok(LuaBot {
        backend,
        factory: factory.clone(),
        purpose,
    })
}
