// ABOUTME: Native types exposed to scripts, each with an explicit field and method table
// ABOUTME: Reply slots, message events and loggers as Lua userdata

use luabot_core::coord::ReplyHandle;
use luabot_core::event::MessageEvent;
use luabot_core::log_relay::{LogLevel, Logger};
use mlua::{MultiValue, UserData, UserDataFields, UserDataMethods};

use super::convert::json_to_lua;

/// Reply slot of a received request, stored in the message table as `_result`
pub struct LuaReply(pub ReplyHandle);

impl UserData for LuaReply {
    fn add_fields<F: UserDataFields<Self>>(fields: &mut F) {
        fields.add_field_method_get("pending", |_, this| Ok(!this.0.is_spent()));
    }
}

/// Read-only view of a matched message
pub struct LuaMessageEvent(pub MessageEvent);

impl UserData for LuaMessageEvent {
    fn add_fields<F: UserDataFields<Self>>(fields: &mut F) {
        fields.add_field_method_get("from", |_, this| Ok(this.0.from.clone()));
        fields.add_field_method_get("target", |_, this| Ok(this.0.target.clone()));
        fields.add_field_method_get("message", |_, this| Ok(this.0.message.clone()));
        fields.add_field_method_get("raw", |lua, this| json_to_lua(lua, &this.0.raw));
    }
}

pub struct LuaLogger(pub Logger);

impl LuaLogger {
    fn write(&self, level: LogLevel, message: String) {
        self.0.log(level, message);
    }
}

impl UserData for LuaLogger {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("debug", |_, this, message: String| {
            this.write(LogLevel::Debug, message);
            Ok(())
        });
        methods.add_method("info", |_, this, message: String| {
            this.write(LogLevel::Info, message);
            Ok(())
        });
        methods.add_method("warn", |_, this, message: String| {
            this.write(LogLevel::Warn, message);
            Ok(())
        });
        methods.add_method("error", |_, this, message: String| {
            this.write(LogLevel::Error, message);
            Ok(())
        });
        // logger:printf(fmt, ...) formats with string.format and logs at info
        methods.add_method("printf", |lua, this, args: MultiValue| {
            let format: mlua::Function = lua
                .globals()
                .get::<mlua::Table>("string")?
                .get("format")?;
            let line: String = format.call(args)?;
            this.write(LogLevel::Info, line);
            Ok(())
        });
    }
}
