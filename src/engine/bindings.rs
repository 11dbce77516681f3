// ABOUTME: Globals and the `luabot` module installed into every engine
// ABOUTME: Coordination calls (notify/request/respond), goworker, newbot and newlogger

use luabot_core::coord::{CoordError, Lane};
use luabot_core::log_relay::Logger;
use mlua::{AnyUserData, Lua, MultiValue, Table, Value as LuaValue};
use std::sync::Arc;

use super::bot;
use super::convert::{json_to_lua, lua_to_json, REPLY_KEY};
use super::userdata::{LuaLogger, LuaReply};
use super::{EngineFactory, Purpose};
use crate::logging::resolve_log_option;
use crate::worker;

pub fn install(lua: &Lua, factory: &Arc<EngineFactory>, purpose: Purpose, engine_id: &str) -> mlua::Result<()> {
    install_coordination(lua, factory, purpose)?;
    install_worker(lua, factory)?;

    let module = lua.create_table()?;
    module.set("purpose", purpose.as_str())?;
    module.set("engine_id", engine_id)?;

    let f = factory.clone();
    module.set(
        "newbot",
        lua.create_function(move |lua, (kind, options): (String, Option<Table>)| {
            bot::new_bot(lua, &f, purpose, &kind, options)
        })?,
    )?;

    let f = factory.clone();
    module.set(
        "newlogger",
        lua.create_function(move |lua, config: LuaValue| {
            let resolved = resolve_log_option(lua, config, false).map_err(mlua::Error::external)?;
            let logger = Logger::new(resolved.sink, f.relay().clone()).with_origin(purpose.as_str());
            Ok(LuaLogger(logger))
        })?,
    )?;

    register_module(lua, "luabot", module)
}

/// Make `require(name)` return `module`
pub fn register_module(lua: &Lua, name: &str, module: Table) -> mlua::Result<()> {
    let loaded: Table = lua
        .globals()
        .get::<Table>("package")?
        .get("loaded")?;
    loaded.set(name, module)
}

fn install_coordination(lua: &Lua, factory: &Arc<EngineFactory>, purpose: Purpose) -> mlua::Result<()> {
    let globals = lua.globals();

    for (name, lane) in [("notifymain", Lane::Main), ("notifyworker", Lane::Worker)] {
        let coordinator = factory.coordinator().clone();
        globals.set(
            name,
            lua.create_function(move |_, value: LuaValue| {
                let payload = lua_to_json(&value)?;
                coordinator
                    .blocking_notify(lane, payload)
                    .map_err(mlua::Error::external)
            })?,
        )?;
    }

    for (name, lane) in [("requestmain", Lane::Main), ("requestworker", Lane::Worker)] {
        let coordinator = factory.coordinator().clone();
        globals.set(
            name,
            lua.create_function(move |lua, value: LuaValue| {
                if !matches!(value, LuaValue::Table(_)) {
                    return Err(mlua::Error::RuntimeError(format!(
                        "{} expects a table, got {}",
                        name,
                        value.type_name()
                    )));
                }
                // The main engine drains the main lane itself; waiting on it here never returns
                if lane == Lane::Main && purpose.is_main() {
                    return Err(mlua::Error::RuntimeError(
                        "requestmain cannot be called from the main engine".to_string(),
                    ));
                }
                let payload = lua_to_json(&value)?;
                match coordinator.blocking_request(lane, payload) {
                    Ok(reply) => Ok((true, json_to_lua(lua, &reply)?)),
                    Err(CoordError::ReplyDropped(_)) => Ok((false, LuaValue::Nil)),
                    Err(e) => Err(mlua::Error::external(e)),
                }
            })?,
        )?;
    }

    globals.set(
        "respond",
        lua.create_function(|_, (message, value): (LuaValue, LuaValue)| {
            let LuaValue::Table(message) = message else {
                return Ok(false);
            };
            let Some(slot) = message.raw_get::<Option<AnyUserData>>(REPLY_KEY)? else {
                return Ok(false);
            };
            let reply = slot.borrow::<LuaReply>()?;
            Ok(reply.0.send(lua_to_json(&value)?))
        })?,
    )?;

    Ok(())
}

fn install_worker(lua: &Lua, factory: &Arc<EngineFactory>) -> mlua::Result<()> {
    let f = factory.clone();
    lua.globals().set(
        "goworker",
        lua.create_function(move |_, args: MultiValue| {
            let value = args.into_iter().next().unwrap_or(LuaValue::Nil);
            let payload = lua_to_json(&value)?;
            worker::dispatch(&f, payload).map_err(|e| mlua::Error::RuntimeError(format!("{:#}", e)))
        })?,
    )
}
