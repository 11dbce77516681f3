// ABOUTME: Conversions between Lua values and JSON values crossing engine boundaries
// ABOUTME: Lane payloads are self-contained JSON, so nothing engine-owned leaks between engines

use luabot_core::coord::CoordMessage;
use mlua::{Lua, Table, Value as LuaValue};
use serde_json::{Map, Number, Value};

use super::userdata::LuaReply;

/// Key under which a received request carries its reply slot
pub const REPLY_KEY: &str = "_result";

const MAX_DEPTH: usize = 64;

/// Convert a Lua value to JSON. Functions, userdata, threads and the reply
/// slot are dropped from tables. A table whose keys are exactly 1..n becomes
/// an array; any other non-empty table becomes an object.
pub fn lua_to_json(value: &LuaValue) -> mlua::Result<Value> {
    Ok(convert_value(value, 0)?.unwrap_or(Value::Null))
}

fn convert_value(value: &LuaValue, depth: usize) -> mlua::Result<Option<Value>> {
    if depth > MAX_DEPTH {
        return Err(mlua::Error::RuntimeError(
            "value nested too deeply (cyclic table?)".to_string(),
        ));
    }
    let converted = match value {
        LuaValue::Nil => Value::Null,
        LuaValue::Boolean(b) => Value::Bool(*b),
        LuaValue::Integer(i) => Value::from(*i),
        LuaValue::Number(n) => Number::from_f64(*n).map(Value::Number).unwrap_or(Value::Null),
        LuaValue::String(s) => Value::String(s.to_string_lossy().to_string()),
        LuaValue::Table(t) => convert_table(t, depth)?,
        _ => return Ok(None),
    };
    Ok(Some(converted))
}

fn convert_table(table: &Table, depth: usize) -> mlua::Result<Value> {
    let len = table.raw_len();
    let mut entries = Vec::new();
    for pair in table.clone().pairs::<LuaValue, LuaValue>() {
        let (key, value) = pair?;
        entries.push((key, value));
    }

    if len > 0 && entries.len() == len {
        let mut items = vec![Value::Null; len];
        for (key, value) in &entries {
            if let LuaValue::Integer(i) = key {
                if *i >= 1 && (*i as usize) <= len {
                    items[*i as usize - 1] = convert_value(value, depth + 1)?.unwrap_or(Value::Null);
                }
            }
        }
        return Ok(Value::Array(items));
    }

    let mut object = Map::new();
    for (key, value) in &entries {
        let key = match key {
            LuaValue::String(s) => s.to_string_lossy().to_string(),
            LuaValue::Integer(i) => i.to_string(),
            LuaValue::Number(n) => n.to_string(),
            LuaValue::Boolean(b) => b.to_string(),
            _ => continue,
        };
        if key == REPLY_KEY {
            continue;
        }
        if let Some(v) = convert_value(value, depth + 1)? {
            object.insert(key, v);
        }
    }
    Ok(Value::Object(object))
}

/// Convert JSON to a fresh Lua value owned by `lua`
pub fn json_to_lua(lua: &Lua, value: &Value) -> mlua::Result<LuaValue> {
    Ok(match value {
        Value::Null => LuaValue::Nil,
        Value::Bool(b) => LuaValue::Boolean(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => LuaValue::Integer(i),
            None => LuaValue::Number(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => LuaValue::String(lua.create_string(s)?),
        Value::Array(items) => {
            let table = lua.create_table_with_capacity(items.len(), 0)?;
            for (i, item) in items.iter().enumerate() {
                table.raw_set(i + 1, json_to_lua(lua, item)?)?;
            }
            LuaValue::Table(table)
        }
        Value::Object(map) => {
            let table = lua.create_table_with_capacity(0, map.len())?;
            for (key, item) in map {
                table.raw_set(key.as_str(), json_to_lua(lua, item)?)?;
            }
            LuaValue::Table(table)
        }
    })
}

/// Materialize a lane message in `lua`. Requests arrive as tables carrying
/// their reply slot under `_result` so the script can `respond` to them.
pub fn message_to_lua(lua: &Lua, message: &CoordMessage) -> mlua::Result<LuaValue> {
    let value = json_to_lua(lua, &message.payload)?;
    if let (LuaValue::Table(table), Some(reply)) = (&value, message.reply_handle()) {
        table.raw_set(REPLY_KEY, LuaReply(reply))?;
    }
    Ok(value)
}
