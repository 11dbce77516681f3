// ABOUTME: Reads newbot option tables into typed options
// ABOUTME: Shared keys become a CommonClientOption; backend keys are read through OptionReader

use luabot_core::config::{BackendKind, CommonClientOption, ConfigError, CronEntry, HttpsOption};
use luabot_core::schedule::CronSchedule;
use mlua::{Table, Value as LuaValue};
use std::path::{Path, PathBuf};

/// Typed access to one backend's keys in the options table
pub struct OptionReader<'a> {
    kind: BackendKind,
    table: &'a Table,
}

impl<'a> OptionReader<'a> {
    pub fn new(kind: BackendKind, table: &'a Table) -> Self {
        Self { kind, table }
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// String value of `key`; numbers are accepted and empty strings count as unset
    pub fn string(&self, key: &str) -> mlua::Result<Option<String>> {
        let value = match self.table.get::<LuaValue>(key)? {
            LuaValue::Nil => None,
            LuaValue::String(s) => Some(s.to_str()?.to_string()),
            LuaValue::Integer(i) => Some(i.to_string()),
            LuaValue::Number(n) => Some(n.to_string()),
            other => {
                return Err(mlua::Error::external(ConfigError::invalid(
                    key,
                    format!("expected a string, got {}", other.type_name()),
                )))
            }
        };
        Ok(value.filter(|s| !s.is_empty()))
    }

    pub fn string_or(&self, key: &str, default: &str) -> mlua::Result<String> {
        Ok(self.string(key)?.unwrap_or_else(|| default.to_string()))
    }

    pub fn flag(&self, key: &str) -> mlua::Result<bool> {
        Ok(matches!(self.table.get::<LuaValue>(key)?, LuaValue::Boolean(true)))
    }

    /// A list given either as an array of strings or one comma separated string
    pub fn list(&self, key: &str) -> mlua::Result<Vec<String>> {
        let items = match self.table.get::<LuaValue>(key)? {
            LuaValue::Table(t) => t
                .sequence_values::<String>()
                .collect::<mlua::Result<Vec<_>>>()?,
            LuaValue::String(s) => s.to_str()?.split(',').map(str::to_string).collect(),
            _ => Vec::new(),
        };
        Ok(items
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect())
    }

    /// Values of every key in `keys`, or a config error naming all of them
    pub fn required(&self, keys: &[&str]) -> mlua::Result<Vec<String>> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            match self.string(key)? {
                Some(value) => values.push(value),
                None => return Err(mlua::Error::external(ConfigError::missing(self.kind, keys))),
            }
        }
        Ok(values)
    }
}

/// Parse the keys every backend understands
pub fn common_option(config_file: &Path, table: &Table) -> mlua::Result<CommonClientOption> {
    let mut common = CommonClientOption::new(config_file.to_path_buf());

    common.worker = match table.get::<LuaValue>("worker")? {
        LuaValue::Nil => 0,
        LuaValue::Integer(n) if n >= 0 => n as usize,
        LuaValue::Number(n) if n >= 0.0 => n as usize,
        other => return Err(invalid("worker", format!("expected a non-negative number, got {:?}", other))),
    };
    common.http = non_empty(table.get("http")?);
    common.metrics = non_empty(table.get("metrics")?);
    if let Some(tz) = non_empty(table.get("timezone")?) {
        common.timezone = tz;
    }

    if let Some(https) = table.get::<Option<Table>>("https")? {
        let field = |key: &str| -> mlua::Result<String> {
            non_empty(https.get(key)?).ok_or_else(|| invalid("https", format!("'{}' is required", key)))
        };
        common.https = Some(HttpsOption {
            addr: field("addr")?,
            cert: PathBuf::from(field("cert")?),
            key: PathBuf::from(field("key")?),
        });
    }

    if let Some(crons) = table.get::<Option<Table>>("crons")? {
        for entry in crons.sequence_values::<Table>() {
            let entry = entry?;
            let spec: Option<String> = entry.get("spec")?;
            let name: Option<String> = entry.get("entry")?;
            let spec = spec.or(entry.get(1)?);
            let name = name.or(entry.get(2)?);
            let (Some(spec), Some(entry)) = (spec, name) else {
                return Err(invalid("crons", "each entry needs a spec and an entry function name"));
            };
            CronSchedule::parse(&spec, &common.timezone).map_err(mlua::Error::external)?;
            common.crons.push(CronEntry { spec, entry });
        }
    }

    Ok(common)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

fn invalid(key: &str, reason: impl std::fmt::Display) -> mlua::Error {
    mlua::Error::external(ConfigError::invalid(key, reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlua::Lua;

    fn table(lua: &Lua, src: &str) -> Table {
        lua.load(src).eval().unwrap()
    }

    #[test]
    fn test_common_option_parses_every_key() {
        let lua = Lua::new();
        let t = table(
            &lua,
            r#"return {
                worker = 3,
                http = "0.0.0.0:6669",
                https = {addr = "0.0.0.0:6670", cert = "cert.pem", key = "key.pem"},
                timezone = "Asia/Tokyo",
                crons = {{spec = "*/5 * * * *", entry = "tick"}, {"0 9 * * 1", "weekly"}},
            }"#,
        );
        let common = common_option(Path::new("bot.lua"), &t).unwrap();
        assert_eq!(common.worker, 3);
        assert_eq!(common.http.as_deref(), Some("0.0.0.0:6669"));
        assert_eq!(common.https.as_ref().unwrap().cert, PathBuf::from("cert.pem"));
        assert_eq!(common.timezone, "Asia/Tokyo");
        assert_eq!(common.crons.len(), 2);
        assert_eq!(common.crons[1].entry, "weekly");
        assert!(common.serves_http());
    }

    #[test]
    fn test_bad_cron_spec_is_a_config_error() {
        let lua = Lua::new();
        let t = table(&lua, r#"return {crons = {{spec = "every tuesday", entry = "x"}}}"#);
        let err = common_option(Path::new("bot.lua"), &t).unwrap_err();
        assert!(err.to_string().contains("crons"));
    }

    #[test]
    fn test_required_keys_name_every_key() {
        let lua = Lua::new();
        let t = table(&lua, r#"return {nickname = "bot"}"#);
        let reader = OptionReader::new(BackendKind::Irc, &t);
        let err = reader.required(&["nickname", "username"]).unwrap_err();
        assert!(err
            .to_string()
            .contains("IRC: 'nickname' and 'username' are required"));
    }

    #[test]
    fn test_list_accepts_comma_string_and_array() {
        let lua = Lua::new();
        let t = table(&lua, r#"return {a = "general, random", b = {"x", "y"}}"#);
        let reader = OptionReader::new(BackendKind::Rocket, &t);
        assert_eq!(reader.list("a").unwrap(), vec!["general", "random"]);
        assert_eq!(reader.list("b").unwrap(), vec!["x", "y"]);
        assert!(reader.list("missing").unwrap().is_empty());
    }
}
