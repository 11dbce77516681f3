// ABOUTME: Auxiliary modules scripts can require: json, charset, re, requests, fs and sh
// ABOUTME: Recoverable failures return (nil, message) instead of raising

use anyhow::{anyhow, Context, Result};
use mlua::{Lua, MultiValue, Table, Value as LuaValue, Variadic};
use regex::Regex;
use std::future::Future;
use std::time::Duration;

use super::bindings::register_module;
use super::convert::{json_to_lua, lua_to_json};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub fn preload(lua: &Lua) -> mlua::Result<()> {
    register_module(lua, "json", json_module(lua)?)?;
    register_module(lua, "charset", charset_module(lua)?)?;
    register_module(lua, "re", re_module(lua)?)?;
    register_module(lua, "requests", requests_module(lua)?)?;
    register_module(lua, "fs", fs_module(lua)?)?;
    register_module(lua, "sh", sh_module(lua)?)?;
    Ok(())
}

/// `value` on success, `nil, message` on failure
fn or_nil_err(lua: &Lua, result: Result<LuaValue>) -> mlua::Result<MultiValue> {
    match result {
        Ok(value) => Ok(MultiValue::from_iter([value])),
        Err(e) => Ok(MultiValue::from_iter([
            LuaValue::Nil,
            LuaValue::String(lua.create_string(format!("{:#}", e))?),
        ])),
    }
}

fn compile(pattern: &str) -> mlua::Result<Regex> {
    Regex::new(pattern).map_err(|e| mlua::Error::RuntimeError(format!("invalid pattern '{}': {}", pattern, e)))
}

fn json_module(lua: &Lua) -> mlua::Result<Table> {
    let module = lua.create_table()?;
    module.set(
        "encode",
        lua.create_function(|_, value: LuaValue| {
            let json = lua_to_json(&value)?;
            serde_json::to_string(&json).map_err(mlua::Error::external)
        })?,
    )?;
    module.set(
        "decode",
        lua.create_function(|lua, text: String| {
            let parsed = serde_json::from_str::<serde_json::Value>(&text)
                .context("invalid JSON")
                .and_then(|json| json_to_lua(lua, &json).map_err(|e| anyhow!("{}", e)));
            or_nil_err(lua, parsed)
        })?,
    )?;
    Ok(module)
}

fn encoding(label: &str) -> Result<&'static encoding_rs::Encoding> {
    encoding_rs::Encoding::for_label(label.as_bytes()).ok_or_else(|| anyhow!("unknown charset '{}'", label))
}

fn charset_module(lua: &Lua) -> mlua::Result<Table> {
    let module = lua.create_table()?;
    // charset.decode(bytes, label): bytes in `label` to a UTF-8 string
    module.set(
        "decode",
        lua.create_function(|lua, (bytes, label): (mlua::String, String)| {
            let decoded = encoding(&label).and_then(|encoding| {
                let binding = bytes.as_bytes();
                let (text, _, _) = encoding.decode(&binding);
                Ok(LuaValue::String(lua.create_string(text.as_bytes())?))
            });
            or_nil_err(lua, decoded)
        })?,
    )?;
    // charset.encode(text, label): UTF-8 string to bytes in `label`
    module.set(
        "encode",
        lua.create_function(|lua, (text, label): (String, String)| {
            let encoded = encoding(&label).and_then(|encoding| {
                let (bytes, _, unmappable) = encoding.encode(&text);
                if unmappable {
                    tracing::debug!(charset = %label, "Unmappable characters replaced");
                }
                Ok(LuaValue::String(lua.create_string(&*bytes)?))
            });
            or_nil_err(lua, encoded)
        })?,
    )?;
    Ok(module)
}

fn re_module(lua: &Lua) -> mlua::Result<Table> {
    let module = lua.create_table()?;
    // re.find(s, pattern) -> start, end (1-based, inclusive) or nil
    module.set(
        "find",
        lua.create_function(|_, (text, pattern): (String, String)| {
            Ok(match compile(&pattern)?.find(&text) {
                Some(m) => (Some(m.start() + 1), Some(m.end())),
                None => (None, None),
            })
        })?,
    )?;
    // re.match(s, pattern) -> {whole, group1, ...} or nil
    module.set(
        "match",
        lua.create_function(|lua, (text, pattern): (String, String)| {
            let Some(captures) = compile(&pattern)?.captures(&text) else {
                return Ok(None);
            };
            let table = lua.create_table_with_capacity(captures.len(), 0)?;
            for (i, group) in captures.iter().enumerate() {
                table.raw_set(i + 1, group.map(|m| m.as_str()).unwrap_or(""))?;
            }
            Ok(Some(table))
        })?,
    )?;
    // re.gsub(s, pattern, replacement) with $1 / ${name} references
    module.set(
        "gsub",
        lua.create_function(|_, (text, pattern, replacement): (String, String, String)| {
            Ok(compile(&pattern)?
                .replace_all(&text, replacement.as_str())
                .into_owned())
        })?,
    )?;
    module.set(
        "quote",
        lua.create_function(|_, text: String| Ok(regex::escape(&text)))?,
    )?;
    Ok(module)
}

/// Drive a future to completion from an engine thread
fn block_on<F: Future>(future: F) -> Result<F::Output> {
    if tokio::runtime::Handle::try_current().is_ok() {
        return Ok(futures::executor::block_on(future));
    }
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start a runtime for the request")?;
    Ok(runtime.block_on(future))
}

/// Parsed `requests.request{...}` argument
#[derive(Debug, Default, PartialEq)]
pub struct HttpRequestSpec {
    pub method: String,
    pub url: String,
    pub params: Vec<(String, String)>,
    pub data: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl HttpRequestSpec {
    pub fn from_table(table: &Table) -> Result<Self> {
        let url: Option<String> = table.get("url")?;
        let method: Option<String> = table.get("method")?;
        Ok(Self {
            method: method.unwrap_or_else(|| "GET".to_string()).to_uppercase(),
            url: url.context("'url' is required")?,
            params: string_pairs(table.get("params")?)?,
            data: table.get("data")?,
            headers: string_pairs(table.get("headers")?)?,
        })
    }
}

/// Accepts `{k = v}` maps and flat `{k1, v1, k2, v2}` lists
fn string_pairs(table: Option<Table>) -> Result<Vec<(String, String)>> {
    let Some(table) = table else {
        return Ok(Vec::new());
    };
    let len = table.raw_len();
    if len > 0 {
        let items: Vec<String> = table.sequence_values::<String>().collect::<mlua::Result<_>>()?;
        return Ok(items
            .chunks(2)
            .filter_map(|pair| match pair {
                [k, v] => Some((k.clone(), v.clone())),
                _ => None,
            })
            .collect());
    }
    let mut pairs: Vec<(String, String)> = table.pairs::<String, String>().collect::<mlua::Result<_>>()?;
    pairs.sort();
    Ok(pairs)
}

async fn perform(spec: HttpRequestSpec) -> Result<(u16, Vec<(String, String)>, String)> {
    let client = reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .context("Failed to build HTTP client")?;
    let method = reqwest::Method::from_bytes(spec.method.as_bytes())
        .with_context(|| format!("invalid method '{}'", spec.method))?;

    let mut request = client.request(method.clone(), &spec.url);
    for (name, value) in &spec.headers {
        request = request.header(name, value);
    }
    request = match (&spec.data, method == reqwest::Method::GET) {
        (_, true) => request.query(&spec.params),
        (Some(data), false) => request.query(&spec.params).body(data.clone()),
        (None, false) => request.form(&spec.params),
    };

    let response = request
        .send()
        .await
        .with_context(|| format!("{} {} failed", spec.method, spec.url))?;
    let status = response.status().as_u16();
    let headers = response
        .headers()
        .iter()
        .map(|(name, value)| (name.to_string(), String::from_utf8_lossy(value.as_bytes()).into_owned()))
        .collect();
    let body = response.text().await.context("Failed to read response body")?;
    Ok((status, headers, body))
}

fn requests_module(lua: &Lua) -> mlua::Result<Table> {
    let module = lua.create_table()?;
    // requests.request{method, url, params, data, headers} -> body, {status, headers} | nil, err
    module.set(
        "request",
        lua.create_function(|lua, table: Table| {
            let outcome = HttpRequestSpec::from_table(&table)
                .and_then(|spec| block_on(perform(spec)))
                .and_then(|result| result);
            match outcome {
                Ok((status, headers, body)) => {
                    let meta = lua.create_table()?;
                    meta.set("status", status)?;
                    let header_table = lua.create_table()?;
                    for (name, value) in headers {
                        header_table.set(name, value)?;
                    }
                    meta.set("headers", header_table)?;
                    Ok(MultiValue::from_iter([
                        LuaValue::String(lua.create_string(body)?),
                        LuaValue::Table(meta),
                    ]))
                }
                Err(e) => or_nil_err(lua, Err(e)),
            }
        })?,
    )?;
    Ok(module)
}

fn fs_module(lua: &Lua) -> mlua::Result<Table> {
    let module = lua.create_table()?;
    module.set(
        "read",
        lua.create_function(|lua, path: String| {
            let content = std::fs::read(&path)
                .with_context(|| format!("Failed to read {}", path))
                .and_then(|bytes| Ok(LuaValue::String(lua.create_string(bytes)?)));
            or_nil_err(lua, content)
        })?,
    )?;
    module.set(
        "write",
        lua.create_function(|lua, (path, content): (String, mlua::String)| {
            let written = std::fs::write(&path, &*content.as_bytes())
                .with_context(|| format!("Failed to write {}", path))
                .map(|_| LuaValue::Boolean(true));
            or_nil_err(lua, written)
        })?,
    )?;
    module.set(
        "exists",
        lua.create_function(|_, path: String| Ok(std::path::Path::new(&path).exists()))?,
    )?;
    module.set(
        "isdir",
        lua.create_function(|_, path: String| Ok(std::path::Path::new(&path).is_dir()))?,
    )?;
    module.set(
        "listdir",
        lua.create_function(|lua, path: String| {
            let listing = list_dir(&path).and_then(|names| Ok(LuaValue::Table(lua.create_sequence_from(names)?)));
            or_nil_err(lua, listing)
        })?,
    )?;
    Ok(module)
}

fn list_dir(path: &str) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(path).with_context(|| format!("Failed to list {}", path))? {
        names.push(entry?.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

fn sh_module(lua: &Lua) -> mlua::Result<Table> {
    let module = lua.create_table()?;
    // sh.exec(cmd, args...) -> stdout, stderr, exit code (-1 when killed by a signal)
    module.set(
        "exec",
        lua.create_function(|lua, (command, args): (String, Variadic<String>)| {
            let output = std::process::Command::new(&command)
                .args(args.iter())
                .output()
                .with_context(|| format!("Failed to run {}", command));
            match output {
                Ok(output) => Ok(MultiValue::from_iter([
                    LuaValue::String(lua.create_string(&output.stdout)?),
                    LuaValue::String(lua.create_string(&output.stderr)?),
                    LuaValue::Integer(output.status.code().unwrap_or(-1).into()),
                ])),
                Err(e) => or_nil_err(lua, Err(e)),
            }
        })?,
    )?;
    Ok(module)
}
