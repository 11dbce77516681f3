// ABOUTME: Tracing subscriber setup and the log sinks a script can configure
// ABOUTME: Console, rolling file, tracing and script-function sinks, all written by the log relay

use anyhow::{bail, Context, Result};
use luabot_core::log_relay::{LogLevel, LogRecord, LogSink, TracingSink};
use mlua::{Lua, RegistryKey, Table, Value as LuaValue};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub const DEFAULT_FORMAT: &str = "%Date [%Level] %Msg";

/// Install the global tracing subscriber. `RUST_LOG` wins over the default
/// filter; `LUABOT_LOG_FORMAT=json` switches to JSON lines.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,luabot=info,luabot_core=info".into());
    let json = std::env::var("LUABOT_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    if let Err(e) = result {
        eprintln!("tracing already initialized: {}", e);
    }
}

/// Expand `%Date`, `%Level`, `%Origin` and `%Msg` in a line format
pub fn format_line(format: &str, record: &LogRecord) -> String {
    let mut out = String::with_capacity(format.len() + record.message.len());
    let mut rest = format;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        if let Some(after) = tail.strip_prefix("%Date") {
            out.push_str(&record.at.format("%Y-%m-%d %H:%M:%S").to_string());
            rest = after;
        } else if let Some(after) = tail.strip_prefix("%Level") {
            out.push_str(record.level.as_str());
            rest = after;
        } else if let Some(after) = tail.strip_prefix("%Origin") {
            out.push_str(&record.origin);
            rest = after;
        } else if let Some(after) = tail.strip_prefix("%Msg") {
            out.push_str(&record.message);
            rest = after;
        } else {
            out.push('%');
            rest = &tail[1..];
        }
    }
    out.push_str(rest);
    out
}

pub struct ConsoleSink {
    format: String,
    min_level: LogLevel,
}

impl ConsoleSink {
    pub fn new(format: impl Into<String>, min_level: LogLevel) -> Self {
        Self {
            format: format.into(),
            min_level,
        }
    }
}

impl LogSink for ConsoleSink {
    fn write(&self, record: &LogRecord) {
        if record.level < self.min_level {
            return;
        }
        let mut stdout = std::io::stdout().lock();
        let _ = writeln!(stdout, "{}", format_line(&self.format, record));
    }
}

/// Appends formatted lines to a rolling file
pub struct FileSink {
    writer: Mutex<RollingFileAppender>,
    format: String,
    min_level: LogLevel,
}

impl FileSink {
    pub fn new(path: &Path, rotation: Rotation, format: impl Into<String>, min_level: LogLevel) -> Result<Self> {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let file_name = path
            .file_name()
            .with_context(|| format!("Log path has no file name: {}", path.display()))?;
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
        Ok(Self {
            writer: Mutex::new(RollingFileAppender::new(rotation, dir, file_name)),
            format: format.into(),
            min_level,
        })
    }
}

impl LogSink for FileSink {
    fn write(&self, record: &LogRecord) {
        if record.level < self.min_level {
            return;
        }
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writeln!(writer, "{}", format_line(&self.format, record)) {
            tracing::warn!(error = %e, "Failed to write log file");
        }
    }
}

/// Hands records to the serve loop, which calls the script's log function
/// from the engine's own thread.
pub struct ScriptSink {
    tx: mpsc::UnboundedSender<LogRecord>,
}

impl LogSink for ScriptSink {
    fn write(&self, record: &LogRecord) {
        if let Err(mpsc::error::SendError(record)) = self.tx.send(record.clone()) {
            TracingSink.write(&record);
        }
    }
}

/// Receiving end of a `ScriptSink`, owned by the backend until serve starts
pub struct ScriptLogQueue {
    pub function: RegistryKey,
    pub rx: mpsc::UnboundedReceiver<LogRecord>,
}

impl ScriptLogQueue {
    /// Line handed to the script function
    pub fn render(record: &LogRecord) -> String {
        format_line(DEFAULT_FORMAT, record)
    }
}

/// Structured form of a `log = {...}` table
#[derive(Debug, Clone, PartialEq)]
pub enum LogConfig {
    Tracing,
    Console {
        format: String,
        level: LogLevel,
    },
    File {
        path: String,
        rotation: String,
        format: String,
        level: LogLevel,
    },
}

impl LogConfig {
    pub fn from_table(table: &Table) -> Result<Self> {
        let kind: Option<String> = table.get("type")?;
        let format = table
            .get::<Option<String>>("format")?
            .unwrap_or_else(|| DEFAULT_FORMAT.to_string());
        let level = match table.get::<Option<String>>("level")? {
            Some(level) => level.parse::<LogLevel>().map_err(anyhow::Error::msg)?,
            None => LogLevel::Debug,
        };
        match kind.as_deref().unwrap_or("console") {
            "console" => Ok(LogConfig::Console { format, level }),
            "tracing" => Ok(LogConfig::Tracing),
            "file" => {
                let path: Option<String> = table.get("path")?;
                let path = path.context("log type 'file' needs a 'path'")?;
                let rotation = table
                    .get::<Option<String>>("rotation")?
                    .unwrap_or_else(|| "daily".to_string());
                Ok(LogConfig::File {
                    path,
                    rotation,
                    format,
                    level,
                })
            }
            other => bail!("unknown log type '{}' (expected console, file or tracing)", other),
        }
    }

    pub fn build_sink(&self) -> Result<Arc<dyn LogSink>> {
        Ok(match self {
            LogConfig::Tracing => Arc::new(TracingSink),
            LogConfig::Console { format, level } => Arc::new(ConsoleSink::new(format.clone(), *level)),
            LogConfig::File {
                path,
                rotation,
                format,
                level,
            } => {
                let rotation = match rotation.as_str() {
                    "minutely" => Rotation::MINUTELY,
                    "hourly" => Rotation::HOURLY,
                    "daily" => Rotation::DAILY,
                    "never" => Rotation::NEVER,
                    other => bail!("unknown log rotation '{}'", other),
                };
                Arc::new(FileSink::new(Path::new(path), rotation, format.clone(), *level)?)
            }
        })
    }
}

/// Sink selected by a `log` option, plus the queue a function sink feeds
pub struct ResolvedLog {
    pub sink: Arc<dyn LogSink>,
    pub script_queue: Option<ScriptLogQueue>,
}

/// Resolve a `log` option value. A function only becomes a sink for the
/// long-lived engine; throwaway engines fall back to tracing.
pub fn resolve_log_option(lua: &Lua, value: LuaValue, allow_script: bool) -> Result<ResolvedLog> {
    match value {
        LuaValue::Nil => Ok(ResolvedLog {
            sink: Arc::new(TracingSink),
            script_queue: None,
        }),
        LuaValue::Function(function) if allow_script => {
            let (tx, rx) = mpsc::unbounded_channel();
            let function = lua.create_registry_value(function)?;
            Ok(ResolvedLog {
                sink: Arc::new(ScriptSink { tx }),
                script_queue: Some(ScriptLogQueue { function, rx }),
            })
        }
        LuaValue::Function(_) => Ok(ResolvedLog {
            sink: Arc::new(TracingSink),
            script_queue: None,
        }),
        LuaValue::Table(table) => Ok(ResolvedLog {
            sink: LogConfig::from_table(&table)?.build_sink()?,
            script_queue: None,
        }),
        other => bail!("'log' must be a function or a table, got {}", other.type_name()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(message: &str) -> LogRecord {
        LogRecord::new(LogLevel::Warn, message, "cron:backup")
    }

    #[test]
    fn test_format_line_expands_placeholders() {
        let line = format_line("[%Level] %Origin: %Msg", &record("disk full"));
        assert_eq!(line, "[WARN] cron:backup: disk full");
    }

    #[test]
    fn test_format_line_leaves_message_placeholders_alone() {
        let line = format_line("%Msg %Level", &record("100% %Date"));
        assert_eq!(line, "100% %Date WARN");
    }

    #[test]
    fn test_log_table_parsing() {
        let lua = Lua::new();
        let table: Table = lua
            .load(r#"return {type = "file", path = "logs/bot.log", level = "info"}"#)
            .eval()
            .unwrap();
        assert_eq!(
            LogConfig::from_table(&table).unwrap(),
            LogConfig::File {
                path: "logs/bot.log".to_string(),
                rotation: "daily".to_string(),
                format: DEFAULT_FORMAT.to_string(),
                level: LogLevel::Info,
            }
        );

        let table: Table = lua.load(r#"return {type = "syslog"}"#).eval().unwrap();
        assert!(LogConfig::from_table(&table).is_err());
    }

    #[test]
    fn test_file_sink_writes_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bot.log");
        let sink = FileSink::new(&path, Rotation::NEVER, "%Level %Msg", LogLevel::Info).unwrap();
        sink.write(&LogRecord::new(LogLevel::Debug, "skipped", "main"));
        sink.write(&LogRecord::new(LogLevel::Error, "kept", "main"));
        drop(sink);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "ERROR kept\n");
    }
}
