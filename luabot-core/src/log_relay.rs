// ABOUTME: Serializes log writes from every task onto one dedicated writer thread
// ABOUTME: Loggers enqueue records; sinks never see two writes at the same time

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" | "critical" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

/// A fully formatted log line plus where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
    /// Which engine or task produced it ("main", "worker", "cron:backup", ...)
    pub origin: String,
    pub at: DateTime<Local>,
}

impl LogRecord {
    pub fn new(level: LogLevel, message: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            origin: origin.into(),
            at: Local::now(),
        }
    }
}

/// Destination for log records. Only the relay thread calls `write`.
pub trait LogSink: Send + Sync {
    fn write(&self, record: &LogRecord);
}

/// Forwards records to `tracing`, keeping the origin as a field.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn write(&self, record: &LogRecord) {
        let origin = record.origin.as_str();
        let message = record.message.as_str();
        match record.level {
            LogLevel::Trace => tracing::trace!(origin, "{}", message),
            LogLevel::Debug => tracing::debug!(origin, "{}", message),
            LogLevel::Info => tracing::info!(origin, "{}", message),
            LogLevel::Warn => tracing::warn!(origin, "{}", message),
            LogLevel::Error => tracing::error!(origin, "{}", message),
        }
    }
}

enum RelayItem {
    Write(Arc<dyn LogSink>, LogRecord),
    Flush(oneshot::Sender<()>),
}

/// Sending side of the relay. Cheap to clone; the writer thread exits once
/// every clone is dropped.
#[derive(Clone)]
pub struct LogRelay {
    tx: mpsc::UnboundedSender<RelayItem>,
}

impl LogRelay {
    /// Start the writer thread
    pub fn spawn() -> std::io::Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<RelayItem>();
        std::thread::Builder::new()
            .name("luabot-log-relay".to_string())
            .spawn(move || {
                while let Some(item) = rx.blocking_recv() {
                    match item {
                        RelayItem::Write(sink, record) => sink.write(&record),
                        RelayItem::Flush(done) => {
                            let _ = done.send(());
                        }
                    }
                }
            })?;
        Ok(Self { tx })
    }

    pub fn submit(&self, sink: Arc<dyn LogSink>, record: LogRecord) {
        if let Err(mpsc::error::SendError(item)) = self.tx.send(RelayItem::Write(sink, record)) {
            // Writer thread is gone; write inline rather than lose the line
            if let RelayItem::Write(sink, record) = item {
                sink.write(&record);
            }
        }
    }

    /// Resolves once every record submitted before this call has been written
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(RelayItem::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

impl fmt::Debug for LogRelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogRelay")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

/// A sink bound to the relay, tagged with an origin. This is the handle
/// scripts and backends log through.
#[derive(Clone)]
pub struct Logger {
    sink: Arc<dyn LogSink>,
    relay: LogRelay,
    origin: String,
}

impl Logger {
    pub fn new(sink: Arc<dyn LogSink>, relay: LogRelay) -> Self {
        Self {
            sink,
            relay,
            origin: "main".to_string(),
        }
    }

    /// Same sink and relay, different origin tag
    pub fn with_origin(&self, origin: impl Into<String>) -> Self {
        Self {
            sink: self.sink.clone(),
            relay: self.relay.clone(),
            origin: origin.into(),
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn relay(&self) -> &LogRelay {
        &self.relay
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.relay.submit(
            self.sink.clone(),
            LogRecord::new(level, message, self.origin.clone()),
        );
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}
