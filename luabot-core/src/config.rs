// ABOUTME: Backend kinds and the option bag shared by every backend of a run
// ABOUTME: Built once from the script's newbot options, then read-only and cloned by value

use crate::log_relay::Logger;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown backend kind '{0}' (expected IRC, Slack, Hipchat, Rocket or Null)")]
    UnknownBackend(String),
    #[error("{kind}: {keys} required")]
    MissingOption { kind: BackendKind, keys: String },
    #[error("invalid '{key}' option: {reason}")]
    InvalidOption { key: String, reason: String },
}

impl ConfigError {
    /// `'a', 'b' and 'c' are` / `'a' is`
    pub fn missing(kind: BackendKind, keys: &[&str]) -> Self {
        let quoted: Vec<String> = keys.iter().map(|k| format!("'{}'", k)).collect();
        let keys = match quoted.split_last() {
            Some((last, [])) => format!("{} is", last),
            Some((last, rest)) => format!("{} and {} are", rest.join(", "), last),
            None => "options are".to_string(),
        };
        ConfigError::MissingOption { kind, keys }
    }

    pub fn invalid(key: impl Into<String>, reason: impl fmt::Display) -> Self {
        ConfigError::InvalidOption {
            key: key.into(),
            reason: reason.to_string(),
        }
    }
}

/// Chat network a run connects to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Irc,
    Slack,
    Hipchat,
    Rocket,
    Null,
}

impl BackendKind {
    pub const ALL: [BackendKind; 5] = [
        BackendKind::Irc,
        BackendKind::Slack,
        BackendKind::Hipchat,
        BackendKind::Rocket,
        BackendKind::Null,
    ];

    /// Name as scripts spell it in `newbot`
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Irc => "IRC",
            BackendKind::Slack => "Slack",
            BackendKind::Hipchat => "Hipchat",
            BackendKind::Rocket => "Rocket",
            BackendKind::Null => "Null",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BackendKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ConfigError::UnknownBackend(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpsOption {
    pub addr: String,
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// A `{spec, entry}` pair: run global `entry` whenever `spec` fires
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronEntry {
    pub spec: String,
    pub entry: String,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct CommonClientOption {
    /// Script every engine of the run executes
    pub config_file: PathBuf,
    /// Size of the optional persistent worker pool (0 = none)
    #[serde(default)]
    pub worker: usize,
    /// Plain HTTP listen address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https: Option<HttpsOption>,
    #[serde(default)]
    pub crons: Vec<CronEntry>,
    /// Timezone cron specs are evaluated in
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Prometheus exporter listen address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<String>,
    #[serde(skip)]
    pub logger: Option<Logger>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl CommonClientOption {
    pub fn new(config_file: impl Into<PathBuf>) -> Self {
        Self {
            config_file: config_file.into(),
            worker: 0,
            http: None,
            https: None,
            crons: Vec::new(),
            timezone: default_timezone(),
            metrics: None,
            logger: None,
        }
    }

    /// True when a request surface has to be started
    pub fn serves_http(&self) -> bool {
        self.http.is_some() || self.https.is_some()
    }
}

impl fmt::Debug for CommonClientOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommonClientOption")
            .field("config_file", &self.config_file)
            .field("worker", &self.worker)
            .field("http", &self.http)
            .field("https", &self.https)
            .field("crons", &self.crons)
            .field("timezone", &self.timezone)
            .field("metrics", &self.metrics)
            .field("logger", &self.logger.as_ref().map(Logger::origin))
            .finish()
    }
}
