// ABOUTME: IRC line protocol client over TCP or TLS
// ABOUTME: Registers, answers PING, joins channels on welcome and turns every line into an event

use anyhow::{Context, Result};
use async_trait::async_trait;
use luabot_core::event::{InboundEvent, TransportSignal};
use serde_json::{json, Value};
use std::sync::{Mutex, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::platform::{tls, Transport};

/// Parsed form of one protocol line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrcLine {
    pub source: String,
    pub command: String,
    pub arguments: Vec<String>,
    pub raw: String,
}

impl IrcLine {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim_end_matches(['\r', '\n']);
        let mut rest = raw;
        // IRCv3 tags are not surfaced
        if rest.starts_with('@') {
            rest = rest.split_once(' ').map(|(_, r)| r)?;
        }
        let mut source = String::new();
        if let Some(stripped) = rest.strip_prefix(':') {
            let (prefix, r) = stripped.split_once(' ')?;
            source = prefix.to_string();
            rest = r;
        }

        let (middle, trailing) = match rest.split_once(" :") {
            Some((m, t)) => (m, Some(t)),
            None => (rest, None),
        };
        let mut parts = middle.split(' ').filter(|p| !p.is_empty());
        let command = parts.next()?.to_ascii_uppercase();
        let mut arguments: Vec<String> = parts.map(str::to_string).collect();
        if let Some(trailing) = trailing {
            arguments.push(trailing.to_string());
        }

        Some(Self {
            source,
            command,
            arguments,
            raw: raw.to_string(),
        })
    }

    /// `nick!user@host` split into its parts
    pub fn origin(&self) -> (&str, &str, &str) {
        let (nick, rest) = self.source.split_once('!').unwrap_or((&self.source, ""));
        let (user, host) = rest.split_once('@').unwrap_or((rest, ""));
        (nick, user, host)
    }

    /// Trailing text; for PRIVMSG this is the message body
    pub fn message(&self) -> &str {
        self.arguments.last().map(String::as_str).unwrap_or("")
    }

    pub fn to_payload(&self) -> Value {
        let (nick, user, host) = self.origin();
        json!({
            "code": self.command,
            "nick": nick,
            "user": user,
            "host": host,
            "source": self.source,
            "arguments": self.arguments,
            "message": self.message(),
            "raw": self.raw,
        })
    }
}

/// Connection settings taken from the `conn`, `useTLS` and identity options
#[derive(Clone)]
pub struct IrcSettings {
    pub server: String,
    pub channels: Vec<String>,
    pub nickname: String,
    pub username: String,
    pub password: Option<String>,
    pub use_tls: bool,
}

impl IrcSettings {
    /// `conn` is `host:port` followed by comma separated channels
    pub fn parse_conn(conn: &str) -> (String, Vec<String>) {
        let mut parts = conn.split(',').map(str::trim).filter(|p| !p.is_empty());
        let server = parts.next().unwrap_or(super::DEFAULT_CONN).to_string();
        (server, parts.map(str::to_string).collect())
    }

    fn host(&self) -> &str {
        self.server
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(&self.server)
    }
}

impl std::fmt::Debug for IrcSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IrcSettings")
            .field("server", &self.server)
            .field("channels", &self.channels)
            .field("nickname", &self.nickname)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("use_tls", &self.use_tls)
            .finish()
    }
}

pub struct IrcTransport {
    settings: IrcSettings,
    lines: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl IrcTransport {
    pub fn new(settings: IrcSettings) -> Self {
        Self {
            settings,
            lines: Mutex::new(None),
        }
    }

    fn start<S>(&self, stream: S) -> mpsc::Receiver<TransportSignal>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
        let (event_tx, event_rx) = mpsc::channel(64);

        tokio::spawn(async move {
            while let Some(line) = line_rx.recv().await {
                let framed = format!("{}\r\n", line);
                if let Err(e) = writer.write_all(framed.as_bytes()).await {
                    tracing::warn!(error = %e, "IRC write failed");
                    break;
                }
            }
        });

        let settings = self.settings.clone();
        if let Some(password) = &settings.password {
            let _ = line_tx.send(format!("PASS {}", password));
        }
        let _ = line_tx.send(format!("NICK {}", settings.nickname));
        let _ = line_tx.send(format!(
            "USER {} 0.0.0.0 0.0.0.0 :{}",
            settings.username, settings.username
        ));

        *self.lines.lock().unwrap_or_else(PoisonError::into_inner) = Some(line_tx.clone());
        tokio::spawn(read_loop(reader, line_tx, event_tx, settings));
        event_rx
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    reader: R,
    lines: mpsc::UnboundedSender<String>,
    events: mpsc::Sender<TransportSignal>,
    settings: IrcSettings,
) {
    let mut reader = BufReader::new(reader).lines();
    let mut nick = settings.nickname.clone();

    let reason = loop {
        let line = match reader.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break "server closed the connection".to_string(),
            Err(e) => break e.to_string(),
        };
        let Some(parsed) = IrcLine::parse(&line) else {
            continue;
        };
        match parsed.command.as_str() {
            "PING" => {
                let _ = lines.send(format!("PONG :{}", parsed.message()));
            }
            "001" => {
                for channel in &settings.channels {
                    let _ = lines.send(format!("JOIN {}", channel));
                }
            }
            "433" => {
                nick.push('_');
                let _ = lines.send(format!("NICK {}", nick));
            }
            _ => {}
        }
        let event = InboundEvent::new(parsed.command.clone(), parsed.to_payload());
        if events.send(TransportSignal::Event(event)).await.is_err() {
            return;
        }
    };
    let _ = events.send(TransportSignal::Disconnected(reason)).await;
}

#[async_trait]
impl Transport for IrcTransport {
    async fn connect(&self) -> Result<mpsc::Receiver<TransportSignal>> {
        let tcp = TcpStream::connect(&self.settings.server)
            .await
            .with_context(|| format!("Failed to connect to {}", self.settings.server))?;
        tracing::info!(server = %self.settings.server, tls = self.settings.use_tls, "IRC connected");
        if self.settings.use_tls {
            let stream = tls::upgrade(self.settings.host(), tcp).await?;
            Ok(self.start(stream))
        } else {
            Ok(self.start(tcp))
        }
    }

    async fn send(&self, target: &str, message: &str) -> Result<()> {
        let lines = self
            .lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .context("IRC connection is not established")?;
        for text in message.lines().filter(|l| !l.is_empty()) {
            lines
                .send(format!("PRIVMSG {} :{}", target, text))
                .context("IRC connection closed")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_privmsg() {
        let line = IrcLine::parse(":alice!al@example.com PRIVMSG #rust :hello there\r\n").unwrap();
        assert_eq!(line.command, "PRIVMSG");
        assert_eq!(line.origin(), ("alice", "al", "example.com"));
        assert_eq!(line.arguments, vec!["#rust", "hello there"]);
        assert_eq!(line.message(), "hello there");
    }

    #[test]
    fn test_parse_numeric_and_tags() {
        let line = IrcLine::parse("@time=now :irc.example.net 001 luabot :Welcome").unwrap();
        assert_eq!(line.command, "001");
        assert_eq!(line.source, "irc.example.net");
        assert_eq!(line.arguments, vec!["luabot", "Welcome"]);
    }

    #[test]
    fn test_parse_ping_without_prefix() {
        let line = IrcLine::parse("PING :abc123").unwrap();
        assert_eq!(line.command, "PING");
        assert_eq!(line.message(), "abc123");
        assert!(IrcLine::parse("").is_none());
    }

    #[test]
    fn test_parse_conn() {
        let (server, channels) = IrcSettings::parse_conn("irc.example.net:6697,#a, #b");
        assert_eq!(server, "irc.example.net:6697");
        assert_eq!(channels, vec!["#a", "#b"]);
    }

    #[tokio::test]
    async fn test_registration_and_ping_over_duplex() {
        use tokio::io::AsyncReadExt;
        use tokio::time::{timeout, Duration};

        let (client, mut server) = tokio::io::duplex(4096);
        let transport = IrcTransport::new(IrcSettings {
            server: "unused:6667".to_string(),
            channels: vec!["#ops".to_string()],
            nickname: "luabot".to_string(),
            username: "lb".to_string(),
            password: None,
            use_tls: false,
        });
        let mut events = transport.start(client);

        server
            .write_all(b":srv 001 luabot :Welcome\r\nPING :tok\r\n")
            .await
            .unwrap();

        let first = timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for welcome")
            .unwrap();
        assert!(matches!(first, TransportSignal::Event(ref e) if e.event_type == "001"));

        let mut written = String::new();
        let mut buf = [0u8; 512];
        while !written.contains("PONG :tok") {
            let n = timeout(Duration::from_secs(2), server.read(&mut buf))
                .await
                .expect("timed out reading client output")
                .unwrap();
            written.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
        assert!(written.contains("NICK luabot\r\n"));
        assert!(written.contains("USER lb 0.0.0.0 0.0.0.0 :lb\r\n"));
        assert!(written.contains("JOIN #ops\r\n"));
    }
}
