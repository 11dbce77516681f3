// ABOUTME: Minimal XMPP client for Hipchat: STARTTLS, SASL PLAIN, bind, roster and room joins
// ABOUTME: Reads depth-1 stanzas with quick-xml and reports chat messages as events

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use luabot_core::event::{InboundEvent, TransportSignal};
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use serde_json::json;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use crate::platform::{tls, Transport};

const XMPP_PORT: u16 = 5222;
const LOGIN_TIMEOUT: Duration = Duration::from_secs(30);

/// One XML element with its subtree
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Element {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Element>,
    pub text: String,
}

impl Element {
    fn from_start(start: &BytesStart<'_>) -> Result<Self> {
        let mut attrs = Vec::new();
        for attr in start.attributes() {
            let attr = attr?;
            attrs.push((
                String::from_utf8_lossy(attr.key.as_ref()).into_owned(),
                attr.unescape_value()?.into_owned(),
            ));
        }
        Ok(Self {
            name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
            attrs,
            ..Self::default()
        })
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Depth-first search by element name
    pub fn find(&self, name: &str) -> Option<&Element> {
        self.children
            .iter()
            .find_map(|c| if c.name == name { Some(c) } else { c.find(name) })
    }
}

/// Read the next complete top-level stanza. Returns None when the stream ends.
pub async fn next_stanza<R: AsyncBufRead + Unpin>(reader: &mut Reader<R>, buf: &mut Vec<u8>) -> Result<Option<Element>> {
    let mut stack: Vec<Element> = Vec::new();
    loop {
        buf.clear();
        match reader.read_event_into_async(buf).await? {
            Event::Start(start) => {
                let element = Element::from_start(&start)?;
                if element.name == "stream:stream" {
                    continue;
                }
                stack.push(element);
            }
            Event::Empty(start) => {
                let element = Element::from_start(&start)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => return Ok(Some(element)),
                }
            }
            Event::Text(text) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&text.unescape()?);
                }
            }
            Event::CData(data) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            }
            Event::End(end) => {
                if end.name().as_ref() == b"stream:stream" {
                    return Ok(None);
                }
                let Some(element) = stack.pop() else {
                    continue;
                };
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => return Ok(Some(element)),
                }
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

fn xml_reader<R: AsyncRead + Unpin>(inner: R) -> Reader<BufReader<R>> {
    let mut reader = Reader::from_reader(BufReader::new(inner));
    let config = reader.config_mut();
    config.trim_text(true);
    config.check_end_names = false;
    reader
}

fn stream_header(host: &str) -> String {
    format!(
        "<?xml version='1.0'?><stream:stream to='{}' xmlns='jabber:client' \
         xmlns:stream='http://etherx.jabber.org/streams' version='1.0'>",
        escape(host)
    )
}

/// Settings from the Hipchat options
#[derive(Clone)]
pub struct XmppSettings {
    pub user: String,
    pub password: String,
    pub host: String,
    pub conf: String,
    pub resource: String,
    pub auth_type: String,
    pub room_jids: Vec<String>,
}

impl XmppSettings {
    pub fn bare_jid(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    fn plain_credentials(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(format!("\0{}\0{}", self.user, self.password))
    }
}

impl std::fmt::Debug for XmppSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XmppSettings")
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("host", &self.host)
            .field("conf", &self.conf)
            .field("resource", &self.resource)
            .field("auth_type", &self.auth_type)
            .field("room_jids", &self.room_jids)
            .finish()
    }
}

pub struct XmppTransport {
    settings: XmppSettings,
    writer: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl XmppTransport {
    pub fn new(settings: XmppSettings) -> Self {
        Self {
            settings,
            writer: Mutex::new(None),
        }
    }

    /// Message stanza; rooms on the conference domain get groupchat
    pub fn message_stanza(&self, target: &str, message: &str) -> String {
        let domain = target
            .split_once('@')
            .map(|(_, rest)| rest.split('/').next().unwrap_or(rest))
            .unwrap_or("");
        let kind = if domain == self.settings.conf { "groupchat" } else { "chat" };
        format!(
            "<message to='{}' type='{}'><body>{}</body></message>",
            escape(target),
            kind,
            escape(message)
        )
    }

    /// STARTTLS and SASL over the raw connection, ending just before the
    /// post-auth stream restart
    async fn authenticate(&self) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
        let settings = &self.settings;
        if !settings.auth_type.eq_ignore_ascii_case("plain") {
            bail!("unsupported auth_type '{}' (only plain is supported)", settings.auth_type);
        }

        let mut tcp = TcpStream::connect((settings.host.as_str(), XMPP_PORT))
            .await
            .with_context(|| format!("Failed to connect to {}:{}", settings.host, XMPP_PORT))?;

        {
            tcp.write_all(stream_header(&settings.host).as_bytes()).await?;
            let mut reader = xml_reader(&mut tcp);
            let mut buf = Vec::new();
            expect_stanza(&mut reader, &mut buf, "stream:features").await?;
            reader
                .get_mut()
                .get_mut()
                .write_all(b"<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>")
                .await?;
            expect_stanza(&mut reader, &mut buf, "proceed").await?;
        }

        let mut stream = tls::upgrade(&settings.host, tcp).await?;
        stream.write_all(stream_header(&settings.host).as_bytes()).await?;
        let mut reader = xml_reader(&mut stream);
        let mut buf = Vec::new();
        expect_stanza(&mut reader, &mut buf, "stream:features").await?;
        let auth = format!(
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{}</auth>",
            settings.plain_credentials()
        );
        reader.get_mut().get_mut().write_all(auth.as_bytes()).await?;
        match next_stanza(&mut reader, &mut buf).await? {
            Some(e) if e.name == "success" => {}
            Some(e) if e.name == "failure" => bail!("authentication failed for {}", settings.bare_jid()),
            other => bail!("unexpected reply to auth: {:?}", other.map(|e| e.name)),
        }
        drop(reader);
        Ok(stream)
    }
}

async fn expect_stanza<R: AsyncBufRead + Unpin>(reader: &mut Reader<R>, buf: &mut Vec<u8>, name: &str) -> Result<Element> {
    match next_stanza(reader, buf).await? {
        Some(element) if element.name == name => Ok(element),
        Some(element) => bail!("expected <{}>, got <{}>", name, element.name),
        None => bail!("stream closed while waiting for <{}>", name),
    }
}

/// Post-auth session: bind, roster, joins, then message relay
async fn session<R: AsyncRead + Unpin>(
    read_half: R,
    writer: mpsc::UnboundedSender<String>,
    events: mpsc::Sender<TransportSignal>,
    settings: XmppSettings,
    ready: oneshot::Sender<Result<()>>,
) {
    let mut ready = Some(ready);
    let mut reader = xml_reader(read_half);
    let mut buf = Vec::new();
    let own_jid = settings.bare_jid();

    let reason = loop {
        let stanza = match next_stanza(&mut reader, &mut buf).await {
            Ok(Some(stanza)) => stanza,
            Ok(None) => break "stream closed".to_string(),
            Err(e) => break format!("{:#}", e),
        };
        match (stanza.name.as_str(), stanza.attr("id")) {
            ("stream:features", _) => {
                let _ = writer.send(format!(
                    "<iq type='set' id='bind_1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
                     <resource>{}</resource></bind></iq>",
                    escape(&settings.resource)
                ));
            }
            ("iq", Some("bind_1")) => {
                if stanza.attr("type") != Some("result") {
                    break "resource bind failed".to_string();
                }
                let _ = writer.send("<iq type='get' id='roster_1'><query xmlns='jabber:iq:roster'/></iq>".to_string());
            }
            ("iq", Some("roster_1")) => {
                let me = stanza
                    .find("query")
                    .map(|q| q.children.iter())
                    .into_iter()
                    .flatten()
                    .find(|item| item.attr("jid") == Some(own_jid.as_str()));
                let name = me.and_then(|i| i.attr("name")).unwrap_or(settings.user.as_str()).to_string();
                let mention = me.and_then(|i| i.attr("mention_name")).unwrap_or(settings.user.as_str()).to_string();

                for room in &settings.room_jids {
                    let _ = writer.send(format!(
                        "<presence to='{}/{}'><x xmlns='http://jabber.org/protocol/muc'/></presence>",
                        escape(room),
                        escape(&name)
                    ));
                }
                let _ = writer.send("<presence><show>chat</show></presence>".to_string());

                let connected = json!({"jid": own_jid, "name": name, "mention_name": mention});
                if events
                    .send(TransportSignal::Event(InboundEvent::new("connected", connected)))
                    .await
                    .is_err()
                {
                    return;
                }
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Ok(()));
                }
            }
            ("message", _) => {
                let Some(body) = stanza.child("body") else {
                    continue;
                };
                let payload = json!({
                    "from": stanza.attr("from").unwrap_or(""),
                    "type": stanza.attr("type").unwrap_or("chat"),
                    "body": body.text,
                });
                if events
                    .send(TransportSignal::Event(InboundEvent::new("message", payload)))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            _ => {}
        }
    };

    match ready.take() {
        Some(ready) => {
            let _ = ready.send(Err(anyhow::anyhow!(reason)));
        }
        None => {
            let _ = events.send(TransportSignal::Disconnected(reason)).await;
        }
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(mut writer: W, mut lines: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = lines.recv().await {
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            tracing::warn!(error = %e, "XMPP write failed");
            break;
        }
    }
}

#[async_trait]
impl Transport for XmppTransport {
    async fn connect(&self) -> Result<mpsc::Receiver<TransportSignal>> {
        let stream = self.authenticate().await?;
        let (read_half, write_half) = tokio::io::split(stream);

        let (line_tx, line_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(64);
        let (ready_tx, ready_rx) = oneshot::channel();

        tokio::spawn(write_loop(write_half, line_rx));
        let _ = line_tx.send(stream_header(&self.settings.host));
        tokio::spawn(session(
            read_half,
            line_tx.clone(),
            event_tx,
            self.settings.clone(),
            ready_tx,
        ));

        tokio::time::timeout(LOGIN_TIMEOUT, ready_rx)
            .await
            .context("Timed out joining Hipchat rooms")?
            .context("XMPP session ended during login")??;

        *self.writer.lock().unwrap_or_else(PoisonError::into_inner) = Some(line_tx);
        tracing::info!(host = %self.settings.host, "Connected to Hipchat");
        Ok(event_rx)
    }

    async fn send(&self, target: &str, message: &str) -> Result<()> {
        let writer = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .context("XMPP connection is not established")?;
        writer
            .send(self.message_stanza(target, message))
            .context("XMPP connection closed")
    }
}
