// ABOUTME: Backend behaviour against scripted transports: self-echo filters, ordering, resolution, reconnects
// ABOUTME: Drives handle_event directly and runs the serve loop on a blocking thread

use anyhow::{bail, Result};
use async_trait::async_trait;
use luabot::platform::hipchat::HipchatBackend;
use luabot::platform::irc::IrcBackend;
use luabot::platform::null::NullBackend;
use luabot::platform::rocket::RocketBackend;
use luabot::platform::slack::SlackBackend;
use luabot::platform::{BackendBase, ChatBackend, Transport};
use luabot_core::backoff::ReconnectPolicy;
use luabot_core::config::{BackendKind, CommonClientOption};
use luabot_core::coord::{Coordinator, Lane};
use luabot_core::event::{InboundEvent, TransportSignal};
use luabot_core::log_relay::{LogRelay, Logger, TracingSink};
use mlua::{Function, Lua};
use regex::Regex;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

type Sent = Arc<Mutex<Vec<(String, String)>>>;

/// Transport fed from the test; records every message it is asked to send
struct ScriptedTransport {
    incoming: Mutex<Option<mpsc::Receiver<TransportSignal>>>,
    sent: Sent,
}

impl ScriptedTransport {
    fn new() -> (Self, mpsc::Sender<TransportSignal>, Sent) {
        let (tx, rx) = mpsc::channel(16);
        let sent = Sent::default();
        let transport = Self {
            incoming: Mutex::new(Some(rx)),
            sent: sent.clone(),
        };
        (transport, tx, sent)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self) -> Result<mpsc::Receiver<TransportSignal>> {
        match self.incoming.lock().unwrap().take() {
            Some(rx) => Ok(rx),
            None => bail!("scripted transport connects only once"),
        }
    }

    async fn send(&self, target: &str, message: &str) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((target.to_string(), message.to_string()));
        Ok(())
    }
}

fn logger() -> Logger {
    Logger::new(Arc::new(TracingSink), LogRelay::spawn().unwrap())
}

fn base_with(kind: BackendKind, transport: ScriptedTransport, coordinator: Arc<Coordinator>) -> BackendBase {
    BackendBase::new(
        kind,
        CommonClientOption::new("test.lua"),
        logger(),
        coordinator,
        Arc::new(transport),
    )
}

fn base(kind: BackendKind) -> BackendBase {
    let (transport, _tx, _sent) = ScriptedTransport::new();
    base_with(kind, transport, Arc::new(Coordinator::new()))
}

/// Lua state with a `hits` list and a respond handler that appends "from|target|match"
fn recorder(lua: &Lua) -> Function {
    lua.load("hits = {}").exec().unwrap();
    lua.load(r#"return function(m, e) table.insert(hits, e.from .. "|" .. e.target .. "|" .. m[1]) end"#)
        .eval()
        .unwrap()
}

fn hits(lua: &Lua) -> Vec<String> {
    lua.load("return hits").eval().unwrap()
}

#[test]
fn test_irc_respond_skips_own_nick_and_answers_privately() {
    let lua = Lua::new();
    let backend = IrcBackend::with_base(base(BackendKind::Irc), "luabot");
    backend
        .respond(&lua, Regex::new("hel+o").unwrap(), recorder(&lua))
        .unwrap();

    let privmsg = |nick: &str, target: &str, text: &str| {
        InboundEvent::new(
            "PRIVMSG",
            json!({"nick": nick, "arguments": [target], "message": text}),
        )
    };
    backend.handle_event(&lua, privmsg("LuaBot", "#test", "hello"));
    backend.handle_event(&lua, privmsg("alice", "#test", "hello"));
    backend.handle_event(&lua, privmsg("bob", "luabot", "hello there"));
    backend.handle_event(&lua, privmsg("carol", "#test", "goodbye"));

    assert_eq!(hits(&lua), vec!["alice|#test|hello", "bob|bob|hello"]);
}

#[test]
fn test_irc_tracks_renamed_nick() {
    let lua = Lua::new();
    let backend = IrcBackend::with_base(base(BackendKind::Irc), "luabot");
    backend
        .respond(&lua, Regex::new("ping").unwrap(), recorder(&lua))
        .unwrap();

    backend.handle_event(&lua, InboundEvent::new("001", json!({"arguments": ["luabot_"]})));
    assert_eq!(backend.current_nick(), "luabot_");
    backend.handle_event(
        &lua,
        InboundEvent::new("PRIVMSG", json!({"nick": "luabot_", "arguments": ["#c"], "message": "ping"})),
    );
    assert!(hits(&lua).is_empty());
}

#[test]
fn test_slack_respond_skips_self_and_non_plain_subtypes() {
    let lua = Lua::new();
    let backend = SlackBackend::with_base(base(BackendKind::Slack));
    backend
        .respond(&lua, Regex::new("deploy").unwrap(), recorder(&lua))
        .unwrap();
    backend.handle_event(
        &lua,
        InboundEvent::new(
            "connected",
            json!({
                "self": {"id": "U0BOT", "name": "luabot"},
                "team": "acme",
                "channels": [{"id": "C024BE91L", "name": "general"}],
                "users": [{"id": "U12345", "name": "alice"}],
            }),
        ),
    );

    let message = |user: &str, subtype: &str| {
        InboundEvent::new(
            "message",
            json!({"user": user, "channel": "C024BE91L", "text": "deploy now", "subtype": subtype}),
        )
    };
    backend.handle_event(&lua, message("U0BOT", ""));
    backend.handle_event(&lua, message("U12345", "bot_message"));
    backend.handle_event(&lua, message("U12345", ""));
    backend.handle_event(&lua, message("U12345", "me_message"));

    assert_eq!(
        hits(&lua),
        vec!["alice|#general|deploy", "alice|#general|deploy"]
    );
}

#[test]
fn test_slack_grace_window_hides_messages_from_every_handler() {
    let lua = Lua::new();
    let backend = SlackBackend::with_base(base(BackendKind::Slack));
    lua.load("raw = {}").exec().unwrap();
    let on_message: Function = lua
        .load(r#"return function(e) table.insert(raw, e.ts) end"#)
        .eval()
        .unwrap();
    backend.on(&lua, "message", on_message).unwrap();
    backend
        .respond(&lua, Regex::new("deploy").unwrap(), recorder(&lua))
        .unwrap();
    backend.handle_event(
        &lua,
        InboundEvent::new(
            "connected",
            json!({
                "self": {"id": "U0BOT", "name": "luabot"},
                "channels": [{"id": "C024BE91L", "name": "general"}],
                "users": [{"id": "U12345", "name": "alice"}],
            }),
        ),
    );
    backend.mark_started(1000.0);

    let message = |ts: &str| {
        InboundEvent::new(
            "message",
            json!({"user": "U12345", "channel": "C024BE91L", "text": "deploy", "subtype": "", "ts": ts}),
        )
    };
    backend.handle_event(&lua, message("1001.5"));
    backend.handle_event(&lua, message("1004.0"));

    let raw: Vec<String> = lua.load("return raw").eval().unwrap();
    assert_eq!(raw, vec!["1004.0"]);
    assert_eq!(hits(&lua), vec!["alice|#general|deploy"]);
}

#[test]
fn test_hipchat_respond_requires_mention_and_skips_self() {
    let lua = Lua::new();
    let backend = HipchatBackend::with_base(base(BackendKind::Hipchat));
    backend
        .respond(&lua, Regex::new("ping").unwrap(), recorder(&lua))
        .unwrap();
    backend.handle_event(
        &lua,
        InboundEvent::new("connected", json!({"jid": "1_1@chat", "name": "Lua Bot", "mention_name": "luabot"})),
    );

    let message = |from: &str, body: &str| {
        InboundEvent::new("message", json!({"from": from, "type": "groupchat", "body": body}))
    };
    backend.handle_event(&lua, message("1_room@conf.hipchat.com/Lua Bot", "@luabot ping"));
    backend.handle_event(&lua, message("1_room@conf.hipchat.com/Alice", "ping"));
    backend.handle_event(&lua, message("1_room@conf.hipchat.com/Alice", "@luabot ping"));

    assert_eq!(hits(&lua), vec!["Alice|1_room@conf.hipchat.com|ping"]);
}

#[test]
fn test_rocket_dedups_enriches_and_skips_self() {
    let lua = Lua::new();
    let backend = RocketBackend::with_base(base(BackendKind::Rocket), "luabot");
    backend
        .respond(&lua, Regex::new("status").unwrap(), recorder(&lua))
        .unwrap();
    backend.handle_event(
        &lua,
        InboundEvent::new("connected", json!({"user_id": "bot1", "channels": [{"_id": "GENERAL", "name": "general"}]})),
    );
    assert_eq!(backend.resolve_target("general"), "GENERAL");
    assert_eq!(backend.resolve_target("#general"), "GENERAL");
    assert_eq!(backend.resolve_target("elsewhere"), "elsewhere");

    let message = |id: &str, username: &str, text: &str| {
        InboundEvent::new(
            "message",
            json!({
                "_id": id,
                "rid": "GENERAL",
                "msg": text,
                "ts": {"$date": 1_700_000_000_000i64},
                "u": {"_id": "u-".to_string() + username, "username": username, "name": username},
            }),
        )
    };
    backend.handle_event(&lua, message("m1", "alice", "@luabot status"));
    backend.handle_event(&lua, message("m1", "alice", "@luabot status"));
    backend.handle_event(&lua, message("m2", "luabot", "@luabot status"));
    backend.handle_event(&lua, message("m3", "alice", "status without mention"));

    assert_eq!(hits(&lua), vec!["alice|general|status"]);
}

#[test]
fn test_rocket_raw_handlers_see_enriched_payload() {
    let lua = Lua::new();
    let backend = RocketBackend::with_base(base(BackendKind::Rocket), "luabot");
    backend.handle_event(
        &lua,
        InboundEvent::new("connected", json!({"channels": [{"_id": "GENERAL", "name": "general"}]})),
    );
    let handler: Function = lua
        .load(r#"return function(e) seen = e.channel .. ":" .. e.user.username .. ":" .. e.text end"#)
        .eval()
        .unwrap();
    backend.on(&lua, "message", handler).unwrap();
    backend.handle_event(
        &lua,
        InboundEvent::new(
            "message",
            json!({"_id": "m9", "rid": "GENERAL", "msg": "hi", "u": {"_id": "u1", "username": "alice"}}),
        ),
    );
    let seen: String = lua.load("return seen").eval().unwrap();
    assert_eq!(seen, "general:alice:hi");
}

#[test]
fn test_null_backend_never_fires() {
    let lua = Lua::new();
    let backend = NullBackend::new(CommonClientOption::new("test.lua"), logger(), Arc::new(Coordinator::new()));
    backend.respond(&lua, Regex::new(".*").unwrap(), recorder(&lua)).unwrap();
    let failures = backend.handle_event(&lua, InboundEvent::new("message", json!({"text": "anything"})));
    assert_eq!(failures, 0);
    assert!(hits(&lua).is_empty());
}

#[test]
fn test_handlers_fire_in_registration_order_and_failures_are_isolated() {
    let lua = Lua::new();
    let backend = IrcBackend::with_base(base(BackendKind::Irc), "luabot");
    lua.load("order = {}").exec().unwrap();
    for body in [
        r#"return function(e) table.insert(order, "first") end"#,
        r#"return function(e) error("broken handler") end"#,
        r#"return function(e) table.insert(order, "third") end"#,
    ] {
        let handler: Function = lua.load(body).eval().unwrap();
        backend.on(&lua, "privmsg", handler).unwrap();
    }

    let failures = backend.handle_event(
        &lua,
        InboundEvent::new("PRIVMSG", json!({"nick": "alice", "arguments": ["#c"], "message": "x"})),
    );
    assert_eq!(failures, 1);
    let order: Vec<String> = lua.load("return order").eval().unwrap();
    assert_eq!(order, vec!["first", "third"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slack_say_resolves_channel_name_through_serve() {
    let (transport, _events, sent) = ScriptedTransport::new();
    let backend = Arc::new(SlackBackend::with_base(base_with(
        BackendKind::Slack,
        transport,
        Arc::new(Coordinator::new()),
    )));
    let lua = Lua::new();
    backend.handle_event(
        &lua,
        InboundEvent::new(
            "connected",
            json!({"self": {"id": "U0BOT"}, "channels": [{"id": "C024BE91L", "name": "general"}]}),
        ),
    );
    backend.say("#general", "hi");

    let serving = backend.clone();
    let serve = tokio::task::spawn_blocking(move || serving.serve(&lua, None));

    timeout(Duration::from_secs(5), async {
        while sent.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("message was never sent");
    backend.quit();
    timeout(Duration::from_secs(5), serve).await.unwrap().unwrap().unwrap();

    assert_eq!(
        sent.lock().unwrap().clone(),
        vec![("C024BE91L".to_string(), "hi".to_string())]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_serve_dispatches_transport_events_and_main_lane() {
    let coordinator = Arc::new(Coordinator::new());
    let (transport, events, _sent) = ScriptedTransport::new();
    let backend = Arc::new(IrcBackend::with_base(
        base_with(BackendKind::Irc, transport, coordinator.clone()),
        "luabot",
    ));

    let lua = Lua::new();
    lua.load("log = {}").exec().unwrap();
    let on_privmsg: Function = lua
        .load(r#"return function(e) table.insert(log, "event:" .. e.message) end"#)
        .eval()
        .unwrap();
    backend.on(&lua, "PRIVMSG", on_privmsg).unwrap();
    let main_handler: Function = lua
        .load(r#"return function(msg) table.insert(log, "main:" .. msg.text) end"#)
        .eval()
        .unwrap();

    let serving = backend.clone();
    let serve = tokio::task::spawn_blocking(move || {
        let outcome = serving.serve(&lua, Some(main_handler));
        (lua, outcome)
    });

    events
        .send(TransportSignal::Event(InboundEvent::new(
            "PRIVMSG",
            json!({"nick": "alice", "arguments": ["#c"], "message": "hello"}),
        )))
        .await
        .unwrap();
    coordinator
        .notify(Lane::Main, json!({"type": "say", "text": "from worker"}))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    backend.quit();
    let (lua, outcome) = timeout(Duration::from_secs(5), serve).await.unwrap().unwrap();
    outcome.unwrap();

    let mut log: Vec<String> = lua.load("return log").eval().unwrap();
    log.sort();
    assert_eq!(log, vec!["event:hello", "main:from worker"]);
}

/// Transport that hands out a fresh stream on every connect and can be told
/// to fail the next few attempts
#[derive(Default)]
struct ReconnectingTransport {
    connects: AtomicUsize,
    failures_left: AtomicUsize,
    current: Mutex<Option<mpsc::Sender<TransportSignal>>>,
}

impl ReconnectingTransport {
    fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    fn fail_next(&self, attempts: usize) {
        self.failures_left.store(attempts, Ordering::SeqCst);
    }

    fn events(&self) -> mpsc::Sender<TransportSignal> {
        self.current.lock().unwrap().clone().expect("not connected")
    }

    fn close_stream(&self) {
        self.current.lock().unwrap().take();
    }
}

#[async_trait]
impl Transport for ReconnectingTransport {
    async fn connect(&self) -> Result<mpsc::Receiver<TransportSignal>> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            self.connects.fetch_add(1, Ordering::SeqCst);
            bail!("connection refused");
        }
        let (tx, rx) = mpsc::channel(16);
        *self.current.lock().unwrap() = Some(tx);
        // Counted only once the fresh stream is in place
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(rx)
    }

    async fn send(&self, _target: &str, _message: &str) -> Result<()> {
        Ok(())
    }
}

async fn wait_for_connects(transport: &ReconnectingTransport, count: usize) {
    timeout(Duration::from_secs(5), async {
        while transport.connects() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("expected {} connects, saw {}", count, transport.connects()));
}

fn reconnecting_irc(transport: Arc<ReconnectingTransport>, delay: Duration) -> Arc<IrcBackend> {
    let base = BackendBase::new(
        BackendKind::Irc,
        CommonClientOption::new("test.lua"),
        logger(),
        Arc::new(Coordinator::new()),
        transport,
    )
    .with_reconnect_policy(ReconnectPolicy::fixed(delay));
    Arc::new(IrcBackend::with_base(base, "luabot"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_serve_reconnects_after_disconnect_and_keeps_dispatching() {
    let transport = Arc::new(ReconnectingTransport::default());
    let backend = reconnecting_irc(transport.clone(), Duration::from_millis(10));

    let lua = Lua::new();
    lua.load("seen = {}").exec().unwrap();
    let on_privmsg: Function = lua
        .load(r#"return function(e) table.insert(seen, e.message) end"#)
        .eval()
        .unwrap();
    backend.on(&lua, "PRIVMSG", on_privmsg).unwrap();

    let serving = backend.clone();
    let serve = tokio::task::spawn_blocking(move || {
        let outcome = serving.serve(&lua, None);
        (lua, outcome)
    });
    wait_for_connects(&transport, 1).await;

    let privmsg = |text: &str| {
        TransportSignal::Event(InboundEvent::new(
            "PRIVMSG",
            json!({"nick": "alice", "arguments": ["#c"], "message": text}),
        ))
    };
    transport.events().send(privmsg("before")).await.unwrap();

    // First reconnect attempt fails, the second one after the backoff succeeds
    transport.fail_next(1);
    transport
        .events()
        .send(TransportSignal::Disconnected("reset by peer".to_string()))
        .await
        .unwrap();
    wait_for_connects(&transport, 3).await;

    transport.events().send(privmsg("after")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    backend.quit();

    let (lua, outcome) = timeout(Duration::from_secs(5), serve).await.unwrap().unwrap();
    outcome.unwrap();
    let seen: Vec<String> = lua.load("return seen").eval().unwrap();
    assert_eq!(seen, vec!["before", "after"]);
    assert_eq!(transport.connects(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_quit_during_reconnect_backoff_ends_serve_cleanly() {
    let transport = Arc::new(ReconnectingTransport::default());
    let backend = reconnecting_irc(transport.clone(), Duration::from_secs(60));

    let serving = backend.clone();
    let serve = tokio::task::spawn_blocking(move || serving.serve(&Lua::new(), None));
    wait_for_connects(&transport, 1).await;

    // Stream ends and every reconnect fails, leaving the loop in its 60s backoff
    transport.fail_next(usize::MAX);
    transport.close_stream();
    wait_for_connects(&transport, 2).await;

    backend.quit();
    timeout(Duration::from_secs(5), serve)
        .await
        .expect("quit did not interrupt the reconnect backoff")
        .unwrap()
        .unwrap();
    assert_eq!(transport.connects(), 2);
}
