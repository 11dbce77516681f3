// ABOUTME: Tests for the main/worker lanes and the request/respond protocol.
// ABOUTME: Covers blocking requests, respond idempotence, distinct delivery and the engine lock.

use luabot_core::coord::*;
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

#[tokio::test]
async fn test_notify_is_received_on_same_lane() {
    let coord = Coordinator::new();
    coord
        .notify(Lane::Main, json!({"type": "PRIVMSG", "channel": "#test"}))
        .await
        .unwrap();

    let msg = timeout(Duration::from_secs(2), coord.recv(Lane::Main))
        .await
        .expect("timed out waiting for main lane")
        .unwrap();
    assert_eq!(msg.payload["channel"], "#test");
    assert!(!msg.expects_reply());
}

#[tokio::test]
async fn test_lanes_are_independent() {
    let coord = Coordinator::new();
    coord.notify(Lane::Worker, json!("for worker")).await.unwrap();

    let nothing = timeout(Duration::from_millis(50), coord.recv(Lane::Main)).await;
    assert!(nothing.is_err(), "main lane should be empty");

    let msg = coord.recv(Lane::Worker).await.unwrap();
    assert_eq!(msg.payload, json!("for worker"));
}

#[tokio::test]
async fn test_request_returns_exact_responded_value() {
    let coord = Arc::new(Coordinator::new());

    let server = coord.clone();
    let main_loop = tokio::spawn(async move {
        let msg = server.recv(Lane::Main).await.unwrap();
        assert!(msg.expects_reply());
        assert!(msg.respond(json!({"accepted": msg.payload["n"]})));
        // Second respond on the same message is a no-op
        assert!(!msg.respond(json!("ignored")));
    });

    let reply = timeout(
        Duration::from_secs(2),
        coord.request(Lane::Main, json!({"n": 42})),
    )
    .await
    .expect("timed out waiting for reply")
    .unwrap();
    assert_eq!(reply, json!({"accepted": 42}));
    main_loop.await.unwrap();
}

#[tokio::test]
async fn test_request_blocks_until_respond() {
    let coord = Arc::new(Coordinator::new());
    let requester = coord.clone();
    let pending = tokio::spawn(async move { requester.request(Lane::Main, json!("ping")).await });

    let msg = coord.recv(Lane::Main).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!pending.is_finished(), "request returned before respond");

    msg.respond(json!("pong"));
    let reply = timeout(Duration::from_secs(2), pending)
        .await
        .expect("timed out")
        .unwrap()
        .unwrap();
    assert_eq!(reply, json!("pong"));
}

#[tokio::test]
async fn test_dropped_request_reports_reply_dropped() {
    let coord = Arc::new(Coordinator::new());
    let requester = coord.clone();
    let pending = tokio::spawn(async move { requester.request(Lane::Worker, json!(1)).await });

    let msg = coord.recv(Lane::Worker).await.unwrap();
    drop(msg);

    let result = timeout(Duration::from_secs(2), pending).await.unwrap().unwrap();
    assert!(matches!(result, Err(CoordError::ReplyDropped(Lane::Worker))));
}

#[tokio::test]
async fn test_cloned_reply_handles_deliver_once() {
    let coord = Arc::new(Coordinator::new());
    let requester = coord.clone();
    let pending = tokio::spawn(async move { requester.request(Lane::Main, json!(null)).await });

    let msg = coord.recv(Lane::Main).await.unwrap();
    let a = msg.reply_handle().unwrap();
    let b = a.clone();
    assert!(a.send(json!("first")));
    assert!(!b.send(json!("second")));
    assert!(b.is_spent());

    let reply = pending.await.unwrap().unwrap();
    assert_eq!(reply, json!("first"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_receivers_get_distinct_messages() {
    let coord = Arc::new(Coordinator::new());
    let n = 32;

    let mut receivers = Vec::new();
    for _ in 0..n {
        let coord = coord.clone();
        receivers.push(tokio::spawn(async move {
            coord.recv(Lane::Worker).await.unwrap().payload
        }));
    }
    for i in 0..n {
        coord.notify(Lane::Worker, json!(i)).await.unwrap();
    }

    let mut seen = HashSet::new();
    for handle in receivers {
        let value = timeout(Duration::from_secs(2), handle)
            .await
            .expect("receiver starved")
            .unwrap();
        assert!(seen.insert(value.as_i64().unwrap()), "duplicate delivery");
    }
    assert_eq!(seen.len(), n);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blocking_request_from_plain_thread() {
    let coord = Arc::new(Coordinator::new());
    let requester = coord.clone();
    let thread = std::thread::spawn(move || requester.blocking_request(Lane::Main, json!(5)));

    let msg = timeout(Duration::from_secs(2), coord.recv(Lane::Main))
        .await
        .unwrap()
        .unwrap();
    let doubled = msg.payload.as_i64().unwrap() * 2;
    msg.respond(json!(doubled));

    let reply = tokio::task::spawn_blocking(move || thread.join().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, json!(10));
}

#[test]
fn test_engine_lock_excludes_concurrent_callers() {
    let coord = Arc::new(Coordinator::new());
    let inside = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));

    let threads: Vec<_> = (0..8)
        .map(|_| {
            let coord = coord.clone();
            let inside = inside.clone();
            let max_seen = max_seen.clone();
            std::thread::spawn(move || {
                for _ in 0..50 {
                    coord.with_engine(|| {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        std::thread::yield_now();
                        inside.fetch_sub(1, Ordering::SeqCst);
                    });
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }
    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
}
