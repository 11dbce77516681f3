// ABOUTME: HTTP surface tests driving the router with the generated default script
// ABOUTME: A stand-in main task answers requestmain so /privmsg can be exercised end to end

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use luabot::engine::EngineFactory;
use luabot::server::{router, Scheme};
use luabot::BackendKind;
use luabot_core::coord::{Coordinator, Lane};
use luabot_core::log_relay::LogRelay;
use serde_json::{json, Value};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tower::ServiceExt;

fn factory_for(script: &str) -> (Arc<EngineFactory>, tempfile::NamedTempFile) {
    let mut file = tempfile::Builder::new().suffix(".lua").tempfile().unwrap();
    file.write_all(script.as_bytes()).unwrap();
    let factory = EngineFactory::new(
        file.path(),
        Arc::new(Coordinator::new()),
        LogRelay::spawn().unwrap(),
    );
    (factory, file)
}

fn default_factory() -> (Arc<EngineFactory>, tempfile::NamedTempFile) {
    factory_for(&luabot::templates::default_config(BackendKind::Null))
}

/// Answer the next main-lane request with `answer` and hand back its payload
fn answer_main_once(factory: &Arc<EngineFactory>, answer: Value) -> JoinHandle<Value> {
    let coordinator = factory.coordinator().clone();
    tokio::spawn(async move {
        let message = tokio::time::timeout(Duration::from_secs(5), coordinator.recv(Lane::Main))
            .await
            .expect("no request reached the main lane")
            .unwrap();
        assert!(message.expects_reply());
        message.respond(answer);
        message.payload
    })
}

async fn call(factory: Arc<EngineFactory>, request: Request<Body>) -> (StatusCode, String) {
    let app = router(factory.clone(), factory.logger(), Scheme::Http);
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), 1 << 20).await.unwrap();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

fn post_privmsg(body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/privmsg")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_path_is_not_found() {
    let (factory, _file) = default_factory();
    let request = Request::builder().uri("/nowhere").body(Body::empty()).unwrap();

    let (status, body) = call(factory, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, "NOT FOUND");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_privmsg_is_relayed_to_main() {
    let (factory, _file) = default_factory();
    let main = answer_main_once(&factory, json!(true));

    let (status, body) = call(
        factory,
        post_privmsg(r##"{"channel": "#test", "message": "hello"}"##),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(serde_json::from_str::<Value>(&body).unwrap(), json!({"result": "ok"}));

    let payload = main.await.unwrap();
    assert_eq!(payload["type"], "say");
    assert_eq!(payload["channel"], "#test");
    assert_eq!(payload["message"], "hello");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_privmsg_rejected_by_main_is_not_acceptable() {
    let (factory, _file) = default_factory();
    let main = answer_main_once(&factory, json!(false));

    let (status, body) = call(
        factory,
        post_privmsg(r##"{"channel": "#test", "message": "hello"}"##),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_ACCEPTABLE);
    assert_eq!(serde_json::from_str::<Value>(&body).unwrap(), json!({"result": "error"}));
    main.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_privmsg_with_invalid_json_is_not_acceptable() {
    let (factory, _file) = default_factory();

    let (status, body) = call(factory, post_privmsg("{not json")).await;
    assert_eq!(status, StatusCode::NOT_ACCEPTABLE);
    assert_eq!(serde_json::from_str::<Value>(&body).unwrap(), json!({"result": "error"}));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_script_error_becomes_internal_server_error() {
    let (factory, _file) = factory_for(r#"function http(req) error("boom") end"#);
    let request = Request::builder().uri("/").body(Body::empty()).unwrap();

    let (status, body) = call(factory, request).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, "Internal Server Error");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_request_fields_reach_the_script() {
    let (factory, _file) = factory_for(
        r#"
        function http(req)
          local body = table.concat({
            req.method, req.path, req.query, req.scheme, req:header("x-probe") or "-", req:read(),
          }, "|")
          return 200, {{"Content-Type", "text/plain"}}, body
        end
        "#,
    );
    let request = Request::builder()
        .method("PUT")
        .uri("/echo?a=1")
        .header("X-Probe", "yes")
        .body(Body::from("payload"))
        .unwrap();

    let (status, body) = call(factory, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "PUT|/echo|a=1|http|yes|payload");
}
