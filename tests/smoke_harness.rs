use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Form, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use irccloud_sdk::{
    ApiClient, ApiError, BotBuilder, BotOptions, HttpTransport, StreamError, TransportOptions,
};
use secrecy::SecretString;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const TEST_EMAIL: &str = "bot@example.com";
const TEST_PASSWORD: &str = "correct horse";
const TEST_FORM_TOKEN: &str = "formtoken-1";
const TEST_SESSION: &str = "session-abc";

#[derive(Clone)]
struct ServiceState {
    stream_lines: Arc<Vec<String>>,
    said_tx: mpsc::UnboundedSender<HashMap<String, String>>,
    stream_opens: Arc<Mutex<usize>>,
}

fn stream_lines() -> Vec<String> {
    vec![
        json!({"type": "header", "streamid": "s-1"}).to_string(),
        json!({"type": "oob_include", "url": "/chat/backlog/1"}).to_string(),
        json!({"type": "idle"}).to_string(),
        "garbage that is not json".to_string(),
        json!({
            "type": "buffer_msg",
            "cid": 7,
            "chan": "#rust",
            "from": "alice",
            "msg": "!ping"
        })
        .to_string(),
    ]
}

async fn spawn_service() -> (
    SocketAddr,
    mpsc::UnboundedReceiver<HashMap<String, String>>,
    Arc<Mutex<usize>>,
    oneshot::Sender<()>,
    tokio::task::JoinHandle<()>,
) {
    let (said_tx, said_rx) = mpsc::unbounded_channel();
    let stream_opens = Arc::new(Mutex::new(0));
    let state = ServiceState {
        stream_lines: Arc::new(stream_lines()),
        said_tx,
        stream_opens: stream_opens.clone(),
    };

    let app = Router::new()
        .route("/chat/auth-formtoken", post(formtoken_handler))
        .route("/chat/login", post(login_handler))
        .route("/chat/stream", get(stream_handler))
        .route("/chat/backlog/1", get(backlog_handler))
        .route("/chat/say", post(say_handler))
        .with_state(state);
    let (addr, shutdown_tx, task) = spawn_server(app).await;
    (addr, said_rx, stream_opens, shutdown_tx, task)
}

fn transport_for(addr: SocketAddr) -> Arc<HttpTransport> {
    let options = TransportOptions::default().with_base_url(format!("http://{addr}"));
    Arc::new(HttpTransport::with_options(options).expect("build http transport"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn login_stream_backlog_and_reply_over_http() {
    let (addr, mut said_rx, _opens, shutdown_tx, server_task) = spawn_service().await;

    let client = ApiClient::login(
        transport_for(addr),
        TEST_EMAIL,
        &SecretString::new(TEST_PASSWORD.to_string()),
    )
    .await
    .expect("login against mock service");

    let mut bot = BotBuilder::new(client)
        .on("buffer_msg", |event| async move {
            if !event.from_backlog() && event.str("msg")? == "!ping" {
                event.reply("pong").await?;
            }
            Ok::<(), irccloud_sdk::HandlerError>(())
        })
        .start(CancellationToken::new())
        .expect("start bot");

    let mut seen = Vec::new();
    for _ in 0..3 {
        let event = timeout(Duration::from_secs(2), bot.recv())
            .await
            .expect("timed out waiting for stream event")
            .expect("event queue open");
        seen.push((event.event_type().to_string(), event.from_backlog()));
    }
    assert_eq!(
        seen,
        vec![
            ("header".to_string(), false),
            ("makeserver".to_string(), true),
            ("backlog_complete".to_string(), true),
        ]
    );

    let said = timeout(Duration::from_secs(2), said_rx.recv())
        .await
        .expect("timed out waiting for say")
        .expect("say channel open");
    assert_eq!(said.get("cid").map(String::as_str), Some("7"));
    assert_eq!(said.get("to").map(String::as_str), Some("#rust"));
    assert_eq!(said.get("msg").map(String::as_str), Some("pong"));
    assert_eq!(said.get("session").map(String::as_str), Some(TEST_SESSION));
    assert!(said_rx.try_recv().is_err(), "backlog message must not be answered");

    bot.shutdown();
    assert!(matches!(bot.err().await, Some(StreamError::Cancelled)));

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn login_with_wrong_password_is_rejected() {
    let (addr, _said_rx, _opens, shutdown_tx, server_task) = spawn_service().await;

    let err = ApiClient::login(
        transport_for(addr),
        TEST_EMAIL,
        &SecretString::new("wrong".to_string()),
    )
    .await
    .expect_err("wrong password must fail");
    assert!(matches!(err, ApiError::Unsuccessful { .. }), "got {err:?}");

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unauthorized_stream_is_terminal_without_reconnect() {
    let (addr, _said_rx, opens, shutdown_tx, server_task) = spawn_service().await;

    let client = ApiClient::with_session(
        transport_for(addr),
        SecretString::new("stale-session".to_string()),
    )
    .expect("client with session");
    let mut bot = BotBuilder::new(client)
        .options(BotOptions::default().with_auto_reconnect(false))
        .start(CancellationToken::new())
        .expect("start bot");

    let err = timeout(Duration::from_secs(2), bot.err())
        .await
        .expect("timed out waiting for terminal error")
        .expect("terminal error");
    match err {
        StreamError::Connect(ApiError::HttpStatus { status, .. }) => {
            assert_eq!(status, reqwest::StatusCode::UNAUTHORIZED)
        }
        other => panic!("unexpected terminal error: {other:?}"),
    }
    assert_eq!(*opens.lock().await, 1);

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

async fn formtoken_handler() -> impl IntoResponse {
    Json(json!({"success": true, "token": TEST_FORM_TOKEN}))
}

async fn login_handler(
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> impl IntoResponse {
    let token_header_matches = headers
        .get("x-auth-formtoken")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == TEST_FORM_TOKEN);
    let credentials_match = form.get("email").map(String::as_str) == Some(TEST_EMAIL)
        && form.get("password").map(String::as_str) == Some(TEST_PASSWORD)
        && form.get("token").map(String::as_str) == Some(TEST_FORM_TOKEN);

    if !token_header_matches || !credentials_match {
        return Json(json!({"success": false, "message": "auth"}));
    }
    Json(json!({"success": true, "session": TEST_SESSION}))
}

async fn stream_handler(State(state): State<ServiceState>, headers: HeaderMap) -> Response {
    *state.stream_opens.lock().await += 1;
    if !has_session_cookie(&headers) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"success": false, "message": "invalid_session"})),
        )
            .into_response();
    }

    let lines: Vec<Result<Bytes, Infallible>> = state
        .stream_lines
        .iter()
        .map(|line| Ok(Bytes::from(format!("{line}\n"))))
        .collect();
    let body = stream::iter(lines).chain(stream::pending());
    Body::from_stream(body).into_response()
}

async fn backlog_handler(headers: HeaderMap) -> Response {
    if !has_session_cookie(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let backlog = [
        json!({"type": "makeserver", "cid": 7, "hostname": "irc.example.net"}),
        json!({
            "type": "buffer_msg",
            "cid": 7,
            "chan": "#rust",
            "from": "bob",
            "msg": "!ping"
        }),
        json!({"type": "backlog_complete"}),
    ];
    let body = format!(
        "[\n{}\n]\n",
        backlog
            .iter()
            .map(Value::to_string)
            .collect::<Vec<_>>()
            .join(",\n")
    );
    body.into_response()
}

async fn say_handler(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> impl IntoResponse {
    if !has_session_cookie(&headers) {
        return Json(json!({"success": false, "message": "invalid_session"}));
    }
    let _ = state.said_tx.send(form);
    Json(json!({"success": true}))
}

fn has_session_cookie(headers: &HeaderMap) -> bool {
    headers
        .get("cookie")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == format!("session={TEST_SESSION}"))
}

async fn spawn_server(
    app: Router,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server listener");
    let addr = listener
        .local_addr()
        .expect("read mock server listener address");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("mock server should run");
    });
    (addr, shutdown_tx, task)
}
