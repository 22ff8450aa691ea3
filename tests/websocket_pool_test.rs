//! End-to-end pool tests against an in-process WebSocket server.
//!
//! The server speaks the JSON request/response protocol and scripts a few
//! methods (`echo`, `flaky`, `slow`, `drop`, ...) to drive the pool through
//! its retry, reconnect and shutdown paths.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::future::join_all;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing_subscriber::EnvFilter;

use rpc_pool::protocol::{Request, Response};
use rpc_pool::{API_VERSION, ConnectionPool, Credentials, Error, PoolConfig, WsConnector};

// ============================================================================
// Scripted Server
// ============================================================================

struct ServerState {
    version: String,
    username: Option<String>,
    flaky_failures: AtomicUsize,
    connections: AtomicUsize,
    logins: AtomicUsize,
    calls: Mutex<Vec<String>>,
}

#[derive(Default)]
struct Session {
    authenticated: bool,
    namespace: Option<String>,
}

impl ServerState {
    fn new() -> Self {
        Self {
            version: API_VERSION.to_string(),
            username: None,
            flaky_failures: AtomicUsize::new(0),
            connections: AtomicUsize::new(0),
            logins: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn with_version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    fn with_user(mut self, username: &str) -> Self {
        self.username = Some(username.to_string());
        self
    }

    fn with_flaky_failures(self, failures: usize) -> Self {
        self.flaky_failures.store(failures, Ordering::SeqCst);
        self
    }

    fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    fn logins(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    fn calls_to(&self, method: &str) -> usize {
        self.calls.lock().iter().filter(|m| *m == method).count()
    }

    /// Returns `None` to hang up instead of answering.
    async fn handle(&self, session: &mut Session, request: Request) -> Option<Response> {
        self.calls.lock().push(request.method.clone());
        let id = request.id;

        let response = match request.method.as_str() {
            "describe_version" => Response::success(id, json!(self.version)),
            "login" => {
                let username = request
                    .params
                    .first()
                    .and_then(|credentials| credentials.get("username"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();

                if self.username.as_deref() == Some(username) {
                    session.authenticated = true;
                    self.logins.fetch_add(1, Ordering::SeqCst);
                    Response::success(id, Value::Null)
                } else {
                    Response::error(id, "authentication", format!("unknown user {username}"))
                }
            }
            _ if self.username.is_some() && !session.authenticated => {
                Response::error(id, "authentication", "login required")
            }
            "set_namespace" => match request.params.first().and_then(Value::as_str) {
                Some("missing") => Response::error(id, "invalid_request", "no such namespace"),
                namespace => {
                    session.namespace = namespace.map(str::to_string);
                    Response::success(id, Value::Null)
                }
            },
            "namespace" => Response::success(id, json!(session.namespace)),
            "echo" => Response::success(id, json!(request.params)),
            "flaky" => {
                let failing = self
                    .flaky_failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if failing {
                    Response::error(id, "unavailable", "try again")
                } else {
                    Response::success(id, json!("recovered"))
                }
            }
            "missing" => Response::error(id, "invalid_request", "no such column family"),
            "slow" => {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Response::success(id, json!("done"))
            }
            "drop" => return None,
            other => Response::error(id, "unknown_method", format!("no method {other}")),
        };

        Some(response)
    }
}

async fn serve_connection(ws: WebSocketStream<TcpStream>, state: Arc<ServerState>) {
    state.connections.fetch_add(1, Ordering::SeqCst);
    let (mut write, mut read) = ws.split();
    let mut session = Session::default();

    while let Some(Ok(Message::Text(text))) = read.next().await {
        let request: Request = serde_json::from_str(&text).expect("request");

        let Some(response) = state.handle(&mut session, request).await else {
            let _ = write.close().await;
            return;
        };

        let json = serde_json::to_string(&response).expect("json");
        if write.send(Message::Text(json.into())).await.is_err() {
            return;
        }
    }
}

async fn spawn_server(state: ServerState) -> (String, Arc<ServerState>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let url = format!("ws://{}", listener.local_addr().expect("addr"));
    let state = Arc::new(state);
    let shared = Arc::clone(&state);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let state = Arc::clone(&shared);
            tokio::spawn(async move {
                if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                    serve_connection(ws, state).await;
                }
            });
        }
    });

    (url, state)
}

// ============================================================================
// Helpers
// ============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config() -> PoolConfig {
    PoolConfig::new().with_reconnect_delay(Duration::from_millis(10), Duration::from_millis(50))
}

async fn connect(url: &str, config: PoolConfig) -> rpc_pool::Result<Arc<ConnectionPool>> {
    let connector = Arc::new(WsConnector::new(url)?);
    ConnectionPool::connect(config, connector).await
}

async fn eventually(mut check: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_pool_serves_concurrent_calls() {
    init_tracing();
    let (url, server) = spawn_server(ServerState::new().with_user("app")).await;

    let pool = connect(
        &url,
        config()
            .with_pool_size(3)
            .with_namespace("users")
            .with_api_version_check()
            .with_credentials(Credentials::new().with("username", "app")),
    )
    .await
    .expect("connect");
    eventually(|| pool.connection_count() == 3).await;

    let pending: Vec<_> = (0..20)
        .map(|i| pool.push_request("echo", vec![json!(i)]))
        .collect();
    let results = join_all(pending).await;

    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.expect("echo"), json!([i]));
    }
    assert_eq!(pool.call("namespace", vec![]).await.expect("ns"), json!("users"));
    assert_eq!(server.logins(), 3);
    assert_eq!(pool.pending_count(), 0);

    pool.shutdown();
}

#[tokio::test]
async fn test_remote_faults_are_retried() -> anyhow::Result<()> {
    init_tracing();
    let (url, server) = spawn_server(ServerState::new().with_flaky_failures(2)).await;
    let pool = connect(&url, config().with_retries(2)).await?;

    let value = pool.call("flaky", vec![]).await?;

    assert_eq!(value, json!("recovered"));
    assert_eq!(server.calls_to("flaky"), 3);
    pool.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_exhausted_retries_return_remote_error() {
    init_tracing();
    let (url, server) = spawn_server(ServerState::new().with_flaky_failures(5)).await;
    let pool = connect(&url, config().with_retries(1)).await.expect("connect");

    let err = pool.call("flaky", vec![]).await.unwrap_err();

    assert!(matches!(err, Error::Remote { ref code, .. } if code == "unavailable"));
    assert_eq!(server.calls_to("flaky"), 2);
    pool.shutdown();
}

#[tokio::test]
async fn test_invalid_request_is_not_retried() {
    init_tracing();
    let (url, server) = spawn_server(ServerState::new()).await;
    let pool = connect(&url, config().with_retries(3)).await.expect("connect");

    let err = pool.call("missing", vec![]).await.unwrap_err();

    assert!(matches!(err, Error::InvalidRequest { .. }));
    assert_eq!(server.calls_to("missing"), 1);
    pool.shutdown();
}

#[tokio::test]
async fn test_version_mismatch_fails_setup() {
    init_tracing();
    let (url, _server) = spawn_server(ServerState::new().with_version("20.0.0")).await;

    let result = connect(&url, config().with_api_version_check()).await;

    match result {
        Err(Error::Setup(inner)) => assert!(matches!(*inner, Error::ApiMismatch { .. })),
        other => panic!("expected setup failure, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_bad_credentials_fail_setup() {
    init_tracing();
    let (url, _server) = spawn_server(ServerState::new().with_user("app")).await;

    let result = connect(
        &url,
        config().with_credentials(Credentials::new().with("username", "intruder")),
    )
    .await;

    match result {
        Err(Error::Setup(inner)) => assert!(matches!(*inner, Error::Authentication { .. })),
        other => panic!("expected setup failure, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_reconnects_after_server_hangup() {
    init_tracing();
    let (url, server) = spawn_server(ServerState::new()).await;
    let pool = connect(&url, config().with_pool_size(2)).await.expect("connect");
    eventually(|| pool.connection_count() == 2).await;

    let err = pool
        .push_request_with_retries("drop", vec![], 0)
        .await
        .unwrap_err();
    assert!(err.is_connection_error());

    eventually(|| server.connections() == 3 && pool.connection_count() == 2).await;
    assert_eq!(pool.call("echo", vec![json!("back")]).await.expect("echo"), json!(["back"]));

    pool.shutdown();
}

#[tokio::test]
async fn test_broadcasts_reach_every_connection() {
    init_tracing();
    let (url, server) = spawn_server(ServerState::new().with_user("app")).await;
    let pool = connect(
        &url,
        config()
            .with_pool_size(2)
            .with_credentials(Credentials::new().with("username", "app")),
    )
    .await
    .expect("connect");
    eventually(|| pool.connection_count() == 2).await;

    pool.set_namespace("archive").await.expect("set namespace");
    for _ in 0..4 {
        assert_eq!(pool.call("namespace", vec![]).await.expect("ns"), json!("archive"));
    }

    let err = pool.set_namespace("missing").await.unwrap_err();
    assert!(matches!(err, Error::Broadcast { failed: 2, total: 2, .. }));

    let logins = server.logins();
    pool.reauthenticate(Credentials::new().with("username", "app"))
        .await
        .expect("reauthenticate");
    assert_eq!(server.logins(), logins + 2);

    pool.shutdown();
}

#[tokio::test]
async fn test_shutdown_fails_in_flight_and_queued() {
    init_tracing();
    let (url, _server) = spawn_server(ServerState::new()).await;
    let pool = connect(&url, config()).await.expect("connect");

    let slow = pool.push_request("slow", vec![]);
    let queued = pool.push_request("echo", vec![]);
    tokio::time::sleep(Duration::from_millis(20)).await;

    pool.shutdown();

    assert!(matches!(slow.await, Err(Error::Shutdown)));
    assert!(matches!(queued.await, Err(Error::Shutdown)));
    assert!(matches!(pool.call("echo", vec![]).await, Err(Error::Shutdown)));
    assert_eq!(pool.connection_count(), 0);
}
