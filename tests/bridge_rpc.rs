//! SQL bridge and identity service tests against an in-process HTTP server.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use supabase_selfhost::auth::{GoTrueVerifier, TokenVerifier};
use supabase_selfhost::error::TransportError;
use supabase_selfhost::executor::DualTransportExecutor;
use supabase_selfhost::functions::{
    FunctionDefinition, FunctionFile, FunctionRecords, FunctionStatus, RestFunctionRecords,
};
use supabase_selfhost::transport::{Row, RpcBridge, SqlTransport, TransportKind};

const SERVICE_KEY: &str = "service-key";

#[derive(Clone, Default)]
struct Recorded {
    calls: Arc<Mutex<Vec<Value>>>,
}

async fn execute_sql(State(recorded): State<Recorded>, headers: HeaderMap, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    let authorized = headers.get("apikey").and_then(|v| v.to_str().ok()) == Some(SERVICE_KEY);
    if !authorized {
        return (StatusCode::UNAUTHORIZED, Json(json!({"message": "Invalid API key"})));
    }
    recorded.calls.lock().unwrap().push(body.clone());

    match body["query"].as_str().unwrap_or_default() {
        "select 1 as n" => (StatusCode::OK, Json(json!([{"n": 1}]))),
        "create table t()" => (StatusCode::OK, Json(Value::Null)),
        "select broken" => (
            StatusCode::BAD_REQUEST,
            Json(json!({"code": "42703", "message": "column \"broken\" does not exist"})),
        ),
        _ => (StatusCode::OK, Json(json!({"unexpected": "shape"}))),
    }
}

async fn admin_users(headers: HeaderMap) -> StatusCode {
    match headers.get("authorization").and_then(|v| v.to_str().ok()) {
        Some(value) if value == format!("Bearer {SERVICE_KEY}") => StatusCode::OK,
        _ => StatusCode::FORBIDDEN,
    }
}

async fn spawn_fake_instance() -> (SocketAddr, Recorded) {
    let recorded = Recorded::default();
    let app = Router::new()
        .route("/rest/v1/rpc/execute_sql", post(execute_sql))
        .route("/auth/v1/admin/users", get(admin_users))
        .with_state(recorded.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, recorded)
}

fn bridge(addr: SocketAddr, key: &str) -> RpcBridge {
    RpcBridge::new(&format!("http://{addr}/"), key, "execute_sql")
}

/// Direct transport whose database is unreachable
struct DownDirect;

#[async_trait]
impl SqlTransport for DownDirect {
    fn kind(&self) -> TransportKind {
        TransportKind::Direct
    }

    async fn execute(&self, _sql: &str, _read_only: bool) -> Result<Vec<Row>, TransportError> {
        Err(TransportError::Connect("connection refused".to_string()))
    }
}

#[tokio::test]
async fn bridge_returns_rows_and_forwards_read_only() {
    let (addr, recorded) = spawn_fake_instance().await;
    let rows = bridge(addr, SERVICE_KEY).execute("select 1 as n", true).await.unwrap();

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["n"], 1);
    assert_eq!(
        recorded.calls.lock().unwrap()[0],
        json!({"query": "select 1 as n", "read_only": true})
    );
}

#[tokio::test]
async fn bridge_null_result_is_empty() {
    let (addr, _) = spawn_fake_instance().await;
    let rows = bridge(addr, SERVICE_KEY).execute("create table t()", false).await.unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn bridge_surfaces_postgrest_message() {
    let (addr, _) = spawn_fake_instance().await;
    let err = bridge(addr, SERVICE_KEY).execute("select broken", false).await.unwrap_err();
    match err {
        TransportError::Remote { status, body } => {
            assert_eq!(status, 400);
            assert!(body.contains("does not exist"));
        }
        other => panic!("expected remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn bridge_rejects_unexpected_shape() {
    let (addr, _) = spawn_fake_instance().await;
    let err = bridge(addr, SERVICE_KEY).execute("select 'other'", false).await.unwrap_err();
    assert!(matches!(err, TransportError::Malformed(_)));
}

#[tokio::test]
async fn executor_falls_back_to_bridge_silently() {
    let (addr, recorded) = spawn_fake_instance().await;
    let executor = DualTransportExecutor::new(Some(Arc::new(DownDirect)), Arc::new(bridge(addr, SERVICE_KEY)));

    let rows = executor.execute("select 1 as n", false).await.unwrap();
    assert_eq!(rows[0]["n"], 1);
    assert_eq!(recorded.calls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn executor_reports_every_failed_transport() {
    let (addr, _) = spawn_fake_instance().await;
    let executor = DualTransportExecutor::new(Some(Arc::new(DownDirect)), Arc::new(bridge(addr, "wrong-key")));

    let err = executor.execute("select 1 as n", false).await.unwrap_err();
    assert_eq!(err.kind(), "upstream_error");
    let message = err.to_string();
    assert!(message.contains("direct"));
    assert!(message.contains("bridge"));
    assert!(message.contains("Invalid API key"));
}

#[tokio::test]
async fn verifier_accepts_privileged_token_only() {
    let (addr, _) = spawn_fake_instance().await;
    let verifier = GoTrueVerifier::new(&format!("http://{addr}"));

    verifier.verify(SERVICE_KEY).await.unwrap();
    let err = verifier.verify("anon-key").await.unwrap_err();
    assert_eq!(err.kind(), "unauthorized");
}

/// Answers one request with a 500 whose body stops short of its declared length
async fn spawn_truncating_server() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
            if let Some(end) = request.windows(4).position(|w| w == b"\r\n\r\n") {
                let headers = String::from_utf8_lossy(&request[..end]).to_lowercase();
                let length = headers
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if request.len() >= end + 4 + length {
                    break;
                }
            }
        }
        socket
            .write_all(b"HTTP/1.1 500 Internal Server Error\r\ncontent-type: application/json\r\ncontent-length: 100\r\n\r\n{\"message\":")
            .await
            .unwrap();
        socket.shutdown().await.ok();
    });
    addr
}

#[tokio::test]
async fn bridge_reports_unreadable_error_body() {
    let addr = spawn_truncating_server().await;
    let err = bridge(addr, SERVICE_KEY).execute("select 1 as n", false).await.unwrap_err();
    match err {
        TransportError::Remote { status, body } => {
            assert_eq!(status, 500);
            assert!(body.contains("unreadable response body"), "{body}");
        }
        other => panic!("expected remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn record_store_reports_unreadable_error_body() {
    let addr = spawn_truncating_server().await;
    let records = RestFunctionRecords::new(&format!("http://{addr}"), SERVICE_KEY);
    let err = records.list().await.unwrap_err();
    assert_eq!(err.kind(), "upstream_error");
    assert!(err.to_string().contains("unreadable response body"));
}

/// Version held by the fake `deploy_edge_function` procedure
#[derive(Clone, Default)]
struct StoredVersion(Arc<Mutex<Option<i64>>>);

async fn deploy_edge_function(State(stored): State<StoredVersion>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    let mut current = stored.0.lock().unwrap();
    match (body["expected_version"].as_i64(), *current) {
        (None, None) => {}
        (None, Some(_)) => {
            return (
                StatusCode::CONFLICT,
                Json(json!({"code": "23505", "message": "duplicate key value violates unique constraint"})),
            )
        }
        (Some(expected), Some(version)) if expected == version => {}
        (Some(expected), _) => {
            return (
                StatusCode::CONFLICT,
                Json(json!({"code": "PT409", "message": format!("function hello changed since version {expected} was read")})),
            )
        }
    }
    *current = body["definition"]["version"].as_i64();
    (StatusCode::OK, Json(json!([body["definition"]])))
}

async fn spawn_record_store() -> SocketAddr {
    let app = Router::new()
        .route("/rest/v1/rpc/deploy_edge_function", post(deploy_edge_function))
        .with_state(StoredVersion::default());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn hello(version: i64) -> FunctionDefinition {
    let now = Utc::now();
    FunctionDefinition {
        id: "6f1c1a2e-0000-4000-8000-000000000000".to_string(),
        name: "hello".to_string(),
        slug: "hello".to_string(),
        status: FunctionStatus::Active,
        version,
        entrypoint_path: "index.ts".to_string(),
        import_map_path: None,
        verify_jwt: true,
        created_at: now,
        updated_at: now,
    }
}

fn index(content: &str) -> Vec<FunctionFile> {
    vec![FunctionFile {
        name: "index.ts".to_string(),
        content: content.to_string(),
    }]
}

#[tokio::test]
async fn record_store_maps_rejected_deploys_to_conflict() {
    let addr = spawn_record_store().await;
    let records = RestFunctionRecords::new(&format!("http://{addr}"), SERVICE_KEY);

    assert_eq!(records.create(&hello(1), &index("X")).await.unwrap().version, 1);
    assert_eq!(records.create(&hello(1), &index("X")).await.unwrap_err().kind(), "conflict");

    assert_eq!(records.advance(1, &hello(2), &index("Y")).await.unwrap().version, 2);
    let err = records.advance(1, &hello(2), &index("Z")).await.unwrap_err();
    assert_eq!(err.kind(), "conflict");
    assert!(err.to_string().contains("changed since version 1"));
}
