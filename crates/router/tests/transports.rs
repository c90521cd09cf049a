//! Transport tests against in-process fake backends.

use axum::{
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use gov_bridge_core::{BackendHealth, BackendSpec, BackendTransport, Error, TransportSpec};
use gov_bridge_router::{BackendRouter, HttpTransport, PipeTransport, StreamTransport};

const TIMEOUT: Duration = Duration::from_secs(2);

enum Reply {
    Result(Value),
    Error(&'static str),
    Hangup,
    Garbage,
}

fn respond(request: &Value) -> Reply {
    match request["method"].as_str() {
        Some("initialize") => Reply::Result(json!({
            "protocolVersion": "2025-03-26",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "fake", "version": "0.0.1"}
        })),
        Some("tools/list") => Reply::Result(json!({
            "tools": [{"name": "echo"}, {"name": "fail"}, {"name": "hangup"}, {"name": "stream"}]
        })),
        Some("tools/call") => match request["params"]["name"].as_str() {
            Some("echo") | Some("stream") => Reply::Result(json!({
                "content": [{"type": "text", "text": request["params"]["arguments"].to_string()}]
            })),
            Some("fail") => Reply::Result(json!({
                "content": [{"type": "text", "text": "nothing there"}],
                "isError": true
            })),
            Some("hangup") => Reply::Hangup,
            Some("garbage") => Reply::Garbage,
            _ => Reply::Error("unknown tool"),
        },
        _ => Reply::Error("method not found"),
    }
}

fn envelope(id: Value, reply: Reply) -> Option<Value> {
    match reply {
        Reply::Result(result) => Some(json!({"jsonrpc": "2.0", "id": id, "result": result})),
        Reply::Error(message) => Some(json!({
            "jsonrpc": "2.0", "id": id, "error": {"code": -32601, "message": message}
        })),
        Reply::Hangup | Reply::Garbage => None,
    }
}

// =============================================================================
// Line-framed TCP backend
// =============================================================================

async fn serve_connection(socket: TcpStream) {
    let (read, mut write) = socket.into_split();
    let mut lines = BufReader::new(read).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let request: Value = serde_json::from_str(&line).unwrap();
        let Some(id) = request.get("id").cloned() else {
            continue;
        };
        let response = match respond(&request) {
            Reply::Garbage => {
                if write.write_all(b"\xff\xfe garbage\n").await.is_err() {
                    return;
                }
                continue;
            }
            reply => envelope(id, reply),
        };
        let Some(response) = response else {
            return;
        };
        let mut frame = serde_json::to_vec(&response).unwrap();
        frame.push(b'\n');
        if write.write_all(&frame).await.is_err() {
            return;
        }
    }
}

async fn spawn_stream_backend() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(serve_connection(socket));
        }
    });
    address
}

#[tokio::test]
async fn test_stream_call_and_list() {
    let address = spawn_stream_backend().await;
    let transport = StreamTransport::connect("tcp", &address).await.unwrap();

    let tools = transport.list_tools().await.unwrap();
    assert!(tools.contains(&"echo".to_string()));

    let output = transport.call_tool("echo", json!({"q": "hello"})).await.unwrap();
    assert_eq!(output.text, r#"{"q":"hello"}"#);
    assert!(!output.is_error);

    let output = transport.call_tool("fail", json!({})).await.unwrap();
    assert!(output.is_error);

    let err = transport.call_tool("nope", json!({})).await.unwrap_err();
    assert!(matches!(err, Error::Backend(_)));
}

#[tokio::test]
async fn test_stream_hangup_mid_call() {
    let address = spawn_stream_backend().await;
    let router = BackendRouter::new();
    router
        .register(BackendSpec::new("tcp", TransportSpec::Stream { address }))
        .await
        .unwrap();

    let err = router
        .dispatch("tcp", "hangup", json!({}), TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BackendUnavailable(_)));
    assert_eq!(router.backends()[0].health, BackendHealth::Disconnected);
}

#[tokio::test]
async fn test_stream_survives_malformed_frame() {
    let address = spawn_stream_backend().await;
    let router = BackendRouter::new();
    router
        .register(BackendSpec::new("tcp", TransportSpec::Stream { address }))
        .await
        .unwrap();

    // the garbled reply is dropped, so the call runs out its time
    let err = router
        .dispatch("tcp", "garbage", json!({}), Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    assert_eq!(router.backends()[0].health, BackendHealth::Connected);

    let output = router
        .dispatch("tcp", "echo", json!({"after": "garbage"}), TIMEOUT)
        .await
        .unwrap();
    assert_eq!(output.text, r#"{"after":"garbage"}"#);
}

#[tokio::test]
async fn test_stream_connect_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);

    let err = StreamTransport::connect("tcp", &address).await.err().unwrap();
    assert!(matches!(err, Error::BackendUnavailable(_)));
}

#[tokio::test]
async fn test_router_discovers_tools() {
    let address = spawn_stream_backend().await;
    let router = BackendRouter::new();
    router
        .register(BackendSpec::new("tcp", TransportSpec::Stream { address }))
        .await
        .unwrap();

    let tools = router.discover_tools("tcp").await.unwrap();
    assert_eq!(tools.len(), 4);
    assert_eq!(router.backends()[0].tools, tools);

    router.shutdown().await;
    assert!(router.backends().is_empty());
}

// =============================================================================
// HTTP backend
// =============================================================================

const SESSION: &str = "session-1";

async fn http_handler(headers: HeaderMap, Json(request): Json<Value>) -> Response {
    let Some(id) = request.get("id").cloned() else {
        return StatusCode::ACCEPTED.into_response();
    };

    if request["method"] == "initialize" {
        let body = envelope(id, respond(&request));
        return ([("mcp-session-id", SESSION)], Json(body)).into_response();
    }

    let session = headers.get("mcp-session-id").and_then(|v| v.to_str().ok());
    if session != Some(SESSION) {
        return StatusCode::BAD_REQUEST.into_response();
    }

    let streamed = request["params"]["name"] == "stream";
    let Some(body) = envelope(id, respond(&request)) else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    if streamed {
        let events = format!(
            "event: message\ndata: {}\n\nevent: message\ndata: {}\n\n",
            json!({"jsonrpc": "2.0", "method": "notifications/progress", "params": {}}),
            body
        );
        ([(header::CONTENT_TYPE, "text/event-stream")], events).into_response()
    } else {
        Json(body).into_response()
    }
}

async fn spawn_http_backend() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let app = Router::new().route("/mcp", post(http_handler));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/mcp", address)
}

#[tokio::test]
async fn test_http_json_and_event_stream() {
    let url = spawn_http_backend().await;
    let transport = HttpTransport::connect("web", &url, &BTreeMap::new()).await.unwrap();

    // the session id from initialize is carried on later calls
    let output = transport.call_tool("echo", json!({"n": 1})).await.unwrap();
    assert_eq!(output.text, r#"{"n":1}"#);

    let output = transport.call_tool("stream", json!({"n": 2})).await.unwrap();
    assert_eq!(output.text, r#"{"n":2}"#);

    let err = transport.call_tool("hangup", json!({})).await.unwrap_err();
    assert!(matches!(err, Error::BackendUnavailable(_)));
}

#[tokio::test]
async fn test_http_router_registration() {
    let url = spawn_http_backend().await;
    let router = Arc::new(BackendRouter::new());
    router
        .register(BackendSpec::new(
            "web",
            TransportSpec::Http {
                url,
                headers: BTreeMap::from([("x-tenant".to_string(), "demo".to_string())]),
            },
        ))
        .await
        .unwrap();

    let output = router.dispatch("web", "fail", json!({}), TIMEOUT).await.unwrap();
    assert!(output.is_error);

    router.shutdown().await;
}

// =============================================================================
// Pipe backend
// =============================================================================

#[tokio::test]
async fn test_pipe_spawn_failure() {
    let spec = BackendSpec::new(
        "proc",
        TransportSpec::Pipe {
            command: "/nonexistent/gov-bridge-test-backend".to_string(),
            args: vec![],
            env: BTreeMap::new(),
        },
    );
    let err = BackendRouter::new().register(spec).await.unwrap_err();
    assert!(matches!(err, Error::BackendUnavailable(_)));
}

/// A tool server written in POSIX shell: answers every request by id.
const SHELL_BACKEND: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  [ -z "$id" ] && continue
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2025-03-26","capabilities":{},"serverInfo":{"name":"sh","version":"0"}}}\n' "$id" ;;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"greet"}]}}\n' "$id" ;;
    *)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"hello from pipe"}]}}\n' "$id" ;;
  esac
done
"#;

#[tokio::test]
async fn test_pipe_call_and_list() {
    let transport = PipeTransport::spawn(
        "proc",
        "sh",
        &["-c".to_string(), SHELL_BACKEND.to_string()],
        &BTreeMap::new(),
    )
    .await
    .unwrap();

    assert_eq!(transport.list_tools().await.unwrap(), vec!["greet"]);
    let output = transport.call_tool("greet", json!({"name": "ada"})).await.unwrap();
    assert_eq!(output.text, "hello from pipe");
    assert!(!output.is_error);
    assert!(transport.is_connected());

    transport.shutdown().await.unwrap();
    assert!(!transport.is_connected());
}
