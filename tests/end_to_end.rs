//! Full-stack test: configuration, a line-framed TCP backend, governance,
//! and a file-backed audit log.

use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use gov_bridge_core::config::AppConfig;
use gov_bridge_core::{AuditFilter, AuditRecord, AuditRecordKind, AuditStore, ErrorKind, InvocationStatus};
use gov_bridge_gateway::Bridge;
use gov_bridge_store::{open_audit_store, JsonlAuditStore};

// =============================================================================
// Fake backend
// =============================================================================

fn reply(request: &Value) -> Option<Value> {
    let result = match request["method"].as_str() {
        Some("initialize") => json!({
            "protocolVersion": "2025-03-26",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "library", "version": "0.1.0"}
        }),
        Some("tools/list") => json!({"tools": [{"name": "lookup"}, {"name": "hangup"}]}),
        Some("tools/call") if request["params"]["name"] == "hangup" => return None,
        Some("tools/call") => json!({
            "content": [{"type": "text", "text": format!("found {}", request["params"]["arguments"]["title"])}]
        }),
        _ => json!(null),
    };
    Some(json!({"jsonrpc": "2.0", "id": request["id"], "result": result}))
}

async fn serve(socket: TcpStream) {
    let (read, mut write) = socket.into_split();
    let mut lines = BufReader::new(read).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let request: Value = serde_json::from_str(&line).unwrap();
        if request.get("id").is_none() {
            continue;
        }
        let Some(response) = reply(&request) else {
            return;
        };
        let mut frame = serde_json::to_vec(&response).unwrap();
        frame.push(b'\n');
        if write.write_all(&frame).await.is_err() {
            return;
        }
    }
}

async fn spawn_backend() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(serve(socket));
        }
    });
    address
}

fn config(address: &str, audit_path: &str) -> AppConfig {
    AppConfig::from_toml_str(&format!(
        r#"
        [governance]
        call_timeout_ms = 2000

        [audit]
        backend = "jsonl"
        path = '{audit_path}'

        [backends.library]
        transport = "stream"
        address = "{address}"

        [backends.library.policy]
        blocked_patterns = ['forbidden\s+archive']
        "#
    ))
    .unwrap()
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_governed_calls_over_tcp_are_audited() {
    let dir = tempfile::tempdir().unwrap();
    let audit_path = dir.path().join("audit.jsonl");
    let address = spawn_backend().await;
    let config = config(&address, audit_path.to_str().unwrap());

    let store = open_audit_store(&config.audit).unwrap();
    let bridge = Bridge::from_config(&config, store).await.unwrap();

    // undeclared tools are discovered at startup
    let snapshot = bridge.policies().snapshot();
    assert!(snapshot.knows_tool("library", "lookup"));
    assert!(!snapshot.knows_tool("library", "delete"));

    let interceptor = bridge.interceptor();
    let ok = interceptor
        .handle(Some("reader"), "library", "lookup", json!({"title": "Dune"}))
        .await
        .unwrap();
    assert_eq!(ok.output.text, r#"found "Dune""#);

    let blocked = interceptor
        .handle(Some("reader"), "library", "lookup", json!({"title": "Forbidden   Archive"}))
        .await
        .unwrap_err();
    assert_eq!(blocked.kind(), ErrorKind::BlockedPattern);

    let unknown = interceptor
        .handle(Some("reader"), "library", "delete", json!({}))
        .await
        .unwrap_err();
    assert_eq!(unknown.kind(), ErrorKind::UnknownTarget);

    let session = interceptor.tracker().session_usage("reader").unwrap();
    assert_eq!(session.allowed, 1);
    assert_eq!(session.denied, 2);
    assert_eq!(session.success, 1);

    bridge.shutdown().await;

    // the log survives the process and reads back in order
    let reopened = JsonlAuditStore::new(&audit_path);
    let records = reopened
        .query(AuditFilter {
            session_id: Some("reader".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    let decisions = records
        .iter()
        .filter(|r| r.kind() == AuditRecordKind::Decision)
        .count();
    assert_eq!(decisions, 3);

    let finals: Vec<InvocationStatus> = records
        .iter()
        .filter_map(|r| match r {
            AuditRecord::Invocation(inv) if inv.status != InvocationStatus::Pending => Some(inv.status),
            _ => None,
        })
        .collect();
    assert_eq!(
        finals,
        vec![InvocationStatus::Success, InvocationStatus::Denied, InvocationStatus::Denied]
    );
}

#[tokio::test]
async fn test_backend_hangup_is_reported_and_audited() {
    let dir = tempfile::tempdir().unwrap();
    let audit_path = dir.path().join("audit.jsonl");
    let address = spawn_backend().await;
    let config = config(&address, audit_path.to_str().unwrap());

    let store: Arc<dyn AuditStore> = open_audit_store(&config.audit).unwrap();
    let bridge = Bridge::from_config(&config, store.clone()).await.unwrap();

    let failure = bridge
        .interceptor()
        .handle(None, "library", "hangup", json!({}))
        .await
        .unwrap_err();
    assert_eq!(failure.kind(), ErrorKind::BackendUnavailable);
    assert_eq!(failure.session_id.len(), 36);

    // the connection is gone; later calls fail fast without a redial
    let again = bridge
        .interceptor()
        .handle(None, "library", "lookup", json!({"title": "Dune"}))
        .await
        .unwrap_err();
    assert_eq!(again.kind(), ErrorKind::BackendUnavailable);

    bridge.tracker().flush().await;
    let records = store
        .query(AuditFilter::invocation(&failure.invocation_id))
        .await
        .unwrap();
    match records.last() {
        Some(AuditRecord::Invocation(inv)) => {
            assert_eq!(inv.status, InvocationStatus::Error);
            assert_eq!(inv.error_kind(), Some(ErrorKind::BackendUnavailable));
        }
        other => panic!("expected invocation record, got {:?}", other),
    }
    bridge.shutdown().await;
}
