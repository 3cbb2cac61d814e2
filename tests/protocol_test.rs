//! Protocol server round trips over a loopback socket

use bao_server::client::{send_model_load, send_sequence};
use bao_server::model::Predictor;
use bao_server::{BufferSnapshot, ExperienceStore, Plan, PlanRegressor, ProtocolServer, ServerState};
use serde_json::{json, Value};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

struct Running {
    dir: TempDir,
    addr: String,
    state: ServerState,
}

async fn start_server() -> Running {
    let dir = tempfile::tempdir().unwrap();
    let store = ExperienceStore::open(dir.path().join("bao.db")).await.unwrap();
    let server = ProtocolServer::bind("127.0.0.1:0", ServerState::new(store)).await.unwrap();
    let addr = server.local_addr().unwrap().to_string();
    let state = server.state().clone();
    tokio::spawn(server.run());
    Running { dir, addr, state }
}

fn plan(join: &str, cost: f64) -> Value {
    json!({
        "Plan": {
            "Node Type": join, "Total Cost": cost, "Plan Rows": 10.0,
            "Plans": [
                {"Node Type": "Seq Scan", "Relation Name": "title", "Total Cost": cost / 2.0, "Plan Rows": 100.0},
                {"Node Type": "Index Scan", "Relation Name": "kind_type", "Index Name": "kind_type_pkey",
                 "Total Cost": 1.0, "Plan Rows": 7.0}
            ]
        }
    })
}

fn buffers() -> Value {
    json!({"title": 40, "kind_type_pkey": 2})
}

fn reward(pid: i64, ms: f64) -> Value {
    json!({"reward": ms, "pid": pid})
}

/// Write raw bytes and collect the response, ignoring resets from a server
/// that hung up early
async fn send_raw(addr: &str, bytes: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let _ = stream.write_all(bytes).await;
    let _ = stream.shutdown().await;

    let mut response = Vec::new();
    let _ = stream.read_to_end(&mut response).await;
    response
}

async fn report(addr: &str, join: &str, cost: f64, ms: f64) {
    let response = send_sequence(addr, &[json!({"type": "reward"}), plan(join, cost), buffers(), reward(1, ms)])
        .await
        .unwrap();
    assert!(response.is_empty());
}

#[tokio::test]
async fn test_query_without_model_selects_native() {
    let server = start_server().await;

    let response = send_sequence(&server.addr, &[
        json!({"type": "query"}),
        plan("Hash Join", 10.0),
        plan("Nested Loop", 20.0),
        plan("Merge Join", 30.0),
        buffers(),
    ]).await.unwrap();

    assert_eq!(response.len(), 4);
    assert_eq!(u32::from_ne_bytes(response[..4].try_into().unwrap()), 0);
}

#[tokio::test]
async fn test_predict_without_model_is_nan() {
    let server = start_server().await;

    let response = send_sequence(&server.addr, &[json!({"type": "predict"}), plan("Hash Join", 10.0), buffers()])
        .await
        .unwrap();

    assert_eq!(response.len(), 8);
    assert!(f64::from_ne_bytes(response[..8].try_into().unwrap()).is_nan());
}

#[tokio::test]
async fn test_reward_is_stored_with_buffers() {
    let server = start_server().await;
    report(&server.addr, "Hash Join", 10.0, 123.5).await;

    let experience = server.state.store.experience().await.unwrap();
    assert_eq!(experience.len(), 1);
    let (stored, ms) = &experience[0];
    assert_eq!(*ms, 123.5);
    assert_eq!(stored.buffers.as_ref().and_then(|b| b.get("title")), Some(&40));
    assert_eq!(server.state.store.last_reward_id_for_pid(1).await.unwrap(), Some(1));
}

#[tokio::test]
async fn test_fragmented_delivery() {
    let server = start_server().await;

    let body = [json!({"type": "predict"}), plan("Hash Join", 10.0), buffers(), json!({"final": true})]
        .iter()
        .map(|m| format!("{}\n", m))
        .collect::<String>();
    let bytes = body.as_bytes();

    let mut stream = TcpStream::connect(&server.addr).await.unwrap();
    for piece in bytes.chunks(7) {
        stream.write_all(piece).await.unwrap();
        stream.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    stream.shutdown().await.unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    assert_eq!(response.len(), 8);
}

#[tokio::test]
async fn test_malformed_json_gets_no_response() {
    let server = start_server().await;

    let response = send_raw(&server.addr, b"{\"type\": \"query\"}\n{broken\n{\"final\": true}\n").await;
    assert!(response.is_empty());

    // server keeps serving other connections
    let ok = send_sequence(&server.addr, &[json!({"type": "query"}), buffers()]).await.unwrap();
    assert_eq!(ok.len(), 4);
}

#[tokio::test]
async fn test_unknown_type_gets_no_response() {
    let server = start_server().await;

    let response = send_raw(&server.addr, b"{\"type\": \"shutdown\"}\n{\"final\": true}\n").await;
    assert!(response.is_empty());
}

#[tokio::test]
async fn test_load_model_then_select() {
    let server = start_server().await;

    for i in 1..=8 {
        let cost = 10.0 * i as f64;
        report(&server.addr, "Hash Join", cost, cost).await;
        report(&server.addr, "Nested Loop", cost, 4.0 * cost).await;
    }

    let (plans, rewards): (Vec<Plan>, Vec<f64>) = server.state.store.experience().await.unwrap().into_iter().unzip();
    let mut model = PlanRegressor::new();
    model.fit(&plans, &rewards).unwrap();
    let model_path = server.dir.path().join("model");
    model.save(&model_path).unwrap();

    send_model_load(&server.addr, &model_path).await.unwrap();
    assert!(server.state.model.is_loaded().await);

    let candidates = vec![plan("Nested Loop", 40.0), plan("Hash Join", 40.0), plan("Merge Join", 40.0)];
    let mut sequence = vec![json!({"type": "query"})];
    sequence.extend(candidates.iter().cloned());
    sequence.push(buffers());

    let response = send_sequence(&server.addr, &sequence).await.unwrap();
    let selected = u32::from_ne_bytes(response[..4].try_into().unwrap()) as usize;

    let snapshot: BufferSnapshot = serde_json::from_value(buffers()).unwrap();
    let with_buffers: Vec<Plan> = candidates.into_iter()
        .map(|p| serde_json::from_value::<Plan>(p).unwrap().with_buffers(&snapshot))
        .collect();
    let expected = model.predict(&with_buffers).unwrap();
    assert_eq!(Some(selected), bao_server::model::argmin(&expected));
}

#[tokio::test]
async fn test_load_model_failure_keeps_serving() {
    let server = start_server().await;

    send_model_load(&server.addr, &server.dir.path().join("nope")).await.unwrap();
    assert!(!server.state.model.is_loaded().await);

    let response = send_sequence(&server.addr, &[json!({"type": "query"}), plan("Hash Join", 1.0), buffers()])
        .await
        .unwrap();
    assert_eq!(u32::from_ne_bytes(response[..4].try_into().unwrap()), 0);
}
