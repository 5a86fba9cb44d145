//! Shared test harness: an in-process coordinator plus worker clients
//! speaking the real WebSocket protocol.

// Each test binary uses a different slice of the harness.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use iris_common::protocol::{CoordinatorFrame, WorkerFrame};
use iris_common::{NodeCapabilities, Quantization, TaskStatus};
use iris_server::api::{create_router, AppState};
use iris_server::classifier::Classifier;
use iris_server::config::Config;
use iris_server::db;
use iris_server::direct::DirectProcessor;
use iris_server::orchestrator::Orchestrator;
use iris_server::registry::NodeRegistry;
use iris_server::reputation::ReputationEngine;
use iris_server::stream::StreamRegistry;

pub type WorkerSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
}

/// Boot a full coordinator on an ephemeral port with an in-memory store.
pub async fn spawn_server(config: Config) -> TestServer {
    let config = Arc::new(config);
    let pool = db::create_pool(&config.database_url).await.expect("pool");
    db::run_migrations(&pool).await.expect("migrations");

    let registry = Arc::new(NodeRegistry::new(
        config.heartbeat_timeout(),
        Duration::from_millis(config.send_grace_ms),
    ));
    let (reputation, _engine_task) = ReputationEngine::start(
        pool.clone(),
        registry.clone(),
        config.reputation_floor,
        config.reputation_ceiling,
        config.weekly_decay_factor,
    )
    .await
    .expect("reputation engine");
    let streams = Arc::new(StreamRegistry::new(config.stream_queue_capacity));
    let classifier = Arc::new(Classifier::new(None, Duration::from_secs(1)));
    let direct = Arc::new(DirectProcessor::new(config.direct_processor_url.clone()));

    let orchestrator = Arc::new(Orchestrator::new(
        config.clone(),
        registry.clone(),
        streams.clone(),
        classifier,
        direct,
        reputation.clone(),
        pool.clone(),
    ));

    let state = AppState::new(config, pool, registry, streams, orchestrator, reputation);
    let app = create_router(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });

    TestServer { addr, state }
}

/// Capabilities of a PRO-tier node (34B at 40 tok/s).
pub fn pro_caps() -> NodeCapabilities {
    NodeCapabilities {
        model_name: "llama3:34b".into(),
        params_billions: Some(34.0),
        quantization: Quantization::Q4,
        vram_mb: 24_000,
        tokens_per_second: 40.0,
        vision: false,
        artificial_load_offset: 0,
    }
}

/// Capabilities of a MID-tier node (13B at 20 tok/s).
pub fn mid_caps() -> NodeCapabilities {
    NodeCapabilities {
        model_name: "llama2:13b".into(),
        params_billions: Some(13.0),
        quantization: Quantization::Q4,
        vram_mb: 12_000,
        tokens_per_second: 20.0,
        vision: false,
        artificial_load_offset: 0,
    }
}

/// Open a gateway connection without registering.
pub async fn connect_raw(addr: SocketAddr) -> WorkerSocket {
    let (ws, _) = connect_async(format!("ws://{addr}/gateway")).await.expect("ws connect");
    ws
}

/// Register a worker and consume the ack.
pub async fn connect_worker(
    addr: SocketAddr,
    node_id: &str,
    account_ref: &str,
    capabilities: NodeCapabilities,
) -> WorkerSocket {
    let mut ws = connect_raw(addr).await;
    let proof = iris_server::auth::account_proof("test-secret", node_id, account_ref);

    send_frame(
        &mut ws,
        &WorkerFrame::NodeRegister {
            node_id: node_id.into(),
            account_ref: account_ref.into(),
            proof,
            capabilities,
        },
    )
    .await;

    match recv_frame(&mut ws).await {
        Some(CoordinatorFrame::RegisterAck { .. }) => ws,
        other => panic!("expected register ack, got {other:?}"),
    }
}

pub async fn send_frame(ws: &mut WorkerSocket, frame: &WorkerFrame) {
    let json = serde_json::to_string(frame).expect("serialize frame");
    ws.send(Message::Text(json.into())).await.expect("ws send");
}

/// Next coordinator frame, or `None` when the socket closes. Panics after
/// five seconds of silence.
pub async fn recv_frame(ws: &mut WorkerSocket) -> Option<CoordinatorFrame> {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")?;
        match message {
            Ok(Message::Text(text)) => {
                return Some(serde_json::from_str(text.as_str()).expect("decode frame"));
            }
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

/// Reply to one `TaskAssign` with streamed chunks and a final result.
pub async fn serve_one_assignment(ws: &mut WorkerSocket, chunks: &[&str], result: &str) {
    let assignment = loop {
        match recv_frame(ws).await.expect("socket closed before assignment") {
            CoordinatorFrame::TaskAssign { task_id, subtask_index, .. } => {
                break (task_id, subtask_index)
            }
            CoordinatorFrame::HeartbeatAck => {}
            other => panic!("unexpected frame while awaiting assignment: {other:?}"),
        }
    };
    let (task_id, subtask_index) = assignment;

    for (seq, chunk) in chunks.iter().enumerate() {
        send_frame(
            ws,
            &WorkerFrame::TaskStream {
                task_id,
                subtask_index,
                seq: seq as u64,
                payload: (*chunk).to_string(),
            },
        )
        .await;
    }

    send_frame(
        ws,
        &WorkerFrame::TaskResult {
            task_id,
            subtask_index,
            payload: result.to_string(),
            elapsed_ms: 50,
        },
    )
    .await;
}

/// Poll until the task reaches `wanted` or the deadline passes.
pub async fn wait_for_status(
    state: &AppState,
    task_id: Uuid,
    wanted: TaskStatus,
    deadline: Duration,
) {
    let start = std::time::Instant::now();
    loop {
        let status = state
            .orchestrator
            .get(task_id)
            .map(|t| t.status())
            .expect("task exists");
        if status == wanted {
            return;
        }
        assert!(
            start.elapsed() < deadline,
            "task stuck in {status:?}, wanted {wanted:?}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
