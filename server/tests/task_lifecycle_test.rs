//! End-to-end task lifecycle tests: real workers over the gateway, real
//! task submission, streams and reputation observed from the outside.

mod helpers;

use std::time::Duration;

use helpers::*;
use serde_json::json;

use iris_common::protocol::{CoordinatorFrame, StreamFrame, WorkerFrame};
use iris_common::{Difficulty, TaskStatus};
use iris_server::config::Config;
use uuid::Uuid;

async fn submit_task(addr: std::net::SocketAddr, body: serde_json::Value) -> serde_json::Value {
    let response = reqwest::Client::new()
        .post(format!("http://{addr}/api/v1/tasks"))
        .json(&body)
        .send()
        .await
        .expect("submit");
    assert!(response.status().is_success(), "submit failed: {}", response.status());
    response.json().await.expect("submit body")
}

async fn poll_task(addr: std::net::SocketAddr, task_id: Uuid) -> serde_json::Value {
    reqwest::Client::new()
        .get(format!("http://{addr}/api/v1/tasks/{task_id}"))
        .send()
        .await
        .expect("poll")
        .json()
        .await
        .expect("poll body")
}

/// S1: single PRO worker, SUBTASKS mode, streaming on.
#[tokio::test]
async fn happy_path_single_worker_subtasks() {
    let server = spawn_server(Config::default_for_test()).await;
    let mut ws = connect_worker(server.addr, "w1", "acct", pro_caps()).await;

    let body = submit_task(
        server.addr,
        json!({
            "prompt": "Summarise the following.\n\nFirst paragraph of text.\n\nSecond paragraph of text.",
            "mode": "subtasks",
            "streaming": true,
            "account_ref": "user-1",
        }),
    )
    .await;
    let task_id: Uuid = serde_json::from_value(body["task_id"].clone()).expect("task id");

    // One worker serves all three fragments; answers carry their index.
    for _ in 0..3 {
        let (tid, index) = loop {
            match recv_frame(&mut ws).await.expect("assignment") {
                CoordinatorFrame::TaskAssign { task_id, subtask_index, streaming, .. } => {
                    assert!(streaming);
                    break (task_id, subtask_index);
                }
                CoordinatorFrame::HeartbeatAck => {}
                other => panic!("unexpected frame: {other:?}"),
            }
        };
        send_frame(
            &mut ws,
            &WorkerFrame::TaskStream {
                task_id: tid,
                subtask_index: index,
                seq: 0,
                payload: format!("chunk-{index} "),
            },
        )
        .await;
        send_frame(
            &mut ws,
            &WorkerFrame::TaskResult {
                task_id: tid,
                subtask_index: index,
                payload: format!("answer-{index}"),
                elapsed_ms: 40,
            },
        )
        .await;
    }

    wait_for_status(&server.state, task_id, TaskStatus::Completed, Duration::from_secs(5)).await;

    let handle = server.state.orchestrator.get(task_id).expect("task");
    assert_eq!(handle.difficulty(), Some(Difficulty::Complex));
    assert_eq!(handle.result().as_deref(), Some("answer-0\n\nanswer-1\n\nanswer-2"));

    // The stream carries every chunk in per-subtask order plus terminals.
    let stream = server.state.streams.get(task_id).expect("stream");
    let mut chunks = 0;
    let mut terminals = 0;
    while let Some(frame) = stream.next().await {
        match frame {
            StreamFrame::Chunk { is_terminal: false, .. } => chunks += 1,
            StreamFrame::Chunk { is_terminal: true, .. } => terminals += 1,
            other => panic!("unexpected stream frame: {other:?}"),
        }
    }
    assert_eq!(chunks, 3);
    assert_eq!(terminals, 3);

    // Three completions, all fast: floor + 3 x (10 + 5).
    server.state.reputation.flush().await;
    assert_eq!(server.state.reputation.score("w1").await, 55);

    // Worker load drained back to zero.
    let snapshot = server.state.registry.snapshot().await;
    assert_eq!(snapshot[0].effective_load, 0);
}

/// S2: consensus, two of three agree; no dissenter penalty by default.
#[tokio::test]
async fn consensus_two_of_three_agree() {
    let server = spawn_server(Config::default_for_test()).await;
    let mut w1 = connect_worker(server.addr, "w1", "acct", mid_caps()).await;
    let mut w2 = connect_worker(server.addr, "w2", "acct", mid_caps()).await;
    let mut w3 = connect_worker(server.addr, "w3", "acct", mid_caps()).await;

    let body = submit_task(
        server.addr,
        json!({
            "prompt": "Is 1+1 = 2?",
            "mode": "consensus",
            "streaming": false,
            "account_ref": "user-1",
        }),
    )
    .await;
    let task_id: Uuid = serde_json::from_value(body["task_id"].clone()).expect("task id");

    // Load-aware selection spreads one replica to each worker.
    serve_one_assignment(&mut w1, &[], "Yes").await;
    serve_one_assignment(&mut w2, &[], "Yes").await;
    serve_one_assignment(&mut w3, &[], "No").await;

    wait_for_status(&server.state, task_id, TaskStatus::Completed, Duration::from_secs(5)).await;

    let poll = poll_task(server.addr, task_id).await;
    assert_eq!(poll["status"], "completed");
    assert_eq!(poll["result"], "Yes");

    // Default policy: the dissenter keeps its completion credit untouched.
    server.state.reputation.flush().await;
    let agree = server.state.reputation.score("w1").await;
    let dissent = server.state.reputation.score("w3").await;
    assert_eq!(agree, dissent);
}

/// S3: the assigned worker drops mid-stream; the subtask restarts on the
/// second worker with an attempt-restart marker in the stream.
#[tokio::test]
async fn worker_drop_mid_stream_reassigns() {
    let server = spawn_server(Config::default_for_test()).await;
    let mut a = connect_worker(server.addr, "a", "acct", pro_caps()).await;
    let mut b = connect_worker(server.addr, "b", "acct", pro_caps()).await;

    let body = submit_task(
        server.addr,
        json!({
            "prompt": "Ping?",
            "mode": "subtasks",
            "streaming": true,
            "account_ref": "user-1",
        }),
    )
    .await;
    let task_id: Uuid = serde_json::from_value(body["task_id"].clone()).expect("task id");

    // Tie-break selects "a" first. It streams one chunk, then vanishes.
    let (tid, index) = loop {
        match recv_frame(&mut a).await.expect("assignment") {
            CoordinatorFrame::TaskAssign { task_id, subtask_index, .. } => {
                break (task_id, subtask_index)
            }
            _ => {}
        }
    };
    send_frame(
        &mut a,
        &WorkerFrame::TaskStream { task_id: tid, subtask_index: index, seq: 0, payload: "par".into() },
    )
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(a);

    // The attempt restarts on "b"; its sequence numbers begin again at 0.
    serve_one_assignment(&mut b, &["re"], "recovered").await;

    wait_for_status(&server.state, task_id, TaskStatus::Completed, Duration::from_secs(5)).await;
    let handle = server.state.orchestrator.get(task_id).expect("task");
    assert_eq!(handle.result().as_deref(), Some("recovered"));

    let stream = server.state.streams.get(task_id).expect("stream");
    let mut saw_restart = false;
    while let Some(frame) = stream.next().await {
        if let StreamFrame::AttemptRestart { subtask_index, attempt } = frame {
            assert_eq!(subtask_index, 0);
            assert_eq!(attempt, 2);
            saw_restart = true;
        }
    }
    assert!(saw_restart, "expected an attempt-restart marker");

    // The deserter was charged, the rescuer credited.
    server.state.reputation.flush().await;
    assert!(
        server.state.reputation.score("b").await > server.state.reputation.score("a").await
    );
}

/// S5: a document attachment in the direct-process set bypasses
/// classification and registered workers entirely.
#[tokio::test]
async fn direct_bypass_skips_classification_and_workers() {
    use axum::routing::post;

    // Mock document processor on an ephemeral port.
    let app = axum::Router::new()
        .route("/process", post(|| async { "Extracted: the document says hello." }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let processor_addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });

    let mut config = Config::default_for_test();
    config.direct_processor_url = Some(format!("http://{processor_addr}/process"));
    let server = spawn_server(config).await;
    let mut ws = connect_worker(server.addr, "w1", "acct", pro_caps()).await;

    let body = submit_task(
        server.addr,
        json!({
            "prompt": "Summarise this file",
            "mode": "subtasks",
            "streaming": true,
            "files": [{ "name": "paper.pdf", "content": "doc-bytes" }],
            "account_ref": "user-1",
        }),
    )
    .await;
    let task_id: Uuid = serde_json::from_value(body["task_id"].clone()).expect("task id");

    wait_for_status(&server.state, task_id, TaskStatus::Completed, Duration::from_secs(5)).await;

    let handle = server.state.orchestrator.get(task_id).expect("task");
    // The bypass path never classifies.
    assert_eq!(handle.difficulty(), None);
    assert_eq!(handle.result().as_deref(), Some("Extracted: the document says hello."));

    // Processor chunks flowed into the stream, then one terminal frame.
    let stream = server.state.streams.get(task_id).expect("stream");
    let mut text = String::new();
    let mut terminals = 0;
    while let Some(frame) = stream.next().await {
        match frame {
            StreamFrame::Chunk { subtask_index: 0, payload, is_terminal: false, .. } => {
                text.push_str(&payload);
            }
            StreamFrame::Chunk { subtask_index: 0, is_terminal: true, .. } => terminals += 1,
            other => panic!("unexpected stream frame: {other:?}"),
        }
    }
    assert_eq!(text, "Extracted: the document says hello.");
    assert_eq!(terminals, 1);

    // No reputation events for any registered node.
    server.state.reputation.flush().await;
    assert_eq!(server.state.reputation.score("w1").await, 10);
    let events: Vec<(String,)> = sqlx::query_as("SELECT kind FROM reputation_events")
        .fetch_all(&server.state.db)
        .await
        .expect("query events");
    assert!(events.is_empty());

    // Nothing was dispatched to the worker: the next frame on its socket
    // is the ack for its own heartbeat, not a task assignment.
    send_frame(&mut ws, &WorkerFrame::NodeHeartbeat { load: 0, uptime_seconds: 1 }).await;
    assert!(matches!(recv_frame(&mut ws).await, Some(CoordinatorFrame::HeartbeatAck)));
}

/// S6: no eligible node means immediate failure with NO_NODES.
#[tokio::test]
async fn no_eligible_nodes_fails_immediately() {
    let server = spawn_server(Config::default_for_test()).await;

    let body = submit_task(
        server.addr,
        json!({
            "prompt": "Write code to implement a distributed hash table with proof of correctness.",
            "mode": "subtasks",
            "streaming": true,
            "account_ref": "user-1",
        }),
    )
    .await;
    let task_id: Uuid = serde_json::from_value(body["task_id"].clone()).expect("task id");

    wait_for_status(&server.state, task_id, TaskStatus::Failed, Duration::from_secs(5)).await;

    let poll = poll_task(server.addr, task_id).await;
    assert_eq!(poll["reason"], "NO_NODES");

    let stream = server.state.streams.get(task_id).expect("stream");
    let mut frames = Vec::new();
    while let Some(frame) = stream.next().await {
        frames.push(frame);
    }
    assert_eq!(frames, vec![StreamFrame::Error { reason: "NO_NODES".into() }]);
}

/// S4: a silent worker runs the task into its difficulty deadline.
#[tokio::test]
async fn silent_worker_times_out_task() {
    let mut config = Config::default_for_test();
    config.difficulty_timeout_s.simple_s = 1;
    let server = spawn_server(config).await;
    let mut ws = connect_worker(server.addr, "w1", "acct", pro_caps()).await;

    let body = submit_task(
        server.addr,
        json!({
            "prompt": "Is 1+1 = 2?",
            "mode": "subtasks",
            "streaming": false,
            "account_ref": "user-1",
        }),
    )
    .await;
    let task_id: Uuid = serde_json::from_value(body["task_id"].clone()).expect("task id");

    // The worker accepts the assignment and never answers.
    assert!(matches!(
        recv_frame(&mut ws).await,
        Some(CoordinatorFrame::TaskAssign { .. })
    ));

    wait_for_status(&server.state, task_id, TaskStatus::TimedOut, Duration::from_secs(5)).await;

    // A timeout event was charged against the node.
    server.state.reputation.flush().await;
    let events: Vec<(String,)> = sqlx::query_as(
        "SELECT kind FROM reputation_events WHERE node_id = 'w1' AND kind = 'timeout'",
    )
    .fetch_all(&server.state.db)
    .await
    .expect("query events");
    assert!(!events.is_empty());
    assert_eq!(server.state.reputation.score("w1").await, 10);
}

/// Cancellation reaches the worker and aborts the stream.
#[tokio::test]
async fn cancel_mid_flight() {
    let server = spawn_server(Config::default_for_test()).await;
    let mut ws = connect_worker(server.addr, "w1", "acct", pro_caps()).await;

    let body = submit_task(
        server.addr,
        json!({
            "prompt": "Ping?",
            "mode": "subtasks",
            "streaming": true,
            "account_ref": "user-1",
        }),
    )
    .await;
    let task_id: Uuid = serde_json::from_value(body["task_id"].clone()).expect("task id");

    assert!(matches!(
        recv_frame(&mut ws).await,
        Some(CoordinatorFrame::TaskAssign { .. })
    ));

    let response = reqwest::Client::new()
        .delete(format!("http://{}/api/v1/tasks/{task_id}", server.addr))
        .send()
        .await
        .expect("cancel");
    assert!(response.status().is_success());

    wait_for_status(&server.state, task_id, TaskStatus::Cancelled, Duration::from_secs(5)).await;

    // Best-effort cancel frame reaches the worker.
    assert!(matches!(
        recv_frame(&mut ws).await,
        Some(CoordinatorFrame::TaskCancel { .. })
    ));

    // Cancelling again is a no-op, not an error.
    let again = reqwest::Client::new()
        .delete(format!("http://{}/api/v1/tasks/{task_id}", server.addr))
        .send()
        .await
        .expect("cancel again");
    assert!(again.status().is_success());

    let stream = server.state.streams.get(task_id).expect("stream");
    let mut last = None;
    while let Some(frame) = stream.next().await {
        last = Some(frame);
    }
    assert_eq!(last, Some(StreamFrame::Aborted));
}

#[tokio::test]
async fn empty_prompt_is_rejected() {
    let server = spawn_server(Config::default_for_test()).await;

    let response = reqwest::Client::new()
        .post(format!("http://{}/api/v1/tasks", server.addr))
        .json(&json!({ "prompt": "   ", "account_ref": "user-1" }))
        .send()
        .await
        .expect("submit");
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn network_stats_reports_nodes_and_history() {
    let server = spawn_server(Config::default_for_test()).await;
    let mut ws = connect_worker(server.addr, "w1", "acct", pro_caps()).await;

    let body = submit_task(
        server.addr,
        json!({
            "prompt": "Ping?",
            "mode": "subtasks",
            "streaming": false,
            "account_ref": "user-1",
        }),
    )
    .await;
    let task_id: Uuid = serde_json::from_value(body["task_id"].clone()).expect("task id");

    serve_one_assignment(&mut ws, &[], "pong").await;
    wait_for_status(&server.state, task_id, TaskStatus::Completed, Duration::from_secs(5)).await;
    // The history row lands just after the status flips.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stats: serde_json::Value = reqwest::Client::new()
        .get(format!("http://{}/api/v1/network", server.addr))
        .send()
        .await
        .expect("stats")
        .json()
        .await
        .expect("stats body");

    assert_eq!(stats["online_nodes"], 1);
    assert_eq!(stats["tasks_by_status"]["completed"], 1);
    assert_eq!(stats["leaderboard"][0]["node_id"], "w1");
}
