//! Worker Gateway
//!
//! One persistent WebSocket per worker. The first frame must be a
//! registration handshake; after that the connection carries heartbeats
//! and task traffic until either side goes away. Frame order per channel
//! is preserved end-to-end: one reader loop, one writer loop, and an
//! in-between mpsc owned by the registry handle.

use std::collections::HashMap;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use iris_common::protocol::{CoordinatorFrame, RegisterNackReason, WorkerFrame};
use iris_common::ProtocolError;

use crate::api::AppState;
use crate::auth;
use crate::db;
use crate::orchestrator::SubtaskEvent;
use crate::registry::DisconnectReason;

/// How long a fresh connection may sit silent before the handshake fails.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// WebSocket upgrade handler for `/gateway`.
pub async fn handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Run one worker connection to completion.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Handshake: the first frame decides whether a node exists at all.
    let register = match tokio::time::timeout(HANDSHAKE_TIMEOUT, ws_receiver.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => serde_json::from_str::<WorkerFrame>(&text),
        Err(_) => {
            debug!(error = %ProtocolError::HandshakeTimeout, "Dropping connection");
            return;
        }
        Ok(_) => {
            debug!("Connection closed before handshake");
            return;
        }
    };

    let (node_id, account_ref, proof, capabilities) = match register {
        Ok(WorkerFrame::NodeRegister { node_id, account_ref, proof, capabilities }) => {
            (node_id, account_ref, proof, capabilities)
        }
        Ok(other) => {
            warn!(frame = ?other, "First frame was not a registration");
            return;
        }
        Err(e) => {
            warn!(error = %e, "Malformed handshake frame");
            return;
        }
    };

    if !auth::verify_account_proof(&state.config.account_secret, &node_id, &account_ref, &proof) {
        warn!(node_id = %node_id, "Registration rejected: invalid account proof");
        send_nack(&mut ws_sender, RegisterNackReason::InvalidProof).await;
        return;
    }

    let reputation = state.reputation.score(&node_id).await;
    let (handle, outbox_rx) = match state
        .registry
        .register(node_id.clone(), account_ref.clone(), capabilities.clone(), reputation)
        .await
    {
        Ok(registered) => registered,
        Err(e) => {
            warn!(node_id = %node_id, error = %e, "Registration rejected");
            send_nack(&mut ws_sender, RegisterNackReason::DuplicateId).await;
            return;
        }
    };

    let capabilities_json =
        serde_json::to_string(&capabilities).unwrap_or_else(|_| "{}".into());
    if let Err(e) = db::upsert_node_metadata(
        &state.db,
        &node_id,
        &account_ref,
        &capabilities_json,
        chrono::Utc::now(),
    )
    .await
    {
        warn!(node_id = %node_id, error = %e, "Failed to persist node metadata");
    }

    handle.try_send(CoordinatorFrame::RegisterAck {
        node_id: node_id.clone(),
        tier: handle.tier,
    });

    info!(node_id = %node_id, tier = %handle.tier, "Worker connected");

    // Writer: drains the registry-owned outbox onto the socket.
    let writer_closed = handle.closed().clone();
    let writer_handle = tokio::spawn(async move {
        write_loop(ws_sender, outbox_rx, writer_closed).await;
    });

    let reason = read_loop(&mut ws_receiver, &state, &handle).await;

    state
        .registry
        .disconnect(&node_id, handle.conn_id(), reason)
        .await;
    drop(handle);
    writer_handle.abort();

    info!(node_id = %node_id, "Worker disconnected");
}

async fn send_nack(
    ws_sender: &mut SplitSink<WebSocket, Message>,
    reason: RegisterNackReason,
) {
    let frame = CoordinatorFrame::RegisterNack { reason };
    if let Ok(json) = serde_json::to_string(&frame) {
        let _ = ws_sender.send(Message::Text(json.into())).await;
    }
}

async fn write_loop(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut outbox_rx: mpsc::Receiver<CoordinatorFrame>,
    closed: tokio_util::sync::CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            () = closed.cancelled() => break,
            frame = outbox_rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let json = match serde_json::to_string(&frame) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "Failed to serialize frame");
                continue;
            }
        };

        if ws_sender.send(Message::Text(json.into())).await.is_err() {
            break;
        }
    }

    let _ = ws_sender.send(Message::Close(None)).await;
}

/// Read until the connection ends; returns why.
async fn read_loop(
    ws_receiver: &mut SplitStream<WebSocket>,
    state: &AppState,
    handle: &crate::registry::NodeHandle,
) -> DisconnectReason {
    // Monotonic sequence tracking per (task, subtask) for this connection.
    let mut last_seq: HashMap<(Uuid, u32), u64> = HashMap::new();
    let closed = handle.closed().clone();

    loop {
        let message = tokio::select! {
            () = closed.cancelled() => return DisconnectReason::Displaced,
            message = ws_receiver.next() => message,
        };

        match message {
            Some(Ok(Message::Text(text))) => {
                let frame = match serde_json::from_str::<WorkerFrame>(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        let err = ProtocolError::MalformedFrame(e.to_string());
                        warn!(node_id = %handle.node_id, error = %err, "Tearing down connection");
                        return DisconnectReason::ProtocolViolation;
                    }
                };

                match on_frame(state, handle, frame, &mut last_seq).await {
                    Ok(()) => {}
                    Err(err) => {
                        warn!(node_id = %handle.node_id, error = %err, "Tearing down connection");
                        return DisconnectReason::ProtocolViolation;
                    }
                }
            }
            Some(Ok(Message::Close(_))) | None => return DisconnectReason::ConnectionClosed,
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_))) => {}
            Some(Err(e)) => {
                warn!(node_id = %handle.node_id, error = %e, "WebSocket error");
                return DisconnectReason::ConnectionClosed;
            }
        }
    }
}

async fn on_frame(
    state: &AppState,
    handle: &crate::registry::NodeHandle,
    frame: WorkerFrame,
    last_seq: &mut HashMap<(Uuid, u32), u64>,
) -> Result<(), ProtocolError> {
    match frame {
        WorkerFrame::NodeRegister { .. } => {
            Err(ProtocolError::UnexpectedFrame("node_register after handshake"))
        }

        WorkerFrame::NodeHeartbeat { load, uptime_seconds } => {
            state.registry.heartbeat(&handle.node_id, load, uptime_seconds).await;
            handle.try_send(CoordinatorFrame::HeartbeatAck);
            Ok(())
        }

        WorkerFrame::TaskStream { task_id, subtask_index, seq, payload } => {
            let key = (task_id, subtask_index);
            if let Some(&prev) = last_seq.get(&key) {
                if seq <= prev {
                    return Err(ProtocolError::OutOfSequence { got: seq, expected: prev + 1 });
                }
            }
            last_seq.insert(key, seq);

            state
                .router
                .route(
                    task_id,
                    SubtaskEvent::Chunk {
                        subtask_index,
                        seq,
                        payload,
                        node_id: handle.node_id.clone(),
                    },
                )
                .await;
            Ok(())
        }

        WorkerFrame::TaskResult { task_id, subtask_index, payload, elapsed_ms } => {
            last_seq.remove(&(task_id, subtask_index));
            state
                .router
                .route(
                    task_id,
                    SubtaskEvent::Result {
                        subtask_index,
                        payload,
                        elapsed_ms,
                        node_id: handle.node_id.clone(),
                    },
                )
                .await;
            Ok(())
        }

        WorkerFrame::TaskError { task_id, subtask_index, kind, detail } => {
            last_seq.remove(&(task_id, subtask_index));
            state
                .router
                .route(
                    task_id,
                    SubtaskEvent::Error {
                        subtask_index,
                        kind,
                        detail,
                        node_id: handle.node_id.clone(),
                    },
                )
                .await;
            Ok(())
        }
    }
}
