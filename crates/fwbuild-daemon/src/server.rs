use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use fwbuild_core::{
    BuildParams, ClientIdentity, DeployParams, InstallDepsParams, MonitorParams, RequestId,
    RequestKind, RequestRecord, RequestStatus,
};
use fwbuild_device::{LeaseMode, MonitorEvent};
use tokio::sync::mpsc;

use crate::dispatcher;
use crate::events::{RequestEvent, RequestEventEnvelope};
use fwbuild_protocol::{
    DaemonStatusResponse, DeviceLeaseBody, DeviceLeaseResponse, ErrorResponse, LockStatusEntry,
    LogStreamMessage, MonitorClientMessage, MonitorServerMessage, RequestStreamMessage,
    SubmitBuildBody, SubmitDeployBody, SubmitInstallDepsBody, SubmitMonitorBody, SubmitResponse,
};
use crate::state::CoordinatorState;

const OUTBOUND_QUEUE_CAPACITY: usize = 64;
const MONITOR_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub fn router(state: Arc<CoordinatorState>) -> Router {
    Router::new()
        .route("/api/build", post(submit_build))
        .route("/api/deploy", post(submit_deploy))
        .route("/api/monitor", post(submit_monitor))
        .route("/api/install-deps", post(submit_install_deps))
        .route("/api/devices/list", get(list_devices))
        .route("/api/devices/:id/lease", post(lease_device))
        .route("/api/locks/status", post(lock_status))
        .route("/api/daemon/status", get(daemon_status))
        .route("/api/daemon/shutdown", post(daemon_shutdown))
        .route("/api/requests/:id", get(request_status))
        .route("/api/requests/:id/cancel", post(cancel_request))
        .route("/ws/requests/:id", get(request_stream))
        .route("/ws/monitor/:port", get(monitor_stream))
        .route("/ws/logs", get(log_stream))
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

fn accepted(request_id: RequestId) -> Response {
    let stream_url = format!("/ws/requests/{request_id}");
    (
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            request_id,
            status: RequestStatus::Queued,
            stream_url: Some(stream_url),
        }),
    )
        .into_response()
}

async fn submit_build(
    State(state): State<Arc<CoordinatorState>>,
    Json(body): Json<SubmitBuildBody>,
) -> Response {
    let record = RequestRecord::new(
        ClientIdentity {
            pid: body.pid,
            cwd: body.cwd,
        },
        RequestKind::Build(BuildParams {
            project_dir: body.project_dir,
            environment: body.environment,
            profile: body.profile,
            jobs: body.jobs,
            verbose: body.verbose,
        }),
    );
    accepted(dispatcher::submit(&state, record))
}

async fn submit_deploy(
    State(state): State<Arc<CoordinatorState>>,
    Json(body): Json<SubmitDeployBody>,
) -> Response {
    let record = RequestRecord::new(
        ClientIdentity {
            pid: body.pid,
            cwd: body.cwd,
        },
        RequestKind::Deploy(DeployParams {
            project_dir: body.project_dir,
            environment: body.environment,
            port: body.port,
            use_cached_firmware: body.use_cached_firmware,
            verbose: body.verbose,
        }),
    );
    accepted(dispatcher::submit(&state, record))
}

async fn submit_monitor(
    State(state): State<Arc<CoordinatorState>>,
    Json(body): Json<SubmitMonitorBody>,
) -> Response {
    let port = body.port.clone();
    let record = RequestRecord::new(
        ClientIdentity {
            pid: body.pid,
            cwd: body.cwd,
        },
        RequestKind::Monitor(MonitorParams {
            port: body.port,
            baud: body.baud,
        }),
    );
    let request_id = dispatcher::submit(&state, record);
    let stream_url = format!("/ws/monitor/{port}");
    (
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            request_id,
            status: RequestStatus::Queued,
            stream_url: Some(stream_url),
        }),
    )
        .into_response()
}

/// Short operation: the response is the terminal status, not a stream.
async fn submit_install_deps(
    State(state): State<Arc<CoordinatorState>>,
    Json(body): Json<SubmitInstallDepsBody>,
) -> Response {
    let record = RequestRecord::new(
        ClientIdentity {
            pid: body.pid,
            cwd: body.cwd,
        },
        RequestKind::InstallDeps(InstallDepsParams {
            project_dir: body.project_dir,
            environment: body.environment,
            verbose: body.verbose,
        }),
    );
    let request_id = record.id.clone();
    let mut events = state.events.subscribe(request_id.clone());
    dispatcher::submit(&state, record);

    loop {
        match events.recv().await {
            Ok(RequestEventEnvelope {
                event: RequestEvent::Status { status, .. },
                ..
            }) if status.is_terminal() => {
                return (
                    StatusCode::OK,
                    Json(SubmitResponse {
                        request_id,
                        status,
                        stream_url: None,
                    }),
                )
                    .into_response();
            }
            Ok(_) => {}
            Err(_) => {
                // Fall back to the registry if the stream lagged out.
                let status = state
                    .requests
                    .get(&request_id)
                    .map(|record| record.status)
                    .unwrap_or(RequestStatus::Failed);
                if status.is_terminal() {
                    return (
                        StatusCode::OK,
                        Json(SubmitResponse {
                            request_id,
                            status,
                            stream_url: None,
                        }),
                    )
                        .into_response();
                }
            }
        }
    }
}

async fn list_devices(State(state): State<Arc<CoordinatorState>>) -> Response {
    let devices = state.devices.list_ports();
    Json(devices).into_response()
}

async fn lease_device(
    State(state): State<Arc<CoordinatorState>>,
    Path(port): Path<String>,
    Json(body): Json<DeviceLeaseBody>,
) -> Response {
    let mode = match body.mode.as_str() {
        "reader" => LeaseMode::Reader,
        "writer" => LeaseMode::Writer,
        "deploy" => LeaseMode::Deploy,
        other => {
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("unknown lease mode: {other}"),
            )
        }
    };
    match state.devices.lease(&port, body.pid, mode) {
        Ok(lease) => Json(DeviceLeaseResponse { lease }).into_response(),
        Err(error) => error_response(StatusCode::CONFLICT, error.to_string()),
    }
}

async fn lock_status(State(state): State<Arc<CoordinatorState>>) -> Response {
    let entries: Vec<LockStatusEntry> = state
        .locks
        .status()
        .into_iter()
        .map(|status| LockStatusEntry {
            name: status.name,
            owner_pid: status.owner_pid,
            lease: status.lease,
            age_ms: status.age.as_millis() as u64,
        })
        .collect();
    Json(entries).into_response()
}

async fn daemon_status(State(state): State<Arc<CoordinatorState>>) -> Response {
    Json(DaemonStatusResponse {
        pid: std::process::id(),
        version: env!("CARGO_PKG_VERSION").to_owned(),
        dev_mode: state.config.dev_mode,
        active_requests: state.requests.active_count(),
        held_locks: state.locks.held_count(),
    })
    .into_response()
}

async fn daemon_shutdown(State(state): State<Arc<CoordinatorState>>) -> Response {
    tracing::info!("shutdown requested over http");
    state.begin_shutdown();
    StatusCode::OK.into_response()
}

async fn request_status(
    State(state): State<Arc<CoordinatorState>>,
    Path(id): Path<String>,
) -> Response {
    match state.requests.get(&RequestId::new(id)) {
        Some(record) => Json(record).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "unknown request"),
    }
}

async fn cancel_request(
    State(state): State<Arc<CoordinatorState>>,
    Path(id): Path<String>,
) -> Response {
    let request_id = RequestId::new(id);
    match state.cancels.deliver(&request_id) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(error) => error_response(StatusCode::INTERNAL_SERVER_ERROR, error.to_string()),
    }
}

async fn request_stream(
    State(state): State<Arc<CoordinatorState>>,
    Path(id): Path<String>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| run_request_stream(state, RequestId::new(id), socket))
}

/// Status stream: an outbound pusher drains a bounded queue fed by the event
/// bus while a separate receive loop keeps the socket healthy. Receiving
/// never waits on processing.
async fn run_request_stream(
    state: Arc<CoordinatorState>,
    request_id: RequestId,
    socket: WebSocket,
) {
    let (mut sink, mut stream) = socket.split();
    let mut events = state.events.subscribe(request_id.clone());
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<RequestStreamMessage>(OUTBOUND_QUEUE_CAPACITY);

    // Current status first so late subscribers see where the request is.
    if let Some(record) = state.requests.get(&request_id) {
        let _ = outbound_tx
            .send(RequestStreamMessage::Status {
                status: record.status,
                detail: record.detail.clone(),
            })
            .await;
        if record.status.is_terminal() {
            drop(outbound_tx);
            forward_outbound(&mut sink, &mut outbound_rx).await;
            return;
        }
    }

    let producer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(envelope) => {
                    let message = match envelope.event {
                        RequestEvent::Status { status, detail } => {
                            let terminal = status.is_terminal();
                            let message = RequestStreamMessage::Status { status, detail };
                            if outbound_tx.send(message).await.is_err() {
                                break;
                            }
                            if terminal {
                                break;
                            }
                            continue;
                        }
                        RequestEvent::Log(line) => RequestStreamMessage::Log { line },
                    };
                    if outbound_tx.send(message).await.is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let receiver = tokio::spawn(async move {
        while let Some(Ok(message)) = stream.next().await {
            if matches!(message, Message::Close(_)) {
                break;
            }
        }
    });

    forward_outbound(&mut sink, &mut outbound_rx).await;
    producer.abort();
    receiver.abort();
}

async fn forward_outbound(
    sink: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    outbound_rx: &mut mpsc::Receiver<RequestStreamMessage>,
) {
    while let Some(message) = outbound_rx.recv().await {
        let Ok(encoded) = serde_json::to_string(&message) else {
            continue;
        };
        if sink.send(Message::Text(encoded)).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn log_stream(
    State(state): State<Arc<CoordinatorState>>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| run_log_stream(state, socket))
}

/// Global log subscription: every request's status and log events, tagged
/// with the owning request id.
async fn run_log_stream(state: Arc<CoordinatorState>, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let mut events = state.events.subscribe_all();

    let receiver = tokio::spawn(async move {
        while let Some(Ok(message)) = stream.next().await {
            if matches!(message, Message::Close(_)) {
                break;
            }
        }
    });

    loop {
        match events.recv().await {
            Ok(envelope) => {
                let message = LogStreamMessage {
                    request_id: envelope.request_id,
                    sequence: envelope.sequence,
                    message: match envelope.event {
                        RequestEvent::Status { status, detail } => {
                            RequestStreamMessage::Status { status, detail }
                        }
                        RequestEvent::Log(line) => RequestStreamMessage::Log { line },
                    },
                };
                let Ok(encoded) = serde_json::to_string(&message) else {
                    continue;
                };
                if sink.send(Message::Text(encoded)).await.is_err() {
                    break;
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
    let _ = sink.close().await;
    receiver.abort();
}

async fn monitor_stream(
    State(state): State<Arc<CoordinatorState>>,
    Path(port): Path<String>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| run_monitor_stream(state, port, socket))
}

/// Serial monitor stream. Three concerns on independent tasks: the receive
/// loop (attach/write/next/ping), the data pusher (ring polling), and the
/// preemption watcher, all feeding one bounded outbound queue.
async fn run_monitor_stream(state: Arc<CoordinatorState>, port: String, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) =
        mpsc::channel::<MonitorServerMessage>(OUTBOUND_QUEUE_CAPACITY);

    // First frame must be attach.
    let session = loop {
        let Some(Ok(message)) = stream.next().await else {
            return;
        };
        let Message::Text(text) = message else { continue };
        match serde_json::from_str::<MonitorClientMessage>(&text) {
            Ok(MonitorClientMessage::Attach { baud }) => {
                let open_state = Arc::clone(&state);
                let open_port = port.clone();
                let opened = tokio::task::spawn_blocking(move || {
                    open_state.devices.attach_monitor(&open_port, baud)
                })
                .await;
                match opened {
                    Ok(Ok(session)) => {
                        let _ = outbound_tx
                            .send(MonitorServerMessage::Attached {
                                ok: true,
                                error: None,
                            })
                            .await;
                        break session;
                    }
                    Ok(Err(error)) => {
                        let _ = outbound_tx
                            .send(MonitorServerMessage::Attached {
                                ok: false,
                                error: Some(error.to_string()),
                            })
                            .await;
                        drop(outbound_tx);
                        forward_monitor_outbound(&mut sink, &mut outbound_rx).await;
                        return;
                    }
                    Err(_) => return,
                }
            }
            Ok(_) | Err(_) => {
                let _ = outbound_tx
                    .send(MonitorServerMessage::Error {
                        message: "expected an attach message".to_owned(),
                    })
                    .await;
            }
        }
    };

    state.touch_activity();

    // Preemption watcher.
    let mut monitor_events = session.subscribe();
    let preemption_tx = outbound_tx.clone();
    let preemption_task = tokio::spawn(async move {
        while let Ok(event) = monitor_events.recv().await {
            let message = match event {
                MonitorEvent::Preempted => MonitorServerMessage::Preempted,
                MonitorEvent::Reconnected => MonitorServerMessage::Reconnected,
            };
            if preemption_tx.send(message).await.is_err() {
                break;
            }
        }
    });

    // Data pusher: polls the ring from the reader's cursor.
    let pusher_session = Arc::clone(&session);
    let pusher_tx = outbound_tx.clone();
    let pusher_task = tokio::spawn(async move {
        let mut cursor: u64 = 0;
        loop {
            let (lines, next) = pusher_session.read_from(cursor);
            if !lines.is_empty() {
                let first_index = lines[0].0;
                let batch: Vec<String> = lines.into_iter().map(|(_, line)| line).collect();
                if pusher_tx
                    .send(MonitorServerMessage::Data {
                        index: first_index,
                        lines: batch,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
                cursor = next;
            }
            tokio::time::sleep(MONITOR_POLL_INTERVAL).await;
        }
    });

    // Receive loop: processes client frames without ever blocking on the
    // outbound path beyond the bounded queue.
    let receiver_session = Arc::clone(&session);
    let receiver_tx = outbound_tx.clone();
    let receiver_task = tokio::spawn(async move {
        while let Some(Ok(message)) = stream.next().await {
            let Message::Text(text) = message else {
                if matches!(message, Message::Close(_)) {
                    break;
                }
                continue;
            };
            match serde_json::from_str::<MonitorClientMessage>(&text) {
                Ok(MonitorClientMessage::Write { data }) => {
                    let session = Arc::clone(&receiver_session);
                    let write_result = tokio::task::spawn_blocking(move || {
                        session.write(data.as_bytes())
                    })
                    .await;
                    let reply = match write_result {
                        Ok(Ok(())) => MonitorServerMessage::WriteAck,
                        Ok(Err(error)) => MonitorServerMessage::Error {
                            message: error.to_string(),
                        },
                        Err(_) => MonitorServerMessage::Error {
                            message: "write task failed".to_owned(),
                        },
                    };
                    if receiver_tx.send(reply).await.is_err() {
                        break;
                    }
                }
                Ok(MonitorClientMessage::Ping) => {
                    if receiver_tx.send(MonitorServerMessage::Pong).await.is_err() {
                        break;
                    }
                }
                Ok(MonitorClientMessage::Next { index: _ }) => {
                    // The pusher owns the cursor; an explicit Next is a
                    // keep-alive that also confirms delivery.
                }
                Ok(MonitorClientMessage::Detach) => break,
                Ok(MonitorClientMessage::Attach { .. }) => {
                    let _ = receiver_tx
                        .send(MonitorServerMessage::Error {
                            message: "already attached".to_owned(),
                        })
                        .await;
                }
                Err(error) => {
                    let _ = receiver_tx
                        .send(MonitorServerMessage::Error {
                            message: format!("bad frame: {error}"),
                        })
                        .await;
                }
            }
        }
    });

    drop(outbound_tx);
    let forward_task = tokio::spawn(async move {
        forward_monitor_outbound(&mut sink, &mut outbound_rx).await;
    });

    // The receive loop decides the session's lifetime: a detach or a closed
    // socket tears everything down even if the device stays silent.
    let _ = receiver_task.await;
    preemption_task.abort();
    pusher_task.abort();
    forward_task.abort();
    state.touch_activity();
}

async fn forward_monitor_outbound(
    sink: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    outbound_rx: &mut mpsc::Receiver<MonitorServerMessage>,
) {
    while let Some(message) = outbound_rx.recv().await {
        let Ok(encoded) = serde_json::to_string(&message) else {
            continue;
        };
        if sink.send(Message::Text(encoded)).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}
