//! Realtime gateway: one subscriber connection bound to one job.
//!
//! Both transport profiles run the same subscribe-then-snapshot protocol:
//! bind to the job's channel first, read the authoritative snapshot
//! second. A job that went terminal before (or while) the subscription
//! was taken is replayed from the snapshot, so the terminal event cannot
//! fall into the subscribe/publish race window.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::pipeline::events::{JobEvent, job_channel};
use crate::server::state::AppState;

use super::{ApiError, require_auth};

const FORWARD_BUFFER: usize = 32;

#[derive(Debug, Deserialize)]
pub struct RealtimeParams {
    job_id: String,
    api_key: Option<String>,
}

/// `GET /v1/realtime?job_id=…` — SSE by default, WebSocket when the
/// client asks to upgrade.
pub async fn realtime(
    State(state): State<AppState>,
    Query(params): Query<RealtimeParams>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ApiError> {
    let auth = require_auth(&state, &headers, params.api_key.as_deref())?;

    let exists = state
        .jobs
        .get(&params.job_id)
        .map_err(|error| ApiError::Internal(error.to_string()))?
        .is_some_and(|job| job.tenant_id == auth.tenant_id);
    if !exists {
        return Err(ApiError::NotFound);
    }

    let job_id = params.job_id;
    match ws.ok() {
        Some(upgrade) => {
            Ok(upgrade.on_upgrade(move |socket| serve_websocket(state, job_id, socket)))
        }
        None => Ok(serve_sse(state, job_id)),
    }
}

/// Subscribe-then-snapshot forwarder shared by both transports. Events go
/// out through `tx`; the function returns once the stream is complete or
/// the subscriber went away, releasing the bus subscription either way.
async fn forward_job_events(state: AppState, job_id: String, tx: mpsc::Sender<JobEvent>) {
    let channel = job_channel(&job_id);
    let mut subscription = match state.bus.subscribe(&channel) {
        Ok(subscription) => subscription,
        Err(error) => {
            tracing::warn!(job_id = %job_id, %error, "bus subscribe failed");
            let _ = tx
                .send(JobEvent::transport_error(&job_id, "event bus unavailable"))
                .await;
            return;
        }
    };

    // The snapshot is read only after the subscription is live.
    let snapshot = match state.jobs.get(&job_id) {
        Ok(Some(job)) => job,
        Ok(None) => {
            let _ = tx
                .send(JobEvent::transport_error(&job_id, "job disappeared"))
                .await;
            return;
        }
        Err(error) => {
            let _ = tx
                .send(JobEvent::transport_error(&job_id, format!("job store: {error}")))
                .await;
            return;
        }
    };

    if let Some(terminal) = JobEvent::synthesize_terminal(&snapshot) {
        let _ = tx.send(terminal).await;
        return;
    }
    if tx.send(JobEvent::status(&snapshot)).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            received = subscription.recv() => match received {
                Ok(event) => {
                    let ends = event.ends_stream();
                    if tx.send(event).await.is_err() {
                        return;
                    }
                    if ends {
                        return;
                    }
                }
                Err(error) => {
                    tracing::warn!(job_id = %job_id, %error, "bus receive failed");
                    let _ = tx
                        .send(JobEvent::transport_error(&job_id, "event stream interrupted"))
                        .await;
                    return;
                }
            },
            _ = tx.closed() => return,
        }
    }
}

fn serve_sse(state: AppState, job_id: String) -> Response {
    let keepalive = state.keepalive;
    let (tx, rx) = mpsc::channel(FORWARD_BUFFER);
    tokio::spawn(forward_job_events(state, job_id, tx));

    let stream = ReceiverStream::new(rx).map(|event: JobEvent| {
        let kind = event.kind();
        let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        Ok::<_, Infallible>(SseEvent::default().event(kind).data(data))
    });

    Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(keepalive)
                .text("keepalive"),
        )
        .into_response()
}

async fn serve_websocket(state: AppState, job_id: String, mut socket: WebSocket) {
    let keepalive = state.keepalive;
    let (tx, mut rx) = mpsc::channel(FORWARD_BUFFER);
    let forwarder = tokio::spawn(forward_job_events(state, job_id.clone(), tx));
    let mut keepalive_timer = tokio::time::interval(keepalive.max(Duration::from_secs(1)));
    keepalive_timer.tick().await;

    loop {
        tokio::select! {
            forwarded = rx.recv() => match forwarded {
                Some(event) => {
                    let ends = event.ends_stream();
                    if send_event(&mut socket, &event).await.is_err() {
                        break;
                    }
                    if ends {
                        break;
                    }
                }
                None => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let text: &str = &text;
                    if is_ping(text) {
                        let pong = JobEvent::pong(&job_id);
                        if send_event(&mut socket, &pong).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    tracing::debug!(job_id = %job_id, %error, "websocket receive failed");
                    break;
                }
            },
            _ = keepalive_timer.tick() => {
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    // Dropping the receiver ends the forwarder, which releases the shared
    // bus subscription.
    forwarder.abort();
    let _ = socket.send(Message::Close(None)).await;
}

async fn send_event(socket: &mut WebSocket, event: &JobEvent) -> Result<(), axum::Error> {
    let payload = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    socket.send(Message::Text(payload.into())).await
}

fn is_ping(raw: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .and_then(|value| {
            value
                .get("type")
                .and_then(serde_json::Value::as_str)
                .map(|kind| kind == "ping")
        })
        .unwrap_or(false)
}
