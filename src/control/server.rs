//! HTTP surface of the control plane, plus the telemetry WebSocket.
//!
//! The status endpoint always answers, running or not. The telemetry socket
//! pushes a compact status snapshot on a fixed cadence and relays bus
//! events between pushes; a subscriber that lags the bus ring is counted
//! and disconnected.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::config::StartRequest;
use crate::control::{ControlPlane, StartOutcome};

/// Default push cadence for the telemetry stream.
const TELEMETRY_PUSH_INTERVAL: Duration = Duration::from_secs(5);

pub fn router(control: Arc<ControlPlane>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/ingest/start", post(start))
        .route("/api/ingest/stop", post(stop))
        .route("/api/ingest/restart", post(restart))
        .route("/api/ingest/status", get(status))
        .route("/api/db/stats", get(db_stats))
        .route("/api/validate", get(validate))
        .route("/ws/telemetry", get(telemetry_ws))
        .layer(CorsLayer::permissive())
        .with_state(control)
}

/// Bind and serve until the process exits.
pub async fn serve(control: Arc<ControlPlane>, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!(addr, "control_plane_listening");
    axum::serve(listener, router(control)).await?;
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

async fn start(
    State(control): State<Arc<ControlPlane>>,
    Json(req): Json<StartRequest>,
) -> Response {
    let outcome = control.start(&req).await;
    let code = match &outcome {
        StartOutcome::Invalid { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::OK,
    };
    (code, Json(outcome)).into_response()
}

async fn stop(State(control): State<Arc<ControlPlane>>) -> Json<serde_json::Value> {
    control.stop().await;
    Json(json!({ "status": "accepted" }))
}

async fn restart(State(control): State<Arc<ControlPlane>>) -> Response {
    let outcome = control.restart().await;
    let code = match &outcome {
        StartOutcome::Invalid { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::OK,
    };
    (code, Json(outcome)).into_response()
}

async fn status(State(control): State<Arc<ControlPlane>>) -> Response {
    Json(control.status().await).into_response()
}

async fn db_stats(State(control): State<Arc<ControlPlane>>) -> Response {
    match control.db_stats() {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => {
            warn!(error = %e, "db_stats_failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn validate(State(control): State<Arc<ControlPlane>>) -> Response {
    match control.validate() {
        Ok(report) => Json(report).into_response(),
        Err(e) => {
            warn!(error = %e, "validate_failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn telemetry_ws(
    ws: WebSocketUpgrade,
    State(control): State<Arc<ControlPlane>>,
) -> Response {
    ws.on_upgrade(move |socket| push_telemetry(socket, control))
}

/// Server push: a status snapshot every interval, bus events in between.
async fn push_telemetry(mut socket: WebSocket, control: Arc<ControlPlane>) {
    let mut events = control.telemetry().subscribe();
    let mut push_tick = tokio::time::interval(TELEMETRY_PUSH_INTERVAL);

    loop {
        tokio::select! {
            _ = push_tick.tick() => {
                let snapshot = control.status().await;
                let payload = json!({ "type": "status", "data": snapshot });
                if socket.send(Message::Text(payload.to_string())).await.is_err() {
                    break;
                }
            }
            received = events.recv() => match received {
                Ok(event) => {
                    let payload = json!({ "type": "event", "data": event });
                    if socket.send(Message::Text(payload.to_string())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    // Slow consumer: count it and cut the connection.
                    control.telemetry().record_lagged();
                    debug!(skipped, "telemetry_subscriber_lagged");
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) if text == "ping" => {
                    if socket.send(Message::Text("pong".into())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
        }
    }
}
