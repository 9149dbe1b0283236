use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, decrement_gauge, increment_gauge};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tripteller_presence_core::ServerEvent;

use crate::config::PresenceConfig;
use crate::dispatch::{ConnectionContext, Dispatcher};
use crate::identity::{Identity, IdentityVerifier};
use crate::presence::{ConnectionId, ObserverInfo, PresenceRegistry};
use crate::now_ms;

pub struct AppState {
    dispatcher: Dispatcher,
    verifier: Arc<dyn IdentityVerifier>,
    require_identity: bool,
    connection_buffer: usize,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(
        registry: Arc<PresenceRegistry>,
        verifier: Arc<dyn IdentityVerifier>,
        config: &PresenceConfig,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        Self {
            dispatcher: Dispatcher::new(registry, config.require_identity),
            verifier,
            require_identity: config.require_identity,
            connection_buffer: config.connection_buffer,
            metrics,
        }
    }

    pub fn registry(&self) -> &Arc<PresenceRegistry> {
        self.dispatcher.registry()
    }

    pub fn stats(&self) -> StatsResponse {
        let subjects: Vec<SubjectStatsEntry> = self
            .registry()
            .snapshot_subjects()
            .into_iter()
            .map(|subject| SubjectStatsEntry {
                subject_id: subject.id,
                display_name: subject.display_name,
                latitude: subject.position.coordinates.latitude,
                longitude: subject.position.coordinates.longitude,
                accuracy: subject.position.accuracy,
                captured_at: subject.position.captured_at,
                last_seen_at: subject.last_seen_at,
                connection_id: subject.connection_id,
            })
            .collect();
        let observers = self.registry().observers();
        StatsResponse {
            active_subjects: subjects.len(),
            active_observers: observers.len(),
            subjects,
            observers,
        }
    }

    fn render_metrics(&self) -> String {
        self.metrics
            .as_ref()
            .map(PrometheusHandle::render)
            .unwrap_or_default()
    }
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub active_subjects: usize,
    pub active_observers: usize,
    pub subjects: Vec<SubjectStatsEntry>,
    pub observers: Vec<ObserverInfo>,
}

#[derive(Debug, Serialize)]
pub struct SubjectStatsEntry {
    pub subject_id: String,
    pub display_name: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: Option<f64>,
    pub captured_at: i64,
    pub last_seen_at: u64,
    pub connection_id: ConnectionId,
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.stats())
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = state.render_metrics();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TokenQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let token = query.token.filter(|token| !token.trim().is_empty());
    let identity = match token {
        Some(token) => match state.verifier.verify(&token) {
            Ok(identity) => Some(identity),
            Err(err) => {
                counter!(
                    "tripteller_presence_token_validation_failure_total",
                    1,
                    "reason" => err.metric_label()
                );
                warn!("token validation failed: {err}");
                return StatusCode::UNAUTHORIZED.into_response();
            }
        },
        None if state.require_identity => {
            counter!(
                "tripteller_presence_token_validation_failure_total",
                1,
                "reason" => "missing_token"
            );
            return StatusCode::UNAUTHORIZED.into_response();
        }
        None => None,
    };

    ws.on_upgrade(move |socket| handle_connection(socket, state, identity))
        .into_response()
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>, identity: Option<Identity>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerEvent>(state.connection_buffer);
    let ctx = ConnectionContext::new(identity, tx);
    let connection_id = ctx.id;

    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let payload = match serde_json::to_string(&event) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(connection_id = %connection_id, error = %err, "failed to encode frame");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(payload)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    increment_gauge!("tripteller_presence_sockets_open", 1.0);
    state.dispatcher.on_connect(&ctx, now_ms());
    info!(
        connection_id = %connection_id,
        subject_id = ?ctx.identity.as_ref().map(|identity| identity.subject_id.as_str()),
        "presence connection established"
    );

    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => state.dispatcher.handle_frame(&ctx, &text, now_ms()),
            Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => state.dispatcher.handle_frame(&ctx, text, now_ms()),
                Err(_) => warn!(connection_id = %connection_id, "ignoring non-utf8 binary frame"),
            },
            Ok(Message::Close(frame)) => {
                info!(
                    connection_id = %connection_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                break;
            }
            Ok(_) => continue,
            Err(err) => {
                warn!(connection_id = %connection_id, error = %err, "error receiving message");
                break;
            }
        }
    }

    state.dispatcher.on_disconnect(&ctx, now_ms());
    decrement_gauge!("tripteller_presence_sockets_open", 1.0);
    writer.abort();
    info!(connection_id = %connection_id, "presence connection closed");
}
