use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::debug;
use wavecast_protocol::WavecastConfig;

use crate::relay;
use crate::room::RoomRegistry;

pub struct AppState {
    pub config: WavecastConfig,
    pub rooms: RoomRegistry,
    pub started_at: Instant,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/streams", get(list_streams))
        .route("/ws/stream/{stream_id}", get(stream_ws))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "active_streams": state.rooms.room_count().await,
    }))
}

async fn list_streams(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(state.rooms.summaries().await)
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    user_id: String,
    token: Option<String>,
}

async fn stream_ws(
    ws: WebSocketUpgrade,
    Path(stream_id): Path<String>,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    if stream_id.trim().is_empty() || query.user_id.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "user_id is required").into_response();
    }
    // Tokens are opaque to the relay; a fronting proxy validates them.
    if query.token.is_some() {
        debug!(%stream_id, user_id = %query.user_id, "Connection carries a token");
    }
    let max_message_size = state.config.signaling.max_message_size;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| relay::handle_stream_ws(socket, stream_id, query.user_id, state))
        .into_response()
}
