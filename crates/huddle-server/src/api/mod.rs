use crate::error::AppError;
use crate::state::AppState;
use crate::ws;
use axum::{
    Json, Router,
    extract::{Path, State},
    routing::get,
};
use huddle_protocol::{IceServerConfig, Member};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(|| async { "OK" }))
        // ICE config for clients about to negotiate
        .route("/api/ice-servers", get(get_ice_servers))
        // Who is currently in a call (for channel lists outside the call)
        .route("/api/rooms/{room_id}/members", get(get_room_members))
        // WebSocket endpoint
        .route("/ws", get(ws::handler::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn get_room_members(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
) -> Result<Json<Vec<Member>>, AppError> {
    let members = state
        .rooms
        .members(room_id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("Room {room_id} has no active call")))?;
    Ok(Json(members))
}

#[derive(Debug, Serialize)]
pub struct IceServersResponse {
    pub ice_servers: Vec<IceServerConfig>,
}

async fn get_ice_servers(State(state): State<AppState>) -> Json<IceServersResponse> {
    let mut ice_servers = vec![];

    for stun_url in &state.config.stun_servers {
        ice_servers.push(IceServerConfig {
            urls: vec![stun_url.clone()],
            username: None,
            credential: None,
        });
    }

    for turn in &state.config.turn_servers {
        ice_servers.push(IceServerConfig {
            urls: vec![turn.url.clone()],
            username: Some(turn.username.clone()),
            credential: Some(turn.credential.clone()),
        });
    }

    Json(IceServersResponse { ice_servers })
}
