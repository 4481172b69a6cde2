use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use capsule_codec::Capsule;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::config::Config;
use crate::websocket::RelayState;

#[derive(Clone)]
pub struct AppState {
    pub relay: RelayState,
    mesh_secret: Option<Arc<str>>,
    accepted: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(config: &Config) -> Self {
        Self {
            relay: RelayState::new(),
            mesh_secret: config.mesh_secret.as_deref().map(Arc::from),
            accepted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn accepted_capsules(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Deserialize)]
pub struct HandshakeRequest {
    pub capsule: Option<Capsule>,
}

#[derive(Debug, Serialize)]
pub struct HandshakeResponse {
    pub accepted: bool,
    pub signed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "shapes-relay",
        "rooms": state.relay.room_count(),
        "capsules": state.accepted_capsules(),
    }))
}

/// Accept a capsule delivered over HTTP by a peer without an open data channel.
pub async fn mesh_handshake(
    State(state): State<AppState>,
    Json(request): Json<HandshakeRequest>,
) -> impl IntoResponse {
    let Some(capsule) = request.capsule else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "missing capsule" })),
        )
            .into_response();
    };

    if let Some(secret) = state.mesh_secret.as_deref() {
        match capsule.verify(secret) {
            Ok(true) => {}
            Ok(false) => {
                warn!(target: "shapes_relay::mesh", from = ?capsule.from, "rejected capsule with bad signature");
                return (
                    StatusCode::UNAUTHORIZED,
                    Json(json!({ "error": "signature mismatch" })),
                )
                    .into_response();
            }
            Err(err) => {
                warn!(target: "shapes_relay::mesh", from = ?capsule.from, error = %err, "capsule verification failed");
                return (
                    StatusCode::UNAUTHORIZED,
                    Json(json!({ "error": err.to_string() })),
                )
                    .into_response();
            }
        }
    }

    state.accepted.fetch_add(1, Ordering::Relaxed);
    info!(
        target: "shapes_relay::mesh",
        from = ?capsule.from,
        kind = %capsule.kind,
        signed = capsule.is_signed(),
        "capsule accepted"
    );
    (
        StatusCode::ACCEPTED,
        Json(HandshakeResponse {
            accepted: true,
            signed: capsule.is_signed(),
            from: capsule.from,
        }),
    )
        .into_response()
}
