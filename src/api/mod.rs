// HTTP and WebSocket APIs

pub mod admin;
pub mod websocket;

pub use admin::{create_admin_router, AdminAppState, RelayPolicyUpdate};
pub use websocket::{create_ws_router, ws_handler, WsAppState};

use crate::relay::BroadcastRelay;
use axum::{response::Json, routing::get, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

/// GET /api/health
async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub fn create_health_router() -> Router {
    Router::new().route("/api/health", get(health))
}

/// Every route the relay serves, with permissive CORS for browser clients.
pub fn create_app(relay: Arc<BroadcastRelay>, admin_token: Option<String>) -> Router {
    let ws_state = Arc::new(WsAppState {
        relay: Arc::clone(&relay),
    });
    let admin_state = AdminAppState { relay, admin_token };

    Router::new()
        .merge(create_health_router())
        .merge(create_ws_router(ws_state))
        .merge(create_admin_router(admin_state))
        .layer(CorsLayer::permissive())
}
