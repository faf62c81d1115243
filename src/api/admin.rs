use crate::config::BackpressurePolicy;
use crate::relay::{BroadcastRelay, CloseReason, MetricsSnapshot};
use crate::session::SessionId;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError};
use tracing::info;

/// State for the admin API.
#[derive(Clone)]
pub struct AdminAppState {
    pub relay: Arc<BroadcastRelay>,
    /// Required bearer token for mutating routes. None = unrestricted.
    pub admin_token: Option<String>,
}

/// Partial update body. Only fields present in the request are changed.
#[derive(Debug, Default, Deserialize)]
pub struct RelayPolicyUpdate {
    pub self_delivery: Option<bool>,
    pub max_pending: Option<usize>,
    pub max_pending_age_secs: Option<u64>,
    pub backpressure_policy: Option<BackpressurePolicy>,
}

#[derive(Serialize)]
struct MetricsResponse {
    sessions: usize,
    channels: usize,
    #[serde(flatten)]
    metrics: MetricsSnapshot,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

pub fn create_admin_router(state: AdminAppState) -> Router {
    Router::new()
        .route("/api/admin/metrics", get(get_metrics))
        .route("/api/admin/relay", get(get_relay_policy).put(put_relay_policy))
        .route("/api/admin/sessions/:id", delete(delete_session))
        .with_state(Arc::new(state))
}

/// GET /api/admin/metrics
async fn get_metrics(State(state): State<Arc<AdminAppState>>) -> Response {
    Json(MetricsResponse {
        sessions: state.relay.session_count(),
        channels: state.relay.registry().channel_count(),
        metrics: state.relay.metrics().snapshot(),
    })
    .into_response()
}

/// GET /api/admin/relay - current relay policy
async fn get_relay_policy(State(state): State<Arc<AdminAppState>>) -> Response {
    let policy = state.relay.policy();
    let current = policy
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    Json(current).into_response()
}

/// PUT /api/admin/relay - partial update, applied to the next publish and sweep.
async fn put_relay_policy(
    State(state): State<Arc<AdminAppState>>,
    headers: HeaderMap,
    Json(update): Json<RelayPolicyUpdate>,
) -> Response {
    if !validate_admin_token(&headers, &state.admin_token) {
        return unauthorized();
    }

    let policy = state.relay.policy();
    let mut cfg = policy.write().unwrap_or_else(PoisonError::into_inner);

    if let Some(v) = update.self_delivery {
        cfg.self_delivery = v;
    }
    if let Some(v) = update.max_pending {
        cfg.max_pending = v;
    }
    if let Some(v) = update.max_pending_age_secs {
        cfg.max_pending_age_secs = v;
    }
    if let Some(v) = update.backpressure_policy {
        cfg.backpressure_policy = v;
    }
    info!(policy = ?*cfg, "Relay policy updated");

    Json(cfg.clone()).into_response()
}

/// DELETE /api/admin/sessions/:id - operator eviction
async fn delete_session(
    State(state): State<Arc<AdminAppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if !validate_admin_token(&headers, &state.admin_token) {
        return unauthorized();
    }

    let session_id = SessionId::from(id);
    if state.relay.close_session(&session_id, CloseReason::Operator) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("Session '{}' not found", session_id),
            }),
        )
            .into_response()
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            error: "Unauthorized".to_string(),
        }),
    )
        .into_response()
}

/// Returns true if the bearer token in `Authorization` matches the expected admin token.
/// Returns true (no restriction) when `expected` is None.
fn validate_admin_token(headers: &HeaderMap, expected: &Option<String>) -> bool {
    let Some(expected_token) = expected else {
        return true;
    };

    let Some(auth_header) = headers.get("Authorization") else {
        return false;
    };
    let Ok(value) = auth_header.to_str() else {
        return false;
    };
    let Some(token) = value.strip_prefix("Bearer ") else {
        return false;
    };

    token == expected_token
}
