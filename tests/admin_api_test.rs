// Integration tests for the admin API (metrics, relay policy, session eviction)

use axum::{
    body::Body,
    http::{Request, StatusCode},
    response::Response,
    Router,
};
use mms::api::{create_admin_router, AdminAppState};
use mms::config::{new_relay_policy, BackpressurePolicy, RelayPolicy};
use mms::protocol::PublishEnvelope;
use mms::relay::BroadcastRelay;
use mms::transport::outbound_channel;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn create_relay() -> Arc<BroadcastRelay> {
    Arc::new(BroadcastRelay::new(
        new_relay_policy(RelayPolicy::default()),
        Duration::from_secs(60),
    ))
}

fn create_test_app(relay: Arc<BroadcastRelay>, admin_token: Option<&str>) -> Router {
    create_admin_router(AdminAppState {
        relay,
        admin_token: admin_token.map(|t| t.to_string()),
    })
}

fn bearer(token: &str) -> String {
    format!("Bearer {}", token)
}

async fn json_body(response: Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

fn put_policy(body: serde_json::Value, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("PUT")
        .uri("/api/admin/relay")
        .header("Content-Type", "application/json");
    if let Some(token) = token {
        builder = builder.header("Authorization", bearer(token));
    }
    builder
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

/// GET /api/admin/relay returns default values.
#[tokio::test]
async fn test_get_relay_policy_returns_defaults() {
    let app = create_test_app(create_relay(), None);

    let response = app
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/api/admin/relay")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let cfg = json_body(response).await;

    let defaults = RelayPolicy::default();
    assert_eq!(cfg["self_delivery"], defaults.self_delivery);
    assert_eq!(cfg["max_pending"], defaults.max_pending);
    assert_eq!(cfg["max_pending_age_secs"], defaults.max_pending_age_secs);
    assert_eq!(cfg["backpressure_policy"], "drop_backlog");
}

/// PUT /api/admin/relay updates fields and the relay sees them.
#[tokio::test]
async fn test_put_relay_policy_updates_fields() {
    let relay = create_relay();
    let app = create_test_app(Arc::clone(&relay), Some("secret"));

    let body = serde_json::json!({
        "self_delivery": true,
        "max_pending": 50,
        "backpressure_policy": "evict",
    });
    let response = app.oneshot(put_policy(body, Some("secret"))).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let cfg = json_body(response).await;
    assert_eq!(cfg["self_delivery"], true);
    assert_eq!(cfg["max_pending"], 50);
    assert_eq!(cfg["backpressure_policy"], "evict");
    // Untouched field keeps its value
    assert_eq!(
        cfg["max_pending_age_secs"],
        RelayPolicy::default().max_pending_age_secs
    );

    let policy = relay.policy();
    let stored = policy.read().unwrap();
    assert!(stored.self_delivery);
    assert_eq!(stored.max_pending, 50);
    assert_eq!(stored.backpressure_policy, BackpressurePolicy::Evict);
}

/// PUT /api/admin/relay with wrong or missing token returns 401.
#[tokio::test]
async fn test_put_relay_policy_requires_token() {
    let relay = create_relay();

    let body = serde_json::json!({ "self_delivery": true });
    let response = create_test_app(Arc::clone(&relay), Some("correct-token"))
        .oneshot(put_policy(body.clone(), Some("wrong-token")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = create_test_app(Arc::clone(&relay), Some("correct-token"))
        .oneshot(put_policy(body, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    assert!(!relay.policy().read().unwrap().self_delivery);
}

/// Without a configured token, PUT is unrestricted.
#[tokio::test]
async fn test_put_relay_policy_no_token_configured() {
    let app = create_test_app(create_relay(), None);

    let body = serde_json::json!({ "max_pending_age_secs": 10 });
    let response = app.oneshot(put_policy(body, None)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["max_pending_age_secs"], 10);
}

/// Unknown backpressure policy is rejected by the extractor.
#[tokio::test]
async fn test_put_relay_policy_invalid_policy() {
    let app = create_test_app(create_relay(), None);

    let body = serde_json::json!({ "backpressure_policy": "panic" });
    let response = app.oneshot(put_policy(body, None)).await.unwrap();

    assert!(response.status().is_client_error());
}

/// GET /api/admin/metrics reports counters and session count.
#[tokio::test]
async fn test_get_metrics() {
    let relay = create_relay();
    let (out_a, _rx_a) = outbound_channel();
    let (out_b, _rx_b) = outbound_channel();
    let a = relay.open_session(None, 0, out_a);
    let b = relay.open_session(None, 0, out_b);
    relay.subscribe(&b.session_id, "dk.dma.HelloWorld").unwrap();
    relay
        .publish(
            &a.session_id,
            PublishEnvelope {
                message_id: 1,
                latest_received_id: 0,
                channel: "dk.dma.HelloWorld".to_string(),
                payload: b"hi".to_vec(),
                position_time: None,
            },
        )
        .unwrap();

    let response = create_test_app(relay, None)
        .oneshot(
            Request::builder()
                .uri("/api/admin/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let metrics = json_body(response).await;
    assert_eq!(metrics["sessions"], 2);
    assert_eq!(metrics["channels"], 1);
    assert_eq!(metrics["sessions_opened"], 2);
    assert_eq!(metrics["publishes_accepted"], 1);
    assert_eq!(metrics["delivered_live"], 1);
}

/// DELETE /api/admin/sessions/:id evicts a live session, 404 afterwards.
#[tokio::test]
async fn test_delete_session() {
    let relay = create_relay();
    let (outbound, _rx) = outbound_channel();
    let attachment = relay.open_session(None, 0, outbound);
    let uri = format!("/api/admin/sessions/{}", attachment.session_id);

    let delete = |token: &str| {
        Request::builder()
            .method("DELETE")
            .uri(uri.as_str())
            .header("Authorization", bearer(token))
            .body(Body::empty())
            .unwrap()
    };

    let response = create_test_app(Arc::clone(&relay), Some("secret"))
        .oneshot(delete("nope"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(relay.contains_session(&attachment.session_id));

    let response = create_test_app(Arc::clone(&relay), Some("secret"))
        .oneshot(delete("secret"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(!relay.contains_session(&attachment.session_id));

    let response = create_test_app(Arc::clone(&relay), Some("secret"))
        .oneshot(delete("secret"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
