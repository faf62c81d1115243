// End-to-end protocol tests: raw frames over the in-memory transport

use mms::config::{new_relay_policy, RelayPolicy};
use mms::error::ErrorCode;
use mms::protocol::{ClientMessage, PublishEnvelope, ServerMessage};
use mms::relay::BroadcastRelay;
use mms::session::SessionId;
use mms::transport::{Dialer, Link, LoopbackDialer};
use std::sync::Arc;
use std::time::Duration;

const CHANNEL: &str = "dk.dma.HelloWorld";

fn create_relay() -> Arc<BroadcastRelay> {
    Arc::new(BroadcastRelay::new(
        new_relay_policy(RelayPolicy::default()),
        Duration::from_secs(60),
    ))
}

async fn next_frame(link: &mut Link) -> ServerMessage {
    tokio::time::timeout(Duration::from_secs(2), link.inbound.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("link closed")
}

/// Send hello and return (session id, resumed, redelivered)
async fn hello(link: &mut Link, session_id: Option<SessionId>, latest_received_id: u64) -> (SessionId, bool, u64) {
    link.outbound
        .send(ClientMessage::Hello {
            session_id,
            latest_received_id,
        })
        .unwrap();
    match next_frame(link).await {
        ServerMessage::Connected {
            session_id,
            resumed,
            redelivered,
        } => (session_id, resumed, redelivered),
        other => panic!("expected connected, got {:?}", other),
    }
}

fn publish(link: &Link, message_id: u64, latest_received_id: u64) {
    link.outbound
        .send(ClientMessage::Publish(PublishEnvelope {
            message_id,
            latest_received_id,
            channel: CHANNEL.to_string(),
            payload: format!("msg {}", message_id).into_bytes(),
            position_time: None,
        }))
        .unwrap();
}

async fn next_relay_id(link: &mut Link) -> u64 {
    match next_frame(link).await {
        ServerMessage::Relay(envelope) => envelope.id,
        other => panic!("expected relay frame, got {:?}", other),
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test]
async fn test_publish_reaches_subscribers_in_order() {
    let relay = create_relay();
    let dialer = LoopbackDialer::new(Arc::clone(&relay));

    let mut sender = dialer.dial().await.unwrap();
    let mut receiver = dialer.dial().await.unwrap();
    hello(&mut sender, None, 0).await;
    let (receiver_id, _, _) = hello(&mut receiver, None, 0).await;

    receiver
        .outbound
        .send(ClientMessage::Subscribe {
            channel: CHANNEL.to_string(),
        })
        .unwrap();
    wait_until(|| relay.registry().subscribers_of(CHANNEL) == vec![receiver_id.clone()]).await;

    for message_id in 1..=3 {
        publish(&sender, message_id, 0);
    }

    for expected in 1..=3 {
        match next_frame(&mut receiver).await {
            ServerMessage::Relay(envelope) => {
                assert_eq!(envelope.id, expected);
                assert_eq!(envelope.message_id, expected);
                assert_eq!(envelope.channel, CHANNEL);
                assert_eq!(envelope.payload, format!("msg {}", expected).into_bytes());
            }
            other => panic!("expected relay frame, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_frames_before_hello_are_rejected() {
    let dialer = LoopbackDialer::new(create_relay());
    let mut link = dialer.dial().await.unwrap();

    publish(&link, 1, 0);
    match next_frame(&mut link).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::UnauthenticatedSession),
        other => panic!("expected error, got {:?}", other),
    }

    // The connection survives and can still shake hands
    let (_, resumed, _) = hello(&mut link, None, 0).await;
    assert!(!resumed);
}

#[tokio::test]
async fn test_resume_after_sever_redelivers_missed() {
    let relay = create_relay();
    let sender_dialer = LoopbackDialer::new(Arc::clone(&relay));
    let receiver_dialer = LoopbackDialer::new(Arc::clone(&relay));

    let mut sender = sender_dialer.dial().await.unwrap();
    hello(&mut sender, None, 0).await;

    let mut receiver = receiver_dialer.dial().await.unwrap();
    let (receiver_id, _, _) = hello(&mut receiver, None, 0).await;
    receiver
        .outbound
        .send(ClientMessage::Subscribe {
            channel: CHANNEL.to_string(),
        })
        .unwrap();
    wait_until(|| !relay.registry().subscribers_of(CHANNEL).is_empty()).await;

    for message_id in 1..=5 {
        publish(&sender, message_id, 0);
    }
    for expected in 1..=5 {
        assert_eq!(next_relay_id(&mut receiver).await, expected);
    }

    // Receiver drops off after acknowledging 5
    receiver_dialer.sever();
    wait_until(|| !relay.is_attached(&receiver_id)).await;

    for message_id in 6..=8 {
        publish(&sender, message_id, 0);
    }
    wait_until(|| relay.pending_count(&receiver_id) == Some(8)).await;

    let mut receiver = receiver_dialer.dial().await.unwrap();
    let (resumed_id, resumed, redelivered) = hello(&mut receiver, Some(receiver_id.clone()), 5).await;
    assert_eq!(resumed_id, receiver_id);
    assert!(resumed);
    assert_eq!(redelivered, 3);

    publish(&sender, 9, 0);
    for expected in 6..=9 {
        assert_eq!(next_relay_id(&mut receiver).await, expected);
    }
    assert_eq!(relay.pending_count(&receiver_id), Some(4));
}

#[tokio::test]
async fn test_unknown_session_gets_fresh_one() {
    let dialer = LoopbackDialer::new(create_relay());
    let mut link = dialer.dial().await.unwrap();

    let stale = SessionId::from("expired-session");
    let (session_id, resumed, redelivered) = hello(&mut link, Some(stale.clone()), 42).await;
    assert_ne!(session_id, stale);
    assert!(!resumed);
    assert_eq!(redelivered, 0);
}

#[tokio::test]
async fn test_logout_closes_link_and_session() {
    let relay = create_relay();
    let dialer = LoopbackDialer::new(Arc::clone(&relay));
    let mut link = dialer.dial().await.unwrap();
    let (session_id, _, _) = hello(&mut link, None, 0).await;

    link.outbound.send(ClientMessage::Logout).unwrap();

    let closed = tokio::time::timeout(Duration::from_secs(2), link.inbound.recv())
        .await
        .unwrap();
    assert_eq!(closed, None);
    assert!(!relay.contains_session(&session_id));
}

#[tokio::test]
async fn test_second_connection_replaces_first() {
    let relay = create_relay();
    let dialer = LoopbackDialer::new(Arc::clone(&relay));

    let mut first = dialer.dial().await.unwrap();
    let (session_id, _, _) = hello(&mut first, None, 0).await;

    let mut second = dialer.dial().await.unwrap();
    let (same_id, resumed, _) = hello(&mut second, Some(session_id.clone()), 0).await;
    assert_eq!(same_id, session_id);
    assert!(resumed);

    // The replaced link is shut down; the session stays on the new one
    let closed = tokio::time::timeout(Duration::from_secs(2), first.inbound.recv())
        .await
        .unwrap();
    assert_eq!(closed, None);
    wait_until(|| relay.metrics().snapshot().active_transports == 1).await;
    assert!(relay.is_attached(&session_id));
}
