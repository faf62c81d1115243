use crate::connection::ServerConnection;
use crate::error::MmsError;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::relay::BroadcastRelay;
use crate::transport::{outbound_channel, DisconnectReason, TransportListener};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Shared application state for WebSocket handler
#[derive(Clone)]
pub struct WsAppState {
    pub relay: Arc<BroadcastRelay>,
}

/// GET /api/ws - WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<WsAppState>>) -> Response {
    info!("WebSocket upgrade request received");
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

pub fn create_ws_router(state: Arc<WsAppState>) -> Router {
    Router::new()
        .route("/api/ws", get(ws_handler))
        .with_state(state)
}

/// Drive one socket: client frames go to the connection handler, frames the
/// relay queues for this connection go out in order.
async fn handle_socket(mut socket: WebSocket, state: Arc<WsAppState>) {
    let (outbound, mut outbound_rx) = outbound_channel();
    let mut connection = ServerConnection::new(Arc::clone(&state.relay), outbound.clone());
    connection.on_open();
    info!("WebSocket connection established");

    let reason = loop {
        tokio::select! {
            frame = outbound_rx.recv() => match frame {
                Some(message) => {
                    if let Err(e) = send_frame(&mut socket, &message).await {
                        error!(error = %e, "Failed to send frame");
                        break DisconnectReason::TransportError(e.to_string());
                    }
                    connection.on_message_sent(&message);
                }
                None => {
                    let _ = socket.send(Message::Close(None)).await;
                    break DisconnectReason::LocalShutdown;
                }
            },

            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(message) => connection.on_message_received(message),
                        Err(e) => {
                            warn!(error = %e, "Malformed client frame");
                            outbound.send(ServerMessage::error(&MmsError::Codec(e)));
                        }
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = socket.send(Message::Pong(data)).await {
                        error!(error = %e, "Failed to send pong");
                        break DisconnectReason::TransportError(e.to_string());
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("WebSocket client disconnected");
                    break DisconnectReason::PeerClosed;
                }
                Some(Ok(_)) => {
                    // Ignore binary, pong messages
                }
                Some(Err(e)) => {
                    warn!(error = %e, "WebSocket error");
                    break DisconnectReason::TransportError(e.to_string());
                }
            },
        }
    };

    connection.on_close(reason);
    info!("WebSocket connection closed");
}

async fn send_frame(socket: &mut WebSocket, message: &ServerMessage) -> anyhow::Result<()> {
    let json = serde_json::to_string(message)?;
    socket.send(Message::Text(json)).await?;
    Ok(())
}
