use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use mms::error::MmsError;
use mms::protocol::{ClientMessage, ServerMessage};
use mms::transport::{Dialer, Link};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Dials a relay's `/api/ws` endpoint. Frames are JSON text messages.
#[derive(Debug, Clone)]
pub struct WsDialer {
    url: String,
    connect_timeout: Duration,
}

impl WsDialer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Bound on the TCP connect plus WebSocket upgrade
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(&self) -> Result<Link, MmsError> {
        let (ws, _) = tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| MmsError::TransportFailure(format!("WebSocket connect {}: timed out", self.url)))?
            .map_err(|e| MmsError::TransportFailure(format!("WebSocket connect {}: {}", self.url, e)))?;
        debug!(url = %self.url, "WebSocket connected");

        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(ws, client_rx, server_tx));

        Ok(Link {
            outbound: client_tx,
            inbound: server_rx,
        })
    }
}

/// Shuttle frames between the socket and the link channels until either side closes.
async fn pump(
    mut ws: WsStream,
    mut outbound: mpsc::UnboundedReceiver<ClientMessage>,
    inbound: mpsc::UnboundedSender<ServerMessage>,
) {
    loop {
        tokio::select! {
            message = outbound.recv() => match message {
                Some(message) => {
                    let json = match serde_json::to_string(&message) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!(error = %e, "Failed to encode client frame");
                            continue;
                        }
                    };
                    if let Err(e) = ws.send(Message::text(json)).await {
                        warn!(error = %e, "WebSocket send failed");
                        break;
                    }
                }
                None => {
                    let _ = ws.close(None).await;
                    break;
                }
            },

            frame = ws.next() => match frame {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(message) => {
                        if inbound.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Malformed relay frame"),
                },
                Some(Ok(Message::Close(_))) | None => {
                    debug!("WebSocket closed by relay");
                    break;
                }
                Some(Ok(_)) => {
                    // Pings are answered by tungstenite
                }
                Some(Err(e)) => {
                    warn!(error = %e, "WebSocket error");
                    break;
                }
            },
        }
    }
}
