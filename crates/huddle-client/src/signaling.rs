use anyhow::Result;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use huddle_protocol::{ClientMessage, ServerMessage};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::error::ClientError;
use crate::transport::SignalingTransport;

/// WebSocket signaling channel to the relay.
///
/// Owns the socket through two background tasks; the returned receiver
/// yields every [`ServerMessage`] the relay sends, starting with `Welcome`.
pub struct WsSignaling {
    sender: mpsc::Sender<ClientMessage>,
}

impl WsSignaling {
    pub async fn connect(url: &str) -> Result<(Self, mpsc::UnboundedReceiver<ServerMessage>)> {
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::channel::<ClientMessage>(100);
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel::<ServerMessage>();

        // Outgoing messages
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(j) => j,
                    Err(e) => {
                        tracing::error!("Failed to serialize message: {}", e);
                        continue;
                    }
                };

                if write.send(Message::Text(json.into())).await.is_err() {
                    tracing::error!("Failed to send WebSocket message");
                    break;
                }
            }
        });

        // Incoming messages
        tokio::spawn(async move {
            while let Some(result) = read.next().await {
                match result {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<ServerMessage>(&text) {
                            Ok(msg) => {
                                if incoming_tx.send(msg).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::warn!("Unparseable server message: {}", e);
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by server");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
        });

        // Keepalive pings
        let tx_ping = tx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                interval.tick().await;
                if tx_ping.send(ClientMessage::Ping).await.is_err() {
                    break;
                }
            }
        });

        Ok((Self { sender: tx }, incoming_rx))
    }
}

#[async_trait]
impl SignalingTransport for WsSignaling {
    async fn send(&self, message: ClientMessage) -> Result<()> {
        self.sender
            .send(message)
            .await
            .map_err(|e| ClientError::Signaling(e.to_string()))?;
        Ok(())
    }
}
