use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info};

use super::{Connector, Credentials, RealtimeConnection};
use crate::{
    broker::{ClientEvent, JoinRoom, ServerEvent},
    chat::ChatMessage,
    error::{ChatError, Result},
};

/// Opens realtime connections to the backend's `/ws` endpoint.
#[derive(Debug, Clone)]
pub struct WsConnector {
    base_url: String,
}

impl WsConnector {
    /// `base_url` is the `ws://` or `wss://` origin of the backend.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    type Connection = WsConnection;

    async fn connect(&self, credentials: &Credentials) -> Result<WsConnection> {
        let url = format!(
            "{}/ws?token={}&role={}",
            self.base_url, credentials.token, credentials.identity.role
        );

        let (stream, _response) = connect_async(url)
            .await
            .map_err(|e| ChatError::Transport(format!("connect failed: {e}")))?;

        info!(identity = %credentials.identity, "Realtime connection established");
        Ok(WsConnection { stream })
    }
}

pub struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsConnection {
    async fn emit(&mut self, event: &ClientEvent) -> Result<()> {
        let text = serde_json::to_string(event)?;
        debug!("-> Sending realtime event: {}", text);

        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| ChatError::Transport(e.to_string()))
    }
}

#[async_trait]
impl RealtimeConnection for WsConnection {
    async fn join(&mut self, user_id: &str, doctor_id: &str) -> Result<()> {
        self.emit(&ClientEvent::JoinRoom(JoinRoom {
            user_id: user_id.to_string(),
            doctor_id: doctor_id.to_string(),
        }))
        .await
    }

    async fn publish(&mut self, message: &ChatMessage) -> Result<()> {
        self.emit(&ClientEvent::SendMessage(message.clone())).await
    }

    async fn next_event(&mut self) -> Option<ServerEvent> {
        while let Some(frame) = self.stream.next().await {
            let text = match frame {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => {
                    error!("Realtime connection failed: {}", e);
                    return None;
                }
            };

            match serde_json::from_str(&text) {
                Ok(event) => return Some(event),
                Err(e) => error!("Failed to parse realtime event: {} ({})", e, text),
            }
        }
        None
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!("Closing realtime connection: {}", e);
        }
    }
}
