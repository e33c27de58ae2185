//! In-process transports: the controller talks to the store and broker
//! directly, through the same request handling the network surface uses.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{ChatApi, Connector, Credentials, RealtimeConnection};
use crate::{
    broker::{ClientEvent, ConnectionId, JoinRoom, ServerEvent},
    chat::{ChatMessage, NewMessage, PatientSummary},
    conversation,
    entity::Participant,
    error::Result,
    server::{self, AppState},
    store::Store,
};

#[derive(Clone)]
pub struct LocalApi {
    store: Store,
}

impl LocalApi {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ChatApi for LocalApi {
    async fn send(&self, message: &NewMessage) -> Result<ChatMessage> {
        self.store.send(message).await
    }

    async fn history(&self, a: &str, b: &str) -> Result<Vec<ChatMessage>> {
        self.store.history(a, b).await
    }

    async fn mark_read(&self, owner_id: &str, counterpart_id: &str) -> Result<()> {
        self.store.mark_read(owner_id, counterpart_id).await?;
        Ok(())
    }

    async fn patients_for_doctor(&self, doctor_id: &str) -> Result<Vec<PatientSummary>> {
        conversation::patients_for_doctor(&self.store, doctor_id).await
    }
}

/// Connects straight to a broker in the same process. The identity is taken
/// from the credentials as given; there is no token check.
#[derive(Clone)]
pub struct LocalConnector {
    state: Arc<AppState>,
}

impl LocalConnector {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl Connector for LocalConnector {
    type Connection = LocalConnection;

    async fn connect(&self, credentials: &Credentials) -> Result<LocalConnection> {
        let (id, events) = self.state.broker.connect(credentials.identity.clone());

        Ok(LocalConnection {
            state: self.state.clone(),
            identity: credentials.identity.clone(),
            id,
            events,
            closed: false,
        })
    }
}

pub struct LocalConnection {
    state: Arc<AppState>,
    identity: Participant,
    id: ConnectionId,
    events: mpsc::UnboundedReceiver<ServerEvent>,
    closed: bool,
}

impl LocalConnection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    async fn request(&mut self, event: ClientEvent) {
        if let Err(e) = server::dispatch(&self.state, self.id, &self.identity, event).await {
            server::reject(&self.state, self.id, &self.identity, e);
        }
    }
}

#[async_trait]
impl RealtimeConnection for LocalConnection {
    async fn join(&mut self, user_id: &str, doctor_id: &str) -> Result<()> {
        self.request(ClientEvent::JoinRoom(JoinRoom {
            user_id: user_id.to_string(),
            doctor_id: doctor_id.to_string(),
        }))
        .await;
        Ok(())
    }

    async fn publish(&mut self, message: &ChatMessage) -> Result<()> {
        self.request(ClientEvent::SendMessage(message.clone())).await;
        Ok(())
    }

    async fn next_event(&mut self) -> Option<ServerEvent> {
        if self.closed {
            return None;
        }
        self.events.recv().await
    }

    async fn close(&mut self) {
        self.closed = true;
        self.state.broker.disconnect(self.id);
    }
}

impl Drop for LocalConnection {
    fn drop(&mut self) {
        self.state.broker.disconnect(self.id);
    }
}
