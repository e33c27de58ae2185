//! Portal-side session handling: the controller both portals run, and the
//! transports it talks through.

pub mod http;
pub mod local;
pub mod session;
pub mod ws;

use async_trait::async_trait;

use crate::{
    broker::ServerEvent,
    chat::{ChatMessage, NewMessage, PatientSummary},
    entity::Participant,
    error::Result,
};

pub use http::HttpApi;
pub use local::{LocalApi, LocalConnector};
pub use session::{Command, ConnectionState, ConversationState, LoadTicket, SessionController};
pub use ws::WsConnector;

/// Who a session acts as, plus the token that proves it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub identity: Participant,
    pub token: String,
}

impl Credentials {
    pub fn new(identity: Participant, token: impl Into<String>) -> Self {
        Self {
            identity,
            token: token.into(),
        }
    }
}

/// The REST side of the messaging core.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn send(&self, message: &NewMessage) -> Result<ChatMessage>;

    async fn history(&self, a: &str, b: &str) -> Result<Vec<ChatMessage>>;

    /// Acknowledge everything `counterpart_id` sent to `owner_id`.
    async fn mark_read(&self, owner_id: &str, counterpart_id: &str) -> Result<()>;

    async fn patients_for_doctor(&self, doctor_id: &str) -> Result<Vec<PatientSummary>>;
}

/// Opens realtime connections.
#[async_trait]
pub trait Connector: Send + Sync {
    type Connection: RealtimeConnection + 'static;

    async fn connect(&self, credentials: &Credentials) -> Result<Self::Connection>;
}

/// One open realtime connection.
#[async_trait]
pub trait RealtimeConnection: Send {
    async fn join(&mut self, user_id: &str, doctor_id: &str) -> Result<()>;

    async fn publish(&mut self, message: &ChatMessage) -> Result<()>;

    /// The next event pushed by the server; `None` once the connection is
    /// gone.
    async fn next_event(&mut self) -> Option<ServerEvent>;

    async fn close(&mut self);
}
