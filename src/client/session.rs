use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{ChatApi, Connector, Credentials, RealtimeConnection};
use crate::{
    broker::ServerEvent,
    chat::{ChatMessage, NewMessage, PatientSummary},
    entity::{Participant, Role},
    error::{ChatError, Result},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    NoConversationSelected,
    ConversationLoading,
    ConversationActive,
}

/// Marks one conversation load. A ticket goes stale as soon as another
/// conversation is selected or the session is reset, and results carried
/// by a stale ticket are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadTicket {
    epoch: u64,
}

/// User actions fed into [`SessionController::run`].
#[derive(Debug)]
pub enum Command {
    Select(Participant),
    Send {
        text: String,
        reply: oneshot::Sender<Result<ChatMessage>>,
    },
    Shutdown,
}

enum Step {
    Event(Option<ServerEvent>),
    Command(Option<Command>),
}

/// Client-side state of one portal session.
///
/// The patient and doctor portals run the same controller; which one it is
/// follows from the identity's role. The doctor variant also keeps the
/// patient sidebar current.
pub struct SessionController<A: ChatApi, C: Connector> {
    api: A,
    connector: C,
    credentials: Option<Credentials>,
    connection: Option<C::Connection>,
    connection_state: ConnectionState,
    conversation_state: ConversationState,
    counterpart: Option<Participant>,
    messages: Vec<ChatMessage>,
    patients: Vec<PatientSummary>,
    notices: Vec<String>,
    epoch: u64,
}

impl<A: ChatApi, C: Connector> SessionController<A, C> {
    pub fn new(api: A, connector: C) -> Self {
        Self {
            api,
            connector,
            credentials: None,
            connection: None,
            connection_state: ConnectionState::Disconnected,
            conversation_state: ConversationState::NoConversationSelected,
            counterpart: None,
            messages: Vec::new(),
            patients: Vec::new(),
            notices: Vec::new(),
            epoch: 0,
        }
    }

    pub fn identity(&self) -> Option<&Participant> {
        self.credentials.as_ref().map(|c| &c.identity)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    pub fn conversation_state(&self) -> ConversationState {
        self.conversation_state
    }

    pub fn counterpart(&self) -> Option<&Participant> {
        self.counterpart.as_ref()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Doctor sidebar. Always empty for patient sessions.
    pub fn patients(&self) -> &[PatientSummary] {
        &self.patients
    }

    /// User-facing notices collected since the last call.
    pub fn take_notices(&mut self) -> Vec<String> {
        std::mem::take(&mut self.notices)
    }

    fn is_doctor(&self) -> bool {
        self.identity().map(|p| p.role) == Some(Role::Doctor)
    }

    fn me(&self) -> Result<Participant> {
        self.identity()
            .cloned()
            .ok_or_else(|| ChatError::Unauthorized("no identity for this session".into()))
    }

    fn notice(&mut self, notice: String) {
        warn!("{}", notice);
        self.notices.push(notice);
    }

    /// Take on `credentials` and open the session's connection. A different
    /// identity first tears down the previous connection and conversation.
    pub async fn set_identity(&mut self, credentials: Credentials) -> Result<()> {
        let same_identity = self.identity() == Some(&credentials.identity);
        if same_identity && self.connection_state == ConnectionState::Connected {
            self.credentials = Some(credentials);
            return Ok(());
        }

        self.disconnect().await;
        if !same_identity {
            self.reset_conversation();
            self.patients.clear();
        }

        self.credentials = Some(credentials);
        self.connect().await
    }

    /// Open the realtime connection for the current identity, replacing any
    /// existing one, then restore the open conversation.
    pub async fn connect(&mut self) -> Result<()> {
        let Some(credentials) = self.credentials.clone() else {
            return Err(ChatError::Unauthorized("no identity for this session".into()));
        };

        if self.connection.is_some() {
            self.disconnect().await;
        }

        self.connection_state = ConnectionState::Connecting;
        match self.connector.connect(&credentials).await {
            Ok(connection) => {
                self.connection = Some(connection);
                self.connection_state = ConnectionState::Connected;
                info!(identity = %credentials.identity, "Session connected");
                self.on_connected().await;
                Ok(())
            }
            Err(e) => {
                self.connection_state = ConnectionState::Disconnected;
                self.notice(format!("Could not connect to chat: {e}"));
                Err(e)
            }
        }
    }

    /// Room membership does not survive a reconnect, so an open
    /// conversation is joined and loaded again.
    async fn on_connected(&mut self) {
        if let Some(counterpart) = self.counterpart.clone() {
            if let Err(e) = self.load_conversation(counterpart).await {
                self.notice(format!("Failed to restore conversation: {e}"));
            }
        } else if self.is_doctor() {
            self.refresh_patients().await;
        }
    }

    /// Close the realtime connection. The broker drops its memberships.
    pub async fn disconnect(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.close().await;
            debug!("Session connection closed");
        }
        self.connection_state = ConnectionState::Disconnected;
    }

    /// End the session: disconnect and forget the identity and all local
    /// state. Results still in flight are discarded.
    pub async fn logout(&mut self) {
        self.disconnect().await;
        self.credentials = None;
        self.reset_conversation();
        self.patients.clear();
    }

    fn reset_conversation(&mut self) {
        self.epoch += 1;
        self.counterpart = None;
        self.messages.clear();
        self.conversation_state = ConversationState::NoConversationSelected;
    }

    /// Open the conversation with `counterpart`: join its room, load the
    /// history, then acknowledge what the counterpart sent. Switching does
    /// not leave the previous room.
    pub async fn select_conversation(&mut self, counterpart: Participant) -> Result<()> {
        self.load_conversation(counterpart).await
    }

    async fn load_conversation(&mut self, counterpart: Participant) -> Result<()> {
        let me = self.me()?;
        let ticket = self.begin_load(counterpart.clone());

        self.join(&me, &counterpart).await;

        // Counterpart first: a history fetch acknowledges what its first
        // party sent to the second.
        let history = match self.api.history(&counterpart.id, &me.id).await {
            Ok(history) => history,
            Err(e) => {
                self.notice(format!("Failed to load messages: {e}"));
                return Err(e);
            }
        };
        if !self.apply_history(ticket, history) {
            return Ok(());
        }

        self.acknowledge(&me, &counterpart).await;
        if self.is_doctor() {
            self.refresh_patients().await;
        }
        Ok(())
    }

    /// Switch the local view to `counterpart` and hand out the ticket its
    /// history has to come back with.
    pub fn begin_load(&mut self, counterpart: Participant) -> LoadTicket {
        self.epoch += 1;
        self.counterpart = Some(counterpart);
        self.messages.clear();
        self.conversation_state = ConversationState::ConversationLoading;
        LoadTicket { epoch: self.epoch }
    }

    /// Install a fetched history. Messages that arrived live while loading
    /// are kept, without duplicates. Returns `false` and changes nothing if
    /// the ticket is stale.
    pub fn apply_history(&mut self, ticket: LoadTicket, history: Vec<ChatMessage>) -> bool {
        if ticket.epoch != self.epoch {
            debug!("Discarding history for a conversation no longer open");
            return false;
        }

        let live = std::mem::replace(&mut self.messages, history);
        for message in live {
            self.merge(message);
        }
        self.conversation_state = ConversationState::ConversationActive;
        true
    }

    /// Append `message` unless one with the same id is already present.
    pub fn merge(&mut self, message: ChatMessage) -> bool {
        if self.messages.iter().any(|m| m.id == message.id) {
            return false;
        }
        self.messages.push(message);
        true
    }

    async fn join(&mut self, me: &Participant, counterpart: &Participant) {
        let (user_id, doctor_id) = match me.role {
            Role::Doctor => (counterpart.id.as_str(), me.id.as_str()),
            Role::User => (me.id.as_str(), counterpart.id.as_str()),
        };

        let Some(connection) = self.connection.as_mut() else {
            debug!("Not connected; room will be joined on connect");
            return;
        };
        let joined = connection.join(user_id, doctor_id).await;
        if let Err(e) = joined {
            self.connection = None;
            self.connection_state = ConnectionState::Disconnected;
            self.notice(format!("Lost chat connection: {e}"));
        }
    }

    async fn acknowledge(&mut self, me: &Participant, counterpart: &Participant) {
        if let Err(e) = self.api.mark_read(&me.id, &counterpart.id).await {
            self.notice(format!("Failed to mark messages read: {e}"));
        }
    }

    /// Re-fetch the doctor sidebar. No-op for patient sessions.
    pub async fn refresh_patients(&mut self) {
        let Ok(me) = self.me() else {
            return;
        };
        if me.role != Role::Doctor {
            return;
        }

        match self.api.patients_for_doctor(&me.id).await {
            Ok(patients) => {
                if self.identity() == Some(&me) {
                    self.patients = patients;
                }
            }
            Err(e) => self.notice(format!("Failed to refresh patients: {e}")),
        }
    }

    /// React to one event pushed over the realtime connection.
    pub async fn handle_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::ReceiveMessage(message) => self.on_message(message).await,
            ServerEvent::Joined { room } => debug!(room = %room, "Joined room"),
            ServerEvent::Error { message } => self.notice(format!("Chat server: {message}")),
        }
    }

    async fn on_message(&mut self, message: ChatMessage) {
        let Ok(me) = self.me() else {
            return;
        };

        if let Some(counterpart) = self.counterpart.clone() {
            let in_conversation =
                message.sender_id == counterpart.id || message.receiver_id == counterpart.id;

            if in_conversation {
                let addressed_to_me = message.receiver_id == me.id;
                self.merge(message);
                if addressed_to_me {
                    self.acknowledge(&me, &counterpart).await;
                }
            }
        }

        if self.is_doctor() {
            self.refresh_patients().await;
        }
    }

    /// Persist `text` into the open conversation, then publish the stored
    /// record. Nothing is queued: without a live connection the send fails.
    pub async fn send(&mut self, text: &str) -> Result<ChatMessage> {
        let me = self.me()?;
        let counterpart = self
            .counterpart
            .clone()
            .ok_or_else(|| ChatError::Validation("no conversation selected".into()))?;
        if text.trim().is_empty() {
            return Err(ChatError::Validation("message must not be empty".into()));
        }
        if self.connection_state != ConnectionState::Connected {
            return Err(ChatError::Transport("not connected".into()));
        }

        let stored = self
            .api
            .send(&NewMessage::new(me, counterpart, text))
            .await?;
        self.merge(stored.clone());

        let published = match self.connection.as_mut() {
            Some(connection) => connection.publish(&stored).await,
            None => Err(ChatError::Transport("not connected".into())),
        };
        if let Err(e) = published {
            self.connection = None;
            self.connection_state = ConnectionState::Disconnected;
            return Err(e);
        }

        Ok(stored)
    }

    /// Wait for the next pushed event, or `None` when not connected or the
    /// connection has dropped.
    pub async fn next_event(&mut self) -> Option<ServerEvent> {
        self.connection.as_mut()?.next_event().await
    }

    /// Drive the session from realtime events and `commands` until shutdown.
    /// A dropped connection ends the loop with a transport error; the host
    /// reconnects with [`SessionController::connect`] and runs again.
    pub async fn run(&mut self, commands: &mut mpsc::Receiver<Command>) -> Result<()> {
        loop {
            let step = {
                let Some(connection) = self.connection.as_mut() else {
                    return Err(ChatError::Transport("not connected".into()));
                };
                tokio::select! {
                    event = connection.next_event() => Step::Event(event),
                    command = commands.recv() => Step::Command(command),
                }
            };

            match step {
                Step::Event(Some(event)) => self.handle_event(event).await,
                Step::Event(None) => {
                    self.connection = None;
                    self.connection_state = ConnectionState::Disconnected;
                    self.notice("Chat connection lost".to_string());
                    return Err(ChatError::Transport("realtime connection lost".into()));
                }
                Step::Command(Some(Command::Select(counterpart))) => {
                    // Failures are already surfaced as notices.
                    let _ = self.select_conversation(counterpart).await;
                }
                Step::Command(Some(Command::Send { text, reply })) => {
                    let result = self.send(&text).await;
                    if let Err(e) = &result {
                        self.notice(format!("Failed to send message: {e}"));
                    }
                    let _ = reply.send(result);
                }
                Step::Command(Some(Command::Shutdown)) | Step::Command(None) => {
                    self.logout().await;
                    return Ok(());
                }
            }
        }
    }
}
