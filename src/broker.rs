use crate::chat::{ChatMessage, RoomKey};
use crate::entity::{Participant, Role};
use crate::error::{ChatError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Events pushed from the server to a realtime connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    /// A message was published into one of the connection's rooms
    ReceiveMessage(ChatMessage),

    /// Acknowledges a join; `room` is the room's display label
    Joined { room: String },

    /// A request on this connection was rejected
    Error { message: String },
}

/// Requests a realtime connection sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    JoinRoom(JoinRoom),
    SendMessage(ChatMessage),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoom {
    pub user_id: String,
    pub doctor_id: String,
}

pub type ConnectionId = u64;

struct Connection {
    identity: Participant,
    tx: mpsc::UnboundedSender<ServerEvent>,
    rooms: HashSet<RoomKey>,
}

#[derive(Default)]
struct Registry {
    next_id: ConnectionId,
    connections: HashMap<ConnectionId, Connection>,
    rooms: HashMap<RoomKey, BTreeSet<ConnectionId>>,
}

/// Fans chat messages out to the connections joined to a two-party room.
///
/// One broker serves the whole process and is handed to whoever needs it.
/// Joining a new room does not leave the previous ones: a connection keeps
/// every membership until it disconnects.
pub struct RoomBroker {
    registry: Mutex<Registry>,
}

impl Default for RoomBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomBroker {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a connection for `identity`. Events for it arrive on the
    /// returned receiver.
    pub fn connect(&self, identity: Participant) -> (ConnectionId, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = self.registry();

        registry.next_id += 1;
        let id = registry.next_id;

        info!(connection = id, identity = %identity, "Realtime connection opened");
        registry.connections.insert(
            id,
            Connection {
                identity,
                tx,
                rooms: HashSet::new(),
            },
        );

        (id, rx)
    }

    /// Add `connection` to the room of `user_id` and `doctor_id`. The
    /// connection's identity has to be one of the two.
    pub fn join(&self, connection: ConnectionId, user_id: &str, doctor_id: &str) -> Result<RoomKey> {
        let mut registry = self.registry();

        let conn = registry
            .connections
            .get_mut(&connection)
            .ok_or_else(|| ChatError::NotFound(format!("connection {connection}")))?;

        let allowed = match conn.identity.role {
            Role::User => conn.identity.id == user_id,
            Role::Doctor => conn.identity.id == doctor_id,
        };
        if !allowed {
            return Err(ChatError::Forbidden(format!(
                "{} is not a participant of {user_id}/{doctor_id}",
                conn.identity
            )));
        }

        let room = RoomKey::new(user_id, doctor_id);
        conn.rooms.insert(room.clone());
        registry
            .rooms
            .entry(room.clone())
            .or_default()
            .insert(connection);

        debug!(connection, room = %room, "Joined room");
        Ok(room)
    }

    /// Deliver `message` to every connection in its room, the sender's own
    /// included. Returns the number of connections reached; an empty room
    /// is not an error.
    pub fn publish(&self, message: &ChatMessage) -> usize {
        let room = message.room();
        let registry = self.registry();

        let Some(members) = registry.rooms.get(&room) else {
            debug!(room = %room, id = %message.id, "No listeners for message");
            return 0;
        };

        let mut delivered = 0;
        for member in members {
            let Some(conn) = registry.connections.get(member) else {
                continue;
            };
            if conn
                .tx
                .send(ServerEvent::ReceiveMessage(message.clone()))
                .is_ok()
            {
                delivered += 1;
            }
        }

        debug!(room = %room, id = %message.id, delivered, "Published message");
        delivered
    }

    /// Send an event to a single connection.
    pub fn notify(&self, connection: ConnectionId, event: ServerEvent) -> bool {
        self.registry()
            .connections
            .get(&connection)
            .map(|conn| conn.tx.send(event).is_ok())
            .unwrap_or(false)
    }

    /// Drop `connection` and all of its memberships.
    pub fn disconnect(&self, connection: ConnectionId) {
        let mut registry = self.registry();

        let Some(conn) = registry.connections.remove(&connection) else {
            return;
        };

        for room in &conn.rooms {
            if let Some(members) = registry.rooms.get_mut(room) {
                members.remove(&connection);
                if members.is_empty() {
                    registry.rooms.remove(room);
                }
            }
        }

        info!(connection, identity = %conn.identity, "Realtime connection closed");
    }

    pub fn identity(&self, connection: ConnectionId) -> Option<Participant> {
        self.registry()
            .connections
            .get(&connection)
            .map(|conn| conn.identity.clone())
    }

    pub fn connection_count(&self) -> usize {
        self.registry().connections.len()
    }

    pub fn members(&self, room: &RoomKey) -> Vec<ConnectionId> {
        self.registry()
            .rooms
            .get(room)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn rooms_of(&self, connection: ConnectionId) -> Vec<RoomKey> {
        let mut rooms: Vec<RoomKey> = self
            .registry()
            .connections
            .get(&connection)
            .map(|conn| conn.rooms.iter().cloned().collect())
            .unwrap_or_default();
        rooms.sort();
        rooms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn message(id: &str, from: Participant, to: Participant, text: &str) -> ChatMessage {
        ChatMessage {
            id: id.into(),
            sender_id: from.id,
            sender_model: from.role,
            receiver_id: to.id,
            receiver_model: to.role,
            message: text.into(),
            is_read: false,
            created_at: Utc::now(),
            updated_at: None,
            sender: None,
            receiver: None,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn publish_reaches_every_member_once() {
        let broker = RoomBroker::new();
        let (patient, mut patient_rx) = broker.connect(Participant::user("p1"));
        let (doctor, mut doctor_rx) = broker.connect(Participant::doctor("d1"));
        let (outsider, mut outsider_rx) = broker.connect(Participant::user("p2"));

        broker.join(patient, "p1", "d1").unwrap();
        broker.join(doctor, "p1", "d1").unwrap();
        broker.join(outsider, "p2", "d1").unwrap();

        let msg = message("m1", Participant::user("p1"), Participant::doctor("d1"), "hi");
        assert_eq!(broker.publish(&msg), 2);

        assert_eq!(drain(&mut patient_rx), vec![ServerEvent::ReceiveMessage(msg.clone())]);
        assert_eq!(drain(&mut doctor_rx), vec![ServerEvent::ReceiveMessage(msg)]);
        assert!(drain(&mut outsider_rx).is_empty());
    }

    #[test]
    fn publish_to_empty_room_is_a_no_op() {
        let broker = RoomBroker::new();
        let msg = message("m1", Participant::user("p1"), Participant::doctor("d1"), "hi");
        assert_eq!(broker.publish(&msg), 0);
    }

    #[test]
    fn per_room_order_matches_publish_order() {
        let broker = RoomBroker::new();
        let (doctor, mut rx) = broker.connect(Participant::doctor("d1"));
        broker.join(doctor, "p1", "d1").unwrap();

        let ids: Vec<String> = (0..20).map(|i| format!("m{i}")).collect();
        for (i, id) in ids.iter().enumerate() {
            let (from, to) = if i % 2 == 0 {
                (Participant::user("p1"), Participant::doctor("d1"))
            } else {
                (Participant::doctor("d1"), Participant::user("p1"))
            };
            broker.publish(&message(id, from, to, "x"));
        }

        let received: Vec<String> = drain(&mut rx)
            .into_iter()
            .filter_map(|event| match event {
                ServerEvent::ReceiveMessage(msg) => Some(msg.id),
                _ => None,
            })
            .collect();
        assert_eq!(received, ids);
    }

    #[test]
    fn memberships_accumulate_until_disconnect() {
        let broker = RoomBroker::new();
        let (doctor, _rx) = broker.connect(Participant::doctor("d1"));

        let first = broker.join(doctor, "p1", "d1").unwrap();
        let second = broker.join(doctor, "p2", "d1").unwrap();
        broker.join(doctor, "p1", "d1").unwrap();

        assert_eq!(broker.rooms_of(doctor).len(), 2);
        assert_eq!(broker.members(&first), vec![doctor]);

        broker.disconnect(doctor);
        assert!(broker.rooms_of(doctor).is_empty());
        assert!(broker.members(&first).is_empty());
        assert!(broker.members(&second).is_empty());
        assert_eq!(broker.identity(doctor), None);
    }

    #[test]
    fn join_requires_the_caller_to_be_a_participant() {
        let broker = RoomBroker::new();
        let (intruder, _rx) = broker.connect(Participant::user("p9"));

        let err = broker.join(intruder, "p1", "d1").unwrap_err();
        assert!(matches!(err, ChatError::Forbidden(_)));
        assert!(broker.rooms_of(intruder).is_empty());

        let (doctor, _rx) = broker.connect(Participant::doctor("p1"));
        assert!(broker.join(doctor, "p1", "d1").is_err());

        assert!(matches!(broker.join(999, "p1", "d1"), Err(ChatError::NotFound(_))));
    }

    #[test]
    fn underscored_ids_do_not_share_a_room() {
        let broker = RoomBroker::new();
        let (user_a, mut a_rx) = broker.connect(Participant::user("a"));
        let (user_ab, mut ab_rx) = broker.connect(Participant::user("a_b"));

        broker.join(user_a, "a", "b_c").unwrap();
        broker.join(user_ab, "a_b", "c").unwrap();

        let msg = message("m1", Participant::user("a_b"), Participant::doctor("c"), "private");
        assert_eq!(broker.publish(&msg), 1);

        assert!(drain(&mut a_rx).is_empty());
        assert_eq!(drain(&mut ab_rx), vec![ServerEvent::ReceiveMessage(msg)]);
    }

    #[test]
    fn events_use_tagged_wire_format() {
        let join: ClientEvent = serde_json::from_str(
            r#"{"type":"joinRoom","data":{"userId":"p1","doctorId":"d1"}}"#,
        )
        .unwrap();
        assert_eq!(
            join,
            ClientEvent::JoinRoom(JoinRoom {
                user_id: "p1".into(),
                doctor_id: "d1".into()
            })
        );

        let ack = serde_json::to_value(ServerEvent::Joined {
            room: RoomKey::new("p1", "d1").to_string(),
        })
        .unwrap();
        assert_eq!(ack["type"], "joined");
        assert_eq!(ack["data"]["room"], "d1_p1");
    }
}
