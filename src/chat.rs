use crate::entity::{Participant, ProfileSummary, Role};
use crate::error::ChatError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A stored chat message. `sender` and `receiver` carry the resolved
/// directory fields and are absent on records that were never resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub sender_id: String,
    pub sender_model: Role,
    pub receiver_id: String,
    pub receiver_model: Role,
    pub message: String,
    #[serde(default)]
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<ProfileSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<ProfileSummary>,
}

impl ChatMessage {
    pub fn sender(&self) -> Participant {
        Participant::new(self.sender_id.clone(), self.sender_model)
    }

    pub fn receiver(&self) -> Participant {
        Participant::new(self.receiver_id.clone(), self.receiver_model)
    }

    pub fn room(&self) -> RoomKey {
        RoomKey::new(&self.sender_id, &self.receiver_id)
    }

    pub fn involves(&self, id: &str) -> bool {
        self.sender_id == id || self.receiver_id == id
    }

    /// The other side of the message as seen from `id`, if `id` takes part.
    pub fn counterpart_of(&self, id: &str) -> Option<&str> {
        if self.sender_id == id {
            Some(&self.receiver_id)
        } else if self.receiver_id == id {
            Some(&self.sender_id)
        } else {
            None
        }
    }
}

/// Broadcast group for a pair of participants. The ids are kept as a
/// sorted pair, so the key is the same whichever side computes it and ids
/// containing `_` cannot alias another pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomKey {
    low: String,
    high: String,
}

impl RoomKey {
    pub fn new(a: &str, b: &str) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Self {
            low: low.to_string(),
            high: high.to_string(),
        }
    }

    pub fn participants(&self) -> (&str, &str) {
        (&self.low, &self.high)
    }
}

/// The `_`-joined label used in logs and join acknowledgements.
impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.low, self.high)
    }
}

/// One sidebar row of the doctor portal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientSummary {
    pub id: String,
    pub name: String,
    pub profile_pic: Option<String>,
    pub last_message: String,
    pub unread_count: u32,
}

/// Validated input for a send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub sender: Participant,
    pub receiver: Participant,
    pub text: String,
}

impl NewMessage {
    pub fn new(sender: Participant, receiver: Participant, text: impl Into<String>) -> Self {
        Self {
            sender,
            receiver,
            text: text.into(),
        }
    }

    pub fn validate(&self) -> Result<(), ChatError> {
        if self.sender.id.trim().is_empty() {
            return Err(ChatError::Validation("senderId is required".into()));
        }
        if self.receiver.id.trim().is_empty() {
            return Err(ChatError::Validation("receiverId is required".into()));
        }
        if self.text.trim().is_empty() {
            return Err(ChatError::Validation("message must not be empty".into()));
        }
        Ok(())
    }
}

/// Body of `POST /messages/send`. Every field is optional on the wire so a
/// missing one is reported as a validation failure rather than a decode
/// failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub sender_id: Option<String>,
    pub sender_model: Option<Role>,
    pub receiver_id: Option<String>,
    pub receiver_model: Option<Role>,
    pub message: Option<String>,
}

impl SendMessageRequest {
    pub fn from_new(msg: &NewMessage) -> Self {
        Self {
            sender_id: Some(msg.sender.id.clone()),
            sender_model: Some(msg.sender.role),
            receiver_id: Some(msg.receiver.id.clone()),
            receiver_model: Some(msg.receiver.role),
            message: Some(msg.text.clone()),
        }
    }
}

impl TryFrom<SendMessageRequest> for NewMessage {
    type Error = ChatError;

    fn try_from(req: SendMessageRequest) -> Result<Self, Self::Error> {
        fn required<T>(value: Option<T>, field: &str) -> Result<T, ChatError> {
            value.ok_or_else(|| ChatError::Validation(format!("{field} is required")))
        }

        let msg = NewMessage {
            sender: Participant::new(
                required(req.sender_id, "senderId")?,
                required(req.sender_model, "senderModel")?,
            ),
            receiver: Participant::new(
                required(req.receiver_id, "receiverId")?,
                required(req.receiver_model, "receiverModel")?,
            ),
            text: required(req.message, "message")?,
        };
        msg.validate()?;
        Ok(msg)
    }
}

/// Body of `POST /messages/mark-read`: acknowledge everything `user_id`
/// sent to `doctor_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadRequest {
    pub user_id: String,
    pub doctor_id: String,
}
