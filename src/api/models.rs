use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a message in a local view.
///
/// A `Temporary` id lives only between an optimistic append and the store's
/// acknowledgement; it is then replaced by the `Durable` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageId {
    Temporary(Uuid),
    Durable(i64),
}

impl MessageId {
    pub fn durable(&self) -> Option<i64> {
        match self {
            MessageId::Durable(id) => Some(*id),
            MessageId::Temporary(_) => None,
        }
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self, MessageId::Temporary(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
}

impl Message {
    /// Builds the optimistic copy of an outgoing message.
    pub fn pending(key: &ConversationKey, content: &str) -> Self {
        Self {
            id: MessageId::Temporary(Uuid::new_v4()),
            sender_id: key.viewer.clone(),
            receiver_id: key.counterparty.clone(),
            content: content.to_string(),
            created_at: Utc::now(),
            is_read: false,
        }
    }

    pub fn is_addressed_to(&self, user: &UserId) -> bool {
        &self.receiver_id == user
    }
}

/// A `messages` row as the store returns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: i64,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_read: bool,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Self {
            id: MessageId::Durable(row.id),
            sender_id: row.sender_id,
            receiver_id: row.receiver_id,
            content: row.content,
            created_at: row.created_at,
            is_read: row.is_read,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
}

/// The two participants of a support thread, seen from `viewer`'s side.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    pub viewer: UserId,
    pub counterparty: UserId,
}

impl ConversationKey {
    pub fn new(viewer: UserId, counterparty: UserId) -> Self {
        Self { viewer, counterparty }
    }

    /// Direction-agnostic membership test.
    pub fn contains(&self, message: &Message) -> bool {
        (message.sender_id == self.viewer && message.receiver_id == self.counterparty)
            || (message.sender_id == self.counterparty && message.receiver_id == self.viewer)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: UserId,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub is_admin: bool,
}

impl Profile {
    pub fn display_name(&self) -> String {
        self.full_name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .or(self.email.as_deref())
            .map(str::to_string)
            .unwrap_or_else(|| self.id.to_string())
    }
}

/// Profile fields embedded in an inbox row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SenderProfile {
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub is_admin: bool,
}

/// One message-sender row of the admin inbox query, newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderActivity {
    pub sender_id: UserId,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub profiles: Option<SenderProfile>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    pub profile: Profile,
    pub last_message_at: DateTime<Utc>,
}

/// The signed-in user, handed explicitly to each chat surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: UserId,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    Other,
}

impl ChangeKind {
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_uppercase().as_str() {
            "INSERT" => ChangeKind::Insert,
            "UPDATE" => ChangeKind::Update,
            "DELETE" => ChangeKind::Delete,
            _ => ChangeKind::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
}
