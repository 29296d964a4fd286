use std::fmt;

use chrono::{DateTime, Utc};
use relay_stream::{
    Backend, ChatMessage, ReasoningEffort, Role, SessionId, SessionStatus, ToolEvent, Usage,
};
use uuid::Uuid;

/// Identity of a durable message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identity of a conversation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub Uuid);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifies the session generation that produced a persisted message.
#[derive(Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct GenerationTag {
    pub session: SessionId,
    pub attempt: u64,
}

impl GenerationTag {
    pub fn new(session: SessionId, attempt: u64) -> Self {
        Self { session, attempt }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevisionKind {
    Rerun,
    Edit,
}

/// Marker appended each time a message is rewritten.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Revision {
    pub kind: RevisionKind,
    pub at: DateTime<Utc>,
}

impl Revision {
    pub fn now(kind: RevisionKind) -> Self {
        Self {
            kind,
            at: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<Backend>,
    /// Completion token estimate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_events: Vec<ToolEvent>,
    /// Counters reported by the backend, when a writer had them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<GenerationTag>,
    /// Terminal session status the content was captured at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub revisions: Vec<Revision>,
}

impl MessageMetadata {
    pub fn revision_count(&self, kind: RevisionKind) -> usize {
        self.revisions.iter().filter(|r| r.kind == kind).count()
    }

    pub fn is_edited(&self) -> bool {
        self.revision_count(RevisionKind::Edit) > 0
    }

    pub fn is_rerun(&self) -> bool {
        self.revision_count(RevisionKind::Rerun) > 0
    }
}

/// A durable conversation message.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub metadata: MessageMetadata,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Ordering key of the confirmed sequence.
    pub fn order_key(&self) -> (DateTime<Utc>, MessageId) {
        (self.created_at, self.id)
    }

    pub fn to_chat_message(&self) -> ChatMessage {
        ChatMessage::new(self.role, self.content.clone())
    }
}

/// Prior messages sent to the backend: everything up to and including
/// `until`, minus messages without text.
pub fn history_until(messages: &[Message], until: MessageId) -> Vec<ChatMessage> {
    let mut history = Vec::new();
    for message in messages {
        if !message.content.trim().is_empty() {
            history.push(message.to_chat_message());
        }
        if message.id == until {
            break;
        }
    }
    history
}
