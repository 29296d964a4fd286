use std::fmt;

use crate::chunk::{SessionContent, StreamChunk};
use crate::errors::SessionFailure;
use crate::model::Backend;

/// Caller-chosen identity of a session, typically the placeholder or message
/// it renders into. At most one session per identity is active.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Lifecycle state of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Cancelled,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal result of a session. Exactly one is produced per session.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SessionOutcome {
    pub id: SessionId,
    pub attempt: u64,
    pub status: SessionStatus,
    /// Everything applied before the session ended.
    pub content: SessionContent,
    /// Set only for `Failed`.
    pub failure: Option<SessionFailure>,
}

impl SessionOutcome {
    pub fn text(&self) -> &str {
        &self.content.text
    }
}

/// Events exposed by `SessionHandle`, in arrival order.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    /// First event of every session.
    Started {
        id: SessionId,
        attempt: u64,
        backend: Backend,
    },
    /// One chunk was applied; `content` is cumulative.
    Progress {
        seq: u64,
        chunk: StreamChunk,
        content: SessionContent,
    },
    /// Last event of every session.
    Finished(SessionOutcome),
}
