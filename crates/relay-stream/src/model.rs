use std::fmt;

use crate::chunk::{StreamChunk, ToolEvent};
use crate::errors::RelayError;

/// Interchangeable model backends a request can be routed to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Backend {
    /// Fast general model.
    #[serde(rename = "mojo")]
    Mojo,
    /// Reasoning model.
    #[serde(rename = "mojo++")]
    MojoPlus,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mojo => "mojo",
            Self::MojoPlus => "mojo++",
        }
    }

    /// Reasoning effort applied when the request does not set one.
    pub fn default_reasoning_effort(&self) -> Option<ReasoningEffort> {
        match self {
            Self::Mojo => None,
            Self::MojoPlus => Some(ReasoningEffort::Medium),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Author of a conversation message.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One prior message sent to the backend.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Reasoning effort hint (honoured by reasoning backends only).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

impl ReasoningEffort {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Backend-specific request options.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RequestOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,
    /// Opaque requester identity forwarded to the backend (profile personalization).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requester_id: Option<String>,
}

/// Normalized chat request handed to the gateway.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatRequest {
    pub prior_messages: Vec<ChatMessage>,
    pub backend: Backend,
    pub streaming: bool,
    pub options: RequestOptions,
}

impl ChatRequest {
    /// Creates a streaming request with no messages yet.
    pub fn new(backend: Backend) -> Self {
        Self {
            prior_messages: Vec::new(),
            backend,
            streaming: true,
            options: RequestOptions::default(),
        }
    }

    /// Appends one message to the history.
    pub fn message(mut self, role: Role, content: impl Into<String>) -> Self {
        self.prior_messages.push(ChatMessage::new(role, content));
        self
    }

    /// Appends a user message.
    pub fn user(self, content: impl Into<String>) -> Self {
        self.message(Role::User, content)
    }

    /// Appends an assistant message.
    pub fn assistant(self, content: impl Into<String>) -> Self {
        self.message(Role::Assistant, content)
    }

    /// Replaces the history.
    pub fn messages(mut self, messages: Vec<ChatMessage>) -> Self {
        self.prior_messages = messages;
        self
    }

    /// Selects the streaming or the blocking path.
    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn reasoning_effort(mut self, effort: ReasoningEffort) -> Self {
        self.options.reasoning_effort = Some(effort);
        self
    }

    pub fn requester_id(mut self, requester_id: impl Into<String>) -> Self {
        self.options.requester_id = Some(requester_id.into());
        self
    }

    /// Reasoning effort after applying the backend default.
    pub fn effective_reasoning_effort(&self) -> Option<ReasoningEffort> {
        self.options
            .reasoning_effort
            .or_else(|| self.backend.default_reasoning_effort())
    }

    /// Checks the request before any backend is contacted.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.prior_messages.is_empty() {
            return Err(RelayError::Validation(
                "at least one message is required".into(),
            ));
        }
        if self
            .prior_messages
            .iter()
            .any(|message| message.content.trim().is_empty())
        {
            return Err(RelayError::Validation(
                "message content must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Token accounting reported by a backend, or estimated locally.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    /// Rough completion estimate of one token per four characters.
    pub fn estimate(text: &str) -> Self {
        let completion_tokens = (text.chars().count() as u64).div_ceil(4);
        Self {
            prompt_tokens: 0,
            completion_tokens,
            total_tokens: completion_tokens,
        }
    }
}

/// Complete answer returned by the blocking path.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ChatResponse {
    pub text: String,
    pub tool_events: Vec<ToolEvent>,
    pub usage: Option<Usage>,
}

impl ChatResponse {
    /// Single-shot chunk sequence equivalent to this answer:
    /// text first, then tool events, then `Terminal`.
    pub fn into_chunks(self) -> Vec<StreamChunk> {
        let mut chunks = Vec::with_capacity(self.tool_events.len() + 2);
        if !self.text.is_empty() {
            chunks.push(StreamChunk::TextDelta(self.text));
        }
        chunks.extend(self.tool_events.into_iter().map(StreamChunk::ToolEvent));
        chunks.push(StreamChunk::Terminal);
        chunks
    }
}
