//! Common imports for typical relay usage.
pub use crate::{
    AbortHandle, Backend, ChatRequest, ChatResponse, ErrorKind, Gateway, GatewayReply,
    RelayError, SessionConfig, SessionContent, SessionEvent, SessionHandle, SessionId,
    SessionManager, SessionOutcome, SessionStatus, StreamChunk, ToolEvent, ToolKind,
};
