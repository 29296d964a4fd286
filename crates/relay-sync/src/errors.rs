use relay_stream::RelayError;

use crate::message::MessageId;

/// Failures reported by a message store or change feed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("message not found: {0}")]
    NotFound(MessageId),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Top-level error type of the conversation view.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Relay(#[from] RelayError),
    /// The requested action does not apply to the target.
    #[error("validation error: {0}")]
    Validation(String),
    /// The message is not part of the loaded conversation.
    #[error("message not in view: {0}")]
    NotInView(MessageId),
}
