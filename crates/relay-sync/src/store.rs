//! Contracts for the externally owned message store and its change feed.
use relay_stream::Role;
use tokio::sync::broadcast;

use crate::errors::StoreError;
use crate::message::{ConversationId, Message, MessageId, MessageMetadata};

/// Durable message storage.
#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
    /// Messages of a conversation in `(created_at, id)` order.
    async fn list(&self, conversation: ConversationId) -> Result<Vec<Message>, StoreError>;

    /// Persists a new message and returns the stored row.
    async fn append(
        &self,
        conversation: ConversationId,
        role: Role,
        content: String,
        metadata: MessageMetadata,
    ) -> Result<Message, StoreError>;

    /// Replaces the content and metadata of an existing message.
    async fn update(
        &self,
        id: MessageId,
        content: String,
        metadata: MessageMetadata,
    ) -> Result<Message, StoreError>;

    async fn delete(&self, id: MessageId) -> Result<(), StoreError>;
}

/// A mutation announced by the change feed.
#[derive(Clone, Debug, PartialEq)]
pub enum ChangeEvent {
    Inserted(Message),
    Updated(Message),
    Deleted {
        conversation_id: ConversationId,
        id: MessageId,
    },
}

impl ChangeEvent {
    pub fn conversation_id(&self) -> ConversationId {
        match self {
            Self::Inserted(message) | Self::Updated(message) => message.conversation_id,
            Self::Deleted {
                conversation_id, ..
            } => *conversation_id,
        }
    }
}

/// What `FeedSubscription::recv` yields.
#[derive(Clone, Debug, PartialEq)]
pub enum FeedItem {
    Event(ChangeEvent),
    /// The subscriber fell behind and missed this many events; reload from
    /// the store.
    Lagged(u64),
    /// The feed is gone.
    Closed,
}

/// Push notifications for store mutations, per conversation.
pub trait ChangeFeed: Send + Sync {
    fn subscribe(&self, conversation: ConversationId) -> Result<FeedSubscription, StoreError>;

    /// Releases a subscription. Dropping it has the same effect.
    fn unsubscribe(&self, subscription: FeedSubscription) {
        drop(subscription);
    }
}

type Release = Box<dyn FnOnce() + Send + Sync>;

/// Scoped feed subscription; delivery stops when it is dropped.
pub struct FeedSubscription {
    id: u64,
    conversation_id: ConversationId,
    rx: broadcast::Receiver<ChangeEvent>,
    release: Option<Release>,
}

impl FeedSubscription {
    /// Wraps a broadcast receiver. `release` runs once, when the
    /// subscription is dropped.
    pub fn new(
        id: u64,
        conversation_id: ConversationId,
        rx: broadcast::Receiver<ChangeEvent>,
        release: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            id,
            conversation_id,
            rx,
            release: Some(Box::new(release)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    /// Waits for the next event of this conversation.
    pub async fn recv(&mut self) -> FeedItem {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.conversation_id() == self.conversation_id => {
                    return FeedItem::Event(event);
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(missed)) => return FeedItem::Lagged(missed),
                Err(broadcast::error::RecvError::Closed) => return FeedItem::Closed,
            }
        }
    }
}

impl std::fmt::Debug for FeedSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedSubscription")
            .field("id", &self.id)
            .field("conversation_id", &self.conversation_id)
            .finish()
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}
