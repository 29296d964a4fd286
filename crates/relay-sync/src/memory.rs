use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use relay_stream::Role;
use tokio::sync::broadcast;
use tracing::debug;

use crate::errors::StoreError;
use crate::message::{ConversationId, Message, MessageId, MessageMetadata};
use crate::store::{ChangeEvent, ChangeFeed, FeedSubscription, MessageStore};

const DEFAULT_FEED_CAPACITY: usize = 256;

struct MemoryInner {
    messages: DashMap<MessageId, Message>,
    feeds: DashMap<ConversationId, broadcast::Sender<ChangeEvent>>,
    subscriptions: Arc<DashMap<u64, ConversationId>>,
    next_subscription: AtomicU64,
    last_timestamp: Mutex<DateTime<Utc>>,
    feed_capacity: usize,
    unavailable: AtomicBool,
}

/// In-process message store that announces its own mutations.
///
/// Clones share the same data.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_feed_capacity(DEFAULT_FEED_CAPACITY)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bounds how many undelivered events a subscriber may fall behind
    /// before it observes a lag.
    pub fn with_feed_capacity(feed_capacity: usize) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                messages: DashMap::new(),
                feeds: DashMap::new(),
                subscriptions: Arc::new(DashMap::new()),
                next_subscription: AtomicU64::new(1),
                last_timestamp: Mutex::new(DateTime::<Utc>::MIN_UTC),
                feed_capacity: feed_capacity.max(1),
                unavailable: AtomicBool::new(false),
            }),
        }
    }

    /// Makes every store operation fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Live subscriptions for a conversation.
    pub fn subscription_count(&self, conversation: ConversationId) -> usize {
        self.inner
            .subscriptions
            .iter()
            .filter(|entry| *entry.value() == conversation)
            .count()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".into()));
        }
        Ok(())
    }

    /// Strictly increasing creation time so insertion order is total.
    fn next_timestamp(&self) -> DateTime<Utc> {
        let mut last = self
            .inner
            .last_timestamp
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let now = Utc::now();
        let next = if now > *last {
            now
        } else {
            *last + TimeDelta::microseconds(1)
        };
        *last = next;
        next
    }

    fn publish(&self, event: ChangeEvent) {
        let conversation = event.conversation_id();
        if let Some(feed) = self.inner.feeds.get(&conversation) {
            let delivered = feed.send(event).unwrap_or(0);
            debug!(%conversation, delivered, "published change event");
        }
    }
}

#[async_trait::async_trait]
impl MessageStore for MemoryStore {
    async fn list(&self, conversation: ConversationId) -> Result<Vec<Message>, StoreError> {
        self.check_available()?;
        let mut messages: Vec<Message> = self
            .inner
            .messages
            .iter()
            .filter(|entry| entry.conversation_id == conversation)
            .map(|entry| entry.value().clone())
            .collect();
        messages.sort_by_key(Message::order_key);
        Ok(messages)
    }

    async fn append(
        &self,
        conversation: ConversationId,
        role: Role,
        content: String,
        metadata: MessageMetadata,
    ) -> Result<Message, StoreError> {
        self.check_available()?;
        let message = Message {
            id: MessageId::new(),
            conversation_id: conversation,
            role,
            content,
            metadata,
            created_at: self.next_timestamp(),
        };
        self.inner.messages.insert(message.id, message.clone());
        self.publish(ChangeEvent::Inserted(message.clone()));
        Ok(message)
    }

    async fn update(
        &self,
        id: MessageId,
        content: String,
        metadata: MessageMetadata,
    ) -> Result<Message, StoreError> {
        self.check_available()?;
        let message = {
            let mut entry = self
                .inner
                .messages
                .get_mut(&id)
                .ok_or(StoreError::NotFound(id))?;
            entry.content = content;
            entry.metadata = metadata;
            entry.value().clone()
        };
        self.publish(ChangeEvent::Updated(message.clone()));
        Ok(message)
    }

    async fn delete(&self, id: MessageId) -> Result<(), StoreError> {
        self.check_available()?;
        let (_, message) = self
            .inner
            .messages
            .remove(&id)
            .ok_or(StoreError::NotFound(id))?;
        self.publish(ChangeEvent::Deleted {
            conversation_id: message.conversation_id,
            id,
        });
        Ok(())
    }
}

impl ChangeFeed for MemoryStore {
    fn subscribe(&self, conversation: ConversationId) -> Result<FeedSubscription, StoreError> {
        self.check_available()?;
        let rx = self
            .inner
            .feeds
            .entry(conversation)
            .or_insert_with(|| broadcast::channel(self.inner.feed_capacity).0)
            .subscribe();
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.inner.subscriptions.insert(id, conversation);
        let subscriptions = self.inner.subscriptions.clone();
        debug!(%conversation, subscription = id, "feed subscribed");
        Ok(FeedSubscription::new(id, conversation, rx, move || {
            subscriptions.remove(&id);
            debug!(%conversation, subscription = id, "feed unsubscribed");
        }))
    }
}
