//! Order-independent merge of confirmed messages with one local placeholder.
//!
//! Every mutation ends by re-checking whether a confirmed message now stands
//! for the placeholder, so the result does not depend on whether the
//! confirmed row or the local completion arrives first.
use std::collections::HashSet;

use relay_stream::{Backend, Role, SessionContent, SessionFailure, SessionStatus};

use crate::message::{ConversationId, GenerationTag, Message, MessageId};
use crate::store::ChangeEvent;

/// Where a placeholder renders and which confirmed row will replace it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaceholderTarget {
    /// A new assistant reply to the user message `after`.
    Reply { after: MessageId },
    /// A regeneration of `message`, which had `base_revisions` revision
    /// markers when the rerun began.
    Rerun {
        message: MessageId,
        base_revisions: usize,
    },
}

/// Local, not yet confirmed rendering of a session.
#[derive(Clone, Debug, PartialEq)]
pub struct Placeholder {
    pub tag: GenerationTag,
    pub target: PlaceholderTarget,
    pub backend: Backend,
    pub content: SessionContent,
    pub status: SessionStatus,
    pub failure: Option<SessionFailure>,
    /// Id returned by the persistence write, once known.
    pub persisted_as: Option<MessageId>,
}

/// One rendered row.
#[derive(Clone, Debug, PartialEq)]
pub enum ViewItem {
    Confirmed(Message),
    Pending(Placeholder),
}

impl ViewItem {
    pub fn text(&self) -> &str {
        match self {
            Self::Confirmed(message) => &message.content,
            Self::Pending(placeholder) => &placeholder.content.text,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReconciledView {
    conversation_id: ConversationId,
    confirmed: Vec<Message>,
    deleted: HashSet<MessageId>,
    placeholder: Option<Placeholder>,
}

impl ReconciledView {
    pub fn new(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            confirmed: Vec::new(),
            deleted: HashSet::new(),
            placeholder: None,
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn confirmed(&self) -> &[Message] {
        &self.confirmed
    }

    pub fn placeholder(&self) -> Option<&Placeholder> {
        self.placeholder.as_ref()
    }

    pub fn message(&self, id: MessageId) -> Option<&Message> {
        self.confirmed.iter().find(|m| m.id == id)
    }

    /// Replaces the confirmed sequence with a full listing from the store.
    pub fn load(&mut self, messages: Vec<Message>) -> bool {
        let messages: Vec<Message> = messages
            .into_iter()
            .filter(|m| m.conversation_id == self.conversation_id)
            .collect();
        // Feed events are ordered, so a tombstone whose row is already gone
        // from a fresh listing has nothing left to suppress.
        self.deleted
            .retain(|id| messages.iter().any(|m| m.id == *id));
        let mut confirmed: Vec<Message> = messages
            .into_iter()
            .filter(|m| !self.deleted.contains(&m.id))
            .collect();
        confirmed.sort_by_key(Message::order_key);
        let changed = confirmed != self.confirmed;
        self.confirmed = confirmed;
        self.settle() || changed
    }

    /// Adds a confirmed message. Known and deleted ids are ignored.
    pub fn insert(&mut self, message: Message) -> bool {
        if !self.accepts(&message) || self.position(message.id).is_some() {
            return false;
        }
        self.insert_sorted(message);
        self.settle();
        true
    }

    /// Replaces a confirmed message in place, inserting it when unknown.
    pub fn update(&mut self, message: Message) -> bool {
        if !self.accepts(&message) {
            return false;
        }
        let changed = match self.position(message.id) {
            Some(idx) if self.confirmed[idx] == message => false,
            Some(idx) => {
                self.confirmed[idx] = message;
                true
            }
            None => {
                self.insert_sorted(message);
                true
            }
        };
        self.settle() || changed
    }

    /// Removes a message and remembers it so late inserts cannot bring it back.
    pub fn delete(&mut self, id: MessageId) -> bool {
        let newly_deleted = self.deleted.insert(id);
        let removed = match self.position(id) {
            Some(idx) => {
                self.confirmed.remove(idx);
                true
            }
            None => false,
        };
        let orphaned = matches!(
            &self.placeholder,
            Some(Placeholder { target: PlaceholderTarget::Rerun { message, .. }, .. }) if *message == id
        );
        if orphaned {
            self.placeholder = None;
        }
        self.settle() || removed || orphaned || newly_deleted
    }

    /// Applies a change-feed event.
    pub fn apply(&mut self, event: &ChangeEvent) -> bool {
        if event.conversation_id() != self.conversation_id {
            return false;
        }
        match event {
            ChangeEvent::Inserted(message) => self.insert(message.clone()),
            ChangeEvent::Updated(message) => self.update(message.clone()),
            ChangeEvent::Deleted { id, .. } => self.delete(*id),
        }
    }

    /// Starts tracking a new placeholder, replacing any previous one.
    pub fn begin_placeholder(
        &mut self,
        tag: GenerationTag,
        target: PlaceholderTarget,
        backend: Backend,
    ) -> bool {
        self.placeholder = Some(Placeholder {
            tag,
            target,
            backend,
            content: SessionContent::default(),
            status: SessionStatus::Active,
            failure: None,
            persisted_as: None,
        });
        self.settle();
        true
    }

    /// Replaces the placeholder content with a newer cumulative snapshot.
    pub fn update_placeholder(&mut self, tag: &GenerationTag, content: SessionContent) -> bool {
        match self.placeholder_mut(tag) {
            Some(placeholder) if placeholder.status == SessionStatus::Active => {
                placeholder.content = content;
                true
            }
            _ => false,
        }
    }

    /// Records the terminal state of the placeholder's session.
    pub fn finish_placeholder(
        &mut self,
        tag: &GenerationTag,
        status: SessionStatus,
        content: SessionContent,
        failure: Option<SessionFailure>,
    ) -> bool {
        let Some(placeholder) = self.placeholder_mut(tag) else {
            return false;
        };
        placeholder.status = status;
        placeholder.content = content;
        placeholder.failure = failure;
        self.settle();
        true
    }

    /// Records the id the persistence write returned.
    pub fn mark_persisted(&mut self, tag: &GenerationTag, id: MessageId) -> bool {
        let Some(placeholder) = self.placeholder_mut(tag) else {
            return false;
        };
        placeholder.persisted_as = Some(id);
        self.settle();
        true
    }

    /// Attaches a failure to a terminal placeholder that could not be persisted.
    pub fn fail_placeholder(&mut self, tag: &GenerationTag, failure: SessionFailure) -> bool {
        let Some(placeholder) = self.placeholder_mut(tag) else {
            return false;
        };
        placeholder.status = SessionStatus::Failed;
        placeholder.failure = Some(failure);
        true
    }

    /// Drops the placeholder if it belongs to `tag`.
    pub fn clear_placeholder(&mut self, tag: &GenerationTag) -> bool {
        if self.placeholder_mut(tag).is_none() {
            return false;
        }
        self.placeholder = None;
        true
    }

    /// Drops a failed placeholder.
    pub fn dismiss_failed(&mut self) -> bool {
        if self
            .placeholder
            .as_ref()
            .is_some_and(|p| p.status == SessionStatus::Failed)
        {
            self.placeholder = None;
            return true;
        }
        false
    }

    /// Rows in display order.
    ///
    /// A reply placeholder follows its trigger (or trails the list when the
    /// trigger is not loaded); a rerun placeholder takes its target's slot.
    pub fn items(&self) -> Vec<ViewItem> {
        let mut items = Vec::with_capacity(self.confirmed.len() + 1);
        let mut pending = self.placeholder.clone();
        for message in &self.confirmed {
            match pending.as_ref().map(|p| p.target) {
                Some(PlaceholderTarget::Rerun { message: target, .. }) if target == message.id => {
                    if let Some(placeholder) = pending.take() {
                        items.push(ViewItem::Pending(placeholder));
                    }
                    continue;
                }
                Some(PlaceholderTarget::Reply { after }) if after == message.id => {
                    items.push(ViewItem::Confirmed(message.clone()));
                    if let Some(placeholder) = pending.take() {
                        items.push(ViewItem::Pending(placeholder));
                    }
                    continue;
                }
                _ => {}
            }
            items.push(ViewItem::Confirmed(message.clone()));
        }
        if let Some(placeholder) = pending {
            items.push(ViewItem::Pending(placeholder));
        }
        items
    }

    fn accepts(&self, message: &Message) -> bool {
        message.conversation_id == self.conversation_id && !self.deleted.contains(&message.id)
    }

    fn position(&self, id: MessageId) -> Option<usize> {
        self.confirmed.iter().position(|m| m.id == id)
    }

    fn insert_sorted(&mut self, message: Message) {
        let key = message.order_key();
        let idx = self.confirmed.partition_point(|m| m.order_key() <= key);
        self.confirmed.insert(idx, message);
    }

    fn placeholder_mut(&mut self, tag: &GenerationTag) -> Option<&mut Placeholder> {
        self.placeholder.as_mut().filter(|p| p.tag == *tag)
    }

    /// Removes the placeholder once a confirmed message stands for it.
    fn settle(&mut self) -> bool {
        let confirmed = match &self.placeholder {
            Some(placeholder) => self
                .confirmed
                .iter()
                .enumerate()
                .any(|(idx, message)| self.confirms(placeholder, idx, message)),
            None => false,
        };
        if confirmed {
            self.placeholder = None;
        }
        confirmed
    }

    fn confirms(&self, placeholder: &Placeholder, idx: usize, message: &Message) -> bool {
        if message.metadata.generation.as_ref() == Some(&placeholder.tag) {
            return true;
        }
        match &placeholder.target {
            PlaceholderTarget::Reply { after } => {
                if message.role != Role::Assistant {
                    return false;
                }
                if placeholder.persisted_as == Some(message.id) {
                    return true;
                }
                // Untagged rows from other writers: the assistant message
                // right after the trigger, once the session is over.
                placeholder.status.is_terminal()
                    && message.metadata.generation.is_none()
                    && idx > 0
                    && self.confirmed[idx - 1].id == *after
            }
            PlaceholderTarget::Rerun {
                message: target,
                base_revisions,
            } => {
                // A tagged row belongs to some other generation. Untagged
                // rows confirm once they carry a newer revision.
                message.id == *target
                    && message.metadata.generation.is_none()
                    && message.metadata.revisions.len() > *base_revisions
            }
        }
    }
}
