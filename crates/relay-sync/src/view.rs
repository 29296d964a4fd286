//! Live view of one conversation.
//!
//! `ConversationView` loads the confirmed messages, follows the change feed,
//! and drives generations through a [`SessionManager`]. Everything it shows is
//! published as `Vec<ViewItem>` snapshots on a `watch` channel.
use std::sync::{Arc, Mutex, PoisonError};

use relay_stream::{
    AbortHandle, Backend, ChatMessage, ChatRequest, ErrorKind, ReasoningEffort, Role,
    SessionContent, SessionEvent, SessionFailure, SessionHandle, SessionId, SessionManager,
    SessionOutcome, SessionStatus, Usage,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::errors::SyncError;
use crate::message::{
    ConversationId, GenerationTag, MessageId, MessageMetadata, Revision, RevisionKind,
    history_until,
};
use crate::reconcile::{PlaceholderTarget, ReconciledView, ViewItem};
use crate::store::{ChangeFeed, FeedItem, FeedSubscription, MessageStore};

/// Per-generation request settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenerateOptions {
    pub backend: Backend,
    pub reasoning_effort: Option<ReasoningEffort>,
    pub requester_id: Option<String>,
    pub streaming: bool,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            backend: Backend::Mojo,
            reasoning_effort: None,
            requester_id: None,
            streaming: true,
        }
    }
}

impl GenerateOptions {
    pub fn backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn reasoning_effort(mut self, effort: ReasoningEffort) -> Self {
        self.reasoning_effort = Some(effort);
        self
    }

    pub fn requester_id(mut self, requester_id: impl Into<String>) -> Self {
        self.requester_id = Some(requester_id.into());
        self
    }

    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    fn request(&self, history: Vec<ChatMessage>) -> ChatRequest {
        let mut request = ChatRequest::new(self.backend)
            .messages(history)
            .streaming(self.streaming);
        if let Some(effort) = self.reasoning_effort {
            request = request.reasoning_effort(effort);
        }
        if let Some(requester_id) = &self.requester_id {
            request = request.requester_id(requester_id.clone());
        }
        request
    }
}

/// What gets recorded next to generated content.
#[derive(Clone, Copy, Debug)]
struct Provenance {
    backend: Backend,
    reasoning_effort: Option<ReasoningEffort>,
}

struct ViewShared<S> {
    conversation_id: ConversationId,
    store: Arc<S>,
    state: Mutex<ReconciledView>,
    snapshots: watch::Sender<Vec<ViewItem>>,
}

impl<S: MessageStore + ChangeFeed> ViewShared<S> {
    fn read<R>(&self, f: impl FnOnce(&ReconciledView) -> R) -> R {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&state)
    }

    /// Applies `f` and publishes a snapshot when it reports a change.
    fn mutate(&self, f: impl FnOnce(&mut ReconciledView) -> bool) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let changed = f(&mut state);
        if changed {
            self.snapshots.send_replace(state.items());
        }
        changed
    }

    async fn reload(&self) -> Result<(), SyncError> {
        let messages = self.store.list(self.conversation_id).await?;
        self.mutate(|view| view.load(messages));
        Ok(())
    }

    async fn conclude(
        &self,
        tag: &GenerationTag,
        target: PlaceholderTarget,
        provenance: Provenance,
        outcome: SessionOutcome,
    ) {
        let SessionOutcome {
            status,
            content,
            failure,
            ..
        } = outcome;
        self.mutate(|view| view.finish_placeholder(tag, status, content.clone(), failure.clone()));

        if status == SessionStatus::Failed {
            if let Some(failure) = &failure {
                warn!(conversation = %self.conversation_id, session = %tag.session, kind = %failure.kind, "generation failed");
            }
            return;
        }
        if content.is_empty() {
            debug!(conversation = %self.conversation_id, session = %tag.session, "generation ended without content");
            self.mutate(|view| view.clear_placeholder(tag));
            return;
        }

        let persisted = match target {
            PlaceholderTarget::Reply { .. } => {
                self.persist_reply(tag, provenance, status, &content).await
            }
            PlaceholderTarget::Rerun { message, .. } => {
                self.persist_rerun(tag, message, provenance, status, &content)
                    .await
            }
        };
        if let Err(err) = persisted {
            error!(conversation = %self.conversation_id, session = %tag.session, error = %err, "failed to persist generation");
            self.mutate(|view| {
                view.fail_placeholder(
                    tag,
                    SessionFailure::new(ErrorKind::Protocol, format!("persistence failed: {err}")),
                )
            });
        }
    }

    async fn persist_reply(
        &self,
        tag: &GenerationTag,
        provenance: Provenance,
        status: SessionStatus,
        content: &SessionContent,
    ) -> Result<(), SyncError> {
        let metadata = generated_metadata(MessageMetadata::default(), tag, provenance, status, content);
        let message = self
            .store
            .append(
                self.conversation_id,
                Role::Assistant,
                content.text.clone(),
                metadata,
            )
            .await?;
        info!(conversation = %self.conversation_id, message = %message.id, status = %status, "reply persisted");
        self.mutate(|view| {
            let marked = view.mark_persisted(tag, message.id);
            view.insert(message) || marked
        });
        Ok(())
    }

    async fn persist_rerun(
        &self,
        tag: &GenerationTag,
        id: MessageId,
        provenance: Provenance,
        status: SessionStatus,
        content: &SessionContent,
    ) -> Result<(), SyncError> {
        let current = self
            .read(|view| view.message(id).cloned())
            .ok_or(SyncError::NotInView(id))?;
        let mut metadata = generated_metadata(current.metadata, tag, provenance, status, content);
        metadata.revisions.push(Revision::now(RevisionKind::Rerun));
        let message = self
            .store
            .update(id, content.text.clone(), metadata)
            .await?;
        info!(conversation = %self.conversation_id, message = %message.id, status = %status, "rerun persisted");
        self.mutate(|view| view.update(message));
        Ok(())
    }
}

fn generated_metadata(
    base: MessageMetadata,
    tag: &GenerationTag,
    provenance: Provenance,
    status: SessionStatus,
    content: &SessionContent,
) -> MessageMetadata {
    MessageMetadata {
        backend: Some(provenance.backend),
        tokens: Some(Usage::estimate(&content.text).completion_tokens),
        reasoning_effort: provenance.reasoning_effort,
        tool_events: content.tool_events.clone(),
        usage: None,
        generation: Some(tag.clone()),
        status: Some(status),
        ..base
    }
}

async fn follow_feed<S>(shared: Arc<ViewShared<S>>, mut subscription: FeedSubscription)
where
    S: MessageStore + ChangeFeed,
{
    loop {
        match subscription.recv().await {
            FeedItem::Event(event) => {
                let changed = shared.mutate(|view| view.apply(&event));
                debug!(conversation = %shared.conversation_id, changed, "applied change event");
            }
            FeedItem::Lagged(missed) => {
                warn!(conversation = %shared.conversation_id, missed, "change feed lagged, reloading");
                if let Err(err) = shared.reload().await {
                    error!(conversation = %shared.conversation_id, error = %err, "reload after lag failed");
                }
            }
            FeedItem::Closed => {
                debug!(conversation = %shared.conversation_id, "change feed closed");
                break;
            }
        }
    }
}

async fn drive<S>(
    shared: Arc<ViewShared<S>>,
    mut handle: SessionHandle,
    tag: GenerationTag,
    target: PlaceholderTarget,
    provenance: Provenance,
) where
    S: MessageStore + ChangeFeed,
{
    while let Some(event) = handle.next_event().await {
        match event {
            SessionEvent::Started { .. } => {}
            SessionEvent::Progress { content, .. } => {
                shared.mutate(|view| view.update_placeholder(&tag, content));
            }
            SessionEvent::Finished(outcome) => {
                shared.conclude(&tag, target, provenance, outcome).await;
                break;
            }
        }
    }
}

/// Validates a rerun of `id` and captures its target and history.
fn rerun_plan(
    view: &ReconciledView,
    id: MessageId,
) -> Result<(PlaceholderTarget, Vec<ChatMessage>), SyncError> {
    let confirmed = view.confirmed();
    let idx = confirmed
        .iter()
        .position(|m| m.id == id)
        .ok_or(SyncError::NotInView(id))?;
    let message = &confirmed[idx];
    if message.role != Role::Assistant {
        return Err(SyncError::Validation(
            "only assistant messages can be rerun".into(),
        ));
    }
    let trigger = confirmed[..idx]
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .ok_or_else(|| SyncError::Validation("no user message precedes this reply".into()))?;
    let target = PlaceholderTarget::Rerun {
        message: id,
        base_revisions: message.metadata.revisions.len(),
    };
    Ok((target, history_until(confirmed, trigger.id)))
}

struct Generation {
    tag: GenerationTag,
    target: PlaceholderTarget,
    abort: AbortHandle,
    driver: JoinHandle<()>,
}

/// A conversation kept in sync with its store while generating replies.
///
/// Dropping the view releases its feed subscription. A running generation is
/// not cancelled by the drop; it still persists its content.
pub struct ConversationView<S: MessageStore + ChangeFeed + 'static> {
    shared: Arc<ViewShared<S>>,
    sessions: SessionManager,
    feed_task: Option<JoinHandle<()>>,
    generation: Option<Generation>,
}

impl<S: MessageStore + ChangeFeed + 'static> ConversationView<S> {
    /// Subscribes to the feed, then loads the conversation.
    ///
    /// Subscribing first means no mutation between the listing and the
    /// subscription is missed.
    pub async fn open(
        conversation_id: ConversationId,
        store: Arc<S>,
        sessions: SessionManager,
    ) -> Result<Self, SyncError> {
        let subscription = store.subscribe(conversation_id)?;
        let messages = store.list(conversation_id).await?;
        let mut state = ReconciledView::new(conversation_id);
        state.load(messages);
        let (snapshots, _) = watch::channel(state.items());
        let shared = Arc::new(ViewShared {
            conversation_id,
            store,
            state: Mutex::new(state),
            snapshots,
        });
        let feed_task = tokio::spawn(follow_feed(shared.clone(), subscription));
        info!(conversation = %conversation_id, "conversation view opened");
        Ok(Self {
            shared,
            sessions,
            feed_task: Some(feed_task),
            generation: None,
        })
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.shared.conversation_id
    }

    /// Current rows in display order.
    pub fn items(&self) -> Vec<ViewItem> {
        self.shared.snapshots.borrow().clone()
    }

    /// Receives a fresh snapshot after every change.
    pub fn watch(&self) -> watch::Receiver<Vec<ViewItem>> {
        self.shared.snapshots.subscribe()
    }

    /// Tag of the generation started last, while it is being driven.
    pub fn generation(&self) -> Option<&GenerationTag> {
        self.generation
            .as_ref()
            .filter(|g| !g.driver.is_finished())
            .map(|g| &g.tag)
    }

    /// Persists a user message and starts generating the reply to it.
    ///
    /// A generation still running in this view is stopped first.
    pub async fn send(
        &mut self,
        text: impl Into<String>,
        options: GenerateOptions,
    ) -> Result<MessageId, SyncError> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(SyncError::Validation("message content must not be empty".into()));
        }
        if !self.sessions.gateway().is_routed(options.backend) {
            return Err(relay_stream::RelayError::NotRouted {
                backend: options.backend,
            }
            .into());
        }
        self.stop().await;

        let message = self
            .shared
            .store
            .append(
                self.shared.conversation_id,
                Role::User,
                text,
                MessageMetadata::default(),
            )
            .await?;
        let id = message.id;
        self.shared.mutate(|view| view.insert(message));
        let history = self.shared.read(|view| history_until(view.confirmed(), id));
        self.generate(
            SessionId::new(format!("reply:{id}")),
            PlaceholderTarget::Reply { after: id },
            history,
            options,
        )
        .await?;
        Ok(id)
    }

    /// Regenerates an assistant message from the history up to the user
    /// message before it.
    pub async fn rerun(&mut self, id: MessageId, options: GenerateOptions) -> Result<(), SyncError> {
        self.shared.read(|view| rerun_plan(view, id))?;
        // A stopped generation may still write a revision to the target.
        self.stop().await;
        let (target, history) = self.shared.read(|view| rerun_plan(view, id))?;
        self.generate(SessionId::new(format!("message:{id}")), target, history, options)
            .await
    }

    /// Replaces the text of a user message.
    pub async fn edit(&self, id: MessageId, content: impl Into<String>) -> Result<(), SyncError> {
        let content = content.into();
        if content.trim().is_empty() {
            return Err(SyncError::Validation("message content must not be empty".into()));
        }
        let current = self
            .shared
            .read(|view| view.message(id).cloned())
            .ok_or(SyncError::NotInView(id))?;
        if current.role != Role::User {
            return Err(SyncError::Validation("only user messages can be edited".into()));
        }
        let mut metadata = current.metadata;
        metadata.revisions.push(Revision::now(RevisionKind::Edit));
        let message = self.shared.store.update(id, content, metadata).await?;
        self.shared.mutate(|view| view.update(message));
        Ok(())
    }

    /// Deletes a message. A rerun of that message is stopped first.
    pub async fn delete(&mut self, id: MessageId) -> Result<(), SyncError> {
        if self.shared.read(|view| view.message(id).is_none()) {
            return Err(SyncError::NotInView(id));
        }
        let rerunning = self.generation.as_ref().is_some_and(|g| {
            matches!(g.target, PlaceholderTarget::Rerun { message, .. } if message == id)
        });
        if rerunning {
            self.stop().await;
        }
        self.shared.store.delete(id).await?;
        self.shared.mutate(|view| view.delete(id));
        Ok(())
    }

    /// Cancels the running generation and waits until its partial content is
    /// persisted. Returns whether a generation was still running.
    pub async fn stop(&mut self) -> bool {
        let Some(generation) = self.generation.take() else {
            return false;
        };
        let running = !generation.driver.is_finished();
        generation.abort.abort();
        if let Err(err) = generation.driver.await {
            error!(conversation = %self.shared.conversation_id, error = %err, "generation driver failed");
        }
        running
    }

    /// Waits for the running generation to finish and settle.
    pub async fn wait_generation(&mut self) {
        if let Some(generation) = self.generation.take() {
            if let Err(err) = generation.driver.await {
                error!(conversation = %self.shared.conversation_id, error = %err, "generation driver failed");
            }
        }
    }

    /// Removes a failed placeholder.
    pub fn dismiss_failed(&self) -> bool {
        self.shared.mutate(|view| view.dismiss_failed())
    }

    /// Releases the current feed subscription, subscribes again and reloads.
    pub async fn resubscribe(&mut self) -> Result<(), SyncError> {
        self.release_feed().await;
        let subscription = self.shared.store.subscribe(self.shared.conversation_id)?;
        self.shared.reload().await?;
        self.feed_task = Some(tokio::spawn(follow_feed(self.shared.clone(), subscription)));
        debug!(conversation = %self.shared.conversation_id, "change feed resubscribed");
        Ok(())
    }

    /// Releases the feed subscription before returning.
    pub async fn close(mut self) {
        self.release_feed().await;
        info!(conversation = %self.shared.conversation_id, "conversation view closed");
    }

    async fn release_feed(&mut self) {
        if let Some(task) = self.feed_task.take() {
            task.abort();
            // The subscription is dropped together with the task.
            let _ = task.await;
        }
    }

    async fn generate(
        &mut self,
        session: SessionId,
        target: PlaceholderTarget,
        history: Vec<ChatMessage>,
        options: GenerateOptions,
    ) -> Result<(), SyncError> {
        self.stop().await;
        let request = options.request(history);
        let provenance = Provenance {
            backend: options.backend,
            reasoning_effort: request.effective_reasoning_effort(),
        };
        let handle = self.sessions.start(session.clone(), request).await?;
        let tag = GenerationTag::new(session, handle.attempt());
        let abort = handle.abort_handle();
        self.shared
            .mutate(|view| view.begin_placeholder(tag.clone(), target, options.backend));
        info!(conversation = %self.shared.conversation_id, session = %tag.session, attempt = tag.attempt, "generation started");
        let driver = tokio::spawn(drive(
            self.shared.clone(),
            handle,
            tag.clone(),
            target,
            provenance,
        ));
        self.generation = Some(Generation {
            tag,
            target,
            abort,
            driver,
        });
        Ok(())
    }
}

impl<S: MessageStore + ChangeFeed + 'static> Drop for ConversationView<S> {
    fn drop(&mut self) {
        if let Some(task) = self.feed_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::time::Duration;

    use futures::StreamExt as _;
    use futures::channel::mpsc;
    use relay_stream::{
        BackendAdapter, ChatResponse, ChunkStream, Gateway, GatewayError, SessionConfig,
        StreamChunk,
    };

    use super::*;
    use crate::memory::MemoryStore;
    use crate::message::Message;

    type Item = Result<StreamChunk, GatewayError>;

    enum Reply {
        Items(Vec<Item>),
        Channel(mpsc::UnboundedReceiver<Item>),
    }

    #[derive(Default)]
    struct FakeBackend {
        replies: Mutex<VecDeque<Reply>>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl FakeBackend {
        fn push(&self, reply: Reply) {
            self.replies.lock().expect("replies").push_back(reply);
        }

        fn requests(&self) -> Vec<ChatRequest> {
            self.requests.lock().expect("requests").clone()
        }
    }

    #[async_trait::async_trait]
    impl BackendAdapter for FakeBackend {
        fn id(&self) -> &'static str {
            "fake"
        }

        async fn open_stream(&self, req: &ChatRequest) -> Result<ChunkStream, GatewayError> {
            self.requests.lock().expect("requests").push(req.clone());
            match self.replies.lock().expect("replies").pop_front() {
                Some(Reply::Items(items)) => Ok(futures::stream::iter(items).boxed()),
                Some(Reply::Channel(rx)) => Ok(rx.boxed()),
                None => Ok(futures::stream::pending().boxed()),
            }
        }

        async fn complete(&self, req: &ChatRequest) -> Result<ChatResponse, GatewayError> {
            Err(GatewayError::protocol(req.backend, "fake backend only streams"))
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        backend: Arc<FakeBackend>,
        sessions: SessionManager,
        conversation: ConversationId,
    }

    impl Harness {
        fn new(store: MemoryStore) -> Self {
            let backend = Arc::new(FakeBackend::default());
            let gateway = Gateway::builder()
                .route(Backend::Mojo, backend.clone())
                .route(Backend::MojoPlus, backend.clone())
                .build()
                .expect("gateway");
            let sessions = SessionManager::new(gateway, SessionConfig::default()).expect("manager");
            Self {
                store: Arc::new(store),
                backend,
                sessions,
                conversation: ConversationId::new(),
            }
        }

        async fn open(&self) -> ConversationView<MemoryStore> {
            ConversationView::open(self.conversation, self.store.clone(), self.sessions.clone())
                .await
                .expect("open view")
        }

        async fn seed(&self, role: Role, content: &str) -> Message {
            self.store
                .append(self.conversation, role, content.into(), MessageMetadata::default())
                .await
                .expect("seed")
        }
    }

    fn delta(text: &str) -> Item {
        Ok(StreamChunk::TextDelta(text.into()))
    }

    fn texts(items: &[ViewItem]) -> Vec<(bool, String)> {
        items
            .iter()
            .map(|item| (item.is_pending(), item.text().to_string()))
            .collect()
    }

    fn confirmed(item: &ViewItem) -> &Message {
        match item {
            ViewItem::Confirmed(message) => message,
            ViewItem::Pending(placeholder) => panic!("still pending: {placeholder:?}"),
        }
    }

    async fn wait_until(view: &ConversationView<MemoryStore>, check: impl Fn(&[ViewItem]) -> bool) {
        let mut rx = view.watch();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|items| check(items)))
            .await
            .expect("view did not converge")
            .map(|_| ())
            .expect("view closed");
    }

    #[tokio::test]
    async fn send_persists_the_reply_and_replaces_the_placeholder() {
        let h = Harness::new(MemoryStore::new());
        h.backend.push(Reply::Items(vec![
            delta("Hel"),
            delta("lo"),
            Ok(StreamChunk::Terminal),
        ]));
        let mut view = h.open().await;

        let user = view.send("hi", GenerateOptions::default()).await.expect("send");
        view.wait_generation().await;

        let items = view.items();
        assert_eq!(texts(&items), vec![(false, "hi".into()), (false, "Hello".into())]);
        let reply = confirmed(&items[1]);
        assert_eq!(reply.role, Role::Assistant);
        assert_eq!(reply.metadata.backend, Some(Backend::Mojo));
        assert_eq!(reply.metadata.tokens, Some(2));
        assert_eq!(reply.metadata.status, Some(SessionStatus::Completed));
        assert_eq!(
            reply.metadata.generation.as_ref().map(|t| t.session.as_str().to_string()),
            Some(format!("reply:{user}"))
        );

        let stored = h.store.list(h.conversation).await.expect("list");
        assert_eq!(stored.len(), 2);
        assert_eq!(h.backend.requests()[0].prior_messages, vec![ChatMessage::new(Role::User, "hi")]);
    }

    #[tokio::test]
    async fn stop_persists_partial_content_as_cancelled() {
        let h = Harness::new(MemoryStore::new());
        let (tx, rx) = mpsc::unbounded();
        h.backend.push(Reply::Channel(rx));
        let mut view = h.open().await;

        view.send("tell me a story", GenerateOptions::default())
            .await
            .expect("send");
        tx.unbounded_send(delta("Once")).expect("feed chunk");
        wait_until(&view, |items| {
            items.iter().any(|item| item.is_pending() && item.text() == "Once")
        })
        .await;

        assert!(view.stop().await);
        let items = view.items();
        assert_eq!(items.len(), 2);
        let reply = confirmed(&items[1]);
        assert_eq!(reply.content, "Once");
        assert_eq!(reply.metadata.status, Some(SessionStatus::Cancelled));
        assert!(!view.stop().await);
    }

    #[tokio::test]
    async fn failed_generation_stays_visible_until_dismissed() {
        let h = Harness::new(MemoryStore::new());
        h.backend.push(Reply::Items(vec![
            delta("partial"),
            Err(GatewayError::backend(
                Backend::Mojo,
                ErrorKind::RateLimited,
                "slow down",
                Some(429),
            )),
        ]));
        let mut view = h.open().await;

        view.send("hi", GenerateOptions::default()).await.expect("send");
        view.wait_generation().await;

        let items = view.items();
        match &items[1] {
            ViewItem::Pending(placeholder) => {
                assert_eq!(placeholder.status, SessionStatus::Failed);
                assert_eq!(placeholder.content.text, "partial");
                assert_eq!(
                    placeholder.failure.as_ref().map(|f| f.kind),
                    Some(ErrorKind::RateLimited)
                );
            }
            other => panic!("expected a failed placeholder, got {other:?}"),
        }
        assert_eq!(h.store.list(h.conversation).await.expect("list").len(), 1);

        assert!(view.dismiss_failed());
        assert_eq!(texts(&view.items()), vec![(false, "hi".into())]);
    }

    #[tokio::test]
    async fn rerun_rewrites_the_reply_in_place() {
        let h = Harness::new(MemoryStore::new());
        h.seed(Role::User, "question").await;
        let answer = h.seed(Role::Assistant, "old answer").await;
        h.seed(Role::User, "thanks").await;
        h.backend.push(Reply::Items(vec![delta("new answer"), Ok(StreamChunk::Terminal)]));
        let mut view = h.open().await;

        view.rerun(answer.id, GenerateOptions::default().backend(Backend::MojoPlus))
            .await
            .expect("rerun");
        view.wait_generation().await;

        let items = view.items();
        assert_eq!(
            texts(&items),
            vec![
                (false, "question".into()),
                (false, "new answer".into()),
                (false, "thanks".into()),
            ]
        );
        let rerun = confirmed(&items[1]);
        assert_eq!(rerun.id, answer.id);
        assert!(rerun.metadata.is_rerun());
        assert_eq!(rerun.metadata.backend, Some(Backend::MojoPlus));
        assert_eq!(
            h.backend.requests()[0].prior_messages,
            vec![ChatMessage::new(Role::User, "question")]
        );
    }

    async fn rerun_over_a_running_rerun(
        h: &Harness,
        view: &mut ConversationView<MemoryStore>,
        answer: MessageId,
    ) -> mpsc::UnboundedSender<Item> {
        let (first_tx, first_rx) = mpsc::unbounded();
        let (second_tx, second_rx) = mpsc::unbounded();
        h.backend.push(Reply::Channel(first_rx));
        h.backend.push(Reply::Channel(second_rx));

        view.rerun(answer, GenerateOptions::default()).await.expect("first rerun");
        first_tx.unbounded_send(delta("first")).expect("feed chunk");
        wait_until(view, |items| {
            items.iter().any(|item| item.is_pending() && item.text() == "first")
        })
        .await;

        view.rerun(answer, GenerateOptions::default()).await.expect("second rerun");
        let items = view.items();
        assert_eq!(items.len(), 2);
        assert!(items[1].is_pending(), "new rerun lost its placeholder: {items:?}");
        let stored = h.store.list(h.conversation).await.expect("list");
        assert_eq!(stored[1].content, "first");
        assert_eq!(stored[1].metadata.status, Some(SessionStatus::Cancelled));
        second_tx
    }

    #[tokio::test]
    async fn failed_rerun_after_a_stopped_rerun_stays_visible() {
        let h = Harness::new(MemoryStore::new());
        h.seed(Role::User, "question").await;
        let answer = h.seed(Role::Assistant, "old answer").await;
        let mut view = h.open().await;

        let tx = rerun_over_a_running_rerun(&h, &mut view, answer.id).await;
        tx.unbounded_send(delta("second")).expect("feed chunk");
        tx.unbounded_send(Err(GatewayError::backend(
            Backend::Mojo,
            ErrorKind::RateLimited,
            "slow down",
            Some(429),
        )))
        .expect("feed error");
        view.wait_generation().await;

        let items = view.items();
        match &items[1] {
            ViewItem::Pending(placeholder) => {
                assert_eq!(placeholder.status, SessionStatus::Failed);
                assert_eq!(placeholder.content.text, "second");
                assert_eq!(
                    placeholder.failure.as_ref().map(|f| f.kind),
                    Some(ErrorKind::RateLimited)
                );
            }
            other => panic!("expected a failed placeholder, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rerun_after_a_stopped_rerun_confirms_its_own_revision() {
        let h = Harness::new(MemoryStore::new());
        h.seed(Role::User, "question").await;
        let answer = h.seed(Role::Assistant, "old answer").await;
        let mut view = h.open().await;

        let tx = rerun_over_a_running_rerun(&h, &mut view, answer.id).await;
        tx.unbounded_send(delta("second")).expect("feed chunk");
        tx.unbounded_send(Ok(StreamChunk::Terminal)).expect("feed terminal");
        view.wait_generation().await;

        let items = view.items();
        assert_eq!(
            texts(&items),
            vec![(false, "question".into()), (false, "second".into())]
        );
        let rerun = confirmed(&items[1]);
        assert_eq!(rerun.id, answer.id);
        assert_eq!(rerun.metadata.revisions.len(), 2);
        assert_eq!(rerun.metadata.status, Some(SessionStatus::Completed));
    }

    #[tokio::test]
    async fn rerun_and_edit_check_the_role() {
        let h = Harness::new(MemoryStore::new());
        let question = h.seed(Role::User, "question").await;
        let answer = h.seed(Role::Assistant, "answer").await;
        let mut view = h.open().await;

        assert!(matches!(
            view.rerun(question.id, GenerateOptions::default()).await,
            Err(SyncError::Validation(_))
        ));
        assert!(matches!(
            view.edit(answer.id, "rewritten").await,
            Err(SyncError::Validation(_))
        ));
        assert!(matches!(
            view.edit(question.id, "  ").await,
            Err(SyncError::Validation(_))
        ));

        view.edit(question.id, "better question").await.expect("edit");
        let edited = confirmed(&view.items()[0]).clone();
        assert_eq!(edited.content, "better question");
        assert!(edited.metadata.is_edited());
        assert!(h.backend.requests().is_empty());
    }

    #[tokio::test]
    async fn changes_from_other_writers_reach_the_view() {
        let h = Harness::new(MemoryStore::new());
        let view = h.open().await;

        let outside = h.seed(Role::User, "from another device").await;
        wait_until(&view, |items| items.len() == 1).await;
        h.store.delete(outside.id).await.expect("delete");
        wait_until(&view, |items| items.is_empty()).await;
    }

    #[tokio::test]
    async fn lagging_feed_reloads_from_the_store() {
        let h = Harness::new(MemoryStore::with_feed_capacity(1));
        let view = h.open().await;
        for text in ["a", "b", "c"] {
            h.seed(Role::User, text).await;
        }
        wait_until(&view, |items| items.len() == 3).await;
        assert_eq!(
            texts(&view.items()),
            vec![(false, "a".into()), (false, "b".into()), (false, "c".into())]
        );
    }

    #[tokio::test]
    async fn subscriptions_are_released_on_resubscribe_and_close() {
        let h = Harness::new(MemoryStore::new());
        let mut view = h.open().await;
        assert_eq!(h.store.subscription_count(h.conversation), 1);

        view.resubscribe().await.expect("resubscribe");
        assert_eq!(h.store.subscription_count(h.conversation), 1);

        view.close().await;
        assert_eq!(h.store.subscription_count(h.conversation), 0);
    }

    #[tokio::test]
    async fn blank_sends_are_rejected() {
        let h = Harness::new(MemoryStore::new());
        let mut view = h.open().await;
        assert!(matches!(
            view.send("   ", GenerateOptions::default()).await,
            Err(SyncError::Validation(_))
        ));
        assert!(h.store.list(h.conversation).await.expect("list").is_empty());
    }
}
