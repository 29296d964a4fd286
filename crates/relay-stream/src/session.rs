use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::errors::{ErrorKind, RelayError, SessionFailure};
use crate::gateway::Gateway;
use crate::model::{Backend, ChatRequest};
use crate::run::{AbortHandle, SessionShared, SessionTask, run_session};
use crate::stream::{SessionEvent, SessionId, SessionOutcome, SessionStatus};

struct ActiveSession {
    attempt: u64,
    abort: AbortHandle,
    shared: Arc<SessionShared>,
    task: tokio::task::AbortHandle,
}

struct ManagerInner {
    gateway: Gateway,
    config: SessionConfig,
    active: Arc<DashMap<SessionId, ActiveSession>>,
    start_locks: DashMap<SessionId, Arc<tokio::sync::Mutex<()>>>,
    next_attempt: AtomicU64,
}

/// Registry of streaming sessions keyed by identity.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    pub fn new(gateway: Gateway, config: SessionConfig) -> Result<Self, RelayError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(ManagerInner {
                gateway,
                config,
                active: Arc::new(DashMap::new()),
                start_locks: DashMap::new(),
                next_attempt: AtomicU64::new(0),
            }),
        })
    }

    pub fn gateway(&self) -> &Gateway {
        &self.inner.gateway
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Starts a session under `id`.
    ///
    /// An existing session under the same identity is cancelled first, and
    /// its outcome is awaited (bounded by `cancel_grace`) before the new one
    /// is spawned.
    pub async fn start(
        &self,
        id: impl Into<SessionId>,
        request: ChatRequest,
    ) -> Result<SessionHandle, RelayError> {
        let id = id.into();
        request.validate()?;
        self.inner.gateway.adapter(request.backend)?;

        let lock = self
            .inner
            .start_locks
            .entry(id.clone())
            .or_default()
            .clone();
        let guard = lock.lock().await;

        let previous = self.inner.active.remove(&id).map(|(_, session)| session);
        if let Some(previous) = previous {
            self.supersede(previous).await;
        }

        let attempt = self.inner.next_attempt.fetch_add(1, Ordering::Relaxed) + 1;
        let backend = request.backend;
        let (tx, rx) = mpsc::channel(self.inner.config.update_buffer);
        let (final_tx, final_rx) = oneshot::channel();
        let (abort, signal) = AbortHandle::new();
        let (registered_tx, registered_rx) = oneshot::channel::<()>();
        let shared = Arc::new(SessionShared::new(id.clone(), attempt, final_tx));

        let task = SessionTask {
            gateway: self.inner.gateway.clone(),
            request,
            shared: shared.clone(),
            tx,
            abort: signal,
            idle_timeout: self.inner.config.idle_timeout,
        };
        let active = self.inner.active.clone();
        let cleanup_id = id.clone();
        let join = tokio::spawn(async move {
            // The registry entry must exist before the task can remove it.
            let _ = registered_rx.await;
            run_session(task).await;
            active.remove_if(&cleanup_id, |_, session| session.attempt == attempt);
        });

        self.inner.active.insert(
            id.clone(),
            ActiveSession {
                attempt,
                abort: abort.clone(),
                shared,
                task: join.abort_handle(),
            },
        );
        let _ = registered_tx.send(());
        info!(session = %id, attempt, backend = %backend, "session started");

        drop(guard);
        drop(lock);
        // Only the map's own reference left means no start is waiting on it.
        self.inner
            .start_locks
            .remove_if(&id, |_, lock| Arc::strong_count(lock) == 1);

        Ok(SessionHandle {
            id,
            attempt,
            backend,
            rx,
            final_rx: Some(final_rx),
            outcome: None,
            abort,
            drained: false,
        })
    }

    async fn supersede(&self, previous: ActiveSession) {
        debug!(session = %previous.shared.id, attempt = previous.attempt, "cancelling superseded session");
        previous.abort.abort();
        let grace = self.inner.config.cancel_grace;
        if tokio::time::timeout(grace, previous.shared.finalized())
            .await
            .is_err()
        {
            warn!(
                session = %previous.shared.id,
                attempt = previous.attempt,
                grace_ms = grace.as_millis() as u64,
                "session did not stop within grace period; forcing cancellation"
            );
            previous.task.abort();
            previous.shared.finalize(SessionStatus::Cancelled, None);
        }
    }

    /// Requests cancellation of the session under `id`.
    ///
    /// Returns `false` when no such session is active. The outcome arrives on
    /// the session handle.
    pub fn cancel(&self, id: &SessionId) -> bool {
        match self.inner.active.get(id) {
            Some(session) if !session.abort.is_aborted() && !session.shared.is_finalized() => {
                debug!(session = %id, attempt = session.attempt, "cancel requested");
                session.abort.abort();
                true
            }
            _ => false,
        }
    }

    pub fn is_active(&self, id: &SessionId) -> bool {
        self.inner
            .active
            .get(id)
            .is_some_and(|session| !session.abort.is_aborted() && !session.shared.is_finalized())
    }

    /// Number of sessions that have not produced an outcome yet.
    pub fn active_count(&self) -> usize {
        self.inner
            .active
            .iter()
            .filter(|session| !session.shared.is_finalized())
            .count()
    }

    /// Cancels every session and waits for each to finish.
    ///
    /// Returns how many sessions were still running.
    pub async fn shutdown(&self) -> usize {
        let ids: Vec<SessionId> = self
            .inner
            .active
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let mut cancelled = 0;
        for id in ids {
            if let Some((_, session)) = self.inner.active.remove(&id) {
                if !session.shared.is_finalized() {
                    cancelled += 1;
                }
                self.supersede(session).await;
            }
        }
        info!(cancelled, "session manager shut down");
        cancelled
    }
}

/// Consumer side of one session.
///
/// Use `next_event()` to follow progress and `finish()` for the outcome.
/// Dropping the handle before the outcome was observed cancels the session.
pub struct SessionHandle {
    id: SessionId,
    attempt: u64,
    backend: Backend,
    rx: mpsc::Receiver<SessionEvent>,
    final_rx: Option<oneshot::Receiver<SessionOutcome>>,
    outcome: Option<SessionOutcome>,
    abort: AbortHandle,
    drained: bool,
}

impl SessionHandle {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Returns a handle that can cancel the session.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Waits for the next event. `Finished` is always the last one; `None`
    /// follows it.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        if self.drained {
            return None;
        }
        match self.rx.recv().await {
            Some(event) => Some(event),
            None => {
                self.drained = true;
                Some(SessionEvent::Finished(self.outcome().await))
            }
        }
    }

    /// Drains remaining events and returns the outcome.
    pub async fn finish(mut self) -> SessionOutcome {
        while !self.drained {
            if self.rx.recv().await.is_none() {
                self.drained = true;
            }
        }
        self.outcome().await
    }

    async fn outcome(&mut self) -> SessionOutcome {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        let outcome = match self.final_rx.take() {
            Some(final_rx) => final_rx.await.ok(),
            None => None,
        };
        let outcome = outcome.unwrap_or_else(|| SessionOutcome {
            id: self.id.clone(),
            attempt: self.attempt,
            status: SessionStatus::Failed,
            content: Default::default(),
            failure: Some(SessionFailure::new(
                ErrorKind::Protocol,
                "session task ended without an outcome",
            )),
        });
        self.outcome = Some(outcome.clone());
        outcome
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.outcome.is_none() {
            self.abort.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::chunk::{StreamChunk, ToolEvent, ToolKind};
    use crate::errors::GatewayError;
    use crate::gateway::testing::{Script, ScriptedAdapter, gateway_with};

    fn manager(adapter: Arc<ScriptedAdapter>) -> SessionManager {
        SessionManager::new(gateway_with(adapter), SessionConfig::default()).expect("manager")
    }

    fn request() -> ChatRequest {
        ChatRequest::new(Backend::Mojo).user("Say hello")
    }

    fn delta(text: &str) -> Result<StreamChunk, GatewayError> {
        Ok(StreamChunk::TextDelta(text.into()))
    }

    async fn next_progress_text(handle: &mut SessionHandle) -> String {
        loop {
            match handle.next_event().await.expect("event") {
                SessionEvent::Progress { content, .. } => return content.text,
                SessionEvent::Started { .. } => {}
                SessionEvent::Finished(outcome) => panic!("finished early: {outcome:?}"),
            }
        }
    }

    #[tokio::test]
    async fn completed_session_publishes_cumulative_content() {
        let image = ToolEvent::new(ToolKind::ImageGeneration, serde_json::json!({"id": "ig"}));
        let adapter = ScriptedAdapter::new(Script::Items(vec![
            delta("Hel"),
            Ok(StreamChunk::ToolEvent(image.clone())),
            delta("lo"),
            Ok(StreamChunk::Terminal),
            delta("ignored"),
        ]));
        let manager = manager(adapter);
        let id = SessionId::from("msg-1");
        let mut handle = manager.start(id.clone(), request()).await.expect("start");

        let mut events = Vec::new();
        while let Some(event) = handle.next_event().await {
            events.push(event);
        }
        assert!(matches!(
            events.first(),
            Some(SessionEvent::Started { backend: Backend::Mojo, .. })
        ));
        let texts: Vec<(u64, String)> = events
            .iter()
            .filter_map(|event| match event {
                SessionEvent::Progress { seq, content, .. } => Some((*seq, content.text.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(
            texts,
            vec![(1, "Hel".into()), (2, "Hel".into()), (3, "Hello".into())]
        );
        let Some(SessionEvent::Finished(outcome)) = events.last() else {
            panic!("last event must be Finished");
        };
        assert_eq!(outcome.status, SessionStatus::Completed);
        assert_eq!(outcome.text(), "Hello");
        assert_eq!(outcome.content.tool_events, vec![image]);
        assert_eq!(outcome.content.chunks, 3);
        assert!(!manager.is_active(&id));
        assert_eq!(handle.finish().await.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn cancel_keeps_only_delivered_content() {
        let (adapter, chunks) = ScriptedAdapter::channel();
        let manager = manager(adapter);
        let id = SessionId::from("msg-2");
        let mut handle = manager.start(id.clone(), request()).await.expect("start");

        chunks.unbounded_send(delta("one ")).expect("send");
        assert_eq!(next_progress_text(&mut handle).await, "one ");
        chunks.unbounded_send(delta("two ")).expect("send");
        assert_eq!(next_progress_text(&mut handle).await, "one two ");

        assert!(manager.cancel(&id));
        assert!(!manager.is_active(&id));
        let _ = chunks.unbounded_send(delta("three "));
        let _ = chunks.unbounded_send(delta("four "));
        let _ = chunks.unbounded_send(Ok(StreamChunk::Terminal));

        let outcome = handle.finish().await;
        assert_eq!(outcome.status, SessionStatus::Cancelled);
        assert_eq!(outcome.text(), "one two ");
        assert_eq!(outcome.failure, None);
        assert!(!manager.cancel(&id));
    }

    #[tokio::test]
    async fn restarting_an_identity_cancels_the_previous_session() {
        let adapter = ScriptedAdapter::new(Script::Pending);
        let manager = manager(adapter.clone());
        let id = SessionId::from("msg-3");

        let first = manager.start(id.clone(), request()).await.expect("first");
        let second = manager.start(id.clone(), request()).await.expect("second");
        assert!(second.attempt() > first.attempt());

        let first = first.finish().await;
        assert_eq!(first.status, SessionStatus::Cancelled);
        assert!(manager.is_active(&id));
        assert_eq!(manager.active_count(), 1);

        assert!(manager.cancel(&id));
        let second = second.finish().await;
        assert_eq!(second.status, SessionStatus::Cancelled);
        assert_ne!(first.attempt, second.attempt);
    }

    #[tokio::test]
    async fn superseded_outcome_lands_before_the_new_session_streams() {
        let adapter = ScriptedAdapter::sequence(vec![
            None,
            Some(vec![delta("fresh "), delta("answer"), Ok(StreamChunk::Terminal)]),
        ]);
        let manager = manager(adapter);
        let id = SessionId::from("msg-4");

        let mut first = manager.start(id.clone(), request()).await.expect("first");
        assert!(matches!(
            first.next_event().await,
            Some(SessionEvent::Started { .. })
        ));
        let mut second = manager.start(id.clone(), request()).await.expect("second");

        let first = futures::FutureExt::now_or_never(first.finish())
            .expect("superseded session already finalized");
        assert_eq!(first.status, SessionStatus::Cancelled);

        let mut seqs = Vec::new();
        let outcome = loop {
            match second.next_event().await.expect("event") {
                SessionEvent::Started { .. } => {}
                SessionEvent::Progress { seq, .. } => seqs.push(seq),
                SessionEvent::Finished(outcome) => break outcome,
            }
        };
        assert_eq!(seqs, vec![1, 2]);
        assert_eq!(outcome.status, SessionStatus::Completed);
        assert_eq!(outcome.content.text, "fresh answer");
        assert!(!manager.is_active(&id));
    }

    #[tokio::test]
    async fn start_locks_are_released_after_each_start() {
        let adapter = ScriptedAdapter::new(Script::Items(vec![
            delta("hi"),
            Ok(StreamChunk::Terminal),
        ]));
        let manager = manager(adapter);
        for n in 0..50 {
            let outcome = manager
                .start(format!("msg-{n}"), request())
                .await
                .expect("start")
                .finish()
                .await;
            assert_eq!(outcome.status, SessionStatus::Completed);
        }
        assert!(manager.inner.start_locks.is_empty());
    }

    #[tokio::test]
    async fn stalled_stream_times_out() {
        let adapter = ScriptedAdapter::new(Script::Pending);
        let manager = SessionManager::new(
            gateway_with(adapter),
            SessionConfig::default().idle_timeout(Duration::from_millis(50)),
        )
        .expect("manager");
        let outcome = manager
            .start("slow", request())
            .await
            .expect("start")
            .finish()
            .await;
        assert_eq!(outcome.status, SessionStatus::Failed);
        assert_eq!(outcome.failure.map(|f| f.kind), Some(ErrorKind::Timeout));
    }

    #[tokio::test]
    async fn backend_error_keeps_partial_content() {
        let adapter = ScriptedAdapter::new(Script::Items(vec![
            delta("partial"),
            Err(GatewayError::backend(
                Backend::Mojo,
                ErrorKind::AuxiliaryToolUnreachable,
                "exa unreachable",
                None,
            )),
        ]));
        let outcome = manager(adapter)
            .start("tools", request())
            .await
            .expect("start")
            .finish()
            .await;
        assert_eq!(outcome.status, SessionStatus::Failed);
        assert_eq!(outcome.text(), "partial");
        let failure = outcome.failure.expect("failure");
        assert_eq!(failure.kind, ErrorKind::AuxiliaryToolUnreachable);
        assert!(failure.message.contains("exa unreachable"));
    }

    #[tokio::test]
    async fn failure_to_open_is_reported_with_empty_content() {
        let adapter = ScriptedAdapter::new(Script::StartError(GatewayError::backend(
            Backend::Mojo,
            ErrorKind::QuotaExceeded,
            "quota",
            Some(429),
        )));
        let outcome = manager(adapter)
            .start("quota", request())
            .await
            .expect("start")
            .finish()
            .await;
        assert_eq!(outcome.status, SessionStatus::Failed);
        assert!(outcome.content.is_empty());
        assert!(outcome.failure.expect("failure").kind.is_retryable());
    }

    #[tokio::test]
    async fn closure_without_terminal_completes() {
        let adapter = ScriptedAdapter::new(Script::Items(vec![delta("abc")]));
        let outcome = manager(adapter)
            .start("closed", request())
            .await
            .expect("start")
            .finish()
            .await;
        assert_eq!(outcome.status, SessionStatus::Completed);
        assert_eq!(outcome.text(), "abc");
    }

    #[tokio::test]
    async fn invalid_request_is_rejected_before_spawning() {
        let adapter = ScriptedAdapter::new(Script::Pending);
        let manager = manager(adapter.clone());
        let err = manager
            .start("empty", ChatRequest::new(Backend::Mojo))
            .await
            .err()
            .expect("invalid");
        assert!(matches!(err, RelayError::Validation(_)));
        assert_eq!(manager.active_count(), 0);
        assert_eq!(adapter.opened.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dropping_the_handle_cancels_the_session() {
        let adapter = ScriptedAdapter::new(Script::Pending);
        let manager = manager(adapter);
        let id = SessionId::from("dropped");
        let handle = manager.start(id.clone(), request()).await.expect("start");
        drop(handle);
        assert!(!manager.is_active(&id));
        for _ in 0..100 {
            if manager.active_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_cancels_everything() {
        let adapter = ScriptedAdapter::new(Script::Pending);
        let manager = manager(adapter);
        let a = manager.start("a", request()).await.expect("a");
        let b = manager.start("b", request()).await.expect("b");
        assert_eq!(manager.active_count(), 2);
        assert_eq!(manager.shutdown().await, 2);
        assert_eq!(manager.active_count(), 0);
        assert_eq!(a.finish().await.status, SessionStatus::Cancelled);
        assert_eq!(b.finish().await.status, SessionStatus::Cancelled);
    }
}
