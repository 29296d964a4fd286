use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::StreamExt as _;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::chunk::{SessionContent, StreamChunk};
use crate::errors::{ErrorKind, SessionFailure};
use crate::gateway::Gateway;
use crate::model::{Backend, ChatRequest};
use crate::stream::{SessionEvent, SessionId, SessionOutcome, SessionStatus};

/// Handle used to request cancellation of a running session.
#[derive(Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl AbortHandle {
    pub(crate) fn new() -> (Self, AbortSignal) {
        let (tx, rx) = watch::channel(false);
        (Self { tx: Arc::new(tx) }, AbortSignal { rx })
    }

    /// Requests cancellation.
    ///
    /// The session ends as `Cancelled` with the content accumulated so far.
    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }
}

pub(crate) struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    /// Resolves once cancellation was requested. Pends forever if every
    /// handle is gone without aborting.
    pub(crate) async fn cancelled(&mut self) {
        let requested = self.rx.wait_for(|aborted| *aborted).await.map(|_| ());
        if requested.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// State shared between a session task, its handle and the manager.
pub(crate) struct SessionShared {
    pub(crate) id: SessionId,
    pub(crate) attempt: u64,
    content: Mutex<SessionContent>,
    final_tx: Mutex<Option<oneshot::Sender<SessionOutcome>>>,
    done: watch::Sender<bool>,
}

impl SessionShared {
    pub(crate) fn new(
        id: SessionId,
        attempt: u64,
        final_tx: oneshot::Sender<SessionOutcome>,
    ) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            id,
            attempt,
            content: Mutex::new(SessionContent::default()),
            final_tx: Mutex::new(Some(final_tx)),
            done,
        }
    }

    pub(crate) fn snapshot(&self) -> SessionContent {
        self.content
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn apply(&self, chunk: &StreamChunk) {
        self.content
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .apply(chunk);
    }

    pub(crate) fn is_finalized(&self) -> bool {
        *self.done.borrow()
    }

    /// Resolves once the session has produced its outcome.
    pub(crate) async fn finalized(&self) {
        let mut done = self.done.subscribe();
        let _ = done.wait_for(|done| *done).await.map(|_| ());
    }

    /// Publishes the terminal outcome. Only the first call has any effect.
    pub(crate) fn finalize(&self, status: SessionStatus, failure: Option<SessionFailure>) -> bool {
        let Some(final_tx) = self
            .final_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return false;
        };
        let outcome = SessionOutcome {
            id: self.id.clone(),
            attempt: self.attempt,
            status,
            content: self.snapshot(),
            failure,
        };
        match &outcome.failure {
            Some(failure) => warn!(
                session = %self.id,
                attempt = self.attempt,
                status = %status,
                kind = %failure.kind,
                error = %failure.message,
                chunks = outcome.content.chunks,
                "session finished"
            ),
            None => info!(
                session = %self.id,
                attempt = self.attempt,
                status = %status,
                chunks = outcome.content.chunks,
                text_len = outcome.content.text.len(),
                "session finished"
            ),
        }
        let _ = final_tx.send(outcome);
        self.done.send_replace(true);
        true
    }
}

pub(crate) struct SessionTask {
    pub(crate) gateway: Gateway,
    pub(crate) request: ChatRequest,
    pub(crate) shared: Arc<SessionShared>,
    pub(crate) tx: mpsc::Sender<SessionEvent>,
    pub(crate) abort: AbortSignal,
    pub(crate) idle_timeout: Duration,
}

/// Drives one session from `Started` to its outcome.
///
/// Cancellation is checked before every read, so no chunk is consumed once
/// it was requested. The transport is dropped on return.
pub(crate) async fn run_session(task: SessionTask) {
    let SessionTask {
        gateway,
        request,
        shared,
        tx,
        mut abort,
        idle_timeout,
    } = task;
    let backend = request.backend;

    let started = SessionEvent::Started {
        id: shared.id.clone(),
        attempt: shared.attempt,
        backend,
    };
    if !send_event(&tx, &mut abort, started).await {
        shared.finalize(SessionStatus::Cancelled, None);
        return;
    }

    let opened = tokio::select! {
        biased;
        _ = abort.cancelled() => {
            shared.finalize(SessionStatus::Cancelled, None);
            return;
        }
        _ = tokio::time::sleep(idle_timeout) => {
            shared.finalize(SessionStatus::Failed, Some(timeout_failure(backend, idle_timeout)));
            return;
        }
        opened = gateway.open_stream(&request) => opened,
    };
    let mut stream = match opened {
        Ok(stream) => stream,
        Err(err) => {
            shared.finalize(SessionStatus::Failed, Some(SessionFailure::from(&err)));
            return;
        }
    };

    let mut seq = 0_u64;
    let mut content = SessionContent::default();
    let mut deadline = Instant::now() + idle_timeout;
    loop {
        let next = tokio::select! {
            biased;
            _ = abort.cancelled() => {
                shared.finalize(SessionStatus::Cancelled, None);
                return;
            }
            _ = tokio::time::sleep_until(deadline) => {
                shared.finalize(SessionStatus::Failed, Some(timeout_failure(backend, idle_timeout)));
                return;
            }
            next = stream.next() => next,
        };

        let chunk = match next {
            Some(Ok(StreamChunk::Terminal)) | None => {
                shared.finalize(SessionStatus::Completed, None);
                return;
            }
            Some(Ok(chunk)) => chunk,
            Some(Err(err)) => {
                shared.finalize(SessionStatus::Failed, Some(SessionFailure::from(&err)));
                return;
            }
        };

        deadline = Instant::now() + idle_timeout;
        seq = seq.saturating_add(1);
        content.apply(&chunk);
        debug!(session = %shared.id, attempt = shared.attempt, seq, chunks = content.chunks, "session progress");
        let progress = SessionEvent::Progress {
            seq,
            chunk: chunk.clone(),
            content: content.clone(),
        };
        // Content only counts once the update was delivered.
        if !send_event(&tx, &mut abort, progress).await {
            shared.finalize(SessionStatus::Cancelled, None);
            return;
        }
        shared.apply(&chunk);
    }
}

/// Sends unless cancellation wins first. `false` means the session must stop.
async fn send_event(
    tx: &mpsc::Sender<SessionEvent>,
    abort: &mut AbortSignal,
    event: SessionEvent,
) -> bool {
    tokio::select! {
        biased;
        _ = abort.cancelled() => false,
        sent = tx.send(event) => sent.is_ok(),
    }
}

fn timeout_failure(backend: Backend, idle_timeout: Duration) -> SessionFailure {
    SessionFailure::new(
        ErrorKind::Timeout,
        format!(
            "no progress from {backend} within {}ms",
            idle_timeout.as_millis()
        ),
    )
}
