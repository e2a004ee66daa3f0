use std::{collections::VecDeque, time::Duration};

use chrono::{DateTime, Utc};
use tracing::{error, warn};
use uuid::Uuid;

use crate::error::TrackerError;

use super::{
    entities::{ActivitySpan, Session, SessionIssueLink, SessionOutcome, SpanAnnotation},
    Store,
};

/// A store write that has been decided on but not yet acknowledged by the store.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingWrite {
    InsertSpan(ActivitySpan),
    SealSpan(ActivitySpan),
    CheckpointSpan(Uuid, DateTime<Utc>),
    DiscardSpan(Uuid),
    AnnotateSpan(Uuid, SpanAnnotation),
    UpsertSession(Session),
    AppendOutcome(SessionOutcome),
    UpsertLink(SessionIssueLink),
}

impl PendingWrite {
    async fn apply(&self, store: &mut impl Store) -> Result<(), TrackerError> {
        match self {
            PendingWrite::InsertSpan(span) => store.insert_span(span).await,
            PendingWrite::SealSpan(span) => store.seal_span(span).await,
            PendingWrite::CheckpointSpan(id, at) => store.checkpoint_span(*id, *at).await,
            PendingWrite::DiscardSpan(id) => store.discard_span(*id).await,
            PendingWrite::AnnotateSpan(id, annotation) => {
                store.annotate_span(*id, annotation).await
            }
            PendingWrite::UpsertSession(session) => store.upsert_session(session).await,
            PendingWrite::AppendOutcome(outcome) => store.append_outcome(outcome).await.map(|_| ()),
            PendingWrite::UpsertLink(link) => store.upsert_link(link).await.map(|_| ()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound for a single store call.
    pub call_timeout: Duration,
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Outcome of draining the write queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushStatus {
    Flushed,
    /// Transient failures exhausted the retries. The remaining writes stay queued.
    Held { pending: usize },
    Corrupted(String),
}

/// Ordered queue of writes. Writes are applied strictly in the order they were queued, and a
/// write that keeps failing blocks the ones behind it.
#[derive(Debug, Default)]
pub struct WriteQueue {
    pending: VecDeque<PendingWrite>,
}

impl WriteQueue {
    pub fn push(&mut self, write: PendingWrite) {
        self.pending.push_back(write);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub async fn flush(&mut self, store: &mut impl Store, policy: &RetryPolicy) -> FlushStatus {
        while let Some(write) = self.pending.front() {
            match write_with_retry(store, write, policy).await {
                Ok(()) => {
                    self.pending.pop_front();
                }
                Err(TrackerError::Corrupted(message)) => {
                    error!("Store rejected write as corrupted {message}");
                    return FlushStatus::Corrupted(message);
                }
                Err(TrackerError::NotFound(message)) | Err(TrackerError::Conflict(message)) => {
                    // The store will never accept this write; keeping it would block the queue.
                    error!("Dropping write the store refused {write:?}: {message}");
                    self.pending.pop_front();
                }
                Err(e) => {
                    warn!(
                        "Holding {} pending writes after exhausting retries {e}",
                        self.pending.len()
                    );
                    return FlushStatus::Held {
                        pending: self.pending.len(),
                    };
                }
            }
        }
        FlushStatus::Flushed
    }
}

async fn write_with_retry(
    store: &mut impl Store,
    write: &PendingWrite,
    policy: &RetryPolicy,
) -> Result<(), TrackerError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = match tokio::time::timeout(policy.call_timeout, write.apply(store)).await {
            Ok(result) => result,
            Err(_) => Err(TrackerError::TransientIo(format!(
                "store call timed out after {:?}",
                policy.call_timeout
            ))),
        };
        match result {
            Err(e) if e.is_transient() && attempt < policy.attempts => {
                let delay = policy.delay(attempt);
                warn!("Transient store failure on attempt {attempt}, retrying in {delay:?}: {e}");
                tokio::time::sleep(delay).await;
            }
            result => return result,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{collections::VecDeque, sync::Arc, time::Duration};

    use chrono::{DateTime, TimeZone, Utc};
    use tempfile::{tempdir, TempDir};
    use uuid::Uuid;

    use crate::{
        daemon::storage::{
            entities::{
                ActivitySpan, Session, SessionIssueLink, SessionOutcome, SpanAnnotation, WorkItem,
            },
            journal::JournalStore,
            OpenSessionRecord, Store,
        },
        error::TrackerError,
    };

    use super::{FlushStatus, PendingWrite, RetryPolicy, WriteQueue};

    /// Wraps a [JournalStore] and fails writes with scripted errors before letting them through.
    pub(crate) struct ScriptedStore {
        pub inner: JournalStore,
        pub failures: VecDeque<TrackerError>,
        pub attempts: usize,
        _dir: Option<TempDir>,
    }

    impl ScriptedStore {
        pub async fn new(failures: impl IntoIterator<Item = TrackerError>) -> Self {
            let dir = tempdir().unwrap();
            let inner = JournalStore::open(dir.path()).await.unwrap();
            Self {
                inner,
                failures: failures.into_iter().collect(),
                attempts: 0,
                _dir: Some(dir),
            }
        }

        fn next_failure(&mut self) -> Result<(), TrackerError> {
            self.attempts += 1;
            match self.failures.pop_front() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }

    impl Store for ScriptedStore {
        async fn insert_span(&mut self, span: &ActivitySpan) -> Result<(), TrackerError> {
            self.next_failure()?;
            self.inner.insert_span(span).await
        }

        async fn seal_span(&mut self, span: &ActivitySpan) -> Result<(), TrackerError> {
            self.next_failure()?;
            self.inner.seal_span(span).await
        }

        async fn checkpoint_span(
            &mut self,
            span_id: Uuid,
            seen_at: DateTime<Utc>,
        ) -> Result<(), TrackerError> {
            self.next_failure()?;
            self.inner.checkpoint_span(span_id, seen_at).await
        }

        async fn discard_span(&mut self, span_id: Uuid) -> Result<(), TrackerError> {
            self.next_failure()?;
            self.inner.discard_span(span_id).await
        }

        async fn annotate_span(
            &mut self,
            span_id: Uuid,
            annotation: &SpanAnnotation,
        ) -> Result<(), TrackerError> {
            self.next_failure()?;
            self.inner.annotate_span(span_id, annotation).await
        }

        async fn upsert_session(&mut self, session: &Session) -> Result<(), TrackerError> {
            self.next_failure()?;
            self.inner.upsert_session(session).await
        }

        async fn append_outcome(
            &mut self,
            outcome: &SessionOutcome,
        ) -> Result<bool, TrackerError> {
            self.next_failure()?;
            self.inner.append_outcome(outcome).await
        }

        async fn upsert_link(
            &mut self,
            link: &SessionIssueLink,
        ) -> Result<SessionIssueLink, TrackerError> {
            self.next_failure()?;
            self.inner.upsert_link(link).await
        }

        async fn load_open_session_on_startup(
            &mut self,
        ) -> Result<Option<OpenSessionRecord>, TrackerError> {
            self.inner.load_open_session_on_startup().await
        }

        async fn session(&self, id: &str) -> Result<Option<Session>, TrackerError> {
            self.inner.session(id).await
        }

        async fn session_spans(&self, id: &str) -> Result<Vec<ActivitySpan>, TrackerError> {
            self.inner.session_spans(id).await
        }

        async fn session_outcomes(&self, id: &str) -> Result<Vec<SessionOutcome>, TrackerError> {
            self.inner.session_outcomes(id).await
        }

        async fn session_links(&self, id: &str) -> Result<Vec<SessionIssueLink>, TrackerError> {
            self.inner.session_links(id).await
        }

        async fn work_item(&self, issue_id: &str) -> Result<Option<WorkItem>, TrackerError> {
            self.inner.work_item(issue_id).await
        }
    }

    pub(crate) fn quick_policy() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            call_timeout: Duration::from_secs(1),
        }
    }

    fn session(id: &str) -> Session {
        Session::start(
            Arc::from(id),
            None,
            Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap(),
        )
    }

    fn busy() -> TrackerError {
        TrackerError::TransientIo("database is locked".into())
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let mut store = ScriptedStore::new([busy(), busy()]).await;
        let mut queue = WriteQueue::default();
        queue.push(PendingWrite::UpsertSession(session("a")));

        assert_eq!(queue.flush(&mut store, &quick_policy()).await, FlushStatus::Flushed);
        assert_eq!(store.attempts, 3);
        assert!(store.session("a").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_writes_are_held_in_order() {
        let mut store = ScriptedStore::new([busy(), busy(), busy()]).await;
        let mut queue = WriteQueue::default();
        queue.push(PendingWrite::UpsertSession(session("a")));
        queue.push(PendingWrite::UpsertSession(session("b")));

        assert_eq!(
            queue.flush(&mut store, &quick_policy()).await,
            FlushStatus::Held { pending: 2 }
        );
        assert!(store.session("b").await.unwrap().is_none());

        assert_eq!(queue.flush(&mut store, &quick_policy()).await, FlushStatus::Flushed);
        assert!(queue.is_empty());
        assert!(store.session("a").await.unwrap().is_some());
        assert!(store.session("b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_corruption_stops_the_queue() {
        let mut store = ScriptedStore::new([TrackerError::Corrupted("bad page".into())]).await;
        let mut queue = WriteQueue::default();
        queue.push(PendingWrite::UpsertSession(session("a")));

        assert!(matches!(
            queue.flush(&mut store, &quick_policy()).await,
            FlushStatus::Corrupted(_)
        ));
        assert_eq!(queue.len(), 1);
    }
}
