//!  Durable history is kept through the [Store] contract, implemented by
//!  [journal::JournalStore].
//!  The basic idea is:
//!   - Every write is one self-contained journal entry, so a write is either fully recorded or
//!     not recorded at all.
//!   - On open the journal is replayed into an in-memory index which answers every read.
//!   - A torn trailing entry (crash mid-write) is dropped, anything else unreadable is corruption.

pub mod entities;
pub mod journal;
pub mod retry;

use std::future::Future;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::TrackerError;

use entities::{
    ActivitySpan, Session, SessionIssueLink, SessionOutcome, SpanAnnotation, WorkItem,
};

/// A session that was still open when the journal was last written, together with its spans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenSessionRecord {
    pub session: Session,
    pub spans: Vec<ActivitySpan>,
    /// Last progress checkpoint written for the trailing open span, if any.
    pub last_checkpoint: Option<DateTime<Utc>>,
}

/// Interface for the durable store. Every write is atomic on its own; nothing spans two calls.
pub trait Store {
    fn insert_span(&mut self, span: &ActivitySpan)
        -> impl Future<Output = Result<(), TrackerError>>;

    /// Records `end_time` and the final duration of a span.
    fn seal_span(&mut self, span: &ActivitySpan) -> impl Future<Output = Result<(), TrackerError>>;

    /// Records how far an open span is known to have run. Used by crash recovery.
    fn checkpoint_span(
        &mut self,
        span_id: Uuid,
        seen_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), TrackerError>>;

    /// Drops a span that never accumulated any time.
    fn discard_span(&mut self, span_id: Uuid) -> impl Future<Output = Result<(), TrackerError>>;

    fn annotate_span(
        &mut self,
        span_id: Uuid,
        annotation: &SpanAnnotation,
    ) -> impl Future<Output = Result<(), TrackerError>>;

    fn upsert_session(&mut self, session: &Session)
        -> impl Future<Output = Result<(), TrackerError>>;

    /// Idempotent on `(session_id, type, reference)`. Returns false if the outcome already existed.
    fn append_outcome(
        &mut self,
        outcome: &SessionOutcome,
    ) -> impl Future<Output = Result<bool, TrackerError>>;

    /// Upserts on `(session_id, issue_id, system)` and returns the stored link.
    fn upsert_link(
        &mut self,
        link: &SessionIssueLink,
    ) -> impl Future<Output = Result<SessionIssueLink, TrackerError>>;

    fn load_open_session_on_startup(
        &mut self,
    ) -> impl Future<Output = Result<Option<OpenSessionRecord>, TrackerError>>;

    fn session(&self, id: &str) -> impl Future<Output = Result<Option<Session>, TrackerError>>;

    fn session_spans(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<Vec<ActivitySpan>, TrackerError>>;

    fn session_outcomes(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<Vec<SessionOutcome>, TrackerError>>;

    fn session_links(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<Vec<SessionIssueLink>, TrackerError>>;

    /// Work items are known once an issue was linked to some session.
    fn work_item(
        &self,
        issue_id: &str,
    ) -> impl Future<Output = Result<Option<WorkItem>, TrackerError>>;
}

/// Stand-in for a journal that couldn't be read at startup. Every call fails with the reason, the
/// daemon keeps serving status in degraded mode on top of it.
#[derive(Debug, Clone)]
pub struct UnreadableStore {
    reason: String,
}

impl UnreadableStore {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    fn refuse<T>(&self) -> Result<T, TrackerError> {
        Err(TrackerError::Corrupted(self.reason.clone()))
    }
}

impl Store for UnreadableStore {
    async fn insert_span(&mut self, _span: &ActivitySpan) -> Result<(), TrackerError> {
        self.refuse()
    }

    async fn seal_span(&mut self, _span: &ActivitySpan) -> Result<(), TrackerError> {
        self.refuse()
    }

    async fn checkpoint_span(
        &mut self,
        _span_id: Uuid,
        _seen_at: DateTime<Utc>,
    ) -> Result<(), TrackerError> {
        self.refuse()
    }

    async fn discard_span(&mut self, _span_id: Uuid) -> Result<(), TrackerError> {
        self.refuse()
    }

    async fn annotate_span(
        &mut self,
        _span_id: Uuid,
        _annotation: &SpanAnnotation,
    ) -> Result<(), TrackerError> {
        self.refuse()
    }

    async fn upsert_session(&mut self, _session: &Session) -> Result<(), TrackerError> {
        self.refuse()
    }

    async fn append_outcome(&mut self, _outcome: &SessionOutcome) -> Result<bool, TrackerError> {
        self.refuse()
    }

    async fn upsert_link(
        &mut self,
        _link: &SessionIssueLink,
    ) -> Result<SessionIssueLink, TrackerError> {
        self.refuse()
    }

    async fn load_open_session_on_startup(
        &mut self,
    ) -> Result<Option<OpenSessionRecord>, TrackerError> {
        self.refuse()
    }

    async fn session(&self, _id: &str) -> Result<Option<Session>, TrackerError> {
        self.refuse()
    }

    async fn session_spans(&self, _id: &str) -> Result<Vec<ActivitySpan>, TrackerError> {
        self.refuse()
    }

    async fn session_outcomes(&self, _id: &str) -> Result<Vec<SessionOutcome>, TrackerError> {
        self.refuse()
    }

    async fn session_links(&self, _id: &str) -> Result<Vec<SessionIssueLink>, TrackerError> {
        self.refuse()
    }

    async fn work_item(&self, _issue_id: &str) -> Result<Option<WorkItem>, TrackerError> {
        self.refuse()
    }
}
