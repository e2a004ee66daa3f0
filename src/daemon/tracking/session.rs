use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    control::protocol::{Health, SessionStatus, StatusReport},
    daemon::{
        collection::{Activity, Observation},
        config::TrackerConfig,
        storage::{
            entities::{
                ActivitySpan, EndReason, IssueRelationship, OutcomeType, Session,
                SessionIssueLink, SessionOutcome, SessionState, SpanAnnotation, WorkItem,
            },
            retry::{FlushStatus, PendingWrite, WriteQueue},
            Store,
        },
    },
    error::TrackerError,
    utils::clock::Clock,
};

use super::aggregator::{SpanAggregator, SpanChange};

/// Owns the lifecycle of the current session and everything it produces. All mutations go through
/// here, one message at a time; the store only ever sees writes through the ordered write queue.
///
/// A machine without a session is in the `NoSession` state. Ended sessions are handed to the
/// store and forgotten, they are never reopened.
pub struct SessionMachine<S> {
    store: S,
    config: Arc<TrackerConfig>,
    clock: Box<dyn Clock>,
    session: Option<Session>,
    aggregator: SpanAggregator,
    queue: WriteQueue,
    outcomes: Vec<SessionOutcome>,
    links: Vec<SessionIssueLink>,
    work_item: Option<WorkItem>,
    sealed_seconds: i64,
    /// Finished idle stretches of the open session.
    idle_seconds: i64,
    /// Seal point of the idle transition while the active session is idle.
    idle_since: Option<DateTime<Utc>>,
    last_observation_at: Option<DateTime<Utc>>,
    last_checkpoint_at: Option<DateTime<Utc>>,
    degraded: Option<String>,
    /// Sealed spans waiting to be handed to the classifier.
    sealed: Vec<ActivitySpan>,
}

impl<S: Store> SessionMachine<S> {
    pub fn new(store: S, config: Arc<TrackerConfig>, clock: Box<dyn Clock>) -> Self {
        Self {
            store,
            config,
            clock,
            session: None,
            aggregator: SpanAggregator::default(),
            queue: WriteQueue::default(),
            outcomes: vec![],
            links: vec![],
            work_item: None,
            sealed_seconds: 0,
            idle_seconds: 0,
            idle_since: None,
            last_observation_at: None,
            last_checkpoint_at: None,
            degraded: None,
            sealed: vec![],
        }
    }

    /// Starts the machine in degraded mode, for a store that was already unusable at startup.
    pub fn degraded(mut self, reason: impl Into<String>) -> Self {
        self.degraded = Some(reason.into());
        self
    }

    pub fn set_config(&mut self, config: Arc<TrackerConfig>) {
        self.config = config;
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// `None` while no session is open.
    pub fn state(&self) -> Option<SessionState> {
        self.session.as_ref().map(|v| v.state)
    }

    pub fn take_sealed(&mut self) -> Vec<ActivitySpan> {
        std::mem::take(&mut self.sealed)
    }

    pub fn status(&self) -> StatusReport {
        let open_seconds = self
            .aggregator
            .open_span()
            .map_or(0, |v| v.duration_seconds);
        StatusReport {
            health: match self.degraded {
                Some(_) => Health::Degraded,
                None => Health::Running,
            },
            degraded_reason: self.degraded.clone(),
            session: self.session.as_ref().map(|session| SessionStatus {
                session: session.clone(),
                outcomes: self.outcomes.clone(),
                links: self.links.clone(),
                tracked_seconds: self.sealed_seconds + open_seconds,
                idle_seconds: self.idle_seconds + self.current_idle_seconds(),
            }),
            open_span: self.aggregator.open_span().cloned(),
            work_item: self.work_item.clone(),
            idle: self.idle_since.is_some(),
            pending_writes: self.queue.len(),
            last_observation_at: self.last_observation_at,
        }
    }

    /// Command timestamps never run behind the last tick, so spans can't go backwards.
    fn now(&self) -> DateTime<Utc> {
        let now = self.clock.time();
        self.aggregator
            .last_tick_at()
            .map_or(now, |tick| now.max(tick))
    }

    /// Length of the idle stretch in progress, up to the last tick.
    fn current_idle_seconds(&self) -> i64 {
        match (self.idle_since, self.aggregator.last_tick_at()) {
            (Some(since), Some(tick)) => (tick - since).num_seconds().max(0),
            _ => 0,
        }
    }

    /// Copies the counters onto the session record before it is written.
    fn record_counters(&mut self) {
        let (active, idle) = (self.sealed_seconds, self.idle_seconds);
        if let Some(session) = self.session.as_mut() {
            session.active_seconds = active;
            session.idle_seconds = idle;
        }
    }

    fn ensure_writable(&self) -> Result<(), TrackerError> {
        match &self.degraded {
            Some(reason) => Err(TrackerError::Corrupted(reason.clone())),
            None => Ok(()),
        }
    }

    fn work_item_id(&self) -> Option<String> {
        self.work_item.as_ref().map(|v| v.issue_id.clone())
    }

    fn apply(&mut self, changes: impl IntoIterator<Item = SpanChange>) {
        for change in changes {
            match change {
                SpanChange::Opened(span) => {
                    debug!(span_id = %span.id, app = %span.app_name, "Opened span");
                    self.last_checkpoint_at = Some(span.start_time);
                    self.queue.push(PendingWrite::InsertSpan(span));
                }
                SpanChange::Sealed(span) => {
                    debug!(span_id = %span.id, duration = span.duration_seconds, "Sealed span");
                    self.sealed_seconds += span.duration_seconds;
                    self.queue.push(PendingWrite::SealSpan(span.clone()));
                    self.sealed.push(span);
                }
                SpanChange::Discarded(span) => {
                    debug!(span_id = %span.id, "Discarded empty span");
                    self.queue.push(PendingWrite::DiscardSpan(span.id));
                }
            }
        }
    }

    async fn flush(&mut self) -> Result<(), TrackerError> {
        self.ensure_writable()?;
        match self
            .queue
            .flush(&mut self.store, &self.config.retry_policy())
            .await
        {
            FlushStatus::Flushed | FlushStatus::Held { .. } => Ok(()),
            FlushStatus::Corrupted(message) => {
                error!("Store is corrupted, switching to degraded mode: {message}");
                self.degraded = Some(message.clone());
                Err(TrackerError::Corrupted(message))
            }
        }
    }

    fn begin(&mut self, session: Session) {
        info!(session_id = %session.id, "Started session");
        self.queue.push(PendingWrite::UpsertSession(session.clone()));
        self.session = Some(session);
        self.outcomes.clear();
        self.links.clear();
        self.sealed_seconds = 0;
        self.idle_seconds = 0;
        self.idle_since = None;
    }

    /// Opens a span for the last observed context, if there is one to open.
    fn open_from_last_context(&mut self, at: DateTime<Utc>) {
        let Some(session_id) = self.session.as_ref().map(|v| v.id.clone()) else {
            return;
        };
        let Some(context) = self.aggregator.last_context().cloned() else {
            return;
        };
        let work_item_id = self.work_item_id();
        let change = self
            .aggregator
            .open(&session_id, &context, work_item_id.as_deref(), at);
        self.apply([change]);
    }

    /// Seals the open span and ends the open session at `at`.
    fn close(&mut self, at: DateTime<Utc>, reason: EndReason) -> Option<Session> {
        let change = self.aggregator.seal(at);
        self.apply(change);
        self.record_counters();

        let mut session = self.session.take()?;
        info!(
            session_id = %session.id,
            reason = %reason,
            active_seconds = session.active_seconds,
            idle_seconds = session.idle_seconds,
            "Ended session"
        );
        session.end(at, reason);
        self.queue.push(PendingWrite::UpsertSession(session.clone()));
        self.outcomes.clear();
        self.links.clear();
        self.work_item = None;
        self.idle_since = None;
        self.sealed_seconds = 0;
        self.idle_seconds = 0;
        Some(session)
    }

    /// End point for sessions closed now. An idle session ends where the idle period began.
    fn end_point(&self) -> DateTime<Utc> {
        self.idle_since.unwrap_or_else(|| self.now())
    }

    fn checkpoint(&mut self, at: DateTime<Utc>) {
        let Some(span) = self.aggregator.open_span() else {
            return;
        };
        let due = self
            .last_checkpoint_at
            .map_or(true, |last| at - last >= self.config.checkpoint_interval());
        if due {
            self.queue.push(PendingWrite::CheckpointSpan(span.id, at));
            self.last_checkpoint_at = Some(at);
        }
    }

    fn on_suspension(&mut self, previous: DateTime<Utc>, gap: chrono::Duration) {
        warn!("No ticks for {gap}, treating it as a suspension");
        let change = self.aggregator.seal(previous);
        self.apply(change);

        if self.state() == Some(SessionState::Active) && gap >= self.config.session_timeout() {
            let end = self.idle_since.unwrap_or(previous);
            self.close(end, EndReason::IdleTimeout);
        }
    }

    /// Ends the open session at the last tick inside work hours. Sessions started by hand
    /// outside work hours keep running, only the transition ends them.
    fn on_work_hours_over(&mut self, previous: DateTime<Utc>) {
        if self.session.is_none() {
            return;
        }
        info!("Work hours are over");
        let end = self.idle_since.unwrap_or(previous);
        self.close(end, EndReason::OutsideWorkHours);
    }

    fn observe_active(&mut self, observation: &Observation) {
        let at = observation.captured_at;
        if observation.is_idle_signal {
            if self.idle_since.is_none() {
                let (seal_at, change) = self.aggregator.seal_idle(observation.last_signal_at.min(at));
                info!("User went idle, last signal at {seal_at}");
                self.apply(change);
                self.idle_since = Some(seal_at);
            }
            if at - observation.last_signal_at >= self.config.session_timeout() {
                let end = self.idle_since.unwrap_or(observation.last_signal_at);
                self.close(end, EndReason::IdleTimeout);
            }
            return;
        }

        if let Some(since) = self.idle_since.take() {
            let idle = (at - since).num_seconds().max(0);
            self.idle_seconds += idle;
            info!("User is back after {idle}s");
        }
        let Some(session_id) = self.session.as_ref().map(|v| v.id.clone()) else {
            return;
        };
        match &observation.activity {
            Activity::Tracked(context) => {
                let work_item_id = self.work_item_id();
                let changes =
                    self.aggregator
                        .fold(&session_id, context, work_item_id.as_deref(), at);
                self.apply(changes);
            }
            Activity::Excluded => {
                let change = self.aggregator.seal(at);
                self.apply(change);
            }
            Activity::Unknown => self.aggregator.extend(at),
        }
    }

    /// Applies one tick.
    pub async fn observe(&mut self, observation: Observation) {
        let at = observation.captured_at;
        self.last_observation_at = Some(at);
        if self.degraded.is_some() {
            return;
        }

        if let Some(previous) = self.aggregator.last_tick_at() {
            let gap = at - previous;
            if gap > self.config.gap_tolerance() {
                self.on_suspension(previous, gap);
            }
            if self.config.within_work_hours(previous) && !self.config.within_work_hours(at) {
                self.on_work_hours_over(previous);
            }
        }
        self.aggregator.record_tick(at, &observation.activity);

        match self.state() {
            None => {
                if let (false, true, Activity::Tracked(context)) = (
                    observation.is_idle_signal,
                    self.config.within_work_hours(at),
                    &observation.activity,
                ) {
                    let session = Session::start(Uuid::new_v4().to_string().into(), None, at);
                    let work_item_id = self.work_item_id();
                    let change =
                        self.aggregator
                            .open(&session.id, context, work_item_id.as_deref(), at);
                    self.begin(session);
                    self.apply([change]);
                }
            }
            Some(SessionState::Active) => self.observe_active(&observation),
            Some(SessionState::Paused) | Some(SessionState::Ended) => (),
        }

        self.checkpoint(at);
        if let Err(e) = self.flush().await {
            debug!("Tick writes not flushed {e}");
        }
    }

    /// Attaches classifier output to an already sealed span.
    pub async fn annotate(&mut self, span_id: Uuid, annotation: SpanAnnotation) {
        if self.degraded.is_some() {
            return;
        }
        self.queue
            .push(PendingWrite::AnnotateSpan(span_id, annotation));
        if let Err(e) = self.flush().await {
            debug!("Annotation not flushed {e}");
        }
    }

    /// `start`: opens a session, resumes a paused one, or returns the running one.
    pub async fn start(&mut self, project: Option<String>) -> Result<Session, TrackerError> {
        self.ensure_writable()?;
        match self.session.clone() {
            Some(session) if session.state == SessionState::Paused => self.resume().await,
            Some(session) => Ok(session),
            None => {
                let now = self.now();
                let session = Session::start(Uuid::new_v4().to_string().into(), project, now);
                self.begin(session.clone());
                self.open_from_last_context(now);
                self.flush().await?;
                Ok(session)
            }
        }
    }

    pub async fn stop(&mut self) -> Result<Session, TrackerError> {
        self.ensure_writable()?;
        let end = self.end_point();
        let session = self
            .close(end, EndReason::Stopped)
            .ok_or_else(|| TrackerError::Conflict("no session is running".into()))?;
        self.flush().await?;
        Ok(session)
    }

    pub async fn pause(&mut self) -> Result<Session, TrackerError> {
        self.ensure_writable()?;
        let end = self.end_point();
        let Some(session) = self.session.as_mut() else {
            return Err(TrackerError::Conflict("no session is running".into()));
        };
        if session.state != SessionState::Active {
            return Err(TrackerError::Conflict(format!(
                "session '{}' is not active",
                session.id
            )));
        }
        session.state = SessionState::Paused;

        let change = self.aggregator.seal(end);
        self.apply(change);
        self.idle_since = None;
        self.record_counters();
        let session = self
            .session
            .clone()
            .ok_or_else(|| TrackerError::Conflict("no session is running".into()))?;
        self.queue.push(PendingWrite::UpsertSession(session.clone()));
        self.flush().await?;
        info!(session_id = %session.id, "Paused session");
        Ok(session)
    }

    pub async fn resume(&mut self) -> Result<Session, TrackerError> {
        self.ensure_writable()?;
        let now = self.now();
        let Some(session) = self.session.as_mut() else {
            return Err(TrackerError::Conflict("no session is running".into()));
        };
        if session.state != SessionState::Paused {
            return Err(TrackerError::Conflict(format!(
                "session '{}' is not paused",
                session.id
            )));
        }
        session.state = SessionState::Active;
        let session = session.clone();

        self.queue.push(PendingWrite::UpsertSession(session.clone()));
        self.open_from_last_context(now);
        self.flush().await?;
        info!(session_id = %session.id, "Resumed session");
        Ok(session)
    }

    async fn find_work_item(&self, issue_id: &str) -> Result<Option<WorkItem>, TrackerError> {
        if let Some(item) = self.store.work_item(issue_id).await? {
            return Ok(Some(item));
        }
        // Links of the open session may still be waiting in the write queue.
        Ok(self
            .links
            .iter()
            .find(|v| v.issue_id == issue_id)
            .map(|link| WorkItem {
                issue_id: link.issue_id.clone(),
                system: link.system.clone(),
                accumulated_seconds: 0,
            }))
    }

    /// Seals the open span and continues the same context under the current work item.
    fn swap_work_item(&mut self, at: DateTime<Utc>) {
        let Some(session_id) = self.session.as_ref().map(|v| v.id.clone()) else {
            return;
        };
        let work_item_id = self.work_item_id();
        let changes = self
            .aggregator
            .reopen(&session_id, work_item_id.as_deref(), at);
        self.apply(changes);
    }

    pub async fn work_on(&mut self, issue_id: &str) -> Result<WorkItem, TrackerError> {
        self.ensure_writable()?;
        let item = self
            .find_work_item(issue_id)
            .await?
            .ok_or_else(|| TrackerError::not_found("work item", issue_id))?;
        let now = self.now();
        self.work_item = Some(item.clone());
        self.swap_work_item(now);
        self.flush().await?;

        let item = self.find_work_item(issue_id).await?.unwrap_or(item);
        self.work_item = Some(item.clone());
        info!(work_item = %item.issue_id, "Working on item");
        Ok(item)
    }

    pub async fn work_off(&mut self) -> Result<Option<WorkItem>, TrackerError> {
        self.ensure_writable()?;
        let previous = self.work_item.take();
        if previous.is_some() {
            let now = self.now();
            self.swap_work_item(now);
            self.flush().await?;
        }
        Ok(previous)
    }

    /// `session.start`: starts a session under a caller supplied id. Any other open session is
    /// superseded.
    pub async fn start_session(
        &mut self,
        id: &str,
        project: Option<String>,
    ) -> Result<Session, TrackerError> {
        self.ensure_writable()?;
        if let Some(current) = self.session.as_ref().filter(|v| v.id.as_ref() == id) {
            return Ok(current.clone());
        }
        if self.store.session(id).await?.is_some() {
            return Err(TrackerError::Conflict(format!(
                "session '{id}' already exists and can't be reopened"
            )));
        }

        let now = self.now();
        if let Some(previous) = self.close(now, EndReason::Superseded) {
            info!(session_id = %previous.id, "Superseded by '{id}'");
        }
        let session = Session::start(id.into(), project, now);
        self.begin(session.clone());
        self.open_from_last_context(now);
        self.flush().await?;
        Ok(session)
    }

    /// `session.end`: ending an already ended session returns it unchanged.
    pub async fn end_session(
        &mut self,
        id: &str,
        reason: Option<String>,
    ) -> Result<Session, TrackerError> {
        self.ensure_writable()?;
        let reason = reason.map_or(EndReason::Stopped, EndReason::Client);

        if self.session.as_ref().is_some_and(|v| v.id.as_ref() == id) {
            let end = self.end_point();
            let session = self
                .close(end, reason)
                .ok_or_else(|| TrackerError::not_found("session", id))?;
            self.flush().await?;
            return Ok(session);
        }

        match self.store.session(id).await? {
            Some(session) if !session.is_open() => Ok(session),
            Some(mut session) => {
                warn!(session_id = %session.id, "Ending a stale open session");
                session.end(self.now(), reason);
                self.queue.push(PendingWrite::UpsertSession(session.clone()));
                self.flush().await?;
                Ok(session)
            }
            None => Err(TrackerError::not_found("session", id)),
        }
    }

    /// Resolves `id` to the open session, or explains why it can't take writes.
    async fn require_open(&self, id: &str) -> Result<Arc<str>, TrackerError> {
        match &self.session {
            Some(session) if session.id.as_ref() == id => Ok(session.id.clone()),
            _ => match self.store.session(id).await? {
                Some(_) => Err(TrackerError::Conflict(format!(
                    "session '{id}' has ended"
                ))),
                None => Err(TrackerError::not_found("session", id)),
            },
        }
    }

    pub async fn link(
        &mut self,
        id: &str,
        issue_id: String,
        system: String,
        relationship: IssueRelationship,
    ) -> Result<SessionIssueLink, TrackerError> {
        self.ensure_writable()?;
        let session_id = self.require_open(id).await?;
        let link = SessionIssueLink {
            session_id,
            issue_id,
            system,
            relationship,
            linked_at: self.now(),
        };

        let merged = match self.links.iter_mut().find(|v| v.same_key(&link)) {
            Some(existing) if existing.relationship >= link.relationship => {
                return Ok(existing.clone());
            }
            Some(existing) => {
                existing.merge(&link);
                existing.clone()
            }
            None => {
                self.links.push(link.clone());
                link
            }
        };
        self.queue.push(PendingWrite::UpsertLink(merged.clone()));
        self.flush().await?;
        Ok(merged)
    }

    /// Returns the stored outcome and whether it was new.
    pub async fn record_outcome(
        &mut self,
        id: &str,
        kind: OutcomeType,
        reference: Option<String>,
        description: String,
    ) -> Result<(SessionOutcome, bool), TrackerError> {
        self.ensure_writable()?;
        let session_id = self.require_open(id).await?;
        let outcome = SessionOutcome {
            session_id,
            kind,
            reference,
            description,
            recorded_at: self.now(),
        };
        if let Some(existing) = self.outcomes.iter().find(|v| v.same_key(&outcome)) {
            return Ok((existing.clone(), false));
        }

        self.outcomes.push(outcome.clone());
        self.queue.push(PendingWrite::AppendOutcome(outcome.clone()));
        self.flush().await?;
        Ok((outcome, true))
    }

    /// Seals the open span, ends the open session and drains the write queue.
    pub async fn shutdown(&mut self) {
        if self.degraded.is_none() {
            let end = self.end_point();
            self.close(end, EndReason::Shutdown);
        }
        match self.flush().await {
            Ok(()) if self.queue.is_empty() => info!("All writes flushed"),
            Ok(()) => warn!(
                "{} writes could not be flushed before shutdown",
                self.queue.len()
            ),
            Err(e) => error!("Final flush failed {e}"),
        }
    }
}
