use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::daemon::{
    collection::Activity,
    storage::entities::{ActivitySpan, SpanContext},
};

/// Span lifecycle events produced by the aggregator, in the order they must be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpanChange {
    Opened(ActivitySpan),
    Sealed(ActivitySpan),
    /// The span was opened but sealed without any elapsed time.
    Discarded(ActivitySpan),
}

/// Folds observations into contiguous spans. Holds at most one open span; it never decides about
/// sessions, the [SessionMachine](super::session::SessionMachine) tells it when to open and when
/// to seal.
#[derive(Debug, Default)]
pub struct SpanAggregator {
    open: Option<ActivitySpan>,
    /// Last tick at which the open span was known to be running.
    open_seen_at: Option<DateTime<Utc>>,
    last_tick_at: Option<DateTime<Utc>>,
    last_context: Option<SpanContext>,
}

impl SpanAggregator {
    pub fn open_span(&self) -> Option<&ActivitySpan> {
        self.open.as_ref()
    }

    pub fn last_tick_at(&self) -> Option<DateTime<Utc>> {
        self.last_tick_at
    }

    /// Most recent trackable context, used to reopen a span on resume.
    pub fn last_context(&self) -> Option<&SpanContext> {
        self.last_context.as_ref()
    }

    /// Remembers the tick for gap detection. Excluded activity forgets the last context so it is
    /// never reopened on resume; an unknown sample keeps it.
    pub fn record_tick(&mut self, at: DateTime<Utc>, activity: &Activity) {
        self.last_tick_at = Some(at);
        match activity {
            Activity::Tracked(context) => self.last_context = Some(context.clone()),
            Activity::Excluded => self.last_context = None,
            Activity::Unknown => (),
        }
    }

    /// Extends the open span when the key matches, otherwise seals it at `at` and opens a new one
    /// at the same instant.
    pub fn fold(
        &mut self,
        session_id: &Arc<str>,
        context: &SpanContext,
        work_item_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> Vec<SpanChange> {
        let same_key = self
            .open
            .as_ref()
            .map(|span| span.context().key() == context.key());
        match same_key {
            Some(true) => {
                self.extend(at);
                vec![]
            }
            Some(false) => {
                let mut changes = self.seal(at).into_iter().collect::<Vec<_>>();
                changes.push(self.open(session_id, context, work_item_id, at));
                changes
            }
            None => vec![self.open(session_id, context, work_item_id, at)],
        }
    }

    /// Heartbeat without context, keeps the open span running.
    pub fn extend(&mut self, at: DateTime<Utc>) {
        if let Some(span) = &mut self.open {
            span.touch(at);
            self.open_seen_at = Some(at);
        }
    }

    pub fn open(
        &mut self,
        session_id: &Arc<str>,
        context: &SpanContext,
        work_item_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> SpanChange {
        let span = ActivitySpan::open(
            session_id.clone(),
            context,
            work_item_id.map(ToString::to_string),
            at,
        );
        self.open = Some(span.clone());
        self.open_seen_at = Some(at);
        SpanChange::Opened(span)
    }

    /// Seals the open span at `at`, never before its start.
    pub fn seal(&mut self, at: DateTime<Utc>) -> Option<SpanChange> {
        let mut span = self.open.take()?;
        self.open_seen_at = None;
        let end = at.max(span.start_time);
        if end == span.start_time {
            return Some(SpanChange::Discarded(span));
        }
        span.seal(end);
        Some(SpanChange::Sealed(span))
    }

    /// Seals for an idle transition. The end is the last signal, clamped so it neither precedes
    /// the span nor runs past the last tick the span was seen running. Returns the seal point.
    pub fn seal_idle(&mut self, last_signal: DateTime<Utc>) -> (DateTime<Utc>, Option<SpanChange>) {
        let Some(span) = &self.open else {
            return (last_signal, None);
        };
        let latest = self.open_seen_at.unwrap_or(span.start_time);
        let end = last_signal.clamp(span.start_time, latest.max(span.start_time));
        (end, self.seal(end))
    }

    /// Seals and immediately reopens the same context, for example when the active work item
    /// changes.
    pub fn reopen(
        &mut self,
        session_id: &Arc<str>,
        work_item_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> Vec<SpanChange> {
        let Some(context) = self.open.as_ref().map(ActivitySpan::context) else {
            return vec![];
        };
        let mut changes = self.seal(at).into_iter().collect::<Vec<_>>();
        changes.push(self.open(session_id, &context, work_item_id, at));
        changes
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{DateTime, Duration, TimeZone, Utc};

    use crate::daemon::storage::entities::SpanContext;

    use super::{SpanAggregator, SpanChange};

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 2, 10, 0, 0).unwrap() + Duration::seconds(seconds)
    }

    fn context(title: &str, project: Option<&str>) -> SpanContext {
        SpanContext {
            app_name: "/usr/bin/code".into(),
            window_title: title.into(),
            project_path: project.map(Into::into),
        }
    }

    #[test]
    fn test_same_key_extends_and_new_key_splits_at_tick() {
        let session: Arc<str> = "s".into();
        let mut aggregator = SpanAggregator::default();
        let project = Some("/src/worktally");

        assert_eq!(
            aggregator
                .fold(&session, &context("main.rs", project), None, at(0))
                .len(),
            1
        );
        assert!(aggregator
            .fold(&session, &context("lib.rs", project), None, at(1))
            .is_empty());
        assert_eq!(aggregator.open_span().unwrap().duration_seconds, 1);

        let changes = aggregator.fold(&session, &context("notes", None), None, at(3));
        let [SpanChange::Sealed(sealed), SpanChange::Opened(opened)] = changes.as_slice() else {
            panic!("expected seal and open, got {changes:?}");
        };
        assert_eq!(sealed.end_time, Some(at(3)));
        assert_eq!(sealed.duration_seconds, 3);
        assert_eq!(opened.start_time, at(3));
    }

    #[test]
    fn test_idle_seal_is_clamped_to_last_seen_tick() {
        let session: Arc<str> = "s".into();
        let mut aggregator = SpanAggregator::default();
        aggregator.fold(&session, &context("a", None), None, at(0));
        aggregator.extend(at(10));

        let (end, change) = aggregator.seal_idle(at(400));
        assert_eq!(end, at(10));
        assert!(matches!(change, Some(SpanChange::Sealed(span)) if span.duration_seconds == 10));

        aggregator.fold(&session, &context("a", None), None, at(500));
        let (end, change) = aggregator.seal_idle(at(100));
        assert_eq!(end, at(500));
        assert!(matches!(change, Some(SpanChange::Discarded(_))));
    }

    #[test]
    fn test_reopen_keeps_context_and_swaps_work_item() {
        let session: Arc<str> = "s".into();
        let mut aggregator = SpanAggregator::default();
        aggregator.fold(&session, &context("a", None), None, at(0));

        let changes = aggregator.reopen(&session, Some("GH-3"), at(5));
        assert_eq!(changes.len(), 2);
        let open = aggregator.open_span().unwrap();
        assert_eq!(open.window_title.as_ref(), "a");
        assert_eq!(open.work_item_id.as_deref(), Some("GH-3"));
        assert_eq!(open.start_time, at(5));
    }
}
