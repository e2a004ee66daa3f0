use chrono::DateTime;
use chrono::Utc;

use clap::ValueEnum;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

use std::fmt::Display;
use std::sync::Arc;

/// One contiguous interval of a single activity context. Only the currently open span of the
/// currently open session has `end_time == None`.
#[derive(PartialEq, Eq, Debug, Serialize, Deserialize, Clone)]
pub struct ActivitySpan {
    pub id: Uuid,
    pub session_id: Arc<str>,
    pub app_name: Arc<str>,
    pub window_title: Arc<str>,
    #[serde(default)]
    pub project_path: Option<Arc<str>>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub work_item_id: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: i64,
}

impl ActivitySpan {
    pub fn open(
        session_id: Arc<str>,
        context: &SpanContext,
        work_item_id: Option<String>,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            app_name: context.app_name.clone(),
            window_title: context.window_title.clone(),
            project_path: context.project_path.clone(),
            category: None,
            work_item_id,
            start_time,
            end_time: None,
            duration_seconds: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }

    /// Moves the running duration forward without sealing. Used for status reporting and
    /// checkpoints.
    pub fn touch(&mut self, seen_at: DateTime<Utc>) {
        if seen_at > self.start_time {
            self.duration_seconds = (seen_at - self.start_time).num_seconds();
        }
    }

    pub fn seal(&mut self, end: DateTime<Utc>) {
        self.end_time = Some(end);
        self.duration_seconds = (end - self.start_time).num_seconds();
    }

    pub fn context(&self) -> SpanContext {
        SpanContext {
            app_name: self.app_name.clone(),
            window_title: self.window_title.clone(),
            project_path: self.project_path.clone(),
        }
    }
}

/// What the aggregator compares between ticks. Two observations belong to the same span when
/// their keys are equal.
#[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
pub struct SpanContext {
    pub app_name: Arc<str>,
    pub window_title: Arc<str>,
    pub project_path: Option<Arc<str>>,
}

impl SpanContext {
    /// App plus project path when a project is known, otherwise app plus window title. Editors
    /// change titles on every file switch, so the project is the better signature when present.
    pub fn key(&self) -> (&str, &str) {
        let signature = self
            .project_path
            .as_deref()
            .unwrap_or(self.window_title.as_ref());
        (self.app_name.as_ref(), signature)
    }
}

/// Metadata attached to a span after sealing.
#[derive(PartialEq, Eq, Debug, Serialize, Deserialize, Clone)]
pub struct SpanAnnotation {
    pub category: Option<String>,
    pub work_item_id: Option<String>,
}

#[derive(PartialEq, Eq, Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Paused,
    Ended,
}

#[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Stopped,
    IdleTimeout,
    Shutdown,
    Recovered,
    Superseded,
    OutsideWorkHours,
    Client(String),
}

impl Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndReason::Stopped => write!(f, "stopped"),
            EndReason::IdleTimeout => write!(f, "idle_timeout"),
            EndReason::Shutdown => write!(f, "shutdown"),
            EndReason::Recovered => write!(f, "recovered"),
            EndReason::Superseded => write!(f, "superseded"),
            EndReason::OutsideWorkHours => write!(f, "outside_work_hours"),
            EndReason::Client(reason) => write!(f, "{reason}"),
        }
    }
}

#[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Arc<str>,
    #[serde(default)]
    pub project: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub state: SessionState,
    #[serde(default)]
    pub end_reason: Option<EndReason>,
    /// Time covered by spans. Recorded when the session pauses or ends.
    #[serde(default)]
    pub active_seconds: i64,
    /// Time the user was idle while the session stayed open.
    #[serde(default)]
    pub idle_seconds: i64,
}

impl Session {
    pub fn start(id: Arc<str>, project: Option<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            id,
            project,
            started_at,
            ended_at: None,
            state: SessionState::Active,
            end_reason: None,
            active_seconds: 0,
            idle_seconds: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state != SessionState::Ended
    }

    pub fn end(&mut self, at: DateTime<Utc>, reason: EndReason) {
        self.ended_at = Some(at.max(self.started_at));
        self.state = SessionState::Ended;
        self.end_reason = Some(reason);
    }
}

#[derive(PartialEq, Eq, Debug, Clone, Copy, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum OutcomeType {
    Commit,
    IssueOpened,
    IssueClosed,
    PrCreated,
    PrMerged,
    FilesChanged,
}

/// A discrete artifact produced during a session. Identified by `(session_id, kind, reference)`.
#[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
pub struct SessionOutcome {
    pub session_id: Arc<str>,
    #[serde(rename = "type")]
    pub kind: OutcomeType,
    #[serde(default)]
    pub reference: Option<String>,
    pub description: String,
    pub recorded_at: DateTime<Utc>,
}

impl SessionOutcome {
    pub fn same_key(&self, other: &SessionOutcome) -> bool {
        self.session_id == other.session_id
            && self.kind == other.kind
            && self.reference == other.reference
    }
}

/// Ordered by strength, so `max` is the escalation rule for link upserts.
#[derive(
    PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy, Hash, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum IssueRelationship {
    Referenced,
    WorkedOn,
    Closed,
}

#[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
pub struct SessionIssueLink {
    pub session_id: Arc<str>,
    pub issue_id: String,
    pub system: String,
    pub relationship: IssueRelationship,
    pub linked_at: DateTime<Utc>,
}

impl SessionIssueLink {
    pub fn same_key(&self, other: &SessionIssueLink) -> bool {
        self.session_id == other.session_id
            && self.issue_id == other.issue_id
            && self.system == other.system
    }

    /// Folds a newer write for the same key into this link. The relationship only ever moves
    /// towards [IssueRelationship::Closed]; the original `linked_at` is kept.
    pub fn merge(&mut self, newer: &SessionIssueLink) {
        self.relationship = self.relationship.max(newer.relationship);
    }
}

/// External reference a span can be attributed to. `accumulated_seconds` is always recomputed
/// from spans and never written directly.
#[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub issue_id: String,
    pub system: String,
    pub accumulated_seconds: i64,
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::{IssueRelationship, SessionIssueLink, SpanContext};

    fn context(title: &str, project: Option<&str>) -> SpanContext {
        SpanContext {
            app_name: "code".into(),
            window_title: title.into(),
            project_path: project.map(Into::into),
        }
    }

    #[test]
    fn project_path_wins_over_title_in_key() {
        let a = context("main.rs - worktally", Some("/src/worktally"));
        let b = context("lib.rs - worktally", Some("/src/worktally"));
        assert_eq!(a.key(), b.key());

        let c = context("main.rs", None);
        let d = context("lib.rs", None);
        assert_ne!(c.key(), d.key());
    }

    #[test]
    fn link_merge_never_downgrades() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let mut link = SessionIssueLink {
            session_id: "s".into(),
            issue_id: "GH-1".into(),
            system: "github".into(),
            relationship: IssueRelationship::Closed,
            linked_at: at,
        };
        let weaker = SessionIssueLink {
            relationship: IssueRelationship::WorkedOn,
            linked_at: at + Duration::minutes(5),
            ..link.clone()
        };
        link.merge(&weaker);
        assert_eq!(link.relationship, IssueRelationship::Closed);
        assert_eq!(link.linked_at, at);
    }
}
