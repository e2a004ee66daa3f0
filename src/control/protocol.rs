//! Wire schema of the control socket. Each frame is one JSON object on one line; a connection
//! carries one or a few request/response exchanges.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use crate::error::ErrorKind;
use crate::{
    daemon::storage::entities::{
        ActivitySpan, IssueRelationship, OutcomeType, Session, SessionIssueLink, SessionOutcome,
        WorkItem,
    },
    error::TrackerError,
};

pub const MAX_REQUEST_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum Request {
    #[serde(rename = "status")]
    Status,
    #[serde(rename = "start")]
    Start {
        #[serde(default)]
        project: Option<String>,
    },
    #[serde(rename = "stop")]
    Stop,
    #[serde(rename = "pause")]
    Pause,
    #[serde(rename = "resume")]
    Resume,
    #[serde(rename = "work-on")]
    WorkOn { work_item_id: String },
    #[serde(rename = "work-off")]
    WorkOff,
    #[serde(rename = "session.start")]
    SessionStart {
        id: String,
        #[serde(default)]
        project: Option<String>,
    },
    #[serde(rename = "session.end")]
    SessionEnd {
        id: String,
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(rename = "session.link")]
    SessionLink {
        id: String,
        issue_id: String,
        system: String,
        relationship: IssueRelationship,
    },
    #[serde(rename = "session.outcome")]
    SessionOutcome {
        id: String,
        #[serde(rename = "type")]
        kind: OutcomeType,
        #[serde(default)]
        reference: Option<String>,
        description: String,
    },
}

impl Request {
    /// Reads don't go through the engine queue.
    pub fn is_read(&self) -> bool {
        matches!(self, Request::Status)
    }

    /// Rejects identifiers that deserialize fine but can't name anything.
    fn validate(self) -> Result<Self, TrackerError> {
        let fields: Vec<(&str, &str)> = match &self {
            Request::WorkOn { work_item_id } => vec![("work_item_id", work_item_id.as_str())],
            Request::SessionStart { id, .. }
            | Request::SessionEnd { id, .. }
            | Request::SessionOutcome { id, .. } => vec![("id", id.as_str())],
            Request::SessionLink {
                id,
                issue_id,
                system,
                ..
            } => vec![
                ("id", id.as_str()),
                ("issue_id", issue_id.as_str()),
                ("system", system.as_str()),
            ],
            _ => vec![],
        };
        let blank = fields
            .into_iter()
            .find(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| name.to_string());
        match blank {
            Some(name) => Err(TrackerError::InvalidRequest(format!(
                "'{name}' must not be empty"
            ))),
            None => Ok(self),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Running,
    /// The store reported corruption. Reads keep working, writes are refused.
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub session: Session,
    pub outcomes: Vec<SessionOutcome>,
    pub links: Vec<SessionIssueLink>,
    /// Sum of the sealed spans plus the running time of the open one.
    pub tracked_seconds: i64,
    /// Idle time inside the session, including the idle stretch in progress.
    pub idle_seconds: i64,
}

/// Point-in-time view of the engine, published after every applied message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub health: Health,
    #[serde(default)]
    pub degraded_reason: Option<String>,
    pub session: Option<SessionStatus>,
    pub open_span: Option<ActivitySpan>,
    pub work_item: Option<WorkItem>,
    pub idle: bool,
    pub pending_writes: usize,
    pub last_observation_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    Status(StatusReport),
    Session(Session),
    Outcome {
        outcome: SessionOutcome,
        /// False when the same outcome was already recorded.
        created: bool,
    },
    Link(SessionIssueLink),
    WorkItem { work_item: Option<WorkItem> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&TrackerError> for ErrorInfo {
    fn from(value: &TrackerError) -> Self {
        Self {
            kind: value.kind(),
            message: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Reply>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl Response {
    pub fn ok(reply: Reply) -> Self {
        Self {
            ok: true,
            result: Some(reply),
            error: None,
        }
    }

    pub fn error(error: &TrackerError) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn into_result(self) -> Result<Reply, ErrorInfo> {
        match (self.ok, self.result, self.error) {
            (true, Some(reply), _) => Ok(reply),
            (false, _, Some(error)) => Err(error),
            _ => Err(ErrorInfo {
                kind: ErrorKind::InvalidRequest,
                message: "response carries neither a result nor an error".into(),
            }),
        }
    }
}

impl From<Result<Reply, TrackerError>> for Response {
    fn from(value: Result<Reply, TrackerError>) -> Self {
        match value {
            Ok(reply) => Response::ok(reply),
            Err(e) => Response::error(&e),
        }
    }
}

/// Parses one request frame.
pub fn parse_request(line: &[u8]) -> Result<Request, TrackerError> {
    if line.len() > MAX_REQUEST_BYTES {
        return Err(TrackerError::InvalidRequest(format!(
            "request of {} bytes exceeds the {MAX_REQUEST_BYTES} byte limit",
            line.len()
        )));
    }
    serde_json::from_slice::<Request>(line)
        .map_err(|e| TrackerError::InvalidRequest(e.to_string()))?
        .validate()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::{
        daemon::storage::entities::{IssueRelationship, OutcomeType},
        error::{ErrorKind, TrackerError},
    };

    use super::{parse_request, Request, Response};

    #[test]
    fn test_commands_use_their_wire_names() {
        let request = parse_request(
            br#"{"command":"session.outcome","id":"s1","type":"commit","reference":"abc123","description":"fix"}"#,
        )
        .unwrap();
        assert_eq!(
            request,
            Request::SessionOutcome {
                id: "s1".into(),
                kind: OutcomeType::Commit,
                reference: Some("abc123".into()),
                description: "fix".into(),
            }
        );

        let request = parse_request(br#"{"command":"work-on","work_item_id":"GH-1"}"#).unwrap();
        assert_eq!(
            request,
            Request::WorkOn {
                work_item_id: "GH-1".into()
            }
        );

        let request = serde_json::to_value(Request::SessionLink {
            id: "s1".into(),
            issue_id: "GH-1".into(),
            system: "github".into(),
            relationship: IssueRelationship::WorkedOn,
        })
        .unwrap();
        assert_eq!(request["command"], "session.link");
        assert_eq!(request["relationship"], "worked_on");
    }

    #[test]
    fn test_malformed_frames_are_invalid_requests() {
        for frame in [
            &br#"{"command":"teleport"}"#[..],
            br#"{"command":"work-on"}"#,
            br#"{"command":"session.end","id":"  "}"#,
            b"not json",
        ] {
            let error = parse_request(frame).unwrap_err();
            assert_eq!(error.kind(), ErrorKind::InvalidRequest, "{frame:?}");
        }
    }

    #[test]
    fn test_error_response_shape() {
        let response = Response::error(&TrackerError::not_found("session", "s9"));
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(
            value,
            json!({
                "ok": false,
                "error": { "kind": "not_found", "message": "session 's9' not found" }
            })
        );
        let error = response.into_result().unwrap_err();
        assert_eq!(error.kind, ErrorKind::NotFound);
    }
}
