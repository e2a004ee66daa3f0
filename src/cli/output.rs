//! Human readable rendering of control replies.

use std::path::PathBuf;

use ansi_term::Colour;
use chrono::{DateTime, Local, Utc};
use serde::Serialize;

use crate::{
    control::protocol::{Health, Reply, SessionStatus, StatusReport},
    daemon::storage::entities::{ActivitySpan, Session, SessionState, WorkItem},
};

pub fn format_duration(seconds: i64) -> String {
    let seconds = seconds.max(0);
    let (hours, minutes) = (seconds / 3600, seconds / 60 % 60);
    if hours > 0 {
        format!("{hours}h{minutes}m{}s", seconds % 60)
    } else if minutes > 0 {
        format!("{minutes}m{}s", seconds % 60)
    } else {
        format!("{seconds}s")
    }
}

pub fn clean_process_name(value: &str) -> String {
    PathBuf::from(value)
        .file_name()
        .map(|v| v.to_string_lossy().to_string())
        .unwrap_or_else(|| value.to_string())
}

/// Name of a unit enum variant as it appears on the wire.
fn wire_name(value: &impl Serialize) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(ToString::to_string))
        .unwrap_or_default()
}

fn local_time(value: DateTime<Utc>) -> String {
    value.with_timezone(&Local).format("%x %H:%M:%S").to_string()
}

fn render_state(state: SessionState) -> String {
    let name = wire_name(&state);
    match state {
        SessionState::Active => Colour::Green.paint(name).to_string(),
        SessionState::Paused => Colour::Yellow.paint(name).to_string(),
        SessionState::Ended => Colour::Fixed(244).paint(name).to_string(),
    }
}

fn render_session(session: &Session) -> String {
    let mut line = format!(
        "Session {} {} since {}",
        Colour::Cyan.paint(session.id.as_ref()),
        render_state(session.state),
        local_time(session.started_at)
    );
    if let Some(project) = &session.project {
        line.push_str(&format!(" ({project})"));
    }
    if let (Some(ended_at), Some(reason)) = (session.ended_at, &session.end_reason) {
        line.push_str(&format!(", ended {} ({reason})", local_time(ended_at)));
    }
    line
}

fn render_span(span: &ActivitySpan) -> String {
    let mut line = format!(
        "{}\t{}\t{}",
        format_duration(span.duration_seconds),
        clean_process_name(&span.app_name),
        span.window_title
    );
    if let Some(work_item_id) = &span.work_item_id {
        line.push_str(&format!("\t[{work_item_id}]"));
    }
    line
}

fn render_work_item(item: &WorkItem) -> String {
    format!(
        "{} ({}) {}",
        Colour::Cyan.paint(item.issue_id.as_str()),
        item.system,
        format_duration(item.accumulated_seconds)
    )
}

fn render_session_status(status: &SessionStatus, lines: &mut Vec<String>) {
    lines.push(render_session(&status.session));
    lines.push(format!("Tracked\t{}", format_duration(status.tracked_seconds)));
    if status.idle_seconds > 0 {
        lines.push(format!("Idle\t{}", format_duration(status.idle_seconds)));
    }
    for link in &status.links {
        lines.push(format!(
            "Linked\t{} ({}) {}",
            link.issue_id,
            link.system,
            wire_name(&link.relationship)
        ));
    }
    for outcome in &status.outcomes {
        lines.push(format!(
            "Outcome\t{} {}\t{}",
            wire_name(&outcome.kind),
            outcome.reference.as_deref().unwrap_or("-"),
            outcome.description
        ));
    }
}

pub fn render_status(report: &StatusReport) -> String {
    let mut lines = vec![];
    match report.health {
        Health::Running => lines.push(format!("Daemon {}", Colour::Green.paint("running"))),
        Health::Degraded => lines.push(format!(
            "Daemon {}: {}",
            Colour::Red.bold().paint("degraded"),
            report.degraded_reason.as_deref().unwrap_or("unknown reason")
        )),
    }

    match &report.session {
        Some(status) => render_session_status(status, &mut lines),
        None => lines.push("No session".into()),
    }
    if report.idle {
        lines.push(Colour::Yellow.paint("Idle").to_string());
    }
    if let Some(span) = &report.open_span {
        lines.push(format!("Now\t{}", render_span(span)));
    }
    if let Some(item) = &report.work_item {
        lines.push(format!("Working on\t{}", render_work_item(item)));
    }
    if report.pending_writes > 0 {
        lines.push(format!(
            "{} writes waiting for the store",
            Colour::Yellow.paint(report.pending_writes.to_string())
        ));
    }
    if let Some(at) = report.last_observation_at {
        lines.push(format!("Last sample\t{}", local_time(at)));
    }
    lines.join("\n")
}

pub fn render_reply(reply: &Reply) -> String {
    match reply {
        Reply::Status(report) => render_status(report),
        Reply::Session(session) => render_session(session),
        Reply::Outcome { outcome, created } => {
            let verb = if *created { "Recorded" } else { "Already recorded" };
            format!(
                "{verb} {} {}",
                wire_name(&outcome.kind),
                outcome.reference.as_deref().unwrap_or("")
            )
            .trim_end()
            .to_string()
        }
        Reply::Link(link) => format!(
            "Linked {} ({}) as {}",
            link.issue_id,
            link.system,
            wire_name(&link.relationship)
        ),
        Reply::WorkItem { work_item } => match work_item {
            Some(item) => format!("Working on {}", render_work_item(item)),
            None => "Not working on anything".into(),
        },
    }
}
