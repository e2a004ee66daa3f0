//! Startup and teardown guards: the per-user instance lock and recovery of sessions a previous
//! run left open.

use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use chrono::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, info, warn};

use crate::{
    daemon::storage::{
        entities::{EndReason, Session},
        OpenSessionRecord, Store,
    },
    error::TrackerError,
};

pub fn is_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).is_some()
}

/// Pid recorded in the marker. A missing or unreadable marker counts as no owner.
pub fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Pid of the daemon that currently owns the marker, if it is still alive.
pub fn running_pid(path: &Path) -> Option<u32> {
    read_pid(path).filter(|pid| is_alive(*pid))
}

/// Fails when a live daemon other than this process owns the marker. Leaves the marker alone, so
/// it suits a check made before forking, ahead of [InstanceLock::acquire].
pub fn ensure_not_running(path: &Path) -> Result<(), TrackerError> {
    match running_pid(path) {
        Some(pid) if pid != std::process::id() => Err(TrackerError::AlreadyRunning { pid }),
        _ => Ok(()),
    }
}

/// PID marker guaranteeing a single daemon per application directory. The marker is removed when
/// the lock is released or dropped, but only while it still names this process.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    pid: u32,
    released: bool,
}

impl InstanceLock {
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, TrackerError> {
        let path = path.into();
        let own = std::process::id();

        match read_pid(&path) {
            Some(pid) if pid != own && is_alive(pid) => {
                return Err(TrackerError::AlreadyRunning { pid })
            }
            Some(pid) => {
                warn!("Reclaiming stale pid marker of {pid}");
                remove_if_exists(&path)?;
            }
            None if path.exists() => {
                warn!("Pid marker {path:?} is unreadable, reclaiming it");
                remove_if_exists(&path)?;
            }
            None => (),
        }

        // Two daemons racing past the check above still can't both create the marker.
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let pid = read_pid(&path).unwrap_or_default();
                return Err(TrackerError::AlreadyRunning { pid });
            }
            Err(e) => return Err(e.into()),
        };
        writeln!(file, "{own}")?;
        file.sync_all()?;
        info!("Acquired instance lock {path:?} for pid {own}");

        Ok(Self {
            path,
            pid: own,
            released: false,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn release(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if read_pid(&self.path) != Some(self.pid) {
            debug!("Pid marker no longer belongs to this process, leaving it");
            return;
        }
        if let Err(e) = remove_if_exists(&self.path) {
            warn!("Failed to remove pid marker {:?} {e:?}", self.path);
        }
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        self.remove();
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Ends every session a previous run left open with [EndReason::Recovered].
///
/// The trailing open span is sealed at its last progress checkpoint, other open spans at the
/// duration recorded for them. Spans that never got past their start are discarded. The session
/// ends where its last span ends, so nothing is counted for the time the daemon was down.
pub async fn recover_open_session(store: &mut impl Store) -> Result<Vec<Session>, TrackerError> {
    let mut recovered = vec![];
    while let Some(record) = store.load_open_session_on_startup().await? {
        let OpenSessionRecord {
            mut session,
            spans,
            last_checkpoint,
        } = record;
        let trailing = spans.iter().rposition(|v| v.is_open());
        let mut end = session.started_at;
        let mut active_seconds = 0;

        for (index, mut span) in spans.into_iter().enumerate() {
            if let Some(sealed_at) = span.end_time {
                end = end.max(sealed_at);
                active_seconds += span.duration_seconds;
                continue;
            }
            let recorded = span.start_time + Duration::seconds(span.duration_seconds);
            let seen_at = match last_checkpoint {
                Some(checkpoint) if Some(index) == trailing => checkpoint.max(recorded),
                _ => recorded,
            };
            if seen_at <= span.start_time {
                debug!(span_id = %span.id, "Discarding span without recorded progress");
                store.discard_span(span.id).await?;
                continue;
            }
            span.seal(seen_at);
            store.seal_span(&span).await?;
            end = end.max(seen_at);
            active_seconds += span.duration_seconds;
        }

        session.active_seconds = active_seconds;
        session.end(end, EndReason::Recovered);
        store.upsert_session(&session).await?;
        warn!(session_id = %session.id, ended_at = %end, "Recovered session left open by a previous run");
        recovered.push(session);
    }
    Ok(recovered)
}
