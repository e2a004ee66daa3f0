use std::{collections::HashMap, path::Path, sync::Arc};

use chrono::{DateTime, Utc};
use fs4::tokio::AsyncFileExt;
use serde::{Deserialize, Serialize};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::error::TrackerError;

use super::{
    entities::{
        ActivitySpan, Session, SessionIssueLink, SessionOutcome, SpanAnnotation, WorkItem,
    },
    OpenSessionRecord, Store,
};

pub const JOURNAL_FILE: &str = "journal.jsonl";

/// One line of the journal. Each variant carries everything needed to replay it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalEntry {
    InsertSpan {
        span: ActivitySpan,
    },
    SealSpan {
        span_id: Uuid,
        end_time: DateTime<Utc>,
        duration_seconds: i64,
    },
    CheckpointSpan {
        span_id: Uuid,
        seen_at: DateTime<Utc>,
    },
    DiscardSpan {
        span_id: Uuid,
    },
    AnnotateSpan {
        span_id: Uuid,
        annotation: SpanAnnotation,
    },
    UpsertSession {
        session: Session,
    },
    AppendOutcome {
        outcome: SessionOutcome,
    },
    UpsertLink {
        link: SessionIssueLink,
    },
}

/// Materialized view of the journal.
#[derive(Debug, Default)]
struct JournalIndex {
    sessions: HashMap<Arc<str>, Session>,
    spans: HashMap<Uuid, ActivitySpan>,
    spans_by_session: HashMap<Arc<str>, Vec<Uuid>>,
    checkpoints: HashMap<Uuid, DateTime<Utc>>,
    outcomes: Vec<SessionOutcome>,
    links: Vec<SessionIssueLink>,
    /// Sealed seconds per work item, kept current as spans change.
    work_item_seconds: HashMap<String, i64>,
}

impl JournalIndex {
    /// Checks that an entry refers to things the index knows about.
    fn validate(&self, entry: &JournalEntry) -> Result<(), TrackerError> {
        let span_id = match entry {
            JournalEntry::SealSpan { span_id, .. }
            | JournalEntry::CheckpointSpan { span_id, .. }
            | JournalEntry::DiscardSpan { span_id }
            | JournalEntry::AnnotateSpan { span_id, .. } => span_id,
            _ => return Ok(()),
        };
        if self.spans.contains_key(span_id) {
            Ok(())
        } else {
            Err(TrackerError::not_found("span", &span_id.to_string()))
        }
    }

    fn credit(&mut self, span_id: &Uuid, sign: i64) {
        let Some(span) = self.spans.get(span_id) else {
            return;
        };
        if let (false, Some(item)) = (span.is_open(), &span.work_item_id) {
            *self.work_item_seconds.entry(item.clone()).or_default() +=
                sign * span.duration_seconds;
        }
    }

    /// Mutates a span while keeping the work item totals in step.
    fn update_span(&mut self, span_id: &Uuid, update: impl FnOnce(&mut ActivitySpan)) {
        self.credit(span_id, -1);
        if let Some(span) = self.spans.get_mut(span_id) {
            update(span);
        }
        self.credit(span_id, 1);
    }

    fn apply(&mut self, entry: JournalEntry) {
        match entry {
            JournalEntry::InsertSpan { span } => {
                self.spans_by_session
                    .entry(span.session_id.clone())
                    .or_default()
                    .push(span.id);
                let span_id = span.id;
                self.spans.insert(span_id, span);
                self.credit(&span_id, 1);
            }
            JournalEntry::SealSpan {
                span_id,
                end_time,
                duration_seconds,
            } => {
                self.update_span(&span_id, |span| {
                    span.end_time = Some(end_time);
                    span.duration_seconds = duration_seconds;
                });
                self.checkpoints.remove(&span_id);
            }
            JournalEntry::CheckpointSpan { span_id, seen_at } => {
                self.update_span(&span_id, |span| span.touch(seen_at));
                self.checkpoints.insert(span_id, seen_at);
            }
            JournalEntry::DiscardSpan { span_id } => {
                self.credit(&span_id, -1);
                if let Some(span) = self.spans.remove(&span_id) {
                    if let Some(ids) = self.spans_by_session.get_mut(&span.session_id) {
                        ids.retain(|id| *id != span_id);
                    }
                }
                self.checkpoints.remove(&span_id);
            }
            JournalEntry::AnnotateSpan {
                span_id,
                annotation,
            } => {
                self.update_span(&span_id, |span| {
                    if annotation.category.is_some() {
                        span.category = annotation.category;
                    }
                    if annotation.work_item_id.is_some() {
                        span.work_item_id = annotation.work_item_id;
                    }
                });
            }
            JournalEntry::UpsertSession { session } => {
                self.sessions.insert(session.id.clone(), session);
            }
            JournalEntry::AppendOutcome { outcome } => {
                if !self.outcomes.iter().any(|v| v.same_key(&outcome)) {
                    self.outcomes.push(outcome);
                }
            }
            JournalEntry::UpsertLink { link } => {
                match self.links.iter_mut().find(|v| v.same_key(&link)) {
                    Some(existing) => existing.merge(&link),
                    None => self.links.push(link),
                }
            }
        }
    }

    /// Smallest list of entries that replays into this index: the latest state of every session
    /// and span, one checkpoint per open span, then outcomes and links.
    fn snapshot(&self) -> Vec<JournalEntry> {
        let mut sessions = self.sessions.values().collect::<Vec<_>>();
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        let mut spans = self.spans.values().collect::<Vec<_>>();
        spans.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.id.cmp(&b.id)));
        let mut checkpoints = self.checkpoints.iter().collect::<Vec<_>>();
        checkpoints.sort();

        sessions
            .into_iter()
            .map(|session| JournalEntry::UpsertSession {
                session: session.clone(),
            })
            .chain(
                spans
                    .into_iter()
                    .map(|span| JournalEntry::InsertSpan { span: span.clone() }),
            )
            .chain(
                checkpoints
                    .into_iter()
                    .map(|(span_id, seen_at)| JournalEntry::CheckpointSpan {
                        span_id: *span_id,
                        seen_at: *seen_at,
                    }),
            )
            .chain(
                self.outcomes
                    .iter()
                    .map(|outcome| JournalEntry::AppendOutcome {
                        outcome: outcome.clone(),
                    }),
            )
            .chain(
                self.links
                    .iter()
                    .map(|link| JournalEntry::UpsertLink { link: link.clone() }),
            )
            .collect()
    }

    fn spans_of(&self, session_id: &str) -> Vec<ActivitySpan> {
        let mut spans = self
            .spans_by_session
            .get(session_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.spans.get(id).cloned())
            .collect::<Vec<_>>();
        spans.sort_by_key(|v| v.start_time);
        spans
    }
}

struct Replayed {
    index: JournalIndex,
    /// Length of the prefix made of complete lines.
    valid_len: usize,
    entries: usize,
}

/// Replays raw journal bytes. Only an unterminated last line counts as a torn write; a complete
/// line that doesn't parse or replay means the journal can't be trusted.
fn replay(bytes: &[u8]) -> Result<Replayed, TrackerError> {
    let mut index = JournalIndex::default();
    let mut offset = 0usize;
    let mut line_number = 0usize;
    let mut entries = 0usize;

    while offset < bytes.len() {
        let Some(length) = bytes[offset..].iter().position(|v| *v == b'\n') else {
            warn!(
                "Dropping torn journal entry of {} bytes at offset {offset}",
                bytes.len() - offset
            );
            break;
        };
        line_number += 1;
        let line = &bytes[offset..offset + length];
        offset += length + 1;

        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let entry = serde_json::from_slice::<JournalEntry>(line).map_err(|e| {
            TrackerError::Corrupted(format!("journal line {line_number} is unreadable: {e}"))
        })?;
        index.validate(&entry).map_err(|e| {
            TrackerError::Corrupted(format!("journal line {line_number} is inconsistent: {e}"))
        })?;
        index.apply(entry);
        entries += 1;
    }

    Ok(Replayed {
        index,
        valid_len: offset.min(bytes.len()),
        entries,
    })
}

fn encode(entries: &[JournalEntry]) -> Result<Vec<u8>, TrackerError> {
    let mut bytes = vec![];
    for entry in entries {
        serde_json::to_writer(&mut bytes, entry)?;
        bytes.push(b'\n');
    }
    Ok(bytes)
}

/// The main realization of [Store]. Appends JSON lines to a single journal file and serves reads
/// from the replayed index. Superseded entries are compacted away each time the journal is opened.
pub struct JournalStore {
    file: File,
    valid_len: u64,
    index: JournalIndex,
}

impl JournalStore {
    pub async fn open(store_dir: &Path) -> Result<Self, TrackerError> {
        tokio::fs::create_dir_all(store_dir).await?;
        let path = store_dir.join(JOURNAL_FILE);

        let mut file = Self::open_file(&path).await?;
        file.lock_shared()?;
        let mut bytes = vec![];
        let read = file.read_to_end(&mut bytes).await;
        file.unlock_async().await?;
        read?;

        let Replayed {
            index,
            mut valid_len,
            entries,
        } = replay(&bytes)?;
        let snapshot = index.snapshot();
        if snapshot.len() < entries {
            drop(file);
            valid_len = Self::compact(&path, &snapshot).await?;
            file = Self::open_file(&path).await?;
            debug!("Compacted journal from {entries} to {} entries", snapshot.len());
        } else if valid_len < bytes.len() {
            file.set_len(valid_len as u64).await?;
        }
        debug!(
            "Opened journal {path:?} with {} sessions and {} spans",
            index.sessions.len(),
            index.spans.len()
        );

        Ok(Self {
            file,
            valid_len: valid_len as u64,
            index,
        })
    }

    async fn open_file(path: &Path) -> Result<File, std::io::Error> {
        File::options()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .await
    }

    /// Writes `snapshot` next to the journal and swaps it in. Returns the new journal length.
    async fn compact(path: &Path, snapshot: &[JournalEntry]) -> Result<usize, TrackerError> {
        let bytes = encode(snapshot)?;
        let staging = path.with_extension("jsonl.compact");

        let mut file = File::create(&staging).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&staging, path).await?;
        Ok(bytes.len())
    }

    #[instrument(skip(self), level = "debug")]
    async fn write(&mut self, entry: JournalEntry) -> Result<(), TrackerError> {
        self.index.validate(&entry)?;

        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        // Semi-safe acquire-release for a file
        self.file.lock_exclusive()?;
        let result = Self::append_line(&mut self.file, &line).await;
        let result = match result {
            Ok(()) => {
                self.valid_len += line.len() as u64;
                Ok(())
            }
            Err(e) => {
                // Cut whatever part of the line made it to disk so the next append starts clean.
                if let Err(truncate) = self.file.set_len(self.valid_len).await {
                    warn!("Failed to roll back partial journal write {truncate:?}");
                }
                Err(e)
            }
        };
        self.file.unlock_async().await?;
        result?;

        self.index.apply(entry);
        Ok(())
    }

    async fn append_line(file: &mut File, line: &[u8]) -> Result<(), std::io::Error> {
        file.write_all(line).await?;
        file.flush().await?;
        file.sync_data().await
    }
}

impl Store for JournalStore {
    async fn insert_span(&mut self, span: &ActivitySpan) -> Result<(), TrackerError> {
        self.write(JournalEntry::InsertSpan { span: span.clone() })
            .await
    }

    async fn seal_span(&mut self, span: &ActivitySpan) -> Result<(), TrackerError> {
        let Some(end_time) = span.end_time else {
            return Err(TrackerError::Conflict(format!(
                "span {} has no end time to seal with",
                span.id
            )));
        };
        self.write(JournalEntry::SealSpan {
            span_id: span.id,
            end_time,
            duration_seconds: span.duration_seconds,
        })
        .await
    }

    async fn checkpoint_span(
        &mut self,
        span_id: Uuid,
        seen_at: DateTime<Utc>,
    ) -> Result<(), TrackerError> {
        self.write(JournalEntry::CheckpointSpan { span_id, seen_at })
            .await
    }

    async fn discard_span(&mut self, span_id: Uuid) -> Result<(), TrackerError> {
        self.write(JournalEntry::DiscardSpan { span_id }).await
    }

    async fn annotate_span(
        &mut self,
        span_id: Uuid,
        annotation: &SpanAnnotation,
    ) -> Result<(), TrackerError> {
        self.write(JournalEntry::AnnotateSpan {
            span_id,
            annotation: annotation.clone(),
        })
        .await
    }

    async fn upsert_session(&mut self, session: &Session) -> Result<(), TrackerError> {
        if self.index.sessions.get(&session.id) == Some(session) {
            return Ok(());
        }
        self.write(JournalEntry::UpsertSession {
            session: session.clone(),
        })
        .await
    }

    async fn append_outcome(&mut self, outcome: &SessionOutcome) -> Result<bool, TrackerError> {
        if self.index.outcomes.iter().any(|v| v.same_key(outcome)) {
            return Ok(false);
        }
        self.write(JournalEntry::AppendOutcome {
            outcome: outcome.clone(),
        })
        .await?;
        Ok(true)
    }

    async fn upsert_link(
        &mut self,
        link: &SessionIssueLink,
    ) -> Result<SessionIssueLink, TrackerError> {
        let merged = match self.index.links.iter().find(|v| v.same_key(link)) {
            Some(existing) if existing.relationship >= link.relationship => {
                return Ok(existing.clone())
            }
            Some(existing) => {
                let mut merged = existing.clone();
                merged.merge(link);
                merged
            }
            None => link.clone(),
        };
        self.write(JournalEntry::UpsertLink {
            link: merged.clone(),
        })
        .await?;
        Ok(merged)
    }

    async fn load_open_session_on_startup(
        &mut self,
    ) -> Result<Option<OpenSessionRecord>, TrackerError> {
        let open = self
            .index
            .sessions
            .values()
            .filter(|v| v.is_open())
            .min_by_key(|v| v.started_at)
            .cloned();

        Ok(open.map(|session| {
            let spans = self.index.spans_of(&session.id);
            let last_checkpoint = spans
                .iter()
                .rev()
                .find(|v| v.is_open())
                .and_then(|v| self.index.checkpoints.get(&v.id).copied());
            OpenSessionRecord {
                session,
                spans,
                last_checkpoint,
            }
        }))
    }

    async fn session(&self, id: &str) -> Result<Option<Session>, TrackerError> {
        Ok(self.index.sessions.get(id).cloned())
    }

    async fn session_spans(&self, id: &str) -> Result<Vec<ActivitySpan>, TrackerError> {
        Ok(self.index.spans_of(id))
    }

    async fn session_outcomes(&self, id: &str) -> Result<Vec<SessionOutcome>, TrackerError> {
        Ok(self
            .index
            .outcomes
            .iter()
            .filter(|v| &*v.session_id == id)
            .cloned()
            .collect())
    }

    async fn session_links(&self, id: &str) -> Result<Vec<SessionIssueLink>, TrackerError> {
        Ok(self
            .index
            .links
            .iter()
            .filter(|v| &*v.session_id == id)
            .cloned()
            .collect())
    }

    async fn work_item(&self, issue_id: &str) -> Result<Option<WorkItem>, TrackerError> {
        let Some(link) = self.index.links.iter().find(|v| v.issue_id == issue_id) else {
            return Ok(None);
        };
        let accumulated_seconds = self
            .index
            .work_item_seconds
            .get(issue_id)
            .copied()
            .unwrap_or_default();
        Ok(Some(WorkItem {
            issue_id: link.issue_id.clone(),
            system: link.system.clone(),
            accumulated_seconds,
        }))
    }
}
