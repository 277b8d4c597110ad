//! History Ledger
//!
//! Append-only, sled-backed record of terminal tasks. Entries are keyed by a
//! big-endian sequence number so a reverse scan yields newest-first order.
//! `purge` is the only way an entry is ever removed.

use crate::artifact::ArtifactStore;
use crate::error::StorageError;
use crate::queue::task::{Task, TaskState};
use crate::request::{DimensionPolicy, ResolutionTier};
use crate::types::{ArtifactRef, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
};
use sled::{Db, Transactional, Tree};
use std::collections::HashSet;
use tracing::{debug, info};

const TREE_ENTRIES: &str = "history_entries";
const TREE_INDEX: &str = "history_index";
const TREE_META: &str = "history_meta";
const NEXT_SEQ_KEY: &[u8] = b"next_seq";

/// Longest prompt kept for display, ellipsis included.
pub const PROMPT_PREVIEW_CHARS: usize = 80;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub seq: u64,
    pub task_id: TaskId,
    pub state: TaskState,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
    pub artifacts: Vec<ArtifactRef>,
    /// Primary and reference images the task was submitted with.
    #[serde(default)]
    pub inputs: Vec<ArtifactRef>,
    pub prompt_preview: String,
    /// Full prompt, searched by [`HistoryFilter::prompt_contains`].
    #[serde(default)]
    pub prompt: String,
    pub attempts: u32,
    /// First dispatch to terminal state.
    #[serde(default)]
    pub elapsed_ms: Option<u64>,
    pub resolution: ResolutionTier,
    /// "Auto" for adaptive requests, otherwise the fixed ratio.
    pub aspect: String,
}

impl HistoryEntry {
    fn from_task(task: &Task, seq: u64) -> Self {
        Self {
            seq,
            task_id: task.id,
            state: task.state,
            reason: task.reason(),
            created_at: task.created_at,
            recorded_at: Utc::now(),
            artifacts: task.artifacts.clone(),
            inputs: task.request.input_images().copied().collect(),
            prompt_preview: truncate_prompt(&task.request.prompt),
            prompt: task.request.prompt.trim().to_string(),
            attempts: task.attempts,
            elapsed_ms: task.elapsed_ms(),
            resolution: task.request.resolution,
            aspect: match task.request.dimension {
                DimensionPolicy::Adaptive => "Auto".to_string(),
                DimensionPolicy::Fixed(ratio) => ratio.label().to_string(),
            },
        }
    }

    /// Entries written before the full prompt was stored only have the preview.
    fn searchable_prompt(&self) -> &str {
        if self.prompt.is_empty() {
            &self.prompt_preview
        } else {
            &self.prompt
        }
    }

    fn references(&self, artifact: &ArtifactRef) -> bool {
        self.artifacts.contains(artifact) || self.inputs.contains(artifact)
    }
}

/// Truncate to [`PROMPT_PREVIEW_CHARS`] characters, marking truncation with an ellipsis.
pub fn truncate_prompt(prompt: &str) -> String {
    let prompt = prompt.trim();
    if prompt.chars().count() <= PROMPT_PREVIEW_CHARS {
        return prompt.to_string();
    }
    let mut preview: String = prompt.chars().take(PROMPT_PREVIEW_CHARS - 1).collect();
    preview.push('…');
    preview
}

/// Query filter. All set conditions must match.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub state: Option<TaskState>,
    pub since: Option<DateTime<Utc>>,
    /// Case-insensitive substring of the full prompt.
    pub prompt_contains: Option<String>,
    pub limit: Option<usize>,
}

impl HistoryFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn state(mut self, state: TaskState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn prompt_contains(mut self, needle: impl Into<String>) -> Self {
        self.prompt_contains = Some(needle.into().to_lowercase());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, entry: &HistoryEntry) -> bool {
        if let Some(state) = self.state {
            if entry.state != state {
                return false;
            }
        }
        if let Some(since) = self.since {
            if entry.recorded_at < since {
                return false;
            }
        }
        if let Some(needle) = &self.prompt_contains {
            if !entry.searchable_prompt().to_lowercase().contains(needle.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Lazy newest-first cursor over the ledger.
pub struct HistoryIter {
    inner: std::iter::Rev<sled::Iter>,
    filter: HistoryFilter,
    yielded: usize,
    failed: bool,
}

impl Iterator for HistoryIter {
    type Item = Result<HistoryEntry, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.filter.limit.is_some_and(|limit| self.yielded >= limit) {
            return None;
        }
        loop {
            let (_, raw) = match self.inner.next()? {
                Ok(kv) => kv,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e.into()));
                }
            };
            let entry: HistoryEntry = match serde_json::from_slice(&raw) {
                Ok(entry) => entry,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e.into()));
                }
            };
            if self.filter.matches(&entry) {
                self.yielded += 1;
                return Some(Ok(entry));
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub entry_removed: bool,
    pub artifacts_removed: Vec<ArtifactRef>,
    /// Artifacts left in place because another entry still references them.
    pub artifacts_kept: Vec<ArtifactRef>,
}

enum RecordAbort {
    Duplicate,
    Serialize(String),
}

#[derive(Clone)]
pub struct HistoryLedger {
    entries: Tree,
    index: Tree,
    meta: Tree,
}

impl HistoryLedger {
    pub fn open(db: &Db) -> Result<Self, StorageError> {
        Ok(Self {
            entries: db.open_tree(TREE_ENTRIES)?,
            index: db.open_tree(TREE_INDEX)?,
            meta: db.open_tree(TREE_META)?,
        })
    }

    /// Record a terminal task. A task can be recorded only once.
    pub fn record(&self, task: &Task) -> Result<HistoryEntry, StorageError> {
        if !task.is_terminal() {
            return Err(StorageError::InvalidState(format!(
                "task {} is {}, not terminal",
                task.id, task.state
            )));
        }

        let task_key = task.id.as_bytes();
        let result = (&self.entries, &self.index, &self.meta).transaction(
            |(entries, index, meta)| -> ConflictableTransactionResult<HistoryEntry, RecordAbort> {
                if index.get(&task_key[..])?.is_some() {
                    return Err(ConflictableTransactionError::Abort(RecordAbort::Duplicate));
                }
                let seq = meta
                    .get(NEXT_SEQ_KEY)?
                    .map(|raw| decode_seq(&raw))
                    .unwrap_or(0);
                let entry = HistoryEntry::from_task(task, seq);
                let value = serde_json::to_vec(&entry).map_err(|e| {
                    ConflictableTransactionError::Abort(RecordAbort::Serialize(e.to_string()))
                })?;
                let seq_key = seq.to_be_bytes();
                meta.insert(NEXT_SEQ_KEY, &(seq + 1).to_be_bytes()[..])?;
                entries.insert(&seq_key[..], value)?;
                index.insert(&task_key[..], &seq_key[..])?;
                Ok(entry)
            },
        );

        let entry = result.map_err(|err| match err {
            TransactionError::Abort(RecordAbort::Duplicate) => StorageError::AlreadyRecorded(task.id),
            TransactionError::Abort(RecordAbort::Serialize(msg)) => StorageError::Serialization(msg),
            TransactionError::Storage(e) => StorageError::from(e),
        })?;
        self.entries.flush()?;

        debug!(
            task_id = %entry.task_id,
            seq = entry.seq,
            state = %entry.state,
            "Recorded history entry"
        );
        Ok(entry)
    }

    /// Fresh newest-first cursor. Each call starts from the latest entry.
    pub fn query(&self, filter: HistoryFilter) -> HistoryIter {
        HistoryIter {
            inner: self.entries.iter().rev(),
            filter,
            yielded: 0,
            failed: false,
        }
    }

    pub fn get(&self, task_id: &TaskId) -> Result<Option<HistoryEntry>, StorageError> {
        let Some(seq) = self.index.get(task_id.as_bytes())? else {
            return Ok(None);
        };
        let Some(raw) = self.entries.get(seq)? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    pub fn contains(&self, task_id: &TaskId) -> Result<bool, StorageError> {
        Ok(self.index.contains_key(task_id.as_bytes())?)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove an entry and, if asked, the artifacts no remaining entry references.
    pub fn purge(
        &self,
        task_id: &TaskId,
        remove_artifacts: bool,
        store: &ArtifactStore,
    ) -> Result<PurgeReport, StorageError> {
        let Some(entry) = self.get(task_id)? else {
            return Ok(PurgeReport::default());
        };

        let seq_key = entry.seq.to_be_bytes();
        (&self.entries, &self.index)
            .transaction(|(entries, index)| -> ConflictableTransactionResult<(), ()> {
                entries.remove(&seq_key[..])?;
                index.remove(task_id.as_bytes().as_slice())?;
                Ok(())
            })
            .map_err(|err| match err {
                TransactionError::Abort(()) => {
                    StorageError::Database("history purge aborted".to_string())
                }
                TransactionError::Storage(e) => StorageError::from(e),
            })?;
        self.entries.flush()?;

        let mut report = PurgeReport {
            entry_removed: true,
            ..PurgeReport::default()
        };

        if remove_artifacts {
            let candidates: HashSet<ArtifactRef> = entry.artifacts.iter().copied().collect();
            let mut still_referenced = HashSet::new();
            for remaining in self.query(HistoryFilter::all()) {
                let remaining = remaining?;
                for artifact in &candidates {
                    if remaining.references(artifact) {
                        still_referenced.insert(*artifact);
                    }
                }
            }

            for artifact in entry.artifacts.iter() {
                if still_referenced.contains(artifact) {
                    report.artifacts_kept.push(*artifact);
                } else if store.purge(artifact)? {
                    report.artifacts_removed.push(*artifact);
                }
            }
        }

        info!(
            task_id = %task_id,
            artifacts_removed = report.artifacts_removed.len(),
            artifacts_kept = report.artifacts_kept.len(),
            "Purged history entry"
        );
        Ok(report)
    }
}

fn decode_seq(raw: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let len = raw.len().min(8);
    buf[8 - len..].copy_from_slice(&raw[raw.len() - len..]);
    u64::from_be_bytes(buf)
}
