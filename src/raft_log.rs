use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::persist;
use crate::state_machine::Command;

/// One entry of the replicated log. Indexes are 1-based and contiguous.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub command: Command,
    /// Client request id for at-most-once application of retries
    pub request_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Default)]
struct LogFile {
    entries: Vec<LogEntry>,
    snapshot_index: u64,
    snapshot_term: u64,
}

/// Append-only log with conflict truncation and a trailing snapshot marker.
///
/// Callers guard the store with the Raft state mutex; every mutation is
/// flushed to disk before the caller releases the lock and answers an RPC.
pub struct LogStore {
    entries: Vec<LogEntry>,
    snapshot_index: u64,
    snapshot_term: u64,
    path: Option<PathBuf>,
}

impl LogStore {
    pub fn new(path: Option<PathBuf>) -> Self {
        LogStore { entries: Vec::new(), snapshot_index: 0, snapshot_term: 0, path }
    }

    pub fn load(path: PathBuf) -> anyhow::Result<Self> {
        let file: LogFile = persist::load_json(&path)?.unwrap_or_default();
        log::info!(
            "loaded raft log: {} entries, snapshot at {}",
            file.entries.len(),
            file.snapshot_index
        );
        Ok(LogStore {
            entries: file.entries,
            snapshot_index: file.snapshot_index,
            snapshot_term: file.snapshot_term,
            path: Some(path),
        })
    }

    fn flush(&self) -> anyhow::Result<()> {
        if let Some(path) = &self.path {
            let file = LogFile {
                entries: self.entries.clone(),
                snapshot_index: self.snapshot_index,
                snapshot_term: self.snapshot_term,
            };
            persist::save_json(path, &file)?;
        }
        Ok(())
    }

    pub fn last_index(&self) -> u64 {
        self.entries.last().map(|e| e.index).unwrap_or(self.snapshot_index)
    }

    pub fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(self.snapshot_term)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot_index(&self) -> u64 {
        self.snapshot_index
    }

    /// Leader-side append of a fresh command.
    pub fn append(&mut self, term: u64, command: Command, request_id: Option<Uuid>) -> LogEntry {
        let entry = LogEntry {
            index: self.last_index() + 1,
            term,
            command,
            request_id,
            timestamp: Utc::now(),
        };
        self.entries.push(entry.clone());
        if let Err(e) = self.flush() {
            log::error!("failed to flush raft log: {}", e);
        }
        entry
    }

    /// Follower-side append with the Raft consistency check.
    ///
    /// Rejects unless the entry at `prev_log_index` matches `prev_log_term`.
    /// A conflicting existing entry and everything after it is discarded
    /// before the new entries are appended.
    pub fn try_append(
        &mut self,
        prev_log_index: u64,
        prev_log_term: u64,
        new_entries: &[LogEntry],
    ) -> bool {
        if prev_log_index > 0 && !self.matches(prev_log_index, prev_log_term) {
            log::debug!(
                "log consistency check failed: prev_index={} prev_term={}",
                prev_log_index,
                prev_log_term
            );
            return false;
        }

        for entry in new_entries {
            match self.term_at(entry.index) {
                Some(existing_term) if existing_term == entry.term => {
                    // Already have it
                }
                Some(_) => {
                    self.truncate_from(entry.index);
                    self.entries.push(entry.clone());
                }
                None => {
                    self.entries.push(entry.clone());
                }
            }
        }

        if let Err(e) = self.flush() {
            log::error!("failed to flush raft log: {}", e);
        }
        true
    }

    fn truncate_from(&mut self, index: u64) {
        if index <= self.snapshot_index {
            self.entries.clear();
            return;
        }
        let keep = (index - self.snapshot_index - 1) as usize;
        if keep < self.entries.len() {
            self.entries.truncate(keep);
            log::info!("raft log truncated from index {}", index);
        }
    }

    pub fn entry(&self, index: u64) -> Option<&LogEntry> {
        if index <= self.snapshot_index {
            return None;
        }
        let pos = (index - self.snapshot_index - 1) as usize;
        self.entries.get(pos)
    }

    /// Term of the entry at `index`; 0 for index 0, the snapshot term at the
    /// snapshot boundary, None when unknown.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.entry(index).map(|e| e.term)
    }

    pub fn matches(&self, index: u64, term: u64) -> bool {
        self.term_at(index) == Some(term)
    }

    pub fn entries_from(&self, start_index: u64, max_entries: usize) -> Vec<LogEntry> {
        let mut result = Vec::new();
        let mut index = start_index;
        while result.len() < max_entries {
            match self.entry(index) {
                Some(entry) => result.push(entry.clone()),
                None => break,
            }
            index += 1;
        }
        result
    }

    pub fn range(&self, start_index: u64, end_index: u64) -> Vec<LogEntry> {
        (start_index..=end_index)
            .filter_map(|i| self.entry(i).cloned())
            .collect()
    }

    /// Discard entries up to and including `last_included_index`, keeping a
    /// snapshot marker so consistency checks still work at the boundary.
    pub fn compact(&mut self, last_included_index: u64, last_included_term: u64) {
        if last_included_index <= self.snapshot_index {
            return;
        }
        let drop = (last_included_index - self.snapshot_index) as usize;
        if drop <= self.entries.len() {
            self.entries.drain(..drop);
        } else {
            self.entries.clear();
        }
        self.snapshot_index = last_included_index;
        self.snapshot_term = last_included_term;
        if let Err(e) = self.flush() {
            log::error!("failed to flush raft log after compaction: {}", e);
        }
        log::info!(
            "raft log compacted through index {} (term {})",
            last_included_index,
            last_included_term
        );
    }
}
