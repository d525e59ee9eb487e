//! The in-memory Raft log: a bounded ring of entries with an embedded snapshot
//! slot.
//!
//! The log is pure in-memory state. Durability is driven by the core, which
//! pairs every mutation here with the matching [`RaftStore`](crate::RaftStore)
//! call and uses the store's `flush` as the durability barrier.

use std::collections::VecDeque;

use crate::entry::{LogEntry, SnapshotEntry};
use crate::AppData;

/// Error returned when an append would exceed the log's capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LogFull;

/// The replicated log of a single Raft node.
///
/// Entries occupy at most `capacity` slots. The snapshot slot represents
/// everything at or before `snapshot_index`; a tail of entries at or before the
/// snapshot index may be retained so that slightly-lagging followers can catch
/// up from log entries instead of receiving a snapshot.
pub(crate) struct RaftLog<D: AppData> {
    capacity: u64,
    snapshot: SnapshotEntry<D>,
    /// Contiguous entries; the front entry's index may be at or before the
    /// snapshot index when a tail was kept through a snapshot.
    entries: VecDeque<LogEntry<D>>,
}

impl<D: AppData> RaftLog<D> {
    pub(crate) fn new(capacity: u64, snapshot: SnapshotEntry<D>) -> Self {
        Self { capacity, snapshot, entries: VecDeque::new() }
    }

    /// Rebuild a log from restored durable state.
    pub(crate) fn restore(
        capacity: u64,
        snapshot: SnapshotEntry<D>,
        entries: Vec<LogEntry<D>>,
    ) -> Self {
        let mut log = Self::new(capacity, snapshot);
        for entry in entries {
            if entry.index > log.snapshot.index {
                log.entries.push_back(entry);
            }
        }
        log
    }

    /// The index of the last entry, or of the snapshot if the log holds no
    /// entry past it.
    pub(crate) fn last_index(&self) -> u64 {
        self.entries.back().map(|e| e.index).unwrap_or(self.snapshot.index)
    }

    /// The term of the last entry, or of the snapshot if the log holds no
    /// entry past it.
    pub(crate) fn last_term(&self) -> u64 {
        self.entries.back().map(|e| e.term).unwrap_or(self.snapshot.term)
    }

    pub(crate) fn snapshot_index(&self) -> u64 {
        self.snapshot.index
    }

    pub(crate) fn snapshot_entry(&self) -> &SnapshotEntry<D> {
        &self.snapshot
    }

    /// Whether the log still holds the entry at the given index.
    pub(crate) fn contains_entry(&self, index: u64) -> bool {
        match self.entries.front() {
            Some(first) => index >= first.index && index <= self.last_index(),
            None => false,
        }
    }

    pub(crate) fn get(&self, index: u64) -> Option<&LogEntry<D>> {
        let first = self.entries.front()?.index;
        if index < first {
            return None;
        }
        self.entries.get((index - first) as usize)
    }

    /// Clones the entries in `[from, to]`, bounded by what the log holds.
    pub(crate) fn get_range(&self, from: u64, to: u64) -> Vec<LogEntry<D>> {
        (from..=to).filter_map(|index| self.get(index).cloned()).collect()
    }

    /// The term of the entry at `index`, resolving the sentinel index 0 and
    /// the snapshot slot.
    pub(crate) fn entry_term(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if index == self.snapshot.index {
            return Some(self.snapshot.term);
        }
        self.get(index).map(|e| e.term)
    }

    /// Whether `count` more entries fit without breaking the capacity bound.
    pub(crate) fn has_capacity_for(&self, count: usize) -> bool {
        self.entries.len() + count <= self.capacity as usize
    }

    /// Append a single entry. The entry's index must directly follow the last
    /// log or snapshot index.
    pub(crate) fn append(&mut self, entry: LogEntry<D>) -> Result<(), LogFull> {
        if !self.has_capacity_for(1) {
            return Err(LogFull);
        }
        debug_assert_eq!(entry.index, self.last_index() + 1, "log entries must be contiguous");
        self.entries.push_back(entry);
        Ok(())
    }

    /// Remove and return the suffix of entries at or after `index`.
    pub(crate) fn truncate_from(&mut self, index: u64) -> Vec<LogEntry<D>> {
        let mut removed = Vec::new();
        while let Some(last) = self.entries.back() {
            if last.index < index {
                break;
            }
            removed.push(self.entries.pop_back().expect("just observed a back entry"));
        }
        removed.reverse();
        removed
    }

    /// Install a snapshot, truncating every entry at or before
    /// `highest_index_to_truncate`. Entries above it survive: through a locally
    /// taken snapshot this keeps a tail for lagging followers, and through an
    /// installed snapshot the caller passes the snapshot index itself.
    ///
    /// Returns the number of truncated entries.
    pub(crate) fn set_snapshot(
        &mut self,
        snapshot: SnapshotEntry<D>,
        highest_index_to_truncate: u64,
    ) -> usize {
        debug_assert!(snapshot.index > self.snapshot.index);
        let mut truncated = 0;
        while let Some(first) = self.entries.front() {
            if first.index > highest_index_to_truncate {
                break;
            }
            self.entries.pop_front();
            truncated += 1;
        }
        self.snapshot = snapshot;
        truncated
    }
}
