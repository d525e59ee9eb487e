//! Test doubles: an in-memory store and a simple replicated state machine.
//!
//! These power this crate's own test suite and are public so that
//! applications can use them to exercise their integration code without
//! standing up real storage or transport.

use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex};

use anyerror::AnyError;

use crate::entry::{LogEntry, SnapshotChunk, SnapshotEntry};
use crate::state_machine::StateMachine;
use crate::storage::{RaftStore, RestoredState};
use crate::{AppData, NodeId};

/// The number of values packed into one snapshot chunk by
/// [`SimpleStateMachine`].
const SNAPSHOT_CHUNK_VALUE_COUNT: usize = 10;

/// The operations understood by [`SimpleStateMachine`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(serde::Deserialize, serde::Serialize)]
pub enum SimpleOp {
    /// Store a value; applying returns the value itself.
    Set(String),
    /// Return the most recently stored value; does not mutate anything.
    QueryLast,
    /// The no-op a fresh leader appends to commit an entry in its own term.
    NewTerm,
    /// A snapshot chunk: a slice of the stored values keyed by log index.
    Chunk(Vec<(u64, String)>),
}

/// Build a `Set` operation.
pub fn set(value: impl Into<String>) -> SimpleOp {
    SimpleOp::Set(value.into())
}

/// Build a `QueryLast` operation.
pub fn query_last() -> SimpleOp {
    SimpleOp::QueryLast
}

/// A state machine which remembers every value set, keyed by log index.
///
/// Applying `Set` returns the stored value and `QueryLast` returns the most
/// recent one, so tests can observe both replication and staleness.
#[derive(Debug, Default)]
pub struct SimpleStateMachine {
    values: BTreeMap<u64, String>,
    new_term_operation_enabled: bool,
}

impl SimpleStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// A machine which appends a no-op entry on every election win, the way
    /// production state machines unblock membership changes and reads in a
    /// fresh term.
    pub fn with_new_term_operation() -> Self {
        Self { values: BTreeMap::new(), new_term_operation_enabled: true }
    }
}

impl StateMachine<SimpleOp, Option<String>> for SimpleStateMachine {
    fn apply(&mut self, index: u64, operation: &SimpleOp) -> Result<Option<String>, AnyError> {
        match operation {
            SimpleOp::Set(value) => {
                self.values.insert(index, value.clone());
                Ok(Some(value.clone()))
            }
            SimpleOp::QueryLast => Ok(self.values.values().next_back().cloned()),
            SimpleOp::NewTerm => Ok(None),
            SimpleOp::Chunk(_) => {
                Err(AnyError::error("snapshot chunks are not appliable operations"))
            }
        }
    }

    fn take_snapshot(
        &mut self,
        _index: u64,
        sink: &mut dyn FnMut(SimpleOp),
    ) -> Result<(), AnyError> {
        let values: Vec<(u64, String)> =
            self.values.iter().map(|(i, v)| (*i, v.clone())).collect();
        if values.is_empty() {
            sink(SimpleOp::Chunk(Vec::new()));
            return Ok(());
        }
        for chunk in values.chunks(SNAPSHOT_CHUNK_VALUE_COUNT) {
            sink(SimpleOp::Chunk(chunk.to_vec()));
        }
        Ok(())
    }

    fn install_snapshot(&mut self, _index: u64, chunks: Vec<SimpleOp>) {
        self.values.clear();
        for chunk in chunks {
            if let SimpleOp::Chunk(values) = chunk {
                self.values.extend(values);
            }
        }
    }

    fn new_term_operation(&mut self) -> Option<SimpleOp> {
        self.new_term_operation_enabled.then_some(SimpleOp::NewTerm)
    }
}

#[derive(Debug)]
struct MemStoreInner<D: AppData> {
    initialized: bool,
    term: u64,
    voted_for: Option<NodeId>,
    entries: BTreeMap<u64, LogEntry<D>>,
    /// Persisted snapshot chunks, keyed by snapshot index then chunk index.
    snapshot_chunks: BTreeMap<u64, BTreeMap<u32, SnapshotChunk<D>>>,
}

impl<D: AppData> Default for MemStoreInner<D> {
    fn default() -> Self {
        Self {
            initialized: false,
            term: 0,
            voted_for: None,
            entries: BTreeMap::new(),
            snapshot_chunks: BTreeMap::new(),
        }
    }
}

/// An in-memory [`RaftStore`].
///
/// Clones share the same underlying records, so a test can terminate a node
/// and start a new one over the same store to simulate a crash and restart.
#[derive(Debug, Clone, Default)]
pub struct MemStore<D: AppData> {
    inner: Arc<Mutex<MemStoreInner<D>>>,
}

impl<D: AppData> MemStore<D> {
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(MemStoreInner::default())) }
    }

    /// The persisted term and vote, for assertions in tests.
    pub fn persisted_term(&self) -> (u64, Option<NodeId>) {
        let inner = self.inner.lock().unwrap();
        (inner.term, inner.voted_for)
    }

    /// The indices of the persisted log entries, for assertions in tests.
    pub fn persisted_entry_indices(&self) -> Vec<u64> {
        self.inner.lock().unwrap().entries.keys().copied().collect()
    }
}

impl<D: AppData> RaftStore<D> for MemStore<D> {
    fn persist_term(&mut self, term: u64, voted_for: Option<NodeId>) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.initialized = true;
        inner.term = term;
        inner.voted_for = voted_for;
        Ok(())
    }

    fn persist_entries(&mut self, entries: &[LogEntry<D>]) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.initialized = true;
        for entry in entries {
            inner.entries.insert(entry.index, entry.clone());
        }
        Ok(())
    }

    fn persist_snapshot_chunk(&mut self, chunk: &SnapshotChunk<D>) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.initialized = true;
        inner
            .snapshot_chunks
            .entry(chunk.index)
            .or_default()
            .insert(chunk.chunk_index, chunk.clone());
        Ok(())
    }

    fn truncate_from(&mut self, index: u64) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.split_off(&index);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn restore(&mut self) -> io::Result<Option<RestoredState<D>>> {
        let inner = self.inner.lock().unwrap();
        if !inner.initialized {
            return Ok(None);
        }

        // The newest complete chunk set wins; a partially persisted snapshot
        // is discarded.
        let snapshot = inner
            .snapshot_chunks
            .iter()
            .rev()
            .find_map(|(index, chunks)| {
                let first = chunks.values().next()?;
                if chunks.len() == first.chunk_count as usize || first.chunk_count == 0 {
                    Some(SnapshotEntry {
                        index: *index,
                        term: first.term,
                        chunks: chunks.values().cloned().collect(),
                        group_members_log_index: first.group_members_log_index,
                        group_members: first.group_members.clone(),
                    })
                } else {
                    None
                }
            });

        let snapshot_index = snapshot.as_ref().map(|s| s.index).unwrap_or(0);
        let entries =
            inner.entries.range(snapshot_index + 1..).map(|(_, e)| e.clone()).collect();

        Ok(Some(RestoredState {
            term: inner.term,
            voted_for: inner.voted_for,
            snapshot,
            entries,
        }))
    }
}

#[cfg(test)]
mod tests {
    use maplit::btreeset;

    use super::*;
    use crate::entry::EntryPayload;

    #[test]
    fn simple_state_machine_round_trips_snapshots() {
        let mut machine = SimpleStateMachine::new();
        for i in 1..=25u64 {
            machine.apply(i, &set(format!("value{i}"))).unwrap();
        }

        let mut chunks = Vec::new();
        machine.take_snapshot(25, &mut |c| chunks.push(c)).unwrap();
        assert_eq!(chunks.len(), 3);

        let mut restored = SimpleStateMachine::new();
        restored.install_snapshot(25, chunks);
        assert_eq!(restored.apply(26, &query_last()).unwrap(), Some("value25".into()));
    }

    #[test]
    fn mem_store_restores_term_entries_and_snapshot() {
        let mut store: MemStore<SimpleOp> = MemStore::new();
        store.persist_term(3, Some(1)).unwrap();
        for index in 1..=4u64 {
            store
                .persist_entries(&[LogEntry {
                    index,
                    term: 3,
                    payload: EntryPayload::Normal(set(format!("v{index}"))),
                }])
                .unwrap();
        }
        store
            .persist_snapshot_chunk(&SnapshotChunk {
                index: 2,
                term: 3,
                chunk_index: 0,
                chunk_count: 1,
                payload: SimpleOp::Chunk(vec![(1, "v1".into()), (2, "v2".into())]),
                group_members_log_index: 0,
                group_members: btreeset! {1, 2, 3},
            })
            .unwrap();

        let restored = store.clone().restore().unwrap().unwrap();
        assert_eq!(restored.term, 3);
        assert_eq!(restored.voted_for, Some(1));
        let snapshot = restored.snapshot.unwrap();
        assert_eq!(snapshot.index, 2);
        assert_eq!(
            restored.entries.iter().map(|e| e.index).collect::<Vec<_>>(),
            vec![3, 4],
            "entries covered by the snapshot are dropped on restore"
        );
    }

    #[test]
    fn mem_store_discards_incomplete_chunk_sets() {
        let mut store: MemStore<SimpleOp> = MemStore::new();
        store.persist_term(1, None).unwrap();
        store
            .persist_snapshot_chunk(&SnapshotChunk {
                index: 10,
                term: 1,
                chunk_index: 0,
                chunk_count: 2,
                payload: SimpleOp::Chunk(Vec::new()),
                group_members_log_index: 0,
                group_members: btreeset! {1},
            })
            .unwrap();

        let restored = store.clone().restore().unwrap().unwrap();
        assert!(restored.snapshot.is_none());
    }
}
