//! The persistent store interface: the durability boundary of a Raft node.

use std::io;

use crate::entry::{LogEntry, SnapshotChunk, SnapshotEntry};
use crate::{AppData, NodeId};

/// Durable storage for a Raft node's internal state.
///
/// The store is written exclusively from the node's executor, one record at a
/// time. Every `persist_*` call must be atomic per record; `flush` is the
/// durability barrier — once it returns, everything persisted before it must
/// survive a crash.
///
/// Persist calls are ordered before any outbound message or state transition
/// which depends on them. A failure from `persist_term`, `persist_entries` or
/// `truncate_from` is treated as fatal and terminates the node; a failure while
/// persisting snapshot chunks only fails that snapshot attempt.
pub trait RaftStore<D: AppData>: Send + 'static {
    /// Persist the current term and the vote cast in it.
    fn persist_term(&mut self, term: u64, voted_for: Option<NodeId>) -> io::Result<()>;

    /// Persist newly appended log entries.
    fn persist_entries(&mut self, entries: &[LogEntry<D>]) -> io::Result<()>;

    /// Persist a single snapshot chunk. Chunks of one snapshot may arrive
    /// across restarts; an incomplete chunk set is discarded on restore.
    fn persist_snapshot_chunk(&mut self, chunk: &SnapshotChunk<D>) -> io::Result<()>;

    /// Remove persisted log entries at or after the given index.
    fn truncate_from(&mut self, index: u64) -> io::Result<()>;

    /// Block until all previously persisted records are stable.
    fn flush(&mut self) -> io::Result<()>;

    /// Read back the durable state, called once at node startup. Returns
    /// `None` when the store holds no state (a pristine node).
    fn restore(&mut self) -> io::Result<Option<RestoredState<D>>>;

    /// Whether this store actually makes anything durable. When it does not,
    /// the node skips flush scheduling and the leader counts its own
    /// last log index (instead of its flushed index) towards the quorum.
    fn is_persistent(&self) -> bool {
        true
    }
}

/// The state recovered from a [`RaftStore`] at startup.
///
/// Pending operation futures are deliberately absent: a restarted node cannot
/// resolve promises made by its previous incarnation, and callers re-try.
#[derive(Debug, Clone)]
pub struct RestoredState<D: AppData> {
    /// The last persisted term.
    pub term: u64,
    /// The vote cast in `term`, if any.
    pub voted_for: Option<NodeId>,
    /// The last complete persisted snapshot, reassembled from its chunks.
    pub snapshot: Option<SnapshotEntry<D>>,
    /// The persisted log entries after the snapshot, in index order.
    pub entries: Vec<LogEntry<D>>,
}

/// A store which persists nothing.
///
/// With `NopStore` a node runs purely in memory: Raft still works, but a
/// restarted node comes back blank and rejoins the group as a fresh follower.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopStore;

impl<D: AppData> RaftStore<D> for NopStore {
    fn persist_term(&mut self, _term: u64, _voted_for: Option<NodeId>) -> io::Result<()> {
        Ok(())
    }

    fn persist_entries(&mut self, _entries: &[LogEntry<D>]) -> io::Result<()> {
        Ok(())
    }

    fn persist_snapshot_chunk(&mut self, _chunk: &SnapshotChunk<D>) -> io::Result<()> {
        Ok(())
    }

    fn truncate_from(&mut self, _index: u64) -> io::Result<()> {
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn restore(&mut self) -> io::Result<Option<RestoredState<D>>> {
        Ok(None)
    }

    fn is_persistent(&self) -> bool {
        false
    }
}
