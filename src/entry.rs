//! Log entries, snapshot entries, and the privileged group operations.

use std::collections::BTreeSet;

use crate::{AppData, NodeId};

/// A single entry of the replicated log.
#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(serde::Deserialize, serde::Serialize)]
#[serde(bound = "D: AppData")]
pub struct LogEntry<D: AppData> {
    /// The 1-based index of this entry. Index 0 is the "no entry" sentinel.
    pub index: u64,
    /// The term in which this entry was created.
    pub term: u64,
    /// The operation carried by this entry.
    pub payload: EntryPayload<D>,
}

/// The payload of a log entry: either an opaque application operation or one of
/// the privileged group operations.
#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(serde::Deserialize, serde::Serialize)]
#[serde(bound = "D: AppData")]
pub enum EntryPayload<D: AppData> {
    /// An application-defined operation, applied to the state machine on commit.
    Normal(D),
    /// A single-server membership change.
    UpdateMembers(UpdateMembersOp),
    /// Terminates the whole Raft group once committed.
    TerminateGroup,
}

impl<D: AppData> EntryPayload<D> {
    /// Whether this payload is one of the privileged group operations.
    pub fn is_group_op(&self) -> bool {
        matches!(self, EntryPayload::UpdateMembers(_) | EntryPayload::TerminateGroup)
    }
}

/// The mode of a single-server membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(serde::Deserialize, serde::Serialize)]
pub enum MembershipChangeMode {
    /// Add the endpoint to the group.
    AddMember,
    /// Remove the endpoint from the group.
    RemoveMember,
}

/// A membership change operation carried in the log.
///
/// `members` is the full member list resulting from the change, computed when
/// the entry is appended. It becomes the *effective* member list on append and
/// the *committed* member list when the entry commits.
#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(serde::Deserialize, serde::Serialize)]
pub struct UpdateMembersOp {
    /// The endpoint being added or removed.
    pub endpoint: NodeId,
    /// Whether the endpoint is added or removed.
    pub mode: MembershipChangeMode,
    /// The resulting member list.
    pub members: BTreeSet<NodeId>,
}

/// One chunk of a snapshot.
///
/// Chunks are persisted and transmitted independently so that a multi-chunk
/// snapshot survives a partial crash and can be re-requested piecewise.
#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(serde::Deserialize, serde::Serialize)]
#[serde(bound = "D: AppData")]
pub struct SnapshotChunk<D: AppData> {
    /// The log index the snapshot covers.
    pub index: u64,
    /// The term of the entry at `index`.
    pub term: u64,
    /// The position of this chunk within the snapshot.
    pub chunk_index: u32,
    /// The total number of chunks in the snapshot.
    pub chunk_count: u32,
    /// The state machine payload of this chunk.
    pub payload: D,
    /// The log index of the group member list below.
    pub group_members_log_index: u64,
    /// The committed group member list at the time the snapshot was taken.
    pub group_members: BTreeSet<NodeId>,
}

/// A snapshot of the state machine, replacing all log entries at or before its
/// index.
#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(serde::Deserialize, serde::Serialize)]
#[serde(bound = "D: AppData")]
pub struct SnapshotEntry<D: AppData> {
    /// The log index the snapshot covers.
    pub index: u64,
    /// The term of the entry at `index`.
    pub term: u64,
    /// The chunks whose replay reconstructs the state machine at `index`.
    pub chunks: Vec<SnapshotChunk<D>>,
    /// The log index of the group member list below.
    pub group_members_log_index: u64,
    /// The committed group member list at the time the snapshot was taken.
    pub group_members: BTreeSet<NodeId>,
}

impl<D: AppData> SnapshotEntry<D> {
    /// The initial, empty snapshot slot at index 0.
    pub fn initial(members: BTreeSet<NodeId>) -> Self {
        Self {
            index: 0,
            term: 0,
            chunks: Vec::new(),
            group_members_log_index: 0,
            group_members: members,
        }
    }

    /// Whether this snapshot actually covers any entries.
    pub fn is_initial(&self) -> bool {
        self.index == 0
    }

    /// The chunk payloads, in chunk order.
    pub fn chunk_payloads(&self) -> Vec<D> {
        self.chunks.iter().map(|chunk| chunk.payload.clone()).collect()
    }
}
