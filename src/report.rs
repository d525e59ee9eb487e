//! Point-in-time reports of a Raft node's state, for operators and tests.

use crate::state::{GroupMembers, NodeStatus, RaftRole};
use crate::{GroupId, NodeId};

/// Why a report was published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(serde::Deserialize, serde::Serialize)]
pub enum ReportReason {
    /// The periodic report tick fired.
    Periodic,
    /// A `report()` API call asked for one.
    ApiCall,
    /// The node status changed.
    StatusChange,
    /// The node role or known leader changed.
    RoleChange,
    /// The committed or effective member list changed.
    GroupMembersChange,
    /// A local snapshot was taken.
    TakeSnapshot,
    /// A snapshot received from the leader was installed.
    InstallSnapshot,
}

/// Statistics about a node's log and snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(serde::Deserialize, serde::Serialize)]
pub struct LogStats {
    /// The highest log index known to be committed.
    pub commit_index: u64,
    /// The index of the last log entry or snapshot.
    pub last_log_index: u64,
    /// The term of the last log entry or snapshot.
    pub last_log_term: u64,
    /// The index covered by the local snapshot; 0 when none was taken.
    pub snapshot_index: u64,
    /// How many snapshots this node has taken locally.
    pub take_snapshot_count: u64,
    /// How many snapshots this node has installed from a leader.
    pub install_snapshot_count: u64,
}

/// A point-in-time summary of a Raft node.
///
/// Reports are published through [`RaftRuntime::on_report`] and mirrored on
/// the watch channel returned by [`Raft::report_watch`]; they are volatile
/// reads with no coherence guarantee beyond "eventually observed".
///
/// [`RaftRuntime::on_report`]: crate::RaftRuntime::on_report
/// [`Raft::report_watch`]: crate::Raft::report_watch
#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(serde::Deserialize, serde::Serialize)]
pub struct RaftNodeReport {
    pub reason: ReportReason,
    pub group_id: GroupId,
    pub endpoint: NodeId,
    /// The member list the group was bootstrapped with.
    pub initial_members: GroupMembers,
    /// The member list of the last committed `UpdateMembers` entry.
    pub committed_members: GroupMembers,
    /// The member list of the last appended `UpdateMembers` entry, which may
    /// not be committed yet.
    pub effective_members: GroupMembers,
    pub role: RaftRole,
    pub status: NodeStatus,
    pub term: u64,
    /// The endpoint this node voted for in `term`, if any.
    pub voted_for: Option<NodeId>,
    /// The endpoint this node currently believes to be the leader.
    pub leader: Option<NodeId>,
    pub log: LogStats,
}
