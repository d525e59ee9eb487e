//! The messages exchanged between the members of a Raft group.
//!
//! These types define the wire shape, not an encoding: a transport serializes
//! them however it likes (they all derive serde traits) and delivers inbound
//! frames to [`Raft::handle_message`](crate::Raft::handle_message).

use std::collections::BTreeSet;

use crate::entry::{LogEntry, SnapshotChunk};
use crate::{AppData, GroupId, NodeId};

/// The envelope around every message kind a Raft node can receive.
///
/// Handlers are dispatched with an exhaustive match over this enum; there is no
/// dynamic dispatch over message kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(serde::Deserialize, serde::Serialize)]
#[serde(bound = "D: AppData")]
pub enum RaftMessage<D: AppData> {
    AppendEntriesRequest(AppendEntriesRequest<D>),
    AppendEntriesSuccess(AppendEntriesSuccess),
    AppendEntriesFailure(AppendEntriesFailure),
    InstallSnapshotRequest(InstallSnapshotRequest<D>),
    InstallSnapshotResponse(InstallSnapshotResponse),
    VoteRequest(VoteRequest),
    VoteResponse(VoteResponse),
    PreVoteRequest(PreVoteRequest),
    PreVoteResponse(PreVoteResponse),
    TriggerLeaderElection(TriggerLeaderElection),
}

impl<D: AppData> RaftMessage<D> {
    /// The term carried by the message.
    pub fn term(&self) -> u64 {
        match self {
            RaftMessage::AppendEntriesRequest(m) => m.term,
            RaftMessage::AppendEntriesSuccess(m) => m.term,
            RaftMessage::AppendEntriesFailure(m) => m.term,
            RaftMessage::InstallSnapshotRequest(m) => m.term,
            RaftMessage::InstallSnapshotResponse(m) => m.term,
            RaftMessage::VoteRequest(m) => m.term,
            RaftMessage::VoteResponse(m) => m.term,
            RaftMessage::PreVoteRequest(m) => m.term,
            RaftMessage::PreVoteResponse(m) => m.term,
            RaftMessage::TriggerLeaderElection(m) => m.term,
        }
    }

    /// The endpoint which sent the message.
    pub fn sender(&self) -> NodeId {
        match self {
            RaftMessage::AppendEntriesRequest(m) => m.sender,
            RaftMessage::AppendEntriesSuccess(m) => m.sender,
            RaftMessage::AppendEntriesFailure(m) => m.sender,
            RaftMessage::InstallSnapshotRequest(m) => m.sender,
            RaftMessage::InstallSnapshotResponse(m) => m.sender,
            RaftMessage::VoteRequest(m) => m.sender,
            RaftMessage::VoteResponse(m) => m.sender,
            RaftMessage::PreVoteRequest(m) => m.sender,
            RaftMessage::PreVoteResponse(m) => m.sender,
            RaftMessage::TriggerLeaderElection(m) => m.sender,
        }
    }

    /// The Raft group the message belongs to.
    pub fn group_id(&self) -> GroupId {
        match self {
            RaftMessage::AppendEntriesRequest(m) => m.group_id,
            RaftMessage::AppendEntriesSuccess(m) => m.group_id,
            RaftMessage::AppendEntriesFailure(m) => m.group_id,
            RaftMessage::InstallSnapshotRequest(m) => m.group_id,
            RaftMessage::InstallSnapshotResponse(m) => m.group_id,
            RaftMessage::VoteRequest(m) => m.group_id,
            RaftMessage::VoteResponse(m) => m.group_id,
            RaftMessage::PreVoteRequest(m) => m.group_id,
            RaftMessage::PreVoteResponse(m) => m.group_id,
            RaftMessage::TriggerLeaderElection(m) => m.group_id,
        }
    }
}

/// Invoked by the leader to replicate log entries (§5.3); also used as a
/// heartbeat (§5.2) when `entries` is empty.
#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(serde::Deserialize, serde::Serialize)]
#[serde(bound = "D: AppData")]
pub struct AppendEntriesRequest<D: AppData> {
    pub group_id: GroupId,
    pub sender: NodeId,
    pub term: u64,
    /// The index of the log entry immediately preceding `entries`.
    pub prev_log_index: u64,
    /// The term of the entry at `prev_log_index`.
    pub prev_log_term: u64,
    /// The entries to append. Empty for heartbeats and probes.
    pub entries: Vec<LogEntry<D>>,
    /// The leader's commit index.
    pub leader_commit_index: u64,
    /// The leader's current query round, acknowledged by the follower in its
    /// response to prove the sender is still accepted as leader.
    pub query_round: u64,
}

/// The follower's response to a successfully applied [`AppendEntriesRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(serde::Deserialize, serde::Serialize)]
pub struct AppendEntriesSuccess {
    pub group_id: GroupId,
    pub sender: NodeId,
    pub term: u64,
    /// The last index of the follower's log after the append.
    pub last_log_index: u64,
    /// Echo of the request's query round.
    pub query_round: u64,
}

/// The follower's response to an [`AppendEntriesRequest`] whose previous-log
/// position did not match.
#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(serde::Deserialize, serde::Serialize)]
pub struct AppendEntriesFailure {
    pub group_id: GroupId,
    pub sender: NodeId,
    pub term: u64,
    /// A fast-backtracking hint: the next index the leader should try,
    /// derived from the follower's current last log index.
    pub expected_next_index: u64,
    /// Echo of the request's query round.
    pub query_round: u64,
}

/// Invoked by the leader to install a snapshot on a lagging follower.
///
/// An empty `chunks` list acts as a trigger: the follower answers with the
/// chunk indices it is missing, and the leader streams those chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(serde::Deserialize, serde::Serialize)]
#[serde(bound = "D: AppData")]
pub struct InstallSnapshotRequest<D: AppData> {
    pub group_id: GroupId,
    pub sender: NodeId,
    pub term: u64,
    /// The log index covered by the snapshot.
    pub snapshot_index: u64,
    /// The term of the entry at `snapshot_index`.
    pub snapshot_term: u64,
    /// The total number of chunks in the snapshot.
    pub total_chunk_count: u32,
    /// The chunks carried by this request; a subset of the full snapshot.
    pub chunks: Vec<SnapshotChunk<D>>,
    /// The log index of the group member list below.
    pub group_members_log_index: u64,
    /// The committed group member list at the time the snapshot was taken.
    pub group_members: BTreeSet<NodeId>,
    /// The leader's current query round.
    pub query_round: u64,
}

/// The follower's request for the snapshot chunks it has not received yet.
#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(serde::Deserialize, serde::Serialize)]
pub struct InstallSnapshotResponse {
    pub group_id: GroupId,
    pub sender: NodeId,
    pub term: u64,
    /// The snapshot the follower is collecting.
    pub snapshot_index: u64,
    /// The chunk indices the follower still needs.
    pub requested_chunk_indices: Vec<u32>,
}

/// Invoked by candidates to gather votes (§5.2).
#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(serde::Deserialize, serde::Serialize)]
pub struct VoteRequest {
    pub group_id: GroupId,
    pub sender: NodeId,
    pub term: u64,
    /// The term of the candidate's last log entry.
    pub last_log_term: u64,
    /// The index of the candidate's last log entry.
    pub last_log_index: u64,
    /// Whether leader stickiness applies to this request. Ordinary elections
    /// are sticky; elections triggered by a leadership transfer are not.
    pub sticky: bool,
}

/// A response to a [`VoteRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(serde::Deserialize, serde::Serialize)]
pub struct VoteResponse {
    pub group_id: GroupId,
    pub sender: NodeId,
    pub term: u64,
    pub granted: bool,
}

/// A non-durable probe sent before a real election to check whether the
/// sender could win one, avoiding term inflation from isolated nodes.
///
/// `term` is the term the sender *would* campaign with, one beyond its current
/// term; granting a pre-vote mutates no durable state.
#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(serde::Deserialize, serde::Serialize)]
pub struct PreVoteRequest {
    pub group_id: GroupId,
    pub sender: NodeId,
    pub term: u64,
    pub last_log_term: u64,
    pub last_log_index: u64,
}

/// A response to a [`PreVoteRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(serde::Deserialize, serde::Serialize)]
pub struct PreVoteResponse {
    pub group_id: GroupId,
    pub sender: NodeId,
    pub term: u64,
    pub granted: bool,
}

/// Sent by a leader to the target of a leadership transfer, instructing it to
/// start a non-sticky election immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(serde::Deserialize, serde::Serialize)]
pub struct TriggerLeaderElection {
    pub group_id: GroupId,
    pub sender: NodeId,
    pub term: u64,
    /// The sender's last log term; the target only campaigns if caught up.
    pub last_log_term: u64,
    /// The sender's last log index.
    pub last_log_index: u64,
}
