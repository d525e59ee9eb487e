//! Volatile role state: leader bookkeeping, election tallies, query rounds,
//! leadership transfer, and group membership views.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use tokio::sync::oneshot;

use crate::entry::{SnapshotChunk, SnapshotEntry};
use crate::error::{Ordered, RaftResult};
use crate::{AppData, NodeId};

/// The number of backoff-reset rounds armed after a probe or snapshot send,
/// and the growth ceiling of the per-follower backoff.
const MAX_BACKOFF_ROUND: u32 = 8;

/// The maximum number of times a leadership transfer is attempted before its
/// future fails with a timeout.
pub(crate) const LEADERSHIP_TRANSFER_ATTEMPT_LIMIT: u32 = 5;

/// A member list of the Raft group, qualified by the log index of the entry
/// which produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(serde::Deserialize, serde::Serialize)]
pub struct GroupMembers {
    /// The index of the `UpdateMembers` entry this list came from; 0 for the
    /// initial member list.
    pub log_index: u64,
    /// The member endpoints.
    pub members: BTreeSet<NodeId>,
}

impl GroupMembers {
    pub fn new(log_index: u64, members: BTreeSet<NodeId>) -> Self {
        Self { log_index, members }
    }

    pub fn contains(&self, endpoint: NodeId) -> bool {
        self.members.contains(&endpoint)
    }

    /// The number of members required for a quorum.
    pub fn majority(&self) -> usize {
        self.members.len() / 2 + 1
    }

    /// The members other than the given endpoint.
    pub fn remote_members(&self, local: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.members.iter().copied().filter(move |id| *id != local)
    }
}

/// The operational status of a Raft node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(serde::Deserialize, serde::Serialize)]
pub enum NodeStatus {
    /// The node has been created but has not completed startup yet.
    Initial,
    /// The node participates in the group normally.
    Active,
    /// An `UpdateMembers` entry is appended but not yet committed.
    UpdatingGroupMembers,
    /// A `TerminateGroup` entry is appended but not yet committed.
    TerminatingGroup,
    /// The node has terminated: the group was terminated, the node was removed
    /// from the group, or the node was shut down.
    Terminated,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeStatus::Terminated)
    }
}

/// The Raft role of a node, as visible in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(serde::Deserialize, serde::Serialize)]
pub enum RaftRole {
    Follower,
    PreCandidate,
    Candidate,
    Leader,
}

/// The role-specific state of a node.
pub(crate) enum RoleState<D: AppData, R> {
    Follower,
    PreCandidate(ElectionState),
    Candidate(ElectionState),
    Leader(LeaderState<D, R>),
}

impl<D: AppData, R> RoleState<D, R> {
    pub(crate) fn role(&self) -> RaftRole {
        match self {
            RoleState::Follower => RaftRole::Follower,
            RoleState::PreCandidate(_) => RaftRole::PreCandidate,
            RoleState::Candidate(_) => RaftRole::Candidate,
            RoleState::Leader(_) => RaftRole::Leader,
        }
    }

    pub(crate) fn is_leader(&self) -> bool {
        matches!(self, RoleState::Leader(_))
    }

    pub(crate) fn leader_state(&self) -> Option<&LeaderState<D, R>> {
        match self {
            RoleState::Leader(leader) => Some(leader),
            _ => None,
        }
    }

    pub(crate) fn leader_state_mut(&mut self) -> Option<&mut LeaderState<D, R>> {
        match self {
            RoleState::Leader(leader) => Some(leader),
            _ => None,
        }
    }
}

/// Vote tally for a pre-vote or vote round. The local node's own vote is
/// counted at construction.
pub(crate) struct ElectionState {
    granted: BTreeSet<NodeId>,
}

impl ElectionState {
    pub(crate) fn new(local: NodeId) -> Self {
        let mut granted = BTreeSet::new();
        granted.insert(local);
        Self { granted }
    }

    pub(crate) fn grant(&mut self, voter: NodeId) {
        self.granted.insert(voter);
    }

    pub(crate) fn granted_count(&self) -> usize {
        self.granted.len()
    }
}

/// The leader's view of one follower.
pub(crate) struct FollowerState {
    /// The highest log index known to be replicated on the follower; 0 until
    /// discovered.
    pub(crate) match_index: u64,
    /// The index of the next entry to send.
    pub(crate) next_index: u64,
    /// Remaining backoff-reset rounds before a new request may be sent; 0 when
    /// no request is in flight.
    backoff_round: u32,
    /// The backoff armed by the next request, growing exponentially up to
    /// `MAX_BACKOFF_ROUND` while the follower stays silent.
    next_backoff_round: u32,
    /// When the last response from this follower arrived.
    pub(crate) response_timestamp: Instant,
}

impl FollowerState {
    pub(crate) fn new(next_index: u64) -> Self {
        Self {
            match_index: 0,
            next_index,
            backoff_round: 0,
            next_backoff_round: 1,
            response_timestamp: Instant::now(),
        }
    }

    /// Whether a request is in flight and new sends are suppressed.
    pub(crate) fn is_request_backoff_set(&self) -> bool {
        self.backoff_round > 0
    }

    /// Arm the backoff for an ordinary append entries request.
    pub(crate) fn set_request_backoff(&mut self) {
        self.backoff_round = self.next_backoff_round;
        self.next_backoff_round = (self.next_backoff_round * 2).min(MAX_BACKOFF_ROUND);
    }

    /// Arm the maximum backoff; used for probes and snapshot chunk sends.
    pub(crate) fn set_max_request_backoff(&mut self) {
        self.backoff_round = MAX_BACKOFF_ROUND;
        self.next_backoff_round = MAX_BACKOFF_ROUND;
    }

    /// Complete one backoff round. Returns true when the backoff has fully
    /// elapsed and the pending request should be re-sent.
    pub(crate) fn complete_backoff_round(&mut self) -> bool {
        self.backoff_round = self.backoff_round.saturating_sub(1);
        self.backoff_round == 0
    }

    /// Record a response from the follower, cancelling any backoff.
    pub(crate) fn response_received(&mut self) {
        self.backoff_round = 0;
        self.next_backoff_round = 1;
        self.response_timestamp = Instant::now();
    }
}

/// Volatile state specific to the Raft leader.
///
/// This state is created on transition to leader and destroyed on transition
/// away.
pub(crate) struct LeaderState<D: AppData, R> {
    /// Per-follower replication state.
    pub(crate) followers: BTreeMap<NodeId, FollowerState>,
    /// Pending linearizable queries and their acknowledgment round.
    pub(crate) query_state: QueryState<D, R>,
    /// The highest log index known to be flushed to the local store.
    pub(crate) flushed_log_index: u64,
    /// Whether the flush task is already enqueued on the event queue.
    pub(crate) flush_task_submitted: bool,
    /// Whether the backoff reset task is already scheduled.
    pub(crate) backoff_reset_scheduled: bool,
}

impl<D: AppData, R> LeaderState<D, R> {
    pub(crate) fn new(
        remote_members: impl Iterator<Item = NodeId>,
        last_log_index: u64,
        flushed_log_index: u64,
    ) -> Self {
        let followers = remote_members
            .map(|id| (id, FollowerState::new(last_log_index + 1)))
            .collect();
        Self {
            followers,
            query_state: QueryState::new(),
            flushed_log_index,
            flush_task_submitted: false,
            backoff_reset_scheduled: false,
        }
    }

    pub(crate) fn follower_state_mut(&mut self, endpoint: NodeId) -> Option<&mut FollowerState> {
        self.followers.get_mut(&endpoint)
    }

    /// The match indices of the followers which are voting members, plus the
    /// given index as the leader's own contribution.
    pub(crate) fn quorum_match_index(
        &self,
        voting_members: &GroupMembers,
        local: NodeId,
        leader_index: Option<u64>,
    ) -> u64 {
        let mut indices: Vec<u64> = self
            .followers
            .iter()
            .filter(|(id, _)| voting_members.contains(**id) && **id != local)
            .map(|(_, f)| f.match_index)
            .collect();
        if let Some(index) = leader_index {
            indices.push(index);
        }
        indices.sort_unstable();
        if indices.is_empty() {
            return 0;
        }
        // The median-of-majority: the largest N replicated on a quorum.
        indices[(indices.len() - 1) / 2]
    }

    /// The freshest timestamp at which responses from a majority of the group
    /// (the leader included) had been received.
    pub(crate) fn majority_response_timestamp(
        &self,
        voting_members: &GroupMembers,
        local: NodeId,
        majority: usize,
    ) -> Instant {
        let needed_from_followers = majority.saturating_sub(1);
        if needed_from_followers == 0 {
            return Instant::now();
        }
        let mut timestamps: Vec<Instant> = self
            .followers
            .iter()
            .filter(|(id, _)| voting_members.contains(**id) && **id != local)
            .map(|(_, f)| f.response_timestamp)
            .collect();
        timestamps.sort_unstable();
        timestamps.reverse();
        timestamps
            .get(needed_from_followers - 1)
            .copied()
            .unwrap_or_else(Instant::now)
    }
}

pub(crate) type QueryResponder<R> = oneshot::Sender<RaftResult<Ordered<R>>>;

/// The leader's pending linearizable queries and the heartbeat round used to
/// prove leadership before running them.
pub(crate) struct QueryState<D: AppData, R> {
    /// The round piggybacked on outbound append entries requests. Incremented
    /// when the first query of a fresh batch is enqueued.
    query_round: u64,
    /// The commit index the batch must observe before running.
    query_commit_index: u64,
    queries: Vec<(D, QueryResponder<R>)>,
    acks: BTreeSet<NodeId>,
}

impl<D: AppData, R> QueryState<D, R> {
    pub(crate) fn new() -> Self {
        Self {
            query_round: 0,
            query_commit_index: 0,
            queries: Vec::new(),
            acks: BTreeSet::new(),
        }
    }

    pub(crate) fn query_round(&self) -> u64 {
        self.query_round
    }

    pub(crate) fn query_count(&self) -> usize {
        self.queries.len()
    }

    /// Enqueue a query to run once a majority acknowledges the round and the
    /// given commit index is reached. Returns the round the query joined.
    pub(crate) fn add_query(&mut self, commit_index: u64, operation: D, tx: QueryResponder<R>) -> u64 {
        if self.queries.is_empty() {
            self.query_round += 1;
            self.acks.clear();
        }
        self.query_commit_index = self.query_commit_index.max(commit_index);
        self.queries.push((operation, tx));
        self.query_round
    }

    /// Record a follower's acknowledgment of a round. Returns true if the ack
    /// belongs to the current round and was not counted yet.
    pub(crate) fn try_ack(&mut self, query_round: u64, sender: NodeId) -> bool {
        if query_round != self.query_round || self.queries.is_empty() {
            return false;
        }
        self.acks.insert(sender)
    }

    /// Whether the batch may run: the required commit index is reached and a
    /// majority (the leader itself included) has acknowledged the round.
    pub(crate) fn is_majority_ack_received(&self, commit_index: u64, majority: usize) -> bool {
        commit_index >= self.query_commit_index && self.acks.len() + 1 >= majority
    }

    /// Take the batched queries for execution, resetting the round state.
    pub(crate) fn take_queries(&mut self) -> Vec<(D, QueryResponder<R>)> {
        self.query_commit_index = 0;
        self.acks.clear();
        std::mem::take(&mut self.queries)
    }

    /// Fail every pending query with the given error.
    pub(crate) fn fail_all(&mut self, err: crate::RaftError) {
        for (_, tx) in self.take_queries() {
            let _ = tx.send(Err(err.clone()));
        }
    }
}

/// State of an in-flight leadership transfer.
pub(crate) struct LeadershipTransferState {
    pub(crate) endpoint: NodeId,
    pub(crate) try_count: u32,
    pub(crate) responder: oneshot::Sender<RaftResult<Ordered<()>>>,
}

impl LeadershipTransferState {
    pub(crate) fn new(endpoint: NodeId, responder: oneshot::Sender<RaftResult<Ordered<()>>>) -> Self {
        Self { endpoint, try_count: 0, responder }
    }

    /// Account for one more attempt. Returns false once the attempt budget is
    /// exhausted and the transfer should time out.
    pub(crate) fn retry(&mut self) -> bool {
        self.try_count += 1;
        self.try_count <= LEADERSHIP_TRANSFER_ATTEMPT_LIMIT
    }

    /// The delay before the next attempt, growing with each retry.
    pub(crate) fn retry_delay_millis(&self, base_timeout_millis: u64) -> u64 {
        base_timeout_millis << self.try_count.min(3)
    }
}

/// Collects the chunks of a snapshot being installed, so that a multi-chunk
/// snapshot can arrive out of order and be re-requested piecewise.
pub(crate) struct SnapshotChunkCollector<D: AppData> {
    pub(crate) snapshot_index: u64,
    pub(crate) snapshot_term: u64,
    pub(crate) chunk_count: u32,
    pub(crate) group_members_log_index: u64,
    pub(crate) group_members: BTreeSet<NodeId>,
    chunks: BTreeMap<u32, SnapshotChunk<D>>,
}

impl<D: AppData> SnapshotChunkCollector<D> {
    pub(crate) fn new(
        snapshot_index: u64,
        snapshot_term: u64,
        chunk_count: u32,
        group_members_log_index: u64,
        group_members: BTreeSet<NodeId>,
    ) -> Self {
        Self {
            snapshot_index,
            snapshot_term,
            chunk_count,
            group_members_log_index,
            group_members,
            chunks: BTreeMap::new(),
        }
    }

    pub(crate) fn add_chunks(&mut self, chunks: Vec<SnapshotChunk<D>>) {
        for chunk in chunks {
            if chunk.index == self.snapshot_index && chunk.chunk_index < self.chunk_count {
                self.chunks.insert(chunk.chunk_index, chunk);
            }
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.chunks.len() == self.chunk_count as usize
    }

    pub(crate) fn has_chunk(&self, chunk_index: u32) -> bool {
        self.chunks.contains_key(&chunk_index)
    }

    /// The chunk indices not received yet.
    pub(crate) fn missing_chunk_indices(&self) -> Vec<u32> {
        (0..self.chunk_count).filter(|i| !self.chunks.contains_key(i)).collect()
    }

    /// Assemble the completed snapshot entry. Must only be called when
    /// `is_complete` returns true.
    pub(crate) fn into_snapshot_entry(self) -> SnapshotEntry<D> {
        debug_assert!(self.chunks.len() == self.chunk_count as usize);
        SnapshotEntry {
            index: self.snapshot_index,
            term: self.snapshot_term,
            chunks: self.chunks.into_values().collect(),
            group_members_log_index: self.group_members_log_index,
            group_members: self.group_members,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn members(ids: &[NodeId]) -> GroupMembers {
        GroupMembers::new(0, ids.iter().copied().collect())
    }

    fn leader_state(followers: &[(NodeId, u64)]) -> LeaderState<u64, u64> {
        let mut state = LeaderState::new(followers.iter().map(|(id, _)| *id), 0, 0);
        for (id, match_index) in followers {
            state.follower_state_mut(*id).unwrap().match_index = *match_index;
        }
        state
    }

    #[test]
    fn quorum_match_index_counts_the_leader_slot() {
        let group = members(&[1, 2, 3]);
        let state = leader_state(&[(2, 5), (3, 3)]);
        // Leader at 10: indices [3, 5, 10] -> quorum at 5.
        assert_eq!(state.quorum_match_index(&group, 1, Some(10)), 5);
    }

    #[test]
    fn quorum_match_index_excludes_a_removed_leader() {
        let group = members(&[2, 3, 4]);
        let mut state = leader_state(&[(2, 7), (3, 4), (4, 2)]);
        // The leader (1) is mid-removal: only follower slots count.
        assert_eq!(state.quorum_match_index(&group, 1, None), 4);
        state.follower_state_mut(4).unwrap().match_index = 7;
        assert_eq!(state.quorum_match_index(&group, 1, None), 7);
    }

    #[test]
    fn backoff_round_grows_and_resets() {
        let mut f = FollowerState::new(1);
        f.set_request_backoff();
        assert!(f.is_request_backoff_set());
        assert!(f.complete_backoff_round());

        // The next arm doubles the rounds to wait through.
        f.set_request_backoff();
        assert!(!f.complete_backoff_round());
        assert!(f.complete_backoff_round());

        // A response resets the growth.
        f.response_received();
        assert!(!f.is_request_backoff_set());
        f.set_request_backoff();
        assert!(f.complete_backoff_round());
    }

    #[test]
    fn query_round_acks_gate_on_round_and_commit_index() {
        let mut q: QueryState<u64, u64> = QueryState::new();
        let (tx, _rx) = oneshot::channel();
        let round = q.add_query(3, 7, tx);
        assert_eq!(round, 1);

        assert!(!q.try_ack(0, 2), "stale round must not ack");
        assert!(q.try_ack(round, 2));
        assert!(!q.try_ack(round, 2), "duplicate ack must not count twice");

        assert!(!q.is_majority_ack_received(2, 2), "commit index gate");
        assert!(q.is_majority_ack_received(3, 2));
        assert_eq!(q.take_queries().len(), 1);
        assert_eq!(q.query_count(), 0);
    }

    #[test]
    fn chunk_collector_tracks_missing_indices() {
        let mut collector: SnapshotChunkCollector<u64> =
            SnapshotChunkCollector::new(9, 2, 3, 0, Default::default());
        collector.add_chunks(vec![SnapshotChunk {
            index: 9,
            term: 2,
            chunk_index: 1,
            chunk_count: 3,
            payload: 42,
            group_members_log_index: 0,
            group_members: Default::default(),
        }]);
        assert!(!collector.is_complete());
        assert_eq!(collector.missing_chunk_indices(), vec![0, 2]);
    }
}
