//! The core logic of a Raft node.
//!
//! [`RaftCore`] owns every piece of node state and runs as a single spawned
//! task: an event loop over one queue carrying API calls, inbound messages and
//! timer events. Nothing else ever touches the state, which is what makes the
//! single-threaded reasoning of the Raft invariants hold.

mod append_entries;
mod client;
mod install_snapshot;
mod replication;
mod vote;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::config::Config;
use crate::entry::{EntryPayload, LogEntry, MembershipChangeMode, SnapshotEntry};
use crate::error::{Ordered, RaftError, RaftResult};
use crate::log::RaftLog;
use crate::messages::RaftMessage;
use crate::raft::QueryPolicy;
use crate::report::{LogStats, RaftNodeReport, ReportReason};
use crate::runtime::RaftRuntime;
use crate::state::{
    ElectionState, FollowerState, GroupMembers, LeaderState, LeadershipTransferState, NodeStatus,
    RoleState, SnapshotChunkCollector,
};
use crate::state_machine::StateMachine;
use crate::storage::RaftStore;
use crate::{AppData, AppDataResponse, GroupId, NodeId};

/// The response channel of one in-flight API operation.
///
/// Each pending operation is resolved exactly once: with its result when the
/// entry commits, with an invalidation error when the entry is truncated or
/// the node steps down, or with `IndeterminateState` when a snapshot swallows
/// the entry before its outcome was observed.
pub(crate) enum Responder<R: AppDataResponse> {
    /// A `replicate` call, resolved with the state machine's result.
    Apply(oneshot::Sender<RaftResult<Ordered<R>>>),
    /// A `change_membership` call, resolved with the committed member list.
    Members(oneshot::Sender<RaftResult<Ordered<GroupMembers>>>),
    /// A `terminate_group` call, resolved with no payload.
    Done(oneshot::Sender<RaftResult<Ordered<()>>>),
}

impl<R: AppDataResponse> Responder<R> {
    pub(crate) fn fail(self, err: RaftError) {
        match self {
            Responder::Apply(tx) => {
                let _ = tx.send(Err(err));
            }
            Responder::Members(tx) => {
                let _ = tx.send(Err(err));
            }
            Responder::Done(tx) => {
                let _ = tx.send(Err(err));
            }
        }
    }
}

/// An event on the node's queue: an API call, an inbound message, or a timer.
pub(crate) enum RaftMsg<D: AppData, R: AppDataResponse> {
    /// An inbound message from a peer, delivered by the transport.
    External(RaftMessage<D>),
    /// Replicate an operation; also carries the group operations.
    Replicate {
        payload: EntryPayload<D>,
        responder: Responder<R>,
    },
    /// Run a query under the given policy.
    Query {
        operation: D,
        policy: QueryPolicy,
        min_commit_index: u64,
        tx: oneshot::Sender<RaftResult<Ordered<R>>>,
    },
    /// Propose a single-server membership change.
    ChangeMembership {
        endpoint: NodeId,
        mode: MembershipChangeMode,
        expected_commit_index: u64,
        tx: oneshot::Sender<RaftResult<Ordered<GroupMembers>>>,
    },
    /// Transfer leadership to the given endpoint.
    TransferLeadership {
        endpoint: NodeId,
        tx: oneshot::Sender<RaftResult<Ordered<()>>>,
    },
    /// Produce a point-in-time report.
    GetReport { tx: oneshot::Sender<RaftNodeReport> },
    /// Shut this node down.
    Terminate { tx: oneshot::Sender<()> },

    // Timer events the core schedules to itself.
    HeartbeatTick,
    ElectionTimeout { term: u64 },
    PreVoteTimeout { term: u64 },
    BackoffReset,
    LeaderFlush,
    TransferRetry,
    ReportTick,
}

/// The core type implementing the Raft protocol for one node.
pub(crate) struct RaftCore<D, R, SM, S, RT>
where
    D: AppData,
    R: AppDataResponse,
    SM: StateMachine<D, R>,
    S: RaftStore<D>,
    RT: RaftRuntime<D>,
{
    pub(crate) id: NodeId,
    pub(crate) group_id: GroupId,
    pub(crate) config: Arc<Config>,
    pub(crate) runtime: Arc<RT>,
    pub(crate) state_machine: SM,
    pub(crate) store: S,
    pub(crate) log: RaftLog<D>,

    /// The current term. Increases monotonically; persisted before use.
    pub(crate) term: u64,
    /// The candidate which received this node's vote in `term`.
    pub(crate) voted_for: Option<NodeId>,
    /// The highest log index known to be committed.
    pub(crate) commit_index: u64,
    /// The highest log index applied to the state machine.
    pub(crate) last_applied: u64,
    /// The endpoint this node currently accepts as leader.
    pub(crate) leader: Option<NodeId>,
    pub(crate) role: RoleState<D, R>,
    pub(crate) status: NodeStatus,

    pub(crate) initial_members: GroupMembers,
    /// The member list of the last committed `UpdateMembers` entry.
    pub(crate) committed_members: GroupMembers,
    /// The member list of the last appended `UpdateMembers` entry.
    pub(crate) effective_members: GroupMembers,

    /// Pending operation futures, keyed by log index. Exactly one per index.
    pub(crate) futures: BTreeMap<u64, Responder<R>>,
    /// Chunks of a snapshot currently being received from the leader.
    pub(crate) snapshot_chunk_collector: Option<SnapshotChunkCollector<D>>,
    pub(crate) leadership_transfer: Option<LeadershipTransferState>,
    /// When the last heartbeat from the current leader arrived.
    pub(crate) last_leader_heartbeat: Option<Instant>,

    pub(crate) take_snapshot_count: u64,
    pub(crate) install_snapshot_count: u64,
    /// Whether the store persists data and the leader flush task is in play.
    pub(crate) flush_task_enabled: bool,

    pub(crate) tx_event: mpsc::UnboundedSender<RaftMsg<D, R>>,
    rx_event: mpsc::UnboundedReceiver<RaftMsg<D, R>>,
    tx_report: watch::Sender<RaftNodeReport>,
}

impl<D, R, SM, S, RT> RaftCore<D, R, SM, S, RT>
where
    D: AppData,
    R: AppDataResponse,
    SM: StateMachine<D, R>,
    S: RaftStore<D>,
    RT: RaftRuntime<D>,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        id: NodeId,
        group_id: GroupId,
        initial_members: GroupMembers,
        config: Arc<Config>,
        runtime: Arc<RT>,
        state_machine: SM,
        store: S,
        tx_event: mpsc::UnboundedSender<RaftMsg<D, R>>,
        rx_event: mpsc::UnboundedReceiver<RaftMsg<D, R>>,
        tx_report: watch::Sender<RaftNodeReport>,
    ) -> JoinHandle<()> {
        let flush_task_enabled = store.is_persistent();
        let log = RaftLog::new(
            config.log_capacity(),
            SnapshotEntry::initial(initial_members.members.clone()),
        );
        let this = Self {
            id,
            group_id,
            config,
            runtime,
            state_machine,
            store,
            log,
            term: 0,
            voted_for: None,
            commit_index: 0,
            last_applied: 0,
            leader: None,
            role: RoleState::Follower,
            status: NodeStatus::Initial,
            committed_members: initial_members.clone(),
            effective_members: initial_members.clone(),
            initial_members,
            futures: BTreeMap::new(),
            snapshot_chunk_collector: None,
            leadership_transfer: None,
            last_leader_heartbeat: None,
            take_snapshot_count: 0,
            install_snapshot_count: 0,
            flush_task_enabled,
            tx_event,
            rx_event,
            tx_report,
        };
        let span = tracing::debug_span!("raft_core", id, group_id);
        tokio::spawn(this.main().instrument(span))
    }

    /// The main loop of the Raft node: the single logical executor all state
    /// mutation runs on.
    async fn main(mut self) {
        if let Err(err) = self.startup() {
            tracing::error!(error = %err, "node could not start");
            self.set_status(NodeStatus::Terminated);
            return;
        }

        while let Some(msg) = self.rx_event.recv().await {
            match msg {
                RaftMsg::External(message) => self.handle_message(message),
                RaftMsg::Replicate { payload, responder } => {
                    self.handle_replicate(payload, responder)
                }
                RaftMsg::Query { operation, policy, min_commit_index, tx } => {
                    self.handle_query(operation, policy, min_commit_index, tx)
                }
                RaftMsg::ChangeMembership { endpoint, mode, expected_commit_index, tx } => {
                    self.handle_change_membership(endpoint, mode, expected_commit_index, tx)
                }
                RaftMsg::TransferLeadership { endpoint, tx } => {
                    self.handle_transfer_leadership(endpoint, tx)
                }
                RaftMsg::GetReport { tx } => {
                    let _ = tx.send(self.new_report(ReportReason::ApiCall));
                }
                RaftMsg::Terminate { tx } => {
                    self.handle_terminate();
                    let _ = tx.send(());
                }
                RaftMsg::HeartbeatTick => self.handle_heartbeat_tick(),
                RaftMsg::ElectionTimeout { term } => self.handle_election_timeout(term),
                RaftMsg::PreVoteTimeout { term } => self.handle_pre_vote_timeout(term),
                RaftMsg::BackoffReset => self.handle_backoff_reset(),
                RaftMsg::LeaderFlush => self.handle_leader_flush(),
                RaftMsg::TransferRetry => self.do_transfer_leadership(),
                RaftMsg::ReportTick => self.handle_report_tick(),
            }

            if self.status.is_terminal() {
                break;
            }
        }

        tracing::info!("node stopped");
    }

    /// Recover durable state and schedule the initial tasks.
    fn startup(&mut self) -> RaftResult<()> {
        let restored = self.store.restore().map_err(RaftError::internal)?;
        match restored {
            Some(restored) => {
                tracing::info!(
                    term = restored.term,
                    entries = restored.entries.len(),
                    "restoring node from durable state"
                );
                self.term = restored.term;
                self.voted_for = restored.voted_for;

                let snapshot = restored.snapshot.unwrap_or_else(|| {
                    SnapshotEntry::initial(self.initial_members.members.clone())
                });
                self.log = RaftLog::restore(self.config.log_capacity(), snapshot, restored.entries);

                let snapshot = self.log.snapshot_entry().clone();
                if !snapshot.is_initial() {
                    self.committed_members = GroupMembers::new(
                        snapshot.group_members_log_index,
                        snapshot.group_members.clone(),
                    );
                    self.effective_members = self.committed_members.clone();
                    self.state_machine.install_snapshot(snapshot.index, snapshot.chunk_payloads());
                    self.commit_index = snapshot.index;
                    self.last_applied = snapshot.index;
                    self.install_snapshot_count += 1;
                    self.publish_report(ReportReason::InstallSnapshot);
                }

                self.apply_restored_group_ops();
            }
            None => {
                // First boot: establish the initial durable term record.
                if let Err(err) = self.store.persist_term(self.term, self.voted_for) {
                    return Err(RaftError::internal(err));
                }
            }
        }

        tracing::info!(
            members = ?self.effective_members.members,
            term = self.term,
            "node starting"
        );

        if self.status == NodeStatus::Initial {
            self.set_status(NodeStatus::Active);
        }

        self.schedule(
            Duration::from_millis(self.config.leader_heartbeat_period_millis),
            RaftMsg::HeartbeatTick,
        );
        self.schedule(
            Duration::from_secs(self.config.raft_node_report_publish_period_secs),
            RaftMsg::ReportTick,
        );

        // Probe for a leader right away instead of idling through a timeout.
        if !self.status.is_terminal() {
            self.pre_candidate();
        }
        Ok(())
    }

    /// Re-prepare group operations found in the restored log suffix.
    ///
    /// If several group operations follow the snapshot, all but the last are
    /// known committed, because a new group operation may only be appended
    /// once the previous one commits. The last one cannot be decided here, so
    /// it is re-prepared without being committed.
    fn apply_restored_group_ops(&mut self) {
        let mut committed_group_op_index = None;
        let mut last_group_op_index = None;
        for index in (self.log.snapshot_index() + 1)..=self.log.last_index() {
            if let Some(entry) = self.log.get(index) {
                if entry.payload.is_group_op() {
                    committed_group_op_index = last_group_op_index;
                    last_group_op_index = Some(index);
                }
            }
        }

        if let Some(index) = committed_group_op_index {
            self.commit_index = index;
            self.apply_log_entries();
        }

        if let Some(index) = last_group_op_index {
            if index > self.commit_index {
                let entry = self.log.get(index).cloned().expect("scanned entry must exist");
                match entry.payload {
                    EntryPayload::UpdateMembers(op) => {
                        self.set_status(NodeStatus::UpdatingGroupMembers);
                        self.update_effective_members(index, op.members);
                    }
                    EntryPayload::TerminateGroup => {
                        self.set_status(NodeStatus::TerminatingGroup);
                    }
                    EntryPayload::Normal(_) => unreachable!("scanned only group operations"),
                }
            }
        }
    }

    /// Enqueue a message back onto this node's own queue after a delay.
    pub(crate) fn schedule(&self, delay: Duration, msg: RaftMsg<D, R>) {
        let tx = self.tx_event.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(msg);
        });
    }

    /// Dispatch an inbound message to its handler. A message is untrusted
    /// input: handlers reject or drop what they cannot use, they never take
    /// the node down.
    fn handle_message(&mut self, message: RaftMessage<D>) {
        match message {
            RaftMessage::AppendEntriesRequest(req) => self.handle_append_entries_request(req),
            RaftMessage::AppendEntriesSuccess(resp) => self.handle_append_entries_success(resp),
            RaftMessage::AppendEntriesFailure(resp) => self.handle_append_entries_failure(resp),
            RaftMessage::InstallSnapshotRequest(req) => self.handle_install_snapshot_request(req),
            RaftMessage::InstallSnapshotResponse(resp) => {
                self.handle_install_snapshot_response(resp)
            }
            RaftMessage::VoteRequest(req) => self.handle_vote_request(req),
            RaftMessage::VoteResponse(resp) => self.handle_vote_response(resp),
            RaftMessage::PreVoteRequest(req) => self.handle_pre_vote_request(req),
            RaftMessage::PreVoteResponse(resp) => self.handle_pre_vote_response(resp),
            RaftMessage::TriggerLeaderElection(req) => self.handle_trigger_leader_election(req),
        }
    }

    // ------------------------------------------------------------------
    // Role transitions.

    /// Switch to the follower role, clearing candidate bookkeeping. Clears the
    /// known leader and the durable vote when the term advances. Pending
    /// leader-local queries fail with `NotLeader`; an in-flight leadership
    /// transfer completes successfully when a higher term is the cause.
    pub(crate) fn to_follower(&mut self, term: u64) {
        let term_advanced = term > self.term;
        let old_role = std::mem::replace(&mut self.role, RoleState::Follower);

        if term_advanced {
            self.term = term;
            self.voted_for = None;
            self.leader = None;
            if !self.persist_term_or_die() {
                return;
            }
        }

        let was_leader = matches!(old_role, RoleState::Leader(_));
        if let RoleState::Leader(mut leader_state) = old_role {
            leader_state.query_state.fail_all(RaftError::NotLeader { leader: self.leader });
        }

        if term_advanced {
            if let Some(transfer) = self.leadership_transfer.take() {
                // The very point of the transfer: another leader took over.
                let _ = transfer.responder.send(Ok(Ordered::new(self.commit_index, ())));
            }
        } else if was_leader {
            // A same-term demotion (lost majority) abandons the transfer.
            if let Some(transfer) = self.leadership_transfer.take() {
                let _ = transfer.responder.send(Err(RaftError::NotLeader { leader: self.leader }));
            }
        }

        self.publish_report(ReportReason::RoleChange);
    }

    /// Switch to the leader role: install per-follower state, append the new
    /// term operation if the state machine defines one, and announce
    /// leadership with an immediate broadcast.
    pub(crate) fn to_leader(&mut self) {
        tracing::info!(term = self.term, "became leader");
        self.leader = Some(self.id);
        self.last_leader_heartbeat = None;
        let last_log_index = self.log.last_index();
        self.role = RoleState::Leader(LeaderState::new(
            self.effective_members.remote_members(self.id),
            last_log_index,
            last_log_index,
        ));

        if let Some(operation) = self.state_machine.new_term_operation() {
            if let Err(err) = self.append_entry_as_leader(EntryPayload::Normal(operation)) {
                tracing::error!(error = %err, "could not append the new term entry");
            }
        }

        self.broadcast_append_entries();
        self.publish_report(ReportReason::RoleChange);

        if self.flush_task_enabled {
            self.submit_leader_flush_task();
        } else {
            self.try_advance_commit_index();
        }
    }

    /// Switch to the candidate role and start a leader election for the next
    /// term. Ordinary elections are sticky; elections triggered by a
    /// leadership transfer are not.
    pub(crate) fn to_candidate(&mut self, sticky: bool) {
        self.leader = None;
        self.term += 1;
        self.voted_for = Some(self.id);
        if !self.persist_term_or_die() {
            return;
        }
        self.role = RoleState::Candidate(ElectionState::new(self.id));

        tracing::info!(
            term = self.term,
            last_log_index = self.log.last_index(),
            last_log_term = self.log.last_term(),
            sticky,
            "leader election started"
        );

        let request = crate::messages::VoteRequest {
            group_id: self.group_id,
            sender: self.id,
            term: self.term,
            last_log_term: self.log.last_term(),
            last_log_index: self.log.last_index(),
            sticky,
        };
        for member in self.effective_members.remote_members(self.id) {
            self.runtime.send(member, RaftMessage::VoteRequest(request.clone()));
        }
        self.publish_report(ReportReason::RoleChange);

        self.schedule(
            Duration::from_millis(self.config.rand_election_timeout_millis()),
            RaftMsg::ElectionTimeout { term: self.term },
        );

        if self.effective_members.majority() == 1 {
            self.to_leader();
        }
    }

    /// Start a pre-vote round for the next term, checking electability
    /// without inflating anyone's durable term.
    pub(crate) fn pre_candidate(&mut self) {
        self.role = RoleState::PreCandidate(ElectionState::new(self.id));
        let next_term = self.term + 1;

        tracing::info!(
            next_term,
            last_log_index = self.log.last_index(),
            last_log_term = self.log.last_term(),
            "pre-vote started"
        );

        let request = crate::messages::PreVoteRequest {
            group_id: self.group_id,
            sender: self.id,
            term: next_term,
            last_log_term: self.log.last_term(),
            last_log_index: self.log.last_index(),
        };
        for member in self.effective_members.remote_members(self.id) {
            self.runtime.send(member, RaftMessage::PreVoteRequest(request.clone()));
        }
        self.publish_report(ReportReason::RoleChange);

        self.schedule(
            Duration::from_millis(self.config.rand_election_timeout_millis()),
            RaftMsg::PreVoteTimeout { term: self.term },
        );

        if self.effective_members.majority() == 1 {
            self.to_candidate(true);
        }
    }

    /// Record a newly discovered leader.
    pub(crate) fn update_leader(&mut self, endpoint: NodeId) {
        if self.leader != Some(endpoint) {
            self.leader = Some(endpoint);
            self.publish_report(ReportReason::RoleChange);
        }
    }

    /// Update the last leader heartbeat timestamp to now.
    pub(crate) fn leader_heartbeat_received(&mut self) {
        self.last_leader_heartbeat = Some(Instant::now());
    }

    pub(crate) fn is_leader_heartbeat_timeout_elapsed(&self) -> bool {
        match self.last_leader_heartbeat {
            Some(at) => {
                at.elapsed() >= Duration::from_millis(self.config.leader_heartbeat_timeout_millis)
            }
            None => true,
        }
    }

    // ------------------------------------------------------------------
    // Timer events.

    /// The periodic tick, running on every role: the leader refreshes its
    /// followers and checks its own liveness; everyone else checks whether a
    /// leader is still around and starts a pre-vote when it is not.
    fn handle_heartbeat_tick(&mut self) {
        self.schedule(
            Duration::from_millis(self.config.leader_heartbeat_period_millis),
            RaftMsg::HeartbeatTick,
        );

        if self.role.is_leader() {
            if !self.demote_if_majority_heartbeat_timeout_elapsed() {
                self.broadcast_append_entries();
            }
            return;
        }

        if !matches!(self.role, RoleState::Follower) {
            return;
        }
        match self.leader {
            None => {
                tracing::warn!("follower without a leader, starting a new election round");
                self.pre_candidate();
            }
            Some(leader) => {
                if self.is_leader_heartbeat_timeout_elapsed() {
                    tracing::warn!(
                        leader,
                        "leader heartbeats timed out, starting a new election round"
                    );
                    self.leader = None;
                    self.publish_report(ReportReason::RoleChange);
                    self.pre_candidate();
                } else if !self.committed_members.contains(leader) {
                    tracing::warn!(
                        leader,
                        "leader is no longer a member, starting a new election round"
                    );
                    self.leader = None;
                    self.publish_report(ReportReason::RoleChange);
                    self.pre_candidate();
                }
            }
        }
    }

    /// Demote to follower when append entries responses from a majority have
    /// not arrived within the heartbeat timeout. Returns true if demoted.
    fn demote_if_majority_heartbeat_timeout_elapsed(&mut self) -> bool {
        let Some(leader_state) = self.role.leader_state() else {
            return true;
        };
        let majority_at = leader_state.majority_response_timestamp(
            &self.effective_members,
            self.id,
            self.effective_members.majority(),
        );
        let timeout = Duration::from_millis(self.config.leader_heartbeat_timeout_millis);
        if majority_at.elapsed() >= timeout {
            tracing::warn!(
                "no append entries responses from a majority recently, demoting to follower"
            );
            let term = self.term;
            self.to_follower(term);
            self.invalidate_futures_up_to(
                self.log.last_index(),
                RaftError::IndeterminateState { leader: None },
            );
            return true;
        }
        false
    }

    fn handle_election_timeout(&mut self, term: u64) {
        if self.term != term || !matches!(self.role, RoleState::Candidate(_)) {
            return;
        }
        tracing::warn!(term, "election timed out without a winner, restarting the probe");
        self.pre_candidate();
    }

    fn handle_pre_vote_timeout(&mut self, term: u64) {
        if self.term != term || !matches!(self.role, RoleState::PreCandidate(_)) {
            return;
        }
        if self.leader.is_some() {
            self.role = RoleState::Follower;
            return;
        }
        tracing::warn!(term, "pre-vote round timed out without a majority, retrying");
        self.pre_candidate();
    }

    fn handle_report_tick(&mut self) {
        self.schedule(
            Duration::from_secs(self.config.raft_node_report_publish_period_secs),
            RaftMsg::ReportTick,
        );
        self.publish_report(ReportReason::Periodic);
    }

    /// Flush the store and advance the leader's flushed index. Runs as a
    /// deferred task so the leader's disk I/O overlaps its followers'.
    fn handle_leader_flush(&mut self) {
        if self.role.leader_state().is_none() {
            return;
        }
        if let Err(err) = self.store.flush() {
            self.fatal_store_error("flushing the log", err);
            return;
        }
        let last_log_index = self.log.last_index();
        if let Some(leader_state) = self.role.leader_state_mut() {
            leader_state.flush_task_submitted = false;
            leader_state.flushed_log_index = last_log_index;
        }
        self.try_advance_commit_index();
    }

    // ------------------------------------------------------------------
    // Commit tracking and the applier.

    /// Advance the commit index to the highest log index replicated on a
    /// majority, provided the entry there carries the current term. Entries
    /// from earlier terms are only ever committed indirectly (§5.4).
    pub(crate) fn try_advance_commit_index(&mut self) -> bool {
        let Some(leader_state) = self.role.leader_state() else {
            return false;
        };
        let leader_index = if self.effective_members.contains(self.id) {
            // Raft dissertation §10.2.1: the leader may commit an entry before
            // it reaches its own disk once a majority of followers have it.
            Some(if self.flush_task_enabled {
                leader_state.flushed_log_index
            } else {
                self.log.last_index()
            })
        } else {
            None
        };
        let mut quorum_match_index =
            leader_state.quorum_match_index(&self.effective_members, self.id, leader_index);

        while quorum_match_index > self.commit_index {
            if self.log.entry_term(quorum_match_index) == Some(self.term) {
                self.commit_entries(quorum_match_index);
                return true;
            }
            quorum_match_index -= 1;
        }
        false
    }

    fn commit_entries(&mut self, commit_index: u64) {
        tracing::debug!(commit_index, "commit index advanced");
        self.commit_index = commit_index;

        // A committed group operation may flip the status; queries already
        // acknowledged must still run even when the group terminates here.
        if self.status == NodeStatus::Active {
            self.apply_log_entries();
            self.try_run_queries();
        } else {
            self.try_run_queries();
            self.apply_log_entries();
        }

        self.broadcast_append_entries();
    }

    /// Apply the committed entries between `last_applied` and `commit_index`
    /// to the state machine, resolving their futures.
    pub(crate) fn apply_log_entries(&mut self) {
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let Some(entry) = self.log.get(index).cloned() else {
                tracing::error!(index, "missing committed log entry, cannot apply");
                return;
            };
            self.apply_log_entry(entry);
            self.last_applied = index;
        }

        if !matches!(self.role, RoleState::Candidate(_)) {
            self.try_take_snapshot();
        }
    }

    fn apply_log_entry(&mut self, entry: LogEntry<D>) {
        tracing::debug!(index = entry.index, "applying log entry");
        match entry.payload {
            EntryPayload::Normal(operation) => {
                match self.state_machine.apply(entry.index, &operation) {
                    Ok(result) => {
                        if let Some(responder) = self.futures.remove(&entry.index) {
                            match responder {
                                Responder::Apply(tx) => {
                                    let _ = tx.send(Ok(Ordered::new(entry.index, result)));
                                }
                                other => other.fail(RaftError::internal(
                                    "operation committed with a mismatching responder",
                                )),
                            }
                        }
                    }
                    Err(err) => {
                        tracing::error!(
                            index = entry.index,
                            error = %err,
                            "state machine failed to apply operation"
                        );
                        if let Some(responder) = self.futures.remove(&entry.index) {
                            responder.fail(RaftError::Internal(err));
                        }
                    }
                }
            }
            EntryPayload::UpdateMembers(op) => {
                if self.effective_members.log_index < entry.index {
                    self.set_status(NodeStatus::UpdatingGroupMembers);
                    self.update_effective_members(entry.index, op.members.clone());
                }
                self.commit_effective_members();

                if op.endpoint == self.id && op.mode == MembershipChangeMode::RemoveMember {
                    self.set_status(NodeStatus::Terminated);
                } else {
                    self.set_status(NodeStatus::Active);
                }

                if let Some(responder) = self.futures.remove(&entry.index) {
                    match responder {
                        Responder::Members(tx) => {
                            let _ = tx.send(Ok(Ordered::new(
                                entry.index,
                                self.committed_members.clone(),
                            )));
                        }
                        other => other.fail(RaftError::internal(
                            "membership change committed with a mismatching responder",
                        )),
                    }
                }
            }
            EntryPayload::TerminateGroup => {
                self.set_status(NodeStatus::Terminated);
                self.runtime.on_group_terminated();
                if let Some(responder) = self.futures.remove(&entry.index) {
                    match responder {
                        Responder::Done(tx) => {
                            let _ = tx.send(Ok(Ordered::new(entry.index, ())));
                        }
                        other => other.fail(RaftError::internal(
                            "group termination committed with a mismatching responder",
                        )),
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Group membership bookkeeping.

    /// Install a new effective member list, keeping the leader's per-follower
    /// state in sync with it.
    pub(crate) fn update_effective_members(
        &mut self,
        log_index: u64,
        members: std::collections::BTreeSet<NodeId>,
    ) {
        self.effective_members = GroupMembers::new(log_index, members);
        self.sync_leader_followers();
        self.publish_report(ReportReason::GroupMembersChange);
    }

    /// Revert the effective members to the committed members after an
    /// uncommitted `UpdateMembers` entry was truncated.
    pub(crate) fn revert_effective_members(&mut self) {
        self.effective_members = self.committed_members.clone();
        self.sync_leader_followers();
        self.publish_report(ReportReason::GroupMembersChange);
    }

    fn commit_effective_members(&mut self) {
        self.committed_members = self.effective_members.clone();
        self.publish_report(ReportReason::GroupMembersChange);
    }

    fn sync_leader_followers(&mut self) {
        let last_log_index = self.log.last_index();
        let members = self.effective_members.members.clone();
        let local = self.id;
        if let Some(leader_state) = self.role.leader_state_mut() {
            leader_state.followers.retain(|id, _| members.contains(id));
            for member in members {
                if member != local {
                    leader_state
                        .followers
                        .entry(member)
                        .or_insert_with(|| FollowerState::new(last_log_index + 1));
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Futures registry.

    /// Register the future of an in-flight operation under its log index.
    pub(crate) fn register_future(&mut self, index: u64, responder: Responder<R>) {
        let prev = self.futures.insert(index, responder);
        debug_assert!(prev.is_none(), "exactly one future per log index");
    }

    /// Fail the futures at or above `index`; used when a suffix of the log is
    /// truncated or the node steps away from leadership.
    pub(crate) fn invalidate_futures_from(&mut self, index: u64, err: RaftError) {
        let invalidated: Vec<u64> = self.futures.range(index..).map(|(i, _)| *i).collect();
        for i in &invalidated {
            if let Some(responder) = self.futures.remove(i) {
                responder.fail(err.clone());
            }
        }
        if !invalidated.is_empty() {
            tracing::warn!(
                from = index,
                count = invalidated.len(),
                "invalidated pending futures"
            );
        }
    }

    /// Fail the futures at or below `index`; used when a snapshot supersedes
    /// a span of the log whose outcomes were never observed locally.
    pub(crate) fn invalidate_futures_up_to(&mut self, index: u64, err: RaftError) {
        let invalidated: Vec<u64> = self.futures.range(..=index).map(|(i, _)| *i).collect();
        for i in &invalidated {
            if let Some(responder) = self.futures.remove(i) {
                responder.fail(err.clone());
            }
        }
        if !invalidated.is_empty() {
            tracing::warn!(
                up_to = index,
                count = invalidated.len(),
                "invalidated pending futures"
            );
        }
    }

    // ------------------------------------------------------------------
    // Status, persistence, reporting.

    pub(crate) fn set_status(&mut self, status: NodeStatus) {
        if self.status == status {
            return;
        }
        if self.status.is_terminal() {
            tracing::warn!(?status, "ignoring status change on a terminated node");
            return;
        }
        self.status = status;
        if status == NodeStatus::Active {
            tracing::info!(?status, "status changed");
        } else {
            tracing::warn!(?status, "status changed");
        }
        self.publish_report(ReportReason::StatusChange);
    }

    /// Persist the current term and vote. A failure here is fatal: the node
    /// cannot safely keep participating without its durable term record.
    pub(crate) fn persist_term_or_die(&mut self) -> bool {
        match self.store.persist_term(self.term, self.voted_for) {
            Ok(()) => true,
            Err(err) => {
                self.fatal_store_error("persisting term and vote", err);
                false
            }
        }
    }

    /// Terminate the node after an unrecoverable store failure.
    pub(crate) fn fatal_store_error(&mut self, action: &str, err: std::io::Error) {
        tracing::error!(error = %err, action, "fatal store error, terminating node");
        let leader = self.leader_hint();
        let error = RaftError::internal(format!("store failure while {action}: {err}"));
        for (_, responder) in std::mem::take(&mut self.futures) {
            responder.fail(error.clone());
        }
        if let Some(leader_state) = self.role.leader_state_mut() {
            leader_state.query_state.fail_all(RaftError::NotLeader { leader });
        }
        self.set_status(NodeStatus::Terminated);
    }

    /// The leader to point callers at, if one is known and the node is not
    /// itself terminal.
    pub(crate) fn leader_hint(&self) -> Option<NodeId> {
        if self.status.is_terminal() {
            None
        } else {
            self.leader
        }
    }

    pub(crate) fn not_leader_error(&self) -> RaftError {
        RaftError::NotLeader { leader: self.leader_hint() }
    }

    pub(crate) fn cannot_replicate_error(&self) -> RaftError {
        RaftError::CannotReplicate { leader: self.leader_hint() }
    }

    /// Shut the node down on API request.
    fn handle_terminate(&mut self) {
        if self.status.is_terminal() {
            return;
        }
        let err = self.not_leader_error();
        self.invalidate_futures_from(self.commit_index + 1, err.clone());
        if let Some(leader_state) = self.role.leader_state_mut() {
            leader_state.query_state.fail_all(err.clone());
        }
        if let Some(transfer) = self.leadership_transfer.take() {
            let _ = transfer.responder.send(Err(err));
        }
        self.set_status(NodeStatus::Terminated);
    }

    pub(crate) fn new_report(&self, reason: ReportReason) -> RaftNodeReport {
        RaftNodeReport {
            reason,
            group_id: self.group_id,
            endpoint: self.id,
            initial_members: self.initial_members.clone(),
            committed_members: self.committed_members.clone(),
            effective_members: self.effective_members.clone(),
            role: self.role.role(),
            status: self.status,
            term: self.term,
            voted_for: self.voted_for,
            leader: self.leader,
            log: LogStats {
                commit_index: self.commit_index,
                last_log_index: self.log.last_index(),
                last_log_term: self.log.last_term(),
                snapshot_index: self.log.snapshot_index(),
                take_snapshot_count: self.take_snapshot_count,
                install_snapshot_count: self.install_snapshot_count,
            },
        }
    }

    pub(crate) fn publish_report(&self, reason: ReportReason) {
        let report = self.new_report(reason);
        let _ = self.tx_report.send(report.clone());
        self.runtime.on_report(report);
    }
}
