//! Handling of client-facing operations: replication, queries, membership
//! changes, and leadership transfer.

use std::time::Duration;

use tokio::sync::oneshot;

use crate::core::{RaftCore, RaftMsg, Responder};
use crate::entry::{EntryPayload, LogEntry, MembershipChangeMode, UpdateMembersOp};
use crate::error::{Ordered, RaftError, RaftResult};
use crate::messages::{RaftMessage, TriggerLeaderElection};
use crate::raft::QueryPolicy;
use crate::runtime::RaftRuntime;
use crate::state::{GroupMembers, LeadershipTransferState, NodeStatus, QueryResponder};
use crate::state_machine::StateMachine;
use crate::storage::RaftStore;
use crate::{AppData, AppDataResponse, NodeId};

impl<D, R, SM, S, RT> RaftCore<D, R, SM, S, RT>
where
    D: AppData,
    R: AppDataResponse,
    SM: StateMachine<D, R>,
    S: RaftStore<D>,
    RT: RaftRuntime<D>,
{
    // ------------------------------------------------------------------
    // Replication.

    /// Append an operation to the log and start replicating it. The future
    /// resolves once the entry commits and is applied.
    #[tracing::instrument(level = "trace", skip(self, payload, responder))]
    pub(crate) fn handle_replicate(&mut self, payload: EntryPayload<D>, responder: Responder<R>) {
        if !self.role.is_leader() {
            responder.fail(self.not_leader_error());
            return;
        }
        if !self.can_replicate(&payload) {
            responder.fail(self.cannot_replicate_error());
            return;
        }
        match self.append_entry_as_leader(payload) {
            Ok(index) => {
                self.register_future(index, responder);
                self.kick_replication_after_append();
            }
            Err(err) => responder.fail(err),
        }
    }

    /// Whether a new operation may be appended right now.
    ///
    /// Replication is refused when the uncommitted-entry budget is spent,
    /// while the group is terminating, while a membership change is in flight
    /// (for group operations, or always when the local node is no longer an
    /// effective member), and while a leadership transfer is pending. A
    /// membership change additionally requires a committed entry of the
    /// current term.
    fn can_replicate(&self, payload: &EntryPayload<D>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        if self.log.last_index() - self.commit_index >= self.config.max_uncommitted_log_entry_count
        {
            return false;
        }

        match self.status {
            NodeStatus::TerminatingGroup => return false,
            NodeStatus::UpdatingGroupMembers => {
                return self.effective_members.contains(self.id) && !payload.is_group_op();
            }
            _ => {}
        }

        if matches!(payload, EntryPayload::UpdateMembers(_)) {
            // A membership change may only start once the leader has
            // committed an entry of its own term:
            // https://groups.google.com/forum/#!msg/raft-dev/t4xj6dJTP6E/d2D9LrWRza8J
            return self.last_committed_entry_term() == Some(self.term);
        }

        self.leadership_transfer.is_none()
    }

    /// The term of the entry at the commit index, wherever it lives.
    fn last_committed_entry_term(&self) -> Option<u64> {
        self.log.entry_term(self.commit_index)
    }

    /// Create the next log entry, persist it, and pre-apply any group
    /// operation it carries.
    pub(crate) fn append_entry_as_leader(&mut self, payload: EntryPayload<D>) -> RaftResult<u64> {
        let index = self.log.last_index() + 1;
        let entry = LogEntry { index, term: self.term, payload: payload.clone() };
        if self.log.append(entry.clone()).is_err() {
            return Err(self.cannot_replicate_error());
        }
        if let Err(err) = self.store.persist_entries(std::slice::from_ref(&entry)) {
            self.fatal_store_error("persisting a new log entry", err);
            return Err(RaftError::internal("log entry persistence failed"));
        }
        self.pre_apply_group_op(index, payload);
        Ok(index)
    }

    /// Drive a freshly appended entry towards commit: replicate to followers
    /// when there are any, otherwise flush (or commit outright for a
    /// non-persistent single-member group).
    fn kick_replication_after_append(&mut self) {
        let has_followers =
            self.role.leader_state().map(|ls| !ls.followers.is_empty()).unwrap_or(false);
        if has_followers {
            self.broadcast_append_entries();
        } else if self.flush_task_enabled {
            self.submit_leader_flush_task();
        } else {
            self.try_advance_commit_index();
        }
    }

    // ------------------------------------------------------------------
    // Queries.

    /// Run or enqueue a query according to its policy.
    #[tracing::instrument(level = "trace", skip(self, operation, tx))]
    pub(crate) fn handle_query(
        &mut self,
        operation: D,
        policy: QueryPolicy,
        min_commit_index: u64,
        tx: QueryResponder<R>,
    ) {
        match policy {
            QueryPolicy::AnyLocal => self.run_query(operation, min_commit_index, tx),
            QueryPolicy::LeaderLocal => {
                if !self.role.is_leader() {
                    let _ = tx.send(Err(self.not_leader_error()));
                    return;
                }
                if self.commit_index < min_commit_index {
                    let _ = tx.send(Err(RaftError::LaggingCommitIndex {
                        commit_index: self.commit_index,
                        expected: min_commit_index,
                        leader: self.leader_hint(),
                    }));
                    return;
                }
                if !self.can_enqueue_query() {
                    let _ = tx.send(Err(self.cannot_replicate_error()));
                    return;
                }

                let commit_index = self.commit_index;
                let majority = self.effective_members.majority();
                let leader_state =
                    self.role.leader_state_mut().expect("leader role was just checked");
                let query_round =
                    leader_state.query_state.add_query(commit_index, operation, tx);
                tracing::trace!(query_round, "query waiting for round acknowledgment");

                if leader_state.query_state.is_majority_ack_received(commit_index, majority) {
                    // A single-member group needs no round trip.
                    self.try_run_queries();
                } else {
                    self.broadcast_append_entries();
                }
            }
        }
    }

    /// Whether a new linearizable query may be enqueued without appending to
    /// the log.
    ///
    /// The leader must have committed an entry of its own term (§6.4 of the
    /// Raft dissertation) before serving reads; the one exception is a group
    /// whose log is empty everywhere — an empty log elected this leader, so
    /// there is nothing committed anywhere for a read to miss. The number of
    /// batched queries shares the `max_uncommitted_log_entry_count` budget
    /// with replication.
    fn can_enqueue_query(&self) -> bool {
        let term_committed = if self.commit_index == 0 && self.log.last_index() == 0 {
            true
        } else {
            self.last_committed_entry_term() == Some(self.term)
        };
        if !term_committed {
            return false;
        }

        match self.role.leader_state() {
            Some(leader_state) => {
                (leader_state.query_state.query_count() as u64)
                    < self.config.max_uncommitted_log_entry_count
            }
            None => false,
        }
    }

    /// Execute the batched queries once a majority has acknowledged the
    /// current round and the required commit index is reached.
    pub(crate) fn try_run_queries(&mut self) {
        let commit_index = self.commit_index;
        let majority = self.effective_members.majority();
        let Some(leader_state) = self.role.leader_state_mut() else {
            return;
        };
        if leader_state.query_state.query_count() == 0 {
            return;
        }
        if !leader_state.query_state.is_majority_ack_received(commit_index, majority) {
            return;
        }

        let queries = leader_state.query_state.take_queries();
        tracing::debug!(
            count = queries.len(),
            commit_index,
            "running batched linearizable queries"
        );
        for (operation, tx) in queries {
            self.run_query(operation, 0, tx);
        }
    }

    /// Execute a query against the state machine at the local commit index.
    ///
    /// The operation must not mutate the state machine.
    pub(crate) fn run_query(&mut self, operation: D, min_commit_index: u64, tx: QueryResponder<R>) {
        let commit_index = self.commit_index;
        if commit_index < min_commit_index {
            let _ = tx.send(Err(RaftError::LaggingCommitIndex {
                commit_index,
                expected: min_commit_index,
                leader: self.leader_hint(),
            }));
            return;
        }
        match self.state_machine.apply(commit_index, &operation) {
            Ok(result) => {
                let _ = tx.send(Ok(Ordered::new(commit_index, result)));
            }
            Err(err) => {
                let _ = tx.send(Err(RaftError::Internal(err)));
            }
        }
    }

    // ------------------------------------------------------------------
    // Membership changes.

    /// Propose a single-server membership change against the expected
    /// committed member list.
    #[tracing::instrument(level = "debug", skip(self, tx))]
    pub(crate) fn handle_change_membership(
        &mut self,
        endpoint: NodeId,
        mode: MembershipChangeMode,
        expected_commit_index: u64,
        tx: oneshot::Sender<RaftResult<Ordered<GroupMembers>>>,
    ) {
        if !self.role.is_leader() {
            let _ = tx.send(Err(self.not_leader_error()));
            return;
        }
        if expected_commit_index != self.committed_members.log_index {
            let _ = tx.send(Err(RaftError::MismatchingGroupMembersCommitIndex {
                expected: expected_commit_index,
                actual: self.committed_members.log_index,
            }));
            return;
        }

        let mut members = self.committed_members.members.clone();
        let changed = match mode {
            MembershipChangeMode::AddMember => members.insert(endpoint),
            MembershipChangeMode::RemoveMember => members.remove(&endpoint),
        };
        if !changed {
            let verb = match mode {
                MembershipChangeMode::AddMember => "already",
                MembershipChangeMode::RemoveMember => "not",
            };
            let _ = tx.send(Err(RaftError::internal(format!(
                "endpoint {endpoint} is {verb} a member of the group"
            ))));
            return;
        }

        let payload =
            EntryPayload::UpdateMembers(UpdateMembersOp { endpoint, mode, members });
        if !self.can_replicate(&payload) {
            let _ = tx.send(Err(self.cannot_replicate_error()));
            return;
        }

        match self.append_entry_as_leader(payload) {
            Ok(index) => {
                self.register_future(index, Responder::Members(tx));
                self.kick_replication_after_append();
            }
            Err(err) => {
                let _ = tx.send(Err(err));
            }
        }
    }

    // ------------------------------------------------------------------
    // Leadership transfer.

    /// Start transferring leadership to the given endpoint.
    #[tracing::instrument(level = "debug", skip(self, tx))]
    pub(crate) fn handle_transfer_leadership(
        &mut self,
        endpoint: NodeId,
        tx: oneshot::Sender<RaftResult<Ordered<()>>>,
    ) {
        if !self.role.is_leader() {
            let _ = tx.send(Err(self.not_leader_error()));
            return;
        }
        if !self.committed_members.contains(endpoint) {
            let _ = tx.send(Err(RaftError::internal(format!(
                "cannot transfer leadership to {endpoint}, not in the committed member list"
            ))));
            return;
        }
        if self.status != NodeStatus::Active {
            let _ = tx.send(Err(RaftError::internal(format!(
                "cannot transfer leadership while the node status is {:?}",
                self.status
            ))));
            return;
        }
        if endpoint == self.id {
            tracing::debug!("already the leader, nothing to transfer");
            let _ = tx.send(Ok(Ordered::new(self.commit_index, ())));
            return;
        }
        if self.leadership_transfer.is_some() {
            let _ = tx.send(Err(self.cannot_replicate_error()));
            return;
        }

        self.leadership_transfer = Some(LeadershipTransferState::new(endpoint, tx));
        self.do_transfer_leadership();
    }

    /// One attempt of an in-flight leadership transfer; re-scheduled with a
    /// growing delay until the target takes over or the attempts run out.
    pub(crate) fn do_transfer_leadership(&mut self) {
        if !self.role.is_leader() {
            // Demotion resolved the transfer future already.
            tracing::debug!("not retrying leadership transfer, no longer the leader");
            return;
        }
        let Some(transfer) = self.leadership_transfer.as_mut() else {
            return;
        };

        if !transfer.retry() {
            let transfer = self.leadership_transfer.take().expect("transfer state present");
            tracing::warn!(target = transfer.endpoint, "leadership transfer timed out");
            let _ = transfer
                .responder
                .send(Err(RaftError::internal("leadership transfer timed out")));
            return;
        }

        let target = transfer.endpoint;
        let try_count = transfer.try_count;
        let delay = Duration::from_millis(
            transfer.retry_delay_millis(self.config.rand_election_timeout_millis()),
        );

        if self.commit_index < self.log.last_index() {
            tracing::warn!(
                target,
                "waiting for appended entries to commit before transferring leadership"
            );
            self.schedule(delay, RaftMsg::TransferRetry);
            return;
        }

        if try_count > 1 {
            tracing::debug!(target, try_count, "retrying leadership transfer");
        } else {
            tracing::info!(target, "transferring leadership");
        }

        // Clear any backoff so the target gets a fresh append entries request
        // carrying the final log position, then tell it to campaign.
        if let Some(leader_state) = self.role.leader_state_mut() {
            if let Some(follower_state) = leader_state.follower_state_mut(target) {
                follower_state.response_received();
            }
        }
        self.send_append_entries(target);

        let request = TriggerLeaderElection {
            group_id: self.group_id,
            sender: self.id,
            term: self.term,
            last_log_term: self.log.last_term(),
            last_log_index: self.log.last_index(),
        };
        self.runtime.send(target, RaftMessage::TriggerLeaderElection(request));

        self.schedule(delay, RaftMsg::TransferRetry);
    }
}
