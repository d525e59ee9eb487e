//! Handlers for append entries requests and their success/failure responses.

use std::cmp::min;

use crate::core::RaftCore;
use crate::entry::{EntryPayload, LogEntry};
use crate::messages::{
    AppendEntriesFailure, AppendEntriesRequest, AppendEntriesSuccess, RaftMessage,
};
use crate::runtime::RaftRuntime;
use crate::state::{NodeStatus, RoleState};
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
    /// Handle an append entries request from the leader (§5.3): verify the
    /// previous-log position, truncate any conflicting suffix, append the new
    /// entries, persist them, and advance the local commit index.
    #[tracing::instrument(level = "trace", skip(self, req), fields(sender = req.sender, term = req.term))]
    pub(crate) fn handle_append_entries_request(&mut self, req: AppendEntriesRequest<D>) {
        if req.term < self.term {
            tracing::trace!("rejecting append entries from a stale term");
            self.send_append_entries_failure(req.sender, self.log.last_index() + 1, req.query_round);
            return;
        }

        if req.term > self.term || !matches!(self.role, RoleState::Follower) {
            self.to_follower(req.term);
            if self.status.is_terminal() {
                return;
            }
        }
        self.update_leader(req.sender);
        self.leader_heartbeat_received();

        // The receiver must find the exact entry at the request's previous
        // log position before anything may be appended after it.
        if req.prev_log_index > 0 {
            match self.log.entry_term(req.prev_log_index) {
                None => {
                    tracing::trace!(
                        prev_log_index = req.prev_log_index,
                        last_log_index = self.log.last_index(),
                        "no entry at the previous log index"
                    );
                    self.send_append_entries_failure(
                        req.sender,
                        self.log.last_index() + 1,
                        req.query_round,
                    );
                    return;
                }
                Some(local_term) if local_term != req.prev_log_term => {
                    tracing::trace!(
                        prev_log_index = req.prev_log_index,
                        local_term,
                        prev_log_term = req.prev_log_term,
                        "term mismatch at the previous log index"
                    );
                    self.send_append_entries_failure(req.sender, req.prev_log_index, req.query_round);
                    return;
                }
                Some(_) => {}
            }
        }

        // Skip entries already present; truncate at the first conflict.
        let mut first_new_index = None;
        for entry in &req.entries {
            if entry.index > self.log.last_index() {
                first_new_index = Some(entry.index);
                break;
            }
            if self.log.entry_term(entry.index) == Some(entry.term) {
                continue;
            }
            if entry.index <= self.commit_index {
                tracing::error!(
                    index = entry.index,
                    commit_index = self.commit_index,
                    "conflicting entry at or below the commit index, dropping request"
                );
                return;
            }
            let removed = self.log.truncate_from(entry.index);
            if let Err(err) = self.store.truncate_from(entry.index) {
                self.fatal_store_error("truncating the log", err);
                return;
            }
            tracing::warn!(from = entry.index, count = removed.len(), "truncated conflicting entries");
            self.revert_truncated_group_ops(&removed);
            self.invalidate_futures_from(entry.index, self.not_leader_error());
            first_new_index = Some(entry.index);
            break;
        }

        if let Some(first) = first_new_index {
            let new_entries: Vec<LogEntry<D>> =
                req.entries.iter().filter(|e| e.index >= first).cloned().collect();
            if !self.log.has_capacity_for(new_entries.len()) {
                // Stay silent; the leader's backoff recovers the exchange
                // once local commits open up log slots again.
                tracing::warn!(count = new_entries.len(), "log has no room for appended entries");
                return;
            }
            if let Err(err) = self.store.persist_entries(&new_entries) {
                self.fatal_store_error("persisting appended entries", err);
                return;
            }
            for entry in new_entries {
                let index = entry.index;
                let payload = entry.payload.clone();
                self.log.append(entry).expect("capacity was just checked");
                self.pre_apply_group_op(index, payload);
            }
            // Flush before acknowledging, so the leader may count this
            // follower towards a majority of flushed replicas.
            if self.flush_task_enabled {
                if let Err(err) = self.store.flush() {
                    self.fatal_store_error("flushing appended entries", err);
                    return;
                }
            }
        }

        let new_commit_index = min(req.leader_commit_index, self.log.last_index());
        if new_commit_index > self.commit_index {
            self.commit_index = new_commit_index;
            self.apply_log_entries();
        }

        let response = AppendEntriesSuccess {
            group_id: self.group_id,
            sender: self.id,
            term: self.term,
            last_log_index: self.log.last_index(),
            query_round: req.query_round,
        };
        self.runtime.send(req.sender, RaftMessage::AppendEntriesSuccess(response));
    }

    /// Handle a follower's acknowledgment: record its progress, count its
    /// query round ack, and try to advance the commit index.
    #[tracing::instrument(level = "trace", skip(self, resp), fields(sender = resp.sender))]
    pub(crate) fn handle_append_entries_success(&mut self, resp: AppendEntriesSuccess) {
        if resp.term > self.term {
            self.to_follower(resp.term);
            return;
        }
        let log_last_index = self.log.last_index();
        let Some(leader_state) = self.role.leader_state_mut() else {
            tracing::trace!("ignoring append entries response, not the leader");
            return;
        };
        let Some(follower_state) = leader_state.follower_state_mut(resp.sender) else {
            return;
        };
        follower_state.response_received();
        follower_state.match_index = follower_state.match_index.max(resp.last_log_index);
        follower_state.next_index = follower_state.next_index.max(resp.last_log_index + 1);

        self.try_ack_query_round(resp.query_round, resp.sender);

        let advanced = self.try_advance_commit_index();
        if !advanced && log_last_index > resp.last_log_index {
            // More entries are waiting for this follower.
            self.send_append_entries(resp.sender);
        }
    }

    /// Handle a follower's rejection: rewind its next index to the hinted
    /// position (or by one) and retry immediately.
    #[tracing::instrument(level = "trace", skip(self, resp), fields(sender = resp.sender))]
    pub(crate) fn handle_append_entries_failure(&mut self, resp: AppendEntriesFailure) {
        if resp.term > self.term {
            self.to_follower(resp.term);
            return;
        }
        let Some(leader_state) = self.role.leader_state_mut() else {
            tracing::trace!("ignoring append entries response, not the leader");
            return;
        };
        let Some(follower_state) = leader_state.follower_state_mut(resp.sender) else {
            return;
        };
        follower_state.response_received();
        if resp.expected_next_index > 0 && resp.expected_next_index <= follower_state.next_index {
            follower_state.next_index = resp.expected_next_index;
        } else if follower_state.next_index > 1 {
            follower_state.next_index -= 1;
        }
        tracing::debug!(
            follower = resp.sender,
            next_index = follower_state.next_index,
            "rewound follower next index"
        );

        self.try_ack_query_round(resp.query_round, resp.sender);
        self.send_append_entries(resp.sender);
    }

    /// Record a follower's acknowledgment of a query round and run the
    /// pending queries if the round just reached a majority.
    pub(crate) fn try_ack_query_round(&mut self, query_round: u64, sender: NodeId) {
        let Some(leader_state) = self.role.leader_state_mut() else {
            return;
        };
        if leader_state.query_state.try_ack(query_round, sender) {
            tracing::trace!(sender, query_round, "query round acknowledged");
            self.try_run_queries();
        }
    }

    pub(crate) fn send_append_entries_failure(
        &self,
        target: NodeId,
        expected_next_index: u64,
        query_round: u64,
    ) {
        let response = AppendEntriesFailure {
            group_id: self.group_id,
            sender: self.id,
            term: self.term,
            expected_next_index,
            query_round,
        };
        self.runtime.send(target, RaftMessage::AppendEntriesFailure(response));
    }

    /// Re-prepare state for group operations freshly appended from the
    /// leader, and for the leader's own appends.
    pub(crate) fn pre_apply_group_op(&mut self, index: u64, payload: EntryPayload<D>) {
        match payload {
            EntryPayload::UpdateMembers(op) => {
                self.set_status(NodeStatus::UpdatingGroupMembers);
                self.update_effective_members(index, op.members);
            }
            EntryPayload::TerminateGroup => {
                self.set_status(NodeStatus::TerminatingGroup);
            }
            EntryPayload::Normal(_) => {}
        }
    }

    /// Undo the effects of uncommitted group operations removed by a
    /// truncation.
    pub(crate) fn revert_truncated_group_ops(&mut self, removed: &[LogEntry<D>]) {
        for entry in removed {
            match entry.payload {
                EntryPayload::UpdateMembers(_) => {
                    tracing::warn!(index = entry.index, "reverting a truncated membership change");
                    self.revert_effective_members();
                    if self.status == NodeStatus::UpdatingGroupMembers {
                        self.set_status(NodeStatus::Active);
                    }
                }
                EntryPayload::TerminateGroup => {
                    if self.status == NodeStatus::TerminatingGroup {
                        self.set_status(NodeStatus::Active);
                    }
                }
                EntryPayload::Normal(_) => {}
            }
        }
    }
}
