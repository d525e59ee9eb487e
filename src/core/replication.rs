//! Outbound replication: append entries construction, batching, per-follower
//! backoff, and the leader flush task.

use std::cmp::min;
use std::time::Duration;

use crate::core::{RaftCore, RaftMsg};
use crate::messages::{AppendEntriesRequest, InstallSnapshotRequest, RaftMessage};
use crate::runtime::RaftRuntime;
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
    /// Send append entries requests to every follower, each according to its
    /// own replication position.
    pub(crate) fn broadcast_append_entries(&mut self) {
        let followers: Vec<NodeId> = match self.role.leader_state() {
            Some(leader_state) => leader_state.followers.keys().copied().collect(),
            None => return,
        };
        for follower in followers {
            self.send_append_entries(follower);
        }
    }

    /// Send one append entries request to the given follower.
    ///
    /// Entries between the follower's `next_index` and the last appended index
    /// are sent as a batch of at most `append_entries_request_batch_size`.
    /// If `next_index` has already been compacted into the snapshot, an empty
    /// [`InstallSnapshotRequest`] is sent instead to trigger the snapshot
    /// installation process. Until the follower's match index is discovered,
    /// only empty probes are sent to save bandwidth.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(crate) fn send_append_entries(&mut self, follower: NodeId) {
        let Some(leader_state) = self.role.leader_state() else {
            return;
        };
        let Some(follower_state) = leader_state.followers.get(&follower) else {
            return;
        };
        if follower_state.is_request_backoff_set() {
            // The follower has not responded to the last request yet; a new
            // one goes out when it responds or its backoff elapses.
            return;
        }
        let next_index = follower_state.next_index;
        let match_index = follower_state.match_index;
        let flushed_log_index = leader_state.flushed_log_index;
        let query_round = leader_state.query_state.query_round();

        // If the entry at next_index (or the one before it, needed as the
        // previous-log position) is gone into the snapshot, the follower
        // needs the snapshot itself.
        if next_index <= self.log.snapshot_index()
            && (!self.log.contains_entry(next_index)
                || (next_index > 1 && !self.log.contains_entry(next_index - 1)))
        {
            let snapshot = self.log.snapshot_entry();
            let request = InstallSnapshotRequest {
                group_id: self.group_id,
                sender: self.id,
                term: self.term,
                snapshot_index: snapshot.index,
                snapshot_term: snapshot.term,
                total_chunk_count: snapshot.chunks.len() as u32,
                chunks: Vec::new(),
                group_members_log_index: snapshot.group_members_log_index,
                group_members: snapshot.group_members.clone(),
                query_round,
            };
            tracing::debug!(
                follower,
                next_index,
                snapshot_index = request.snapshot_index,
                "triggering snapshot installation"
            );
            self.runtime.send(follower, RaftMessage::InstallSnapshotRequest(request));
            if let Some(leader_state) = self.role.leader_state_mut() {
                if let Some(follower_state) = leader_state.follower_state_mut(follower) {
                    follower_state.set_max_request_backoff();
                }
            }
            self.schedule_backoff_reset_task();
            return;
        }

        let last_log_index = self.log.last_index();
        let batch_size = self.config.append_entries_request_batch_size;
        let mut prev_log_index = 0;
        let mut prev_log_term = 0;
        let entries;
        let mut arm_backoff = true;

        if next_index > 1 {
            prev_log_index = next_index - 1;
            let Some(term) = self.log.entry_term(prev_log_index) else {
                tracing::warn!(follower, prev_log_index, "previous entry not available, skipping send");
                return;
            };
            prev_log_term = term;

            if match_index == 0 {
                // The follower's match index is unknown: probe with an empty
                // request until it is discovered, but keep the backoff armed
                // so the follower is not bombarded meanwhile.
                entries = Vec::new();
            } else if next_index <= last_log_index {
                let end = min(next_index + batch_size - 1, last_log_index);
                entries = self.log.get_range(next_index, end);
            } else {
                // Caught up: a plain heartbeat.
                entries = Vec::new();
                arm_backoff = false;
            }
        } else if last_log_index > 0 {
            // First entries ever sent to this follower.
            let end = min(batch_size, last_log_index);
            entries = self.log.get_range(1, end);
        } else {
            // Nothing in the log yet: a plain heartbeat.
            entries = Vec::new();
            arm_backoff = false;
        }

        // Sending entries the leader has not flushed yet: enqueue the flush
        // task now so the local disk write overlaps the followers' I/O.
        if let Some(last) = entries.last() {
            if self.flush_task_enabled && last.index > flushed_log_index {
                self.submit_leader_flush_task();
            }
        }

        let request = AppendEntriesRequest {
            group_id: self.group_id,
            sender: self.id,
            term: self.term,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit_index: self.commit_index,
            query_round,
        };
        tracing::trace!(follower, next_index, count = request.entries.len(), "sending append entries");

        if arm_backoff {
            if let Some(leader_state) = self.role.leader_state_mut() {
                if let Some(follower_state) = leader_state.follower_state_mut(follower) {
                    follower_state.set_request_backoff();
                }
            }
            self.schedule_backoff_reset_task();
        }

        self.runtime.send(follower, RaftMessage::AppendEntriesRequest(request));
    }

    /// Schedule the backoff reset task if it is not already pending.
    pub(crate) fn schedule_backoff_reset_task(&mut self) {
        let delay = Duration::from_millis(self.config.leader_backoff_duration_millis);
        let Some(leader_state) = self.role.leader_state_mut() else {
            return;
        };
        if leader_state.backoff_reset_scheduled {
            return;
        }
        leader_state.backoff_reset_scheduled = true;
        self.schedule(delay, RaftMsg::BackoffReset);
    }

    /// Complete one backoff round for every follower with an in-flight
    /// request, re-sending to those whose backoff has fully elapsed.
    pub(crate) fn handle_backoff_reset(&mut self) {
        let Some(leader_state) = self.role.leader_state_mut() else {
            return;
        };
        leader_state.backoff_reset_scheduled = false;

        let mut resend = Vec::new();
        let mut still_backed_off = false;
        for (follower, follower_state) in leader_state.followers.iter_mut() {
            if !follower_state.is_request_backoff_set() {
                continue;
            }
            if follower_state.complete_backoff_round() {
                // No response to the last request: send another one.
                resend.push(*follower);
            } else {
                still_backed_off = true;
            }
        }

        for follower in resend {
            self.send_append_entries(follower);
        }
        if still_backed_off {
            self.schedule_backoff_reset_task();
        }
    }

    /// Enqueue the leader flush task, at most once at a time.
    pub(crate) fn submit_leader_flush_task(&mut self) {
        if !self.flush_task_enabled {
            return;
        }
        let Some(leader_state) = self.role.leader_state_mut() else {
            return;
        };
        if leader_state.flush_task_submitted {
            return;
        }
        leader_state.flush_task_submitted = true;
        let _ = self.tx_event.send(RaftMsg::LeaderFlush);
    }
}
