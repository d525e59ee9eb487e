//! Snapshot capture, chunked installation, and the install snapshot handlers.

use crate::core::RaftCore;
use crate::entry::{SnapshotChunk, SnapshotEntry};
use crate::error::RaftError;
use crate::messages::{
    AppendEntriesSuccess, InstallSnapshotRequest, InstallSnapshotResponse, RaftMessage,
};
use crate::report::ReportReason;
use crate::runtime::RaftRuntime;
use crate::state::{NodeStatus, RoleState, SnapshotChunkCollector};
use crate::state_machine::StateMachine;
use crate::storage::RaftStore;
use crate::{AppData, AppDataResponse, GroupMembers, NodeId};

impl<D, R, SM, S, RT> RaftCore<D, R, SM, S, RT>
where
    D: AppData,
    R: AppDataResponse,
    SM: StateMachine<D, R>,
    S: RaftStore<D>,
    RT: RaftRuntime<D>,
{
    /// Take a snapshot once the commit index has advanced
    /// `commit_count_to_take_snapshot` past the previous snapshot.
    ///
    /// A tail of log entries is retained for followers whose match index is
    /// just behind the snapshot, so a short lag does not force a full
    /// snapshot transfer onto them.
    pub(crate) fn try_take_snapshot(&mut self) {
        if self.commit_index - self.log.snapshot_index() < self.config.commit_count_to_take_snapshot
        {
            return;
        }
        if self.status.is_terminal() {
            return;
        }

        let commit_index = self.commit_index;
        let Some(snapshot_term) = self.log.entry_term(commit_index) else {
            tracing::error!(commit_index, "no entry at the commit index, cannot snapshot");
            return;
        };

        let mut chunk_payloads: Vec<D> = Vec::new();
        if let Err(err) = self
            .state_machine
            .take_snapshot(commit_index, &mut |chunk| chunk_payloads.push(chunk))
        {
            tracing::error!(commit_index, error = %err, "state machine could not take a snapshot");
            return;
        }

        let members = self.committed_members.clone();
        let chunk_count = chunk_payloads.len() as u32;
        let chunks: Vec<SnapshotChunk<D>> = chunk_payloads
            .into_iter()
            .enumerate()
            .map(|(chunk_index, payload)| SnapshotChunk {
                index: commit_index,
                term: snapshot_term,
                chunk_index: chunk_index as u32,
                chunk_count,
                payload,
                group_members_log_index: members.log_index,
                group_members: members.members.clone(),
            })
            .collect();

        for chunk in &chunks {
            if let Err(err) = self.store.persist_snapshot_chunk(chunk) {
                tracing::error!(
                    commit_index,
                    chunk_index = chunk.chunk_index,
                    error = %err,
                    "could not persist snapshot chunk, abandoning this snapshot"
                );
                return;
            }
        }

        let snapshot = SnapshotEntry {
            index: commit_index,
            term: snapshot_term,
            chunks,
            group_members_log_index: members.log_index,
            group_members: members.members.clone(),
        };

        // Keep a tail of entries for followers lagging just behind the
        // snapshot. If any follower's match index is still unknown, its log
        // may be close, so the whole tail is kept. Otherwise keep from the
        // smallest match index inside the kept window, minus one so that the
        // entry at the smallest match index itself survives.
        let kept = self.config.kept_log_entry_count_after_snapshot();
        let mut highest_index_to_truncate = commit_index.saturating_sub(kept);
        if let Some(leader_state) = self.role.leader_state() {
            let match_indices: Vec<u64> =
                leader_state.followers.values().map(|f| f.match_index).collect();
            let all_match_indices_known = match_indices.iter().all(|i| *i != 0);
            if all_match_indices_known {
                highest_index_to_truncate = match_indices
                    .iter()
                    .copied()
                    .filter(|i| *i < commit_index)
                    .filter(|i| *i > commit_index - kept)
                    .map(|i| i - 1)
                    .min()
                    .unwrap_or(commit_index);
            }
        }

        let truncated = self.log.set_snapshot(snapshot, highest_index_to_truncate);
        self.take_snapshot_count += 1;
        tracing::info!(
            snapshot_index = commit_index,
            truncated,
            "snapshot taken"
        );
        self.publish_report(ReportReason::TakeSnapshot);
    }

    /// Install a snapshot received from the leader, replacing the covered log
    /// prefix and the state machine's contents.
    pub(crate) fn install_snapshot(&mut self, snapshot: SnapshotEntry<D>) {
        if self.commit_index >= snapshot.index {
            tracing::warn!(
                snapshot_index = snapshot.index,
                commit_index = self.commit_index,
                "ignoring snapshot at or below the commit index"
            );
            return;
        }

        self.commit_index = snapshot.index;
        let truncated = self.log.set_snapshot(snapshot.clone(), snapshot.index);
        self.snapshot_chunk_collector = None;
        if truncated > 0 {
            tracing::info!(
                truncated,
                snapshot_index = snapshot.index,
                "truncated log entries covered by the installed snapshot"
            );
        }
        if let Err(err) = self.store.flush() {
            self.fatal_store_error("flushing an installed snapshot", err);
            return;
        }

        self.state_machine.install_snapshot(snapshot.index, snapshot.chunk_payloads());
        self.install_snapshot_count += 1;
        self.publish_report(ReportReason::InstallSnapshot);

        // Being sent this snapshot means this node is in the member list the
        // leader works with, but an uncommitted membership change may have
        // been pre-applied locally before the snapshot arrived. The snapshot
        // resolves both: status returns to active and the member lists come
        // from the snapshot.
        self.set_status(NodeStatus::Active);
        if snapshot.group_members_log_index > self.committed_members.log_index {
            self.committed_members =
                GroupMembers::new(snapshot.group_members_log_index, snapshot.group_members.clone());
            self.effective_members = self.committed_members.clone();
            self.publish_report(ReportReason::GroupMembersChange);
        }

        self.last_applied = snapshot.index;
        let leader = self.leader_hint();
        self.invalidate_futures_up_to(snapshot.index, RaftError::IndeterminateState { leader });

        tracing::info!(snapshot_index = snapshot.index, "snapshot installed");
    }

    /// Handle a snapshot installation request: collect the carried chunks,
    /// ask for what is still missing, and install once everything arrived.
    #[tracing::instrument(level = "trace", skip(self, req), fields(sender = req.sender, snapshot_index = req.snapshot_index))]
    pub(crate) fn handle_install_snapshot_request(&mut self, req: InstallSnapshotRequest<D>) {
        if req.term < self.term {
            tracing::trace!("rejecting install snapshot request from a stale term");
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

        if req.snapshot_index <= self.commit_index {
            // Already past this snapshot; tell the leader where we stand.
            let response = AppendEntriesSuccess {
                group_id: self.group_id,
                sender: self.id,
                term: self.term,
                last_log_index: self.log.last_index(),
                query_round: req.query_round,
            };
            self.runtime.send(req.sender, RaftMessage::AppendEntriesSuccess(response));
            return;
        }

        if let Some(collector) = &self.snapshot_chunk_collector {
            if collector.snapshot_index > req.snapshot_index {
                tracing::debug!(
                    collecting = collector.snapshot_index,
                    "ignoring chunks of an older snapshot"
                );
                return;
            }
        }
        let needs_new_collector = match &self.snapshot_chunk_collector {
            Some(collector) => collector.snapshot_index < req.snapshot_index,
            None => true,
        };
        if needs_new_collector {
            self.snapshot_chunk_collector = Some(SnapshotChunkCollector::new(
                req.snapshot_index,
                req.snapshot_term,
                req.total_chunk_count,
                req.group_members_log_index,
                req.group_members.clone(),
            ));
        }
        let collector =
            self.snapshot_chunk_collector.as_mut().expect("collector was just ensured");

        // Persist every chunk as it arrives; a crash mid-transfer keeps them.
        for chunk in &req.chunks {
            if chunk.index != req.snapshot_index || collector.has_chunk(chunk.chunk_index) {
                continue;
            }
            if let Err(err) = self.store.persist_snapshot_chunk(chunk) {
                tracing::error!(
                    chunk_index = chunk.chunk_index,
                    error = %err,
                    "could not persist received snapshot chunk"
                );
                return;
            }
        }
        collector.add_chunks(req.chunks);

        if collector.is_complete() {
            let snapshot = self
                .snapshot_chunk_collector
                .take()
                .expect("collector exists")
                .into_snapshot_entry();
            self.install_snapshot(snapshot);
            let response = AppendEntriesSuccess {
                group_id: self.group_id,
                sender: self.id,
                term: self.term,
                last_log_index: self.log.last_index(),
                query_round: req.query_round,
            };
            self.runtime.send(req.sender, RaftMessage::AppendEntriesSuccess(response));
        } else {
            let requested_chunk_indices = collector.missing_chunk_indices();
            tracing::debug!(
                missing = requested_chunk_indices.len(),
                "requesting missing snapshot chunks"
            );
            let response = InstallSnapshotResponse {
                group_id: self.group_id,
                sender: self.id,
                term: self.term,
                snapshot_index: req.snapshot_index,
                requested_chunk_indices,
            };
            self.runtime.send(req.sender, RaftMessage::InstallSnapshotResponse(response));
        }
    }

    /// Handle a follower's request for snapshot chunks: the leader streams
    /// the requested chunk indices of its current snapshot.
    #[tracing::instrument(level = "trace", skip(self, resp), fields(sender = resp.sender, snapshot_index = resp.snapshot_index))]
    pub(crate) fn handle_install_snapshot_response(&mut self, resp: InstallSnapshotResponse) {
        if resp.term > self.term {
            self.to_follower(resp.term);
            return;
        }
        if self.role.leader_state().is_none() {
            // Only the leader initiates and feeds snapshot installations.
            tracing::debug!("ignoring snapshot chunk request, not the leader");
            return;
        }
        self.send_snapshot_chunks(resp.sender, resp.snapshot_index, &resp.requested_chunk_indices);
    }

    /// Send the requested chunks of the local snapshot to a follower. When
    /// the follower asks about an outdated snapshot, an empty chunk list for
    /// the current one re-triggers its installation process.
    pub(crate) fn send_snapshot_chunks(
        &mut self,
        follower: NodeId,
        snapshot_index: u64,
        requested_chunk_indices: &[u32],
    ) {
        let query_round = self
            .role
            .leader_state()
            .map(|ls| ls.query_state.query_round())
            .unwrap_or(0);
        let snapshot = self.log.snapshot_entry();

        let chunks: Vec<SnapshotChunk<D>> = if snapshot.index == snapshot_index {
            tracing::debug!(
                follower,
                snapshot_index,
                chunks = requested_chunk_indices.len(),
                "sending requested snapshot chunks"
            );
            requested_chunk_indices
                .iter()
                .filter_map(|i| snapshot.chunks.get(*i as usize).cloned())
                .collect()
        } else if snapshot.index > snapshot_index {
            tracing::debug!(
                follower,
                requested = snapshot_index,
                current = snapshot.index,
                "follower asked for an outdated snapshot, re-triggering with the current one"
            );
            Vec::new()
        } else {
            tracing::error!(
                follower,
                requested = snapshot_index,
                current = snapshot.index,
                "follower requested a snapshot newer than ours"
            );
            return;
        };

        let request = InstallSnapshotRequest {
            group_id: self.group_id,
            sender: self.id,
            term: self.term,
            snapshot_index: snapshot.index,
            snapshot_term: snapshot.term,
            total_chunk_count: snapshot.chunks.len() as u32,
            chunks,
            group_members_log_index: snapshot.group_members_log_index,
            group_members: snapshot.group_members.clone(),
            query_round,
        };
        self.runtime.send(follower, RaftMessage::InstallSnapshotRequest(request));

        if let Some(leader_state) = self.role.leader_state_mut() {
            if let Some(follower_state) = leader_state.follower_state_mut(follower) {
                follower_state.response_received();
                follower_state.set_max_request_backoff();
            }
        }
        self.schedule_backoff_reset_task();
    }
}
