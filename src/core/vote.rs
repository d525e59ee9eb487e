//! Handlers for vote and pre-vote rounds, and for leadership transfer's
//! election trigger.

use crate::core::RaftCore;
use crate::messages::{
    PreVoteRequest, PreVoteResponse, RaftMessage, TriggerLeaderElection, VoteRequest, VoteResponse,
};
use crate::runtime::RaftRuntime;
use crate::state::RoleState;
use crate::state_machine::StateMachine;
use crate::storage::RaftStore;
use crate::{AppData, AppDataResponse};

impl<D, R, SM, S, RT> RaftCore<D, R, SM, S, RT>
where
    D: AppData,
    R: AppDataResponse,
    SM: StateMachine<D, R>,
    S: RaftStore<D>,
    RT: RaftRuntime<D>,
{
    /// Handle a request to cast a vote (§5.2).
    ///
    /// A vote is granted iff the node has not voted for another candidate in
    /// the request's term and the candidate's log is at least as up-to-date
    /// as the local log. Sticky requests are additionally refused while a
    /// healthy leader is known, protecting it from disruption by a node that
    /// was briefly partitioned.
    #[tracing::instrument(level = "trace", skip(self, req), fields(candidate = req.sender, term = req.term))]
    pub(crate) fn handle_vote_request(&mut self, req: VoteRequest) {
        if req.term < self.term {
            tracing::trace!("rejecting vote request from a stale term");
            self.send_vote_response(req.sender, false);
            return;
        }

        // Leader stickiness comes before any term mutation: a disruptive
        // candidate must not inflate the term of a healthy group. The leader
        // itself is sticky too, until its own majority timeout demotes it.
        if req.sticky && self.is_healthy_leader_known() {
            tracing::info!("rejecting vote request, heard from a healthy leader recently");
            self.send_vote_response(req.sender, false);
            return;
        }

        if req.term > self.term {
            self.to_follower(req.term);
            if self.status.is_terminal() {
                return;
            }
        }

        let up_to_date = req.last_log_term > self.log.last_term()
            || (req.last_log_term == self.log.last_term()
                && req.last_log_index >= self.log.last_index());
        if !up_to_date {
            tracing::trace!("rejecting vote request, candidate log is not up-to-date");
            self.send_vote_response(req.sender, false);
            return;
        }

        let granted = match self.voted_for {
            Some(voted_for) => voted_for == req.sender,
            None => {
                self.voted_for = Some(req.sender);
                if !self.persist_term_or_die() {
                    return;
                }
                tracing::info!(candidate = req.sender, term = req.term, "vote granted");
                true
            }
        };
        self.send_vote_response(req.sender, granted);
    }

    /// Count a vote; a majority makes this candidate the leader.
    #[tracing::instrument(level = "trace", skip(self, resp), fields(voter = resp.sender))]
    pub(crate) fn handle_vote_response(&mut self, resp: VoteResponse) {
        if resp.term > self.term {
            tracing::info!("stepping down, observed a greater term in a vote response");
            self.to_follower(resp.term);
            return;
        }
        if resp.term < self.term {
            return;
        }
        let majority = self.effective_members.majority();
        let RoleState::Candidate(election) = &mut self.role else {
            tracing::trace!("ignoring vote response, not a candidate");
            return;
        };
        if resp.granted {
            election.grant(resp.sender);
            if election.granted_count() >= majority {
                self.to_leader();
            }
        }
    }

    /// Handle a pre-vote probe. Grants mirror the vote rules but mutate no
    /// durable state, and leader stickiness always applies.
    #[tracing::instrument(level = "trace", skip(self, req), fields(candidate = req.sender, term = req.term))]
    pub(crate) fn handle_pre_vote_request(&mut self, req: PreVoteRequest) {
        if req.term < self.term {
            tracing::trace!("rejecting pre-vote request from a stale term");
            self.send_pre_vote_response(req.sender, self.term, false);
            return;
        }

        if self.is_healthy_leader_known() {
            tracing::trace!("rejecting pre-vote request, heard from a healthy leader recently");
            self.send_pre_vote_response(req.sender, self.term, false);
            return;
        }

        let up_to_date = req.last_log_term > self.log.last_term()
            || (req.last_log_term == self.log.last_term()
                && req.last_log_index >= self.log.last_index());
        if up_to_date {
            self.send_pre_vote_response(req.sender, req.term, true);
        } else {
            tracing::trace!("rejecting pre-vote request, candidate log is not up-to-date");
            self.send_pre_vote_response(req.sender, self.term, false);
        }
    }

    /// Count a pre-vote; a majority starts the real (sticky) election.
    #[tracing::instrument(level = "trace", skip(self, resp), fields(voter = resp.sender))]
    pub(crate) fn handle_pre_vote_response(&mut self, resp: PreVoteResponse) {
        if !resp.granted && resp.term > self.term {
            tracing::info!("stepping down, observed a greater term in a pre-vote response");
            self.to_follower(resp.term);
            return;
        }
        let majority = self.effective_members.majority();
        let RoleState::PreCandidate(election) = &mut self.role else {
            tracing::trace!("ignoring pre-vote response, not a pre-candidate");
            return;
        };
        if resp.granted && resp.term == self.term + 1 {
            election.grant(resp.sender);
            if election.granted_count() >= majority {
                self.to_candidate(true);
            }
        }
    }

    /// Handle the leader's instruction to take over leadership: verify the
    /// local log is fully caught up with the sender's, then start a
    /// non-sticky election immediately.
    #[tracing::instrument(level = "trace", skip(self, req), fields(sender = req.sender, term = req.term))]
    pub(crate) fn handle_trigger_leader_election(&mut self, req: TriggerLeaderElection) {
        if req.term > self.term {
            self.to_follower(req.term);
            return;
        }
        if req.term < self.term {
            tracing::trace!("ignoring stale leader election trigger");
            return;
        }
        if req.last_log_term == self.log.last_term() && req.last_log_index == self.log.last_index()
        {
            tracing::info!(from = req.sender, "taking over leadership on request");
            self.to_candidate(false);
        } else {
            tracing::debug!(
                last_log_index = self.log.last_index(),
                sender_last_log_index = req.last_log_index,
                "ignoring leader election trigger, log is not caught up"
            );
        }
    }

    /// Whether this node is the leader itself, or has heard from one within
    /// the heartbeat timeout.
    fn is_healthy_leader_known(&self) -> bool {
        self.role.is_leader()
            || (self.leader.is_some() && !self.is_leader_heartbeat_timeout_elapsed())
    }

    fn send_vote_response(&self, target: crate::NodeId, granted: bool) {
        let response = VoteResponse {
            group_id: self.group_id,
            sender: self.id,
            term: self.term,
            granted,
        };
        self.runtime.send(target, RaftMessage::VoteResponse(response));
    }

    fn send_pre_vote_response(&self, target: crate::NodeId, term: u64, granted: bool) {
        let response = PreVoteResponse {
            group_id: self.group_id,
            sender: self.id,
            term,
            granted,
        };
        self.runtime.send(target, RaftMessage::PreVoteResponse(response));
    }
}
