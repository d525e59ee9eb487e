//! The public handle to a Raft node.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};

use crate::config::Config;
use crate::core::{RaftCore, RaftMsg, Responder};
use crate::entry::{EntryPayload, MembershipChangeMode};
use crate::error::{Ordered, RaftError, RaftResult};
use crate::messages::RaftMessage;
use crate::report::{LogStats, RaftNodeReport, ReportReason};
use crate::runtime::RaftRuntime;
use crate::state::{GroupMembers, NodeStatus, RaftRole};
use crate::state_machine::StateMachine;
use crate::storage::RaftStore;
use crate::{AppData, AppDataResponse, GroupId, NodeId};

/// The consistency policy of a [`Raft::query`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(serde::Deserialize, serde::Serialize)]
pub enum QueryPolicy {
    /// Linearizable reads served by the leader. The query waits until a
    /// majority acknowledges the current query round, proving the leader is
    /// still the leader, then runs at the leader's commit index without
    /// appending anything to the log.
    LeaderLocal,
    /// Run the query immediately on the local node at its own commit index.
    /// Cheap, but may observe stale state on a lagging node.
    AnyLocal,
}

/// A handle to a single Raft node.
///
/// Creating a `Raft` spawns the node's core task; the handle adapts API calls
/// onto the node's event queue and can be cloned freely. Each operation
/// returns a future which resolves exactly once, with an [`Ordered`] result
/// or a [`RaftError`].
///
/// On creation the node restores any state its [`RaftStore`] holds: a node
/// with durable state resumes where it crashed (minus in-flight futures,
/// which callers retry), a pristine one bootstraps from `initial_members`.
pub struct Raft<D: AppData, R: AppDataResponse> {
    id: NodeId,
    group_id: GroupId,
    tx_event: mpsc::UnboundedSender<RaftMsg<D, R>>,
    rx_report: watch::Receiver<RaftNodeReport>,
}

impl<D: AppData, R: AppDataResponse> Clone for Raft<D, R> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            group_id: self.group_id,
            tx_event: self.tx_event.clone(),
            rx_report: self.rx_report.clone(),
        }
    }
}

impl<D: AppData, R: AppDataResponse> Raft<D, R> {
    /// Create a new Raft node and spawn its core task.
    pub fn new<SM, S, RT>(
        id: NodeId,
        group_id: GroupId,
        initial_members: BTreeSet<NodeId>,
        config: Config,
        runtime: Arc<RT>,
        state_machine: SM,
        store: S,
    ) -> Self
    where
        SM: StateMachine<D, R>,
        S: RaftStore<D>,
        RT: RaftRuntime<D>,
    {
        let members = GroupMembers::new(0, initial_members);
        let (tx_event, rx_event) = mpsc::unbounded_channel();
        let (tx_report, rx_report) = watch::channel(RaftNodeReport {
            reason: ReportReason::Periodic,
            group_id,
            endpoint: id,
            initial_members: members.clone(),
            committed_members: members.clone(),
            effective_members: members.clone(),
            role: RaftRole::Follower,
            status: NodeStatus::Initial,
            term: 0,
            voted_for: None,
            leader: None,
            log: LogStats {
                commit_index: 0,
                last_log_index: 0,
                last_log_term: 0,
                snapshot_index: 0,
                take_snapshot_count: 0,
                install_snapshot_count: 0,
            },
        });

        // The core runs detached; it stops when it terminates itself or when
        // the last handle (and timer) drops its event queue.
        let _ = RaftCore::spawn(
            id,
            group_id,
            members,
            Arc::new(config),
            runtime,
            state_machine,
            store,
            tx_event.clone(),
            rx_event,
            tx_report,
        );

        Self { id, group_id, tx_event, rx_report }
    }

    /// This node's endpoint.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The Raft group this node belongs to.
    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    /// Deliver an inbound message from a peer to this node.
    ///
    /// Transports call this with decoded frames; messages to a stopped node
    /// are dropped, matching the best-effort delivery contract.
    pub fn handle_message(&self, message: RaftMessage<D>) {
        if self.tx_event.send(RaftMsg::External(message)).is_err() {
            tracing::trace!("dropping inbound message, node is stopped");
        }
    }

    /// Replicate an operation through the group.
    ///
    /// Resolves with the state machine's result once the operation is
    /// committed and applied on this node.
    pub async fn replicate(&self, operation: D) -> RaftResult<Ordered<R>> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(RaftMsg::Replicate {
            payload: EntryPayload::Normal(operation),
            responder: Responder::Apply(tx),
        })?;
        Self::await_response(rx).await
    }

    /// Run a query with the given policy.
    ///
    /// Fails with [`RaftError::LaggingCommitIndex`] if the local commit index
    /// is behind `min_commit_index`; pass 0 to disable the check.
    pub async fn query(
        &self,
        operation: D,
        policy: QueryPolicy,
        min_commit_index: u64,
    ) -> RaftResult<Ordered<R>> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(RaftMsg::Query { operation, policy, min_commit_index, tx })?;
        Self::await_response(rx).await
    }

    /// Add or remove a single member.
    ///
    /// `expected_commit_index` must match the log index of the currently
    /// committed member list, protecting concurrent changes against racing
    /// each other. Resolves with the newly committed member list.
    pub async fn change_membership(
        &self,
        endpoint: NodeId,
        mode: MembershipChangeMode,
        expected_commit_index: u64,
    ) -> RaftResult<Ordered<GroupMembers>> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(RaftMsg::ChangeMembership { endpoint, mode, expected_commit_index, tx })?;
        Self::await_response(rx).await
    }

    /// Transfer leadership to the given endpoint.
    ///
    /// Resolves once another leader takes over; fails after a bounded number
    /// of attempts if the target never campaigns successfully.
    pub async fn transfer_leadership(&self, endpoint: NodeId) -> RaftResult<Ordered<()>> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(RaftMsg::TransferLeadership { endpoint, tx })?;
        Self::await_response(rx).await
    }

    /// Replicate a group termination through the group. Once committed, every
    /// member applies it and terminates.
    pub async fn terminate_group(&self) -> RaftResult<Ordered<()>> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(RaftMsg::Replicate {
            payload: EntryPayload::TerminateGroup,
            responder: Responder::Done(tx),
        })?;
        Self::await_response(rx).await
    }

    /// Fetch a point-in-time report of the node's state.
    pub async fn report(&self) -> RaftResult<RaftNodeReport> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(RaftMsg::GetReport { tx })?;
        rx.await.map_err(|_| RaftError::NotLeader { leader: None })
    }

    /// Shut this node down, failing its pending operations with `NotLeader`.
    pub async fn terminate(&self) -> RaftResult<()> {
        let (tx, rx) = oneshot::channel();
        if self.tx_event.send(RaftMsg::Terminate { tx }).is_err() {
            // Already stopped.
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    /// A watch over the node's reports.
    ///
    /// The receiver always holds the most recent report; this is the
    /// "eventually observed" inspection channel, with no coherence guarantee
    /// relative to in-flight operations.
    pub fn report_watch(&self) -> watch::Receiver<RaftNodeReport> {
        self.rx_report.clone()
    }

    /// The most recently published report.
    pub fn current_report(&self) -> RaftNodeReport {
        self.rx_report.borrow().clone()
    }

    fn enqueue(&self, msg: RaftMsg<D, R>) -> RaftResult<()> {
        self.tx_event.send(msg).map_err(|_| RaftError::NotLeader { leader: None })
    }

    async fn await_response<T>(rx: oneshot::Receiver<RaftResult<T>>) -> RaftResult<T> {
        match rx.await {
            Ok(result) => result,
            // The node stopped without resolving the future.
            Err(_) => Err(RaftError::NotLeader { leader: None }),
        }
    }
}
