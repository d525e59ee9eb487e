//! An in-process Raft cluster harness.
//!
//! [`LocalRaftGroup`] wires a set of nodes together through an in-memory
//! router runtime. The router can drop specific message kinds between two
//! endpoints, split the group into partitions, and heal them again, which is
//! what the failure scenarios in this suite are built from.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use eventraft::testing::{MemStore, SimpleOp, SimpleStateMachine};
use eventraft::{
    Config, NodeId, Raft, RaftMessage, RaftNodeReport, RaftRole, RaftRuntime,
};
use tokio::time::Instant;

/// The Raft handle type used across this suite.
pub type TestRaft = Raft<SimpleOp, Option<String>>;

const GROUP_ID: u64 = 7;

/// Message kinds the router can selectively drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    AppendEntriesRequest,
    AppendEntriesSuccess,
    AppendEntriesFailure,
    InstallSnapshotRequest,
    InstallSnapshotResponse,
    VoteRequest,
    VoteResponse,
    PreVoteRequest,
    PreVoteResponse,
    TriggerLeaderElection,
}

fn kind_of(message: &RaftMessage<SimpleOp>) -> MessageKind {
    match message {
        RaftMessage::AppendEntriesRequest(_) => MessageKind::AppendEntriesRequest,
        RaftMessage::AppendEntriesSuccess(_) => MessageKind::AppendEntriesSuccess,
        RaftMessage::AppendEntriesFailure(_) => MessageKind::AppendEntriesFailure,
        RaftMessage::InstallSnapshotRequest(_) => MessageKind::InstallSnapshotRequest,
        RaftMessage::InstallSnapshotResponse(_) => MessageKind::InstallSnapshotResponse,
        RaftMessage::VoteRequest(_) => MessageKind::VoteRequest,
        RaftMessage::VoteResponse(_) => MessageKind::VoteResponse,
        RaftMessage::PreVoteRequest(_) => MessageKind::PreVoteRequest,
        RaftMessage::PreVoteResponse(_) => MessageKind::PreVoteResponse,
        RaftMessage::TriggerLeaderElection(_) => MessageKind::TriggerLeaderElection,
    }
}

#[derive(Default)]
struct RouterState {
    targets: BTreeMap<NodeId, TestRaft>,
    /// Drop every message of a kind sent between a pair of endpoints.
    drop_rules: HashSet<(NodeId, NodeId, MessageKind)>,
    /// Endpoints split away from the rest; messages crossing the split are
    /// dropped in both directions.
    split: BTreeSet<NodeId>,
    /// Endpoints whose runtime received the group-terminated callback.
    group_terminated: BTreeSet<NodeId>,
}

impl RouterState {
    fn is_dropped(&self, from: NodeId, to: NodeId, kind: MessageKind) -> bool {
        if self.split.contains(&from) != self.split.contains(&to) {
            return true;
        }
        self.drop_rules.contains(&(from, to, kind))
    }
}

/// The runtime handed to each node: routes outbound messages to the other
/// in-process nodes, honoring the drop rules.
struct RouterRuntime {
    local: NodeId,
    state: Arc<Mutex<RouterState>>,
}

impl RaftRuntime<SimpleOp> for RouterRuntime {
    fn send(&self, target: NodeId, message: RaftMessage<SimpleOp>) {
        let state = self.state.lock().unwrap();
        if state.is_dropped(self.local, target, kind_of(&message)) {
            return;
        }
        if let Some(raft) = state.targets.get(&target) {
            raft.handle_message(message);
        }
    }

    fn on_group_terminated(&self) {
        self.state.lock().unwrap().group_terminated.insert(self.local);
    }
}

/// A fully in-process Raft group.
pub struct LocalRaftGroup {
    config: Config,
    new_term_operation: bool,
    nodes: BTreeMap<NodeId, TestRaft>,
    stores: BTreeMap<NodeId, MemStore<SimpleOp>>,
    router: Arc<Mutex<RouterState>>,
}

impl LocalRaftGroup {
    /// A group of `size` nodes with timings tightened for tests.
    pub fn new(size: u64) -> Self {
        Self::with_config(size, test_config(), false)
    }

    /// A group whose state machines append a no-op entry on election wins,
    /// committing an entry of the new term right away.
    pub fn with_new_term_operation(size: u64) -> Self {
        Self::with_config(size, test_config(), true)
    }

    pub fn with_config(size: u64, config: Config, new_term_operation: bool) -> Self {
        init_tracing();
        let router = Arc::new(Mutex::new(RouterState::default()));
        let mut group = Self {
            config,
            new_term_operation,
            nodes: BTreeMap::new(),
            stores: BTreeMap::new(),
            router,
        };
        let members: BTreeSet<NodeId> = (1..=size).collect();
        for id in 1..=size {
            group.start_node(id, members.clone());
        }
        group
    }

    /// Start a fresh node and register it with the router.
    pub fn start_node(&mut self, id: NodeId, initial_members: BTreeSet<NodeId>) -> TestRaft {
        let store = self.stores.entry(id).or_insert_with(MemStore::new).clone();
        let machine = if self.new_term_operation {
            SimpleStateMachine::with_new_term_operation()
        } else {
            SimpleStateMachine::new()
        };
        let runtime = Arc::new(RouterRuntime { local: id, state: self.router.clone() });
        let raft: TestRaft = Raft::new(
            id,
            GROUP_ID,
            initial_members,
            self.config.clone(),
            runtime,
            machine,
            store,
        );
        self.router.lock().unwrap().targets.insert(id, raft.clone());
        self.nodes.insert(id, raft.clone());
        raft
    }

    /// Terminate a node and start a replacement over the same store, as if
    /// the process crashed and came back.
    pub async fn restart_node(&mut self, id: NodeId) -> TestRaft {
        let node = self.nodes.get(&id).expect("unknown node").clone();
        node.terminate().await.expect("terminate never fails");
        self.router.lock().unwrap().targets.remove(&id);
        let members: BTreeSet<NodeId> = self.nodes.keys().copied().collect();
        self.start_node(id, members)
    }

    pub fn node(&self, id: NodeId) -> TestRaft {
        self.nodes.get(&id).expect("unknown node").clone()
    }

    /// The store backing the given node; shared with any restarted incarnation.
    pub fn store(&self, id: NodeId) -> MemStore<SimpleOp> {
        self.stores.get(&id).expect("unknown node").clone()
    }

    /// The endpoints whose runtime has received the group-terminated callback.
    pub fn group_terminated_nodes(&self) -> BTreeSet<NodeId> {
        self.router.lock().unwrap().group_terminated.clone()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &TestRaft> {
        self.nodes.values()
    }

    /// Split the given endpoints away from the rest of the group.
    pub fn split(&self, members: impl IntoIterator<Item = NodeId>) {
        self.router.lock().unwrap().split = members.into_iter().collect();
    }

    /// Heal any split.
    pub fn merge(&self) {
        self.router.lock().unwrap().split.clear();
    }

    /// Drop all messages of one kind sent from `from` to `to`.
    pub fn drop_messages(&self, from: NodeId, to: NodeId, kind: MessageKind) {
        self.router.lock().unwrap().drop_rules.insert((from, to, kind));
    }

    /// Let every message kind flow again from `from` to `to`.
    pub fn allow_all_messages(&self, from: NodeId, to: NodeId) {
        self.router.lock().unwrap().drop_rules.retain(|(f, t, _)| !(*f == from && *t == to));
    }

    /// Wait until the whole group agrees on one leader, and return it.
    pub async fn wait_until_leader_elected(&self) -> TestRaft {
        let deadline = Instant::now() + Duration::from_secs(30);
        loop {
            let mut reports: Vec<RaftNodeReport> = Vec::new();
            for node in self.nodes.values() {
                if let Ok(report) = node.report().await {
                    reports.push(report);
                }
            }
            let leader = reports
                .iter()
                .filter(|r| r.role == RaftRole::Leader)
                .max_by_key(|r| r.term)
                .map(|r| r.endpoint);
            if let Some(leader) = leader {
                if !reports.is_empty() && reports.iter().all(|r| r.leader == Some(leader)) {
                    return self.node(leader);
                }
            }
            assert!(Instant::now() < deadline, "no leader elected within the deadline");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Wait until a node other than `except` is accepted as leader by some
    /// node other than `except`, and return the new leader.
    pub async fn wait_until_new_leader_elected(&self, except: NodeId) -> TestRaft {
        let deadline = Instant::now() + Duration::from_secs(30);
        loop {
            for (id, node) in &self.nodes {
                if *id == except {
                    continue;
                }
                if let Ok(report) = node.report().await {
                    if let Some(leader) = report.leader {
                        if leader != except && self.nodes[&leader].current_report().role == RaftRole::Leader {
                            return self.node(leader);
                        }
                    }
                }
            }
            assert!(Instant::now() < deadline, "no new leader elected within the deadline");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Any node which currently follows the given leader.
    pub async fn any_follower(&self, leader: NodeId) -> TestRaft {
        let deadline = Instant::now() + Duration::from_secs(30);
        loop {
            for (id, node) in &self.nodes {
                if *id == leader {
                    continue;
                }
                if let Ok(report) = node.report().await {
                    if report.role == RaftRole::Follower && report.leader == Some(leader) {
                        return node.clone();
                    }
                }
            }
            assert!(Instant::now() < deadline, "no follower found within the deadline");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Wait until the given node's commit index reaches `at_least`.
    pub async fn wait_until_commit_index(&self, id: NodeId, at_least: u64) {
        let node = self.node(id);
        let deadline = Instant::now() + Duration::from_secs(30);
        loop {
            if commit_index(&node).await >= at_least {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "node {id} did not reach commit index {at_least} within the deadline"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Shut every node down.
    pub async fn destroy(self) {
        for node in self.nodes.values() {
            let _ = node.terminate().await;
        }
    }
}

/// The commit index a node currently reports.
pub async fn commit_index(node: &TestRaft) -> u64 {
    node.report().await.expect("node is running").log.commit_index
}

/// Poll an async condition until it holds, panicking after the deadline.
pub async fn eventually<F, Fut>(what: &str, timeout: Duration, mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if cond().await {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting until {what}");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Timings tightened so that elections and failovers converge quickly under
/// the test runner.
pub fn test_config() -> Config {
    Config::build()
        .leader_election_timeout_millis(150)
        .leader_heartbeat_period_millis(50)
        .leader_heartbeat_timeout_millis(600)
        .leader_backoff_duration_millis(40)
        .append_entries_request_batch_size(10)
        .max_uncommitted_log_entry_count(64)
        .commit_count_to_take_snapshot(1000)
        .raft_node_report_publish_period_secs(60)
        .validate()
        .expect("test config must be valid")
}

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        use tracing_subscriber::EnvFilter;
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
