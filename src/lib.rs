//! An event-driven Raft consensus engine.
//!
//! Each Raft node runs in a single-threaded manner with an event-based approach:
//! all node state lives inside one spawned task, and every mutation arrives as
//! an event on the node's queue, whether it is an inbound message from a peer,
//! an API call, or a timer firing. The node hands outbound messages to a
//! [`RaftRuntime`], executes committed operations on a user-supplied
//! [`StateMachine`], and persists internal Raft state through a [`RaftStore`].
//!
//! The [`Raft`] type is the public handle to a node. It exposes linearizable
//! replication and queries, single-server membership changes, leadership transfer
//! and operational reporting, each as a future which resolves exactly once.

mod config;
mod core;
mod entry;
mod error;
mod log;
mod messages;
mod raft;
mod report;
mod runtime;
mod state;
mod state_machine;
mod storage;

pub mod testing;

use std::fmt::Debug;

use serde::{de::DeserializeOwned, Serialize};

pub use crate::config::{Config, ConfigBuilder, ConfigError};
pub use crate::entry::{
    EntryPayload, LogEntry, MembershipChangeMode, SnapshotChunk, SnapshotEntry, UpdateMembersOp,
};
pub use crate::error::{Ordered, RaftError, RaftResult};
pub use crate::messages::{
    AppendEntriesFailure, AppendEntriesRequest, AppendEntriesSuccess, InstallSnapshotRequest,
    InstallSnapshotResponse, PreVoteRequest, PreVoteResponse, RaftMessage, TriggerLeaderElection,
    VoteRequest, VoteResponse,
};
pub use crate::raft::{QueryPolicy, Raft};
pub use crate::report::{LogStats, RaftNodeReport, ReportReason};
pub use crate::runtime::RaftRuntime;
pub use crate::state::{GroupMembers, NodeStatus, RaftRole};
pub use crate::state_machine::StateMachine;
pub use crate::storage::{NopStore, RaftStore, RestoredState};

/// A Raft node's ID.
///
/// Endpoints are opaque to the protocol and only ever compared by equality.
pub type NodeId = u64;

/// The ID of the Raft group a node belongs to.
///
/// Every message carries the group ID so that a transport multiplexing several
/// groups over one connection can route frames to the right node.
pub type GroupId = u64;

/// A trait defining application-specific operation data.
///
/// Applications present their operations to Raft as-is; Raft replicates them and
/// hands them back to the application's [`StateMachine`] when they commit, without
/// imposing an intermediate encoding. Snapshot chunk payloads use the same type,
/// as a chunk is simply an operation whose replay reconstructs a slice of state.
pub trait AppData: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> AppData for T where T: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A trait defining the application-specific result of applying an operation.
///
/// Whatever the [`StateMachine`] returns from applying a committed operation flows
/// back to the caller of [`Raft::replicate`] inside an [`Ordered`] value.
pub trait AppDataResponse: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> AppDataResponse for T where
    T: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
}
