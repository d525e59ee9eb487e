//! Error types exposed by this crate.

use anyerror::AnyError;

use crate::NodeId;

/// The result type of every Raft API operation.
pub type RaftResult<T> = Result<T, RaftError>;

/// The result of a successfully completed Raft operation, along with the commit
/// index at which it was executed.
#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(serde::Deserialize, serde::Serialize)]
pub struct Ordered<T> {
    /// The commit index at which the operation was executed.
    pub commit_index: u64,
    /// The result produced by the operation.
    pub result: T,
}

impl<T> Ordered<T> {
    pub fn new(commit_index: u64, result: T) -> Self {
        Self { commit_index, result }
    }
}

/// The errors which a Raft operation may resolve with.
///
/// Most variants carry a leader hint: the endpoint the local node currently
/// believes to be the leader, if any, so that callers can retry there.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[derive(serde::Deserialize, serde::Serialize)]
pub enum RaftError {
    /// The operation requires the leader role and the local node is not the
    /// leader, or it has been demoted while the operation was in flight.
    #[error("node is not the leader (leader hint: {leader:?})")]
    NotLeader { leader: Option<NodeId> },

    /// The operation cannot be accepted right now: the uncommitted-entry budget
    /// is exhausted, a membership change is already in flight, or a leadership
    /// transfer is in progress.
    #[error("cannot replicate new operations right now (leader hint: {leader:?})")]
    CannotReplicate { leader: Option<NodeId> },

    /// A query required a commit index the local node has not reached yet.
    #[error("commit index {commit_index} is behind the expected commit index {expected}")]
    LaggingCommitIndex {
        commit_index: u64,
        expected: u64,
        leader: Option<NodeId>,
    },

    /// The operation's log entry was superseded by an installed snapshot before
    /// its outcome could be observed. It may or may not have been committed.
    #[error("operation left in indeterminate state (leader hint: {leader:?})")]
    IndeterminateState { leader: Option<NodeId> },

    /// A membership change was proposed against a stale view of the committed
    /// group members. Carries the caller's expectation and the actual commit
    /// index of the current committed member list.
    #[error("group members commit index mismatch: expected {expected}, actual {actual}")]
    MismatchingGroupMembersCommitIndex { expected: u64, actual: u64 },

    /// An unexpected internal failure: store I/O, a state machine failure, or a
    /// violated invariant.
    #[error(transparent)]
    Internal(#[from] AnyError),
}

impl RaftError {
    /// Create an internal error from a displayable cause.
    pub(crate) fn internal(msg: impl ToString) -> Self {
        Self::Internal(AnyError::error(msg))
    }
}
