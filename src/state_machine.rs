//! The user state machine replicated by the Raft group.

use anyerror::AnyError;

use crate::{AppData, AppDataResponse};

/// The application state machine driven by a Raft node.
///
/// The state machine is invoked exclusively from the node's executor, so
/// implementations need no internal synchronization. `apply` must be
/// deterministic: every member of the group applies the same operations in the
/// same order and must arrive at the same state.
pub trait StateMachine<D: AppData, R: AppDataResponse>: Send + 'static {
    /// Execute a committed operation against the state at `index`.
    ///
    /// Also used for queries, which run at the node's commit index; a query
    /// operation must not mutate the state machine.
    ///
    /// An error does not halt the node: it resolves the operation's future
    /// with [`RaftError::Internal`](crate::RaftError::Internal) and the node
    /// moves on to the next committed entry.
    fn apply(&mut self, index: u64, operation: &D) -> Result<R, AnyError>;

    /// Produce a snapshot of the state at `index` as a sequence of chunks.
    ///
    /// Replaying the emitted chunks through [`install_snapshot`] must
    /// reconstruct the state exactly. A failure abandons this snapshot
    /// attempt and leaves the log untouched.
    ///
    /// [`install_snapshot`]: StateMachine::install_snapshot
    fn take_snapshot(&mut self, index: u64, sink: &mut dyn FnMut(D)) -> Result<(), AnyError>;

    /// Atomically replace the state with the one captured in `chunks`.
    fn install_snapshot(&mut self, index: u64, chunks: Vec<D>);

    /// The operation a fresh leader appends to commit an entry in its own
    /// term right away, unblocking membership changes and linearizable
    /// queries. Return `None` to append nothing.
    fn new_term_operation(&mut self) -> Option<D> {
        None
    }
}
