//! The runtime a Raft node hands its outbound effects to.

use crate::messages::RaftMessage;
use crate::report::RaftNodeReport;
use crate::{AppData, NodeId};

/// The integration surface between a Raft node and its host process.
///
/// The node never opens sockets: outbound messages are handed to `send`, and
/// inbound messages are delivered by the host through
/// [`Raft::handle_message`](crate::Raft::handle_message).
pub trait RaftRuntime<D: AppData>: Send + Sync + 'static {
    /// Deliver a message to the given endpoint, best-effort.
    ///
    /// Delivery may fail or the message may be dropped silently; Raft
    /// tolerates loss. No ordering across destinations is required, but
    /// messages to a single destination should arrive in send order.
    fn send(&self, target: NodeId, message: RaftMessage<D>);

    /// Operator callback invoked when the node publishes a report: on role,
    /// status and membership transitions, snapshot activity, and periodically.
    fn on_report(&self, report: RaftNodeReport) {
        let _ = report;
    }

    /// Invoked once when a committed `TerminateGroup` operation is applied on
    /// this node.
    fn on_group_terminated(&self) {}
}
