//! The tagged event type applied by the serialized loop.
//!
//! Every inbound message the broker reacts to becomes one variant here, so
//! the loop's match is exhaustive and the compiler flags any unhandled
//! message kind.

use tokio::sync::oneshot;

use switchboard_core::{Advertisement, CallReply, CallRequest, CallerId, CorrelationId, ExitNotice};

use super::types::BrokerSnapshot;

/// One unit of work for the dispatch loop, applied atomically in arrival
/// order.
#[derive(Debug)]
pub enum DispatchEvent {
    /// An instance advertises services.
    Advertise(Advertisement),
    /// An instance withdraws services.
    Unadvertise(Advertisement),
    /// A client issues a named service call.
    Call(CallRequest),
    /// An instance (or the remote collaborator) answers a dispatched call.
    Reply(CallReply),
    /// An instance's owning process exited.
    ProcessExit(ExitNotice),
    /// A caller's own process exited: purge its queued calls and hint at
    /// cancelling its in-flight ones.
    CallerExit {
        /// The departed caller.
        caller: CallerId,
    },
    /// A caller abandoned one call (client-side future dropped).
    Cancel {
        /// Correlation token of the abandoned call.
        correlation: CorrelationId,
    },
    /// Observability probe answered with a consistent state dump.
    Snapshot {
        /// Channel the snapshot is sent back on.
        reply: oneshot::Sender<BrokerSnapshot>,
    },
}
