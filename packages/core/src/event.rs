//! Collaborator-facing event payloads.
//!
//! These are the abstract inputs the broker consumes from its transport and
//! supervision collaborators: service advertisements, calls, replies, and
//! process-exit notices. The structs carry serde derives so the (out of
//! scope) wire layers can encode them however they like; the broker itself
//! only ever sees the decoded values.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{
    CallerId, CorrelationId, InstanceId, Payload, ReplyStatus, ServiceName, TransactionTag,
};

/// An instance joining (or extending) its set of advertised services.
///
/// Also used for withdrawal: the surrounding event tells the broker whether
/// the listed services are being advertised or unadvertised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Advertisement {
    /// The advertising instance.
    pub instance: InstanceId,
    /// Services being advertised or withdrawn.
    pub services: Vec<ServiceName>,
}

/// A named service call issued by a client process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    /// Requested service name.
    pub service: ServiceName,
    /// Globally unique token for reply correlation.
    pub correlation: CorrelationId,
    /// Address the terminal outcome is delivered to.
    pub caller: CallerId,
    /// Opaque request payload, forwarded untouched.
    pub payload: Payload,
    /// Opaque transaction tag, forwarded untouched when present.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub transaction: Option<TransactionTag>,
    /// Time the call may wait in the pending queue before failing with
    /// `Timeout`. `None` means the call waits indefinitely.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub deadline: Option<Duration>,
}

/// A reply produced by an instance for a previously dispatched call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallReply {
    /// The replying instance.
    pub instance: InstanceId,
    /// Correlation token of the call being answered.
    pub correlation: CorrelationId,
    /// Outcome classification.
    pub status: ReplyStatus,
    /// Opaque reply payload, forwarded untouched.
    pub payload: Payload,
}

/// Why an instance's process left the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExitReason {
    /// Orderly shutdown reported by the supervisor.
    Graceful,
    /// The process died (crash, kill, OOM).
    Crashed,
    /// The transport connection to the process was lost.
    ConnectionLost,
}

/// Notification that an instance's owning process has exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitNotice {
    /// The departed instance.
    pub instance: InstanceId,
    /// Why it left.
    pub reason: ExitReason,
}

/// A lookup the broker could not resolve locally, forwarded to the external
/// discovery collaborator. The payload passes through uninterpreted; the
/// collaborator's answer is folded back in as a [`CallReply`] from the
/// pseudo-instance named here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRequest {
    /// Service the local registry has no instances for.
    pub service: ServiceName,
    /// Correlation token of the forwarded call.
    pub correlation: CorrelationId,
    /// Single-use pseudo-instance the reply must be attributed to.
    pub pseudo_instance: InstanceId,
    /// Opaque request payload, forwarded untouched.
    pub payload: Payload,
    /// Opaque transaction tag, forwarded untouched when present.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub transaction: Option<TransactionTag>,
}
