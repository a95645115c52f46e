//! Terminal call outcomes and the caller-facing error taxonomy.
//!
//! Every accepted call resolves to exactly one [`CallOutcome`] — a reply
//! forwarded from an instance, or a [`CallError`] synthesized by the broker.
//! Stale replies are deliberately absent from the taxonomy: they are logged
//! and dropped inside the engine, never surfaced, because the caller already
//! received its single terminal outcome.

use serde::{Deserialize, Serialize};

use crate::types::{Payload, ReplyStatus, ServiceName};

/// Broker-synthesized failure delivered to exactly one caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CallError {
    /// No instance has ever advertised the requested service and no remote
    /// path exists. Rejected synchronously; no broker state was created.
    #[error("no such service: {service}")]
    NoSuchService {
        /// The unknown service name.
        service: ServiceName,
    },

    /// Every instance of the service vanished while the call was queued and
    /// no remote path exists.
    #[error("service unavailable: {service}")]
    ServiceUnavailable {
        /// The service that lost all its instances.
        service: ServiceName,
    },

    /// The instance executing this specific call terminated before replying.
    #[error("instance executing the call terminated")]
    InstanceTerminated,

    /// The deadline elapsed before the call could be dispatched.
    #[error("deadline elapsed before dispatch")]
    Timeout,
}

/// The single terminal outcome of a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CallOutcome {
    /// A reply from the instance (or remote collaborator) that executed the
    /// call, forwarded with its status classification.
    Reply {
        /// Outcome classification reported by the instance.
        status: ReplyStatus,
        /// Opaque reply payload.
        payload: Payload,
    },
    /// A broker-synthesized failure.
    Failed(CallError),
}

impl CallOutcome {
    /// Returns `true` for broker-synthesized failures.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}
