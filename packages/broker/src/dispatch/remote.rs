//! Remote bridge adapter.
//!
//! Lookups the local registry cannot resolve are forwarded to an external
//! discovery collaborator. Each forwarded call is bound to a synthetic
//! single-use pseudo-instance so the collaborator's answer can fold back
//! through the ordinary reply path; pseudo-instances never enter the
//! registry and therefore never participate in round-robin.

use switchboard_core::{
    CorrelationId, InstanceId, Payload, RemoteRequest, ServiceName, TransactionTag,
};

use crate::outbound::OutboundSink;

/// Mints pseudo-instances and forwards unresolved lookups.
///
/// Pseudo ids count down from the top of the id space; transport-assigned
/// instance ids count up from 1, so the two can never collide.
#[derive(Debug)]
pub struct RemoteAdapter {
    next_pseudo: u64,
}

impl RemoteAdapter {
    /// Creates an adapter with a fresh pseudo-instance id space.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_pseudo: u64::MAX,
        }
    }

    /// Forwards a call to the discovery collaborator, returning the
    /// pseudo-instance the correlation entry must be bound to.
    pub fn forward(
        &mut self,
        sink: &dyn OutboundSink,
        service: ServiceName,
        correlation: CorrelationId,
        payload: Payload,
        transaction: Option<TransactionTag>,
    ) -> InstanceId {
        let pseudo_instance = InstanceId(self.next_pseudo);
        self.next_pseudo -= 1;
        sink.remote_forward(RemoteRequest {
            service,
            correlation,
            pseudo_instance,
            payload,
            transaction,
        });
        pseudo_instance
    }
}

impl Default for RemoteAdapter {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
