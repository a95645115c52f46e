//! Data model of the dispatch engine: instances, service entries with their
//! round-robin slot lists and pending queues, and the read-only snapshot
//! types served to observers.

use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use switchboard_core::{
    CallerId, CorrelationId, InstanceId, Payload, ServiceName, TransactionTag,
};

// ---------------------------------------------------------------------------
// Instance
// ---------------------------------------------------------------------------

/// Execution state of an instance. An instance executes at most one call at
/// a time; Busy means exactly one live correlation entry references it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InstanceState {
    /// Ready to receive a dispatch.
    Idle,
    /// Executing a call; will not be selected until freed by a reply or
    /// removed by a crash.
    Busy,
}

/// A server process able to execute calls for its advertised services.
///
/// Owned exclusively by the [`Registry`](super::registry::Registry); the
/// correlation table refers to instances by id only.
#[derive(Debug, Clone)]
pub struct Instance {
    /// Opaque process/connection identity.
    pub id: InstanceId,
    /// Services this instance has advertised.
    pub services: HashSet<ServiceName>,
    /// Current execution state.
    pub state: InstanceState,
    /// Number of calls dispatched to this instance over its lifetime.
    pub invoked: u64,
}

impl Instance {
    pub(crate) fn new(id: InstanceId) -> Self {
        Self {
            id,
            services: HashSet::new(),
            state: InstanceState::Idle,
            invoked: 0,
        }
    }

    /// Returns `true` when the instance can accept a dispatch.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.state == InstanceState::Idle
    }
}

// ---------------------------------------------------------------------------
// PendingCall
// ---------------------------------------------------------------------------

/// A call queued because no instance was available at lookup time.
#[derive(Debug, Clone)]
pub struct PendingCall {
    /// Correlation token of the queued call.
    pub correlation: CorrelationId,
    /// Caller awaiting the terminal outcome.
    pub caller: CallerId,
    /// Requested service.
    pub service: ServiceName,
    /// Opaque request payload, forwarded at dispatch.
    pub payload: Payload,
    /// Opaque transaction tag, forwarded at dispatch.
    pub transaction: Option<TransactionTag>,
    /// Clock reading (ms) when the call was queued.
    pub enqueued_at: u64,
    /// Global arrival-order stamp across all pending queues; a freed
    /// instance serves the smallest sequence among the services it
    /// advertises.
    pub sequence: u64,
    /// Clock reading (ms) past which the call fails with `Timeout`.
    /// `None` waits indefinitely.
    pub deadline_at: Option<u64>,
}

impl PendingCall {
    /// Returns `true` once the deadline has elapsed.
    #[must_use]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.deadline_at.is_some_and(|deadline| now_ms >= deadline)
    }
}

// ---------------------------------------------------------------------------
// ServiceEntry
// ---------------------------------------------------------------------------

/// Per-service registry entry: the ordered instance slot list with its
/// round-robin cursor, and the FIFO pending queue.
///
/// The slot list is logically append-only: removing an instance leaves a
/// `None` gap that the scan skips and that is never reused, so the cursor
/// stays a stable index while instances come and go mid-flight.
#[derive(Debug)]
pub struct ServiceEntry {
    /// The service name this entry is keyed by.
    pub name: ServiceName,
    slots: Vec<Option<InstanceId>>,
    cursor: usize,
    /// Calls waiting for an instance, strictly in arrival order.
    pub pending: VecDeque<PendingCall>,
    /// Number of calls dispatched for this service over its lifetime.
    pub lookups: u64,
}

impl ServiceEntry {
    pub(crate) fn new(name: ServiceName) -> Self {
        Self {
            name,
            slots: Vec::new(),
            cursor: 0,
            pending: VecDeque::new(),
            lookups: 0,
        }
    }

    /// Appends an instance slot. Idempotent: re-adding a present instance is
    /// a no-op. Returns `true` if the instance was newly added.
    pub(crate) fn add_instance(&mut self, id: InstanceId) -> bool {
        if self.slots.contains(&Some(id)) {
            return false;
        }
        self.slots.push(Some(id));
        true
    }

    /// Clears the instance's slot, leaving a gap. Returns `true` if the
    /// instance was present.
    pub(crate) fn remove_instance(&mut self, id: InstanceId) -> bool {
        match self.slots.iter_mut().find(|slot| **slot == Some(id)) {
            Some(slot) => {
                *slot = None;
                true
            }
            None => false,
        }
    }

    /// Returns `true` while at least one live instance slot remains.
    #[must_use]
    pub fn has_instances(&self) -> bool {
        self.slots.iter().any(Option::is_some)
    }

    /// Live instance ids in slot order.
    pub fn instances(&self) -> impl Iterator<Item = InstanceId> + '_ {
        self.slots.iter().filter_map(|slot| *slot)
    }

    /// Round-robin selection: scans from just after the last-dispatched
    /// cursor position, wrapping, and returns the first instance the
    /// predicate accepts, advancing the cursor past it.
    pub(crate) fn select_instance<F>(&mut self, mut accept: F) -> Option<InstanceId>
    where
        F: FnMut(InstanceId) -> bool,
    {
        let len = self.slots.len();
        for offset in 1..=len {
            let index = (self.cursor + offset) % len;
            if let Some(id) = self.slots[index] {
                if accept(id) {
                    self.cursor = index;
                    return Some(id);
                }
            }
        }
        None
    }

    /// Returns `true` when the entry holds no instances and no pending work
    /// and can be dropped from the registry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.has_instances() && self.pending.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// Read-only dump of one instance's state within a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSnapshot {
    /// Instance identity.
    pub id: InstanceId,
    /// Idle or Busy at snapshot time.
    pub state: InstanceState,
    /// Lifetime dispatch count.
    pub invoked: u64,
}

/// Read-only dump of one service's registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSnapshot {
    /// Service name.
    pub name: ServiceName,
    /// Live instances in slot order.
    pub instances: Vec<InstanceSnapshot>,
    /// Number of calls waiting in the pending queue.
    pub pending_depth: usize,
    /// Lifetime dispatch count for the service.
    pub lookups: u64,
}

/// Read-only dump of the whole dispatch state, served from the serialized
/// event loop so it is always internally consistent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerSnapshot {
    /// All known services, sorted by name.
    pub services: Vec<ServiceSnapshot>,
    /// Number of live correlation entries (in-flight calls).
    pub in_flight: usize,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
