//! Outbound delivery layer.
//!
//! The dispatch engine never talks to a transport directly: every dispatch
//! instruction, terminal reply, cancellation hint, and remote forward goes
//! through an [`OutboundSink`] injected at engine construction. Emission is
//! non-blocking (`try_send`) so a slow or vanished peer can never stall the
//! serialized event loop.
//!
//! [`ChannelSink`] is the channel-backed implementation: per-address bounded
//! mpsc channels tracked in `DashMap`s, with the receiver half handed to the
//! transport (or test) that drains it.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::warn;

use switchboard_core::{
    CallOutcome, CallerId, CorrelationId, InstanceId, Payload, RemoteRequest, ServiceName,
    TransactionTag,
};

use crate::config::SinkConfig;

// ---------------------------------------------------------------------------
// Outbound message types
// ---------------------------------------------------------------------------

/// Instruction telling an instance to execute a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchInstruction {
    /// Service the instance must execute.
    pub service: ServiceName,
    /// Correlation token the instance must echo in its reply.
    pub correlation: CorrelationId,
    /// Originating caller, forwarded for the instance's bookkeeping.
    pub caller: CallerId,
    /// Opaque request payload.
    pub payload: Payload,
    /// Opaque transaction tag, forwarded when present.
    pub transaction: Option<TransactionTag>,
}

/// Message sent to a registered instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceMessage {
    /// Execute a call.
    Dispatch(DispatchInstruction),
    /// Best-effort hint that the caller of an in-flight call is gone.
    /// No acknowledgement is expected.
    CancelHint {
        /// Correlation token of the abandoned call.
        correlation: CorrelationId,
    },
}

/// Terminal outcome delivered to a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Correlation token of the resolved call.
    pub correlation: CorrelationId,
    /// The single terminal outcome.
    pub outcome: CallOutcome,
}

// ---------------------------------------------------------------------------
// OutboundSink trait
// ---------------------------------------------------------------------------

/// Non-blocking emission surface of the dispatch engine.
///
/// All methods are fire-and-forget from the engine's perspective: a failed
/// emission is the implementation's problem to log and count, never the
/// loop's problem to wait on.
pub trait OutboundSink: Send + Sync {
    /// Hands a call to an instance for execution.
    fn dispatch(&self, instance: InstanceId, instruction: DispatchInstruction);

    /// Delivers a terminal outcome to a caller.
    fn deliver(&self, caller: CallerId, delivery: Delivery);

    /// Sends a best-effort cancellation hint to an instance.
    fn cancel_hint(&self, instance: InstanceId, correlation: CorrelationId);

    /// Forwards an unresolved lookup to the external discovery collaborator.
    fn remote_forward(&self, request: RemoteRequest);
}

// ---------------------------------------------------------------------------
// ChannelSink
// ---------------------------------------------------------------------------

/// Channel-backed [`OutboundSink`].
///
/// Tracks one bounded mpsc sender per registered instance and caller in
/// lock-free `DashMap`s. Registration returns the receiver half for the
/// transport write loop to drain. Emissions to unregistered or full
/// addresses are logged and dropped; the original caller still gets its
/// terminal outcome from the engine's state machine, so a lost emission
/// never strands broker state.
#[derive(Debug)]
pub struct ChannelSink {
    instances: DashMap<InstanceId, mpsc::Sender<InstanceMessage>>,
    callers: DashMap<CallerId, mpsc::Sender<Delivery>>,
    remote: RwLock<Option<mpsc::Sender<RemoteRequest>>>,
    next_caller: AtomicU64,
    next_instance: AtomicU64,
    capacity: usize,
}

impl ChannelSink {
    /// Creates an empty sink.
    ///
    /// Caller and instance ids assigned by this sink start at 1; 0 is
    /// reserved as "no address".
    #[must_use]
    pub fn new(config: &SinkConfig) -> Self {
        Self {
            instances: DashMap::new(),
            callers: DashMap::new(),
            remote: RwLock::new(None),
            next_caller: AtomicU64::new(1),
            next_instance: AtomicU64::new(1),
            capacity: config.outbound_channel_capacity,
        }
    }

    /// Registers a new instance address, returning its id and the receiver
    /// the transport write loop must drain.
    pub fn register_instance(&self) -> (InstanceId, mpsc::Receiver<InstanceMessage>) {
        let id = InstanceId(self.next_instance.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.capacity);
        self.instances.insert(id, tx);
        (id, rx)
    }

    /// Registers a new caller address, returning its id and the receiver
    /// terminal outcomes arrive on.
    pub fn register_caller(&self) -> (CallerId, mpsc::Receiver<Delivery>) {
        let id = CallerId(self.next_caller.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.capacity);
        self.callers.insert(id, tx);
        (id, rx)
    }

    /// Removes an instance address. Subsequent emissions to it are dropped.
    pub fn unregister_instance(&self, id: InstanceId) {
        self.instances.remove(&id);
    }

    /// Removes a caller address. Subsequent emissions to it are dropped.
    pub fn unregister_caller(&self, id: CallerId) {
        self.callers.remove(&id);
    }

    /// Attaches the remote discovery collaborator, returning the receiver
    /// its forwarding loop must drain. Replaces any previous attachment.
    pub fn attach_remote(&self) -> mpsc::Receiver<RemoteRequest> {
        let (tx, rx) = mpsc::channel(self.capacity);
        *self.remote.write() = Some(tx);
        rx
    }

    /// Returns the number of registered instance addresses.
    #[must_use]
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Returns the number of registered caller addresses.
    #[must_use]
    pub fn caller_count(&self) -> usize {
        self.callers.len()
    }
}

impl OutboundSink for ChannelSink {
    fn dispatch(&self, instance: InstanceId, instruction: DispatchInstruction) {
        match self.instances.get(&instance) {
            Some(tx) => {
                if let Err(err) = tx.try_send(InstanceMessage::Dispatch(instruction)) {
                    warn!(%instance, %err, "dropping dispatch instruction");
                }
            }
            None => warn!(%instance, "dispatch to unregistered instance dropped"),
        }
    }

    fn deliver(&self, caller: CallerId, delivery: Delivery) {
        match self.callers.get(&caller) {
            Some(tx) => {
                if let Err(err) = tx.try_send(delivery) {
                    warn!(%caller, %err, "dropping terminal delivery");
                }
            }
            // Departed callers are expected: their in-flight replies are
            // still routed here to free the instance.
            None => tracing::debug!(%caller, "delivery to unregistered caller dropped"),
        }
    }

    fn cancel_hint(&self, instance: InstanceId, correlation: CorrelationId) {
        if let Some(tx) = self.instances.get(&instance) {
            // Fire-and-forget: a full channel means the hint is lost, which
            // the protocol allows.
            let _ = tx.try_send(InstanceMessage::CancelHint { correlation });
        }
    }

    fn remote_forward(&self, request: RemoteRequest) {
        let guard = self.remote.read();
        match guard.as_ref() {
            Some(tx) => {
                if let Err(err) = tx.try_send(request) {
                    warn!(%err, "dropping remote forward");
                }
            }
            None => warn!("remote forward with no collaborator attached"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
