//! Shared test doubles for the dispatch tests: a sink that records every
//! emission instead of sending it anywhere.

use parking_lot::Mutex;

use switchboard_core::{CallOutcome, CallerId, CorrelationId, InstanceId, RemoteRequest};

use crate::outbound::{Delivery, DispatchInstruction, OutboundSink};

/// One recorded engine emission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Emission {
    Dispatch {
        instance: InstanceId,
        instruction: DispatchInstruction,
    },
    Deliver {
        caller: CallerId,
        delivery: Delivery,
    },
    CancelHint {
        instance: InstanceId,
        correlation: CorrelationId,
    },
    RemoteForward(RemoteRequest),
}

/// Sink that appends every emission to an in-memory log.
#[derive(Debug, Default)]
pub(crate) struct RecordingSink {
    emissions: Mutex<Vec<Emission>>,
}

impl RecordingSink {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Drains and returns everything recorded so far.
    pub(crate) fn take(&self) -> Vec<Emission> {
        std::mem::take(&mut *self.emissions.lock())
    }

    /// Dispatch instructions recorded so far, without draining.
    pub(crate) fn dispatches(&self) -> Vec<(InstanceId, DispatchInstruction)> {
        self.emissions
            .lock()
            .iter()
            .filter_map(|emission| match emission {
                Emission::Dispatch {
                    instance,
                    instruction,
                } => Some((*instance, instruction.clone())),
                _ => None,
            })
            .collect()
    }

    /// Terminal deliveries recorded so far, without draining.
    pub(crate) fn deliveries(&self) -> Vec<(CallerId, Delivery)> {
        self.emissions
            .lock()
            .iter()
            .filter_map(|emission| match emission {
                Emission::Deliver { caller, delivery } => Some((*caller, delivery.clone())),
                _ => None,
            })
            .collect()
    }

    /// Terminal outcomes delivered for one correlation id.
    pub(crate) fn outcomes_for(&self, correlation: CorrelationId) -> Vec<CallOutcome> {
        self.deliveries()
            .into_iter()
            .filter(|(_, delivery)| delivery.correlation == correlation)
            .map(|(_, delivery)| delivery.outcome)
            .collect()
    }
}

impl OutboundSink for RecordingSink {
    fn dispatch(&self, instance: InstanceId, instruction: DispatchInstruction) {
        self.emissions.lock().push(Emission::Dispatch {
            instance,
            instruction,
        });
    }

    fn deliver(&self, caller: CallerId, delivery: Delivery) {
        self.emissions
            .lock()
            .push(Emission::Deliver { caller, delivery });
    }

    fn cancel_hint(&self, instance: InstanceId, correlation: CorrelationId) {
        self.emissions.lock().push(Emission::CancelHint {
            instance,
            correlation,
        });
    }

    fn remote_forward(&self, request: RemoteRequest) {
        self.emissions.lock().push(Emission::RemoteForward(request));
    }
}
