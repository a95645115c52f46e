//! Client-side call helper.
//!
//! The broker core is fire-and-forget: callers submit a Call event and the
//! terminal outcome comes back through the outbound sink. [`Caller`] wraps
//! that exchange in the shape clients actually want — an asynchronous send
//! paired with a single-shot, correlation-id-keyed completion handle.
//! Dropping the handle before completion sends a Cancel event so the engine
//! purges the abandoned call.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use switchboard_core::{
    CallOutcome, CallRequest, CallerId, CorrelationId, Payload, ServiceName, TransactionTag,
};

use crate::dispatch::{DispatchEvent, EngineMailbox};
use crate::outbound::ChannelSink;

/// Optional per-call parameters.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Opaque transaction tag forwarded with the dispatch.
    pub transaction: Option<TransactionTag>,
    /// Time the call may wait queued before failing with `Timeout`.
    pub deadline: Option<Duration>,
}

/// A connected client endpoint issuing calls through the broker.
///
/// Owns a caller address on the sink and a pump task that resolves
/// completion handles as terminal outcomes arrive.
pub struct Caller {
    id: CallerId,
    mailbox: EngineMailbox,
    sink: Arc<ChannelSink>,
    pending: Arc<DashMap<CorrelationId, oneshot::Sender<CallOutcome>>>,
    pump: Option<JoinHandle<()>>,
}

impl Caller {
    /// Registers a caller address on the sink and starts the delivery pump.
    #[must_use]
    pub fn connect(mailbox: EngineMailbox, sink: Arc<ChannelSink>) -> Self {
        let (id, mut deliveries) = sink.register_caller();
        let pending: Arc<DashMap<CorrelationId, oneshot::Sender<CallOutcome>>> =
            Arc::new(DashMap::new());

        let pump = tokio::spawn({
            let pending = Arc::clone(&pending);
            async move {
                while let Some(delivery) = deliveries.recv().await {
                    match pending.remove(&delivery.correlation) {
                        Some((_, tx)) => {
                            // A dropped handle between delivery and here is
                            // fine; the outcome just goes unobserved.
                            let _ = tx.send(delivery.outcome);
                        }
                        None => {
                            debug!(
                                correlation = %delivery.correlation,
                                "outcome for abandoned call dropped"
                            );
                        }
                    }
                }
            }
        });

        Self {
            id,
            mailbox,
            sink,
            pending,
            pump: Some(pump),
        }
    }

    /// The caller address outcomes are delivered to.
    #[must_use]
    pub fn id(&self) -> CallerId {
        self.id
    }

    /// Issues a call with default options.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine has stopped.
    pub async fn call(
        &self,
        service: impl Into<ServiceName>,
        payload: Payload,
    ) -> anyhow::Result<PendingReply> {
        self.call_with(service, payload, CallOptions::default()).await
    }

    /// Issues a call, returning the completion handle to await.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine has stopped.
    pub async fn call_with(
        &self,
        service: impl Into<ServiceName>,
        payload: Payload,
        options: CallOptions,
    ) -> anyhow::Result<PendingReply> {
        let correlation = CorrelationId::generate();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(correlation, tx);

        let submitted = self
            .mailbox
            .submit(DispatchEvent::Call(CallRequest {
                service: service.into(),
                correlation,
                caller: self.id,
                payload,
                transaction: options.transaction,
                deadline: options.deadline,
            }))
            .await;

        if let Err(err) = submitted {
            self.pending.remove(&correlation);
            return Err(err);
        }

        Ok(PendingReply {
            correlation,
            rx,
            pending: Arc::clone(&self.pending),
            mailbox: self.mailbox.clone(),
            completed: false,
        })
    }

    /// Disconnects cleanly: the engine purges this caller's queued calls and
    /// hints at cancelling its in-flight ones.
    pub async fn disconnect(mut self) {
        let _ = self
            .mailbox
            .submit(DispatchEvent::CallerExit { caller: self.id })
            .await;
        self.teardown();
    }

    fn teardown(&mut self) {
        self.sink.unregister_caller(self.id);
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

impl Drop for Caller {
    fn drop(&mut self) {
        if self.pump.is_some() {
            // Dropped without an explicit disconnect: best-effort purge.
            let _ = self
                .mailbox
                .try_submit(DispatchEvent::CallerExit { caller: self.id });
            self.teardown();
        }
    }
}

/// Single-shot completion handle for one issued call.
///
/// Await [`PendingReply::outcome`] for the terminal result. Dropping the
/// handle beforehand abandons the call: the engine purges it if still
/// queued, or suppresses delivery and hints the executing instance if
/// already dispatched.
pub struct PendingReply {
    correlation: CorrelationId,
    rx: oneshot::Receiver<CallOutcome>,
    pending: Arc<DashMap<CorrelationId, oneshot::Sender<CallOutcome>>>,
    mailbox: EngineMailbox,
    completed: bool,
}

impl PendingReply {
    /// Correlation token of the issued call.
    #[must_use]
    pub fn correlation(&self) -> CorrelationId {
        self.correlation
    }

    /// Waits for the single terminal outcome.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker stopped before resolving the call.
    pub async fn outcome(mut self) -> anyhow::Result<CallOutcome> {
        match (&mut self.rx).await {
            Ok(outcome) => {
                self.completed = true;
                Ok(outcome)
            }
            Err(_) => Err(anyhow::anyhow!("broker stopped before resolving the call")),
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        // Entry still present means no outcome was delivered yet: tell the
        // engine the call is abandoned. A failed submit just means the
        // engine is already gone.
        if self.pending.remove(&self.correlation).is_some() {
            let _ = self.mailbox.try_submit(DispatchEvent::Cancel {
                correlation: self.correlation,
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
