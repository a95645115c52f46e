//! The serialized dispatch loop.
//!
//! One tokio task owns the registry and correlation table and applies every
//! event to completion before the next, so there is no window between
//! "check idle" and "mark busy". I/O tasks only enqueue [`DispatchEvent`]s;
//! everything the loop wants to say to the outside world leaves through the
//! injected [`OutboundSink`] without blocking.
//!
//! The loop shape follows the worker pattern used across the codebase:
//! bounded event channel + periodic tick + watch-based shutdown signal.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use switchboard_core::{
    Advertisement, CallError, CallOutcome, CallReply, CallRequest, CallerId, ClockSource,
    CorrelationId, ExitNotice, InstanceId, ServiceName,
};

use crate::config::BrokerConfig;
use crate::outbound::{Delivery, DispatchInstruction, OutboundSink};

use super::correlation::{CorrelationEntry, CorrelationTable};
use super::event::DispatchEvent;
use super::registry::Registry;
use super::remote::RemoteAdapter;
use super::types::{BrokerSnapshot, PendingCall, ServiceEntry};

// ---------------------------------------------------------------------------
// Engine health
// ---------------------------------------------------------------------------

/// Lifecycle state of the dispatch loop.
///
/// State machine: Running -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineHealth {
    /// The loop is applying events.
    Running,
    /// Shutdown triggered; queued calls are being failed.
    Draining,
    /// The loop has exited.
    Stopped,
}

// ---------------------------------------------------------------------------
// DispatchEngine
// ---------------------------------------------------------------------------

/// The broker's dispatch state machine.
///
/// Constructed and driven by [`DispatchEngine::spawn`]; all methods below
/// run on the single loop task and may mutate state freely.
pub struct DispatchEngine {
    registry: Registry,
    correlations: CorrelationTable,
    remote: Option<RemoteAdapter>,
    sink: Arc<dyn OutboundSink>,
    clock: Arc<dyn ClockSource>,
    next_sequence: u64,
}

impl DispatchEngine {
    pub(crate) fn new(
        config: &BrokerConfig,
        sink: Arc<dyn OutboundSink>,
        clock: Arc<dyn ClockSource>,
    ) -> Self {
        Self {
            registry: Registry::new(),
            correlations: CorrelationTable::new(),
            remote: config.remote_bridge_enabled.then(RemoteAdapter::new),
            sink,
            clock,
            next_sequence: 0,
        }
    }

    /// Starts the dispatch loop on a new tokio task.
    ///
    /// Returns an [`EngineHandle`] used to submit events, query snapshots,
    /// and stop the loop.
    #[must_use]
    pub fn spawn(
        config: BrokerConfig,
        sink: Arc<dyn OutboundSink>,
        clock: Arc<dyn ClockSource>,
    ) -> EngineHandle {
        let (event_tx, event_rx) = mpsc::channel(config.engine.event_channel_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let health = Arc::new(ArcSwap::from_pointee(EngineHealth::Running));

        let sweep_interval = config.engine.sweep_interval;
        let engine = Self::new(&config, sink, clock);
        let join = tokio::spawn(engine.run(
            event_rx,
            shutdown_rx,
            Arc::clone(&health),
            sweep_interval,
        ));

        EngineHandle {
            mailbox: EngineMailbox { tx: event_tx },
            shutdown: shutdown_tx,
            health,
            join: Some(join),
        }
    }

    async fn run(
        mut self,
        mut events: mpsc::Receiver<DispatchEvent>,
        mut shutdown: watch::Receiver<bool>,
        health: Arc<ArcSwap<EngineHealth>>,
        sweep_interval: std::time::Duration,
    ) {
        let mut sweep = tokio::time::interval(sweep_interval);
        // Skip the immediate first tick so a sweep doesn't fire at startup.
        sweep.tick().await;

        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(event) => self.apply(event),
                        None => break, // All handles dropped.
                    }
                }
                _ = sweep.tick() => {
                    self.sweep();
                }
                _ = shutdown.changed() => {
                    break;
                }
            }
        }

        health.store(Arc::new(EngineHealth::Draining));
        self.fail_all_pending();
        health.store(Arc::new(EngineHealth::Stopped));
        info!("dispatch engine stopped");
    }

    /// Applies one event to completion. Exhaustive over every event kind.
    pub(crate) fn apply(&mut self, event: DispatchEvent) {
        match event {
            DispatchEvent::Advertise(ad) => self.on_advertise(ad),
            DispatchEvent::Unadvertise(ad) => self.on_unadvertise(&ad),
            DispatchEvent::Call(request) => self.on_call(request),
            DispatchEvent::Reply(reply) => self.on_reply(reply),
            DispatchEvent::ProcessExit(notice) => self.on_process_exit(&notice),
            DispatchEvent::CallerExit { caller } => self.on_caller_exit(caller),
            DispatchEvent::Cancel { correlation } => self.on_cancel(correlation),
            DispatchEvent::Snapshot { reply } => {
                // A dropped receiver just means the observer went away.
                let _ = reply.send(self.snapshot());
            }
        }
    }

    // -----------------------------------------------------------------------
    // Advertisement lifecycle
    // -----------------------------------------------------------------------

    fn on_advertise(&mut self, ad: Advertisement) {
        let added = self.registry.advertise(ad.instance, &ad.services);
        if added.is_empty() {
            debug!(instance = %ad.instance, "re-advertisement changed nothing");
        } else {
            info!(instance = %ad.instance, services = ?added, "services advertised");
        }
        if self.correlations.references_to(ad.instance) > 0 {
            // The instance re-entered the registry while still executing an
            // earlier call (unadvertise-all followed by advertise). Its
            // reply will free it and drain the queue then.
            self.registry.restore_busy(ad.instance);
            return;
        }
        // A new instance arrives idle; queued work for its services must
        // not sit while an idle instance exists.
        self.drain_onto(ad.instance);
    }

    fn on_unadvertise(&mut self, ad: &Advertisement) {
        let affected = self.registry.unadvertise(ad.instance, &ad.services);
        info!(instance = %ad.instance, services = ?affected, "services withdrawn");
        for service in &affected {
            self.resolve_orphaned(service);
        }
    }

    // -----------------------------------------------------------------------
    // Lookup dispatcher
    // -----------------------------------------------------------------------

    fn on_call(&mut self, request: CallRequest) {
        if self.correlations.contains(request.correlation)
            || self.registry.has_pending_correlation(request.correlation)
        {
            warn!(correlation = %request.correlation, "duplicate correlation id, call ignored");
            return;
        }

        let service = request.service.clone();
        let has_local = self
            .registry
            .service(&service)
            .is_some_and(ServiceEntry::has_instances);

        if has_local {
            match self.registry.select_idle(&service) {
                Some(instance) => self.dispatch_local(
                    instance,
                    service,
                    request.correlation,
                    request.caller,
                    request.payload,
                    request.transaction,
                ),
                None => self.enqueue(request),
            }
            return;
        }

        if self.remote.is_some() {
            self.forward_remote(request);
        } else {
            debug!(service = %service, correlation = %request.correlation, "no such service");
            self.deliver_outcome(
                request.caller,
                request.correlation,
                CallOutcome::Failed(CallError::NoSuchService { service }),
            );
        }
    }

    fn dispatch_local(
        &mut self,
        instance: InstanceId,
        service: ServiceName,
        correlation: CorrelationId,
        caller: CallerId,
        payload: switchboard_core::Payload,
        transaction: Option<switchboard_core::TransactionTag>,
    ) {
        self.registry.mark_busy(instance);
        self.registry.record_dispatch(&service);
        self.correlations.insert(
            correlation,
            CorrelationEntry {
                caller,
                instance,
                service: service.clone(),
                remote: false,
                suppressed: false,
            },
        );
        debug!(%instance, service = %service, %correlation, "call dispatched");
        self.sink.dispatch(
            instance,
            DispatchInstruction {
                service,
                correlation,
                caller,
                payload,
                transaction,
            },
        );
    }

    fn enqueue(&mut self, request: CallRequest) {
        let now = self.clock.now();
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let deadline_at = request.deadline.map(|deadline| {
            now.saturating_add(u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX))
        });
        debug!(
            service = %request.service,
            correlation = %request.correlation,
            "all instances busy, call queued"
        );
        self.registry.enqueue_pending(PendingCall {
            correlation: request.correlation,
            caller: request.caller,
            service: request.service,
            payload: request.payload,
            transaction: request.transaction,
            enqueued_at: now,
            sequence,
            deadline_at,
        });
    }

    fn forward_remote(&mut self, request: CallRequest) {
        let Some(adapter) = self.remote.as_mut() else {
            return;
        };
        let pseudo = adapter.forward(
            self.sink.as_ref(),
            request.service.clone(),
            request.correlation,
            request.payload,
            request.transaction,
        );
        self.correlations.insert(
            request.correlation,
            CorrelationEntry {
                caller: request.caller,
                instance: pseudo,
                service: request.service.clone(),
                remote: true,
                suppressed: false,
            },
        );
        debug!(
            service = %request.service,
            correlation = %request.correlation,
            %pseudo,
            "lookup forwarded to remote bridge"
        );
    }

    // -----------------------------------------------------------------------
    // Reply router
    // -----------------------------------------------------------------------

    fn on_reply(&mut self, reply: CallReply) {
        let Some(entry) = self.correlations.remove(reply.correlation) else {
            // Already resolved by timeout or crash recovery; the caller got
            // its terminal outcome, so this is dropped without a ripple.
            debug!(
                correlation = %reply.correlation,
                instance = %reply.instance,
                "stale reply discarded"
            );
            return;
        };

        if entry.instance != reply.instance {
            warn!(
                expected = %entry.instance,
                got = %reply.instance,
                correlation = %reply.correlation,
                "reply instance mismatch, honoring correlation entry"
            );
        }

        if entry.suppressed {
            debug!(correlation = %reply.correlation, "reply for abandoned call not delivered");
        } else {
            self.deliver_outcome(
                entry.caller,
                reply.correlation,
                CallOutcome::Reply {
                    status: reply.status,
                    payload: reply.payload,
                },
            );
        }

        if entry.remote {
            // Single-use pseudo-instance: nothing to free, nothing to drain.
            return;
        }

        self.registry.mark_idle(entry.instance);
        self.drain_onto(entry.instance);
    }

    /// Gives an idle instance the oldest queued call among the services it
    /// advertises. Queue drainage stays proportional to replies: one freed
    /// instance, at most one dispatch, no full rescan.
    fn drain_onto(&mut self, instance: InstanceId) {
        if !self.registry.is_idle(instance) {
            return;
        }
        let services = self.registry.instance_services(instance);
        if services.is_empty() {
            return;
        }
        loop {
            let mut oldest: Option<(ServiceName, u64)> = None;
            for service in &services {
                if let Some(sequence) = self.registry.front_pending_seq(service) {
                    if oldest.as_ref().is_none_or(|(_, best)| sequence < *best) {
                        oldest = Some((service.clone(), sequence));
                    }
                }
            }
            let Some((service, _)) = oldest else {
                return;
            };
            let Some(call) = self.registry.pop_pending(&service) else {
                return;
            };
            if call.is_expired(self.clock.now()) {
                debug!(
                    correlation = %call.correlation,
                    service = %service,
                    "queued call expired before dispatch"
                );
                self.deliver_outcome(
                    call.caller,
                    call.correlation,
                    CallOutcome::Failed(CallError::Timeout),
                );
                continue;
            }
            self.dispatch_local(
                instance,
                call.service,
                call.correlation,
                call.caller,
                call.payload,
                call.transaction,
            );
            return;
        }
    }

    // -----------------------------------------------------------------------
    // Instance lifecycle monitor
    // -----------------------------------------------------------------------

    fn on_process_exit(&mut self, notice: &ExitNotice) {
        // Fail the in-flight call first, while the correlation still names
        // its caller. Remote collaborator failures arrive here too, as an
        // exit notice for the pseudo-instance.
        for (correlation, entry) in self.correlations.take_by_instance(notice.instance) {
            if entry.suppressed {
                debug!(%correlation, "abandoned in-flight call ended by instance exit");
            } else {
                self.deliver_outcome(
                    entry.caller,
                    correlation,
                    CallOutcome::Failed(CallError::InstanceTerminated),
                );
            }
        }

        let affected = self.registry.remove_instance(notice.instance);
        info!(
            instance = %notice.instance,
            reason = ?notice.reason,
            services = ?affected,
            "instance removed"
        );
        for service in &affected {
            self.resolve_orphaned(service);
        }
    }

    /// Resolves the pending queue of a service whose last instance vanished:
    /// re-submitted through the remote bridge when one exists, failed with
    /// `ServiceUnavailable` otherwise — each call individually, never
    /// dropped silently.
    fn resolve_orphaned(&mut self, service: &ServiceName) {
        let still_served = self
            .registry
            .service(service)
            .is_none_or(ServiceEntry::has_instances);
        if still_served {
            return;
        }

        let now = self.clock.now();
        for call in self.registry.take_pending(service) {
            if call.is_expired(now) {
                self.deliver_outcome(
                    call.caller,
                    call.correlation,
                    CallOutcome::Failed(CallError::Timeout),
                );
                continue;
            }
            if let Some(adapter) = self.remote.as_mut() {
                let pseudo = adapter.forward(
                    self.sink.as_ref(),
                    call.service.clone(),
                    call.correlation,
                    call.payload,
                    call.transaction,
                );
                self.correlations.insert(
                    call.correlation,
                    CorrelationEntry {
                        caller: call.caller,
                        instance: pseudo,
                        service: call.service,
                        remote: true,
                        suppressed: false,
                    },
                );
            } else {
                self.deliver_outcome(
                    call.caller,
                    call.correlation,
                    CallOutcome::Failed(CallError::ServiceUnavailable {
                        service: call.service,
                    }),
                );
            }
        }
        self.registry.remove_service_if_empty(service);
    }

    // -----------------------------------------------------------------------
    // Caller lifecycle
    // -----------------------------------------------------------------------

    fn on_caller_exit(&mut self, caller: CallerId) {
        let touched = self.registry.purge_caller(caller);
        for (correlation, instance, remote) in self.correlations.suppress_for_caller(caller) {
            if !remote {
                self.sink.cancel_hint(instance, correlation);
            }
        }
        for service in &touched {
            self.registry.remove_service_if_empty(service);
        }
        debug!(%caller, purged = ?touched, "caller departed");
    }

    fn on_cancel(&mut self, correlation: CorrelationId) {
        if let Some(call) = self.registry.remove_pending(correlation) {
            debug!(%correlation, service = %call.service, "queued call cancelled");
            self.registry.remove_service_if_empty(&call.service);
            return;
        }
        match self.correlations.get_mut(correlation) {
            Some(entry) if !entry.suppressed => {
                entry.suppressed = true;
                let instance = entry.instance;
                let remote = entry.remote;
                if !remote {
                    self.sink.cancel_hint(instance, correlation);
                }
                debug!(%correlation, "in-flight call abandoned, delivery suppressed");
            }
            _ => debug!(%correlation, "cancel for unknown or resolved call ignored"),
        }
    }

    // -----------------------------------------------------------------------
    // Timeout sweep, snapshot, shutdown
    // -----------------------------------------------------------------------

    pub(crate) fn sweep(&mut self) {
        let now = self.clock.now();
        for call in self.registry.sweep_expired(now) {
            debug!(
                correlation = %call.correlation,
                service = %call.service,
                "pending call timed out"
            );
            self.deliver_outcome(
                call.caller,
                call.correlation,
                CallOutcome::Failed(CallError::Timeout),
            );
            self.registry.remove_service_if_empty(&call.service);
        }
    }

    fn snapshot(&self) -> BrokerSnapshot {
        BrokerSnapshot {
            services: self.registry.snapshot(),
            in_flight: self.correlations.len(),
        }
    }

    fn fail_all_pending(&mut self) {
        for service in self.registry.service_names() {
            for call in self.registry.take_pending(&service) {
                self.deliver_outcome(
                    call.caller,
                    call.correlation,
                    CallOutcome::Failed(CallError::ServiceUnavailable {
                        service: call.service.clone(),
                    }),
                );
            }
            self.registry.remove_service_if_empty(&service);
        }
    }

    fn deliver_outcome(&self, caller: CallerId, correlation: CorrelationId, outcome: CallOutcome) {
        self.sink.deliver(
            caller,
            Delivery {
                correlation,
                outcome,
            },
        );
    }

    /// Checks the structural invariants that must hold between events.
    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        use super::types::InstanceState;

        for instance in self.registry.instances() {
            let references = self.correlations.references_to(instance.id);
            match instance.state {
                InstanceState::Busy => assert_eq!(
                    references, 1,
                    "busy {} must be referenced by exactly one correlation entry",
                    instance.id
                ),
                InstanceState::Idle => assert_eq!(
                    references, 0,
                    "idle {} must not be referenced by any correlation entry",
                    instance.id
                ),
            }
        }

        for name in self.registry.service_names() {
            let entry = self.registry.service(&name).expect("service entry");
            if !entry.pending.is_empty() {
                for id in entry.instances() {
                    assert!(
                        !self.registry.is_idle(id),
                        "service {name} has queued calls while {id} is idle"
                    );
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// EngineMailbox
// ---------------------------------------------------------------------------

/// Cloneable event submitter for the dispatch loop.
#[derive(Debug, Clone)]
pub struct EngineMailbox {
    tx: mpsc::Sender<DispatchEvent>,
}

impl EngineMailbox {
    /// Submits an event, waiting for channel capacity.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine has stopped.
    pub async fn submit(&self, event: DispatchEvent) -> anyhow::Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| anyhow::anyhow!("dispatch engine stopped"))
    }

    /// Submits an event without waiting. Used from synchronous contexts
    /// (e.g. drop handlers); a full channel loses the event.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine has stopped or the channel is full.
    pub fn try_submit(&self, event: DispatchEvent) -> anyhow::Result<()> {
        self.tx
            .try_send(event)
            .map_err(|_| anyhow::anyhow!("dispatch engine unavailable"))
    }
}

// ---------------------------------------------------------------------------
// EngineHandle
// ---------------------------------------------------------------------------

/// Owner handle for a spawned dispatch loop.
pub struct EngineHandle {
    mailbox: EngineMailbox,
    shutdown: watch::Sender<bool>,
    health: Arc<ArcSwap<EngineHealth>>,
    join: Option<JoinHandle<()>>,
}

impl EngineHandle {
    /// Returns a cloneable event submitter.
    #[must_use]
    pub fn mailbox(&self) -> EngineMailbox {
        self.mailbox.clone()
    }

    /// Submits an event through the handle's own mailbox.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine has stopped.
    pub async fn submit(&self, event: DispatchEvent) -> anyhow::Result<()> {
        self.mailbox.submit(event).await
    }

    /// Requests a consistent state dump from the serialized loop.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine stopped before answering.
    pub async fn snapshot(&self) -> anyhow::Result<BrokerSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.mailbox
            .submit(DispatchEvent::Snapshot { reply: tx })
            .await?;
        rx.await
            .map_err(|_| anyhow::anyhow!("dispatch engine stopped before answering"))
    }

    /// Current lifecycle state of the loop.
    #[must_use]
    pub fn health(&self) -> EngineHealth {
        **self.health.load()
    }

    /// Stops the loop gracefully: queued calls are failed with
    /// `ServiceUnavailable`, then the task exits.
    pub async fn stop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use switchboard_core::{ManualClock, Payload, ReplyStatus};

    use crate::dispatch::test_support::{Emission, RecordingSink};

    use super::*;

    /// Drives the state machine directly, without a spawned loop, so every
    /// test is fully deterministic. Invariants are re-checked after each
    /// applied event.
    struct Harness {
        engine: DispatchEngine,
        sink: Arc<RecordingSink>,
        clock: Arc<ManualClock>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(&BrokerConfig::default())
        }

        fn with_remote_bridge() -> Self {
            Self::with_config(&BrokerConfig {
                remote_bridge_enabled: true,
                ..BrokerConfig::default()
            })
        }

        fn with_config(config: &BrokerConfig) -> Self {
            let sink = Arc::new(RecordingSink::new());
            let clock = Arc::new(ManualClock::starting_at(1_000));
            let engine = DispatchEngine::new(config, sink.clone(), clock.clone());
            Self {
                engine,
                sink,
                clock,
            }
        }

        fn apply(&mut self, event: DispatchEvent) {
            self.engine.apply(event);
            self.engine.assert_invariants();
        }

        fn advertise(&mut self, instance: u64, services: &[&str]) {
            self.apply(DispatchEvent::Advertise(Advertisement {
                instance: InstanceId(instance),
                services: services.iter().map(|name| (*name).into()).collect(),
            }));
        }

        fn unadvertise(&mut self, instance: u64, services: &[&str]) {
            self.apply(DispatchEvent::Unadvertise(Advertisement {
                instance: InstanceId(instance),
                services: services.iter().map(|name| (*name).into()).collect(),
            }));
        }

        fn call(&mut self, service: &str, caller: u64) -> CorrelationId {
            self.call_with_deadline(service, caller, None)
        }

        fn call_with_deadline(
            &mut self,
            service: &str,
            caller: u64,
            deadline: Option<Duration>,
        ) -> CorrelationId {
            let correlation = CorrelationId::generate();
            self.apply(DispatchEvent::Call(CallRequest {
                service: service.into(),
                correlation,
                caller: CallerId(caller),
                payload: Payload::from_static(b"req"),
                transaction: None,
                deadline,
            }));
            correlation
        }

        fn reply(&mut self, instance: u64, correlation: CorrelationId) {
            self.apply(DispatchEvent::Reply(CallReply {
                instance: InstanceId(instance),
                correlation,
                status: ReplyStatus::Success,
                payload: Payload::from_static(b"ok"),
            }));
        }

        fn exit(&mut self, instance: u64) {
            self.apply(DispatchEvent::ProcessExit(ExitNotice {
                instance: InstanceId(instance),
                reason: switchboard_core::ExitReason::Crashed,
            }));
        }

        fn dispatched_to(&self, correlation: CorrelationId) -> Option<InstanceId> {
            self.sink
                .dispatches()
                .into_iter()
                .find(|(_, instruction)| instruction.correlation == correlation)
                .map(|(instance, _)| instance)
        }
    }

    fn failure(outcomes: &[CallOutcome]) -> &CallError {
        match outcomes {
            [CallOutcome::Failed(error)] => error,
            other => panic!("expected a single failure outcome, got {other:?}"),
        }
    }

    #[test]
    fn immediate_dispatch_then_queue_then_drain_on_reply() {
        let mut h = Harness::new();
        h.advertise(1, &["echo"]);

        let corr_a = h.call("echo", 10);
        assert_eq!(h.dispatched_to(corr_a), Some(InstanceId(1)));

        // P1 is busy: the second call queues.
        let corr_b = h.call("echo", 11);
        assert_eq!(h.dispatched_to(corr_b), None);

        h.reply(1, corr_a);
        assert!(matches!(
            h.sink.outcomes_for(corr_a).as_slice(),
            [CallOutcome::Reply { status: ReplyStatus::Success, .. }]
        ));
        // The freed instance immediately takes the queue head.
        assert_eq!(h.dispatched_to(corr_b), Some(InstanceId(1)));
    }

    #[test]
    fn crash_fails_only_the_inflight_call() {
        let mut h = Harness::new();
        h.advertise(1, &["echo"]);

        let corr = h.call("echo", 10);
        h.exit(1);

        assert_eq!(
            failure(&h.sink.outcomes_for(corr)),
            &CallError::InstanceTerminated
        );
        assert!(h.engine.snapshot().services.is_empty());
    }

    #[test]
    fn unknown_service_rejected_synchronously_without_state() {
        let mut h = Harness::new();
        let corr = h.call("ghost-service", 10);

        assert_eq!(
            failure(&h.sink.outcomes_for(corr)),
            &CallError::NoSuchService {
                service: "ghost-service".into()
            }
        );
        let snapshot = h.engine.snapshot();
        assert!(snapshot.services.is_empty());
        assert_eq!(snapshot.in_flight, 0);
    }

    #[test]
    fn queued_calls_dispatch_in_arrival_order() {
        let mut h = Harness::new();
        h.advertise(1, &["echo"]);
        let first = h.call("echo", 10);
        let queued: Vec<CorrelationId> = (0..3).map(|i| h.call("echo", 20 + i)).collect();

        h.reply(1, first);
        h.reply(1, queued[0]);
        h.reply(1, queued[1]);
        h.reply(1, queued[2]);

        let order: Vec<CorrelationId> = h
            .sink
            .dispatches()
            .into_iter()
            .map(|(_, instruction)| instruction.correlation)
            .collect();
        assert_eq!(order, {
            let mut expected = vec![first];
            expected.extend(&queued);
            expected
        });
    }

    #[test]
    fn n_idle_instances_each_receive_exactly_one_call() {
        let mut h = Harness::new();
        for instance in 1..=4 {
            h.advertise(instance, &["echo"]);
        }
        for caller in 0..4 {
            h.call("echo", caller);
        }

        let mut targets: Vec<InstanceId> = h
            .sink
            .dispatches()
            .into_iter()
            .map(|(instance, _)| instance)
            .collect();
        targets.sort_by_key(|id| id.0);
        assert_eq!(
            targets,
            vec![InstanceId(1), InstanceId(2), InstanceId(3), InstanceId(4)]
        );
    }

    #[test]
    fn round_robin_rotates_between_sequential_calls() {
        let mut h = Harness::new();
        h.advertise(1, &["echo"]);
        h.advertise(2, &["echo"]);

        let first = h.call("echo", 10);
        h.reply(
            h.dispatched_to(first).expect("dispatched").0,
            first,
        );
        let second = h.call("echo", 10);

        // Both instances were idle both times; the cursor still moves on.
        assert_ne!(h.dispatched_to(first), h.dispatched_to(second));
    }

    #[test]
    fn crash_isolation_keeps_sibling_queue_intact() {
        let mut h = Harness::new();
        h.advertise(1, &["echo"]);
        h.advertise(2, &["echo"]);

        let on_one = h.call("echo", 10);
        let on_two = h.call("echo", 11);
        let queued = h.call("echo", 12);

        let crashed = h.dispatched_to(on_one).expect("dispatched");
        h.exit(crashed.0);

        assert_eq!(
            failure(&h.sink.outcomes_for(on_one)),
            &CallError::InstanceTerminated
        );
        // The sibling call is untouched and the queued call still waits:
        // another instance remains alive.
        assert!(h.sink.outcomes_for(on_two).is_empty());
        assert!(h.sink.outcomes_for(queued).is_empty());
        let snapshot = h.engine.snapshot();
        assert_eq!(snapshot.services[0].pending_depth, 1);
    }

    #[test]
    fn orphaned_queue_fails_individually_when_last_instance_dies() {
        let mut h = Harness::new();
        h.advertise(1, &["echo"]);
        let inflight = h.call("echo", 10);
        let queued_a = h.call("echo", 11);
        let queued_b = h.call("echo", 12);

        h.exit(1);

        assert_eq!(
            failure(&h.sink.outcomes_for(inflight)),
            &CallError::InstanceTerminated
        );
        for queued in [queued_a, queued_b] {
            assert_eq!(
                failure(&h.sink.outcomes_for(queued)),
                &CallError::ServiceUnavailable {
                    service: "echo".into()
                }
            );
        }
        assert!(h.engine.snapshot().services.is_empty());
    }

    #[test]
    fn stale_reply_is_discarded_silently() {
        let mut h = Harness::new();
        h.advertise(1, &["echo"]);
        let corr = h.call("echo", 10);
        h.reply(1, corr);
        h.sink.take();

        // Duplicate reply: already resolved, nothing may happen.
        h.reply(1, corr);
        assert!(h.sink.take().is_empty());

        // Reply for a correlation that never existed.
        h.apply(DispatchEvent::Reply(CallReply {
            instance: InstanceId(1),
            correlation: CorrelationId::generate(),
            status: ReplyStatus::Success,
            payload: Payload::from_static(b"late"),
        }));
        assert!(h.sink.take().is_empty());
    }

    #[test]
    fn duplicate_correlation_id_is_ignored() {
        let mut h = Harness::new();
        h.advertise(1, &["echo"]);
        let corr = h.call("echo", 10);

        h.apply(DispatchEvent::Call(CallRequest {
            service: "echo".into(),
            correlation: corr,
            caller: CallerId(66),
            payload: Payload::from_static(b"dup"),
            transaction: None,
            deadline: None,
        }));

        assert_eq!(h.sink.dispatches().len(), 1);
        assert_eq!(h.engine.snapshot().in_flight, 1);
    }

    #[test]
    fn sweep_times_out_expired_pending_calls_only() {
        let mut h = Harness::new();
        h.advertise(1, &["echo"]);
        let inflight = h.call("echo", 10);
        let expiring = h.call_with_deadline("echo", 11, Some(Duration::from_millis(50)));
        let lasting = h.call("echo", 12);

        h.clock.advance(49);
        h.engine.sweep();
        h.engine.assert_invariants();
        assert!(h.sink.outcomes_for(expiring).is_empty());

        h.clock.advance(1);
        h.engine.sweep();
        h.engine.assert_invariants();
        assert_eq!(failure(&h.sink.outcomes_for(expiring)), &CallError::Timeout);

        // The in-flight call and the deadline-less one are untouched.
        assert!(h.sink.outcomes_for(inflight).is_empty());
        assert!(h.sink.outcomes_for(lasting).is_empty());
        assert_eq!(h.engine.snapshot().services[0].pending_depth, 1);
    }

    #[test]
    fn expired_queue_head_is_skipped_when_draining() {
        let mut h = Harness::new();
        h.advertise(1, &["echo"]);
        let inflight = h.call("echo", 10);
        let expiring = h.call_with_deadline("echo", 11, Some(Duration::from_millis(50)));
        let lasting = h.call("echo", 12);

        h.clock.advance(100);
        h.reply(1, inflight);

        // The drain resolved the expired head as Timeout and dispatched the
        // next queued call in the same pass.
        assert_eq!(failure(&h.sink.outcomes_for(expiring)), &CallError::Timeout);
        assert_eq!(h.dispatched_to(lasting), Some(InstanceId(1)));
    }

    #[test]
    fn cancel_removes_a_queued_call_without_delivery() {
        let mut h = Harness::new();
        h.advertise(1, &["echo"]);
        let inflight = h.call("echo", 10);
        let queued = h.call("echo", 11);

        h.apply(DispatchEvent::Cancel {
            correlation: queued,
        });
        h.reply(1, inflight);

        assert!(h.sink.outcomes_for(queued).is_empty());
        assert_eq!(h.dispatched_to(queued), None);
        assert_eq!(h.engine.snapshot().services[0].pending_depth, 0);
    }

    #[test]
    fn cancel_of_inflight_call_hints_and_suppresses_delivery() {
        let mut h = Harness::new();
        h.advertise(1, &["echo"]);
        let corr = h.call("echo", 10);

        h.apply(DispatchEvent::Cancel { correlation: corr });
        assert!(h
            .sink
            .take()
            .iter()
            .any(|emission| matches!(emission, Emission::CancelHint { instance, correlation }
                if *instance == InstanceId(1) && *correlation == corr)));

        // The eventual reply frees the instance but is not delivered.
        h.reply(1, corr);
        assert!(h.sink.outcomes_for(corr).is_empty());
        let next = h.call("echo", 11);
        assert_eq!(h.dispatched_to(next), Some(InstanceId(1)));
    }

    #[test]
    fn caller_exit_purges_queued_and_suppresses_inflight_calls() {
        let mut h = Harness::new();
        h.advertise(1, &["echo"]);
        let inflight = h.call("echo", 10);
        let queued_mine = h.call("echo", 10);
        let queued_other = h.call("echo", 11);

        h.apply(DispatchEvent::CallerExit {
            caller: CallerId(10),
        });

        let emissions = h.sink.take();
        let hints = emissions
            .iter()
            .filter(|emission| matches!(emission, Emission::CancelHint { .. }))
            .count();
        assert_eq!(hints, 1);

        // The departed caller's queued call is gone; the sibling remains.
        h.reply(1, inflight);
        assert!(h.sink.outcomes_for(inflight).is_empty());
        assert!(h.sink.outcomes_for(queued_mine).is_empty());
        assert_eq!(h.dispatched_to(queued_other), Some(InstanceId(1)));
    }

    #[test]
    fn unadvertise_of_last_instance_fails_pending_queue() {
        let mut h = Harness::new();
        h.advertise(1, &["echo"]);
        let inflight = h.call("echo", 10);
        let queued = h.call("echo", 11);

        h.unadvertise(1, &["echo"]);

        assert_eq!(
            failure(&h.sink.outcomes_for(queued)),
            &CallError::ServiceUnavailable {
                service: "echo".into()
            }
        );
        // The in-flight call still resolves through its correlation entry.
        h.reply(1, inflight);
        assert!(matches!(
            h.sink.outcomes_for(inflight).as_slice(),
            [CallOutcome::Reply { .. }]
        ));
    }

    #[test]
    fn readvertise_while_executing_comes_back_busy() {
        let mut h = Harness::new();
        h.advertise(1, &["echo"]);
        let inflight = h.call("echo", 10);

        // The instance leaves mid-call and returns before replying.
        h.unadvertise(1, &["echo"]);
        h.advertise(1, &["echo"]);

        // It is still executing: new calls must queue, not double-dispatch.
        let queued = h.call("echo", 11);
        assert_eq!(h.dispatched_to(queued), None);

        h.reply(1, inflight);
        assert_eq!(h.dispatched_to(queued), Some(InstanceId(1)));
    }

    #[test]
    fn advertise_drains_waiting_calls_onto_the_new_instance() {
        let mut h = Harness::new();
        h.advertise(1, &["echo"]);
        let _inflight = h.call("echo", 10);
        let queued = h.call("echo", 11);

        h.advertise(2, &["echo"]);
        assert_eq!(h.dispatched_to(queued), Some(InstanceId(2)));
    }

    #[test]
    fn freed_instance_serves_oldest_call_across_its_services() {
        let mut h = Harness::new();
        h.advertise(1, &["alpha", "beta"]);
        let first = h.call("alpha", 10);
        let queued_beta = h.call("beta", 11);
        let queued_alpha = h.call("alpha", 12);

        h.reply(1, first);
        // beta's call arrived before alpha's second: it wins the instance.
        assert_eq!(h.dispatched_to(queued_beta), Some(InstanceId(1)));
        assert_eq!(h.dispatched_to(queued_alpha), None);
    }

    #[test]
    fn remote_bridge_forwards_and_folds_reply_back() {
        let mut h = Harness::with_remote_bridge();
        let corr = h.call("elsewhere", 10);

        let forwarded = h
            .sink
            .take()
            .into_iter()
            .find_map(|emission| match emission {
                Emission::RemoteForward(request) => Some(request),
                _ => None,
            })
            .expect("remote forward");
        assert_eq!(forwarded.correlation, corr);
        assert_eq!(h.engine.snapshot().in_flight, 1);

        // Collaborator answers as the pseudo-instance.
        h.reply(forwarded.pseudo_instance.0, corr);
        assert!(matches!(
            h.sink.outcomes_for(corr).as_slice(),
            [CallOutcome::Reply { .. }]
        ));
        assert_eq!(h.engine.snapshot().in_flight, 0);
        // Single use: the pseudo-instance never entered the registry.
        assert!(h.engine.snapshot().services.is_empty());
    }

    #[test]
    fn remote_bridge_failure_arrives_as_pseudo_instance_exit() {
        let mut h = Harness::with_remote_bridge();
        let corr = h.call("elsewhere", 10);
        let forwarded = h
            .sink
            .take()
            .into_iter()
            .find_map(|emission| match emission {
                Emission::RemoteForward(request) => Some(request),
                _ => None,
            })
            .expect("remote forward");

        h.exit(forwarded.pseudo_instance.0);
        assert_eq!(
            failure(&h.sink.outcomes_for(corr)),
            &CallError::InstanceTerminated
        );
    }

    #[test]
    fn orphaned_queue_resubmits_through_remote_bridge() {
        let mut h = Harness::with_remote_bridge();
        h.advertise(1, &["echo"]);
        let inflight = h.call("echo", 10);
        let queued = h.call("echo", 11);
        h.sink.take();

        h.exit(1);

        assert_eq!(
            failure(&h.sink.outcomes_for(inflight)),
            &CallError::InstanceTerminated
        );
        // The queued call was not failed: it went to the collaborator.
        assert!(h.sink.outcomes_for(queued).is_empty());
        assert!(h
            .sink
            .take()
            .iter()
            .any(|emission| matches!(emission, Emission::RemoteForward(request)
                if request.correlation == queued)));
    }

    #[test]
    fn shutdown_drain_fails_every_queued_call() {
        let mut h = Harness::new();
        h.advertise(1, &["echo"]);
        let _inflight = h.call("echo", 10);
        let queued_a = h.call("echo", 11);
        let queued_b = h.call("echo", 12);

        h.engine.fail_all_pending();

        for queued in [queued_a, queued_b] {
            assert_eq!(
                failure(&h.sink.outcomes_for(queued)),
                &CallError::ServiceUnavailable {
                    service: "echo".into()
                }
            );
        }
    }

    #[test]
    fn snapshot_reports_states_depths_and_counters() {
        let mut h = Harness::new();
        h.advertise(1, &["echo"]);
        h.advertise(2, &["echo"]);
        let first = h.call("echo", 10);
        let _second = h.call("echo", 11);
        let _queued = h.call("echo", 12);
        h.reply(h.dispatched_to(first).expect("dispatched").0, first);

        let snapshot = h.engine.snapshot();
        assert_eq!(snapshot.services.len(), 1);
        let echo = &snapshot.services[0];
        assert_eq!(echo.name.as_str(), "echo");
        // Reply freed one instance, which immediately took the queued call.
        assert_eq!(echo.pending_depth, 0);
        assert_eq!(echo.lookups, 3);
        assert_eq!(snapshot.in_flight, 2);
        assert_eq!(
            echo.instances.iter().map(|i| i.invoked).sum::<u64>(),
            3
        );
    }
}
