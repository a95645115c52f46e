//! Service → instance registry with per-service pending queues.
//!
//! Pure data structure: every operation is a structural mutation and nothing
//! here ever sends a message. Deciding *what* to do about a mutation
//! (dispatch, fail, forward) is the engine's job.

use std::collections::HashMap;

use switchboard_core::{CallerId, CorrelationId, InstanceId, ServiceName};

use super::types::{
    Instance, InstanceSnapshot, InstanceState, PendingCall, ServiceEntry, ServiceSnapshot,
};

/// Owner of all instances and service entries.
#[derive(Debug, Default)]
pub struct Registry {
    services: HashMap<ServiceName, ServiceEntry>,
    instances: HashMap<InstanceId, Instance>,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // -----------------------------------------------------------------------
    // Instance/service membership
    // -----------------------------------------------------------------------

    /// Associates an instance with the given services, creating the instance
    /// (Idle) and any missing service entries lazily.
    ///
    /// Idempotent per (instance, service) pair. Returns the services the
    /// instance was newly associated with.
    pub fn advertise(&mut self, id: InstanceId, services: &[ServiceName]) -> Vec<ServiceName> {
        let instance = self
            .instances
            .entry(id)
            .or_insert_with(|| Instance::new(id));

        let mut added = Vec::new();
        for name in services {
            let entry = self
                .services
                .entry(name.clone())
                .or_insert_with(|| ServiceEntry::new(name.clone()));
            if entry.add_instance(id) {
                instance.services.insert(name.clone());
                added.push(name.clone());
            }
        }
        added
    }

    /// Removes the association between an instance and the given services.
    ///
    /// An instance whose advertised set becomes empty is removed entirely.
    /// Returns the services an association was actually removed from; the
    /// caller decides what happens to entries left without instances.
    pub fn unadvertise(&mut self, id: InstanceId, services: &[ServiceName]) -> Vec<ServiceName> {
        let mut affected = Vec::new();
        for name in services {
            if let Some(entry) = self.services.get_mut(name) {
                if entry.remove_instance(id) {
                    affected.push(name.clone());
                }
            }
            if let Some(instance) = self.instances.get_mut(&id) {
                instance.services.remove(name);
            }
        }
        if self
            .instances
            .get(&id)
            .is_some_and(|instance| instance.services.is_empty())
        {
            self.instances.remove(&id);
        }
        affected
    }

    /// Cascades removal of an instance from every service entry it belongs
    /// to. Returns the affected service names for the lifecycle monitor.
    pub fn remove_instance(&mut self, id: InstanceId) -> Vec<ServiceName> {
        let Some(instance) = self.instances.remove(&id) else {
            return Vec::new();
        };
        let mut affected = Vec::new();
        for name in &instance.services {
            if let Some(entry) = self.services.get_mut(name) {
                if entry.remove_instance(id) {
                    affected.push(name.clone());
                }
            }
        }
        affected
    }

    /// Looks up an instance by id.
    #[must_use]
    pub fn instance(&self, id: InstanceId) -> Option<&Instance> {
        self.instances.get(&id)
    }

    /// Returns `true` when the instance exists and is Idle.
    #[must_use]
    pub fn is_idle(&self, id: InstanceId) -> bool {
        self.instances.get(&id).is_some_and(Instance::is_idle)
    }

    /// The services an instance currently advertises, cloned out so the
    /// caller can keep mutating the registry while iterating.
    #[must_use]
    pub fn instance_services(&self, id: InstanceId) -> Vec<ServiceName> {
        self.instances
            .get(&id)
            .map(|instance| instance.services.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Marks an instance Busy and counts the dispatch. Returns `false` if
    /// the instance is unknown.
    pub fn mark_busy(&mut self, id: InstanceId) -> bool {
        match self.instances.get_mut(&id) {
            Some(instance) => {
                instance.state = InstanceState::Busy;
                instance.invoked += 1;
                true
            }
            None => false,
        }
    }

    /// Reinstates Busy without counting a dispatch. Used when an instance
    /// re-enters the registry while still executing an in-flight call (it
    /// unadvertised everything mid-call, then advertised again).
    pub fn restore_busy(&mut self, id: InstanceId) -> bool {
        match self.instances.get_mut(&id) {
            Some(instance) => {
                instance.state = InstanceState::Busy;
                true
            }
            None => false,
        }
    }

    /// Marks an instance Idle. Returns `false` if the instance is unknown.
    pub fn mark_idle(&mut self, id: InstanceId) -> bool {
        match self.instances.get_mut(&id) {
            Some(instance) => {
                instance.state = InstanceState::Idle;
                true
            }
            None => false,
        }
    }

    // -----------------------------------------------------------------------
    // Lookup support
    // -----------------------------------------------------------------------

    /// Round-robin selection of the next Idle instance for a service.
    /// Advances the service's cursor past the selected slot.
    pub fn select_idle(&mut self, service: &ServiceName) -> Option<InstanceId> {
        let entry = self.services.get_mut(service)?;
        let instances = &self.instances;
        entry.select_instance(|id| instances.get(&id).is_some_and(Instance::is_idle))
    }

    /// Looks up a service entry by name.
    #[must_use]
    pub fn service(&self, name: &ServiceName) -> Option<&ServiceEntry> {
        self.services.get(name)
    }

    /// Counts a dispatch against the service's lifetime total.
    pub fn record_dispatch(&mut self, name: &ServiceName) {
        if let Some(entry) = self.services.get_mut(name) {
            entry.lookups += 1;
        }
    }

    // -----------------------------------------------------------------------
    // Pending queue access
    // -----------------------------------------------------------------------

    /// Appends a call to its service's FIFO pending queue. The entry is
    /// created if missing (a call can be queued against a service whose
    /// instances all vanished in the same event).
    pub fn enqueue_pending(&mut self, call: PendingCall) {
        let entry = self
            .services
            .entry(call.service.clone())
            .or_insert_with(|| ServiceEntry::new(call.service.clone()));
        entry.pending.push_back(call);
    }

    /// Arrival-order stamp of the service's queue head, if any.
    #[must_use]
    pub fn front_pending_seq(&self, name: &ServiceName) -> Option<u64> {
        self.services
            .get(name)
            .and_then(|entry| entry.pending.front())
            .map(|call| call.sequence)
    }

    /// Pops the service's queue head.
    pub fn pop_pending(&mut self, name: &ServiceName) -> Option<PendingCall> {
        self.services.get_mut(name)?.pending.pop_front()
    }

    /// Drains the service's whole pending queue, preserving order.
    pub fn take_pending(&mut self, name: &ServiceName) -> Vec<PendingCall> {
        match self.services.get_mut(name) {
            Some(entry) => entry.pending.drain(..).collect(),
            None => Vec::new(),
        }
    }

    /// Removes a queued call by correlation id, searching every service.
    pub fn remove_pending(&mut self, correlation: CorrelationId) -> Option<PendingCall> {
        for entry in self.services.values_mut() {
            if let Some(index) = entry
                .pending
                .iter()
                .position(|call| call.correlation == correlation)
            {
                return entry.pending.remove(index);
            }
        }
        None
    }

    /// Returns `true` if any pending queue holds the correlation id.
    #[must_use]
    pub fn has_pending_correlation(&self, correlation: CorrelationId) -> bool {
        self.services
            .values()
            .any(|entry| entry.pending.iter().any(|call| call.correlation == correlation))
    }

    /// Removes every queued call owned by a departed caller, with no
    /// delivery. Returns the services whose queues were touched.
    pub fn purge_caller(&mut self, caller: CallerId) -> Vec<ServiceName> {
        let mut touched = Vec::new();
        for entry in self.services.values_mut() {
            let before = entry.pending.len();
            entry.pending.retain(|call| call.caller != caller);
            if entry.pending.len() != before {
                touched.push(entry.name.clone());
            }
        }
        touched
    }

    /// Removes every queued call whose deadline has elapsed, across all
    /// services, and returns them for individual Timeout delivery.
    pub fn sweep_expired(&mut self, now_ms: u64) -> Vec<PendingCall> {
        let mut expired = Vec::new();
        for entry in self.services.values_mut() {
            let mut index = 0;
            while index < entry.pending.len() {
                if entry.pending[index].is_expired(now_ms) {
                    if let Some(call) = entry.pending.remove(index) {
                        expired.push(call);
                    }
                } else {
                    index += 1;
                }
            }
        }
        expired
    }

    // -----------------------------------------------------------------------
    // Entry lifecycle and observation
    // -----------------------------------------------------------------------

    /// Drops a service entry once it holds no instances and no pending work.
    /// Returns `true` if the entry was removed.
    pub fn remove_service_if_empty(&mut self, name: &ServiceName) -> bool {
        if self.services.get(name).is_some_and(ServiceEntry::is_empty) {
            self.services.remove(name);
            return true;
        }
        false
    }

    /// All known service names, cloned out for iteration while mutating.
    #[must_use]
    pub fn service_names(&self) -> Vec<ServiceName> {
        self.services.keys().cloned().collect()
    }

    /// Number of known instances.
    #[must_use]
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// All known instances, in no particular order.
    pub fn instances(&self) -> impl Iterator<Item = &Instance> {
        self.instances.values()
    }

    /// Read-only dump of every service, sorted by name.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ServiceSnapshot> {
        let mut services: Vec<ServiceSnapshot> = self
            .services
            .values()
            .map(|entry| ServiceSnapshot {
                name: entry.name.clone(),
                instances: entry
                    .instances()
                    .filter_map(|id| self.instances.get(&id))
                    .map(|instance| InstanceSnapshot {
                        id: instance.id,
                        state: instance.state,
                        invoked: instance.invoked,
                    })
                    .collect(),
                pending_depth: entry.pending.len(),
                lookups: entry.lookups,
            })
            .collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        services
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use switchboard_core::Payload;

    use super::*;

    fn names(list: &[&str]) -> Vec<ServiceName> {
        list.iter().map(|name| ServiceName::from(*name)).collect()
    }

    fn pending(service: &str, caller: u64, sequence: u64) -> PendingCall {
        PendingCall {
            correlation: CorrelationId::generate(),
            caller: CallerId(caller),
            service: service.into(),
            payload: Payload::from_static(b""),
            transaction: None,
            enqueued_at: 0,
            sequence,
            deadline_at: None,
        }
    }

    #[test]
    fn advertise_creates_instance_and_entries() {
        let mut registry = Registry::new();
        let added = registry.advertise(InstanceId(1), &names(&["echo", "billing"]));
        assert_eq!(added.len(), 2);
        assert!(registry.is_idle(InstanceId(1)));
        assert!(registry.service(&"echo".into()).is_some());
        assert!(registry.service(&"billing".into()).is_some());
    }

    #[test]
    fn advertise_is_idempotent_per_pair() {
        let mut registry = Registry::new();
        registry.advertise(InstanceId(1), &names(&["echo"]));
        let added = registry.advertise(InstanceId(1), &names(&["echo"]));
        assert!(added.is_empty());
        let entry = registry.service(&"echo".into()).expect("entry");
        assert_eq!(entry.instances().count(), 1);
    }

    #[test]
    fn unadvertise_last_service_removes_instance() {
        let mut registry = Registry::new();
        registry.advertise(InstanceId(1), &names(&["echo", "billing"]));

        registry.unadvertise(InstanceId(1), &names(&["echo"]));
        assert!(registry.instance(InstanceId(1)).is_some());

        registry.unadvertise(InstanceId(1), &names(&["billing"]));
        assert!(registry.instance(InstanceId(1)).is_none());
    }

    #[test]
    fn remove_instance_cascades_and_reports_affected() {
        let mut registry = Registry::new();
        registry.advertise(InstanceId(1), &names(&["echo", "billing"]));
        registry.advertise(InstanceId(2), &names(&["echo"]));

        let mut affected = registry.remove_instance(InstanceId(1));
        affected.sort();
        assert_eq!(affected, names(&["billing", "echo"]));

        let echo = registry.service(&"echo".into()).expect("entry");
        assert_eq!(echo.instances().collect::<Vec<_>>(), vec![InstanceId(2)]);
        assert!(!registry
            .service(&"billing".into())
            .expect("entry")
            .has_instances());
    }

    #[test]
    fn select_idle_skips_busy_instances() {
        let mut registry = Registry::new();
        registry.advertise(InstanceId(1), &names(&["echo"]));
        registry.advertise(InstanceId(2), &names(&["echo"]));

        registry.mark_busy(InstanceId(2));
        assert_eq!(registry.select_idle(&"echo".into()), Some(InstanceId(1)));
        registry.mark_busy(InstanceId(1));
        assert_eq!(registry.select_idle(&"echo".into()), None);
    }

    #[test]
    fn mark_busy_counts_invocations() {
        let mut registry = Registry::new();
        registry.advertise(InstanceId(1), &names(&["echo"]));
        registry.mark_busy(InstanceId(1));
        registry.mark_idle(InstanceId(1));
        registry.mark_busy(InstanceId(1));
        assert_eq!(registry.instance(InstanceId(1)).expect("instance").invoked, 2);
    }

    #[test]
    fn pending_queue_is_fifo_and_searchable() {
        let mut registry = Registry::new();
        registry.advertise(InstanceId(1), &names(&["echo"]));

        let first = pending("echo", 10, 0);
        let second = pending("echo", 11, 1);
        let second_correlation = second.correlation;
        registry.enqueue_pending(first);
        registry.enqueue_pending(second);

        assert_eq!(registry.front_pending_seq(&"echo".into()), Some(0));
        assert!(registry.has_pending_correlation(second_correlation));

        let removed = registry.remove_pending(second_correlation).expect("removed");
        assert_eq!(removed.sequence, 1);
        assert_eq!(registry.pop_pending(&"echo".into()).expect("head").sequence, 0);
        assert!(registry.pop_pending(&"echo".into()).is_none());
    }

    #[test]
    fn purge_caller_drops_only_that_callers_entries() {
        let mut registry = Registry::new();
        registry.advertise(InstanceId(1), &names(&["echo"]));
        registry.enqueue_pending(pending("echo", 10, 0));
        registry.enqueue_pending(pending("echo", 11, 1));
        registry.enqueue_pending(pending("echo", 10, 2));

        let touched = registry.purge_caller(CallerId(10));
        assert_eq!(touched, names(&["echo"]));
        let entry = registry.service(&"echo".into()).expect("entry");
        assert_eq!(entry.pending.len(), 1);
        assert_eq!(entry.pending.front().expect("head").caller, CallerId(11));
    }

    #[test]
    fn sweep_collects_expired_calls_in_place() {
        let mut registry = Registry::new();
        registry.advertise(InstanceId(1), &names(&["echo"]));

        let mut expiring = pending("echo", 10, 0);
        expiring.deadline_at = Some(100);
        let lasting = pending("echo", 11, 1);
        registry.enqueue_pending(expiring);
        registry.enqueue_pending(lasting);

        let expired = registry.sweep_expired(100);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].sequence, 0);
        assert_eq!(
            registry.service(&"echo".into()).expect("entry").pending.len(),
            1
        );
    }

    #[test]
    fn empty_entries_are_removed_only_when_fully_drained() {
        let mut registry = Registry::new();
        registry.advertise(InstanceId(1), &names(&["echo"]));
        registry.enqueue_pending(pending("echo", 10, 0));
        registry.remove_instance(InstanceId(1));

        // Pending work keeps the entry alive.
        assert!(!registry.remove_service_if_empty(&"echo".into()));
        registry.take_pending(&"echo".into());
        assert!(registry.remove_service_if_empty(&"echo".into()));
        assert!(registry.service(&"echo".into()).is_none());
    }

    #[test]
    fn snapshot_reports_state_depth_and_counters() {
        let mut registry = Registry::new();
        registry.advertise(InstanceId(1), &names(&["echo"]));
        registry.advertise(InstanceId(2), &names(&["echo"]));
        registry.mark_busy(InstanceId(1));
        registry.record_dispatch(&"echo".into());
        registry.enqueue_pending(pending("echo", 10, 0));

        let services = registry.snapshot();
        assert_eq!(services.len(), 1);
        let echo = &services[0];
        assert_eq!(echo.pending_depth, 1);
        assert_eq!(echo.lookups, 1);
        assert_eq!(echo.instances.len(), 2);
        assert_eq!(echo.instances[0].state, InstanceState::Busy);
        assert_eq!(echo.instances[1].state, InstanceState::Idle);
    }
}
