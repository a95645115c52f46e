//! Correlation table: in-flight call id → {caller, instance, service}.
//!
//! One entry exists per dispatched call, created at dispatch time and
//! destroyed when the single terminal outcome is delivered. Because an
//! instance multiplexes many sequential calls over its lifetime, reply
//! routing goes through this table rather than through the instance.

use std::collections::HashMap;

use switchboard_core::{CallerId, CorrelationId, InstanceId, ServiceName};

/// Routing record for one in-flight call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationEntry {
    /// Caller the terminal outcome belongs to.
    pub caller: CallerId,
    /// Instance (or remote pseudo-instance) executing the call.
    pub instance: InstanceId,
    /// Service the call was dispatched for.
    pub service: ServiceName,
    /// `true` when `instance` is a single-use remote pseudo-instance that
    /// never entered the registry.
    pub remote: bool,
    /// `true` once the caller abandoned or departed: the eventual reply
    /// still frees the instance but is not delivered.
    pub suppressed: bool,
}

/// Table of all in-flight calls.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    entries: HashMap<CorrelationId, CorrelationEntry>,
}

impl CorrelationTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the correlation id is live.
    #[must_use]
    pub fn contains(&self, id: CorrelationId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Inserts a new entry. Returns `false` (and leaves the table untouched)
    /// if the id is already live; correlation ids are unique and the caller
    /// must treat a duplicate as a malformed event.
    pub fn insert(&mut self, id: CorrelationId, entry: CorrelationEntry) -> bool {
        if self.entries.contains_key(&id) {
            return false;
        }
        self.entries.insert(id, entry);
        true
    }

    /// Removes and returns the entry for a terminal outcome.
    pub fn remove(&mut self, id: CorrelationId) -> Option<CorrelationEntry> {
        self.entries.remove(&id)
    }

    /// Mutable access, used to suppress delivery on cancellation.
    pub fn get_mut(&mut self, id: CorrelationId) -> Option<&mut CorrelationEntry> {
        self.entries.get_mut(&id)
    }

    /// Removes and returns every entry bound to an instance. At most one
    /// entry can reference a local instance at a time; the Vec shape keeps
    /// crash handling total even if that invariant is ever violated.
    pub fn take_by_instance(
        &mut self,
        instance: InstanceId,
    ) -> Vec<(CorrelationId, CorrelationEntry)> {
        let ids: Vec<CorrelationId> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.instance == instance)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|entry| (id, entry)))
            .collect()
    }

    /// Suppresses delivery for every entry owned by a departed caller.
    /// Returns the affected (id, instance, remote) triples so the engine can
    /// emit cancellation hints.
    pub fn suppress_for_caller(
        &mut self,
        caller: CallerId,
    ) -> Vec<(CorrelationId, InstanceId, bool)> {
        let mut affected = Vec::new();
        for (id, entry) in &mut self.entries {
            if entry.caller == caller && !entry.suppressed {
                entry.suppressed = true;
                affected.push((*id, entry.instance, entry.remote));
            }
        }
        affected
    }

    /// Number of live in-flight calls.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when no call is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of live entries referencing an instance. Exactly one while
    /// the instance is Busy, zero while Idle.
    #[must_use]
    pub fn references_to(&self, instance: InstanceId) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.instance == instance)
            .count()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
