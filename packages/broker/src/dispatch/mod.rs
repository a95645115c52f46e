//! Dispatch engine module.
//!
//! Provides the service registry, correlation table, remote bridge adapter,
//! and the serialized event loop that matches calls to instances, queues
//! them when none are free, and routes every reply back to exactly one
//! waiting caller.

pub mod correlation;
pub mod engine;
pub mod event;
pub mod registry;
pub mod remote;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

// ---------------------------------------------------------------------------
// Re-exports — flat public API
// ---------------------------------------------------------------------------

// types
pub use types::{
    BrokerSnapshot, Instance, InstanceSnapshot, InstanceState, PendingCall, ServiceEntry,
    ServiceSnapshot,
};

// registry
pub use registry::Registry;

// correlation
pub use correlation::{CorrelationEntry, CorrelationTable};

// event
pub use event::DispatchEvent;

// engine
pub use engine::{DispatchEngine, EngineHandle, EngineHealth, EngineMailbox};

// remote
pub use remote::RemoteAdapter;

// ---------------------------------------------------------------------------
// Integration tests
// ---------------------------------------------------------------------------


// ---------------------------------------------------------------------------
// Property tests
// ---------------------------------------------------------------------------
