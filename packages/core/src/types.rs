//! Domain identifiers and opaque value types shared by the broker and its
//! collaborators.
//!
//! Everything here is deliberately small: newtype wrappers that keep the
//! different id spaces (services, instances, callers, correlations) from
//! being mixed up at compile time, plus the opaque payload/transaction types
//! the broker forwards without interpreting.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Name of a callable service, the key of the broker's registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceName(pub String);

impl ServiceName {
    /// Returns the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ServiceName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for ServiceName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque identity of a server instance (process/connection handle).
///
/// Assigned by the transport layer when an instance connects; the broker
/// never interprets the value. Remote pseudo-instances minted by the engine
/// draw from the top of the id space and never collide with transport ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "instance-{}", self.0)
    }
}

/// Opaque address of a caller awaiting a terminal outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallerId(pub u64);

impl fmt::Display for CallerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "caller-{}", self.0)
    }
}

/// Globally unique token binding a call to its single terminal outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    /// Generates a fresh random correlation id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque call payload. The broker forwards these bytes untouched; encoding
/// and decoding belong to the transport collaborators.
pub type Payload = Bytes;

/// Opaque transaction tag attached to a call by the transaction coordinator.
///
/// Forwarded with the dispatch instruction, never interpreted by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionTag(pub Bytes);

/// Outcome classification carried on a service reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReplyStatus {
    /// The service executed and returned normally.
    Success,
    /// The service executed and reported an application-level failure.
    ApplicationError,
    /// The service runtime failed while executing the call.
    SystemError,
}
