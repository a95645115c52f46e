//! Broker configuration types.
//!
//! Plain structs with documented defaults; reading these from files or flags
//! is the job of whatever embeds the broker.

use std::time::Duration;

/// Top-level broker configuration.
#[derive(Debug, Clone, Default)]
pub struct BrokerConfig {
    /// Dispatch engine settings.
    pub engine: EngineConfig,
    /// Outbound delivery settings.
    pub sink: SinkConfig,
    /// Whether an external discovery collaborator is attached. When `false`,
    /// lookups for unknown services are rejected synchronously.
    pub remote_bridge_enabled: bool,
}

/// Dispatch engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bounded capacity of the inbound event channel. Producers that outrun
    /// the loop are backpressured at submission.
    pub event_channel_capacity: usize,
    /// Interval between deadline sweeps over the pending queues.
    pub sweep_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_channel_capacity: 1024,
            sweep_interval: Duration::from_millis(100),
        }
    }
}

/// Outbound delivery settings.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// Bounded mpsc channel capacity for each registered address.
    pub outbound_channel_capacity: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            outbound_channel_capacity: 256,
        }
    }
}
