//! `Switchboard` Broker — serialized dispatch engine, outbound delivery, and
//! the client-side call helper.
//!
//! The broker matches named service calls to advertised server instances,
//! queues calls when every instance is busy, recovers from instance crashes,
//! and guarantees exactly one terminal outcome per call.

pub mod client;
pub mod config;
pub mod dispatch;
pub mod outbound;

pub use client::{CallOptions, Caller, PendingReply};
pub use config::{BrokerConfig, EngineConfig, SinkConfig};
pub use dispatch::{
    BrokerSnapshot, DispatchEngine, DispatchEvent, EngineHandle, EngineHealth, EngineMailbox,
    InstanceSnapshot, InstanceState, ServiceSnapshot,
};
pub use outbound::{
    ChannelSink, Delivery, DispatchInstruction, InstanceMessage, OutboundSink,
};
