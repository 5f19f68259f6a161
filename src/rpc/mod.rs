//! Blockchain RPC connectivity.
//!
//! - `provider`: JSON-RPC providers (HTTP polling, WebSocket subscription)
//! - `failover`: endpoint health monitoring and round-robin rotation

pub mod failover;
pub mod provider;
pub mod types;

pub use failover::{BlockCallback, EndpointFailover, FailoverSettings};
pub use provider::{DefaultProviderFactory, HttpProvider, Provider, ProviderFactory, WsProvider};
pub use types::BlockEvent;
