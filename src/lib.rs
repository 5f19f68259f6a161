//! # Perp Maker
//!
//! Range liquidity maker for a concentrated-liquidity perpetual DEX, with
//! nonce-safe transaction sequencing, RPC endpoint failover and hedging on a
//! secondary venue.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `exchange`: Ledger and hedge venue interfaces, REST client, simulators
//! - `rpc`: JSON-RPC providers and endpoint failover
//! - `tx`: Per-address nonce sequencing and contract call wrappers
//! - `strategy`: Range orders, slippage estimation, hedging, the engine
//! - `risk`: Risk mode, normal and emergency position reduction
//! - `utils`: Fixed-point and tick arithmetic

pub mod config;
pub mod exchange;
pub mod risk;
pub mod rpc;
pub mod strategy;
pub mod tx;
pub mod utils;

pub use config::Config;
