//! Shared utilities: decimal arithmetic and tick math.

pub mod decimal;
pub mod tick;

pub use decimal::{from_wei, round_down_to_lot, safe_div, to_wei, to_wei_unsigned};
pub use tick::{price_to_tick, tick_to_price};
