//! Rebalancing engine errors.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::tx::SequencerError;

#[derive(Debug, Error)]
pub enum MakerError {
    /// Neither configured liquidity nor buying power allows a new order.
    #[error("no buying power to create an order on {market}")]
    NoBuyingPower { market: String },

    #[error("order size {size} on {market} is below the venue minimum {min_size}")]
    BelowMinOrderSize {
        market: String,
        size: Decimal,
        min_size: Decimal,
    },

    #[error("slippage {ratio} on {market} exceeds max {max_ratio}")]
    SlippageExceeded {
        market: String,
        ratio: Decimal,
        max_ratio: Decimal,
    },

    #[error("invalid tick range [{lower_tick}, {upper_tick}] on {market}")]
    InvalidRange {
        market: String,
        lower_tick: i32,
        upper_tick: i32,
    },

    /// On-chain state the engine cannot safely act on.
    #[error("invariant violated on {market}: {reason}")]
    InvariantViolation { market: String, reason: String },

    #[error(transparent)]
    Sequencer(#[from] SequencerError),

    /// Ledger read or hedge venue failure.
    #[error(transparent)]
    Venue(#[from] anyhow::Error),
}

impl MakerError {
    /// Whether the engine must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, MakerError::InvariantViolation { .. })
    }
}
