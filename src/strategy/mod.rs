//! Range liquidity strategy.
//!
//! Contains the core logic for:
//! - Keeping one range order per market centred on the pool price
//! - Slippage estimation for taker orders
//! - Hedging on-chain exposure on the secondary venue
//! - The engine that drives every routine on its own interval

mod error;
mod hedger;
mod maker;
pub(crate) mod market;
mod slippage;

pub use error::MakerError;
pub use hedger::{analyze_gap, HedgeAction, Hedger};
pub use maker::{Maker, OrderCheck};
pub use market::{HedgingGuard, Market, MarketParams, MarketState};
pub use slippage::{select_sample, SlippageEstimator, SlippageSample};
