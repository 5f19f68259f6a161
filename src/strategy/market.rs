//! Market definitions and per-market runtime state.

use anyhow::Result;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

use super::error::MakerError;
use crate::config::MarketConfig;
use crate::exchange::OpenOrder;
use crate::utils::{price_to_tick, tick_to_price};

/// Strategy parameters for one market. Ratios are in (0, 1).
#[derive(Debug, Clone, PartialEq)]
pub struct MarketParams {
    /// Quote value to provide as range liquidity
    pub liquidity_amount: Decimal,
    /// Half-width of a new range relative to price
    pub range_offset: Decimal,
    /// Margin inside the range edges that still counts as valid
    pub adjust_threshold: Decimal,
    pub target_slippage_ratio: Decimal,
    pub max_slippage_ratio: Decimal,
    /// Largest single reduce order, in quote
    pub max_order_amount: Decimal,
    pub hedge_enabled: bool,
    pub hedge_trigger_ratio: Decimal,
    /// Largest single hedge order, in base
    pub max_hedge_order_size: Decimal,
    pub normal_reduce_enabled: bool,
    pub reduce_trigger_spread_min: Decimal,
    pub reduce_trigger_spread_max: Decimal,
    pub reduce_amount: Decimal,
    pub reduce_amount_offset: Decimal,
    pub emergency_reduce_enabled: bool,
    pub emergency_reduce_amount: Decimal,
}

impl From<&MarketConfig> for MarketParams {
    fn from(config: &MarketConfig) -> Self {
        Self {
            liquidity_amount: config.liquidity_amount,
            range_offset: config.range_offset,
            adjust_threshold: config.adjust_threshold,
            target_slippage_ratio: config.target_slippage_ratio,
            max_slippage_ratio: config.max_slippage_ratio,
            max_order_amount: config.max_order_amount,
            hedge_enabled: config.hedge_enabled,
            hedge_trigger_ratio: config.hedge_trigger_ratio,
            max_hedge_order_size: config.max_hedge_order_size,
            normal_reduce_enabled: config.normal_reduce_enabled,
            reduce_trigger_spread_min: config.reduce_trigger_spread_min,
            reduce_trigger_spread_max: config.reduce_trigger_spread_max,
            reduce_amount: config.reduce_amount,
            reduce_amount_offset: config.reduce_amount_offset,
            emergency_reduce_enabled: config.emergency_reduce_enabled,
            emergency_reduce_amount: config.emergency_reduce_amount,
        }
    }
}

/// A market the maker provides liquidity on.
#[derive(Debug, Clone, PartialEq)]
pub struct Market {
    pub name: String,
    pub base_token: String,
    pub pool: String,
    /// Market name on the hedge venue
    pub hedge_market: String,
    pub tick_spacing: i32,
    pub params: MarketParams,
}

impl Market {
    pub fn new(name: &str, config: &MarketConfig, tick_spacing: i32) -> Result<Self> {
        anyhow::ensure!(tick_spacing > 0, "tick spacing for {} must be positive", name);
        Ok(Self {
            name: name.to_string(),
            base_token: config.base_token.clone(),
            pool: config.pool.clone(),
            hedge_market: config.hedge_market.clone(),
            tick_spacing,
            params: MarketParams::from(config),
        })
    }

    /// Whether `price` sits inside the order's range, away from its edges.
    ///
    /// Both bounds are strict: `lower·(1+thr) < price < upper·(1−thr)`.
    pub fn is_order_valid(&self, order: &OpenOrder, price: Decimal) -> bool {
        let threshold = self.params.adjust_threshold;
        let upper = tick_to_price(order.upper_tick);
        let lower = tick_to_price(order.lower_tick);
        price < upper * (Decimal::ONE - threshold) && price > lower * (Decimal::ONE + threshold)
    }

    /// Tick range centred on `price` with the configured offset.
    pub fn order_range(&self, price: Decimal) -> Result<(i32, i32), MakerError> {
        let offset = self.params.range_offset;
        let upper = price_to_tick(price * (Decimal::ONE + offset), self.tick_spacing);
        let lower = price_to_tick(price * (Decimal::ONE - offset), self.tick_spacing);

        match (lower, upper) {
            (Some(lower), Some(upper)) if lower < upper => Ok((lower, upper)),
            (lower, upper) => Err(MakerError::InvalidRange {
                market: self.name.clone(),
                lower_tick: lower.unwrap_or_default(),
                upper_tick: upper.unwrap_or_default(),
            }),
        }
    }
}

/// Runtime state of one market.
///
/// `slot` holds the tracked range order; holding its lock serializes every
/// routine that mutates the market's on-chain position.
#[derive(Debug)]
pub struct MarketState {
    pub market: Market,
    pub slot: Mutex<Option<OpenOrder>>,
    hedging: AtomicBool,
}

impl MarketState {
    pub fn new(market: Market) -> Self {
        Self {
            market,
            slot: Mutex::new(None),
            hedging: AtomicBool::new(false),
        }
    }

    pub fn is_hedging(&self) -> bool {
        self.hedging.load(Ordering::SeqCst)
    }

    /// Mark the market as hedging; `None` if a hedge is already running.
    pub fn try_begin_hedging(&self) -> Option<HedgingGuard<'_>> {
        self.hedging
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| HedgingGuard { flag: &self.hedging })
    }
}

/// Clears the hedging flag on drop.
pub struct HedgingGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for HedgingGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}
