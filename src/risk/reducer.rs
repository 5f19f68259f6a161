//! Normal position reduction when the pool drifts from the index.

use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::mode::RiskState;
use crate::exchange::{AmountType, Ledger, Side};
use crate::strategy::{MakerError, MarketParams, MarketState, SlippageEstimator};
use crate::tx::TxOperations;
use crate::utils::decimal::random_around;
use crate::utils::safe_div;

/// What one reduce pass did for a market.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReduceOutcome {
    Skipped,
    Closed,
    /// Reduced by a quote amount
    Reduced { amount: Decimal },
}

/// Relative premium of the pool price over the index price.
pub fn spread(market_price: Decimal, index_price: Decimal) -> Decimal {
    safe_div(market_price - index_price, index_price)
}

/// Whether `|spread|` lies in the configured trigger band, inclusive.
pub fn in_trigger_band(spread: Decimal, params: &MarketParams) -> bool {
    let spread = spread.abs();
    spread >= params.reduce_trigger_spread_min && spread <= params.reduce_trigger_spread_max
}

/// Trims taker exposure in small randomized slices.
pub struct Reducer {
    ledger: Arc<dyn Ledger>,
    ops: Arc<TxOperations>,
    estimator: Arc<SlippageEstimator>,
    risk: Arc<RiskState>,
}

impl Reducer {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        ops: Arc<TxOperations>,
        estimator: Arc<SlippageEstimator>,
        risk: Arc<RiskState>,
    ) -> Self {
        Self {
            ledger,
            ops,
            estimator,
            risk,
        }
    }

    pub async fn reduce_once(&self, state: &MarketState) -> Result<ReduceOutcome, MakerError> {
        let market = &state.market;
        let params = &market.params;
        if !params.normal_reduce_enabled {
            return Ok(ReduceOutcome::Skipped);
        }
        if self.risk.is_emergency() {
            debug!(market = %market.name, "Emergency mode, skipping normal reduce");
            return Ok(ReduceOutcome::Skipped);
        }

        let _slot = state.slot.lock().await;
        let trader = self.ops.trader();

        let size = self.ledger.position_size(trader, &market.base_token).await?;
        if size == Decimal::ZERO {
            return Ok(ReduceOutcome::Skipped);
        }

        let market_price = self.ledger.market_price(&market.pool).await?;
        let index_price = self.ledger.index_price(&market.base_token).await?;
        let spread = spread(market_price, index_price);
        if !in_trigger_band(spread, params) {
            debug!(market = %market.name, %spread, "Spread outside reduce band");
            return Ok(ReduceOutcome::Skipped);
        }

        let amount = random_around(params.reduce_amount, params.reduce_amount_offset);
        let value = self.ledger.position_value(trader, &market.base_token).await?;
        info!(
            market = %market.name,
            %spread,
            position_size = %size,
            position_value = %value,
            %amount,
            "Reducing position"
        );

        if value.abs() <= amount {
            self.ops.close_position(&market.base_token).await?;
            info!(market = %market.name, "Position closed");
            return Ok(ReduceOutcome::Closed);
        }

        let side = Side::reducing(size);
        let sample = self
            .estimator
            .estimate(market, market_price, params.target_slippage_ratio, side)
            .await?;
        if sample.ratio > params.max_slippage_ratio {
            warn!(
                market = %market.name,
                ratio = %sample.ratio,
                max_ratio = %params.max_slippage_ratio,
                "Slippage too high, not reducing"
            );
            return Err(MakerError::SlippageExceeded {
                market: market.name.clone(),
                ratio: sample.ratio,
                max_ratio: params.max_slippage_ratio,
            });
        }

        let amount = amount.min(sample.amount);
        self.ops
            .open_position(&market.base_token, side, AmountType::Quote, amount)
            .await?;
        info!(market = %market.name, %side, %amount, "Position reduced");
        Ok(ReduceOutcome::Reduced { amount })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{ContractCall, MockLedger, TxOverrides};
    use crate::strategy::market::tests::market;
    use crate::tx::{RetryPolicy, TxSequencer};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    const TRADER: &str = "0xmaker";

    fn setup(pool_depth: Decimal) -> (Arc<MockLedger>, Arc<RiskState>, Reducer, MarketState) {
        let ledger = Arc::new(MockLedger::new(TRADER, dec!(0), pool_depth));
        ledger.add_market("0xeth", "0xpool", dec!(2000), 60);
        ledger.set_index_price("0xeth", dec!(1960));
        let sequencer = Arc::new(TxSequencer::new(ledger.clone(), RetryPolicy::default()));
        let ops = Arc::new(TxOperations::new(
            ledger.clone(),
            sequencer,
            TRADER,
            TxOverrides::default(),
            Duration::from_secs(5),
        ));
        let estimator = Arc::new(SlippageEstimator::new(ledger.clone(), 10));
        let risk = Arc::new(RiskState::new());
        let reducer = Reducer::new(ledger.clone(), ops, estimator, risk.clone());

        let mut m = market(60);
        m.params.normal_reduce_enabled = true;
        (ledger, risk, reducer, MarketState::new(m))
    }

    #[test]
    fn test_trigger_band_is_inclusive() {
        let params = market(60).params;
        assert!(in_trigger_band(dec!(0.005), &params));
        assert!(in_trigger_band(dec!(-0.05), &params));
        assert!(!in_trigger_band(dec!(0.004), &params));
        assert!(!in_trigger_band(dec!(0.051), &params));
        assert_eq!(spread(dec!(101), dec!(100)), dec!(0.01));
    }

    #[tokio::test]
    async fn test_reduces_within_random_band() {
        let (ledger, _risk, reducer, state) = setup(dec!(1000000));
        ledger.set_position("0xeth", dec!(1));

        let outcome = reducer.reduce_once(&state).await.unwrap();

        match outcome {
            ReduceOutcome::Reduced { amount } => {
                assert!(amount >= dec!(80) && amount <= dec!(120), "{}", amount);
            }
            other => panic!("expected a reduction, got {:?}", other),
        }
        let calls = ledger.sent_calls();
        assert!(matches!(
            calls.as_slice(),
            [ContractCall::OpenPosition { is_base_to_quote: true, is_exact_input: false, .. }]
        ));
        assert!(ledger.position_size(TRADER, "0xeth").await.unwrap() < dec!(1));
    }

    #[tokio::test]
    async fn test_small_position_is_closed() {
        let (ledger, _risk, reducer, state) = setup(dec!(1000000));
        ledger.set_position("0xeth", dec!(0.01));

        assert_eq!(reducer.reduce_once(&state).await.unwrap(), ReduceOutcome::Closed);
        assert_eq!(ledger.position_size(TRADER, "0xeth").await.unwrap(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_spread_outside_band_is_skipped() {
        let (ledger, _risk, reducer, state) = setup(dec!(1000000));
        ledger.set_position("0xeth", dec!(1));
        ledger.set_index_price("0xeth", dec!(1999));

        assert_eq!(reducer.reduce_once(&state).await.unwrap(), ReduceOutcome::Skipped);
        assert!(ledger.sent_calls().is_empty());
    }

    #[tokio::test]
    async fn test_excess_slippage_aborts() {
        let (ledger, _risk, reducer, state) = setup(dec!(1000));
        ledger.set_position("0xeth", dec!(-10));

        let result = reducer.reduce_once(&state).await;

        assert!(matches!(result, Err(MakerError::SlippageExceeded { .. })));
        assert!(ledger.sent_calls().is_empty());
    }

    #[tokio::test]
    async fn test_skipped_in_emergency() {
        let (ledger, risk, reducer, state) = setup(dec!(1000000));
        ledger.set_position("0xeth", dec!(1));
        let _emergency = risk.enter_emergency().unwrap();

        assert_eq!(reducer.reduce_once(&state).await.unwrap(), ReduceOutcome::Skipped);
        assert!(ledger.sent_calls().is_empty());
    }
}
