//! Hedges on-chain exposure on the secondary venue.

use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::error::MakerError;
use super::market::MarketState;
use crate::exchange::{HedgeOrder, HedgeOrderSide, HedgeVenue, Ledger};
use crate::risk::RiskState;
use crate::utils::round_down_to_lot;

/// What the hedge routine should do for a market.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HedgeAction {
    None,
    /// Offset a signed net exposure in base units
    Hedge { gap: Decimal },
}

/// Decide whether the net exposure `onchain + venue` needs hedging.
///
/// The gap is compared to the on-chain position; a gap with no on-chain
/// position always triggers.
pub fn analyze_gap(onchain: Decimal, venue: Decimal, trigger_ratio: Decimal, force: bool) -> HedgeAction {
    let gap = onchain + venue;
    if gap == Decimal::ZERO {
        return HedgeAction::None;
    }
    if force {
        return HedgeAction::Hedge { gap };
    }
    if onchain == Decimal::ZERO || gap.abs() / onchain.abs() > trigger_ratio {
        HedgeAction::Hedge { gap }
    } else {
        HedgeAction::None
    }
}

/// Places venue orders until a market's net exposure is flat.
pub struct Hedger {
    ledger: Arc<dyn Ledger>,
    venue: Arc<dyn HedgeVenue>,
    risk: Arc<RiskState>,
    trader: String,
    order_delay: Duration,
}

impl Hedger {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        venue: Arc<dyn HedgeVenue>,
        risk: Arc<RiskState>,
        trader: impl Into<String>,
        order_delay: Duration,
    ) -> Self {
        Self {
            ledger,
            venue,
            risk,
            trader: trader.into(),
            order_delay,
        }
    }

    /// Hedge one market. Returns the remaining gap, or `None` when skipped.
    pub async fn hedge(&self, state: &MarketState, force: bool) -> Result<Option<Decimal>, MakerError> {
        let market = &state.market;
        if !market.params.hedge_enabled {
            return Ok(None);
        }
        if self.risk.is_emergency() {
            debug!(market = %market.name, "Emergency mode, skipping hedge");
            return Ok(None);
        }
        let Some(_hedging) = state.try_begin_hedging() else {
            debug!(market = %market.name, "Hedge already in progress");
            return Ok(None);
        };

        let onchain = self.ledger.position_size(&self.trader, &market.base_token).await?;
        let venue = self.venue.position_size(&market.hedge_market).await?;
        let mut gap = match analyze_gap(onchain, venue, market.params.hedge_trigger_ratio, force) {
            HedgeAction::None => {
                debug!(market = %market.name, %onchain, %venue, "Exposure within hedge tolerance");
                return Ok(Some(onchain + venue));
            }
            HedgeAction::Hedge { gap } => gap,
        };

        let venue_market = self.venue.get_market(&market.hedge_market).await?;
        info!(
            market = %market.name,
            %onchain,
            %venue,
            %gap,
            forced = force,
            "Hedging exposure"
        );

        while gap.abs() >= venue_market.min_order_size {
            if self.risk.is_emergency() {
                warn!(market = %market.name, remaining = %gap, "Emergency mode entered, aborting hedge");
                return Ok(Some(gap));
            }

            let size = round_down_to_lot(
                gap.abs().min(market.params.max_hedge_order_size),
                venue_market.size_increment,
            );
            if size < venue_market.min_order_size || size <= Decimal::ZERO {
                warn!(market = %market.name, %size, min_size = %venue_market.min_order_size, "Hedge order too small");
                return Err(MakerError::BelowMinOrderSize {
                    market: market.name.clone(),
                    size,
                    min_size: venue_market.min_order_size,
                });
            }

            let side = HedgeOrderSide::closing(gap);
            let response = self
                .venue
                .place_market_order(&HedgeOrder {
                    market: market.hedge_market.clone(),
                    side,
                    size,
                    reduce_only: false,
                })
                .await?;

            let filled = if response.filled_size > Decimal::ZERO {
                response.filled_size
            } else {
                size
            };
            gap += match side {
                HedgeOrderSide::Buy => filled,
                HedgeOrderSide::Sell => -filled,
            };
            debug!(market = %market.name, ?side, %filled, remaining = %gap, "Hedge order filled");

            if gap.abs() >= venue_market.min_order_size && !self.order_delay.is_zero() {
                tokio::time::sleep(self.order_delay).await;
            }
        }

        info!(market = %market.name, remaining = %gap, "Hedge complete");
        Ok(Some(gap))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{MockHedgeVenue, MockLedger};
    use crate::strategy::market::tests::market;
    use rust_decimal_macros::dec;

    const TRADER: &str = "0xmaker";

    fn setup() -> (Arc<MockLedger>, Arc<MockHedgeVenue>, Arc<RiskState>, Hedger, MarketState) {
        let ledger = Arc::new(MockLedger::new(TRADER, dec!(0), dec!(1000000)));
        ledger.add_market("0xeth", "0xpool", dec!(2000), 60);
        let venue = Arc::new(MockHedgeVenue::new());
        venue.add_market("ETH-PERP", dec!(2000), dec!(0.01), dec!(0.01));
        let risk = Arc::new(RiskState::new());
        let hedger = Hedger::new(ledger.clone(), venue.clone(), risk.clone(), TRADER, Duration::ZERO);

        let mut m = market(60);
        m.params.max_hedge_order_size = dec!(0.4);
        (ledger, venue, risk, hedger, MarketState::new(m))
    }

    #[test]
    fn test_analyze_gap() {
        let ratio = dec!(0.1);
        assert_eq!(analyze_gap(dec!(1), dec!(-1), ratio, true), HedgeAction::None);
        assert_eq!(analyze_gap(dec!(1), dec!(-0.95), ratio, false), HedgeAction::None);
        assert_eq!(
            analyze_gap(dec!(1), dec!(-0.95), ratio, true),
            HedgeAction::Hedge { gap: dec!(0.05) }
        );
        assert_eq!(
            analyze_gap(dec!(1), dec!(-0.5), ratio, false),
            HedgeAction::Hedge { gap: dec!(0.5) }
        );
        assert_eq!(
            analyze_gap(Decimal::ZERO, dec!(0.02), ratio, false),
            HedgeAction::Hedge { gap: dec!(0.02) }
        );
    }

    #[tokio::test]
    async fn test_hedges_in_capped_slices() {
        let (ledger, venue, _risk, hedger, state) = setup();
        ledger.set_position("0xeth", dec!(1));

        let remaining = hedger.hedge(&state, false).await.unwrap();

        assert_eq!(remaining, Some(Decimal::ZERO));
        let sizes: Vec<Decimal> = venue.orders().iter().map(|o| o.size).collect();
        assert_eq!(sizes, vec![dec!(0.4), dec!(0.4), dec!(0.2)]);
        assert!(venue.orders().iter().all(|o| o.side == HedgeOrderSide::Sell));
        assert_eq!(venue.position_size("ETH-PERP").await.unwrap(), dec!(-1));
        assert!(!state.is_hedging());
    }

    #[tokio::test]
    async fn test_small_gap_is_left_alone_unless_forced() {
        let (ledger, venue, _risk, hedger, state) = setup();
        ledger.set_position("0xeth", dec!(1));
        venue.set_position("ETH-PERP", dec!(-0.95));

        hedger.hedge(&state, false).await.unwrap();
        assert!(venue.orders().is_empty());

        hedger.hedge(&state, true).await.unwrap();
        assert_eq!(venue.orders().len(), 1);
        assert_eq!(venue.orders()[0].size, dec!(0.05));
    }

    #[tokio::test]
    async fn test_skipped_in_emergency_or_while_hedging() {
        let (ledger, venue, risk, hedger, state) = setup();
        ledger.set_position("0xeth", dec!(1));

        {
            let _emergency = risk.enter_emergency().unwrap();
            assert_eq!(hedger.hedge(&state, true).await.unwrap(), None);
        }
        {
            let _busy = state.try_begin_hedging().unwrap();
            assert_eq!(hedger.hedge(&state, true).await.unwrap(), None);
        }
        assert!(venue.orders().is_empty());
    }

    #[tokio::test]
    async fn test_cap_below_venue_minimum_is_an_error() {
        let (ledger, _venue, _risk, hedger, mut state) = setup();
        state.market.params.max_hedge_order_size = dec!(0.001);
        ledger.set_position("0xeth", dec!(1));

        let result = hedger.hedge(&state, false).await;

        assert!(matches!(result, Err(MakerError::BelowMinOrderSize { .. })));
        assert!(!state.is_hedging());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_placing_orders_once_emergency_starts() {
        let (ledger, venue, risk, _hedger, mut state) = setup();
        let hedger = Hedger::new(
            ledger.clone(),
            venue.clone(),
            risk.clone(),
            TRADER,
            Duration::from_millis(50),
        );
        state.market.params.max_hedge_order_size = dec!(0.1);
        ledger.set_position("0xeth", dec!(1));

        // Orders go out at 0ms and 50ms; emergency starts at 75ms
        let (remaining, _) = tokio::join!(hedger.hedge(&state, false), async {
            tokio::time::sleep(Duration::from_millis(75)).await;
            let _emergency = risk.enter_emergency().unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        assert_eq!(remaining.unwrap(), Some(dec!(0.8)));
        assert_eq!(venue.orders().len(), 2);
        assert_eq!(venue.position_size("ETH-PERP").await.unwrap(), dec!(-0.2));
        assert!(!state.is_hedging());
    }
}
