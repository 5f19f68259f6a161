//! Emergency reduction on margin breach.
//!
//! When either the on-chain margin ratio or the hedge venue margin fraction
//! drops below its threshold, every emergency-enabled market is reduced on
//! both venues concurrently. Emergency mode holds for the cool-down and is
//! cleared afterwards regardless of how the reductions went.

use futures_util::future::join_all;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::mode::RiskState;
use crate::config::EmergencyConfig;
use crate::exchange::{AmountType, HedgeOrder, HedgeOrderSide, HedgeVenue, Ledger, Side};
use crate::strategy::{MakerError, MarketState};
use crate::tx::TxOperations;
use crate::utils::round_down_to_lot;

/// Margin thresholds and cool-down.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmergencySettings {
    pub margin_ratio_threshold: Decimal,
    pub hedge_margin_ratio_threshold: Decimal,
    pub cooldown: Duration,
}

impl EmergencySettings {
    pub fn from_config(config: &EmergencyConfig) -> Self {
        Self {
            margin_ratio_threshold: config.margin_ratio_threshold,
            hedge_margin_ratio_threshold: config.hedge_margin_ratio_threshold,
            cooldown: Duration::from_secs(config.cooldown_secs),
        }
    }
}

pub struct EmergencyReducer {
    ledger: Arc<dyn Ledger>,
    venue: Arc<dyn HedgeVenue>,
    ops: Arc<TxOperations>,
    risk: Arc<RiskState>,
    settings: EmergencySettings,
}

impl EmergencyReducer {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        venue: Arc<dyn HedgeVenue>,
        ops: Arc<TxOperations>,
        risk: Arc<RiskState>,
        settings: EmergencySettings,
    ) -> Self {
        Self {
            ledger,
            venue,
            ops,
            risk,
            settings,
        }
    }

    /// Check margins and reduce if breached. Returns whether a reduction ran.
    pub async fn check_once(&self, markets: &[Arc<MarketState>]) -> Result<bool, MakerError> {
        // A failed read gives no signal for that venue only.
        let (margin_ratio, margin_fraction) = tokio::join!(
            self.ledger.margin_ratio(self.ops.trader()),
            self.venue.margin_fraction()
        );
        let margin_ratio = margin_ratio.unwrap_or_else(|e| {
            warn!(error = %e, "Failed to read on-chain margin ratio");
            None
        });
        let margin_fraction = margin_fraction.unwrap_or_else(|e| {
            warn!(error = %e, "Failed to read venue margin fraction");
            None
        });

        let onchain_breach = margin_ratio.is_some_and(|r| r < self.settings.margin_ratio_threshold);
        let venue_breach =
            margin_fraction.is_some_and(|f| f < self.settings.hedge_margin_ratio_threshold);
        if !onchain_breach && !venue_breach {
            debug!(?margin_ratio, ?margin_fraction, "Margins healthy");
            return Ok(false);
        }

        let Some(_emergency) = self.risk.enter_emergency() else {
            debug!("Emergency reduction already running");
            return Ok(false);
        };
        warn!(
            ?margin_ratio,
            ?margin_fraction,
            threshold = %self.settings.margin_ratio_threshold,
            hedge_threshold = %self.settings.hedge_margin_ratio_threshold,
            "Margin breached, reducing positions"
        );

        let targets: Vec<&Arc<MarketState>> = markets
            .iter()
            .filter(|s| s.market.params.emergency_reduce_enabled)
            .collect();
        let results = join_all(targets.iter().map(|state| self.reduce_market(state))).await;
        for (state, result) in targets.iter().zip(results) {
            if let Err(e) = result {
                error!(market = %state.market.name, error = %e, "Emergency reduce failed");
            }
        }

        if !self.settings.cooldown.is_zero() {
            info!(cooldown_secs = self.settings.cooldown.as_secs(), "Emergency cool-down");
            tokio::time::sleep(self.settings.cooldown).await;
        }
        Ok(true)
    }

    /// Reduce both sides of one market. A venue failure is logged and does
    /// not mask the on-chain result.
    async fn reduce_market(&self, state: &MarketState) -> Result<(), MakerError> {
        let _slot = state.slot.lock().await;
        let (onchain, venue) = tokio::join!(self.reduce_onchain(state), self.reduce_venue(state));
        if let Err(e) = venue {
            error!(market = %state.market.name, error = %e, "Emergency venue reduce failed");
        }
        onchain
    }

    async fn reduce_onchain(&self, state: &MarketState) -> Result<(), MakerError> {
        let market = &state.market;
        let trader = self.ops.trader();
        let size = self.ledger.position_size(trader, &market.base_token).await?;
        if size == Decimal::ZERO {
            return Ok(());
        }

        let amount = market.params.emergency_reduce_amount;
        let value = self.ledger.position_value(trader, &market.base_token).await?;
        if value.abs() <= amount {
            self.ops.close_position(&market.base_token).await?;
            info!(market = %market.name, "Emergency close on-chain");
        } else {
            let side = Side::reducing(size);
            self.ops
                .open_position(&market.base_token, side, AmountType::Quote, amount)
                .await?;
            info!(market = %market.name, %side, %amount, "Emergency reduce on-chain");
        }
        Ok(())
    }

    async fn reduce_venue(&self, state: &MarketState) -> Result<(), MakerError> {
        let market = &state.market;
        let position = self.venue.position_size(&market.hedge_market).await?;
        if position == Decimal::ZERO {
            return Ok(());
        }

        let venue_market = self.venue.get_market(&market.hedge_market).await?;
        let target = market.params.emergency_reduce_amount / venue_market.price;
        let size = if position.abs() <= target {
            position.abs()
        } else {
            round_down_to_lot(target, venue_market.size_increment)
        };
        if size < venue_market.min_order_size {
            return Err(MakerError::BelowMinOrderSize {
                market: market.name.clone(),
                size,
                min_size: venue_market.min_order_size,
            });
        }

        let side = HedgeOrderSide::closing(position);
        self.venue
            .place_market_order(&HedgeOrder {
                market: market.hedge_market.clone(),
                side,
                size,
                reduce_only: true,
            })
            .await?;
        info!(market = %market.name, ?side, %size, "Emergency reduce on venue");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MarketConfig;
    use crate::exchange::{
        ContractCall, HedgeMarket, HedgeOrderResponse, MockHedgeVenue, MockLedger, TxOverrides,
    };
    use crate::strategy::Market;
    use crate::tx::{RetryPolicy, TxSequencer};
    use rust_decimal_macros::dec;

    const TRADER: &str = "0xmaker";

    struct Fixture {
        ledger: Arc<MockLedger>,
        venue: Arc<MockHedgeVenue>,
        risk: Arc<RiskState>,
        reducer: EmergencyReducer,
        markets: Vec<Arc<MarketState>>,
    }

    fn fixture(cooldown: Duration) -> Fixture {
        let ledger = Arc::new(MockLedger::new(TRADER, dec!(0), dec!(1000000)));
        let venue = Arc::new(MockHedgeVenue::new());
        let mut markets = Vec::new();
        for (name, base, pool, price) in [
            ("ETH", "0xeth", "0xpool-eth", dec!(2000)),
            ("BTC", "0xbtc", "0xpool-btc", dec!(50000)),
        ] {
            ledger.add_market(base, pool, price, 60);
            let hedge_market = format!("{}-PERP", name);
            venue.add_market(&hedge_market, price, dec!(0.0001), dec!(0.0001));
            let config = MarketConfig::new(base, pool, &hedge_market, dec!(1000));
            markets.push(Arc::new(MarketState::new(Market::new(name, &config, 60).unwrap())));
        }

        let risk = Arc::new(RiskState::new());
        let reducer = EmergencyReducer::new(
            ledger.clone(),
            venue.clone(),
            operations(&ledger),
            risk.clone(),
            settings(cooldown),
        );

        Fixture {
            ledger,
            venue,
            risk,
            reducer,
            markets,
        }
    }

    fn operations(ledger: &Arc<MockLedger>) -> Arc<TxOperations> {
        let sequencer = Arc::new(TxSequencer::new(ledger.clone(), RetryPolicy::default()));
        Arc::new(TxOperations::new(
            ledger.clone(),
            sequencer,
            TRADER,
            TxOverrides::default(),
            Duration::from_secs(5),
        ))
    }

    fn settings(cooldown: Duration) -> EmergencySettings {
        EmergencySettings {
            margin_ratio_threshold: dec!(0.05),
            hedge_margin_ratio_threshold: dec!(0.05),
            cooldown,
        }
    }

    /// Hedge venue whose API is unreachable.
    struct UnreachableVenue;

    #[async_trait::async_trait]
    impl HedgeVenue for UnreachableVenue {
        async fn get_market(&self, _market: &str) -> anyhow::Result<HedgeMarket> {
            anyhow::bail!("connection refused")
        }

        async fn position_size(&self, _market: &str) -> anyhow::Result<Decimal> {
            anyhow::bail!("connection refused")
        }

        async fn margin_fraction(&self) -> anyhow::Result<Option<Decimal>> {
            anyhow::bail!("connection refused")
        }

        async fn place_market_order(&self, _order: &HedgeOrder) -> anyhow::Result<HedgeOrderResponse> {
            anyhow::bail!("connection refused")
        }
    }

    /// Long 1 ETH and 0.1 BTC on-chain, hedged short on the venue.
    fn open_positions(f: &Fixture, account_value: Decimal) {
        f.ledger.set_position("0xeth", dec!(1));
        f.ledger.set_position("0xbtc", dec!(0.1));
        f.ledger.set_account_value(account_value);
        f.venue.set_position("ETH-PERP", dec!(-1));
        f.venue.set_position("BTC-PERP", dec!(-0.1));
    }

    #[tokio::test]
    async fn test_healthy_margin_does_nothing() {
        let f = fixture(Duration::ZERO);
        open_positions(&f, dec!(5000));

        assert!(!f.reducer.check_once(&f.markets).await.unwrap());
        assert!(f.ledger.sent_calls().is_empty());
        assert!(f.venue.orders().is_empty());
    }

    #[tokio::test]
    async fn test_breach_reduces_every_enabled_market_on_both_venues() {
        let f = fixture(Duration::ZERO);
        // Exposure 2000 + 5000 = 7000; 280 / 7000 = 0.04
        open_positions(&f, dec!(280));

        assert!(f.reducer.check_once(&f.markets).await.unwrap());

        let reduced: Vec<&str> = f
            .ledger
            .sent_calls()
            .iter()
            .filter_map(|call| match call {
                ContractCall::OpenPosition { base_token, is_base_to_quote: true, .. } => Some(base_token.as_str()),
                _ => None,
            })
            .map(|token| if token == "0xeth" { "ETH" } else { "BTC" })
            .collect();
        assert_eq!(reduced.len(), 2);
        assert!(reduced.contains(&"ETH") && reduced.contains(&"BTC"));

        let orders = f.venue.orders();
        assert_eq!(orders.len(), 2);
        assert!(orders.iter().all(|o| o.reduce_only && o.side == HedgeOrderSide::Buy));
        assert_eq!(f.venue.position_size("ETH-PERP").await.unwrap(), dec!(-0.75));
        assert_eq!(f.venue.position_size("BTC-PERP").await.unwrap(), dec!(-0.09));
        assert!(!f.risk.is_emergency());
    }

    #[tokio::test]
    async fn test_venue_breach_alone_triggers() {
        let f = fixture(Duration::ZERO);
        open_positions(&f, dec!(5000));
        f.venue.set_margin_fraction(Some(dec!(0.02)));

        assert!(f.reducer.check_once(&f.markets).await.unwrap());
        assert_eq!(f.venue.orders().len(), 2);
    }

    #[tokio::test]
    async fn test_mode_clears_after_cooldown_even_when_reduction_fails() {
        let f = fixture(Duration::from_millis(50));
        open_positions(&f, dec!(280));
        f.ledger.fail_call("openPosition", 10);
        f.venue.fail_orders(10);

        let (result, during) = tokio::join!(f.reducer.check_once(&f.markets), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            f.risk.is_emergency()
        });

        assert!(result.unwrap());
        assert!(during);
        assert!(!f.risk.is_emergency());
        assert!(f.ledger.sent_calls().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_market_is_left_alone() {
        let mut f = fixture(Duration::ZERO);
        let mut btc = f.markets[1].market.clone();
        btc.params.emergency_reduce_enabled = false;
        f.markets[1] = Arc::new(MarketState::new(btc));
        open_positions(&f, dec!(280));

        f.reducer.check_once(&f.markets).await.unwrap();

        let orders = f.venue.orders();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].market, "ETH-PERP");
    }

    #[tokio::test]
    async fn test_onchain_breach_reduces_while_venue_is_down() {
        let f = fixture(Duration::ZERO);
        let reducer = EmergencyReducer::new(
            f.ledger.clone(),
            Arc::new(UnreachableVenue),
            operations(&f.ledger),
            f.risk.clone(),
            settings(Duration::ZERO),
        );
        // 80 / 2000 = 0.04
        f.ledger.set_position("0xeth", dec!(1));
        f.ledger.set_account_value(dec!(80));

        assert!(reducer.check_once(&f.markets).await.unwrap());

        let calls = f.ledger.sent_calls();
        assert_eq!(calls.len(), 1);
        assert!(matches!(
            &calls[0],
            ContractCall::OpenPosition { base_token, is_base_to_quote: true, .. } if base_token == "0xeth"
        ));
        assert!(f.ledger.position_size(TRADER, "0xeth").await.unwrap() < dec!(1));
        assert!(!f.risk.is_emergency());
    }
}
