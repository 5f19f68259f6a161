//! Maker engine.
//!
//! Keeps one range order per market centred on the pool price and drives
//! the hedge, reduce and emergency routines, each on its own interval.

use futures_util::future::join_all;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use super::error::MakerError;
use super::hedger::Hedger;
use super::market::{Market, MarketState};
use super::slippage::SlippageEstimator;
use crate::config::Config;
use crate::exchange::{gwei_to_wei, wei_to_gwei, HedgeVenue, Ledger, OpenOrder};
use crate::risk::{EmergencyReducer, EmergencySettings, ReduceOutcome, Reducer, RiskState};
use crate::tx::{TxOperations, DEFAULT_REFERRAL_CODE};

/// Result of one maintenance pass over a market.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OrderCheck {
    /// Gas above the adjustment cap; nothing was read or sent
    Skipped,
    Created(OpenOrder),
    Kept(OpenOrder),
    /// The old order drifted out of its band and was replaced
    Replaced(OpenOrder),
}

pub struct Maker {
    config: Arc<Config>,
    ledger: Arc<dyn Ledger>,
    ops: Arc<TxOperations>,
    markets: Vec<Arc<MarketState>>,
    risk: Arc<RiskState>,
    hedger: Hedger,
    reducer: Reducer,
    emergency: EmergencyReducer,
}

impl Maker {
    /// Build the engine for every enabled market, reading tick spacing from chain.
    pub async fn new(
        config: Arc<Config>,
        ledger: Arc<dyn Ledger>,
        venue: Arc<dyn HedgeVenue>,
        ops: Arc<TxOperations>,
    ) -> Result<Self, MakerError> {
        let mut markets = Vec::new();
        for (name, market_config) in config.enabled_markets() {
            let tick_spacing = ledger.tick_spacing(&market_config.pool).await?;
            let market = Market::new(name, market_config, tick_spacing)?;
            info!(
                market = %market.name,
                base_token = %market.base_token,
                hedge_market = %market.hedge_market,
                tick_spacing,
                "Market loaded"
            );
            markets.push(Arc::new(MarketState::new(market)));
        }

        let risk = Arc::new(RiskState::new());
        let hedger = Hedger::new(
            ledger.clone(),
            venue.clone(),
            risk.clone(),
            ops.trader(),
            Duration::from_millis(config.hedge.order_delay_ms),
        );
        let estimator = Arc::new(SlippageEstimator::new(ledger.clone(), config.maker.slippage_samples));
        let reducer = Reducer::new(ledger.clone(), ops.clone(), estimator, risk.clone());
        let emergency = EmergencyReducer::new(
            ledger.clone(),
            venue,
            ops.clone(),
            risk.clone(),
            EmergencySettings::from_config(&config.emergency),
        );

        Ok(Self {
            config,
            ledger,
            ops,
            markets,
            risk,
            hedger,
            reducer,
            emergency,
        })
    }

    pub fn markets(&self) -> &[Arc<MarketState>] {
        &self.markets
    }

    pub fn risk(&self) -> &Arc<RiskState> {
        &self.risk
    }

    /// Sync the trader's nonce and move any wallet collateral into the vault.
    #[instrument(skip(self))]
    pub async fn setup(&self) -> Result<(), MakerError> {
        let trader = self.ops.trader();
        let nonce = self.ops.sequencer().register(trader).await?;
        info!(trader, nonce, "Trader nonce registered");

        let referral_code = self.resolve_referral_code().await;
        info!(trader, %referral_code, "Referral code");
        self.ops.set_referral_code(referral_code);

        let balance = self.ledger.usdc_balance(trader).await?;
        if balance > Decimal::ZERO {
            let vault = &self.config.trader.vault;
            self.ops.approve(vault, balance).await?;
            self.ops.deposit(&self.config.trader.collateral_token, balance).await?;
            info!(amount = %balance, vault = %vault, "Collateral deposited");
        } else {
            debug!("No wallet collateral to deposit");
        }
        Ok(())
    }

    /// Configured code, else the one registered on-chain, else the default.
    async fn resolve_referral_code(&self) -> String {
        if let Some(code) = self.config.trader.referral_code.as_ref().filter(|c| !c.is_empty()) {
            return code.clone();
        }
        match self.ledger.referral_code(self.ops.trader()).await {
            Ok(Some(code)) if !code.is_empty() => code,
            Ok(_) => DEFAULT_REFERRAL_CODE.to_string(),
            Err(e) => {
                warn!(error = %e, "Failed to read referral code, using default");
                DEFAULT_REFERRAL_CODE.to_string()
            }
        }
    }

    /// Run every routine until a fatal error.
    pub async fn run(&self) -> Result<(), MakerError> {
        info!(
            markets = self.markets.len(),
            hedge = self.config.hedge.enabled,
            reduce = self.config.reduce.enabled,
            emergency = self.config.emergency.enabled,
            "Maker started"
        );

        tokio::try_join!(
            self.order_loop(),
            self.hedge_loop(),
            self.reduce_loop(),
            self.emergency_loop(),
        )?;
        Ok(())
    }

    async fn order_loop(&self) -> Result<(), MakerError> {
        let mut ticker = ticker(self.config.maker.order_check_interval());
        loop {
            ticker.tick().await;
            self.maintain_orders_once().await?;
        }
    }

    async fn hedge_loop(&self) -> Result<(), MakerError> {
        if !self.config.hedge.enabled {
            return Ok(());
        }
        let mut ticker = ticker(Duration::from_secs(self.config.hedge.check_interval_secs));
        loop {
            ticker.tick().await;
            self.hedge_once().await;
        }
    }

    async fn reduce_loop(&self) -> Result<(), MakerError> {
        if !self.config.reduce.enabled {
            return Ok(());
        }
        let mut ticker = ticker(Duration::from_secs(self.config.reduce.check_interval_secs));
        loop {
            ticker.tick().await;
            self.reduce_once().await;
        }
    }

    async fn emergency_loop(&self) -> Result<(), MakerError> {
        if !self.config.emergency.enabled {
            return Ok(());
        }
        let mut ticker = ticker(Duration::from_secs(self.config.emergency.check_interval_secs));
        loop {
            ticker.tick().await;
            self.emergency_once().await;
        }
    }

    /// One maintenance pass over every market.
    ///
    /// Per-market failures are logged; only a fatal error is returned.
    pub async fn maintain_orders_once(&self) -> Result<(), MakerError> {
        let results = join_all(self.markets.iter().map(|state| self.maintain_and_hedge(state))).await;

        let mut fatal = None;
        for (state, result) in self.markets.iter().zip(results) {
            match result {
                Ok(check) => debug!(market = %state.market.name, ?check, "Order check done"),
                Err(e) if e.is_fatal() => {
                    error!(market = %state.market.name, error = %e, "Fatal order state");
                    fatal.get_or_insert(e);
                }
                Err(e) => error!(market = %state.market.name, error = %e, "Order maintenance failed"),
            }
        }
        fatal.map_or(Ok(()), Err)
    }

    /// Maintain a market, then force a hedge once the slot is released if
    /// the order was replaced.
    async fn maintain_and_hedge(&self, state: &MarketState) -> Result<OrderCheck, MakerError> {
        let check = self.maintain_market(state).await?;
        if matches!(check, OrderCheck::Replaced(_)) && self.config.hedge.enabled {
            if let Err(e) = self.hedger.hedge(state, true).await {
                warn!(market = %state.market.name, error = %e, "Hedge after replacement failed");
            }
        }
        Ok(check)
    }

    async fn maintain_market(&self, state: &MarketState) -> Result<OrderCheck, MakerError> {
        let market = &state.market;
        let mut slot = state.slot.lock().await;

        let gas_price = self.ledger.gas_price().await?;
        let over_cap = gwei_to_wei(self.config.maker.adjust_max_gas_price_gwei)
            .is_some_and(|max| gas_price > max);
        if over_cap {
            warn!(
                market = %market.name,
                gas_price_gwei = %wei_to_gwei(gas_price),
                max_gwei = %self.config.maker.adjust_max_gas_price_gwei,
                "Gas price too high, skipping order adjustment"
            );
            return Ok(OrderCheck::Skipped);
        }

        let orders = self.ledger.open_orders(self.ops.trader(), &market.base_token).await?;
        let price = self.ledger.market_price(&market.pool).await?;

        let current = match orders.as_slice() {
            [] => None,
            [order] => Some(*order),
            [first, second] => Some(self.reconcile_duplicates(market, *first, *second, price).await?),
            _ => {
                return Err(MakerError::InvariantViolation {
                    market: market.name.clone(),
                    reason: format!("{} open orders on chain", orders.len()),
                })
            }
        };

        let check = match current {
            None => {
                *slot = None;
                let order = self.create_order(market).await?;
                *slot = Some(order);
                OrderCheck::Created(order)
            }
            Some(order) if market.is_order_valid(&order, price) => {
                *slot = Some(order);
                OrderCheck::Kept(order)
            }
            Some(order) => {
                info!(
                    market = %market.name,
                    %price,
                    lower_tick = order.lower_tick,
                    upper_tick = order.upper_tick,
                    "Order out of range, replacing"
                );
                self.remove_order(market, &order).await?;
                *slot = None;
                let order = self.create_order(market).await?;
                *slot = Some(order);
                OrderCheck::Replaced(order)
            }
        };
        Ok(check)
    }

    /// Keep the first valid order of a duplicate pair (else the first) and remove the other.
    async fn reconcile_duplicates(
        &self,
        market: &Market,
        first: OpenOrder,
        second: OpenOrder,
        price: Decimal,
    ) -> Result<OpenOrder, MakerError> {
        let (keep, extra) = if !market.is_order_valid(&first, price) && market.is_order_valid(&second, price) {
            (second, first)
        } else {
            (first, second)
        };
        warn!(
            market = %market.name,
            kept_lower = keep.lower_tick,
            kept_upper = keep.upper_tick,
            removed_lower = extra.lower_tick,
            removed_upper = extra.upper_tick,
            "Duplicate orders on chain, removing one"
        );
        self.remove_order(market, &extra).await?;
        Ok(keep)
    }

    /// Withdraw the order's liquidity and close the position it leaves behind.
    async fn remove_order(&self, market: &Market, order: &OpenOrder) -> Result<(), MakerError> {
        self.ops
            .remove_liquidity(&market.base_token, order.lower_tick, order.upper_tick, order.liquidity)
            .await?;
        self.ops.close_position(&market.base_token).await?;
        info!(
            market = %market.name,
            lower_tick = order.lower_tick,
            upper_tick = order.upper_tick,
            "Order removed"
        );
        Ok(())
    }

    /// Place a range order around the current price, half base and half quote.
    async fn create_order(&self, market: &Market) -> Result<OpenOrder, MakerError> {
        let trader = self.ops.trader();
        let price = self.ledger.market_price(&market.pool).await?;
        let buying_power = self.ledger.buying_power(trader, self.config.maker.leverage).await?;
        let amount = market.params.liquidity_amount.min(buying_power);
        if amount <= Decimal::ZERO {
            return Err(MakerError::NoBuyingPower {
                market: market.name.clone(),
            });
        }

        let (lower_tick, upper_tick) = market.order_range(price)?;
        let quote = amount / Decimal::TWO;
        let base = quote / price;
        self.ops
            .add_liquidity(&market.base_token, lower_tick, upper_tick, base, quote)
            .await?;

        let order = self
            .ledger
            .open_order(trader, &market.base_token, lower_tick, upper_tick)
            .await?;
        info!(
            market = %market.name,
            %price,
            %amount,
            lower_tick,
            upper_tick,
            liquidity = order.liquidity,
            "Order created"
        );
        Ok(order)
    }

    /// One hedge pass over every market.
    pub async fn hedge_once(&self) {
        let results = join_all(self.markets.iter().map(|state| self.hedger.hedge(state, false))).await;
        for (state, result) in self.markets.iter().zip(results) {
            if let Err(e) = result {
                error!(market = %state.market.name, error = %e, "Hedge failed");
            }
        }
    }

    /// One normal reduce pass over every market.
    pub async fn reduce_once(&self) {
        let results = join_all(self.markets.iter().map(|state| self.reducer.reduce_once(state))).await;
        for (state, result) in self.markets.iter().zip(results) {
            match result {
                Ok(ReduceOutcome::Skipped) => {}
                Ok(outcome) => debug!(market = %state.market.name, ?outcome, "Reduce done"),
                Err(e) => error!(market = %state.market.name, error = %e, "Reduce failed"),
            }
        }
    }

    /// One margin check.
    pub async fn emergency_once(&self) {
        if let Err(e) = self.emergency.check_once(&self.markets).await {
            error!(error = %e, "Emergency check failed");
        }
    }
}

fn ticker(period: Duration) -> Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}
