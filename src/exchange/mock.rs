//! Simulated ledger and hedge venue for paper trading and tests.

use super::traits::{HedgeVenue, Ledger};
use super::types::*;
use crate::config::Config;
use crate::tx::{NonceSource, TxError};
use crate::utils::{from_wei, to_wei};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

const PAPER_TICK_SPACING: i32 = 60;
const DEFAULT_GAS_PRICE: u128 = 1_000_000_000;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Price impact model shared by quotes and fills.
///
/// Impact grows linearly with notional over `depth`; fills execute at the
/// midpoint between the current and the post-trade price.
fn simulate_swap(
    price: Decimal,
    depth: Decimal,
    side: Side,
    amount_type: AmountType,
    amount: Decimal,
) -> Result<SwapQuote> {
    if price <= Decimal::ZERO || depth <= Decimal::ZERO {
        bail!("pool has no liquidity");
    }
    let notional = match amount_type {
        AmountType::Quote => amount,
        AmountType::Base => amount * price,
    };
    let impact = notional / depth;

    match side {
        Side::Long => {
            let avg_price = price * (Decimal::ONE + impact / dec!(2));
            Ok(SwapQuote {
                exchanged_position_size: notional / avg_price,
                exchanged_position_notional: -notional,
                after_price: price * (Decimal::ONE + impact),
            })
        }
        Side::Short => {
            if impact >= Decimal::ONE {
                bail!("swap of {} exceeds pool depth", notional);
            }
            let avg_price = price * (Decimal::ONE - impact / dec!(2));
            Ok(SwapQuote {
                exchanged_position_size: -(notional / avg_price),
                exchanged_position_notional: notional,
                after_price: price * (Decimal::ONE - impact),
            })
        }
    }
}

#[derive(Debug, Clone)]
struct SimMarket {
    pool: String,
    price: Decimal,
    index_price: Decimal,
    tick_spacing: i32,
}

#[derive(Debug, Default)]
struct LedgerState {
    /// Wallet collateral in fixed point
    wallet_usdc: i128,
    /// Vault collateral in fixed point
    collateral: i128,
    free_collateral_override: Option<Decimal>,
    account_value_override: Option<Decimal>,
    /// Keyed by base token
    markets: HashMap<String, SimMarket>,
    /// Signed sizes in fixed point, keyed by base token
    positions: HashMap<String, i128>,
    orders: HashMap<String, Vec<OpenOrder>>,
    nonces: HashMap<String, u64>,
    gas_price: u128,
    receipts: HashMap<String, TxReceipt>,
    sent: Vec<ContractCall>,
    block_number: u64,
    send_failures: VecDeque<TxError>,
    call_failures: HashMap<&'static str, u32>,
    revert_next: bool,
    referral_code: Option<String>,
}

impl LedgerState {
    fn market(&self, base_token: &str) -> Result<&SimMarket> {
        self.markets
            .get(base_token)
            .ok_or_else(|| anyhow!("unknown base token {}", base_token))
    }

    fn market_by_pool(&self, pool: &str) -> Result<&SimMarket> {
        self.markets
            .values()
            .find(|m| m.pool == pool)
            .ok_or_else(|| anyhow!("unknown pool {}", pool))
    }

    fn position(&self, base_token: &str) -> Result<Decimal> {
        from_wei(self.positions.get(base_token).copied().unwrap_or(0))
    }

    fn position_value(&self, base_token: &str) -> Result<Decimal> {
        Ok(self.position(base_token)? * self.market(base_token)?.price)
    }
}

/// Simulated perpetual protocol ledger for a single trader.
///
/// Enforces sequential nonces per sender so nonce conflicts behave like a
/// real node, and supports failure injection for engine scenarios.
pub struct MockLedger {
    trader: String,
    pool_depth: Decimal,
    state: Mutex<LedgerState>,
    tx_counter: AtomicU64,
}

impl MockLedger {
    /// Create a ledger whose trader holds `initial_usdc` in the wallet.
    pub fn new(trader: &str, initial_usdc: Decimal, pool_depth: Decimal) -> Self {
        let state = LedgerState {
            wallet_usdc: to_wei(initial_usdc).unwrap_or(0),
            gas_price: DEFAULT_GAS_PRICE,
            ..Default::default()
        };

        Self {
            trader: trader.to_string(),
            pool_depth,
            state: Mutex::new(state),
            tx_counter: AtomicU64::new(1),
        }
    }

    /// Paper trading ledger seeded from the `paper` and `markets` sections.
    pub fn from_config(config: &Config) -> Self {
        let ledger = Self::new(
            &config.trader.address,
            config.paper.initial_usdc,
            config.paper.pool_depth,
        );
        for (name, market) in config.enabled_markets() {
            let price = config.paper.prices.get(name).copied().unwrap_or(Decimal::ONE);
            ledger.add_market(&market.base_token, &market.pool, price, PAPER_TICK_SPACING);
        }
        ledger
    }

    /// Register a market with identical pool and index prices.
    pub fn add_market(&self, base_token: &str, pool: &str, price: Decimal, tick_spacing: i32) {
        lock(&self.state).markets.insert(
            base_token.to_string(),
            SimMarket {
                pool: pool.to_string(),
                price,
                index_price: price,
                tick_spacing,
            },
        );
    }

    pub fn set_market_price(&self, base_token: &str, price: Decimal) {
        if let Some(market) = lock(&self.state).markets.get_mut(base_token) {
            market.price = price;
        }
    }

    pub fn set_index_price(&self, base_token: &str, price: Decimal) {
        if let Some(market) = lock(&self.state).markets.get_mut(base_token) {
            market.index_price = price;
        }
    }

    pub fn set_position(&self, base_token: &str, size: Decimal) {
        let size = to_wei(size).unwrap_or(0);
        lock(&self.state).positions.insert(base_token.to_string(), size);
    }

    pub fn set_free_collateral(&self, value: Decimal) {
        lock(&self.state).free_collateral_override = Some(value);
    }

    pub fn set_account_value(&self, value: Decimal) {
        lock(&self.state).account_value_override = Some(value);
    }

    pub fn set_gas_price(&self, wei: u128) {
        lock(&self.state).gas_price = wei;
    }

    /// Place an order directly, bypassing transactions.
    pub fn insert_order(&self, base_token: &str, order: OpenOrder) {
        lock(&self.state)
            .orders
            .entry(base_token.to_string())
            .or_default()
            .push(order);
    }

    pub fn orders(&self, base_token: &str) -> Vec<OpenOrder> {
        lock(&self.state)
            .orders
            .get(base_token)
            .cloned()
            .unwrap_or_default()
    }

    /// Every contract call accepted so far, in submission order.
    pub fn sent_calls(&self) -> Vec<ContractCall> {
        lock(&self.state).sent.clone()
    }

    /// Simulate transactions sent by another process.
    pub fn bump_nonce(&self, address: &str, count: u64) {
        *lock(&self.state).nonces.entry(address.to_string()).or_default() += count;
    }

    /// Return `error` from the next `send_transaction`.
    pub fn push_send_error(&self, error: TxError) {
        lock(&self.state).send_failures.push_back(error);
    }

    /// Reject the next `times` calls named `name`.
    pub fn fail_call(&self, name: &'static str, times: u32) {
        lock(&self.state).call_failures.insert(name, times);
    }

    /// Mine the next transaction with a failed status.
    pub fn revert_next(&self) {
        lock(&self.state).revert_next = true;
    }

    pub fn set_referral_code(&self, code: Option<&str>) {
        lock(&self.state).referral_code = code.map(str::to_string);
    }

    fn apply(&self, state: &mut LedgerState, call: &ContractCall) -> Result<()> {
        match call {
            ContractCall::Approve { .. }
            | ContractCall::CancelAllExcessOrders { .. }
            | ContractCall::Liquidate { .. } => {}
            ContractCall::Deposit { amount, .. } => {
                let amount = i128::try_from(*amount)?;
                if amount > state.wallet_usdc {
                    bail!("transfer amount exceeds balance");
                }
                state.wallet_usdc -= amount;
                state.collateral += amount;
            }
            ContractCall::AddLiquidity {
                base_token,
                lower_tick,
                upper_tick,
                base,
                quote,
            } => {
                state.market(base_token)?;
                if lower_tick >= upper_tick {
                    bail!("invalid tick range");
                }
                let order = OpenOrder {
                    lower_tick: *lower_tick,
                    upper_tick: *upper_tick,
                    liquidity: base.saturating_add(*quote),
                };
                state.orders.entry(base_token.clone()).or_default().push(order);
            }
            ContractCall::RemoveLiquidity {
                base_token,
                lower_tick,
                upper_tick,
                liquidity,
            } => {
                let orders = state.orders.entry(base_token.clone()).or_default();
                let idx = orders
                    .iter()
                    .position(|o| o.lower_tick == *lower_tick && o.upper_tick == *upper_tick)
                    .ok_or_else(|| anyhow!("order not found"))?;
                let remaining = orders[idx].liquidity.saturating_sub(*liquidity);
                if remaining == 0 {
                    orders.remove(idx);
                } else {
                    orders[idx].liquidity = remaining;
                }
            }
            ContractCall::OpenPosition {
                base_token,
                is_base_to_quote,
                is_exact_input,
                amount,
                ..
            } => {
                let side = if *is_base_to_quote { Side::Short } else { Side::Long };
                let amount_type = match (side, is_exact_input) {
                    (Side::Short, true) | (Side::Long, false) => AmountType::Base,
                    _ => AmountType::Quote,
                };
                let amount = from_wei(i128::try_from(*amount)?)?;
                let price = state.market(base_token)?.price;
                let fill = simulate_swap(price, self.pool_depth, side, amount_type, amount)?;
                let delta = to_wei(fill.exchanged_position_size)?;
                *state.positions.entry(base_token.clone()).or_default() += delta;
            }
            ContractCall::ClosePosition { base_token, .. } => {
                if state.position(base_token)? == Decimal::ZERO {
                    bail!("no position to close");
                }
                state.positions.insert(base_token.clone(), 0);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Ledger for MockLedger {
    async fn usdc_balance(&self, _trader: &str) -> Result<Decimal> {
        from_wei(lock(&self.state).wallet_usdc)
    }

    async fn tick_spacing(&self, pool: &str) -> Result<i32> {
        Ok(lock(&self.state).market_by_pool(pool)?.tick_spacing)
    }

    async fn market_price(&self, pool: &str) -> Result<Decimal> {
        Ok(lock(&self.state).market_by_pool(pool)?.price)
    }

    async fn index_price(&self, base_token: &str) -> Result<Decimal> {
        Ok(lock(&self.state).market(base_token)?.index_price)
    }

    async fn free_collateral(&self, _trader: &str) -> Result<Decimal> {
        let state = lock(&self.state);
        match state.free_collateral_override {
            Some(value) => Ok(value),
            None => from_wei(state.collateral),
        }
    }

    async fn account_value(&self, _trader: &str) -> Result<Decimal> {
        let state = lock(&self.state);
        match state.account_value_override {
            Some(value) => Ok(value),
            None => from_wei(state.collateral),
        }
    }

    async fn total_abs_position_value(&self, _trader: &str) -> Result<Decimal> {
        let state = lock(&self.state);
        let mut total = Decimal::ZERO;
        for base_token in state.positions.keys() {
            total += state.position_value(base_token)?.abs();
        }
        Ok(total)
    }

    async fn position_size(&self, _trader: &str, base_token: &str) -> Result<Decimal> {
        lock(&self.state).position(base_token)
    }

    async fn position_value(&self, _trader: &str, base_token: &str) -> Result<Decimal> {
        lock(&self.state).position_value(base_token)
    }

    async fn open_orders(&self, _trader: &str, base_token: &str) -> Result<Vec<OpenOrder>> {
        Ok(self.orders(base_token))
    }

    async fn open_order(
        &self,
        _trader: &str,
        base_token: &str,
        lower_tick: i32,
        upper_tick: i32,
    ) -> Result<OpenOrder> {
        let order = self
            .orders(base_token)
            .into_iter()
            .find(|o| o.lower_tick == lower_tick && o.upper_tick == upper_tick)
            .unwrap_or(OpenOrder {
                lower_tick,
                upper_tick,
                liquidity: 0,
            });
        Ok(order)
    }

    async fn quote(
        &self,
        base_token: &str,
        side: Side,
        amount_type: AmountType,
        amount: Decimal,
    ) -> Result<SwapQuote> {
        let price = lock(&self.state).market(base_token)?.price;
        simulate_swap(price, self.pool_depth, side, amount_type, amount)
    }

    async fn gas_price(&self) -> Result<u128> {
        Ok(lock(&self.state).gas_price)
    }

    async fn referral_code(&self, _trader: &str) -> Result<Option<String>> {
        Ok(lock(&self.state).referral_code.clone())
    }

    async fn send_transaction(
        &self,
        from: &str,
        call: &ContractCall,
        request: TxRequest,
    ) -> Result<PendingTx, TxError> {
        let mut state = lock(&self.state);

        if let Some(error) = state.send_failures.pop_front() {
            return Err(error);
        }
        if let Some(remaining) = state.call_failures.get_mut(call.name()) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TxError::classify(None, "execution reverted: simulated failure"));
            }
        }

        let expected = state.nonces.get(from).copied().unwrap_or(0);
        if request.nonce != expected {
            return Err(TxError::classify(
                None,
                &format!("invalid transaction nonce: got {}, expected {}", request.nonce, expected),
            ));
        }

        let success = !std::mem::take(&mut state.revert_next);
        if success {
            self.apply(&mut state, call)
                .map_err(|e| TxError::classify(None, &format!("execution reverted: {}", e)))?;
            state.sent.push(call.clone());
        }
        *state.nonces.entry(from.to_string()).or_default() += 1;

        let hash = format!("0x{:064x}", self.tx_counter.fetch_add(1, Ordering::SeqCst));
        state.block_number += 1;
        let receipt = TxReceipt {
            hash: hash.clone(),
            block_number: state.block_number,
            success,
            gas_used: request.overrides.gas_limit / 10,
        };
        state.receipts.insert(hash.clone(), receipt);

        debug!(call = call.name(), %hash, nonce = request.nonce, success, "Mock transaction executed");

        Ok(PendingTx {
            hash,
            from: from.to_string(),
            nonce: request.nonce,
            gas_limit: request.overrides.gas_limit,
            max_fee_per_gas: request.overrides.max_fee_per_gas,
            max_priority_fee_per_gas: request.overrides.max_priority_fee_per_gas,
        })
    }

    async fn wait_for_receipt(&self, tx: &PendingTx) -> Result<TxReceipt, TxError> {
        lock(&self.state)
            .receipts
            .get(&tx.hash)
            .cloned()
            .ok_or_else(|| TxError::Transport(anyhow!("unknown transaction {}", tx.hash)))
    }
}

#[async_trait]
impl NonceSource for MockLedger {
    async fn transaction_count(&self, address: &str) -> Result<u64> {
        Ok(lock(&self.state).nonces.get(address).copied().unwrap_or(0))
    }
}

impl std::fmt::Debug for MockLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockLedger").field("trader", &self.trader).finish()
    }
}

#[derive(Debug, Default)]
struct VenueState {
    markets: HashMap<String, HedgeMarket>,
    positions: HashMap<String, Decimal>,
    margin_fraction: Option<Decimal>,
    orders: Vec<HedgeOrder>,
    order_failures: u32,
}

/// Simulated secondary venue filling market orders immediately.
#[derive(Debug, Default)]
pub struct MockHedgeVenue {
    state: Mutex<VenueState>,
    order_id_counter: AtomicU64,
}

impl MockHedgeVenue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Paper venue with one market per enabled on-chain market.
    pub fn from_config(config: &Config) -> Self {
        let venue = Self::new();
        for (name, market) in config.enabled_markets() {
            let price = config.paper.prices.get(name).copied().unwrap_or(Decimal::ONE);
            venue.add_market(&market.hedge_market, price, dec!(0.001), dec!(0.001));
        }
        venue
    }

    pub fn add_market(&self, name: &str, price: Decimal, min_order_size: Decimal, size_increment: Decimal) {
        lock(&self.state).markets.insert(
            name.to_string(),
            HedgeMarket {
                name: name.to_string(),
                price,
                min_order_size,
                size_increment,
            },
        );
    }

    pub fn set_position(&self, market: &str, size: Decimal) {
        lock(&self.state).positions.insert(market.to_string(), size);
    }

    pub fn set_margin_fraction(&self, margin_fraction: Option<Decimal>) {
        lock(&self.state).margin_fraction = margin_fraction;
    }

    /// Reject the next `count` orders.
    pub fn fail_orders(&self, count: u32) {
        lock(&self.state).order_failures = count;
    }

    /// Orders filled so far.
    pub fn orders(&self) -> Vec<HedgeOrder> {
        lock(&self.state).orders.clone()
    }
}

#[async_trait]
impl HedgeVenue for MockHedgeVenue {
    async fn get_market(&self, market: &str) -> Result<HedgeMarket> {
        lock(&self.state)
            .markets
            .get(market)
            .cloned()
            .ok_or_else(|| anyhow!("unknown market {}", market))
    }

    async fn position_size(&self, market: &str) -> Result<Decimal> {
        Ok(lock(&self.state).positions.get(market).copied().unwrap_or_default())
    }

    async fn margin_fraction(&self) -> Result<Option<Decimal>> {
        Ok(lock(&self.state).margin_fraction)
    }

    async fn place_market_order(&self, order: &HedgeOrder) -> Result<HedgeOrderResponse> {
        let mut state = lock(&self.state);

        if state.order_failures > 0 {
            state.order_failures -= 1;
            bail!("simulated order rejection");
        }

        let market = state
            .markets
            .get(&order.market)
            .cloned()
            .ok_or_else(|| anyhow!("unknown market {}", order.market))?;
        if order.size < market.min_order_size {
            bail!("size {} below minimum {}", order.size, market.min_order_size);
        }

        let current = state.positions.get(&order.market).copied().unwrap_or_default();
        let signed = match order.side {
            HedgeOrderSide::Buy => order.size,
            HedgeOrderSide::Sell => -order.size,
        };
        let filled = if order.reduce_only {
            if current == Decimal::ZERO || current.is_sign_positive() == signed.is_sign_positive() {
                bail!("reduce-only order would increase position");
            }
            order.size.min(current.abs())
        } else {
            order.size
        };
        let delta = if signed.is_sign_positive() { filled } else { -filled };
        state.positions.insert(order.market.clone(), current + delta);
        state.orders.push(order.clone());

        let id = self.order_id_counter.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            id,
            market = %order.market,
            side = ?order.side,
            size = %filled,
            price = %market.price,
            "Mock hedge order executed"
        );

        Ok(HedgeOrderResponse {
            id,
            market: order.market.clone(),
            side: order.side,
            size: order.size,
            filled_size: filled,
            avg_fill_price: Some(market.price),
            status: "closed".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRADER: &str = "0xmaker";

    #[test]
    fn test_swap_moves_price_against_taker() {
        let long = simulate_swap(dec!(100), dec!(10000), Side::Long, AmountType::Quote, dec!(100)).unwrap();
        assert_eq!(long.after_price, dec!(101));
        assert!(long.exchanged_position_size > Decimal::ZERO);

        let short = simulate_swap(dec!(100), dec!(10000), Side::Short, AmountType::Base, dec!(1)).unwrap();
        assert_eq!(short.after_price, dec!(99));
        assert!(short.exchanged_position_size < Decimal::ZERO);

        assert!(simulate_swap(dec!(100), dec!(10), Side::Short, AmountType::Quote, dec!(10)).is_err());
    }

    #[tokio::test]
    async fn test_margin_ratio_without_exposure_is_none() {
        let ledger = MockLedger::new(TRADER, dec!(0), dec!(1000000));
        ledger.add_market("0xeth", "0xpool", dec!(2000), 60);
        assert_eq!(ledger.margin_ratio(TRADER).await.unwrap(), None);

        ledger.set_position("0xeth", dec!(1));
        ledger.set_account_value(dec!(100));
        assert_eq!(ledger.margin_ratio(TRADER).await.unwrap(), Some(dec!(0.05)));
    }

    #[tokio::test]
    async fn test_stale_nonce_is_a_conflict() {
        let ledger = MockLedger::new(TRADER, dec!(0), dec!(1000000));
        ledger.bump_nonce(TRADER, 2);
        let call = ContractCall::Liquidate {
            trader: "0xother".to_string(),
            base_token: "0xeth".to_string(),
        };
        let request = TxRequest {
            nonce: 1,
            overrides: TxOverrides::default(),
        };

        let err = ledger.send_transaction(TRADER, &call, request).await.unwrap_err();
        assert!(err.is_nonce_conflict());
        assert_eq!(ledger.transaction_count(TRADER).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_reduce_only_hedge_order_is_capped() {
        let venue = MockHedgeVenue::new();
        venue.add_market("ETH-PERP", dec!(2000), dec!(0.01), dec!(0.01));
        venue.set_position("ETH-PERP", dec!(0.5));

        let order = HedgeOrder {
            market: "ETH-PERP".to_string(),
            side: HedgeOrderSide::Sell,
            size: dec!(2),
            reduce_only: true,
        };
        let resp = venue.place_market_order(&order).await.unwrap();

        assert_eq!(resp.filled_size, dec!(0.5));
        assert_eq!(venue.position_size("ETH-PERP").await.unwrap(), Decimal::ZERO);

        let again = venue.place_market_order(&order).await;
        assert!(again.is_err());
    }
}
