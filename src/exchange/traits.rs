//! Capabilities the maker consumes from the outside world.
//!
//! - [`Ledger`]: typed contract reads and transaction submission on the
//!   perpetual protocol. Contract bindings convert fixed-point integers to
//!   decimals at this boundary.
//! - [`HedgeVenue`]: the secondary venue used to offset on-chain exposure.

use async_trait::async_trait;
use rust_decimal::Decimal;

use super::types::*;
use crate::tx::TxError;

/// On-chain reads and writes used by the maker.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Collateral token balance held in the trader's wallet.
    async fn usdc_balance(&self, trader: &str) -> anyhow::Result<Decimal>;

    async fn tick_spacing(&self, pool: &str) -> anyhow::Result<i32>;

    /// Current pool price.
    async fn market_price(&self, pool: &str) -> anyhow::Result<Decimal>;

    /// Oracle index price of the base token.
    async fn index_price(&self, base_token: &str) -> anyhow::Result<Decimal>;

    async fn free_collateral(&self, trader: &str) -> anyhow::Result<Decimal>;

    async fn account_value(&self, trader: &str) -> anyhow::Result<Decimal>;

    async fn total_abs_position_value(&self, trader: &str) -> anyhow::Result<Decimal>;

    /// Signed position size in base units.
    async fn position_size(&self, trader: &str, base_token: &str) -> anyhow::Result<Decimal>;

    /// Signed position value in quote units.
    async fn position_value(&self, trader: &str, base_token: &str) -> anyhow::Result<Decimal>;

    async fn open_orders(&self, trader: &str, base_token: &str) -> anyhow::Result<Vec<OpenOrder>>;

    async fn open_order(
        &self,
        trader: &str,
        base_token: &str,
        lower_tick: i32,
        upper_tick: i32,
    ) -> anyhow::Result<OpenOrder>;

    /// Simulate a swap without changing state.
    async fn quote(
        &self,
        base_token: &str,
        side: Side,
        amount_type: AmountType,
        amount: Decimal,
    ) -> anyhow::Result<SwapQuote>;

    /// Current gas price in wei.
    async fn gas_price(&self) -> anyhow::Result<u128>;

    /// Sign and broadcast a contract call with an explicit nonce.
    async fn send_transaction(
        &self,
        from: &str,
        call: &ContractCall,
        request: TxRequest,
    ) -> Result<PendingTx, TxError>;

    /// Wait until a broadcast transaction is mined.
    async fn wait_for_receipt(&self, tx: &PendingTx) -> Result<TxReceipt, TxError>;

    /// Referral code registered for the trader, if any.
    async fn referral_code(&self, _trader: &str) -> anyhow::Result<Option<String>> {
        Ok(None)
    }

    /// Free collateral scaled by the leverage multiplier.
    async fn buying_power(&self, trader: &str, leverage: Decimal) -> anyhow::Result<Decimal> {
        Ok(self.free_collateral(trader).await? * leverage)
    }

    /// Account value over total absolute exposure; `None` without exposure.
    async fn margin_ratio(&self, trader: &str) -> anyhow::Result<Option<Decimal>> {
        let exposure = self.total_abs_position_value(trader).await?;
        if exposure == Decimal::ZERO {
            return Ok(None);
        }
        Ok(Some(self.account_value(trader).await? / exposure))
    }
}

/// Secondary venue used for hedging.
#[async_trait]
pub trait HedgeVenue: Send + Sync {
    async fn get_market(&self, market: &str) -> anyhow::Result<HedgeMarket>;

    /// Signed position size in base units; zero when flat.
    async fn position_size(&self, market: &str) -> anyhow::Result<Decimal>;

    /// Account margin fraction; `None` without open positions.
    async fn margin_fraction(&self) -> anyhow::Result<Option<Decimal>>;

    async fn place_market_order(&self, order: &HedgeOrder) -> anyhow::Result<HedgeOrderResponse>;
}
