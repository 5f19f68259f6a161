//! Contract operations built on the sequencer.
//!
//! Each wrapper converts decimal amounts to fixed point, submits one
//! contract call through [`TxSequencer`], and waits for it to be mined.

use rust_decimal::Decimal;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, instrument};

use super::error::{SequencerError, TxError};
use super::sequencer::TxSequencer;
use crate::exchange::{
    swap_flags, AmountType, ContractCall, Ledger, Side, TxOverrides, TxReceipt, TxRequest,
};
use crate::utils::to_wei_unsigned;

/// Referral code attached to position calls when none is configured or
/// registered on-chain.
pub const DEFAULT_REFERRAL_CODE: &str = "perpmaker";

/// Transaction wrappers for one trader account.
pub struct TxOperations {
    ledger: Arc<dyn Ledger>,
    sequencer: Arc<TxSequencer>,
    trader: String,
    overrides: TxOverrides,
    confirm_timeout: Duration,
    referral_code: RwLock<String>,
}

impl TxOperations {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        sequencer: Arc<TxSequencer>,
        trader: impl Into<String>,
        overrides: TxOverrides,
        confirm_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            sequencer,
            trader: trader.into(),
            overrides,
            confirm_timeout,
            referral_code: RwLock::new(DEFAULT_REFERRAL_CODE.to_string()),
        }
    }

    pub fn trader(&self) -> &str {
        &self.trader
    }

    /// Referral code carried by `openPosition` and `closePosition`.
    pub fn referral_code(&self) -> String {
        self.referral_code
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn set_referral_code(&self, code: impl Into<String>) {
        *self
            .referral_code
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = code.into();
    }

    pub fn sequencer(&self) -> &Arc<TxSequencer> {
        &self.sequencer
    }

    /// Submit a call and wait until it is mined successfully.
    async fn execute(&self, call: ContractCall) -> Result<TxReceipt, SequencerError> {
        let name = call.name();
        let ledger = &self.ledger;
        let trader = self.trader.as_str();
        let overrides = self.overrides;
        let call_ref = &call;

        let tx = self
            .sequencer
            .submit(trader, |nonce| async move {
                ledger
                    .send_transaction(trader, call_ref, TxRequest { nonce, overrides })
                    .await
            })
            .await?;

        info!(call = name, tx_hash = %tx.hash, nonce = tx.nonce, "Waiting for transaction");

        let receipt = match tokio::time::timeout(self.confirm_timeout, ledger.wait_for_receipt(&tx)).await {
            Ok(receipt) => receipt?,
            Err(_) => {
                error!(call = name, tx_hash = %tx.hash, "Transaction not mined in time");
                return Err(TxError::ConfirmTimeout { tx_hash: tx.hash }.into());
            }
        };

        if !receipt.success {
            error!(call = name, tx_hash = %receipt.hash, block = receipt.block_number, "Transaction reverted");
            return Err(TxError::Reverted { tx_hash: receipt.hash }.into());
        }

        info!(
            call = name,
            tx_hash = %receipt.hash,
            block = receipt.block_number,
            gas_used = receipt.gas_used,
            "Transaction mined"
        );
        Ok(receipt)
    }

    #[instrument(skip(self))]
    pub async fn approve(&self, spender: &str, amount: Decimal) -> Result<TxReceipt, SequencerError> {
        let amount = to_wei_unsigned(amount).map_err(TxError::from)?;
        self.execute(ContractCall::Approve {
            spender: spender.to_string(),
            amount,
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn deposit(&self, token: &str, amount: Decimal) -> Result<TxReceipt, SequencerError> {
        let amount = to_wei_unsigned(amount).map_err(TxError::from)?;
        self.execute(ContractCall::Deposit {
            token: token.to_string(),
            amount,
        })
        .await
    }

    /// Provide `base` and `quote` liquidity between two ticks.
    #[instrument(skip(self))]
    pub async fn add_liquidity(
        &self,
        base_token: &str,
        lower_tick: i32,
        upper_tick: i32,
        base: Decimal,
        quote: Decimal,
    ) -> Result<TxReceipt, SequencerError> {
        let base = to_wei_unsigned(base).map_err(TxError::from)?;
        let quote = to_wei_unsigned(quote).map_err(TxError::from)?;
        self.execute(ContractCall::AddLiquidity {
            base_token: base_token.to_string(),
            lower_tick,
            upper_tick,
            base,
            quote,
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn remove_liquidity(
        &self,
        base_token: &str,
        lower_tick: i32,
        upper_tick: i32,
        liquidity: u128,
    ) -> Result<TxReceipt, SequencerError> {
        self.execute(ContractCall::RemoveLiquidity {
            base_token: base_token.to_string(),
            lower_tick,
            upper_tick,
            liquidity,
        })
        .await
    }

    /// Open or extend a taker position of `amount` in the given denomination.
    #[instrument(skip(self))]
    pub async fn open_position(
        &self,
        base_token: &str,
        side: Side,
        amount_type: AmountType,
        amount: Decimal,
    ) -> Result<TxReceipt, SequencerError> {
        let (is_base_to_quote, is_exact_input) = swap_flags(side, amount_type);
        let amount = to_wei_unsigned(amount).map_err(TxError::from)?;
        self.execute(ContractCall::OpenPosition {
            base_token: base_token.to_string(),
            is_base_to_quote,
            is_exact_input,
            amount,
            referral_code: self.referral_code(),
        })
        .await
    }

    /// Close the whole taker position; `None` when already flat.
    #[instrument(skip(self))]
    pub async fn close_position(&self, base_token: &str) -> Result<Option<TxReceipt>, SequencerError> {
        let size = self
            .ledger
            .position_size(&self.trader, base_token)
            .await
            .map_err(TxError::from)?;
        if size == Decimal::ZERO {
            debug!(base_token, "No position to close");
            return Ok(None);
        }

        self.execute(ContractCall::ClosePosition {
            base_token: base_token.to_string(),
            referral_code: self.referral_code(),
        })
        .await
        .map(Some)
    }

    #[instrument(skip(self))]
    pub async fn cancel_all_excess_orders(
        &self,
        maker: &str,
        base_token: &str,
    ) -> Result<TxReceipt, SequencerError> {
        self.execute(ContractCall::CancelAllExcessOrders {
            maker: maker.to_string(),
            base_token: base_token.to_string(),
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn liquidate(&self, trader: &str, base_token: &str) -> Result<TxReceipt, SequencerError> {
        self.execute(ContractCall::Liquidate {
            trader: trader.to_string(),
            base_token: base_token.to_string(),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::MockLedger;
    use crate::tx::RetryPolicy;
    use rust_decimal_macros::dec;

    const TRADER: &str = "0xmaker";
    const BASE: &str = "0xeth";

    fn setup() -> (Arc<MockLedger>, TxOperations) {
        let ledger = Arc::new(MockLedger::new(TRADER, dec!(10000), dec!(1000000)));
        ledger.add_market(BASE, "0xpool", dec!(2000), 60);
        let sequencer = Arc::new(TxSequencer::new(
            ledger.clone(),
            RetryPolicy {
                max_retries: 5,
                backoff: Duration::ZERO,
            },
        ));
        let ops = TxOperations::new(
            ledger.clone(),
            sequencer,
            TRADER,
            TxOverrides::default(),
            Duration::from_secs(5),
        );
        (ledger, ops)
    }

    #[tokio::test]
    async fn test_approve_and_deposit_move_collateral() {
        let (ledger, ops) = setup();

        ops.approve("0xvault", dec!(10000)).await.unwrap();
        ops.deposit("0xusdc", dec!(10000)).await.unwrap();

        assert_eq!(ledger.usdc_balance(TRADER).await.unwrap(), Decimal::ZERO);
        assert_eq!(ledger.free_collateral(TRADER).await.unwrap(), dec!(10000));
        let calls = ledger.sent_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name(), "approve");
        assert_eq!(
            calls[1],
            ContractCall::Deposit {
                token: "0xusdc".to_string(),
                amount: 10_000 * 10u128.pow(18),
            }
        );
    }

    #[tokio::test]
    async fn test_close_position_is_noop_when_flat() {
        let (ledger, ops) = setup();

        let receipt = ops.close_position(BASE).await.unwrap();

        assert!(receipt.is_none());
        assert!(ledger.sent_calls().is_empty());
    }

    #[tokio::test]
    async fn test_open_then_close_position() {
        let (ledger, ops) = setup();

        ops.open_position(BASE, Side::Long, AmountType::Quote, dec!(200))
            .await
            .unwrap();
        assert!(ledger.position_size(TRADER, BASE).await.unwrap() > Decimal::ZERO);

        let receipt = ops.close_position(BASE).await.unwrap();
        assert!(receipt.is_some());
        assert_eq!(ledger.position_size(TRADER, BASE).await.unwrap(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_reverted_receipt_is_an_error() {
        let (ledger, ops) = setup();
        ledger.revert_next();

        let result = ops.cancel_all_excess_orders(TRADER, BASE).await;

        assert!(matches!(
            result,
            Err(SequencerError::Tx(TxError::Reverted { .. }))
        ));
    }

    #[tokio::test]
    async fn test_recovers_when_another_sender_used_the_nonce() {
        let (ledger, ops) = setup();
        ops.sequencer().register(TRADER).await.unwrap();
        ledger.bump_nonce(TRADER, 3);

        ops.add_liquidity(BASE, -600, 600, dec!(0.25), dec!(500))
            .await
            .unwrap();

        assert_eq!(ledger.orders(BASE).len(), 1);
        assert_eq!(ops.sequencer().next_nonce(TRADER).await, Some(4));
    }

    #[tokio::test]
    async fn test_negative_amount_is_rejected_before_submission() {
        let (ledger, ops) = setup();

        let result = ops.deposit("0xusdc", dec!(-1)).await;

        assert!(matches!(result, Err(SequencerError::Tx(TxError::Transport(_)))));
        assert!(ledger.sent_calls().is_empty());
    }

    #[tokio::test]
    async fn test_position_calls_carry_referral_code() {
        let (ledger, ops) = setup();
        assert_eq!(ops.referral_code(), DEFAULT_REFERRAL_CODE);
        ops.set_referral_code("desk-7");

        ops.open_position(BASE, Side::Short, AmountType::Base, dec!(0.1))
            .await
            .unwrap();
        ops.close_position(BASE).await.unwrap();

        let calls = ledger.sent_calls();
        assert!(matches!(
            &calls[0],
            ContractCall::OpenPosition { referral_code, is_base_to_quote: true, .. } if referral_code == "desk-7"
        ));
        assert_eq!(
            calls[1],
            ContractCall::ClosePosition {
                base_token: BASE.to_string(),
                referral_code: "desk-7".to_string(),
            }
        );
    }
}
