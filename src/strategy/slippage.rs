//! Slippage estimation by sampling read-only swap quotes.

use futures_util::future::try_join_all;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::debug;

use super::error::MakerError;
use super::market::Market;
use crate::exchange::{AmountType, Ledger, Side};

/// Price impact of a swap of `amount` quote.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlippageSample {
    pub ratio: Decimal,
    pub amount: Decimal,
}

/// Sample closest to `target`; ties go to the earliest sample.
pub fn select_sample(samples: &[SlippageSample], target: Decimal) -> Option<SlippageSample> {
    let mut best: Option<SlippageSample> = None;
    for sample in samples {
        let closer = match best {
            Some(current) => (sample.ratio - target).abs() < (current.ratio - target).abs(),
            None => true,
        };
        if closer {
            best = Some(*sample);
        }
    }
    best
}

/// Finds the order size whose slippage is closest to a target ratio.
pub struct SlippageEstimator {
    ledger: Arc<dyn Ledger>,
    samples: u32,
}

impl SlippageEstimator {
    pub fn new(ledger: Arc<dyn Ledger>, samples: u32) -> Self {
        Self { ledger, samples }
    }

    /// Quote `samples` evenly spaced sizes up to the market's max order
    /// amount and return the one closest to `target_ratio`.
    pub async fn estimate(
        &self,
        market: &Market,
        current_price: Decimal,
        target_ratio: Decimal,
        side: Side,
    ) -> Result<SlippageSample, MakerError> {
        if current_price <= Decimal::ZERO || self.samples == 0 {
            return Err(anyhow::anyhow!("cannot estimate slippage on {} at price {}", market.name, current_price).into());
        }

        let count = Decimal::from(self.samples);
        let amounts: Vec<Decimal> = (1..=self.samples)
            .map(|i| market.params.max_order_amount * Decimal::from(i) / count)
            .collect();

        let quotes = try_join_all(
            amounts
                .iter()
                .map(|&amount| self.ledger.quote(&market.base_token, side, AmountType::Quote, amount)),
        )
        .await?;

        let samples: Vec<SlippageSample> = amounts
            .iter()
            .zip(quotes)
            .map(|(&amount, quote)| SlippageSample {
                ratio: ((current_price - quote.after_price) / current_price).abs(),
                amount,
            })
            .collect();

        let best = select_sample(&samples, target_ratio)
            .ok_or_else(|| anyhow::anyhow!("no slippage samples for {}", market.name))?;
        debug!(
            market = %market.name,
            %side,
            target = %target_ratio,
            ratio = %best.ratio,
            amount = %best.amount,
            "Slippage estimated"
        );
        Ok(best)
    }
}
