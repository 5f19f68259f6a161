//! Decimal arithmetic utilities for financial calculations.
//!
//! Contract amounts cross the ledger boundary as 18-decimal fixed-point
//! integers; everything above that boundary works in [`Decimal`].

use anyhow::{anyhow, Result};
use rand::Rng;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Number of decimals used by the protocol's fixed-point amounts.
pub const WEI_DECIMALS: u32 = 18;

/// Convert a decimal amount into an 18-decimal fixed-point integer.
///
/// Digits beyond the 18th decimal are truncated.
pub fn to_wei(value: Decimal) -> Result<i128> {
    let scale = Decimal::from_i128_with_scale(10i128.pow(WEI_DECIMALS), 0);
    value
        .checked_mul(scale)
        .and_then(|scaled| scaled.trunc().to_i128())
        .ok_or_else(|| anyhow!("amount {} does not fit in fixed-point representation", value))
}

/// Convert a non-negative decimal amount into an unsigned fixed-point integer.
pub fn to_wei_unsigned(value: Decimal) -> Result<u128> {
    anyhow::ensure!(value >= Decimal::ZERO, "amount must be non-negative, got {}", value);
    let wei = to_wei(value)?;
    u128::try_from(wei).map_err(|_| anyhow!("amount {} out of range", value))
}

/// Convert an 18-decimal fixed-point integer into a decimal amount.
pub fn from_wei(wei: i128) -> Result<Decimal> {
    Decimal::try_from_i128_with_scale(wei, WEI_DECIMALS)
        .map(|d| d.normalize())
        .map_err(|e| anyhow!("fixed-point value {} out of decimal range: {}", wei, e))
}

/// Round down to lot size (quantity precision).
pub fn round_down_to_lot(value: Decimal, lot_size: Decimal) -> Decimal {
    if lot_size == Decimal::ZERO {
        return value;
    }
    (value / lot_size).floor() * lot_size
}

/// Safe division that returns zero if divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Draw a value uniformly from `[center - offset, center + offset]`.
///
/// The draw is clamped at zero so a large offset never yields a negative amount.
pub fn random_around(center: Decimal, offset: Decimal) -> Decimal {
    let offset = offset.abs();
    if offset == Decimal::ZERO {
        return center.max(Decimal::ZERO);
    }
    // Micro-unit resolution is plenty for order sizing.
    let steps = (offset * Decimal::from(2_000_000))
        .trunc()
        .to_i64()
        .unwrap_or(i64::MAX);
    let step = rand::thread_rng().gen_range(0..=steps);
    let value = center - offset + Decimal::from(step) / Decimal::from(1_000_000);
    value.max(Decimal::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_wei_conversion() {
        assert_eq!(to_wei(dec!(1)).unwrap(), 1_000_000_000_000_000_000);
        assert_eq!(to_wei(dec!(-0.5)).unwrap(), -500_000_000_000_000_000);
        assert_eq!(from_wei(1_500_000_000_000_000_000).unwrap(), dec!(1.5));
        assert_eq!(from_wei(to_wei(dec!(1234.000001)).unwrap()).unwrap(), dec!(1234.000001));
    }

    #[test]
    fn test_unsigned_wei_rejects_negative() {
        assert!(to_wei_unsigned(dec!(-1)).is_err());
        assert_eq!(to_wei_unsigned(dec!(0.000000000000000001)).unwrap(), 1);
    }

    #[test]
    fn test_round_down_to_lot() {
        assert_eq!(round_down_to_lot(dec!(1.567), dec!(0.01)), dec!(1.56));
        assert_eq!(round_down_to_lot(dec!(1.567), dec!(0.1)), dec!(1.5));
        assert_eq!(round_down_to_lot(dec!(1.567), Decimal::ZERO), dec!(1.567));
    }

    #[test]
    fn test_random_around_stays_in_band() {
        for _ in 0..200 {
            let v = random_around(dec!(100), dec!(10));
            assert!(v >= dec!(90) && v <= dec!(110), "{} out of band", v);
        }
        assert_eq!(random_around(dec!(5), Decimal::ZERO), dec!(5));
        assert!(random_around(dec!(1), dec!(10)) >= Decimal::ZERO);
    }
}
