//! Tick and price conversions for the concentrated-liquidity pool.
//!
//! price = 1.0001^tick. These are floating point conversions; the result is
//! only used to place range bounds and check drift, never to settle amounts.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

/// Largest tick supported by the pool.
pub const MAX_TICK: i32 = 887_272;

const TICK_BASE: f64 = 1.0001;

/// Lowest usable tick for a given tick spacing.
pub fn min_tick(tick_spacing: i32) -> i32 {
    (-MAX_TICK as f64 / tick_spacing as f64).ceil() as i32 * tick_spacing
}

/// Highest usable tick for a given tick spacing.
pub fn max_tick(tick_spacing: i32) -> i32 {
    (MAX_TICK as f64 / tick_spacing as f64).floor() as i32 * tick_spacing
}

/// Price at a tick.
pub fn tick_to_price(tick: i32) -> Decimal {
    Decimal::from_f64(TICK_BASE.powi(tick)).unwrap_or(Decimal::ZERO)
}

/// Nearest tick to `price` that is a multiple of `tick_spacing`.
///
/// Returns `None` for non-positive prices.
pub fn price_to_tick(price: Decimal, tick_spacing: i32) -> Option<i32> {
    let price = price.to_f64().filter(|p| *p > 0.0)?;
    let tick = price.ln() / TICK_BASE.ln();
    let spacing = tick_spacing as f64;
    let snapped = ((tick / spacing).round() * spacing) as i32;
    Some(snapped.clamp(min_tick(tick_spacing), max_tick(tick_spacing)))
}

/// Convert a Q64.96 square-root price into a price.
pub fn sqrt_price_x96_to_price(sqrt_price_x96: u128) -> Decimal {
    let ratio = sqrt_price_x96 as f64 / 2f64.powi(96);
    Decimal::from_f64(ratio * ratio).unwrap_or(Decimal::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_tick_bounds() {
        assert_eq!(min_tick(60), -887_220);
        assert_eq!(max_tick(60), 887_220);
        assert_eq!(max_tick(1), MAX_TICK);
    }

    #[test]
    fn test_tick_price_round_trip() {
        assert_eq!(tick_to_price(0), Decimal::ONE);
        let price = tick_to_price(23_040);
        assert_eq!(price_to_tick(price, 60), Some(23_040));
    }

    #[test]
    fn test_price_to_tick_snaps_to_spacing() {
        let tick = price_to_tick(dec!(1.5), 60).unwrap();
        assert_eq!(tick % 60, 0);
        // 1.0001^4055 ~= 1.5
        assert!((tick - 4055).abs() <= 30);
        assert_eq!(price_to_tick(Decimal::ZERO, 60), None);
    }

    #[test]
    fn test_sqrt_price_conversion() {
        let one = 1u128 << 96;
        assert_eq!(sqrt_price_x96_to_price(one), Decimal::ONE);
        assert_eq!(sqrt_price_x96_to_price(one * 2), dec!(4));
    }
}
