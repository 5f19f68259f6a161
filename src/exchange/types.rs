//! Type definitions shared by the ledger and secondary venue integrations.

use crate::config::MakerConfig;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

// ==================== Ledger ====================

/// Direction of an on-chain position change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// Side that reduces a position of the given signed size.
    pub fn reducing(position_size: Decimal) -> Self {
        if position_size > Decimal::ZERO {
            Side::Short
        } else {
            Side::Long
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Long => write!(f, "long"),
            Side::Short => write!(f, "short"),
        }
    }
}

/// Which token an order amount is denominated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AmountType {
    Base,
    Quote,
}

/// Swap direction flags expected by the clearing house.
///
/// Shorts sell base into the pool; longs pay quote in.
pub fn swap_flags(side: Side, amount_type: AmountType) -> (bool, bool) {
    match side {
        Side::Short => (true, amount_type == AmountType::Base),
        Side::Long => (false, amount_type == AmountType::Quote),
    }
}

/// A range liquidity position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub lower_tick: i32,
    pub upper_tick: i32,
    /// Raw pool liquidity units
    pub liquidity: u128,
}

/// Result of a read-only swap simulation.
#[derive(Debug, Clone, PartialEq)]
pub struct SwapQuote {
    pub exchanged_position_size: Decimal,
    pub exchanged_position_notional: Decimal,
    pub after_price: Decimal,
}

/// Contract call built by a transaction wrapper. Amounts are 18-decimal fixed point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractCall {
    Approve {
        spender: String,
        amount: u128,
    },
    Deposit {
        token: String,
        amount: u128,
    },
    AddLiquidity {
        base_token: String,
        lower_tick: i32,
        upper_tick: i32,
        base: u128,
        quote: u128,
    },
    RemoveLiquidity {
        base_token: String,
        lower_tick: i32,
        upper_tick: i32,
        liquidity: u128,
    },
    OpenPosition {
        base_token: String,
        is_base_to_quote: bool,
        is_exact_input: bool,
        amount: u128,
        referral_code: String,
    },
    ClosePosition {
        base_token: String,
        referral_code: String,
    },
    CancelAllExcessOrders {
        maker: String,
        base_token: String,
    },
    Liquidate {
        trader: String,
        base_token: String,
    },
}

impl ContractCall {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ContractCall::Approve { .. } => "approve",
            ContractCall::Deposit { .. } => "deposit",
            ContractCall::AddLiquidity { .. } => "addLiquidity",
            ContractCall::RemoveLiquidity { .. } => "removeLiquidity",
            ContractCall::OpenPosition { .. } => "openPosition",
            ContractCall::ClosePosition { .. } => "closePosition",
            ContractCall::CancelAllExcessOrders { .. } => "cancelAllExcessOrders",
            ContractCall::Liquidate { .. } => "liquidate",
        }
    }
}

/// Gas parameters attached to every transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxOverrides {
    pub gas_limit: u64,
    /// Wei
    pub max_fee_per_gas: Option<u128>,
    /// Wei
    pub max_priority_fee_per_gas: Option<u128>,
}

impl TxOverrides {
    pub fn from_config(config: &MakerConfig) -> Self {
        Self {
            gas_limit: config.gas_limit,
            max_fee_per_gas: config.max_fee_per_gas_gwei.and_then(gwei_to_wei),
            max_priority_fee_per_gas: config.max_priority_fee_per_gas_gwei.and_then(gwei_to_wei),
        }
    }
}

impl Default for TxOverrides {
    fn default() -> Self {
        Self {
            gas_limit: 5_000_000,
            max_fee_per_gas: None,
            max_priority_fee_per_gas: None,
        }
    }
}

/// Convert a gwei amount into wei.
pub fn gwei_to_wei(gwei: Decimal) -> Option<u128> {
    (gwei * Decimal::from(1_000_000_000u64)).trunc().to_u128()
}

/// Convert a wei amount into gwei.
pub fn wei_to_gwei(wei: u128) -> Decimal {
    Decimal::from(wei) / Decimal::from(1_000_000_000u64)
}

/// Everything a ledger needs besides the call itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxRequest {
    pub nonce: u64,
    pub overrides: TxOverrides,
}

/// A transaction accepted by the node but not yet mined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTx {
    pub hash: String,
    pub from: String,
    pub nonce: u64,
    pub gas_limit: u64,
    pub max_fee_per_gas: Option<u128>,
    pub max_priority_fee_per_gas: Option<u128>,
}

/// Mined transaction outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub hash: String,
    pub block_number: u64,
    pub success: bool,
    pub gas_used: u64,
}

// ==================== Secondary venue ====================

/// Order side on the secondary venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HedgeOrderSide {
    Buy,
    Sell,
}

impl HedgeOrderSide {
    /// Side that moves a signed position gap back to zero.
    pub fn closing(gap: Decimal) -> Self {
        if gap > Decimal::ZERO {
            HedgeOrderSide::Sell
        } else {
            HedgeOrderSide::Buy
        }
    }
}

/// Market snapshot on the secondary venue.
#[derive(Debug, Clone, PartialEq)]
pub struct HedgeMarket {
    pub name: String,
    pub price: Decimal,
    pub min_order_size: Decimal,
    pub size_increment: Decimal,
}

/// Market order request.
#[derive(Debug, Clone, PartialEq)]
pub struct HedgeOrder {
    pub market: String,
    pub side: HedgeOrderSide,
    pub size: Decimal,
    pub reduce_only: bool,
}

/// Order acknowledgement from the secondary venue.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HedgeOrderResponse {
    pub id: u64,
    pub market: String,
    pub side: HedgeOrderSide,
    pub size: Decimal,
    #[serde(default)]
    pub filled_size: Decimal,
    #[serde(default)]
    pub avg_fill_price: Option<Decimal>,
    pub status: String,
}

/// Envelope used by every secondary venue REST response.
#[derive(Debug, Clone, Deserialize)]
pub struct VenueResponse<T> {
    pub success: bool,
    pub result: Option<T>,
    #[serde(default)]
    pub error: Option<String>,
}

/// `GET /api/markets/{name}` payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VenueMarket {
    pub name: String,
    pub price: Option<Decimal>,
    pub last: Option<Decimal>,
    pub min_provide_size: Decimal,
    pub size_increment: Decimal,
}

/// `GET /api/positions` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VenuePosition {
    pub future: String,
    /// Signed size, negative when short
    pub net_size: Decimal,
}

/// `GET /api/account` payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VenueAccount {
    pub collateral: Decimal,
    pub free_collateral: Decimal,
    /// Absent when the account has no open positions
    pub margin_fraction: Option<Decimal>,
}

/// `POST /api/orders` body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VenueOrderRequest<'a> {
    pub market: &'a str,
    pub side: HedgeOrderSide,
    pub price: Option<Decimal>,
    #[serde(rename = "type")]
    pub order_type: &'a str,
    pub size: Decimal,
    pub reduce_only: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_swap_flags() {
        assert_eq!(swap_flags(Side::Short, AmountType::Base), (true, true));
        assert_eq!(swap_flags(Side::Short, AmountType::Quote), (true, false));
        assert_eq!(swap_flags(Side::Long, AmountType::Quote), (false, true));
        assert_eq!(swap_flags(Side::Long, AmountType::Base), (false, false));
    }

    #[test]
    fn test_reducing_sides() {
        assert_eq!(Side::reducing(dec!(1.5)), Side::Short);
        assert_eq!(Side::reducing(dec!(-1.5)), Side::Long);
        assert_eq!(HedgeOrderSide::closing(dec!(0.3)), HedgeOrderSide::Sell);
        assert_eq!(HedgeOrderSide::closing(dec!(-0.3)), HedgeOrderSide::Buy);
    }

    #[test]
    fn test_overrides_from_config() {
        let overrides = TxOverrides::from_config(&MakerConfig::default());
        assert_eq!(overrides.gas_limit, 5_000_000);
        assert_eq!(overrides.max_fee_per_gas, Some(10_000_000_000));
        assert_eq!(overrides.max_priority_fee_per_gas, Some(1_000_000));
        assert_eq!(wei_to_gwei(2_500_000_000), dec!(2.5));
    }

    #[test]
    fn test_order_response_parses() {
        let raw = r#"{"id": 9, "market": "ETH-PERP", "side": "sell", "size": 0.5,
                      "filledSize": 0.5, "avgFillPrice": 2000.5, "status": "closed"}"#;
        let resp: HedgeOrderResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.side, HedgeOrderSide::Sell);
        assert_eq!(resp.avg_fill_price, Some(dec!(2000.5)));
    }
}
