//! JSON-RPC wire types.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event delivered by a block subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockEvent {
    NewBlock(u64),
    /// Transport or subscription failure; the subscription may be dead
    Error(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: Value,
}

impl<'a> JsonRpcRequest<'a> {
    pub fn new(id: u64, method: &'a str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

/// Response or subscription notification.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcMessage {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<SubscriptionParams>,
}

impl JsonRpcMessage {
    /// Result of a response, or its error.
    pub fn into_result(self) -> Result<Value> {
        if let Some(error) = self.error {
            return Err(anyhow!("rpc error {}: {}", error.code, error.message));
        }
        self.result.context("rpc response has no result")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionParams {
    pub subscription: String,
    pub result: Value,
}

/// Parse a `0x`-prefixed hex quantity.
pub fn parse_quantity(value: &Value) -> Result<u128> {
    let raw = value
        .as_str()
        .with_context(|| format!("expected hex quantity, got {}", value))?;
    let digits = raw
        .strip_prefix("0x")
        .with_context(|| format!("missing 0x prefix in {}", raw))?;
    u128::from_str_radix(digits, 16).with_context(|| format!("invalid hex quantity {}", raw))
}

pub fn parse_u64(value: &Value) -> Result<u64> {
    let quantity = parse_quantity(value)?;
    u64::try_from(quantity).map_err(|_| anyhow!("quantity {} exceeds u64", quantity))
}

/// Block number from a `newHeads` notification.
pub fn head_number(head: &Value) -> Result<u64> {
    parse_u64(head.get("number").context("block header has no number")?)
}
