//! Configuration management for the maker.
//!
//! Loads settings from an optional TOML file and `PMAKER__*` environment
//! variables. Per-market sections are strict: unknown keys are rejected at
//! load time rather than at first use.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Blockchain endpoints and health-check settings
    #[serde(default)]
    pub chain: ChainConfig,
    /// Trading account
    #[serde(default)]
    pub trader: TraderConfig,
    /// Order maintenance and transaction settings
    #[serde(default)]
    pub maker: MakerConfig,
    /// Secondary venue hedge routine
    #[serde(default)]
    pub hedge: HedgeConfig,
    /// Normal (spread driven) position reduction
    #[serde(default)]
    pub reduce: ReduceConfig,
    /// Emergency (margin driven) position reduction
    #[serde(default)]
    pub emergency: EmergencyConfig,
    /// Secondary venue REST credentials
    #[serde(default)]
    pub hedge_venue: HedgeVenueConfig,
    /// Seed values for the simulated ledger and venue
    #[serde(default)]
    pub paper: PaperConfig,
    /// Per-market strategy parameters, keyed by market name
    #[serde(default)]
    pub markets: BTreeMap<String, MarketConfig>,
}

/// Which chain layer an endpoint set belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    Layer1,
    Layer2,
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layer::Layer1 => write!(f, "layer1"),
            Layer::Layer2 => write!(f, "layer2"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Network layer tag used in logs
    #[serde(default = "default_layer")]
    pub layer: Layer,
    /// Ordered RPC endpoints; `ws(s)://` endpoints use a socket subscription
    #[serde(default)]
    pub endpoints: Vec<String>,
    /// How often the block subscription health check runs
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
    /// Silence after which the active endpoint is rotated out
    #[serde(default = "default_no_response_timeout")]
    pub no_response_timeout_secs: u64,
    /// Poll interval for HTTP block subscriptions
    #[serde(default = "default_http_poll_interval")]
    pub http_poll_interval_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraderConfig {
    /// Address of the maker account
    #[serde(default)]
    pub address: String,
    /// Collateral vault contract
    #[serde(default)]
    pub vault: String,
    /// Collateral (USDC) token contract
    #[serde(default)]
    pub collateral_token: String,
    /// Referral code for position calls; looked up on-chain when unset
    #[serde(default)]
    pub referral_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MakerConfig {
    /// Order maintenance poll interval
    #[serde(default = "default_order_check_interval")]
    pub order_check_interval_secs: u64,
    /// Buying power multiplier applied to free collateral
    #[serde(default = "default_leverage")]
    pub leverage: Decimal,
    /// Skip liquidity adjustment while gas is above this price
    #[serde(default = "default_adjust_max_gas_price_gwei")]
    pub adjust_max_gas_price_gwei: Decimal,
    /// Gas limit attached to every transaction
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
    /// EIP-1559 max fee cap
    #[serde(default = "default_max_fee_per_gas_gwei")]
    pub max_fee_per_gas_gwei: Option<Decimal>,
    /// EIP-1559 priority fee cap
    #[serde(default = "default_max_priority_fee_per_gas_gwei")]
    pub max_priority_fee_per_gas_gwei: Option<Decimal>,
    /// Nonce-conflict retries before a submission is abandoned
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,
    /// Pause between nonce-conflict retries
    #[serde(default = "default_nonce_retry_backoff")]
    pub nonce_retry_backoff_ms: u64,
    /// How long to wait for a transaction to be mined
    #[serde(default = "default_confirm_timeout")]
    pub confirm_timeout_secs: u64,
    /// Number of simulated trades per slippage estimate
    #[serde(default = "default_slippage_samples")]
    pub slippage_samples: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HedgeConfig {
    /// Run the hedge routine at all
    #[serde(default)]
    pub enabled: bool,
    /// Hedge routine poll interval
    #[serde(default = "default_hedge_check_interval")]
    pub check_interval_secs: u64,
    /// Delay between partial hedge orders
    #[serde(default = "default_hedge_order_delay")]
    pub order_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReduceConfig {
    /// Run the normal reduce routine at all
    #[serde(default)]
    pub enabled: bool,
    /// Normal reduce poll interval
    #[serde(default = "default_reduce_check_interval")]
    pub check_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyConfig {
    /// Run the emergency reduce routine at all
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Margin check poll interval
    #[serde(default = "default_emergency_check_interval")]
    pub check_interval_secs: u64,
    /// On-chain margin ratio below which emergency mode starts
    #[serde(default = "default_emergency_margin_ratio")]
    pub margin_ratio_threshold: Decimal,
    /// Secondary venue margin fraction below which emergency mode starts
    #[serde(default = "default_emergency_margin_ratio")]
    pub hedge_margin_ratio_threshold: Decimal,
    /// Pause after a reduction round before normal polling resumes
    #[serde(default = "default_emergency_cooldown")]
    pub cooldown_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HedgeVenueConfig {
    /// REST base URL; empty selects the simulated venue
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default)]
    pub subaccount: Option<String>,
}

impl HedgeVenueConfig {
    /// Whether live credentials are configured.
    pub fn is_live(&self) -> bool {
        !self.base_url.is_empty() && !self.api_key.is_empty() && !self.api_secret.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperConfig {
    /// Wallet collateral balance of the simulated trader
    #[serde(default = "default_paper_usdc")]
    pub initial_usdc: Decimal,
    /// Quote depth used by the simulated price impact model
    #[serde(default = "default_paper_pool_depth")]
    pub pool_depth: Decimal,
    /// Starting prices by market name
    #[serde(default)]
    pub prices: BTreeMap<String, Decimal>,
}

/// Strategy parameters for one market.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MarketConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Base token contract address
    pub base_token: String,
    /// Pool contract address
    pub pool: String,
    /// Market name on the secondary venue (e.g. "ETH-PERP")
    pub hedge_market: String,

    // Range order
    /// Target liquidity value of the current range order (quote)
    pub liquidity_amount: Decimal,
    /// Range half-width relative to market price (0.0-1.0)
    #[serde(default = "default_range_offset")]
    pub range_offset: Decimal,
    /// Drift inside the range edges that invalidates the order (0.0-1.0)
    #[serde(default = "default_adjust_threshold")]
    pub adjust_threshold: Decimal,

    // Slippage
    /// Price impact aimed for when sizing a reduction (0.0-1.0)
    #[serde(default = "default_target_slippage")]
    pub target_slippage_ratio: Decimal,
    /// Hard cap on price impact (0.0-1.0)
    #[serde(default = "default_max_slippage")]
    pub max_slippage_ratio: Decimal,
    /// Largest single on-chain order (quote)
    #[serde(default = "default_max_order_amount")]
    pub max_order_amount: Decimal,

    // Hedge
    #[serde(default = "default_true")]
    pub hedge_enabled: bool,
    /// Relative gap between venues that triggers a hedge (0.0-1.0)
    #[serde(default = "default_hedge_trigger_ratio")]
    pub hedge_trigger_ratio: Decimal,
    /// Largest single hedge order (base)
    #[serde(default = "default_max_hedge_order_size")]
    pub max_hedge_order_size: Decimal,

    // Normal reduce
    #[serde(default)]
    pub normal_reduce_enabled: bool,
    /// Lower edge of the |spread| band that triggers a reduction
    #[serde(default = "default_reduce_trigger_spread_min")]
    pub reduce_trigger_spread_min: Decimal,
    /// Upper edge of the |spread| band that triggers a reduction
    #[serde(default = "default_reduce_trigger_spread_max")]
    pub reduce_trigger_spread_max: Decimal,
    /// Base reduction size (quote)
    #[serde(default = "default_reduce_amount")]
    pub reduce_amount: Decimal,
    /// Random offset applied around the base reduction size (quote)
    #[serde(default = "default_reduce_amount_offset")]
    pub reduce_amount_offset: Decimal,

    // Emergency reduce
    #[serde(default = "default_true")]
    pub emergency_reduce_enabled: bool,
    /// Reduction size per venue during emergency handling (quote)
    #[serde(default = "default_emergency_reduce_amount")]
    pub emergency_reduce_amount: Decimal,
}

impl MarketConfig {
    /// Market config with default strategy parameters.
    pub fn new(base_token: &str, pool: &str, hedge_market: &str, liquidity_amount: Decimal) -> Self {
        Self {
            enabled: true,
            base_token: base_token.to_string(),
            pool: pool.to_string(),
            hedge_market: hedge_market.to_string(),
            liquidity_amount,
            range_offset: default_range_offset(),
            adjust_threshold: default_adjust_threshold(),
            target_slippage_ratio: default_target_slippage(),
            max_slippage_ratio: default_max_slippage(),
            max_order_amount: default_max_order_amount(),
            hedge_enabled: true,
            hedge_trigger_ratio: default_hedge_trigger_ratio(),
            max_hedge_order_size: default_max_hedge_order_size(),
            normal_reduce_enabled: false,
            reduce_trigger_spread_min: default_reduce_trigger_spread_min(),
            reduce_trigger_spread_max: default_reduce_trigger_spread_max(),
            reduce_amount: default_reduce_amount(),
            reduce_amount_offset: default_reduce_amount_offset(),
            emergency_reduce_enabled: true,
            emergency_reduce_amount: default_emergency_reduce_amount(),
        }
    }

    /// Validate a single market section.
    pub fn validate(&self, name: &str) -> Result<()> {
        anyhow::ensure!(!self.base_token.is_empty(), "{}: base_token is required", name);
        anyhow::ensure!(!self.pool.is_empty(), "{}: pool is required", name);
        anyhow::ensure!(!self.hedge_market.is_empty(), "{}: hedge_market is required", name);
        anyhow::ensure!(
            self.liquidity_amount > Decimal::ZERO,
            "{}: liquidity_amount must be positive",
            name
        );

        for (field, value) in [
            ("range_offset", self.range_offset),
            ("adjust_threshold", self.adjust_threshold),
            ("target_slippage_ratio", self.target_slippage_ratio),
            ("max_slippage_ratio", self.max_slippage_ratio),
            ("hedge_trigger_ratio", self.hedge_trigger_ratio),
            ("reduce_trigger_spread_min", self.reduce_trigger_spread_min),
            ("reduce_trigger_spread_max", self.reduce_trigger_spread_max),
        ] {
            anyhow::ensure!(
                is_open_unit_ratio(value),
                "{}: {} must be between 0 and 1 (exclusive), got {}",
                name,
                field,
                value
            );
        }

        // A freshly centred order must sit inside its own validity band.
        anyhow::ensure!(
            self.adjust_threshold < self.range_offset,
            "{}: adjust_threshold ({}) must be smaller than range_offset ({})",
            name,
            self.adjust_threshold,
            self.range_offset
        );
        anyhow::ensure!(
            self.target_slippage_ratio <= self.max_slippage_ratio,
            "{}: target_slippage_ratio must not exceed max_slippage_ratio",
            name
        );
        anyhow::ensure!(
            self.reduce_trigger_spread_min <= self.reduce_trigger_spread_max,
            "{}: reduce_trigger_spread_min must not exceed reduce_trigger_spread_max",
            name
        );
        anyhow::ensure!(
            self.max_order_amount > Decimal::ZERO && self.max_hedge_order_size > Decimal::ZERO,
            "{}: order size caps must be positive",
            name
        );
        anyhow::ensure!(
            self.reduce_amount > Decimal::ZERO
                && self.reduce_amount_offset >= Decimal::ZERO
                && self.reduce_amount_offset < self.reduce_amount,
            "{}: reduce_amount must be positive and larger than reduce_amount_offset",
            name
        );
        anyhow::ensure!(
            self.emergency_reduce_amount > Decimal::ZERO,
            "{}: emergency_reduce_amount must be positive",
            name
        );

        Ok(())
    }
}

fn is_open_unit_ratio(value: Decimal) -> bool {
    value > Decimal::ZERO && value < Decimal::ONE
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_layer() -> Layer {
    Layer::Layer2
}

fn default_health_check_interval() -> u64 {
    5
}

fn default_no_response_timeout() -> u64 {
    180 // 3 minutes without a block or error event
}

fn default_http_poll_interval() -> u64 {
    2_000
}

fn default_order_check_interval() -> u64 {
    10
}

fn default_leverage() -> Decimal {
    Decimal::new(10, 0) // 10x buying power
}

fn default_adjust_max_gas_price_gwei() -> Decimal {
    Decimal::new(10, 0)
}

fn default_gas_limit() -> u64 {
    5_000_000
}

fn default_max_fee_per_gas_gwei() -> Option<Decimal> {
    Some(Decimal::new(10, 0))
}

fn default_max_priority_fee_per_gas_gwei() -> Option<Decimal> {
    Some(Decimal::new(1, 3)) // 0.001 gwei
}

fn default_max_retry_count() -> u32 {
    5
}

fn default_nonce_retry_backoff() -> u64 {
    200
}

fn default_confirm_timeout() -> u64 {
    120
}

fn default_slippage_samples() -> u32 {
    100
}

fn default_hedge_check_interval() -> u64 {
    30
}

fn default_hedge_order_delay() -> u64 {
    1_000
}

fn default_reduce_check_interval() -> u64 {
    60
}

fn default_emergency_check_interval() -> u64 {
    10
}

fn default_emergency_margin_ratio() -> Decimal {
    Decimal::new(10, 2) // 0.10
}

fn default_emergency_cooldown() -> u64 {
    300
}

fn default_paper_usdc() -> Decimal {
    Decimal::new(10_000, 0)
}

fn default_paper_pool_depth() -> Decimal {
    Decimal::new(1_000_000, 0)
}

fn default_range_offset() -> Decimal {
    Decimal::new(5, 2) // 0.05 = +/-5% around market price
}

fn default_adjust_threshold() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

fn default_target_slippage() -> Decimal {
    Decimal::new(5, 3) // 0.005
}

fn default_max_slippage() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

fn default_max_order_amount() -> Decimal {
    Decimal::new(1_000, 0)
}

fn default_hedge_trigger_ratio() -> Decimal {
    Decimal::new(10, 2) // 0.10
}

fn default_max_hedge_order_size() -> Decimal {
    Decimal::new(1, 0)
}

fn default_reduce_trigger_spread_min() -> Decimal {
    Decimal::new(5, 3) // 0.005
}

fn default_reduce_trigger_spread_max() -> Decimal {
    Decimal::new(5, 2) // 0.05
}

fn default_reduce_amount() -> Decimal {
    Decimal::new(100, 0)
}

fn default_reduce_amount_offset() -> Decimal {
    Decimal::new(20, 0)
}

fn default_emergency_reduce_amount() -> Decimal {
    Decimal::new(500, 0)
}

impl Config {
    /// Load configuration from environment variables and an optional config file.
    pub fn load(path: Option<&str>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name(path.unwrap_or("config")).required(path.is_some()))
            .add_source(config::Environment::default().separator("__").prefix("PMAKER"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.trader.address.is_empty(), "trader.address is required");
        anyhow::ensure!(
            !self.trader.vault.is_empty() && !self.trader.collateral_token.is_empty(),
            "trader.vault and trader.collateral_token are required"
        );

        anyhow::ensure!(
            self.maker.leverage >= Decimal::ONE,
            "maker.leverage must be >= 1"
        );
        anyhow::ensure!(
            self.maker.order_check_interval_secs > 0
                && self.hedge.check_interval_secs > 0
                && self.reduce.check_interval_secs > 0
                && self.emergency.check_interval_secs > 0,
            "poll intervals must be positive"
        );
        anyhow::ensure!(self.maker.slippage_samples > 0, "maker.slippage_samples must be positive");

        anyhow::ensure!(
            self.chain.health_check_interval_secs > 0
                && self.chain.no_response_timeout_secs > self.chain.health_check_interval_secs,
            "chain.no_response_timeout_secs must exceed chain.health_check_interval_secs"
        );

        anyhow::ensure!(
            is_open_unit_ratio(self.emergency.margin_ratio_threshold)
                && is_open_unit_ratio(self.emergency.hedge_margin_ratio_threshold),
            "emergency margin thresholds must be between 0 and 1"
        );

        anyhow::ensure!(
            self.enabled_markets().next().is_some(),
            "at least one enabled market is required"
        );
        for (name, market) in &self.markets {
            market.validate(name)?;
        }

        Ok(())
    }

    /// Enabled markets in name order.
    pub fn enabled_markets(&self) -> impl Iterator<Item = (&String, &MarketConfig)> {
        self.markets.iter().filter(|(_, m)| m.enabled)
    }
}

impl MakerConfig {
    pub fn order_check_interval(&self) -> Duration {
        Duration::from_secs(self.order_check_interval_secs)
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.confirm_timeout_secs)
    }

    pub fn nonce_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.nonce_retry_backoff_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chain: ChainConfig::default(),
            trader: TraderConfig::default(),
            maker: MakerConfig::default(),
            hedge: HedgeConfig::default(),
            reduce: ReduceConfig::default(),
            emergency: EmergencyConfig::default(),
            hedge_venue: HedgeVenueConfig::default(),
            paper: PaperConfig::default(),
            markets: BTreeMap::new(),
        }
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            layer: default_layer(),
            endpoints: Vec::new(),
            health_check_interval_secs: default_health_check_interval(),
            no_response_timeout_secs: default_no_response_timeout(),
            http_poll_interval_ms: default_http_poll_interval(),
        }
    }
}

impl Default for MakerConfig {
    fn default() -> Self {
        Self {
            order_check_interval_secs: default_order_check_interval(),
            leverage: default_leverage(),
            adjust_max_gas_price_gwei: default_adjust_max_gas_price_gwei(),
            gas_limit: default_gas_limit(),
            max_fee_per_gas_gwei: default_max_fee_per_gas_gwei(),
            max_priority_fee_per_gas_gwei: default_max_priority_fee_per_gas_gwei(),
            max_retry_count: default_max_retry_count(),
            nonce_retry_backoff_ms: default_nonce_retry_backoff(),
            confirm_timeout_secs: default_confirm_timeout(),
            slippage_samples: default_slippage_samples(),
        }
    }
}

impl Default for HedgeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            check_interval_secs: default_hedge_check_interval(),
            order_delay_ms: default_hedge_order_delay(),
        }
    }
}

impl Default for ReduceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            check_interval_secs: default_reduce_check_interval(),
        }
    }
}

impl Default for EmergencyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_secs: default_emergency_check_interval(),
            margin_ratio_threshold: default_emergency_margin_ratio(),
            hedge_margin_ratio_threshold: default_emergency_margin_ratio(),
            cooldown_secs: default_emergency_cooldown(),
        }
    }
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            initial_usdc: default_paper_usdc(),
            pool_depth: default_paper_pool_depth(),
            prices: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.trader.address = "0xmaker".to_string();
        config.trader.vault = "0xvault".to_string();
        config.trader.collateral_token = "0xusdc".to_string();
        config.markets.insert(
            "ETH".to_string(),
            MarketConfig::new("0xbase", "0xpool", "ETH-PERP", dec!(1000)),
        );
        config
    }

    #[test]
    fn test_default_config_with_market_is_valid() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_missing_trader_is_rejected() {
        let mut config = valid_config();
        config.trader.address.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ratio_outside_unit_interval_is_rejected() {
        let mut config = valid_config();
        config.markets.get_mut("ETH").unwrap().adjust_threshold = dec!(1.2);
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("adjust_threshold"), "{}", err);
    }

    #[test]
    fn test_threshold_wider_than_range_is_rejected() {
        let mut config = valid_config();
        let eth = config.markets.get_mut("ETH").unwrap();
        eth.range_offset = dec!(0.05);
        eth.adjust_threshold = dec!(0.06);
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("smaller than range_offset"), "{}", err);

        config.markets.get_mut("ETH").unwrap().adjust_threshold = dec!(0.05);
        assert!(config.validate().is_err());

        config.markets.get_mut("ETH").unwrap().adjust_threshold = dec!(0.049);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_no_enabled_market_is_rejected() {
        let mut config = valid_config();
        config.markets.get_mut("ETH").unwrap().enabled = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_market_key_is_rejected() {
        let raw = r#"{
            "base_token": "0xbase",
            "pool": "0xpool",
            "hedge_market": "ETH-PERP",
            "liquidity_amount": "1000",
            "liquidity_multiplier": "2"
        }"#;
        assert!(serde_json::from_str::<MarketConfig>(raw).is_err());
    }

    #[test]
    fn test_market_defaults_fill_in() {
        let raw = r#"{
            "base_token": "0xbase",
            "pool": "0xpool",
            "hedge_market": "ETH-PERP",
            "liquidity_amount": "1000"
        }"#;
        let market: MarketConfig = serde_json::from_str(raw).unwrap();
        assert!(market.enabled);
        assert_eq!(market.range_offset, dec!(0.05));
        assert!(market.validate("ETH").is_ok());
    }
}
