//! Configuration management for the liquidation shield.
//!
//! Loads settings from an optional `config` file, `SHIELD__*` environment
//! variables, and the flat variable names used by earlier deployments
//! (`ADJUSTMENT_THRESHOLD`, `LTV_LIMIT`, `BINANCE_API_KEY`, ...).

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Minimum seconds between flexible savings redemptions allowed by Binance.
pub const MIN_PATROL_FREQUENCY_SECS: f64 = 3.0;

/// Longest accepted patrol or cooldown interval.
pub const MAX_INTERVAL_SECS: f64 = 3600.0;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Binance API credentials and transport settings
    #[serde(default)]
    pub binance: BinanceConfig,
    /// Patrol cadence and adjustment sizing
    #[serde(default)]
    pub patrol: PatrolConfig,
    /// Capital waterfall settings
    #[serde(default)]
    pub capital: CapitalConfig,
    /// Liveness endpoint
    #[serde(default)]
    pub health: HealthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinanceConfig {
    /// API key for authentication
    #[serde(default)]
    pub api_key: String,
    /// Secret key for signing requests
    #[serde(default)]
    pub secret_key: String,
    /// Use testnet instead of production
    #[serde(default)]
    pub testnet: bool,
    /// Override for the USDⓈ-M futures REST base URL
    #[serde(default)]
    pub futures_base_url: Option<String>,
    /// Override for the spot / SAPI REST base URL
    #[serde(default)]
    pub spot_base_url: Option<String>,
    /// Per-request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Binance `recvWindow` in milliseconds
    #[serde(default = "default_recv_window_ms")]
    pub recv_window_ms: u64,
    /// Attempts for read-only requests that fail in transport
    #[serde(default = "default_get_attempts")]
    pub get_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatrolConfig {
    /// Minimum adjustable amount (after the buffer) before a position is touched
    #[serde(default = "default_adjustment_threshold")]
    pub adjustment_threshold: Decimal,
    /// Seconds between patrol ticks
    #[serde(default = "default_patrol_frequency")]
    pub patrol_frequency_secs: f64,
    /// Seconds to wait after an aborted tick
    #[serde(default = "default_cooldown_period")]
    pub cooldown_period_secs: f64,
    /// Amount held back from every adjustment to absorb price moves mid-tick
    #[serde(default = "default_buffer_amount")]
    pub buffer_amount: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapitalConfig {
    /// Ceiling for the flexible loan LTV when borrowing (0.0-1.0)
    #[serde(default = "default_ltv_limit")]
    pub ltv_limit: Decimal,
    /// Collateral coin backing the flexible loan
    #[serde(default = "default_collateral_asset")]
    pub collateral_asset: String,
    /// Simple Earn flexible product id per settlement asset.
    /// Entries merge over the USDT default; an empty id disables an asset.
    #[serde(default = "default_earn_products")]
    pub earn_products: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Serve `GET /health`
    #[serde(default = "default_health_enabled")]
    pub enabled: bool,
    /// Listen address for the liveness endpoint
    #[serde(default = "default_health_bind")]
    pub bind: String,
}

// Default value functions
fn default_timeout_secs() -> u64 {
    5
}

fn default_recv_window_ms() -> u64 {
    5000
}

fn default_get_attempts() -> u32 {
    1
}

fn default_adjustment_threshold() -> Decimal {
    Decimal::new(3, 0) // 3 USDT
}

fn default_patrol_frequency() -> f64 {
    3.5 // just above the 3s redemption limit
}

fn default_cooldown_period() -> f64 {
    1.0
}

fn default_buffer_amount() -> Decimal {
    Decimal::ONE
}

fn default_ltv_limit() -> Decimal {
    Decimal::new(7, 1) // 0.7
}

fn default_collateral_asset() -> String {
    "BTC".to_string()
}

fn default_earn_products() -> HashMap<String, String> {
    HashMap::from([("USDT".to_string(), "USDT001".to_string())])
}

fn default_health_enabled() -> bool {
    true
}

fn default_health_bind() -> String {
    "0.0.0.0:8080".to_string()
}

/// Flat environment variables honoured on top of the structured sources.
const LEGACY_OVERRIDES: [(&str, &str); 7] = [
    ("ADJUSTMENT_THRESHOLD", "patrol.adjustment_threshold"),
    ("PATROL_FREQUENCY", "patrol.patrol_frequency_secs"),
    ("COOLDOWN_PERIOD", "patrol.cooldown_period_secs"),
    ("BUFFER_AMOUNT", "patrol.buffer_amount"),
    ("LTV_LIMIT", "capital.ltv_limit"),
    ("BINANCE_API_KEY", "binance.api_key"),
    ("BINANCE_SECRET_KEY", "binance.secret_key"),
];

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("SHIELD")
                    .prefix_separator("__")
                    .separator("__"),
            );

        for (var, key) in LEGACY_OVERRIDES {
            if let Ok(value) = std::env::var(var) {
                builder = builder
                    .set_override(key, value)
                    .with_context(|| format!("Invalid override {}", var))?;
            }
        }

        let source = builder.build().context("Failed to build configuration")?;
        Self::from_source(source)
    }

    /// Deserialize an already built source and normalize it.
    pub fn from_source(source: config::Config) -> Result<Self> {
        let mut config: Config = source
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        config.capital.normalize();
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.patrol.adjustment_threshold > Decimal::ZERO,
            "adjustment_threshold must be positive"
        );

        anyhow::ensure!(
            self.patrol.buffer_amount > Decimal::ZERO,
            "buffer_amount must be positive"
        );

        anyhow::ensure!(
            self.patrol.patrol_frequency_secs >= MIN_PATROL_FREQUENCY_SECS,
            "patrol_frequency_secs must be at least {}s (flexible redemption rate limit)",
            MIN_PATROL_FREQUENCY_SECS
        );

        anyhow::ensure!(
            self.patrol.patrol_frequency_secs <= MAX_INTERVAL_SECS,
            "patrol_frequency_secs must be at most {}s",
            MAX_INTERVAL_SECS
        );

        anyhow::ensure!(
            self.patrol.cooldown_period_secs > 0.0
                && self.patrol.cooldown_period_secs <= MAX_INTERVAL_SECS,
            "cooldown_period_secs must be positive and at most {}s",
            MAX_INTERVAL_SECS
        );

        anyhow::ensure!(
            self.capital.ltv_limit > Decimal::ZERO && self.capital.ltv_limit < Decimal::ONE,
            "ltv_limit must be between 0 and 1"
        );

        anyhow::ensure!(
            !self.capital.collateral_asset.is_empty(),
            "collateral_asset must be set"
        );

        anyhow::ensure!(
            self.binance.timeout_secs > 0,
            "binance.timeout_secs must be positive"
        );

        Ok(())
    }
}

impl PatrolConfig {
    /// Interval between ticks; falls back to the default when out of range.
    pub fn patrol_frequency(&self) -> Duration {
        Duration::try_from_secs_f64(self.patrol_frequency_secs)
            .unwrap_or_else(|_| Duration::from_secs_f64(default_patrol_frequency()))
    }

    pub fn cooldown_period(&self) -> Duration {
        Duration::try_from_secs_f64(self.cooldown_period_secs)
            .unwrap_or_else(|_| Duration::from_secs_f64(default_cooldown_period()))
    }
}

impl CapitalConfig {
    /// Uppercase asset keys, fill in default products and drop disabled ones.
    ///
    /// Environment sources deliver map keys lowercased.
    pub fn normalize(&mut self) {
        let mut products: HashMap<String, String> = self
            .earn_products
            .drain()
            .map(|(asset, product)| (asset.to_uppercase(), product.trim().to_string()))
            .collect();

        for (asset, product) in default_earn_products() {
            products.entry(asset).or_insert(product);
        }
        products.retain(|_, product| !product.is_empty());

        self.earn_products = products;
        self.collateral_asset = self.collateral_asset.to_uppercase();
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            binance: BinanceConfig::default(),
            patrol: PatrolConfig::default(),
            capital: CapitalConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for BinanceConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            secret_key: String::new(),
            testnet: false,
            futures_base_url: None,
            spot_base_url: None,
            timeout_secs: default_timeout_secs(),
            recv_window_ms: default_recv_window_ms(),
            get_attempts: default_get_attempts(),
        }
    }
}

impl Default for PatrolConfig {
    fn default() -> Self {
        Self {
            adjustment_threshold: default_adjustment_threshold(),
            patrol_frequency_secs: default_patrol_frequency(),
            cooldown_period_secs: default_cooldown_period(),
            buffer_amount: default_buffer_amount(),
        }
    }
}

impl Default for CapitalConfig {
    fn default() -> Self {
        Self {
            ltv_limit: default_ltv_limit(),
            collateral_asset: default_collateral_asset(),
            earn_products: default_earn_products(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: default_health_enabled(),
            bind: default_health_bind(),
        }
    }
}
