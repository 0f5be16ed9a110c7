//! Configuration management for the margin liquidator.
//!
//! Loads settings from environment variables and config files.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Ledger gateway connection and sender account
    #[serde(default)]
    pub ledger: LedgerConfig,
    /// Producer/consumer pipeline parameters
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Gas budgeting for closure submissions
    #[serde(default)]
    pub gas: GasConfig,
    /// Lock, marker and queue backend
    #[serde(default)]
    pub coordination: CoordinationConfig,
    /// Closure journal persistence
    #[serde(default)]
    pub journal: JournalConfig,
    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Base URL of the ledger gateway
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,
    /// Network name appended to the gateway URL
    #[serde(default = "default_network")]
    pub network: String,
    /// Account used as transaction sender (0x-hex)
    #[serde(default)]
    pub sender: String,
    /// API key for write requests
    #[serde(default)]
    pub api_key: String,
    /// Secret used to sign write requests
    #[serde(default)]
    pub api_secret: String,
    /// HTTP request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Interval between confirmation polls
    #[serde(default = "default_confirmation_poll")]
    pub confirmation_poll_ms: u64,
    /// Give up waiting for confirmation after this long
    #[serde(default = "default_confirmation_timeout")]
    pub confirmation_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Positions fetched per page
    #[serde(default = "default_page_size")]
    pub page_size: u64,
    /// Requests observed more than this many blocks ago are stale
    #[serde(default = "default_max_blocks_delay")]
    pub max_blocks_delay: u64,
    /// Concurrent consumer workers per process
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Dedup marker lifetime; must outlive the longest retry chain
    #[serde(default = "default_marker_ttl")]
    pub marker_ttl_secs: u64,
    /// Processing lock TTL for the producer's check-then-enqueue
    #[serde(default = "default_producer_lock_ttl")]
    pub producer_lock_ttl_ms: u64,
    /// Processing lock TTL for consumer marker updates
    #[serde(default = "default_consumer_lock_ttl")]
    pub consumer_lock_ttl_ms: u64,
    /// Attempts to acquire the processing lock before giving up
    #[serde(default = "default_lock_retry_count")]
    pub lock_retry_count: u32,
    /// Delay between lock acquisition attempts
    #[serde(default = "default_lock_retry_delay")]
    pub lock_retry_delay_ms: u64,
    /// Smallest closure amount worth retrying after resource exhaustion
    #[serde(default = "default_min_close_amount")]
    pub min_close_amount: u128,
    /// Idle time between sweeps (0 = start the next sweep immediately)
    #[serde(default)]
    pub sweep_interval_ms: u64,
    /// Back-off after a failed sweep
    #[serde(default = "default_error_backoff")]
    pub error_backoff_ms: u64,
    /// How long a worker blocks on an empty queue
    #[serde(default = "default_dequeue_wait")]
    pub dequeue_wait_ms: u64,
    /// Unacknowledged deliveries older than this go back on the queue
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_secs: u64,
    /// How often the reaper looks for expired deliveries
    #[serde(default = "default_reap_interval")]
    pub reap_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GasConfig {
    /// Price quoted by the fixed oracle (smallest fee unit)
    #[serde(default = "default_gas_price")]
    pub default_gas_price: u128,
    /// Multiplier applied to the oracle price
    #[serde(default = "default_fee_multiplier")]
    pub fee_multiplier: Decimal,
    /// Headroom added on top of the gas estimate (0.20 = +20%)
    #[serde(default = "default_limit_buffer")]
    pub limit_buffer: Decimal,
    /// Hard cap on the gas limit, also used when estimation fails
    #[serde(default = "default_max_gas_limit")]
    pub max_gas_limit: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinationBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    #[serde(default = "default_backend")]
    pub backend: CoordinationBackend,
    /// Redis connection URL (required for the redis backend)
    #[serde(default)]
    pub redis_url: String,
    /// Prefix for lock, marker and queue keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalConfig {
    #[serde(default = "default_journal_enabled")]
    pub enabled: bool,
    #[serde(default = "default_journal_path")]
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_directory")]
    pub directory: String,
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

// Default value functions
fn default_gateway_url() -> String {
    "http://127.0.0.1:8545".to_string()
}

fn default_network() -> String {
    "development".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_confirmation_poll() -> u64 {
    1_000
}

fn default_confirmation_timeout() -> u64 {
    600
}

fn default_page_size() -> u64 {
    50
}

fn default_max_blocks_delay() -> u64 {
    5
}

fn default_workers() -> usize {
    4
}

fn default_marker_ttl() -> u64 {
    20_000
}

fn default_producer_lock_ttl() -> u64 {
    250
}

fn default_consumer_lock_ttl() -> u64 {
    100
}

fn default_lock_retry_count() -> u32 {
    10
}

fn default_lock_retry_delay() -> u64 {
    200
}

fn default_min_close_amount() -> u128 {
    1
}

fn default_error_backoff() -> u64 {
    1_000
}

fn default_dequeue_wait() -> u64 {
    1_000
}

fn default_visibility_timeout() -> u64 {
    600
}

fn default_reap_interval() -> u64 {
    30_000
}

fn default_gas_price() -> u128 {
    5_000_000_000 // 5 gwei
}

fn default_fee_multiplier() -> Decimal {
    Decimal::ONE
}

fn default_limit_buffer() -> Decimal {
    Decimal::new(20, 2) // 0.20
}

fn default_max_gas_limit() -> u64 {
    10_000_000
}

fn default_backend() -> CoordinationBackend {
    CoordinationBackend::Memory
}

fn default_key_prefix() -> String {
    "liq".to_string()
}

fn default_journal_enabled() -> bool {
    true
}

fn default_journal_path() -> String {
    "data/closures.db".to_string()
}

fn default_log_directory() -> String {
    "logs".to_string()
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("MLQ"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.pipeline.page_size > 0, "page_size must be positive");

        anyhow::ensure!(self.pipeline.workers > 0, "workers must be positive");

        anyhow::ensure!(
            self.pipeline.min_close_amount > 0,
            "min_close_amount must be positive"
        );

        anyhow::ensure!(
            self.pipeline.visibility_timeout_secs > 0 && self.pipeline.reap_interval_ms > 0,
            "visibility_timeout_secs and reap_interval_ms must be positive"
        );

        anyhow::ensure!(
            self.gas.fee_multiplier > Decimal::ZERO,
            "fee_multiplier must be positive"
        );

        anyhow::ensure!(
            self.gas.limit_buffer >= Decimal::ZERO,
            "limit_buffer must not be negative"
        );

        anyhow::ensure!(
            self.coordination.backend != CoordinationBackend::Redis
                || !self.coordination.redis_url.is_empty(),
            "redis backend requires coordination.redis_url"
        );

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ledger: LedgerConfig::default(),
            pipeline: PipelineConfig::default(),
            gas: GasConfig::default(),
            coordination: CoordinationConfig::default(),
            journal: JournalConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            gateway_url: default_gateway_url(),
            network: default_network(),
            sender: String::new(),
            api_key: String::new(),
            api_secret: String::new(),
            request_timeout_secs: default_request_timeout(),
            confirmation_poll_ms: default_confirmation_poll(),
            confirmation_timeout_secs: default_confirmation_timeout(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            max_blocks_delay: default_max_blocks_delay(),
            workers: default_workers(),
            marker_ttl_secs: default_marker_ttl(),
            producer_lock_ttl_ms: default_producer_lock_ttl(),
            consumer_lock_ttl_ms: default_consumer_lock_ttl(),
            lock_retry_count: default_lock_retry_count(),
            lock_retry_delay_ms: default_lock_retry_delay(),
            min_close_amount: default_min_close_amount(),
            sweep_interval_ms: 0,
            error_backoff_ms: default_error_backoff(),
            dequeue_wait_ms: default_dequeue_wait(),
            visibility_timeout_secs: default_visibility_timeout(),
            reap_interval_ms: default_reap_interval(),
        }
    }
}

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            default_gas_price: default_gas_price(),
            fee_multiplier: default_fee_multiplier(),
            limit_buffer: default_limit_buffer(),
            max_gas_limit: default_max_gas_limit(),
        }
    }
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            redis_url: String::new(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            enabled: default_journal_enabled(),
            path: default_journal_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_log_directory(),
            json: false,
        }
    }
}
