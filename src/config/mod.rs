//! Configuration management for the order scheduler.
//!
//! Loads settings from an optional `config.toml` and `OSCHED__*` environment
//! variables.

use crate::exchange::MarginType;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Binance API credentials
    #[serde(default)]
    pub binance: BinanceConfig,
    /// SQLite store location
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Trigger loop and lease settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Margin mode coordinator settings
    #[serde(default)]
    pub margin: MarginConfig,
    /// Order submission settings
    #[serde(default)]
    pub submission: SubmissionConfig,
    /// Bracket (TP/SL) settings
    #[serde(default)]
    pub bracket: BracketConfig,
    /// Reconciliation settings
    #[serde(default)]
    pub sync: SyncConfig,
    /// Strategies to schedule
    #[serde(default)]
    pub strategies: Vec<StrategyConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
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
    /// Override the REST base URL
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Lifetime of a strategy trigger lease; a crashed worker's lease lapses
    /// after this long
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: u64,
    /// Trigger interval for strategies that don't set their own
    #[serde(default = "default_interval")]
    pub default_interval_secs: u64,
    /// Directory holding `{strategy_id}.json` decision files
    #[serde(default = "default_signals_dir")]
    pub signals_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarginConfig {
    /// Attempts per margin mode change (including the first)
    #[serde(default = "default_margin_retries")]
    pub max_retries: u32,
    /// Linear backoff step between attempts
    #[serde(default = "default_margin_backoff")]
    pub retry_backoff_ms: u64,
    /// Background workers for fire-and-forget attempts
    #[serde(default = "default_margin_workers")]
    pub worker_count: usize,
    /// Queue depth before background attempts are shed
    #[serde(default = "default_margin_queue")]
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionConfig {
    /// Upper bound for any single exchange call
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
    /// Attempts per submission on transient errors
    #[serde(default = "default_submit_retries")]
    pub max_retries: u32,
    #[serde(default = "default_submit_backoff")]
    pub retry_backoff_ms: u64,
    /// How long symbol filters are cached
    #[serde(default = "default_filter_cache")]
    pub filter_cache_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BracketConfig {
    /// Attempts to cancel a sibling leg before the bracket is orphaned
    #[serde(default = "default_cancel_retries")]
    pub cancel_max_retries: u32,
    #[serde(default = "default_cancel_backoff")]
    pub cancel_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Reconciliation pass interval
    #[serde(default = "default_sync_interval")]
    pub interval_secs: u64,
    /// Age after which a pending order the exchange has never seen is
    /// considered never submitted
    #[serde(default = "default_pending_grace")]
    pub pending_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub id: String,
    #[serde(default)]
    pub interval_secs: Option<u64>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Margin mode applied to every symbol this strategy trades
    #[serde(default = "default_margin_mode")]
    pub margin_mode: MarginType,
    /// Leverage used when a decision doesn't carry one
    #[serde(default = "default_leverage")]
    pub leverage: u32,
}

// Default value functions
fn default_db_path() -> String {
    "data/orders.db".to_string()
}

fn default_lease_ttl() -> u64 {
    120
}

fn default_interval() -> u64 {
    60
}

fn default_signals_dir() -> String {
    "signals".to_string()
}

fn default_margin_retries() -> u32 {
    3
}

fn default_margin_backoff() -> u64 {
    200
}

fn default_margin_workers() -> usize {
    4
}

fn default_margin_queue() -> usize {
    64
}

fn default_call_timeout() -> u64 {
    10
}

fn default_submit_retries() -> u32 {
    3
}

fn default_submit_backoff() -> u64 {
    500
}

fn default_filter_cache() -> u64 {
    300
}

fn default_cancel_retries() -> u32 {
    3
}

fn default_cancel_backoff() -> u64 {
    300
}

fn default_sync_interval() -> u64 {
    15
}

fn default_pending_grace() -> u64 {
    120
}

fn default_enabled() -> bool {
    true
}

fn default_margin_mode() -> MarginType {
    MarginType::Isolated
}

fn default_leverage() -> u32 {
    5
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("OSCHED"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.scheduler.default_interval_secs > 0,
            "default_interval_secs must be > 0"
        );

        anyhow::ensure!(self.sync.interval_secs > 0, "sync interval_secs must be > 0");

        anyhow::ensure!(
            self.margin.max_retries >= 1
                && self.submission.max_retries >= 1
                && self.bracket.cancel_max_retries >= 1,
            "retry counts must be >= 1"
        );

        anyhow::ensure!(
            self.margin.worker_count >= 1 && self.margin.queue_capacity >= 1,
            "margin worker_count and queue_capacity must be >= 1"
        );

        anyhow::ensure!(
            self.submission.call_timeout_secs > 0,
            "call_timeout_secs must be > 0"
        );

        anyhow::ensure!(
            self.scheduler.lease_ttl_secs > self.submission.call_timeout_secs,
            "lease_ttl_secs must exceed call_timeout_secs"
        );

        let mut seen = HashSet::new();
        for strategy in &self.strategies {
            anyhow::ensure!(!strategy.id.is_empty(), "strategy id must not be empty");
            anyhow::ensure!(
                seen.insert(strategy.id.as_str()),
                "duplicate strategy id: {}",
                strategy.id
            );
            anyhow::ensure!(
                strategy.leverage >= 1,
                "strategy {} leverage must be >= 1",
                strategy.id
            );
            anyhow::ensure!(
                strategy.interval_secs != Some(0),
                "strategy {} interval_secs must be > 0",
                strategy.id
            );
        }

        Ok(())
    }
}

impl SubmissionConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

impl StrategyConfig {
    pub fn interval(&self, scheduler: &SchedulerConfig) -> Duration {
        Duration::from_secs(
            self.interval_secs
                .unwrap_or(scheduler.default_interval_secs),
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            binance: BinanceConfig {
                testnet: true,
                ..BinanceConfig::default()
            },
            database: DatabaseConfig::default(),
            scheduler: SchedulerConfig::default(),
            margin: MarginConfig::default(),
            submission: SubmissionConfig::default(),
            bracket: BracketConfig::default(),
            sync: SyncConfig::default(),
            strategies: Vec::new(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: default_lease_ttl(),
            default_interval_secs: default_interval(),
            signals_dir: default_signals_dir(),
        }
    }
}

impl Default for MarginConfig {
    fn default() -> Self {
        Self {
            max_retries: default_margin_retries(),
            retry_backoff_ms: default_margin_backoff(),
            worker_count: default_margin_workers(),
            queue_capacity: default_margin_queue(),
        }
    }
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: default_call_timeout(),
            max_retries: default_submit_retries(),
            retry_backoff_ms: default_submit_backoff(),
            filter_cache_secs: default_filter_cache(),
        }
    }
}

impl Default for BracketConfig {
    fn default() -> Self {
        Self {
            cancel_max_retries: default_cancel_retries(),
            cancel_backoff_ms: default_cancel_backoff(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sync_interval(),
            pending_grace_secs: default_pending_grace(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strategy(id: &str) -> StrategyConfig {
        StrategyConfig {
            id: id.to_string(),
            interval_secs: None,
            enabled: true,
            margin_mode: MarginType::Isolated,
            leverage: 5,
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duplicate_strategy_ids_rejected() {
        let mut config = Config::default();
        config.strategies = vec![strategy("alpha"), strategy("alpha")];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_lease_must_outlive_call_timeout() {
        let mut config = Config::default();
        config.scheduler.lease_ttl_secs = 5;
        config.submission.call_timeout_secs = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_strategy_interval_falls_back_to_default() {
        let config = Config::default();
        let mut s = strategy("beta");
        assert_eq!(s.interval(&config.scheduler), Duration::from_secs(60));
        s.interval_secs = Some(15);
        assert_eq!(s.interval(&config.scheduler), Duration::from_secs(15));
    }
}
