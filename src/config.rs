//! Runtime settings.
//!
//! Loaded from an optional TOML file and `RENTAL_`-prefixed environment
//! variables (`RENTAL_SCHEDULER__INTERVAL_SECS=30`). Every field has a
//! default, so an empty source yields a working configuration.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub trigger: TriggerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
}

impl Settings {
    /// Load from `path` (if given and present) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }
        let settings = builder
            .add_source(Environment::with_prefix("RENTAL").separator("__"))
            .build()?;
        let settings: Self = settings.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.interval_secs == 0 {
            return Err(ConfigError::Message(
                "scheduler.interval_secs must be positive".to_string(),
            ));
        }
        if self.scheduler.batch_size == 0 {
            return Err(ConfigError::Message(
                "scheduler.batch_size must be positive".to_string(),
            ));
        }
        if self.trigger.group_size == 0 {
            return Err(ConfigError::Message(
                "trigger.group_size must be positive".to_string(),
            ));
        }
        if self.queue.capacity == 0 {
            return Err(ConfigError::Message("queue.capacity must be positive".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_balance_cache_ttl_ms")]
    pub balance_cache_ttl_ms: u64,
}

impl LedgerConfig {
    pub fn balance_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.balance_cache_ttl_ms)
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            balance_cache_ttl_ms: default_balance_cache_ttl_ms(),
        }
    }
}

fn default_balance_cache_ttl_ms() -> u64 {
    5_000
}

/// Unit prices in minor units, keyed by `"<variant>.<service>"` or by
/// variant alone for a variant-wide price.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct PricingConfig {
    #[serde(default)]
    pub prices: HashMap<String, i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default)]
    pub jitter_pct: f64,
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            self.base_delay_ms,
            self.max_delay_ms,
            self.jitter_pct,
        )
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_pct: 0.0,
        }
    }
}

fn default_max_attempts() -> usize {
    3
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    2_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Sessions examined per variant per tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// A gap between ticks longer than this forces a full scan.
    #[serde(default = "default_missed_tick_threshold_secs")]
    pub missed_tick_threshold_secs: u64,
    /// After an empty scan, skip querying for this long.
    #[serde(default = "default_idle_cooldown_secs")]
    pub idle_cooldown_secs: u64,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn missed_tick_threshold(&self) -> Duration {
        Duration::from_secs(self.missed_tick_threshold_secs)
    }

    pub fn idle_cooldown(&self) -> Duration {
        Duration::from_secs(self.idle_cooldown_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            batch_size: default_batch_size(),
            missed_tick_threshold_secs: default_missed_tick_threshold_secs(),
            idle_cooldown_secs: default_idle_cooldown_secs(),
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

fn default_interval_secs() -> u64 {
    60
}

fn default_batch_size() -> usize {
    50
}

fn default_missed_tick_threshold_secs() -> u64 {
    180
}

fn default_idle_cooldown_secs() -> u64 {
    120
}

fn default_cache_ttl_secs() -> u64 {
    3_600
}

#[derive(Debug, Clone, Deserialize)]
pub struct TriggerConfig {
    #[serde(default = "default_group_size")]
    pub group_size: usize,
    #[serde(default = "default_group_pause_ms")]
    pub group_pause_ms: u64,
}

impl TriggerConfig {
    pub fn group_pause(&self) -> Duration {
        Duration::from_millis(self.group_pause_ms)
    }
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            group_size: default_group_size(),
            group_pause_ms: default_group_pause_ms(),
        }
    }
}

fn default_group_size() -> usize {
    5
}

fn default_group_pause_ms() -> u64 {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Maximum simultaneously held allocations across all users.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Minimum gap between two allocations by one user.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default = "default_entry_ttl_secs")]
    pub entry_ttl_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl QueueConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn entry_ttl(&self) -> Duration {
        Duration::from_secs(self.entry_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            cooldown_ms: default_cooldown_ms(),
            entry_ttl_secs: default_entry_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_capacity() -> usize {
    20
}

fn default_cooldown_ms() -> u64 {
    3_000
}

fn default_entry_ttl_secs() -> u64 {
    360
}

fn default_sweep_interval_secs() -> u64 {
    60
}
