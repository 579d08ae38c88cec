//! Configuration loading and representation.
//!
//! Every knob has a default; `from_env` overrides them from `AUGUR_*`
//! variables. Unparseable values are reported, never silently ignored.

use std::time::Duration as StdDuration;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use augur_ai::{ClientConfig, RateLimits};
use augur_core::{Currency, ExchangeRates};
use augur_orders::DEFAULT_MAX_MODIFICATIONS;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },

    #[error("{key} must be set")]
    Missing { key: String },
}

/// Where orders, jobs, dead letters and counters live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Postgres,
    /// Process memory only. Everything is lost on restart.
    Memory,
}

impl core::str::FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown storage backend {other:?}, expected postgres or memory")),
        }
    }
}

/// Persistence settings. URLs may carry credentials and are never serialized or printed.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    #[serde(skip)]
    pub database_url: Option<String>,
    pub max_connections: u32,
    /// Rate counters go to Redis when set (requires the `redis` feature).
    #[serde(skip)]
    pub redis_url: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Postgres,
            database_url: None,
            max_connections: 10,
            redis_url: None,
        }
    }
}

impl core::fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StorageConfig")
            .field("backend", &self.backend)
            .field("database_url", &self.database_url.as_ref().map(|_| "<redacted>"))
            .field("max_connections", &self.max_connections)
            .field("redis_url", &self.redis_url.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl StorageConfig {
    /// The Postgres URL, required unless the memory backend was chosen.
    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| ConfigError::Missing {
                key: "AUGUR_DATABASE_URL".to_string(),
            })
    }
}

/// Periodic queue report and the automatic pickup of the queue head.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportConfig {
    pub interval_secs: u64,
    pub retention_days: i64,
    /// Completed orders averaged into the wait estimate.
    pub wait_sample_size: usize,
    /// Only completions this recent count toward the wait estimate.
    pub wait_window_days: i64,
    pub auto_process_interval_secs: u64,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60 * 60,
            retention_days: 7,
            wait_sample_size: 10,
            wait_window_days: 7,
            auto_process_interval_secs: 5 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub rebuild_interval_secs: u64,
    pub max_modifications: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            rebuild_interval_secs: 2 * 60 * 60,
            max_modifications: DEFAULT_MAX_MODIFICATIONS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub daily_limit: u32,
    pub window_limit: u32,
    pub window_secs: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let limits = RateLimits::default();
        Self {
            daily_limit: limits.daily_limit,
            window_limit: limits.window_limit,
            window_secs: limits.window_seconds,
        }
    }
}

impl RateLimitConfig {
    pub fn limits(&self) -> RateLimits {
        RateLimits {
            daily_limit: self.daily_limit,
            window_limit: self.window_limit,
            window_seconds: self.window_secs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_secs: i64,
    pub max_delay_secs: i64,
    /// Minimum wait after the upstream answers 429.
    pub rate_limited_cooldown_secs: i64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_secs: 60,
            max_delay_secs: 60 * 60,
            rate_limited_cooldown_secs: 15 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterConfig {
    pub capacity: usize,
    pub retention_days: i64,
    pub replay_interval_secs: u64,
    pub replay_batch_size: usize,
    pub cleanup_interval_secs: u64,
    /// How long finished jobs are kept before the cleanup sweep drops them.
    pub succeeded_job_retention_days: i64,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            retention_days: 7,
            replay_interval_secs: 60 * 60,
            replay_batch_size: 10,
            cleanup_interval_secs: 24 * 60 * 60,
            succeeded_job_retention_days: 7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpiryConfig {
    pub payment_ttl_hours: i64,
    pub sweep_interval_secs: u64,
    pub reason: String,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            payment_ttl_hours: 24,
            sweep_interval_secs: 15 * 60,
            reason: "payment window expired".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    pub interval_secs: u64,
    pub batch_size: usize,
    /// An in-flight claim older than this is taken over by the next tick.
    pub visibility_timeout_secs: i64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            batch_size: 5,
            visibility_timeout_secs: 10 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub max_per_window: u32,
    pub window_secs: i64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            max_per_window: 15,
            window_secs: 60 * 60,
        }
    }
}

/// Model endpoint settings. The key is never serialized or printed.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentConfig {
    pub base_url: String,
    pub model: String,
    #[serde(skip)]
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            timeout_secs: 30,
        }
    }
}

impl core::fmt::Debug for EnrichmentConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EnrichmentConfig")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl EnrichmentConfig {
    /// Client settings, or `None` when no API key is configured.
    pub fn client_config(&self) -> Option<ClientConfig> {
        let key = self.api_key.as_deref().filter(|k| !k.trim().is_empty())?;
        let mut config = ClientConfig::new(&self.base_url, key, &self.model);
        config.timeout = StdDuration::from_secs(self.timeout_secs);
        Some(config)
    }

    /// Client settings for a process that must call the model.
    pub fn require_client_config(&self) -> Result<ClientConfig, ConfigError> {
        self.client_config().ok_or_else(|| ConfigError::Missing {
            key: "AUGUR_MODEL_API_KEY".to_string(),
        })
    }
}

/// Root configuration for the whole pipeline.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub queue: QueueConfig,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub dead_letter: DeadLetterConfig,
    pub expiry: ExpiryConfig,
    pub dispatch: DispatchConfig,
    pub simulation: SimulationConfig,
    pub enrichment: EnrichmentConfig,
    pub report: ReportConfig,
    pub storage: StorageConfig,
    pub exchange_rates: ExchangeRates,
}

impl PipelineConfig {
    /// Defaults overridden by process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `AUGUR_*` key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let env = Lookup(&lookup);

        env.parse("AUGUR_REBUILD_INTERVAL_SECS", &mut cfg.queue.rebuild_interval_secs)?;
        env.parse("AUGUR_MAX_MODIFICATIONS", &mut cfg.queue.max_modifications)?;

        env.parse("AUGUR_RATE_DAILY_LIMIT", &mut cfg.rate_limit.daily_limit)?;
        env.parse("AUGUR_RATE_WINDOW_LIMIT", &mut cfg.rate_limit.window_limit)?;
        env.parse("AUGUR_RATE_WINDOW_SECS", &mut cfg.rate_limit.window_secs)?;

        env.parse("AUGUR_RETRY_MAX_ATTEMPTS", &mut cfg.retry.max_attempts)?;
        env.parse("AUGUR_RETRY_BASE_DELAY_SECS", &mut cfg.retry.base_delay_secs)?;
        env.parse("AUGUR_RETRY_MAX_DELAY_SECS", &mut cfg.retry.max_delay_secs)?;
        env.parse("AUGUR_RETRY_RATE_LIMITED_COOLDOWN_SECS", &mut cfg.retry.rate_limited_cooldown_secs)?;

        env.parse("AUGUR_DEAD_LETTER_CAPACITY", &mut cfg.dead_letter.capacity)?;
        env.parse("AUGUR_DEAD_LETTER_RETENTION_DAYS", &mut cfg.dead_letter.retention_days)?;
        env.parse("AUGUR_REPLAY_INTERVAL_SECS", &mut cfg.dead_letter.replay_interval_secs)?;
        env.parse("AUGUR_REPLAY_BATCH_SIZE", &mut cfg.dead_letter.replay_batch_size)?;
        env.parse("AUGUR_CLEANUP_INTERVAL_SECS", &mut cfg.dead_letter.cleanup_interval_secs)?;
        env.parse("AUGUR_JOB_RETENTION_DAYS", &mut cfg.dead_letter.succeeded_job_retention_days)?;

        env.parse("AUGUR_PAYMENT_TTL_HOURS", &mut cfg.expiry.payment_ttl_hours)?;
        env.parse("AUGUR_EXPIRY_SWEEP_INTERVAL_SECS", &mut cfg.expiry.sweep_interval_secs)?;

        env.parse("AUGUR_DISPATCH_INTERVAL_SECS", &mut cfg.dispatch.interval_secs)?;
        env.parse("AUGUR_DISPATCH_BATCH_SIZE", &mut cfg.dispatch.batch_size)?;
        env.parse("AUGUR_DISPATCH_VISIBILITY_TIMEOUT_SECS", &mut cfg.dispatch.visibility_timeout_secs)?;

        env.parse("AUGUR_SIMULATION_MAX_PER_WINDOW", &mut cfg.simulation.max_per_window)?;
        env.parse("AUGUR_SIMULATION_WINDOW_SECS", &mut cfg.simulation.window_secs)?;

        if let Some(url) = env.get("AUGUR_MODEL_BASE_URL") {
            cfg.enrichment.base_url = url;
        }
        if let Some(model) = env.get("AUGUR_MODEL_NAME") {
            cfg.enrichment.model = model;
        }
        cfg.enrichment.api_key = env.get("AUGUR_MODEL_API_KEY");
        env.parse("AUGUR_MODEL_TIMEOUT_SECS", &mut cfg.enrichment.timeout_secs)?;

        env.parse("AUGUR_REPORT_INTERVAL_SECS", &mut cfg.report.interval_secs)?;
        env.parse("AUGUR_REPORT_RETENTION_DAYS", &mut cfg.report.retention_days)?;
        env.parse("AUGUR_AUTO_PROCESS_INTERVAL_SECS", &mut cfg.report.auto_process_interval_secs)?;

        env.parse("AUGUR_STORAGE", &mut cfg.storage.backend)?;
        cfg.storage.database_url = env.get("AUGUR_DATABASE_URL");
        env.parse("AUGUR_DATABASE_MAX_CONNECTIONS", &mut cfg.storage.max_connections)?;
        cfg.storage.redis_url = env.get("AUGUR_REDIS_URL");

        for currency in Currency::ALL {
            if currency == Currency::REFERENCE {
                continue;
            }
            let key = format!("AUGUR_FX_{}", currency.code());
            let mut rate = cfg.exchange_rates.rate(currency).unwrap_or(1.0);
            if env.parse(&key, &mut rate)? {
                cfg.exchange_rates = cfg
                    .exchange_rates
                    .with_rate(currency, rate)
                    .map_err(|e| ConfigError::Invalid {
                        key: key.clone(),
                        value: rate.to_string(),
                        reason: e.to_string(),
                    })?;
            }
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values that would stall or divide by zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn positive(key: &str, ok: bool, value: impl ToString) -> Result<(), ConfigError> {
            if ok {
                Ok(())
            } else {
                Err(ConfigError::Invalid {
                    key: key.to_string(),
                    value: value.to_string(),
                    reason: "must be greater than zero".to_string(),
                })
            }
        }

        positive("AUGUR_RATE_WINDOW_SECS", self.rate_limit.window_secs > 0, self.rate_limit.window_secs)?;
        positive("AUGUR_DISPATCH_BATCH_SIZE", self.dispatch.batch_size > 0, self.dispatch.batch_size)?;
        positive("AUGUR_DISPATCH_INTERVAL_SECS", self.dispatch.interval_secs > 0, self.dispatch.interval_secs)?;
        positive("AUGUR_REBUILD_INTERVAL_SECS", self.queue.rebuild_interval_secs > 0, self.queue.rebuild_interval_secs)?;
        positive("AUGUR_DEAD_LETTER_CAPACITY", self.dead_letter.capacity > 0, self.dead_letter.capacity)?;
        positive("AUGUR_PAYMENT_TTL_HOURS", self.expiry.payment_ttl_hours > 0, self.expiry.payment_ttl_hours)?;
        positive("AUGUR_SIMULATION_WINDOW_SECS", self.simulation.window_secs > 0, self.simulation.window_secs)?;
        positive("AUGUR_RETRY_BASE_DELAY_SECS", self.retry.base_delay_secs > 0, self.retry.base_delay_secs)?;
        positive(
            "AUGUR_DISPATCH_VISIBILITY_TIMEOUT_SECS",
            self.dispatch.visibility_timeout_secs > 0,
            self.dispatch.visibility_timeout_secs,
        )?;
        positive("AUGUR_REPORT_INTERVAL_SECS", self.report.interval_secs > 0, self.report.interval_secs)?;
        positive(
            "AUGUR_AUTO_PROCESS_INTERVAL_SECS",
            self.report.auto_process_interval_secs > 0,
            self.report.auto_process_interval_secs,
        )?;
        positive(
            "AUGUR_DATABASE_MAX_CONNECTIONS",
            self.storage.max_connections > 0,
            self.storage.max_connections,
        )?;
        Ok(())
    }

    /// How long a dispatch tick may hold a job before another tick reclaims it.
    pub fn dispatch_lease(&self) -> Duration {
        Duration::seconds(self.dispatch.visibility_timeout_secs)
    }

    pub fn report_retention(&self) -> Duration {
        Duration::days(self.report.retention_days)
    }

    pub fn payment_ttl(&self) -> Duration {
        Duration::hours(self.expiry.payment_ttl_hours)
    }

    pub fn dead_letter_retention(&self) -> Duration {
        Duration::days(self.dead_letter.retention_days)
    }

    pub fn job_retention(&self) -> Duration {
        Duration::days(self.dead_letter.succeeded_job_retention_days)
    }

    pub fn simulation_window(&self) -> Duration {
        Duration::seconds(self.simulation.window_secs)
    }
}

struct Lookup<'a, F>(&'a F);

impl<F> Lookup<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    /// Overwrite `slot` when `key` is set. Returns whether it was.
    fn parse<T>(&self, key: &str, slot: &mut T) -> Result<bool, ConfigError>
    where
        T: core::str::FromStr,
        T::Err: core::fmt::Display,
    {
        let Some(raw) = self.get(key) else {
            return Ok(false);
        };
        *slot = raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key: key.to_string(),
            value: raw.clone(),
            reason: e.to_string(),
        })?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<PipelineConfig, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        PipelineConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_carry_pipeline_constants() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.rate_limit.daily_limit, 8000);
        assert_eq!(cfg.rate_limit.window_limit, 10);
        assert_eq!(cfg.rate_limit.window_secs, 300);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.dead_letter.capacity, 1000);
        assert_eq!(cfg.dispatch.batch_size, 5);
        assert_eq!(cfg.simulation.max_per_window, 15);
        assert_eq!(cfg.payment_ttl(), Duration::hours(24));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn env_overrides_defaults() {
        let cfg = from_pairs(&[
            ("AUGUR_RATE_WINDOW_LIMIT", "20"),
            ("AUGUR_DISPATCH_BATCH_SIZE", " 8 "),
            ("AUGUR_MODEL_API_KEY", "sk-live"),
            ("AUGUR_FX_USD", "1.4"),
        ])
        .unwrap();

        assert_eq!(cfg.rate_limit.window_limit, 20);
        assert_eq!(cfg.dispatch.batch_size, 8);
        assert_eq!(cfg.enrichment.api_key.as_deref(), Some("sk-live"));
        assert_eq!(cfg.exchange_rates.rate(Currency::Usd), Some(1.4));
        assert!(cfg.enrichment.client_config().is_some());
    }

    #[test]
    fn unparseable_values_are_errors() {
        let err = from_pairs(&[("AUGUR_RETRY_MAX_ATTEMPTS", "three")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "AUGUR_RETRY_MAX_ATTEMPTS"));

        let err = from_pairs(&[("AUGUR_DISPATCH_BATCH_SIZE", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));

        let err = from_pairs(&[("AUGUR_FX_AUD", "-1")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn api_key_is_never_printed_or_serialized() {
        let cfg = from_pairs(&[("AUGUR_MODEL_API_KEY", "sk-very-secret")]).unwrap();
        assert!(!format!("{cfg:?}").contains("sk-very-secret"));
        assert!(!serde_json::to_string(&cfg).unwrap().contains("sk-very-secret"));
    }

    #[test]
    fn no_key_means_no_http_client() {
        let cfg = from_pairs(&[]).unwrap();
        assert!(cfg.enrichment.client_config().is_none());
        assert_eq!(
            cfg.enrichment.require_client_config().unwrap_err(),
            ConfigError::Missing {
                key: "AUGUR_MODEL_API_KEY".to_string()
            }
        );
    }

    #[test]
    fn storage_defaults_to_postgres_and_needs_a_url() {
        let cfg = from_pairs(&[]).unwrap();
        assert_eq!(cfg.storage.backend, StorageBackend::Postgres);
        assert!(matches!(
            cfg.storage.require_database_url(),
            Err(ConfigError::Missing { ref key }) if key == "AUGUR_DATABASE_URL"
        ));

        let cfg = from_pairs(&[
            ("AUGUR_STORAGE", "memory"),
            ("AUGUR_DATABASE_URL", "postgres://augur:hunter2@db/augur"),
            ("AUGUR_REDIS_URL", "redis://:hunter2@cache:6379"),
        ])
        .unwrap();
        assert_eq!(cfg.storage.backend, StorageBackend::Memory);
        assert_eq!(cfg.storage.require_database_url().unwrap(), "postgres://augur:hunter2@db/augur");
        assert!(!format!("{cfg:?}").contains("hunter2"));
        assert!(!serde_json::to_string(&cfg).unwrap().contains("hunter2"));

        let err = from_pairs(&[("AUGUR_STORAGE", "sqlite")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "AUGUR_STORAGE"));
    }

    #[test]
    fn lease_and_report_settings() {
        let cfg = from_pairs(&[("AUGUR_DISPATCH_VISIBILITY_TIMEOUT_SECS", "120")]).unwrap();
        assert_eq!(cfg.dispatch_lease(), Duration::minutes(2));
        assert_eq!(cfg.report_retention(), Duration::days(7));
        assert_eq!(cfg.report.wait_sample_size, 10);

        let err = from_pairs(&[("AUGUR_DISPATCH_VISIBILITY_TIMEOUT_SECS", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }
}
