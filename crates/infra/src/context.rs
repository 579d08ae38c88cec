//! Shared handles for every pipeline component.
//!
//! Components never reach for globals: each one is constructed from a
//! `PipelineContext` and clones the handles it needs.

use std::sync::Arc;

use augur_ai::{CounterStore, HttpSummarizer, InMemoryCounterStore, RateLimiter, SingleFlight, Summarizer};
use augur_core::Clock;
use tokio::runtime::Handle;
use tracing::{info, warn};

use crate::config::{PipelineConfig, StorageBackend};
use crate::error::SetupError;
use crate::jobs::{DeadLetterStore, InMemoryDeadLetterStore, InMemoryJobStore, JobStore, RetryPolicy};
use crate::orders::{InMemoryOrderStore, OrderDispatcher, OrderStore};
use crate::postgres::PgBackend;
use crate::queue::{InMemoryReportStore, PriorityIndex, ReportStore, SimulationQuota};
use crate::settings::{InMemorySettingsStore, SettingsStore};

/// Every store the pipeline persists through.
#[derive(Clone)]
pub struct StoreSet {
    pub orders: Arc<dyn OrderStore>,
    pub jobs: Arc<dyn JobStore>,
    pub dead_letters: Arc<dyn DeadLetterStore>,
    pub counters: Arc<dyn CounterStore>,
    pub reports: Arc<dyn ReportStore>,
    pub settings: Arc<dyn SettingsStore>,
}

impl StoreSet {
    /// Process-local stores. Nothing survives a restart.
    pub fn in_memory(config: &PipelineConfig) -> Self {
        Self {
            orders: InMemoryOrderStore::arc(),
            jobs: InMemoryJobStore::arc(),
            dead_letters: Arc::new(InMemoryDeadLetterStore::new(config.dead_letter.capacity)),
            counters: Arc::new(InMemoryCounterStore::new()),
            reports: Arc::new(InMemoryReportStore::new()),
            settings: Arc::new(InMemorySettingsStore::new()),
        }
    }

    /// Stores selected by `config.storage`. Postgres calls are driven on `handle`.
    ///
    /// With a Redis URL the rate-limit counters move to Redis; the rest stay
    /// on the chosen backend.
    pub fn connect(config: &PipelineConfig, handle: &Handle) -> Result<Self, SetupError> {
        let mut stores = match config.storage.backend {
            StorageBackend::Memory => {
                warn!("using in-memory stores; queue state is lost on restart");
                Self::in_memory(config)
            }
            StorageBackend::Postgres => {
                let url = config.storage.require_database_url()?;
                PgBackend::connect(url, config.storage.max_connections, handle.clone())?.stores(config)
            }
        };
        if let Some(url) = config.storage.redis_url.as_deref() {
            stores.counters = redis_counters(url)?;
            info!("rate-limit counters stored in redis");
        }
        Ok(stores)
    }
}

#[cfg(feature = "redis")]
fn redis_counters(url: &str) -> Result<Arc<dyn CounterStore>, SetupError> {
    Ok(Arc::new(crate::redis_counters::RedisCounterStore::new(url)?))
}

#[cfg(not(feature = "redis"))]
fn redis_counters(_url: &str) -> Result<Arc<dyn CounterStore>, SetupError> {
    Err(SetupError::Config(crate::config::ConfigError::Invalid {
        key: "AUGUR_REDIS_URL".to_string(),
        value: "<redacted>".to_string(),
        reason: "built without the `redis` feature".to_string(),
    }))
}

#[derive(Clone)]
pub struct PipelineContext {
    pub orders: Arc<dyn OrderStore>,
    pub jobs: Arc<dyn JobStore>,
    pub dead_letters: Arc<dyn DeadLetterStore>,
    pub reports: Arc<dyn ReportStore>,
    pub settings: Arc<dyn SettingsStore>,
    pub limiter: Arc<RateLimiter>,
    pub summarizer: Arc<dyn Summarizer>,
    pub index: Arc<PriorityIndex>,
    pub simulation: Arc<SimulationQuota>,
    pub clock: Arc<dyn Clock>,
    pub config: Arc<PipelineConfig>,
}

impl PipelineContext {
    pub fn new(
        config: PipelineConfig,
        stores: StoreSet,
        summarizer: Arc<dyn Summarizer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            orders: stores.orders,
            jobs: stores.jobs,
            dead_letters: stores.dead_letters,
            reports: stores.reports,
            settings: stores.settings,
            limiter: Arc::new(RateLimiter::new(stores.counters, config.rate_limit.limits())),
            summarizer,
            index: Arc::new(PriorityIndex::new()),
            simulation: Arc::new(SimulationQuota::new(
                config.simulation.max_per_window,
                config.simulation_window(),
            )),
            clock,
            config: Arc::new(config),
        }
    }

    /// In-memory stores around the given summarizer and clock.
    pub fn in_memory(
        config: PipelineConfig,
        summarizer: Arc<dyn Summarizer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let stores = StoreSet::in_memory(&config);
        Self::new(config, stores, summarizer, clock)
    }

    /// The HTTP model client behind a single-flight gate. Fails without an API key.
    pub fn with_http_summarizer(
        config: PipelineConfig,
        stores: StoreSet,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SetupError> {
        let client_config = config.enrichment.require_client_config()?;
        let client = HttpSummarizer::new(client_config)?;
        Ok(Self::new(config, stores, Arc::new(SingleFlight::new(client)), clock))
    }

    pub fn dispatcher(&self) -> OrderDispatcher {
        OrderDispatcher::new(self.orders.clone())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_config(&self.config.retry)
    }
}
