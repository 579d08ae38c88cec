use std::sync::Arc;

use anyhow::Context;
use tokio::runtime::{Handle, Runtime};
use tracing::info;

use augur_core::{Clock, SystemClock};
use augur_infra::{PipelineConfig, PipelineContext, SetupError, StoreSet, Workers};

/// Stores from `AUGUR_STORAGE`, plus the model client. No API key, no worker.
fn build_context(config: PipelineConfig, handle: &Handle, clock: Arc<dyn Clock>) -> Result<PipelineContext, SetupError> {
    let client_config = config.enrichment.require_client_config()?;
    info!(
        base_url = %client_config.base_url,
        model = %client_config.model,
        storage = ?config.storage.backend,
        "using model endpoint"
    );
    let stores = StoreSet::connect(&config, handle)?;
    PipelineContext::with_http_summarizer(config, stores, clock)
}

fn runtime() -> anyhow::Result<Runtime> {
    // Drives the Postgres pool and waits for Ctrl-C. Blocking model calls run
    // on the ticker threads.
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .context("failed to build the tokio runtime")
}

fn main() -> anyhow::Result<()> {
    augur_observability::init();

    let config = PipelineConfig::from_env().context("invalid AUGUR_* configuration")?;
    let runtime = runtime()?;
    let ctx = build_context(config, runtime.handle(), Arc::new(SystemClock))
        .context("failed to start the augur worker")?;

    let workers = Workers::spawn_all(&ctx).context("failed to spawn tick workers")?;
    info!(workers = workers.len(), "augur worker running");

    runtime
        .block_on(tokio::signal::ctrl_c())
        .context("failed to listen for Ctrl-C")?;

    info!("shutdown requested, stopping workers");
    workers.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use augur_infra::{ConfigError, StorageBackend};

    fn memory_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.storage.backend = StorageBackend::Memory;
        config
    }

    #[test]
    fn missing_key_refuses_to_start() {
        let rt = runtime().unwrap();
        let err = build_context(memory_config(), rt.handle(), Arc::new(SystemClock))
            .err()
            .unwrap();
        assert!(matches!(err, SetupError::Config(ConfigError::Missing { ref key }) if key == "AUGUR_MODEL_API_KEY"));
    }

    #[test]
    fn configured_key_builds_http_client() {
        let rt = runtime().unwrap();
        let mut config = memory_config();
        config.enrichment.api_key = Some("sk-test".to_string());
        assert!(build_context(config, rt.handle(), Arc::new(SystemClock)).is_ok());
    }

    #[test]
    fn postgres_backend_requires_a_database_url() {
        let rt = runtime().unwrap();
        let mut config = PipelineConfig::default();
        config.enrichment.api_key = Some("sk-test".to_string());
        let err = build_context(config, rt.handle(), Arc::new(SystemClock)).err().unwrap();
        assert_eq!(err.to_string(), "AUGUR_DATABASE_URL must be set");
    }
}
