//! Wiring of the processing pipeline from configuration.

use std::sync::Arc;

use anyhow::{Context, Result};
use mailengine_core::{
    ConcurrencyLimiter, DeadLetterMonitor, DeadLetterRecorder, DeadLetterRepository,
    DeduplicatedHandler, DuplicateLedger, EngineConfig, MailEventDispatcher, ProviderRegistry,
    QueueAdapter, SecretChain, Store, TracingAlertSink,
};
use mailengine_providers::{GmailProvider, OutlookProvider, SecretTokenSource, TokenSource, build_client};
use tracing::info;

/// Adapter type the worker drives.
pub type Adapter = QueueAdapter<MailEventDispatcher>;

/// Everything built once at process start.
pub struct Engine {
    /// Effective configuration.
    pub config: EngineConfig,
    /// Queue-boundary adapter over the full pipeline.
    pub adapter: Arc<Adapter>,
    /// Processed-message ledger, for retention.
    pub ledger: DuplicateLedger,
    /// Dead-letter store, for operator commands.
    pub dead_letters: DeadLetterRepository,
}

impl Engine {
    /// Opens the store and assembles providers, limiter, dispatcher, gate and
    /// adapter.
    pub async fn build(config: EngineConfig) -> Result<Self> {
        if let Some(parent) = config.database_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let store = Store::open(&config.database_path.to_string_lossy(), config.busy_timeout())
            .await
            .context("opening database")?;

        let tokens: Arc<dyn TokenSource> = Arc::new(SecretTokenSource::new(SecretChain::system()));
        let client = build_client()?;
        let registry = ProviderRegistry::new()
            .with(Arc::new(GmailProvider::with_client(
                client.clone(),
                &config.gmail_api_base,
                Arc::clone(&tokens),
            )?))
            .with(Arc::new(OutlookProvider::with_client(
                client,
                &config.graph_api_base,
                tokens,
            )?));

        let limiter = Arc::new(ConcurrencyLimiter::new(config.max_concurrency_per_provider));
        let dispatcher = MailEventDispatcher::new(Arc::new(registry), limiter);

        let ledger = DuplicateLedger::new(store.pool().clone());
        let dead_letters = DeadLetterRepository::new(store.pool().clone());
        let adapter = QueueAdapter::new(
            DeduplicatedHandler::new(dispatcher, ledger.clone())
                .with_claim_lease(config.claim_lease()),
            DeadLetterRecorder::new(dead_letters.clone()),
            Arc::new(TracingAlertSink),
        )
        .with_max_delivery_attempts(config.max_delivery_attempts);

        info!(
            database = %config.database_path.display(),
            max_concurrency = config.max_concurrency_per_provider,
            "Engine ready"
        );

        Ok(Self {
            config,
            adapter: Arc::new(adapter),
            ledger,
            dead_letters,
        })
    }

    /// Dead-letter monitor on the configured interval.
    pub fn monitor(&self) -> DeadLetterMonitor<TracingAlertSink> {
        DeadLetterMonitor::new(
            self.dead_letters.clone(),
            TracingAlertSink,
            self.config.dlq_monitor_interval(),
        )
    }
}
