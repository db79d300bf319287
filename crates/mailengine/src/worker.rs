//! Queue host loop: reads deliveries, processes each as its own task and
//! redelivers transient failures with exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use mailengine_core::{
    Delivery, Disposition, DuplicateLedger, EngineConfig, EventHandler, QueueAdapter,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::input::parse_line;

/// How often expired ledger entries are purged.
const RETENTION_INTERVAL: Duration = Duration::from_secs(3600);

/// How a delivery ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    DeadLettered,
    Abandoned,
}

/// Counts of delivery outcomes for one run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    /// Processed, or recognised as already processed.
    pub completed: usize,
    /// Recorded in the dead-letter store.
    pub dead_lettered: usize,
    /// Given up on at shutdown; the queue would redeliver these.
    pub abandoned: usize,
}

/// Drives deliveries through a queue adapter.
pub struct Worker<H> {
    adapter: Arc<QueueAdapter<H>>,
    config: EngineConfig,
}

impl<H: EventHandler + 'static> Worker<H> {
    /// Creates a worker using the configured retry backoff.
    pub const fn new(adapter: Arc<QueueAdapter<H>>, config: EngineConfig) -> Self {
        Self { adapter, config }
    }

    /// Consumes JSON-lines deliveries until end of input or cancellation,
    /// then waits for in-flight deliveries to settle.
    pub async fn run<R: AsyncBufRead + Unpin>(
        &self,
        reader: R,
        cancel: CancellationToken,
    ) -> Result<Summary> {
        let mut lines = reader.lines();
        let mut tasks = JoinSet::new();

        loop {
            let line = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    info!("Shutdown requested, no longer reading input");
                    break;
                }
                line = lines.next_line() => line?,
            };
            let Some(line) = line else {
                debug!("End of input");
                break;
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let delivery = parse_line(line);
            tasks.spawn(deliver(
                Arc::clone(&self.adapter),
                delivery,
                self.config.clone(),
                cancel.clone(),
            ));
        }

        let mut summary = Summary::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Outcome::Completed) => summary.completed += 1,
                Ok(Outcome::DeadLettered) => summary.dead_lettered += 1,
                Ok(Outcome::Abandoned) => summary.abandoned += 1,
                Err(e) => {
                    error!("Delivery task failed: {e}");
                    summary.abandoned += 1;
                }
            }
        }

        info!(
            completed = summary.completed,
            dead_lettered = summary.dead_lettered,
            abandoned = summary.abandoned,
            "Worker finished"
        );
        Ok(summary)
    }
}

async fn deliver<H: EventHandler>(
    adapter: Arc<QueueAdapter<H>>,
    mut delivery: Delivery,
    config: EngineConfig,
    cancel: CancellationToken,
) -> Outcome {
    loop {
        match adapter.process(&delivery, &cancel).await {
            Disposition::Completed => return Outcome::Completed,
            Disposition::DeadLettered(_) => return Outcome::DeadLettered,
            Disposition::Retry(e) => {
                let delay = config.retry_delay(delivery.delivery_count);
                debug!(
                    attempt = delivery.delivery_count,
                    "Redelivering in {delay:?} after: {e}"
                );
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Outcome::Abandoned,
                    () = tokio::time::sleep(delay) => {}
                }
                delivery = delivery.redelivered();
            }
        }
    }
}

/// Purges ledger entries older than the retention window every hour until
/// cancelled.
pub async fn run_retention(
    ledger: DuplicateLedger,
    retention: chrono::Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(RETENTION_INTERVAL);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = ledger.purge_before(Utc::now() - retention).await {
                    warn!("Ledger retention purge failed: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use mailengine_core::{
        DeadLetterRecorder, DeadLetterRepository, DeduplicatedHandler, Error, EventKind,
        MailEvent, ProviderType, SendMail, Store, TracingAlertSink,
    };
    use uuid::Uuid;

    use super::*;

    /// Times out for the first `flaky` calls, then rejects sends to
    /// `bad@example.com` and accepts everything else after `delay`.
    #[derive(Default)]
    struct FakeHandler {
        calls: AtomicUsize,
        flaky: usize,
        delay: Duration,
    }

    #[async_trait]
    impl EventHandler for FakeHandler {
        async fn handle(
            &self,
            event: &MailEvent,
            _cancel: &CancellationToken,
        ) -> mailengine_core::Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.flaky {
                return Err(Error::Timeout("flaky".into()));
            }
            tokio::time::sleep(self.delay).await;
            match &event.kind {
                EventKind::Send(SendMail { to, .. }) if to == "bad@example.com" => {
                    Err(Error::ProviderRejected {
                        status: 400,
                        message: "invalid recipient".into(),
                    })
                }
                _ => Ok(()),
            }
        }
    }

    async fn worker(handler: Arc<FakeHandler>) -> (Worker<Arc<FakeHandler>>, DeadLetterRepository) {
        worker_over(Store::in_memory().await.unwrap(), handler)
    }

    fn worker_over(
        store: Store,
        handler: Arc<FakeHandler>,
    ) -> (Worker<Arc<FakeHandler>>, DeadLetterRepository) {
        let dead_letters = DeadLetterRepository::new(store.pool().clone());
        let adapter = QueueAdapter::new(
            DeduplicatedHandler::new(handler, DuplicateLedger::new(store.pool().clone())),
            DeadLetterRecorder::new(dead_letters.clone()),
            Arc::new(TracingAlertSink),
        );
        let config = EngineConfig {
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 5,
            max_delivery_attempts: 3,
            ..Default::default()
        };
        let adapter = adapter.with_max_delivery_attempts(config.max_delivery_attempts);
        (Worker::new(Arc::new(adapter), config), dead_letters)
    }

    fn line(event: &MailEvent) -> String {
        serde_json::to_string(event).unwrap()
    }

    #[tokio::test]
    async fn test_processes_lines_and_deduplicates() {
        let (worker, dead_letters) = worker(Arc::default()).await;
        let ok = MailEvent::send(ProviderType::Gmail, Uuid::new_v4(), "to@example.com", "s", "b");
        let bad = MailEvent::send(ProviderType::Gmail, Uuid::new_v4(), "bad@example.com", "s", "b");
        let input = format!("{}\n\n{}\n{}\nnot json\n", line(&ok), line(&ok), line(&bad));

        let summary = worker
            .run(input.as_bytes(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.completed, 2);
        assert_eq!(summary.dead_lettered, 2);
        assert_eq!(summary.abandoned, 0);
        assert_eq!(dead_letters.list_by_status(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_transient_failures_are_redelivered() {
        let handler = Arc::new(FakeHandler {
            flaky: 2,
            ..Default::default()
        });
        let (worker, dead_letters) = worker(Arc::clone(&handler)).await;
        let event = MailEvent::read_inbox(ProviderType::Outlook, Uuid::new_v4());
        let input = format!("{}\n", line(&event));

        let summary = worker
            .run(input.as_bytes(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.completed, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert!(dead_letters.list_by_status(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_deliveries_on_file_database_all_complete() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("mailengine.db");
        let store = Store::open(&path.to_string_lossy(), Duration::from_secs(5))
            .await
            .unwrap();
        let handler = Arc::new(FakeHandler {
            delay: Duration::from_millis(100),
            ..Default::default()
        });
        let (worker, dead_letters) = worker_over(store, Arc::clone(&handler));

        let input: String = (0..12)
            .map(|_| line(&MailEvent::read_inbox(ProviderType::Gmail, Uuid::new_v4())) + "\n")
            .collect();

        let summary = worker
            .run(input.as_bytes(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.completed, 12);
        assert_eq!(summary.dead_lettered, 0);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 12);
        assert!(dead_letters.list_by_status(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lines_split_across_reads() {
        let (worker, _) = worker(Arc::default()).await;
        let event = line(&MailEvent::read_inbox(ProviderType::Gmail, Uuid::new_v4()));
        let (head, tail) = event.split_at(event.len() / 2);
        let mock = tokio_test::io::Builder::new()
            .read(head.as_bytes())
            .read(tail.as_bytes())
            .read(b"\n")
            .build();

        let summary = worker
            .run(tokio::io::BufReader::new(mock), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.completed, 1);
    }

    #[tokio::test]
    async fn test_cancelled_run_reads_nothing() {
        let (worker, _) = worker(Arc::default()).await;
        let event = MailEvent::read_inbox(ProviderType::Gmail, Uuid::new_v4());
        let input = format!("{}\n", line(&event));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = worker.run(input.as_bytes(), cancel).await.unwrap();
        assert_eq!(summary, Summary::default());
    }
}
