//! Periodic dead-letter backlog monitoring and operator alerts.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::model::TopicBacklog;
use super::repository::DeadLetterRepository;
use crate::event::MailEvent;
use crate::{Error, Result};

/// Destination for operator alerts.
pub trait AlertSink: Send + Sync {
    /// Reports a non-empty dead-letter backlog.
    fn dead_letter_backlog(&self, report: &DlqReport);

    /// Reports that an event failed on credentials and needs attention.
    fn credential_failure(&self, event: &MailEvent, failure: &Error);
}

impl<T: AlertSink + ?Sized> AlertSink for Arc<T> {
    fn dead_letter_backlog(&self, report: &DlqReport) {
        (**self).dead_letter_backlog(report);
    }

    fn credential_failure(&self, event: &MailEvent, failure: &Error) {
        (**self).credential_failure(event, failure);
    }
}

/// Alert sink that writes alerts to the log at error level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn dead_letter_backlog(&self, report: &DlqReport) {
        for topic in &report.backlog {
            error!(
                topic = %topic.topic,
                count = topic.count,
                latest_failed_at = %topic.latest_failed_at,
                "Dead-letter backlog: {}",
                topic.latest_error
            );
        }
    }

    fn credential_failure(&self, event: &MailEvent, failure: &Error) {
        error!(
            message_id = %event.message_id(),
            provider = %event.provider_type,
            account = %event.user_mail_account_id,
            "Credentials need refreshing: {failure}"
        );
    }
}

/// Result of one backlog check.
#[derive(Debug, Clone)]
pub struct DlqReport {
    /// When the check ran.
    pub checked_at: DateTime<Utc>,
    /// Per-topic backlog; topics without in-DLQ records are absent.
    pub backlog: Vec<TopicBacklog>,
}

impl DlqReport {
    /// Total number of in-DLQ records across topics.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.backlog.iter().map(|t| t.count).sum()
    }

    /// Returns true if nothing is waiting in the DLQ.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.backlog.is_empty()
    }
}

/// Checks the dead-letter backlog and alerts when it is non-empty.
pub struct DeadLetterMonitor<S> {
    repository: DeadLetterRepository,
    sink: S,
    interval: Duration,
}

impl<S: AlertSink> DeadLetterMonitor<S> {
    /// Create a monitor that checks every `interval`.
    #[must_use]
    pub const fn new(repository: DeadLetterRepository, sink: S, interval: Duration) -> Self {
        Self {
            repository,
            sink,
            interval,
        }
    }

    /// Run one check.
    ///
    /// # Errors
    ///
    /// Returns an error if the backlog query fails.
    pub async fn check(&self) -> Result<DlqReport> {
        let report = DlqReport {
            checked_at: Utc::now(),
            backlog: self.repository.backlog_by_topic().await?,
        };

        if report.is_empty() {
            debug!("Dead-letter queue is empty");
        } else {
            self.sink.dead_letter_backlog(&report);
        }
        Ok(report)
    }

    /// Check on every tick until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.check().await {
                        warn!("Dead-letter check failed: {e}");
                    }
                }
            }
        }
        debug!("Dead-letter monitor stopped");
    }
}
