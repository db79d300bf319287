//! Queue-boundary adapter.
//!
//! Decodes a raw delivery, runs it through the deduplication gate and turns
//! the outcome into a disposition for the queue host. This is the only place
//! failures are classified, alerted on and dead-lettered.

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::classify::{HostAction, classify};
use crate::dead_letter::{AlertSink, DeadLetterRecorder};
use crate::dedup::DeduplicatedHandler;
use crate::dispatch::EventHandler;
use crate::error::ErrorKind;
use crate::event::{EventKind, MailEvent};
use crate::{Error, Result};

/// Default number of deliveries before a transient failure is dead-lettered.
pub const DEFAULT_MAX_DELIVERY_ATTEMPTS: u32 = 10;

/// One delivery of a queued message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Queue topic.
    pub topic: String,
    /// Queue subscription.
    pub subscription: String,
    /// Raw payload.
    pub body: String,
    /// 1-based delivery attempt.
    pub delivery_count: u32,
}

impl Delivery {
    /// Creates a first delivery.
    #[must_use]
    pub fn new(
        topic: impl Into<String>,
        subscription: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            subscription: subscription.into(),
            body: body.into(),
            delivery_count: 1,
        }
    }

    /// Creates a first delivery of an event on its own topic, with the
    /// provider name as subscription.
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be serialized.
    pub fn for_event(event: &MailEvent) -> Result<Self> {
        Ok(Self::new(
            event.topic(),
            event.provider_type.as_str(),
            serde_json::to_string(event)?,
        ))
    }

    /// Returns the next delivery of the same message.
    #[must_use]
    pub fn redelivered(&self) -> Self {
        Self {
            delivery_count: self.delivery_count.saturating_add(1),
            ..self.clone()
        }
    }
}

/// What the queue host should do with a delivery.
#[derive(Debug)]
pub enum Disposition {
    /// Processed, or already processed before; acknowledge it.
    Completed,
    /// Failed transiently; redeliver it.
    Retry(Error),
    /// Failed for good; it has been recorded in the dead-letter store.
    DeadLettered(Error),
}

impl Disposition {
    /// Returns true for [`Disposition::Completed`].
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Decodes a raw payload into an event.
///
/// # Errors
///
/// Returns [`Error::MalformedPayload`] for invalid JSON or a structurally
/// invalid event, and [`Error::UnsupportedEventKind`] for an unknown kind tag.
pub fn parse_event(body: &str) -> Result<MailEvent> {
    let value: Value =
        serde_json::from_str(body).map_err(|e| Error::MalformedPayload(e.to_string()))?;

    if let Some(tag) = value.get("kind").and_then(Value::as_str)
        && !EventKind::TAGS.contains(&tag)
    {
        return Err(Error::UnsupportedEventKind(tag.to_string()));
    }

    serde_json::from_value(value).map_err(|e| Error::MalformedPayload(e.to_string()))
}

/// Adapts queue deliveries to the processing pipeline.
pub struct QueueAdapter<H> {
    gate: DeduplicatedHandler<H>,
    recorder: DeadLetterRecorder,
    alerts: Arc<dyn AlertSink>,
    max_delivery_attempts: u32,
}

impl<H: EventHandler> QueueAdapter<H> {
    /// Creates an adapter with the default delivery budget.
    #[must_use]
    pub fn new(
        gate: DeduplicatedHandler<H>,
        recorder: DeadLetterRecorder,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            gate,
            recorder,
            alerts,
            max_delivery_attempts: DEFAULT_MAX_DELIVERY_ATTEMPTS,
        }
    }

    /// Sets how many deliveries a transiently failing message gets.
    #[must_use]
    pub const fn with_max_delivery_attempts(mut self, attempts: u32) -> Self {
        self.max_delivery_attempts = attempts;
        self
    }

    /// Returns the dead-letter recorder.
    #[must_use]
    pub const fn recorder(&self) -> &DeadLetterRecorder {
        &self.recorder
    }

    /// Processes one delivery.
    #[instrument(
        skip_all,
        fields(topic = %delivery.topic, subscription = %delivery.subscription, attempt = delivery.delivery_count)
    )]
    pub async fn process(&self, delivery: &Delivery, cancel: &CancellationToken) -> Disposition {
        let event = match parse_event(&delivery.body) {
            Ok(event) => event,
            Err(e) => return self.fail(delivery, None, e).await,
        };

        match self.gate.process(&event, cancel).await {
            Ok(_) => Disposition::Completed,
            Err(e) => self.fail(delivery, Some(&event), e).await,
        }
    }

    /// Replays a dead-lettered message.
    ///
    /// The record moves to manual-retry-pending, its stored payload is
    /// processed as a first delivery, and it is resolved if that completes.
    /// A record left pending by a replay that did not complete can be
    /// replayed again.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] or [`Error::InvalidTransition`] if the
    /// record is unknown or already resolved, or a database error.
    pub async fn replay(&self, id: Uuid, cancel: &CancellationToken) -> Result<Disposition> {
        let repository = self.recorder.repository();
        let record = repository.mark_manual_retry_pending(id).await?;

        let delivery = Delivery::new(&record.topic, &record.subscription, &record.message_content);
        let disposition = self.process(&delivery, cancel).await;

        if disposition.is_completed() {
            repository.resolve(id).await?;
            info!("Replayed dead-letter record {id}");
        } else {
            warn!("Replay of dead-letter record {id} did not complete: {disposition:?}");
        }
        Ok(disposition)
    }

    async fn fail(&self, delivery: &Delivery, event: Option<&MailEvent>, failure: Error) -> Disposition {
        let kind = failure.kind();
        if kind == ErrorKind::Cancelled {
            return Disposition::Retry(failure);
        }

        let decision = classify(kind);
        match decision.action {
            HostAction::DeadLetterAndAlert => {
                if let Some(event) = event {
                    self.alerts.credential_failure(event, &failure);
                }
            }
            HostAction::RetryAndInvestigate => {
                error!("Unclassified failure: {}", failure.trace());
            }
            HostAction::DeadLetter | HostAction::Retry => {}
        }

        if decision.is_permanent() {
            warn!("Permanent failure: {failure}");
        } else if delivery.delivery_count >= self.max_delivery_attempts {
            warn!(
                "Retry budget of {} deliveries exhausted: {failure}",
                self.max_delivery_attempts
            );
        } else {
            warn!("Transient failure, will retry: {failure}");
            return Disposition::Retry(failure);
        }

        self.recorder
            .record(&delivery.topic, &delivery.subscription, &delivery.body, &failure)
            .await;
        Disposition::DeadLettered(failure)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::dead_letter::{DeadLetterRepository, DlqReport, FailedMessageStatus};
    use crate::event::ProviderType;
    use crate::ledger::DuplicateLedger;
    use crate::store::Store;

    /// Fails with the queued errors in order, then succeeds.
    #[derive(Default)]
    struct ScriptedHandler {
        failures: Mutex<Vec<Error>>,
        calls: AtomicUsize,
    }

    impl ScriptedHandler {
        fn failing(failures: Vec<Error>) -> Self {
            Self {
                failures: Mutex::new(failures),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl EventHandler for ScriptedHandler {
        async fn handle(&self, _event: &MailEvent, _cancel: &CancellationToken) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut failures = self.failures.lock().unwrap();
            if failures.is_empty() {
                Ok(())
            } else {
                Err(failures.remove(0))
            }
        }
    }

    #[derive(Default)]
    struct RecordingAlerts {
        credential_failures: AtomicUsize,
    }

    impl AlertSink for RecordingAlerts {
        fn dead_letter_backlog(&self, _report: &DlqReport) {}

        fn credential_failure(&self, _event: &MailEvent, _failure: &Error) {
            self.credential_failures.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        adapter: QueueAdapter<ScriptedHandler>,
        alerts: Arc<RecordingAlerts>,
        repository: DeadLetterRepository,
    }

    async fn fixture(handler: ScriptedHandler) -> Fixture {
        let store = Store::in_memory().await.unwrap();
        let repository = DeadLetterRepository::new(store.pool().clone());
        let alerts = Arc::new(RecordingAlerts::default());
        let adapter = QueueAdapter::new(
            DeduplicatedHandler::new(handler, DuplicateLedger::new(store.pool().clone())),
            DeadLetterRecorder::new(repository.clone()),
            Arc::clone(&alerts) as Arc<dyn AlertSink>,
        )
        .with_max_delivery_attempts(3);
        Fixture {
            adapter,
            alerts,
            repository,
        }
    }

    fn send_delivery() -> Delivery {
        let event = MailEvent::send(ProviderType::Gmail, Uuid::new_v4(), "a@b.c", "Hi", "body");
        Delivery::for_event(&event).unwrap()
    }

    #[test]
    fn test_parse_event_errors() {
        assert!(matches!(parse_event("{not json"), Err(Error::MalformedPayload(_))));
        assert!(matches!(
            parse_event(r#"{"kind":"archive","provider_type":"gmail"}"#),
            Err(Error::UnsupportedEventKind(ref k)) if k == "archive"
        ));
        assert!(matches!(
            parse_event(r#"{"kind":"send","provider_type":"gmail"}"#),
            Err(Error::MalformedPayload(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_message_id_is_dead_lettered_not_regenerated() {
        let f = fixture(ScriptedHandler::default()).await;
        let cancel = CancellationToken::new();
        let body = format!(
            r#"{{"provider_type":"gmail","user_mail_account_id":"{}","kind":"read_inbox"}}"#,
            Uuid::new_v4()
        );
        let delivery = Delivery::new("mail-read", "gmail", body);

        let first = f.adapter.process(&delivery, &cancel).await;
        let second = f.adapter.process(&delivery.redelivered(), &cancel).await;

        assert!(matches!(first, Disposition::DeadLettered(Error::MalformedPayload(_))));
        assert!(matches!(second, Disposition::DeadLettered(Error::MalformedPayload(_))));
        assert_eq!(f.adapter.gate.inner().calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_delivery_for_event_uses_topic_and_provider() {
        let event = MailEvent::read_inbox(ProviderType::Outlook, Uuid::nil());
        let delivery = Delivery::for_event(&event).unwrap();
        assert_eq!(delivery.topic, "mail-read");
        assert_eq!(delivery.subscription, "outlook");
        assert_eq!(delivery.delivery_count, 1);
        assert_eq!(delivery.redelivered().delivery_count, 2);
        assert_eq!(parse_event(&delivery.body).unwrap(), event);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dead_lettered() {
        let f = fixture(ScriptedHandler::default()).await;
        let delivery = Delivery::new("mail-send", "gmail", "{\"kind\":");

        let disposition = f.adapter.process(&delivery, &CancellationToken::new()).await;
        assert!(matches!(disposition, Disposition::DeadLettered(Error::MalformedPayload(_))));
        assert_eq!(f.adapter.gate.inner().calls.load(Ordering::SeqCst), 0);

        let records = f.repository.list_by_status(None).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message_content, "{\"kind\":");
    }

    #[tokio::test]
    async fn test_transient_failure_retries_until_budget_exhausted() {
        let failures = (0..5).map(|_| Error::Timeout("gmail".into())).collect();
        let f = fixture(ScriptedHandler::failing(failures)).await;
        let cancel = CancellationToken::new();

        let mut delivery = send_delivery();
        for _ in 0..2 {
            let disposition = f.adapter.process(&delivery, &cancel).await;
            assert!(matches!(disposition, Disposition::Retry(Error::Timeout(_))));
            delivery = delivery.redelivered();
        }

        let disposition = f.adapter.process(&delivery, &cancel).await;
        assert!(matches!(disposition, Disposition::DeadLettered(Error::Timeout(_))));
        assert_eq!(f.repository.list_by_status(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_credential_failure_alerts_and_dead_letters() {
        let f = fixture(ScriptedHandler::failing(vec![Error::CredentialFailure(
            "token expired".into(),
        )]))
        .await;

        let disposition = f
            .adapter
            .process(&send_delivery(), &CancellationToken::new())
            .await;

        assert!(matches!(disposition, Disposition::DeadLettered(Error::CredentialFailure(_))));
        assert_eq!(f.alerts.credential_failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_delivery_is_retried_without_dead_lettering() {
        let f = fixture(ScriptedHandler::default()).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut delivery = send_delivery();
        delivery.delivery_count = 3;
        let disposition = f.adapter.process(&delivery, &cancel).await;

        assert!(matches!(disposition, Disposition::Retry(Error::Cancelled)));
        assert!(f.repository.list_by_status(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replay_resolves_record_on_success() {
        let f = fixture(ScriptedHandler::failing(vec![Error::ProviderRejected {
            status: 400,
            message: "bad".into(),
        }]))
        .await;
        let cancel = CancellationToken::new();

        let disposition = f.adapter.process(&send_delivery(), &cancel).await;
        assert!(matches!(disposition, Disposition::DeadLettered(_)));
        let record = f.repository.list_by_status(None).await.unwrap().remove(0);

        let disposition = f.adapter.replay(record.id, &cancel).await.unwrap();
        assert!(disposition.is_completed());

        let record = f.repository.get(record.id).await.unwrap().unwrap();
        assert_eq!(record.status, FailedMessageStatus::Resolved);
        assert_eq!(record.retry_count, 1);
        assert_eq!(f.adapter.gate.inner().calls.load(Ordering::SeqCst), 2);

        let err = f.adapter.replay(record.id, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_replay_left_pending_can_be_replayed_again() {
        let f = fixture(ScriptedHandler::failing(vec![
            Error::ProviderRejected {
                status: 400,
                message: "bad".into(),
            },
            Error::Timeout("gmail".into()),
        ]))
        .await;
        let cancel = CancellationToken::new();

        f.adapter.process(&send_delivery(), &cancel).await;
        let record = f.repository.list_by_status(None).await.unwrap().remove(0);

        let disposition = f.adapter.replay(record.id, &cancel).await.unwrap();
        assert!(matches!(disposition, Disposition::Retry(Error::Timeout(_))));
        let pending = f.repository.get(record.id).await.unwrap().unwrap();
        assert_eq!(pending.status, FailedMessageStatus::ManualRetryPending);

        let disposition = f.adapter.replay(record.id, &cancel).await.unwrap();
        assert!(disposition.is_completed());
        let resolved = f.repository.get(record.id).await.unwrap().unwrap();
        assert_eq!(resolved.status, FailedMessageStatus::Resolved);
        assert_eq!(resolved.retry_count, 2);
    }
}
