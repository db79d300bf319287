//! End-to-end tests of the processing pipeline over an in-memory store.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use mailengine_core::{
    ConcurrencyLimiter, DeadLetterRecorder, DeadLetterRepository, DeduplicatedHandler, Delivery,
    Disposition, DuplicateLedger, Error, FailedMessageStatus, MailEvent, MailEventDispatcher,
    MailProvider, ProviderRegistry, ProviderType, QueueAdapter, Result, SendMail, Store,
    TracingAlertSink,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Default)]
struct CountingProvider {
    sends: AtomicUsize,
    reads: AtomicUsize,
    reject_recipient: Option<&'static str>,
}

#[async_trait]
impl MailProvider for CountingProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Gmail
    }

    async fn send(&self, _event: &MailEvent, mail: &SendMail) -> Result<()> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        if self.reject_recipient == Some(mail.to.as_str()) {
            return Err(Error::ProviderRejected {
                status: 400,
                message: format!("invalid recipient {}", mail.to),
            });
        }
        Ok(())
    }

    async fn read_inbox(&self, _event: &MailEvent) -> Result<()> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Pipeline {
    adapter: QueueAdapter<MailEventDispatcher>,
    ledger: DuplicateLedger,
    dead_letters: DeadLetterRepository,
}

async fn pipeline(provider: Arc<CountingProvider>) -> Pipeline {
    let store = Store::in_memory().await.unwrap();
    let ledger = DuplicateLedger::new(store.pool().clone());
    let dead_letters = DeadLetterRepository::new(store.pool().clone());

    let dispatcher = MailEventDispatcher::new(
        Arc::new(ProviderRegistry::new().with(provider)),
        Arc::new(ConcurrencyLimiter::new(2)),
    );
    let adapter = QueueAdapter::new(
        DeduplicatedHandler::new(dispatcher, ledger.clone()),
        DeadLetterRecorder::new(dead_letters.clone()),
        Arc::new(TracingAlertSink),
    );

    Pipeline {
        adapter,
        ledger,
        dead_letters,
    }
}

#[tokio::test]
async fn redelivered_event_is_dispatched_once() {
    let provider = Arc::new(CountingProvider::default());
    let p = pipeline(Arc::clone(&provider)).await;
    let cancel = CancellationToken::new();

    let event = MailEvent::send(ProviderType::Gmail, Uuid::new_v4(), "to@example.com", "Hi", "<p>hi</p>");
    let delivery = Delivery::for_event(&event).unwrap();

    assert!(p.adapter.process(&delivery, &cancel).await.is_completed());
    let entry = p
        .ledger
        .get(&event.message_id().to_string())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.idempotency_key, None);

    let redelivery = delivery.redelivered();
    assert!(p.adapter.process(&redelivery, &cancel).await.is_completed());

    assert_eq!(provider.sends.load(Ordering::SeqCst), 1);
    assert_eq!(p.ledger.count().await.unwrap(), 1);
}

#[tokio::test]
async fn shared_idempotency_key_is_dispatched_once() {
    let provider = Arc::new(CountingProvider::default());
    let p = pipeline(Arc::clone(&provider)).await;
    let cancel = CancellationToken::new();
    let account = Uuid::new_v4();

    let first = MailEvent::read_inbox(ProviderType::Gmail, account).with_idempotency_key("K1");
    let second = MailEvent::read_inbox(ProviderType::Gmail, account).with_idempotency_key("K1");

    for event in [&first, &second] {
        let delivery = Delivery::for_event(event).unwrap();
        assert!(p.adapter.process(&delivery, &cancel).await.is_completed());
    }

    assert_eq!(provider.reads.load(Ordering::SeqCst), 1);
    let entry = p
        .ledger
        .get(&first.message_id().to_string())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.idempotency_key.as_deref(), Some("K1"));
    assert!(
        p.ledger
            .get(&second.message_id().to_string())
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn rejected_send_is_dead_lettered_and_replayable() {
    let provider = Arc::new(CountingProvider {
        reject_recipient: Some("bad@example.com"),
        ..Default::default()
    });
    let p = pipeline(Arc::clone(&provider)).await;
    let cancel = CancellationToken::new();

    let event = MailEvent::send(ProviderType::Gmail, Uuid::new_v4(), "bad@example.com", "Hi", "x");
    let disposition = p
        .adapter
        .process(&Delivery::for_event(&event).unwrap(), &cancel)
        .await;
    assert!(matches!(
        disposition,
        Disposition::DeadLettered(Error::ProviderRejected { status: 400, .. })
    ));
    assert_eq!(p.ledger.count().await.unwrap(), 0);

    let records = p
        .dead_letters
        .list_by_status(Some(FailedMessageStatus::InDlq))
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].message_id, event.message_id().to_string());
    assert_eq!(records[0].topic, "mail-send");
    assert_eq!(records[0].subscription, "gmail");

    // Still rejected on replay: a fresh record is written, the original waits.
    let replayed = p.adapter.replay(records[0].id, &cancel).await.unwrap();
    assert!(matches!(replayed, Disposition::DeadLettered(_)));
    let original = p.dead_letters.get(records[0].id).await.unwrap().unwrap();
    assert_eq!(original.status, FailedMessageStatus::ManualRetryPending);
    assert_eq!(provider.sends.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn unknown_kind_is_dead_lettered_without_dispatch() {
    let provider = Arc::new(CountingProvider::default());
    let p = pipeline(Arc::clone(&provider)).await;

    let body = format!(
        r#"{{"message_id":"{}","provider_type":"gmail","user_mail_account_id":"{}","kind":"archive"}}"#,
        Uuid::new_v4(),
        Uuid::new_v4()
    );
    let disposition = p
        .adapter
        .process(&Delivery::new("mail-send", "gmail", body), &CancellationToken::new())
        .await;

    assert!(matches!(
        disposition,
        Disposition::DeadLettered(Error::UnsupportedEventKind(ref kind)) if kind == "archive"
    ));
    assert_eq!(provider.sends.load(Ordering::SeqCst), 0);
    assert_eq!(p.dead_letters.list_by_status(None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn third_acquire_waits_for_a_release() {
    let limiter = Arc::new(ConcurrencyLimiter::new(2));

    let first = limiter.acquire(ProviderType::Gmail).await.unwrap();
    let _second = limiter.acquire(ProviderType::Gmail).await.unwrap();
    assert_eq!(limiter.available(ProviderType::Gmail), Some(0));

    let third = {
        let limiter = Arc::clone(&limiter);
        tokio::spawn(async move { limiter.acquire(ProviderType::Gmail).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!third.is_finished());

    drop(first);
    let permit = tokio::time::timeout(Duration::from_secs(1), third)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(permit.provider(), ProviderType::Gmail);
}
