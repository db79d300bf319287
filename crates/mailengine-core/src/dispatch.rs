//! Event dispatch.
//!
//! The dispatcher takes a concurrency slot for the event's provider,
//! resolves the provider capability and invokes exactly one provider
//! operation chosen by the event kind. It never retries and never
//! reclassifies provider errors.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::event::{EventKind, MailEvent};
use crate::limiter::ConcurrencyLimiter;
use crate::provider::ProviderResolver;
use crate::{Error, Result};

/// Something that handles a single mail event.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handles the event, stopping early if `cancel` fires.
    async fn handle(&self, event: &MailEvent, cancel: &CancellationToken) -> Result<()>;
}

#[async_trait]
impl<T: EventHandler + ?Sized> EventHandler for Arc<T> {
    async fn handle(&self, event: &MailEvent, cancel: &CancellationToken) -> Result<()> {
        (**self).handle(event, cancel).await
    }
}

/// Routes events to provider capabilities under per-provider throttling.
pub struct MailEventDispatcher {
    providers: Arc<dyn ProviderResolver>,
    limiter: Arc<ConcurrencyLimiter>,
}

impl MailEventDispatcher {
    /// Creates a dispatcher over a resolver and a shared limiter.
    #[must_use]
    pub fn new(providers: Arc<dyn ProviderResolver>, limiter: Arc<ConcurrencyLimiter>) -> Self {
        Self { providers, limiter }
    }

    async fn invoke(&self, event: &MailEvent) -> Result<()> {
        let provider = self.providers.get(event.provider_type)?;
        match &event.kind {
            EventKind::Send(mail) => provider.send(event, mail).await,
            EventKind::ReadInbox => provider.read_inbox(event).await,
        }
    }
}

#[async_trait]
impl EventHandler for MailEventDispatcher {
    #[instrument(
        skip_all,
        fields(message_id = %event.message_id(), provider = %event.provider_type, kind = event.kind.tag())
    )]
    async fn handle(&self, event: &MailEvent, cancel: &CancellationToken) -> Result<()> {
        let _permit = self
            .limiter
            .acquire_cancellable(event.provider_type, cancel)
            .await?;
        debug!("Dispatching event");

        // Dropping `_permit` at scope exit returns the slot on every path,
        // including when the select below abandons the provider call.
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            result = self.invoke(event) => result,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use uuid::Uuid;

    use super::*;
    use crate::event::{ProviderType, SendMail};
    use crate::provider::{MailProvider, ProviderRegistry};

    #[derive(Default)]
    struct RecordingProvider {
        calls: Mutex<Vec<&'static str>>,
        fail_with_timeout: bool,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl MailProvider for RecordingProvider {
        fn provider_type(&self) -> ProviderType {
            ProviderType::Gmail
        }

        async fn send(&self, _event: &MailEvent, _mail: &SendMail) -> Result<()> {
            self.calls.lock().unwrap().push("send");
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_with_timeout {
                return Err(Error::Timeout("gmail".into()));
            }
            Ok(())
        }

        async fn read_inbox(&self, _event: &MailEvent) -> Result<()> {
            self.calls.lock().unwrap().push("read_inbox");
            Ok(())
        }
    }

    fn dispatcher(provider: Arc<RecordingProvider>, limiter: Arc<ConcurrencyLimiter>) -> MailEventDispatcher {
        let registry = ProviderRegistry::new().with(provider);
        MailEventDispatcher::new(Arc::new(registry), limiter)
    }

    #[tokio::test]
    async fn test_routes_by_event_kind() {
        let provider = Arc::new(RecordingProvider::default());
        let limiter = Arc::new(ConcurrencyLimiter::new(2));
        let dispatcher = dispatcher(Arc::clone(&provider), limiter);
        let cancel = CancellationToken::new();

        let send = MailEvent::send(ProviderType::Gmail, Uuid::nil(), "a@b.c", "s", "b");
        let read = MailEvent::read_inbox(ProviderType::Gmail, Uuid::nil());
        dispatcher.handle(&send, &cancel).await.unwrap();
        dispatcher.handle(&read, &cancel).await.unwrap();

        assert_eq!(*provider.calls.lock().unwrap(), vec!["send", "read_inbox"]);
    }

    #[tokio::test]
    async fn test_provider_error_propagates_and_releases_permit() {
        let provider = Arc::new(RecordingProvider {
            fail_with_timeout: true,
            ..Default::default()
        });
        let limiter = Arc::new(ConcurrencyLimiter::new(2));
        let dispatcher = dispatcher(provider, Arc::clone(&limiter));

        let event = MailEvent::send(ProviderType::Gmail, Uuid::nil(), "a@b.c", "s", "b");
        let err = dispatcher
            .handle(&event, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Timeout(ref m) if m == "gmail"));
        assert_eq!(limiter.available(ProviderType::Gmail), Some(2));
    }

    #[tokio::test]
    async fn test_unknown_provider_releases_permit() {
        let provider = Arc::new(RecordingProvider::default());
        let limiter = Arc::new(ConcurrencyLimiter::new(1));
        let dispatcher = dispatcher(provider, Arc::clone(&limiter));

        let event = MailEvent::read_inbox(ProviderType::Outlook, Uuid::nil());
        let err = dispatcher
            .handle(&event, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::UnknownProvider(ProviderType::Outlook)));
        assert_eq!(limiter.available(ProviderType::Outlook), Some(1));
    }

    #[tokio::test]
    async fn test_cancellation_during_call_releases_permit() {
        let provider = Arc::new(RecordingProvider {
            delay: Some(Duration::from_secs(60)),
            ..Default::default()
        });
        let limiter = Arc::new(ConcurrencyLimiter::new(1));
        let dispatcher = Arc::new(dispatcher(provider, Arc::clone(&limiter)));
        let cancel = CancellationToken::new();

        let task = {
            let dispatcher = Arc::clone(&dispatcher);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let event = MailEvent::send(ProviderType::Gmail, Uuid::nil(), "a@b.c", "s", "b");
                dispatcher.handle(&event, &cancel).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(limiter.available(ProviderType::Gmail), Some(0));

        cancel.cancel();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(limiter.available(ProviderType::Gmail), Some(1));
    }

    #[tokio::test]
    async fn test_concurrent_dispatches_respect_limit() {
        struct Gauge {
            current: AtomicUsize,
            peak: AtomicUsize,
        }

        #[async_trait]
        impl MailProvider for Gauge {
            fn provider_type(&self) -> ProviderType {
                ProviderType::Outlook
            }

            async fn send(&self, _event: &MailEvent, _mail: &SendMail) -> Result<()> {
                Ok(())
            }

            async fn read_inbox(&self, _event: &MailEvent) -> Result<()> {
                let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.current.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let gauge = Arc::new(Gauge {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let registry = ProviderRegistry::new().with(Arc::clone(&gauge) as Arc<dyn MailProvider>);
        let dispatcher = Arc::new(MailEventDispatcher::new(
            Arc::new(registry),
            Arc::new(ConcurrencyLimiter::new(3)),
        ));

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let dispatcher = Arc::clone(&dispatcher);
                tokio::spawn(async move {
                    let event = MailEvent::read_inbox(ProviderType::Outlook, Uuid::nil());
                    dispatcher.handle(&event, &CancellationToken::new()).await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert!(gauge.peak.load(Ordering::SeqCst) <= 3);
    }
}
