//! Deduplication in front of an event handler.
//!
//! Each delivery goes through three short steps against the ledger:
//!
//! 1. claim: in one `BEGIN IMMEDIATE` transaction, look the event up by
//!    message ID, then by idempotency key, and insert a pending entry if
//!    neither matched;
//! 2. run the inner handler with no transaction open;
//! 3. mark the claim processed on success, or delete it on failure.
//!
//! A processed match is reported as [`GateOutcome::AlreadyProcessed`]. A
//! pending match means another delivery of the same logical event is in
//! flight and yields [`Error::InFlight`], which the host retries later. A
//! pending claim older than the lease is treated as abandoned and taken
//! over. The unique constraints on the ledger back all of this across
//! processes sharing the database.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqliteConnection;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::dispatch::EventHandler;
use crate::event::MailEvent;
use crate::ledger::{ClaimState, DuplicateLedger, InsertOutcome, LedgerEntry};
use crate::{Error, Result};

/// Default age after which a pending claim counts as abandoned.
pub const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(300);

/// What the gate did with a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    /// The inner handler ran and the ledger entry was marked processed.
    Processed,
    /// The event was already in the ledger; the inner handler did not run.
    AlreadyProcessed,
}

enum Claim {
    Taken,
    Processed,
    InFlight,
}

/// Wraps an [`EventHandler`] with at-most-once execution per logical event.
pub struct DeduplicatedHandler<H> {
    inner: H,
    ledger: DuplicateLedger,
    lease: chrono::Duration,
}

impl<H: EventHandler> DeduplicatedHandler<H> {
    /// Wraps `inner`, recording processed events in `ledger`.
    #[must_use]
    pub fn new(inner: H, ledger: DuplicateLedger) -> Self {
        Self {
            inner,
            ledger,
            lease: lease_of(DEFAULT_CLAIM_LEASE),
        }
    }

    /// Sets how long a pending claim is honoured before it may be taken
    /// over. It must exceed the longest handler call.
    #[must_use]
    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.lease = lease_of(lease);
        self
    }

    /// Returns the wrapped handler.
    #[must_use]
    pub const fn inner(&self) -> &H {
        &self.inner
    }

    /// Handles the event and reports whether it was a duplicate.
    ///
    /// # Errors
    ///
    /// Returns the inner handler's error unchanged, [`Error::InFlight`] while
    /// another delivery holds the claim, a database error, or
    /// [`Error::Cancelled`].
    #[instrument(
        skip_all,
        fields(message_id = %event.message_id(), kind = event.kind.tag())
    )]
    pub async fn process(&self, event: &MailEvent, cancel: &CancellationToken) -> Result<GateOutcome> {
        // Dropping the claim transaction on cancellation rolls it back.
        let claim = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            claim = self.claim(event) => claim?,
        };
        let message_id = event.message_id().to_string();

        match claim {
            Claim::Taken => {}
            Claim::Processed => return Ok(GateOutcome::AlreadyProcessed),
            Claim::InFlight => {
                debug!("Message is claimed by a delivery in flight");
                return Err(Error::InFlight(message_id));
            }
        }

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            result = self.inner.handle(event, cancel) => result,
        };

        match result {
            Ok(()) => {
                if let Err(e) = self.ledger.complete(&message_id).await {
                    error!("Handler succeeded but the ledger claim was not completed: {e}");
                    return Err(e);
                }
                info!("Message processed");
                Ok(GateOutcome::Processed)
            }
            Err(e) => {
                if let Err(release) = self.ledger.release(self.ledger.pool(), &message_id).await {
                    warn!("Failed to release ledger claim: {release}");
                }
                debug!("Handler failed, ledger claim released: {e}");
                Err(e)
            }
        }
    }

    async fn claim(&self, event: &MailEvent) -> Result<Claim> {
        // IMMEDIATE takes the write lock up front, so concurrent claims wait
        // on the busy timeout instead of failing a read-to-write upgrade.
        let mut tx = self.ledger.pool().begin_with("BEGIN IMMEDIATE").await?;
        let message_id = event.message_id().to_string();

        let by_id = self.ledger.find_by_message_id(&mut tx, &message_id).await?;
        if let Some(claim) = self.settle(&mut tx, by_id).await? {
            tx.commit().await?;
            return Ok(claim);
        }

        let by_key = self
            .ledger
            .find_by_idempotency_key(&mut tx, event.idempotency_key())
            .await?;
        if let Some(claim) = self.settle(&mut tx, by_key).await? {
            if matches!(claim, Claim::Processed) {
                debug!(
                    idempotency_key = event.idempotency_key(),
                    "Duplicate message skipped by idempotency key"
                );
            }
            tx.commit().await?;
            return Ok(claim);
        }

        let claim = if self.ledger.insert(&mut tx, &LedgerEntry::claim(event)).await?
            == InsertOutcome::Duplicate
        {
            debug!("Concurrent delivery claimed this message first");
            Claim::Processed
        } else {
            Claim::Taken
        };
        tx.commit().await?;
        Ok(claim)
    }

    /// Decides what an existing entry means for this delivery. Returns
    /// `None` when the delivery may go on to claim the event.
    async fn settle(
        &self,
        conn: &mut SqliteConnection,
        existing: Option<LedgerEntry>,
    ) -> Result<Option<Claim>> {
        let Some(entry) = existing else {
            return Ok(None);
        };

        match entry.state {
            ClaimState::Processed => {
                debug!(existing = %entry.message_id, "Duplicate message skipped");
                Ok(Some(Claim::Processed))
            }
            ClaimState::Pending if entry.is_stale(self.lease, Utc::now()) => {
                warn!(
                    existing = %entry.message_id,
                    claimed_at = %entry.processed_at,
                    "Taking over abandoned ledger claim"
                );
                self.ledger.release(&mut *conn, &entry.message_id).await?;
                Ok(None)
            }
            ClaimState::Pending => Ok(Some(Claim::InFlight)),
        }
    }
}

fn lease_of(lease: Duration) -> chrono::Duration {
    chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::days(365))
}

#[async_trait]
impl<H: EventHandler> EventHandler for DeduplicatedHandler<H> {
    async fn handle(&self, event: &MailEvent, cancel: &CancellationToken) -> Result<()> {
        self.process(event, cancel).await.map(|_| ())
    }
}
