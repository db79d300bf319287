//! Ledger data model.

use std::fmt;

use chrono::{DateTime, Duration, Utc};

use crate::event::MailEvent;

/// Whether the side effect of a ledger entry has happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClaimState {
    /// A delivery has claimed the event and is running its handler.
    Pending,
    /// The handler succeeded.
    Processed,
}

impl ClaimState {
    /// Stored string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processed => "processed",
        }
    }

    /// Parses the stored string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processed" => Some(Self::Processed),
            _ => None,
        }
    }
}

impl fmt::Display for ClaimState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One claimed or processed event identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    /// Message ID of the event.
    pub message_id: String,
    /// Idempotency key of the event, if it had one.
    pub idempotency_key: Option<String>,
    /// Event kind tag.
    pub event_type: String,
    /// Claim state.
    pub state: ClaimState,
    /// When the entry last changed state.
    pub processed_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Builds a pending claim on `event`, taken now.
    #[must_use]
    pub fn claim(event: &MailEvent) -> Self {
        Self {
            message_id: event.message_id().to_string(),
            idempotency_key: event.idempotency_key().map(str::to_owned),
            event_type: event.kind.tag().to_owned(),
            state: ClaimState::Pending,
            processed_at: Utc::now(),
        }
    }

    /// Returns true for a pending claim older than `lease`.
    ///
    /// Such a claim belongs to a delivery that died mid-flight and may be
    /// taken over.
    #[must_use]
    pub fn is_stale(&self, lease: Duration, now: DateTime<Utc>) -> bool {
        self.state == ClaimState::Pending && self.processed_at + lease < now
    }
}
