//! Dead-letter data models.

use std::fmt;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Lifecycle state of a dead-lettered message.
///
/// States only move forward: `InDlq` → `ManualRetryPending` → `Resolved`,
/// or straight from `InDlq` to `Resolved`. A pending record may be retried
/// again while it stays pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailedMessageStatus {
    /// Waiting for an operator.
    InDlq,
    /// An operator asked for the message to be retried.
    ManualRetryPending,
    /// Closed by an operator.
    Resolved,
}

impl FailedMessageStatus {
    /// Returns the stored representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InDlq => "in-dlq",
            Self::ManualRetryPending => "manual-retry-pending",
            Self::Resolved => "resolved",
        }
    }

    /// Parses the stored representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in-dlq" => Some(Self::InDlq),
            "manual-retry-pending" => Some(Self::ManualRetryPending),
            "resolved" => Some(Self::Resolved),
            _ => None,
        }
    }

    /// Returns true if moving to `next` is a forward transition, or another
    /// manual retry of a pending record.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::InDlq, Self::ManualRetryPending | Self::Resolved)
                | (Self::ManualRetryPending, Self::ManualRetryPending | Self::Resolved)
        )
    }
}

impl fmt::Display for FailedMessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a delivery that will not be retried automatically.
#[derive(Debug, Clone)]
pub struct FailedMessage {
    /// Record ID.
    pub id: Uuid,
    /// Message ID of the failed event, or a generated ID when the payload
    /// could not be decoded far enough to read one.
    pub message_id: String,
    /// Queue topic the delivery came from.
    pub topic: String,
    /// Queue subscription the delivery came from.
    pub subscription: String,
    /// Display form of the failure.
    pub error_message: String,
    /// Failure with its chain of causes.
    pub error_trace: String,
    /// When the delivery failed.
    pub failed_at: DateTime<Utc>,
    /// Lifecycle state.
    pub status: FailedMessageStatus,
    /// Number of manual retries requested.
    pub retry_count: u32,
    /// When an operator resolved the record.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Raw payload, kept for replay.
    pub message_content: String,
}

impl FailedMessage {
    /// Creates a new in-DLQ record.
    #[must_use]
    pub fn new(
        message_id: impl Into<String>,
        topic: impl Into<String>,
        subscription: impl Into<String>,
        error_message: impl Into<String>,
        error_trace: impl Into<String>,
        message_content: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_id: message_id.into(),
            topic: topic.into(),
            subscription: subscription.into(),
            error_message: error_message.into(),
            error_trace: error_trace.into(),
            failed_at: Utc::now(),
            status: FailedMessageStatus::InDlq,
            retry_count: 0,
            resolved_at: None,
            message_content: message_content.into(),
        }
    }
}

/// In-DLQ backlog of one topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicBacklog {
    /// Queue topic.
    pub topic: String,
    /// Number of records in the DLQ.
    pub count: u64,
    /// Error message of the most recent failure.
    pub latest_error: String,
    /// When the most recent failure happened.
    pub latest_failed_at: DateTime<Utc>,
}
