//! Best-effort dead-letter recording.

use tracing::{error, warn};
use uuid::Uuid;

use super::model::FailedMessage;
use super::repository::DeadLetterRepository;
use crate::Error;

/// Snapshots permanently failed deliveries into the dead-letter store.
///
/// Recording never fails the caller: a storage error is logged and the
/// delivery is dead-lettered by the host regardless.
#[derive(Debug, Clone)]
pub struct DeadLetterRecorder {
    repository: DeadLetterRepository,
}

impl DeadLetterRecorder {
    /// Create a recorder over the given repository.
    #[must_use]
    pub const fn new(repository: DeadLetterRepository) -> Self {
        Self { repository }
    }

    /// Returns the underlying repository.
    #[must_use]
    pub const fn repository(&self) -> &DeadLetterRepository {
        &self.repository
    }

    /// Record a failed delivery, returning the stored record on success.
    pub async fn record(
        &self,
        topic: &str,
        subscription: &str,
        raw: &str,
        failure: &Error,
    ) -> Option<FailedMessage> {
        let message = FailedMessage::new(
            message_id_of(raw),
            topic,
            subscription,
            failure.to_string(),
            failure.trace(),
            raw,
        );

        match self.repository.insert(&message).await {
            Ok(()) => {
                warn!(
                    record_id = %message.id,
                    message_id = %message.message_id,
                    topic,
                    subscription,
                    "Message dead-lettered: {failure}"
                );
                Some(message)
            }
            Err(e) => {
                error!(
                    message_id = %message.message_id,
                    topic,
                    "Failed to record dead-lettered message: {e}"
                );
                None
            }
        }
    }
}

/// Message ID carried by the payload, or a fresh one when it has none.
fn message_id_of(raw: &str) -> String {
    serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .and_then(|v| v.get("message_id")?.as_str().map(str::to_string))
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}
