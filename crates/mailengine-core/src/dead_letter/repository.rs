//! Dead-letter storage.

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use tracing::{debug, info};
use uuid::Uuid;

use super::model::{FailedMessage, FailedMessageStatus, TopicBacklog};
use crate::store::format_timestamp;
use crate::{Error, Result};

const COLUMNS: &str = "id, message_id, topic, subscription, error_message, error_trace, \
                       failed_at, status, retry_count, resolved_at, message_content";

/// Repository for dead-lettered messages.
#[derive(Debug, Clone)]
pub struct DeadLetterRepository {
    pool: SqlitePool,
}

impl DeadLetterRepository {
    /// Create a repository over the given pool.
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a record.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn insert(&self, message: &FailedMessage) -> Result<()> {
        let now = format_timestamp(Utc::now());
        sqlx::query(
            r"
            INSERT INTO failed_messages (
                id, message_id, topic, subscription, error_message, error_trace,
                failed_at, status, retry_count, resolved_at, message_content,
                created_at, modified_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(message.id.to_string())
        .bind(&message.message_id)
        .bind(&message.topic)
        .bind(&message.subscription)
        .bind(&message.error_message)
        .bind(&message.error_trace)
        .bind(format_timestamp(message.failed_at))
        .bind(message.status.as_str())
        .bind(i64::from(message.retry_count))
        .bind(message.resolved_at.map(format_timestamp))
        .bind(&message.message_content)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        debug!("Stored dead-letter record {}", message.id);
        Ok(())
    }

    /// Get a record by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get(&self, id: Uuid) -> Result<Option<FailedMessage>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM failed_messages WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().and_then(row_to_message))
    }

    /// List records, optionally filtered by status, most recent failure first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn list_by_status(
        &self,
        status: Option<FailedMessageStatus>,
    ) -> Result<Vec<FailedMessage>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(&format!(
                    "SELECT {COLUMNS} FROM failed_messages WHERE status = ? ORDER BY failed_at DESC"
                ))
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {COLUMNS} FROM failed_messages ORDER BY failed_at DESC"
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows.iter().filter_map(row_to_message).collect())
    }

    /// Summarise the in-DLQ backlog per topic.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn backlog_by_topic(&self) -> Result<Vec<TopicBacklog>> {
        // With a single MAX() aggregate, SQLite takes the bare error_message
        // column from the row holding the maximum.
        let rows = sqlx::query(
            r"
            SELECT topic, COUNT(*) AS count, error_message, MAX(failed_at) AS latest_failed_at
            FROM failed_messages
            WHERE status = 'in-dlq'
            GROUP BY topic
            ORDER BY topic
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                let count: i64 = row.get("count");
                Some(TopicBacklog {
                    topic: row.get("topic"),
                    count: u64::try_from(count).unwrap_or(0),
                    latest_error: row.get("error_message"),
                    latest_failed_at: parse_timestamp(&row.get::<String, _>("latest_failed_at"))?,
                })
            })
            .collect())
    }

    /// Move a record to manual-retry-pending and bump its retry count.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown ID,
    /// [`Error::InvalidTransition`] if the record is resolved, or a database
    /// error.
    pub async fn mark_manual_retry_pending(&self, id: Uuid) -> Result<FailedMessage> {
        self.transition(id, FailedMessageStatus::ManualRetryPending)
            .await
    }

    /// Resolve a record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown ID,
    /// [`Error::InvalidTransition`] if it is already resolved, or a database
    /// error.
    pub async fn resolve(&self, id: Uuid) -> Result<FailedMessage> {
        self.transition(id, FailedMessageStatus::Resolved).await
    }

    async fn transition(&self, id: Uuid, next: FailedMessageStatus) -> Result<FailedMessage> {
        let current = self
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("dead-letter record {id}")))?;

        if !current.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: current.status.as_str(),
                to: next.as_str(),
            });
        }

        let now = Utc::now();
        let retry_increment = i64::from(next == FailedMessageStatus::ManualRetryPending);
        let resolved_at = (next == FailedMessageStatus::Resolved).then(|| format_timestamp(now));

        // Guarding on the status read above keeps concurrent operators from
        // both applying a transition.
        let result = sqlx::query(
            r"
            UPDATE failed_messages
            SET status = ?,
                retry_count = retry_count + ?,
                resolved_at = COALESCE(?, resolved_at),
                modified_at = ?
            WHERE id = ? AND status = ?
            ",
        )
        .bind(next.as_str())
        .bind(retry_increment)
        .bind(resolved_at)
        .bind(format_timestamp(now))
        .bind(id.to_string())
        .bind(current.status.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let latest = self.get(id).await?.map_or(current.status, |m| m.status);
            return Err(Error::InvalidTransition {
                from: latest.as_str(),
                to: next.as_str(),
            });
        }

        info!("Dead-letter record {id} moved from {} to {next}", current.status);
        self.get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("dead-letter record {id}")))
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn row_to_message(row: &SqliteRow) -> Option<FailedMessage> {
    let id: String = row.get("id");
    let status: String = row.get("status");
    let failed_at: String = row.get("failed_at");
    let resolved_at: Option<String> = row.get("resolved_at");
    let retry_count: i64 = row.get("retry_count");

    Some(FailedMessage {
        id: Uuid::parse_str(&id).ok()?,
        message_id: row.get("message_id"),
        topic: row.get("topic"),
        subscription: row.get("subscription"),
        error_message: row.get("error_message"),
        error_trace: row.get("error_trace"),
        failed_at: parse_timestamp(&failed_at)?,
        status: FailedMessageStatus::parse(&status)?,
        retry_count: u32::try_from(retry_count).unwrap_or(u32::MAX),
        resolved_at: resolved_at.as_deref().and_then(parse_timestamp),
        message_content: row.get("message_content"),
    })
}
