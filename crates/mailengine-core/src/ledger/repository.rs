//! Ledger storage.

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnection, SqliteExecutor, SqlitePool, SqliteRow};
use tracing::{debug, info, warn};

use super::model::{ClaimState, LedgerEntry};
use crate::Result;
use crate::store::format_timestamp;

/// Result of inserting a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The entry was written.
    Inserted,
    /// An entry with the same message ID or idempotency key already exists.
    Duplicate,
}

/// Repository for the processed-message ledger.
///
/// Look-ups and inserts take a connection so the deduplication gate can run
/// them inside its own claim transaction. Entries are only ever moved from
/// pending to processed, released while still pending, or purged by
/// retention.
#[derive(Debug, Clone)]
pub struct DuplicateLedger {
    pool: SqlitePool,
}

impl DuplicateLedger {
    /// Create a ledger over the given pool.
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Returns the underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Find the entry for a message ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn find_by_message_id(
        &self,
        conn: &mut SqliteConnection,
        message_id: &str,
    ) -> Result<Option<LedgerEntry>> {
        if message_id.is_empty() {
            return Ok(None);
        }

        let row = sqlx::query(
            r"
            SELECT message_id, idempotency_key, event_type, state, processed_at
            FROM processed_messages
            WHERE message_id = ?
            ",
        )
        .bind(message_id)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(row.as_ref().and_then(row_to_entry))
    }

    /// Find the entry for an idempotency key.
    ///
    /// A missing or empty key never matches and skips the query.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn find_by_idempotency_key(
        &self,
        conn: &mut SqliteConnection,
        key: Option<&str>,
    ) -> Result<Option<LedgerEntry>> {
        let Some(key) = key.filter(|k| !k.is_empty()) else {
            return Ok(None);
        };

        let row = sqlx::query(
            r"
            SELECT message_id, idempotency_key, event_type, state, processed_at
            FROM processed_messages
            WHERE idempotency_key = ?
            ",
        )
        .bind(key)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(row.as_ref().and_then(row_to_entry))
    }

    /// Insert an entry.
    ///
    /// A unique-constraint violation on either key column means another
    /// delivery of the same logical event got there first, and is reported
    /// as [`InsertOutcome::Duplicate`] rather than an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails for any other reason.
    pub async fn insert(
        &self,
        conn: &mut SqliteConnection,
        entry: &LedgerEntry,
    ) -> Result<InsertOutcome> {
        let result = sqlx::query(
            r"
            INSERT INTO processed_messages
                (message_id, idempotency_key, event_type, state, processed_at)
            VALUES (?, ?, ?, ?, ?)
            ",
        )
        .bind(&entry.message_id)
        .bind(entry.idempotency_key.as_deref().filter(|k| !k.is_empty()))
        .bind(&entry.event_type)
        .bind(entry.state.as_str())
        .bind(format_timestamp(entry.processed_at))
        .execute(&mut *conn)
        .await;

        match result {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                debug!(
                    "Ledger entry for message {} already exists: {e}",
                    entry.message_id
                );
                Ok(InsertOutcome::Duplicate)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Mark a pending claim as processed.
    ///
    /// Returns false if there was no pending claim for the message.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn complete(&self, message_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE processed_messages
            SET state = ?, processed_at = ?
            WHERE message_id = ? AND state = ?
            ",
        )
        .bind(ClaimState::Processed.as_str())
        .bind(format_timestamp(Utc::now()))
        .bind(message_id)
        .bind(ClaimState::Pending.as_str())
        .execute(&self.pool)
        .await?;

        let completed = result.rows_affected() > 0;
        if !completed {
            warn!("No pending ledger claim for message {message_id}");
        }
        Ok(completed)
    }

    /// Delete a pending claim. Processed entries are never touched.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn release<'e>(
        &self,
        executor: impl SqliteExecutor<'e>,
        message_id: &str,
    ) -> Result<bool> {
        let result = sqlx::query("DELETE FROM processed_messages WHERE message_id = ? AND state = ?")
            .bind(message_id)
            .bind(ClaimState::Pending.as_str())
            .execute(executor)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Get the entry for a message ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get(&self, message_id: &str) -> Result<Option<LedgerEntry>> {
        let row = sqlx::query(
            r"
            SELECT message_id, idempotency_key, event_type, state, processed_at
            FROM processed_messages
            WHERE message_id = ?
            ",
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().and_then(row_to_entry))
    }

    /// Count all entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn count(&self) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM processed_messages")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Delete entries that last changed state before `cutoff`.
    ///
    /// Redeliveries of a purged event are no longer recognised as
    /// duplicates, so the retention window must exceed the queue's
    /// redelivery horizon.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM processed_messages WHERE processed_at < ?")
            .bind(format_timestamp(cutoff))
            .execute(&self.pool)
            .await?;

        let purged = result.rows_affected();
        if purged > 0 {
            info!("Purged {purged} ledger entries processed before {cutoff}");
        }
        Ok(purged)
    }
}

fn row_to_entry(row: &SqliteRow) -> Option<LedgerEntry> {
    let processed_at: String = row.get("processed_at");
    let processed_at = DateTime::parse_from_rfc3339(&processed_at)
        .ok()?
        .with_timezone(&Utc);
    let state: String = row.get("state");

    Some(LedgerEntry {
        message_id: row.get("message_id"),
        idempotency_key: row.get("idempotency_key"),
        event_type: row.get("event_type"),
        state: ClaimState::parse(&state)?,
        processed_at,
    })
}
