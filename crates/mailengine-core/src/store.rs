//! `SQLite` connection pool and schema.
//!
//! The duplicate ledger and the dead-letter store share one pool. File-backed
//! databases run in WAL mode, so readers never wait on the single writer and
//! writers wait up to the busy timeout for each other.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::debug;

use crate::Result;

/// Default busy timeout for file-backed databases.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Formats a timestamp for storage.
///
/// Fixed-width UTC so that text comparison in SQL orders chronologically.
#[must_use]
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Handle to the persisted store.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens (creating if needed) the database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn open(database_path: &str, busy_timeout: Duration) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{database_path}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.initialize().await?;
        debug!("Opened store at {database_path}");
        Ok(store)
    }

    /// Creates an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { pool };
        store.initialize().await?;
        Ok(store)
    }

    /// Returns the underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Initialize database schema.
    async fn initialize(&self) -> Result<()> {
        // SQLite UNIQUE admits any number of NULLs, so events without an
        // idempotency key never collide on that column.
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS processed_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id TEXT NOT NULL UNIQUE,
                idempotency_key TEXT UNIQUE,
                event_type TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'processed',
                processed_at TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_processed_at ON processed_messages(processed_at)
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS failed_messages (
                id TEXT PRIMARY KEY,
                message_id TEXT NOT NULL,
                topic TEXT NOT NULL,
                subscription TEXT NOT NULL,
                error_message TEXT NOT NULL,
                error_trace TEXT NOT NULL,
                failed_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'in-dlq',
                retry_count INTEGER NOT NULL DEFAULT 0,
                resolved_at TEXT,
                message_content TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                modified_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        for index in [
            "CREATE INDEX IF NOT EXISTS idx_failed_status ON failed_messages(status)",
            "CREATE INDEX IF NOT EXISTS idx_failed_topic ON failed_messages(topic)",
            "CREATE INDEX IF NOT EXISTS idx_failed_created ON failed_messages(created_at)",
        ] {
            sqlx::query(index).execute(&self.pool).await?;
        }

        Ok(())
    }
}
