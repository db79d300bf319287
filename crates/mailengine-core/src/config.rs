//! Engine configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::adapter::DEFAULT_MAX_DELIVERY_ATTEMPTS;
use crate::limiter::DEFAULT_MAX_CONCURRENCY;
use crate::{Error, Result};

/// Environment variable overriding [`EngineConfig::database_path`].
pub const ENV_DATABASE_PATH: &str = "MAILENGINE_DATABASE_PATH";

/// Environment variable overriding [`EngineConfig::max_concurrency_per_provider`].
pub const ENV_MAX_CONCURRENCY: &str = "MAILENGINE_MAX_CONCURRENCY";

/// Runtime configuration, loaded from a JSON file with every field defaulted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// `SQLite` database holding the ledger and the dead-letter store.
    pub database_path: PathBuf,
    /// Concurrent provider calls allowed per provider type.
    pub max_concurrency_per_provider: usize,
    /// Deliveries before a transiently failing message is dead-lettered.
    pub max_delivery_attempts: u32,
    /// First redelivery delay; doubles with each attempt.
    pub retry_base_delay_ms: u64,
    /// Upper bound on the redelivery delay.
    pub retry_max_delay_ms: u64,
    /// Seconds between dead-letter backlog checks.
    pub dlq_monitor_interval_secs: u64,
    /// Days ledger entries are kept; `None` keeps them forever.
    pub ledger_retention_days: Option<u32>,
    /// How long a `SQLite` connection waits on a locked database.
    pub sqlite_busy_timeout_ms: u64,
    /// Seconds a pending ledger claim is honoured before another delivery
    /// may take it over. Must exceed the longest provider call.
    pub claim_lease_secs: u64,
    /// Gmail API endpoint.
    pub gmail_api_base: String,
    /// Microsoft Graph endpoint.
    pub graph_api_base: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            max_concurrency_per_provider: DEFAULT_MAX_CONCURRENCY,
            max_delivery_attempts: DEFAULT_MAX_DELIVERY_ATTEMPTS,
            retry_base_delay_ms: 2_000,
            retry_max_delay_ms: 60_000,
            dlq_monitor_interval_secs: 300,
            ledger_retention_days: Some(30),
            sqlite_busy_timeout_ms: 5_000,
            claim_lease_secs: 300,
            gmail_api_base: "https://gmail.googleapis.com".to_string(),
            graph_api_base: "https://graph.microsoft.com".to_string(),
        }
    }
}

fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mailengine")
        .join("mailengine.db")
}

/// Default location of the configuration file.
#[must_use]
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mailengine")
        .join("config.json")
}

impl EngineConfig {
    /// Loads configuration from `path`, or from the default location.
    ///
    /// A missing file at the default location yields the defaults; an
    /// explicitly named file must exist. Environment overrides are applied
    /// and the result is validated.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or the
    /// configuration is invalid.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (default_config_path(), false),
        };

        let mut config = if !required && !path.exists() {
            debug!("No configuration at {}, using defaults", path.display());
            Self::default()
        } else {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
            info!("Loaded configuration from {}", path.display());
            Self::from_json(&contents)?
        };

        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parses configuration JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid.
    pub fn from_json(contents: &str) -> Result<Self> {
        serde_json::from_str(contents).map_err(|e| Error::Config(e.to_string()))
    }

    /// Applies overrides from a variable lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if an override is not a valid value.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(path) = lookup(ENV_DATABASE_PATH).filter(|p| !p.is_empty()) {
            self.database_path = PathBuf::from(path);
        }
        if let Some(max) = lookup(ENV_MAX_CONCURRENCY) {
            self.max_concurrency_per_provider = max
                .parse()
                .map_err(|e| Error::Config(format!("{ENV_MAX_CONCURRENCY}={max}: {e}")))?;
        }
        Ok(())
    }

    /// Checks that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency_per_provider == 0 {
            return Err(Error::Config(
                "max_concurrency_per_provider must be at least 1".into(),
            ));
        }
        if self.max_delivery_attempts == 0 {
            return Err(Error::Config("max_delivery_attempts must be at least 1".into()));
        }
        if self.dlq_monitor_interval_secs == 0 {
            return Err(Error::Config("dlq_monitor_interval_secs must be at least 1".into()));
        }
        if self.claim_lease_secs == 0 {
            return Err(Error::Config("claim_lease_secs must be at least 1".into()));
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(Error::Config(
                "retry_max_delay_ms must not be below retry_base_delay_ms".into(),
            ));
        }
        Ok(())
    }

    /// Delay before redelivering after the given failed attempt (1-based).
    #[must_use]
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .retry_base_delay_ms
            .saturating_mul(1_u64 << exponent)
            .min(self.retry_max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Busy timeout for `SQLite` connections.
    #[must_use]
    pub const fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.sqlite_busy_timeout_ms)
    }

    /// Interval between dead-letter backlog checks.
    #[must_use]
    pub const fn dlq_monitor_interval(&self) -> Duration {
        Duration::from_secs(self.dlq_monitor_interval_secs)
    }

    /// Age after which a pending ledger claim counts as abandoned.
    #[must_use]
    pub const fn claim_lease(&self) -> Duration {
        Duration::from_secs(self.claim_lease_secs)
    }

    /// Ledger retention window, if retention is enabled.
    #[must_use]
    pub fn ledger_retention(&self) -> Option<chrono::Duration> {
        self.ledger_retention_days
            .map(|days| chrono::Duration::days(i64::from(days)))
    }
}
