//! Error types for the core library.

use thiserror::Error;

use crate::event::ProviderType;

/// Errors that can occur while processing mail events.
#[derive(Debug, Error)]
pub enum Error {
    /// The event carries a kind tag this engine does not handle.
    #[error("Unsupported event kind: {0}")]
    UnsupportedEventKind(String),

    /// No provider capability is registered for the provider type.
    #[error("Unknown provider: {0}")]
    UnknownProvider(ProviderType),

    /// No concurrency pool exists for the provider type.
    #[error("No concurrency pool configured for provider {0}")]
    NoPermitPool(ProviderType),

    /// The queued payload could not be decoded into an event.
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// Authentication or credential lookup failed.
    #[error("Credential failure: {0}")]
    CredentialFailure(String),

    /// System keyring access failed.
    #[error("Keyring error: {0}")]
    Keyring(#[from] keyring::Error),

    /// The provider rejected the request as invalid.
    #[error("Provider rejected request ({status}): {message}")]
    ProviderRejected {
        /// HTTP status returned by the provider.
        status: u16,
        /// Error message returned by the provider.
        message: String,
    },

    /// The provider is throttling or temporarily unavailable.
    #[error("Provider unavailable ({status}): {message}")]
    ProviderUnavailable {
        /// HTTP status returned by the provider.
        status: u16,
        /// Error message returned by the provider.
        message: String,
    },

    /// The operation timed out.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The connection could not be established in time.
    #[error("Connection timed out: {0}")]
    ConnectionTimeout(String),

    /// Another delivery currently holds the claim on this event.
    #[error("Message {0} is being processed by another delivery")]
    InFlight(String),

    /// The operation was cancelled before it completed.
    #[error("Operation cancelled")]
    Cancelled,

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A dead-letter record cannot move between these states.
    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition {
        /// Current status.
        from: &'static str,
        /// Requested status.
        to: &'static str,
    },

    /// Record not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Failure without a more specific classification.
    #[error("Unknown error: {0}")]
    Unknown(String),
}

/// Closed set of failure kinds the failure classifier decides on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Event kind tag not handled.
    UnsupportedEventKind,
    /// Provider type not registered.
    UnknownProvider,
    /// Missing concurrency pool or other configuration problem.
    Misconfigured,
    /// Payload could not be decoded.
    MalformedPayload,
    /// Credentials missing or refused.
    CredentialFailure,
    /// Request rejected as invalid by the provider.
    ProviderRejected,
    /// Provider throttling or server-side outage.
    ProviderUnavailable,
    /// Operation timeout.
    Timeout,
    /// Connection-level timeout.
    ConnectionTimeout,
    /// Event claimed by a delivery still in flight.
    InFlight,
    /// Cancelled by the host.
    Cancelled,
    /// Anything else.
    Unknown,
}

impl Error {
    /// Projects this error onto the classifier's closed set of kinds.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::UnsupportedEventKind(_) => ErrorKind::UnsupportedEventKind,
            Self::UnknownProvider(_) => ErrorKind::UnknownProvider,
            Self::NoPermitPool(_) | Self::Config(_) => ErrorKind::Misconfigured,
            Self::MalformedPayload(_) | Self::Serde(_) => ErrorKind::MalformedPayload,
            Self::CredentialFailure(_) | Self::Keyring(_) => ErrorKind::CredentialFailure,
            Self::ProviderRejected { .. } => ErrorKind::ProviderRejected,
            Self::ProviderUnavailable { .. } => ErrorKind::ProviderUnavailable,
            Self::Timeout(_) | Self::Database(sqlx::Error::PoolTimedOut) => ErrorKind::Timeout,
            Self::ConnectionTimeout(_) => ErrorKind::ConnectionTimeout,
            Self::InFlight(_) => ErrorKind::InFlight,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Database(_)
            | Self::InvalidTransition { .. }
            | Self::NotFound(_)
            | Self::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// Renders the error and its chain of sources, outermost first.
    ///
    /// Used as the stored trace of a dead-lettered message.
    #[must_use]
    pub fn trace(&self) -> String {
        let mut trace = format!("{self:?}");
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            trace.push_str("\ncaused by: ");
            trace.push_str(&cause.to_string());
            source = cause.source();
        }
        trace
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
