//! Failure classification.
//!
//! Maps the kind of a failure to whether the queue host should retry it or
//! dead-letter it. The pipeline itself never consults this; only the queue
//! boundary adapter does.

use crate::error::ErrorKind;

/// Whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Retrying may succeed.
    Transient,
    /// Retrying cannot succeed.
    Permanent,
}

/// What the queue host should do with a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostAction {
    /// Dead-letter without retrying.
    DeadLetter,
    /// Dead-letter and alert an operator to refresh credentials.
    DeadLetterAndAlert,
    /// Let the host redeliver with its own backoff.
    Retry,
    /// Redeliver, but log at high severity so someone investigates.
    RetryAndInvestigate,
}

/// Classification of one failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Retry eligibility.
    pub class: FailureClass,
    /// Action for the queue host.
    pub action: HostAction,
}

impl Decision {
    const fn new(class: FailureClass, action: HostAction) -> Self {
        Self { class, action }
    }

    /// Returns true if the failure must not be retried.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self.class, FailureClass::Permanent)
    }
}

/// Classifies a failure kind.
#[must_use]
pub const fn classify(kind: ErrorKind) -> Decision {
    use FailureClass::{Permanent, Transient};

    match kind {
        ErrorKind::MalformedPayload
        | ErrorKind::ProviderRejected
        | ErrorKind::UnsupportedEventKind
        | ErrorKind::UnknownProvider
        | ErrorKind::Misconfigured => Decision::new(Permanent, HostAction::DeadLetter),
        ErrorKind::CredentialFailure => Decision::new(Permanent, HostAction::DeadLetterAndAlert),
        ErrorKind::Timeout
        | ErrorKind::ConnectionTimeout
        | ErrorKind::ProviderUnavailable
        | ErrorKind::InFlight
        | ErrorKind::Cancelled => Decision::new(Transient, HostAction::Retry),
        ErrorKind::Unknown => Decision::new(Transient, HostAction::RetryAndInvestigate),
    }
}
