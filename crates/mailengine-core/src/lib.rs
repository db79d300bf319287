//! # mailengine-core
//!
//! Processing pipeline for queued mail events.
//!
//! This crate provides:
//! - Event model (send email, read inbox) for Gmail and Outlook accounts
//! - Per-provider concurrency limiting
//! - Dispatch of events to provider capabilities
//! - **Deduplication** - at-most-once side effects per message ID and idempotency key
//! - Failure classification into transient and permanent failures
//! - **Dead-lettering** - failed-message store, operator replay and backlog monitoring
//! - Secret resolution (system keyring, environment)
//! - Local storage (`SQLite`)

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod adapter;
pub mod classify;
pub mod config;
pub mod dead_letter;
pub mod dedup;
pub mod dispatch;
mod error;
pub mod event;
pub mod ledger;
pub mod limiter;
pub mod provider;
pub mod secrets;
pub mod store;

pub use adapter::{Delivery, Disposition, QueueAdapter, parse_event};
pub use classify::{Decision, FailureClass, HostAction, classify};
pub use config::EngineConfig;
pub use dead_letter::{
    AlertSink, DeadLetterMonitor, DeadLetterRecorder, DeadLetterRepository, DlqReport,
    FailedMessage, FailedMessageStatus, TopicBacklog, TracingAlertSink,
};
pub use dedup::{DeduplicatedHandler, GateOutcome};
pub use dispatch::{EventHandler, MailEventDispatcher};
pub use error::{Error, ErrorKind, Result};
pub use event::{EventKind, MailEvent, MessageId, ProviderType, SendMail};
pub use ledger::{ClaimState, DuplicateLedger, InsertOutcome, LedgerEntry};
pub use limiter::{ConcurrencyLimiter, ProviderPermit};
pub use provider::{MailProvider, ProviderRegistry, ProviderResolver};
pub use secrets::{EnvSecrets, KeyringSecrets, SecretChain, SecretResolver};
pub use store::Store;
