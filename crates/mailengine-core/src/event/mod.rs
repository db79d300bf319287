//! Queued mail events.
//!
//! Events arrive from the queue host as JSON payloads and are routed by
//! provider type and event kind.

mod model;

pub use model::{EventKind, MailEvent, MessageId, ProviderType, SendMail};
