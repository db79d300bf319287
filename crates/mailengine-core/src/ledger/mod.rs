//! Duplicate ledger of processed events.
//!
//! Record of event identities that are being processed or have been,
//! queryable by message ID and by idempotency key.

mod model;
mod repository;

pub use model::{ClaimState, LedgerEntry};
pub use repository::{DuplicateLedger, InsertOutcome};
