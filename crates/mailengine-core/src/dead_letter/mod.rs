//! Dead-letter storage, recording and monitoring.
//!
//! Permanently failed deliveries are snapshotted here for operators, who
//! move records forward through manual retry to resolution.

mod model;
mod monitor;
mod recorder;
mod repository;

pub use model::{FailedMessage, FailedMessageStatus, TopicBacklog};
pub use monitor::{AlertSink, DeadLetterMonitor, DlqReport, TracingAlertSink};
pub use recorder::DeadLetterRecorder;
pub use repository::DeadLetterRepository;
