//! # mailengine-providers
//!
//! Provider capabilities for `mailengine`:
//! - Gmail via the Gmail REST API
//! - Outlook via Microsoft Graph
//!
//! Both authenticate with a per-account bearer token from a [`TokenSource`]
//! and map HTTP failures onto [`mailengine_core::Error`] so the failure
//! classifier can tell transient from permanent failures.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod gmail;
mod http;
mod outlook;
mod token;

pub use gmail::GmailProvider;
pub use http::{CONNECT_TIMEOUT, REQUEST_TIMEOUT, build_client};
pub use outlook::OutlookProvider;
pub use token::{SecretTokenSource, TokenSource, token_secret_name};
