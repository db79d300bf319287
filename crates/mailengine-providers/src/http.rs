//! Shared HTTP plumbing: client construction, endpoint joining and mapping
//! of HTTP failures onto engine errors.

use std::time::Duration;

use mailengine_core::{Error, ProviderType, Result};
use reqwest::{Response, StatusCode};
use serde_json::Value;
use url::Url;

/// Overall timeout of one provider request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for establishing a connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest provider error message kept in an error.
const MAX_MESSAGE_LEN: usize = 512;

/// Builds the HTTP client shared by the providers.
///
/// # Errors
///
/// Returns an error if the TLS backend cannot be initialized.
pub fn build_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .connect_timeout(CONNECT_TIMEOUT)
        .user_agent(concat!("mailengine/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| Error::Config(format!("HTTP client: {e}")))
}

/// Parses an API base URL so relative endpoint paths join beneath it.
pub(crate) fn parse_base(base: &str) -> Result<Url> {
    let mut url = Url::parse(base).map_err(|e| Error::Config(format!("API base {base}: {e}")))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// Joins an endpoint path onto a parsed base.
pub(crate) fn endpoint(base: &Url, path: &str) -> Result<Url> {
    base.join(path)
        .map_err(|e| Error::Config(format!("endpoint {path}: {e}")))
}

/// Maps a transport-level failure.
pub(crate) fn transport_error(provider: ProviderType, err: &reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout(format!("{provider}: {err}"))
    } else if err.is_connect() {
        Error::ConnectionTimeout(format!("{provider}: {err}"))
    } else {
        Error::Unknown(format!("{provider}: {err}"))
    }
}

/// Maps an unsuccessful HTTP status.
pub(crate) fn status_error(status: StatusCode, message: String) -> Error {
    let code = status.as_u16();
    match code {
        400 | 404 | 413 | 422 => Error::ProviderRejected {
            status: code,
            message,
        },
        401 | 403 => Error::CredentialFailure(format!("HTTP {code}: {message}")),
        408 | 504 => Error::Timeout(format!("HTTP {code}: {message}")),
        429 | 500..=599 => Error::ProviderUnavailable {
            status: code,
            message,
        },
        _ => Error::Unknown(format!("HTTP {code}: {message}")),
    }
}

/// Passes a successful response through, or turns it into an error.
pub(crate) async fn check(provider: ProviderType, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response
        .text()
        .await
        .map_err(|e| transport_error(provider, &e))?;
    Err(status_error(status, error_message(&body, status)))
}

/// Extracts `error.message` from a Google or Graph error body, falling back
/// to the raw body.
fn error_message(body: &str, status: StatusCode) -> String {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.pointer("/error/message")?.as_str().map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string());

    if message.is_empty() {
        return status
            .canonical_reason()
            .unwrap_or("no error message")
            .to_string();
    }
    truncate(message)
}

fn truncate(mut message: String) -> String {
    if message.len() > MAX_MESSAGE_LEN {
        let mut end = MAX_MESSAGE_LEN;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message.truncate(end);
    }
    message
}
