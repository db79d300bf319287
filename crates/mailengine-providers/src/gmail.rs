//! Gmail REST API provider.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use mailengine_core::{MailEvent, MailProvider, ProviderType, Result, SendMail};
use serde::Deserialize;
use serde::de::IgnoredAny;
use serde_json::json;
use tracing::{info, instrument};
use url::Url;

use crate::http::{build_client, check, endpoint, parse_base, transport_error};
use crate::token::TokenSource;

const PROVIDER: ProviderType = ProviderType::Gmail;

/// Messages fetched per inbox read.
const INBOX_PAGE_SIZE: &str = "10";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageList {
    #[serde(default)]
    messages: Vec<IgnoredAny>,
    #[serde(default)]
    result_size_estimate: u64,
}

/// Sends and reads mail through the Gmail API.
#[derive(Clone)]
pub struct GmailProvider {
    client: reqwest::Client,
    base: Url,
    tokens: Arc<dyn TokenSource>,
}

impl GmailProvider {
    /// Creates a provider for the API at `base`, e.g.
    /// `https://gmail.googleapis.com`.
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL is invalid or the HTTP client cannot
    /// be built.
    pub fn new(base: &str, tokens: Arc<dyn TokenSource>) -> Result<Self> {
        Self::with_client(build_client()?, base, tokens)
    }

    /// Creates a provider sharing an existing HTTP client.
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL is invalid.
    pub fn with_client(
        client: reqwest::Client,
        base: &str,
        tokens: Arc<dyn TokenSource>,
    ) -> Result<Self> {
        Ok(Self {
            client,
            base: parse_base(base)?,
            tokens,
        })
    }
}

/// Renders a minimal HTML MIME message.
fn mime_message(mail: &SendMail) -> String {
    format!(
        "MIME-Version: 1.0\r\nTo: {}\r\nSubject: {}\r\nContent-Type: text/html; charset=utf-8\r\n\r\n{}\r\n",
        mail.to,
        encode_header(&mail.subject),
        mail.body
    )
}

/// RFC 2047 encoding for non-ASCII header values.
fn encode_header(value: &str) -> String {
    if value.is_ascii() {
        value.to_string()
    } else {
        format!("=?UTF-8?B?{}?=", STANDARD.encode(value))
    }
}

#[async_trait]
impl MailProvider for GmailProvider {
    fn provider_type(&self) -> ProviderType {
        PROVIDER
    }

    #[instrument(skip_all, fields(account = %event.user_mail_account_id))]
    async fn send(&self, event: &MailEvent, mail: &SendMail) -> Result<()> {
        let token = self
            .tokens
            .access_token(PROVIDER, event.user_mail_account_id)
            .await?;
        let url = endpoint(&self.base, "gmail/v1/users/me/messages/send")?;
        let raw = URL_SAFE_NO_PAD.encode(mime_message(mail));

        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .json(&json!({ "raw": raw }))
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, &e))?;
        check(PROVIDER, response).await?;

        info!("Email sent via Gmail");
        Ok(())
    }

    #[instrument(skip_all, fields(account = %event.user_mail_account_id))]
    async fn read_inbox(&self, event: &MailEvent) -> Result<()> {
        let token = self
            .tokens
            .access_token(PROVIDER, event.user_mail_account_id)
            .await?;
        let url = endpoint(&self.base, "gmail/v1/users/me/messages")?;

        let response = self
            .client
            .get(url)
            .query(&[("q", "in:inbox"), ("maxResults", INBOX_PAGE_SIZE)])
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, &e))?;
        let list: MessageList = check(PROVIDER, response)
            .await?
            .json()
            .await
            .map_err(|e| transport_error(PROVIDER, &e))?;

        info!(
            estimate = list.result_size_estimate,
            "Retrieved {} messages from Gmail inbox",
            list.messages.len()
        );
        Ok(())
    }
}

impl std::fmt::Debug for GmailProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GmailProvider")
            .field("base", &self.base.as_str())
            .finish_non_exhaustive()
    }
}
