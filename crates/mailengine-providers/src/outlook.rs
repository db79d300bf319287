//! Microsoft Graph provider for Outlook accounts.

use std::sync::Arc;

use async_trait::async_trait;
use mailengine_core::{MailEvent, MailProvider, ProviderType, Result, SendMail};
use serde::Deserialize;
use serde::de::IgnoredAny;
use serde_json::{Value, json};
use tracing::{info, instrument};
use url::Url;

use crate::http::{build_client, check, endpoint, parse_base, transport_error};
use crate::token::TokenSource;

const PROVIDER: ProviderType = ProviderType::Outlook;

#[derive(Debug, Default, Deserialize)]
struct MessageCollection {
    #[serde(default)]
    value: Vec<IgnoredAny>,
}

/// Sends and reads mail through Microsoft Graph.
#[derive(Clone)]
pub struct OutlookProvider {
    client: reqwest::Client,
    base: Url,
    tokens: Arc<dyn TokenSource>,
}

impl OutlookProvider {
    /// Creates a provider for the Graph API at `base`, e.g.
    /// `https://graph.microsoft.com`.
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

/// Graph `sendMail` request body: HTML content, a single recipient.
fn send_mail_body(mail: &SendMail) -> Value {
    json!({
        "message": {
            "subject": mail.subject,
            "body": {
                "contentType": "HTML",
                "content": mail.body,
            },
            "toRecipients": [
                { "emailAddress": { "address": mail.to } }
            ],
        },
        "saveToSentItems": true,
    })
}

#[async_trait]
impl MailProvider for OutlookProvider {
    fn provider_type(&self) -> ProviderType {
        PROVIDER
    }

    #[instrument(skip_all, fields(account = %event.user_mail_account_id))]
    async fn send(&self, event: &MailEvent, mail: &SendMail) -> Result<()> {
        let token = self
            .tokens
            .access_token(PROVIDER, event.user_mail_account_id)
            .await?;
        let url = endpoint(&self.base, "v1.0/me/sendMail")?;

        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .json(&send_mail_body(mail))
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, &e))?;
        check(PROVIDER, response).await?;

        info!("Email sent via Outlook");
        Ok(())
    }

    #[instrument(skip_all, fields(account = %event.user_mail_account_id))]
    async fn read_inbox(&self, event: &MailEvent) -> Result<()> {
        let token = self
            .tokens
            .access_token(PROVIDER, event.user_mail_account_id)
            .await?;
        let url = endpoint(&self.base, "v1.0/me/mailFolders/inbox/messages")?;

        let response = self
            .client
            .get(url)
            .query(&[("$top", "10")])
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, &e))?;
        let messages: MessageCollection = check(PROVIDER, response)
            .await?
            .json()
            .await
            .map_err(|e| transport_error(PROVIDER, &e))?;

        info!("Retrieved {} messages from Outlook inbox", messages.value.len());
        Ok(())
    }
}

impl std::fmt::Debug for OutlookProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutlookProvider")
            .field("base", &self.base.as_str())
            .finish_non_exhaustive()
    }
}
