//! Access tokens for user mail accounts.

use async_trait::async_trait;
use mailengine_core::{Error, ProviderType, Result, SecretChain};
use tracing::debug;
use uuid::Uuid;

/// Supplies bearer tokens for user mail accounts.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Returns an access token for the account.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CredentialFailure`] if no token is available.
    async fn access_token(&self, provider: ProviderType, account: Uuid) -> Result<String>;
}

/// Name of the secret holding an account's access token.
#[must_use]
pub fn token_secret_name(provider: ProviderType, account: Uuid) -> String {
    format!("{provider}-access-token-{account}")
}

/// Token source backed by a [`SecretChain`].
#[derive(Debug, Clone)]
pub struct SecretTokenSource {
    secrets: SecretChain,
}

impl SecretTokenSource {
    /// Creates a token source over the given chain.
    #[must_use]
    pub const fn new(secrets: SecretChain) -> Self {
        Self { secrets }
    }
}

#[async_trait]
impl TokenSource for SecretTokenSource {
    async fn access_token(&self, provider: ProviderType, account: Uuid) -> Result<String> {
        let name = token_secret_name(provider, account);
        let secrets = self.secrets.clone();

        // Keyring lookups block on D-Bus or the platform credential store.
        let token = tokio::task::spawn_blocking(move || secrets.resolve(&name))
            .await
            .map_err(|e| Error::Unknown(format!("secret lookup task failed: {e}")))??;

        debug!(%provider, %account, "Resolved access token");
        Ok(token)
    }
}
