//! Provider capabilities and their resolution.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::event::{MailEvent, ProviderType, SendMail};
use crate::{Error, Result};

/// A mail backend able to execute events against an external service.
#[async_trait]
pub trait MailProvider: Send + Sync {
    /// Provider type this capability serves.
    fn provider_type(&self) -> ProviderType;

    /// Sends an email on behalf of the event's user account.
    async fn send(&self, event: &MailEvent, mail: &SendMail) -> Result<()>;

    /// Reads the inbox of the event's user account.
    async fn read_inbox(&self, event: &MailEvent) -> Result<()>;
}

/// Maps provider types to capabilities.
pub trait ProviderResolver: Send + Sync {
    /// Returns the capability for a provider type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownProvider`] if nothing is registered.
    fn get(&self, provider: ProviderType) -> Result<Arc<dyn MailProvider>>;
}

/// Registry of provider capabilities, built once at startup.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderType, Arc<dyn MailProvider>>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a capability under its own provider type.
    #[must_use]
    pub fn with(mut self, provider: Arc<dyn MailProvider>) -> Self {
        self.register(provider);
        self
    }

    /// Registers a capability, replacing any previous one for the same type.
    pub fn register(&mut self, provider: Arc<dyn MailProvider>) {
        self.providers.insert(provider.provider_type(), provider);
    }

    /// Returns the registered provider types.
    #[must_use]
    pub fn provider_types(&self) -> Vec<ProviderType> {
        self.providers.keys().copied().collect()
    }
}

impl ProviderResolver for ProviderRegistry {
    fn get(&self, provider: ProviderType) -> Result<Arc<dyn MailProvider>> {
        self.providers
            .get(&provider)
            .cloned()
            .ok_or(Error::UnknownProvider(provider))
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.provider_types())
            .finish()
    }
}
