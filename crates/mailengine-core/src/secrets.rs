//! Secret resolution.
//!
//! Secrets are looked up by name, e.g. `outlook-client-id` or
//! `gmail-access-token-<account id>`, across an ordered chain of sources:
//! - the platform keyring (Secret Service, Keychain, Credential Manager)
//! - process environment variables

use std::sync::Arc;

use keyring::Entry;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Service name used for keyring entries.
const SERVICE_NAME: &str = "mailengine";

/// A source of named secrets.
pub trait SecretResolver: Send + Sync {
    /// Short name of the source, used in logs.
    fn name(&self) -> &'static str;

    /// Looks up a secret, returning `None` if this source does not have it.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot be queried.
    fn get(&self, name: &str) -> Result<Option<String>>;
}

/// Secrets stored in the system keyring.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyringSecrets;

impl KeyringSecrets {
    /// Stores a secret in the system keyring.
    ///
    /// # Errors
    ///
    /// Returns an error if the keyring operation fails.
    pub fn store(&self, name: &str, value: &str) -> Result<()> {
        Entry::new(SERVICE_NAME, name)?.set_password(value)?;
        debug!("Stored secret {name} in keyring");
        Ok(())
    }

    /// Deletes a secret from the system keyring. Missing entries are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the keyring operation fails.
    pub fn delete(&self, name: &str) -> Result<()> {
        match Entry::new(SERVICE_NAME, name)?.delete_credential() {
            Ok(()) => {
                debug!("Deleted secret {name} from keyring");
                Ok(())
            }
            Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => {
                warn!("Failed to delete secret {name}: {e}");
                Err(e.into())
            }
        }
    }
}

impl SecretResolver for KeyringSecrets {
    fn name(&self) -> &'static str {
        "keyring"
    }

    fn get(&self, name: &str) -> Result<Option<String>> {
        match Entry::new(SERVICE_NAME, name)?.get_password() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Secrets passed through environment variables.
///
/// A secret name maps to an upper-case variable with dashes replaced by
/// underscores.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSecrets;

impl EnvSecrets {
    /// Returns the variable a secret name is read from.
    #[must_use]
    pub fn variable_name(name: &str) -> String {
        name.chars()
            .map(|c| match c {
                '-' | '.' => '_',
                c => c.to_ascii_uppercase(),
            })
            .collect()
    }
}

impl SecretResolver for EnvSecrets {
    fn name(&self) -> &'static str {
        "env"
    }

    fn get(&self, name: &str) -> Result<Option<String>> {
        Ok(std::env::var(Self::variable_name(name))
            .ok()
            .filter(|v| !v.is_empty()))
    }
}

/// Ordered chain of secret sources.
///
/// The first source that has the secret wins. A source that fails is logged
/// and skipped.
#[derive(Clone, Default)]
pub struct SecretChain {
    resolvers: Vec<Arc<dyn SecretResolver>>,
}

impl SecretChain {
    /// Creates an empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Keyring first, then environment variables.
    #[must_use]
    pub fn system() -> Self {
        Self::new()
            .with(Arc::new(KeyringSecrets))
            .with(Arc::new(EnvSecrets))
    }

    /// Appends a source.
    #[must_use]
    pub fn with(mut self, resolver: Arc<dyn SecretResolver>) -> Self {
        self.resolvers.push(resolver);
        self
    }

    /// Resolves a secret.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CredentialFailure`] if no source has the secret.
    pub fn resolve(&self, name: &str) -> Result<String> {
        for resolver in &self.resolvers {
            match resolver.get(name) {
                Ok(Some(secret)) => {
                    debug!("Resolved secret {name} from {}", resolver.name());
                    return Ok(secret);
                }
                Ok(None) => {}
                Err(e) => warn!("Secret source {} failed for {name}: {e}", resolver.name()),
            }
        }
        Err(Error::CredentialFailure(format!("secret {name} not found")))
    }
}

impl std::fmt::Debug for SecretChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.resolvers.iter().map(|r| r.name()).collect();
        f.debug_struct("SecretChain")
            .field("resolvers", &names)
            .finish()
    }
}
