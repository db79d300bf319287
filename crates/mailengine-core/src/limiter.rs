//! Per-provider concurrency limiting.
//!
//! Each provider type gets its own counting semaphore sized by a single
//! configured maximum. A [`ProviderPermit`] returns its slot when dropped,
//! so the slot comes back on success, on error and when the holding future
//! is cancelled.
//!
//! Waiters are served in the order `tokio::sync::Semaphore` chooses (FIFO
//! today). Callers must not rely on any ordering.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::event::ProviderType;
use crate::{Error, Result};

/// Default number of simultaneous operations per provider.
pub const DEFAULT_MAX_CONCURRENCY: usize = 10;

/// Bounds simultaneous in-flight operations per provider.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    pools: HashMap<ProviderType, Arc<Semaphore>>,
    max_per_provider: usize,
}

/// A held concurrency slot. The slot is released on drop.
#[derive(Debug)]
#[must_use = "the slot is released as soon as the permit is dropped"]
pub struct ProviderPermit {
    provider: ProviderType,
    _permit: OwnedSemaphorePermit,
}

impl ProviderPermit {
    /// Provider this permit was taken for.
    #[must_use]
    pub const fn provider(&self) -> ProviderType {
        self.provider
    }
}

impl Drop for ProviderPermit {
    fn drop(&mut self) {
        trace!(provider = %self.provider, "Released concurrency permit");
    }
}

impl ConcurrencyLimiter {
    /// Creates a limiter with one pool per known provider type.
    #[must_use]
    pub fn new(max_per_provider: usize) -> Self {
        Self::for_providers(&ProviderType::ALL, max_per_provider)
    }

    /// Creates a limiter with pools for the given provider types only.
    #[must_use]
    pub fn for_providers(providers: &[ProviderType], max_per_provider: usize) -> Self {
        let pools = providers
            .iter()
            .map(|p| (*p, Arc::new(Semaphore::new(max_per_provider))))
            .collect();
        Self {
            pools,
            max_per_provider,
        }
    }

    /// Returns the configured per-provider maximum.
    #[must_use]
    pub const fn max_per_provider(&self) -> usize {
        self.max_per_provider
    }

    /// Returns the number of free slots for a provider, if it has a pool.
    #[must_use]
    pub fn available(&self, provider: ProviderType) -> Option<usize> {
        self.pools.get(&provider).map(|s| s.available_permits())
    }

    /// Waits for a free slot for the provider.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoPermitPool`] if the provider has no pool.
    pub async fn acquire(&self, provider: ProviderType) -> Result<ProviderPermit> {
        let pool = self
            .pools
            .get(&provider)
            .ok_or(Error::NoPermitPool(provider))?;

        // The semaphore is never closed, so acquisition only fails if it is.
        let permit = Arc::clone(pool)
            .acquire_owned()
            .await
            .map_err(|_| Error::NoPermitPool(provider))?;

        trace!(%provider, "Acquired concurrency permit");
        Ok(ProviderPermit {
            provider,
            _permit: permit,
        })
    }

    /// Waits for a free slot, giving up when `cancel` fires.
    ///
    /// A cancelled wait never holds a slot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] on cancellation and
    /// [`Error::NoPermitPool`] if the provider has no pool.
    pub async fn acquire_cancellable(
        &self,
        provider: ProviderType,
        cancel: &CancellationToken,
    ) -> Result<ProviderPermit> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            permit = self.acquire(provider) => permit,
        }
    }
}
