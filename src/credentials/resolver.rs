//! Credential resolution: cache fast path, provider fallback
//!
//! `resolve(false)` with a valid cached record returns it without any
//! network I/O. Otherwise the provider is asked exactly once; a success is
//! timestamped and written to the cache, a failure leaves the cache as-is.
//!
//! Cache I/O runs on the blocking pool; each call still completes before
//! `resolve` moves on, so a saved record is durable when it returns.

use super::cache::ConfigCache;
use super::clock::Clock;
use super::provider::{ConfigProvider, FetchError};
use crate::identity::DeviceIdentity;
use crate::protocol::{CachedCredential, Credential};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

/// Resolution failures; fatal to one connection attempt, never to the process
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Composes a [`ConfigCache`] and a [`ConfigProvider`]
#[derive(Clone)]
pub struct CredentialResolver {
    identity: DeviceIdentity,
    cache: Arc<dyn ConfigCache>,
    provider: Arc<dyn ConfigProvider>,
    clock: Arc<dyn Clock>,
}

impl CredentialResolver {
    pub fn new(
        identity: DeviceIdentity,
        cache: Arc<dyn ConfigCache>,
        provider: Arc<dyn ConfigProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            identity,
            cache,
            provider,
            clock,
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Return a valid credential, fetching and caching a fresh one when needed
    pub async fn resolve(&self, force: bool) -> Result<Credential, ResolveError> {
        if !force {
            match self.load().await {
                Some(cached) if cached.is_valid(self.clock.now_ms()) => {
                    debug!("Using cached credential");
                    return Ok(cached.credential);
                }
                Some(_) => info!("Cached credential expired, fetching a new one"),
                None => info!("No cached credential, fetching a new one"),
            }
        } else {
            info!("Forced credential refresh");
        }

        let fetched_at_ms = self.clock.now_ms();
        let credential = self.provider.fetch(&self.identity).await.map_err(|e| {
            warn!("Credential fetch failed: {}", e);
            ResolveError::from(e)
        })?;

        let record = CachedCredential::new(credential.clone(), fetched_at_ms);
        match self.on_cache(move |cache| cache.save(&record)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Failed to persist credential cache: {}", e),
            Err(e) => error!("Credential cache write did not complete: {}", e),
        }

        Ok(credential)
    }

    /// Drop the cached record so the next resolve goes to the network
    pub async fn invalidate(&self) {
        match self.on_cache(|cache| cache.delete()).await {
            Ok(Ok(())) => info!("Credential cache invalidated"),
            Ok(Err(e)) => error!("Failed to delete credential cache: {}", e),
            Err(e) => error!("Credential cache delete did not complete: {}", e),
        }
    }

    /// The cached record, if any, without validity filtering
    pub async fn cached(&self) -> Option<CachedCredential> {
        self.load().await
    }

    async fn load(&self) -> Option<CachedCredential> {
        self.on_cache(|cache| cache.load())
            .await
            .unwrap_or_else(|e| {
                error!("Credential cache read did not complete: {}", e);
                None
            })
    }

    /// Run a cache operation on the blocking pool and wait for it
    async fn on_cache<R, F>(&self, op: F) -> Result<R, JoinError>
    where
        F: FnOnce(&dyn ConfigCache) -> R + Send + 'static,
        R: Send + 'static,
    {
        let cache = self.cache.clone();
        tokio::task::spawn_blocking(move || op(cache.as_ref())).await
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }
}
