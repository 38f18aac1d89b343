//! Credential lease store.
//!
//! Exchanges a long-lived refresh credential for a short-lived access lease and
//! caches the lease per refresh key. Concurrent callers for the same key share
//! one in-flight exchange and all observe its outcome.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::util::credential_fingerprint;

pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(900);

/// Raw result of a refresh exchange, before it becomes a [`Lease`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseGrant {
    pub access_token: String,
    pub refresh_token: String,
    pub device_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub device_id: String,
    access_raw: String,
    refresh_raw: String,
    pub expires_at: Instant,
}

impl Lease {
    pub fn new(grant: LeaseGrant, ttl: Duration) -> Self {
        Self {
            device_id: grant.device_id.unwrap_or_else(generate_device_id),
            access_raw: grant.access_token,
            refresh_raw: grant.refresh_token,
            expires_at: Instant::now() + ttl,
        }
    }

    /// The only form of the credential pair that leaves the store.
    pub fn token(&self) -> String {
        format!("{}...{}", self.access_raw, self.refresh_raw)
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() > self.expires_at
    }
}

fn generate_device_id() -> String {
    rand::thread_rng()
        .gen_range(1_000_000_000_000_000_000u64..=9_999_999_999_999_999_999u64)
        .to_string()
}

/// Upstream side of a refresh exchange.
#[async_trait]
pub trait LeaseExchange: Send + Sync {
    async fn exchange(&self, refresh_key: &str) -> Result<LeaseGrant, RelayError>;
}

type PendingRefresh = Shared<BoxFuture<'static, Result<Lease, RelayError>>>;

pub struct LeaseStore {
    exchange: Arc<dyn LeaseExchange>,
    ttl: Duration,
    cache: Arc<Mutex<HashMap<String, Lease>>>,
    pending: Arc<Mutex<HashMap<String, PendingRefresh>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl LeaseStore {
    pub fn new(exchange: Arc<dyn LeaseExchange>, ttl: Duration) -> Self {
        Self {
            exchange,
            ttl,
            cache: Arc::new(Mutex::new(HashMap::new())),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Return a usable lease for `key`, refreshing it when absent or expired.
    pub async fn acquire(&self, key: &str) -> Result<Lease, RelayError> {
        if let Some(lease) = self.cached(key) {
            return Ok(lease);
        }

        let refresh = {
            let mut pending = lock(&self.pending);
            if let Some(in_flight) = pending.get(key) {
                debug!(
                    "Joining in-flight lease refresh for {}",
                    credential_fingerprint(key)
                );
                in_flight.clone()
            } else {
                // A refresh may have landed between the cache check and taking
                // the pending lock; completion writes the cache before it
                // clears its pending entry.
                if let Some(lease) = self.cached(key) {
                    return Ok(lease);
                }
                let refresh = self.start_refresh(key);
                pending.insert(key.to_string(), refresh.clone());
                refresh
            }
        };

        refresh.await
    }

    /// Drop the cached lease for `key` so the next `acquire` re-exchanges.
    pub fn evict(&self, key: &str) {
        if lock(&self.cache).remove(key).is_some() {
            info!("Evicted lease for {}", credential_fingerprint(key));
        }
    }

    /// Drop the cached lease for `key` only if it is still `rejected`. A lease
    /// refreshed by another request in the meantime is kept.
    pub fn evict_if(&self, key: &str, rejected: &Lease) {
        let mut cache = lock(&self.cache);
        if cache.get(key) == Some(rejected) {
            cache.remove(key);
            info!("Evicted rejected lease for {}", credential_fingerprint(key));
        } else {
            debug!(
                "Rejected lease for {} already replaced",
                credential_fingerprint(key)
            );
        }
    }

    /// Whether `key` currently yields a usable lease.
    pub async fn check(&self, key: &str) -> bool {
        match self.acquire(key).await {
            Ok(_) => true,
            Err(err) => {
                debug!("Lease check failed for {}: {}", credential_fingerprint(key), err);
                false
            }
        }
    }

    fn cached(&self, key: &str) -> Option<Lease> {
        let mut cache = lock(&self.cache);
        match cache.get(key) {
            Some(lease) if !lease.is_expired() => Some(lease.clone()),
            Some(_) => {
                cache.remove(key);
                None
            }
            None => None,
        }
    }

    fn start_refresh(&self, key: &str) -> PendingRefresh {
        let exchange = Arc::clone(&self.exchange);
        let cache = Arc::clone(&self.cache);
        let pending = Arc::clone(&self.pending);
        let ttl = self.ttl;
        let key = key.to_string();

        async move {
            let fingerprint = credential_fingerprint(&key);
            debug!("Refreshing lease for {}", fingerprint);
            let outcome = exchange
                .exchange(&key)
                .await
                .map(|grant| Lease::new(grant, ttl));

            match &outcome {
                Ok(lease) => {
                    lock(&cache).insert(key.clone(), lease.clone());
                    info!("Lease refreshed for {}", fingerprint);
                }
                Err(err) => {
                    if err.is_auth_failure() {
                        lock(&cache).remove(&key);
                    }
                    warn!("Lease refresh failed for {}: {}", fingerprint, err);
                }
            }
            lock(&pending).remove(&key);
            outcome
        }
        .boxed()
        .shared()
    }
}
