//! Discovery manager with per-identity capability caching.
//!
//! Entries are keyed by the caller's subject plus the sorted backend IDs, so
//! any enumeration order of the same backend set hits the same entry. An entry
//! is served only while it is unexpired and was built against the registry
//! version that is current now. Registry mutations never touch the cache; stale
//! entries are rejected on lookup and removed by the periodic sweep.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::DiscoveryError;
use crate::aggregator::Aggregator;
use crate::config::DiscoveryConfig;
use crate::context::CallContext;
use crate::health::{HealthFilterMode, HealthStatusProvider, filter_healthy_backends};
use crate::vmcp::{AggregatedCapabilities, Backend, BackendRegistry};

/// Discovers capabilities for a caller
#[async_trait]
pub trait Manager: Send + Sync {
    /// Aggregated capabilities of `backends` as seen by the caller on `ctx`
    async fn discover(
        &self,
        ctx: &CallContext,
        backends: &[Backend],
    ) -> Result<Arc<AggregatedCapabilities>, DiscoveryError>;

    /// Stop background work. Returns once the sweep task has exited.
    async fn stop(&self);
}

/// Cache and filtering knobs
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Entry lifetime
    pub cache_ttl: Duration,
    /// Hard entry limit; new keys are rejected once reached
    pub max_cache_size: usize,
    /// Sweep period
    pub cleanup_interval: Duration,
    /// Health filter policy
    pub health_mode: HealthFilterMode,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(5 * 60),
            max_cache_size: 1000,
            cleanup_interval: Duration::from_secs(60),
            health_mode: HealthFilterMode::Fail,
        }
    }
}

impl From<&DiscoveryConfig> for DiscoveryOptions {
    fn from(config: &DiscoveryConfig) -> Self {
        Self {
            cache_ttl: config.cache_ttl,
            max_cache_size: config.max_cache_size,
            cleanup_interval: config.cleanup_interval,
            health_mode: config.health_filter_mode,
        }
    }
}

/// Cache counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    /// Lookups served from cache
    pub hits: u64,
    /// Lookups that aggregated
    pub misses: u64,
    /// Entries currently held
    pub entries: usize,
}

#[derive(Debug)]
struct CacheEntry {
    capabilities: Arc<AggregatedCapabilities>,
    expires_at: Instant,
    registry_version: u64,
}

impl CacheEntry {
    fn is_valid(&self, now: Instant, current_version: Option<u64>) -> bool {
        now < self.expires_at && current_version.is_none_or(|v| v == self.registry_version)
    }
}

type Cache = Arc<RwLock<HashMap<String, CacheEntry>>>;

/// Caching [`Manager`] in front of an [`Aggregator`]
pub struct DefaultManager {
    aggregator: Arc<dyn Aggregator>,
    registry: Option<Arc<dyn BackendRegistry>>,
    health: Option<Arc<dyn HealthStatusProvider>>,
    options: DiscoveryOptions,
    cache: Cache,
    hits: AtomicU64,
    misses: AtomicU64,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl DefaultManager {
    /// Create a manager and start its sweep task on the current runtime.
    pub fn new(aggregator: Arc<dyn Aggregator>, options: DiscoveryOptions) -> Self {
        let cache: Cache = Arc::new(RwLock::new(HashMap::new()));
        let shutdown = CancellationToken::new();
        let sweeper = spawn_sweeper(
            Arc::clone(&cache),
            options.cleanup_interval,
            shutdown.clone(),
        );

        Self {
            aggregator,
            registry: None,
            health: None,
            options,
            cache,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            shutdown,
            sweeper: Mutex::new(sweeper),
        }
    }

    /// Tag entries with this registry's version and reject them once it moves
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<dyn BackendRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Filter backends through this provider before aggregating
    #[must_use]
    pub fn with_health_provider(mut self, provider: Arc<dyn HealthStatusProvider>) -> Self {
        self.health = Some(provider);
        self
    }

    /// Current counters
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.cache.read().len(),
        }
    }

    /// Whether the background sweep task is still alive
    pub fn is_sweeping(&self) -> bool {
        self.sweeper
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Drop expired entries now. Returns the number removed.
    pub fn remove_expired_entries(&self) -> usize {
        remove_expired(&self.cache)
    }

    fn lookup(&self, key: &str, version: Option<u64>) -> Option<Arc<AggregatedCapabilities>> {
        let cache = self.cache.read();
        cache
            .get(key)
            .filter(|entry| entry.is_valid(Instant::now(), version))
            .map(|entry| Arc::clone(&entry.capabilities))
    }

    fn store(&self, key: String, capabilities: Arc<AggregatedCapabilities>, version: u64) {
        let mut cache = self.cache.write();
        if cache.len() >= self.options.max_cache_size && !cache.contains_key(&key) {
            debug!(
                max = self.options.max_cache_size,
                "Discovery cache full, not caching result"
            );
            return;
        }
        cache.insert(
            key,
            CacheEntry {
                capabilities,
                expires_at: Instant::now() + self.options.cache_ttl,
                registry_version: version,
            },
        );
    }
}

#[async_trait]
impl Manager for DefaultManager {
    async fn discover(
        &self,
        ctx: &CallContext,
        backends: &[Backend],
    ) -> Result<Arc<AggregatedCapabilities>, DiscoveryError> {
        let identity = ctx.identity().ok_or(DiscoveryError::NoIdentity)?;
        if let Some(reason) = ctx.err() {
            return Err(reason.into());
        }

        let key = cache_key(&identity.subject, backends);
        let version = self.registry.as_ref().map(|r| r.version());

        if let Some(capabilities) = self.lookup(&key, version) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(subject = %identity.subject, backends = backends.len(), "Discovery cache hit");
            return Ok(capabilities);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let healthy =
            filter_healthy_backends(backends, self.health.as_deref(), self.options.health_mode);
        debug!(
            subject = %identity.subject,
            requested = backends.len(),
            healthy = healthy.len(),
            "Discovery cache miss, aggregating"
        );

        // no cache lock held across the aggregation
        let capabilities = ctx
            .run(self.aggregator.aggregate_capabilities(ctx, &healthy))
            .await?
            .map_err(|e| {
                warn!(subject = %identity.subject, error = %e, "Capability aggregation failed");
                DiscoveryError::from(e)
            })?;

        let capabilities = Arc::new(capabilities);
        self.store(key, Arc::clone(&capabilities), version.unwrap_or(0));
        Ok(capabilities)
    }

    async fn stop(&self) {
        self.shutdown.cancel();
        let handle = self.sweeper.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Discovery cache sweeper ended abnormally");
            }
            info!("Discovery manager stopped");
        }
    }
}

impl Drop for DefaultManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// SHA-256 over the subject and the sorted backend IDs
fn cache_key(subject: &str, backends: &[Backend]) -> String {
    let mut ids: Vec<&str> = backends.iter().map(|b| b.id.as_str()).collect();
    ids.sort_unstable();

    let mut hasher = Sha256::new();
    hasher.update(subject.as_bytes());
    for id in ids {
        hasher.update([0u8]);
        hasher.update(id.as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn remove_expired(cache: &Cache) -> usize {
    let now = Instant::now();
    let mut cache = cache.write();
    let before = cache.len();
    cache.retain(|_, entry| now < entry.expires_at);
    before - cache.len()
}

fn spawn_sweeper(
    cache: Cache,
    every: Duration,
    shutdown: CancellationToken,
) -> Option<JoinHandle<()>> {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        warn!("No async runtime, discovery cache sweep disabled");
        return None;
    };

    Some(runtime.spawn(async move {
        let mut interval = tokio::time::interval(every);
        // the first tick completes immediately
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let removed = remove_expired(&cache);
                    if removed > 0 {
                        debug!(removed, "Swept expired discovery cache entries");
                    }
                }
                () = shutdown.cancelled() => break,
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_is_order_independent() {
        let a = vec![Backend::new("x", "x"), Backend::new("y", "y")];
        let b = vec![Backend::new("y", "y"), Backend::new("x", "x")];
        assert_eq!(cache_key("alice", &a), cache_key("alice", &b));
        assert_ne!(cache_key("alice", &a), cache_key("bob", &a));
        assert_eq!(cache_key("alice", &a).len(), 64);
    }

    #[test]
    fn cache_key_does_not_merge_ids() {
        let joined = vec![Backend::new("ab", "ab")];
        let split = vec![Backend::new("a", "a"), Backend::new("b", "b")];
        assert_ne!(cache_key("u", &joined), cache_key("u", &split));
    }

    #[test]
    fn entry_validity_checks_expiry_and_version() {
        let now = Instant::now();
        let entry = CacheEntry {
            capabilities: Arc::new(AggregatedCapabilities::default()),
            expires_at: now + Duration::from_secs(10),
            registry_version: 3,
        };
        assert!(entry.is_valid(now, None));
        assert!(entry.is_valid(now, Some(3)));
        assert!(!entry.is_valid(now, Some(4)));
        assert!(!entry.is_valid(now + Duration::from_secs(10), Some(3)));
    }
}
