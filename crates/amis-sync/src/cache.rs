//! Time-bounded memoization of the whole pipeline output.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use amis_core::{sort_for_display, TransactionRecord};
use async_trait::async_trait;
use tracing::{debug, warn};

/// Single-slot cache with a fixed validity window. The slot is only replaced
/// after it expires (or on [`TtlCache::invalidate`]); contents are never inspected.
#[derive(Debug)]
pub struct TtlCache<T> {
    ttl: Duration,
    slot: Mutex<Option<CacheEntry<T>>>,
}

#[derive(Debug)]
struct CacheEntry<T> {
    value: T,
    expires_at: Instant,
}

impl<T: Clone> TtlCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: Mutex::new(None),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self) -> Option<T> {
        self.get_at(Instant::now())
    }

    pub fn get_at(&self, now: Instant) -> Option<T> {
        let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.as_ref()
            .filter(|entry| now < entry.expires_at)
            .map(|entry| entry.value.clone())
    }

    pub fn store(&self, value: T) {
        self.store_at(value, Instant::now());
    }

    pub fn store_at(&self, value: T, now: Instant) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(CacheEntry {
            value,
            expires_at: now + self.ttl,
        });
    }

    pub fn invalidate(&self) {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Anything that can produce the full record set for the dashboard.
#[async_trait]
pub trait RecordProvider: Send + Sync {
    async fn load(&self) -> anyhow::Result<Vec<TransactionRecord>>;
}

/// Fixed in-memory record set.
#[derive(Debug, Clone, Default)]
pub struct StaticRecords {
    records: Vec<TransactionRecord>,
}

impl StaticRecords {
    pub fn new(mut records: Vec<TransactionRecord>) -> Self {
        sort_for_display(&mut records);
        Self { records }
    }
}

#[async_trait]
impl RecordProvider for StaticRecords {
    async fn load(&self) -> anyhow::Result<Vec<TransactionRecord>> {
        Ok(self.records.clone())
    }
}

/// A [`RecordProvider`] behind a [`TtlCache`]. Load failures degrade to an
/// empty set and are not cached, so the next request retries.
///
/// At most one reload runs at a time; callers that miss while a reload is in
/// flight wait for it and take its result.
pub struct CachedRecords<P: ?Sized> {
    cache: TtlCache<Arc<Vec<TransactionRecord>>>,
    refresh: tokio::sync::Mutex<()>,
    provider: Arc<P>,
}

impl<P: RecordProvider + ?Sized> CachedRecords<P> {
    pub fn new(provider: Arc<P>, ttl: Duration) -> Self {
        Self {
            cache: TtlCache::new(ttl),
            refresh: tokio::sync::Mutex::new(()),
            provider,
        }
    }

    pub async fn records(&self) -> Arc<Vec<TransactionRecord>> {
        if let Some(hit) = self.cache.get() {
            return hit;
        }
        let _refresh = self.refresh.lock().await;
        if let Some(hit) = self.cache.get() {
            return hit;
        }
        match self.provider.load().await {
            Ok(records) => {
                debug!(
                    records = records.len(),
                    ttl_secs = self.cache.ttl().as_secs(),
                    "refreshed record cache"
                );
                let records = Arc::new(records);
                self.cache.store(Arc::clone(&records));
                records
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "record load failed; serving empty set");
                Arc::new(Vec::new())
            }
        }
    }

    pub fn invalidate(&self) {
        self.cache.invalidate();
    }
}
