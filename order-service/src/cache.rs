//! Cache-aside layer in front of the order store.
//!
//! Every order is cached as four independent entries (order, delivery,
//! payment, items) that share one key space. A miss falls through to the
//! store and the result is cached for a fixed TTL; failed reads are never
//! cached. Entries expire purely by age, and a background sweeper purges
//! them. Without `max_entries` the cache is unbounded.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::models::*;
use crate::store::OrderStore;

pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Cache key generators. Every namespace carries a suffix so that no uid
/// can collide with another order's entry.
pub mod keys {
    pub fn order(order_uid: &str) -> String {
        format!("{}:order", order_uid)
    }

    pub fn delivery(order_uid: &str) -> String {
        format!("{}:delivery", order_uid)
    }

    pub fn payment(order_uid: &str) -> String {
        format!("{}:payment", order_uid)
    }

    pub fn items(order_uid: &str) -> String {
        format!("{}:items", order_uid)
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Lifetime of an entry, counted from insertion.
    pub ttl: Duration,
    /// How often expired entries are purged.
    pub sweep_interval: Duration,
    /// Upper bound on entries; the least recently used one is evicted first.
    pub max_entries: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            max_entries: None,
        }
    }
}

impl CacheConfig {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_max_entries(mut self, max_entries: Option<usize>) -> Self {
        self.max_entries = max_entries;
        self
    }
}

#[derive(Debug, Clone)]
enum CachedValue {
    Order(Order),
    Delivery(Delivery),
    Payment(Payment),
    Items(Vec<Item>),
}

/// A type that occupies one namespace of the cache.
trait Namespaced: Clone + Sized {
    const NAME: &'static str;

    fn key(order_uid: &str) -> String;
    fn into_cached(self) -> CachedValue;
    fn from_cached(value: CachedValue) -> Option<Self>;
}

impl Namespaced for Order {
    const NAME: &'static str = "order";

    fn key(order_uid: &str) -> String {
        keys::order(order_uid)
    }
    fn into_cached(self) -> CachedValue {
        CachedValue::Order(self)
    }
    fn from_cached(value: CachedValue) -> Option<Self> {
        match value {
            CachedValue::Order(order) => Some(order),
            _ => None,
        }
    }
}

impl Namespaced for Delivery {
    const NAME: &'static str = "delivery";

    fn key(order_uid: &str) -> String {
        keys::delivery(order_uid)
    }
    fn into_cached(self) -> CachedValue {
        CachedValue::Delivery(self)
    }
    fn from_cached(value: CachedValue) -> Option<Self> {
        match value {
            CachedValue::Delivery(delivery) => Some(delivery),
            _ => None,
        }
    }
}

impl Namespaced for Payment {
    const NAME: &'static str = "payment";

    fn key(order_uid: &str) -> String {
        keys::payment(order_uid)
    }
    fn into_cached(self) -> CachedValue {
        CachedValue::Payment(self)
    }
    fn from_cached(value: CachedValue) -> Option<Self> {
        match value {
            CachedValue::Payment(payment) => Some(payment),
            _ => None,
        }
    }
}

impl Namespaced for Vec<Item> {
    const NAME: &'static str = "items";

    fn key(order_uid: &str) -> String {
        keys::items(order_uid)
    }
    fn into_cached(self) -> CachedValue {
        CachedValue::Items(self)
    }
    fn from_cached(value: CachedValue) -> Option<Self> {
        match value {
            CachedValue::Items(items) => Some(items),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct Entry {
    value: CachedValue,
    expires_at: Instant,
    last_access: Instant,
}

pub struct AggregateCache {
    store: Arc<dyn OrderStore>,
    entries: DashMap<String, Entry>,
    config: CacheConfig,
}

impl AggregateCache {
    pub fn new(store: Arc<dyn OrderStore>, config: CacheConfig) -> Self {
        Self {
            store,
            entries: DashMap::new(),
            config,
        }
    }

    pub async fn get_order(&self, order_uid: &str) -> Result<Order, StoreError> {
        self.get_or_fetch(order_uid, self.store.read_order(order_uid)).await
    }

    pub async fn get_delivery(&self, order_uid: &str) -> Result<Delivery, StoreError> {
        self.get_or_fetch(order_uid, self.store.read_delivery(order_uid)).await
    }

    pub async fn get_payment(&self, order_uid: &str) -> Result<Payment, StoreError> {
        self.get_or_fetch(order_uid, self.store.read_payment(order_uid)).await
    }

    pub async fn get_items(&self, order_uid: &str) -> Result<Vec<Item>, StoreError> {
        self.get_or_fetch(order_uid, self.store.read_items(order_uid)).await
    }

    /// Loads every stored order into the order namespace.
    ///
    /// Delivery, payment and items stay cold until first requested.
    pub async fn warm_load(&self) -> Result<u64, StoreError> {
        let loaded = self
            .store
            .scan_orders(&mut |order: Order| {
                let key = Order::key(&order.order_uid);
                self.insert(key, order.into_cached());
            })
            .await?;

        info!("Warm-loaded {} orders into cache", loaded);
        Ok(loaded)
    }

    /// Removes expired entries and returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    /// Runs [`purge_expired`](Self::purge_expired) every `sweep_interval`
    /// until the cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let cache = Arc::downgrade(self);
        let period = self.config.sweep_interval;

        tokio::spawn(async move {
            let mut interval = time::interval_at(Instant::now() + period, period);

            loop {
                interval.tick().await;

                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let purged = cache.purge_expired();
                if purged > 0 {
                    debug!("Purged {} expired cache entries", purged);
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    async fn get_or_fetch<T, F>(&self, order_uid: &str, fetch: F) -> Result<T, StoreError>
    where
        T: Namespaced,
        F: std::future::Future<Output = Result<T, StoreError>>,
    {
        let key = T::key(order_uid);

        if let Some(value) = self.lookup(&key).and_then(T::from_cached) {
            debug!("Cache hit for {} {}", T::NAME, order_uid);
            return Ok(value);
        }

        debug!("Cache miss for {} {}", T::NAME, order_uid);
        let value = fetch.await?;
        self.insert(key, value.clone().into_cached());
        Ok(value)
    }

    fn lookup(&self, key: &str) -> Option<CachedValue> {
        let now = Instant::now();

        if let Some(mut entry) = self.entries.get_mut(key) {
            if entry.expires_at > now {
                entry.last_access = now;
                return Some(entry.value.clone());
            }
        } else {
            return None;
        }

        self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        None
    }

    fn insert(&self, key: String, value: CachedValue) {
        let now = Instant::now();

        if let Some(max_entries) = self.config.max_entries {
            if !self.entries.contains_key(&key) {
                while self.entries.len() >= max_entries && self.evict_least_recent() {}
            }
        }

        self.entries.insert(
            key,
            Entry {
                value,
                expires_at: now + self.config.ttl,
                last_access: now,
            },
        );
    }

    fn evict_least_recent(&self) -> bool {
        let victim = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().last_access)
            .map(|entry| entry.key().clone());

        match victim {
            Some(key) => {
                debug!("Evicting cache entry {}", key);
                self.entries.remove(&key).is_some()
            }
            None => false,
        }
    }
}
