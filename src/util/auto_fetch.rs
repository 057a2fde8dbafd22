use log::{debug, info};
use moka::future::Cache;
use moka::notification::RemovalCause;
use moka::Expiry;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use std::fmt::Debug;

/// How long a loaded value may be served before it is fetched again.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Expiration {
    AtOnce,
    Short,
    Middle,
    Long,
    Never,
}

impl Expiration {
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Expiration::AtOnce => Some(Duration::from_secs(0)),
            Expiration::Short => Some(Duration::from_secs(2)),
            Expiration::Middle => Some(Duration::from_secs(60)),
            Expiration::Long => Some(Duration::from_secs(1800)),
            Expiration::Never => None,
        }
    }
}

pub struct MyExpiry;

impl<K, V> Expiry<K, (Expiration, V)> for MyExpiry
where
    K: Clone + std::hash::Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn expire_after_create(
        &self,
        _key: &K,
        value: &(Expiration, V),
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        value.0.as_duration()
    }

    fn expire_after_update(
        &self,
        _key: &K,
        value: &(Expiration, V),
        _updated_at: std::time::Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.0.as_duration()
    }
}

pub type AutoCacheReadHandle<T, E> = JoinHandle<Result<(T, Expiration), E>>;

/// Read-through cache: misses are served by `value_loader`, which also decides how
/// long its answer stays valid. Writers go to the store and call `invalidate`.
pub struct AutoCache<K, V, F, E>
where
    K: Clone + std::hash::Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    F: Fn(K) -> AutoCacheReadHandle<V, E> + Send + Sync + 'static,
{
    cache: Cache<K, (Expiration, V)>,
    capacity: usize,
    value_loader: Arc<F>,
}

fn eviction_listener<K: Debug, V>(key: Arc<K>, _value: V, cause: RemovalCause) {
    let value_type = std::any::type_name::<V>();
    info!("Evicted key {key:?} -> {} Cause: {cause:?}", value_type);
}

impl<K, V, F, E> AutoCache<K, V, F, E>
where
    K: Clone + std::hash::Hash + Eq + Send + Sync + Debug + 'static,
    V: Clone + Send + Sync + 'static,
    F: Fn(K) -> AutoCacheReadHandle<V, E> + Send + Sync + 'static,
    E: From<tokio::task::JoinError>,
{
    pub fn new(capacity: usize, value_loader: F) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(capacity as u64)
                .expire_after(MyExpiry)
                .eviction_listener(eviction_listener)
                .build(),
            capacity,
            value_loader: Arc::new(value_loader),
        }
    }

    pub fn size(&self) -> (usize, usize) {
        (self.cache.entry_count() as usize, self.capacity)
    }

    pub async fn get(&self, key: K) -> Result<V, E> {
        if let Some(value) = self.cache.get(&key).await {
            debug!("Got cached key {key:?} -> {}", std::any::type_name::<V>());
            return Ok(value.1);
        }

        debug!("Fetching key {key:?} -> {}", std::any::type_name::<V>());
        let (value, expiry) = (self.value_loader)(key.clone()).await??;

        if expiry != Expiration::AtOnce {
            debug!(
                "Caching fetched key {key:?} -> {}",
                std::any::type_name::<V>()
            );
            self.cache.insert(key, (expiry, value.clone())).await;
        }

        Ok(value)
    }

    pub async fn invalidate(&self, key: K) {
        self.cache.invalidate(&key).await
    }
}
