use tokio::sync::broadcast;

use crate::key::{CacheKey, DbName};

/// Capacity of the observability channel.
///
/// Events are lossy by design; a slow subscriber only ever misses old
/// events, it never backpressures the cache.
const EVENT_CHANNEL_SIZE: usize = 1024;

/// Lifecycle notifications emitted by the cache.
///
/// These exist for tests and debugging tooling: they describe every
/// externally observable transition of the cache without exposing its
/// internals. Emission is fire-and-forget; with no subscriber the cost is
/// a single atomic load.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheEvent<K> {
    /// An entry actor was spawned for a key.
    Started(K),
    /// An `open` was served from the cached value.
    Accessed(K),
    /// The first value for a key landed in the cache.
    Inserted(K),
    /// A refresh produced a value different from the cached one.
    Updated(K),
    /// A refresh produced a value equal to the cached one.
    UpdateNoop(K),
    /// An entry was removed by the coordinator (LRU or database eviction).
    Removed(K),
    /// Admission was refused because no entry could be evicted.
    Full(K),
    /// All entries of a database were evicted.
    Evicted(DbName),
    /// A database eviction matched no entries.
    EvictNoop(DbName),
    /// The database-event subscription ended; a new one is being set up.
    EvictorDied,
}

pub(crate) struct EventSink<K: CacheKey> {
    tx: broadcast::Sender<CacheEvent<K>>,
}

impl<K: CacheKey> EventSink<K> {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        EventSink { tx }
    }

    pub fn emit(&self, event: CacheEvent<K>) {
        // Err means nobody is listening, which is the common case.
        self.tx.send(event).ok();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent<K>> {
        self.tx.subscribe()
    }
}
