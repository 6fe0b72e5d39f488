use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};

use crate::cluster::{Broadcast, ClusterMessage, LocalBroadcast};
use crate::config::{CacheConfig, MaxSize};
use crate::coordinator::{self, LruMsg, StartResult};
use crate::entry::StaleEntry;
use crate::error::CacheEntry;
use crate::events::{CacheEvent, EventSink};
use crate::evictor::DatabaseEvents;
use crate::index::CacheIndex;
use crate::key::{CacheKey, DbName, DdocId};
use crate::lru::LruIndex;

/// State shared between the fast path, the entry actors and the
/// coordinator.
pub(crate) struct CacheShared<K: CacheKey> {
    pub index: CacheIndex<K>,
    pub lru: LruIndex<K>,
    pub events: EventSink<K>,
    pub max_size: MaxSize,
    pub refresh_interval: Duration,
}

/// A point-in-time snapshot of the cache bookkeeping.
///
/// In a healthy cache `entries`, `tracked_entries` and `index_rows` are
/// always equal, and `lru_items` never exceeds them (entries still on
/// their first fetch have no recency marker yet).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheStats {
    /// Live entries as counted by the coordinator.
    pub entries: usize,
    /// Entry actors the coordinator tracks for exit handling.
    pub tracked_entries: usize,
    /// Index rows bound to a live actor.
    pub index_rows: usize,
    /// Recency markers.
    pub lru_items: usize,
    /// Databases with at least one cached entry.
    pub tracked_databases: usize,
}

/// The design document cache.
///
/// A bounded LRU of design documents in which every entry is an
/// independent actor owning its in-flight recovery, its periodic refresh
/// timer and its waiters, while a single coordinator serializes admission
/// and eviction. Concurrent misses for one key are coalesced into a single
/// recovery; database creation or deletion evicts every entry of that
/// database on every node.
///
/// The handle is cheap to clone. Dropping the last clone shuts down the
/// coordinator, the event subscription and every entry actor. Must be
/// created from within a tokio runtime.
pub struct DdocCache<K: CacheKey> {
    inner: Arc<Inner<K>>,
}

impl<K: CacheKey> Clone for DdocCache<K> {
    fn clone(&self) -> Self {
        DdocCache {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<K: CacheKey> {
    shared: Arc<CacheShared<K>>,
    coordinator: mpsc::UnboundedSender<LruMsg<K>>,
    /// Dropping this wakes the coordinator into teardown.
    _shutdown: oneshot::Sender<()>,
}

impl<K: CacheKey> DdocCache<K> {
    /// Creates a single-node cache: evictions and refreshes are dispatched
    /// locally only.
    pub fn new(config: CacheConfig, db_events: Arc<dyn DatabaseEvents>) -> Self {
        Self::build(config, db_events, None)
    }

    /// Creates a cache whose eviction and refresh directives are fanned
    /// out through `broadcast` (see [`Broadcast`] for the delivery
    /// contract).
    pub fn with_broadcast(
        config: CacheConfig,
        db_events: Arc<dyn DatabaseEvents>,
        broadcast: Arc<dyn Broadcast>,
    ) -> Self {
        Self::build(config, db_events, Some(broadcast))
    }

    fn build(
        config: CacheConfig,
        db_events: Arc<dyn DatabaseEvents>,
        broadcast: Option<Arc<dyn Broadcast>>,
    ) -> Self {
        let shared = Arc::new(CacheShared {
            index: CacheIndex::new(),
            lru: LruIndex::new(),
            events: EventSink::new(),
            max_size: MaxSize::new(config.max_size),
            refresh_interval: config.refresh_interval,
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let broadcast =
            broadcast.unwrap_or_else(|| Arc::new(LocalBroadcast::new(tx.clone())));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        coordinator::spawn(
            shared.clone(),
            tx.clone(),
            rx,
            broadcast,
            db_events,
            shutdown_rx,
        );

        DdocCache {
            inner: Arc::new(Inner {
                shared,
                coordinator: tx,
                _shutdown: shutdown_tx,
            }),
        }
    }

    /// Opens the design document for `key`.
    ///
    /// Fast path: a cached value is returned immediately and only bumps
    /// the entry's recency. A miss either joins the in-flight recovery or
    /// admits a new entry. When the cache cannot hold the entry (disabled,
    /// or full with nothing evictable) or the entry died underneath us,
    /// the recovery runs directly on behalf of this caller.
    ///
    /// Errors are recovery errors verbatim; the cache never surfaces a
    /// structural condition of its own.
    pub async fn open(&self, key: &K) -> CacheEntry<K::Value> {
        match self.inner.shared.index.lookup(key) {
            Some(record) => match record.pid {
                Some(pid) => match record.val {
                    Some(val) => {
                        metric!(counter("ddoc_cache.hit") += 1);
                        pid.accessed();
                        val
                    }
                    None => {
                        metric!(counter("ddoc_cache.miss") += 1);
                        match pid.open().await {
                            Ok(entry) => entry,
                            Err(StaleEntry) => self.recover_direct(key).await,
                        }
                    }
                },
                None => self.start_and_open(key, false).await,
            },
            None => self.start_and_open(key, true).await,
        }
    }

    async fn start_and_open(&self, key: &K, is_miss: bool) -> CacheEntry<K::Value> {
        let (reply, rx) = oneshot::channel();
        let sent = self
            .inner
            .coordinator
            .send(LruMsg::Start {
                key: key.clone(),
                reply,
            })
            .is_ok();
        let result = if sent { rx.await.ok() } else { None };

        match result {
            Some(StartResult::Started(pid)) => {
                if is_miss {
                    metric!(counter("ddoc_cache.miss") += 1);
                } else {
                    metric!(counter("ddoc_cache.recovery") += 1);
                }
                match pid.open().await {
                    Ok(entry) => entry,
                    Err(StaleEntry) => self.recover_direct(key).await,
                }
            }
            Some(StartResult::Full) | None => self.recover_direct(key).await,
        }
    }

    async fn recover_direct(&self, key: &K) -> CacheEntry<K::Value> {
        metric!(counter("ddoc_cache.recovery") += 1);
        key.recover().await
    }

    /// Evicts every cached entry of a database, cluster-wide.
    pub fn evict(&self, dbname: impl Into<DbName>) {
        self.inner
            .coordinator
            .send(LruMsg::Evict(dbname.into()))
            .ok();
    }

    /// Re-runs recovery for the named design documents of a database,
    /// cluster-wide. Entries whose document id is unknown are always
    /// included.
    pub fn refresh(&self, dbname: impl Into<DbName>, ddocids: Vec<DdocId>) {
        self.inner
            .coordinator
            .send(LruMsg::Refresh {
                dbname: dbname.into(),
                ddocids,
            })
            .ok();
    }

    /// Delivery point for directives arriving from peer nodes.
    pub fn handle_cluster_message(&self, msg: ClusterMessage) {
        let msg = match msg {
            ClusterMessage::Evict(dbname) => LruMsg::DoEvict(dbname),
            ClusterMessage::Refresh { dbname, ddocids } => LruMsg::DoRefresh { dbname, ddocids },
        };
        self.inner.coordinator.send(msg).ok();
    }

    /// Subscribes to the cache's observability events. Lossy.
    pub fn subscribe_events(&self) -> broadcast::Receiver<CacheEvent<K>> {
        self.inner.shared.events.subscribe()
    }

    /// Number of live cache entries.
    pub fn entry_count(&self) -> usize {
        self.inner.shared.index.live_len()
    }

    /// Handle to the entry bound, for live reconfiguration.
    pub fn max_size(&self) -> MaxSize {
        self.inner.shared.max_size.clone()
    }

    /// Snapshot of the coordinator's bookkeeping, or `None` while the
    /// cache is shutting down.
    pub async fn stats(&self) -> Option<CacheStats> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .coordinator
            .send(LruMsg::Stats { reply })
            .ok()?;
        rx.await.ok()
    }
}
