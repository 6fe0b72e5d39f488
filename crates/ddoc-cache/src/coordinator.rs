use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::cache::{CacheShared, CacheStats};
use crate::cluster::{Broadcast, ClusterMessage};
use crate::entry::{self, EntryHandle, EntryId};
use crate::events::CacheEvent;
use crate::evictor::{self, DatabaseEvents};
use crate::key::{CacheKey, DbName, DdocId};

pub(crate) enum LruMsg<K: CacheKey> {
    /// Admit (or reuse) an entry actor for a key.
    Start {
        key: K,
        reply: oneshot::Sender<StartResult<K>>,
    },
    /// Local-origin eviction of a whole database; rebroadcast to the
    /// cluster including this node.
    Evict(DbName),
    /// Eviction directive, local or from a peer node.
    DoEvict(DbName),
    /// Local-origin refresh of design documents; rebroadcast likewise.
    Refresh {
        dbname: DbName,
        ddocids: Vec<DdocId>,
    },
    /// Refresh directive, local or from a peer node.
    DoRefresh {
        dbname: DbName,
        ddocids: Vec<DdocId>,
    },
    /// An entry actor terminated on its own (failed recovery).
    EntryExited {
        key: K,
        id: EntryId,
    },
    /// The database-event subscription ended.
    EvictorDied,
    Stats {
        reply: oneshot::Sender<CacheStats>,
    },
}

pub(crate) enum StartResult<K: CacheKey> {
    Started(EntryHandle<K>),
    /// No space and nothing evictable; the caller bypasses the cache.
    Full,
}

/// Spawns the coordinator task and its event subscription.
///
/// The coordinator is the sole mutator of the admission bookkeeping
/// (`entries`, `dbs`, `size`), which is what keeps `trim` from ever racing
/// with another start. It runs until every sender is gone or the shutdown
/// guard is dropped, then tears down the entries it still owns.
pub(crate) fn spawn<K: CacheKey>(
    shared: Arc<CacheShared<K>>,
    tx: mpsc::UnboundedSender<LruMsg<K>>,
    rx: mpsc::UnboundedReceiver<LruMsg<K>>,
    broadcast: Arc<dyn Broadcast>,
    db_events: Arc<dyn DatabaseEvents>,
    shutdown: oneshot::Receiver<()>,
) {
    let evictor = evictor::spawn(db_events.clone(), tx.clone());
    let coordinator = Coordinator {
        shared,
        rx,
        tx,
        shutdown,
        broadcast,
        db_events,
        entries: HashMap::new(),
        dbs: HashMap::new(),
        size: 0,
        evictor,
    };
    tokio::spawn(coordinator.run());
}

struct Coordinator<K: CacheKey> {
    shared: Arc<CacheShared<K>>,
    rx: mpsc::UnboundedReceiver<LruMsg<K>>,
    tx: mpsc::UnboundedSender<LruMsg<K>>,
    shutdown: oneshot::Receiver<()>,
    broadcast: Arc<dyn Broadcast>,
    db_events: Arc<dyn DatabaseEvents>,
    /// Every live entry actor, by incarnation id.
    entries: HashMap<EntryId, (K, EntryHandle<K>)>,
    /// dbname -> ddocid -> key -> id, for O(1) database eviction and
    /// per-design-document refresh. The `None` bucket holds keys whose
    /// document id is unknown at publish time.
    dbs: HashMap<DbName, HashMap<Option<DdocId>, HashMap<K, EntryId>>>,
    size: usize,
    evictor: JoinHandle<()>,
}

impl<K: CacheKey> Coordinator<K> {
    async fn run(mut self) {
        loop {
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(msg) => self.handle(msg).await,
                    None => break,
                },
                _ = &mut self.shutdown => break,
            }
        }
        self.teardown().await;
    }

    async fn handle(&mut self, msg: LruMsg<K>) {
        match msg {
            LruMsg::Start { key, reply } => {
                let result = self.start(key).await;
                reply.send(result).ok();
            }
            LruMsg::Evict(dbname) => {
                tracing::debug!(%dbname, "broadcasting database eviction");
                self.broadcast.broadcast(ClusterMessage::Evict(dbname));
            }
            LruMsg::DoEvict(dbname) => self.do_evict(dbname).await,
            LruMsg::Refresh { dbname, ddocids } => {
                tracing::debug!(%dbname, "broadcasting design document refresh");
                self.broadcast
                    .broadcast(ClusterMessage::Refresh { dbname, ddocids });
            }
            LruMsg::DoRefresh { dbname, ddocids } => self.do_refresh(&dbname, ddocids),
            LruMsg::EntryExited { key, id } => self.entry_exited(&key, id),
            LruMsg::EvictorDied => {
                tracing::warn!("database event subscription died, resubscribing");
                self.shared.events.emit(CacheEvent::EvictorDied);
                self.evictor = evictor::spawn(self.db_events.clone(), self.tx.clone());
            }
            LruMsg::Stats { reply } => {
                reply.send(self.stats()).ok();
            }
        }
    }

    async fn start(&mut self, key: K) -> StartResult<K> {
        if let Some(record) = self.shared.index.lookup(&key) {
            if let Some(pid) = record.pid {
                return StartResult::Started(pid);
            }
        }

        let max_size = self.shared.max_size.get();
        if !self.trim(max_size).await {
            self.shared.events.emit(CacheEvent::Full(key));
            return StartResult::Full;
        }

        self.shared.index.reserve(&key);
        let handle = entry::spawn(key.clone(), self.shared.clone(), self.tx.clone());
        self.entries.insert(handle.id, (key.clone(), handle.clone()));
        self.dbs
            .entry(key.dbname().to_owned())
            .or_default()
            .entry(key.ddocid().map(str::to_owned))
            .or_default()
            .insert(key, handle.id);
        self.size += 1;
        metric!(gauge("ddoc_cache.entries") = self.size as u64);

        StartResult::Started(handle)
    }

    /// Makes room for one admission.
    ///
    /// Returns `false` when the cache is disabled (`max_size == 0`) or at
    /// capacity with no eviction candidate.
    async fn trim(&mut self, max_size: usize) -> bool {
        if max_size == 0 {
            return false;
        }
        if self.size < max_size {
            return true;
        }
        let Some(item) = self.shared.lru.first() else {
            return false;
        };
        self.remove_entry(item.id).await;
        // The actor normally deletes its own marker during shutdown; this
        // keeps the recency index from wedging if it died uncleanly.
        self.shared.lru.remove(&item);
        true
    }

    /// Evicts one entry: unlink it from the exit bookkeeping first, so the
    /// actor's normal exit after `shutdown` is not mistaken for a failure.
    async fn remove_entry(&mut self, id: EntryId) {
        let Some((key, handle)) = self.entries.remove(&id) else {
            return;
        };
        self.prune_dbs(&key, id);
        self.size -= 1;
        metric!(gauge("ddoc_cache.entries") = self.size as u64);

        handle.shutdown().await;
        self.shared.index.remove_matching(&key, id);
        self.shared.events.emit(CacheEvent::Removed(key));
    }

    async fn do_evict(&mut self, dbname: DbName) {
        match self.dbs.remove(&dbname) {
            Some(ddocs) => {
                let targets: Vec<(K, EntryId)> = ddocs
                    .into_values()
                    .flat_map(|keys| keys.into_iter())
                    .collect();
                tracing::debug!(%dbname, entries = targets.len(), "evicting database");
                for (_, id) in targets {
                    self.remove_entry(id).await;
                }
                self.shared.events.emit(CacheEvent::Evicted(dbname));
            }
            None => {
                self.shared.events.emit(CacheEvent::EvictNoop(dbname));
            }
        }
    }

    fn do_refresh(&mut self, dbname: &str, ddocids: Vec<DdocId>) {
        let Some(ddocs) = self.dbs.get(dbname) else {
            return;
        };
        // The `None` bucket is always included: keys without a document id
        // must be refreshed by every database-wide refresh.
        for ddocid in std::iter::once(None).chain(ddocids.into_iter().map(Some)) {
            if let Some(keys) = ddocs.get(&ddocid) {
                for id in keys.values() {
                    if let Some((_, handle)) = self.entries.get(id) {
                        handle.refresh();
                    }
                }
            }
        }
    }

    fn entry_exited(&mut self, key: &K, id: EntryId) {
        if self.entries.remove(&id).is_some() {
            self.prune_dbs(key, id);
            self.size -= 1;
            metric!(gauge("ddoc_cache.entries") = self.size as u64);
        }
    }

    fn prune_dbs(&mut self, key: &K, id: EntryId) {
        let Some(ddocs) = self.dbs.get_mut(key.dbname()) else {
            return;
        };
        let ddocid = key.ddocid().map(str::to_owned);
        if let Some(keys) = ddocs.get_mut(&ddocid) {
            if keys.get(key) == Some(&id) {
                keys.remove(key);
            }
            if keys.is_empty() {
                ddocs.remove(&ddocid);
            }
        }
        if ddocs.is_empty() {
            self.dbs.remove(key.dbname());
        }
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.size,
            tracked_entries: self.entries.len(),
            index_rows: self.shared.index.live_len(),
            lru_items: self.shared.lru.len(),
            tracked_databases: self.dbs.len(),
        }
    }

    async fn teardown(mut self) {
        self.evictor.abort();
        for (_, (_, handle)) in self.entries.drain() {
            handle.shutdown().await;
        }
    }
}
