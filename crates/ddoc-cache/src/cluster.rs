use tokio::sync::mpsc;

use crate::coordinator::LruMsg;
use crate::key::{CacheKey, DbName, DdocId};

/// A directive propagated to every node of the cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClusterMessage {
    /// Drop every cache entry of a database.
    Evict(DbName),
    /// Re-run recovery for the named design documents of a database.
    Refresh {
        dbname: DbName,
        ddocids: Vec<DdocId>,
    },
}

/// Best-effort fan-out of cache directives across the cluster.
///
/// Implementations must deliver `msg` to the cache of every node,
/// *including the local one* (via
/// [`DdocCache::handle_cluster_message`](crate::DdocCache::handle_cluster_message)),
/// so that a single code path serves both origins. `broadcast` returns
/// after local dispatch; remote delivery is fire-and-forget.
pub trait Broadcast: Send + Sync + 'static {
    fn broadcast(&self, msg: ClusterMessage);
}

/// The built-in single-node broadcaster: local delivery only.
pub(crate) struct LocalBroadcast<K: CacheKey> {
    tx: mpsc::UnboundedSender<LruMsg<K>>,
}

impl<K: CacheKey> LocalBroadcast<K> {
    pub fn new(tx: mpsc::UnboundedSender<LruMsg<K>>) -> Self {
        LocalBroadcast { tx }
    }
}

impl<K: CacheKey> Broadcast for LocalBroadcast<K> {
    fn broadcast(&self, msg: ClusterMessage) {
        let msg = match msg {
            ClusterMessage::Evict(dbname) => LruMsg::DoEvict(dbname),
            ClusterMessage::Refresh { dbname, ddocids } => LruMsg::DoRefresh { dbname, ddocids },
        };
        self.tx.send(msg).ok();
    }
}
