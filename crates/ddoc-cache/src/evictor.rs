use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::coordinator::LruMsg;
use crate::key::CacheKey;

/// A database lifecycle notification, keyed by shard path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum DatabaseEvent {
    Created,
    Deleted,
    Updated,
    Compacted,
}

/// The database-event subscription source the cache consumes.
///
/// Every call to [`subscribe`](Self::subscribe) sets up a fresh stream of
/// `(shard_dbname, event)` pairs. The cache resubscribes if a stream ends.
pub trait DatabaseEvents: Send + Sync + 'static {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<(String, DatabaseEvent)>;
}

/// Spawns the task adapting database events into coordinator messages.
///
/// Creation and deletion of any shard evict the whole logical database:
/// both invalidate whatever this node has cached for it. Other events are
/// ignored.
pub(crate) fn spawn<K: CacheKey>(
    source: Arc<dyn DatabaseEvents>,
    coordinator: mpsc::UnboundedSender<LruMsg<K>>,
) -> JoinHandle<()> {
    let mut events = source.subscribe();
    tokio::spawn(async move {
        while let Some((shard, event)) = events.recv().await {
            match event {
                DatabaseEvent::Created | DatabaseEvent::Deleted => {
                    let dbname = dbname_from_shard(&shard);
                    tracing::trace!(%shard, %dbname, ?event, "database lifecycle event");
                    if coordinator.send(LruMsg::Evict(dbname)).is_err() {
                        return;
                    }
                }
                _ => {}
            }
        }
        coordinator.send(LruMsg::EvictorDied).ok();
    })
}

/// Reduces a shard path to the logical database name.
///
/// Shard databases live at `shards/<range>/<dbname>.<suffix>`; events for
/// any shard must evict the cache rows of the logical database, which is
/// what the `dbs` bookkeeping is keyed by. Names that are not shard paths
/// pass through unchanged.
pub(crate) fn dbname_from_shard(shard: &str) -> String {
    match shard.strip_prefix("shards/").and_then(|rest| rest.split_once('/')) {
        Some((_range, db)) => match db.rsplit_once('.') {
            Some((name, suffix))
                if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) =>
            {
                name.to_owned()
            }
            _ => db.to_owned(),
        },
        None => shard.to_owned(),
    }
}
