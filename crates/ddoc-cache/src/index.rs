use dashmap::DashMap;

use crate::entry::{EntryHandle, EntryId};
use crate::error::CacheEntry;
use crate::key::CacheKey;

/// One row of the shared cache table.
///
/// `pid` is `None` between the coordinator reserving the row and the entry
/// actor attaching itself; `val` is `None` until the first successful
/// recovery. Each row's `val` is written exclusively by the actor currently
/// bound to it, which is why every write and delete is qualified by the
/// actor id: a stale actor can never clobber a row belonging to a newer
/// incarnation under the same key.
#[derive(Clone)]
pub(crate) struct EntryRecord<K: CacheKey> {
    pub pid: Option<EntryHandle<K>>,
    pub val: Option<CacheEntry<K::Value>>,
}

/// The shared `Key -> EntryRecord` table.
///
/// Readers on the open fast path only ever call [`lookup`](Self::lookup);
/// all structural mutation happens through the coordinator and the entry
/// actors.
pub(crate) struct CacheIndex<K: CacheKey> {
    rows: DashMap<K, EntryRecord<K>>,
}

impl<K: CacheKey> CacheIndex<K> {
    pub fn new() -> Self {
        CacheIndex {
            rows: DashMap::new(),
        }
    }

    pub fn lookup(&self, key: &K) -> Option<EntryRecord<K>> {
        self.rows.get(key).map(|row| row.clone())
    }

    /// Reserves a row for a key about to get an entry actor.
    pub fn reserve(&self, key: &K) {
        self.rows
            .entry(key.clone())
            .or_insert_with(|| EntryRecord {
                pid: None,
                val: None,
            });
    }

    /// Binds a freshly spawned actor to its reserved row.
    pub fn attach(&self, key: &K, pid: EntryHandle<K>) {
        if let Some(mut row) = self.rows.get_mut(key) {
            row.pid = Some(pid);
        }
    }

    /// Stores a recovered value, but only into the row still owned by `id`.
    pub fn store_val(&self, key: &K, id: EntryId, val: CacheEntry<K::Value>) {
        if let Some(mut row) = self.rows.get_mut(key) {
            if row.pid.as_ref().map(|pid| pid.id) == Some(id) {
                row.val = Some(val);
            }
        }
    }

    /// Deletes the row for `key` if it is still owned by `id`.
    ///
    /// Tolerates the row being absent: the coordinator's eviction path and
    /// the actor's termination cleanup may both attempt this delete.
    pub fn remove_matching(&self, key: &K, id: EntryId) {
        self.rows
            .remove_if(key, |_, row| row.pid.as_ref().map(|pid| pid.id) == Some(id));
    }

    /// Number of rows bound to a live actor.
    pub fn live_len(&self) -> usize {
        self.rows.iter().filter(|row| row.pid.is_some()).count()
    }

    #[cfg(test)]
    pub fn live_keys(&self) -> Vec<K> {
        self.rows
            .iter()
            .filter(|row| row.pid.is_some())
            .map(|row| row.key().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use crate::test::TestKey;

    use super::*;

    fn handle(id: EntryId) -> EntryHandle<TestKey> {
        let (tx, _rx) = mpsc::unbounded_channel();
        EntryHandle::stub(id, tx)
    }

    #[test]
    fn test_store_val_requires_matching_id() {
        let index = CacheIndex::new();
        let key = TestKey::new("db", Some("_design/app"));
        let id = EntryId::next();

        index.reserve(&key);
        index.attach(&key, handle(id));

        index.store_val(&key, EntryId::next(), Ok("stale".to_string()));
        assert_eq!(index.lookup(&key).unwrap().val, None);

        index.store_val(&key, id, Ok("fresh".to_string()));
        assert_eq!(index.lookup(&key).unwrap().val, Some(Ok("fresh".to_string())));
    }

    #[test]
    fn test_remove_matching_tolerates_stale_and_absent() {
        let index = CacheIndex::new();
        let key = TestKey::new("db", Some("_design/app"));
        let id = EntryId::next();

        index.reserve(&key);
        index.attach(&key, handle(id));

        // A stale actor cannot delete a row owned by a newer incarnation.
        index.remove_matching(&key, EntryId::next());
        assert!(index.lookup(&key).is_some());

        index.remove_matching(&key, id);
        assert!(index.lookup(&key).is_none());

        // Double delete is a no-op.
        index.remove_matching(&key, id);
        assert_eq!(index.live_len(), 0);
    }
}
