use std::collections::BTreeSet;
use std::time::Instant;

use parking_lot::Mutex;

use crate::entry::EntryId;
use crate::key::CacheKey;

/// One recency marker.
///
/// Ordering is `(ts, key, id)`: the timestamp comes from a monotonic clock,
/// and the key/id tie-breakers guarantee two actors never alias even when
/// their timestamps collide.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct LruItem<K: CacheKey> {
    pub ts: Instant,
    pub key: K,
    pub id: EntryId,
}

/// The shared recency index.
///
/// Entry actors maintain their own single item; the coordinator only ever
/// reads the minimum when it needs an eviction candidate. A given
/// `(key, id)` pair appears at most once.
pub(crate) struct LruIndex<K: CacheKey> {
    items: Mutex<BTreeSet<LruItem<K>>>,
}

impl<K: CacheKey> LruIndex<K> {
    pub fn new() -> Self {
        LruIndex {
            items: Mutex::new(BTreeSet::new()),
        }
    }

    /// Replaces an actor's recency marker in a single lock acquisition.
    pub fn touch(&self, old: Option<LruItem<K>>, new: LruItem<K>) {
        let mut items = self.items.lock();
        if let Some(old) = old {
            items.remove(&old);
        }
        items.insert(new);
    }

    /// Removes an exact marker, tolerating it being absent.
    pub fn remove(&self, item: &LruItem<K>) -> bool {
        self.items.lock().remove(item)
    }

    /// The least recently used marker, if any.
    pub fn first(&self) -> Option<LruItem<K>> {
        self.items.lock().first().cloned()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }
}
