use std::hash::Hash;

use futures::future::BoxFuture;

use crate::error::CacheEntry;

/// The logical name of a clustered database.
pub type DbName = String;

/// A design document id, e.g. `_design/app`.
pub type DdocId = String;

/// The capability a cacheable key provides.
///
/// A key identifies one cached lookup. The expected shape is an enum with
/// one variant per kind of lookup (full design document, document at a
/// revision, compiled validation functions, ...), each variant carrying its
/// arguments; the trait methods dispatch per variant. Two keys are equal iff
/// they have the same variant and arguments.
///
/// The cache never inspects [`Value`](Self::Value); it only clones it to
/// hand out to readers and compares it against the previous value when a
/// periodic refresh lands.
pub trait CacheKey: Clone + Ord + Hash + Send + Sync + 'static {
    /// The payload produced by [`recover`](Self::recover).
    type Value: Clone + PartialEq + Send + Sync + 'static;

    /// The logical database this key belongs to.
    ///
    /// Database-wide eviction removes every key with a matching name.
    fn dbname(&self) -> &str;

    /// The design document id this key belongs to, if one is known.
    ///
    /// Returning `None` marks the key as refreshable by every
    /// database-wide refresh directive, since its identifier cannot be
    /// matched at publish time.
    fn ddocid(&self) -> Option<&str>;

    /// Produce the value for this key.
    ///
    /// This is the expensive part: a shard fetch plus whatever custom
    /// recovery logic the variant needs. It runs inside a spawned opener
    /// task; a panic in the returned future is reported to waiters as
    /// [`CacheError::Recovery`](crate::CacheError::Recovery).
    fn recover(&self) -> BoxFuture<'static, CacheEntry<Self::Value>>;
}
