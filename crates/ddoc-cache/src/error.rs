use std::time::Duration;

use thiserror::Error;

/// An error produced while recovering a design document for a cache key.
///
/// This error enum is intended for storing in cache slots: it is cheap to
/// clone so that a single failed recovery can be handed verbatim to every
/// waiter that piled up behind the in-flight opener.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The design document does not exist (or was deleted).
    #[error("not found")]
    NotFound,
    /// The shard fetch did not complete in time.
    #[error("recovery timed out after {0:?}")]
    Timeout(Duration),
    /// The shard fetch failed, e.g. because no replica was reachable.
    ///
    /// The attached string contains the underlying error message.
    #[error("fetch failed: {0}")]
    Fetch(String),
    /// The document was fetched but could not be interpreted.
    #[error("malformed: {0}")]
    Malformed(String),
    /// The opener task died before delivering a result (panic or abort).
    #[error("recovery failed: {0}")]
    Recovery(String),
}

/// A cache slot value, either the recovered document or the reason recovery
/// failed.
pub type CacheEntry<T> = Result<T, CacheError>;
