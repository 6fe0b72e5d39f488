//! An in-memory cache of design documents for a clustered document
//! database.
//!
//! Resolving a design document is expensive: it fetches from a shard, may
//! run custom recovery logic, and is requested by many concurrent readers.
//! This cache keeps recently used documents resident, bounds the number of
//! entries, refreshes each one periodically so stale versions do not
//! linger, evicts everything belonging to a database when that database is
//! created or deleted, and coalesces concurrent misses so at most one
//! recovery runs per key.
//!
//! Internally every cached key is an independent actor task owning one
//! in-flight recovery (or one refresh timer) and its waiters, while a
//! single coordinator task serializes admission and eviction against a
//! shared, lock-free index. See [`DdocCache`] for the entry point and
//! [`CacheKey`] for the capability a cacheable key provides.

#[macro_use]
pub mod metrics;

pub mod cache;
pub mod cluster;
pub mod config;
pub mod error;
pub mod events;
pub mod evictor;
pub mod key;

mod coordinator;
mod entry;
mod index;
mod lru;

pub use crate::cache::{CacheStats, DdocCache};
pub use crate::cluster::{Broadcast, ClusterMessage};
pub use crate::config::{CacheConfig, MaxSize};
pub use crate::error::{CacheEntry, CacheError};
pub use crate::events::CacheEvent;
pub use crate::evictor::{DatabaseEvent, DatabaseEvents};
pub use crate::key::{CacheKey, DbName, DdocId};

#[cfg(test)]
mod test;
