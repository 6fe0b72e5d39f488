use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

/// Tuning knobs for the design document cache.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of resident cache entries.
    ///
    /// Admission of a new entry beyond this bound evicts the least
    /// recently used one. A value of `0` disables caching entirely:
    /// every open falls through to a direct recovery.
    pub max_size: usize,

    /// How long an idle entry waits before re-running its recovery.
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_size: 1000,
            refresh_interval: Duration::from_secs(60),
        }
    }
}

/// Shared handle to the entry bound.
///
/// The coordinator re-reads this on every admission decision, so the bound
/// can be changed on a live cache without restarting it.
#[derive(Clone, Debug)]
pub struct MaxSize(Arc<AtomicUsize>);

impl MaxSize {
    pub(crate) fn new(max_size: usize) -> Self {
        MaxSize(Arc::new(AtomicUsize::new(max_size)))
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, max_size: usize) {
        self.0.store(max_size, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: CacheConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, CacheConfig::default());
        assert_eq!(config.max_size, 1000);
        assert_eq!(config.refresh_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_humantime_interval() {
        let config: CacheConfig =
            serde_json::from_str(r#"{"max_size": 25, "refresh_interval": "250ms"}"#).unwrap();
        assert_eq!(config.max_size, 25);
        assert_eq!(config.refresh_interval, Duration::from_millis(250));
    }
}
