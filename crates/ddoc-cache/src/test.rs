//! Helpers for testing the cache.
//!
//! Call [`setup`] first in every test so console output is captured by the
//! test runner. [`TestKey`] is a cacheable key whose recovery behavior
//! (value, latency, failure) is steered through a shared control block that
//! key equality deliberately ignores.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use crate::error::{CacheEntry, CacheError};
use crate::events::CacheEvent;
use crate::evictor::{DatabaseEvent, DatabaseEvents};
use crate::key::CacheKey;

/// Setup the test environment.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("ddoc_cache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Steers and observes the recovery of one [`TestKey`].
#[derive(Debug)]
pub struct RecoverControl {
    calls: AtomicUsize,
    value: Mutex<String>,
    delay: Mutex<Duration>,
    fail: AtomicBool,
}

impl RecoverControl {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_value(&self, value: &str) {
        *self.value.lock() = value.to_string();
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[derive(Clone, Debug)]
pub struct TestKey {
    pub dbname: String,
    pub ddocid: Option<String>,
    pub control: Arc<RecoverControl>,
}

impl TestKey {
    pub fn new(dbname: &str, ddocid: Option<&str>) -> Self {
        TestKey {
            dbname: dbname.to_string(),
            ddocid: ddocid.map(str::to_string),
            control: Arc::new(RecoverControl {
                calls: AtomicUsize::new(0),
                value: Mutex::new(format!("{dbname}:{ddocid:?}")),
                delay: Mutex::new(Duration::ZERO),
                fail: AtomicBool::new(false),
            }),
        }
    }

    fn identity(&self) -> (&str, Option<&str>) {
        (&self.dbname, self.ddocid.as_deref())
    }
}

impl PartialEq for TestKey {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for TestKey {}

impl PartialOrd for TestKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TestKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.identity().cmp(&other.identity())
    }
}

impl std::hash::Hash for TestKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

impl CacheKey for TestKey {
    type Value = String;

    fn dbname(&self) -> &str {
        &self.dbname
    }

    fn ddocid(&self) -> Option<&str> {
        self.ddocid.as_deref()
    }

    fn recover(&self) -> BoxFuture<'static, CacheEntry<String>> {
        let control = self.control.clone();
        Box::pin(async move {
            control.calls.fetch_add(1, Ordering::SeqCst);
            let delay = *control.delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if control.fail.load(Ordering::SeqCst) {
                Err(CacheError::NotFound)
            } else {
                Ok(control.value.lock().clone())
            }
        })
    }
}

/// An in-process database-event source.
#[derive(Debug, Default)]
pub struct TestDbEvents {
    senders: Mutex<Vec<mpsc::UnboundedSender<(String, DatabaseEvent)>>>,
}

impl TestDbEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&self, shard: &str, event: DatabaseEvent) {
        for sender in self.senders.lock().iter() {
            sender.send((shard.to_string(), event)).ok();
        }
    }

    /// Ends every active subscription, as a dying event source would.
    pub fn disconnect(&self) {
        self.senders.lock().clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.senders.lock().len()
    }
}

impl DatabaseEvents for TestDbEvents {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<(String, DatabaseEvent)> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().push(tx);
        rx
    }
}

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Waits until the event stream yields an event matching `pred`.
pub async fn expect_event<K, F>(
    rx: &mut broadcast::Receiver<CacheEvent<K>>,
    pred: F,
) -> CacheEvent<K>
where
    K: CacheKey,
    F: Fn(&CacheEvent<K>) -> bool,
{
    tokio::time::timeout(WAIT_TIMEOUT, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for cache event")
}

/// Polls a condition until it holds.
pub async fn poll_until(cond: impl Fn() -> bool) {
    tokio::time::timeout(WAIT_TIMEOUT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for condition")
}
