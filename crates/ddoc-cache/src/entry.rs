use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};

use crate::cache::CacheShared;
use crate::coordinator::LruMsg;
use crate::error::{CacheEntry, CacheError};
use crate::events::CacheEvent;
use crate::key::CacheKey;
use crate::lru::LruItem;

/// Process-unique identifier of one entry-actor incarnation.
///
/// Index rows and recency markers are qualified by this id so that cleanup
/// racing between an old actor and a newer one under the same key can never
/// touch the wrong generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct EntryId(u64);

impl EntryId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        EntryId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub(crate) enum EntryMsg<K: CacheKey> {
    Open {
        reply: oneshot::Sender<CacheEntry<K::Value>>,
    },
    Accessed,
    Refresh,
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// A message could not be dispatched because the actor has terminated.
///
/// The call site reacts by falling back to a direct recovery; the caller of
/// `open` never sees this.
#[derive(Debug)]
pub(crate) struct StaleEntry;

/// Address of a live entry actor.
#[derive(Clone)]
pub(crate) struct EntryHandle<K: CacheKey> {
    pub id: EntryId,
    tx: mpsc::UnboundedSender<EntryMsg<K>>,
}

impl<K: CacheKey> EntryHandle<K> {
    /// Returns the cached value, enlisting in the in-flight recovery if
    /// none is available yet.
    pub async fn open(&self) -> Result<CacheEntry<K::Value>, StaleEntry> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EntryMsg::Open { reply })
            .map_err(|_| StaleEntry)?;
        rx.await.map_err(|_| StaleEntry)
    }

    /// Signals that the open fast path just served a hit.
    pub fn accessed(&self) {
        self.tx.send(EntryMsg::Accessed).ok();
    }

    /// Instructs the actor to re-run its recovery.
    pub fn refresh(&self) {
        self.tx.send(EntryMsg::Refresh).ok();
    }

    /// Tears the actor down, waiting until its rows are gone.
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.tx.send(EntryMsg::Shutdown { done }).is_ok() {
            rx.await.ok();
        }
    }

    #[cfg(test)]
    pub fn stub(id: EntryId, tx: mpsc::UnboundedSender<EntryMsg<K>>) -> Self {
        EntryHandle { id, tx }
    }
}

/// Spawns the entry actor for `key` and binds it to its reserved index row.
///
/// The actor starts in the initial-fetch state with an opener already
/// running. Called by the coordinator only, which has reserved the row
/// beforehand.
pub(crate) fn spawn<K: CacheKey>(
    key: K,
    shared: Arc<CacheShared<K>>,
    coordinator: mpsc::UnboundedSender<LruMsg<K>>,
) -> EntryHandle<K> {
    let id = EntryId::next();
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = EntryHandle { id, tx };

    shared.index.attach(&key, handle.clone());
    shared.events.emit(CacheEvent::Started(key.clone()));

    let opener = spawn_opener(&key);
    let actor = Entry {
        key,
        id,
        shared,
        coordinator,
        rx,
        val: None,
        opener: Opener::Fetch(opener),
        waiters: Some(Vec::new()),
        ts: None,
    };
    tokio::spawn(actor.run());

    handle
}

fn spawn_opener<K: CacheKey>(key: &K) -> JoinHandle<CacheEntry<K::Value>> {
    tokio::spawn(key.recover())
}

/// The single slot holding either the in-flight opener task or the pending
/// refresh deadline. An actor never has both at once.
enum Opener<V> {
    Fetch(JoinHandle<CacheEntry<V>>),
    Timer(tokio::time::Instant),
}

enum Turn<K: CacheKey> {
    Msg(Option<EntryMsg<K>>),
    OpenerDone(Result<CacheEntry<K::Value>, JoinError>),
    RefreshDue,
}

enum Flow {
    Continue,
    Exit(Exit),
}

enum Exit {
    /// The coordinator asked us to go; acknowledge once cleaned up.
    Shutdown(oneshot::Sender<()>),
    /// Recovery failed; reply the failure and vanish.
    Failed(CacheError),
    /// Every handle is gone, the cache itself is being dropped.
    Detached,
}

struct Entry<K: CacheKey> {
    key: K,
    id: EntryId,
    shared: Arc<CacheShared<K>>,
    coordinator: mpsc::UnboundedSender<LruMsg<K>>,
    rx: mpsc::UnboundedReceiver<EntryMsg<K>>,
    val: Option<CacheEntry<K::Value>>,
    opener: Opener<K::Value>,
    waiters: Option<Vec<oneshot::Sender<CacheEntry<K::Value>>>>,
    ts: Option<Instant>,
}

impl<K: CacheKey> Entry<K> {
    async fn run(mut self) {
        let exit = loop {
            let turn = match &mut self.opener {
                Opener::Fetch(task) => tokio::select! {
                    res = task => Turn::OpenerDone(res),
                    msg = self.rx.recv() => Turn::Msg(msg),
                },
                Opener::Timer(deadline) => {
                    let deadline = *deadline;
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => Turn::RefreshDue,
                        msg = self.rx.recv() => Turn::Msg(msg),
                    }
                }
            };

            let flow = match turn {
                Turn::Msg(Some(msg)) => self.handle_msg(msg),
                Turn::Msg(None) => Flow::Exit(Exit::Detached),
                Turn::OpenerDone(res) => self.opener_done(res),
                Turn::RefreshDue => {
                    self.start_opener();
                    Flow::Continue
                }
            };
            match flow {
                Flow::Continue => {}
                Flow::Exit(exit) => break exit,
            }
        };

        match exit {
            Exit::Shutdown(done) => {
                self.abort_opener();
                self.cleanup_tables();
                done.send(()).ok();
            }
            Exit::Failed(err) => {
                tracing::debug!(
                    dbname = self.key.dbname(),
                    error = %err,
                    "cache entry terminating on failed recovery",
                );
                if let Some(waiters) = self.waiters.take() {
                    for waiter in waiters {
                        waiter.send(Err(err.clone())).ok();
                    }
                }
                self.val = Some(Err(err.clone()));
                self.cleanup_tables();
                // Opens that raced in before the handles died still get the
                // failure rather than a stale-dispatch fallback.
                self.rx.close();
                while let Ok(msg) = self.rx.try_recv() {
                    if let EntryMsg::Open { reply } = msg {
                        reply.send(Err(err.clone())).ok();
                    }
                }
                self.coordinator
                    .send(LruMsg::EntryExited {
                        key: self.key.clone(),
                        id: self.id,
                    })
                    .ok();
            }
            Exit::Detached => {
                self.abort_opener();
                self.cleanup_tables();
            }
        }
    }

    fn handle_msg(&mut self, msg: EntryMsg<K>) -> Flow {
        match msg {
            EntryMsg::Open { reply } => {
                match &self.val {
                    Some(val) => {
                        reply.send(val.clone()).ok();
                    }
                    None => {
                        if let Some(waiters) = &mut self.waiters {
                            waiters.push(reply);
                        }
                    }
                }
                Flow::Continue
            }
            EntryMsg::Accessed => self.accessed(),
            EntryMsg::Refresh => {
                self.start_opener();
                Flow::Continue
            }
            EntryMsg::Shutdown { done } => Flow::Exit(Exit::Shutdown(done)),
        }
    }

    /// Handles one `accessed` notification, draining any further queued
    /// ones first so a burst of hits costs a single recency update.
    fn accessed(&mut self) -> Flow {
        let mut next = None;
        loop {
            match self.rx.try_recv() {
                Ok(EntryMsg::Accessed) => continue,
                Ok(msg) => {
                    next = Some(msg);
                    break;
                }
                Err(_) => break,
            }
        }

        if self.ts.is_some() {
            self.bump_lru();
        }
        self.shared.events.emit(CacheEvent::Accessed(self.key.clone()));

        match next {
            Some(msg) => self.handle_msg(msg),
            None => Flow::Continue,
        }
    }

    /// Starts (or restarts) the opener, killing whichever of the in-flight
    /// task or the refresh timer currently occupies the slot.
    fn start_opener(&mut self) {
        self.abort_opener();
        self.opener = Opener::Fetch(spawn_opener(&self.key));
    }

    fn opener_done(&mut self, res: Result<CacheEntry<K::Value>, JoinError>) -> Flow {
        let outcome = match res {
            Ok(entry) => entry,
            Err(err) => Err(CacheError::Recovery(err.to_string())),
        };

        match outcome {
            Ok(value) => {
                let prior = self.val.replace(Ok(value.clone()));
                self.shared
                    .index
                    .store_val(&self.key, self.id, Ok(value.clone()));

                let event = match &prior {
                    None => CacheEvent::Inserted(self.key.clone()),
                    Some(Ok(prev)) if *prev == value => CacheEvent::UpdateNoop(self.key.clone()),
                    Some(_) => CacheEvent::Updated(self.key.clone()),
                };
                self.shared.events.emit(event);

                self.bump_lru();
                if let Some(waiters) = &mut self.waiters {
                    for waiter in waiters.drain(..) {
                        waiter.send(Ok(value.clone())).ok();
                    }
                }
                self.opener =
                    Opener::Timer(tokio::time::Instant::now() + self.shared.refresh_interval);
                Flow::Continue
            }
            Err(err) => Flow::Exit(Exit::Failed(err)),
        }
    }

    fn bump_lru(&mut self) {
        let now = Instant::now();
        let old = self.ts.map(|ts| LruItem {
            ts,
            key: self.key.clone(),
            id: self.id,
        });
        let new = LruItem {
            ts: now,
            key: self.key.clone(),
            id: self.id,
        };
        self.shared.lru.touch(old, new);
        self.ts = Some(now);
    }

    fn abort_opener(&self) {
        if let Opener::Fetch(task) = &self.opener {
            task.abort();
        }
    }

    /// Removes this actor's index row and recency marker. Both deletes are
    /// qualified by our id and tolerate the coordinator having removed the
    /// rows first.
    fn cleanup_tables(&mut self) {
        self.shared.index.remove_matching(&self.key, self.id);
        if let Some(ts) = self.ts.take() {
            self.shared.lru.remove(&LruItem {
                ts,
                key: self.key.clone(),
                id: self.id,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::config::MaxSize;
    use crate::error::CacheError;
    use crate::events::EventSink;
    use crate::index::CacheIndex;
    use crate::lru::LruIndex;
    use crate::test::{self, TestKey};

    use super::*;

    fn shared(refresh_interval: Duration) -> Arc<CacheShared<TestKey>> {
        Arc::new(CacheShared {
            index: CacheIndex::new(),
            lru: LruIndex::new(),
            events: EventSink::new(),
            max_size: MaxSize::new(10),
            refresh_interval,
        })
    }

    fn spawn_for(
        key: &TestKey,
        shared: &Arc<CacheShared<TestKey>>,
    ) -> (
        EntryHandle<TestKey>,
        mpsc::UnboundedReceiver<LruMsg<TestKey>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        shared.index.reserve(key);
        (spawn(key.clone(), shared.clone(), tx), rx)
    }

    #[tokio::test]
    async fn test_open_coalesces_on_inflight_fetch() {
        test::setup();

        let key = TestKey::new("db", Some("_design/app"));
        key.control.set_value("funs");
        key.control.set_delay(Duration::from_millis(100));

        let shared = shared(Duration::from_secs(60));
        let (handle, _coord) = spawn_for(&key, &shared);

        let (a, b) = tokio::join!(handle.open(), handle.open());
        assert_eq!(a.unwrap(), Ok("funs".to_string()));
        assert_eq!(b.unwrap(), Ok("funs".to_string()));
        assert_eq!(key.control.calls(), 1);

        let row = shared.index.lookup(&key).unwrap();
        assert_eq!(row.val, Some(Ok("funs".to_string())));
        assert_eq!(shared.lru.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_first_fetch_terminates_entry() {
        test::setup();

        let key = TestKey::new("db", Some("_design/app"));
        key.control.set_fail(true);

        let shared = shared(Duration::from_secs(60));
        let (handle, mut coord) = spawn_for(&key, &shared);

        assert_eq!(handle.open().await.unwrap(), Err(CacheError::NotFound));

        match coord.recv().await {
            Some(LruMsg::EntryExited { key: exited, id }) => {
                assert!(exited == key);
                assert_eq!(id, handle.id);
            }
            _ => panic!("expected an exit notification"),
        }
        assert!(shared.index.lookup(&key).is_none());
        assert_eq!(shared.lru.len(), 0);

        // Late dispatch fails, callers fall back to direct recovery.
        assert!(handle.open().await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_cleans_up() {
        test::setup();

        let key = TestKey::new("db", Some("_design/app"));
        let shared = shared(Duration::from_secs(60));
        let (handle, _coord) = spawn_for(&key, &shared);

        handle.open().await.unwrap().unwrap();
        handle.shutdown().await;

        assert!(shared.index.lookup(&key).is_none());
        assert_eq!(shared.lru.len(), 0);
        assert!(handle.open().await.is_err());
    }

    #[tokio::test]
    async fn test_refresh_replaces_value() {
        test::setup();

        let key = TestKey::new("db", Some("_design/app"));
        key.control.set_value("v1");

        let shared = shared(Duration::from_secs(60));
        let (handle, _coord) = spawn_for(&key, &shared);
        let mut events = shared.events.subscribe();

        assert_eq!(handle.open().await.unwrap(), Ok("v1".to_string()));

        key.control.set_value("v2");
        handle.refresh();
        test::expect_event(&mut events, |ev| matches!(ev, CacheEvent::Updated(_))).await;

        assert_eq!(handle.open().await.unwrap(), Ok("v2".to_string()));
        assert_eq!(key.control.calls(), 2);
        let row = shared.index.lookup(&key).unwrap();
        assert_eq!(row.val, Some(Ok("v2".to_string())));
    }

    #[tokio::test]
    async fn test_accessed_burst_coalesces_into_one_touch() {
        test::setup();

        let key = TestKey::new("db", Some("_design/app"));
        let shared = shared(Duration::from_secs(60));
        let (handle, _coord) = spawn_for(&key, &shared);

        handle.open().await.unwrap().unwrap();
        let before = shared.lru.first().unwrap();

        for _ in 0..32 {
            handle.accessed();
        }
        test::poll_until(|| shared.lru.first().unwrap().ts > before.ts).await;

        assert_eq!(shared.lru.len(), 1);
        let row = shared.index.lookup(&key).unwrap();
        assert!(row.val.is_some());
    }

    #[tokio::test]
    async fn test_refresh_failure_reports_error_to_waiters() {
        test::setup();

        let key = TestKey::new("db", Some("_design/app"));
        key.control.set_value("v1");

        let shared = shared(Duration::from_secs(60));
        let (handle, mut coord) = spawn_for(&key, &shared);

        handle.open().await.unwrap().unwrap();

        key.control.set_fail(true);
        key.control.set_delay(Duration::from_millis(50));
        handle.refresh();

        // The entry serves the old value while the refresh is in flight,
        // then removes itself once the failure lands.
        assert_eq!(handle.open().await.unwrap(), Ok("v1".to_string()));
        assert!(matches!(
            coord.recv().await,
            Some(LruMsg::EntryExited { .. })
        ));
        assert!(shared.index.lookup(&key).is_none());
        assert_eq!(shared.lru.len(), 0);
    }
}
