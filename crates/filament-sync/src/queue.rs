//! Generic durable priority queue
//!
//! Items are JSON rows under a key prefix; on open the queue restores every
//! row into an in-memory heap and a tracking set. The tracking set is
//! authoritative for `has`: an item removed while a worker holds it must
//! not count as still queued, and the worker's eventual Done/Retry finds it
//! absent and skips. Delivery is at-least-once: handlers must be
//! idempotent and tolerate replays after restart.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use filament_core::kv::KvStore;
use filament_core::{FileError, FileResult};

/// What the handler decided about an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Handled; drop it from storage.
    Done,
    /// Put it back and try again later.
    Retry,
}

pub trait QueueItem: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn key(&self) -> &str;
    /// Lower runs first; ties break on key.
    fn priority(&self) -> i64 {
        0
    }
}

#[async_trait]
pub trait Handler<T: QueueItem>: Send + Sync + 'static {
    async fn handle(&self, item: T) -> Action;
}

#[async_trait]
impl<T, F, Fut> Handler<T> for F
where
    T: QueueItem,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Action> + Send,
{
    async fn handle(&self, item: T) -> Action {
        self(item).await
    }
}

struct HeapEntry<T> {
    priority: i64,
    key: String,
    item: T,
}

impl<T> PartialEq for HeapEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.key == other.key
    }
}
impl<T> Eq for HeapEntry<T> {}
impl<T> PartialOrd for HeapEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl<T> Ord for HeapEntry<T> {
    // BinaryHeap is a max-heap; invert so the lowest priority pops first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.key.cmp(&self.key))
    }
}

struct State<T> {
    heap: BinaryHeap<HeapEntry<T>>,
    tracking: HashSet<String>,
    processing: HashSet<String>,
    waiters: HashMap<String, Vec<oneshot::Sender<()>>>,
    closed: bool,
    processed: u64,
}

pub struct QueueConfig {
    pub workers: usize,
    pub retry_pause: Option<Duration>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            retry_pause: None,
        }
    }
}

pub struct Queue<T: QueueItem> {
    kv: Arc<dyn KvStore>,
    prefix: String,
    state: Mutex<State<T>>,
    added: Notify,
    cancel: CancellationToken,
    handler: Arc<dyn Handler<T>>,
    cfg: QueueConfig,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl<T: QueueItem> Queue<T> {
    /// Opens the queue, restoring persisted items into the heap.
    pub fn open(
        kv: Arc<dyn KvStore>,
        prefix: impl Into<String>,
        handler: Arc<dyn Handler<T>>,
        cfg: QueueConfig,
    ) -> FileResult<Arc<Self>> {
        let prefix = prefix.into();
        let mut heap = BinaryHeap::new();
        let mut tracking = HashSet::new();
        for (_, raw) in kv.scan_prefix(prefix.as_bytes())? {
            let item: T = match serde_json::from_slice(&raw) {
                Ok(item) => item,
                Err(e) => {
                    warn!(prefix, "skipping malformed queue row: {e}");
                    continue;
                }
            };
            tracking.insert(item.key().to_string());
            heap.push(HeapEntry {
                priority: item.priority(),
                key: item.key().to_string(),
                item,
            });
        }
        debug!(prefix, restored = tracking.len(), "queue opened");
        Ok(Arc::new(Self {
            kv,
            prefix,
            state: Mutex::new(State {
                heap,
                tracking,
                processing: HashSet::new(),
                waiters: HashMap::new(),
                closed: false,
                processed: 0,
            }),
            added: Notify::new(),
            cancel: CancellationToken::new(),
            handler,
            cfg,
            workers: Mutex::new(Vec::new()),
        }))
    }

    fn storage_key(&self, key: &str) -> Vec<u8> {
        format!("{}{key}", self.prefix).into_bytes()
    }

    /// Spawns the worker tasks.
    pub fn run(self: &Arc<Self>) {
        let count = self.cfg.workers.max(1);
        let mut workers = self.workers.lock().unwrap();
        for _ in 0..count {
            let queue = Arc::clone(self);
            workers.push(tokio::spawn(async move { queue.worker_loop().await }));
        }
    }

    async fn worker_loop(self: Arc<Self>) {
        loop {
            let Some(item) = self.wait_one().await else {
                return;
            };
            let key = item.key().to_string();
            let action = self.handler.handle(item.clone()).await;

            let pause = {
                let mut state = self.state.lock().unwrap();
                state.processing.remove(&key);
                let tracked = state.tracking.contains(&key);
                match action {
                    Action::Done => {
                        if tracked {
                            if let Err(e) = self.kv.delete(&self.storage_key(&key)) {
                                warn!(key, "queue: delete handled item: {e}");
                            }
                            state.tracking.remove(&key);
                        }
                        state.processed += 1;
                    }
                    Action::Retry => {
                        if tracked {
                            state.heap.push(HeapEntry {
                                priority: item.priority(),
                                key: key.clone(),
                                item,
                            });
                        }
                    }
                }
                if let Some(waiters) = state.waiters.remove(&key) {
                    for waiter in waiters {
                        let _ = waiter.send(());
                    }
                }
                matches!(action, Action::Retry).then_some(self.cfg.retry_pause).flatten()
            };
            if let Some(pause) = pause {
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = self.cancel.cancelled() => return,
                }
            }
        }
    }

    /// Blocks until an item is available or the queue closes.
    async fn wait_one(&self) -> Option<T> {
        loop {
            let notified = self.added.notified();
            {
                let mut state = self.state.lock().unwrap();
                // Leftover items stay persisted for the next open.
                if state.closed {
                    return None;
                }
                while let Some(entry) = state.heap.pop() {
                    // Removed while queued: skip silently.
                    if !state.tracking.contains(&entry.key) {
                        continue;
                    }
                    state.processing.insert(entry.key.clone());
                    return Some(entry.item);
                }
            }
            tokio::select! {
                _ = notified => {}
                _ = self.cancel.cancelled() => return None,
            }
        }
    }

    /// Enqueues an item. A key already tracked is a no-op; a closed queue
    /// is an error.
    pub fn add(&self, item: T) -> FileResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(FileError::QueueClosed);
        }
        let key = item.key().to_string();
        if state.tracking.contains(&key) {
            return Ok(());
        }
        let raw = serde_json::to_vec(&item).map_err(anyhow::Error::from)?;
        self.kv.put(&self.storage_key(&key), &raw)?;
        state.tracking.insert(key.clone());
        state.heap.push(HeapEntry {
            priority: item.priority(),
            key,
            item,
        });
        drop(state);
        self.added.notify_one();
        Ok(())
    }

    pub fn has(&self, key: &str) -> bool {
        self.state.lock().unwrap().tracking.contains(key)
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().tracking.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn list_keys(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut keys: Vec<String> = state.tracking.iter().cloned().collect();
        keys.sort();
        keys
    }

    pub fn processed_items(&self) -> u64 {
        self.state.lock().unwrap().processed
    }

    /// Removes an item. A handler already holding it keeps running; its
    /// Done/Retry will find the key untracked and skip.
    pub fn remove(&self, key: &str) -> FileResult<()> {
        self.kv.delete(&self.storage_key(key))?;
        let mut state = self.state.lock().unwrap();
        state.tracking.remove(key);
        Ok(())
    }

    /// Removes an item and returns a channel that resolves once no handler
    /// is processing it (immediately if none is).
    pub fn remove_wait(&self, key: &str) -> FileResult<oneshot::Receiver<()>> {
        self.kv.delete(&self.storage_key(key))?;
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock().unwrap();
        state.tracking.remove(key);
        if state.processing.contains(key) {
            state.waiters.entry(key.to_string()).or_default().push(tx);
        } else {
            let _ = tx.send(());
        }
        Ok(rx)
    }

    /// Bulk removal by predicate over the persisted items.
    pub fn remove_by(&self, mut predicate: impl FnMut(&T) -> bool) -> FileResult<usize> {
        let rows = self.kv.scan_prefix(self.prefix.as_bytes())?;
        let mut removed = 0;
        for (_, raw) in rows {
            if let Ok(item) = serde_json::from_slice::<T>(&raw) {
                if predicate(&item) {
                    self.remove(item.key())?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Cancels workers, waits for them to exit, and rejects further adds.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.cancel.cancel();
        self.added.notify_waiters();
        let workers = {
            let mut guard = self.workers.lock().unwrap();
            std::mem::take(&mut *guard)
        };
        for worker in workers {
            let _ = worker.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filament_core::kv::MemKv;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct TestItem {
        id: String,
        timestamp: i64,
    }

    impl QueueItem for TestItem {
        fn key(&self) -> &str {
            &self.id
        }
        fn priority(&self) -> i64 {
            self.timestamp
        }
    }

    fn item(id: &str, timestamp: i64) -> TestItem {
        TestItem {
            id: id.to_string(),
            timestamp,
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn add_to_closed_queue_fails() {
        let kv: Arc<dyn KvStore> = Arc::new(MemKv::new());
        let q = Queue::open(
            kv,
            "q/",
            Arc::new(|_it: TestItem| async { Action::Done }),
            QueueConfig::default(),
        )
        .unwrap();
        q.run();
        q.close().await;
        assert!(matches!(q.add(item("1", 1)), Err(FileError::QueueClosed)));
    }

    #[tokio::test]
    async fn processes_added_items() {
        let kv: Arc<dyn KvStore> = Arc::new(MemKv::new());
        let seen = Arc::new(AtomicU64::new(0));
        let seen_in_handler = Arc::clone(&seen);
        let q = Queue::open(
            kv,
            "q/",
            Arc::new(move |_it: TestItem| {
                let seen = Arc::clone(&seen_in_handler);
                async move {
                    seen.fetch_add(1, AtomicOrdering::SeqCst);
                    Action::Done
                }
            }),
            QueueConfig::default(),
        )
        .unwrap();

        for i in 0..10 {
            q.add(item(&i.to_string(), i)).unwrap();
        }
        assert_eq!(q.len(), 10);
        q.run();

        wait_until(|| q.is_empty()).await;
        wait_until(|| q.processed_items() == 10).await;
        assert_eq!(seen.load(AtomicOrdering::SeqCst), 10);
        assert!(q.list_keys().is_empty());
        q.close().await;
    }

    #[tokio::test]
    async fn duplicate_add_is_a_no_op() {
        let kv: Arc<dyn KvStore> = Arc::new(MemKv::new());
        let q = Queue::open(
            kv,
            "q/",
            Arc::new(|_it: TestItem| async { Action::Done }),
            QueueConfig::default(),
        )
        .unwrap();
        q.add(item("same", 1)).unwrap();
        q.add(item("same", 2)).unwrap();
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn remove_makes_has_false_even_mid_handling() {
        let kv: Arc<dyn KvStore> = Arc::new(MemKv::new());
        let (entered_tx, entered_rx) = oneshot::channel::<()>();
        let entered_tx = Arc::new(Mutex::new(Some(entered_tx)));
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));

        let q = Queue::open(
            kv,
            "q/",
            Arc::new(move |_it: TestItem| {
                let entered_tx = Arc::clone(&entered_tx);
                let release_rx = Arc::clone(&release_rx);
                async move {
                    if let Some(tx) = entered_tx.lock().unwrap().take() {
                        let _ = tx.send(());
                    }
                    if let Some(rx) = release_rx.lock().await.take() {
                        let _ = rx.await;
                    }
                    Action::Done
                }
            }),
            QueueConfig::default(),
        )
        .unwrap();
        q.run();
        q.add(item("busy", 1)).unwrap();
        entered_rx.await.unwrap();

        q.remove("busy").unwrap();
        assert!(!q.has("busy"));

        release_tx.send(()).unwrap();
        wait_until(|| q.processed_items() == 1).await;
        q.close().await;
    }

    #[tokio::test]
    async fn remove_wait_resolves_after_handler_returns() {
        let kv: Arc<dyn KvStore> = Arc::new(MemKv::new());
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));
        let (entered_tx, entered_rx) = oneshot::channel::<()>();
        let entered_tx = Arc::new(Mutex::new(Some(entered_tx)));

        let q = Queue::open(
            kv,
            "q/",
            Arc::new(move |_it: TestItem| {
                let release_rx = Arc::clone(&release_rx);
                let entered_tx = Arc::clone(&entered_tx);
                async move {
                    if let Some(tx) = entered_tx.lock().unwrap().take() {
                        let _ = tx.send(());
                    }
                    if let Some(rx) = release_rx.lock().await.take() {
                        let _ = rx.await;
                    }
                    Action::Done
                }
            }),
            QueueConfig::default(),
        )
        .unwrap();
        q.run();
        q.add(item("inflight", 1)).unwrap();
        entered_rx.await.unwrap();

        let mut wait = q.remove_wait("inflight").unwrap();
        assert!(
            wait.try_recv().is_err(),
            "must not resolve while the handler runs"
        );
        release_tx.send(()).unwrap();
        wait.await.unwrap();

        // and immediately for a key nobody processes
        q.remove_wait("absent").unwrap().await.unwrap();
        q.close().await;
    }

    #[tokio::test]
    async fn restore_preserves_priority_order() {
        let kv: Arc<dyn KvStore> = Arc::new(MemKv::new());

        // Instance A persists out of order, never runs.
        {
            let q = Queue::open(
                Arc::clone(&kv),
                "q/",
                Arc::new(|_it: TestItem| async { Action::Done }),
                QueueConfig::default(),
            )
            .unwrap();
            q.add(item("c", 3)).unwrap();
            q.add(item("a", 1)).unwrap();
            q.add(item("b", 2)).unwrap();
            q.close().await;
        }

        // Instance B restores from the same storage and drains in order.
        let order = Arc::new(Mutex::new(Vec::new()));
        let order_in_handler = Arc::clone(&order);
        let q = Queue::open(
            kv,
            "q/",
            Arc::new(move |it: TestItem| {
                let order = Arc::clone(&order_in_handler);
                async move {
                    order.lock().unwrap().push(it.id.clone());
                    Action::Done
                }
            }),
            QueueConfig::default(),
        )
        .unwrap();
        assert_eq!(q.len(), 3);
        q.run();
        wait_until(|| q.is_empty()).await;
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
        q.close().await;
    }

    #[tokio::test]
    async fn retry_requeues_until_done() {
        let kv: Arc<dyn KvStore> = Arc::new(MemKv::new());
        let attempts = Arc::new(AtomicU64::new(0));
        let attempts_in_handler = Arc::clone(&attempts);
        let q = Queue::open(
            kv,
            "q/",
            Arc::new(move |_it: TestItem| {
                let attempts = Arc::clone(&attempts_in_handler);
                async move {
                    if attempts.fetch_add(1, AtomicOrdering::SeqCst) < 2 {
                        Action::Retry
                    } else {
                        Action::Done
                    }
                }
            }),
            QueueConfig {
                workers: 1,
                retry_pause: Some(Duration::from_millis(1)),
            },
        )
        .unwrap();
        q.run();
        q.add(item("flaky", 1)).unwrap();
        wait_until(|| q.is_empty()).await;
        assert_eq!(attempts.load(AtomicOrdering::SeqCst), 3);
        q.close().await;
    }

    #[tokio::test]
    async fn add_remove_add_is_seen_exactly_once_for_second_add() {
        let kv: Arc<dyn KvStore> = Arc::new(MemKv::new());
        let seen = Arc::new(AtomicU64::new(0));
        let seen_in_handler = Arc::clone(&seen);
        let q = Queue::open(
            kv,
            "q/",
            Arc::new(move |_it: TestItem| {
                let seen = Arc::clone(&seen_in_handler);
                async move {
                    seen.fetch_add(1, AtomicOrdering::SeqCst);
                    Action::Done
                }
            }),
            QueueConfig::default(),
        )
        .unwrap();

        // added, removed, added again before workers ever start
        q.add(item("x", 1)).unwrap();
        q.remove("x").unwrap();
        q.add(item("x", 2)).unwrap();
        q.run();

        wait_until(|| q.is_empty()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(AtomicOrdering::SeqCst), 1);
        q.close().await;
    }

    #[tokio::test]
    async fn remove_by_predicate() {
        let kv: Arc<dyn KvStore> = Arc::new(MemKv::new());
        let q = Queue::open(
            kv,
            "q/",
            Arc::new(|_it: TestItem| async { Action::Done }),
            QueueConfig::default(),
        )
        .unwrap();
        q.add(item("keep", 1)).unwrap();
        q.add(item("drop-1", 2)).unwrap();
        q.add(item("drop-2", 3)).unwrap();

        let removed = q.remove_by(|it| it.id.starts_with("drop")).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(q.list_keys(), vec!["keep"]);
    }
}
