//! filament-sync: durable file synchronization between the local cache and
//! a remote file node
//!
//! Four persistent queues (`uploading`, `retry-uploading`, `deletion`,
//! `retry-deletion`), each with a single worker. Uploads walk the file DAG
//! in batches, check availability, bind what the node already holds, push
//! the rest, and enforce the account byte quota; quota-limited items move
//! to the retry queue and surface a single `LimitReached` event. All queue
//! state survives restarts.

pub mod debug;
pub mod events;
pub mod queue;
pub mod stats;
pub mod status;
mod upload;

pub use events::SyncEvent;
pub use queue::{Action, Handler, Queue, QueueConfig, QueueItem};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use filament_core::config::{FilamentConfig, SyncConfig};
use filament_core::kv::KvStore;
use filament_core::{FileResult, FullFileId, SpaceStat};
use filament_files::FileService;
use filament_store::remote::RemoteStore;

const UPLOADING_PREFIX: &str = "filesync/queue/uploading/";
const RETRY_UPLOADING_PREFIX: &str = "filesync/queue/retry-uploading/";
const DELETION_PREFIX: &str = "filesync/queue/deletion/";
const RETRY_DELETION_PREFIX: &str = "filesync/queue/retry-deletion/";
pub(crate) const LIMIT_LOGGED_PREFIX: &str = "filesync/limit_logged/";
pub(crate) const NODE_USAGE_KEY: &str = "filesync/node_usage/";

/// One queued upload or deletion, keyed by the object id (stable across a
/// file's lifetime). Older items run first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncQueueItem {
    pub space_id: String,
    pub object_id: String,
    pub file_id: String,
    pub enqueued_at_ms: i64,
    #[serde(default)]
    pub added_by_user: bool,
    #[serde(default)]
    pub imported: bool,
}

impl SyncQueueItem {
    pub fn full_file_id(&self) -> FullFileId {
        FullFileId::new(self.space_id.as_str(), self.file_id.as_str())
    }
}

impl QueueItem for SyncQueueItem {
    fn key(&self) -> &str {
        &self.object_id
    }
    fn priority(&self) -> i64 {
        self.enqueued_at_ms
    }
}

/// Snapshot of all four queues, exposed on the debug endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct QueueInfo {
    pub uploading_queue: Vec<String>,
    pub retry_uploading_queue: Vec<String>,
    pub deletion_queue: Vec<String>,
    pub retry_deletion_queue: Vec<String>,
}

#[derive(Default)]
struct SyncHandle(OnceLock<Weak<FileSync>>);

impl SyncHandle {
    fn get(&self) -> Option<Arc<FileSync>> {
        self.0.get().and_then(Weak::upgrade)
    }
}

enum Role {
    Upload,
    RetryUpload,
    Delete,
    RetryDelete,
}

struct QueueRouter {
    handle: Arc<SyncHandle>,
    role: Role,
}

#[async_trait]
impl Handler<SyncQueueItem> for QueueRouter {
    async fn handle(&self, item: SyncQueueItem) -> Action {
        let Some(sync) = self.handle.get() else {
            return Action::Done;
        };
        match self.role {
            Role::Upload => sync.handle_upload(item).await,
            Role::RetryUpload => sync.handle_retry_upload(item).await,
            Role::Delete => sync.handle_delete(item).await,
            Role::RetryDelete => sync.handle_retry_delete(item).await,
        }
    }
}

pub struct FileSync {
    pub(crate) files: Arc<FileService>,
    pub(crate) remote: Arc<dyn RemoteStore>,
    pub(crate) kv: Arc<dyn KvStore>,
    pub(crate) cfg: SyncConfig,
    pub(crate) events: broadcast::Sender<SyncEvent>,
    pub(crate) import_events: Mutex<Vec<SyncEvent>>,
    pub(crate) uploading: Arc<Queue<SyncQueueItem>>,
    pub(crate) retry_uploading: Arc<Queue<SyncQueueItem>>,
    pub(crate) deleting: Arc<Queue<SyncQueueItem>>,
    pub(crate) retry_deleting: Arc<Queue<SyncQueueItem>>,
    pub(crate) space_stats: Mutex<HashMap<String, SpaceStat>>,
    pub(crate) limit_override: Mutex<Option<u64>>,
    pub(crate) synced_cache: Mutex<std::collections::HashSet<String>>,
    pub(crate) watched: Mutex<HashMap<String, FullFileId>>,
    pub(crate) cancel: CancellationToken,
}

impl FileSync {
    pub fn new(
        files: Arc<FileService>,
        remote: Arc<dyn RemoteStore>,
        kv: Arc<dyn KvStore>,
        cfg: SyncConfig,
    ) -> FileResult<Arc<Self>> {
        let handle = Arc::new(SyncHandle::default());
        let retry_pause = Duration::from_secs(cfg.retry_pause_secs);

        let queue = |prefix: &str, role: Role, pause: Option<Duration>| {
            Queue::open(
                Arc::clone(&kv),
                prefix,
                Arc::new(QueueRouter {
                    handle: Arc::clone(&handle),
                    role,
                }),
                QueueConfig {
                    workers: 1,
                    retry_pause: pause,
                },
            )
        };
        let uploading = queue(
            UPLOADING_PREFIX,
            Role::Upload,
            Some(Duration::from_secs(1)),
        )?;
        let retry_uploading = queue(RETRY_UPLOADING_PREFIX, Role::RetryUpload, Some(retry_pause))?;
        let deleting = queue(DELETION_PREFIX, Role::Delete, Some(Duration::from_secs(1)))?;
        let retry_deleting = queue(RETRY_DELETION_PREFIX, Role::RetryDelete, Some(retry_pause))?;

        let (events, _) = broadcast::channel(64);
        let sync = Arc::new(Self {
            files,
            remote,
            kv,
            cfg,
            events,
            import_events: Mutex::new(Vec::new()),
            uploading,
            retry_uploading,
            deleting,
            retry_deleting,
            space_stats: Mutex::new(HashMap::new()),
            limit_override: Mutex::new(None),
            synced_cache: Mutex::new(std::collections::HashSet::new()),
            watched: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        });
        let _ = handle.0.set(Arc::downgrade(&sync));
        Ok(sync)
    }

    /// Starts workers and background loops. A local-only node starts
    /// nothing: queued items stay persisted until a connected run.
    pub async fn run(self: &Arc<Self>) {
        if self.cfg.local_only {
            return;
        }
        self.uploading.run();
        self.retry_uploading.run();
        self.deleting.run();
        self.retry_deleting.run();

        self.precache_node_usage().await;
        self.spawn_usage_updater();
        self.spawn_status_watcher();

        if let Some(port) = FilamentConfig::debug_port() {
            debug::spawn_debug_server(Arc::clone(self), port);
        }
    }

    pub async fn close(&self) {
        self.cancel.cancel();
        self.uploading.close().await;
        self.retry_uploading.close().await;
        self.deleting.close().await;
        self.retry_deleting.close().await;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    fn make_item(
        object_id: &str,
        id: &FullFileId,
        added_by_user: bool,
        imported: bool,
    ) -> SyncQueueItem {
        SyncQueueItem {
            space_id: id.space_id.to_string(),
            object_id: object_id.to_string(),
            file_id: id.file_id.to_string(),
            enqueued_at_ms: now_ms(),
            added_by_user,
            imported,
        }
    }

    /// Schedules a file for upload. A file with no indexed variant has
    /// been offloaded and the call is a no-op. Any pending deletion for the
    /// same object is cancelled.
    pub fn add_file(
        &self,
        object_id: &str,
        id: &FullFileId,
        added_by_user: bool,
        imported: bool,
    ) -> FileResult<()> {
        let variants = self.files.index().list_by_file_id(&id.file_id)?;
        if variants.is_empty() {
            debug!(file_id = %id.file_id, "add_file: no variants in index, skipping");
            return Ok(());
        }
        self.deleting.remove(object_id)?;
        self.retry_deleting.remove(object_id)?;
        // A fresh attempt gets a fresh limit notification.
        self.kv
            .delete(format!("{LIMIT_LOGGED_PREFIX}{object_id}").as_bytes())?;
        if self.is_queued(object_id) {
            return Ok(());
        }
        self.uploading
            .add(Self::make_item(object_id, id, added_by_user, imported))
    }

    /// Schedules a file for remote deletion; pending uploads for the same
    /// object are cancelled first.
    pub fn delete_file(&self, object_id: &str, id: &FullFileId) -> FileResult<()> {
        self.uploading.remove(object_id)?;
        self.retry_uploading.remove(object_id)?;
        self.deleting
            .add(Self::make_item(object_id, id, false, false))
    }

    pub fn cancel_deletion(&self, object_id: &str) -> FileResult<()> {
        self.deleting.remove(object_id)?;
        self.retry_deleting.remove(object_id)
    }

    /// Immediate remote deletion, bypassing the queues.
    pub async fn delete_file_synchronously(&self, id: &FullFileId) -> FileResult<()> {
        self.remote
            .files_delete(&id.space_id, std::slice::from_ref(&id.file_id))
            .await?;
        self.refresh_space_stat(&id.space_id).await?;
        Ok(())
    }

    pub fn is_queued(&self, object_id: &str) -> bool {
        self.uploading.has(object_id)
            || self.retry_uploading.has(object_id)
            || self.deleting.has(object_id)
            || self.retry_deleting.has(object_id)
    }

    pub fn queue_info(&self) -> QueueInfo {
        QueueInfo {
            uploading_queue: self.uploading.list_keys(),
            retry_uploading_queue: self.retry_uploading.list_keys(),
            deletion_queue: self.deleting.list_keys(),
            retry_deletion_queue: self.retry_deleting.list_keys(),
        }
    }

    /// Every file referenced by an unprocessed queue item. GC must mark
    /// all of these before sweeping, or a queued-but-unuploaded file could
    /// lose its local blocks.
    pub fn pending_file_ids(&self) -> Vec<FullFileId> {
        let mut out = Vec::new();
        for queue in [&self.uploading, &self.retry_uploading] {
            let _ = queue.remove_by(|item| {
                out.push(item.full_file_id());
                false
            });
        }
        out
    }

    pub fn send_import_events(&self) {
        let events: Vec<SyncEvent> = std::mem::take(&mut *self.import_events.lock().unwrap());
        for event in events {
            if self.events.send(event).is_err() {
                warn!("import event dropped: no subscribers");
            }
        }
    }

    pub fn clear_import_events(&self) {
        self.import_events.lock().unwrap().clear();
    }

    pub(crate) fn emit(&self, event: SyncEvent) {
        // A send error only means nobody is subscribed right now.
        let _ = self.events.send(event);
    }

    pub(crate) fn limit_flag_key(object_id: &str) -> Vec<u8> {
        format!("{LIMIT_LOGGED_PREFIX}{object_id}").into_bytes()
    }
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_orders_by_enqueue_time() {
        let older = SyncQueueItem {
            space_id: "s".into(),
            object_id: "a".into(),
            file_id: "f".into(),
            enqueued_at_ms: 1,
            added_by_user: true,
            imported: false,
        };
        let newer = SyncQueueItem {
            enqueued_at_ms: 2,
            object_id: "b".into(),
            ..older.clone()
        };
        assert!(older.priority() < newer.priority());
        assert_eq!(older.key(), "a");
    }

    #[test]
    fn item_json_roundtrip() {
        let item = SyncQueueItem {
            space_id: "space".into(),
            object_id: "object".into(),
            file_id: "file".into(),
            enqueued_at_ms: 42,
            added_by_user: true,
            imported: true,
        };
        let raw = serde_json::to_vec(&item).unwrap();
        let back: SyncQueueItem = serde_json::from_slice(&raw).unwrap();
        assert_eq!(item, back);
    }
}
