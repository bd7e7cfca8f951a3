//! Per-file sync status and the background watcher
//!
//! A file queued for upload is `NotSynced`; otherwise uploaded chunks are
//! compared against the total. Files already observed as synced are
//! cached so the watcher tick doesn't turn into an RPC storm.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use filament_core::{FileId, FileResult, FullFileId, SyncStatus};

use crate::events::SyncEvent;
use crate::FileSync;

const WATCH_TICK: Duration = Duration::from_secs(5);

impl FileSync {
    /// Current status of one file, computed on demand.
    pub async fn sync_status(
        &self,
        object_id: &str,
        id: &FullFileId,
    ) -> FileResult<SyncStatus> {
        if self.uploading.has(object_id) || self.retry_uploading.has(object_id) {
            return Ok(SyncStatus::NotSynced);
        }
        if self.synced_cache.lock().unwrap().contains(id.file_id.as_str()) {
            return Ok(SyncStatus::Synced);
        }
        let stats = self
            .file_list_stats(&id.space_id, std::slice::from_ref(&id.file_id))
            .await?;
        let Some(stat) = stats.first() else {
            return Ok(SyncStatus::NotSynced);
        };
        if stat.total_chunks_count > 0 && stat.is_pinned() {
            self.synced_cache
                .lock()
                .unwrap()
                .insert(id.file_id.to_string());
            return Ok(SyncStatus::Synced);
        }
        Ok(SyncStatus::NotSynced)
    }

    /// Registers a file for background status tracking.
    pub fn watch_file(&self, object_id: &str, id: FullFileId) {
        self.watched
            .lock()
            .unwrap()
            .insert(object_id.to_string(), id);
    }

    pub fn unwatch_file(&self, object_id: &str) {
        self.watched.lock().unwrap().remove(object_id);
        // The cache entry stays: synced is a stable state.
    }

    pub(crate) fn spawn_status_watcher(self: &Arc<Self>) {
        let sync = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(WATCH_TICK);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = sync.cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                sync.watcher_tick().await;
            }
        });
    }

    async fn watcher_tick(&self) {
        let watched: Vec<(String, FullFileId)> = self
            .watched
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (object_id, id) in watched {
            if self.synced_cache.lock().unwrap().contains(id.file_id.as_str()) {
                continue;
            }
            match self.sync_status(&object_id, &id).await {
                Ok(SyncStatus::Synced) => {
                    if let Err(e) = self
                        .files
                        .index()
                        .set_sync_status(&FileId(id.file_id.to_string()), SyncStatus::Synced as u64)
                    {
                        warn!(file_id = %id.file_id, "persist sync status: {e}");
                    }
                    self.emit(SyncEvent::FileStatus {
                        file_id: id.file_id.to_string(),
                        status: SyncStatus::Synced,
                    });
                    self.watched.lock().unwrap().remove(&object_id);
                }
                Ok(_) => {}
                Err(e) => warn!(file_id = %id.file_id, "status check failed: {e}"),
            }
        }
    }
}
