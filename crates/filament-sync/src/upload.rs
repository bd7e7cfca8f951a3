//! Upload and deletion workers
//!
//! Per dequeued item: walk the DAG depth-first in batches of `batch_size`
//! blocks, `BlocksCheck` each batch, bind the already-present cids, check
//! the quota against `AccountInfo`, then push the missing blocks. Quota
//! exhaustion moves the item to the retry queue and emits `LimitReached`
//! once per attempt; a deleted file object ends the upload without retry.

use std::ops::ControlFlow;
use std::sync::Arc;

use cid::Cid;
use tracing::{debug, warn};

use filament_core::proto::AvailabilityStatus;
use filament_core::{Block, FileError, FileId, FileResult, SpaceId, SyncStatus};
use filament_files::{walk_dag, DagService};
use filament_store::ProxyStore;

use crate::events::SyncEvent;
use crate::queue::Action;
use crate::{FileSync, SyncQueueItem};

impl FileSync {
    pub(crate) async fn handle_upload(&self, item: SyncQueueItem) -> Action {
        // The file may have been offloaded after it was queued.
        match self.files.index().list_by_file_id(&FileId(item.file_id.clone())) {
            Ok(variants) if variants.is_empty() => return Action::Done,
            Ok(_) => {}
            Err(e) => {
                warn!(file_id = %item.file_id, "upload: index lookup failed: {e}");
                return Action::Retry;
            }
        }

        match self.upload_file(&item).await {
            Ok(()) => {
                self.after_upload_success(&item).await;
                Action::Done
            }
            Err(FileError::TreeDeleted) => {
                debug!(file_id = %item.file_id, "upload: file object deleted, dropping");
                Action::Done
            }
            Err(err @ FileError::ReachedLimit { .. }) => {
                self.on_limit_reached(&item, &err).await;
                if let Err(e) = self.retry_uploading.add(item) {
                    warn!("move to retry-uploading: {e}");
                    return Action::Retry;
                }
                Action::Done
            }
            Err(e) => {
                warn!(file_id = %item.file_id, "upload failed, will retry: {e}");
                Action::Retry
            }
        }
    }

    /// The retry queue re-attempts with the same logic; failures stay in
    /// the retry queue, paced by its pause.
    pub(crate) async fn handle_retry_upload(&self, item: SyncQueueItem) -> Action {
        match self.files.index().list_by_file_id(&FileId(item.file_id.clone())) {
            Ok(variants) if variants.is_empty() => return Action::Done,
            Ok(_) => {}
            Err(_) => return Action::Retry,
        }
        match self.upload_file(&item).await {
            Ok(()) => {
                self.after_upload_success(&item).await;
                Action::Done
            }
            Err(FileError::TreeDeleted) => Action::Done,
            Err(err @ FileError::ReachedLimit { .. }) => {
                self.on_limit_reached(&item, &err).await;
                Action::Retry
            }
            Err(e) => {
                debug!(file_id = %item.file_id, "retry upload failed: {e}");
                Action::Retry
            }
        }
    }

    async fn upload_file(&self, item: &SyncQueueItem) -> FileResult<()> {
        let space_id = SpaceId(item.space_id.clone());
        let file_id = FileId(item.file_id.clone());
        let root = file_id.to_cid()?;

        // Walk without populating the cache: these reads serve the wire,
        // not future local reads.
        let store = ProxyStore::new(
            Arc::clone(self.files.local()),
            Arc::clone(&self.remote),
            space_id.clone(),
        )
        .with_cache_disabled();
        let dag = DagService::new(Arc::new(store));

        let mut blocks: Vec<Block> = Vec::new();
        walk_dag(&dag, &root, &self.cancel, |block, _| {
            blocks.push(block.clone());
            ControlFlow::Continue(())
        })
        .await?;

        for batch in blocks.chunks(self.cfg.batch_size.max(1)) {
            self.upload_batch(&space_id, &file_id, batch).await?;
        }
        Ok(())
    }

    async fn upload_batch(
        &self,
        space_id: &SpaceId,
        file_id: &FileId,
        batch: &[Block],
    ) -> FileResult<()> {
        let cids: Vec<Cid> = batch.iter().map(|b| b.cid).collect();
        let availability = self.remote.blocks_check(space_id, &cids).await?;

        let mut to_bind: Vec<Cid> = Vec::new();
        let mut to_push: Vec<&Block> = Vec::new();
        for entry in &availability {
            let cid = Cid::try_from(entry.cid.as_slice())?;
            if entry.status == AvailabilityStatus::NotExists as i32 {
                let block = batch
                    .iter()
                    .find(|b| b.cid == cid)
                    .ok_or_else(|| FileError::CidNotFound(cid.to_string()))?;
                to_push.push(block);
            } else {
                to_bind.push(cid);
            }
        }

        let bytes_to_upload: u64 = to_push.iter().map(|b| b.len() as u64).sum();
        if bytes_to_upload > 0 {
            let usage = self.remote.account_info().await?;
            let limit = self
                .limit_override()
                .unwrap_or(usage.account_bytes_limit);
            let free = limit.saturating_sub(usage.total_bytes_usage);
            if bytes_to_upload > free {
                // Unbind whatever earlier batches attached.
                if let Err(e) = self
                    .remote
                    .files_delete(space_id, std::slice::from_ref(file_id))
                    .await
                {
                    warn!(%file_id, "unbind off-limit file: {e}");
                }
                return Err(FileError::ReachedLimit {
                    required: bytes_to_upload,
                    left: free,
                    limit,
                });
            }
        }

        if !to_bind.is_empty() {
            self.remote.blocks_bind(space_id, file_id, &to_bind).await?;
        }
        for block in to_push {
            self.remote.block_push(space_id, file_id, block).await?;
        }
        Ok(())
    }

    async fn after_upload_success(&self, item: &SyncQueueItem) {
        let space_id = SpaceId(item.space_id.clone());
        let file_id = FileId(item.file_id.clone());
        if let Err(e) = self.kv.delete(&Self::limit_flag_key(&item.object_id)) {
            warn!("clear limit flag: {e}");
        }
        if let Err(e) = self
            .files
            .index()
            .set_sync_status(&file_id, SyncStatus::Synced as u64)
        {
            warn!(%file_id, "set sync status: {e}");
        }
        match self.refresh_space_stat(&space_id).await {
            Ok(stat) => self.emit(SyncEvent::FileSpaceUsage {
                space_id: item.space_id.clone(),
                bytes_usage: stat.space_bytes_usage,
            }),
            Err(e) => warn!(%space_id, "refresh space stat: {e}"),
        }
        debug!(%file_id, "upload done");
    }

    async fn on_limit_reached(&self, item: &SyncQueueItem, err: &FileError) {
        warn!(file_id = %item.file_id, object_id = %item.object_id, "upload limit: {err}");
        if let Err(e) = self
            .files
            .index()
            .set_sync_status(&FileId(item.file_id.clone()), SyncStatus::Limited as u64)
        {
            warn!("set limited status: {e}");
        }

        let flag_key = Self::limit_flag_key(&item.object_id);
        let already_notified = self.kv.has(&flag_key).unwrap_or(false);
        if already_notified {
            return;
        }
        if let Err(e) = self.kv.put(&flag_key, &[1]) {
            warn!("set limit flag: {e}");
        }
        let event = SyncEvent::LimitReached {
            space_id: item.space_id.clone(),
        };
        if item.imported {
            self.import_events.lock().unwrap().push(event);
        } else if item.added_by_user {
            self.emit(event);
        }
    }

    pub(crate) async fn handle_delete(&self, item: SyncQueueItem) -> Action {
        match self.delete_remote(&item).await {
            Ok(()) => Action::Done,
            Err(e) => {
                warn!(file_id = %item.file_id, "deletion failed, moving to retry: {e}");
                if self.retry_deleting.add(item).is_err() {
                    return Action::Retry;
                }
                Action::Done
            }
        }
    }

    pub(crate) async fn handle_retry_delete(&self, item: SyncQueueItem) -> Action {
        match self.delete_remote(&item).await {
            Ok(()) => Action::Done,
            Err(e) => {
                debug!(file_id = %item.file_id, "retry deletion failed: {e}");
                Action::Retry
            }
        }
    }

    async fn delete_remote(&self, item: &SyncQueueItem) -> FileResult<()> {
        let space_id = SpaceId(item.space_id.clone());
        let file_id = FileId(item.file_id.clone());
        self.remote
            .files_delete(&space_id, std::slice::from_ref(&file_id))
            .await?;
        self.refresh_space_stat(&space_id).await?;
        debug!(%file_id, "remote deletion done");
        Ok(())
    }
}
