//! Space, file, and account usage statistics
//!
//! Space stats come from remote `SpaceInfo` and are cached per space;
//! account usage is cached in the key-value store so a node that starts
//! offline still reports the last known numbers (or a default limit).
//! File stats fan out `FilesInfo` calls in chunks of 50.

use std::sync::Arc;
use std::time::Duration;

use futures::future;
use tracing::warn;

use filament_core::{FileId, FileResult, FileStat, NodeUsage, SpaceId, SpaceStat};

use crate::{FileSync, NODE_USAGE_KEY};

/// Chunk size for concurrent FilesInfo calls.
const FILES_INFO_CHUNK: usize = 50;

/// Limit presented before the remote has ever answered.
const DEFAULT_LIMIT_BYTES: u64 = 1024 * 1024 * 1024;

impl FileSync {
    /// Cached space usage, fetched on first use.
    pub async fn space_stat(&self, space_id: &SpaceId) -> FileResult<SpaceStat> {
        if let Some(stat) = self.space_stats.lock().unwrap().get(space_id.as_str()) {
            return Ok(stat.clone());
        }
        self.refresh_space_stat(space_id).await
    }

    pub(crate) async fn refresh_space_stat(&self, space_id: &SpaceId) -> FileResult<SpaceStat> {
        let mut stat = self.remote.space_info(space_id).await?;
        if let Some(limit) = self.limit_override() {
            stat.account_bytes_limit = limit;
        }
        self.space_stats
            .lock()
            .unwrap()
            .insert(space_id.to_string(), stat.clone());
        Ok(stat)
    }

    /// Test hook: overrides the account limit reported by the remote.
    pub fn set_limit_override(&self, limit: Option<u64>) {
        *self.limit_override.lock().unwrap() = limit;
    }

    pub(crate) fn limit_override(&self) -> Option<u64> {
        *self.limit_override.lock().unwrap()
    }

    /// Account usage, served from the cache when present.
    pub async fn node_usage(&self) -> FileResult<NodeUsage> {
        if let Some(usage) = self.cached_node_usage()? {
            return Ok(usage);
        }
        self.update_node_usage().await
    }

    pub async fn update_node_usage(&self) -> FileResult<NodeUsage> {
        let usage = self.remote.account_info().await?;
        self.store_node_usage(&usage)?;
        Ok(usage)
    }

    fn cached_node_usage(&self) -> FileResult<Option<NodeUsage>> {
        match self.kv.get(NODE_USAGE_KEY.as_bytes())? {
            Some(raw) => Ok(serde_json::from_slice(&raw).ok()),
            None => Ok(None),
        }
    }

    fn store_node_usage(&self, usage: &NodeUsage) -> FileResult<()> {
        let raw = serde_json::to_vec(usage).map_err(anyhow::Error::from)?;
        self.kv.put(NODE_USAGE_KEY.as_bytes(), &raw)?;
        Ok(())
    }

    /// Seeds the cache so limits are never reported as zero before the
    /// first successful AccountInfo.
    pub(crate) async fn precache_node_usage(&self) {
        let missing = matches!(self.cached_node_usage(), Ok(None) | Err(_));
        if missing {
            let _ = self.store_node_usage(&NodeUsage {
                account_bytes_limit: DEFAULT_LIMIT_BYTES,
                ..Default::default()
            });
        }
        if let Err(e) = self.update_node_usage().await {
            warn!("initial node usage fetch failed: {e}");
        }
    }

    pub(crate) fn spawn_usage_updater(self: &Arc<Self>) {
        let sync = Arc::clone(self);
        tokio::spawn(async move {
            let period = Duration::from_secs(sync.cfg.usage_refresh_secs.max(1));
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = sync.cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = sync.update_node_usage().await {
                    warn!("node usage update failed: {e}");
                }
            }
        });
    }

    /// Per-file usage for a set of files; `is_pinned` holds when every
    /// chunk is on the remote.
    pub async fn file_list_stats(
        &self,
        space_id: &SpaceId,
        file_ids: &[FileId],
    ) -> FileResult<Vec<FileStat>> {
        let chunks = file_ids.chunks(FILES_INFO_CHUNK);
        let responses = future::join_all(
            chunks.map(|chunk| async move { self.remote.files_info(space_id, chunk).await }),
        )
        .await;

        let mut stats = Vec::with_capacity(file_ids.len());
        for response in responses {
            for info in response? {
                let file_id = FileId(info.file_id.clone());
                let total = match self.files.index().get_chunks_count(&file_id) {
                    Ok(count) => count,
                    Err(_) => {
                        let dag = self.files.local_dag();
                        match file_id
                            .to_cid()
                            .map_err(filament_core::FileError::from)
                        {
                            Ok(root) => filament_files::chunks_count(&dag, &root)
                                .await
                                .unwrap_or(0),
                            Err(_) => 0,
                        }
                    }
                };
                stats.push(FileStat {
                    space_id: space_id.to_string(),
                    file_id: info.file_id,
                    total_chunks_count: total,
                    uploaded_chunks_count: info.cids_count as u64,
                    bytes_usage: info.usage_bytes,
                });
            }
        }
        Ok(stats)
    }
}
