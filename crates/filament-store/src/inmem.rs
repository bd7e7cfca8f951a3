//! In-memory remote store double
//!
//! Behaves like a file-node peer with a byte limit: blocks bind to files
//! per space, usage is recomputed from stored bytes, and pushes past the
//! limit are rejected. Used by synchronizer and codec tests in place of a
//! live peer.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use cid::Cid;

use filament_core::proto;
use filament_core::{Block, FileError, FileId, FileResult, NodeUsage, SpaceId, SpaceStat};

use crate::remote::RemoteStore;

#[derive(Default)]
struct Inner {
    store: HashMap<Cid, Block>,
    files: HashMap<FileId, HashSet<Cid>>,
    space_files: HashMap<SpaceId, HashSet<FileId>>,
    space_cids: HashMap<SpaceId, HashSet<Cid>>,
    limit: u64,
}

impl Inner {
    fn total_usage(&self) -> u64 {
        self.store.values().map(|b| b.len() as u64).sum()
    }

    fn is_bound(&self, space_id: &SpaceId, cid: &Cid) -> bool {
        self.space_cids
            .get(space_id)
            .map(|cids| cids.contains(cid))
            .unwrap_or(false)
    }

    fn within_limits(&self, bytes_to_add: u64) -> bool {
        self.total_usage() + bytes_to_add <= self.limit
    }

    fn bind(&mut self, space_id: &SpaceId, file_id: &FileId, cid: Cid) -> FileResult<()> {
        if !self.store.contains_key(&cid) {
            return Err(FileError::CidNotFound(cid.to_string()));
        }
        self.space_files
            .entry(space_id.clone())
            .or_default()
            .insert(file_id.clone());
        self.space_cids
            .entry(space_id.clone())
            .or_default()
            .insert(cid);
        self.files.entry(file_id.clone()).or_default().insert(cid);
        Ok(())
    }

    fn space_stat(&self, space_id: &SpaceId) -> SpaceStat {
        let files = self.space_files.get(space_id);
        let space_usage: u64 = files
            .iter()
            .flat_map(|f| f.iter())
            .flat_map(|file_id| self.files.get(file_id).into_iter().flatten())
            .collect::<HashSet<_>>()
            .into_iter()
            .filter_map(|cid| self.store.get(cid))
            .map(|b| b.len() as u64)
            .sum();
        SpaceStat {
            space_id: space_id.to_string(),
            files_count: files.map(|f| f.len() as u64).unwrap_or(0),
            cids_count: self
                .space_cids
                .get(space_id)
                .map(|c| c.len() as u64)
                .unwrap_or(0),
            space_bytes_usage: space_usage,
            account_bytes_usage: self.total_usage(),
            account_bytes_limit: self.limit,
        }
    }
}

#[derive(Default)]
pub struct InMemoryRemote {
    inner: Mutex<Inner>,
    push_error_once: Mutex<Option<FileError>>,
    cids_bound: AtomicU64,
    blocks_added: AtomicU64,
    files_deleted: AtomicU64,
}

impl InMemoryRemote {
    pub fn new(limit: u64) -> Self {
        let remote = Self::default();
        remote.inner.lock().unwrap().limit = limit;
        remote
    }

    pub fn set_limit(&self, limit: u64) {
        self.inner.lock().unwrap().limit = limit;
    }

    /// Makes the next `block_push` fail with the given error, once.
    pub fn fail_next_push(&self, err: FileError) {
        *self.push_error_once.lock().unwrap() = Some(err);
    }

    pub fn cids_bound(&self) -> u64 {
        self.cids_bound.load(Ordering::Relaxed)
    }

    pub fn blocks_added(&self) -> u64 {
        self.blocks_added.load(Ordering::Relaxed)
    }

    pub fn files_deleted(&self) -> u64 {
        self.files_deleted.load(Ordering::Relaxed)
    }

    pub fn has_block(&self, cid: &Cid) -> bool {
        self.inner.lock().unwrap().store.contains_key(cid)
    }

    pub fn file_cids(&self, file_id: &FileId) -> Vec<Cid> {
        self.inner
            .lock()
            .unwrap()
            .files
            .get(file_id)
            .map(|cids| cids.iter().copied().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemote {
    async fn block_get(&self, _space_id: &SpaceId, cid: &Cid) -> FileResult<Block> {
        self.inner
            .lock()
            .unwrap()
            .store
            .get(cid)
            .cloned()
            .ok_or_else(|| FileError::CidNotFound(cid.to_string()))
    }

    async fn block_push(
        &self,
        space_id: &SpaceId,
        file_id: &FileId,
        block: &Block,
    ) -> FileResult<()> {
        if let Some(err) = self.push_error_once.lock().unwrap().take() {
            return Err(err);
        }
        let mut inner = self.inner.lock().unwrap();
        let bytes_to_add = if inner.is_bound(space_id, &block.cid) {
            0
        } else {
            block.len() as u64
        };
        if !inner.within_limits(bytes_to_add) {
            let (limit, usage) = (inner.limit, inner.total_usage());
            return Err(FileError::ReachedLimit {
                required: bytes_to_add,
                left: limit.saturating_sub(usage),
                limit,
            });
        }
        inner.store.insert(block.cid, block.clone());
        inner.bind(space_id, file_id, block.cid)?;
        self.blocks_added.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn blocks_check(
        &self,
        space_id: &SpaceId,
        cids: &[Cid],
    ) -> FileResult<Vec<proto::BlockAvailability>> {
        let inner = self.inner.lock().unwrap();
        Ok(cids
            .iter()
            .map(|cid| {
                let status = if inner.is_bound(space_id, cid) {
                    proto::AvailabilityStatus::ExistsInSpace
                } else if inner.store.contains_key(cid) {
                    proto::AvailabilityStatus::Exists
                } else {
                    proto::AvailabilityStatus::NotExists
                };
                proto::BlockAvailability {
                    cid: cid.to_bytes(),
                    status: status as i32,
                }
            })
            .collect())
    }

    async fn blocks_bind(
        &self,
        space_id: &SpaceId,
        file_id: &FileId,
        cids: &[Cid],
    ) -> FileResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let bytes_to_bind: u64 = cids
            .iter()
            .filter(|cid| !inner.is_bound(space_id, cid))
            .filter_map(|cid| inner.store.get(cid))
            .map(|b| b.len() as u64)
            .sum();
        if !inner.within_limits(bytes_to_bind) {
            let (limit, usage) = (inner.limit, inner.total_usage());
            return Err(FileError::ReachedLimit {
                required: bytes_to_bind,
                left: limit.saturating_sub(usage),
                limit,
            });
        }
        for cid in cids {
            inner.bind(space_id, file_id, *cid)?;
            self.cids_bound.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn files_delete(&self, space_id: &SpaceId, file_ids: &[FileId]) -> FileResult<()> {
        let mut inner = self.inner.lock().unwrap();
        for file_id in file_ids {
            let known = inner
                .space_files
                .get_mut(space_id)
                .map(|files| files.remove(file_id))
                .unwrap_or(false);
            // Unknown ids are ignored.
            if !known {
                continue;
            }
            if let Some(cids) = inner.files.remove(file_id) {
                if let Some(space_cids) = inner.space_cids.get_mut(space_id) {
                    for cid in &cids {
                        space_cids.remove(cid);
                    }
                }
            }
            self.files_deleted.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn files_info(
        &self,
        space_id: &SpaceId,
        file_ids: &[FileId],
    ) -> FileResult<Vec<proto::FileInfo>> {
        let inner = self.inner.lock().unwrap();
        let mut infos = Vec::new();
        for file_id in file_ids {
            let in_space = inner
                .space_files
                .get(space_id)
                .map(|files| files.contains(file_id))
                .unwrap_or(false);
            if !in_space {
                continue;
            }
            let Some(cids) = inner.files.get(file_id) else {
                continue;
            };
            infos.push(proto::FileInfo {
                file_id: file_id.to_string(),
                cids_count: cids.len() as u32,
                usage_bytes: cids
                    .iter()
                    .filter_map(|cid| inner.store.get(cid))
                    .map(|b| b.len() as u64)
                    .sum(),
            });
        }
        Ok(infos)
    }

    async fn space_info(&self, space_id: &SpaceId) -> FileResult<SpaceStat> {
        Ok(self.inner.lock().unwrap().space_stat(space_id))
    }

    async fn account_info(&self) -> FileResult<NodeUsage> {
        let inner = self.inner.lock().unwrap();
        let spaces: Vec<SpaceStat> = inner
            .space_files
            .keys()
            .map(|space| inner.space_stat(space))
            .collect();
        Ok(NodeUsage {
            account_bytes_limit: inner.limit,
            total_bytes_usage: inner.total_usage(),
            total_cids_count: inner.store.len() as u64,
            spaces,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cid_util::{cid_for, RAW};

    fn block(data: &[u8]) -> Block {
        Block::new(cid_for(RAW, data), data.to_vec())
    }

    #[tokio::test]
    async fn push_binds_and_accounts() {
        let remote = InMemoryRemote::new(1024);
        let space = SpaceId::from("space1");
        let file = FileId::from("file1");
        let b = block(b"payload");

        remote.block_push(&space, &file, &b).await.unwrap();
        assert!(remote.has_block(&b.cid));

        let stat = remote.space_info(&space).await.unwrap();
        assert_eq!(stat.space_bytes_usage, b.len() as u64);
        assert_eq!(stat.files_count, 1);
    }

    #[tokio::test]
    async fn push_over_limit_is_rejected() {
        let remote = InMemoryRemote::new(4);
        let space = SpaceId::from("space1");
        let file = FileId::from("file1");
        let err = remote
            .block_push(&space, &file, &block(b"too big for limit"))
            .await
            .unwrap_err();
        assert!(matches!(err, FileError::ReachedLimit { .. }));
    }

    #[tokio::test]
    async fn check_distinguishes_space_binding() {
        let remote = InMemoryRemote::new(1024);
        let space_a = SpaceId::from("a");
        let space_b = SpaceId::from("b");
        let file = FileId::from("f");
        let b = block(b"shared");
        remote.block_push(&space_a, &file, &b).await.unwrap();

        let in_a = remote.blocks_check(&space_a, &[b.cid]).await.unwrap();
        assert_eq!(in_a[0].status, proto::AvailabilityStatus::ExistsInSpace as i32);

        let in_b = remote.blocks_check(&space_b, &[b.cid]).await.unwrap();
        assert_eq!(in_b[0].status, proto::AvailabilityStatus::Exists as i32);

        let missing = remote
            .blocks_check(&space_b, &[cid_for(RAW, b"nope")])
            .await
            .unwrap();
        assert_eq!(missing[0].status, proto::AvailabilityStatus::NotExists as i32);
    }

    #[tokio::test]
    async fn delete_unknown_file_succeeds() {
        let remote = InMemoryRemote::new(1024);
        remote
            .files_delete(&SpaceId::from("s"), &[FileId::from("ghost")])
            .await
            .unwrap();
        assert_eq!(remote.files_deleted(), 0);
    }

    #[tokio::test]
    async fn delete_unbinds_space_cids() {
        let remote = InMemoryRemote::new(1024);
        let space = SpaceId::from("s");
        let file = FileId::from("f");
        let b = block(b"bound");
        remote.block_push(&space, &file, &b).await.unwrap();
        remote.files_delete(&space, &[file.clone()]).await.unwrap();

        let check = remote.blocks_check(&space, &[b.cid]).await.unwrap();
        assert_eq!(check[0].status, proto::AvailabilityStatus::Exists as i32);
        assert!(remote.file_cids(&file).is_empty());
    }

    #[tokio::test]
    async fn injected_push_error_fires_once() {
        let remote = InMemoryRemote::new(1024);
        remote.fail_next_push(FileError::TreeDeleted);
        let space = SpaceId::from("s");
        let file = FileId::from("f");
        let b = block(b"x");

        let err = remote.block_push(&space, &file, &b).await.unwrap_err();
        assert!(matches!(err, FileError::TreeDeleted));
        remote.block_push(&space, &file, &b).await.unwrap();
    }
}
