//! Proxy store: local cache in front of a remote node
//!
//! Reads fall through to the remote and populate the cache on the way
//! back. Writes stop at the cache: pushing to the remote must be
//! serialized, quota-checked, and batched, which is the synchronizer's
//! job, not the read path's. Existence probes are answered locally.

use std::sync::Arc;

use async_trait::async_trait;
use cid::Cid;
use tokio::sync::mpsc;
use tracing::warn;

use filament_core::{Block, FileError, FileResult, SpaceId};

use crate::local::LocalStore;
use crate::remote::RemoteStore;
use crate::{BlockAvailability, BlockGetter, BlockPutter};

#[derive(Clone)]
pub struct ProxyStore {
    local: Arc<LocalStore>,
    origin: Arc<dyn RemoteStore>,
    space_id: SpaceId,
    cache_reads: bool,
}

impl ProxyStore {
    pub fn new(local: Arc<LocalStore>, origin: Arc<dyn RemoteStore>, space_id: SpaceId) -> Self {
        Self {
            local,
            origin,
            space_id,
            cache_reads: true,
        }
    }

    /// Same store, but remote reads do not populate the cache. Used by the
    /// synchronizer, whose walks should not double local disk usage.
    pub fn with_cache_disabled(&self) -> Self {
        Self {
            cache_reads: false,
            ..self.clone()
        }
    }

    pub fn local(&self) -> &Arc<LocalStore> {
        &self.local
    }

    async fn fetch_remote(&self, cid: &Cid) -> FileResult<Block> {
        let block = self.origin.block_get(&self.space_id, cid).await?;
        if self.cache_reads {
            if let Err(e) = self.local.add(vec![block.clone()]).await {
                warn!(%cid, "cache remote block: {e}");
            }
        }
        Ok(block)
    }
}

#[async_trait]
impl BlockGetter for ProxyStore {
    async fn get(&self, cid: &Cid) -> FileResult<Block> {
        match self.local.get(cid).await {
            Ok(block) => Ok(block),
            Err(FileError::NotFound) => self.fetch_remote(cid).await,
            Err(e) => Err(e),
        }
    }

    async fn get_many(&self, cids: Vec<Cid>) -> mpsc::Receiver<Block> {
        let (tx, rx) = mpsc::channel(16);

        // If the local probe itself fails, everything goes to the remote.
        let (hits, misses) = match self.local.partition_by_existence(&cids).await {
            Ok(partitioned) => partitioned,
            Err(e) => {
                warn!("local existence probe failed, falling back to remote: {e}");
                (Vec::new(), cids)
            }
        };

        let local = Arc::clone(&self.local);
        let this = self.clone();
        tokio::spawn(async move {
            let mut local_rx = local.get_many(hits).await;
            let remote_tx = tx.clone();
            let remote_task = async {
                for cid in misses {
                    match this.fetch_remote(&cid).await {
                        Ok(block) => {
                            if remote_tx.send(block).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!(%cid, "remote get_many: {e}"),
                    }
                }
            };
            let local_task = async {
                while let Some(block) = local_rx.recv().await {
                    if tx.send(block).await.is_err() {
                        return;
                    }
                }
            };
            tokio::join!(local_task, remote_task);
        });
        rx
    }
}

#[async_trait]
impl BlockPutter for ProxyStore {
    async fn add(&self, blocks: Vec<Block>) -> FileResult<()> {
        // Remote writes are deferred to the synchronizer.
        let absent = self.local.not_exists_blocks(blocks).await?;
        if absent.is_empty() {
            return Ok(());
        }
        self.local.add(absent).await
    }

    async fn delete(&self, cid: &Cid) -> FileResult<()> {
        self.local.delete(cid).await
    }
}

#[async_trait]
impl BlockAvailability for ProxyStore {
    async fn exists_cids(&self, cids: &[Cid]) -> FileResult<Vec<Cid>> {
        self.local.exists_cids(cids).await
    }

    async fn not_exists_blocks(&self, blocks: Vec<Block>) -> FileResult<Vec<Block>> {
        self.local.not_exists_blocks(blocks).await
    }

    async fn partition_by_existence(&self, cids: &[Cid]) -> FileResult<(Vec<Cid>, Vec<Cid>)> {
        self.local.partition_by_existence(cids).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cid_util::{cid_for, RAW};
    use crate::inmem::InMemoryRemote;
    use filament_core::FileId;

    fn block(data: &[u8]) -> Block {
        Block::new(cid_for(RAW, data), data.to_vec())
    }

    async fn proxy_with_remote_block(b: &Block) -> (ProxyStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let local = LocalStore::open(dir.path()).unwrap();
        let remote = Arc::new(InMemoryRemote::new(1 << 20));
        let space = SpaceId::from("space1");
        remote
            .block_push(&space, &FileId::from("f"), b)
            .await
            .unwrap();
        (ProxyStore::new(local, remote, space), dir)
    }

    #[tokio::test]
    async fn read_through_populates_cache() {
        let b = block(b"remote only");
        let (proxy, _dir) = proxy_with_remote_block(&b).await;

        assert!(proxy.local().get(&b.cid).await.is_err());
        let got = proxy.get(&b.cid).await.unwrap();
        assert_eq!(got, b);
        // second read is served locally
        assert!(proxy.local().get(&b.cid).await.is_ok());
    }

    #[tokio::test]
    async fn cache_disabled_read_leaves_local_empty() {
        let b = block(b"no caching");
        let (proxy, _dir) = proxy_with_remote_block(&b).await;

        let no_cache = proxy.with_cache_disabled();
        assert_eq!(no_cache.get(&b.cid).await.unwrap(), b);
        assert!(proxy.local().get(&b.cid).await.is_err());
    }

    #[tokio::test]
    async fn add_is_local_only() {
        let dir = tempfile::tempdir().unwrap();
        let local = LocalStore::open(dir.path()).unwrap();
        let remote = Arc::new(InMemoryRemote::new(1 << 20));
        let proxy = ProxyStore::new(local, Arc::clone(&remote) as Arc<dyn RemoteStore>, SpaceId::from("s"));

        let b = block(b"write through cache only");
        proxy.add(vec![b.clone()]).await.unwrap();
        assert!(proxy.local().get(&b.cid).await.is_ok());
        assert!(!remote.has_block(&b.cid));
    }

    #[tokio::test]
    async fn get_many_merges_local_and_remote() {
        let remote_b = block(b"from remote");
        let (proxy, _dir) = proxy_with_remote_block(&remote_b).await;
        let local_b = block(b"from local");
        proxy.add(vec![local_b.clone()]).await.unwrap();

        let mut rx = proxy.get_many(vec![local_b.cid, remote_b.cid]).await;
        let mut got = Vec::new();
        while let Some(b) = rx.recv().await {
            got.push(b.cid);
        }
        got.sort();
        let mut want = vec![local_b.cid, remote_b.cid];
        want.sort();
        assert_eq!(got, want);
    }

    #[tokio::test]
    async fn missing_everywhere_is_cid_not_found() {
        let (proxy, _dir) = proxy_with_remote_block(&block(b"x")).await;
        let ghost = cid_for(RAW, b"ghost");
        assert!(matches!(
            proxy.get(&ghost).await,
            Err(FileError::CidNotFound(_))
        ));
    }
}
