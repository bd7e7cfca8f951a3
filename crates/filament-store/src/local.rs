//! Flat content-addressed store on the local filesystem
//!
//! Layout: `<root>/<shard>/<CID>.data`, where the shard is taken from the
//! tail of the uppercased CID string (next-to-last two characters), keeping
//! directory fan-out bounded without an index. Adds are idempotent: a block
//! rewritten with equal raw bytes lands on the same path.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use cid::Cid;
use tokio::sync::mpsc;
use tracing::warn;

use filament_core::{Block, FileError, FileResult};

use crate::{BlockAvailability, BlockGetter, BlockPutter};

const DATA_EXT: &str = "data";

pub struct LocalStore {
    root: PathBuf,
    bytes_usage: AtomicU64,
    // Serializes sweep passes; readers and writers stay lock-free.
    gc_lock: tokio::sync::Mutex<()>,
}

fn store_key(cid: &Cid) -> String {
    cid.to_string().to_uppercase()
}

impl LocalStore {
    pub fn open(root: impl Into<PathBuf>) -> FileResult<Arc<Self>> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let mut usage = 0u64;
        for (_, size) in walk_store(&root)? {
            usage += size;
        }
        Ok(Arc::new(Self {
            root,
            bytes_usage: AtomicU64::new(usage),
            gc_lock: tokio::sync::Mutex::new(()),
        }))
    }

    fn block_path(&self, key: &str) -> PathBuf {
        let shard = if key.len() >= 3 {
            &key[key.len() - 3..key.len() - 1]
        } else {
            "_"
        };
        self.root.join(shard).join(format!("{key}.{DATA_EXT}"))
    }

    /// Total bytes held by the cache.
    pub fn local_disk_usage(&self) -> u64 {
        self.bytes_usage.load(Ordering::Relaxed)
    }

    pub(crate) async fn gc_guard(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.gc_lock.lock().await
    }

    pub(crate) fn all_keys(&self) -> FileResult<Vec<(String, PathBuf, u64)>> {
        let mut out = Vec::new();
        for (path, size) in walk_store(&self.root)? {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                out.push((stem.to_string(), path.clone(), size));
            }
        }
        Ok(out)
    }

    pub(crate) fn remove_by_path(&self, path: &Path, size: u64) -> FileResult<()> {
        std::fs::remove_file(path)?;
        self.bytes_usage.fetch_sub(size, Ordering::Relaxed);
        Ok(())
    }

    async fn has(&self, cid: &Cid) -> FileResult<bool> {
        Ok(tokio::fs::try_exists(self.block_path(&store_key(cid))).await?)
    }
}

fn walk_store(root: &Path) -> std::io::Result<Vec<(PathBuf, u64)>> {
    let mut out = Vec::new();
    for shard in std::fs::read_dir(root)? {
        let shard = shard?.path();
        if !shard.is_dir() {
            continue;
        }
        for entry in std::fs::read_dir(&shard)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().map(|e| e == DATA_EXT).unwrap_or(false) {
                out.push((path, entry.metadata()?.len()));
            }
        }
    }
    Ok(out)
}

#[async_trait]
impl BlockGetter for LocalStore {
    async fn get(&self, cid: &Cid) -> FileResult<Block> {
        let path = self.block_path(&store_key(cid));
        match tokio::fs::read(&path).await {
            Ok(raw) => Ok(Block::new(*cid, raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(FileError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_many(&self, cids: Vec<Cid>) -> mpsc::Receiver<Block> {
        let (tx, rx) = mpsc::channel(16);
        let paths: Vec<(Cid, PathBuf)> = cids
            .iter()
            .map(|c| (*c, self.block_path(&store_key(c))))
            .collect();
        tokio::spawn(async move {
            for (cid, path) in paths {
                match tokio::fs::read(&path).await {
                    Ok(raw) => {
                        if tx.send(Block::new(cid, raw)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!(%cid, "local get_many: {e}"),
                }
            }
        });
        rx
    }
}

#[async_trait]
impl BlockPutter for LocalStore {
    async fn add(&self, blocks: Vec<Block>) -> FileResult<()> {
        for block in blocks {
            let key = store_key(&block.cid);
            let path = self.block_path(&key);
            if tokio::fs::try_exists(&path).await? {
                continue;
            }
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            // Atomic write: temp in the same shard, then rename.
            let tmp = path.with_extension("tmp");
            tokio::fs::write(&tmp, &block.data).await?;
            tokio::fs::rename(&tmp, &path).await?;
            self.bytes_usage
                .fetch_add(block.len() as u64, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn delete(&self, cid: &Cid) -> FileResult<()> {
        let path = self.block_path(&store_key(cid));
        match tokio::fs::metadata(&path).await {
            Ok(meta) => {
                tokio::fs::remove_file(&path).await?;
                self.bytes_usage.fetch_sub(meta.len(), Ordering::Relaxed);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl BlockAvailability for LocalStore {
    async fn exists_cids(&self, cids: &[Cid]) -> FileResult<Vec<Cid>> {
        let mut exists = Vec::new();
        for cid in cids {
            if self.has(cid).await? {
                exists.push(*cid);
            }
        }
        Ok(exists)
    }

    async fn not_exists_blocks(&self, blocks: Vec<Block>) -> FileResult<Vec<Block>> {
        let mut absent = Vec::new();
        for block in blocks {
            if !self.has(&block.cid).await? {
                absent.push(block);
            }
        }
        Ok(absent)
    }

    async fn partition_by_existence(&self, cids: &[Cid]) -> FileResult<(Vec<Cid>, Vec<Cid>)> {
        let mut present = Vec::new();
        let mut missing = Vec::new();
        for cid in cids {
            if self.has(cid).await? {
                present.push(*cid);
            } else {
                missing.push(*cid);
            }
        }
        Ok((present, missing))
    }
}
