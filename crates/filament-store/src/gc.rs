//! Mark-and-sweep garbage collection over the local flat store
//!
//! Marks are only valid for the lifetime of one `LocalStoreGc` handle; a
//! sweep deletes every block whose key was never marked. Callers must mark
//! every root still referenced, including files that merely sit in a
//! retry queue, before sweeping.

use std::collections::HashSet;
use std::sync::Arc;

use cid::Cid;
use tracing::debug;

use filament_core::FileResult;

use crate::local::LocalStore;

pub struct LocalStoreGc {
    store: Arc<LocalStore>,
    using: HashSet<String>,
}

impl LocalStore {
    pub fn new_gc(self: &Arc<Self>) -> LocalStoreGc {
        LocalStoreGc {
            store: Arc::clone(self),
            using: HashSet::new(),
        }
    }
}

impl LocalStoreGc {
    pub fn mark_as_using(&mut self, cids: &[Cid]) {
        for cid in cids {
            self.using.insert(cid.to_string().to_uppercase());
        }
    }

    /// Deletes every block not marked through this handle. Sweeps are
    /// serialized process-wide.
    pub async fn collect_garbage(&self) -> FileResult<u64> {
        let _guard = self.store.gc_guard().await;
        let mut freed = 0u64;
        for (key, path, size) in self.store.all_keys()? {
            if !self.using.contains(&key) {
                self.store.remove_by_path(&path, size)?;
                freed += size;
            }
        }
        debug!(freed, marked = self.using.len(), "gc sweep done");
        Ok(freed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cid_util::{cid_for, RAW};
    use crate::{BlockGetter, BlockPutter};
    use filament_core::{Block, FileError};

    #[tokio::test]
    async fn sweep_keeps_marked_deletes_rest() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();

        let keep = Block::new(cid_for(RAW, b"keep"), b"keep".to_vec());
        let drop = Block::new(cid_for(RAW, b"drop"), b"drop".to_vec());
        store.add(vec![keep.clone(), drop.clone()]).await.unwrap();

        let mut gc = store.new_gc();
        gc.mark_as_using(&[keep.cid]);
        let freed = gc.collect_garbage().await.unwrap();

        assert_eq!(freed, drop.len() as u64);
        assert!(store.get(&keep.cid).await.is_ok());
        assert!(matches!(
            store.get(&drop.cid).await,
            Err(FileError::NotFound)
        ));
        assert_eq!(store.local_disk_usage(), keep.len() as u64);
    }

    #[tokio::test]
    async fn unmarked_sweep_empties_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        store
            .add(vec![Block::new(cid_for(RAW, b"x"), b"x".to_vec())])
            .await
            .unwrap();

        let gc = store.new_gc();
        gc.collect_garbage().await.unwrap();
        assert_eq!(store.local_disk_usage(), 0);
    }
}
