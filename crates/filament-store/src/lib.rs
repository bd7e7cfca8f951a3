//! filament-store: the two-tier block store
//!
//! - `local`: flat content-addressed cache on disk, with byte accounting
//!   and mark-and-sweep garbage collection
//! - `remote`: clients against file-node peers, multiplexed by a
//!   score-based manager with deny-list failover
//! - `proxy`: composes local + remote: read-through into the cache,
//!   write-through to the cache only (remote writes belong to the
//!   synchronizer, which serializes, quota-checks, and batches them)
//! - `inmem`: in-memory remote double shared by tests across crates

pub mod cid_util;
pub mod gc;
pub mod inmem;
pub mod local;
pub mod proxy;
pub mod remote;

pub use gc::LocalStoreGc;
pub use inmem::InMemoryRemote;
pub use local::LocalStore;
pub use proxy::ProxyStore;
pub use remote::{RemoteStore, RpcStore, RpcStoreConfig};

use async_trait::async_trait;
use cid::Cid;
use tokio::sync::mpsc;

use filament_core::{Block, FileResult};

/// Read side of a block store.
#[async_trait]
pub trait BlockGetter: Send + Sync {
    async fn get(&self, cid: &Cid) -> FileResult<Block>;
    /// Delivers blocks as they become available; misses are skipped.
    async fn get_many(&self, cids: Vec<Cid>) -> mpsc::Receiver<Block>;
}

/// Write side of a block store.
#[async_trait]
pub trait BlockPutter: Send + Sync {
    /// Idempotent on equal raw bytes.
    async fn add(&self, blocks: Vec<Block>) -> FileResult<()>;
    async fn delete(&self, cid: &Cid) -> FileResult<()>;
}

/// Existence probes, answered without touching block contents.
#[async_trait]
pub trait BlockAvailability: Send + Sync {
    /// The subset of `cids` that are present.
    async fn exists_cids(&self, cids: &[Cid]) -> FileResult<Vec<Cid>>;
    /// The subset of `blocks` that are absent.
    async fn not_exists_blocks(&self, blocks: Vec<Block>) -> FileResult<Vec<Block>>;
    /// Disjoint `(present, missing)` whose union is the input.
    async fn partition_by_existence(&self, cids: &[Cid]) -> FileResult<(Vec<Cid>, Vec<Cid>)>;
}

/// The composed store surface the codec and DAG layers polymorph over.
pub trait BlockStore: BlockGetter + BlockPutter + BlockAvailability {}
impl<T: BlockGetter + BlockPutter + BlockAvailability> BlockStore for T {}
