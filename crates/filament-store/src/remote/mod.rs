//! Remote block store: file-node clients and the multi-peer manager
//!
//! One lightweight client per active peer, created on demand from the
//! transport pool and bounded by an LRU. Each operation is a task routed to
//! the best-scoring eligible client; a failing peer is denied for that task
//! and the task moves on, failing only when every known client refused it.

mod client;
mod manager;

pub use client::{ClientStat, PeerClient};
pub use manager::{PeerPool, RpcStore, RpcStoreConfig};

use async_trait::async_trait;
use cid::Cid;

use filament_core::proto;
use filament_core::{Block, FileId, FileResult, NodeUsage, SpaceId, SpaceStat};

/// What the synchronizer and proxy consume from a remote node.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn block_get(&self, space_id: &SpaceId, cid: &Cid) -> FileResult<Block>;
    async fn block_push(
        &self,
        space_id: &SpaceId,
        file_id: &FileId,
        block: &Block,
    ) -> FileResult<()>;
    async fn blocks_check(
        &self,
        space_id: &SpaceId,
        cids: &[Cid],
    ) -> FileResult<Vec<proto::BlockAvailability>>;
    async fn blocks_bind(
        &self,
        space_id: &SpaceId,
        file_id: &FileId,
        cids: &[Cid],
    ) -> FileResult<()>;
    async fn files_delete(&self, space_id: &SpaceId, file_ids: &[FileId]) -> FileResult<()>;
    async fn files_info(
        &self,
        space_id: &SpaceId,
        file_ids: &[FileId],
    ) -> FileResult<Vec<proto::FileInfo>>;
    async fn space_info(&self, space_id: &SpaceId) -> FileResult<SpaceStat>;
    async fn account_info(&self) -> FileResult<NodeUsage>;
}

pub(crate) fn space_stat_from_proto(info: proto::SpaceInfoResponse) -> SpaceStat {
    SpaceStat {
        space_id: info.space_id,
        files_count: info.files_count,
        cids_count: info.cids_count,
        space_bytes_usage: info.space_usage_bytes,
        account_bytes_usage: info.total_usage_bytes,
        account_bytes_limit: info.limit_bytes,
    }
}

pub(crate) fn node_usage_from_proto(info: proto::AccountInfoResponse) -> NodeUsage {
    NodeUsage {
        account_bytes_limit: info.limit_bytes,
        total_bytes_usage: info.total_usage_bytes,
        total_cids_count: info.total_cids_count,
        spaces: info.spaces.into_iter().map(space_stat_from_proto).collect(),
    }
}
