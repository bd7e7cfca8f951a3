//! Per-peer file-node client with auth state and a usage score

use std::sync::Mutex;
use std::time::Instant;

use cid::Cid;
use tonic::transport::Channel;
use tracing::debug;

use filament_core::proto;
use filament_core::proto::file_node_client::FileNodeClient;
use filament_core::{Block, FileError, FileId, FileResult, SpaceId};

/// Recency + throughput score used to pick the preferred client per task.
#[derive(Debug)]
pub struct ClientStat {
    last_usage: Instant,
    rate_bps: f64,
}

impl ClientStat {
    fn new() -> Self {
        Self {
            last_usage: Instant::now(),
            rate_bps: 0.0,
        }
    }

    fn update_last_usage(&mut self) {
        self.last_usage = Instant::now();
    }

    fn add(&mut self, started: Instant, bytes: usize) {
        let secs = started.elapsed().as_secs_f64().max(1e-6);
        let sample = bytes as f64 / secs;
        // EWMA so a single slow transfer doesn't dominate
        self.rate_bps = if self.rate_bps == 0.0 {
            sample
        } else {
            0.8 * self.rate_bps + 0.2 * sample
        };
        self.last_usage = Instant::now();
    }

    pub fn score(&self) -> f64 {
        let idle = self.last_usage.elapsed().as_secs_f64();
        1.0 / (1.0 + idle) + (1.0 + self.rate_bps).ln() / 10.0
    }
}

/// A connected peer. Auth state is learned from a `Check` RPC on connect
/// and refreshed on reconnect.
pub struct PeerClient {
    peer_id: String,
    client: FileNodeClient<Channel>,
    space_ids: Vec<String>,
    allow_write: bool,
    stat: Mutex<ClientStat>,
}

impl PeerClient {
    pub async fn connect(peer_id: String, channel: Channel) -> FileResult<Self> {
        let mut client = FileNodeClient::new(channel);
        let check = client
            .check(proto::CheckRequest {})
            .await
            .map_err(FileError::Rpc)?
            .into_inner();
        debug!(peer = %peer_id, spaces = ?check.space_ids, allow_write = check.allow_write, "peer connected");
        Ok(Self {
            peer_id,
            client,
            space_ids: check.space_ids,
            allow_write: check.allow_write,
            stat: Mutex::new(ClientStat::new()),
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn score(&self) -> f64 {
        self.stat.lock().unwrap().score()
    }

    /// Whether this client may serve a task for `space_id`, optionally a write.
    pub fn accepts(&self, space_id: &SpaceId, write: bool) -> bool {
        if write && !self.allow_write {
            return false;
        }
        // An empty space list means the peer serves every space.
        self.space_ids.is_empty() || self.space_ids.iter().any(|s| s == space_id.as_str())
    }

    fn grpc(&self) -> FileNodeClient<Channel> {
        self.client.clone()
    }

    pub async fn block_get(&self, space_id: &SpaceId, cid: &Cid) -> FileResult<Block> {
        let started = Instant::now();
        let resp = self
            .grpc()
            .block_get(proto::BlockGetRequest {
                space_id: space_id.to_string(),
                cid: cid.to_bytes(),
                wait: false,
            })
            .await
            .map_err(|status| {
                if status.code() == tonic::Code::NotFound {
                    FileError::CidNotFound(cid.to_string())
                } else {
                    FileError::Rpc(status)
                }
            })?
            .into_inner();
        self.stat.lock().unwrap().add(started, resp.data.len());
        Ok(Block::new(*cid, resp.data))
    }

    pub async fn block_push(
        &self,
        space_id: &SpaceId,
        file_id: &FileId,
        block: &Block,
    ) -> FileResult<()> {
        let started = Instant::now();
        self.grpc()
            .block_push(proto::BlockPushRequest {
                space_id: space_id.to_string(),
                file_id: file_id.to_string(),
                cid: block.cid.to_bytes(),
                data: block.data.to_vec(),
            })
            .await?;
        self.stat.lock().unwrap().add(started, block.len());
        Ok(())
    }

    pub async fn blocks_check(
        &self,
        space_id: &SpaceId,
        cids: &[Cid],
    ) -> FileResult<Vec<proto::BlockAvailability>> {
        let resp = self
            .grpc()
            .blocks_check(proto::BlocksCheckRequest {
                space_id: space_id.to_string(),
                cids: cids.iter().map(|c| c.to_bytes()).collect(),
            })
            .await?
            .into_inner();
        self.stat.lock().unwrap().update_last_usage();
        Ok(resp.blocks_availability)
    }

    pub async fn blocks_bind(
        &self,
        space_id: &SpaceId,
        file_id: &FileId,
        cids: &[Cid],
    ) -> FileResult<()> {
        self.grpc()
            .blocks_bind(proto::BlocksBindRequest {
                space_id: space_id.to_string(),
                file_id: file_id.to_string(),
                cids: cids.iter().map(|c| c.to_bytes()).collect(),
            })
            .await?;
        self.stat.lock().unwrap().update_last_usage();
        Ok(())
    }

    pub async fn files_delete(&self, space_id: &SpaceId, file_ids: &[FileId]) -> FileResult<()> {
        self.grpc()
            .files_delete(proto::FilesDeleteRequest {
                space_id: space_id.to_string(),
                file_ids: file_ids.iter().map(|f| f.to_string()).collect(),
            })
            .await?;
        self.stat.lock().unwrap().update_last_usage();
        Ok(())
    }

    pub async fn files_info(
        &self,
        space_id: &SpaceId,
        file_ids: &[FileId],
    ) -> FileResult<Vec<proto::FileInfo>> {
        let resp = self
            .grpc()
            .files_info(proto::FilesInfoRequest {
                space_id: space_id.to_string(),
                file_ids: file_ids.iter().map(|f| f.to_string()).collect(),
            })
            .await?
            .into_inner();
        self.stat.lock().unwrap().update_last_usage();
        Ok(resp.files_info)
    }

    pub async fn space_info(&self, space_id: &SpaceId) -> FileResult<proto::SpaceInfoResponse> {
        let resp = self
            .grpc()
            .space_info(proto::SpaceInfoRequest {
                space_id: space_id.to_string(),
            })
            .await?
            .into_inner();
        self.stat.lock().unwrap().update_last_usage();
        Ok(resp)
    }

    pub async fn account_info(&self) -> FileResult<proto::AccountInfoResponse> {
        let resp = self
            .grpc()
            .account_info(proto::AccountInfoRequest {})
            .await?
            .into_inner();
        self.stat.lock().unwrap().update_last_usage();
        Ok(resp)
    }
}
