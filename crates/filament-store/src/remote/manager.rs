//! Multi-peer client manager
//!
//! Holds an LRU of connected clients keyed by peer id, bounded to
//! `max_connections`. In-flight operations are bounded by `max_tasks`
//! permits. A task runs on the best-scoring eligible client; a refusing
//! peer is denied for the rest of that task's lifetime, and the task fails
//! only once every known client has refused it. The peer set refreshes on
//! a ticker and whenever the transport pool signals a change.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cid::Cid;
use lru::LruCache;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use filament_core::proto;
use filament_core::{Block, FileError, FileId, FileResult, NodeUsage, SpaceId, SpaceStat};

use super::client::PeerClient;
use super::{node_usage_from_proto, space_stat_from_proto, RemoteStore};

/// The transport pool is an external collaborator: it hands us
/// authenticated channels to named peers and tells us when the set changes.
#[async_trait]
pub trait PeerPool: Send + Sync + 'static {
    async fn dial(&self, peer_id: &str) -> FileResult<tonic::transport::Channel>;
    async fn known_peers(&self) -> Vec<String>;
    /// Fired by the peer store when membership changes.
    fn update_signal(&self) -> Arc<Notify>;
}

#[derive(Debug, Clone)]
pub struct RpcStoreConfig {
    pub max_connections: usize,
    pub max_tasks: usize,
    pub refresh_interval: Duration,
}

impl Default for RpcStoreConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            max_tasks: 100,
            refresh_interval: Duration::from_secs(10),
        }
    }
}

pub struct RpcStore {
    pool: Arc<dyn PeerPool>,
    clients: Mutex<LruCache<String, Arc<PeerClient>>>,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
    refresh_interval: Duration,
}

impl RpcStore {
    pub fn new(pool: Arc<dyn PeerPool>, cfg: RpcStoreConfig) -> Arc<Self> {
        let cap = NonZeroUsize::new(cfg.max_connections.max(1)).unwrap();
        Arc::new(Self {
            pool,
            clients: Mutex::new(LruCache::new(cap)),
            permits: Arc::new(Semaphore::new(cfg.max_tasks.max(1))),
            shutdown: CancellationToken::new(),
            refresh_interval: cfg.refresh_interval,
        })
    }

    /// Spawns the peer refresh loop. Idempotent per store instance in
    /// practice: callers invoke it once from their own run phase.
    pub fn run(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let signal = this.pool.update_signal();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.refresh_interval);
            loop {
                tokio::select! {
                    _ = this.shutdown.cancelled() => return,
                    _ = ticker.tick() => {}
                    _ = signal.notified() => {}
                }
                this.refresh_peers().await;
            }
        });
    }

    pub fn close(&self) {
        self.shutdown.cancel();
    }

    async fn refresh_peers(&self) {
        let peers = self.pool.known_peers().await;
        for peer_id in peers {
            if self.clients.lock().await.contains(&peer_id) {
                continue;
            }
            // Connect outside the clients lock; Check runs as part of connect
            // and is retried on the next refresh if the peer is unreachable.
            let channel = match self.pool.dial(&peer_id).await {
                Ok(ch) => ch,
                Err(e) => {
                    debug!(peer = %peer_id, "dial failed: {e}");
                    continue;
                }
            };
            match PeerClient::connect(peer_id.clone(), channel).await {
                Ok(client) => {
                    self.clients.lock().await.push(peer_id, Arc::new(client));
                }
                Err(e) => debug!(peer = %peer_id, "check failed: {e}"),
            }
        }
    }

    async fn best_client(
        &self,
        space_id: Option<&SpaceId>,
        write: bool,
        denied: &HashSet<String>,
    ) -> Option<Arc<PeerClient>> {
        let clients = self.clients.lock().await;
        clients
            .iter()
            .map(|(_, c)| c)
            .filter(|c| !denied.contains(c.peer_id()))
            .filter(|c| match space_id {
                Some(space) => c.accepts(space, write),
                None => true,
            })
            .max_by(|a, b| a.score().total_cmp(&b.score()))
            .cloned()
    }

    /// Runs `op` against clients in score order until one succeeds. Errors
    /// that another peer could answer differently (transient transport
    /// failures, a peer missing a cid) deny that peer and move on.
    async fn with_clients<T, F, Fut>(
        &self,
        space_id: Option<&SpaceId>,
        write: bool,
        op: F,
    ) -> FileResult<T>
    where
        F: Fn(Arc<PeerClient>) -> Fut,
        Fut: std::future::Future<Output = FileResult<T>>,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| FileError::PeerUnavailable("store closed".into()))?;

        let mut denied = HashSet::new();
        let mut last_err = None;
        loop {
            let Some(client) = self.best_client(space_id, write, &denied).await else {
                return Err(last_err.unwrap_or_else(|| {
                    FileError::PeerUnavailable("no eligible peer".into())
                }));
            };
            match op(Arc::clone(&client)).await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() || matches!(e, FileError::CidNotFound(_)) => {
                    warn!(peer = %client.peer_id(), "task failed, trying next peer: {e}");
                    denied.insert(client.peer_id().to_string());
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl RemoteStore for RpcStore {
    async fn block_get(&self, space_id: &SpaceId, cid: &Cid) -> FileResult<Block> {
        self.with_clients(Some(space_id), false, |c| async move {
            c.block_get(space_id, cid).await
        })
        .await
    }

    async fn block_push(
        &self,
        space_id: &SpaceId,
        file_id: &FileId,
        block: &Block,
    ) -> FileResult<()> {
        self.with_clients(Some(space_id), true, |c| async move {
            c.block_push(space_id, file_id, block).await
        })
        .await
    }

    async fn blocks_check(
        &self,
        space_id: &SpaceId,
        cids: &[Cid],
    ) -> FileResult<Vec<proto::BlockAvailability>> {
        self.with_clients(Some(space_id), false, |c| async move {
            c.blocks_check(space_id, cids).await
        })
        .await
    }

    async fn blocks_bind(
        &self,
        space_id: &SpaceId,
        file_id: &FileId,
        cids: &[Cid],
    ) -> FileResult<()> {
        self.with_clients(Some(space_id), true, |c| async move {
            c.blocks_bind(space_id, file_id, cids).await
        })
        .await
    }

    async fn files_delete(&self, space_id: &SpaceId, file_ids: &[FileId]) -> FileResult<()> {
        self.with_clients(Some(space_id), true, |c| async move {
            c.files_delete(space_id, file_ids).await
        })
        .await
    }

    async fn files_info(
        &self,
        space_id: &SpaceId,
        file_ids: &[FileId],
    ) -> FileResult<Vec<proto::FileInfo>> {
        self.with_clients(Some(space_id), false, |c| async move {
            c.files_info(space_id, file_ids).await
        })
        .await
    }

    async fn space_info(&self, space_id: &SpaceId) -> FileResult<SpaceStat> {
        let info = self
            .with_clients(Some(space_id), false, |c| async move {
                c.space_info(space_id).await
            })
            .await?;
        Ok(space_stat_from_proto(info))
    }

    async fn account_info(&self) -> FileResult<NodeUsage> {
        let info = self
            .with_clients(None, false, |c| async move { c.account_info().await })
            .await?;
        Ok(node_usage_from_proto(info))
    }
}
