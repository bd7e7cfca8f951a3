//! End-to-end synchronizer flows against the in-memory remote

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use cid::Cid;
use tokio_util::sync::CancellationToken;

use filament_core::config::SyncConfig;
use filament_core::kv::MemKv;
use filament_core::{FileError, FullFileId, SpaceId};
use filament_files::{walk_dag, AddOptions, FileIndex, FileService};
use filament_store::{InMemoryRemote, LocalStore, RemoteStore};
use filament_sync::{FileSync, SyncEvent};

struct Harness {
    files: Arc<FileService>,
    remote: Arc<InMemoryRemote>,
    sync: Arc<FileSync>,
    _dir: tempfile::TempDir,
}

async fn harness_with(limit: u64, cfg: SyncConfig) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let local = LocalStore::open(dir.path()).unwrap();
    let remote = Arc::new(InMemoryRemote::new(limit));
    let kv = Arc::new(MemKv::new());
    let index = FileIndex::new(Arc::clone(&kv) as Arc<dyn filament_core::kv::KvStore>);
    let files = FileService::new(
        index,
        local,
        Arc::clone(&remote) as Arc<dyn RemoteStore>,
    );
    let sync = FileSync::new(
        Arc::clone(&files),
        Arc::clone(&remote) as Arc<dyn RemoteStore>,
        kv,
        cfg,
    )
    .unwrap();
    sync.run().await;
    Harness {
        files,
        remote,
        sync,
        _dir: dir,
    }
}

async fn harness(limit: u64) -> Harness {
    harness_with(limit, SyncConfig::default()).await
}

fn space() -> SpaceId {
    SpaceId::from("space1")
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

async fn file_cids(files: &Arc<FileService>, id: &FullFileId) -> Vec<Cid> {
    let dag = files.local_dag();
    let root = id.file_id.to_cid().unwrap();
    let mut cids = Vec::new();
    walk_dag(&dag, &root, &CancellationToken::new(), |block, _| {
        cids.push(block.cid);
        ControlFlow::Continue(())
    })
    .await
    .unwrap();
    cids
}

#[tokio::test]
async fn upload_within_quota_pushes_every_block() {
    let h = harness(1 << 30).await;
    let mut events = h.sync.subscribe();

    let payload = vec![0xA5u8; 1024 * 1024];
    let added = h
        .files
        .file_add(&space(), AddOptions::new("big.bin", "application/octet-stream", payload))
        .await
        .unwrap();
    let id = FullFileId::new(space(), added.file_id.clone());

    h.sync.add_file("object-1", &id, true, false).unwrap();
    wait_until(|| !h.sync.is_queued("object-1")).await;

    // every CID reachable from the root is now on the remote
    let cids = file_cids(&h.files, &id).await;
    assert!(cids.len() >= 5);
    for cid in &cids {
        assert!(h.remote.has_block(cid), "missing {cid} on remote");
    }

    let stat = h.sync.space_stat(&space()).await.unwrap();
    assert!(stat.space_bytes_usage >= 1024 * 1024);

    // a FileSpaceUsage event carried the refreshed usage
    let mut saw_usage = false;
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::FileSpaceUsage {
            space_id,
            bytes_usage,
        } = event
        {
            assert_eq!(space_id, "space1");
            assert_eq!(bytes_usage, stat.space_bytes_usage);
            saw_usage = true;
        }
    }
    assert!(saw_usage);
}

#[tokio::test]
async fn upload_over_quota_parks_in_retry_and_emits_once() {
    let h = harness(1024).await;
    let mut events = h.sync.subscribe();

    let payload = vec![0x5Au8; 1024 * 1024];
    let added = h
        .files
        .file_add(&space(), AddOptions::new("big.bin", "application/octet-stream", payload))
        .await
        .unwrap();
    let id = FullFileId::new(space(), added.file_id.clone());

    h.sync.add_file("object-1", &id, true, false).unwrap();
    wait_until(|| h.sync.queue_info().retry_uploading_queue == vec!["object-1"]).await;
    // allow the retry worker a first pass too
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(h.sync.queue_info().uploading_queue.is_empty());
    assert_eq!(h.remote.blocks_added(), 0, "no block may land over quota");
    let stat = h.remote.space_info(&space()).await.unwrap();
    assert_eq!(stat.space_bytes_usage, 0);

    let limit_events = std::iter::from_fn(|| events.try_recv().ok())
        .filter(|e| matches!(e, SyncEvent::LimitReached { .. }))
        .count();
    assert_eq!(limit_events, 1, "LimitReached must fire exactly once");
}

#[tokio::test]
async fn tree_deleted_during_upload_drains_without_retry() {
    let h = harness(1 << 30).await;
    h.remote.fail_next_push(FileError::TreeDeleted);

    let added = h
        .files
        .file_add(&space(), AddOptions::new("gone.bin", "application/octet-stream", vec![1u8; 512]))
        .await
        .unwrap();
    let id = FullFileId::new(space(), added.file_id);

    h.sync.add_file("object-1", &id, true, false).unwrap();
    wait_until(|| !h.sync.is_queued("object-1")).await;

    let info = h.sync.queue_info();
    assert!(info.uploading_queue.is_empty());
    assert!(info.retry_uploading_queue.is_empty());
}

#[tokio::test]
async fn delete_file_removes_remote_binding() {
    let h = harness(1 << 30).await;
    let added = h
        .files
        .file_add(&space(), AddOptions::new("temp.bin", "application/octet-stream", vec![9u8; 2048]))
        .await
        .unwrap();
    let id = FullFileId::new(space(), added.file_id.clone());

    h.sync.add_file("object-1", &id, true, false).unwrap();
    wait_until(|| !h.sync.is_queued("object-1")).await;
    assert!(h.remote.files_deleted() == 0);

    h.sync.delete_file("object-1", &id).unwrap();
    wait_until(|| h.remote.files_deleted() == 1).await;
    assert!(h.remote.file_cids(&added.file_id).is_empty());
}

#[tokio::test]
async fn delete_of_unknown_file_succeeds() {
    let h = harness(1 << 30).await;
    let id = FullFileId::new(space(), "bafyunknownroot");
    h.sync.delete_file_synchronously(&id).await.unwrap();
}

#[tokio::test]
async fn add_file_for_offloaded_file_is_a_no_op() {
    let h = harness(1 << 30).await;
    let id = FullFileId::new(space(), "bafyneverindexed");
    h.sync.add_file("object-1", &id, true, false).unwrap();
    assert!(!h.sync.is_queued("object-1"));
}

#[tokio::test]
async fn re_add_is_idempotent_beyond_rebinding() {
    let h = harness(1 << 30).await;
    let added = h
        .files
        .file_add(&space(), AddOptions::new("stable.bin", "application/octet-stream", vec![3u8; 4096]))
        .await
        .unwrap();
    let id = FullFileId::new(space(), added.file_id.clone());

    h.sync.add_file("object-1", &id, true, false).unwrap();
    wait_until(|| !h.sync.is_queued("object-1")).await;
    let pushed_once = h.remote.blocks_added();

    h.sync.add_file("object-1", &id, true, false).unwrap();
    wait_until(|| !h.sync.is_queued("object-1")).await;
    assert_eq!(
        h.remote.blocks_added(),
        pushed_once,
        "second add only re-binds"
    );
}

#[tokio::test]
async fn local_only_mode_queues_without_running() {
    let cfg = SyncConfig {
        local_only: true,
        ..Default::default()
    };
    let h = harness_with(1 << 30, cfg).await;
    let added = h
        .files
        .file_add(&space(), AddOptions::new("q.bin", "application/octet-stream", vec![7u8; 128]))
        .await
        .unwrap();
    let id = FullFileId::new(space(), added.file_id.clone());

    // a pending deletion is cancelled by a subsequent add
    h.sync.delete_file("object-1", &id).unwrap();
    assert!(h.sync.queue_info().deletion_queue.contains(&"object-1".to_string()));
    h.sync.add_file("object-1", &id, true, false).unwrap();

    let info = h.sync.queue_info();
    assert!(info.deletion_queue.is_empty());
    assert_eq!(info.uploading_queue, vec!["object-1"]);

    // queued-but-unprocessed files are visible to the GC marker
    let pending = h.sync.pending_file_ids();
    assert_eq!(pending, vec![id]);
}

#[tokio::test]
async fn synced_status_after_upload() {
    let h = harness(1 << 30).await;
    let added = h
        .files
        .file_add(&space(), AddOptions::new("s.bin", "application/octet-stream", vec![2u8; 256]))
        .await
        .unwrap();
    let id = FullFileId::new(space(), added.file_id.clone());

    h.sync.add_file("object-1", &id, true, false).unwrap();
    wait_until(|| !h.sync.is_queued("object-1")).await;

    let status = h.sync.sync_status("object-1", &id).await.unwrap();
    assert_eq!(status, filament_core::SyncStatus::Synced);
}
