//! Debug HTTP endpoint
//!
//! Bound only when the `ANYDEBUG` environment variable holds a port.
//! Exposes the queue listings and the file index as JSON; absent in
//! production.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tracing::{info, warn};

use crate::{FileSync, QueueInfo};

#[derive(Debug, Serialize)]
struct FileIndexEntry {
    file_id: String,
    variants: usize,
    chunks_count: Option<u64>,
}

async fn queues(State(sync): State<Arc<FileSync>>) -> Json<QueueInfo> {
    Json(sync.queue_info())
}

async fn file_index(State(sync): State<Arc<FileSync>>) -> Json<Vec<FileIndexEntry>> {
    let index = sync.files.index();
    let mut entries = Vec::new();
    if let Ok(file_ids) = index.list_all_file_ids() {
        for file_id in file_ids {
            entries.push(FileIndexEntry {
                variants: index
                    .list_by_file_id(&file_id)
                    .map(|v| v.len())
                    .unwrap_or(0),
                chunks_count: index.get_chunks_count(&file_id).ok(),
                file_id: file_id.to_string(),
            });
        }
    }
    Json(entries)
}

pub(crate) fn spawn_debug_server(sync: Arc<FileSync>, port: u16) {
    let cancel = sync.cancel.clone();
    let router = Router::new()
        .route("/debug/filesync/queues", get(queues))
        .route("/debug/files/index", get(file_index))
        .with_state(sync);

    tokio::spawn(async move {
        let addr = format!("127.0.0.1:{port}");
        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(addr, "debug endpoint bind failed: {e}");
                return;
            }
        };
        info!(addr, "debug endpoint listening");
        tokio::select! {
            _ = cancel.cancelled() => {}
            result = axum::serve(listener, router) => {
                if let Err(e) = result {
                    warn!("debug endpoint: {e}");
                }
            }
        }
    });
}
