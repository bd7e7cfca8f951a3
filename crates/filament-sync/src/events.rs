//! Sync event bus
//!
//! Quota exhaustion and usage changes are reported as events, never as
//! errors: the editor surfaces them, the synchronizer keeps retrying.

use filament_core::SyncStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// The account byte quota blocked an upload. Emitted once per queued
    /// item attempt.
    LimitReached { space_id: String },
    /// A file finished uploading; carries the refreshed space usage.
    FileSpaceUsage { space_id: String, bytes_usage: u64 },
    /// The status watcher observed a transition for a watched file.
    FileStatus { file_id: String, status: SyncStatus },
}
