use bytes::Bytes;
use cid::Cid;
use serde::{Deserialize, Serialize};

/// Logical tenant partition. Quotas and block bindings are scoped to a space.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SpaceId(pub String);

impl SpaceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SpaceId {
    fn from(s: &str) -> Self {
        SpaceId(s.to_string())
    }
}

/// CID of the outer directory node; the public handle for a file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(pub String);

impl FileId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_cid(&self) -> Result<Cid, cid::Error> {
        self.0.parse()
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Cid> for FileId {
    fn from(c: Cid) -> Self {
        FileId(c.to_string())
    }
}

impl From<&str> for FileId {
    fn from(s: &str) -> Self {
        FileId(s.to_string())
    }
}

/// CID of a leaf content block within a file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileContentId(pub String);

impl FileContentId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for FileContentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FullFileId {
    pub space_id: SpaceId,
    pub file_id: FileId,
}

impl FullFileId {
    pub fn new(space_id: impl Into<SpaceId>, file_id: impl Into<FileId>) -> Self {
        Self {
            space_id: space_id.into(),
            file_id: file_id.into(),
        }
    }
}

/// An immutable content-addressed block. The store never mutates contents;
/// equal raw bytes always hash to an equal cid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub cid: Cid,
    pub data: Bytes,
}

impl Block {
    pub fn new(cid: Cid, data: impl Into<Bytes>) -> Self {
        Self {
            cid,
            data: data.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Where a file came from, as recorded in the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOrigin {
    User,
    Import,
    Builtin,
}

/// Coarse per-file sync state persisted by the status watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    NotSynced = 0,
    Syncing = 1,
    Synced = 2,
    Limited = 3,
}

impl SyncStatus {
    pub fn from_raw(raw: u64) -> Self {
        match raw {
            1 => SyncStatus::Syncing,
            2 => SyncStatus::Synced,
            3 => SyncStatus::Limited,
            _ => SyncStatus::NotSynced,
        }
    }
}

/// Usage of one space, refreshed from the remote and cached.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceStat {
    pub space_id: String,
    pub files_count: u64,
    pub cids_count: u64,
    pub space_bytes_usage: u64,
    pub account_bytes_usage: u64,
    pub account_bytes_limit: u64,
}

/// Usage of one file on the remote node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub space_id: String,
    pub file_id: String,
    pub total_chunks_count: u64,
    pub uploaded_chunks_count: u64,
    pub bytes_usage: u64,
}

impl FileStat {
    /// A file is pinned once every one of its chunks exists on the remote.
    pub fn is_pinned(&self) -> bool {
        self.uploaded_chunks_count == self.total_chunks_count
    }
}

/// Account-wide usage, cached under `filesync/node_usage/`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeUsage {
    pub account_bytes_limit: u64,
    pub total_bytes_usage: u64,
    pub total_cids_count: u64,
    pub spaces: Vec<SpaceStat>,
}

impl NodeUsage {
    pub fn bytes_left(&self) -> u64 {
        self.account_bytes_limit
            .saturating_sub(self.total_bytes_usage)
    }

    pub fn space_usage(&self, space_id: &str) -> SpaceStat {
        self.spaces
            .iter()
            .find(|s| s.space_id == space_id)
            .cloned()
            .unwrap_or(SpaceStat {
                space_id: space_id.to_string(),
                account_bytes_usage: self.total_bytes_usage,
                account_bytes_limit: self.account_bytes_limit,
                ..Default::default()
            })
    }
}
