pub mod config;
pub mod error;
pub mod kv;
pub mod types;

pub use error::{FileError, FileResult};
pub use types::{
    Block, FileContentId, FileId, FileOrigin, FileStat, FullFileId, NodeUsage, SpaceId, SpaceStat,
    SyncStatus,
};

/// Generated gRPC types and service traits (from filament.proto)
pub mod proto {
    tonic::include_proto!("filament");
}
