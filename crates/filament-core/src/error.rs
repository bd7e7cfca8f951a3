use thiserror::Error;

pub type FileResult<T> = Result<T, FileError>;

/// Error taxonomy of the storage core. Variants are grouped by what they
/// signal, not by which layer raised them; callers match on the kind to
/// pick a recovery policy.
#[derive(Debug, Error)]
pub enum FileError {
    /// Index or local-store lookup miss. Never fatal.
    #[error("not found")]
    NotFound,

    /// Remote peer doesn't hold the block. Treated as a miss; upper layers
    /// try other peers or surface FileNotFound.
    #[error("cid not found: {0}")]
    CidNotFound(String),

    /// The codec could not resolve a file root.
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// Image reader found fewer variants than expected and reindex failed.
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// Uniqueness constraint hit in the index. Swallowed as "already
    /// present" by writers.
    #[error("duplicate key")]
    DuplicateKey,

    /// Pre-upload quota check failed; the item moves to the retry queue.
    #[error("account limit reached: need {required} bytes, {left} left of {limit}")]
    ReachedLimit {
        required: u64,
        left: u64,
        limit: u64,
    },

    /// The file object was deleted while its upload was in flight.
    #[error("tree deleted")]
    TreeDeleted,

    /// Queue operation after Close.
    #[error("queue closed")]
    QueueClosed,

    /// None of the known encryption modes decrypted the payload.
    #[error("no encryption mode matched")]
    EncMismatch,

    #[error("peer unavailable: {0}")]
    PeerUnavailable(String),

    #[error("rpc: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("storage: {0}")]
    Storage(String),

    #[error("cid: {0}")]
    Cid(#[from] cid::Error),

    #[error("protobuf decode: {0}")]
    ProtoDecode(#[from] prost::DecodeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FileError {
    /// Whether retrying the same operation later can succeed (network-ish
    /// failures), as opposed to a definitive answer.
    pub fn is_transient(&self) -> bool {
        match self {
            FileError::Rpc(status) => !matches!(
                status.code(),
                tonic::Code::NotFound | tonic::Code::PermissionDenied | tonic::Code::Unauthenticated
            ),
            FileError::PeerUnavailable(_) | FileError::Io(_) => true,
            _ => false,
        }
    }
}
