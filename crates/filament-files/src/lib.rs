//! filament-files: the chunked encrypted-file codec
//!
//! Wraps any byte stream into an authenticated, per-path-keyed,
//! content-addressed DAG: a directory with `meta` and `content` children
//! per variant, assembled under one outer root whose CID is the file id.
//! Includes the mills (blob, json, image resize, exif), the declarative
//! node schemas, the file index, and the DAG walker.

pub mod dag;
pub mod index;
pub mod keys;
pub mod mill;
pub mod schema;
pub mod service;
pub mod walker;

pub use dag::DagService;
pub use index::FileIndex;
pub use service::{AddOptions, AddResult, FileService, FileView, ImageView};
pub use walker::{chunks_count, walk_dag, WalkControl};

use sha2::{Digest, Sha256};

/// Content chunk size: leaves never exceed this many bytes.
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Link names of a variant pair node.
pub const META_LINK: &str = "meta";
pub const CONTENT_LINK: &str = "content";

/// Checksum of a stream with the plaintext flag folded in, so an encrypted
/// and a plaintext copy of identical bytes never share a dedup key.
pub fn checksum(data: &[u8], wont_encrypt: bool) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.update([u8::from(wont_encrypt)]);
    multibase::encode(multibase::Base::Base32Lower, hasher.finalize())
}

/// Key-map path of a variant: `"/<dirIndex>/<variantName>/"`.
pub fn encryption_key_path(dir_index: usize, variant_name: &str) -> String {
    format!("/{dir_index}/{variant_name}/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_commits_to_plaintext_flag() {
        assert_ne!(checksum(b"same", false), checksum(b"same", true));
        assert_eq!(checksum(b"same", false), checksum(b"same", false));
    }

    #[test]
    fn key_path_shape() {
        assert_eq!(encryption_key_path(0, "original"), "/0/original/");
    }
}
