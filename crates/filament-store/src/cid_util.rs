//! CID construction helpers: CIDv1, SHA-256, fixed codecs

use cid::Cid;
use multihash::Multihash;
use sha2::{Digest, Sha256};

/// dag-pb multicodec
pub const DAG_PB: u64 = 0x70;
/// raw-bytes multicodec
pub const RAW: u64 = 0x55;
/// sha2-256 multihash code
const SHA2_256: u64 = 0x12;

/// CIDv1 over the given codec and the SHA-256 of `data`.
pub fn cid_for(codec: u64, data: &[u8]) -> Cid {
    let digest = Sha256::digest(data);
    let mh = Multihash::<64>::wrap(SHA2_256, &digest).expect("sha-256 digest fits multihash");
    Cid::new_v1(codec, mh)
}

/// CIDv1/DagProtobuf, the codec of every directory and file node.
pub fn dag_cid(data: &[u8]) -> Cid {
    cid_for(DAG_PB, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_bytes_equal_cid() {
        assert_eq!(dag_cid(b"abc"), dag_cid(b"abc"));
        assert_ne!(dag_cid(b"abc"), dag_cid(b"abd"));
    }

    #[test]
    fn codec_distinguishes_cids() {
        assert_ne!(cid_for(DAG_PB, b"x"), cid_for(RAW, b"x"));
    }

    #[test]
    fn cid_text_roundtrip() {
        let c = dag_cid(b"roundtrip");
        let parsed: Cid = c.to_string().parse().unwrap();
        assert_eq!(c, parsed);
    }
}
