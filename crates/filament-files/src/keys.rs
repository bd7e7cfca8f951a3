//! File key maps and the publishable keys block
//!
//! Every variant's symmetric key is stored by its path inside the file
//! (`"/<dirIndex>/<variantName>/"`). For publishable files a companion
//! `keys.json` is produced: `{pathInFile -> {cid, base58Key}}`, itself
//! encrypted with a fresh root key handed back to the publisher, so a
//! receiver holding only the root CID and the root key can decrypt every
//! leaf.

use std::collections::BTreeMap;
use std::io::Cursor;

use serde::{Deserialize, Serialize};

use filament_core::FileResult;
use filament_crypto::{Gcm, Key, SymmetricCodec};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeysBlockEntry {
    pub cid: String,
    #[serde(rename = "base58Key")]
    pub base58_key: String,
}

pub type KeysBlock = BTreeMap<String, KeysBlockEntry>;

/// Builds the encrypted companion keys block. Returns the ciphertext and
/// the root key that decrypts it.
pub fn seal_keys_block(
    entries: &BTreeMap<String, (String, Key)>,
) -> FileResult<(Vec<u8>, Key)> {
    let block: KeysBlock = entries
        .iter()
        .map(|(path, (cid, key))| {
            (
                path.clone(),
                KeysBlockEntry {
                    cid: cid.clone(),
                    base58_key: multibase::Base::Base58Btc.encode(key.as_bytes()),
                },
            )
        })
        .collect();
    let plain = serde_json::to_vec(&block).map_err(anyhow::Error::from)?;

    let root_key = Key::new_random();
    let gcm = Gcm::new(root_key.clone());
    let mut reader = gcm.encrypt_reader(Box::new(Cursor::new(plain)))?;
    let mut sealed = Vec::new();
    std::io::Read::read_to_end(&mut reader, &mut sealed)?;
    Ok((sealed, root_key))
}

/// Opens a sealed keys block with the root key.
pub fn open_keys_block(sealed: &[u8], root_key: &Key) -> FileResult<KeysBlock> {
    let gcm = Gcm::new(root_key.clone());
    let mut reader = gcm.decrypt_reader(Box::new(Cursor::new(sealed.to_vec())))?;
    let mut plain = Vec::new();
    std::io::Read::read_to_end(&mut reader, &mut plain)?;
    Ok(serde_json::from_slice(&plain).map_err(anyhow::Error::from)?)
}

/// Decodes a base58 key from a keys block entry.
pub fn key_from_entry(entry: &KeysBlockEntry) -> FileResult<Key> {
    let raw = multibase::Base::Base58Btc
        .decode(&entry.base58_key)
        .map_err(|e| anyhow::anyhow!("decode base58 key: {e}"))?;
    let bytes: [u8; filament_crypto::KEY_SIZE] = raw
        .try_into()
        .map_err(|_| anyhow::anyhow!("key has wrong size"))?;
    Ok(Key::from_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let mut entries = BTreeMap::new();
        entries.insert(
            "/0/original/".to_string(),
            ("bafy-content".to_string(), Key::new_random()),
        );
        entries.insert(
            "/0/thumb/".to_string(),
            ("bafy-thumb".to_string(), Key::new_random()),
        );

        let (sealed, root_key) = seal_keys_block(&entries).unwrap();
        let opened = open_keys_block(&sealed, &root_key).unwrap();

        assert_eq!(opened.len(), 2);
        assert_eq!(opened["/0/original/"].cid, "bafy-content");
        let recovered = key_from_entry(&opened["/0/thumb/"]).unwrap();
        assert_eq!(recovered.as_bytes(), entries["/0/thumb/"].1.as_bytes());
    }

    #[test]
    fn wrong_root_key_fails() {
        let mut entries = BTreeMap::new();
        entries.insert(
            "/0/original/".to_string(),
            ("cid".to_string(), Key::new_random()),
        );
        let (sealed, _root) = seal_keys_block(&entries).unwrap();
        assert!(open_keys_block(&sealed, &Key::new_random()).is_err());
    }
}
