//! File index: variants, keys, counters, and secondary indexes over KvStore
//!
//! Key layout (stable across restarts):
//!
//! ```text
//! files/info/<childCid>          serialized FileVariant
//! files/keys/<fileId>            serialized keys-by-path map
//! files/chunks_count/<fileId>    varint
//! files/sync_status/<fileId>     varint
//! files/is_imported/<fileId>     byte flag
//! files/origin/<fileId>          byte flag
//! idx/files/<index>/<hashedKey>/<primary>   empty; presence = membership
//! ```
//!
//! Secondary indexes: `(mill, source, opts)` (unique), `(mill, checksum)`,
//! and `target`. Multi-key mutations are applied as one write batch under
//! a single writer lock, so readers never observe a half-applied update.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use prost::Message;
use sha2::{Digest, Sha256};

use filament_core::kv::{KvStore, WriteBatch};
use filament_core::proto::{FileKeys, FileVariant};
use filament_core::{FileContentId, FileError, FileId, FileOrigin, FileResult};

const INFO_PREFIX: &str = "files/info/";
const KEYS_PREFIX: &str = "files/keys/";
const CHUNKS_COUNT_PREFIX: &str = "files/chunks_count/";
const SYNC_STATUS_PREFIX: &str = "files/sync_status/";
const IS_IMPORTED_PREFIX: &str = "files/is_imported/";
const ORIGIN_PREFIX: &str = "files/origin/";

const IDX_SOURCE: &str = "mill_source_opts";
const IDX_CHECKSUM: &str = "mill_checksum";
const IDX_TARGETS: &str = "targets";

pub struct FileIndex {
    kv: Arc<dyn KvStore>,
    write_lock: Mutex<()>,
}

fn hashed_key(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

fn index_prefix(index: &str, parts: &[&str]) -> String {
    format!("idx/files/{index}/{}/", hashed_key(parts))
}

fn index_key(index: &str, parts: &[&str], primary: &str) -> String {
    format!("{}{primary}", index_prefix(index, parts))
}

fn put_uvarint(mut value: u64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return out;
        }
        out.push(byte | 0x80);
    }
}

fn get_uvarint(raw: &[u8]) -> FileResult<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for byte in raw {
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 63 {
            break;
        }
    }
    Err(FileError::Storage("malformed varint".into()))
}

impl FileIndex {
    pub fn new(kv: Arc<dyn KvStore>) -> Arc<Self> {
        Arc::new(Self {
            kv,
            write_lock: Mutex::new(()),
        })
    }

    fn variant_index_ops(batch: &mut WriteBatch, variant: &FileVariant, insert: bool) {
        let primary = variant.hash.as_str();
        let source_key = index_key(
            IDX_SOURCE,
            &[&variant.mill, &variant.source_checksum, &variant.opts],
            primary,
        );
        let checksum_key = index_key(IDX_CHECKSUM, &[&variant.mill, &variant.checksum], primary);
        if insert {
            batch.put(source_key, "");
            batch.put(checksum_key, "");
        } else {
            batch.delete(source_key);
            batch.delete(checksum_key);
        }
        for target in &variant.targets {
            let key = index_key(IDX_TARGETS, &[target], primary);
            if insert {
                batch.put(key, "");
            } else {
                batch.delete(key);
            }
        }
    }

    fn write_variant(&self, batch: &mut WriteBatch, variant: &FileVariant) {
        batch.put(
            format!("{INFO_PREFIX}{}", variant.hash),
            variant.encode_to_vec(),
        );
        Self::variant_index_ops(batch, variant, true);
    }

    /// Persists a new variant. Returns `DuplicateKey` if one with the same
    /// content hash already exists.
    pub fn put(&self, variant: &FileVariant) -> FileResult<()> {
        let _guard = self.write_lock.lock().unwrap();
        if self.kv.has(format!("{INFO_PREFIX}{}", variant.hash).as_bytes())? {
            return Err(FileError::DuplicateKey);
        }
        let mut batch = WriteBatch::new();
        self.write_variant(&mut batch, variant);
        self.kv.write_batch(batch)?;
        Ok(())
    }

    /// Persists many variants, skipping existing entries unless `upsert`.
    pub fn put_many(&self, variants: &[FileVariant], upsert: bool) -> FileResult<()> {
        let _guard = self.write_lock.lock().unwrap();
        let mut batch = WriteBatch::new();
        for variant in variants {
            let exists = self
                .kv
                .has(format!("{INFO_PREFIX}{}", variant.hash).as_bytes())?;
            if exists && !upsert {
                continue;
            }
            if exists {
                // Drop stale index rows before rewriting.
                if let Ok(old) = self.get_variant_raw(&variant.hash) {
                    Self::variant_index_ops(&mut batch, &old, false);
                }
            }
            self.write_variant(&mut batch, variant);
        }
        self.kv.write_batch(batch)?;
        Ok(())
    }

    fn get_variant_raw(&self, hash: &str) -> FileResult<FileVariant> {
        let raw = self
            .kv
            .get(format!("{INFO_PREFIX}{hash}").as_bytes())?
            .ok_or(FileError::NotFound)?;
        Ok(FileVariant::decode(raw.as_slice())?)
    }

    pub fn get_variant(&self, child: &FileContentId) -> FileResult<FileVariant> {
        self.get_variant_raw(child.as_str())
    }

    fn first_primary(&self, index: &str, parts: &[&str]) -> FileResult<String> {
        let prefix = index_prefix(index, parts);
        let rows = self.kv.scan_prefix(prefix.as_bytes())?;
        let row = rows.first().ok_or(FileError::NotFound)?;
        let key = String::from_utf8_lossy(&row.0);
        Ok(key[prefix.len()..].to_string())
    }

    pub fn get_by_source(&self, mill: &str, source: &str, opts: &str) -> FileResult<FileVariant> {
        let primary = self.first_primary(IDX_SOURCE, &[mill, source, opts])?;
        self.get_variant_raw(&primary)
    }

    pub fn get_by_checksum(&self, mill: &str, checksum: &str) -> FileResult<FileVariant> {
        let primary = self.first_primary(IDX_CHECKSUM, &[mill, checksum])?;
        self.get_variant_raw(&primary)
    }

    /// Links a variant to one more file root; a no-op if already linked.
    pub fn add_target(&self, child: &FileContentId, target: &FileId) -> FileResult<()> {
        let _guard = self.write_lock.lock().unwrap();
        let mut variant = self.get_variant_raw(child.as_str())?;
        if variant.targets.iter().any(|t| t == target.as_str()) {
            return Ok(());
        }
        variant.targets.push(target.to_string());
        let mut batch = WriteBatch::new();
        batch.put(
            format!("{INFO_PREFIX}{}", variant.hash),
            variant.encode_to_vec(),
        );
        batch.put(
            index_key(IDX_TARGETS, &[target.as_str()], &variant.hash),
            "",
        );
        self.kv.write_batch(batch)?;
        Ok(())
    }

    pub fn list_by_file_id(&self, file_id: &FileId) -> FileResult<Vec<FileVariant>> {
        let prefix = index_prefix(IDX_TARGETS, &[file_id.as_str()]);
        let mut variants = Vec::new();
        for (key, _) in self.kv.scan_prefix(prefix.as_bytes())? {
            let key = String::from_utf8_lossy(&key);
            let primary = &key[prefix.len()..];
            match self.get_variant_raw(primary) {
                Ok(v) => variants.push(v),
                Err(FileError::NotFound) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(variants)
    }

    /// Distinct file roots across all stored variants.
    pub fn list_all_file_ids(&self) -> FileResult<Vec<FileId>> {
        let mut out = std::collections::BTreeSet::new();
        for (_, raw) in self.kv.scan_prefix(INFO_PREFIX.as_bytes())? {
            let variant = FileVariant::decode(raw.as_slice())?;
            for target in variant.targets {
                out.insert(target);
            }
        }
        Ok(out.into_iter().map(FileId).collect())
    }

    /// Stores the keys-by-path map. Idempotent: an existing entry is never
    /// overwritten; empty maps are skipped.
    pub fn put_keys(&self, file_id: &FileId, keys: &BTreeMap<String, String>) -> FileResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().unwrap();
        let key = format!("{KEYS_PREFIX}{file_id}");
        if self.kv.has(key.as_bytes())? {
            return Ok(());
        }
        let msg = FileKeys {
            keys_by_path: keys.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        };
        self.kv.put(key.as_bytes(), &msg.encode_to_vec())?;
        Ok(())
    }

    pub fn get_keys(&self, file_id: &FileId) -> FileResult<BTreeMap<String, String>> {
        let raw = self
            .kv
            .get(format!("{KEYS_PREFIX}{file_id}").as_bytes())?
            .ok_or(FileError::NotFound)?;
        let msg = FileKeys::decode(raw.as_slice())?;
        Ok(msg.keys_by_path.into_iter().collect())
    }

    fn get_counter(&self, prefix: &str, file_id: &FileId) -> FileResult<u64> {
        let raw = self
            .kv
            .get(format!("{prefix}{file_id}").as_bytes())?
            .ok_or(FileError::NotFound)?;
        get_uvarint(&raw)
    }

    fn set_counter(&self, prefix: &str, file_id: &FileId, value: u64) -> FileResult<()> {
        self.kv
            .put(format!("{prefix}{file_id}").as_bytes(), &put_uvarint(value))?;
        Ok(())
    }

    pub fn get_chunks_count(&self, file_id: &FileId) -> FileResult<u64> {
        self.get_counter(CHUNKS_COUNT_PREFIX, file_id)
    }

    pub fn set_chunks_count(&self, file_id: &FileId, count: u64) -> FileResult<()> {
        self.set_counter(CHUNKS_COUNT_PREFIX, file_id, count)
    }

    pub fn get_sync_status(&self, file_id: &FileId) -> FileResult<u64> {
        self.get_counter(SYNC_STATUS_PREFIX, file_id)
    }

    pub fn set_sync_status(&self, file_id: &FileId, status: u64) -> FileResult<()> {
        self.set_counter(SYNC_STATUS_PREFIX, file_id, status)
    }

    pub fn is_imported(&self, file_id: &FileId) -> FileResult<bool> {
        match self.kv.get(format!("{IS_IMPORTED_PREFIX}{file_id}").as_bytes())? {
            Some(raw) => Ok(raw.first() == Some(&1)),
            None => Ok(false),
        }
    }

    pub fn set_imported(&self, file_id: &FileId, imported: bool) -> FileResult<()> {
        self.kv.put(
            format!("{IS_IMPORTED_PREFIX}{file_id}").as_bytes(),
            &[u8::from(imported)],
        )?;
        Ok(())
    }

    pub fn get_origin(&self, file_id: &FileId) -> FileResult<FileOrigin> {
        let raw = self
            .kv
            .get(format!("{ORIGIN_PREFIX}{file_id}").as_bytes())?
            .ok_or(FileError::NotFound)?;
        Ok(match raw.first() {
            Some(1) => FileOrigin::Import,
            Some(2) => FileOrigin::Builtin,
            _ => FileOrigin::User,
        })
    }

    pub fn set_origin(&self, file_id: &FileId, origin: FileOrigin) -> FileResult<()> {
        let raw = match origin {
            FileOrigin::User => 0u8,
            FileOrigin::Import => 1,
            FileOrigin::Builtin => 2,
        };
        self.kv
            .put(format!("{ORIGIN_PREFIX}{file_id}").as_bytes(), &[raw])?;
        Ok(())
    }

    /// Detaches `file_id` from every variant. Variants left with no
    /// remaining target are removed along with their index rows; shared
    /// variants survive with updated targets.
    pub fn delete_by_file_id(&self, file_id: &FileId) -> FileResult<()> {
        let _guard = self.write_lock.lock().unwrap();
        let variants = self.list_by_file_id(file_id)?;
        let mut batch = WriteBatch::new();
        for mut variant in variants {
            batch.delete(index_key(
                IDX_TARGETS,
                &[file_id.as_str()],
                &variant.hash,
            ));
            variant.targets.retain(|t| t != file_id.as_str());
            if variant.targets.is_empty() {
                batch.delete(format!("{INFO_PREFIX}{}", variant.hash));
                batch.delete(index_key(
                    IDX_SOURCE,
                    &[&variant.mill, &variant.source_checksum, &variant.opts],
                    &variant.hash,
                ));
                batch.delete(index_key(
                    IDX_CHECKSUM,
                    &[&variant.mill, &variant.checksum],
                    &variant.hash,
                ));
            } else {
                batch.put(
                    format!("{INFO_PREFIX}{}", variant.hash),
                    variant.encode_to_vec(),
                );
            }
        }
        for prefix in [
            KEYS_PREFIX,
            CHUNKS_COUNT_PREFIX,
            SYNC_STATUS_PREFIX,
            IS_IMPORTED_PREFIX,
            ORIGIN_PREFIX,
        ] {
            batch.delete(format!("{prefix}{file_id}"));
        }
        self.kv.write_batch(batch)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filament_core::kv::MemKv;

    fn index() -> Arc<FileIndex> {
        FileIndex::new(Arc::new(MemKv::new()))
    }

    fn variant(hash: &str, mill: &str, source: &str, targets: &[&str]) -> FileVariant {
        FileVariant {
            mill: mill.to_string(),
            source_checksum: source.to_string(),
            checksum: format!("chk-{hash}"),
            hash: hash.to_string(),
            meta_hash: format!("meta-{hash}"),
            targets: targets.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn put_and_lookups() {
        let idx = index();
        let v = variant("cid1", "/blob", "src1", &["file1"]);
        idx.put(&v).unwrap();

        assert_eq!(idx.get_variant(&FileContentId("cid1".into())).unwrap().hash, "cid1");
        assert_eq!(idx.get_by_source("/blob", "src1", "").unwrap().hash, "cid1");
        assert_eq!(idx.get_by_checksum("/blob", "chk-cid1").unwrap().hash, "cid1");
        assert!(matches!(
            idx.get_by_source("/blob", "other", ""),
            Err(FileError::NotFound)
        ));
    }

    #[test]
    fn duplicate_put_is_rejected() {
        let idx = index();
        let v = variant("cid1", "/blob", "src1", &[]);
        idx.put(&v).unwrap();
        assert!(matches!(idx.put(&v), Err(FileError::DuplicateKey)));
        // put_many without upsert silently skips
        idx.put_many(&[v], false).unwrap();
    }

    #[test]
    fn targets_listing_and_add_target() {
        let idx = index();
        idx.put(&variant("cid1", "/blob", "s", &["fileA"])).unwrap();
        idx.add_target(&FileContentId("cid1".into()), &FileId::from("fileB"))
            .unwrap();
        // adding again is a no-op
        idx.add_target(&FileContentId("cid1".into()), &FileId::from("fileB"))
            .unwrap();

        assert_eq!(idx.list_by_file_id(&FileId::from("fileA")).unwrap().len(), 1);
        assert_eq!(idx.list_by_file_id(&FileId::from("fileB")).unwrap().len(), 1);
        let ids = idx.list_all_file_ids().unwrap();
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn keys_are_write_once() {
        let idx = index();
        let file = FileId::from("file1");
        let mut keys = BTreeMap::new();
        keys.insert("/0/original/".to_string(), "key1".to_string());
        idx.put_keys(&file, &keys).unwrap();

        let mut replacement = BTreeMap::new();
        replacement.insert("/0/original/".to_string(), "key2".to_string());
        idx.put_keys(&file, &replacement).unwrap();

        assert_eq!(idx.get_keys(&file).unwrap()["/0/original/"], "key1");
    }

    #[test]
    fn counters_roundtrip_as_varints() {
        let idx = index();
        let file = FileId::from("f");
        assert!(matches!(idx.get_chunks_count(&file), Err(FileError::NotFound)));
        idx.set_chunks_count(&file, 300).unwrap();
        assert_eq!(idx.get_chunks_count(&file).unwrap(), 300);
        idx.set_sync_status(&file, 2).unwrap();
        assert_eq!(idx.get_sync_status(&file).unwrap(), 2);
    }

    #[test]
    fn imported_and_origin_flags() {
        let idx = index();
        let file = FileId::from("f");
        assert!(!idx.is_imported(&file).unwrap());
        idx.set_imported(&file, true).unwrap();
        assert!(idx.is_imported(&file).unwrap());
        idx.set_origin(&file, FileOrigin::Import).unwrap();
        assert_eq!(idx.get_origin(&file).unwrap(), FileOrigin::Import);
    }

    #[test]
    fn delete_keeps_shared_variants() {
        let idx = index();
        idx.put(&variant("shared", "/blob", "s1", &["fileA", "fileB"]))
            .unwrap();
        idx.put(&variant("solo", "/blob", "s2", &["fileA"])).unwrap();

        idx.delete_by_file_id(&FileId::from("fileA")).unwrap();

        // shared survives with one target, solo is gone entirely
        let shared = idx.get_variant(&FileContentId("shared".into())).unwrap();
        assert_eq!(shared.targets, vec!["fileB".to_string()]);
        assert!(matches!(
            idx.get_variant(&FileContentId("solo".into())),
            Err(FileError::NotFound)
        ));
        assert!(matches!(
            idx.get_by_source("/blob", "s2", ""),
            Err(FileError::NotFound)
        ));
        assert!(idx.list_by_file_id(&FileId::from("fileA")).unwrap().is_empty());
    }

    #[test]
    fn varint_roundtrip() {
        for value in [0u64, 1, 127, 128, 300, u64::MAX] {
            assert_eq!(get_uvarint(&put_uvarint(value)).unwrap(), value);
        }
    }
}
