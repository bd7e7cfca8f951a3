//! File codec operations: add, read, image pipeline, key restore, offload
//!
//! An add turns a source into per-variant encrypted streams (mill ->
//! checksum -> dedup -> encrypt -> blocks), wraps each in a `meta+content`
//! pair node, and links the pairs into an outer directory whose CID is the
//! file id. Reads resolve the structure back, decrypting with the stored
//! per-path keys.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{Cursor, Read};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use cid::Cid;
use prost::Message;
use tracing::{debug, warn};

use filament_core::proto::file_variant::EncryptionMode;
use filament_core::proto::FileVariant;
use filament_core::{FileContentId, FileError, FileId, FileResult, FullFileId, SpaceId};
use filament_crypto::{codec_for, Cfb, EncMode, Key, ReadSeek, SymmetricCodec};
use filament_store::remote::RemoteStore;
use filament_store::{LocalStore, ProxyStore};

use crate::dag::{DagNode, DagService};
use crate::index::FileIndex;
use crate::mill::Mill;
use crate::schema::{blob_node, image_node, SchemaStep};
use crate::walker::chunks_count;
use crate::{checksum, encryption_key_path, CONTENT_LINK, META_LINK};

/// Minimum named variants (besides exif) an intact image carries.
const IMAGE_VARIANTS_MIN: usize = 4;

#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    pub name: String,
    pub mime: String,
    pub last_modified: i64,
    /// Disable encryption for every produced variant.
    pub plaintext: bool,
    /// Content id of an existing variant to reuse as-is ("same-as" add);
    /// the caller re-binds it to its own file id.
    pub reuse_existing: Option<FileContentId>,
    pub data: Vec<u8>,
}

impl AddOptions {
    pub fn new(name: impl Into<String>, mime: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime: mime.into(),
            data,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct AddResult {
    pub file_id: FileId,
    pub keys_by_path: BTreeMap<String, String>,
    /// Whether every variant already existed (the add was a re-bind).
    pub is_existing: bool,
    pub size: i64,
    pub mime: String,
}

pub struct FileService {
    index: Arc<FileIndex>,
    local: Arc<LocalStore>,
    remote: Arc<dyn RemoteStore>,
    add_locks: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl FileService {
    pub fn new(
        index: Arc<FileIndex>,
        local: Arc<LocalStore>,
        remote: Arc<dyn RemoteStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            index,
            local,
            remote,
            add_locks: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    pub fn index(&self) -> &Arc<FileIndex> {
        &self.index
    }

    pub fn local(&self) -> &Arc<LocalStore> {
        &self.local
    }

    /// Read-through store for a space: local hits stay local, misses are
    /// fetched from the remote and cached.
    pub fn dag_for_space(&self, space_id: &SpaceId) -> DagService {
        DagService::new(Arc::new(ProxyStore::new(
            Arc::clone(&self.local),
            Arc::clone(&self.remote),
            space_id.clone(),
        )))
    }

    /// Purely-local DAG access; remote loads disabled.
    pub fn local_dag(&self) -> DagService {
        DagService::new(Arc::clone(&self.local) as Arc<dyn filament_store::BlockStore>)
    }

    /// Serializes adds of identical sources so concurrent calls dedup
    /// instead of racing.
    async fn add_lock(&self, source_checksum: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.add_locks.lock().await;
        Arc::clone(
            locks
                .entry(source_checksum.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    pub async fn file_add(&self, space_id: &SpaceId, opts: AddOptions) -> FileResult<AddResult> {
        self.add_with_schema(space_id, blob_node(), opts, HashMap::new())
            .await
    }

    pub async fn image_add(&self, space_id: &SpaceId, opts: AddOptions) -> FileResult<AddResult> {
        // The blob step carries no dimensions of its own; inject the
        // source's so width-based variant selection can consider it.
        let (width, height) = image::ImageReader::new(Cursor::new(&opts.data))
            .with_guessed_format()
            .map_err(anyhow::Error::from)?
            .into_dimensions()
            .map_err(|e| FileError::ImageNotFound(format!("not an image: {e}")))?;
        let mut original_meta = BTreeMap::new();
        original_meta.insert("width".to_string(), width.to_string());
        original_meta.insert("height".to_string(), height.to_string());

        let mut extra_meta = HashMap::new();
        extra_meta.insert("original", original_meta);
        self.add_with_schema(space_id, image_node(), opts, extra_meta)
            .await
    }

    async fn add_with_schema(
        &self,
        space_id: &SpaceId,
        steps: Vec<SchemaStep>,
        opts: AddOptions,
        extra_meta: HashMap<&str, BTreeMap<String, String>>,
    ) -> FileResult<AddResult> {
        let source_checksum = checksum(&opts.data, opts.plaintext);
        let lock = self.add_lock(&source_checksum).await;
        let _guard = lock.lock().await;

        let dag = self.dag_for_space(space_id);
        let mut outputs: HashMap<&str, Vec<u8>> = HashMap::new();
        let mut dir: BTreeMap<String, FileVariant> = BTreeMap::new();
        let mut all_existing = true;

        for step in &steps {
            let input = match step.use_step {
                Some(dep) => outputs
                    .get(dep)
                    .ok_or_else(|| anyhow::anyhow!("schema step {dep} has no output"))?,
                None => &opts.data,
            };
            let (variant, milled, existing) = self
                .add_file_variant(&dag, &step.mill, input, &opts, extra_meta.get(step.name))
                .await?;
            all_existing &= existing;
            outputs.insert(step.name, milled);
            dir.insert(step.name.to_string(), variant);
        }

        let (file_id, keys_by_path) = self.assemble(&dag, &[&dir]).await?;
        for variant in dir.values() {
            self.index
                .add_target(&FileContentId(variant.hash.clone()), &file_id)?;
        }
        self.index.put_keys(&file_id, &keys_by_path)?;

        let count = chunks_count(&self.local_dag(), &file_id.to_cid()?).await?;
        self.index.set_chunks_count(&file_id, count)?;

        let primary = dir
            .get("original")
            .or_else(|| dir.values().next())
            .ok_or_else(|| FileError::Storage("schema produced no variants".into()))?;
        debug!(%file_id, existing = all_existing, "file added");
        Ok(AddResult {
            file_id,
            keys_by_path,
            is_existing: all_existing,
            size: primary.size,
            mime: opts.mime,
        })
    }

    /// One variant: mill, dedup, encrypt, store content + meta, index.
    async fn add_file_variant(
        &self,
        dag: &DagService,
        mill: &dyn Mill,
        input: &[u8],
        opts: &AddOptions,
        extra_meta: Option<&BTreeMap<String, String>>,
    ) -> FileResult<(FileVariant, Vec<u8>, bool)> {
        // A "same-as" add short-circuits straight to the named variant.
        if let Some(existing_id) = &opts.reuse_existing {
            if let Ok(existing) = self.index.get_variant(existing_id) {
                if !existing.meta_hash.is_empty() && existing.mill == mill.id() {
                    let milled = mill.mill(input, &opts.name)?.data;
                    let mut variant = existing;
                    variant.targets.clear();
                    return Ok((variant, milled, true));
                }
            }
        }

        let opts_str = mill.options();
        let wont_encrypt = !mill.encrypt() || opts.plaintext;
        let source_checksum = checksum(input, wont_encrypt);

        // Dedup on source: the caller re-binds the existing variant to its
        // own file id, so targets are cleared here.
        if let Ok(existing) = self
            .index
            .get_by_source(mill.id(), &source_checksum, &opts_str)
        {
            if !existing.meta_hash.is_empty() {
                // Later schema steps may still read this step's output.
                let milled = mill.mill(input, &opts.name)?.data;
                let mut variant = existing;
                variant.targets.clear();
                return Ok((variant, milled, true));
            }
        }

        let mut result = mill.mill(input, &opts.name)?;
        if let Some(extra) = extra_meta {
            for (k, v) in extra {
                result.meta.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
        let variant_checksum = checksum(&result.data, wont_encrypt);

        // Dedup on the milled bytes.
        if let Ok(existing) = self.index.get_by_checksum(mill.id(), &variant_checksum) {
            if !existing.meta_hash.is_empty() {
                let mut variant = existing;
                variant.targets.clear();
                return Ok((variant, result.data, true));
            }
        }

        let encrypt = !wont_encrypt;
        let (key, content_bytes) = if encrypt {
            let key = Key::new_random();
            (Some(key.clone()), cfb_encrypt(&key, &result.data)?)
        } else {
            (None, result.data.clone())
        };

        let (content_cid, _) = dag.add_data(&content_bytes).await?;
        let mut variant = FileVariant {
            mill: mill.id().to_string(),
            opts: opts_str,
            source_checksum,
            checksum: variant_checksum,
            key: key.as_ref().map(|k| k.to_string()).unwrap_or_default(),
            enc_mode: EncryptionMode::AesCfb as i32,
            hash: content_cid.to_string(),
            mime: opts.mime.clone(),
            name: opts.name.clone(),
            size: result.data.len() as i64,
            added: now_unix(),
            last_modified_date: opts.last_modified,
            meta: result.meta.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            ..Default::default()
        };

        let meta_plain = variant.encode_to_vec();
        let meta_bytes = match &key {
            Some(key) => cfb_encrypt(key, &meta_plain)?,
            None => meta_plain,
        };
        let (meta_cid, _) = dag.add_data(&meta_bytes).await?;
        variant.meta_hash = meta_cid.to_string();

        match self.index.put(&variant) {
            Ok(()) | Err(FileError::DuplicateKey) => {}
            Err(e) => return Err(e),
        }
        Ok((variant, result.data, false))
    }

    /// Builds the pair/inner/outer structure and returns the root id and
    /// keys-by-path map.
    async fn assemble(
        &self,
        dag: &DagService,
        dirs: &[&BTreeMap<String, FileVariant>],
    ) -> FileResult<(FileId, BTreeMap<String, String>)> {
        let mut outer = DagNode::directory();
        let mut keys = BTreeMap::new();
        for (i, dir) in dirs.iter().enumerate() {
            let mut inner = DagNode::directory();
            for (name, variant) in dir.iter() {
                if variant.meta_hash.is_empty() {
                    return Err(FileError::Storage("variant has empty meta hash".into()));
                }
                let mut pair = DagNode::directory();
                pair.add_link(META_LINK, variant.meta_hash.parse::<Cid>()?, 0);
                pair.add_link(CONTENT_LINK, variant.hash.parse::<Cid>()?, 0);
                let pair_cid = dag.add_node(&pair).await?;
                inner.add_link(name.clone(), pair_cid, 0);
                keys.insert(encryption_key_path(i, name), variant.key.clone());
            }
            let inner_cid = dag.add_node(&inner).await?;
            outer.add_link(i.to_string(), inner_cid, 0);
        }
        let root = dag.add_node(&outer).await?;
        Ok((FileId::from(root), keys))
    }

    /// Variants of a file, reindexed from the DAG when the index misses.
    pub async fn ensure_indexed(&self, id: &FullFileId) -> FileResult<Vec<FileVariant>> {
        let variants = self.index.list_by_file_id(&id.file_id)?;
        if !variants.is_empty() && variants.iter().all(|v| !v.meta_hash.is_empty()) {
            return Ok(variants);
        }
        let dag = self.dag_for_space(&id.space_id);
        let variants = self.reindex_from_dag(&dag, id, false).await?;
        if self.index.is_imported(&id.file_id)? {
            // An imported file resurfacing locally still has to sync.
            self.index.set_imported(&id.file_id, false)?;
        }
        Ok(variants)
    }

    pub async fn file_view(self: &Arc<Self>, id: FullFileId) -> FileResult<FileView> {
        let variants = self
            .ensure_indexed(&id)
            .await
            .map_err(|_| FileError::FileNotFound(id.file_id.to_string()))?;
        let info = variants
            .iter()
            .find(|v| v.mill == "/blob")
            .or_else(|| variants.first())
            .cloned()
            .ok_or_else(|| FileError::FileNotFound(id.file_id.to_string()))?;
        Ok(FileView {
            id,
            info,
            service: Arc::clone(self),
        })
    }

    pub async fn image_view(self: &Arc<Self>, id: FullFileId) -> FileResult<ImageView> {
        self.ensure_indexed(&id)
            .await
            .map_err(|_| FileError::FileNotFound(id.file_id.to_string()))?;
        let dag = self.dag_for_space(&id.space_id);
        let mut variants = self.named_variants(&dag, &id).await?;

        let named = variants.keys().filter(|n| n.as_str() != "exif").count();
        if named < IMAGE_VARIANTS_MIN {
            // A partially-indexed image may recover from its DAG.
            match self.reindex_from_dag(&dag, &id, true).await {
                Ok(_) => variants = self.named_variants(&dag, &id).await?,
                Err(e) if variants.is_empty() => {
                    return Err(FileError::ImageNotFound(format!("{}: {e}", id.file_id)))
                }
                Err(_) => {}
            }
        }
        if variants.is_empty() {
            return Err(FileError::ImageNotFound(id.file_id.to_string()));
        }
        Ok(ImageView {
            id,
            variants,
            service: Arc::clone(self),
        })
    }

    /// Variant per link name inside the file directory.
    async fn named_variants(
        &self,
        dag: &DagService,
        id: &FullFileId,
    ) -> FileResult<BTreeMap<String, FileVariant>> {
        let root = id.file_id.to_cid()?;
        let outer_links = dag.links_at(&root).await?;
        let dir_link = outer_links
            .first()
            .ok_or_else(|| FileError::FileNotFound(id.file_id.to_string()))?;
        let dir_node = dag.get_node(&dir_link.cid).await?;

        let mut out = BTreeMap::new();
        for link in &dir_node.links {
            let pair = dag.get_node(&link.cid).await?;
            let Some(content) = pair.link(CONTENT_LINK) else {
                continue;
            };
            match self
                .index
                .get_variant(&FileContentId(content.cid.to_string()))
            {
                Ok(variant) => {
                    out.insert(link.name.clone(), variant);
                }
                Err(FileError::NotFound) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Rebuilds index rows from the DAG structure (the `meta` leaves).
    async fn reindex_from_dag(
        &self,
        dag: &DagService,
        id: &FullFileId,
        update: bool,
    ) -> FileResult<Vec<FileVariant>> {
        let root = id.file_id.to_cid()?;
        let outer_links = dag
            .links_at(&root)
            .await
            .map_err(|_| FileError::FileNotFound(id.file_id.to_string()))?;
        let dir_link = outer_links
            .first()
            .ok_or_else(|| FileError::FileNotFound(id.file_id.to_string()))?;
        let dir_node = dag.get_node(&dir_link.cid).await?;
        let keys = self.index.get_keys(&id.file_id).unwrap_or_default();

        let mut variants = Vec::new();
        if dir_node.looks_like_pair() {
            // Legacy layout: the pair sits directly under the outer node.
            let key = keys.get("/0/").cloned().unwrap_or_default();
            variants.push(self.variant_from_pair(dag, &dir_node, &key, &id.file_id).await?);
        } else {
            for link in &dir_node.links {
                let pair = dag.get_node(&link.cid).await?;
                let key = keys
                    .get(&encryption_key_path(0, &link.name))
                    .cloned()
                    .unwrap_or_default();
                variants.push(self.variant_from_pair(dag, &pair, &key, &id.file_id).await?);
            }
        }
        self.index.put_many(&variants, update)?;
        Ok(variants)
    }

    async fn variant_from_pair(
        &self,
        dag: &DagService,
        pair: &DagNode,
        key: &str,
        file_id: &FileId,
    ) -> FileResult<FileVariant> {
        let meta_link = pair
            .link(META_LINK)
            .ok_or_else(|| FileError::Storage("meta link not in node".into()))?;
        let mut raw = Vec::new();
        dag.read_data(&meta_link.cid)
            .await?
            .read_to_end(&mut raw)?;
        let mut variant = decode_variant(key, &raw)?;
        variant.meta_hash = meta_link.cid.to_string();
        variant.targets = vec![file_id.to_string()];
        Ok(variant)
    }

    /// Keys-by-path for a file; restored from the DAG and the variant
    /// index when the cached map is gone.
    pub async fn file_keys(&self, id: &FullFileId) -> FileResult<BTreeMap<String, String>> {
        match self.index.get_keys(&id.file_id) {
            Ok(keys) => Ok(keys),
            Err(FileError::NotFound) => self.restore_keys(id).await,
            Err(e) => Err(e),
        }
    }

    async fn restore_keys(&self, id: &FullFileId) -> FileResult<BTreeMap<String, String>> {
        let dag = self.dag_for_space(&id.space_id);
        let root = id.file_id.to_cid()?;
        let outer_links = dag.links_at(&root).await?;
        let dir_link = outer_links
            .first()
            .ok_or_else(|| FileError::FileNotFound(id.file_id.to_string()))?;
        let dir_node = dag.get_node(&dir_link.cid).await?;

        let mut keys = BTreeMap::new();
        if dir_node.looks_like_pair() {
            if let Some(content) = dir_node.link(CONTENT_LINK) {
                match self
                    .index
                    .get_variant(&FileContentId(content.cid.to_string()))
                {
                    Ok(info) => {
                        keys.insert("/0/".to_string(), info.key);
                    }
                    Err(_) => warn!(file_id = %id.file_id, "restore: variant not in index"),
                }
            }
        } else {
            for link in &dir_node.links {
                let pair = dag.get_node(&link.cid).await?;
                let Some(content) = pair.link(CONTENT_LINK) else {
                    continue;
                };
                match self
                    .index
                    .get_variant(&FileContentId(content.cid.to_string()))
                {
                    Ok(info) => {
                        keys.insert(encryption_key_path(0, &link.name), info.key);
                    }
                    Err(_) => {
                        warn!(file_id = %id.file_id, variant = %link.name, "restore: variant not in index")
                    }
                }
            }
        }
        self.index.put_keys(&id.file_id, &keys)?;
        Ok(keys)
    }

    /// Evicts every locally-held block of a file; the remote copy is
    /// retained. Returns `(blocks_removed, bytes_freed)`.
    pub async fn file_offload(&self, id: &FullFileId) -> FileResult<(u64, u64)> {
        let root = id.file_id.to_cid()?;
        let mut visited: HashSet<Cid> = HashSet::new();
        let mut stack = vec![root];
        let (mut removed, mut freed) = (0u64, 0u64);
        while let Some(cid) = stack.pop() {
            if !visited.insert(cid) {
                continue;
            }
            use filament_store::{BlockGetter, BlockPutter};
            let block = match self.local.get(&cid).await {
                Ok(block) => block,
                // Already evicted (or never cached) is fine.
                Err(FileError::NotFound) => continue,
                Err(e) => return Err(e),
            };
            if let Ok(node) = DagNode::decode(&block.data) {
                for link in &node.links {
                    stack.push(link.cid);
                }
            }
            self.local.delete(&cid).await?;
            removed += 1;
            freed += block.len() as u64;
        }
        Ok((removed, freed))
    }

    /// Calls `f` for every file root known to the index.
    pub fn iterate_files(&self, mut f: impl FnMut(&FileId)) -> FileResult<()> {
        for file_id in self.index.list_all_file_ids()? {
            f(&file_id);
        }
        Ok(())
    }
}

pub struct FileView {
    pub id: FullFileId,
    pub info: FileVariant,
    service: Arc<FileService>,
}

impl FileView {
    /// Seekable plaintext reader over the file content.
    pub async fn reader(&self) -> FileResult<Box<dyn ReadSeek + Send>> {
        variant_reader(&self.service, &self.id.space_id, &self.info).await
    }
}

pub struct ImageView {
    pub id: FullFileId,
    pub variants: BTreeMap<String, FileVariant>,
    service: Arc<FileService>,
}

impl ImageView {
    /// The smallest variant at least `width` wide, falling back to the
    /// original (the largest) when none qualifies.
    pub fn file_for_width(&self, width: u32) -> FileResult<&FileVariant> {
        let mut candidates: Vec<(&String, &FileVariant, u32)> = self
            .variants
            .iter()
            .filter(|(name, _)| name.as_str() != "exif")
            .filter_map(|(name, v)| {
                v.meta
                    .get("width")
                    .and_then(|w| w.parse::<u32>().ok())
                    .map(|w| (name, v, w))
            })
            .collect();
        candidates.sort_by_key(|(_, _, w)| *w);

        if let Some((_, variant, _)) = candidates.iter().find(|(_, _, w)| *w >= width) {
            return Ok(variant);
        }
        if let Some(original) = self.variants.get("original") {
            return Ok(original);
        }
        candidates
            .last()
            .map(|(_, v, _)| *v)
            .ok_or_else(|| FileError::ImageNotFound(self.id.file_id.to_string()))
    }

    pub async fn reader_for(&self, variant: &FileVariant) -> FileResult<Box<dyn ReadSeek + Send>> {
        variant_reader(&self.service, &self.id.space_id, variant).await
    }
}

async fn variant_reader(
    service: &Arc<FileService>,
    space_id: &SpaceId,
    info: &FileVariant,
) -> FileResult<Box<dyn ReadSeek + Send>> {
    let dag = service.dag_for_space(space_id);
    let data = dag.read_data(&info.hash.parse::<Cid>()?).await?;
    if info.key.is_empty() {
        return Ok(Box::new(data));
    }
    let key = Key::from_string(&info.key)?;
    let mode = if info.enc_mode == EncryptionMode::AesGcm as i32 {
        EncMode::AesGcm
    } else {
        EncMode::AesCfb
    };
    Ok(codec_for(mode, key).decrypt_reader(Box::new(data))?)
}

fn cfb_encrypt(key: &Key, data: &[u8]) -> FileResult<Vec<u8>> {
    let cfb = Cfb::new(key.clone());
    let mut reader = cfb.encrypt_reader(Box::new(Cursor::new(data.to_vec())))?;
    let mut out = Vec::with_capacity(data.len());
    reader.read_to_end(&mut out)?;
    Ok(out)
}

/// Decrypts and decodes a serialized variant, trying each encryption mode
/// in turn (legacy payloads may be GCM). The mode that succeeded is
/// recorded so the row caches it.
fn decode_variant(key_str: &str, raw: &[u8]) -> FileResult<FileVariant> {
    if key_str.is_empty() {
        let variant = FileVariant::decode(raw)?;
        if variant.hash.is_empty() {
            return Err(FileError::Storage("variant without content hash".into()));
        }
        return Ok(variant);
    }

    let key = Key::from_string(key_str)?;
    for mode in [EncMode::AesCfb, EncMode::AesGcm] {
        let codec = codec_for(mode, key.clone());
        let Ok(mut reader) = codec.decrypt_reader(Box::new(Cursor::new(raw.to_vec()))) else {
            continue;
        };
        let mut plain = Vec::new();
        if reader.read_to_end(&mut plain).is_err() {
            continue;
        }
        if let Ok(mut variant) = FileVariant::decode(plain.as_slice()) {
            if !variant.hash.is_empty() {
                variant.enc_mode = match mode {
                    EncMode::AesCfb => EncryptionMode::AesCfb as i32,
                    EncMode::AesGcm => EncryptionMode::AesGcm as i32,
                };
                return Ok(variant);
            }
        }
    }
    Err(FileError::EncMismatch)
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
