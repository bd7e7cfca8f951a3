//! dag-pb / UnixFS node model over a block store
//!
//! Every internal node is a dag-pb `PbNode` whose `data` field carries
//! UnixFS framing, so UnixFS-aware tools can traverse the structure.
//! Directories hold named links sorted by name; file content is split into
//! 1 MiB leaves under a parent file node. All CIDs are v1, DagProtobuf,
//! SHA-256.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use bytes::Bytes;
use cid::Cid;
use prost::Message;

use filament_core::proto::{self, unixfs_data::DataType};
use filament_core::{Block, FileError, FileResult};
use filament_store::cid_util::dag_cid;
use filament_store::{BlockGetter, BlockPutter, BlockStore};

use crate::CHUNK_SIZE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DagLink {
    pub name: String,
    pub cid: Cid,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct DagNode {
    pub unixfs: proto::UnixfsData,
    pub links: Vec<DagLink>,
}

impl DagNode {
    pub fn directory() -> Self {
        Self {
            unixfs: proto::UnixfsData {
                r#type: DataType::Directory as i32,
                ..Default::default()
            },
            links: Vec::new(),
        }
    }

    pub fn file_leaf(content: Vec<u8>) -> Self {
        let filesize = content.len() as u64;
        Self {
            unixfs: proto::UnixfsData {
                r#type: DataType::File as i32,
                data: content,
                filesize,
                ..Default::default()
            },
            links: Vec::new(),
        }
    }

    pub fn add_link(&mut self, name: impl Into<String>, cid: Cid, size: u64) {
        self.links.push(DagLink {
            name: name.into(),
            cid,
            size,
        });
    }

    pub fn link(&self, name: &str) -> Option<&DagLink> {
        self.links.iter().find(|l| l.name == name)
    }

    pub fn is_directory(&self) -> bool {
        self.unixfs.r#type == DataType::Directory as i32
    }

    /// A pair node has exactly two links, named `meta` and `content`.
    pub fn looks_like_pair(&self) -> bool {
        self.links.len() == 2
            && self.link(crate::META_LINK).is_some()
            && self.link(crate::CONTENT_LINK).is_some()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut links: Vec<&DagLink> = self.links.iter().collect();
        links.sort_by(|a, b| a.name.cmp(&b.name));
        let node = proto::PbNode {
            data: self.unixfs.encode_to_vec(),
            links: links
                .into_iter()
                .map(|l| proto::PbLink {
                    hash: l.cid.to_bytes(),
                    name: l.name.clone(),
                    tsize: l.size,
                })
                .collect(),
        };
        node.encode_to_vec()
    }

    pub fn decode(raw: &[u8]) -> FileResult<Self> {
        let node = proto::PbNode::decode(raw)?;
        let unixfs = proto::UnixfsData::decode(node.data.as_slice())?;
        let links = node
            .links
            .into_iter()
            .map(|l| {
                Ok(DagLink {
                    cid: Cid::try_from(l.hash.as_slice())?,
                    name: l.name,
                    size: l.tsize,
                })
            })
            .collect::<FileResult<Vec<_>>>()?;
        Ok(Self { unixfs, links })
    }

    pub fn to_block(&self) -> Block {
        let raw = self.encode();
        Block::new(dag_cid(&raw), raw)
    }
}

/// UnixFS-equivalent service over any block store: content in, CID out,
/// and back again.
#[derive(Clone)]
pub struct DagService {
    store: Arc<dyn BlockStore>,
}

impl DagService {
    pub fn new(store: Arc<dyn BlockStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    pub async fn add_node(&self, node: &DagNode) -> FileResult<Cid> {
        let block = node.to_block();
        let cid = block.cid;
        self.store.add(vec![block]).await?;
        Ok(cid)
    }

    pub async fn get_node(&self, cid: &Cid) -> FileResult<DagNode> {
        let block = self.store.get(cid).await?;
        DagNode::decode(&block.data)
    }

    pub async fn links_at(&self, cid: &Cid) -> FileResult<Vec<DagLink>> {
        Ok(self.get_node(cid).await?.links)
    }

    /// Chunk `data` into leaves and return the root CID of the content
    /// subtree plus its total size.
    pub async fn add_data(&self, data: &[u8]) -> FileResult<(Cid, u64)> {
        let total = data.len() as u64;
        let mut leaves = Vec::new();
        // A zero-byte file still gets one (empty) leaf.
        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![&[]]
        } else {
            data.chunks(CHUNK_SIZE).collect()
        };
        for chunk in &chunks {
            let leaf = DagNode::file_leaf(chunk.to_vec());
            let block = leaf.to_block();
            leaves.push((block.cid, chunk.len() as u64));
            self.store.add(vec![block]).await?;
        }
        if leaves.len() == 1 {
            return Ok((leaves[0].0, total));
        }

        let mut parent = DagNode {
            unixfs: proto::UnixfsData {
                r#type: DataType::File as i32,
                filesize: total,
                blocksizes: leaves.iter().map(|(_, size)| *size).collect(),
                ..Default::default()
            },
            links: Vec::new(),
        };
        for (cid, size) in &leaves {
            parent.add_link("", *cid, *size);
        }
        let root = self.add_node(&parent).await?;
        Ok((root, total))
    }

    /// Seekable reader over the content subtree rooted at `cid`. Leaves are
    /// fetched through the store (read-through on a proxy) at open.
    pub async fn read_data(&self, cid: &Cid) -> FileResult<DataReader> {
        let root = self.get_node(cid).await?;
        let mut segments = Vec::new();
        if root.links.is_empty() {
            segments.push(Bytes::from(root.unixfs.data));
        } else {
            for link in &root.links {
                let leaf = self.get_node(&link.cid).await?;
                segments.push(Bytes::from(leaf.unixfs.data));
            }
        }
        Ok(DataReader::new(segments))
    }
}

/// In-memory seekable reader over the ordered content leaves of one file.
pub struct DataReader {
    segments: Vec<Bytes>,
    len: u64,
    pos: u64,
}

impl DataReader {
    fn new(segments: Vec<Bytes>) -> Self {
        let len = segments.iter().map(|s| s.len() as u64).sum();
        Self {
            segments,
            len,
            pos: 0,
        }
    }

    pub fn size(&self) -> u64 {
        self.len
    }
}

impl Read for DataReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.len || buf.is_empty() {
            return Ok(0);
        }
        let mut segment_start = 0u64;
        for segment in &self.segments {
            let segment_len = segment.len() as u64;
            if self.pos < segment_start + segment_len {
                let inner = (self.pos - segment_start) as usize;
                let n = (segment.len() - inner).min(buf.len());
                buf[..n].copy_from_slice(&segment[inner..inner + n]);
                self.pos += n as u64;
                return Ok(n);
            }
            segment_start += segment_len;
        }
        Ok(0)
    }
}

impl Seek for DataReader {
    fn seek(&mut self, seek: SeekFrom) -> io::Result<u64> {
        let target = match seek {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::Current(d) => self.pos.checked_add_signed(d),
            SeekFrom::End(d) => self.len.checked_add_signed(d),
        }
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "seek to a negative offset"))?;
        if target > self.len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek past end",
            ));
        }
        self.pos = target;
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filament_store::LocalStore;

    fn service() -> (DagService, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        (DagService::new(store), dir)
    }

    #[tokio::test]
    async fn node_roundtrip() {
        let (dag, _dir) = service();
        let mut node = DagNode::directory();
        let (child, _) = dag.add_data(b"child content").await.unwrap();
        node.add_link("child", child, 13);

        let cid = dag.add_node(&node).await.unwrap();
        let got = dag.get_node(&cid).await.unwrap();
        assert!(got.is_directory());
        assert_eq!(got.link("child").unwrap().cid, child);
    }

    #[tokio::test]
    async fn equal_directories_have_equal_cids_regardless_of_link_order() {
        let (dag, _dir) = service();
        let (a, _) = dag.add_data(b"aaa").await.unwrap();
        let (b, _) = dag.add_data(b"bbb").await.unwrap();

        let mut n1 = DagNode::directory();
        n1.add_link("x", a, 3);
        n1.add_link("y", b, 3);
        let mut n2 = DagNode::directory();
        n2.add_link("y", b, 3);
        n2.add_link("x", a, 3);

        assert_eq!(n1.to_block().cid, n2.to_block().cid);
    }

    #[tokio::test]
    async fn data_roundtrip_single_chunk() {
        let (dag, _dir) = service();
        let (cid, size) = dag.add_data(b"small payload").await.unwrap();
        assert_eq!(size, 13);
        let mut reader = dag.read_data(&cid).await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"small payload");
    }

    #[tokio::test]
    async fn data_roundtrip_multi_chunk() {
        let (dag, _dir) = service();
        let data: Vec<u8> = (0u8..=255).cycle().take(3 * CHUNK_SIZE + 17).collect();
        let (cid, size) = dag.add_data(&data).await.unwrap();
        assert_eq!(size, data.len() as u64);

        let root = dag.get_node(&cid).await.unwrap();
        assert_eq!(root.links.len(), 4);

        let mut reader = dag.read_data(&cid).await.unwrap();
        assert_eq!(reader.size(), data.len() as u64);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn data_reader_seeks_across_chunks() {
        let (dag, _dir) = service();
        let data: Vec<u8> = (0u8..=255).cycle().take(2 * CHUNK_SIZE + 100).collect();
        let (cid, _) = dag.add_data(&data).await.unwrap();

        let mut reader = dag.read_data(&cid).await.unwrap();
        let target = CHUNK_SIZE as u64 + 50;
        reader.seek(SeekFrom::Start(target)).unwrap();
        let mut out = vec![0u8; 200];
        reader.read_exact(&mut out).unwrap();
        assert_eq!(out, &data[target as usize..target as usize + 200]);
    }

    #[tokio::test]
    async fn zero_byte_file_roundtrips() {
        let (dag, _dir) = service();
        let (cid, size) = dag.add_data(b"").await.unwrap();
        assert_eq!(size, 0);
        let mut reader = dag.read_data(&cid).await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn same_data_same_cid() {
        let (dag, _dir) = service();
        let (a, _) = dag.add_data(b"identical").await.unwrap();
        let (b, _) = dag.add_data(b"identical").await.unwrap();
        assert_eq!(a, b);
    }
}
