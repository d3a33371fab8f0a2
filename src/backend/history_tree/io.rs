//! File access for history trees.
//!
//! A history file is a fixed header block, then one block per node in
//! sequence order, then the attribute section:
//!
//! ```text
//! [header: 4096 bytes][node 0][node 1]...[node n-1][attribute section]
//! ```

use super::node::HtNode;
use crate::attribute::mapping;
use crate::error::{Result, StateSystemError};
use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;
use statehist_types::Timestamp;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub(crate) const HEADER_SIZE: u64 = 4096;
pub(crate) const HISTORY_FILE_MAGIC: u32 = 0x05FF_A900;
pub(crate) const FILE_VERSION: u32 = 2;

/// Contents of the header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TreeHeader {
    pub provider_version: u32,
    pub block_size: usize,
    pub max_children: usize,
    pub node_count: u32,
    pub root_seq: u32,
    pub start: Timestamp,
    pub end: Timestamp,
    pub interval_count: u64,
    pub attribute_offset: u64,
    pub quark_count: u32,
    pub partial: bool,
    /// Spacing of the stored checkpoints. Zero for full histories.
    pub checkpoint_interval: i64,
}

impl TreeHeader {
    fn encode(&self, buf: &mut BytesMut) {
        buf.clear();
        buf.put_u32(HISTORY_FILE_MAGIC);
        buf.put_u32(FILE_VERSION);
        buf.put_u32(self.provider_version);
        buf.put_u32(self.block_size as u32);
        buf.put_u32(self.max_children as u32);
        buf.put_u32(self.node_count);
        buf.put_u32(self.root_seq);
        buf.put_i64(self.start);
        buf.put_i64(self.end);
        buf.put_u64(self.interval_count);
        buf.put_u64(self.attribute_offset);
        buf.put_u32(self.quark_count);
        buf.put_u8(u8::from(self.partial));
        buf.put_i64(self.checkpoint_interval);
        buf.resize(HEADER_SIZE as usize, 0);
    }

    fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE as usize {
            return Err(corrupt("file shorter than its header"));
        }
        let magic = buf.get_u32();
        if magic != HISTORY_FILE_MAGIC {
            return Err(corrupt(format!("bad history file magic {:#010x}", magic)));
        }
        let version = buf.get_u32();
        if version != FILE_VERSION {
            return Err(corrupt(format!(
                "unsupported history file version {} (expected {})",
                version, FILE_VERSION
            )));
        }

        let header = Self {
            provider_version: buf.get_u32(),
            block_size: buf.get_u32() as usize,
            max_children: buf.get_u32() as usize,
            node_count: buf.get_u32(),
            root_seq: buf.get_u32(),
            start: buf.get_i64(),
            end: buf.get_i64(),
            interval_count: buf.get_u64(),
            attribute_offset: buf.get_u64(),
            quark_count: buf.get_u32(),
            partial: buf.get_u8() != 0,
            checkpoint_interval: buf.get_i64(),
        };

        if header.block_size < crate::Config::MIN_BLOCK_SIZE || header.max_children < 2 {
            return Err(corrupt("invalid tree geometry in header"));
        }
        if header.root_seq >= header.node_count {
            return Err(corrupt(format!(
                "root node {} outside of {} nodes",
                header.root_seq, header.node_count
            )));
        }
        if header.partial && header.checkpoint_interval <= 0 {
            return Err(corrupt(format!(
                "partial history with checkpoint interval {}",
                header.checkpoint_interval
            )));
        }
        if header.end < header.start {
            return Err(corrupt("history ends before it starts"));
        }
        let nodes_end = HEADER_SIZE + u64::from(header.node_count) * header.block_size as u64;
        if header.attribute_offset != nodes_end {
            return Err(corrupt("attribute section does not follow the last node"));
        }
        Ok(header)
    }
}

/// Block-level access to one history file, with a direct-mapped node cache.
pub(crate) struct HtIo {
    path: PathBuf,
    file: Mutex<File>,
    block_size: usize,
    max_children: usize,
    cache: Mutex<Vec<Option<Arc<HtNode>>>>,
    scratch: BytesMut,
}

impl HtIo {
    /// Create (or truncate) a history file.
    pub fn create(
        path: &Path,
        block_size: usize,
        max_children: usize,
        cache_size: usize,
    ) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)?;
        // Zeroed until the tree is closed, so an unfinished file never opens.
        file.write_all(&[0u8; HEADER_SIZE as usize])?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            block_size,
            max_children,
            cache: Mutex::new(vec![None; cache_size]),
            scratch: BytesMut::with_capacity(block_size),
        })
    }

    /// Open a finished history file and read its header.
    pub fn open(path: &Path, cache_size: usize) -> Result<(Self, TreeHeader)> {
        let mut file = OpenOptions::new().read(true).open(path)?;
        let mut block = vec![0u8; HEADER_SIZE as usize];
        file.read_exact(&mut block).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => corrupt("file shorter than its header"),
            _ => StateSystemError::from(e),
        })?;
        let header = TreeHeader::decode(&block)?;

        let io = Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            block_size: header.block_size,
            max_children: header.max_children,
            cache: Mutex::new(vec![None; cache_size]),
            scratch: BytesMut::new(),
        };
        Ok((io, header))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn node_offset(&self, seq: u32) -> u64 {
        HEADER_SIZE + u64::from(seq) * self.block_size as u64
    }

    fn cache_slot(&self, seq: u32, len: usize) -> Option<usize> {
        (len > 0).then(|| seq as usize % len)
    }

    /// Write a closed node to its block and keep it cached.
    pub fn write_node(&mut self, node: &HtNode) -> Result<()> {
        node.encode(self.block_size, self.max_children, &mut self.scratch);
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(self.node_offset(node.seq)))?;
            file.write_all(&self.scratch)?;
        }

        let mut cache = self.cache.lock();
        if let Some(slot) = self.cache_slot(node.seq, cache.len()) {
            cache[slot] = Some(Arc::new(node.clone()));
        }
        Ok(())
    }

    /// Read a node, from the cache when possible.
    pub fn read_node(&self, seq: u32) -> Result<Arc<HtNode>> {
        {
            let cache = self.cache.lock();
            if let Some(slot) = self.cache_slot(seq, cache.len())
                && let Some(node) = &cache[slot]
                && node.seq == seq
            {
                return Ok(Arc::clone(node));
            }
        }

        let mut block = vec![0u8; self.block_size];
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(self.node_offset(seq)))?;
            file.read_exact(&mut block).map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => corrupt(format!("node {} truncated", seq)),
                _ => StateSystemError::from(e),
            })?;
        }
        let node = Arc::new(HtNode::decode(&block, self.block_size, self.max_children)?);
        if node.seq != seq {
            return Err(corrupt(format!("block {} holds node {}", seq, node.seq)));
        }

        let mut cache = self.cache.lock();
        if let Some(slot) = self.cache_slot(seq, cache.len()) {
            cache[slot] = Some(Arc::clone(&node));
        }
        Ok(node)
    }

    /// Append the attribute section at `offset`; returns its size.
    pub fn write_attributes(&mut self, offset: u64, paths: &[String]) -> Result<u64> {
        self.scratch.clear();
        mapping::encode_section(paths, &mut self.scratch)?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&self.scratch)?;
        Ok(self.scratch.len() as u64)
    }

    pub fn read_attributes(&self, header: &TreeHeader) -> Result<Vec<String>> {
        let mut file = self.file.lock();
        let file_len = file.metadata()?.len();
        let truncated = || corrupt("attribute section truncated");

        let mut section_header = [0u8; 12];
        if header.attribute_offset + section_header.len() as u64 > file_len {
            return Err(truncated());
        }
        file.seek(SeekFrom::Start(header.attribute_offset))?;
        file.read_exact(&mut section_header)?;
        let size = mapping::section_size(&section_header)?;
        if size < section_header.len() || header.attribute_offset + size as u64 > file_len {
            return Err(truncated());
        }

        let mut section = vec![0u8; size];
        section[..12].copy_from_slice(&section_header);
        file.read_exact(&mut section[12..])?;
        let paths = mapping::decode_section(&section)?;
        if paths.len() != header.quark_count as usize {
            return Err(corrupt(format!(
                "header records {} quarks, attribute section holds {}",
                header.quark_count,
                paths.len()
            )));
        }
        Ok(paths)
    }

    /// Write the header block and flush everything to disk.
    pub fn write_header(&mut self, header: &TreeHeader) -> Result<()> {
        header.encode(&mut self.scratch);
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&self.scratch)?;
        file.sync_all()?;
        Ok(())
    }

    pub fn clear_cache(&self) {
        for slot in self.cache.lock().iter_mut() {
            *slot = None;
        }
    }
}

fn corrupt(message: impl Into<String>) -> StateSystemError {
    StateSystemError::CorruptPersistedState(message.into())
}
