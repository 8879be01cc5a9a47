// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Builds UnixFS DAGs from local files and directories.
//!
//! Files are cut into fixed size chunks stored as raw leaves, and linked
//! with the balanced layout: every internal node holds up to `max_links`
//! children and the tree is as shallow as possible.
//!
//! ```text
//!                [root]
//!          ┌───────┴───────┐
//!       [node]           [node]
//!     ┌───┼───┐            │
//!    [a] [b] [c]          [d]
//! ```

use super::pb::{DataType, PbLink, PbNode, UnixFsData};
use super::DAG_PB;
use crate::error::MarketError;
use crate::utils::cid::{InlineCidBuilder, inline_data};
use crate::utils::multihash::prelude::*;
use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::IPLD_RAW;
use smart_default::SmartDefault;
use std::collections::BTreeMap;
use std::io::{self, Read};
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, SmartDefault)]
pub struct BuilderOptions {
    #[default(1024 * 1024)]
    pub chunk_size: usize,
    #[default(1024)]
    pub max_links: usize,
    pub cid_builder: InlineCidBuilder,
}

/// A node that has been written to the blockstore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuiltNode {
    pub cid: Cid,
    /// Bytes of file content below this node.
    pub file_size: u64,
    /// Bytes of every block below and including this node.
    pub cumulative_size: u64,
}

pub struct DagBuilder<'a, BS> {
    store: &'a BS,
    opts: BuilderOptions,
}

impl<'a, BS: Blockstore> DagBuilder<'a, BS> {
    pub fn new(store: &'a BS, opts: BuilderOptions) -> Self {
        Self { store, opts }
    }

    /// Imports a file or a directory tree. The returned root is never an
    /// inline CID.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn add_path(&self, path: &Path) -> anyhow::Result<BuiltNode> {
        if std::fs::metadata(path)?.is_dir() {
            self.add_dir(path)
        } else {
            self.add_file(std::fs::File::open(path)?, true)
        }
    }

    /// Chunks `reader` and links the chunks. With `is_root` set the top node
    /// is hashed even when it is small enough to be inlined.
    pub fn add_file(&self, reader: impl Read, is_root: bool) -> anyhow::Result<BuiltNode> {
        let mut chunks = Chunker::new(reader, self.opts.chunk_size).peekable();
        let mut levels: Vec<Vec<BuiltNode>> = vec![vec![]];
        let mut first = true;
        while let Some(chunk) = chunks.next() {
            let chunk = chunk?;
            let only_chunk = first && chunks.peek().is_none();
            first = false;
            let leaf = self.put_leaf(chunk, is_root && only_chunk)?;
            self.push(&mut levels, 0, leaf)?;
        }
        let root = self.close(levels, is_root)?;
        debug!(root = %root.cid, size = root.file_size, "imported file");
        Ok(root)
    }

    fn put_leaf(&self, chunk: Vec<u8>, hashed: bool) -> anyhow::Result<BuiltNode> {
        let cid = self.block_cid(IPLD_RAW, &chunk, hashed);
        self.store.put_keyed(&cid, &chunk)?;
        let size = chunk.len() as u64;
        Ok(BuiltNode {
            cid,
            file_size: size,
            cumulative_size: size,
        })
    }

    fn block_cid(&self, codec: u64, data: &[u8], hashed: bool) -> Cid {
        let builder = &self.opts.cid_builder;
        if hashed {
            Cid::new_v1(codec, builder.hash.digest(data))
        } else {
            builder.cid(codec, data)
        }
    }

    fn push(
        &self,
        levels: &mut Vec<Vec<BuiltNode>>,
        level: usize,
        node: BuiltNode,
    ) -> anyhow::Result<()> {
        if levels.len() <= level {
            levels.resize_with(level + 1, Vec::new);
        }
        levels[level].push(node);
        if levels[level].len() == self.opts.max_links {
            let children = std::mem::take(&mut levels[level]);
            let parent = self.put_file_node(&children, false)?;
            self.push(levels, level + 1, parent)?;
        }
        Ok(())
    }

    /// Folds the partially filled levels into a single root.
    fn close(&self, mut levels: Vec<Vec<BuiltNode>>, is_root: bool) -> anyhow::Result<BuiltNode> {
        if levels.iter().all(Vec::is_empty) {
            // empty input still produces one (empty) leaf
            return self.put_leaf(vec![], is_root);
        }
        let mut level = 0;
        loop {
            let highest = levels
                .iter()
                .rposition(|l| !l.is_empty())
                .ok_or_else(|| MarketError::Other(anyhow::anyhow!("file tree lost its nodes")))?;
            let children = std::mem::take(&mut levels[level]);
            match children.as_slice() {
                [single] if level == highest => {
                    return match is_root {
                        true => self.ensure_hashed(*single),
                        false => Ok(*single),
                    };
                }
                [] => {}
                _ => {
                    let parent = self.put_file_node(&children, is_root && level == highest)?;
                    if levels.len() <= level + 1 {
                        levels.push(vec![]);
                    }
                    levels[level + 1].push(parent);
                }
            }
            level += 1;
        }
    }

    /// Re-keys an inlined node under its hash. Only reachable with chunk
    /// sizes and link counts small enough for internal nodes to inline.
    fn ensure_hashed(&self, node: BuiltNode) -> anyhow::Result<BuiltNode> {
        let Some(data) = inline_data(&node.cid) else {
            return Ok(node);
        };
        let cid = self.block_cid(node.cid.codec(), data, true);
        self.store.put_keyed(&cid, data)?;
        Ok(BuiltNode { cid, ..node })
    }

    fn put_file_node(&self, children: &[BuiltNode], hashed: bool) -> anyhow::Result<BuiltNode> {
        let file_size = children.iter().map(|c| c.file_size).sum();
        let data = UnixFsData {
            data_type: DataType::File,
            filesize: Some(file_size),
            blocksizes: children.iter().map(|c| c.file_size).collect(),
            ..Default::default()
        };
        let node = PbNode {
            links: children
                .iter()
                .map(|c| PbLink::new(&c.cid, "", c.cumulative_size))
                .collect(),
            data: Some(data.encode()?),
        };
        self.put_node(&node, file_size, children, hashed)
    }

    fn put_node(
        &self,
        node: &PbNode,
        file_size: u64,
        children: &[BuiltNode],
        hashed: bool,
    ) -> anyhow::Result<BuiltNode> {
        let bytes = node.encode()?;
        let cid = self.block_cid(DAG_PB, &bytes, hashed);
        self.store.put_keyed(&cid, &bytes)?;
        Ok(BuiltNode {
            cid,
            file_size,
            cumulative_size: bytes.len() as u64
                + children.iter().map(|c| c.cumulative_size).sum::<u64>(),
        })
    }

    fn add_dir(&self, dir: &Path) -> anyhow::Result<BuiltNode> {
        // children of each directory, keyed by the directory path
        let mut pending: BTreeMap<std::path::PathBuf, Vec<(String, BuiltNode)>> = BTreeMap::new();
        for entry in walkdir::WalkDir::new(dir)
            .contents_first(true)
            .sort_by_file_name()
        {
            let entry = entry?;
            let file_type = entry.file_type();
            let node = if file_type.is_dir() {
                let children = pending.remove(entry.path()).unwrap_or_default();
                self.put_dir_node(children, entry.depth() == 0)?
            } else if file_type.is_file() {
                self.add_file(std::fs::File::open(entry.path())?, false)?
            } else {
                warn!(path = %entry.path().display(), "skipping entry that is neither file nor directory");
                continue;
            };
            if entry.depth() == 0 {
                debug!(root = %node.cid, "imported directory");
                return Ok(node);
            }
            let parent = entry
                .path()
                .parent()
                .ok_or_else(|| anyhow::anyhow!("{} has no parent", entry.path().display()))?;
            pending
                .entry(parent.to_owned())
                .or_default()
                .push((entry.file_name().to_string_lossy().into_owned(), node));
        }
        anyhow::bail!("{} was not visited", dir.display())
    }

    fn put_dir_node(
        &self,
        mut children: Vec<(String, BuiltNode)>,
        hashed: bool,
    ) -> anyhow::Result<BuiltNode> {
        children.sort_by(|a, b| a.0.cmp(&b.0));
        let node = PbNode {
            links: children
                .iter()
                .map(|(name, c)| PbLink::new(&c.cid, name.as_str(), c.cumulative_size))
                .collect(),
            data: Some(
                UnixFsData {
                    data_type: DataType::Directory,
                    ..Default::default()
                }
                .encode()?,
            ),
        };
        let nodes: Vec<BuiltNode> = children.into_iter().map(|(_, c)| c).collect();
        self.put_node(&node, 0, &nodes, hashed)
    }
}

/// Splits a reader into chunks of exactly `size` bytes, except for the last.
struct Chunker<R> {
    reader: R,
    size: usize,
    done: bool,
}

impl<R: Read> Chunker<R> {
    fn new(reader: R, size: usize) -> Self {
        Self {
            reader,
            size: size.max(1),
            done: false,
        }
    }

    fn fill(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.size);
        (&mut self.reader)
            .take(self.size as u64)
            .read_to_end(&mut buf)?;
        Ok(buf)
    }
}

impl<R: Read> Iterator for Chunker<R> {
    type Item = io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.fill() {
            Ok(chunk) if chunk.len() < self.size => {
                self.done = true;
                // a short final read yields nothing for inputs that are an
                // exact multiple of the chunk size
                (!chunk.is_empty()).then_some(Ok(chunk))
            }
            Ok(chunk) => Some(Ok(chunk)),
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
