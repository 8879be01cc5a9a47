// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Reconstructs files and directories from a UnixFS DAG.

use super::DAG_PB;
use super::pb::{DataType, PbNode, UnixFsData};
use crate::error::{MarketError, Result};
use crate::ipld::load_block;
use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::IPLD_RAW;
use std::io::Write;
use std::path::Path;
use tracing::debug;

enum Node {
    Raw(Vec<u8>),
    UnixFs(PbNode, UnixFsData),
}

fn load_node(store: &impl Blockstore, cid: &Cid) -> Result<Node> {
    let block = load_block(store, cid)?;
    match cid.codec() {
        IPLD_RAW => Ok(Node::Raw(block)),
        DAG_PB => {
            let node = PbNode::decode(&block).map_err(MarketError::format)?;
            let data = UnixFsData::decode(node.data.as_deref().unwrap_or_default())
                .map_err(MarketError::format)?;
            Ok(Node::UnixFs(node, data))
        }
        other => Err(MarketError::Format(format!(
            "block {cid} has codec {other:#x}, which is not UnixFS"
        ))),
    }
}

/// Writes the content of the UnixFS file rooted at `root` to `writer` and
/// returns the number of bytes written.
pub fn write_file(store: &impl Blockstore, root: &Cid, mut writer: impl Write) -> Result<u64> {
    let mut written = 0;
    let mut stack = vec![*root];
    while let Some(cid) = stack.pop() {
        match load_node(store, &cid)? {
            Node::Raw(bytes) => {
                writer.write_all(&bytes)?;
                written += bytes.len() as u64;
            }
            Node::UnixFs(node, data) => {
                if !matches!(data.data_type, DataType::File | DataType::Raw) {
                    return Err(MarketError::Format(format!(
                        "expected a file at {cid}, found {}",
                        data.data_type
                    )));
                }
                if let Some(bytes) = &data.data {
                    writer.write_all(bytes)?;
                    written += bytes.len() as u64;
                }
                for link in node.links.iter().rev() {
                    stack.push(link.cid().map_err(MarketError::format)?);
                }
            }
        }
    }
    writer.flush()?;
    Ok(written)
}

/// Recreates the file or directory tree rooted at `root` at `dest`.
#[tracing::instrument(level = "debug", skip(store))]
pub fn export_to_path(store: &impl Blockstore, root: &Cid, dest: &Path) -> Result<()> {
    match load_node(store, root)? {
        Node::UnixFs(node, data) if data.data_type == DataType::Directory => {
            std::fs::create_dir_all(dest)?;
            for link in &node.links {
                let name = link.name.as_deref().unwrap_or_default();
                if name.is_empty() || name == "." || name == ".." || name.contains('/') {
                    return Err(MarketError::Format(format!(
                        "directory {root} has an invalid entry name {name:?}"
                    )));
                }
                let child = link.cid().map_err(MarketError::format)?;
                export_to_path(store, &child, &dest.join(name))?;
            }
            Ok(())
        }
        Node::UnixFs(_, data) if data.data_type == DataType::Symlink => {
            let target = String::from_utf8(data.data.unwrap_or_default())
                .map_err(MarketError::format)?;
            std::os::unix::fs::symlink(target, dest)?;
            Ok(())
        }
        _ => {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::io::BufWriter::new(std::fs::File::create(dest)?);
            let size = write_file(store, root, file)?;
            debug!(path = %dest.display(), size, "exported file");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDB;
    use crate::unixfs::{BuilderOptions, DagBuilder};
    use pretty_assertions::assert_eq;
    use quickcheck_macros::quickcheck;

    fn opts() -> BuilderOptions {
        BuilderOptions {
            chunk_size: 64,
            max_links: 3,
            ..Default::default()
        }
    }

    #[quickcheck]
    fn file_round_trip(content: Vec<u8>) {
        let store = MemoryDB::default();
        let root = DagBuilder::new(&store, opts())
            .add_file(content.as_slice(), true)
            .unwrap();
        let mut out = vec![];
        let written = write_file(&store, &root.cid, &mut out).unwrap();
        assert_eq!(written, content.len() as u64);
        assert_eq!(out, content);
    }

    #[test]
    fn directory_round_trip() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("nested/deeper")).unwrap();
        std::fs::write(src.path().join("a.txt"), b"alpha").unwrap();
        std::fs::write(src.path().join("nested/b.bin"), vec![9u8; 500]).unwrap();
        std::fs::write(src.path().join("nested/deeper/c"), b"").unwrap();

        let store = MemoryDB::default();
        let root = DagBuilder::new(&store, opts()).add_path(src.path()).unwrap();

        let dest = tempfile::tempdir().unwrap();
        let out = dest.path().join("out");
        export_to_path(&store, &root.cid, &out).unwrap();
        assert_eq!(std::fs::read(out.join("a.txt")).unwrap(), b"alpha");
        assert_eq!(std::fs::read(out.join("nested/b.bin")).unwrap(), vec![9u8; 500]);
        assert_eq!(std::fs::read(out.join("nested/deeper/c")).unwrap(), b"");
    }

    #[test]
    fn missing_block_is_not_found() {
        let store = MemoryDB::default();
        let root = DagBuilder::new(&store, opts())
            .add_file(vec![1u8; 1000].as_slice(), true)
            .unwrap();
        let empty = MemoryDB::default();
        assert!(matches!(
            write_file(&empty, &root.cid, std::io::sink()),
            Err(MarketError::NotFound(_))
        ));
    }
}
