// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::index::MultihashIndexSorted;
use crate::utils::cid::inline_data;
use crate::utils::db::car_format::{
    CAR_V2_DEFAULT_DATA_OFFSET, CAR_V2_PRAGMA, CarBlock, CarV1Header, CarV2Header,
};
use ahash::{HashMap, HashMapExt as _};
use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use nunny::Vec as NonEmpty;
use parking_lot::Mutex;
use positioned_io::{ReadAt as _, WriteAt as _};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Where a block lives in the file.
#[derive(Debug, Clone, Copy)]
struct BlockLocation {
    /// Start of the varint frame, relative to the payload start.
    frame_offset: u64,
    /// Absolute offset of the block data.
    data_offset: u64,
    length: u32,
}

/// **Note that all operations on this store are blocking**.
///
/// A [`Blockstore`] that appends every new block to a CARv2 file on disk and
/// keeps the CID to offset mapping in memory. The file only becomes a valid
/// CARv2 once [`CarV2ReadWrite::finalize`] has written the index and the
/// outer header.
///
/// ```text
/// │pragma│v2 header│v1 header│block frame│block frame│...│index│
/// ```
pub struct CarV2ReadWrite {
    path: PathBuf,
    roots: NonEmpty<Cid>,
    inner: Mutex<ReadWriteInner>,
}

struct ReadWriteInner {
    file: File,
    /// Payload bytes written so far, including the v1 header frame.
    payload_len: u64,
    index: HashMap<Cid, BlockLocation>,
}

impl CarV2ReadWrite {
    /// Creates (or truncates) `path` and writes the CARv1 header for
    /// `roots`. The roots are fixed from here on; see
    /// [`super::replace_car_v2_roots`] for swapping them after the fact.
    #[tracing::instrument(level = "debug", skip(roots))]
    pub fn create(path: &Path, roots: NonEmpty<Cid>) -> io::Result<Self> {
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        // The outer header stays zeroed until finalize, so a crashed import
        // is never mistaken for a complete archive.
        file.write_all_at(0, &CAR_V2_PRAGMA)?;
        file.write_all_at(CAR_V2_PRAGMA.len() as u64, &CarV2Header::default().to_bytes())?;
        let header_frame = CarV1Header::new(roots.clone()).to_frame()?;
        file.write_all_at(CAR_V2_DEFAULT_DATA_OFFSET, &header_frame)?;
        Ok(Self {
            path: path.to_owned(),
            roots,
            inner: Mutex::new(ReadWriteInner {
                file,
                payload_len: header_frame.len() as u64,
                index: HashMap::new(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn roots(&self) -> &NonEmpty<Cid> {
        &self.roots
    }

    pub fn block_count(&self) -> usize {
        self.inner.lock().index.len()
    }

    /// Writes the index and the CARv2 header, and syncs the file.
    ///
    /// The declared roots are not checked against the stored blocks, since
    /// importers declare a placeholder root that is replaced afterwards.
    #[tracing::instrument(level = "debug", skip_all, fields(path = %self.path.display()))]
    pub fn finalize(self) -> io::Result<CarV2Header> {
        let ReadWriteInner {
            mut file,
            payload_len,
            index,
        } = self.inner.into_inner();
        let header = CarV2Header {
            characteristics: {
                let mut characteristics = [0; 16];
                characteristics[0] = CarV2Header::FULLY_INDEXED;
                characteristics
            },
            data_offset: CAR_V2_DEFAULT_DATA_OFFSET,
            data_size: payload_len,
            index_offset: CAR_V2_DEFAULT_DATA_OFFSET + payload_len,
        };
        let index = MultihashIndexSorted::from_records(
            index
                .into_iter()
                .map(|(cid, location)| (cid, location.frame_offset)),
        );
        let mut index_bytes = vec![];
        index.write_to(&mut index_bytes)?;
        file.write_all_at(header.index_offset, &index_bytes)?;
        file.set_len(header.index_offset + index_bytes.len() as u64)?;
        file.write_all_at(CAR_V2_PRAGMA.len() as u64, &header.to_bytes())?;
        file.sync_all()?;
        debug!(blocks = index.len(), data_size = payload_len, "finalized CARv2");
        Ok(header)
    }
}

impl Blockstore for CarV2ReadWrite {
    #[tracing::instrument(level = "trace", skip(self))]
    fn get(&self, k: &Cid) -> anyhow::Result<Option<Vec<u8>>> {
        let inner = self.inner.lock();
        match inner.index.get(k) {
            Some(BlockLocation {
                data_offset,
                length,
                ..
            }) => {
                let mut data = vec![0; usize::try_from(*length)?];
                inner.file.read_exact_at(*data_offset, &mut data)?;
                Ok(Some(data))
            }
            None => Ok(inline_data(k).map(<[u8]>::to_vec)),
        }
    }

    #[tracing::instrument(level = "trace", skip(self, block))]
    fn put_keyed(&self, k: &Cid, block: &[u8]) -> anyhow::Result<()> {
        let ReadWriteInner {
            file,
            payload_len,
            index,
        } = &mut *self.inner.lock();
        if index.contains_key(k) {
            trace!("already on disk");
            return Ok(());
        }
        let block = CarBlock {
            cid: *k,
            data: block.to_vec(),
        };
        let mut frame = Vec::with_capacity(block.frame_len());
        block.write(&mut frame)?;
        let frame_offset = *payload_len;
        file.write_all_at(CAR_V2_DEFAULT_DATA_OFFSET + frame_offset, &frame)?;
        *payload_len += frame.len() as u64;
        let length = u32::try_from(block.data.len())?;
        index.insert(
            *k,
            BlockLocation {
                frame_offset,
                data_offset: CAR_V2_DEFAULT_DATA_OFFSET + *payload_len - u64::from(length),
                length,
            },
        );
        Ok(())
    }

    fn has(&self, k: &Cid) -> anyhow::Result<bool> {
        Ok(self.inner.lock().index.contains_key(k))
    }
}
