// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::index::MultihashIndexSorted;
use crate::error::{MarketError, Result};
use crate::utils::cid::inline_data;
use crate::utils::db::car_format::{
    CAR_V2_HEADER_SIZE, CAR_V2_PRAGMA, CarV1Header, CarV2Header,
};
use ahash::HashMap;
use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use integer_encoding::VarIntReader as _;
use positioned_io::{ReadAt, Slice};
use std::fs::File;
use std::io::{
    self, BufReader,
    ErrorKind::{InvalidData, UnexpectedEof},
    Read, Seek, SeekFrom,
};
use std::iter;
use std::path::Path;
use tracing::debug;

/// If you seek to `offset` (from the start of the file), and read `length` bytes,
/// you should get data that corresponds to a [`Cid`] (but NOT the [`Cid`] itself).
#[derive(Debug, Clone, Copy)]
struct BlockDataLocation {
    offset: u64,
    length: u32,
}

enum Index {
    /// Built by walking every frame of the payload.
    Scanned(HashMap<Cid, BlockDataLocation>),
    /// Loaded from the index section of a CARv2.
    Sorted(MultihashIndexSorted),
}

/// **Note that all operations on this store are blocking**.
///
/// Read-only [`Blockstore`] over a finished CARv1 or CARv2 file. CARv2 files
/// that carry a `MultihashIndexSorted` are served from that index, anything
/// else is indexed by scanning the payload once on open.
pub struct CarReadOnly {
    file: File,
    header: CarV1Header,
    v2_header: Option<CarV2Header>,
    data_offset: u64,
    data_size: u64,
    index: Index,
}

impl CarReadOnly {
    #[tracing::instrument(level = "debug")]
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let v2_header = read_v2_header(&file)?;
        let (data_offset, data_size) = match &v2_header {
            Some(h) => (h.data_offset, h.data_size),
            None => (0, file_len),
        };
        if data_offset.checked_add(data_size).is_none_or(|end| end > file_len) {
            return Err(io::Error::new(
                InvalidData,
                "CARv2 payload extends past the end of the file",
            ));
        }

        let payload = Slice::new(&file, data_offset, Some(data_size));
        let mut reader = BufReader::with_capacity(1024, positioned_io::Cursor::new(payload));
        let header = read_v1_header(&mut reader, data_size)?;

        let index = match &v2_header {
            Some(h) if h.has_index() => {
                let index_reader = positioned_io::Cursor::new_pos(&file, h.index_offset);
                Index::Sorted(MultihashIndexSorted::read_from(BufReader::new(index_reader))?)
            }
            _ => {
                let scanned = iter::from_fn(|| {
                    read_block_data_location_and_skip(&mut reader, data_offset, data_size)
                        .transpose()
                })
                .collect::<io::Result<HashMap<_, _>>>()?;
                Index::Scanned(scanned)
            }
        };
        debug!(
            version = if v2_header.is_some() { 2 } else { 1 },
            "opened CAR"
        );
        Ok(Self {
            file,
            header,
            v2_header,
            data_offset,
            data_size,
            index,
        })
    }

    pub fn roots(&self) -> &[Cid] {
        &self.header.roots
    }

    /// `1` or `2`, the outer format of the file.
    pub fn version(&self) -> u64 {
        if self.v2_header.is_some() { 2 } else { 1 }
    }

    pub fn v2_header(&self) -> Option<&CarV2Header> {
        self.v2_header.as_ref()
    }

    pub fn v1_header(&self) -> &CarV1Header {
        &self.header
    }

    /// Copies the inner CARv1 payload to `writer`. For a CARv1 file this is
    /// the whole file.
    pub fn write_v1_payload(&self, mut writer: impl io::Write) -> io::Result<u64> {
        let payload = Slice::new(&self.file, self.data_offset, Some(self.data_size));
        io::copy(&mut positioned_io::Cursor::new(payload), &mut writer)
    }

    fn locate(&self, k: &Cid) -> Result<Option<BlockDataLocation>> {
        let index = match &self.index {
            Index::Scanned(index) => return Ok(index.get(k).copied()),
            Index::Sorted(index) => index,
        };
        // checked on open
        let payload_end = self.data_offset + self.data_size;
        for frame_offset in index.offsets(k) {
            let frame_start = self
                .data_offset
                .checked_add(frame_offset)
                .filter(|start| *start < payload_end)
                .ok_or_else(|| {
                    MarketError::Format(format!(
                        "CAR index points past the payload at offset {frame_offset}"
                    ))
                })?;
            let mut cursor = positioned_io::Cursor::new_pos(&self.file, frame_start);
            match read_block_data_location_and_skip(&mut cursor, 0, payload_end) {
                Ok(Some((cid, location))) if cid == *k => return Ok(Some(location)),
                Ok(_) => continue,
                Err(e) => return Err(malformed(e)),
            }
        }
        Ok(None)
    }
}

impl Blockstore for CarReadOnly {
    #[tracing::instrument(level = "trace", skip(self))]
    fn get(&self, k: &Cid) -> anyhow::Result<Option<Vec<u8>>> {
        match self.locate(k)? {
            Some(BlockDataLocation { offset, length }) => {
                let mut data = vec![0; usize::try_from(length)?];
                self.file.read_exact_at(offset, &mut data)?;
                Ok(Some(data))
            }
            None => Ok(inline_data(k).map(<[u8]>::to_vec)),
        }
    }

    fn put_keyed(&self, k: &Cid, _block: &[u8]) -> anyhow::Result<()> {
        anyhow::bail!("cannot write block {k} into a read-only CAR")
    }

    fn has(&self, k: &Cid) -> anyhow::Result<bool> {
        Ok(self.locate(k)?.is_some())
    }
}

/// Returns the CARv2 header if the file starts with the CARv2 pragma.
pub(super) fn read_v2_header(file: &impl ReadAt) -> io::Result<Option<CarV2Header>> {
    let mut pragma = [0u8; CAR_V2_PRAGMA.len()];
    match file.read_exact_at(0, &mut pragma) {
        Ok(()) => {}
        Err(e) if e.kind() == UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    if pragma != CAR_V2_PRAGMA {
        return Ok(None);
    }
    let mut header = [0u8; CAR_V2_HEADER_SIZE];
    file.read_exact_at(CAR_V2_PRAGMA.len() as u64, &mut header)?;
    let header = CarV2Header::from_bytes(&header);
    if header.data_offset == 0 {
        return Err(io::Error::new(InvalidData, "CARv2 was never finalized"));
    }
    Ok(Some(header))
}

/// ```text
/// start ►│          reader end ►│
///        ├───────────┬──────────┤
///        │body length│car header│
///        └───────────┴──────────┘
/// ```
///
/// `limit` is the payload size; longer headers are refused before anything is
/// allocated.
pub(super) fn read_v1_header(mut reader: impl Read, limit: u64) -> io::Result<CarV1Header> {
    let header_len =
        read_varint_body_length_or_eof(&mut reader)?.ok_or(io::Error::from(UnexpectedEof))?;
    if u64::from(header_len) > limit {
        return Err(io::Error::new(
            InvalidData,
            format!("CAR header of {header_len} bytes exceeds the {limit} byte payload"),
        ));
    }
    let mut buffer = vec![0; header_len as usize];
    reader.read_exact(&mut buffer)?;
    let header: CarV1Header =
        fvm_ipld_encoding::from_slice(&buffer).map_err(|e| io::Error::new(InvalidData, e))?;
    if header.version != 1 {
        return Err(io::Error::new(
            InvalidData,
            format!("inner CAR header has version {}", header.version),
        ));
    }
    Ok(header)
}

/// Returns ([`Cid`], the `block data offset` and `block data length`), with
/// the offset shifted by `base`. Frames reaching past `end` (in reader
/// positions) are refused.
/// ```text
/// start ►│              reader end ►│
///        ├───────────┬───┬──────────┤
///        │body length│cid│block data│
///        └───────────┴───┼──────────┤
///                        │◄────────►│
///                        │  =block data length
///            block data  │
///                offset ►│
/// ```
fn read_block_data_location_and_skip(
    mut reader: impl Read + Seek,
    base: u64,
    end: u64,
) -> io::Result<Option<(Cid, BlockDataLocation)>> {
    let Some(body_length) = read_varint_body_length_or_eof(&mut reader)? else {
        return Ok(None);
    };
    let frame_body_offset = reader.stream_position()?;
    let next_frame_offset = frame_body_offset
        .checked_add(u64::from(body_length))
        .filter(|next| *next <= end)
        .ok_or_else(|| io::Error::new(InvalidData, "block frame extends past the payload"))?;
    let mut reader = CountRead::new(&mut reader);
    let cid = Cid::read_bytes(&mut reader).map_err(cid_error_to_io_error)?;

    // counting the read bytes saves us a syscall for finding block data offset
    let cid_length = reader.bytes_read() as u64;
    let length = u64::from(body_length)
        .checked_sub(cid_length)
        .and_then(|l| u32::try_from(l).ok())
        .ok_or_else(|| io::Error::new(InvalidData, "block frame shorter than its CID"))?;
    reader
        .into_inner()
        .seek(SeekFrom::Start(next_frame_offset))?;
    Ok(Some((
        cid,
        BlockDataLocation {
            offset: base + frame_body_offset + cid_length,
            length,
        },
    )))
}

fn read_varint_body_length_or_eof(mut reader: impl Read) -> io::Result<Option<u32>> {
    let mut byte = [0u8; 1]; // detect EOF
    match reader.read(&mut byte)? {
        0 => Ok(None),
        _ => (byte.chain(reader)).read_varint().map(Some),
    }
}

/// Damage found while reading an opened file is a format error, anything
/// else stays an IO error.
fn malformed(e: io::Error) -> MarketError {
    match e.kind() {
        InvalidData | UnexpectedEof => MarketError::Format(e.to_string()),
        _ => e.into(),
    }
}

fn cid_error_to_io_error(cid_error: cid::Error) -> io::Error {
    match cid_error {
        cid::Error::Io(io_error) => io_error,
        other => io::Error::new(InvalidData, other),
    }
}

/// A reader that keeps track of how many bytes it has read.
///
/// This is useful for calculating the _block data length_ when the (_varint frame_) _body length_ is known.
struct CountRead<ReadT> {
    inner: ReadT,
    count: usize,
}

impl<ReadT> CountRead<ReadT> {
    fn new(inner: ReadT) -> Self {
        Self { inner, count: 0 }
    }
    fn bytes_read(&self) -> usize {
        self.count
    }
    fn into_inner(self) -> ReadT {
        self.inner
    }
}

impl<ReadT: Read> Read for CountRead<ReadT> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n;
        Ok(n)
    }
}
