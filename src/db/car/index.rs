// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The `car-multihash-index-sorted` index written after the payload of a
//! CARv2.
//!
//! ```text
//! varint(0x0401)
//! i32 number of multihash codes
//! per code (ascending):
//!     u64 multihash code
//!     i32 number of widths
//!     per width (ascending):
//!         u32 width            (= digest length + 8)
//!         i64 bucket length in bytes
//!         [digest | u64 offset] sorted by digest
//! ```
//!
//! All integers are little endian. Offsets point at the start of a block's
//! varint frame, relative to the start of the inner CARv1 payload.
//! See <https://ipld.io/specs/transport/car/carv2/#format-0x0401-multihashindexsorted>

use cid::Cid;
use integer_encoding::{VarIntReader as _, VarIntWriter as _};
use std::collections::BTreeMap;
use std::io::{self, ErrorKind::InvalidData, Read, Write};

pub const MULTIHASH_INDEX_SORTED_CODEC: u64 = 0x0401;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultihashIndexSorted {
    // code -> width -> sorted (digest, offset)
    buckets: BTreeMap<u64, BTreeMap<u32, Vec<(Vec<u8>, u64)>>>,
}

impl MultihashIndexSorted {
    pub fn from_records(records: impl IntoIterator<Item = (Cid, u64)>) -> Self {
        let mut buckets: BTreeMap<u64, BTreeMap<u32, Vec<(Vec<u8>, u64)>>> = BTreeMap::new();
        for (cid, offset) in records {
            let digest = cid.hash().digest();
            let width = digest.len() as u32 + 8;
            buckets
                .entry(cid.hash().code())
                .or_default()
                .entry(width)
                .or_default()
                .push((digest.to_vec(), offset));
        }
        for entries in buckets.values_mut().flat_map(|widths| widths.values_mut()) {
            entries.sort();
            entries.dedup();
        }
        Self { buckets }
    }

    pub fn len(&self) -> usize {
        self.buckets
            .values()
            .flat_map(|widths| widths.values())
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offsets of every frame whose CID carries the multihash of `cid`,
    /// relative to the payload start. CIDs that differ only in their codec
    /// share a digest, so callers must check the CID found at each offset.
    pub fn offsets<'a>(&'a self, cid: &Cid) -> impl Iterator<Item = u64> + use<'a> {
        let digest = cid.hash().digest();
        let entries = self
            .buckets
            .get(&cid.hash().code())
            .and_then(|widths| widths.get(&(digest.len() as u32 + 8)))
            .map_or(&[][..], Vec::as_slice);
        let start = entries.partition_point(|(d, _)| d.as_slice() < digest);
        let len = entries[start..].partition_point(|(d, _)| d.as_slice() == digest);
        entries[start..start + len].iter().map(|(_, offset)| *offset)
    }

    pub fn write_to(&self, mut w: impl Write) -> io::Result<()> {
        w.write_varint(MULTIHASH_INDEX_SORTED_CODEC)?;
        w.write_all(&(self.buckets.len() as i32).to_le_bytes())?;
        for (code, widths) in &self.buckets {
            w.write_all(&code.to_le_bytes())?;
            w.write_all(&(widths.len() as i32).to_le_bytes())?;
            for (width, entries) in widths {
                w.write_all(&width.to_le_bytes())?;
                w.write_all(&((entries.len() as i64) * i64::from(*width)).to_le_bytes())?;
                for (digest, offset) in entries {
                    w.write_all(digest)?;
                    w.write_all(&offset.to_le_bytes())?;
                }
            }
        }
        Ok(())
    }

    pub fn read_from(mut r: impl Read) -> io::Result<Self> {
        let codec: u64 = r.read_varint()?;
        if codec != MULTIHASH_INDEX_SORTED_CODEC {
            return Err(io::Error::new(
                InvalidData,
                format!("unsupported CAR index codec {codec:#x}"),
            ));
        }
        let mut buckets = BTreeMap::new();
        for _ in 0..read_count(&mut r)? {
            let code = u64::from_le_bytes(read_array(&mut r)?);
            let mut widths = BTreeMap::new();
            for _ in 0..read_count(&mut r)? {
                let width = u32::from_le_bytes(read_array(&mut r)?);
                let bucket_len = i64::from_le_bytes(read_array(&mut r)?);
                if width <= 8 || bucket_len < 0 || bucket_len % i64::from(width) != 0 {
                    return Err(io::Error::new(InvalidData, "malformed CAR index bucket"));
                }
                let digest_len = width as usize - 8;
                let count = bucket_len / i64::from(width);
                let mut entries = Vec::new();
                for _ in 0..count {
                    let mut digest = vec![0; digest_len];
                    r.read_exact(&mut digest)?;
                    entries.push((digest, u64::from_le_bytes(read_array(&mut r)?)));
                }
                widths.insert(width, entries);
            }
            buckets.insert(code, widths);
        }
        Ok(Self { buckets })
    }
}

fn read_count(r: &mut impl Read) -> io::Result<u32> {
    let count = i32::from_le_bytes(read_array(r)?);
    u32::try_from(count).map_err(|_| io::Error::new(InvalidData, "negative CAR index count"))
}

fn read_array<const N: usize>(r: &mut impl Read) -> io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::multihash::prelude::*;
    use pretty_assertions::assert_eq;
    use quickcheck_macros::quickcheck;

    fn cid_of(data: &[u8], code: MultihashCode) -> Cid {
        Cid::new_v1(fvm_ipld_encoding::IPLD_RAW, code.digest(data))
    }

    #[quickcheck]
    fn lookups_after_reload(blocks: Vec<(Vec<u8>, u32, bool)>) {
        let records: Vec<(Cid, u64)> = blocks
            .iter()
            .map(|(data, offset, sha)| {
                let code = if *sha {
                    MultihashCode::Sha2_256
                } else {
                    MultihashCode::Blake2b256
                };
                (cid_of(data, code), u64::from(*offset))
            })
            .collect();
        let index = MultihashIndexSorted::from_records(records.clone());
        let mut bytes = vec![];
        index.write_to(&mut bytes).unwrap();
        let reloaded = MultihashIndexSorted::read_from(bytes.as_slice()).unwrap();
        assert_eq!(reloaded, index);
        for (cid, offset) in records {
            assert!(reloaded.offsets(&cid).any(|o| o == offset));
        }
    }

    #[test]
    fn shared_digests_keep_every_offset() {
        let raw = cid_of(b"same bytes", MultihashCode::Sha2_256);
        let cbor = Cid::new_v1(fvm_ipld_encoding::DAG_CBOR, *raw.hash());
        let index = MultihashIndexSorted::from_records([(raw, 10), (cbor, 90), (raw, 10)]);
        assert_eq!(index.len(), 2);
        assert_eq!(index.offsets(&raw).collect::<Vec<_>>(), vec![10, 90]);
        assert_eq!(index.offsets(&cbor).collect::<Vec<_>>(), vec![10, 90]);
        let other = cid_of(b"other bytes", MultihashCode::Sha2_256);
        assert_eq!(index.offsets(&other).count(), 0);
    }

    #[test]
    fn layout_of_a_single_entry() {
        let cid = cid_of(b"hello", MultihashCode::Sha2_256);
        let index = MultihashIndexSorted::from_records([(cid, 42)]);
        let mut bytes = vec![];
        index.write_to(&mut bytes).unwrap();

        let mut expected = vec![0x81, 0x08];
        expected.extend(1i32.to_le_bytes());
        expected.extend(0x12u64.to_le_bytes());
        expected.extend(1i32.to_le_bytes());
        expected.extend(40u32.to_le_bytes());
        expected.extend(40i64.to_le_bytes());
        expected.extend(cid.hash().digest());
        expected.extend(42u64.to_le_bytes());
        assert_eq!(bytes, expected);
    }

    #[test]
    fn unknown_codec_is_rejected() {
        let mut bytes = vec![];
        bytes.write_varint(0x0400u64).unwrap();
        assert!(MultihashIndexSorted::read_from(bytes.as_slice()).is_err());
    }
}
