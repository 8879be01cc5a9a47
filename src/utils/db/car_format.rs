// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Fixed parts of the CAR formats: the CARv1 header, block frames and the
//! CARv2 pragma and header.

use crate::utils::multihash::prelude::*;
use cid::Cid;
use fvm_ipld_encoding::to_vec;
use integer_encoding::VarInt;
use nunny::Vec as NonEmpty;
use serde::{Deserialize, Serialize};
use std::io;

/// Every CARv2 file starts with these bytes: a varint frame holding the
/// `dag-cbor` map `{"version": 2}`.
pub const CAR_V2_PRAGMA: [u8; 11] = [
    0x0a, 0xa1, 0x67, 0x76, 0x65, 0x72, 0x73, 0x69, 0x6f, 0x6e, 0x02,
];

pub const CAR_V2_HEADER_SIZE: usize = 40;

/// Offset of the inner CARv1 payload when no padding is requested.
pub const CAR_V2_DEFAULT_DATA_OFFSET: u64 = (CAR_V2_PRAGMA.len() + CAR_V2_HEADER_SIZE) as u64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CarV1Header {
    // The roots array must contain one or more CIDs,
    // each of which should be present somewhere in the remainder of the CAR.
    // See <https://ipld.io/specs/transport/car/carv1/#constraints>
    pub roots: NonEmpty<Cid>,
    pub version: u64,
}

impl CarV1Header {
    pub fn new(roots: NonEmpty<Cid>) -> Self {
        Self { roots, version: 1 }
    }

    /// Header serialized as a varint frame, as found at the start of a CARv1.
    pub fn to_frame(&self) -> io::Result<Vec<u8>> {
        let body = to_vec(self)?;
        let mut frame = body.len().encode_var_vec();
        frame.extend_from_slice(&body);
        Ok(frame)
    }
}

/// <https://ipld.io/specs/transport/car/carv2/#header>
///
/// Offsets are absolute positions in the file. The layout on disk is fixed
/// width little endian, not CBOR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CarV2Header {
    pub characteristics: [u8; 16],
    pub data_offset: u64,
    pub data_size: u64,
    pub index_offset: u64,
}

impl CarV2Header {
    /// Bit set in the first characteristics byte when the index covers every
    /// CID in the payload, including identity CIDs.
    pub const FULLY_INDEXED: u8 = 0b1000_0000;

    pub fn to_bytes(&self) -> [u8; CAR_V2_HEADER_SIZE] {
        let mut out = [0u8; CAR_V2_HEADER_SIZE];
        out[..16].copy_from_slice(&self.characteristics);
        out[16..24].copy_from_slice(&self.data_offset.to_le_bytes());
        out[24..32].copy_from_slice(&self.data_size.to_le_bytes());
        out[32..40].copy_from_slice(&self.index_offset.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; CAR_V2_HEADER_SIZE]) -> Self {
        let u64_at = |at: usize| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(buf)
        };
        let mut characteristics = [0u8; 16];
        characteristics.copy_from_slice(&bytes[..16]);
        Self {
            characteristics,
            data_offset: u64_at(16),
            data_size: u64_at(24),
            index_offset: u64_at(32),
        }
    }

    pub fn is_fully_indexed(&self) -> bool {
        self.characteristics[0] & Self::FULLY_INDEXED != 0
    }

    pub fn has_index(&self) -> bool {
        self.index_offset != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CarBlock {
    pub cid: Cid,
    pub data: Vec<u8>,
}

impl CarBlock {
    // Write a varint frame containing the cid and the data
    pub fn write(&self, writer: &mut impl io::Write) -> io::Result<()> {
        writer.write_all(&self.frame_body_len().encode_var_vec())?;
        self.cid
            .write_bytes(&mut *writer)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        writer.write_all(&self.data)?;
        Ok(())
    }

    fn frame_body_len(&self) -> usize {
        self.cid.encoded_len() + self.data.len()
    }

    /// Length of the whole varint frame [`CarBlock::write`] produces.
    pub fn frame_len(&self) -> usize {
        let body = self.frame_body_len();
        body.required_space() + body
    }
}

/// Fails unless `data` hashes to `cid` with the hash function `cid` names.
pub fn verify_block(cid: &Cid, data: &[u8]) -> anyhow::Result<()> {
    let code = MultihashCode::try_from(cid.hash().code())?;
    let actual = code.checked_digest(data)?;
    anyhow::ensure!(
        actual == *cid.hash(),
        "CID/Block mismatch for block {cid}, actual digest: {}",
        Cid::new_v1(cid.codec(), actual)
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use quickcheck::{Arbitrary, Gen};
    use quickcheck_macros::quickcheck;

    impl Arbitrary for CarBlock {
        fn arbitrary(g: &mut Gen) -> CarBlock {
            let data = Vec::<u8>::arbitrary(g);
            let encoding = g
                .choose(&[fvm_ipld_encoding::DAG_CBOR, fvm_ipld_encoding::IPLD_RAW])
                .unwrap();
            let code = g
                .choose(&[MultihashCode::Blake2b256, MultihashCode::Sha2_256])
                .unwrap();
            let cid = Cid::new_v1(*encoding, code.digest(&data));
            CarBlock { cid, data }
        }
    }

    #[test]
    fn pragma_is_the_version_2_header() {
        #[derive(Serialize)]
        struct Pragma {
            version: u64,
        }
        let body = to_vec(&Pragma { version: 2 }).unwrap();
        let mut frame = body.len().encode_var_vec();
        frame.extend(body);
        assert_eq!(frame, CAR_V2_PRAGMA);
    }

    #[quickcheck]
    fn v2_header_bytes(data_offset: u64, data_size: u64, index_offset: u64) {
        let header = CarV2Header {
            characteristics: [0; 16],
            data_offset,
            data_size,
            index_offset,
        };
        assert_eq!(CarV2Header::from_bytes(&header.to_bytes()), header);
    }

    #[quickcheck]
    fn frame_len_matches_write(block: CarBlock) {
        let mut buf = vec![];
        block.write(&mut buf).unwrap();
        assert_eq!(buf.len(), block.frame_len());
    }

    #[test]
    fn identity_cid_must_hold_the_whole_block() {
        let data = [3u8; 100];
        let cid = Cid::new_v1(
            fvm_ipld_encoding::IPLD_RAW,
            MultihashCode::Identity.digest(&data[..64]),
        );
        assert!(verify_block(&cid, &data[..64]).is_ok());
        assert!(verify_block(&cid, &data).is_err());
    }

    #[quickcheck]
    fn tampered_blocks_fail_verification(block: CarBlock) {
        assert!(verify_block(&block.cid, &block.data).is_ok());
        let mut tampered = block.data.clone();
        tampered.push(0);
        assert!(verify_block(&block.cid, &tampered).is_err());
    }
}
