// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::utils::multihash::{MAX_DIGEST_SIZE, prelude::*};
use cid::Cid;
use fvm_ipld_encoding::Error;

/// Extension methods for constructing `dag-cbor` [Cid]
pub trait CidCborExt {
    /// Default CID builder for Filecoin
    ///
    /// - The default codec is [`fvm_ipld_encoding::DAG_CBOR`]
    /// - The default hash function is 256 bit BLAKE2b
    ///
    /// This matches [`abi.CidBuilder`](https://github.com/filecoin-project/go-state-types/blob/master/abi/cid.go#L49) in go
    fn from_cbor_blake2b256<S: serde::ser::Serialize>(obj: &S) -> Result<Cid, Error> {
        let bytes = fvm_ipld_encoding::to_vec(obj)?;
        Ok(Cid::new_v1(
            fvm_ipld_encoding::DAG_CBOR,
            MultihashCode::Blake2b256.digest(&bytes),
        ))
    }
}

impl CidCborExt for Cid {}

/// Largest payload that is inlined into its own CID by [`InlineCidBuilder`].
///
/// Same as the `--inline-limit` default of `ipfs add`. Must not exceed
/// [`MAX_DIGEST_SIZE`] since the identity digest has to fit a [`Cid`].
pub const DEFAULT_INLINE_LIMIT: usize = 32;

/// CIDv1 builder that stores blocks of at most `inline_limit` bytes inside
/// their CID using the identity hash, and hashes everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InlineCidBuilder {
    pub hash: MultihashCode,
    pub inline_limit: usize,
}

impl Default for InlineCidBuilder {
    fn default() -> Self {
        Self {
            hash: MultihashCode::Blake2b256,
            inline_limit: DEFAULT_INLINE_LIMIT,
        }
    }
}

impl InlineCidBuilder {
    pub fn new(hash: MultihashCode, inline_limit: usize) -> Self {
        Self {
            hash,
            inline_limit: inline_limit.min(MAX_DIGEST_SIZE),
        }
    }

    pub fn cid(&self, codec: u64, data: &[u8]) -> Cid {
        if data.len() <= self.inline_limit {
            Cid::new_v1(codec, MultihashCode::Identity.digest(data))
        } else {
            Cid::new_v1(codec, self.hash.digest(data))
        }
    }

    /// Size of the smallest buffer that is guaranteed to be hashed rather
    /// than inlined.
    pub fn hashed_threshold(&self) -> usize {
        self.inline_limit + 1
    }
}

/// `true` if `cid` carries its data inline.
pub fn is_inline(cid: &Cid) -> bool {
    cid.hash().code() == u64::from(MultihashCode::Identity)
}

/// Returns the inlined payload of an identity [`Cid`].
pub fn inline_data(cid: &Cid) -> Option<&[u8]> {
    is_inline(cid).then(|| cid.hash().digest())
}
