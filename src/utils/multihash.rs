// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//!
//! Hash functions understood by the market client. `multihash-codetable`
//! dropped the identity code, which inlined blocks still rely on, so it is
//! back-filled here.
//! See <https://github.com/multiformats/rust-multihash/pull/289>
//!

pub mod prelude {
    pub use super::MultihashCode;
    pub use multihash_codetable::MultihashDigest as _;
}

use multihash_derive::MultihashDigest;

/// Size of the largest digest any [`MultihashCode`] can produce. Identity
/// digests longer than this are not representable.
pub const MAX_DIGEST_SIZE: usize = 64;

#[derive(Clone, Copy, Debug, Eq, MultihashDigest, PartialEq)]
#[mh(alloc_size = 64)]
pub enum MultihashCode {
    #[mh(code = 0x0, hasher = IdentityHasher::<64>)]
    Identity,
    /// SHA-256 (32-byte hash size)
    #[mh(code = 0x12, hasher = multihash_codetable::Sha2_256)]
    Sha2_256,
    /// BLAKE2b-256 (32-byte hash size), the default for UnixFS imports
    #[mh(code = 0xb220, hasher = multihash_codetable::Blake2b256)]
    Blake2b256,
}

impl MultihashCode {
    /// Digest of `data`, refusing identity input too long to be kept whole.
    pub fn checked_digest(&self, data: &[u8]) -> anyhow::Result<cid::multihash::Multihash<MAX_DIGEST_SIZE>> {
        anyhow::ensure!(
            *self != Self::Identity || data.len() <= MAX_DIGEST_SIZE,
            "{} bytes do not fit in an identity digest",
            data.len()
        );
        Ok(self.digest(data))
    }
}

/// Identity hasher with a maximum size.
///
/// Input past `S` bytes cannot be represented. Callers check the length
/// before choosing identity hashing, see [`MultihashCode::checked_digest`].
#[derive(Debug)]
pub struct IdentityHasher<const S: usize> {
    i: usize,
    bytes: [u8; S],
}

impl<const S: usize> Default for IdentityHasher<S> {
    fn default() -> Self {
        Self {
            i: 0,
            bytes: [0u8; S],
        }
    }
}

impl<const S: usize> multihash_derive::Hasher for IdentityHasher<S> {
    fn update(&mut self, input: &[u8]) {
        debug_assert!(
            self.i + input.len() <= S,
            "identity digest overflows {S} bytes"
        );
        let start = self.i.min(self.bytes.len());
        let end = (self.i + input.len()).min(self.bytes.len());
        self.bytes[start..end].copy_from_slice(&input[..end - start]);
        self.i = end;
    }

    fn finalize(&mut self) -> &[u8] {
        &self.bytes[..self.i]
    }

    fn reset(&mut self) {
        self.i = 0
    }
}
