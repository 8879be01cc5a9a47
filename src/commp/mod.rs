// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Unsealed piece commitment (`CommP`) of arbitrary payload bytes.
//!
//! The payload is zero-extended to the next `127 * 2^n` bytes, every 127 bytes
//! are `fr32` padded into 128 bytes (two zero bits after each 254 bits), and
//! the result is merkleized with SHA-256 whose output is truncated to 254 bits.

use crate::error::{MarketError, Result};
use cid::Cid;
pub use fvm_shared4::piece::{PaddedPieceSize, PieceInfo, UnpaddedPieceSize};
use sha2::{Digest as _, Sha256};
use std::io::{self, Read, Write};

const FR32_UNPADDED: usize = 127;
const FR32_PADDED: usize = 128;
const NODE_SIZE: usize = 32;

type Node = [u8; NODE_SIZE];

/// Piece commitment of a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommPRet {
    pub root: Cid,
    /// Size of the payload once zero-extended, before `fr32` padding.
    pub size: UnpaddedPieceSize,
}

impl CommPRet {
    pub fn piece_info(&self) -> PieceInfo {
        PieceInfo {
            size: self.size.padded(),
            cid: self.root,
        }
    }
}

/// Smallest valid unpadded piece size that holds `len` payload bytes.
pub fn unpadded_piece_size(len: u64) -> UnpaddedPieceSize {
    if len <= FR32_UNPADDED as u64 {
        return UnpaddedPieceSize(FR32_UNPADDED as u64);
    }
    let padded = len.div_ceil(FR32_UNPADDED as u64) * FR32_PADDED as u64;
    let padded = padded.next_power_of_two();
    PaddedPieceSize(padded).unpadded()
}

/// Computes the piece commitment of everything `reader` yields.
pub fn calc_comm_p(mut reader: impl Read) -> Result<CommPRet> {
    let mut writer = CommPWriter::default();
    io::copy(&mut reader, &mut writer)?;
    writer.finish()
}

/// Streaming [`CommPRet`] calculator. Bytes written are treated as the
/// payload; [`CommPWriter::finish`] pads and closes the tree.
#[derive(Default)]
pub struct CommPWriter {
    buffer: Vec<u8>,
    len: u64,
    tree: TreeBuilder,
}

impl CommPWriter {
    pub fn payload_len(&self) -> u64 {
        self.len
    }

    fn push_chunk(&mut self, chunk: &[u8; FR32_UNPADDED]) {
        let mut padded = [0u8; FR32_PADDED];
        fr32_pad(chunk, &mut padded);
        for leaf in padded.chunks_exact(NODE_SIZE) {
            let mut node = [0u8; NODE_SIZE];
            node.copy_from_slice(leaf);
            self.tree.push(node);
        }
    }

    pub fn finish(mut self) -> Result<CommPRet> {
        let size = unpadded_piece_size(self.len);
        if !self.buffer.is_empty() {
            let mut last = [0u8; FR32_UNPADDED];
            last[..self.buffer.len()].copy_from_slice(&self.buffer);
            self.push_chunk(&last);
        }
        let height = size.padded().0.trailing_zeros() - NODE_SIZE.trailing_zeros();
        let comm = self.tree.finish(height as usize);
        let root = fvm_shared4::commcid::data_commitment_v1_to_cid(&comm)
            .map_err(|e| MarketError::Other(anyhow::anyhow!(e)))?;
        Ok(CommPRet { root, size })
    }
}

impl Write for CommPWriter {
    fn write(&mut self, mut buf: &[u8]) -> io::Result<usize> {
        let n = buf.len();
        self.len += n as u64;
        if !self.buffer.is_empty() {
            let take = (FR32_UNPADDED - self.buffer.len()).min(buf.len());
            self.buffer.extend_from_slice(&buf[..take]);
            buf = &buf[take..];
            if self.buffer.len() < FR32_UNPADDED {
                return Ok(n);
            }
            let mut chunk = [0u8; FR32_UNPADDED];
            chunk.copy_from_slice(&self.buffer);
            self.buffer.clear();
            self.push_chunk(&chunk);
        }
        let mut chunks = buf.chunks_exact(FR32_UNPADDED);
        for chunk in &mut chunks {
            let mut owned = [0u8; FR32_UNPADDED];
            owned.copy_from_slice(chunk);
            self.push_chunk(&owned);
        }
        self.buffer.extend_from_slice(chunks.remainder());
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Binary merkle tree fed left to right. `levels[h]` holds a complete
/// subtree of height `h` that is still waiting for its right sibling.
#[derive(Default)]
struct TreeBuilder {
    levels: Vec<Option<Node>>,
}

impl TreeBuilder {
    fn push(&mut self, leaf: Node) {
        let mut node = leaf;
        for slot in self.levels.iter_mut() {
            match slot.take() {
                Some(left) => node = hash_pair(&left, &node),
                None => {
                    *slot = Some(node);
                    return;
                }
            }
        }
        self.levels.push(Some(node));
    }

    /// Closes the tree at `height`, filling missing right subtrees with
    /// zeros.
    fn finish(self, height: usize) -> Node {
        let mut zero = [0u8; NODE_SIZE];
        let mut carry: Option<Node> = None;
        for h in 0..height {
            let pending = self.levels.get(h).copied().flatten();
            carry = match (pending, carry) {
                (Some(left), Some(right)) => Some(hash_pair(&left, &right)),
                (Some(left), None) | (None, Some(left)) => Some(hash_pair(&left, &zero)),
                (None, None) => None,
            };
            zero = hash_pair(&zero, &zero);
        }
        carry
            .or_else(|| self.levels.get(height).copied().flatten())
            .unwrap_or(zero)
    }
}

fn hash_pair(left: &Node, right: &Node) -> Node {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    let mut out = [0u8; NODE_SIZE];
    out.copy_from_slice(&hasher.finalize());
    out[NODE_SIZE - 1] &= 0b0011_1111;
    out
}

/// Spreads 127 bytes over four 254-bit field elements.
fn fr32_pad(input: &[u8; FR32_UNPADDED], out: &mut [u8; FR32_PADDED]) {
    out[..31].copy_from_slice(&input[..31]);
    out[31] = input[31] & 0x3f;

    let mut t = input[31] >> 6;
    for i in 32..64 {
        out[i] = (input[i] << 2) | t;
        t = input[i] >> 6;
    }
    out[63] &= 0x3f;

    t = input[63] >> 4;
    for i in 64..96 {
        out[i] = (input[i] << 4) | t;
        t = input[i] >> 4;
    }
    out[95] &= 0x3f;

    t = input[95] >> 2;
    for i in 96..FR32_UNPADDED {
        out[i] = (input[i] << 6) | t;
        t = input[i] >> 2;
    }
    out[127] = t & 0x3f;
}
