// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use ahash::HashMap;
use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use parking_lot::RwLock;

/// In-memory blockstore, shared between the retrieval client and the
/// materializer when retrievals land in a common store.
#[derive(Debug, Default)]
pub struct MemoryDB {
    blocks: RwLock<HashMap<Cid, Vec<u8>>>,
}

impl MemoryDB {
    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }
}

impl Blockstore for MemoryDB {
    fn get(&self, k: &Cid) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.blocks.read().get(k).cloned())
    }

    fn put_keyed(&self, k: &Cid, block: &[u8]) -> anyhow::Result<()> {
        self.blocks.write().insert(*k, block.to_vec());
        Ok(())
    }

    fn has(&self, k: &Cid) -> anyhow::Result<bool> {
        Ok(self.blocks.read().contains_key(k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::multihash::prelude::*;
    use fvm_ipld_encoding::IPLD_RAW;

    #[test]
    fn put_then_get() {
        let db = MemoryDB::default();
        assert!(db.is_empty());
        let cid = Cid::new_v1(IPLD_RAW, MultihashCode::Sha2_256.digest(b"block"));
        db.put_keyed(&cid, b"block").unwrap();
        db.put_keyed(&cid, b"block").unwrap();
        assert_eq!(db.len(), 1);
        assert_eq!(db.get(&cid).unwrap().as_deref(), Some(&b"block"[..]));
    }
}
