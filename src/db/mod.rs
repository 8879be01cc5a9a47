// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

pub mod accessor;
pub mod car;
mod memory;

pub use memory::MemoryDB;

use crate::error::MarketError;
use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use tokio_util::sync::CancellationToken;

/// Fails every access with [`MarketError::Cancelled`] once `cancel` fires,
/// so DAG builds and walks over it stop at their next block.
pub struct Cancellable<'a, BS> {
    inner: &'a BS,
    cancel: &'a CancellationToken,
}

impl<'a, BS> Cancellable<'a, BS> {
    pub fn new(inner: &'a BS, cancel: &'a CancellationToken) -> Self {
        Self { inner, cancel }
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.cancel.is_cancelled() {
            return Err(MarketError::Cancelled.into());
        }
        Ok(())
    }
}

impl<BS: Blockstore> Blockstore for Cancellable<'_, BS> {
    fn get(&self, k: &Cid) -> anyhow::Result<Option<Vec<u8>>> {
        self.check()?;
        self.inner.get(k)
    }

    fn put_keyed(&self, k: &Cid, block: &[u8]) -> anyhow::Result<()> {
        self.check()?;
        self.inner.put_keyed(k, block)
    }

    fn has(&self, k: &Cid) -> anyhow::Result<bool> {
        self.check()?;
        self.inner.has(k)
    }
}
