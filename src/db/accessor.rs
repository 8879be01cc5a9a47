// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Resolves which blockstore holds the blocks of a deal.
//!
//! Storage deals read from the archive of the matching import, or from the
//! shared store. Retrievals write into a private CARv2 per deal, or into the
//! shared store.

use super::MemoryDB;
use super::car::{CarReadOnly, CarV2ReadWrite};
use crate::error::{MarketError, Result};
use crate::imports::ImportManager;
use crate::market::RetrievalDealId;
use crate::utils::db::car_format::verify_block;
use ahash::{HashMap, HashMapExt as _};
use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// A read handle on the blocks of one root.
#[derive(Clone)]
pub enum SharedStore {
    Car(Arc<CarReadOnly>),
    Memory(Arc<MemoryDB>),
}

impl Blockstore for SharedStore {
    fn get(&self, k: &Cid) -> anyhow::Result<Option<Vec<u8>>> {
        match self {
            Self::Car(car) => car.get(k),
            Self::Memory(db) => db.get(k),
        }
    }

    fn put_keyed(&self, k: &Cid, block: &[u8]) -> anyhow::Result<()> {
        match self {
            Self::Car(car) => car.put_keyed(k, block),
            Self::Memory(db) => db.put_keyed(k, block),
        }
    }

    fn has(&self, k: &Cid) -> anyhow::Result<bool> {
        match self {
            Self::Car(car) => car.has(k),
            Self::Memory(db) => db.has(k),
        }
    }
}

struct OpenCar {
    car: Arc<CarReadOnly>,
    leases: usize,
}

type OpenCars = Arc<Mutex<HashMap<Cid, OpenCar>>>;

enum StorageSource {
    Imports(Arc<ImportManager>),
    Shared(Arc<MemoryDB>),
}

/// Hands out the blockstore backing a storage deal's payload.
///
/// An import archive is opened at most once per root however many leases are
/// outstanding, and closed when the last [`StorageLease`] is dropped.
pub struct StorageBlockstoreAccessor {
    source: StorageSource,
    open: OpenCars,
}

impl StorageBlockstoreAccessor {
    pub fn imports(imports: Arc<ImportManager>) -> Self {
        Self {
            source: StorageSource::Imports(imports),
            open: Default::default(),
        }
    }

    pub fn shared(store: Arc<MemoryDB>) -> Self {
        Self {
            source: StorageSource::Shared(store),
            open: Default::default(),
        }
    }

    pub fn acquire(&self, root: &Cid) -> Result<StorageLease> {
        let imports = match &self.source {
            StorageSource::Shared(db) => {
                return Ok(StorageLease {
                    root: *root,
                    store: SharedStore::Memory(db.clone()),
                    open: None,
                });
            }
            StorageSource::Imports(imports) => imports,
        };

        let mut open = self.open.lock();
        if let Some(entry) = open.get_mut(root) {
            entry.leases += 1;
            return Ok(StorageLease {
                root: *root,
                store: SharedStore::Car(entry.car.clone()),
                open: Some(self.open.clone()),
            });
        }

        let path = imports
            .find_by_root(root)
            .into_iter()
            .find_map(|import| import.car_path)
            .ok_or_else(|| MarketError::NotFound(format!("no import with root {root}")))?;
        let car = Arc::new(CarReadOnly::open(&path)?);
        debug!(%root, path = %path.display(), "opened import archive");
        open.insert(
            *root,
            OpenCar {
                car: car.clone(),
                leases: 1,
            },
        );
        Ok(StorageLease {
            root: *root,
            store: SharedStore::Car(car),
            open: Some(self.open.clone()),
        })
    }

    /// Number of import archives currently held open.
    pub fn open_archives(&self) -> usize {
        self.open.lock().len()
    }
}

/// Scoped use of a storage deal's blockstore.
pub struct StorageLease {
    root: Cid,
    store: SharedStore,
    open: Option<OpenCars>,
}

impl StorageLease {
    pub fn root(&self) -> &Cid {
        &self.root
    }
}

impl Blockstore for StorageLease {
    fn get(&self, k: &Cid) -> anyhow::Result<Option<Vec<u8>>> {
        self.store.get(k)
    }

    fn put_keyed(&self, k: &Cid, block: &[u8]) -> anyhow::Result<()> {
        self.store.put_keyed(k, block)
    }

    fn has(&self, k: &Cid) -> anyhow::Result<bool> {
        self.store.has(k)
    }
}

impl Drop for StorageLease {
    fn drop(&mut self) {
        let Some(open) = &self.open else { return };
        let mut open = open.lock();
        if let Some(entry) = open.get_mut(&self.root) {
            entry.leases -= 1;
            if entry.leases == 0 {
                open.remove(&self.root);
                debug!(root = %self.root, "closed import archive");
            }
        }
    }
}

/// Where retrieved blocks land.
pub enum RetrievalBlockstoreAccessor {
    /// One CARv2 per deal under `root_dir`, finalized by
    /// [`RetrievalBlockstoreAccessor::done`].
    Car {
        root_dir: PathBuf,
        open: Mutex<HashMap<RetrievalDealId, Arc<CarV2ReadWrite>>>,
    },
    Shared(Arc<MemoryDB>),
}

/// Write handle for one retrieval.
#[derive(Clone)]
pub enum RetrievalStore {
    Car(Arc<CarV2ReadWrite>),
    Memory(Arc<MemoryDB>),
}

impl Blockstore for RetrievalStore {
    fn get(&self, k: &Cid) -> anyhow::Result<Option<Vec<u8>>> {
        match self {
            Self::Car(car) => car.get(k),
            Self::Memory(db) => db.get(k),
        }
    }

    /// Blocks come from a provider, so they are checked against their CID
    /// before being stored.
    fn put_keyed(&self, k: &Cid, block: &[u8]) -> anyhow::Result<()> {
        verify_block(k, block).map_err(|e| MarketError::Integrity(e.to_string()))?;
        match self {
            Self::Car(car) => car.put_keyed(k, block),
            Self::Memory(db) => db.put_keyed(k, block),
        }
    }

    fn has(&self, k: &Cid) -> anyhow::Result<bool> {
        match self {
            Self::Car(car) => car.has(k),
            Self::Memory(db) => db.has(k),
        }
    }
}

impl RetrievalBlockstoreAccessor {
    pub fn car(root_dir: impl Into<PathBuf>) -> Result<Self> {
        let root_dir = root_dir.into();
        std::fs::create_dir_all(&root_dir)?;
        Ok(Self::Car {
            root_dir,
            open: Mutex::new(HashMap::new()),
        })
    }

    pub fn shared(store: Arc<MemoryDB>) -> Self {
        Self::Shared(store)
    }

    /// Archive path of `deal`, for the CAR variant.
    pub fn path_for(&self, deal: RetrievalDealId) -> Option<PathBuf> {
        match self {
            Self::Car { root_dir, .. } => Some(car_path(root_dir, deal)),
            Self::Shared(_) => None,
        }
    }

    pub fn shared_store(&self) -> Option<&Arc<MemoryDB>> {
        match self {
            Self::Car { .. } => None,
            Self::Shared(db) => Some(db),
        }
    }

    /// Store for `deal`, creating its archive rooted at `payload` on first
    /// use.
    pub fn get(&self, deal: RetrievalDealId, payload: Cid) -> Result<RetrievalStore> {
        match self {
            Self::Shared(db) => Ok(RetrievalStore::Memory(db.clone())),
            Self::Car { root_dir, open } => {
                let mut open = open.lock();
                if let Some(car) = open.get(&deal) {
                    return Ok(RetrievalStore::Car(car.clone()));
                }
                let car = Arc::new(CarV2ReadWrite::create(
                    &car_path(root_dir, deal),
                    nunny::vec![payload],
                )?);
                open.insert(deal, car.clone());
                Ok(RetrievalStore::Car(car))
            }
        }
    }

    /// Finalizes the archive of `deal`. Every [`RetrievalStore`] for it must
    /// have been dropped.
    pub fn done(&self, deal: RetrievalDealId) -> Result<()> {
        let Self::Car { open, .. } = self else {
            return Ok(());
        };
        let Some(car) = open.lock().remove(&deal) else {
            return Ok(());
        };
        let car = Arc::try_unwrap(car).map_err(|car| {
            open.lock().insert(deal, car);
            MarketError::Other(anyhow::anyhow!(
                "retrieval archive of deal {deal} is still in use"
            ))
        })?;
        car.finalize()?;
        Ok(())
    }

    /// Forgets the archive of a failed `deal` and deletes the partial file.
    pub fn discard(&self, deal: RetrievalDealId) {
        let Self::Car { root_dir, open } = self else {
            return;
        };
        drop(open.lock().remove(&deal));
        let path = car_path(root_dir, deal);
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(%deal, "discarded partial retrieval archive"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(%deal, path = %path.display(), "failed to remove retrieval archive: {e}")
            }
        }
    }

    /// Number of retrieval archives still being written.
    pub fn open_archives(&self) -> usize {
        match self {
            Self::Car { open, .. } => open.lock().len(),
            Self::Shared(_) => 0,
        }
    }
}

fn car_path(root_dir: &Path, deal: RetrievalDealId) -> PathBuf {
    root_dir.join(format!("{deal}.car"))
}
