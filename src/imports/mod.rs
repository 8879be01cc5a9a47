// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Registry of staged imports.
//!
//! Every import is a root [`Cid`] plus the archive holding its DAG. Archives
//! allocated through [`ImportManager::allocate_car`] belong to the registry
//! and are deleted with the import; archives supplied by the caller are only
//! referenced.

use crate::error::{MarketError, Result};
use cid::Cid;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Where the import came from: `import` for files, `car` for archives
/// supplied directly.
pub const LABEL_SOURCE: &str = "source";
pub const LABEL_FILE_NAME: &str = "filename";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct ImportId(pub u64);

impl fmt::Display for ImportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CarOwnership {
    /// Allocated by the registry, deleted on removal.
    Managed,
    /// Supplied by the caller, left in place on removal.
    External,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Import {
    pub id: ImportId,
    pub root: Option<Cid>,
    pub car_path: Option<PathBuf>,
    pub ownership: Option<CarOwnership>,
    pub labels: BTreeMap<String, String>,
}

impl Import {
    fn new(id: ImportId) -> Self {
        Self {
            id,
            root: None,
            car_path: None,
            ownership: None,
            labels: BTreeMap::new(),
        }
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

#[derive(Debug, Default)]
struct ImportTable {
    next_id: u64,
    imports: BTreeMap<ImportId, Import>,
}

/// Lock-guarded import table. Archives it allocates live under
/// `imports_dir`.
#[derive(Debug)]
pub struct ImportManager {
    imports_dir: PathBuf,
    table: Mutex<ImportTable>,
}

impl ImportManager {
    pub fn new(imports_dir: impl Into<PathBuf>) -> Result<Self> {
        let imports_dir = imports_dir.into();
        std::fs::create_dir_all(&imports_dir)?;
        Ok(Self {
            imports_dir,
            table: Mutex::new(ImportTable {
                next_id: 1,
                imports: BTreeMap::new(),
            }),
        })
    }

    pub fn imports_dir(&self) -> &Path {
        &self.imports_dir
    }

    pub fn create_import(&self) -> ImportId {
        let mut table = self.table.lock();
        let id = ImportId(table.next_id);
        table.next_id += 1;
        table.imports.insert(id, Import::new(id));
        debug!(%id, "created import");
        id
    }

    /// Reserves a fresh archive path for `id`. The file itself is created by
    /// the caller.
    pub fn allocate_car(&self, id: ImportId) -> Result<PathBuf> {
        let path = self.imports_dir.join(format!("import-{id}.car"));
        self.update(id, |import| {
            import.car_path = Some(path.clone());
            import.ownership = Some(CarOwnership::Managed);
        })?;
        Ok(path)
    }

    /// Points `id` at an archive the registry does not own.
    pub fn set_external_car(&self, id: ImportId, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        self.update(id, |import| {
            import.car_path = Some(path);
            import.ownership = Some(CarOwnership::External);
        })
    }

    pub fn set_root(&self, id: ImportId, root: Cid) -> Result<()> {
        self.update(id, |import| import.root = Some(root))
    }

    pub fn add_label(
        &self,
        id: ImportId,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<()> {
        let (key, value) = (key.into(), value.into());
        self.update(id, |import| {
            import.labels.insert(key, value);
        })
    }

    pub fn label(&self, id: ImportId, key: &str) -> Result<Option<String>> {
        Ok(self.info(id)?.label(key).map(str::to_owned))
    }

    pub fn info(&self, id: ImportId) -> Result<Import> {
        self.table
            .lock()
            .imports
            .get(&id)
            .cloned()
            .ok_or_else(|| import_not_found(id))
    }

    pub fn list(&self) -> Vec<Import> {
        self.table.lock().imports.values().cloned().collect()
    }

    /// Imports whose DAG is rooted at `root`, oldest first.
    pub fn find_by_root(&self, root: &Cid) -> Vec<Import> {
        self.table
            .lock()
            .imports
            .values()
            .filter(|i| i.root.as_ref() == Some(root))
            .cloned()
            .collect()
    }

    /// Drops the record and, when the registry owns it, its archive.
    pub fn remove(&self, id: ImportId) -> Result<()> {
        let import = self
            .table
            .lock()
            .imports
            .remove(&id)
            .ok_or_else(|| import_not_found(id))?;
        if let (Some(path), Some(CarOwnership::Managed)) = (&import.car_path, import.ownership) {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                // the import failed before anything was written
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!(%id, path = %path.display(), "managed archive already gone");
                }
                Err(e) => return Err(e.into()),
            }
        }
        debug!(%id, "removed import");
        Ok(())
    }

    fn update(&self, id: ImportId, f: impl FnOnce(&mut Import)) -> Result<()> {
        let mut table = self.table.lock();
        let import = table
            .imports
            .get_mut(&id)
            .ok_or_else(|| import_not_found(id))?;
        f(import);
        Ok(())
    }
}

fn import_not_found(id: ImportId) -> MarketError {
    MarketError::NotFound(format!("import {id}"))
}
