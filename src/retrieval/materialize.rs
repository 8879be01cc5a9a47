// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::db::Cancellable;
use crate::db::accessor::RetrievalBlockstoreAccessor;
use crate::db::car::CarReadOnly;
use crate::error::{MarketError, Result};
use crate::imports::ImportManager;
use crate::ipld::write_dag_car_v1;
use crate::market::RetrievalDealId;
use crate::unixfs::export_to_path;
use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Where the blocks of a payload are read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRef {
    pub root: Cid,
    /// Read the archive of a local import rather than retrieved blocks.
    pub from_local: bool,
    /// Retrieval that fetched the blocks.
    pub deal_id: Option<RetrievalDealId>,
}

/// Destination of an export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRef {
    pub path: PathBuf,
    /// Write a CARv1 of the DAG instead of the UnixFS content.
    pub is_car: bool,
}

/// Writes stored DAGs out to the filesystem.
pub struct Materializer {
    imports: Arc<ImportManager>,
    retrievals: Arc<RetrievalBlockstoreAccessor>,
}

impl Materializer {
    pub fn new(imports: Arc<ImportManager>, retrievals: Arc<RetrievalBlockstoreAccessor>) -> Self {
        Self {
            imports,
            retrievals,
        }
    }

    /// Writes the DAG under `export.root` to `file`. Output this call
    /// created is removed again if the export fails or `cancel` fires.
    #[tracing::instrument(level = "debug", skip(self, cancel))]
    pub fn export(
        &self,
        export: &ExportRef,
        file: &FileRef,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let existed = file.path.exists();
        let result = self.write(export, file, cancel);
        if result.is_err() && !existed {
            remove_partial_output(&file.path);
        }
        result
    }

    fn write(
        &self,
        export: &ExportRef,
        file: &FileRef,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let archive = match (export.from_local, export.deal_id) {
            (false, Some(deal)) => self.retrievals.path_for(deal),
            _ => self.local_archive(&export.root),
        };
        match archive {
            Some(path) => {
                let car = CarReadOnly::open(&path)?;
                write_out(&Cancellable::new(&car, cancel), &export.root, file)
            }
            None => self.write_from_shared(&export.root, file, cancel),
        }
    }

    fn local_archive(&self, root: &Cid) -> Option<PathBuf> {
        self.imports
            .find_by_root(root)
            .into_iter()
            .find_map(|import| import.car_path)
    }

    fn write_from_shared(
        &self,
        root: &Cid,
        file: &FileRef,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let store = self
            .retrievals
            .shared_store()
            .ok_or_else(|| MarketError::NotFound(format!("local copy of {root}")))?;
        write_out(&Cancellable::new(store.as_ref(), cancel), root, file)
    }
}

fn remove_partial_output(path: &std::path::Path) {
    let removed = match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(_) => return,
    };
    if let Err(e) = removed {
        warn!(path = %path.display(), "failed to remove partial export: {e}");
    }
}

fn write_out(store: &impl Blockstore, root: &Cid, file: &FileRef) -> Result<()> {
    if file.is_car {
        let out = BufWriter::new(std::fs::File::create(&file.path)?);
        let written = write_dag_car_v1(store, root, out)?;
        info!(%root, path = %file.path.display(), written, "exported CAR");
    } else {
        export_to_path(store, root, &file.path)?;
        info!(%root, path = %file.path.display(), "exported UnixFS");
    }
    Ok(())
}
