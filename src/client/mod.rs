// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The market client façade.
//!
//! [`ClientApi::new`] wires every component from its [`ClientDeps`]. Nothing
//! is looked up implicitly: the import registry, both blockstore accessors,
//! the deal starter and the retrieval orchestrator all share the handles
//! built here.

mod deals;
mod import;
mod retrieve;
mod transfers;

pub use deals::{DataCidSize, DealSize};
pub use import::{ImportRes, placeholder_root};

use crate::cli_shared::config::Config;
use crate::db::MemoryDB;
use crate::db::accessor::{RetrievalBlockstoreAccessor, StorageBlockstoreAccessor};
use crate::deal::DealStarter;
use crate::error::Result;
use crate::imports::ImportManager;
use crate::market::api::{
    ChainApi, DataTransfer, DealStreamOpener, RetrievalClient, Signer, StorageDealClient,
};
use crate::retrieval::{Materializer, Orchestrator};
use std::sync::Arc;
use tracing::info;

/// Capabilities and settings the client is built from.
pub struct ClientDeps {
    pub config: Config,
    pub chain: Arc<dyn ChainApi>,
    pub signer: Arc<dyn Signer>,
    pub storage_deals: Arc<dyn StorageDealClient>,
    pub retrieval: Arc<dyn RetrievalClient>,
    pub streams: Arc<dyn DealStreamOpener>,
    pub data_transfer: Arc<dyn DataTransfer>,
    /// Keep every deal's blocks in this store instead of per-import and
    /// per-retrieval archives.
    pub shared_store: Option<Arc<MemoryDB>>,
}

pub struct ClientApi {
    config: Config,
    chain: Arc<dyn ChainApi>,
    storage_deals: Arc<dyn StorageDealClient>,
    retrieval: Arc<dyn RetrievalClient>,
    data_transfer: Arc<dyn DataTransfer>,
    imports: Arc<ImportManager>,
    storage_blockstores: Arc<StorageBlockstoreAccessor>,
    retrieval_blockstores: Arc<RetrievalBlockstoreAccessor>,
    deal_starter: DealStarter,
    orchestrator: Arc<Orchestrator>,
}

impl ClientApi {
    pub fn new(deps: ClientDeps) -> Result<Self> {
        let ClientDeps {
            config,
            chain,
            signer,
            storage_deals,
            retrieval,
            streams,
            data_transfer,
            shared_store,
        } = deps;

        let imports = Arc::new(ImportManager::new(config.client.imports_dir())?);
        let (storage_blockstores, retrieval_blockstores) = match shared_store {
            Some(db) => (
                StorageBlockstoreAccessor::shared(db.clone()),
                RetrievalBlockstoreAccessor::shared(db),
            ),
            None => (
                StorageBlockstoreAccessor::imports(imports.clone()),
                RetrievalBlockstoreAccessor::car(config.client.retrievals_dir())?,
            ),
        };
        let storage_blockstores = Arc::new(storage_blockstores);
        let retrieval_blockstores = Arc::new(retrieval_blockstores);

        let deal_starter = DealStarter::new(
            chain.clone(),
            signer,
            storage_deals.clone(),
            streams,
            storage_blockstores.clone(),
            config.deal,
        );
        let orchestrator = Arc::new(Orchestrator {
            chain: chain.clone(),
            retrieval: retrieval.clone(),
            imports: imports.clone(),
            accessor: retrieval_blockstores.clone(),
            event_buffer: config.retrieval.event_buffer,
        });
        info!(
            imports = %imports.imports_dir().display(),
            shared = retrieval_blockstores.shared_store().is_some(),
            "market client ready"
        );

        Ok(Self {
            config,
            chain,
            storage_deals,
            retrieval,
            data_transfer,
            imports,
            storage_blockstores,
            retrieval_blockstores,
            deal_starter,
            orchestrator,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn imports(&self) -> &Arc<ImportManager> {
        &self.imports
    }

    /// Blockstores the storage deal library reads payloads from.
    pub fn storage_blockstores(&self) -> &Arc<StorageBlockstoreAccessor> {
        &self.storage_blockstores
    }

    /// Blockstores the retrieval library writes fetched blocks into.
    pub fn retrieval_blockstores(&self) -> &Arc<RetrievalBlockstoreAccessor> {
        &self.retrieval_blockstores
    }

    fn materializer(&self) -> Materializer {
        Materializer::new(self.imports.clone(), self.retrieval_blockstores.clone())
    }
}
