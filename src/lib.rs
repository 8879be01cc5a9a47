// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Client side of the Filecoin storage and retrieval markets.
//!
//! The crate turns local files into CARv2 archives ready to be handed to a
//! storage provider, runs the stateless deal proposal handshake, and drives
//! retrievals back into a blockstore or onto the local filesystem. Chain
//! access, deal state machines and signing are consumed through the traits
//! in [`market::api`].

mod cli_shared;
mod client;
mod commp;
mod db;
mod deal;
mod error;
mod imports;
mod ipld;
pub mod market;
mod retrieval;
#[cfg(test)]
mod test_utils;
mod unixfs;
mod utils;

pub use cli_shared::{
    config::{Config, DealConfig, ImportConfig, LogConfig, RetrievalConfig},
    logger::setup_logger,
    read_config,
};
pub use client::{ClientApi, ClientDeps, DataCidSize, DealSize, ImportRes, placeholder_root};
pub use commp::{CommPRet, PieceInfo};
pub use db::MemoryDB;
pub use db::accessor::{RetrievalBlockstoreAccessor, StorageBlockstoreAccessor};
pub use deal::{StartDealParams, calc_deal_expiration, seal_proof_for};
pub use error::{MarketError, Result};
pub use imports::{CarOwnership, Import, ImportId, ImportManager, LABEL_FILE_NAME, LABEL_SOURCE};
pub use retrieval::{
    ExportRef, FileRef, RetrievalEvent, RetrievalOrder, RetrievalState, RetrievalTask,
};
