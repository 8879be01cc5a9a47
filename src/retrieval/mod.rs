// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

mod events;
mod materialize;
mod orchestrator;
mod query;

pub use crate::market::RetrievalOrder;
pub use events::{RetrievalEvent, RetrievalState};
pub use materialize::{ExportRef, FileRef, Materializer};
pub(crate) use orchestrator::Orchestrator;
pub use orchestrator::RetrievalTask;
pub use query::{find_data, miner_query_offer};
