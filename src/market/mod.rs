// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Wire types, status codes and the capability traits of the storage and
//! retrieval markets.

pub mod api;
pub mod status;
pub mod types;

pub use status::{ClientEvent, Outcome, RetrievalDealStatus, StorageDealStatus};
pub use types::*;
