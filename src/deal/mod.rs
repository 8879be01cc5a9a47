// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Starting storage deals.

pub mod codec;
pub mod handshake;
mod starter;

pub use starter::{DealStarter, StartDealParams, calc_deal_expiration, seal_proof_for};
