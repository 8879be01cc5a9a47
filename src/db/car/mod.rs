// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! CAR archives on disk.
//!
//! [`CarV2ReadWrite`] is the write path used by imports and retrievals,
//! [`CarReadOnly`] serves finished CARv1 and CARv2 files, and
//! [`replace_car_v2_roots`] swaps the declared roots of a finished CARv2.
//! See <https://ipld.io/specs/transport/car/carv2/>

mod index;
mod patch;
mod read_only;
mod read_write;

pub use index::MultihashIndexSorted;
pub use patch::replace_car_v2_roots;
pub use read_only::CarReadOnly;
pub use read_write::CarV2ReadWrite;
