// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

mod builder;
mod export;
mod pb;

pub use builder::{BuilderOptions, BuiltNode, DagBuilder};
pub use export::{export_to_path, write_file};
pub use pb::{DataType, PbLink, PbNode, UnixFsData};

/// Multicodec of `dag-pb` blocks.
pub const DAG_PB: u64 = 0x70;
