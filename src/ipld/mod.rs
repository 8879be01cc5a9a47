// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! DAG traversal over a [`Blockstore`].

use crate::error::{MarketError, Result};
use crate::unixfs::{DAG_PB, PbNode};
use crate::utils::cid::inline_data;
use crate::utils::db::car_format::{CarBlock, CarV1Header};
use ahash::{HashSet, HashSetExt as _};
use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::{DAG_CBOR, IPLD_RAW};
use ipld_core::ipld::Ipld;
use std::io::Write;

/// Loads a block, answering identity CIDs from the CID itself.
pub fn load_block(store: &impl Blockstore, cid: &Cid) -> Result<Vec<u8>> {
    if let Some(data) = inline_data(cid) {
        return Ok(data.to_vec());
    }
    store
        .get(cid)
        .map_err(MarketError::from_anyhow)?
        .ok_or_else(|| MarketError::block_not_found(cid))
}

/// Links of a block, in the order they appear in it.
pub fn block_links(cid: &Cid, data: &[u8]) -> Result<Vec<Cid>> {
    match cid.codec() {
        IPLD_RAW => Ok(vec![]),
        DAG_PB => PbNode::decode(data)
            .and_then(|node| node.links.iter().map(|l| l.cid()).collect())
            .map_err(MarketError::format),
        DAG_CBOR => {
            let ipld: Ipld = serde_ipld_dagcbor::from_slice(data).map_err(MarketError::format)?;
            let mut links = vec![];
            collect_ipld_links(&ipld, &mut links);
            Ok(links)
        }
        other => Err(MarketError::Format(format!(
            "cannot traverse block {cid} with codec {other:#x}"
        ))),
    }
}

fn collect_ipld_links(ipld: &Ipld, links: &mut Vec<Cid>) {
    match ipld {
        Ipld::Map(m) => m.values().for_each(|v| collect_ipld_links(v, links)),
        Ipld::List(list) => list.iter().for_each(|v| collect_ipld_links(v, links)),
        &Ipld::Link(cid) => links.push(cid),
        _ => (),
    }
}

/// Visits every block reachable from `root` once, depth first, in the order
/// links appear. This is the block order of a deterministic CAR.
pub fn walk_dag(
    store: &impl Blockstore,
    root: &Cid,
    mut visit: impl FnMut(CarBlock) -> Result<()>,
) -> Result<()> {
    let mut seen = HashSet::new();
    let mut stack = vec![*root];
    while let Some(cid) = stack.pop() {
        if !seen.insert(cid) {
            continue;
        }
        let data = load_block(store, &cid)?;
        let links = block_links(&cid, &data)?;
        stack.extend(links.into_iter().rev());
        visit(CarBlock { cid, data })?;
    }
    Ok(())
}

/// Writes the DAG under `root` as a CARv1 with `root` as its only root and
/// returns the number of bytes written.
pub fn write_dag_car_v1(store: &impl Blockstore, root: &Cid, mut writer: impl Write) -> Result<u64> {
    let header = CarV1Header::new(nunny::vec![*root]).to_frame()?;
    writer.write_all(&header)?;
    let mut written = header.len() as u64;
    walk_dag(store, root, |block| {
        block.write(&mut writer)?;
        written += block.frame_len() as u64;
        Ok(())
    })?;
    writer.flush()?;
    Ok(written)
}
