// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::error::{MarketError, Result};
use crate::market::api::{ChainApi, RetrievalClient};
use crate::market::{QueryOffer, QueryResponseStatus, RetrievalPeer};
use cid::Cid;
use fvm_shared4::address::Address;
use fvm_shared4::econ::TokenAmount;
use libp2p::PeerId;
use tracing::debug;

/// Asks every provider known to serve `root` for an offer. Providers
/// advertising another piece than `piece` are skipped.
pub async fn find_data(
    chain: &dyn ChainApi,
    retrieval: &dyn RetrievalClient,
    root: &Cid,
    piece: Option<&Cid>,
) -> Result<Vec<QueryOffer>> {
    let peers = retrieval.find_providers(root).await?;
    let mut offers = Vec::with_capacity(peers.len());
    for peer in peers {
        if piece.is_some_and(|piece| peer.piece_cid.as_ref() != Some(piece)) {
            continue;
        }
        // The advertised peer id may be stale, the chain has the current one.
        let peer = RetrievalPeer {
            id: miner_peer_id(chain, &peer.address).await?,
            ..peer
        };
        offers.push(query_offer(retrieval, peer, root, piece).await);
    }
    Ok(offers)
}

/// Offer of one miner for `root`.
pub async fn miner_query_offer(
    chain: &dyn ChainApi,
    retrieval: &dyn RetrievalClient,
    miner: &Address,
    root: &Cid,
    piece: Option<&Cid>,
) -> Result<QueryOffer> {
    let peer = RetrievalPeer {
        address: *miner,
        id: miner_peer_id(chain, miner).await?,
        piece_cid: None,
    };
    Ok(query_offer(retrieval, peer, root, piece).await)
}

pub(super) async fn miner_peer_id(chain: &dyn ChainApi, miner: &Address) -> Result<PeerId> {
    chain
        .state_miner_info(miner)
        .await?
        .peer_id
        .ok_or_else(|| MarketError::NotFound(format!("peer id of miner {miner}")))
}

/// Failed queries become offers carrying the error, so one unreachable
/// provider does not hide the others.
async fn query_offer(
    retrieval: &dyn RetrievalClient,
    peer: RetrievalPeer,
    root: &Cid,
    piece: Option<&Cid>,
) -> QueryOffer {
    let failed = |peer: RetrievalPeer, err: String| QueryOffer {
        err: Some(err),
        root: *root,
        piece: piece.copied(),
        size: 0,
        min_price: TokenAmount::default(),
        unseal_price: TokenAmount::default(),
        payment_interval: 0,
        payment_interval_increase: 0,
        miner: peer.address,
        miner_peer: peer,
    };
    let response = match retrieval.query(&peer, root, piece).await {
        Ok(response) => response,
        Err(e) => {
            debug!(miner = %peer.address, "retrieval query failed: {e:#}");
            return failed(peer, e.to_string());
        }
    };
    let err = match response.status {
        QueryResponseStatus::Available => None,
        QueryResponseStatus::Unavailable => Some(format!(
            "retrieval query offer was unavailable: {}",
            response.message
        )),
        QueryResponseStatus::Error => Some(format!(
            "retrieval query offer errored: {}",
            response.message
        )),
    };
    QueryOffer {
        err,
        root: *root,
        piece: piece.copied(),
        size: response.size,
        min_price: response.total_price(),
        unseal_price: response.unseal_price,
        payment_interval: response.max_payment_interval,
        payment_interval_increase: response.max_payment_interval_increase,
        miner: response.payment_address,
        miner_peer: peer,
    }
}
