// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::ClientApi;
use super::import::blocking;
use crate::commp::{CommPWriter, PaddedPieceSize, unpadded_piece_size};
use crate::deal::StartDealParams;
use crate::error::{MarketError, Result};
use crate::ipld::write_dag_car_v1;
use crate::market::{DealInfo, StorageAsk, StorageDealStatus, StorageProviderInfo};
use cid::Cid;
use fvm_shared4::address::Address;
use libp2p::PeerId;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument as _, debug, info};

/// Epochs a publish message must be buried under before a deal counts as
/// published.
const MESSAGE_CONFIDENCE: u64 = 5;

/// Sizes of the CARv1 a storage deal for a root would carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DealSize {
    pub payload_size: u64,
    pub piece_size: PaddedPieceSize,
}

/// Piece a storage deal for a root would carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataCidSize {
    pub payload_size: u64,
    pub piece_size: PaddedPieceSize,
    pub piece_cid: Cid,
}

impl ClientApi {
    pub async fn start_deal(&self, params: &StartDealParams) -> Result<Cid> {
        self.deal_starter.start(params).await
    }

    /// Proposes directly to the provider, without the storage deal library
    /// tracking the deal. `cancel` aborts the handshake.
    pub async fn start_deal_stateless(
        &self,
        params: &StartDealParams,
        cancel: &CancellationToken,
    ) -> Result<Cid> {
        self.deal_starter.start_stateless(params, cancel).await
    }

    /// Payload and piece size of a deal for `root`.
    pub async fn get_deal_size(&self, root: &Cid) -> Result<DealSize> {
        let lease = self.storage_blockstores.acquire(root)?;
        let root = *root;
        blocking(move || {
            let payload_size = write_dag_car_v1(&lease, &root, std::io::sink())?;
            Ok(DealSize {
                payload_size,
                piece_size: unpadded_piece_size(payload_size).padded(),
            })
        })
        .await
    }

    /// Piece commitment of the CARv1 a deal for `root` would carry.
    pub async fn get_piece_identity_for_content(&self, root: &Cid) -> Result<DataCidSize> {
        let lease = self.storage_blockstores.acquire(root)?;
        let root = *root;
        blocking(move || {
            let mut writer = CommPWriter::default();
            let payload_size = write_dag_car_v1(&lease, &root, &mut writer)?;
            let comm = writer.finish()?;
            debug!(%root, piece = %comm.root, payload_size, "computed piece identity");
            Ok(DataCidSize {
                payload_size,
                piece_size: comm.size.padded(),
                piece_cid: comm.root,
            })
        })
        .await
    }

    pub async fn list_deals(&self) -> Result<Vec<DealInfo>> {
        let deals = self.storage_deals.list_local_deals().await?;
        Ok(deals.iter().map(DealInfo::from).collect())
    }

    pub async fn get_deal_info(&self, proposal_cid: &Cid) -> Result<DealInfo> {
        self.storage_deals
            .get_local_deal(proposal_cid)
            .await?
            .map(|deal| DealInfo::from(&deal))
            .ok_or_else(|| MarketError::NotFound(format!("storage deal {proposal_cid}")))
    }

    /// Streams every deal state change until `cancel` fires or the receiver
    /// is dropped. The subscription is live when this returns.
    pub fn get_deal_updates(&self, cancel: CancellationToken) -> flume::Receiver<DealInfo> {
        let subscription = self.storage_deals.subscribe_to_events();
        let (tx, rx) = flume::unbounded();
        tokio::spawn(
            async move {
                loop {
                    let deal = tokio::select! {
                        _ = cancel.cancelled() => break,
                        deal = subscription.recv() => deal,
                    };
                    let Some(deal) = deal else { break };
                    if tx.send_async(DealInfo::from(&deal)).await.is_err() {
                        break;
                    }
                }
                subscription.unsubscribe();
                debug!("deal update feed closed");
            }
            .in_current_span(),
        );
        rx
    }

    pub async fn query_ask(&self, peer: PeerId, miner: &Address) -> Result<StorageAsk> {
        let info = self.chain.state_miner_info(miner).await?;
        let ask = self
            .storage_deals
            .get_ask(&StorageProviderInfo {
                address: *miner,
                owner: info.owner,
                worker: info.worker,
                sector_size: info.sector_size,
                peer_id: peer,
                addrs: info.multiaddrs,
            })
            .await?;
        Ok(ask)
    }

    /// Name of a raw storage deal status code.
    pub fn get_deal_status(&self, code: u64) -> Result<String> {
        StorageDealStatus::name_of(code)
            .ok_or_else(|| MarketError::NotFound(format!("no such deal state {code}")))
    }

    /// Waits for the publish message of a deal to land on chain.
    pub async fn wait_deal_published(&self, proposal_cid: &Cid) -> Result<()> {
        let deal = self.get_deal_info(proposal_cid).await?;
        let msg = deal.publish_message.ok_or_else(|| {
            MarketError::NotFound(format!("publish message of deal {proposal_cid}"))
        })?;
        let exit_code = self.chain.state_wait_msg(&msg, MESSAGE_CONFIDENCE).await?;
        if !exit_code.is_success() {
            return Err(MarketError::Protocol(format!(
                "publish message {msg} failed with exit code {exit_code}"
            )));
        }
        info!(proposal = %proposal_cid, %msg, "deal published");
        Ok(())
    }
}
