// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::handshake;
use crate::cli_shared::config::DealConfig;
use crate::db::accessor::StorageBlockstoreAccessor;
use crate::error::{MarketError, Result};
use crate::market::api::{ChainApi, DealStreamOpener, Signer, StorageDealClient};
use crate::market::{
    ClientDealProposal, DataRef, DeadlineInfo, DealProposal, MinerInfo, MsgMeta, MsgType,
    Proposal, ProposeStorageDealParams, StorageProviderInfo, TRANSFER_TYPE_GRAPHSYNC,
    TRANSFER_TYPE_MANUAL,
};
use anyhow::anyhow;
use cid::Cid;
use cid::multibase::Base;
use fvm_ipld_blockstore::Blockstore as _;
use fvm_shared4::address::Address;
use fvm_shared4::clock::ChainEpoch;
use fvm_shared4::econ::TokenAmount;
use fvm_shared4::sector::{RegisteredSealProof, SectorSize};
use fvm_shared4::version::NetworkVersion;
use libp2p::PeerId;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// What the caller wants stored, and on which terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartDealParams {
    pub data: DataRef,
    pub wallet: Address,
    pub miner: Address,
    pub epoch_price: TokenAmount,
    pub min_blocks_duration: ChainEpoch,
    /// Zero means the minimum the chain accepts.
    pub provider_collateral: TokenAmount,
    /// Zero or negative means "as soon as possible".
    pub deal_start_epoch: ChainEpoch,
    pub fast_retrieval: bool,
    pub verified_deal: bool,
}

/// Chain facts every deal start needs, resolved once.
struct DealTerms {
    wallet_key: Address,
    miner_info: MinerInfo,
    peer_id: PeerId,
    start_epoch: ChainEpoch,
    end_epoch: ChainEpoch,
    seal_proof: RegisteredSealProof,
}

/// Starts storage deals, either through the storage deal library or with the
/// stateless proposal handshake.
pub struct DealStarter {
    chain: Arc<dyn ChainApi>,
    signer: Arc<dyn Signer>,
    deals: Arc<dyn StorageDealClient>,
    streams: Arc<dyn DealStreamOpener>,
    accessor: Arc<StorageBlockstoreAccessor>,
    config: DealConfig,
}

impl DealStarter {
    pub fn new(
        chain: Arc<dyn ChainApi>,
        signer: Arc<dyn Signer>,
        deals: Arc<dyn StorageDealClient>,
        streams: Arc<dyn DealStreamOpener>,
        accessor: Arc<StorageBlockstoreAccessor>,
        config: DealConfig,
    ) -> Self {
        Self {
            chain,
            signer,
            deals,
            streams,
            accessor,
            config,
        }
    }

    /// Hands the deal to the storage deal library and returns its proposal
    /// CID.
    #[tracing::instrument(level = "debug", skip_all, fields(miner = %params.miner))]
    pub async fn start(&self, params: &StartDealParams) -> Result<Cid> {
        if params.data.transfer_type == TRANSFER_TYPE_GRAPHSYNC {
            let lease = self.accessor.acquire(&params.data.root)?;
            if !lease.has(&params.data.root)? {
                return Err(MarketError::NotFound(format!(
                    "payload root {} in the deal blockstore",
                    params.data.root
                )));
            }
        }
        let terms = self.resolve_terms(params).await?;
        let proposal_cid = self
            .deals
            .propose_storage_deal(ProposeStorageDealParams {
                addr: params.wallet,
                info: StorageProviderInfo {
                    address: params.miner,
                    owner: terms.miner_info.owner,
                    worker: terms.miner_info.worker,
                    sector_size: terms.miner_info.sector_size,
                    peer_id: terms.peer_id,
                    addrs: terms.miner_info.multiaddrs.clone(),
                },
                data: params.data.clone(),
                start_epoch: terms.start_epoch,
                end_epoch: terms.end_epoch,
                price: params.epoch_price.clone(),
                collateral: params.provider_collateral.clone(),
                seal_proof: terms.seal_proof,
                fast_retrieval: params.fast_retrieval,
                verified_deal: params.verified_deal,
            })
            .await?;
        info!(proposal = %proposal_cid, "storage deal proposed");
        Ok(proposal_cid)
    }

    /// Signs the proposal locally and offers it to the provider directly.
    /// Data is expected to reach the provider out of band, for free.
    #[tracing::instrument(level = "debug", skip_all, fields(miner = %params.miner))]
    pub async fn start_stateless(
        &self,
        params: &StartDealParams,
        cancel: &CancellationToken,
    ) -> Result<Cid> {
        if params.data.transfer_type != TRANSFER_TYPE_MANUAL {
            return Err(anyhow!(
                "invalid transfer type {} for stateless storage deal",
                params.data.transfer_type
            )
            .into());
        }
        if params.epoch_price != TokenAmount::default() {
            return Err(
                anyhow!("stateless storage deals can only be initiated with storage price of 0")
                    .into(),
            );
        }
        let piece_cid = params
            .data
            .piece_cid
            .ok_or_else(|| anyhow!("stateless storage deals need a piece CID"))?;

        let terms = self.resolve_terms(params).await?;
        let piece_size = params.data.piece_size.padded();
        let mut proposal = DealProposal {
            piece_cid,
            piece_size,
            verified_deal: params.verified_deal,
            client: terms.wallet_key,
            provider: params.miner,
            label: params
                .data
                .root
                .to_string_of_base(Base::Base64Url)
                .map_err(MarketError::format)?,
            start_epoch: terms.start_epoch,
            end_epoch: terms.end_epoch,
            storage_price_per_epoch: TokenAmount::default(),
            provider_collateral: params.provider_collateral.clone(),
            client_collateral: TokenAmount::default(),
        };
        if proposal.provider_collateral == TokenAmount::default() {
            proposal.provider_collateral = self
                .chain
                .state_deal_provider_collateral_bounds(piece_size, params.verified_deal)
                .await?
                .min;
        }

        let client_signature = self
            .signer
            .wallet_sign(
                &terms.wallet_key,
                &fvm_ipld_encoding::to_vec(&proposal)?,
                MsgMeta::new(MsgType::DealProposal),
            )
            .await?;
        let message = Proposal {
            deal_proposal: ClientDealProposal {
                proposal,
                client_signature,
            },
            piece: params.data.clone(),
            fast_retrieval: params.fast_retrieval,
        };

        let stream = self
            .streams
            .open_deal_stream(terms.peer_id, &terms.miner_info.multiaddrs)
            .await?;
        let proposal_cid =
            handshake::propose(stream, &message, self.config.handshake_timeout(), cancel).await?;
        info!(proposal = %proposal_cid, "stateless storage deal accepted");
        Ok(proposal_cid)
    }

    async fn resolve_terms(&self, params: &StartDealParams) -> Result<DealTerms> {
        if params.min_blocks_duration < self.config.min_deal_duration
            || params.min_blocks_duration > self.config.max_deal_duration
        {
            return Err(anyhow!(
                "deal duration {} is outside [{}, {}]",
                params.min_blocks_duration,
                self.config.min_deal_duration,
                self.config.max_deal_duration
            )
            .into());
        }

        let wallet_key = self.chain.state_account_key(&params.wallet).await?;
        if !self.chain.wallet_has(&wallet_key).await? {
            return Err(MarketError::NotFound(format!(
                "provided address {} doesn't exist in wallet",
                params.wallet
            )));
        }

        let miner_info = self.chain.state_miner_info(&params.miner).await?;
        let peer_id = miner_info
            .peer_id
            .ok_or_else(|| MarketError::NotFound(format!("peer id of miner {}", params.miner)))?;
        let deadline = self.chain.state_miner_proving_deadline(&params.miner).await?;
        let piece_size = params.data.piece_size.padded();
        if piece_size.0 > miner_info.sector_size as u64 {
            return Err(anyhow!(
                "data of {} bytes doesn't fit in a sector of {} bytes",
                piece_size.0,
                miner_info.sector_size as u64
            )
            .into());
        }

        let start_epoch = if params.deal_start_epoch <= 0 {
            self.chain.chain_head_height().await? + self.config.default_start_offset_epochs
        } else {
            params.deal_start_epoch
        };
        let end_epoch = calc_deal_expiration(params.min_blocks_duration, &deadline, start_epoch);
        let network_version = self.chain.state_network_version().await?;
        let seal_proof = seal_proof_for(miner_info.sector_size, network_version);

        Ok(DealTerms {
            wallet_key,
            miner_info,
            peer_id,
            start_epoch,
            end_epoch,
            seal_proof,
        })
    }
}

/// Ends the deal on the last epoch of a proving period of the miner, no
/// earlier than `start + min_duration`.
pub fn calc_deal_expiration(
    min_duration: ChainEpoch,
    deadline: &DeadlineInfo,
    start: ChainEpoch,
) -> ChainEpoch {
    let period = deadline.w_post_proving_period;
    let min_exp = start + min_duration;
    if period <= 0 {
        return min_exp;
    }
    let mut exp = min_exp + period - (min_exp % period) + (deadline.period_start % period) - 1;
    while exp < min_exp {
        exp += period;
    }
    exp
}

/// Seal proof the miner uses for new sectors of `size`.
pub fn seal_proof_for(size: SectorSize, version: NetworkVersion) -> RegisteredSealProof {
    use RegisteredSealProof as P;
    if version < NetworkVersion::V7 {
        match size {
            SectorSize::_2KiB => P::StackedDRG2KiBV1,
            SectorSize::_8MiB => P::StackedDRG8MiBV1,
            SectorSize::_512MiB => P::StackedDRG512MiBV1,
            SectorSize::_32GiB => P::StackedDRG32GiBV1,
            SectorSize::_64GiB => P::StackedDRG64GiBV1,
        }
    } else {
        match size {
            SectorSize::_2KiB => P::StackedDRG2KiBV1P1,
            SectorSize::_8MiB => P::StackedDRG8MiBV1P1,
            SectorSize::_512MiB => P::StackedDRG512MiBV1P1,
            SectorSize::_32GiB => P::StackedDRG32GiBV1P1,
            SectorSize::_64GiB => P::StackedDRG64GiBV1P1,
        }
    }
}
