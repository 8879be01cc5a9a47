// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::status::{ClientEvent, RetrievalDealStatus, StorageDealStatus};
use crate::utils::cid::CidCborExt as _;
use cid::Cid;
use fvm_ipld_encoding::tuple::*;
use fvm_shared4::address::Address;
use fvm_shared4::clock::ChainEpoch;
use fvm_shared4::crypto::signature::Signature;
use fvm_shared4::deal::DealID;
use fvm_shared4::econ::TokenAmount;
use fvm_shared4::piece::{PaddedPieceSize, UnpaddedPieceSize};
use fvm_shared4::sector::{RegisteredSealProof, SectorSize};
use libp2p::{Multiaddr, PeerId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Data is pushed over graphsync after the proposal is accepted.
pub const TRANSFER_TYPE_GRAPHSYNC: &str = "graphsync";
/// Data reaches the provider out of band.
pub const TRANSFER_TYPE_MANUAL: &str = "manual";

/// Terms of a storage deal, signed by the client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct DealProposal {
    pub piece_cid: Cid,
    pub piece_size: PaddedPieceSize,
    pub verified_deal: bool,
    pub client: Address,
    pub provider: Address,
    pub label: String,
    pub start_epoch: ChainEpoch,
    pub end_epoch: ChainEpoch,
    pub storage_price_per_epoch: TokenAmount,
    pub provider_collateral: TokenAmount,
    pub client_collateral: TokenAmount,
}

impl DealProposal {
    pub fn duration(&self) -> ChainEpoch {
        self.end_epoch - self.start_epoch
    }

    pub fn total_storage_fee(&self) -> TokenAmount {
        &self.storage_price_per_epoch * self.duration()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct ClientDealProposal {
    pub proposal: DealProposal,
    pub client_signature: Signature,
}

impl ClientDealProposal {
    /// The proposal CID, the identity providers echo back.
    pub fn cid(&self) -> Result<Cid, fvm_ipld_encoding::Error> {
        Cid::from_cbor_blake2b256(self)
    }
}

/// Describes the payload of a storage deal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DataRef {
    pub transfer_type: String,
    pub root: Cid,
    pub piece_cid: Option<Cid>,
    #[serde(with = "unpadded_size")]
    pub piece_size: UnpaddedPieceSize,
    pub raw_block_size: u64,
}

/// Unpadded piece sizes travel as plain integers.
mod unpadded_size {
    use super::UnpaddedPieceSize;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(size: &UnpaddedPieceSize, s: S) -> Result<S::Ok, S::Error> {
        size.0.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<UnpaddedPieceSize, D::Error> {
        u64::deserialize(d).map(UnpaddedPieceSize)
    }
}

/// Message sent by the client to open a deal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Proposal {
    pub deal_proposal: ClientDealProposal,
    pub piece: DataRef,
    pub fast_retrieval: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Response {
    pub state: StorageDealStatus,
    /// Set when the provider rejects or fails the deal.
    pub message: String,
    pub proposal: Cid,
    pub publish_message: Option<Cid>,
}

/// Provider answer to a [`Proposal`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SignedResponse {
    pub response: Response,
    pub signature: Option<Signature>,
}

/// Semantic type of a payload handed to the signer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum MsgType {
    Unknown,
    ChainMsg,
    Block,
    DealProposal,
    DrawRandomness,
    SignCid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgMeta {
    pub msg_type: MsgType,
    pub extra: Vec<u8>,
}

impl MsgMeta {
    pub fn new(msg_type: MsgType) -> Self {
        Self {
            msg_type,
            extra: vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinerInfo {
    pub owner: Address,
    pub worker: Address,
    pub peer_id: Option<PeerId>,
    pub multiaddrs: Vec<Multiaddr>,
    pub sector_size: SectorSize,
}

/// Proving deadline of a miner at the current epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadlineInfo {
    pub current_epoch: ChainEpoch,
    pub period_start: ChainEpoch,
    pub index: u64,
    pub w_post_proving_period: ChainEpoch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollateralBounds {
    pub min: TokenAmount,
    pub max: TokenAmount,
}

/// What a storage deal library needs to reach a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageProviderInfo {
    pub address: Address,
    pub owner: Address,
    pub worker: Address,
    pub sector_size: SectorSize,
    pub peer_id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposeStorageDealParams {
    pub addr: Address,
    pub info: StorageProviderInfo,
    pub data: DataRef,
    pub start_epoch: ChainEpoch,
    pub end_epoch: ChainEpoch,
    pub price: TokenAmount,
    pub collateral: TokenAmount,
    pub seal_proof: RegisteredSealProof,
    pub fast_retrieval: bool,
    pub verified_deal: bool,
}

/// Client view of a storage deal, as kept by the deal library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientDeal {
    pub proposal: ClientDealProposal,
    pub proposal_cid: Cid,
    pub state: StorageDealStatus,
    pub message: String,
    pub miner: PeerId,
    pub deal_id: DealID,
    pub data_ref: DataRef,
    pub publish_message: Option<Cid>,
    pub fast_retrieval: bool,
    /// Unix seconds.
    pub creation_time: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DealInfo {
    pub proposal_cid: Cid,
    pub state: StorageDealStatus,
    pub message: String,
    pub provider: Address,
    pub data_ref: DataRef,
    pub piece_cid: Cid,
    pub size: UnpaddedPieceSize,
    pub price_per_epoch: TokenAmount,
    pub duration: ChainEpoch,
    pub deal_id: DealID,
    pub creation_time: u64,
    pub verified: bool,
    pub publish_message: Option<Cid>,
}

impl From<&ClientDeal> for DealInfo {
    fn from(deal: &ClientDeal) -> Self {
        let proposal = &deal.proposal.proposal;
        Self {
            proposal_cid: deal.proposal_cid,
            state: deal.state,
            message: deal.message.clone(),
            provider: proposal.provider,
            data_ref: deal.data_ref.clone(),
            piece_cid: proposal.piece_cid,
            size: proposal.piece_size.unpadded(),
            price_per_epoch: proposal.storage_price_per_epoch.clone(),
            duration: proposal.duration(),
            deal_id: deal.deal_id,
            creation_time: deal.creation_time,
            verified: proposal.verified_deal,
            publish_message: deal.publish_message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageAsk {
    pub price: TokenAmount,
    pub verified_price: TokenAmount,
    pub min_piece_size: PaddedPieceSize,
    pub max_piece_size: PaddedPieceSize,
    pub miner: Address,
    pub timestamp: ChainEpoch,
    pub expiry: ChainEpoch,
    pub seq_no: u64,
}

/// Identity of a retrieval deal, assigned by the retrieval client when the
/// request is issued.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RetrievalDealId(pub u64);

impl fmt::Display for RetrievalDealId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A provider that may serve a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievalPeer {
    pub address: Address,
    pub id: PeerId,
    pub piece_cid: Option<Cid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryResponseStatus {
    Available,
    Unavailable,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResponse {
    pub status: QueryResponseStatus,
    pub piece_cid_found: bool,
    pub size: u64,
    pub payment_address: Address,
    pub min_price_per_byte: TokenAmount,
    pub max_payment_interval: u64,
    pub max_payment_interval_increase: u64,
    pub message: String,
    pub unseal_price: TokenAmount,
}

impl QueryResponse {
    /// Total price for the whole payload, unsealing included.
    pub fn total_price(&self) -> TokenAmount {
        &self.min_price_per_byte * self.size + &self.unseal_price
    }
}

/// A provider's priced answer to "do you have this payload".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOffer {
    /// Set when the query itself failed; the remaining fields are then
    /// meaningless.
    pub err: Option<String>,
    pub root: Cid,
    pub piece: Option<Cid>,
    pub size: u64,
    pub min_price: TokenAmount,
    pub unseal_price: TokenAmount,
    pub payment_interval: u64,
    pub payment_interval_increase: u64,
    pub miner: Address,
    pub miner_peer: RetrievalPeer,
}

impl QueryOffer {
    pub fn order(&self, client: Address) -> RetrievalOrder {
        RetrievalOrder {
            root: self.root,
            piece: self.piece,
            size: self.size,
            total: self.min_price.clone(),
            unseal_price: self.unseal_price.clone(),
            payment_interval: self.payment_interval,
            payment_interval_increase: self.payment_interval_increase,
            client,
            miner: self.miner,
            miner_peer: Some(self.miner_peer.clone()),
        }
    }
}

/// Everything needed to start one retrieval attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievalOrder {
    pub root: Cid,
    pub piece: Option<Cid>,
    pub size: u64,
    pub total: TokenAmount,
    pub unseal_price: TokenAmount,
    pub payment_interval: u64,
    pub payment_interval_increase: u64,
    pub client: Address,
    pub miner: Address,
    pub miner_peer: Option<RetrievalPeer>,
}

impl RetrievalOrder {
    pub fn params(&self) -> RetrievalParams {
        let price_per_byte = if self.size == 0 {
            TokenAmount::default()
        } else {
            (&self.total - &self.unseal_price).div_floor(self.size)
        };
        RetrievalParams {
            payload_cid: self.root,
            piece_cid: self.piece,
            price_per_byte,
            payment_interval: self.payment_interval,
            payment_interval_increase: self.payment_interval_increase,
            unseal_price: self.unseal_price.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievalParams {
    pub payload_cid: Cid,
    pub piece_cid: Option<Cid>,
    pub price_per_byte: TokenAmount,
    pub payment_interval: u64,
    pub payment_interval_increase: u64,
    pub unseal_price: TokenAmount,
}

/// Snapshot of a retrieval deal as reported by the retrieval client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievalDealState {
    pub id: RetrievalDealId,
    pub payload_cid: Cid,
    pub status: RetrievalDealStatus,
    pub total_received: u64,
    pub funds_spent: TokenAmount,
    pub message: String,
    pub provider: Option<PeerId>,
}

/// One state transition of a retrieval deal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievalDealUpdate {
    pub event: ClientEvent,
    pub state: RetrievalDealState,
}

/// Identity of a data transfer, unique per initiating peer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TransferId(pub u64);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId {
    pub initiator: PeerId,
    pub responder: PeerId,
    pub id: TransferId,
}

impl ChannelId {
    /// Channel `id` between this node and `other`, oriented by which side
    /// opened it.
    pub fn between(local: PeerId, other: PeerId, id: TransferId, local_initiated: bool) -> Self {
        let (initiator, responder) = match local_initiated {
            true => (local, other),
            false => (other, local),
        };
        Self {
            initiator,
            responder,
            id,
        }
    }
}

/// A data transfer channel as the transfer library tracks it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelState {
    pub id: ChannelId,
    /// Library specific status code.
    pub status: u64,
    pub base_cid: Cid,
    pub sender: PeerId,
    pub recipient: PeerId,
    /// The recipient asked for the data rather than being pushed it.
    pub is_pull: bool,
    pub voucher: String,
    pub message: String,
    pub sent: u64,
    pub received: u64,
}

/// A data transfer channel seen from this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataTransferChannel {
    pub transfer_id: TransferId,
    pub status: u64,
    pub base_cid: Cid,
    pub is_initiator: bool,
    pub is_sender: bool,
    pub voucher: String,
    pub message: String,
    pub other_peer: PeerId,
    pub transferred: u64,
}

impl DataTransferChannel {
    pub fn new(local: PeerId, state: ChannelState) -> Self {
        let is_sender = state.sender == local;
        let (is_initiator, transferred, other_peer) = match is_sender {
            true => (!state.is_pull, state.sent, state.recipient),
            false => (state.is_pull, state.received, state.sender),
        };
        Self {
            transfer_id: state.id.id,
            status: state.status,
            base_cid: state.base_cid,
            is_initiator,
            is_sender,
            voucher: state.voucher,
            message: state.message,
            other_peer,
            transferred,
        }
    }
}
