// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! In-memory stand-ins for the capabilities in [`crate::market::api`].

use crate::db::MemoryDB;
use crate::db::accessor::RetrievalBlockstoreAccessor;
use crate::deal::codec::DagCborCodec;
use crate::market::api::{
    ChainApi, DataTransfer, DealStream, DealStreamOpener, RetrievalClient, Signer,
    StorageDealClient, Subscription,
};
use crate::market::*;
use crate::utils::cid::CidCborExt as _;
use crate::utils::multihash::prelude::*;
use ahash::HashMap;
use anyhow::anyhow;
use async_trait::async_trait;
use cid::Cid;
use futures::{SinkExt as _, StreamExt as _};
use fvm_ipld_blockstore::Blockstore as _;
use fvm_ipld_encoding::IPLD_RAW;
use fvm_shared4::address::Address;
use fvm_shared4::clock::ChainEpoch;
use fvm_shared4::crypto::signature::Signature;
use fvm_shared4::econ::TokenAmount;
use fvm_shared4::error::ExitCode;
use fvm_shared4::piece::PaddedPieceSize;
use fvm_shared4::sector::SectorSize;
use fvm_shared4::version::NetworkVersion;
use libp2p::{Multiaddr, PeerId};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::codec::Framed;

pub fn cid_of(data: &[u8]) -> Cid {
    Cid::new_v1(IPLD_RAW, MultihashCode::Blake2b256.digest(data))
}

pub fn peer_id(n: u8) -> PeerId {
    let digest = libp2p::multihash::Multihash::<64>::wrap(0x12, &[n; 32]).unwrap();
    PeerId::from_multihash(digest).unwrap()
}

struct Hub<T> {
    next_id: u64,
    subscribers: Vec<(u64, flume::Sender<T>)>,
    unsubscribed: usize,
}

/// Fan-out publisher that counts how often subscribers let go.
pub struct EventHub<T> {
    hub: Arc<Mutex<Hub<T>>>,
}

impl<T> Default for EventHub<T> {
    fn default() -> Self {
        Self {
            hub: Arc::new(Mutex::new(Hub {
                next_id: 0,
                subscribers: vec![],
                unsubscribed: 0,
            })),
        }
    }
}

impl<T: Clone + Send + 'static> EventHub<T> {
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = flume::unbounded();
        let id = {
            let mut hub = self.hub.lock();
            hub.next_id += 1;
            let id = hub.next_id;
            hub.subscribers.push((id, tx));
            id
        };
        let hub = self.hub.clone();
        Subscription::new(rx, move || {
            let mut hub = hub.lock();
            hub.subscribers.retain(|(i, _)| *i != id);
            hub.unsubscribed += 1;
        })
    }

    pub fn publish(&self, event: T) {
        for (_, tx) in self.hub.lock().subscribers.iter() {
            let _ = tx.send(event.clone());
        }
    }

    pub fn subscribers(&self) -> usize {
        self.hub.lock().subscribers.len()
    }

    pub fn unsubscribed(&self) -> usize {
        self.hub.lock().unsubscribed
    }
}

pub struct FakeChain {
    pub head: ChainEpoch,
    pub network_version: NetworkVersion,
    pub peer_id: PeerId,
    pub sector_size: SectorSize,
    pub deadline: DeadlineInfo,
    pub wallet: Vec<Address>,
    pub collateral: CollateralBounds,
    pub exit_code: ExitCode,
}

impl Default for FakeChain {
    fn default() -> Self {
        Self {
            head: 1000,
            network_version: NetworkVersion::V21,
            peer_id: peer_id(1),
            sector_size: SectorSize::_2KiB,
            deadline: DeadlineInfo {
                current_epoch: 1000,
                period_start: 600,
                index: 0,
                w_post_proving_period: 2880,
            },
            wallet: vec![Address::new_id(100)],
            collateral: CollateralBounds {
                min: TokenAmount::from_atto(42),
                max: TokenAmount::from_atto(4200),
            },
            exit_code: ExitCode::OK,
        }
    }
}

#[async_trait]
impl ChainApi for FakeChain {
    async fn state_account_key(&self, addr: &Address) -> anyhow::Result<Address> {
        Ok(*addr)
    }

    async fn wallet_has(&self, addr: &Address) -> anyhow::Result<bool> {
        Ok(self.wallet.contains(addr))
    }

    async fn state_miner_info(&self, miner: &Address) -> anyhow::Result<MinerInfo> {
        let id = miner.id()?;
        Ok(MinerInfo {
            owner: Address::new_id(id + 1),
            worker: Address::new_id(id + 2),
            peer_id: Some(self.peer_id),
            multiaddrs: vec![Multiaddr::empty()],
            sector_size: self.sector_size,
        })
    }

    async fn state_miner_proving_deadline(&self, _: &Address) -> anyhow::Result<DeadlineInfo> {
        Ok(self.deadline)
    }

    async fn chain_head_height(&self) -> anyhow::Result<ChainEpoch> {
        Ok(self.head)
    }

    async fn state_network_version(&self) -> anyhow::Result<NetworkVersion> {
        Ok(self.network_version)
    }

    async fn state_deal_provider_collateral_bounds(
        &self,
        _: PaddedPieceSize,
        _: bool,
    ) -> anyhow::Result<CollateralBounds> {
        Ok(self.collateral.clone())
    }

    async fn state_wait_msg(&self, _: &Cid, _: u64) -> anyhow::Result<ExitCode> {
        Ok(self.exit_code)
    }
}

/// Data transfer library holding a fixed set of channels. The local peer is
/// `peer_id(1)`.
#[derive(Default)]
pub struct FakeDataTransfer {
    pub events: EventHub<ChannelState>,
    pub channels: Mutex<Vec<ChannelState>>,
    restarted: Mutex<Vec<ChannelId>>,
}

impl FakeDataTransfer {
    pub fn restarted(&self) -> Vec<ChannelId> {
        self.restarted.lock().clone()
    }

    fn known(&self, id: &ChannelId) -> anyhow::Result<()> {
        match self.channels.lock().iter().any(|c| c.id == *id) {
            true => Ok(()),
            false => Err(anyhow!("no data transfer channel {}", id.id)),
        }
    }
}

#[async_trait]
impl DataTransfer for FakeDataTransfer {
    fn local_peer(&self) -> PeerId {
        peer_id(1)
    }

    async fn in_progress_channels(&self) -> anyhow::Result<Vec<ChannelState>> {
        Ok(self.channels.lock().clone())
    }

    async fn restart_channel(&self, id: &ChannelId) -> anyhow::Result<()> {
        self.known(id)?;
        self.restarted.lock().push(*id);
        Ok(())
    }

    async fn close_channel(&self, id: &ChannelId) -> anyhow::Result<()> {
        self.known(id)?;
        self.channels.lock().retain(|c| c.id != *id);
        Ok(())
    }

    fn subscribe_to_events(&self) -> Subscription<ChannelState> {
        self.events.subscribe()
    }
}

#[derive(Default)]
pub struct FakeSigner {
    signed: Mutex<Vec<(Address, Vec<u8>, MsgMeta)>>,
}

impl FakeSigner {
    pub fn signed(&self) -> Vec<(Address, Vec<u8>, MsgMeta)> {
        self.signed.lock().clone()
    }
}

#[async_trait]
impl Signer for FakeSigner {
    async fn wallet_sign(
        &self,
        addr: &Address,
        msg: &[u8],
        meta: MsgMeta,
    ) -> anyhow::Result<Signature> {
        self.signed.lock().push((*addr, msg.to_vec(), meta));
        Ok(Signature::new_secp256k1(
            MultihashCode::Blake2b256.digest(msg).digest().to_vec(),
        ))
    }
}

#[derive(Default)]
pub struct FakeStorageDeals {
    proposed: Mutex<Vec<ProposeStorageDealParams>>,
    pub deals: Mutex<Vec<ClientDeal>>,
    pub events: EventHub<ClientDeal>,
}

impl FakeStorageDeals {
    pub fn proposed(&self) -> Vec<ProposeStorageDealParams> {
        self.proposed.lock().clone()
    }

    pub fn proposal_cid(&self, params: &ProposeStorageDealParams) -> Cid {
        Cid::from_cbor_blake2b256(&(params.data.root, params.start_epoch, params.end_epoch))
            .unwrap()
    }
}

#[async_trait]
impl StorageDealClient for FakeStorageDeals {
    async fn propose_storage_deal(&self, params: ProposeStorageDealParams) -> anyhow::Result<Cid> {
        let cid = self.proposal_cid(&params);
        self.proposed.lock().push(params);
        Ok(cid)
    }

    async fn list_local_deals(&self) -> anyhow::Result<Vec<ClientDeal>> {
        Ok(self.deals.lock().clone())
    }

    async fn get_local_deal(&self, proposal_cid: &Cid) -> anyhow::Result<Option<ClientDeal>> {
        Ok(self
            .deals
            .lock()
            .iter()
            .find(|d| d.proposal_cid == *proposal_cid)
            .cloned())
    }

    async fn get_ask(&self, info: &StorageProviderInfo) -> anyhow::Result<StorageAsk> {
        Ok(StorageAsk {
            price: TokenAmount::from_atto(500),
            verified_price: TokenAmount::default(),
            min_piece_size: PaddedPieceSize(256),
            max_piece_size: PaddedPieceSize(info.sector_size as u64),
            miner: info.address,
            timestamp: 1000,
            expiry: 2000,
            seq_no: 0,
        })
    }

    fn subscribe_to_events(&self) -> Subscription<ClientDeal> {
        self.events.subscribe()
    }
}

/// Retrieval capability that publishes scripted updates from inside
/// [`RetrievalClient::retrieve`], before the deal id is returned. When
/// serving, the requested DAG is copied into the deal's store first.
#[derive(Default)]
pub struct FakeRetrieval {
    pub events: EventHub<RetrievalDealUpdate>,
    pub providers: Mutex<Vec<RetrievalPeer>>,
    pub responses: Mutex<HashMap<Address, QueryResponse>>,
    scripts: Mutex<HashMap<Address, Vec<(RetrievalDealStatus, u64)>>>,
    started: Mutex<Vec<(RetrievalDealId, RetrievalParams)>>,
    cancelled: Mutex<Vec<RetrievalDealId>>,
    serving: Mutex<Option<(Arc<MemoryDB>, Arc<RetrievalBlockstoreAccessor>)>>,
    next_id: AtomicU64,
}

impl FakeRetrieval {
    /// Updates published when `miner` is asked to serve a retrieval.
    pub fn script(&self, miner: Address, updates: Vec<(RetrievalDealStatus, u64)>) {
        self.scripts.lock().insert(miner, updates);
    }

    /// Delivers blocks from `source` into `accessor` for every retrieval.
    pub fn serve(&self, source: Arc<MemoryDB>, accessor: Arc<RetrievalBlockstoreAccessor>) {
        *self.serving.lock() = Some((source, accessor));
    }

    pub fn update(
        id: RetrievalDealId,
        payload_cid: Cid,
        status: RetrievalDealStatus,
        total_received: u64,
    ) -> RetrievalDealUpdate {
        let event = match status {
            RetrievalDealStatus::Ongoing => ClientEvent::BlocksReceived,
            RetrievalDealStatus::Completed => ClientEvent::Complete,
            RetrievalDealStatus::Rejected => ClientEvent::DealRejected,
            RetrievalDealStatus::Cancelled => ClientEvent::CancelComplete,
            RetrievalDealStatus::DealNotFound => ClientEvent::DealNotFound,
            RetrievalDealStatus::Errored => ClientEvent::ProviderErrored,
            _ => ClientEvent::DealAccepted,
        };
        RetrievalDealUpdate {
            event,
            state: RetrievalDealState {
                id,
                payload_cid,
                status,
                total_received,
                funds_spent: TokenAmount::from_atto(total_received),
                message: format!("{status}"),
                provider: None,
            },
        }
    }

    pub fn started(&self) -> Vec<(RetrievalDealId, RetrievalParams)> {
        self.started.lock().clone()
    }

    pub fn cancelled(&self) -> Vec<RetrievalDealId> {
        self.cancelled.lock().clone()
    }
}

#[async_trait]
impl RetrievalClient for FakeRetrieval {
    async fn find_providers(&self, _: &Cid) -> anyhow::Result<Vec<RetrievalPeer>> {
        Ok(self.providers.lock().clone())
    }

    async fn query(
        &self,
        peer: &RetrievalPeer,
        _: &Cid,
        _: Option<&Cid>,
    ) -> anyhow::Result<QueryResponse> {
        self.responses
            .lock()
            .get(&peer.address)
            .cloned()
            .ok_or_else(|| anyhow!("peer {} unreachable", peer.address))
    }

    async fn retrieve(
        &self,
        params: RetrievalParams,
        _: TokenAmount,
        _: &RetrievalPeer,
        _: &Address,
        miner_wallet: &Address,
    ) -> anyhow::Result<RetrievalDealId> {
        let id = RetrievalDealId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let payload = params.payload_cid;
        self.started.lock().push((id, params));
        let serving = self.serving.lock().clone();
        if let Some((source, accessor)) = serving {
            let store = accessor.get(id, payload)?;
            crate::ipld::walk_dag(source.as_ref(), &payload, |block| {
                store.put_keyed(&block.cid, &block.data)?;
                Ok(())
            })?;
        }
        let script = self.scripts.lock().remove(miner_wallet).unwrap_or_default();
        for (status, total) in script {
            self.events
                .publish(Self::update(id, payload, status, total));
        }
        Ok(id)
    }

    async fn cancel_deal(&self, id: RetrievalDealId) -> anyhow::Result<()> {
        let payload = self
            .started
            .lock()
            .iter()
            .find(|(started, _)| *started == id)
            .map(|(_, params)| params.payload_cid)
            .ok_or_else(|| anyhow!("no retrieval deal {id}"))?;
        self.cancelled.lock().push(id);
        self.events.publish(Self::update(
            id,
            payload,
            RetrievalDealStatus::Cancelled,
            0,
        ));
        Ok(())
    }

    async fn list_deals(&self) -> anyhow::Result<Vec<RetrievalDealState>> {
        Ok(self
            .started()
            .into_iter()
            .map(|(id, params)| Self::update(id, params.payload_cid, RetrievalDealStatus::New, 0).state)
            .collect())
    }

    fn subscribe_to_events(&self) -> Subscription<RetrievalDealUpdate> {
        self.events.subscribe()
    }
}

type Responder = Arc<dyn Fn(&Proposal) -> SignedResponse + Send + Sync>;

/// Opens in-memory streams to a provider that records proposals and answers
/// with the configured responder, or hangs up when there is none.
#[derive(Default)]
pub struct FakeStreams {
    responder: Mutex<Option<Responder>>,
    received: Arc<Mutex<Vec<Proposal>>>,
}

impl FakeStreams {
    pub fn respond_with(&self, f: impl Fn(&Proposal) -> SignedResponse + Send + Sync + 'static) {
        *self.responder.lock() = Some(Arc::new(f));
    }

    pub fn received(&self) -> Vec<Proposal> {
        self.received.lock().clone()
    }
}

#[async_trait]
impl DealStreamOpener for FakeStreams {
    async fn open_deal_stream(
        &self,
        _: PeerId,
        _: &[Multiaddr],
    ) -> anyhow::Result<Box<dyn DealStream>> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let responder = self.responder.lock().clone();
        let received = self.received.clone();
        tokio::spawn(async move {
            let mut framed =
                Framed::new(server, DagCborCodec::<SignedResponse, Proposal>::default());
            let Some(Ok(proposal)) = framed.next().await else {
                return;
            };
            received.lock().push(proposal.clone());
            if let Some(respond) = responder {
                let _ = framed.send(respond(&proposal)).await;
            }
        });
        Ok(Box::new(client))
    }
}
