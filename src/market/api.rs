// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Capabilities the market client consumes but does not implement.
//!
//! Chain access, the storage and retrieval deal libraries, the wallet and the
//! libp2p host all live elsewhere. Only their request/response and
//! subscription shapes are fixed here.

use super::types::*;
use async_trait::async_trait;
use cid::Cid;
use fvm_shared4::address::Address;
use fvm_shared4::clock::ChainEpoch;
use fvm_shared4::crypto::signature::Signature;
use fvm_shared4::error::ExitCode;
use fvm_shared4::econ::TokenAmount;
use fvm_shared4::piece::PaddedPieceSize;
use fvm_shared4::version::NetworkVersion;
use libp2p::{Multiaddr, PeerId};
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};

#[async_trait]
pub trait ChainApi: Send + Sync {
    /// Resolves `addr` to its key address.
    async fn state_account_key(&self, addr: &Address) -> anyhow::Result<Address>;
    async fn wallet_has(&self, addr: &Address) -> anyhow::Result<bool>;
    async fn state_miner_info(&self, miner: &Address) -> anyhow::Result<MinerInfo>;
    async fn state_miner_proving_deadline(&self, miner: &Address) -> anyhow::Result<DeadlineInfo>;
    async fn chain_head_height(&self) -> anyhow::Result<ChainEpoch>;
    async fn state_network_version(&self) -> anyhow::Result<NetworkVersion>;
    async fn state_deal_provider_collateral_bounds(
        &self,
        size: PaddedPieceSize,
        verified: bool,
    ) -> anyhow::Result<CollateralBounds>;
    /// Waits until `msg` is `confidence` epochs deep and returns its exit
    /// code.
    async fn state_wait_msg(&self, msg: &Cid, confidence: u64) -> anyhow::Result<ExitCode>;
}

#[async_trait]
pub trait StorageDealClient: Send + Sync {
    /// Returns the proposal CID of the new deal.
    async fn propose_storage_deal(&self, params: ProposeStorageDealParams) -> anyhow::Result<Cid>;
    async fn list_local_deals(&self) -> anyhow::Result<Vec<ClientDeal>>;
    async fn get_local_deal(&self, proposal_cid: &Cid) -> anyhow::Result<Option<ClientDeal>>;
    async fn get_ask(&self, info: &StorageProviderInfo) -> anyhow::Result<StorageAsk>;
    fn subscribe_to_events(&self) -> Subscription<ClientDeal>;
}

#[async_trait]
pub trait RetrievalClient: Send + Sync {
    async fn find_providers(&self, payload: &Cid) -> anyhow::Result<Vec<RetrievalPeer>>;
    async fn query(
        &self,
        peer: &RetrievalPeer,
        payload: &Cid,
        piece: Option<&Cid>,
    ) -> anyhow::Result<QueryResponse>;
    /// Starts a retrieval and returns its deal identity. Events for the deal
    /// may be published before this returns.
    async fn retrieve(
        &self,
        params: RetrievalParams,
        total_funds: TokenAmount,
        peer: &RetrievalPeer,
        client_wallet: &Address,
        miner_wallet: &Address,
    ) -> anyhow::Result<RetrievalDealId>;
    async fn cancel_deal(&self, id: RetrievalDealId) -> anyhow::Result<()>;
    async fn list_deals(&self) -> anyhow::Result<Vec<RetrievalDealState>>;
    fn subscribe_to_events(&self) -> Subscription<RetrievalDealUpdate>;
}

/// The data transfer library moving deal payloads over graphsync.
#[async_trait]
pub trait DataTransfer: Send + Sync {
    /// Peer identity of this node's host.
    fn local_peer(&self) -> PeerId;
    async fn in_progress_channels(&self) -> anyhow::Result<Vec<ChannelState>>;
    async fn restart_channel(&self, id: &ChannelId) -> anyhow::Result<()>;
    async fn close_channel(&self, id: &ChannelId) -> anyhow::Result<()>;
    fn subscribe_to_events(&self) -> Subscription<ChannelState>;
}

#[async_trait]
pub trait Signer: Send + Sync {
    async fn wallet_sign(
        &self,
        addr: &Address,
        msg: &[u8],
        meta: MsgMeta,
    ) -> anyhow::Result<Signature>;
}

/// A bidirectional byte stream to a provider.
pub trait DealStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> DealStream for T {}

#[async_trait]
pub trait DealStreamOpener: Send + Sync {
    /// Opens a stream speaking the deal proposal protocol.
    async fn open_deal_stream(
        &self,
        peer: PeerId,
        addrs: &[Multiaddr],
    ) -> anyhow::Result<Box<dyn DealStream>>;
}

/// Live event feed. Dropping it unsubscribes.
pub struct Subscription<T> {
    events: flume::Receiver<T>,
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl<T> Subscription<T> {
    pub fn new(
        events: flume::Receiver<T>,
        unsubscribe: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            events,
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// Next event, or `None` once the publisher has gone away.
    pub async fn recv(&self) -> Option<T> {
        self.events.recv_async().await.ok()
    }

    pub fn try_recv(&self) -> Option<T> {
        self.events.try_recv().ok()
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("pending", &self.events.len())
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn unsubscribes_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = flume::unbounded();
        let sub = Subscription::new(rx, {
            let calls = calls.clone();
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
            }
        });
        tx.send(1).unwrap();
        assert_eq!(sub.recv().await, Some(1));
        sub.unsubscribe();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn drop_unsubscribes_and_closed_feed_ends() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = flume::unbounded::<u8>();
        {
            let sub = Subscription::new(rx, {
                let calls = calls.clone();
                move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                }
            });
            drop(tx);
            assert_eq!(sub.recv().await, None);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
