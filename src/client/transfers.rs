// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::ClientApi;
use crate::error::{MarketError, Result};
use crate::market::{ChannelId, DataTransferChannel, TransferId};
use fvm_shared4::address::Address;
use libp2p::PeerId;
use std::str::FromStr as _;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument as _, debug, info};

impl ClientApi {
    /// Transfers the data transfer library is running, seen from this node.
    pub async fn list_data_transfers(&self) -> Result<Vec<DataTransferChannel>> {
        let local = self.data_transfer.local_peer();
        Ok(self
            .data_transfer
            .in_progress_channels()
            .await?
            .into_iter()
            .map(|state| DataTransferChannel::new(local, state))
            .collect())
    }

    /// Streams every channel change until `cancel` fires or the receiver is
    /// dropped.
    pub fn data_transfer_updates(
        &self,
        cancel: CancellationToken,
    ) -> flume::Receiver<DataTransferChannel> {
        let local = self.data_transfer.local_peer();
        let subscription = self.data_transfer.subscribe_to_events();
        let (tx, rx) = flume::unbounded();
        tokio::spawn(
            async move {
                loop {
                    let state = tokio::select! {
                        _ = cancel.cancelled() => break,
                        state = subscription.recv() => state,
                    };
                    let Some(state) = state else { break };
                    if tx
                        .send_async(DataTransferChannel::new(local, state))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                subscription.unsubscribe();
                debug!("data transfer update feed closed");
            }
            .in_current_span(),
        );
        rx
    }

    pub async fn restart_data_transfer(
        &self,
        id: TransferId,
        other: PeerId,
        is_initiator: bool,
    ) -> Result<()> {
        let channel = self.channel(id, other, is_initiator);
        self.data_transfer
            .restart_channel(&channel)
            .await
            .map_err(|e| e.context(format!("failed to restart data transfer {id}")))?;
        info!(%id, %other, "data transfer restarted");
        Ok(())
    }

    pub async fn cancel_data_transfer(
        &self,
        id: TransferId,
        other: PeerId,
        is_initiator: bool,
    ) -> Result<()> {
        let channel = self.channel(id, other, is_initiator);
        self.data_transfer
            .close_channel(&channel)
            .await
            .map_err(|e| e.context(format!("failed to cancel data transfer {id}")))?;
        info!(%id, %other, "data transfer cancelled");
        Ok(())
    }

    /// The configured default market address.
    pub fn default_address(&self) -> Result<Address> {
        let addr = self
            .config
            .client
            .default_market_address
            .as_deref()
            .ok_or_else(|| MarketError::NotFound("default market address".into()))?;
        Address::from_str(addr).map_err(|e| {
            MarketError::Other(anyhow::anyhow!(
                "invalid default market address {addr:?}: {e}"
            ))
        })
    }

    fn channel(&self, id: TransferId, other: PeerId, is_initiator: bool) -> ChannelId {
        ChannelId::between(self.data_transfer.local_peer(), other, id, is_initiator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::{harness, harness_with};
    use crate::market::ChannelState;
    use crate::test_utils::{cid_of, peer_id};
    use pretty_assertions::assert_eq;

    /// A pull of `cid_of(b"payload")` from `peer_id(9)` that this node opened.
    fn retrieval_channel(id: u64) -> ChannelState {
        ChannelState {
            id: ChannelId {
                initiator: peer_id(1),
                responder: peer_id(9),
                id: TransferId(id),
            },
            status: 1,
            base_cid: cid_of(b"payload"),
            sender: peer_id(9),
            recipient: peer_id(1),
            is_pull: true,
            voucher: "retrieval".into(),
            message: String::new(),
            sent: 0,
            received: 4096,
        }
    }

    #[tokio::test]
    async fn channels_are_seen_from_this_node() {
        let h = harness();
        let mut push = retrieval_channel(2);
        push.is_pull = false;
        push.sender = peer_id(1);
        push.recipient = peer_id(9);
        push.sent = 100;
        let mut served = push.clone();
        served.id = ChannelId::between(peer_id(1), peer_id(7), TransferId(3), false);
        served.is_pull = true;
        served.recipient = peer_id(7);
        *h.data_transfer.channels.lock() = vec![retrieval_channel(1), push, served];

        let channels = h.client.list_data_transfers().await.unwrap();
        let seen = channels
            .iter()
            .map(|c| (c.is_initiator, c.is_sender, c.other_peer, c.transferred))
            .collect::<Vec<_>>();
        assert_eq!(
            seen,
            vec![
                (true, false, peer_id(9), 4096),
                (true, true, peer_id(9), 100),
                (false, true, peer_id(7), 100),
            ]
        );
    }

    #[tokio::test]
    async fn restart_and_cancel_orient_the_channel() {
        let h = harness();
        *h.data_transfer.channels.lock() = vec![retrieval_channel(1)];

        h.client
            .restart_data_transfer(TransferId(1), peer_id(9), true)
            .await
            .unwrap();
        assert_eq!(h.data_transfer.restarted(), vec![retrieval_channel(1).id]);

        let err = h
            .client
            .cancel_data_transfer(TransferId(1), peer_id(9), false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to cancel data transfer 1"), "{err}");
        h.client
            .cancel_data_transfer(TransferId(1), peer_id(9), true)
            .await
            .unwrap();
        assert!(h.client.list_data_transfers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn updates_stop_when_cancelled() {
        let h = harness();
        let cancel = CancellationToken::new();
        let updates = h.client.data_transfer_updates(cancel.clone());
        h.data_transfer.events.publish(retrieval_channel(5));
        let channel = updates.recv_async().await.unwrap();
        assert_eq!(channel.transfer_id, TransferId(5));
        assert_eq!(channel.base_cid, cid_of(b"payload"));

        cancel.cancel();
        assert!(updates.recv_async().await.is_err());
        assert_eq!(h.data_transfer.events.subscribers(), 0);
    }

    #[test]
    fn default_address_comes_from_the_config() {
        let h = harness();
        assert!(matches!(
            h.client.default_address(),
            Err(MarketError::NotFound(_))
        ));
        let h = harness_with(|c| c.client.default_market_address = Some("f01234".into()), false);
        assert_eq!(h.client.default_address().unwrap(), Address::new_id(1234));
        let h = harness_with(|c| c.client.default_market_address = Some("nope".into()), false);
        assert!(h.client.default_address().is_err());
    }
}
