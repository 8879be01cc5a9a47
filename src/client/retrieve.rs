// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::ClientApi;
use super::import::blocking;
use crate::error::{MarketError, Result};
use crate::market::{QueryOffer, RetrievalDealId, RetrievalDealState};
use crate::retrieval::{self, ExportRef, FileRef, RetrievalOrder, RetrievalTask};
use cid::Cid;
use fvm_shared4::address::Address;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument as _, debug, info};

impl ClientApi {
    pub async fn find_data(&self, root: &Cid, piece: Option<&Cid>) -> Result<Vec<QueryOffer>> {
        retrieval::find_data(self.chain.as_ref(), self.retrieval.as_ref(), root, piece).await
    }

    pub async fn miner_query_offer(
        &self,
        miner: &Address,
        root: &Cid,
        piece: Option<&Cid>,
    ) -> Result<QueryOffer> {
        retrieval::miner_query_offer(
            self.chain.as_ref(),
            self.retrieval.as_ref(),
            miner,
            root,
            piece,
        )
        .await
    }

    /// Starts a retrieval in the background. With `file` set the payload is
    /// written there once every block has arrived.
    pub fn retrieve(
        &self,
        order: RetrievalOrder,
        file: Option<FileRef>,
        cancel: CancellationToken,
    ) -> RetrievalTask {
        self.orchestrator.start(order, file, cancel)
    }

    /// Runs a retrieval to its end, logging progress as it goes.
    pub async fn retrieve_blocking(
        &self,
        order: RetrievalOrder,
        file: Option<FileRef>,
        cancel: CancellationToken,
    ) -> Result<Option<RetrievalDealId>> {
        let task = self.retrieve(order, file, cancel);
        while let Ok(event) = task.events.recv_async().await {
            debug!(
                event = %event.event,
                status = %event.status,
                bytes = event.bytes_received,
                "retrieval progress"
            );
        }
        task.outcome().await
    }

    /// Writes a stored payload to the filesystem, as a file tree or a CARv1.
    /// A cancelled export leaves no output behind.
    pub async fn export(
        &self,
        export: ExportRef,
        file: FileRef,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let materializer = self.materializer();
        let cancel = cancel.clone();
        blocking(move || materializer.export(&export, &file, &cancel)).await
    }

    /// Asks the retrieval client to cancel a deal. Gives up with
    /// [`MarketError::Cancelled`] if `cancel` fires first.
    pub async fn cancel_retrieval(
        &self,
        deal: RetrievalDealId,
        cancel: &CancellationToken,
    ) -> Result<()> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(MarketError::Cancelled),
            cancelled = self.retrieval.cancel_deal(deal) => {
                cancelled.map_err(|e| {
                    MarketError::Other(e.context(format!("failed to cancel retrieval deal {deal}")))
                })?;
                info!(%deal, "retrieval cancelled");
                Ok(())
            }
        }
    }

    pub async fn list_retrievals(&self) -> Result<Vec<RetrievalDealState>> {
        Ok(self.retrieval.list_deals().await?)
    }

    /// Streams the state of every retrieval deal until `cancel` fires or the
    /// receiver is dropped.
    pub fn get_retrieval_updates(
        &self,
        cancel: CancellationToken,
    ) -> flume::Receiver<RetrievalDealState> {
        let subscription = self.retrieval.subscribe_to_events();
        let (tx, rx) = flume::unbounded();
        tokio::spawn(
            async move {
                loop {
                    let update = tokio::select! {
                        _ = cancel.cancelled() => break,
                        update = subscription.recv() => update,
                    };
                    let Some(update) = update else { break };
                    if tx.send_async(update.state).await.is_err() {
                        break;
                    }
                }
                subscription.unsubscribe();
                debug!("retrieval update feed closed");
            }
            .in_current_span(),
        );
        rx
    }
}
