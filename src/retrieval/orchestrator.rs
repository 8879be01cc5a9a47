// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Drives one retrieval attempt from request to materialized output.
//!
//! The event subscription is opened before the retrieval is requested, since
//! providers may report progress before the request returns a deal id. Until
//! the id is known events are kept when they concern the requested payload;
//! afterwards only events of that exact deal are delivered. Several attempts
//! for one payload can therefore run side by side.

use super::events::{RetrievalEvent, RetrievalState};
use super::materialize::{ExportRef, FileRef, Materializer};
use super::query::miner_peer_id;
use crate::db::accessor::RetrievalBlockstoreAccessor;
use crate::error::{MarketError, Result};
use crate::imports::ImportManager;
use crate::market::api::{ChainApi, RetrievalClient, Subscription};
use crate::market::{
    Outcome, RetrievalDealId, RetrievalDealStatus, RetrievalDealUpdate, RetrievalOrder,
    RetrievalPeer,
};
use std::io;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument as _, debug, info, info_span, warn};

/// Handle on a running retrieval.
pub struct RetrievalTask {
    /// Progress in production order. Closed once the attempt is over.
    pub events: flume::Receiver<RetrievalEvent>,
    pub state: watch::Receiver<RetrievalState>,
    cancel: CancellationToken,
    outcome: JoinHandle<Result<Option<RetrievalDealId>>>,
}

impl RetrievalTask {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the attempt to end. Returns the deal id, or `None` when the
    /// payload was already available locally.
    pub async fn outcome(self) -> Result<Option<RetrievalDealId>> {
        self.outcome
            .await
            .map_err(|e| MarketError::Other(anyhow::anyhow!("retrieval task failed: {e}")))?
    }

    /// Drains every event, then returns the outcome.
    pub async fn wait(self) -> (Vec<RetrievalEvent>, Result<Option<RetrievalDealId>>) {
        let mut events = vec![];
        while let Ok(event) = self.events.recv_async().await {
            events.push(event);
        }
        (events, self.outcome().await)
    }
}

pub(crate) struct Orchestrator {
    pub chain: Arc<dyn ChainApi>,
    pub retrieval: Arc<dyn RetrievalClient>,
    pub imports: Arc<ImportManager>,
    pub accessor: Arc<RetrievalBlockstoreAccessor>,
    pub event_buffer: usize,
}

impl Orchestrator {
    /// Spawns the attempt. `cancel` stops it at any suspension point.
    pub fn start(
        self: &Arc<Self>,
        order: RetrievalOrder,
        file: Option<FileRef>,
        cancel: CancellationToken,
    ) -> RetrievalTask {
        let (events_tx, events) = flume::bounded(self.event_buffer.max(1));
        let (state_tx, state) = watch::channel(RetrievalState::Unstarted);
        let attempt = Attempt {
            orchestrator: self.clone(),
            events: events_tx,
            state: state_tx,
            cancel: cancel.clone(),
        };
        let span = info_span!("retrieval", root = %order.root, miner = %order.miner);
        let outcome = tokio::spawn(attempt.run(order, file).instrument(span));
        RetrievalTask {
            events,
            state,
            cancel,
            outcome,
        }
    }
}

struct Attempt {
    orchestrator: Arc<Orchestrator>,
    events: flume::Sender<RetrievalEvent>,
    state: watch::Sender<RetrievalState>,
    cancel: CancellationToken,
}

impl Attempt {
    async fn run(self, order: RetrievalOrder, file: Option<FileRef>) -> Result<Option<RetrievalDealId>> {
        let result = self.retrieve(&order).await;
        let terminal = match &result {
            Ok(_) => RetrievalState::Completed,
            Err(MarketError::Cancelled) => RetrievalState::Cancelled,
            // protocol failures already set the terminal state
            Err(MarketError::Protocol(_)) if self.state.borrow().is_terminal() => {
                *self.state.borrow()
            }
            Err(_) => RetrievalState::Errored,
        };
        let deal_id = match result {
            Ok(deal_id) => deal_id,
            Err(e) => {
                self.state.send_replace(terminal);
                return Err(e);
            }
        };

        if let Some(file) = file {
            let export = ExportRef {
                root: order.root,
                from_local: deal_id.is_none(),
                deal_id,
            };
            let materializer = Materializer::new(
                self.orchestrator.imports.clone(),
                self.orchestrator.accessor.clone(),
            );
            let cancel = self.cancel.clone();
            let export =
                tokio::task::spawn_blocking(move || materializer.export(&export, &file, &cancel));
            let exported = tokio::select! {
                _ = self.cancel.cancelled() => Err(MarketError::Cancelled),
                exported = export => exported
                    .map_err(|e| MarketError::Other(anyhow::anyhow!("export task failed: {e}")))
                    .and_then(|exported| exported),
            };
            if let Err(e) = exported {
                self.state.send_replace(match e {
                    MarketError::Cancelled => RetrievalState::Cancelled,
                    _ => RetrievalState::Errored,
                });
                return Err(e);
            }
        }
        self.state.send_replace(terminal);
        Ok(deal_id)
    }

    async fn retrieve(&self, order: &RetrievalOrder) -> Result<Option<RetrievalDealId>> {
        self.state.send_replace(RetrievalState::Querying);
        if !self.orchestrator.imports.find_by_root(&order.root).is_empty() {
            info!("payload available locally, skipping retrieval");
            return Ok(None);
        }
        if order.size == 0 {
            return Err(anyhow::anyhow!("cannot make retrieval deal for zero bytes").into());
        }
        let peer = match &order.miner_peer {
            Some(peer) => peer.clone(),
            None => {
                let id = tokio::select! {
                    _ = self.cancel.cancelled() => return Err(MarketError::Cancelled),
                    id = miner_peer_id(self.orchestrator.chain.as_ref(), &order.miner) => id?,
                };
                RetrievalPeer {
                    address: order.miner,
                    id,
                    piece_cid: order.piece,
                }
            }
        };

        let subscription = self.orchestrator.retrieval.subscribe_to_events();
        let result = self.follow(order, &peer, &subscription).await;
        subscription.unsubscribe();

        let deal_id = result?;
        self.orchestrator.accessor.done(deal_id)?;
        info!(%deal_id, "retrieval completed");
        Ok(Some(deal_id))
    }

    /// Requests the retrieval and relays its events until a terminal one.
    /// The archive of a deal that does not complete is discarded.
    async fn follow(
        &self,
        order: &RetrievalOrder,
        peer: &RetrievalPeer,
        subscription: &Subscription<RetrievalDealUpdate>,
    ) -> Result<RetrievalDealId> {
        self.state.send_replace(RetrievalState::AwaitingEvents);
        let request = self.orchestrator.retrieval.retrieve(
            order.params(),
            order.total.clone(),
            peer,
            &order.client,
            &order.miner,
        );
        tokio::pin!(request);

        let mut early = vec![];
        let deal_id = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(MarketError::Cancelled),
                deal_id = &mut request => break deal_id?,
                Some(update) = subscription.recv() => {
                    if update.state.payload_cid == order.root {
                        early.push(update);
                    }
                }
            }
        };
        debug!(%deal_id, early = early.len(), "retrieval requested");

        match self.relay(order, deal_id, early, subscription).await {
            Ok(()) => Ok(deal_id),
            Err(e) => {
                self.orchestrator.accessor.discard(deal_id);
                Err(e)
            }
        }
    }

    async fn relay(
        &self,
        order: &RetrievalOrder,
        deal_id: RetrievalDealId,
        early: Vec<RetrievalDealUpdate>,
        subscription: &Subscription<RetrievalDealUpdate>,
    ) -> Result<()> {
        let mut early = early.into_iter();
        loop {
            let update = match early.next() {
                Some(update) => update,
                None => tokio::select! {
                    _ = self.cancel.cancelled() => return Err(MarketError::Cancelled),
                    update = subscription.recv() => update.ok_or_else(|| {
                        io::Error::new(io::ErrorKind::UnexpectedEof, "retrieval event feed closed")
                    })?,
                },
            };
            if update.state.id != deal_id || update.state.payload_cid != order.root {
                continue;
            }
            self.state.send_if_modified(|state| {
                let waiting = *state == RetrievalState::AwaitingEvents;
                if waiting {
                    *state = RetrievalState::InProgress;
                }
                waiting
            });

            self.deliver(RetrievalEvent::from(&update)).await?;

            let status = update.state.status;
            match status.outcome() {
                Outcome::Success => return Ok(()),
                Outcome::Failure => {
                    if let Some(terminal) = RetrievalState::from_status(status) {
                        self.state.send_replace(terminal);
                    }
                    return Err(MarketError::Protocol(failure_message(
                        status,
                        &update.state.message,
                    )));
                }
                Outcome::Pending => {}
            }
        }
    }

    async fn deliver(&self, event: RetrievalEvent) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(MarketError::Cancelled),
            sent = self.events.send_async(event) => {
                if sent.is_err() {
                    warn!("progress receiver dropped, retrieval continues");
                }
                Ok(())
            }
        }
    }
}

fn failure_message(status: RetrievalDealStatus, message: &str) -> String {
    match status {
        RetrievalDealStatus::Rejected => format!("retrieval proposal rejected: {message}"),
        RetrievalDealStatus::Cancelled => {
            format!("retrieval was cancelled externally: {message}")
        }
        _ => format!("retrieval error: {message}"),
    }
}
