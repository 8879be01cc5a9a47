// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! One-shot proposal exchange of stateless deals.
//!
//! The client writes a single [`Proposal`] frame and reads a single
//! [`SignedResponse`] frame. There are no retries: any failure means the
//! deal has to be negotiated again from the start.

use super::codec::DagCborCodec;
use crate::error::{MarketError, Result};
use crate::market::{Proposal, Response, SignedResponse, StorageDealStatus};
use cid::Cid;
use futures::{SinkExt, StreamExt as _};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type ClientFramed<S> = Framed<S, DagCborCodec<Proposal, SignedResponse>>;

/// Sends `proposal` over `stream` and checks the provider's answer.
///
/// Returns the accepted proposal CID. Hitting `timeout` or `cancel` yields
/// [`MarketError::Cancelled`].
#[tracing::instrument(level = "debug", skip_all, fields(provider = %proposal.deal_proposal.proposal.provider))]
pub async fn propose<S>(
    stream: S,
    proposal: &Proposal,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Cid>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let sent = proposal.deal_proposal.cid()?;
    let mut framed = Framed::new(stream, DagCborCodec::default());
    let signed = tokio::select! {
        _ = cancel.cancelled() => return Err(MarketError::Cancelled),
        exchanged = tokio::time::timeout(timeout, exchange(&mut framed, proposal)) => {
            exchanged.map_err(|_| MarketError::Cancelled)??
        }
    };
    if let Err(e) = SinkExt::<Proposal>::close(&mut framed).await {
        debug!("closing deal stream: {e}");
    }
    verify_response(&sent, &signed.response)?;
    debug!(proposal = %sent, "provider is waiting for data");
    Ok(sent)
}

async fn exchange<S>(framed: &mut ClientFramed<S>, proposal: &Proposal) -> io::Result<SignedResponse>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    framed.send(proposal.clone()).await?;
    match framed.next().await {
        Some(response) => response,
        None => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "stream closed before the provider answered",
        )),
    }
}

/// The echoed proposal CID is checked before the state, so an answer to some
/// other proposal is never mistaken for a rejection of this one.
pub fn verify_response(sent: &Cid, response: &Response) -> Result<()> {
    if response.proposal != *sent {
        return Err(MarketError::Integrity(format!(
            "provider returned proposal cid {} but we expected {sent}",
            response.proposal
        )));
    }
    match response.state {
        StorageDealStatus::WaitingForData => Ok(()),
        state if state.is_rejection() => Err(MarketError::Protocol(format!(
            "proposal {sent} {state}: {}",
            response.message
        ))),
        state => Err(MarketError::Integrity(format!(
            "provider returned unexpected state {state} for proposal {sent}, with message: {}",
            response.message
        ))),
    }
}
