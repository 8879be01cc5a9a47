// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::Cid;
use thiserror::Error;

/// Errors surfaced by the market client.
///
/// Every variant is returned to the immediate caller. Nothing here is retried
/// automatically.
#[derive(Debug, Error)]
pub enum MarketError {
    /// Malformed or internally inconsistent archive. The archive must be
    /// discarded and rebuilt.
    #[error("malformed archive: {0}")]
    Format(String),

    /// The provider answered a proposal other than the one that was sent, or
    /// answered it with an unexpected state.
    #[error("handshake integrity failure: {0}")]
    Integrity(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The remote peer explicitly rejected, cancelled or failed the operation.
    #[error("provider reported failure: {0}")]
    Protocol(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Failure of an external collaborator (chain, deal library, signer).
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, MarketError>;

impl MarketError {
    pub(crate) fn format(msg: impl std::fmt::Display) -> Self {
        Self::Format(msg.to_string())
    }

    pub(crate) fn block_not_found(cid: &Cid) -> Self {
        Self::NotFound(format!("block {cid}"))
    }

    /// Recovers the typed error behind an `anyhow` chain, as returned by
    /// blockstores and the DAG builder.
    pub(crate) fn from_anyhow(e: anyhow::Error) -> Self {
        match e.downcast::<MarketError>() {
            Ok(e) => e,
            Err(e) => match e.downcast::<std::io::Error>() {
                Ok(e) => Self::Io(e),
                Err(e) => Self::Other(e),
            },
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<fvm_ipld_encoding::Error> for MarketError {
    fn from(e: fvm_ipld_encoding::Error) -> Self {
        Self::Format(e.to_string())
    }
}
