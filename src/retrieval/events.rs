// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::market::{
    ClientEvent, Outcome, RetrievalDealState, RetrievalDealStatus, RetrievalDealUpdate,
};
use fvm_shared4::econ::TokenAmount;

/// Progress of one retrieval attempt, as delivered to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievalEvent {
    pub event: ClientEvent,
    pub status: RetrievalDealStatus,
    /// Running total for the attempt.
    pub bytes_received: u64,
    pub funds_spent: TokenAmount,
    /// Provider message, set once the deal has failed.
    pub err: Option<String>,
}

impl From<&RetrievalDealUpdate> for RetrievalEvent {
    fn from(update: &RetrievalDealUpdate) -> Self {
        let RetrievalDealState {
            status,
            total_received,
            funds_spent,
            message,
            ..
        } = &update.state;
        Self {
            event: update.event,
            status: *status,
            bytes_received: *total_received,
            funds_spent: funds_spent.clone(),
            err: (status.outcome() == Outcome::Failure).then(|| message.clone()),
        }
    }
}

/// Lifecycle of a retrieval attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display)]
pub enum RetrievalState {
    #[default]
    Unstarted,
    /// Resolving the provider and checking for a local copy.
    Querying,
    /// Subscribed, retrieval requested, no event for this deal yet.
    AwaitingEvents,
    InProgress,
    Completed,
    Rejected,
    Cancelled,
    Errored,
}

impl RetrievalState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Rejected | Self::Cancelled | Self::Errored
        )
    }

    /// Terminal state matching a provider reported deal status, if any.
    pub(super) fn from_status(status: RetrievalDealStatus) -> Option<Self> {
        match status {
            RetrievalDealStatus::Completed => Some(Self::Completed),
            RetrievalDealStatus::Rejected => Some(Self::Rejected),
            RetrievalDealStatus::Cancelled => Some(Self::Cancelled),
            RetrievalDealStatus::DealNotFound | RetrievalDealStatus::Errored => {
                Some(Self::Errored)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeRetrieval, cid_of};
    use crate::market::RetrievalDealId;
    use strum::IntoEnumIterator as _;

    #[test]
    fn failures_carry_the_provider_message() {
        let update = FakeRetrieval::update(
            RetrievalDealId(3),
            cid_of(b"payload"),
            RetrievalDealStatus::Rejected,
            0,
        );
        let event = RetrievalEvent::from(&update);
        assert_eq!(event.err.as_deref(), Some("Rejected"));

        let update = FakeRetrieval::update(
            RetrievalDealId(3),
            cid_of(b"payload"),
            RetrievalDealStatus::Ongoing,
            100,
        );
        let event = RetrievalEvent::from(&update);
        assert_eq!(event.err, None);
        assert_eq!(event.bytes_received, 100);
    }

    #[test]
    fn terminal_states_match_terminal_outcomes() {
        for status in RetrievalDealStatus::iter() {
            let terminal = RetrievalState::from_status(status);
            assert_eq!(
                terminal.is_some(),
                status.outcome() != Outcome::Pending,
                "{status}"
            );
            assert!(terminal.is_none_or(RetrievalState::is_terminal));
        }
    }
}
