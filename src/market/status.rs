// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Numeric status codes shared with storage providers. The discriminants are
//! part of the wire format.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

macro_rules! wire_enum_serde {
    ($name:ident, $repr:ty) => {
        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                (*self as $repr).serialize(serializer)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let code = <$repr>::deserialize(deserializer)?;
                Self::from_repr(code).ok_or_else(|| {
                    serde::de::Error::custom(format!(
                        concat!("unknown ", stringify!($name), " {}"),
                        code
                    ))
                })
            }
        }
    };
}

/// State of a storage deal as tracked by the client and the provider.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::FromRepr, strum::Display, strum::EnumIter,
)]
#[repr(u64)]
pub enum StorageDealStatus {
    Unknown = 0,
    ProposalNotFound = 1,
    ProposalRejected = 2,
    ProposalAccepted = 3,
    Staged = 4,
    Sealing = 5,
    Finalizing = 6,
    Active = 7,
    Expired = 8,
    Slashed = 9,
    Rejecting = 10,
    Failing = 11,
    FundsReserved = 12,
    CheckForAcceptance = 13,
    Validating = 14,
    AcceptWait = 15,
    StartDataTransfer = 16,
    Transferring = 17,
    WaitingForData = 18,
    VerifyData = 19,
    ReserveProviderFunds = 20,
    ReserveClientFunds = 21,
    ProviderFunding = 22,
    ClientFunding = 23,
    Publish = 24,
    Publishing = 25,
    Error = 26,
    ProviderTransferAwaitRestart = 27,
    ClientTransferRestart = 28,
    AwaitingPreCommit = 29,
}

wire_enum_serde!(StorageDealStatus, u64);

impl StorageDealStatus {
    /// Provider states that mean the proposal was turned down.
    pub fn is_rejection(self) -> bool {
        matches!(
            self,
            Self::ProposalRejected | Self::Rejecting | Self::Failing | Self::Error
        )
    }

    /// Name of a raw status code, as reported by `get_deal_status`.
    pub fn name_of(code: u64) -> Option<String> {
        Self::from_repr(code).map(|s| format!("StorageDeal{s}"))
    }
}

/// State of a retrieval deal.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::FromRepr, strum::Display, strum::EnumIter,
)]
#[repr(u64)]
pub enum RetrievalDealStatus {
    New = 0,
    Unsealing = 1,
    Unsealed = 2,
    WaitingForAcceptance = 3,
    PaymentChannelCreating = 4,
    PaymentChannelAddingFunds = 5,
    Accepted = 6,
    FundsNeededUnseal = 7,
    Failing = 8,
    Rejected = 9,
    FundsNeeded = 10,
    SendFunds = 11,
    SendFundsLastPayment = 12,
    Ongoing = 13,
    FundsNeededLastPayment = 14,
    Completed = 15,
    DealNotFound = 16,
    Errored = 17,
    BlocksComplete = 18,
    Finalizing = 19,
    Completing = 20,
    CheckComplete = 21,
    CheckFunds = 22,
    InsufficientFunds = 23,
    PaymentChannelAllocatingLane = 24,
    Cancelling = 25,
    Cancelled = 26,
    RetryLegacy = 27,
    WaitForAcceptanceLegacy = 28,
    ClientWaitingForLastBlocks = 29,
    PaymentChannelAddingInitialFunds = 30,
    Erroring = 31,
    Rejecting = 32,
    DealNotFoundCleanup = 33,
    FinalizingBlockstore = 34,
}

wire_enum_serde!(RetrievalDealStatus, u64);

/// How a retrieval attempt ends, judged from a single status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    Pending,
}

impl RetrievalDealStatus {
    pub fn outcome(self) -> Outcome {
        match self {
            Self::Completed => Outcome::Success,
            Self::Rejected | Self::Cancelled | Self::DealNotFound | Self::Errored => {
                Outcome::Failure
            }
            _ => Outcome::Pending,
        }
    }
}

/// Events emitted by the retrieval client state machine.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::FromRepr, strum::Display, strum::EnumIter,
)]
#[repr(u64)]
pub enum ClientEvent {
    Open = 0,
    DealProposed = 1,
    DealRejected = 2,
    DealNotFound = 3,
    DealAccepted = 4,
    ProviderCancelled = 5,
    UnknownResponseReceived = 6,
    PaymentChannelErrored = 7,
    AllocateLaneErrored = 8,
    PaymentChannelCreateInitiated = 9,
    PaymentChannelReady = 10,
    PaymentChannelAddingFunds = 11,
    PaymentChannelAddFundsErrored = 12,
    BlocksReceived = 13,
    PaymentRequested = 14,
    UnsealPaymentRequested = 15,
    AllBlocksReceived = 16,
    FundsExpended = 17,
    BadPaymentRequested = 18,
    CreateVoucherFailed = 19,
    WriteDealProposalErrored = 20,
    WriteDealPaymentErrored = 21,
    PaymentSent = 22,
    DataTransferError = 23,
    Complete = 24,
    CancelComplete = 25,
    ProviderErrored = 26,
    ClientErrored = 27,
    Cancel = 28,
}

wire_enum_serde!(ClientEvent, u64);

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator as _;

    #[test]
    fn waiting_for_data_code() {
        assert_eq!(StorageDealStatus::WaitingForData as u64, 18);
        assert_eq!(
            StorageDealStatus::name_of(18).as_deref(),
            Some("StorageDealWaitingForData")
        );
        assert_eq!(StorageDealStatus::name_of(1000), None);
    }

    #[test]
    fn codes_round_trip_through_cbor() {
        for status in StorageDealStatus::iter() {
            let bytes = fvm_ipld_encoding::to_vec(&status).unwrap();
            let back: StorageDealStatus = fvm_ipld_encoding::from_slice(&bytes).unwrap();
            assert_eq!(back, status);
        }
        assert!(fvm_ipld_encoding::from_slice::<RetrievalDealStatus>(
            &fvm_ipld_encoding::to_vec(&999u64).unwrap()
        )
        .is_err());
    }

    #[test]
    fn terminal_retrieval_states() {
        let terminal = RetrievalDealStatus::iter()
            .filter(|s| s.outcome() != Outcome::Pending)
            .collect::<Vec<_>>();
        assert_eq!(
            terminal,
            vec![
                RetrievalDealStatus::Rejected,
                RetrievalDealStatus::Completed,
                RetrievalDealStatus::DealNotFound,
                RetrievalDealStatus::Errored,
                RetrievalDealStatus::Cancelled,
            ]
        );
    }
}
