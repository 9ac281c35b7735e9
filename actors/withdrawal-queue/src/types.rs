// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_ipld_encoding::tuple::*;
use fvm_shared::address::Address;
use fvm_shared::bigint::{bigint_ser, BigInt};
use fvm_shared::econ::TokenAmount;
use fvm_shared::ActorID;
use lazy_static::lazy_static;

/// Identifier of a withdrawal request, dense from 1. Id 0 is the sentinel row.
pub type RequestID = u64;

/// Upper bound on the number of batches a single finalization may carry.
pub const MAX_BATCHES: usize = 36;

/// Upper bound on requests examined by one batch-calculation invocation.
pub const MAX_REQUESTS_PER_CALL: u64 = 1000;

/// Checkpoint index returned when no checkpoint governs a request.
pub const NOT_FOUND: u64 = 0;

lazy_static! {
    /// Share rates are fixed-point integers scaled by 1e27.
    pub static ref E27: BigInt = BigInt::from(1_000_000_000_000_000_000_000_000_000_u128);

    /// Share-rate cap meaning "no discount applied".
    pub static ref UNLIMITED: BigInt = (BigInt::from(1) << 256usize) - 1;
}

#[derive(Serialize_tuple, Deserialize_tuple, Debug, Clone, Eq, PartialEq)]
pub struct ConstructorParams {
    /// The staked-token actor trusted for custody and share bookkeeping.
    pub stk_token: Address,
    /// The report oracle, authorized to finalize and to stamp report times.
    pub oracle: Address,
}

#[derive(Serialize_tuple, Deserialize_tuple, Debug, Clone, Eq, PartialEq)]
pub struct RequestWithdrawalParams {
    /// STK surrendered by the owner, already in the token's custody.
    pub amount: TokenAmount,
    /// Shares backing that amount at the current share rate.
    #[serde(with = "bigint_ser")]
    pub shares: BigInt,
    /// Principal allowed to claim or transfer the request.
    pub owner: Address,
}

/// Resumable state of an off-chain batch calculation, threaded by the caller
/// across invocations until `finished` is true.
#[derive(Serialize_tuple, Deserialize_tuple, Debug, Clone, Eq, PartialEq)]
pub struct BatchesCalculationState {
    /// NAT still available to reserve for further requests.
    pub remaining_nat_budget: TokenAmount,
    /// True once no further invocation can make progress under this budget.
    pub finished: bool,
    /// Ending request id of each batch, strictly increasing.
    pub batches: Vec<RequestID>,
}

impl BatchesCalculationState {
    pub fn new(nat_budget: TokenAmount) -> Self {
        Self { remaining_nat_budget: nat_budget, finished: false, batches: Vec::new() }
    }
}

#[derive(Serialize_tuple, Deserialize_tuple, Debug, Clone, Eq, PartialEq)]
pub struct CalculateFinalizationBatchesParams {
    /// Share-rate cap reported by the oracle, scaled by 1e27.
    #[serde(with = "bigint_ser")]
    pub max_share_rate: BigInt,
    /// Requests created after this moment are left for the next report.
    pub max_timestamp: u64,
    pub state: BatchesCalculationState,
}

#[derive(Serialize_tuple, Deserialize_tuple, Debug, Clone, Eq, PartialEq)]
pub struct PrefinalizeParams {
    pub batches: Vec<RequestID>,
    #[serde(with = "bigint_ser")]
    pub max_share_rate: BigInt,
}

#[derive(Serialize_tuple, Deserialize_tuple, Debug, Clone, Eq, PartialEq)]
pub struct PrefinalizeReturn {
    pub nat_to_lock: TokenAmount,
    #[serde(with = "bigint_ser")]
    pub shares_to_burn: BigInt,
}

#[derive(Serialize_tuple, Deserialize_tuple, Debug, Clone, Eq, PartialEq)]
pub struct FinalizeParams {
    pub batches: Vec<RequestID>,
    #[serde(with = "bigint_ser")]
    pub max_share_rate: BigInt,
}

#[derive(Serialize_tuple, Deserialize_tuple, Debug, Clone, Eq, PartialEq)]
#[serde(transparent)]
pub struct OnOracleReportParams {
    pub report_timestamp: u64,
}

#[derive(Serialize_tuple, Deserialize_tuple, Debug, Clone, Eq, PartialEq)]
pub struct FindCheckpointHintParams {
    pub request_id: RequestID,
    /// Left end of the checkpoint range to search, at least 1.
    pub start: u64,
    /// Right end of the checkpoint range to search.
    pub end: u64,
}

#[derive(Serialize_tuple, Deserialize_tuple, Debug, Clone, Eq, PartialEq)]
pub struct ClaimParams {
    pub request_id: RequestID,
    /// Index of the checkpoint governing the request, found off-chain.
    pub hint: u64,
    pub recipient: Address,
}

#[derive(Serialize_tuple, Deserialize_tuple, Debug, Clone, Eq, PartialEq)]
#[serde(transparent)]
pub struct GetWithdrawalStatusParams {
    pub request_id: RequestID,
}

#[derive(Serialize_tuple, Deserialize_tuple, Debug, Clone, Eq, PartialEq)]
pub struct WithdrawalStatus {
    pub amount_stk: TokenAmount,
    #[serde(with = "bigint_ser")]
    pub amount_shares: BigInt,
    pub owner: ActorID,
    pub created_at: u64,
    pub is_finalized: bool,
    pub is_claimed: bool,
}

#[derive(Serialize_tuple, Deserialize_tuple, Debug, Clone, Eq, PartialEq)]
#[serde(transparent)]
pub struct GetWithdrawalRequestsOfParams {
    pub owner: Address,
}

#[derive(Serialize_tuple, Deserialize_tuple, Debug, Clone, Eq, PartialEq)]
pub struct GetClaimableNatParams {
    pub request_id: RequestID,
    pub hint: u64,
}

#[derive(Serialize_tuple, Deserialize_tuple, Debug, Clone, Eq, PartialEq)]
pub struct QueueInfoReturn {
    pub last_request_id: RequestID,
    pub last_finalized_request_id: RequestID,
    pub last_checkpoint_index: u64,
    pub locked_nat: TokenAmount,
}
