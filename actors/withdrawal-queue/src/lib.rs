// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_ipld_encoding::ipld_block::IpldBlock;
use fvm_shared::address::Address;
use fvm_shared::econ::TokenAmount;
use fvm_shared::{METHOD_CONSTRUCTOR, METHOD_SEND};
use num_derive::FromPrimitive;
use num_traits::{Signed, Zero};

use lsp_actors_runtime::runtime::{ActorCode, Runtime};
use lsp_actors_runtime::{
    actor_dispatch, actor_error, extract_send_result, resolve_to_actor_id, ActorContext,
    ActorError, SYSTEM_ACTOR_ADDR,
};

use crate::policy::{MAX_WITHDRAWAL_STK, MIN_WITHDRAWAL_STK};

pub use self::state::{calc_batch, Checkpoint, State, WithdrawalRequest};
pub use self::types::*;

mod emit;
pub mod ext;
mod policy;
pub mod rebase;
mod state;
pub mod testing;
mod types;

/// Withdrawal queue actor methods available
#[derive(FromPrimitive)]
#[repr(u64)]
pub enum Method {
    Constructor = METHOD_CONSTRUCTOR,
    RequestWithdrawal = 2,
    CalculateFinalizationBatches = 3,
    Prefinalize = 4,
    Finalize = 5,
    OnOracleReport = 6,
    FindCheckpointHint = 7,
    Claim = 8,
    GetWithdrawalStatus = 9,
    GetWithdrawalRequestsOf = 10,
    GetClaimableNat = 11,
    GetQueueInfo = 12,
}

/// Withdrawal queue actor
pub struct Actor;

impl Actor {
    /// Constructor for the withdrawal queue actor
    pub fn constructor(rt: &impl Runtime, params: ConstructorParams) -> Result<(), ActorError> {
        rt.validate_immediate_caller_is(std::iter::once(&SYSTEM_ACTOR_ADDR))?;

        // Both collaborators must exist before the queue can route to them.
        let stk_token = resolve_to_actor_id(rt, &params.stk_token).map(Address::new_id)?;
        let oracle = resolve_to_actor_id(rt, &params.oracle).map(Address::new_id)?;

        let st = State::new(rt.store(), stk_token, oracle)
            .context("failed to construct withdrawal queue state")?;
        rt.create(&st)?;
        Ok(())
    }

    /// Appends a request surrendering `amount` STK (already in the token's
    /// custody) for a queued claim on NAT. Only the staked token may call;
    /// it has verified custody and computed the share equivalent.
    pub fn request_withdrawal(
        rt: &impl Runtime,
        params: RequestWithdrawalParams,
    ) -> Result<RequestID, ActorError> {
        let st: State = rt.state()?;
        rt.validate_immediate_caller_is(std::iter::once(&st.stk_token))?;

        if params.amount < *MIN_WITHDRAWAL_STK {
            return Err(
                actor_error!(illegal_argument; "withdrawal of {} below the minimum of {}", params.amount, *MIN_WITHDRAWAL_STK),
            );
        }
        if params.amount > *MAX_WITHDRAWAL_STK {
            return Err(
                actor_error!(illegal_argument; "withdrawal of {} above the maximum of {}", params.amount, *MAX_WITHDRAWAL_STK),
            );
        }
        if !params.shares.is_positive() {
            return Err(actor_error!(illegal_argument; "withdrawal backed by no shares"));
        }

        let owner = resolve_to_actor_id(rt, &params.owner)?;
        let requestor = resolve_to_actor_id(rt, &rt.message().origin())?;
        let now = rt.tipset_timestamp();

        let id = rt.transaction(|st: &mut State, rt| {
            st.enqueue(rt.store(), &params.amount, &params.shares, owner, now)
        })?;

        emit::withdrawal_requested(rt, id, requestor, owner, &params.amount, &params.shares)?;
        Ok(id)
    }

    /// Drives one step of the off-chain batch calculation. Read-only; the
    /// caller threads the returned state until `finished` is true.
    pub fn calculate_finalization_batches(
        rt: &impl Runtime,
        params: CalculateFinalizationBatchesParams,
    ) -> Result<BatchesCalculationState, ActorError> {
        rt.validate_immediate_caller_accept_any()?;
        let st: State = rt.state()?;
        st.calculate_finalization_batches(
            rt.store(),
            &params.max_share_rate,
            params.max_timestamp,
            params.state,
        )
    }

    /// Validates a batch list and reports the NAT it would lock and the
    /// shares it would burn. Read-only.
    pub fn prefinalize(
        rt: &impl Runtime,
        params: PrefinalizeParams,
    ) -> Result<PrefinalizeReturn, ActorError> {
        rt.validate_immediate_caller_accept_any()?;
        let st: State = rt.state()?;
        let (nat_to_lock, shares_to_burn) =
            st.prefinalize(rt.store(), &params.batches, &params.max_share_rate)?;
        Ok(PrefinalizeReturn { nat_to_lock, shares_to_burn })
    }

    /// Advances the finalized frontier over the given batches, locking the
    /// attached NAT and burning the covered shares at the staked token.
    pub fn finalize(rt: &impl Runtime, params: FinalizeParams) -> Result<(), ActorError> {
        let st: State = rt.state()?;
        rt.validate_immediate_caller_is(std::iter::once(&st.oracle))?;

        let amount = rt.message().value_received();
        let (from_id, to_id, shares_to_burn) = rt.transaction(|st: &mut State, rt| {
            let from_id = st.last_finalized_request_id + 1;
            let shares =
                st.finalize(rt.store(), &params.batches, &amount, &params.max_share_rate)?;
            Ok((from_id, st.last_finalized_request_id, shares))
        })?;

        log::info!(
            "finalized withdrawal requests [{}, {}], locking {} NAT",
            from_id,
            to_id,
            amount
        );

        extract_send_result(rt.send_simple(
            &st.stk_token,
            ext::stk::BURN_SHARES_METHOD,
            IpldBlock::serialize_cbor(&ext::stk::BurnSharesParams {
                shares: shares_to_burn.clone(),
            })?,
            TokenAmount::zero(),
        ))
        .context("failed to burn staked-token shares")?;

        emit::withdrawal_batch_finalized(
            rt,
            from_id,
            to_id,
            &amount,
            &shares_to_burn,
            rt.tipset_timestamp(),
        )?;
        Ok(())
    }

    /// Stamps the time of the latest oracle report; subsequent requests are
    /// grouped under it.
    pub fn on_oracle_report(
        rt: &impl Runtime,
        params: OnOracleReportParams,
    ) -> Result<(), ActorError> {
        let st: State = rt.state()?;
        rt.validate_immediate_caller_is(std::iter::once(&st.oracle))?;

        if params.report_timestamp == 0 {
            return Err(actor_error!(illegal_argument; "zero report timestamp"));
        }
        rt.transaction(|st: &mut State, _| {
            if params.report_timestamp < st.last_report_timestamp {
                return Err(
                    actor_error!(illegal_argument; "report timestamp {} precedes the last recorded {}", params.report_timestamp, st.last_report_timestamp),
                );
            }
            st.last_report_timestamp = params.report_timestamp;
            Ok(())
        })
    }

    /// Finds the checkpoint governing a request within a caller-supplied
    /// range. Read-only; returns `NOT_FOUND` when the range misses it.
    pub fn find_checkpoint_hint(
        rt: &impl Runtime,
        params: FindCheckpointHintParams,
    ) -> Result<u64, ActorError> {
        rt.validate_immediate_caller_accept_any()?;
        let st: State = rt.state()?;
        st.find_checkpoint_hint(rt.store(), params.request_id, params.start, params.end)
    }

    /// Pays a finalized request out to the recipient, resolving the discount
    /// through the hinted checkpoint.
    pub fn claim(rt: &impl Runtime, params: ClaimParams) -> Result<(), ActorError> {
        rt.validate_immediate_caller_accept_any()?;
        let caller = resolve_to_actor_id(rt, &rt.message().caller())?;

        let payout = rt.transaction(|st: &mut State, rt| {
            st.claim(rt.store(), params.request_id, params.hint, caller)
        })?;

        extract_send_result(rt.send_simple(&params.recipient, METHOD_SEND, None, payout.clone()))
            .map_err(|e| e.wrap("failed to transfer NAT to the recipient"))?;

        emit::withdrawal_claimed(rt, params.request_id, caller, &params.recipient, &payout)?;
        Ok(())
    }

    pub fn get_withdrawal_status(
        rt: &impl Runtime,
        params: GetWithdrawalStatusParams,
    ) -> Result<WithdrawalStatus, ActorError> {
        rt.validate_immediate_caller_accept_any()?;
        let st: State = rt.state()?;
        st.request_status(rt.store(), params.request_id)
    }

    pub fn get_withdrawal_requests_of(
        rt: &impl Runtime,
        params: GetWithdrawalRequestsOfParams,
    ) -> Result<Vec<RequestID>, ActorError> {
        rt.validate_immediate_caller_accept_any()?;
        let owner = resolve_to_actor_id(rt, &params.owner)?;
        let st: State = rt.state()?;
        st.requests_of(rt.store(), owner)
    }

    /// NAT the request would pay out right now, zero when not claimable.
    pub fn get_claimable_nat(
        rt: &impl Runtime,
        params: GetClaimableNatParams,
    ) -> Result<TokenAmount, ActorError> {
        rt.validate_immediate_caller_accept_any()?;
        let st: State = rt.state()?;
        st.claimable_amount(rt.store(), params.request_id, params.hint)
    }

    pub fn get_queue_info(rt: &impl Runtime) -> Result<QueueInfoReturn, ActorError> {
        rt.validate_immediate_caller_accept_any()?;
        let st: State = rt.state()?;
        Ok(QueueInfoReturn {
            last_request_id: st.last_request_id,
            last_finalized_request_id: st.last_finalized_request_id,
            last_checkpoint_index: st.last_checkpoint_index,
            locked_nat: st.locked_nat,
        })
    }
}

impl ActorCode for Actor {
    type Methods = Method;

    fn name() -> &'static str {
        "WithdrawalQueue"
    }

    actor_dispatch! {
        Constructor => constructor,
        RequestWithdrawal => request_withdrawal,
        CalculateFinalizationBatches => calculate_finalization_batches,
        Prefinalize => prefinalize,
        Finalize => finalize,
        OnOracleReport => on_oracle_report,
        FindCheckpointHint => find_checkpoint_hint,
        Claim => claim,
        GetWithdrawalStatus => get_withdrawal_status,
        GetWithdrawalRequestsOf => get_withdrawal_requests_of,
        GetClaimableNat => get_claimable_nat,
        GetQueueInfo => get_queue_info,
    }
}
