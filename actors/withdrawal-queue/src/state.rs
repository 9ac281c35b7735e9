// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::tuple::*;
use fvm_shared::address::Address;
use fvm_shared::bigint::{bigint_ser, BigInt};
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::ExitCode;
use fvm_shared::ActorID;
use num_traits::Zero;

use lsp_actors_runtime::{
    actor_error, ActorError, Array, AsActorError, SetMultimap, SetMultimapConfig,
    DEFAULT_HAMT_CONFIG,
};

use crate::types::{
    BatchesCalculationState, RequestID, WithdrawalStatus, E27, MAX_BATCHES,
    MAX_REQUESTS_PER_CALL, NOT_FOUND, UNLIMITED,
};

pub const REQUESTS_AMT_BITWIDTH: u32 = 5;
pub const CHECKPOINTS_AMT_BITWIDTH: u32 = 5;

pub const OWNER_INDEX_CONFIG: SetMultimapConfig =
    SetMultimapConfig { outer: DEFAULT_HAMT_CONFIG, inner: DEFAULT_HAMT_CONFIG };

/// One row of the request book. STK and share amounts are cumulative over ids
/// 1..=id, so any contiguous range is summarised by two row reads.
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, Default, PartialEq, Eq)]
pub struct WithdrawalRequest {
    pub cumulative_stk: TokenAmount,
    #[serde(with = "bigint_ser")]
    pub cumulative_shares: BigInt,
    pub owner: ActorID,
    /// Enqueue time, UNIX seconds.
    pub created_at: u64,
    /// Timestamp of the most recent oracle report at enqueue. Requests that
    /// share it were priced under the same oracle view.
    pub report_at: u64,
    pub claimed: bool,
}

/// Discount record. The cap applies to requests finalized from
/// `from_request_id` until the next checkpoint's boundary.
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq, Eq)]
pub struct Checkpoint {
    pub from_request_id: RequestID,
    #[serde(with = "bigint_ser")]
    pub max_share_rate: BigInt,
}

/// Withdrawal queue actor state.
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug)]
pub struct State {
    /// The staked-token actor, sole authorized enqueuer and share burner.
    pub stk_token: Address,
    /// The report oracle, authorized to finalize and stamp report times.
    pub oracle: Address,

    /// Array<WithdrawalRequest> with a sentinel row at index 0.
    pub requests: Cid,
    /// Array<Checkpoint>, 1-indexed, sentinel `(0, UNLIMITED)` at index 0.
    pub checkpoints: Cid,
    /// SetMultimap<ActorID, RequestID> of unclaimed request ids per owner.
    pub requests_by_owner: Cid,

    pub last_request_id: RequestID,
    pub last_finalized_request_id: RequestID,
    pub last_checkpoint_index: u64,
    /// NAT reserved for finalized-and-unclaimed requests.
    pub locked_nat: TokenAmount,
    /// Timestamp of the most recent oracle report.
    pub last_report_timestamp: u64,
}

/// Summarises the request range (prev, end]: the share rate scaled by 1e27,
/// the STK total, and the share total.
pub fn calc_batch(
    prev: &WithdrawalRequest,
    end: &WithdrawalRequest,
) -> (BigInt, TokenAmount, BigInt) {
    let stk = &end.cumulative_stk - &prev.cumulative_stk;
    let shares = &end.cumulative_shares - &prev.cumulative_shares;
    debug_assert!(!shares.is_zero(), "request range carries no shares");
    let share_rate = stk.atto() * &*E27 / &shares;
    (share_rate, stk, shares)
}

/// NAT owed for `shares` capped at `max_share_rate`, rounding toward zero.
pub(crate) fn discounted_nat(shares: &BigInt, max_share_rate: &BigInt) -> TokenAmount {
    TokenAmount::from_atto(shares * max_share_rate / &*E27)
}

impl State {
    pub fn new<BS: Blockstore>(
        store: &BS,
        stk_token: Address,
        oracle: Address,
    ) -> Result<State, ActorError> {
        // Sentinel rows keep `request[id - 1]` and `checkpoint[hint]` in
        // range for every valid id and hint.
        let mut requests = Array::<WithdrawalRequest, BS>::new_with_bit_width(
            store,
            REQUESTS_AMT_BITWIDTH,
        );
        requests
            .set(0, WithdrawalRequest { claimed: true, ..Default::default() })
            .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to seed request book")?;
        let requests = requests
            .flush()
            .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to create request book")?;

        let mut checkpoints =
            Array::<Checkpoint, BS>::new_with_bit_width(store, CHECKPOINTS_AMT_BITWIDTH);
        checkpoints
            .set(0, Checkpoint { from_request_id: 0, max_share_rate: UNLIMITED.clone() })
            .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to seed checkpoint history")?;
        let checkpoints = checkpoints
            .flush()
            .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to create checkpoint history")?;

        let requests_by_owner =
            SetMultimap::<_, ActorID, RequestID>::empty(store, OWNER_INDEX_CONFIG, "owner index")
                .flush()?;

        Ok(State {
            stk_token,
            oracle,
            requests,
            checkpoints,
            requests_by_owner,
            last_request_id: 0,
            last_finalized_request_id: 0,
            last_checkpoint_index: 0,
            locked_nat: TokenAmount::zero(),
            last_report_timestamp: 0,
        })
    }

    pub fn load_requests<'bs, BS: Blockstore>(
        &self,
        store: &'bs BS,
    ) -> Result<Array<'bs, WithdrawalRequest, BS>, ActorError> {
        Array::load(&self.requests, store)
            .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to load request book")
    }

    pub fn load_checkpoints<'bs, BS: Blockstore>(
        &self,
        store: &'bs BS,
    ) -> Result<Array<'bs, Checkpoint, BS>, ActorError> {
        Array::load(&self.checkpoints, store)
            .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to load checkpoint history")
    }

    fn load_owner_index<'bs, BS: Blockstore>(
        &self,
        store: &'bs BS,
    ) -> Result<SetMultimap<&'bs BS, ActorID, RequestID>, ActorError> {
        SetMultimap::load(store, &self.requests_by_owner, OWNER_INDEX_CONFIG, "owner index")
    }

    pub fn get_request<BS: Blockstore>(
        requests: &Array<WithdrawalRequest, BS>,
        id: RequestID,
    ) -> Result<WithdrawalRequest, ActorError> {
        Ok(requests
            .get(id)
            .with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
                format!("failed to load request {}", id)
            })?
            .ok_or_else(|| actor_error!(illegal_state; "missing request {}", id))?
            .clone())
    }

    fn get_checkpoint<BS: Blockstore>(
        checkpoints: &Array<Checkpoint, BS>,
        index: u64,
    ) -> Result<Checkpoint, ActorError> {
        Ok(checkpoints
            .get(index)
            .with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
                format!("failed to load checkpoint {}", index)
            })?
            .ok_or_else(|| actor_error!(illegal_state; "missing checkpoint {}", index))?
            .clone())
    }

    /// Appends a request carrying the running totals and indexes it for the
    /// owner. Returns the new id, `last_request_id + 1`.
    pub fn enqueue<BS: Blockstore>(
        &mut self,
        store: &BS,
        stk: &TokenAmount,
        shares: &BigInt,
        owner: ActorID,
        created_at: u64,
    ) -> Result<RequestID, ActorError> {
        let mut requests = self.load_requests(store)?;
        let prev = Self::get_request(&requests, self.last_request_id)?;
        let id = self.last_request_id + 1;

        requests
            .set(
                id,
                WithdrawalRequest {
                    cumulative_stk: &prev.cumulative_stk + stk,
                    cumulative_shares: &prev.cumulative_shares + shares,
                    owner,
                    created_at,
                    report_at: self.last_report_timestamp,
                    claimed: false,
                },
            )
            .with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
                format!("failed to store request {}", id)
            })?;
        self.requests = requests
            .flush()
            .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to save request book")?;

        let mut by_owner = self.load_owner_index(store)?;
        by_owner.put(&owner, id)?;
        self.requests_by_owner = by_owner.flush()?;

        self.last_request_id = id;
        Ok(id)
    }

    /// Splits the unfinalized prefix into contiguous batches that are each
    /// wholly nominal or wholly discounted under `max_share_rate`, spending
    /// at most `remaining_nat_budget` and examining at most
    /// `MAX_REQUESTS_PER_CALL` requests. Read-only; the caller threads the
    /// returned state across invocations until `finished`.
    pub fn calculate_finalization_batches<BS: Blockstore>(
        &self,
        store: &BS,
        max_share_rate: &BigInt,
        max_timestamp: u64,
        mut calc: BatchesCalculationState,
    ) -> Result<BatchesCalculationState, ActorError> {
        if calc.finished {
            return Err(actor_error!(illegal_state; "batch calculation already finished"));
        }
        if calc.remaining_nat_budget.is_zero() {
            return Err(actor_error!(illegal_state; "batch calculation has no remaining budget"));
        }
        if max_share_rate.is_zero() {
            return Err(actor_error!(illegal_argument; "zero max share rate"));
        }
        if max_timestamp == 0 {
            return Err(actor_error!(illegal_argument; "zero max timestamp"));
        }
        if calc.batches.len() > MAX_BATCHES {
            return Err(
                actor_error!(illegal_argument; "{} batches exceed the maximum of {}", calc.batches.len(), MAX_BATCHES),
            );
        }

        let requests = self.load_requests(store)?;
        let (mut current_id, mut prev, mut prev_rate) = match calc.batches.last() {
            None => {
                let prev = Self::get_request(&requests, self.last_finalized_request_id)?;
                (self.last_finalized_request_id + 1, prev, BigInt::zero())
            }
            Some(&last_handled) => {
                if last_handled <= self.last_finalized_request_id
                    || last_handled > self.last_request_id
                {
                    return Err(
                        actor_error!(illegal_argument; "stale calculation state: batch end {} outside ({}, {}]",
                            last_handled, self.last_finalized_request_id, self.last_request_id),
                    );
                }
                let before = Self::get_request(&requests, last_handled - 1)?;
                let prev = Self::get_request(&requests, last_handled)?;
                let (rate, _, _) = calc_batch(&before, &prev);
                (last_handled + 1, prev, rate)
            }
        };

        let quota_end_id = current_id + MAX_REQUESTS_PER_CALL;
        let queue_end_id = self.last_request_id + 1;
        // A break on budget or freshness ends the whole calculation; a break
        // on the batch cap leaves the tail for after the next finalization.
        let mut terminal_break = false;

        while current_id < queue_end_id && current_id < quota_end_id {
            let request = Self::get_request(&requests, current_id)?;
            if request.created_at > max_timestamp {
                // Newer than the oracle view backing this report.
                terminal_break = true;
                break;
            }

            let (request_rate, mut nat_to_lock, shares) = calc_batch(&prev, &request);
            if request_rate > *max_share_rate {
                nat_to_lock = discounted_nat(&shares, max_share_rate);
            }
            if nat_to_lock > calc.remaining_nat_budget {
                terminal_break = true;
                break;
            }

            // Requests priced under the same oracle report may differ by a
            // wei or two of rate from integer division; they group together
            // regardless of which side of the cap those rates land on.
            let extend = !calc.batches.is_empty()
                && (prev.report_at == request.report_at
                    || (prev_rate <= *max_share_rate && request_rate <= *max_share_rate)
                    || (prev_rate > *max_share_rate && request_rate > *max_share_rate));
            if !extend && calc.batches.len() == MAX_BATCHES {
                // No slot for another batch; this request keeps its budget.
                break;
            }

            calc.remaining_nat_budget -= &nat_to_lock;
            if extend {
                let last = calc.batches.len() - 1;
                calc.batches[last] = current_id;
            } else {
                calc.batches.push(current_id);
            }

            prev_rate = request_rate;
            prev = request;
            current_id += 1;
        }

        calc.finished = current_id == queue_end_id || terminal_break;
        Ok(calc)
    }

    /// Walks a batch list, asserting that consecutive batches alternate
    /// across the share-rate cap, and totals the NAT to lock and the shares
    /// to burn. Pure with respect to state.
    pub fn prefinalize<BS: Blockstore>(
        &self,
        store: &BS,
        batches: &[RequestID],
        max_share_rate: &BigInt,
    ) -> Result<(TokenAmount, BigInt), ActorError> {
        if batches.is_empty() {
            return Err(actor_error!(illegal_argument; "empty batches"));
        }
        if max_share_rate.is_zero() {
            return Err(actor_error!(illegal_argument; "zero max share rate"));
        }
        if batches[0] <= self.last_finalized_request_id {
            return Err(
                actor_error!(illegal_argument; "batch end {} is already finalized", batches[0]),
            );
        }

        let requests = self.load_requests(store)?;
        let mut prev_id = self.last_finalized_request_id;
        let mut prev = Self::get_request(&requests, prev_id)?;
        let mut prev_above_cap: Option<bool> = None;
        let mut nat_to_lock = TokenAmount::zero();
        let mut shares_to_burn = BigInt::zero();

        for &end_id in batches {
            if end_id <= prev_id {
                return Err(actor_error!(illegal_argument; "batches are not sorted"));
            }
            if end_id > self.last_request_id {
                return Err(
                    actor_error!(illegal_argument; "batch end {} is beyond the last request {}", end_id, self.last_request_id),
                );
            }

            let end = Self::get_request(&requests, end_id)?;
            let (batch_rate, stk, shares) = calc_batch(&prev, &end);
            let above_cap = batch_rate > *max_share_rate;
            if prev_above_cap == Some(above_cap) {
                return Err(
                    actor_error!(illegal_argument; "consecutive batches ending at {} and {} are on the same side of the share-rate cap", prev_id, end_id),
                );
            }

            if above_cap {
                nat_to_lock += discounted_nat(&shares, max_share_rate);
            } else {
                nat_to_lock += &stk;
            }
            shares_to_burn += &shares;

            prev_above_cap = Some(above_cap);
            prev_id = end_id;
            prev = end;
        }

        Ok((nat_to_lock, shares_to_burn))
    }

    /// Advances the finalized frontier to the last batch end, reserving
    /// `amount` NAT for the covered requests, and records the share-rate cap
    /// if it differs from the last recorded one. Returns the shares to burn.
    pub fn finalize<BS: Blockstore>(
        &mut self,
        store: &BS,
        batches: &[RequestID],
        amount: &TokenAmount,
        max_share_rate: &BigInt,
    ) -> Result<BigInt, ActorError> {
        if amount.is_zero() {
            return Err(actor_error!(illegal_argument; "no NAT attached to finalization"));
        }

        // Validates list shape, bounds and the alternation property.
        let (_, shares_to_burn) = self.prefinalize(store, batches, max_share_rate)?;
        let last_id = batches[batches.len() - 1];

        let requests = self.load_requests(store)?;
        let frontier = Self::get_request(&requests, self.last_finalized_request_id)?;
        let last = Self::get_request(&requests, last_id)?;
        let total_stk = &last.cumulative_stk - &frontier.cumulative_stk;
        if *amount > total_stk {
            return Err(
                actor_error!(illegal_argument; "too much NAT to finalize: {} attached, the range holds {}", amount, total_stk),
            );
        }

        // A single batch paid in full is a nominal finalization; everything
        // else caps the covered requests at the reported rate.
        let effective_cap = if batches.len() == 1 && *amount == total_stk {
            UNLIMITED.clone()
        } else {
            max_share_rate.clone()
        };

        let mut checkpoints = self.load_checkpoints(store)?;
        let last_checkpoint = Self::get_checkpoint(&checkpoints, self.last_checkpoint_index)?;
        // The sentinel at index 0 is not a recorded cap; the first
        // finalization always writes checkpoint 1.
        if self.last_checkpoint_index == 0 || last_checkpoint.max_share_rate != effective_cap {
            let index = self.last_checkpoint_index + 1;
            checkpoints
                .set(
                    index,
                    Checkpoint {
                        from_request_id: self.last_finalized_request_id + 1,
                        max_share_rate: effective_cap,
                    },
                )
                .with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
                    format!("failed to store checkpoint {}", index)
                })?;
            self.checkpoints = checkpoints
                .flush()
                .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to save checkpoint history")?;
            self.last_checkpoint_index = index;
        }

        self.last_finalized_request_id = last_id;
        self.locked_nat += amount;
        Ok(shares_to_burn)
    }

    /// Searches checkpoints `[start, end]` for the one governing
    /// `request_id`. Returns `NOT_FOUND` when the range does not cover it.
    pub fn find_checkpoint_hint<BS: Blockstore>(
        &self,
        store: &BS,
        request_id: RequestID,
        start: u64,
        end: u64,
    ) -> Result<u64, ActorError> {
        if request_id == 0 || request_id > self.last_request_id {
            return Err(actor_error!(illegal_argument; "invalid request id {}", request_id));
        }
        if start == 0 || end > self.last_checkpoint_index {
            return Err(
                actor_error!(illegal_argument; "hint range [{}, {}] outside [1, {}]", start, end, self.last_checkpoint_index),
            );
        }
        if self.last_checkpoint_index == 0
            || request_id > self.last_finalized_request_id
            || start > end
        {
            return Ok(NOT_FOUND);
        }

        let checkpoints = self.load_checkpoints(store)?;

        // Right boundary.
        if request_id >= Self::get_checkpoint(&checkpoints, end)?.from_request_id {
            if end == self.last_checkpoint_index {
                return Ok(end);
            }
            if request_id < Self::get_checkpoint(&checkpoints, end + 1)?.from_request_id {
                return Ok(end);
            }
            return Ok(NOT_FOUND);
        }
        // Left boundary.
        if request_id < Self::get_checkpoint(&checkpoints, start)?.from_request_id {
            return Ok(NOT_FOUND);
        }

        // Upper-bound binary search over [start, end - 1]: the greatest
        // index whose from_request_id <= request_id.
        let mut min = start;
        let mut max = end - 1;
        while max > min {
            let mid = (max + min + 1) / 2;
            if Self::get_checkpoint(&checkpoints, mid)?.from_request_id <= request_id {
                min = mid;
            } else {
                max = mid - 1;
            }
        }
        Ok(min)
    }

    /// Payout of a request under the checkpoint the hint points at. The hint
    /// must satisfy `checkpoint[hint].from_request_id <= request_id` and be
    /// either the last checkpoint or followed by one starting beyond the id.
    fn checkpoint_payout<BS: Blockstore>(
        &self,
        store: &BS,
        requests: &Array<WithdrawalRequest, BS>,
        request: &WithdrawalRequest,
        request_id: RequestID,
        hint: u64,
    ) -> Result<TokenAmount, ActorError> {
        if hint == 0 || hint > self.last_checkpoint_index {
            return Err(actor_error!(illegal_argument; "invalid checkpoint hint {}", hint));
        }
        let checkpoints = self.load_checkpoints(store)?;
        let checkpoint = Self::get_checkpoint(&checkpoints, hint)?;
        if request_id < checkpoint.from_request_id {
            return Err(
                actor_error!(illegal_argument; "invalid checkpoint hint {}: starts beyond request {}", hint, request_id),
            );
        }
        if hint < self.last_checkpoint_index
            && Self::get_checkpoint(&checkpoints, hint + 1)?.from_request_id <= request_id
        {
            return Err(
                actor_error!(illegal_argument; "invalid checkpoint hint {}: request {} is governed by a later checkpoint", hint, request_id),
            );
        }

        let prev = Self::get_request(requests, request_id - 1)?;
        let (batch_rate, stk, shares) = calc_batch(&prev, request);
        if batch_rate > checkpoint.max_share_rate {
            Ok(discounted_nat(&shares, &checkpoint.max_share_rate))
        } else {
            Ok(stk)
        }
    }

    /// NAT a request would pay out right now; zero when it is not yet
    /// finalized or already claimed. Read-only.
    pub fn claimable_amount<BS: Blockstore>(
        &self,
        store: &BS,
        request_id: RequestID,
        hint: u64,
    ) -> Result<TokenAmount, ActorError> {
        if request_id == 0 || request_id > self.last_request_id {
            return Err(actor_error!(illegal_argument; "invalid request id {}", request_id));
        }
        let requests = self.load_requests(store)?;
        let request = Self::get_request(&requests, request_id)?;
        if request_id > self.last_finalized_request_id || request.claimed {
            return Ok(TokenAmount::zero());
        }
        self.checkpoint_payout(store, &requests, &request, request_id, hint)
    }

    /// Marks a finalized request claimed, releases its NAT from the locked
    /// total and drops it from the owner index. Returns the payout.
    pub fn claim<BS: Blockstore>(
        &mut self,
        store: &BS,
        request_id: RequestID,
        hint: u64,
        caller: ActorID,
    ) -> Result<TokenAmount, ActorError> {
        if request_id == 0 || request_id > self.last_request_id {
            return Err(actor_error!(illegal_argument; "invalid request id {}", request_id));
        }
        if request_id > self.last_finalized_request_id {
            return Err(actor_error!(forbidden; "request {} is not finalized", request_id));
        }

        let mut requests = self.load_requests(store)?;
        let mut request = Self::get_request(&requests, request_id)?;
        if request.claimed {
            return Err(actor_error!(forbidden; "request {} is already claimed", request_id));
        }
        if request.owner != caller {
            return Err(
                actor_error!(forbidden; "only the owner {} can claim request {}", request.owner, request_id),
            );
        }

        let payout = self.checkpoint_payout(store, &requests, &request, request_id, hint)?;

        request.claimed = true;
        let owner = request.owner;
        requests
            .set(request_id, request)
            .with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
                format!("failed to store request {}", request_id)
            })?;
        self.requests = requests
            .flush()
            .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to save request book")?;

        let mut by_owner = self.load_owner_index(store)?;
        by_owner.remove(&owner, request_id)?;
        self.requests_by_owner = by_owner.flush()?;

        self.locked_nat -= &payout;
        Ok(payout)
    }

    pub fn request_status<BS: Blockstore>(
        &self,
        store: &BS,
        request_id: RequestID,
    ) -> Result<WithdrawalStatus, ActorError> {
        if request_id == 0 || request_id > self.last_request_id {
            return Err(actor_error!(illegal_argument; "invalid request id {}", request_id));
        }
        let requests = self.load_requests(store)?;
        let prev = Self::get_request(&requests, request_id - 1)?;
        let request = Self::get_request(&requests, request_id)?;
        Ok(WithdrawalStatus {
            amount_stk: &request.cumulative_stk - &prev.cumulative_stk,
            amount_shares: &request.cumulative_shares - &prev.cumulative_shares,
            owner: request.owner,
            created_at: request.created_at,
            is_finalized: request_id <= self.last_finalized_request_id,
            is_claimed: request.claimed,
        })
    }

    /// Unclaimed request ids of an owner, ascending.
    pub fn requests_of<BS: Blockstore>(
        &self,
        store: &BS,
        owner: ActorID,
    ) -> Result<Vec<RequestID>, ActorError> {
        let by_owner = self.load_owner_index(store)?;
        let mut ids = Vec::new();
        by_owner.for_each_in(&owner, |id| {
            ids.push(id);
            Ok(())
        })?;
        ids.sort_unstable();
        Ok(ids)
    }
}
