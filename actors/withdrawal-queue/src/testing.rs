// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_ipld_blockstore::Blockstore;
use fvm_shared::econ::TokenAmount;
use fvm_shared::ActorID;
use num_traits::Zero;

use lsp_actors_runtime::{MessageAccumulator, SetMultimap};

use crate::state::{
    calc_batch, discounted_nat, Checkpoint, State, WithdrawalRequest, OWNER_INDEX_CONFIG,
};
use crate::types::{RequestID, UNLIMITED};

pub struct StateSummary {
    pub request_count: u64,
    pub claimed_count: u64,
    pub checkpoint_count: u64,
    pub locked_nat: TokenAmount,
}

/// Checks the internal invariants of the withdrawal queue state: dense ids,
/// monotone partial sums, well-formed checkpoint history, owner-index
/// consistency, and the locked-NAT accounting identity.
pub fn check_state_invariants<BS: Blockstore>(
    state: &State,
    store: &BS,
) -> (StateSummary, MessageAccumulator) {
    let acc = MessageAccumulator::default();
    let mut summary = StateSummary {
        request_count: 0,
        claimed_count: 0,
        checkpoint_count: 0,
        locked_nat: TokenAmount::zero(),
    };

    acc.require(
        state.last_finalized_request_id <= state.last_request_id,
        format!(
            "finalized frontier {} beyond last request {}",
            state.last_finalized_request_id, state.last_request_id
        ),
    );

    // Request book: dense ids, sentinel row, monotone partial sums.
    let mut rows: Vec<WithdrawalRequest> = Vec::new();
    match state.load_requests(store) {
        Err(e) => acc.add(format!("failed to load request book: {}", e.msg())),
        Ok(requests) => {
            acc.require(
                requests.count() == state.last_request_id + 1,
                format!(
                    "request book holds {} rows, expected {}",
                    requests.count(),
                    state.last_request_id + 1
                ),
            );
            for id in 0..=state.last_request_id {
                match requests.get(id) {
                    Ok(Some(r)) => rows.push(r.clone()),
                    Ok(None) => acc.add(format!("request ids are not dense: {} is missing", id)),
                    Err(e) => acc.add(format!("failed to load request {}: {}", id, e)),
                }
            }
        }
    }
    let requests_complete = rows.len() as u64 == state.last_request_id + 1;
    if requests_complete {
        let sentinel = &rows[0];
        acc.require(
            sentinel.claimed
                && sentinel.cumulative_stk.is_zero()
                && sentinel.cumulative_shares.is_zero(),
            "sentinel request is malformed",
        );
        for id in 1..rows.len() {
            let acc = acc.with_prefix(format!("request {}: ", id));
            acc.require(
                rows[id].cumulative_stk >= rows[id - 1].cumulative_stk,
                "cumulative STK decreases",
            );
            acc.require(
                rows[id].cumulative_shares >= rows[id - 1].cumulative_shares,
                "cumulative shares decrease",
            );
        }
        summary.request_count = state.last_request_id;
        summary.claimed_count = rows.iter().skip(1).filter(|r| r.claimed).count() as u64;
    }

    // Checkpoint history: sentinel row, strictly increasing boundaries,
    // consecutive caps distinct, all boundaries within the finalized prefix.
    let mut checkpoints: Vec<Checkpoint> = Vec::new();
    match state.load_checkpoints(store) {
        Err(e) => acc.add(format!("failed to load checkpoint history: {}", e.msg())),
        Ok(history) => {
            for index in 0..=state.last_checkpoint_index {
                match history.get(index) {
                    Ok(Some(c)) => checkpoints.push(c.clone()),
                    Ok(None) => acc.add(format!("checkpoint {} is missing", index)),
                    Err(e) => acc.add(format!("failed to load checkpoint {}: {}", index, e)),
                }
            }
        }
    }
    let checkpoints_complete = checkpoints.len() as u64 == state.last_checkpoint_index + 1;
    if checkpoints_complete {
        acc.require(
            checkpoints[0].from_request_id == 0 && checkpoints[0].max_share_rate == *UNLIMITED,
            "sentinel checkpoint is malformed",
        );
        if state.last_checkpoint_index > 0 {
            acc.require(
                checkpoints[1].from_request_id == 1,
                "first checkpoint does not start at request 1",
            );
        }
        for i in 2..checkpoints.len() {
            acc.require(
                checkpoints[i].from_request_id > checkpoints[i - 1].from_request_id,
                format!("checkpoint {} boundary does not increase", i),
            );
            acc.require(
                checkpoints[i].max_share_rate != checkpoints[i - 1].max_share_rate,
                format!("checkpoints {} and {} carry the same cap", i - 1, i),
            );
        }
        for (i, c) in checkpoints.iter().enumerate().skip(1) {
            acc.require(
                c.from_request_id <= state.last_finalized_request_id,
                format!("checkpoint {} covers unfinalized requests", i),
            );
        }
        acc.require(
            state.last_finalized_request_id == 0 || state.last_checkpoint_index > 0,
            "finalized requests without a governing checkpoint",
        );
        summary.checkpoint_count = state.last_checkpoint_index;
    }

    // Locked NAT equals the payouts still owed to finalized-and-unclaimed
    // requests under their governing checkpoints.
    if requests_complete && checkpoints_complete {
        let mut owed = TokenAmount::zero();
        for ci in 1..checkpoints.len() {
            let from = checkpoints[ci].from_request_id;
            let to = if ci + 1 < checkpoints.len() {
                checkpoints[ci + 1].from_request_id - 1
            } else {
                state.last_finalized_request_id
            };
            for id in from..=to {
                let request = &rows[id as usize];
                if request.claimed {
                    continue;
                }
                let (rate, stk, shares) = calc_batch(&rows[id as usize - 1], request);
                owed += if rate > checkpoints[ci].max_share_rate {
                    discounted_nat(&shares, &checkpoints[ci].max_share_rate)
                } else {
                    stk
                };
            }
        }
        acc.require(
            owed == state.locked_nat,
            format!("locked NAT {} does not match owed payouts {}", state.locked_nat, owed),
        );
        summary.locked_nat = state.locked_nat.clone();
    }

    // Owner index: exactly the unclaimed requests, under their owners.
    if requests_complete {
        match SetMultimap::<_, ActorID, RequestID>::load(
            store,
            &state.requests_by_owner,
            OWNER_INDEX_CONFIG,
            "owner index",
        ) {
            Err(e) => acc.add(format!("failed to load owner index: {}", e.msg())),
            Ok(by_owner) => {
                for (id, request) in rows.iter().enumerate().skip(1) {
                    let id = id as u64;
                    let indexed = by_owner
                        .get(&request.owner)
                        .and_then(|set| set.map(|s| s.has(&id)).transpose())
                        .unwrap_or(None)
                        .unwrap_or(false);
                    if request.claimed {
                        acc.require(
                            !indexed,
                            format!("claimed request {} still in the owner index", id),
                        );
                    } else {
                        acc.require(
                            indexed,
                            format!("unclaimed request {} missing from the owner index", id),
                        );
                    }
                }
            }
        }
    }

    (summary, acc)
}
