// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_shared::address::Address;
use fvm_shared::bigint::bigint_ser::BigIntSer;
use fvm_shared::bigint::BigInt;
use fvm_shared::econ::TokenAmount;
use fvm_shared::ActorID;

use lsp_actors_runtime::runtime::Runtime;
use lsp_actors_runtime::{ActorError, EventBuilder};

use crate::types::RequestID;

/// Indicates a new withdrawal request was enqueued.
pub fn withdrawal_requested(
    rt: &impl Runtime,
    id: RequestID,
    requestor: ActorID,
    owner: ActorID,
    stk: &TokenAmount,
    shares: &BigInt,
) -> Result<(), ActorError> {
    rt.emit_event(
        &EventBuilder::new()
            .typ("withdrawal-requested")
            .field_indexed("id", &id)
            .field_indexed("requestor", &requestor)
            .field_indexed("owner", &owner)
            .field("stk", stk)
            .field("shares", &BigIntSer(shares))
            .build()?,
    )
}

/// Indicates a contiguous range of requests was finalized and its NAT locked.
pub fn withdrawal_batch_finalized(
    rt: &impl Runtime,
    from_id: RequestID,
    to_id: RequestID,
    nat_locked: &TokenAmount,
    shares_burned: &BigInt,
    timestamp: u64,
) -> Result<(), ActorError> {
    rt.emit_event(
        &EventBuilder::new()
            .typ("withdrawal-batch-finalized")
            .field_indexed("from_id", &from_id)
            .field_indexed("to_id", &to_id)
            .field("nat_locked", nat_locked)
            .field("shares_burned", &BigIntSer(shares_burned))
            .field("timestamp", &timestamp)
            .build()?,
    )
}

/// Indicates a finalized request was claimed and its NAT paid out.
pub fn withdrawal_claimed(
    rt: &impl Runtime,
    id: RequestID,
    owner: ActorID,
    recipient: &Address,
    nat: &TokenAmount,
) -> Result<(), ActorError> {
    rt.emit_event(
        &EventBuilder::new()
            .typ("withdrawal-claimed")
            .field_indexed("id", &id)
            .field_indexed("owner", &owner)
            .field_indexed("recipient", recipient)
            .field("nat", nat)
            .build()?,
    )
}
