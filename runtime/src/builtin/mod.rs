// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_shared::address::Address;
use fvm_shared::ActorID;

use crate::runtime::Runtime;
use crate::{actor_error, ActorError};

/// Singleton actor managing the substrate itself, the only principal allowed
/// to construct other singletons.
pub const SYSTEM_ACTOR_ADDR: Address = Address::new_id(0);

/// Bit width for all HAMT structures in actor state.
pub const HAMT_BIT_WIDTH: u32 = 5;

/// Resolves the given address to its actor ID.
/// This substrate has no account-creation path, so an unresolvable address is
/// an argument error.
pub fn resolve_to_actor_id(
    rt: &impl Runtime,
    address: &Address,
) -> Result<ActorID, ActorError> {
    rt.resolve_address(address)
        .ok_or_else(|| actor_error!(illegal_argument; "failed to resolve address {} to an ID", address))
}
