// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_shared::econ::TokenAmount;
use lazy_static::lazy_static;

lazy_static! {
    /// Smallest STK amount accepted by a withdrawal request. Requests below
    /// this pay out nothing after integer division at realistic share rates.
    pub static ref MIN_WITHDRAWAL_STK: TokenAmount = TokenAmount::from_atto(100);

    /// Largest STK amount accepted by a single withdrawal request. Larger
    /// redemptions split into several requests so one claim never dominates
    /// a finalization budget.
    pub static ref MAX_WITHDRAWAL_STK: TokenAmount = TokenAmount::from_whole(1000);
}
