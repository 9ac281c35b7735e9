// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_shared::bigint::BigInt;
use fvm_shared::econ::TokenAmount;
use lazy_static::lazy_static;
use num_traits::Zero;

use lsp_actors_runtime::{actor_error, ActorError};

use crate::types::UNLIMITED;

lazy_static! {
    /// Rebase limits are fixed-point integers scaled by 1e9.
    pub static ref LIMITER_PRECISION: BigInt = BigInt::from(1_000_000_000_u64);
}

/// Bounds the positive share-rate rebase a single oracle report may apply.
/// Withdrawals raise the headroom (NAT leaves the pool before the rebase),
/// rewards consume it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RebaseLimiter {
    pre_total_pooled: TokenAmount,
    pre_total_shares: BigInt,
    post_total_pooled: TokenAmount,
    rebase_limit: BigInt,
}

impl RebaseLimiter {
    /// The limit must be in `(0, UNLIMITED]`. An empty pool cannot be
    /// rate-limited, so a zero `pre_total_pooled` forces the unlimited
    /// regime.
    pub fn init(
        rebase_limit: BigInt,
        pre_total_pooled: TokenAmount,
        pre_total_shares: BigInt,
    ) -> Result<Self, ActorError> {
        if rebase_limit.is_zero() {
            return Err(actor_error!(illegal_argument; "zero rebase limit"));
        }
        if rebase_limit > *UNLIMITED {
            return Err(actor_error!(illegal_argument; "rebase limit above the unlimited sentinel"));
        }
        let rebase_limit =
            if pre_total_pooled.is_zero() { UNLIMITED.clone() } else { rebase_limit };
        Ok(Self {
            post_total_pooled: pre_total_pooled.clone(),
            pre_total_pooled,
            pre_total_shares,
            rebase_limit,
        })
    }

    /// The pooled total at which the limit is exhausted, `None` in the
    /// unlimited regime.
    fn max_total_pooled(&self) -> Option<TokenAmount> {
        if self.rebase_limit == *UNLIMITED {
            return None;
        }
        let headroom = self.pre_total_pooled.atto() * &self.rebase_limit / &*LIMITER_PRECISION;
        Some(&self.pre_total_pooled + TokenAmount::from_atto(headroom))
    }

    /// Accounts NAT leaving the pool, adding rebase headroom.
    pub fn raise_limit(&mut self, amount: &TokenAmount) -> Result<(), ActorError> {
        if *amount > self.post_total_pooled {
            return Err(
                actor_error!(illegal_argument; "cannot withdraw {} from a pool of {}", amount, self.post_total_pooled),
            );
        }
        self.post_total_pooled -= amount;
        Ok(())
    }

    /// Accounts NAT entering the pool, capped so that post/pre share-rate
    /// growth stays within the limit. Returns the amount actually consumed.
    pub fn consume_limit(&mut self, amount: &TokenAmount) -> TokenAmount {
        match self.max_total_pooled() {
            None => {
                self.post_total_pooled += amount;
                amount.clone()
            }
            Some(max) => {
                let headroom =
                    std::cmp::max(&max - &self.post_total_pooled, TokenAmount::zero());
                let consumed = std::cmp::min(amount.clone(), headroom);
                self.post_total_pooled += &consumed;
                consumed
            }
        }
    }

    pub fn is_limit_reached(&self) -> bool {
        match self.max_total_pooled() {
            None => false,
            Some(max) => self.post_total_pooled >= max,
        }
    }

    /// Shares that may be burned before the post/pre share-rate growth
    /// exceeds the limit.
    pub fn shares_to_burn_limit(&self) -> BigInt {
        if self.rebase_limit == *UNLIMITED {
            return self.pre_total_shares.clone();
        }
        if self.is_limit_reached() {
            return BigInt::zero();
        }
        let limit_plus_one = &self.rebase_limit + &*LIMITER_PRECISION;
        let pooled_rate =
            self.post_total_pooled.atto() * &*LIMITER_PRECISION / self.pre_total_pooled.atto();
        &self.pre_total_shares * (&limit_plus_one - pooled_rate) / limit_plus_one
    }
}
