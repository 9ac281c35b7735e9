// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_ipld_encoding::tuple::*;
use fvm_shared::bigint::{bigint_ser, BigInt};

pub mod stk {
    use super::*;

    pub const BURN_SHARES_METHOD: u64 = 2;

    #[derive(Serialize_tuple, Deserialize_tuple)]
    pub struct BurnSharesParams {
        #[serde(with = "bigint_ser")]
        pub shares: BigInt,
    }
}
