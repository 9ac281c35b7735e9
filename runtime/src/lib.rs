// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_ipld_amt::Amt;
use fvm_ipld_encoding::ipld_block::IpldBlock;
use fvm_shared::error::ErrorNumber;
use fvm_shared::Response;

pub use self::actor_error::*;
pub use self::builtin::*;
pub use self::dispatch::*;
pub use self::util::*;
pub use crate::runtime::Runtime;

pub mod actor_error;
pub mod builtin;
mod dispatch;
pub mod runtime;
pub mod util;

#[cfg(feature = "test_utils")]
pub mod test_utils;

/// Array stores elements of the actor state as an AMT rooted at a Cid held in
/// the state aggregate.
pub type Array<'bs, V, BS> = Amt<V, &'bs BS>;

/// A send that failed at the syscall level, before the receiver executed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("send failed with error number {0}")]
pub struct SendError(pub ErrorNumber);

impl From<SendError> for ActorError {
    fn from(e: SendError) -> Self {
        match e.0 {
            ErrorNumber::InsufficientFunds => {
                ActorError::insufficient_funds("not enough funds to cover send".to_string())
            }
            ErrorNumber::NotFound => {
                ActorError::not_found("send target does not exist".to_string())
            }
            num => ActorError::unspecified(format!("send failed with error number {}", num)),
        }
    }
}

/// Converts the result of a send into the receiver's return data, surfacing a
/// non-zero exit code as an error carrying that code.
pub fn extract_send_result(
    res: Result<Response, SendError>,
) -> Result<Option<IpldBlock>, ActorError> {
    let ret = res?;
    if ret.exit_code.is_success() {
        Ok(ret.return_data)
    } else {
        Err(ActorError::unchecked(
            ret.exit_code,
            format!("send aborted with code {}", ret.exit_code),
        ))
    }
}
