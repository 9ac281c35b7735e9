// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

pub use self::events::*;
pub use self::map::*;
pub use self::message_accumulator::MessageAccumulator;
pub use self::set::Set;
pub use self::set_multimap::SetMultimap;
pub use self::set_multimap::SetMultimapConfig;

pub mod cbor;
mod events;
mod map;
mod message_accumulator;
mod set;
mod set_multimap;
