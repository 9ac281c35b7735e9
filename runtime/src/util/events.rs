// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_shared::event::{ActorEvent, Entry, Flags};
use serde::ser;

use crate::util::cbor::serialize_vec;
use crate::ActorError;

// Codec identifier for CBOR-encoded data.
const IPLD_CBOR: u64 = 0x51;

const EVENT_TYPE_KEY: &str = "$type";

/// Builder for ActorEvent objects, accumulating key/value pairs.
pub struct EventBuilder {
    entries: Result<Vec<Entry>, ActorError>,
}

impl EventBuilder {
    /// Creates a new builder with no values.
    pub fn new() -> Self {
        Self { entries: Ok(Vec::new()) }
    }

    /// Pushes an entry with the event type discriminator under the
    /// conventional `$type` key, indexed for retrieval.
    pub fn typ(self, _type: &str) -> Self {
        self.push_entry(EVENT_TYPE_KEY, _type, Flags::FLAG_INDEXED_ALL)
    }

    /// Pushes an entry with an indexed key and an un-indexed, IPLD-CBOR-serialized value.
    pub fn field<T: ser::Serialize + ?Sized>(self, name: &str, value: &T) -> Self {
        self.push_entry(name, value, Flags::FLAG_INDEXED_KEY)
    }

    /// Pushes an entry with an indexed key and indexed, IPLD-CBOR-serialized value.
    pub fn field_indexed<T: ser::Serialize + ?Sized>(self, name: &str, value: &T) -> Self {
        self.push_entry(name, value, Flags::FLAG_INDEXED_ALL)
    }

    /// Returns an actor event ready to emit (consuming self).
    pub fn build(self) -> Result<ActorEvent, ActorError> {
        Ok(ActorEvent { entries: self.entries? })
    }

    /// Pushes an entry with an IPLD-CBOR-serialized value.
    fn push_entry<T: ser::Serialize + ?Sized>(
        mut self,
        key: &str,
        value: &T,
        flags: Flags,
    ) -> Self {
        if let Ok(ref mut entries) = self.entries {
            match serialize_vec(&value, "event value") {
                Ok(value) => {
                    entries.push(Entry { flags, key: key.to_string(), codec: IPLD_CBOR, value })
                }
                Err(e) => {
                    self.entries = Err(e);
                }
            }
        }
        self
    }
}

impl Default for EventBuilder {
    fn default() -> Self {
        Self::new()
    }
}
