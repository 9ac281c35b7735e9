// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::cell::RefCell;
use std::fmt::Display;
use std::rc::Rc;

/// Accumulates a sequence of messages (e.g. validation failures).
#[derive(Default, Debug)]
pub struct MessageAccumulator {
    /// Accumulated messages.
    /// This is a `Rc<RefCell>` to support accumulators derived from `with_prefix()` accumulating to
    /// the same underlying collection.
    msgs: Rc<RefCell<Vec<String>>>,
    /// Optional prefix to all new messages, e.g. describing higher level context.
    prefix: String,
}

impl MessageAccumulator {
    /// Returns a new accumulator backed by the same collection, that will prefix each new message with
    /// a formatted string.
    pub fn with_prefix<S: AsRef<str>>(&self, prefix: S) -> Self {
        MessageAccumulator {
            msgs: self.msgs.clone(),
            prefix: self.prefix.to_owned() + prefix.as_ref(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.msgs.borrow().is_empty()
    }

    pub fn messages(&self) -> Vec<String> {
        self.msgs.borrow().to_owned()
    }

    /// Adds a message to the accumulator.
    pub fn add<S: AsRef<str>>(&self, msg: S) {
        self.msgs.borrow_mut().push(self.prefix.to_owned() + msg.as_ref());
    }

    /// Adds a message to the accumulator if predicate is false.
    pub fn require<S: AsRef<str>>(&self, predicate: bool, msg: S) {
        if !predicate {
            self.add(msg);
        }
    }

    /// Adds a message if result is `Err`.
    pub fn require_no_error<V, E: Display, S: AsRef<str>>(&self, result: Result<V, E>, msg: S) {
        if let Err(e) = result {
            self.add(format!("{}: {e}", msg.as_ref()));
        }
    }

    /// Panics if the accumulator contains any messages.
    pub fn assert_empty(&self) {
        assert!(self.is_empty(), "{}", self.messages().join("\n"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adds_messages() {
        let acc = MessageAccumulator::default();
        acc.add("Cthulhu");
        assert_eq!(1, acc.messages().len());
        assert_eq!(acc.messages(), vec!["Cthulhu"]);
    }

    #[test]
    fn adds_conditionally() {
        let acc = MessageAccumulator::default();
        acc.require(true, "unseen");
        acc.require(false, "seen");
        assert_eq!(acc.messages(), vec!["seen"]);
    }

    #[test]
    fn prefixes_compose() {
        let acc = MessageAccumulator::default();
        let sub = acc.with_prefix("so: ");
        sub.add("it goes");
        let subsub = sub.with_prefix("deeper: ");
        subsub.add("still");
        assert_eq!(acc.messages(), vec!["so: it goes", "so: deeper: still"]);
    }
}
