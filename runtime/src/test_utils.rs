// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use core::fmt;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use cid::Cid;
use fvm_ipld_blockstore::{Blockstore, MemoryBlockstore};
use fvm_ipld_encoding::de::DeserializeOwned;
use fvm_ipld_encoding::ipld_block::IpldBlock;
use fvm_ipld_encoding::CborStore;
use fvm_shared::address::{Address, Payload, Protocol};
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::{ErrorNumber, ExitCode};
use fvm_shared::event::ActorEvent;
use fvm_shared::sys::SendFlags;
use fvm_shared::{MethodNum, Response};
use multihash::Code;
use serde::Serialize;

use crate::runtime::{ActorCode, MessageInfo, Runtime, EMPTY_ARR_CID};
use crate::{actor_error, ActorError, SendError};

/// Enable logging to environment. Returns error if already init.
pub fn init_logging() -> Result<(), log::SetLoggerError> {
    pretty_env_logger::try_init()
}

pub struct MockRuntime<BS = MemoryBlockstore> {
    pub epoch: RefCell<ChainEpoch>,
    pub id_addresses: RefCell<HashMap<Address, Address>>,
    pub receiver: Address,
    pub caller: RefCell<Address>,
    pub origin: RefCell<Address>,
    pub value_received: RefCell<TokenAmount>,
    pub tipset_timestamp: RefCell<u64>,

    // Actor State
    pub state: RefCell<Option<Cid>>,
    pub balance: RefCell<TokenAmount>,

    // VM Impl
    pub in_call: RefCell<bool>,
    pub store: Rc<BS>,
    pub in_transaction: RefCell<bool>,

    // Expectations
    pub expectations: RefCell<Expectations>,
}

#[derive(Default)]
pub struct Expectations {
    pub expect_validate_caller_any: bool,
    pub expect_validate_caller_addr: Option<Vec<Address>>,
    pub expect_sends: VecDeque<ExpectedMessage>,
    pub expect_emitted_events: VecDeque<ActorEvent>,
    skip_verification_on_drop: bool,
}

impl Expectations {
    fn reset(&mut self) {
        self.skip_verification_on_drop = true;
        *self = Default::default();
    }

    fn verify(&mut self) {
        // If we don't reset them, we'll try to re-verify on drop. If something fails, we'll panic
        // twice and abort making the tests difficult to debug.
        self.skip_verification_on_drop = true;
        let this = std::mem::take(self);

        assert!(!this.expect_validate_caller_any, "expected ValidateCallerAny, not received");
        assert!(
            this.expect_validate_caller_addr.is_none(),
            "expected ValidateCallerAddr {:?}, not received",
            this.expect_validate_caller_addr
        );
        assert!(
            this.expect_sends.is_empty(),
            "expected all messages to be sent, unsent messages {:?}",
            this.expect_sends
        );
        assert!(
            this.expect_emitted_events.is_empty(),
            "expect_emitted_events {:?}, not received",
            this.expect_emitted_events
        );
    }
}

// The Expectations are by default verified on drop().
// In order to clear the unsatisfied expectations in tests, use MockRuntime#reset().
impl Drop for Expectations {
    fn drop(&mut self) {
        if !self.skip_verification_on_drop && !std::thread::panicking() {
            self.verify();
        }
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new(Default::default())
    }
}

impl<BS> MockRuntime<BS> {
    pub fn new(store: BS) -> Self {
        Self {
            epoch: Default::default(),
            id_addresses: Default::default(),
            receiver: Address::new_id(0),
            caller: RefCell::new(Address::new_id(0)),
            origin: RefCell::new(Address::new_id(0)),
            value_received: Default::default(),
            tipset_timestamp: Default::default(),
            state: Default::default(),
            balance: Default::default(),
            in_call: Default::default(),
            store: Rc::new(store),
            in_transaction: Default::default(),
            expectations: Default::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ExpectedMessage {
    pub to: Address,
    pub method: MethodNum,
    pub params: Option<IpldBlock>,
    pub value: TokenAmount,
    pub gas_limit: Option<u64>,
    pub send_flags: SendFlags,

    // returns from applying expectedMessage
    pub send_return: Option<IpldBlock>,
    pub exit_code: ExitCode,
    pub send_error: Option<ErrorNumber>,
}

pub fn expect_empty(res: Option<IpldBlock>) {
    assert!(res.is_none());
}

pub fn expect_abort_contains_message<T: fmt::Debug>(
    expect_exit_code: ExitCode,
    expect_msg: &str,
    res: Result<T, ActorError>,
) {
    let err = res.expect_err(&format!(
        "expected abort with exit code {}, but call succeeded",
        expect_exit_code
    ));
    assert_eq!(
        err.exit_code(),
        expect_exit_code,
        "expected failure with exit code {}, but failed with exit code {}; error message: {}",
        expect_exit_code,
        err.exit_code(),
        err.msg(),
    );
    let err_msg = err.msg();
    assert!(
        err.msg().contains(expect_msg),
        "expected err message '{}' to contain '{}'",
        err_msg,
        expect_msg,
    );
}

pub fn expect_abort<T: fmt::Debug>(exit_code: ExitCode, res: Result<T, ActorError>) {
    expect_abort_contains_message(exit_code, "", res);
}

impl<BS: Blockstore> MockRuntime<BS> {
    ///// Runtime access for tests /////

    pub fn get_state<T: DeserializeOwned>(&self) -> T {
        self.store_get(self.state.borrow().as_ref().unwrap())
    }

    pub fn replace_state<T: Serialize>(&self, obj: &T) {
        self.state.replace(Some(self.store_put(obj)));
    }

    pub fn set_balance(&self, amount: TokenAmount) {
        self.balance.replace(amount);
    }

    pub fn get_balance(&self) -> TokenAmount {
        self.balance.borrow().to_owned()
    }

    pub fn add_balance(&self, amount: TokenAmount) {
        self.balance.replace_with(|b| b.clone() + amount);
    }

    pub fn set_caller(&self, address: Address) {
        // fail if called with a non-ID address, since the caller() method must always return an ID
        address.id().unwrap();
        self.caller.replace(address);
    }

    pub fn set_origin(&self, address: Address) {
        address.id().unwrap();
        self.origin.replace(address);
    }

    pub fn set_received(&self, amount: TokenAmount) {
        self.value_received.replace(amount);
    }

    pub fn set_epoch(&self, epoch: ChainEpoch) -> ChainEpoch {
        self.epoch.replace(epoch);
        epoch
    }

    pub fn set_tipset_timestamp(&self, timestamp: u64) {
        self.tipset_timestamp.replace(timestamp);
    }

    pub fn get_id_address(&self, address: &Address) -> Option<Address> {
        if address.protocol() == Protocol::ID {
            return Some(*address);
        }
        self.id_addresses.borrow().get(address).cloned()
    }

    pub fn add_id_address(&self, source: Address, target: Address) {
        assert_eq!(target.protocol(), Protocol::ID, "target must use ID address protocol");
        self.id_addresses.borrow_mut().insert(source, target);
    }

    pub fn call<A: ActorCode>(
        &self,
        method_num: MethodNum,
        params: Option<IpldBlock>,
    ) -> Result<Option<IpldBlock>, ActorError> {
        self.in_call.replace(true);
        let prev_state = *self.state.borrow();
        let res = A::invoke_method(self, method_num, params);

        if res.is_err() {
            self.state.replace(prev_state);
        }
        self.in_call.replace(false);
        res
    }

    /// Verifies that all mock expectations have been met (and resets the expectations).
    pub fn verify(&self) {
        self.expectations.borrow_mut().verify()
    }

    /// Clears all mock expectations.
    pub fn reset(&self) {
        self.expectations.borrow_mut().reset();
    }

    ///// Mock expectations /////

    #[allow(dead_code)]
    pub fn expect_validate_caller_addr(&self, addr: Vec<Address>) {
        assert!(!addr.is_empty(), "addrs must be non-empty");
        self.expectations.borrow_mut().expect_validate_caller_addr = Some(addr);
    }

    #[allow(dead_code)]
    pub fn expect_validate_caller_any(&self) {
        self.expectations.borrow_mut().expect_validate_caller_any = true;
    }

    #[allow(dead_code)]
    pub fn expect_send_simple(
        &self,
        to: Address,
        method: MethodNum,
        params: Option<IpldBlock>,
        value: TokenAmount,
        send_return: Option<IpldBlock>,
        exit_code: ExitCode,
    ) {
        self.expect_send(
            to,
            method,
            params,
            value,
            None,
            SendFlags::default(),
            send_return,
            exit_code,
            None,
        )
    }

    #[allow(dead_code)]
    #[allow(clippy::too_many_arguments)]
    pub fn expect_send(
        &self,
        to: Address,
        method: MethodNum,
        params: Option<IpldBlock>,
        value: TokenAmount,
        gas_limit: Option<u64>,
        send_flags: SendFlags,
        send_return: Option<IpldBlock>,
        exit_code: ExitCode,
        send_error: Option<ErrorNumber>,
    ) {
        self.expectations.borrow_mut().expect_sends.push_back(ExpectedMessage {
            to,
            method,
            params,
            value,
            gas_limit,
            send_flags,
            send_return,
            exit_code,
            send_error,
        })
    }

    #[allow(dead_code)]
    pub fn expect_emitted_event(&self, event: ActorEvent) {
        self.expectations.borrow_mut().expect_emitted_events.push_back(event)
    }

    ///// Private helpers /////

    fn require_in_call(&self) {
        assert!(*self.in_call.borrow(), "invalid runtime invocation outside of method call")
    }

    fn store_put<T: Serialize>(&self, o: &T) -> Cid {
        self.store.put_cbor(&o, Code::Blake2b256).unwrap()
    }

    fn store_get<T: DeserializeOwned>(&self, cid: &Cid) -> T {
        self.store.get_cbor(cid).unwrap().unwrap()
    }
}

impl<BS> MessageInfo for MockRuntime<BS> {
    fn caller(&self) -> Address {
        *self.caller.borrow()
    }
    fn origin(&self) -> Address {
        *self.origin.borrow()
    }
    fn receiver(&self) -> Address {
        self.receiver
    }
    fn value_received(&self) -> TokenAmount {
        self.value_received.borrow().clone()
    }
}

impl<BS: Blockstore> Runtime for MockRuntime<BS> {
    type Blockstore = Rc<BS>;

    fn message(&self) -> &dyn MessageInfo {
        self.require_in_call();
        self
    }

    fn curr_epoch(&self) -> ChainEpoch {
        self.require_in_call();
        *self.epoch.borrow()
    }

    fn tipset_timestamp(&self) -> u64 {
        *self.tipset_timestamp.borrow()
    }

    fn validate_immediate_caller_accept_any(&self) -> Result<(), ActorError> {
        self.require_in_call();
        assert!(
            self.expectations.borrow_mut().expect_validate_caller_any,
            "unexpected validate-caller-any"
        );
        self.expectations.borrow_mut().expect_validate_caller_any = false;
        Ok(())
    }

    fn validate_immediate_caller_is<'a, I>(&self, addresses: I) -> Result<(), ActorError>
    where
        I: IntoIterator<Item = &'a Address>,
    {
        self.require_in_call();

        let addrs: Vec<Address> = addresses.into_iter().cloned().collect();

        let mut expectations = self.expectations.borrow_mut();
        assert!(
            expectations.expect_validate_caller_addr.is_some(),
            "unexpected validate caller addrs"
        );

        let expected_addrs = expectations.expect_validate_caller_addr.as_ref().unwrap();
        assert_eq!(
            &addrs, expected_addrs,
            "unexpected validate caller addrs {:?}, expected {:?}",
            addrs, &expectations.expect_validate_caller_addr
        );

        for expected in &addrs {
            if self.message().caller() == *expected {
                expectations.expect_validate_caller_addr = None;
                return Ok(());
            }
        }
        expectations.expect_validate_caller_addr = None;
        Err(actor_error!(forbidden;
                "caller address {:?} forbidden, allowed: {:?}",
                self.message().caller(), &addrs
        ))
    }

    fn current_balance(&self) -> TokenAmount {
        self.require_in_call();
        self.balance.borrow().clone()
    }

    fn resolve_address(&self, address: &Address) -> Option<u64> {
        self.require_in_call();
        if let &Payload::ID(id) = address.payload() {
            return Some(id);
        }

        match self.get_id_address(address) {
            None => None,
            Some(addr) => {
                if let &Payload::ID(id) = addr.payload() {
                    return Some(id);
                }
                None
            }
        }
    }

    fn create<T: Serialize>(&self, obj: &T) -> Result<(), ActorError> {
        if self.state.borrow().is_some() {
            return Err(actor_error!(illegal_state; "state already constructed"));
        }
        self.state.replace(Some(self.store_put(obj)));
        Ok(())
    }

    fn state<T: DeserializeOwned>(&self) -> Result<T, ActorError> {
        Ok(self.store_get(self.state.borrow().as_ref().unwrap()))
    }

    fn get_state_root(&self) -> Result<Cid, ActorError> {
        Ok(self.state.borrow().unwrap_or(*EMPTY_ARR_CID))
    }

    fn set_state_root(&self, root: &Cid) -> Result<(), ActorError> {
        self.state.replace(Some(*root));
        Ok(())
    }

    fn transaction<S, RT, F>(&self, f: F) -> Result<RT, ActorError>
    where
        S: Serialize + DeserializeOwned,
        F: FnOnce(&mut S, &Self) -> Result<RT, ActorError>,
    {
        if *self.in_transaction.borrow() {
            return Err(actor_error!(assertion_failed; "nested transaction"));
        }
        let mut read_only = self.state()?;
        self.in_transaction.replace(true);
        let ret = f(&mut read_only, self);
        if ret.is_ok() {
            self.state.replace(Some(self.store_put(&read_only)));
        }
        self.in_transaction.replace(false);
        ret
    }

    fn store(&self) -> &Rc<BS> {
        &self.store
    }

    fn send(
        &self,
        to: &Address,
        method: MethodNum,
        params: Option<IpldBlock>,
        value: TokenAmount,
        gas_limit: Option<u64>,
        send_flags: SendFlags,
    ) -> Result<Response, SendError> {
        self.require_in_call();
        if *self.in_transaction.borrow() {
            return Ok(Response { exit_code: ExitCode::USR_ASSERTION_FAILED, return_data: None });
        }

        assert!(
            !self.expectations.borrow_mut().expect_sends.is_empty(),
            "unexpected message to: {:?} method: {:?}, value: {:?}, params: {:?}",
            to,
            method,
            value,
            params
        );

        let expected_msg = self.expectations.borrow_mut().expect_sends.pop_front().unwrap();

        assert_eq!(expected_msg.to, *to);
        assert_eq!(expected_msg.method, method);
        assert_eq!(expected_msg.params, params);
        assert_eq!(expected_msg.value, value);
        assert_eq!(expected_msg.gas_limit, gas_limit, "gas limit did not match expectation");
        assert_eq!(expected_msg.send_flags, send_flags, "send flags did not match expectation");

        if let Some(e) = expected_msg.send_error {
            return Err(SendError(e));
        }

        {
            let mut balance = self.balance.borrow_mut();
            if value > *balance {
                return Err(SendError(ErrorNumber::InsufficientFunds));
            }
            *balance -= value;
        }

        Ok(Response { exit_code: expected_msg.exit_code, return_data: expected_msg.send_return })
    }

    fn emit_event(&self, event: &ActorEvent) -> Result<(), ActorError> {
        let expected = self
            .expectations
            .borrow_mut()
            .expect_emitted_events
            .pop_front()
            .expect("unexpected call to emit_event");

        assert_eq!(*event, expected);

        Ok(())
    }

    fn read_only(&self) -> bool {
        false
    }
}
