// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_ipld_encoding::ipld_block::IpldBlock;
use fvm_shared::address::Address;
use fvm_shared::bigint::bigint_ser::BigIntSer;
use fvm_shared::bigint::BigInt;
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::ExitCode;
use fvm_shared::{METHOD_CONSTRUCTOR, METHOD_SEND};
use num_traits::Zero;

use lsp_actor_withdrawal_queue::testing::check_state_invariants;
use lsp_actor_withdrawal_queue::{
    ext, Actor, BatchesCalculationState, CalculateFinalizationBatchesParams, ClaimParams,
    ConstructorParams, FinalizeParams, FindCheckpointHintParams, GetClaimableNatParams,
    GetWithdrawalRequestsOfParams, GetWithdrawalStatusParams, Method, OnOracleReportParams,
    PrefinalizeParams, PrefinalizeReturn, QueueInfoReturn, RequestWithdrawalParams, State,
    WithdrawalStatus, E27,
};
use lsp_actors_runtime::runtime::Runtime;
use lsp_actors_runtime::test_utils::*;
use lsp_actors_runtime::{EventBuilder, SYSTEM_ACTOR_ADDR};

const QUEUE_ID: u64 = 100;
const TOKEN_ID: u64 = 101;
const ORACLE_ID: u64 = 102;
const USER1_ID: u64 = 103;
const USER2_ID: u64 = 104;

fn stk_token() -> Address {
    Address::new_id(TOKEN_ID)
}

fn oracle() -> Address {
    Address::new_id(ORACLE_ID)
}

fn whole(n: u64) -> TokenAmount {
    TokenAmount::from_whole(n)
}

fn atto(n: u128) -> TokenAmount {
    TokenAmount::from_atto(n)
}

fn shares_whole(n: u64) -> BigInt {
    BigInt::from(n) * BigInt::from(1_000_000_000_000_000_000_u64)
}

/// Share rate `numerator/denominator` scaled by 1e27.
fn rate(numerator: u64, denominator: u64) -> BigInt {
    BigInt::from(numerator) * &*E27 / BigInt::from(denominator)
}

fn check_state(rt: &MockRuntime) {
    let (_, acc) = check_state_invariants(&rt.get_state(), rt.store());
    acc.assert_empty();
}

fn construct_and_verify() -> MockRuntime {
    let rt = MockRuntime { receiver: Address::new_id(QUEUE_ID), ..Default::default() };
    rt.set_caller(SYSTEM_ACTOR_ADDR);
    rt.expect_validate_caller_addr(vec![SYSTEM_ACTOR_ADDR]);
    let params = ConstructorParams { stk_token: stk_token(), oracle: oracle() };
    rt.call::<Actor>(METHOD_CONSTRUCTOR, IpldBlock::serialize_cbor(&params).unwrap()).unwrap();
    rt.verify();
    check_state(&rt);
    rt
}

fn enqueue(rt: &MockRuntime, user: u64, stk: &TokenAmount, shares: &BigInt, now: u64) -> u64 {
    let st: State = rt.get_state();
    let expected_id = st.last_request_id + 1;

    rt.set_caller(stk_token());
    rt.set_origin(Address::new_id(user));
    rt.set_tipset_timestamp(now);
    rt.expect_validate_caller_addr(vec![stk_token()]);
    rt.expect_emitted_event(
        EventBuilder::new()
            .typ("withdrawal-requested")
            .field_indexed("id", &expected_id)
            .field_indexed("requestor", &user)
            .field_indexed("owner", &user)
            .field("stk", stk)
            .field("shares", &BigIntSer(shares))
            .build()
            .unwrap(),
    );

    let params = RequestWithdrawalParams {
        amount: stk.clone(),
        shares: shares.clone(),
        owner: Address::new_id(user),
    };
    let ret = rt
        .call::<Actor>(
            Method::RequestWithdrawal as u64,
            IpldBlock::serialize_cbor(&params).unwrap(),
        )
        .unwrap();
    let id: u64 = ret.unwrap().deserialize().unwrap();
    assert_eq!(expected_id, id);
    rt.verify();
    check_state(rt);
    id
}

fn prefinalize(rt: &MockRuntime, batches: Vec<u64>, max_share_rate: BigInt) -> PrefinalizeReturn {
    rt.expect_validate_caller_any();
    let ret = rt
        .call::<Actor>(
            Method::Prefinalize as u64,
            IpldBlock::serialize_cbor(&PrefinalizeParams { batches, max_share_rate }).unwrap(),
        )
        .unwrap();
    rt.verify();
    ret.unwrap().deserialize().unwrap()
}

fn finalize(
    rt: &MockRuntime,
    batches: Vec<u64>,
    amount: &TokenAmount,
    max_share_rate: BigInt,
    shares_to_burn: &BigInt,
    now: u64,
) {
    let st: State = rt.get_state();
    let from_id = st.last_finalized_request_id + 1;
    let to_id = *batches.last().unwrap();

    rt.set_caller(oracle());
    rt.set_received(amount.clone());
    rt.add_balance(amount.clone());
    rt.set_tipset_timestamp(now);
    rt.expect_validate_caller_addr(vec![oracle()]);
    rt.expect_send_simple(
        stk_token(),
        ext::stk::BURN_SHARES_METHOD,
        IpldBlock::serialize_cbor(&ext::stk::BurnSharesParams { shares: shares_to_burn.clone() })
            .unwrap(),
        TokenAmount::zero(),
        None,
        ExitCode::OK,
    );
    rt.expect_emitted_event(
        EventBuilder::new()
            .typ("withdrawal-batch-finalized")
            .field_indexed("from_id", &from_id)
            .field_indexed("to_id", &to_id)
            .field("nat_locked", amount)
            .field("shares_burned", &BigIntSer(shares_to_burn))
            .field("timestamp", &now)
            .build()
            .unwrap(),
    );

    let params = FinalizeParams { batches, max_share_rate };
    rt.call::<Actor>(Method::Finalize as u64, IpldBlock::serialize_cbor(&params).unwrap())
        .unwrap();
    rt.set_received(TokenAmount::zero());
    rt.verify();
    check_state(rt);
}

fn claim(rt: &MockRuntime, user: u64, request_id: u64, hint: u64, payout: &TokenAmount) {
    let recipient = Address::new_id(user);
    rt.set_caller(recipient);
    rt.expect_validate_caller_any();
    rt.expect_send_simple(recipient, METHOD_SEND, None, payout.clone(), None, ExitCode::OK);
    rt.expect_emitted_event(
        EventBuilder::new()
            .typ("withdrawal-claimed")
            .field_indexed("id", &request_id)
            .field_indexed("owner", &user)
            .field_indexed("recipient", &recipient)
            .field("nat", payout)
            .build()
            .unwrap(),
    );

    let params = ClaimParams { request_id, hint, recipient };
    rt.call::<Actor>(Method::Claim as u64, IpldBlock::serialize_cbor(&params).unwrap()).unwrap();
    rt.verify();
    check_state(rt);
}

fn oracle_report(rt: &MockRuntime, timestamp: u64) {
    rt.set_caller(oracle());
    rt.expect_validate_caller_addr(vec![oracle()]);
    rt.call::<Actor>(
        Method::OnOracleReport as u64,
        IpldBlock::serialize_cbor(&OnOracleReportParams { report_timestamp: timestamp }).unwrap(),
    )
    .unwrap();
    rt.verify();
}

fn queue_info(rt: &MockRuntime) -> QueueInfoReturn {
    rt.expect_validate_caller_any();
    let ret = rt.call::<Actor>(Method::GetQueueInfo as u64, None).unwrap();
    rt.verify();
    ret.unwrap().deserialize().unwrap()
}

mod construction {
    use super::*;

    #[test]
    fn constructs_with_sentinels() {
        let rt = construct_and_verify();
        let st: State = rt.get_state();
        assert_eq!(st.stk_token, stk_token());
        assert_eq!(st.oracle, oracle());
        assert_eq!(st.last_request_id, 0);
        assert_eq!(st.last_finalized_request_id, 0);
        assert_eq!(st.last_checkpoint_index, 0);
        assert!(st.locked_nat.is_zero());
    }

    #[test]
    fn rejects_non_system_caller() {
        let rt = MockRuntime { receiver: Address::new_id(QUEUE_ID), ..Default::default() };
        rt.set_caller(Address::new_id(USER1_ID));
        rt.expect_validate_caller_addr(vec![SYSTEM_ACTOR_ADDR]);
        let params = ConstructorParams { stk_token: stk_token(), oracle: oracle() };
        expect_abort(
            ExitCode::USR_FORBIDDEN,
            rt.call::<Actor>(METHOD_CONSTRUCTOR, IpldBlock::serialize_cbor(&params).unwrap()),
        );
        rt.verify();
    }
}

mod request_withdrawal {
    use super::*;

    #[test]
    fn enqueues_and_indexes_requests() {
        let rt = construct_and_verify();
        oracle_report(&rt, 1000);

        let id1 = enqueue(&rt, USER1_ID, &whole(1), &shares_whole(1), 2000);
        let id2 = enqueue(&rt, USER2_ID, &whole(2), &shares_whole(2), 2100);
        assert_eq!((1, 2), (id1, id2));

        let st: State = rt.get_state();
        assert_eq!(st.last_request_id, 2);

        rt.expect_validate_caller_any();
        let status: WithdrawalStatus = rt
            .call::<Actor>(
                Method::GetWithdrawalStatus as u64,
                IpldBlock::serialize_cbor(&GetWithdrawalStatusParams { request_id: 2 }).unwrap(),
            )
            .unwrap()
            .unwrap()
            .deserialize()
            .unwrap();
        assert_eq!(
            status,
            WithdrawalStatus {
                amount_stk: whole(2),
                amount_shares: shares_whole(2),
                owner: USER2_ID,
                created_at: 2100,
                is_finalized: false,
                is_claimed: false,
            }
        );

        rt.expect_validate_caller_any();
        let ids: Vec<u64> = rt
            .call::<Actor>(
                Method::GetWithdrawalRequestsOf as u64,
                IpldBlock::serialize_cbor(&GetWithdrawalRequestsOfParams {
                    owner: Address::new_id(USER1_ID),
                })
                .unwrap(),
            )
            .unwrap()
            .unwrap()
            .deserialize()
            .unwrap();
        assert_eq!(ids, vec![1]);
        rt.verify();
    }

    #[test]
    fn stamps_requests_with_the_latest_report() {
        let rt = construct_and_verify();
        oracle_report(&rt, 1000);
        enqueue(&rt, USER1_ID, &whole(1), &shares_whole(1), 2000);
        oracle_report(&rt, 3000);
        enqueue(&rt, USER1_ID, &whole(1), &shares_whole(1), 4000);

        let st: State = rt.get_state();
        assert_eq!(st.last_report_timestamp, 3000);
        let requests = st.load_requests(rt.store()).unwrap();
        assert_eq!(requests.get(1).unwrap().unwrap().report_at, 1000);
        assert_eq!(requests.get(2).unwrap().unwrap().report_at, 3000);
    }

    #[test]
    fn rejects_non_token_caller() {
        let rt = construct_and_verify();
        rt.set_caller(Address::new_id(USER1_ID));
        rt.expect_validate_caller_addr(vec![stk_token()]);
        let params = RequestWithdrawalParams {
            amount: whole(1),
            shares: shares_whole(1),
            owner: Address::new_id(USER1_ID),
        };
        expect_abort(
            ExitCode::USR_FORBIDDEN,
            rt.call::<Actor>(
                Method::RequestWithdrawal as u64,
                IpldBlock::serialize_cbor(&params).unwrap(),
            ),
        );
        rt.verify();
        check_state(&rt);
    }

    #[test]
    fn rejects_amounts_outside_policy_bounds() {
        let rt = construct_and_verify();
        for (amount, msg) in
            [(atto(99), "below the minimum"), (whole(1001), "above the maximum")]
        {
            rt.set_caller(stk_token());
            rt.expect_validate_caller_addr(vec![stk_token()]);
            let params = RequestWithdrawalParams {
                amount,
                shares: shares_whole(1),
                owner: Address::new_id(USER1_ID),
            };
            expect_abort_contains_message(
                ExitCode::USR_ILLEGAL_ARGUMENT,
                msg,
                rt.call::<Actor>(
                    Method::RequestWithdrawal as u64,
                    IpldBlock::serialize_cbor(&params).unwrap(),
                ),
            );
            rt.verify();
        }
        check_state(&rt);
    }

    #[test]
    fn rejects_zero_shares() {
        let rt = construct_and_verify();
        rt.set_caller(stk_token());
        rt.expect_validate_caller_addr(vec![stk_token()]);
        let params = RequestWithdrawalParams {
            amount: whole(1),
            shares: BigInt::zero(),
            owner: Address::new_id(USER1_ID),
        };
        expect_abort_contains_message(
            ExitCode::USR_ILLEGAL_ARGUMENT,
            "no shares",
            rt.call::<Actor>(
                Method::RequestWithdrawal as u64,
                IpldBlock::serialize_cbor(&params).unwrap(),
            ),
        );
        rt.verify();
        check_state(&rt);
    }
}

mod finalize_and_claim {
    use super::*;

    #[test]
    fn single_request_nominal() {
        let rt = construct_and_verify();
        oracle_report(&rt, 1000);
        enqueue(&rt, USER1_ID, &whole(1), &shares_whole(1), 2000);

        let pre = prefinalize(&rt, vec![1], rate(1, 1));
        assert_eq!(pre, PrefinalizeReturn { nat_to_lock: whole(1), shares_to_burn: shares_whole(1) });

        finalize(&rt, vec![1], &whole(1), rate(1, 1), &shares_whole(1), 3000);

        let info = queue_info(&rt);
        assert_eq!(info.last_finalized_request_id, 1);
        assert_eq!(info.last_checkpoint_index, 1);
        assert_eq!(info.locked_nat, whole(1));

        rt.expect_validate_caller_any();
        let claimable: TokenAmount = rt
            .call::<Actor>(
                Method::GetClaimableNat as u64,
                IpldBlock::serialize_cbor(&GetClaimableNatParams { request_id: 1, hint: 1 })
                    .unwrap(),
            )
            .unwrap()
            .unwrap()
            .deserialize()
            .unwrap();
        assert_eq!(claimable, whole(1));

        claim(&rt, USER1_ID, 1, 1, &whole(1));
        let st: State = rt.get_state();
        assert!(st.locked_nat.is_zero());
        assert!(rt.get_balance().is_zero());
    }

    #[test]
    fn single_request_discounted() {
        let rt = construct_and_verify();
        oracle_report(&rt, 1000);
        // Enqueued at a share rate of 1.0, finalized after a drop to 0.5.
        enqueue(&rt, USER1_ID, &whole(1), &shares_whole(1), 2000);

        let half = atto(500_000_000_000_000_000);
        let pre = prefinalize(&rt, vec![1], rate(1, 2));
        assert_eq!(
            pre,
            PrefinalizeReturn { nat_to_lock: half.clone(), shares_to_burn: shares_whole(1) }
        );

        finalize(&rt, vec![1], &half, rate(1, 2), &shares_whole(1), 3000);

        let st: State = rt.get_state();
        assert_eq!(st.last_checkpoint_index, 1);
        let checkpoints = st.load_checkpoints(rt.store()).unwrap();
        let cp = checkpoints.get(1).unwrap().unwrap();
        assert_eq!(cp.from_request_id, 1);
        assert_eq!(cp.max_share_rate, rate(1, 2));

        claim(&rt, USER1_ID, 1, 1, &half);
        let st: State = rt.get_state();
        assert!(st.locked_nat.is_zero());
    }

    #[test]
    fn two_requests_two_batches() {
        let rt = construct_and_verify();
        oracle_report(&rt, 1000);
        // Request 1 sits below the cap, request 2 above it.
        enqueue(&rt, USER1_ID, &whole(1), &shares_whole(2), 2000);
        enqueue(&rt, USER2_ID, &whole(2), &shares_whole(2), 2100);

        let cap = rate(85, 100);
        let expected_lock = atto(2_700_000_000_000_000_000);
        let pre = prefinalize(&rt, vec![1, 2], cap.clone());
        assert_eq!(
            pre,
            PrefinalizeReturn {
                nat_to_lock: expected_lock.clone(),
                shares_to_burn: shares_whole(4)
            }
        );

        finalize(&rt, vec![1, 2], &expected_lock, cap.clone(), &shares_whole(4), 3000);

        // Nominal request pays its STK, discounted one pays shares * cap.
        claim(&rt, USER1_ID, 1, 1, &whole(1));
        claim(&rt, USER2_ID, 2, 1, &atto(1_700_000_000_000_000_000));

        let st: State = rt.get_state();
        assert!(st.locked_nat.is_zero());
        assert!(rt.get_balance().is_zero());
    }

    #[test]
    fn oversend_is_rejected() {
        let rt = construct_and_verify();
        oracle_report(&rt, 1000);
        enqueue(&rt, USER1_ID, &whole(1), &shares_whole(1), 2000);

        rt.set_caller(oracle());
        rt.set_received(whole(2));
        rt.expect_validate_caller_addr(vec![oracle()]);
        let params = FinalizeParams { batches: vec![1], max_share_rate: rate(1, 1) };
        expect_abort_contains_message(
            ExitCode::USR_ILLEGAL_ARGUMENT,
            "too much NAT to finalize",
            rt.call::<Actor>(Method::Finalize as u64, IpldBlock::serialize_cbor(&params).unwrap()),
        );
        rt.set_received(TokenAmount::zero());
        rt.verify();
        check_state(&rt);
        assert_eq!(queue_info(&rt).last_finalized_request_id, 0);
    }

    #[test]
    fn finalize_requires_the_oracle() {
        let rt = construct_and_verify();
        oracle_report(&rt, 1000);
        enqueue(&rt, USER1_ID, &whole(1), &shares_whole(1), 2000);

        rt.set_caller(Address::new_id(USER1_ID));
        rt.set_received(whole(1));
        rt.expect_validate_caller_addr(vec![oracle()]);
        let params = FinalizeParams { batches: vec![1], max_share_rate: rate(1, 1) };
        expect_abort(
            ExitCode::USR_FORBIDDEN,
            rt.call::<Actor>(Method::Finalize as u64, IpldBlock::serialize_cbor(&params).unwrap()),
        );
        rt.set_received(TokenAmount::zero());
        rt.verify();
        check_state(&rt);
    }

    #[test]
    fn finalize_rejects_malformed_reports() {
        let rt = construct_and_verify();
        oracle_report(&rt, 1000);
        enqueue(&rt, USER1_ID, &whole(1), &shares_whole(1), 2000);

        // Empty batch list.
        rt.set_caller(oracle());
        rt.set_received(whole(1));
        rt.expect_validate_caller_addr(vec![oracle()]);
        let params = FinalizeParams { batches: vec![], max_share_rate: rate(1, 1) };
        expect_abort_contains_message(
            ExitCode::USR_ILLEGAL_ARGUMENT,
            "empty batches",
            rt.call::<Actor>(Method::Finalize as u64, IpldBlock::serialize_cbor(&params).unwrap()),
        );
        rt.verify();

        // Zero share-rate cap.
        rt.expect_validate_caller_addr(vec![oracle()]);
        let params = FinalizeParams { batches: vec![1], max_share_rate: BigInt::zero() };
        expect_abort_contains_message(
            ExitCode::USR_ILLEGAL_ARGUMENT,
            "zero max share rate",
            rt.call::<Actor>(Method::Finalize as u64, IpldBlock::serialize_cbor(&params).unwrap()),
        );
        rt.verify();

        // No NAT attached.
        rt.set_received(TokenAmount::zero());
        rt.expect_validate_caller_addr(vec![oracle()]);
        let params = FinalizeParams { batches: vec![1], max_share_rate: rate(1, 1) };
        expect_abort_contains_message(
            ExitCode::USR_ILLEGAL_ARGUMENT,
            "no NAT attached",
            rt.call::<Actor>(Method::Finalize as u64, IpldBlock::serialize_cbor(&params).unwrap()),
        );
        rt.verify();
        check_state(&rt);
    }

    #[test]
    fn claim_rejects_invalid_hints() {
        let rt = construct_and_verify();
        oracle_report(&rt, 1000);
        enqueue(&rt, USER1_ID, &whole(1), &shares_whole(1), 2000);
        enqueue(&rt, USER2_ID, &whole(1), &shares_whole(1), 2100);

        // Two finalizations under different caps produce two checkpoints.
        finalize(&rt, vec![1], &atto(500_000_000_000_000_000), rate(1, 2), &shares_whole(1), 3000);
        finalize(&rt, vec![2], &atto(600_000_000_000_000_000), rate(6, 10), &shares_whole(1), 4000);

        // A hint pointing at a checkpoint that starts beyond the request.
        rt.set_caller(Address::new_id(USER1_ID));
        rt.expect_validate_caller_any();
        let params = ClaimParams { request_id: 1, hint: 2, recipient: Address::new_id(USER1_ID) };
        expect_abort_contains_message(
            ExitCode::USR_ILLEGAL_ARGUMENT,
            "invalid checkpoint hint",
            rt.call::<Actor>(Method::Claim as u64, IpldBlock::serialize_cbor(&params).unwrap()),
        );
        rt.verify();
        check_state(&rt);

        // A hint below the governing checkpoint.
        rt.set_caller(Address::new_id(USER2_ID));
        rt.expect_validate_caller_any();
        let params = ClaimParams { request_id: 2, hint: 1, recipient: Address::new_id(USER2_ID) };
        expect_abort_contains_message(
            ExitCode::USR_ILLEGAL_ARGUMENT,
            "invalid checkpoint hint",
            rt.call::<Actor>(Method::Claim as u64, IpldBlock::serialize_cbor(&params).unwrap()),
        );
        rt.verify();
        check_state(&rt);

        // The valid hints still work.
        claim(&rt, USER1_ID, 1, 1, &atto(500_000_000_000_000_000));
        claim(&rt, USER2_ID, 2, 2, &atto(600_000_000_000_000_000));
    }

    #[test]
    fn find_checkpoint_hint_resolves_claims() {
        let rt = construct_and_verify();
        oracle_report(&rt, 1000);
        enqueue(&rt, USER1_ID, &whole(1), &shares_whole(1), 2000);
        enqueue(&rt, USER2_ID, &whole(1), &shares_whole(1), 2100);
        finalize(&rt, vec![1], &atto(500_000_000_000_000_000), rate(1, 2), &shares_whole(1), 3000);
        finalize(&rt, vec![2], &atto(600_000_000_000_000_000), rate(6, 10), &shares_whole(1), 4000);

        for (request_id, expected) in [(1u64, 1u64), (2, 2)] {
            rt.expect_validate_caller_any();
            let hint: u64 = rt
                .call::<Actor>(
                    Method::FindCheckpointHint as u64,
                    IpldBlock::serialize_cbor(&FindCheckpointHintParams {
                        request_id,
                        start: 1,
                        end: 2,
                    })
                    .unwrap(),
                )
                .unwrap()
                .unwrap()
                .deserialize()
                .unwrap();
            assert_eq!(hint, expected);
        }
        rt.verify();

        claim(&rt, USER1_ID, 1, 1, &atto(500_000_000_000_000_000));
        claim(&rt, USER2_ID, 2, 2, &atto(600_000_000_000_000_000));
    }

    #[test]
    fn claim_requires_the_owner() {
        let rt = construct_and_verify();
        oracle_report(&rt, 1000);
        enqueue(&rt, USER1_ID, &whole(1), &shares_whole(1), 2000);
        finalize(&rt, vec![1], &whole(1), rate(1, 1), &shares_whole(1), 3000);

        rt.set_caller(Address::new_id(USER2_ID));
        rt.expect_validate_caller_any();
        let params = ClaimParams { request_id: 1, hint: 1, recipient: Address::new_id(USER2_ID) };
        expect_abort_contains_message(
            ExitCode::USR_FORBIDDEN,
            "only the owner",
            rt.call::<Actor>(Method::Claim as u64, IpldBlock::serialize_cbor(&params).unwrap()),
        );
        rt.verify();
        check_state(&rt);
    }

    #[test]
    fn claim_is_one_shot() {
        let rt = construct_and_verify();
        oracle_report(&rt, 1000);
        enqueue(&rt, USER1_ID, &whole(1), &shares_whole(1), 2000);
        finalize(&rt, vec![1], &whole(1), rate(1, 1), &shares_whole(1), 3000);
        claim(&rt, USER1_ID, 1, 1, &whole(1));

        rt.set_caller(Address::new_id(USER1_ID));
        rt.expect_validate_caller_any();
        let params = ClaimParams { request_id: 1, hint: 1, recipient: Address::new_id(USER1_ID) };
        expect_abort_contains_message(
            ExitCode::USR_FORBIDDEN,
            "already claimed",
            rt.call::<Actor>(Method::Claim as u64, IpldBlock::serialize_cbor(&params).unwrap()),
        );
        rt.verify();
        check_state(&rt);
    }

    #[test]
    fn claim_rejects_unfinalized_and_unknown_requests() {
        let rt = construct_and_verify();
        oracle_report(&rt, 1000);
        enqueue(&rt, USER1_ID, &whole(1), &shares_whole(1), 2000);

        rt.set_caller(Address::new_id(USER1_ID));
        rt.expect_validate_caller_any();
        let params = ClaimParams { request_id: 1, hint: 1, recipient: Address::new_id(USER1_ID) };
        expect_abort_contains_message(
            ExitCode::USR_FORBIDDEN,
            "not finalized",
            rt.call::<Actor>(Method::Claim as u64, IpldBlock::serialize_cbor(&params).unwrap()),
        );
        rt.verify();

        rt.expect_validate_caller_any();
        let params = ClaimParams { request_id: 7, hint: 1, recipient: Address::new_id(USER1_ID) };
        expect_abort_contains_message(
            ExitCode::USR_ILLEGAL_ARGUMENT,
            "invalid request id",
            rt.call::<Actor>(Method::Claim as u64, IpldBlock::serialize_cbor(&params).unwrap()),
        );
        rt.verify();
        check_state(&rt);
    }

    #[test]
    fn claim_fails_when_custody_is_short() {
        let rt = construct_and_verify();
        oracle_report(&rt, 1000);
        enqueue(&rt, USER1_ID, &whole(1), &shares_whole(1), 2000);
        finalize(&rt, vec![1], &whole(1), rate(1, 1), &shares_whole(1), 3000);

        rt.set_balance(atto(1));
        rt.set_caller(Address::new_id(USER1_ID));
        rt.expect_validate_caller_any();
        rt.expect_send_simple(
            Address::new_id(USER1_ID),
            METHOD_SEND,
            None,
            whole(1),
            None,
            ExitCode::OK,
        );
        let params = ClaimParams { request_id: 1, hint: 1, recipient: Address::new_id(USER1_ID) };
        expect_abort(
            ExitCode::USR_INSUFFICIENT_FUNDS,
            rt.call::<Actor>(Method::Claim as u64, IpldBlock::serialize_cbor(&params).unwrap()),
        );
        rt.verify();
        check_state(&rt);

        // The claim rolled back whole, including the locked total.
        assert_eq!(queue_info(&rt).locked_nat, whole(1));
    }

    #[test]
    fn claim_aborts_when_the_recipient_refuses() {
        let rt = construct_and_verify();
        oracle_report(&rt, 1000);
        enqueue(&rt, USER1_ID, &whole(1), &shares_whole(1), 2000);
        finalize(&rt, vec![1], &whole(1), rate(1, 1), &shares_whole(1), 3000);

        rt.set_caller(Address::new_id(USER1_ID));
        rt.expect_validate_caller_any();
        rt.expect_send_simple(
            Address::new_id(USER1_ID),
            METHOD_SEND,
            None,
            whole(1),
            None,
            ExitCode::USR_FORBIDDEN,
        );
        let params = ClaimParams { request_id: 1, hint: 1, recipient: Address::new_id(USER1_ID) };
        expect_abort_contains_message(
            ExitCode::USR_FORBIDDEN,
            "send aborted",
            rt.call::<Actor>(Method::Claim as u64, IpldBlock::serialize_cbor(&params).unwrap()),
        );
        rt.verify();
        check_state(&rt);
        assert_eq!(queue_info(&rt).locked_nat, whole(1));
    }
}

mod oracle_report {
    use super::*;

    #[test]
    fn requires_the_oracle() {
        let rt = construct_and_verify();
        rt.set_caller(Address::new_id(USER1_ID));
        rt.expect_validate_caller_addr(vec![oracle()]);
        expect_abort(
            ExitCode::USR_FORBIDDEN,
            rt.call::<Actor>(
                Method::OnOracleReport as u64,
                IpldBlock::serialize_cbor(&OnOracleReportParams { report_timestamp: 1000 })
                    .unwrap(),
            ),
        );
        rt.verify();
    }

    #[test]
    fn rejects_zero_and_regressing_timestamps() {
        let rt = construct_and_verify();
        oracle_report(&rt, 1000);

        rt.set_caller(oracle());
        rt.expect_validate_caller_addr(vec![oracle()]);
        expect_abort_contains_message(
            ExitCode::USR_ILLEGAL_ARGUMENT,
            "zero report timestamp",
            rt.call::<Actor>(
                Method::OnOracleReport as u64,
                IpldBlock::serialize_cbor(&OnOracleReportParams { report_timestamp: 0 }).unwrap(),
            ),
        );
        rt.verify();

        rt.expect_validate_caller_addr(vec![oracle()]);
        expect_abort_contains_message(
            ExitCode::USR_ILLEGAL_ARGUMENT,
            "precedes the last recorded",
            rt.call::<Actor>(
                Method::OnOracleReport as u64,
                IpldBlock::serialize_cbor(&OnOracleReportParams { report_timestamp: 999 })
                    .unwrap(),
            ),
        );
        rt.verify();

        let st: State = rt.get_state();
        assert_eq!(st.last_report_timestamp, 1000);
    }
}

mod calculate_batches {
    use super::*;

    fn calculate(
        rt: &MockRuntime,
        max_share_rate: BigInt,
        max_timestamp: u64,
        state: BatchesCalculationState,
    ) -> BatchesCalculationState {
        rt.expect_validate_caller_any();
        let ret = rt
            .call::<Actor>(
                Method::CalculateFinalizationBatches as u64,
                IpldBlock::serialize_cbor(&CalculateFinalizationBatchesParams {
                    max_share_rate,
                    max_timestamp,
                    state,
                })
                .unwrap(),
            )
            .unwrap();
        rt.verify();
        ret.unwrap().deserialize().unwrap()
    }

    #[test]
    fn feeds_finalization_end_to_end() {
        let rt = construct_and_verify();
        // The two finalizable requests were priced under different reports,
        // on opposite sides of the cap, so they land in separate batches.
        oracle_report(&rt, 1000);
        enqueue(&rt, USER1_ID, &whole(1), &shares_whole(2), 2000);
        oracle_report(&rt, 1500);
        enqueue(&rt, USER2_ID, &whole(2), &shares_whole(2), 2100);
        oracle_report(&rt, 2500);
        enqueue(&rt, USER2_ID, &whole(1), &shares_whole(1), 2600);

        // The third request postdates the report backing this calculation.
        let cap = rate(85, 100);
        let calc =
            calculate(&rt, cap.clone(), 2400, BatchesCalculationState::new(whole(10)));
        assert!(calc.finished);
        assert_eq!(calc.batches, vec![1, 2]);
        assert_eq!(
            calc.remaining_nat_budget,
            whole(10) - atto(2_700_000_000_000_000_000)
        );

        let pre = prefinalize(&rt, calc.batches.clone(), cap.clone());
        finalize(&rt, calc.batches, &pre.nat_to_lock, cap, &pre.shares_to_burn, 3000);
        claim(&rt, USER1_ID, 1, 1, &whole(1));
        claim(&rt, USER2_ID, 2, 1, &atto(1_700_000_000_000_000_000));
    }

    #[test]
    fn rejects_exhausted_state() {
        let rt = construct_and_verify();
        oracle_report(&rt, 1000);
        enqueue(&rt, USER1_ID, &whole(1), &shares_whole(1), 2000);

        rt.expect_validate_caller_any();
        let mut state = BatchesCalculationState::new(whole(1));
        state.finished = true;
        expect_abort_contains_message(
            ExitCode::USR_ILLEGAL_STATE,
            "already finished",
            rt.call::<Actor>(
                Method::CalculateFinalizationBatches as u64,
                IpldBlock::serialize_cbor(&CalculateFinalizationBatchesParams {
                    max_share_rate: rate(1, 1),
                    max_timestamp: 3000,
                    state,
                })
                .unwrap(),
            ),
        );
        rt.verify();

        rt.expect_validate_caller_any();
        expect_abort_contains_message(
            ExitCode::USR_ILLEGAL_STATE,
            "no remaining budget",
            rt.call::<Actor>(
                Method::CalculateFinalizationBatches as u64,
                IpldBlock::serialize_cbor(&CalculateFinalizationBatchesParams {
                    max_share_rate: rate(1, 1),
                    max_timestamp: 3000,
                    state: BatchesCalculationState::new(TokenAmount::zero()),
                })
                .unwrap(),
            ),
        );
        rt.verify();
    }
}
