//! Dispute unilaterality: local freeze before the chain tx, strict gate
//! while frozen, clean reopen after the on-chain finalize.

mod scenario_common;

use scenario_common::*;

use rcpan::model::account::AccountStatus;
use rcpan::model::entity::EntityTx;
use rcpan::scenario::ScenarioRunner;

fn network() -> ScenarioRunner {
    let mut net = ScenarioRunner::new(7, 10);
    net.add_entity("alice", 1, &["a1"], 1, &[]);
    net.add_entity("hub", 2, &["h1"], 1, &[]);
    open_edge(&mut net, "alice", "hub");
    extend_mutual_credit(&mut net, "alice", "hub", USDC, units(50_000));
    // One ordinary settled frame so both hankos exist on the proof header.
    pay(&mut net, "alice", "hub", USDC, units(100));
    net
}

#[test]
fn dispute_freezes_locally_and_gates_business_txs() {
    let mut net = network();
    let hub = net.entity("hub");
    let claims_before_alice = net.account_of("alice", "hub").j_claim_count();
    let claims_before_hub = net.account_of("hub", "alice").j_claim_count();

    // Dispute and a payment race into the same tick; the freeze wins.
    net.submit("alice", EntityTx::DisputeStart { counterparty: hub });
    net.submit(
        "alice",
        EntityTx::DirectPayment {
            to: hub,
            token_id: USDC,
            amount: units(5),
            route: vec![],
        },
    );
    net.tick();

    let machine = net.account_of("alice", "hub");
    assert_eq!(machine.status, AccountStatus::Disputed);
    assert!(machine.pending_frame.is_none());
    assert!(machine.pending_account_input.is_none());
    assert_eq!(net.offdelta("alice", "hub", USDC), -units_i(100));
    assert!(
        net.env
            .frame_logs
            .iter()
            .any(|l| l.message.contains("disputed")),
        "the gated payment must surface in the frame log"
    );

    // The start op rides the next broadcast; the chain event freezes the hub
    // side too and both learn the timeout block.
    net.submit("alice", EntityTx::JBroadcast);
    net.converge();

    let alice_side = net.account_of("alice", "hub");
    let hub_side = net.account_of("hub", "alice");
    assert_eq!(alice_side.status, AccountStatus::Disputed);
    assert_eq!(hub_side.status, AccountStatus::Disputed);
    let timeout = alice_side.active_dispute.as_ref().unwrap().timeout_block;
    assert!(timeout > 0);
    assert_eq!(
        hub_side.active_dispute.as_ref().unwrap().timeout_block,
        timeout
    );

    // No bilateral chain-event claims may accumulate on the dispute path.
    assert_eq!(
        net.account_of("alice", "hub").j_claim_count(),
        claims_before_alice
    );
    assert_eq!(
        net.account_of("hub", "alice").j_claim_count(),
        claims_before_hub
    );

    // Early finalize is refused at admission (not past the timeout).
    net.submit("alice", EntityTx::DisputeFinalize { counterparty: hub });
    net.settle();
    assert!(
        net.env
            .frame_logs
            .iter()
            .any(|l| l.message.contains("not past timeout")),
        "early finalize must be rejected"
    );

    // Past the timeout the finalize goes through and the edge reopens.
    net.mine(10);
    net.submit("alice", EntityTx::DisputeFinalize { counterparty: hub });
    net.settle();
    net.submit("alice", EntityTx::JBroadcast);
    net.converge();

    let alice_side = net.account_of("alice", "hub");
    let hub_side = net.account_of("hub", "alice");
    assert_eq!(alice_side.status, AccountStatus::Active);
    assert_eq!(hub_side.status, AccountStatus::Active);
    assert!(alice_side.active_dispute.is_none());
    assert_eq!(alice_side.on_chain_settlement_nonce, 1);
    assert_eq!(hub_side.on_chain_settlement_nonce, 1);
    // The next proof restarts above the settled nonce.
    assert_eq!(alice_side.proof_header.nonce, 2);
    assert_eq!(hub_side.proof_header.nonce, 2);
    // The pre-dispute debt survived as settled ondelta.
    assert_eq!(
        alice_side.delta(USDC).unwrap().ondelta,
        -units_i(100)
    );

    // Business traffic resumes.
    pay(&mut net, "alice", "hub", USDC, units(10));
    assert_eq!(net.offdelta("alice", "hub", USDC), -units_i(10));
    assert_eq!(net.offdelta("hub", "alice", USDC), -units_i(10));
}

#[test]
fn queued_work_stays_parked_while_disputed() {
    let mut net = network();
    let hub = net.entity("hub");

    net.submit("alice", EntityTx::DisputeStart { counterparty: hub });
    net.tick();

    // Credit extension on the frozen edge is refused at admission.
    net.submit(
        "alice",
        EntityTx::ExtendCredit {
            counterparty: hub,
            token_id: USDC,
            amount: units(1),
        },
    );
    net.settle();
    let machine = net.account_of("alice", "hub");
    assert_eq!(machine.status, AccountStatus::Disputed);
    assert!(machine.mempool.is_empty());
}
