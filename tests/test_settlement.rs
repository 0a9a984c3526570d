//! Settlement workspace: auto-approved deposit, execute, on-chain landing,
//! and the propose/reject round-trip law.

mod scenario_common;

use scenario_common::*;

use alloy::primitives::U256;

use rcpan::model::entity::{BatchStatus, EntityTx};
use rcpan::model::workspace::WorkspaceOp;
use rcpan::scenario::ScenarioRunner;

fn network() -> ScenarioRunner {
    let mut net = ScenarioRunner::new(11, 10);
    net.add_entity("alice", 1, &["a1"], 1, &[]);
    net.add_entity("hub", 2, &["h1"], 1, &[]);
    net.fund("alice", USDC, units(1_000));
    open_edge(&mut net, "alice", "hub");
    extend_mutual_credit(&mut net, "alice", "hub", USDC, units(10_000));
    net
}

#[test]
fn deposit_workspace_auto_approves_and_lands_on_chain() {
    let mut net = network();
    let hub = net.entity("hub");
    assert_eq!(net.reserve("alice", USDC), units(1_000));

    // Alice (left) proposes moving 100 from her reserve into edge collateral.
    net.submit(
        "alice",
        EntityTx::SettlePropose {
            counterparty: hub,
            ops: vec![WorkspaceOp::R2c {
                token_id: USDC,
                amount: units(100),
                from_left: true,
            }],
        },
    );
    net.settle();

    // The deposit never reduces the hub's reserve, so the hub counter-signed
    // without being asked.
    let ws = net
        .account_of("alice", "hub")
        .settlement_workspace
        .as_ref()
        .expect("workspace open");
    assert!(ws.both_signed());

    net.submit("alice", EntityTx::SettleExecute { counterparty: hub });
    net.settle();

    // Cleared on both sides; the compiled diff sits in Alice's batch.
    assert!(net.account_of("alice", "hub").settlement_workspace.is_none());
    assert!(net.account_of("hub", "alice").settlement_workspace.is_none());
    let state = net.state_of("alice");
    assert_eq!(state.j_batch.building.settlements.len(), 1);
    let diff = &state.j_batch.building.settlements[0].diffs[0];
    assert!(diff.conserves());

    net.submit("alice", EntityTx::JBroadcast);
    net.converge();

    // On-chain effects, ingested back bilaterally.
    assert_eq!(net.reserve("alice", USDC), units(900));
    assert_eq!(net.collateral("alice", "hub", USDC), units(100));
    assert_eq!(net.collateral("hub", "alice", USDC), units(100));

    let alice_side = net.account_of("alice", "hub");
    let hub_side = net.account_of("hub", "alice");
    assert_eq!(alice_side.on_chain_settlement_nonce, 1);
    assert_eq!(hub_side.on_chain_settlement_nonce, 1);
    assert_eq!(alice_side.proof_header.nonce, 2);
    // The deposit stays attributed to Alice under the clamp split.
    assert_eq!(
        alice_side.delta(USDC).unwrap().ondelta,
        units_i(100)
    );
    assert_eq!(alice_side.delta(USDC).unwrap().collateral_share(true), units(100));

    let state = net.state_of("alice");
    assert!(!state.j_batch.pending_broadcast);
    assert_eq!(state.batch_history.last().unwrap().status, BatchStatus::Confirmed);
}

#[test]
fn propose_then_reject_changes_nothing() {
    let mut net = network();
    let hub = net.entity("hub");
    let alice = net.entity("alice");

    let before_alice = net.account_of("alice", "hub").delta(USDC).cloned();
    let before_hub = net.account_of("hub", "alice").delta(USDC).cloned();

    // Alice asks for the hub's reserve: never auto-approved.
    net.submit(
        "alice",
        EntityTx::SettlePropose {
            counterparty: hub,
            ops: vec![WorkspaceOp::R2r {
                token_id: USDC,
                amount: units(50),
                from_left: false,
            }],
        },
    );
    net.settle();
    let ws = net
        .account_of("hub", "alice")
        .settlement_workspace
        .as_ref()
        .expect("workspace open on both sides");
    assert!(!ws.both_signed());

    net.submit("hub", EntityTx::SettleReject { counterparty: alice });
    net.settle();

    assert!(net.account_of("alice", "hub").settlement_workspace.is_none());
    assert!(net.account_of("hub", "alice").settlement_workspace.is_none());
    assert_eq!(net.account_of("alice", "hub").delta(USDC).cloned(), before_alice);
    assert_eq!(net.account_of("hub", "alice").delta(USDC).cloned(), before_hub);
    assert!(net.state_of("alice").j_batch.building.settlements.is_empty());
}

#[test]
fn withdrawal_pins_collateral_until_the_settlement_lands() {
    let mut net = network();
    let hub = net.entity("hub");

    // Put 200 into collateral first.
    net.submit(
        "alice",
        EntityTx::SettlePropose {
            counterparty: hub,
            ops: vec![WorkspaceOp::R2c {
                token_id: USDC,
                amount: units(200),
                from_left: true,
            }],
        },
    );
    net.settle();
    net.submit("alice", EntityTx::SettleExecute { counterparty: hub });
    net.settle();
    net.submit("alice", EntityTx::JBroadcast);
    net.converge();
    assert_eq!(net.collateral("alice", "hub", USDC), units(200));

    // Now withdraw 80 of her own share back to reserve.
    net.submit(
        "alice",
        EntityTx::SettlePropose {
            counterparty: hub,
            ops: vec![WorkspaceOp::C2r {
                token_id: USDC,
                amount: units(80),
                to_left: true,
            }],
        },
    );
    net.settle();
    let delta = net.account_of("alice", "hub").delta(USDC).unwrap().clone();
    assert_eq!(delta.collateral_hold, units(80));
    assert_eq!(delta.left_settle_hold, units(80));

    net.submit("alice", EntityTx::SettleExecute { counterparty: hub });
    net.settle();
    net.submit("alice", EntityTx::JBroadcast);
    net.converge();

    let delta = net.account_of("alice", "hub").delta(USDC).unwrap().clone();
    assert_eq!(delta.collateral, units(120));
    assert_eq!(delta.collateral_hold, U256::ZERO);
    assert_eq!(delta.left_settle_hold, U256::ZERO);
    assert_eq!(net.reserve("alice", USDC), units(880));
    assert_eq!(net.account_of("alice", "hub").on_chain_settlement_nonce, 2);
}
