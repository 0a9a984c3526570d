//! `demo` subcommand: a three-entity network (alice, hub, bob) exercising
//! credit, payments, collateral, and a settlement round trip.

use alloy::primitives::U256;

use crate::model::entity::EntityTx;
use crate::model::workspace::WorkspaceOp;
use crate::scenario::ScenarioRunner;

fn usdc(n: u64) -> U256 {
    U256::from(n) * U256::from(10u64).pow(U256::from(18u64))
}

pub fn run() -> anyhow::Result<()> {
    println!("=== rcpan demo ===");
    let mut net = ScenarioRunner::new(7, 10);

    let alice = net.add_entity("alice", 1, &["a1"], 1, &[]);
    let hub = net.add_entity("hub", 2, &["h1"], 1, &[]);
    let bob = net.add_entity("bob", 3, &["b1"], 1, &[]);
    println!("entities:");
    for (name, id) in [("alice", alice), ("hub", hub), ("bob", bob)] {
        println!("  {name}  0x{}", &hex::encode(id)[..8]);
    }

    net.fund("alice", 1, usdc(10_000));
    net.fund("hub", 1, usdc(100_000));

    // Open edges from both sides, then extend mutual credit.
    for (a, b) in [("alice", "hub"), ("bob", "hub")] {
        let cp = net.entity(b);
        let me = net.entity(a);
        let cp_set = net.validator_set(b);
        let my_set = net.validator_set(a);
        net.submit(
            a,
            EntityTx::OpenAccount {
                counterparty: cp,
                counterparty_validators: Some(cp_set),
            },
        );
        net.submit(
            b,
            EntityTx::OpenAccount {
                counterparty: me,
                counterparty_validators: Some(my_set),
            },
        );
        net.settle();
        net.submit(
            b,
            EntityTx::ExtendCredit {
                counterparty: me,
                token_id: 1,
                amount: usdc(50_000),
            },
        );
        net.submit(
            a,
            EntityTx::ExtendCredit {
                counterparty: cp,
                token_id: 1,
                amount: usdc(50_000),
            },
        );
        net.settle();
    }

    // Multi-hop payment alice -> hub -> bob.
    net.submit(
        "alice",
        EntityTx::DirectPayment {
            to: bob,
            token_id: 1,
            amount: usdc(2_500),
            route: vec![hub],
        },
    );
    net.settle();
    println!(
        "after payment: alice<->hub offdelta = {}, hub<->bob offdelta = {}",
        net.offdelta("alice", "hub", 1),
        net.offdelta("hub", "bob", 1)
    );

    // Alice moves 1,000 from reserve into edge collateral via a settlement
    // workspace; the hub auto-approves the deposit.
    net.submit(
        "alice",
        EntityTx::SettlePropose {
            counterparty: hub,
            ops: vec![WorkspaceOp::R2c {
                token_id: 1,
                amount: usdc(1_000),
                from_left: true,
            }],
        },
    );
    net.settle();
    net.submit("alice", EntityTx::SettleExecute { counterparty: hub });
    net.settle();
    net.submit("alice", EntityTx::JBroadcast);
    net.converge();

    println!(
        "after settlement: alice reserve = {}, alice<->hub collateral = {}",
        net.reserve("alice", 1),
        net.collateral("alice", "hub", 1)
    );
    println!("history hash: {}", net.env.history_hash()?);
    println!("log entries: {}", net.env.frame_logs.len());
    Ok(())
}
