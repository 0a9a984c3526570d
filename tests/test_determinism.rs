//! Determinism: equal seeds and inputs give byte-identical histories; a
//! recorded history replays to the same state; snapshots round-trip.

mod scenario_common;

use scenario_common::*;

use rcpan::model::entity::EntityTx;
use rcpan::model::workspace::WorkspaceOp;
use rcpan::runtime;
use rcpan::scenario::{run_spec, EntitySpec, ScenarioRunner, ScenarioSpec, Step, TokenSpec};

/// A mixed workload: 2-of-3 consensus with an offline validator, a routed
/// payment, a counter-payment, and a settled collateral deposit.
fn build_and_run(seed: u64) -> ScenarioRunner {
    let mut net = ScenarioRunner::new(seed, 10);
    net.add_entity("alice", 1, &["s1", "s2", "s3"], 2, &[]);
    net.add_entity("bob", 3, &["b1"], 1, &[]);
    net.add_entity("hub", 10, &["h1"], 1, &[]);

    net.fund("alice", USDC, units(1_000));
    net.fund("hub", USDC, units(10_000));
    open_edge(&mut net, "alice", "hub");
    open_edge(&mut net, "bob", "hub");
    extend_mutual_credit(&mut net, "alice", "hub", USDC, units(50_000));
    extend_mutual_credit(&mut net, "bob", "hub", USDC, units(50_000));

    net.take_offline("alice", "s3");
    pay_via(&mut net, "alice", "hub", "bob", USDC, units(2_000));
    pay(&mut net, "bob", "hub", USDC, units(300));

    let hub = net.entity("hub");
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
    net.submit("alice", EntityTx::SettleExecute { counterparty: hub });
    net.settle();
    net.submit("alice", EntityTx::JBroadcast);
    net.converge();
    net
}

#[test]
fn identical_seeds_produce_identical_histories() {
    let a = build_and_run(1234);
    let b = build_and_run(1234);

    assert_eq!(
        a.env.history_hash().unwrap(),
        b.env.history_hash().unwrap()
    );
    assert_eq!(
        serde_json::to_string(&a.env.replicas).unwrap(),
        serde_json::to_string(&b.env.replicas).unwrap()
    );

    // A different seed derives different validator keys, which shows up in
    // the imported configs and every signature downstream.
    let c = build_and_run(4321);
    assert_ne!(
        a.env.history_hash().unwrap(),
        c.env.history_hash().unwrap()
    );
}

#[test]
fn replaying_history_reproduces_the_final_state() {
    let net = build_and_run(77);

    let replayed = runtime::replay(77, "simnet", &net.env.history).unwrap();
    assert_eq!(
        replayed.history_hash().unwrap(),
        net.env.history_hash().unwrap()
    );
    assert_eq!(
        serde_json::to_string(&replayed.replicas).unwrap(),
        serde_json::to_string(&net.env.replicas).unwrap()
    );
}

#[test]
fn snapshot_roundtrip_preserves_state() {
    let net = build_and_run(55);
    let path = std::env::temp_dir().join("rcpan_test_snapshot.json");

    net.env.save(&path).unwrap();
    let restored = rcpan::runtime::RuntimeEnv::load(&path).unwrap();
    let _ = std::fs::remove_file(&path);

    assert_eq!(restored.height, net.env.height);
    assert_eq!(restored.timestamp, net.env.timestamp);
    assert_eq!(
        restored.history_hash().unwrap(),
        net.env.history_hash().unwrap()
    );
    assert_eq!(
        serde_json::to_string(&restored.replicas).unwrap(),
        serde_json::to_string(&net.env.replicas).unwrap()
    );
}

#[test]
fn scenario_files_drive_the_same_engine() {
    let spec = ScenarioSpec {
        name: "smoke".into(),
        description: None,
        runtime_seed: 21,
        dispute_timeout_blocks: 10,
        tokens: vec![TokenSpec {
            id: USDC,
            symbol: "USDC".into(),
            decimals: 18,
        }],
        entities: vec![
            EntitySpec {
                name: "alice".into(),
                id_byte: 1,
                validators: vec!["a1".into()],
                threshold: 1,
                shares: Default::default(),
            },
            EntitySpec {
                name: "hub".into(),
                id_byte: 2,
                validators: vec!["h1".into()],
                threshold: 1,
                shares: Default::default(),
            },
        ],
        steps: vec![
            Step::OpenAccount {
                from: "alice".into(),
                to: "hub".into(),
            },
            Step::OpenAccount {
                from: "hub".into(),
                to: "alice".into(),
            },
            Step::ExtendCredit {
                from: "hub".into(),
                to: "alice".into(),
                token: USDC,
                amount: units(10_000).to_string(),
            },
            Step::Pay {
                from: "alice".into(),
                to: "hub".into(),
                token: USDC,
                amount: units(25).to_string(),
                route: vec![],
            },
            Step::Converge,
        ],
    };

    let runner = run_spec(&spec, true).unwrap();
    assert_eq!(runner.offdelta("alice", "hub", USDC), -units_i(25));
    assert_eq!(runner.offdelta("hub", "alice", USDC), -units_i(25));

    let again = run_spec(&spec, true).unwrap();
    assert_eq!(
        runner.env.history_hash().unwrap(),
        again.env.history_hash().unwrap()
    );
}
