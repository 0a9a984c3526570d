//! Multi-sig entity consensus over bilateral payments (2-of-3 with one
//! validator offline).

mod scenario_common;

use scenario_common::*;

use rcpan::model::account::AccountStatus;
use rcpan::scenario::ScenarioRunner;

fn network() -> ScenarioRunner {
    let mut net = ScenarioRunner::new(42, 10);
    net.add_entity("alice", 1, &["s1", "s2", "s3"], 2, &[]);
    net.add_entity("hub", 2, &["h1"], 1, &[]);
    open_edge(&mut net, "alice", "hub");
    extend_mutual_credit(&mut net, "alice", "hub", USDC, units(1_000_000));
    net
}

#[test]
fn two_of_three_commits_with_a_validator_offline() {
    let mut net = network();
    net.take_offline("alice", "s3");

    pay(&mut net, "alice", "hub", USDC, units(1_000));

    // Alice is the lexicographically lower entity, so the left perspective
    // shows her payment as a negative drift, identically on both copies.
    assert_eq!(net.offdelta("alice", "hub", USDC), -units_i(1_000));
    assert_eq!(net.offdelta("hub", "alice", USDC), -units_i(1_000));

    // A second payment stacks on the same edge.
    pay(&mut net, "alice", "hub", USDC, units(500));
    assert_eq!(net.offdelta("alice", "hub", USDC), -units_i(1_500));
    assert_eq!(net.offdelta("hub", "alice", USDC), -units_i(1_500));

    let machine = net.account_of("hub", "alice");
    assert_eq!(machine.status, AccountStatus::Active);
    assert!(machine.current_height >= 2);
    // The hub holds Alice's 2-of-3 threshold signature over the latest proof.
    let hanko = machine
        .counterparty_dispute_proof_hanko
        .as_ref()
        .expect("counter-signed proof present");
    let digest = machine.proof_digest(&machine.proof_header).unwrap();
    assert!(hanko.verify(digest, &net.validator_set("alice")));
}

#[test]
fn online_validators_converge_to_identical_state() {
    let mut net = network();
    net.take_offline("alice", "s3");
    pay(&mut net, "alice", "hub", USDC, units(250));

    let alice = net.entity("alice");
    let s1 = net.env.replica(alice, "s1").unwrap();
    let s2 = net.env.replica(alice, "s2").unwrap();
    assert_eq!(s1.state.height, s2.state.height);
    assert!(s1.state.height > 0);

    let m1 = s1.state.account(net.entity("hub")).unwrap();
    let m2 = s2.state.account(net.entity("hub")).unwrap();
    assert_eq!(m1.state_hash().unwrap(), m2.state_hash().unwrap());
    assert_eq!(m1.proof_header, m2.proof_header);
}

#[test]
fn below_threshold_means_no_progress() {
    let mut net = network();
    let before = net.offdelta("alice", "hub", USDC);

    // With s2 and s3 gone, s1 alone carries weight 1 < threshold 2.
    net.take_offline("alice", "s2");
    net.take_offline("alice", "s3");
    pay(&mut net, "alice", "hub", USDC, units(1_000));

    assert_eq!(net.offdelta("alice", "hub", USDC), before);
    assert_eq!(net.offdelta("hub", "alice", USDC), before);
}
