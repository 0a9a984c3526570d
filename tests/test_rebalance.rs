//! Hub rebalance crontab: direct reserve->collateral funding of edges whose
//! counterparties run an uncollateralized exposure above their soft limit.

mod scenario_common;

use scenario_common::*;

use alloy::primitives::U256;

use rcpan::model::entity::EntityTx;
use rcpan::scenario::ScenarioRunner;

fn network() -> ScenarioRunner {
    let mut net = ScenarioRunner::new(5, 10);
    // The hub sorts above every spoke, so spokes are the left side of every
    // edge.
    net.add_entity("alice", 1, &["a1"], 1, &[]);
    net.add_entity("bob", 2, &["b1"], 1, &[]);
    net.add_entity("charlie", 3, &["c1"], 1, &[]);
    net.add_entity("dave", 4, &["d1"], 1, &[]);
    net.add_entity("hub", 10, &["h1"], 1, &[]);

    net.fund("hub", USDC, units(100_000));
    for spoke in ["alice", "bob", "charlie", "dave"] {
        open_edge(&mut net, spoke, "hub");
        extend_mutual_credit(&mut net, spoke, "hub", USDC, units(50_000));
        let cp = net.entity(spoke);
        net.submit(
            "hub",
            EntityTx::DepositCollateral {
                counterparty: cp,
                token_id: USDC,
                amount: units(5_000),
            },
        );
        net.settle();
    }
    net.submit("hub", EntityTx::JBroadcast);
    net.converge();
    net
}

#[test]
fn crontab_funds_undercollateralized_edges_directly() {
    let mut net = network();
    for spoke in ["alice", "bob", "charlie", "dave"] {
        assert_eq!(net.collateral(spoke, "hub", USDC), units(5_000));
    }

    // Two routed payments pull the hub into unsecured debt on the receiving
    // edges: 8,000 to Bob and 12,000 to Dave against 5,000 collateral each.
    pay_via(&mut net, "alice", "hub", "bob", USDC, units(8_000));
    pay_via(&mut net, "charlie", "hub", "dave", USDC, units(12_000));

    for (spoke, exposure) in [("bob", 3_000u64), ("dave", 7_000u64)] {
        let machine = net.account_of(spoke, "hub");
        let delta = machine.delta(USDC).unwrap();
        let me_is_left = true;
        assert_eq!(delta.unsecured_claim(me_is_left), units(exposure));
    }

    // Bob and Dave publish their policies; the accrued exposure asks the hub
    // for collateral right away, bilaterally.
    for spoke in ["bob", "dave"] {
        net.submit(
            spoke,
            EntityTx::SetRebalancePolicy {
                token_id: USDC,
                soft_limit: units(1_000),
                hard_limit: units(20_000),
                max_acceptable_fee: units(100),
            },
        );
    }
    net.settle();
    assert_eq!(
        net.account_of("hub", "bob").requested_rebalance.get(&USDC),
        Some(&units(3_000))
    );
    assert_eq!(
        net.account_of("hub", "dave").requested_rebalance.get(&USDC),
        Some(&units(7_000))
    );

    net.submit(
        "hub",
        EntityTx::SetHubConfig {
            fee_ppm: 0,
            base_fee: U256::ZERO,
            scan_interval_ms: 30_000,
        },
    );
    net.settle();

    // Past the crontab cadence the scan queues direct R->C ops: no C->R, no
    // workspace churn, no settlement nonce movement.
    net.advance_time(31_000);
    net.settle();

    let state = net.state_of("hub");
    let r2c = &state.j_batch.building.reserve_to_collateral;
    assert_eq!(r2c.len(), 2);
    assert!(r2c
        .iter()
        .any(|op| op.counterparty == net.entity("bob") && op.amount == units(3_000)));
    assert!(r2c
        .iter()
        .any(|op| op.counterparty == net.entity("dave") && op.amount == units(7_000)));
    assert!(state.j_batch.building.settlements.is_empty());
    assert!(state.j_batch.building.collateral_to_reserve.is_empty());

    net.submit("hub", EntityTx::JBroadcast);
    net.converge();

    // Funding landed; requests drained to zero; nonces untouched.
    assert_eq!(net.collateral("bob", "hub", USDC), units(8_000));
    assert_eq!(net.collateral("dave", "hub", USDC), units(12_000));
    for spoke in ["bob", "dave"] {
        let hub_side = net.account_of("hub", spoke);
        assert!(hub_side.requested_rebalance.get(&USDC).is_none());
        assert_eq!(hub_side.on_chain_settlement_nonce, 0);
        let spoke_side = net.account_of(spoke, "hub");
        assert!(spoke_side.requested_rebalance.get(&USDC).is_none());
        let delta = spoke_side.delta(USDC).unwrap();
        assert_eq!(delta.unsecured_claim(true), U256::ZERO);
    }
    // Untouched edges stay at their original collateral.
    assert_eq!(net.collateral("alice", "hub", USDC), units(5_000));
}

#[test]
fn fulfilled_requests_never_grow_back() {
    let mut net = network();
    pay_via(&mut net, "alice", "hub", "bob", USDC, units(8_000));
    net.submit(
        "bob",
        EntityTx::SetRebalancePolicy {
            token_id: USDC,
            soft_limit: units(1_000),
            hard_limit: units(2_000),
            max_acceptable_fee: units(100),
        },
    );
    net.settle();

    // The hard limit caps the request below the full exposure.
    assert_eq!(
        net.account_of("hub", "bob").requested_rebalance.get(&USDC),
        Some(&units(2_000))
    );

    net.submit(
        "hub",
        EntityTx::SetHubConfig {
            fee_ppm: 0,
            base_fee: U256::ZERO,
            scan_interval_ms: 30_000,
        },
    );
    net.settle();
    net.advance_time(31_000);
    net.settle();
    net.submit("hub", EntityTx::JBroadcast);
    net.converge();

    // 2,000 landed; the residual exposure is 1,000, at the soft limit, so
    // the request does not regrow.
    assert_eq!(net.collateral("bob", "hub", USDC), units(7_000));
    let delta = net.account_of("bob", "hub").delta(USDC).unwrap().clone();
    assert_eq!(delta.unsecured_claim(true), units(1_000));
    assert!(net
        .account_of("hub", "bob")
        .requested_rebalance
        .get(&USDC)
        .is_none());
}
