//! Shared helpers for the scenario tests.

#![allow(dead_code)]

use alloy::primitives::{I256, U256};

use rcpan::model::entity::EntityTx;
use rcpan::scenario::ScenarioRunner;

pub const ETH: u64 = 1;
pub const USDC: u64 = 4;

/// Whole tokens in 18-decimal base units.
pub fn units(n: u64) -> U256 {
    U256::from(n) * U256::from(10u64).pow(U256::from(18u64))
}

pub fn units_i(n: i64) -> I256 {
    I256::try_from(n).unwrap() * I256::try_from(1_000_000_000_000_000_000u64).unwrap()
}

/// Open the edge from both sides, exchanging validator sets so hanko
/// verification is enforced.
pub fn open_edge(net: &mut ScenarioRunner, a: &str, b: &str) {
    let (id_a, id_b) = (net.entity(a), net.entity(b));
    let (set_a, set_b) = (net.validator_set(a), net.validator_set(b));
    net.submit(
        a,
        EntityTx::OpenAccount {
            counterparty: id_b,
            counterparty_validators: Some(set_b),
        },
    );
    net.submit(
        b,
        EntityTx::OpenAccount {
            counterparty: id_a,
            counterparty_validators: Some(set_a),
        },
    );
    net.settle();
}

/// Both sides extend the same unsecured credit on a token.
pub fn extend_mutual_credit(net: &mut ScenarioRunner, a: &str, b: &str, token: u64, amount: U256) {
    let (id_a, id_b) = (net.entity(a), net.entity(b));
    net.submit(
        a,
        EntityTx::ExtendCredit {
            counterparty: id_b,
            token_id: token,
            amount,
        },
    );
    net.submit(
        b,
        EntityTx::ExtendCredit {
            counterparty: id_a,
            token_id: token,
            amount,
        },
    );
    net.settle();
}

pub fn pay(net: &mut ScenarioRunner, from: &str, to: &str, token: u64, amount: U256) {
    let target = net.entity(to);
    net.submit(
        from,
        EntityTx::DirectPayment {
            to: target,
            token_id: token,
            amount,
            route: vec![],
        },
    );
    net.settle();
}

pub fn pay_via(
    net: &mut ScenarioRunner,
    from: &str,
    hub: &str,
    to: &str,
    token: u64,
    amount: U256,
) {
    let (hub_id, target) = (net.entity(hub), net.entity(to));
    net.submit(
        from,
        EntityTx::DirectPayment {
            to: target,
            token_id: token,
            amount,
            route: vec![hub_id],
        },
    );
    net.settle();
}
