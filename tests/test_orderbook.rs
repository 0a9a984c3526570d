//! Hub orderbook: a crossing offer fills at the maker's price and the fills
//! materialize as bilateral transfers on both edges.

mod scenario_common;

use scenario_common::*;

use rcpan::model::account::AccountTx;
use rcpan::model::entity::EntityTx;
use rcpan::model::offer::FILL_RATIO_HALF;
use rcpan::scenario::ScenarioRunner;

fn network() -> ScenarioRunner {
    let mut net = ScenarioRunner::new(9, 10);
    net.add_entity("bob", 2, &["b1"], 1, &[]);
    net.add_entity("carol", 3, &["c1"], 1, &[]);
    net.add_entity("hub", 10, &["h1"], 1, &[]);

    for user in ["bob", "carol"] {
        open_edge(&mut net, user, "hub");
        for token in [ETH, USDC] {
            extend_mutual_credit(&mut net, user, "hub", token, units(100_000));
        }
    }
    net.submit(
        "hub",
        EntityTx::InitOrderbookExt {
            pairs: vec![(ETH, USDC)],
        },
    );
    net.settle();
    net
}

fn place(
    net: &mut ScenarioRunner,
    user: &str,
    give_token: u64,
    give: u64,
    want_token: u64,
    want: u64,
    min_fill_ratio: u16,
) {
    let hub = net.entity("hub");
    net.submit(
        user,
        EntityTx::PlaceSwapOffer {
            hub,
            give_token,
            give_amount: units(give),
            want_token,
            want_amount: units(want),
            min_fill_ratio,
        },
    );
    net.settle();
}

#[test]
fn crossing_offer_fills_at_maker_price_on_both_edges() {
    let mut net = network();

    // Bob rests an ask: 5 ETH for 15,250 USDC (3,050/ETH), half-fill floor.
    place(&mut net, "bob", ETH, 5, USDC, 15_250, FILL_RATIO_HALF);
    assert!(net
        .state_of("hub")
        .orderbook
        .as_ref()
        .unwrap()
        .resting_give(ETH, USDC, net.entity("bob"), 0)
        .is_some());

    // Carol crosses: 9,300 USDC for 3 ETH (3,100/ETH).
    place(&mut net, "carol", USDC, 9_300, ETH, 3, 0);

    // 3 ETH fill for 9,150 USDC, ceil-rounded to the maker's price.
    // Bob's resting offer decrements; Carol's is fully consumed.
    let bob_offer = net
        .account_of("hub", "bob")
        .swap_offers
        .get(&0)
        .cloned()
        .expect("bob's offer still resting");
    assert_eq!(bob_offer.give_amount, units(2));
    assert_eq!(bob_offer.want_amount, units(6_100));
    assert!(net.account_of("hub", "carol").swap_offers.is_empty());
    assert!(net.account_of("carol", "hub").swap_offers.is_empty());
    assert_eq!(
        net.state_of("hub")
            .orderbook
            .as_ref()
            .unwrap()
            .resting_give(ETH, USDC, net.entity("bob"), 0),
        Some(units(2))
    );

    // Bob (left) sold 3 ETH to the hub and was paid 9,150 USDC.
    assert_eq!(net.offdelta("bob", "hub", ETH), -units_i(3));
    assert_eq!(net.offdelta("bob", "hub", USDC), units_i(9_150));
    // Carol (left) paid 9,150 USDC and received 3 ETH.
    assert_eq!(net.offdelta("carol", "hub", USDC), -units_i(9_150));
    assert_eq!(net.offdelta("carol", "hub", ETH), units_i(3));

    // The fills rode ordinary transfers on both edges.
    for (a, b) in [("bob", "hub"), ("carol", "hub")] {
        let transfers = net
            .account_of(a, b)
            .frame_history
            .iter()
            .flat_map(|f| f.txs.iter())
            .filter(|tx| matches!(tx, AccountTx::DirectTransfer { .. }))
            .count();
        assert!(transfers >= 2, "expected transfer legs on {a}<->{b}");
    }
}

#[test]
fn taker_below_its_min_fill_rests_instead_of_filling() {
    let mut net = network();

    // Thin demand: 1 ETH wanted at 3,100.
    place(&mut net, "carol", USDC, 3_100, ETH, 1, 0);
    // Bob insists on at least half of 5 ETH; only 1 is fillable, so nothing
    // executes and both offers rest.
    place(&mut net, "bob", ETH, 5, USDC, 15_250, FILL_RATIO_HALF);

    assert_eq!(net.offdelta("bob", "hub", ETH), units_i(0));
    assert_eq!(net.offdelta("carol", "hub", USDC), units_i(0));
    let book = net.state_of("hub").orderbook.clone().unwrap();
    assert_eq!(
        book.resting_give(ETH, USDC, net.entity("bob"), 0),
        Some(units(5))
    );
    assert_eq!(
        book.resting_give(USDC, ETH, net.entity("carol"), 0),
        Some(units(3_100))
    );
}

#[test]
fn cancel_releases_the_reserved_credit() {
    let mut net = network();
    place(&mut net, "bob", ETH, 5, USDC, 15_250, 0);

    let held = net
        .account_of("bob", "hub")
        .delta(ETH)
        .unwrap()
        .left_hold;
    assert_eq!(held, units(5));

    let hub = net.entity("hub");
    net.submit("bob", EntityTx::CancelSwapOffer { hub, offer_id: 0 });
    net.settle();

    assert!(net.account_of("bob", "hub").swap_offers.is_empty());
    assert!(net.account_of("hub", "bob").swap_offers.is_empty());
    assert_eq!(
        net.account_of("bob", "hub").delta(ETH).unwrap().left_hold,
        units(0)
    );
    assert!(net
        .state_of("hub")
        .orderbook
        .as_ref()
        .unwrap()
        .resting_give(ETH, USDC, net.entity("bob"), 0)
        .is_none());

    // The deltas never moved.
    assert_eq!(net.offdelta("bob", "hub", ETH), units_i(0));
    assert_eq!(net.offdelta("bob", "hub", USDC), units_i(0));
}
