//! Per-(edge, token) signed bookkeeping.
//!
//! A delta positions the edge on a single number line, measured from the LEFT
//! entity's perspective. With `d = ondelta + offdelta`:
//!
//! ```text
//!   -right_credit_limit ........ 0 ........ collateral ........ collateral + left_credit_limit
//!          |  left owes right   |  collateral split by d  |   right owes left unsecured   |
//! ```
//!
//! - `d` in `[0, collateral]`: the collateral pot splits `d` to left, the rest
//!   to right (the Depository's clamp rule).
//! - `d > collateral`: right owes left `d - collateral` unsecured, bounded by
//!   the credit left extends (`left_credit_limit`).
//! - `d < 0`: left owes right `-d` unsecured, bounded by `right_credit_limit`.
//!
//! A deposit into collateral from the left side bumps `ondelta` by the same
//! amount, so the new collateral stays attributed to the depositor under the
//! clamp split.

use alloy::primitives::{I256, U256};
use serde::{Deserialize, Serialize};

use crate::errors::InvariantError;
use crate::model::ids::TokenId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub token_id: TokenId,
    /// On-chain-settled drift (left perspective).
    pub ondelta: I256,
    /// Off-chain bilateral drift since the last settlement.
    pub offdelta: I256,
    /// Collateral locked on-chain for this edge/token.
    pub collateral: U256,
    /// Unsecured credit left extends to right.
    pub left_credit_limit: U256,
    /// Unsecured credit right extends to left.
    pub right_credit_limit: U256,
    /// Outbound amounts reserved for in-flight payment frames and resting
    /// swap offers.
    pub left_hold: U256,
    pub right_hold: U256,
    /// Reserved for in-flight settlement-workspace proposals.
    pub left_settle_hold: U256,
    pub right_settle_hold: U256,
    /// Collateral reserved pending an in-flight C->R withdrawal.
    pub collateral_hold: U256,
}

/// View of a delta from one side's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DerivedDelta {
    /// `ondelta + offdelta`, signed from the viewer's perspective.
    pub total_delta: I256,
    /// How much the viewer can still send on this edge.
    pub out_capacity: U256,
    /// How much the viewer can still receive.
    pub in_capacity: U256,
    /// The viewer's attributed share of the collateral pot.
    pub out_collateral: U256,
    /// Signed net position of the viewer.
    pub out_pnl: I256,
    /// What the viewer owes the counterparty (all of it unsecured under the
    /// clamp split).
    pub debt_to_counterparty: U256,
    /// Credit the viewer has extended that the counterparty is currently
    /// using: the viewer's claim beyond its collateral share. Drives the
    /// rebalance triggers.
    pub uncollateralized_claim: U256,
    /// Width of the whole band net of holds.
    pub total_capacity: U256,
}

fn i(v: U256) -> I256 {
    I256::try_from(v).unwrap_or(I256::MAX)
}

fn clamp_nonneg(v: I256) -> U256 {
    if v <= I256::ZERO { U256::ZERO } else { v.unsigned_abs() }
}

impl Delta {
    pub fn new(token_id: TokenId) -> Self {
        Self {
            token_id,
            ondelta: I256::ZERO,
            offdelta: I256::ZERO,
            collateral: U256::ZERO,
            left_credit_limit: U256::ZERO,
            right_credit_limit: U256::ZERO,
            left_hold: U256::ZERO,
            right_hold: U256::ZERO,
            left_settle_hold: U256::ZERO,
            right_settle_hold: U256::ZERO,
            collateral_hold: U256::ZERO,
        }
    }

    pub fn total_delta(&self) -> I256 {
        self.ondelta + self.offdelta
    }

    /// Whether this delta carries any consensus-relevant state. Entries can
    /// materialize on one side before the other (a payment hold creates the
    /// slot at queue time); immaterial entries must hash like absent ones.
    pub fn is_material(&self) -> bool {
        self.ondelta != I256::ZERO
            || self.offdelta != I256::ZERO
            || !self.collateral.is_zero()
            || !self.left_credit_limit.is_zero()
            || !self.right_credit_limit.is_zero()
            || !self.left_settle_hold.is_zero()
            || !self.right_settle_hold.is_zero()
            || !self.collateral_hold.is_zero()
    }

    /// Left's attributed share of the pot: `clamp(d, 0, collateral)`.
    pub fn left_collateral_share(&self) -> U256 {
        let d = self.total_delta();
        if d <= I256::ZERO {
            U256::ZERO
        } else if d.unsigned_abs() > self.collateral {
            self.collateral
        } else {
            d.unsigned_abs()
        }
    }

    pub fn collateral_share(&self, viewer_is_left: bool) -> U256 {
        let left = self.left_collateral_share();
        if viewer_is_left {
            left
        } else {
            self.collateral - left
        }
    }

    /// Unsecured claim of one side against the other.
    pub fn unsecured_claim(&self, viewer_is_left: bool) -> U256 {
        let d = self.total_delta();
        if viewer_is_left {
            clamp_nonneg(d - i(self.collateral))
        } else {
            clamp_nonneg(-d)
        }
    }

    fn holds(&self, of_left: bool) -> U256 {
        if of_left {
            self.left_hold + self.left_settle_hold
        } else {
            self.right_hold + self.right_settle_hold
        }
    }

    pub fn derive(&self, viewer_is_left: bool) -> DerivedDelta {
        let d = self.total_delta();
        let dd = if viewer_is_left { d } else { -d };

        // Sending moves d toward the peer's credit bound; a pending collateral
        // withdrawal conservatively narrows both directions.
        let peer_limit = if viewer_is_left {
            self.right_credit_limit
        } else {
            self.left_credit_limit
        };
        let own_limit = if viewer_is_left {
            self.left_credit_limit
        } else {
            self.right_credit_limit
        };

        let out_gross = clamp_nonneg(dd + i(peer_limit));
        let in_gross = clamp_nonneg(i(self.collateral) + i(own_limit) - dd);

        let narrow = |gross: U256, holds: U256| {
            gross
                .saturating_sub(holds)
                .saturating_sub(self.collateral_hold)
        };

        let all_holds = self.holds(true)
            + self.holds(false)
            + self.collateral_hold;

        DerivedDelta {
            total_delta: dd,
            out_capacity: narrow(out_gross, self.holds(viewer_is_left)),
            in_capacity: narrow(in_gross, self.holds(!viewer_is_left)),
            out_collateral: self.collateral_share(viewer_is_left),
            out_pnl: dd,
            debt_to_counterparty: self.unsecured_claim(!viewer_is_left),
            uncollateralized_claim: self.unsecured_claim(viewer_is_left),
            total_capacity: (self.left_credit_limit + self.collateral + self.right_credit_limit)
                .saturating_sub(all_holds),
        }
    }

    /// Hard invariants, verified on every frame commit.
    pub fn verify_invariants(&self) -> Result<(), InvariantError> {
        let band = i(self.left_credit_limit) + i(self.collateral) + i(self.right_credit_limit);

        if self.offdelta.unsigned_abs() > band.unsigned_abs() {
            return Err(InvariantError::CapacityExceeded {
                token_id: self.token_id,
                offdelta: self.offdelta.to_string(),
                capacity: band.to_string(),
            });
        }

        let d = self.total_delta();
        let low = -i(self.right_credit_limit);
        let high = i(self.collateral) + i(self.left_credit_limit);
        if d < low || d > high {
            return Err(InvariantError::DeltaOutOfBand {
                token_id: self.token_id,
                delta: d.to_string(),
                low: low.to_string(),
                high: high.to_string(),
            });
        }

        if self.collateral_hold > self.collateral {
            return Err(InvariantError::CollateralHoldExceeded {
                token_id: self.token_id,
                hold: self.collateral_hold.to_string(),
                collateral: self.collateral.to_string(),
            });
        }

        for (is_left, side) in [(true, "left"), (false, "right")] {
            let holds = self.holds(is_left);
            let gross = {
                let dd = if is_left { d } else { -d };
                let peer_limit = if is_left {
                    self.right_credit_limit
                } else {
                    self.left_credit_limit
                };
                clamp_nonneg(dd + i(peer_limit))
            };
            if holds > gross {
                return Err(InvariantError::HoldsExceedCapacity {
                    token_id: self.token_id,
                    holds: holds.to_string(),
                    capacity: gross.to_string(),
                    side,
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usdc(n: i64) -> I256 {
        I256::try_from(n).unwrap() * I256::try_from(10u64.pow(18)).unwrap()
    }

    fn uusdc(n: u64) -> U256 {
        U256::from(n) * U256::from(10u64).pow(U256::from(18u64))
    }

    fn edge(collateral: u64, left_limit: u64, right_limit: u64) -> Delta {
        let mut d = Delta::new(1);
        d.collateral = uusdc(collateral);
        d.left_credit_limit = uusdc(left_limit);
        d.right_credit_limit = uusdc(right_limit);
        d
    }

    #[test]
    fn collateral_splits_by_clamp() {
        let mut d = edge(100, 0, 0);
        d.ondelta = usdc(30);
        assert_eq!(d.collateral_share(true), uusdc(30));
        assert_eq!(d.collateral_share(false), uusdc(70));
        assert_eq!(d.unsecured_claim(true), U256::ZERO);
        assert_eq!(d.unsecured_claim(false), U256::ZERO);
    }

    #[test]
    fn negative_delta_is_unsecured_left_debt() {
        // Hub (left) deposited 50 then paid 80 off-chain.
        let mut d = edge(50, 0, 100);
        d.ondelta = usdc(50);
        d.offdelta = usdc(-80);
        assert_eq!(d.total_delta(), usdc(-30));
        assert_eq!(d.collateral_share(true), U256::ZERO);
        assert_eq!(d.collateral_share(false), uusdc(50));
        // Right's exposure beyond the pot is exactly the overdraft.
        assert_eq!(d.unsecured_claim(false), uusdc(30));
        assert_eq!(d.derive(false).uncollateralized_claim, uusdc(30));
        assert_eq!(d.derive(true).debt_to_counterparty, uusdc(30));
    }

    #[test]
    fn claim_beyond_collateral_uses_own_credit() {
        let mut d = edge(50, 100, 0);
        d.offdelta = usdc(70);
        assert_eq!(d.unsecured_claim(true), uusdc(20));
        assert_eq!(d.collateral_share(true), uusdc(50));
        d.verify_invariants().unwrap();
    }

    #[test]
    fn capacities_span_the_band() {
        let d = edge(100, 200, 300);
        let left = d.derive(true);
        let right = d.derive(false);
        // At d = 0: left can send into right's credit, receive across
        // collateral plus its own credit.
        assert_eq!(left.out_capacity, uusdc(300));
        assert_eq!(left.in_capacity, uusdc(300));
        assert_eq!(right.out_capacity, uusdc(300));
        assert_eq!(right.in_capacity, uusdc(300));
        assert_eq!(left.total_capacity, uusdc(600));
    }

    #[test]
    fn holds_narrow_capacity() {
        let mut d = edge(0, 0, 100);
        d.left_hold = uusdc(40);
        assert_eq!(d.derive(true).out_capacity, uusdc(60));
        d.verify_invariants().unwrap();

        d.left_hold = uusdc(150);
        assert!(matches!(
            d.verify_invariants(),
            Err(InvariantError::HoldsExceedCapacity { .. })
        ));
    }

    #[test]
    fn out_of_band_delta_is_rejected() {
        let mut d = edge(0, 0, 100);
        d.offdelta = usdc(-150);
        assert!(d.verify_invariants().is_err());
    }

    #[test]
    fn deposit_attribution_keeps_capacity_symmetric() {
        // Hub is left, deposits 5000; spoke extended no credit, hub extends
        // none either: hub can now pay up to its own collateral share? No:
        // sending needs peer credit or own claim. After the attribution bump
        // the hub's claim equals the pot, so it can send the whole pot.
        let mut d = edge(5000, 0, 0);
        d.ondelta = usdc(5000);
        assert_eq!(d.derive(true).out_capacity, uusdc(5000));
        assert_eq!(d.derive(false).in_capacity, uusdc(5000));
        assert_eq!(d.derive(false).out_capacity, U256::ZERO);
    }
}
