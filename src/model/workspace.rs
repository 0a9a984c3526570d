//! Settlement workspace: the bilateral negotiation artifact for compound
//! on-chain changes (reserve/collateral rearrangements, off->on rebalances)
//! that are not themselves payments.
//!
//! Lifecycle: one side proposes, the counterparty may update (which flips the
//! turn and invalidates collected signatures), approve, or reject. Once both
//! hankos are attached and the compiled diff conserves value, either side may
//! execute, which enqueues the diff into its outbound jurisdiction batch.

use alloy::primitives::{B256, I256, U256};
use serde::{Deserialize, Serialize};

use gavel::types::batch::{settlement_digest, SettlementDiff};
use gavel::types::hanko::Hanko;

use crate::errors::EngineError;
use crate::model::ids::{EntityId, TokenId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WorkspaceOp {
    /// Reserve -> collateral deposit.
    R2c {
        token_id: TokenId,
        amount: U256,
        from_left: bool,
    },
    /// Collateral -> reserve withdrawal of the receiver's own share.
    C2r {
        token_id: TokenId,
        amount: U256,
        to_left: bool,
    },
    /// Reserve -> reserve transfer between the two entities.
    R2r {
        token_id: TokenId,
        amount: U256,
        from_left: bool,
    },
    /// Acknowledge off-chain drift on-chain: shifts `amount` from offdelta
    /// into ondelta without moving reserves or collateral.
    Rebalance { token_id: TokenId, amount: I256 },
}

impl WorkspaceOp {
    pub fn token_id(&self) -> TokenId {
        match self {
            WorkspaceOp::R2c { token_id, .. }
            | WorkspaceOp::C2r { token_id, .. }
            | WorkspaceOp::R2r { token_id, .. }
            | WorkspaceOp::Rebalance { token_id, .. } => *token_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStatus {
    Proposed,
    Updated,
    ReadyToSubmit,
    Submitted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementWorkspace {
    /// Monotonic per workspace; starts at 1, bumped by every update.
    pub version: u64,
    pub ops: Vec<WorkspaceOp>,
    /// Which side most recently mutated the workspace. The counterparty of
    /// the last modifier holds the turn for update/approve/reject.
    pub last_modified_by_left: bool,
    pub left_hanko: Option<Hanko>,
    pub right_hanko: Option<Hanko>,
    pub status: WorkspaceStatus,
}

impl SettlementWorkspace {
    pub fn propose(ops: Vec<WorkspaceOp>, by_left: bool) -> Self {
        Self {
            version: 1,
            ops,
            last_modified_by_left: by_left,
            left_hanko: None,
            right_hanko: None,
            status: WorkspaceStatus::Proposed,
        }
    }

    pub fn hanko_of(&self, left: bool) -> &Option<Hanko> {
        if left { &self.left_hanko } else { &self.right_hanko }
    }

    pub fn attach_hanko(&mut self, left: bool, hanko: Hanko) {
        if left {
            self.left_hanko = Some(hanko);
        } else {
            self.right_hanko = Some(hanko);
        }
        if self.left_hanko.is_some() && self.right_hanko.is_some() {
            self.status = WorkspaceStatus::ReadyToSubmit;
        }
    }

    pub fn both_signed(&self) -> bool {
        self.left_hanko.is_some() && self.right_hanko.is_some()
    }

    /// Replace the ops, flip the turn, invalidate collected signatures.
    pub fn update(&mut self, ops: Vec<WorkspaceOp>, by_left: bool) {
        self.version += 1;
        self.ops = ops;
        self.last_modified_by_left = by_left;
        self.left_hanko = None;
        self.right_hanko = None;
        self.status = WorkspaceStatus::Updated;
    }

    /// Compile the ops into per-token settlement diffs. `ondelta_diff` is
    /// always computed here, never taken from the wire.
    pub fn compile(&self) -> Vec<SettlementDiff> {
        let mut by_token: Vec<SettlementDiff> = Vec::new();
        let mut diff_for = |token_id: TokenId, f: &mut dyn FnMut(&mut SettlementDiff)| {
            if let Some(d) = by_token.iter_mut().find(|d| d.token_id == token_id) {
                f(d);
            } else {
                let mut d = SettlementDiff {
                    token_id,
                    left_diff: I256::ZERO,
                    right_diff: I256::ZERO,
                    collateral_diff: I256::ZERO,
                    ondelta_diff: I256::ZERO,
                };
                f(&mut d);
                by_token.push(d);
            }
        };

        for op in &self.ops {
            match *op {
                WorkspaceOp::R2c {
                    token_id,
                    amount,
                    from_left,
                } => {
                    let a = signed(amount);
                    diff_for(token_id, &mut |d| {
                        if from_left {
                            d.left_diff -= a;
                            d.ondelta_diff += a;
                        } else {
                            d.right_diff -= a;
                        }
                        d.collateral_diff += a;
                    });
                }
                WorkspaceOp::C2r {
                    token_id,
                    amount,
                    to_left,
                } => {
                    let a = signed(amount);
                    diff_for(token_id, &mut |d| {
                        if to_left {
                            d.left_diff += a;
                            d.ondelta_diff -= a;
                        } else {
                            d.right_diff += a;
                        }
                        d.collateral_diff -= a;
                    });
                }
                WorkspaceOp::R2r {
                    token_id,
                    amount,
                    from_left,
                } => {
                    let a = signed(amount);
                    diff_for(token_id, &mut |d| {
                        if from_left {
                            d.left_diff -= a;
                            d.right_diff += a;
                        } else {
                            d.right_diff -= a;
                            d.left_diff += a;
                        }
                    });
                }
                WorkspaceOp::Rebalance { token_id, amount } => {
                    diff_for(token_id, &mut |d| {
                        d.ondelta_diff += amount;
                    });
                }
            }
        }

        by_token.sort_by_key(|d| d.token_id);
        by_token
    }

    /// Off-chain compensation applied when the settlement lands: rebalance
    /// ops move drift from offdelta into ondelta, so the claim handler must
    /// subtract the shifted amount from offdelta to keep the total unchanged.
    pub fn offdelta_compensation(&self) -> Vec<(TokenId, I256)> {
        let mut comp: Vec<(TokenId, I256)> = Vec::new();
        for op in &self.ops {
            if let WorkspaceOp::Rebalance { token_id, amount } = *op {
                if let Some(entry) = comp.iter_mut().find(|(t, _)| *t == token_id) {
                    entry.1 += amount;
                } else {
                    comp.push((token_id, amount));
                }
            }
        }
        comp.sort_by_key(|(t, _)| *t);
        comp
    }

    /// The digest both hankos must cover: the compiled diffs pinned to the
    /// edge and the settlement nonce they will consume.
    pub fn digest(
        &self,
        left: EntityId,
        right: EntityId,
        next_settlement_nonce: u64,
    ) -> Result<B256, EngineError> {
        settlement_digest(left, right, &self.compile(), next_settlement_nonce)
            .map_err(|e| EngineError::Encoding(e.to_string()))
    }
}

fn signed(v: U256) -> I256 {
    I256::try_from(v).unwrap_or(I256::MAX)
}

/// The auto-approve predicate: a diff is counterparty-non-negative when it
/// never reduces the counterparty's reserve and never moves ondelta against
/// the counterparty's collateral share.
pub fn counterparty_non_negative(diffs: &[SettlementDiff], counterparty_is_left: bool) -> bool {
    diffs.iter().all(|d| {
        let (own_reserve, adverse_ondelta) = if counterparty_is_left {
            // Left's pot share follows ondelta upward; a negative shift is
            // adverse unless it is left's own withdrawal (which this is not,
            // since the counterparty did not author the ops).
            (d.left_diff, d.ondelta_diff < I256::ZERO)
        } else {
            (d.right_diff, d.ondelta_diff > I256::ZERO && d.collateral_diff <= I256::ZERO)
        };
        own_reserve >= I256::ZERO && !adverse_ondelta
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amt(n: u64) -> U256 {
        U256::from(n) * U256::from(10u64).pow(U256::from(18u64))
    }

    #[test]
    fn r2c_compiles_conserving_diff_with_attribution() {
        let ws = SettlementWorkspace::propose(
            vec![WorkspaceOp::R2c {
                token_id: 1,
                amount: amt(100),
                from_left: true,
            }],
            true,
        );
        let diffs = ws.compile();
        assert_eq!(diffs.len(), 1);
        let d = &diffs[0];
        assert!(d.conserves());
        assert_eq!(d.left_diff, -I256::try_from(amt(100)).unwrap());
        assert_eq!(d.collateral_diff, I256::try_from(amt(100)).unwrap());
        assert_eq!(d.ondelta_diff, I256::try_from(amt(100)).unwrap());
    }

    #[test]
    fn update_flips_turn_and_clears_signatures() {
        let mut ws = SettlementWorkspace::propose(
            vec![WorkspaceOp::R2r {
                token_id: 1,
                amount: amt(5),
                from_left: true,
            }],
            true,
        );
        ws.attach_hanko(true, Hanko::new());
        ws.update(
            vec![WorkspaceOp::R2r {
                token_id: 1,
                amount: amt(7),
                from_left: true,
            }],
            false,
        );
        assert_eq!(ws.version, 2);
        assert!(!ws.last_modified_by_left);
        assert!(ws.left_hanko.is_none());
        assert_eq!(ws.status, WorkspaceStatus::Updated);
    }

    #[test]
    fn deposits_auto_approve_but_withdraws_from_peer_do_not() {
        // Left deposits its own reserve: right never loses anything.
        let deposit = SettlementWorkspace::propose(
            vec![WorkspaceOp::R2c {
                token_id: 1,
                amount: amt(100),
                from_left: true,
            }],
            true,
        );
        assert!(counterparty_non_negative(&deposit.compile(), false));

        // Left proposes moving right's reserve: never auto-approved.
        let grab = SettlementWorkspace::propose(
            vec![WorkspaceOp::R2r {
                token_id: 1,
                amount: amt(100),
                from_left: false,
            }],
            true,
        );
        assert!(!counterparty_non_negative(&grab.compile(), false));
    }

    #[test]
    fn rebalance_tracks_offdelta_compensation() {
        let ws = SettlementWorkspace::propose(
            vec![
                WorkspaceOp::Rebalance {
                    token_id: 1,
                    amount: I256::try_from(50).unwrap(),
                },
                WorkspaceOp::Rebalance {
                    token_id: 1,
                    amount: I256::try_from(-10).unwrap(),
                },
            ],
            false,
        );
        assert_eq!(
            ws.offdelta_compensation(),
            vec![(1, I256::try_from(40).unwrap())]
        );
        // Pure rebalances conserve trivially.
        assert!(ws.compile().iter().all(|d| d.conserves()));
    }
}
