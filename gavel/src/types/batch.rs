//! Outbound batch wire types.
//!
//! An entity accumulates jurisdiction operations between broadcasts and ships
//! them as one `processBatch` call. The canonical encoding (MessagePack) is
//! what gets signed and what the contract decodes; `digest()` is the hanko
//! payload for the batch itself.

use alloy::primitives::{keccak256, B256, I256, U256};
use serde::{Deserialize, Serialize};

use crate::errors::GavelError;

/// Proof header claim: the sole artifact needed to enforce an off-chain state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofClaim {
    /// Strictly increases with each on-chain settlement of the edge.
    pub nonce: u64,
    /// Commitment over the per-token total deltas (see [`total_delta_hash`]).
    pub total_delta_hash: B256,
    /// Commitment over the full account state (deltas, offers, workspace).
    pub account_root: B256,
}

/// Per-token reserve/collateral movement compiled from a settlement.
/// `left_diff + right_diff + collateral_diff` must be zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementDiff {
    pub token_id: u64,
    pub left_diff: I256,
    pub right_diff: I256,
    pub collateral_diff: I256,
    /// Computed from the ops, never accepted from the wire by the core.
    pub ondelta_diff: I256,
}

impl SettlementDiff {
    pub fn conserves(&self) -> bool {
        self.left_diff + self.right_diff + self.collateral_diff == I256::ZERO
    }
}

/// Bilaterally signed settlement of one edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementOp {
    pub left: B256,
    pub right: B256,
    pub diffs: Vec<SettlementDiff>,
    /// Encoded [`Hanko`](crate::types::hanko::Hanko) of each side over
    /// [`settlement_digest`].
    pub left_hanko: Vec<u8>,
    pub right_hanko: Vec<u8>,
}

/// Move from the batch owner's reserve into edge collateral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveToCollateralOp {
    pub counterparty: B256,
    pub token_id: u64,
    pub amount: U256,
}

/// Withdraw the batch owner's collateral share back to its reserve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollateralToReserveOp {
    pub counterparty: B256,
    pub token_id: u64,
    pub amount: U256,
}

/// Unilateral dispute start carrying the freshest counter-signed proof.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisputeStartOp {
    pub counterparty: B256,
    pub proof: ProofClaim,
    /// Tokens covered by the proof, in ascending id order.
    pub token_ids: Vec<u64>,
    /// The counterparty's encoded hanko over the proof claim digest.
    pub counterparty_hanko: Vec<u8>,
}

/// Revealed per-token total delta, checked against the recorded
/// `total_delta_hash` at finalize time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevealedDelta {
    pub token_id: u64,
    pub total_delta: I256,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisputeFinalizeOp {
    pub counterparty: B256,
    pub revealed: Vec<RevealedDelta>,
}

/// One entity's outbound jurisdiction batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JBatch {
    pub settlements: Vec<SettlementOp>,
    pub reserve_to_collateral: Vec<ReserveToCollateralOp>,
    pub collateral_to_reserve: Vec<CollateralToReserveOp>,
    pub dispute_starts: Vec<DisputeStartOp>,
    pub dispute_finalizes: Vec<DisputeFinalizeOp>,
    /// Per-entity, strictly increasing. The jurisdiction rejects replays.
    pub nonce: u64,
}

impl JBatch {
    pub fn is_empty(&self) -> bool {
        self.op_count() == 0
    }

    pub fn op_count(&self) -> usize {
        self.settlements.len()
            + self.reserve_to_collateral.len()
            + self.collateral_to_reserve.len()
            + self.dispute_starts.len()
            + self.dispute_finalizes.len()
    }

    /// Canonical wire encoding.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, GavelError> {
        rmp_serde::to_vec(self).map_err(|e| GavelError::Serialize(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, GavelError> {
        rmp_serde::from_slice(bytes).map_err(|e| GavelError::Serialize(e.to_string()))
    }

    /// Hanko payload for the batch.
    pub fn digest(&self) -> Result<B256, GavelError> {
        Ok(keccak256(self.canonical_bytes()?))
    }
}

/// Hanko payload for a settlement: both sides sign this exact digest.
pub fn settlement_digest(
    left: B256,
    right: B256,
    diffs: &[SettlementDiff],
    settlement_nonce: u64,
) -> Result<B256, GavelError> {
    let bytes = rmp_serde::to_vec(&(left, right, diffs, settlement_nonce))
        .map_err(|e| GavelError::Serialize(e.to_string()))?;
    Ok(keccak256(bytes))
}

/// Commitment over per-token total deltas. Both the off-chain proof header
/// and the on-chain finalize check use this exact construction; entries must
/// be sorted by token id.
pub fn total_delta_hash(revealed: &[RevealedDelta]) -> Result<B256, GavelError> {
    debug_assert!(revealed.windows(2).all(|w| w[0].token_id < w[1].token_id));
    let bytes =
        rmp_serde::to_vec(revealed).map_err(|e| GavelError::Serialize(e.to_string()))?;
    Ok(keccak256(bytes))
}

/// Hanko payload for a proof claim (what `counterparty_hanko` covers).
pub fn proof_claim_digest(left: B256, right: B256, proof: &ProofClaim) -> Result<B256, GavelError> {
    let bytes = rmp_serde::to_vec(&(left, right, proof))
        .map_err(|e| GavelError::Serialize(e.to_string()))?;
    Ok(keccak256(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conservation_check() {
        let ok = SettlementDiff {
            token_id: 1,
            left_diff: I256::try_from(-100).unwrap(),
            right_diff: I256::ZERO,
            collateral_diff: I256::try_from(100).unwrap(),
            ondelta_diff: I256::try_from(100).unwrap(),
        };
        assert!(ok.conserves());

        let bad = SettlementDiff {
            left_diff: I256::try_from(-99).unwrap(),
            ..ok
        };
        assert!(!bad.conserves());
    }

    #[test]
    fn batch_digest_is_stable() {
        let mut batch = JBatch::default();
        batch.nonce = 3;
        batch.reserve_to_collateral.push(ReserveToCollateralOp {
            counterparty: B256::from([2u8; 32]),
            token_id: 1,
            amount: U256::from(500u64),
        });
        let a = batch.digest().unwrap();
        let b = batch.clone().digest().unwrap();
        assert_eq!(a, b);

        batch.nonce = 4;
        assert_ne!(batch.digest().unwrap(), a);
    }

    #[test]
    fn batch_roundtrip() {
        let mut batch = JBatch::default();
        batch.nonce = 9;
        batch.dispute_starts.push(DisputeStartOp {
            counterparty: B256::from([5u8; 32]),
            proof: ProofClaim {
                nonce: 2,
                total_delta_hash: B256::from([1u8; 32]),
                account_root: B256::from([2u8; 32]),
            },
            token_ids: vec![1, 4],
            counterparty_hanko: vec![1, 2, 3],
        });
        let bytes = batch.canonical_bytes().unwrap();
        assert_eq!(JBatch::decode(&bytes).unwrap(), batch);
    }
}
