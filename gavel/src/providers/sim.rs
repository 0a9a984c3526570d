//! In-memory jurisdiction with deterministic mining.
//!
//! `SimJurisdiction` is a faithful little Depository: it keeps entity
//! reserves, per-edge collateral and ondelta, per-entity batch nonces, and a
//! dispute register with block-height timeouts. Every state-changing call
//! mines exactly one block and appends its events at sequential log indices,
//! so two runs fed the same calls produce identical event streams.
//!
//! All methods come in synchronous form; the [`Jurisdiction`] impl wraps them
//! trivially (no actual I/O), the same way simulated venues satisfy an async
//! execution trait in backtesting engines.

use std::collections::BTreeMap;

use alloy::primitives::{keccak256, B256, I256, U256};
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::constants::DEFAULT_DISPUTE_TIMEOUT_BLOCKS;
use crate::errors::GavelError;
use crate::types::batch::{
    total_delta_hash, CollateralToReserveOp, DisputeFinalizeOp, DisputeStartOp, JBatch,
    ProofClaim, ReserveToCollateralOp, SettlementOp,
};
use crate::types::events::{EventCursor, JEvent, JEventRecord};
use crate::types::hanko::{Hanko, ValidatorSet};

use super::jurisdiction::{BatchReceipt, Jurisdiction};

/// Per-edge on-chain account: one settlement nonce, per-token collateral.
#[derive(Debug, Clone, Default)]
struct ChainAccount {
    settlement_nonce: u64,
    tokens: BTreeMap<u64, ChainTokenState>,
}

#[derive(Debug, Clone, Default)]
struct ChainTokenState {
    collateral: U256,
    ondelta: I256,
}

#[derive(Debug, Clone)]
struct ChainDispute {
    timeout_block: u64,
    proof: ProofClaim,
    token_ids: Vec<u64>,
    challenger_is_left: bool,
}

#[derive(Debug, Clone)]
struct SimState {
    block_number: u64,
    events: Vec<JEventRecord>,
    reserves: BTreeMap<(B256, u64), U256>,
    accounts: BTreeMap<(B256, B256), ChainAccount>,
    disputes: BTreeMap<(B256, B256), ChainDispute>,
    batch_nonces: BTreeMap<B256, u64>,
    validator_sets: BTreeMap<B256, ValidatorSet>,
    entity_numbers: BTreeMap<B256, u64>,
    next_entity_number: u64,
    dispute_timeout_blocks: u64,
}

pub struct SimJurisdiction {
    state: Mutex<SimState>,
}

impl Default for SimJurisdiction {
    fn default() -> Self {
        Self::new(DEFAULT_DISPUTE_TIMEOUT_BLOCKS)
    }
}

fn ordered(a: B256, b: B256) -> (B256, B256) {
    if a.as_slice() < b.as_slice() {
        (a, b)
    } else {
        (b, a)
    }
}

fn u_to_i(v: U256) -> Result<I256, GavelError> {
    I256::try_from(v).map_err(|_| GavelError::Serialize("amount exceeds int256".into()))
}

fn clamp_to_collateral(delta: I256, collateral: U256) -> U256 {
    if delta <= I256::ZERO {
        U256::ZERO
    } else {
        let d = delta.unsigned_abs();
        if d > collateral {
            collateral
        } else {
            d
        }
    }
}

impl SimJurisdiction {
    pub fn new(dispute_timeout_blocks: u64) -> Self {
        Self {
            state: Mutex::new(SimState {
                block_number: 0,
                events: Vec::new(),
                reserves: BTreeMap::new(),
                accounts: BTreeMap::new(),
                disputes: BTreeMap::new(),
                batch_nonces: BTreeMap::new(),
                validator_sets: BTreeMap::new(),
                entity_numbers: BTreeMap::new(),
                next_entity_number: 1,
                dispute_timeout_blocks,
            }),
        }
    }

    /// Register the validator set the jurisdiction should verify hankos
    /// against. Edges whose entities are unregistered skip verification.
    pub fn register_validator_set(&self, entity: B256, set: ValidatorSet) {
        self.state.lock().validator_sets.insert(entity, set);
    }

    pub fn dispute_timeout_blocks(&self) -> u64 {
        self.state.lock().dispute_timeout_blocks
    }

    pub fn block_number_sync(&self) -> u64 {
        self.state.lock().block_number
    }

    pub fn mine_sync(&self, blocks: u64) -> u64 {
        let mut st = self.state.lock();
        st.block_number += blocks;
        st.block_number
    }

    pub fn reserve_of(&self, entity: B256, token_id: u64) -> U256 {
        self.state
            .lock()
            .reserves
            .get(&(entity, token_id))
            .copied()
            .unwrap_or_default()
    }

    pub fn collateral_of(&self, a: B256, b: B256, token_id: u64) -> U256 {
        let key = ordered(a, b);
        self.state
            .lock()
            .accounts
            .get(&key)
            .and_then(|acc| acc.tokens.get(&token_id))
            .map(|t| t.collateral)
            .unwrap_or_default()
    }

    pub fn fund_reserves_sync(&self, entity: B256, token_id: u64, amount: U256) {
        let mut st = self.state.lock();
        st.block_number += 1;
        let new_amount = {
            let entry = st.reserves.entry((entity, token_id)).or_default();
            *entry += amount;
            *entry
        };
        push_event(
            &mut st,
            JEvent::ReserveUpdated {
                entity,
                token_id,
                new_amount,
            },
        );
    }

    pub fn register_entities_sync(&self, board_hashes: &[B256]) -> Vec<u64> {
        let mut st = self.state.lock();
        st.block_number += 1;
        board_hashes
            .iter()
            .map(|h| {
                if let Some(n) = st.entity_numbers.get(h) {
                    *n
                } else {
                    let n = st.next_entity_number;
                    st.next_entity_number += 1;
                    st.entity_numbers.insert(*h, n);
                    n
                }
            })
            .collect()
    }

    pub fn poll_events_sync(&self, cursor: EventCursor) -> Vec<JEventRecord> {
        self.state
            .lock()
            .events
            .iter()
            .filter(|rec| rec.cursor() > cursor)
            .cloned()
            .collect()
    }

    /// Apply one batch atomically: any failing operation rejects the whole
    /// batch and leaves the chain untouched.
    pub fn submit_batch_sync(
        &self,
        entity: B256,
        batch: &JBatch,
        _hanko: &[u8],
    ) -> Result<BatchReceipt, GavelError> {
        let mut st = self.state.lock();

        let last = st.batch_nonces.get(&entity).copied().unwrap_or(0);
        if batch.nonce <= last {
            return Err(GavelError::StaleNonce {
                got: batch.nonce,
                last_confirmed: last,
            });
        }
        if batch.nonce != last + 1 {
            return Err(GavelError::BatchRejected(format!(
                "nonce gap: got {}, expected {}",
                batch.nonce,
                last + 1
            )));
        }

        // Work on a copy so a failing op cannot leave partial effects.
        let mut work = st.clone();
        work.block_number += 1;

        for op in &batch.settlements {
            apply_settlement(&mut work, op)?;
        }
        for op in &batch.reserve_to_collateral {
            apply_r2c(&mut work, entity, op)?;
        }
        for op in &batch.collateral_to_reserve {
            apply_c2r(&mut work, entity, op)?;
        }
        for op in &batch.dispute_starts {
            apply_dispute_start(&mut work, entity, op)?;
        }
        for op in &batch.dispute_finalizes {
            apply_dispute_finalize(&mut work, entity, op)?;
        }

        work.batch_nonces.insert(entity, batch.nonce);
        let tx_hash = keccak256(batch.canonical_bytes()?);
        let block_number = work.block_number;
        *st = work;

        Ok(BatchReceipt {
            tx_hash,
            block_number,
        })
    }
}

fn push_event(st: &mut SimState, event: JEvent) {
    let block_number = st.block_number;
    let log_index = st
        .events
        .iter()
        .rev()
        .take_while(|e| e.block_number == block_number)
        .count() as u32;
    st.events.push(JEventRecord {
        block_number,
        log_index,
        event,
    });
}

fn adjust_reserve(
    st: &mut SimState,
    entity: B256,
    token_id: u64,
    diff: I256,
) -> Result<U256, GavelError> {
    let entry = st.reserves.entry((entity, token_id)).or_default();
    if diff >= I256::ZERO {
        *entry += diff.unsigned_abs();
    } else {
        let need = diff.unsigned_abs();
        if *entry < need {
            return Err(GavelError::InsufficientReserve {
                entity: format!("{entity}"),
                token_id,
                have: entry.to_string(),
                need: need.to_string(),
            });
        }
        *entry -= need;
    }
    Ok(*entry)
}

fn apply_settlement(st: &mut SimState, op: &SettlementOp) -> Result<(), GavelError> {
    let key = ordered(op.left, op.right);
    if (op.left, op.right) != key {
        return Err(GavelError::BatchRejected(
            "settlement entities not in canonical order".into(),
        ));
    }

    let next_nonce = st.accounts.entry(key).or_default().settlement_nonce + 1;

    // Hankos cover the settlement digest at the nonce being consumed.
    let digest =
        crate::types::batch::settlement_digest(op.left, op.right, &op.diffs, next_nonce)?;
    for (who, raw) in [(op.left, &op.left_hanko), (op.right, &op.right_hanko)] {
        if let Some(set) = st.validator_sets.get(&who) {
            let hanko = Hanko::decode(raw)?;
            if !hanko.verify(digest, set) {
                return Err(GavelError::HankoInvalid(format!(
                    "settlement hanko of {who} below threshold"
                )));
            }
        }
    }

    for diff in &op.diffs {
        if !diff.conserves() {
            return Err(GavelError::ConservationViolated {
                token_id: diff.token_id,
            });
        }
        let new_left = adjust_reserve(st, op.left, diff.token_id, diff.left_diff)?;
        let new_right = adjust_reserve(st, op.right, diff.token_id, diff.right_diff)?;

        let acct = st.accounts.entry(key).or_default();
        let tok = acct.tokens.entry(diff.token_id).or_default();
        if diff.collateral_diff < I256::ZERO {
            let need = diff.collateral_diff.unsigned_abs();
            if tok.collateral < need {
                return Err(GavelError::BatchRejected(format!(
                    "collateral underflow on token {}",
                    diff.token_id
                )));
            }
            tok.collateral -= need;
        } else {
            tok.collateral += diff.collateral_diff.unsigned_abs();
        }
        tok.ondelta += diff.ondelta_diff;
        let (new_collateral, new_ondelta) = (tok.collateral, tok.ondelta);

        push_event(
            st,
            JEvent::ReserveUpdated {
                entity: op.left,
                token_id: diff.token_id,
                new_amount: new_left,
            },
        );
        push_event(
            st,
            JEvent::ReserveUpdated {
                entity: op.right,
                token_id: diff.token_id,
                new_amount: new_right,
            },
        );
        push_event(
            st,
            JEvent::CollateralUpdated {
                left: op.left,
                right: op.right,
                token_id: diff.token_id,
                new_collateral,
                new_ondelta,
            },
        );
    }

    let acct = st.accounts.entry(key).or_default();
    acct.settlement_nonce = next_nonce;
    let nonce = acct.settlement_nonce;
    push_event(
        st,
        JEvent::SettlementProcessed {
            left: op.left,
            right: op.right,
            nonce,
            diffs: op.diffs.clone(),
        },
    );
    Ok(())
}

fn apply_r2c(
    st: &mut SimState,
    owner: B256,
    op: &ReserveToCollateralOp,
) -> Result<(), GavelError> {
    let (left, right) = ordered(owner, op.counterparty);
    let owner_is_left = owner == left;

    let new_reserve = adjust_reserve(st, owner, op.token_id, -u_to_i(op.amount)?)?;

    let acct = st.accounts.entry((left, right)).or_default();
    let tok = acct.tokens.entry(op.token_id).or_default();
    tok.collateral += op.amount;
    // A deposit from the left side shifts ondelta so the new collateral is
    // attributed to the depositor under the clamp split rule.
    if owner_is_left {
        tok.ondelta += u_to_i(op.amount)?;
    }
    let (new_collateral, new_ondelta) = (tok.collateral, tok.ondelta);

    push_event(
        st,
        JEvent::ReserveUpdated {
            entity: owner,
            token_id: op.token_id,
            new_amount: new_reserve,
        },
    );
    push_event(
        st,
        JEvent::CollateralUpdated {
            left,
            right,
            token_id: op.token_id,
            new_collateral,
            new_ondelta,
        },
    );
    Ok(())
}

fn apply_c2r(
    st: &mut SimState,
    owner: B256,
    op: &CollateralToReserveOp,
) -> Result<(), GavelError> {
    let (left, right) = ordered(owner, op.counterparty);
    let owner_is_left = owner == left;

    let acct = st.accounts.entry((left, right)).or_default();
    let tok = acct.tokens.entry(op.token_id).or_default();

    let left_share = clamp_to_collateral(tok.ondelta, tok.collateral);
    let share = if owner_is_left {
        left_share
    } else {
        tok.collateral - left_share
    };
    if share < op.amount {
        return Err(GavelError::BatchRejected(format!(
            "collateral share {} below withdrawal {} on token {}",
            share, op.amount, op.token_id
        )));
    }
    tok.collateral -= op.amount;
    if owner_is_left {
        tok.ondelta -= u_to_i(op.amount)?;
    }
    let (new_collateral, new_ondelta) = (tok.collateral, tok.ondelta);

    let new_reserve = adjust_reserve(st, owner, op.token_id, u_to_i(op.amount)?)?;

    push_event(
        st,
        JEvent::CollateralUpdated {
            left,
            right,
            token_id: op.token_id,
            new_collateral,
            new_ondelta,
        },
    );
    push_event(
        st,
        JEvent::ReserveUpdated {
            entity: owner,
            token_id: op.token_id,
            new_amount: new_reserve,
        },
    );
    Ok(())
}

fn apply_dispute_start(
    st: &mut SimState,
    challenger: B256,
    op: &DisputeStartOp,
) -> Result<(), GavelError> {
    let (left, right) = ordered(challenger, op.counterparty);
    if st.disputes.contains_key(&(left, right)) {
        return Err(GavelError::Dispute(format!(
            "dispute already open on {left}/{right}"
        )));
    }
    let acct = st.accounts.entry((left, right)).or_default();
    if op.proof.nonce <= acct.settlement_nonce {
        return Err(GavelError::Dispute(format!(
            "stale proof nonce {} (settled {})",
            op.proof.nonce, acct.settlement_nonce
        )));
    }

    // The challenger submits the *counterparty's* hanko: proof that the other
    // side counter-signed this exact state.
    let counterparty = op.counterparty;
    if let Some(set) = st.validator_sets.get(&counterparty) {
        let digest = crate::types::batch::proof_claim_digest(left, right, &op.proof)?;
        let hanko = Hanko::decode(&op.counterparty_hanko)?;
        if !hanko.verify(digest, set) {
            return Err(GavelError::HankoInvalid(format!(
                "dispute proof hanko of {counterparty} below threshold"
            )));
        }
    }

    let timeout_block = st.block_number + st.dispute_timeout_blocks;
    let challenger_is_left = challenger == left;
    st.disputes.insert(
        (left, right),
        ChainDispute {
            timeout_block,
            proof: op.proof,
            token_ids: op.token_ids.clone(),
            challenger_is_left,
        },
    );

    for token_id in &op.token_ids {
        push_event(
            st,
            JEvent::DisputeStarted {
                left,
                right,
                token_id: *token_id,
                dispute_timeout_block: timeout_block,
                challenger_is_left,
                challenger_hanko: op.counterparty_hanko.clone(),
            },
        );
    }
    Ok(())
}

fn apply_dispute_finalize(
    st: &mut SimState,
    finalizer: B256,
    op: &DisputeFinalizeOp,
) -> Result<(), GavelError> {
    let (left, right) = ordered(finalizer, op.counterparty);
    let dispute = st
        .disputes
        .get(&(left, right))
        .cloned()
        .ok_or_else(|| GavelError::Dispute(format!("no open dispute on {left}/{right}")))?;

    if st.block_number < dispute.timeout_block {
        return Err(GavelError::Dispute(format!(
            "dispute not past timeout (block {}, timeout {})",
            st.block_number, dispute.timeout_block
        )));
    }

    let mut revealed = op.revealed.clone();
    revealed.sort_by_key(|r| r.token_id);
    if revealed.iter().map(|r| r.token_id).collect::<Vec<_>>() != dispute.token_ids {
        return Err(GavelError::ProofMismatch(
            "revealed token set differs from disputed set".into(),
        ));
    }
    if total_delta_hash(&revealed)? != dispute.proof.total_delta_hash {
        return Err(GavelError::ProofMismatch(
            "revealed deltas do not hash to the disputed proof".into(),
        ));
    }

    for r in &revealed {
        let acct = st.accounts.entry((left, right)).or_default();
        let tok = acct.tokens.entry(r.token_id).or_default();

        let left_gets = clamp_to_collateral(r.total_delta, tok.collateral);
        let right_gets = tok.collateral - left_gets;
        let final_ondelta = r.total_delta - u_to_i(left_gets)?;
        tok.collateral = U256::ZERO;
        tok.ondelta = final_ondelta;

        let new_left = adjust_reserve(st, left, r.token_id, u_to_i(left_gets)?)?;
        let new_right = adjust_reserve(st, right, r.token_id, u_to_i(right_gets)?)?;

        push_event(
            st,
            JEvent::ReserveUpdated {
                entity: left,
                token_id: r.token_id,
                new_amount: new_left,
            },
        );
        push_event(
            st,
            JEvent::ReserveUpdated {
                entity: right,
                token_id: r.token_id,
                new_amount: new_right,
            },
        );
        push_event(
            st,
            JEvent::DisputeFinalized {
                left,
                right,
                token_id: r.token_id,
                final_ondelta,
                final_collateral_split: left_gets,
            },
        );
    }

    let acct = st.accounts.entry((left, right)).or_default();
    acct.settlement_nonce = dispute.proof.nonce;
    st.disputes.remove(&(left, right));
    Ok(())
}

#[async_trait]
impl Jurisdiction for SimJurisdiction {
    async fn block_number(&self) -> Result<u64, GavelError> {
        Ok(self.block_number_sync())
    }

    async fn submit_batch(
        &self,
        entity: B256,
        batch: &JBatch,
        hanko: &[u8],
    ) -> Result<BatchReceipt, GavelError> {
        self.submit_batch_sync(entity, batch, hanko)
    }

    async fn poll_events(&self, cursor: EventCursor) -> Result<Vec<JEventRecord>, GavelError> {
        Ok(self.poll_events_sync(cursor))
    }

    async fn fund_reserves(
        &self,
        entity: B256,
        token_id: u64,
        amount: U256,
    ) -> Result<(), GavelError> {
        self.fund_reserves_sync(entity, token_id, amount);
        Ok(())
    }

    async fn register_entities(&self, board_hashes: &[B256]) -> Result<Vec<u64>, GavelError> {
        Ok(self.register_entities_sync(board_hashes))
    }

    async fn mine(&self, blocks: u64) -> Result<u64, GavelError> {
        Ok(self.mine_sync(blocks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::batch::RevealedDelta;

    fn e(b: u8) -> B256 {
        B256::from([b; 32])
    }

    fn usdc(n: u64) -> U256 {
        U256::from(n) * U256::from(10u64).pow(U256::from(18u64))
    }

    #[test]
    fn r2c_attributes_deposit_to_depositor() {
        let sim = SimJurisdiction::default();
        let (alice, hub) = (e(1), e(2));
        sim.fund_reserves_sync(alice, 1, usdc(1000));

        let mut batch = JBatch::default();
        batch.nonce = 1;
        batch.reserve_to_collateral.push(ReserveToCollateralOp {
            counterparty: hub,
            token_id: 1,
            amount: usdc(100),
        });
        sim.submit_batch_sync(alice, &batch, &[]).unwrap();

        assert_eq!(sim.reserve_of(alice, 1), usdc(900));
        assert_eq!(sim.collateral_of(alice, hub, 1), usdc(100));

        // The depositor (left side here) can withdraw its full share back.
        let mut batch = JBatch::default();
        batch.nonce = 2;
        batch.collateral_to_reserve.push(CollateralToReserveOp {
            counterparty: hub,
            token_id: 1,
            amount: usdc(100),
        });
        sim.submit_batch_sync(alice, &batch, &[]).unwrap();
        assert_eq!(sim.reserve_of(alice, 1), usdc(1000));
        assert_eq!(sim.collateral_of(alice, hub, 1), U256::ZERO);
    }

    #[test]
    fn counterparty_cannot_withdraw_foreign_share() {
        let sim = SimJurisdiction::default();
        let (alice, hub) = (e(1), e(2));
        sim.fund_reserves_sync(alice, 1, usdc(100));

        let mut batch = JBatch::default();
        batch.nonce = 1;
        batch.reserve_to_collateral.push(ReserveToCollateralOp {
            counterparty: hub,
            token_id: 1,
            amount: usdc(100),
        });
        sim.submit_batch_sync(alice, &batch, &[]).unwrap();

        let mut batch = JBatch::default();
        batch.nonce = 1;
        batch.collateral_to_reserve.push(CollateralToReserveOp {
            counterparty: alice,
            token_id: 1,
            amount: usdc(1),
        });
        assert!(sim.submit_batch_sync(hub, &batch, &[]).is_err());
    }

    #[test]
    fn batch_nonce_is_strict() {
        let sim = SimJurisdiction::default();
        let alice = e(1);
        sim.fund_reserves_sync(alice, 1, usdc(10));

        let mut batch = JBatch::default();
        batch.nonce = 1;
        sim.submit_batch_sync(alice, &batch, &[]).unwrap();

        let replay = sim.submit_batch_sync(alice, &batch, &[]);
        assert!(matches!(replay, Err(GavelError::StaleNonce { .. })));

        let mut gap = JBatch::default();
        gap.nonce = 5;
        assert!(sim.submit_batch_sync(alice, &gap, &[]).is_err());
    }

    #[test]
    fn dispute_lifecycle_pays_out_clamped_split() {
        let sim = SimJurisdiction::new(5);
        let (alice, hub) = (e(1), e(2));
        sim.fund_reserves_sync(hub, 1, usdc(500));

        // Hub (right side) collateralizes the edge with 100.
        let mut batch = JBatch::default();
        batch.nonce = 1;
        batch.reserve_to_collateral.push(ReserveToCollateralOp {
            counterparty: alice,
            token_id: 1,
            amount: usdc(100),
        });
        sim.submit_batch_sync(hub, &batch, &[]).unwrap();

        // Off-chain, hub paid alice 30: total delta +30 from the left view.
        let revealed = vec![RevealedDelta {
            token_id: 1,
            total_delta: I256::try_from(usdc(30)).unwrap(),
        }];
        let proof = ProofClaim {
            nonce: 1,
            total_delta_hash: total_delta_hash(&revealed).unwrap(),
            account_root: B256::ZERO,
        };

        let mut batch = JBatch::default();
        batch.nonce = 1;
        batch.dispute_starts.push(DisputeStartOp {
            counterparty: hub,
            proof,
            token_ids: vec![1],
            counterparty_hanko: vec![],
        });
        sim.submit_batch_sync(alice, &batch, &[]).unwrap();

        // Too early to finalize.
        let mut early = JBatch::default();
        early.nonce = 2;
        early.dispute_finalizes.push(DisputeFinalizeOp {
            counterparty: hub,
            revealed: revealed.clone(),
        });
        assert!(sim.submit_batch_sync(alice, &early, &[]).is_err());

        sim.mine_sync(5);
        sim.submit_batch_sync(alice, &early, &[]).unwrap();

        assert_eq!(sim.reserve_of(alice, 1), usdc(30));
        assert_eq!(sim.reserve_of(hub, 1), usdc(470));
        assert_eq!(sim.collateral_of(alice, hub, 1), U256::ZERO);
    }

    #[test]
    fn event_ingest_order_is_stable() {
        let sim = SimJurisdiction::default();
        sim.fund_reserves_sync(e(1), 1, usdc(5));
        sim.fund_reserves_sync(e(1), 2, usdc(6));

        let all = sim.poll_events_sync(EventCursor::default());
        assert_eq!(all.len(), 2);
        assert!(all[0].cursor() < all[1].cursor());

        let rest = sim.poll_events_sync(all[0].cursor());
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0], all[1]);
    }
}
