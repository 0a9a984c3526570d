//! Bilateral account machine state.
//!
//! One machine exists per ordered entity pair. Each entity keeps its own copy
//! keyed by counterparty id; the frame protocol keeps the two copies in
//! lockstep and the counter-signed proof header ties them together.

use std::collections::{BTreeMap, VecDeque};

use alloy::primitives::{B256, U256};
use serde::{Deserialize, Serialize};

use gavel::types::batch::{proof_claim_digest, total_delta_hash, RevealedDelta};
use gavel::types::events::JEventRecord;
use gavel::types::hanko::{Hanko, ValidatorSet};

use crate::errors::EngineError;
use crate::hash;
use crate::model::delta::Delta;
use crate::model::ids::{is_left, EntityId, TokenId};
use crate::model::offer::SwapOffer;
use crate::model::workspace::{SettlementWorkspace, WorkspaceOp};

/// Re-exported wire artifact: `(nonce, total_delta_hash, account_root)`.
pub type ProofHeader = gavel::types::batch::ProofClaim;

/// Committed bilateral frames kept in memory; older frames are truncated,
/// the account root keeps them auditable.
pub const FRAME_HISTORY_KEEP: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Disputed,
    Closed,
}

/// Transactions that travel inside bilateral frames. Direction-carrying
/// variants are encoded from the canonical left perspective via `from_left`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AccountTx {
    DirectTransfer {
        token_id: TokenId,
        amount: U256,
        from_left: bool,
        /// Remaining hops past the receiving entity; empty for the final leg.
        route: Vec<EntityId>,
        payment_id: B256,
    },
    ExtendCredit {
        token_id: TokenId,
        amount: U256,
        from_left: bool,
    },
    SetCreditLimit {
        token_id: TokenId,
        limit: U256,
        from_left: bool,
    },
    SettlePropose {
        ops: Vec<WorkspaceOp>,
        from_left: bool,
        hanko: Hanko,
    },
    SettleUpdate {
        ops: Vec<WorkspaceOp>,
        from_left: bool,
        hanko: Hanko,
    },
    SettleApprove {
        from_left: bool,
        hanko: Hanko,
    },
    SettleReject {
        from_left: bool,
    },
    SettleExecute {
        from_left: bool,
    },
    PlaceSwapOffer {
        offer: SwapOffer,
        from_left: bool,
    },
    /// Book-side partial fill, committed bilaterally so both copies of the
    /// resting offer shrink in lockstep.
    FillSwapOffer {
        offer_id: u64,
        give_filled: U256,
        want_filled: U256,
    },
    CancelSwapOffer {
        offer_id: u64,
        from_left: bool,
    },
    RequestCollateral {
        token_id: TokenId,
        amount: U256,
        from_left: bool,
    },
    RebalanceQuote {
        token_id: TokenId,
        amount: U256,
        fee: U256,
        from_left: bool,
    },
    AcceptRebalanceQuote {
        token_id: TokenId,
        amount: U256,
        fee: U256,
        from_left: bool,
    },
    /// Bilateral attestation of a finalized chain event relevant to this
    /// edge. Idempotent per `(block_number, log_index)`.
    JEventClaim {
        record: JEventRecord,
        from_left: bool,
    },
}

impl AccountTx {
    pub fn is_j_event_claim(&self) -> bool {
        matches!(self, AccountTx::JEventClaim { .. })
    }
}

/// A committed bilateral frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountFrame {
    pub frame_id: u64,
    pub prev_state_hash: B256,
    pub txs: Vec<AccountTx>,
    pub state_hash: B256,
    pub proof_header: ProofHeader,
    pub left_hanko: Hanko,
    pub right_hanko: Hanko,
}

/// The frame currently awaiting the counterparty's signature. At most one
/// per side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAccountFrame {
    pub frame_id: u64,
    pub prev_state_hash: B256,
    pub txs: Vec<AccountTx>,
    pub post_state_hash: B256,
    pub post_proof: ProofHeader,
    pub our_hanko: Hanko,
}

/// Wire messages between the two sides of an edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AccountInput {
    Propose {
        frame_id: u64,
        prev_state_hash: B256,
        txs: Vec<AccountTx>,
        post_state_hash: B256,
        post_proof: ProofHeader,
        proposer_hanko: Hanko,
    },
    Ack {
        frame_id: u64,
        state_hash: B256,
        hanko: Hanko,
    },
    Reject {
        frame_id: u64,
        reason: String,
    },
}

/// Local dispute bookkeeping for an edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisputeRecord {
    pub started_block: u64,
    pub timeout_block: u64,
    pub challenger_is_left: bool,
    pub proof_nonce: u64,
    /// Set when the matching `DisputeFinalized` has been ingested.
    pub finalized: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountMachine {
    pub left_entity: EntityId,
    pub right_entity: EntityId,
    pub deltas: BTreeMap<TokenId, Delta>,
    /// Committed frame count.
    pub current_height: u64,
    pub proof_header: ProofHeader,
    pub on_chain_settlement_nonce: u64,
    pub frame_history: VecDeque<AccountFrame>,
    pub mempool: Vec<AccountTx>,
    pub pending_frame: Option<PendingAccountFrame>,
    /// A counterparty proposal deferred until our own pending frame resolves.
    pub pending_account_input: Option<AccountInput>,
    pub status: AccountStatus,
    pub swap_offers: BTreeMap<u64, SwapOffer>,
    pub settlement_workspace: Option<SettlementWorkspace>,
    pub active_dispute: Option<DisputeRecord>,
    /// The counterparty's threshold signature over our current proof header:
    /// the artifact a victim submits in a dispute.
    pub counterparty_dispute_proof_hanko: Option<Hanko>,
    /// What the local side has asked the counterparty/hub to collateralize.
    pub requested_rebalance: BTreeMap<TokenId, U256>,
    /// Offdelta compensation expected when the in-flight settlement lands,
    /// keyed by the settlement nonce it will consume.
    pub pending_settlement_comp: Option<(u64, Vec<(TokenId, alloy::primitives::I256)>)>,
    /// Accepted rebalance quote fee and the accepting side, charged when the
    /// funding lands.
    pub accepted_quote_fee: Option<(TokenId, U256, bool)>,
    /// Bilaterally attested chain events for this edge.
    pub j_event_chain: Vec<JEventRecord>,
    pub left_j_observations: u64,
    pub right_j_observations: u64,
    pub last_finalized_j_height: u64,
    /// Cached ACK so a duplicate PROPOSE with the same frame id is idempotent.
    pub last_ack: Option<(u64, B256, Hanko)>,
    /// Validator set of the counterparty, when known; hanko verification is
    /// enforced only then.
    pub counterparty_validators: Option<ValidatorSet>,
    /// Sequence for locally placed swap offers.
    pub offer_seq: u64,
}

impl AccountMachine {
    pub fn new(a: EntityId, b: EntityId) -> Self {
        let (left_entity, right_entity) = crate::model::ids::ordered_pair(a, b);
        Self {
            left_entity,
            right_entity,
            deltas: BTreeMap::new(),
            current_height: 0,
            proof_header: ProofHeader {
                nonce: 1,
                total_delta_hash: B256::ZERO,
                account_root: B256::ZERO,
            },
            on_chain_settlement_nonce: 0,
            frame_history: VecDeque::new(),
            mempool: Vec::new(),
            pending_frame: None,
            pending_account_input: None,
            status: AccountStatus::Active,
            swap_offers: BTreeMap::new(),
            settlement_workspace: None,
            active_dispute: None,
            counterparty_dispute_proof_hanko: None,
            requested_rebalance: BTreeMap::new(),
            pending_settlement_comp: None,
            accepted_quote_fee: None,
            j_event_chain: Vec::new(),
            left_j_observations: 0,
            right_j_observations: 0,
            last_finalized_j_height: 0,
            last_ack: None,
            counterparty_validators: None,
            offer_seq: 0,
        }
    }

    /// Is `viewer` the left side of this edge?
    pub fn viewer_is_left(&self, viewer: EntityId) -> bool {
        is_left(viewer, self.counterparty_of(viewer))
    }

    pub fn counterparty_of(&self, viewer: EntityId) -> EntityId {
        if viewer == self.left_entity {
            self.right_entity
        } else {
            self.left_entity
        }
    }

    pub fn delta(&self, token_id: TokenId) -> Option<&Delta> {
        self.deltas.get(&token_id)
    }

    pub fn delta_mut(&mut self, token_id: TokenId) -> &mut Delta {
        self.deltas
            .entry(token_id)
            .or_insert_with(|| Delta::new(token_id))
    }

    /// Canonical hash of the consensus-relevant state. Payment holds are
    /// excluded: they are one-sided liquidity reservations, released when the
    /// frame carrying the reserved tx commits or unwinds.
    pub fn state_hash(&self) -> Result<B256, EngineError> {
        let deltas: Vec<_> = self
            .deltas
            .values()
            .filter(|d| d.is_material())
            .map(|d| {
                (
                    d.token_id,
                    d.ondelta,
                    d.offdelta,
                    d.collateral,
                    d.left_credit_limit,
                    d.right_credit_limit,
                    d.left_settle_hold,
                    d.right_settle_hold,
                    d.collateral_hold,
                )
            })
            .collect();
        hash::digest(&(
            self.current_height,
            self.on_chain_settlement_nonce,
            deltas,
        ))
    }

    /// Commitment over per-token total deltas, in ascending token order.
    pub fn total_delta_hash(&self) -> Result<B256, EngineError> {
        total_delta_hash(&self.revealed_deltas())
            .map_err(|e| EngineError::Encoding(e.to_string()))
    }

    pub fn revealed_deltas(&self) -> Vec<RevealedDelta> {
        self.deltas
            .values()
            .filter(|d| d.is_material())
            .map(|d| RevealedDelta {
                token_id: d.token_id,
                total_delta: d.total_delta(),
            })
            .collect()
    }

    /// Commitment over the full account state: deltas plus offer and
    /// workspace state. Workspace signatures and status are excluded: they
    /// are attestations *over* this commitment and must not feed back into
    /// it.
    pub fn account_root(&self) -> Result<B256, EngineError> {
        let offers: Vec<_> = self.swap_offers.values().collect();
        let workspace = self
            .settlement_workspace
            .as_ref()
            .map(|ws| (ws.version, &ws.ops, ws.last_modified_by_left));
        hash::digest(&(self.state_hash()?, offers, workspace))
    }

    /// The proof header the next committed frame will carry.
    pub fn next_proof_header(&self) -> Result<ProofHeader, EngineError> {
        Ok(ProofHeader {
            nonce: self.on_chain_settlement_nonce + 1,
            total_delta_hash: self.total_delta_hash()?,
            account_root: self.account_root()?,
        })
    }

    /// Hanko payload for a proof header on this edge.
    pub fn proof_digest(&self, proof: &ProofHeader) -> Result<B256, EngineError> {
        proof_claim_digest(self.left_entity, self.right_entity, proof)
            .map_err(|e| EngineError::Encoding(e.to_string()))
    }

    pub fn push_frame(&mut self, frame: AccountFrame) {
        self.frame_history.push_back(frame);
        while self.frame_history.len() > FRAME_HISTORY_KEEP {
            self.frame_history.pop_front();
        }
    }

    /// Count of bilaterally attested chain event claims across retained
    /// frames. The dispute path must never grow this.
    pub fn j_claim_count(&self) -> usize {
        self.frame_history
            .iter()
            .flat_map(|f| f.txs.iter())
            .filter(|tx| tx.is_j_event_claim())
            .count()
    }

    pub fn verify_invariants(&self) -> Result<(), crate::errors::InvariantError> {
        for delta in self.deltas.values() {
            delta.verify_invariants()?;
        }
        Ok(())
    }
}
