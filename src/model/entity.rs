//! Per-entity state and the entity-level transaction catalog.

use std::collections::{BTreeMap, BTreeSet};

use alloy::primitives::{Address, Signature, B256, U256};
use serde::{Deserialize, Serialize};

use gavel::types::batch::JBatch;
use gavel::types::events::JEventRecord;
use gavel::types::hanko::{Hanko, ValidatorMember, ValidatorSet};

use crate::model::account::{AccountInput, AccountMachine};
use crate::model::ids::{EntityId, SignerId, TokenId};
use crate::model::workspace::WorkspaceOp;
use crate::orderbook::Orderbook;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusMode {
    /// The first validator proposes; the only mode there is.
    ProposerBased,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatorConfig {
    pub mode: ConsensusMode,
    pub threshold: u64,
    /// Proposer first.
    pub validators: Vec<SignerId>,
    pub shares: BTreeMap<SignerId, u64>,
    /// Registered signing addresses, keyed by signer id.
    pub addresses: BTreeMap<SignerId, Address>,
}

impl ValidatorConfig {
    /// Single validator holding the full threshold.
    pub fn sole(signer: impl Into<String>, address: Address) -> Self {
        let signer = signer.into();
        Self {
            mode: ConsensusMode::ProposerBased,
            threshold: 1,
            validators: vec![signer.clone()],
            shares: BTreeMap::from([(signer.clone(), 1)]),
            addresses: BTreeMap::from([(signer, address)]),
        }
    }

    pub fn proposer(&self) -> &SignerId {
        &self.validators[0]
    }

    pub fn share_of(&self, signer: &str) -> u64 {
        self.shares.get(signer).copied().unwrap_or(0)
    }

    pub fn to_validator_set(&self) -> ValidatorSet {
        ValidatorSet {
            threshold: self.threshold,
            members: self
                .validators
                .iter()
                .filter_map(|s| {
                    self.addresses.get(s).map(|addr| ValidatorMember {
                        signer: s.clone(),
                        address: *addr,
                        shares: self.share_of(s),
                    })
                })
                .collect(),
        }
    }
}

/// Per-token rebalance policy a spoke publishes for its edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalancePolicy {
    /// Uncollateralized exposure above this asks the hub for collateral.
    pub soft_limit: U256,
    /// Cap on any single collateral request.
    pub hard_limit: U256,
    pub max_acceptable_fee: U256,
}

/// Hub-side configuration: fee policy for forwarded payments and the
/// rebalance crontab cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubConfig {
    pub fee_ppm: u64,
    pub base_fee: U256,
    /// Logical-time cadence of the rebalance scan.
    pub scan_interval_ms: u64,
}

impl HubConfig {
    pub fn fee_for(&self, amount: U256) -> U256 {
        self.base_fee + amount * U256::from(self.fee_ppm) / U256::from(1_000_000u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Confirmed,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub nonce: u64,
    pub op_count: usize,
    pub status: BatchStatus,
    pub tx_hash: Option<B256>,
}

/// The outbound jurisdiction batch being accumulated, plus the one in
/// flight. A rejected in-flight batch folds back into the building buffer
/// for retry with the same nonce.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JBatchState {
    pub building: JBatch,
    pub in_flight: Option<JBatch>,
    pub pending_broadcast: bool,
}

impl JBatchState {
    pub fn is_empty(&self) -> bool {
        self.building.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub entity_id: EntityId,
    pub validator_config: ValidatorConfig,
    /// Depository reserves not committed to any edge.
    pub reserves: BTreeMap<TokenId, U256>,
    pub accounts: BTreeMap<EntityId, AccountMachine>,
    pub j_batch: JBatchState,
    pub batch_history: Vec<BatchRecord>,
    /// Last batch nonce the jurisdiction confirmed for us.
    pub j_nonce_confirmed: u64,
    pub rebalance_policies: BTreeMap<TokenId, RebalancePolicy>,
    pub hub_config: Option<HubConfig>,
    pub hub_last_scan: u64,
    pub orderbook: Option<Orderbook>,
    /// Highest finalized jurisdiction block observed.
    pub j_block: u64,
    /// Ingested event positions, for idempotent claims.
    pub seen_j_events: BTreeSet<(u64, u32)>,
    pub timestamp: u64,
    /// Committed entity-frame count.
    pub height: u64,
    pub last_frame_hash: B256,
    pub payment_seq: u64,
}

impl EntityState {
    pub fn new(entity_id: EntityId, validator_config: ValidatorConfig) -> Self {
        Self {
            entity_id,
            validator_config,
            reserves: BTreeMap::new(),
            accounts: BTreeMap::new(),
            j_batch: JBatchState::default(),
            batch_history: Vec::new(),
            j_nonce_confirmed: 0,
            rebalance_policies: BTreeMap::new(),
            hub_config: None,
            hub_last_scan: 0,
            orderbook: None,
            j_block: 0,
            seen_j_events: BTreeSet::new(),
            timestamp: 0,
            height: 0,
            last_frame_hash: B256::ZERO,
            payment_seq: 0,
        }
    }

    pub fn reserve(&self, token_id: TokenId) -> U256 {
        self.reserves.get(&token_id).copied().unwrap_or_default()
    }

    pub fn account(&self, counterparty: EntityId) -> Option<&AccountMachine> {
        self.accounts.get(&counterparty)
    }

    pub fn account_mut(&mut self, counterparty: EntityId) -> Option<&mut AccountMachine> {
        self.accounts.get_mut(&counterparty)
    }

    /// Reserve already earmarked by queued r2c ops and by our outgoing legs
    /// of open settlement workspaces, per token.
    pub fn reserve_committed(&self, token_id: TokenId) -> U256 {
        let mut committed = U256::ZERO;
        for op in &self.j_batch.building.reserve_to_collateral {
            if op.token_id == token_id {
                committed += op.amount;
            }
        }
        if let Some(batch) = &self.j_batch.in_flight {
            for op in &batch.reserve_to_collateral {
                if op.token_id == token_id {
                    committed += op.amount;
                }
            }
        }
        for machine in self.accounts.values() {
            let me_is_left = machine.left_entity == self.entity_id;
            if let Some(ws) = &machine.settlement_workspace {
                for op in &ws.ops {
                    match *op {
                        WorkspaceOp::R2c {
                            token_id: t,
                            amount,
                            from_left,
                        }
                        | WorkspaceOp::R2r {
                            token_id: t,
                            amount,
                            from_left,
                        } if t == token_id && from_left == me_is_left => {
                            committed += amount;
                        }
                        _ => {}
                    }
                }
            }
        }
        committed
    }

    pub fn reserve_available(&self, token_id: TokenId) -> U256 {
        self.reserve(token_id)
            .saturating_sub(self.reserve_committed(token_id))
    }
}

/// Entity-level transactions: everything an entity frame can carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntityTx {
    OpenAccount {
        counterparty: EntityId,
        counterparty_validators: Option<ValidatorSet>,
    },
    ExtendCredit {
        counterparty: EntityId,
        token_id: TokenId,
        amount: U256,
    },
    SetCreditLimit {
        counterparty: EntityId,
        token_id: TokenId,
        limit: U256,
    },
    DirectPayment {
        to: EntityId,
        token_id: TokenId,
        amount: U256,
        /// Explicit route (intermediate hops); empty means route discovery.
        route: Vec<EntityId>,
    },
    SettlePropose {
        counterparty: EntityId,
        ops: Vec<WorkspaceOp>,
    },
    SettleUpdate {
        counterparty: EntityId,
        ops: Vec<WorkspaceOp>,
    },
    SettleApprove {
        counterparty: EntityId,
    },
    SettleReject {
        counterparty: EntityId,
    },
    SettleExecute {
        counterparty: EntityId,
    },
    SetRebalancePolicy {
        token_id: TokenId,
        soft_limit: U256,
        hard_limit: U256,
        max_acceptable_fee: U256,
    },
    SetHubConfig {
        fee_ppm: u64,
        base_fee: U256,
        scan_interval_ms: u64,
    },
    /// Direct reserve -> collateral funding of an edge.
    DepositCollateral {
        counterparty: EntityId,
        token_id: TokenId,
        amount: U256,
    },
    SendRebalanceQuote {
        counterparty: EntityId,
        token_id: TokenId,
        amount: U256,
        fee: U256,
    },
    AcceptRebalanceQuote {
        counterparty: EntityId,
        token_id: TokenId,
        amount: U256,
        fee: U256,
    },
    InitOrderbookExt {
        pairs: Vec<(TokenId, TokenId)>,
    },
    PlaceSwapOffer {
        hub: EntityId,
        give_token: TokenId,
        give_amount: U256,
        want_token: TokenId,
        want_amount: U256,
        min_fill_ratio: u16,
    },
    CancelSwapOffer {
        hub: EntityId,
        offer_id: u64,
    },
    DisputeStart {
        counterparty: EntityId,
    },
    DisputeFinalize {
        counterparty: EntityId,
    },
    ReopenDisputed {
        counterparty: EntityId,
    },
    /// Flush the outbound batch to the jurisdiction mempool.
    JBroadcast,
    /// Ingest one finalized chain event.
    JEventClaim {
        record: JEventRecord,
    },
    /// Driver-observed finalized chain head; block-height sync with no event
    /// payload (dispute timeouts are measured in blocks).
    ObserveJBlock { block: u64 },
    /// Driver-reported outcome of an in-flight batch.
    JBatchAck {
        nonce: u64,
        status: BatchStatus,
        tx_hash: Option<B256>,
    },
    /// Test/bootstrap-only reserve mint mirror.
    MintReserves {
        token_id: TokenId,
        amount: U256,
    },
    /// A counterparty's bilateral message, ordered through our consensus.
    HandleAccountInput {
        from: EntityId,
        input: AccountInput,
    },
    /// Internal: periodic hub scan firing.
    HubRebalanceScan,
}

/// A committed entity frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityFrame {
    pub height: u64,
    pub timestamp: u64,
    pub prev_hash: B256,
    pub txs: Vec<EntityTx>,
}

/// Messages routed between replicas (and from the outside world in).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntityInput {
    /// Client-submitted transaction.
    AddTx { tx: EntityTx },
    /// Proposer -> validators.
    Propose {
        frame: EntityFrame,
        frame_hash: B256,
        /// Digests the frame's apply will need hankos for, in apply order.
        sign_requests: Vec<B256>,
        proposer: SignerId,
        signature: Signature,
    },
    /// Validator -> proposer.
    Precommit {
        height: u64,
        frame_hash: B256,
        signer: SignerId,
        frame_sig: Signature,
        payload_sigs: Vec<Signature>,
    },
    /// Proposer -> validators, with the assembled hankos.
    Commit {
        frame: EntityFrame,
        frame_hash: B256,
        frame_hanko: Hanko,
        payload_hankos: Vec<(B256, Hanko)>,
    },
    /// A bilateral message from a peer entity; wrapped into
    /// [`EntityTx::HandleAccountInput`] at the proposer.
    AccountMessage { from: EntityId, input: AccountInput },
}
