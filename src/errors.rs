//! Error taxonomy.
//!
//! `Admission` and `Invariant` stay local to the replica that raised them:
//! they surface as tx results and as entries in the runtime frame log.
//! `ConsensusMismatch` rejects a frame and lets the proposer retry on fresh
//! state. `DisputeGate` guards frozen edges. Adapter failures never touch
//! entity state; they land in batch history as rejected entries.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("admission failed: {0}")]
    Admission(#[from] AdmissionError),

    #[error("invariant violated: {0}")]
    Invariant(#[from] InvariantError),

    #[error("consensus mismatch: {0}")]
    ConsensusMismatch(String),

    #[error("edge {counterparty} is disputed; only dispute-path txs are accepted")]
    DisputeGate { counterparty: String },

    #[error("adapter error: {0}")]
    Adapter(String),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("signer error: {0}")]
    Signer(String),

    #[error("unexpected handler failure: {0}")]
    Fatal(String),
}

/// A tx failed its preconditions. Rejected synchronously, no state change.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("unknown account with {counterparty}")]
    UnknownAccount { counterparty: String },

    #[error("account with {counterparty} already open")]
    AccountExists { counterparty: String },

    #[error("insufficient outbound capacity on edge with {counterparty}: have {have}, need {need}")]
    InsufficientCapacity {
        counterparty: String,
        have: String,
        need: String,
    },

    #[error("insufficient reserve for token {token_id}: have {have}, need {need}")]
    InsufficientReserve {
        token_id: u64,
        have: String,
        need: String,
    },

    #[error("no route to {target} with enough capacity")]
    NoRoute { target: String },

    #[error("workspace already open on edge with {counterparty}")]
    WorkspaceExists { counterparty: String },

    #[error("no workspace on edge with {counterparty}")]
    WorkspaceMissing { counterparty: String },

    #[error("workspace turn belongs to the other side")]
    WorkspaceWrongTurn,

    #[error("workspace not executable: {0}")]
    WorkspaceNotReady(String),

    #[error("swap offer {offer_id} not found")]
    OfferMissing { offer_id: u64 },

    #[error("swap offer {offer_id} belongs to another entity")]
    OfferNotOwned { offer_id: u64 },

    #[error("offer amount below lot size after quantization")]
    OfferBelowLot,

    #[error("orderbook not initialized on this entity")]
    OrderbookMissing,

    #[error("orderbook has no book for pair ({0}, {1})")]
    UnknownPair(u64, u64),

    #[error("no dispute to act on for edge with {counterparty}")]
    DisputeMissing { counterparty: String },

    #[error("dispute not past timeout (block {block}, timeout {timeout})")]
    DisputeNotTimedOut { block: u64, timeout: u64 },

    #[error("dispute not finalized yet on edge with {counterparty}")]
    DisputeNotFinalized { counterparty: String },

    #[error("a broadcast is already pending; wait for its acknowledgement")]
    BroadcastPending,

    #[error("outbound batch is empty")]
    EmptyBatch,

    #[error("duplicate or stale message: {0}")]
    Stale(String),

    #[error("proposer for this input is the other side")]
    WrongProposer,

    #[error("{0}")]
    Other(String),
}

/// A hard invariant would be violated; the frame or tx carrying it is
/// rejected before any state change.
#[derive(Debug, Error)]
pub enum InvariantError {
    #[error("token {token_id}: |offdelta| {offdelta} exceeds total capacity {capacity}")]
    CapacityExceeded {
        token_id: u64,
        offdelta: String,
        capacity: String,
    },

    #[error("token {token_id}: delta {delta} outside allowed band [{low}, {high}]")]
    DeltaOutOfBand {
        token_id: u64,
        delta: String,
        low: String,
        high: String,
    },

    #[error("token {token_id}: holds {holds} exceed outbound capacity {capacity} on the {side} side")]
    HoldsExceedCapacity {
        token_id: u64,
        holds: String,
        capacity: String,
        side: &'static str,
    },

    #[error("token {token_id}: collateral hold {hold} exceeds collateral {collateral}")]
    CollateralHoldExceeded {
        token_id: u64,
        hold: String,
        collateral: String,
    },

    #[error("settlement diff for token {token_id} does not conserve value")]
    ConservationViolated { token_id: u64 },

    #[error("proof nonce regressed: {got} after {prev}")]
    NonceRegressed { got: u64, prev: u64 },
}
