//! # gavel
//!
//! A Rust client SDK for RC-PAN jurisdiction contracts.
//!
//! A *jurisdiction* is a settlement chain hosting a Depository contract that
//! holds entity reserves, per-edge collateral, and adjudicates disputes from
//! signed proof headers. This crate provides:
//!
//! - Wire types for outbound batches ([`types::batch`]) and finalized chain
//!   events ([`types::events`])
//! - The [`Jurisdiction`](providers::Jurisdiction) trait with a deterministic
//!   in-memory implementation ([`providers::SimJurisdiction`]) and an HTTP
//!   provider client ([`providers::LiveJurisdiction`])
//! - Per-entity batch nonce tracking ([`providers::EntityNonces`])
//! - Batch submission with timeout/retry classification
//!   ([`providers::BatchSubmitter`])
//! - Hanko (threshold signature) construction and verification
//!   ([`types::hanko`])

pub mod constants;
pub mod errors;
pub mod providers;
pub mod signers;
pub mod types;

pub use errors::GavelError;
pub use providers::{
    BatchSubmitter, EntityNonces, EventCursor, Jurisdiction, LiveJurisdiction, SimJurisdiction,
    SubmitOutcome,
};
pub use types::batch::JBatch;
pub use types::events::{JEvent, JEventRecord};
pub use types::hanko::Hanko;
