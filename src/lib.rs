//! rcpan — a reserve-credit provable account network.
//!
//! Pairs of entities maintain bilateral account machines whose balances are
//! enforceable on a jurisdiction's Depository contract. Each edge carries
//! mutual credit limits, on-chain collateral, and a counter-signed,
//! monotonically-numbered proof header either side can submit in a dispute.
//!
//! The stack, leaves first:
//!
//! - [`model::delta`] — per-(edge, token) credit arithmetic and invariants
//! - [`account`] — two-party frame protocol producing signed proof headers
//! - [`entity`] — proposer-based BFT replicas dispatching entity txs
//! - [`runtime`] — deterministic tick scheduler, history, snapshots
//! - [`orderbook`] — hub-hosted price-time book over swap offers
//! - [`scenario`] — scripted end-to-end harness over a simulated jurisdiction
//!
//! Jurisdiction plumbing (batch wire types, the Depository interface, the
//! simulated and live chains) lives in the companion `gavel` crate.

pub mod account;
pub mod demo;
pub mod entity;
pub mod errors;
pub mod hash;
pub mod live;
pub mod model;
pub mod orderbook;
pub mod runtime;
pub mod scenario;
pub mod schema;

pub use errors::EngineError;
