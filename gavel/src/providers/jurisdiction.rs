//! The jurisdiction contract surface the core depends on.

use alloy::primitives::{B256, U256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::GavelError;
use crate::types::batch::JBatch;
use crate::types::events::{EventCursor, JEventRecord};

/// Acknowledgement of an accepted batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReceipt {
    pub tx_hash: B256,
    pub block_number: u64,
}

/// One settlement chain hosting a Depository contract.
///
/// Implementations: [`SimJurisdiction`](super::SimJurisdiction) (in-memory,
/// deterministic mining, drives scenarios and tests) and
/// [`LiveJurisdiction`](super::LiveJurisdiction) (HTTP provider).
///
/// The deterministic core never calls this trait directly; drivers do, at
/// tick boundaries, and feed the results back in as runtime inputs.
#[async_trait]
pub trait Jurisdiction: Send + Sync {
    /// Highest finalized block.
    async fn block_number(&self) -> Result<u64, GavelError>;

    /// Submit one entity batch. The jurisdiction enforces per-entity strictly
    /// increasing batch nonces; a replayed or stale nonce rejects the whole
    /// batch with [`GavelError::StaleNonce`].
    async fn submit_batch(
        &self,
        entity: B256,
        batch: &JBatch,
        hanko: &[u8],
    ) -> Result<BatchReceipt, GavelError>;

    /// Events strictly after `cursor`, in `(block_number, log_index)` order.
    async fn poll_events(&self, cursor: EventCursor) -> Result<Vec<JEventRecord>, GavelError>;

    /// Test-only reserve mint.
    async fn fund_reserves(
        &self,
        entity: B256,
        token_id: u64,
        amount: U256,
    ) -> Result<(), GavelError>;

    /// Register entity boards; returns assigned entity numbers.
    async fn register_entities(&self, board_hashes: &[B256]) -> Result<Vec<u64>, GavelError>;

    /// Advance the chain by `blocks` empty blocks (simulated jurisdictions
    /// only). Returns the new head.
    async fn mine(&self, blocks: u64) -> Result<u64, GavelError>;
}
