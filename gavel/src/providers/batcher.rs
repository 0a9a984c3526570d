//! Batch submission with timeout classification.
//!
//! An entity flushes its accumulated jurisdiction operations as one batch.
//! Submission is fire-and-confirm: a batch that the chain rejects (stale
//! nonce, failed op) is terminal for that batch's content, while a batch that
//! merely times out is retry-eligible with the *same* nonce, because the
//! nonce only advances on confirmation.

use std::time::Duration;

use alloy::primitives::B256;
use tokio::time::timeout;
use tracing::{info, warn};
use uuid::Uuid;

use crate::constants::{DEFAULT_BATCH_TIMEOUT, MAX_BATCH_OPS};
use crate::errors::GavelError;
use crate::types::batch::JBatch;

use super::jurisdiction::{BatchReceipt, Jurisdiction};

#[derive(Clone, Debug)]
pub struct BatchConfig {
    /// How long to wait for inclusion before classifying as rejected.
    pub submit_timeout: Duration,
    /// Batches above this op count are refused before submission.
    pub max_batch_ops: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            submit_timeout: DEFAULT_BATCH_TIMEOUT,
            max_batch_ops: MAX_BATCH_OPS,
        }
    }
}

/// A batch queued for submission.
#[derive(Debug, Clone)]
pub struct PendingBatch {
    pub id: Uuid,
    pub entity: B256,
    pub batch: JBatch,
    pub hanko: Vec<u8>,
}

impl PendingBatch {
    pub fn new(entity: B256, batch: JBatch, hanko: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity,
            batch,
            hanko,
        }
    }
}

/// Outcome the driver records into the entity's batch history.
#[derive(Debug)]
pub enum SubmitOutcome {
    Confirmed(BatchReceipt),
    Rejected {
        reason: String,
        /// True for timeouts and transport failures; false for chain-side
        /// rejection of the batch content.
        retry_eligible: bool,
    },
}

pub struct BatchSubmitter {
    config: BatchConfig,
}

impl BatchSubmitter {
    pub fn new(config: BatchConfig) -> Self {
        Self { config }
    }

    pub async fn submit(&self, jurisdiction: &dyn Jurisdiction, pending: &PendingBatch) -> SubmitOutcome {
        if pending.batch.op_count() > self.config.max_batch_ops {
            return SubmitOutcome::Rejected {
                reason: format!(
                    "batch has {} ops, cap is {}",
                    pending.batch.op_count(),
                    self.config.max_batch_ops
                ),
                retry_eligible: false,
            };
        }

        let fut = jurisdiction.submit_batch(pending.entity, &pending.batch, &pending.hanko);
        match timeout(self.config.submit_timeout, fut).await {
            Ok(Ok(receipt)) => {
                info!(
                    id = %pending.id,
                    entity = %pending.entity,
                    nonce = pending.batch.nonce,
                    block = receipt.block_number,
                    "batch confirmed"
                );
                SubmitOutcome::Confirmed(receipt)
            }
            Ok(Err(e)) => {
                warn!(id = %pending.id, entity = %pending.entity, error = %e, "batch rejected");
                let retry_eligible = matches!(e, GavelError::Network(_) | GavelError::Rpc(_));
                SubmitOutcome::Rejected {
                    reason: e.to_string(),
                    retry_eligible,
                }
            }
            Err(_) => {
                warn!(id = %pending.id, entity = %pending.entity, "batch submission timed out");
                SubmitOutcome::Rejected {
                    reason: GavelError::Timeout(self.config.submit_timeout.as_millis() as u64)
                        .to_string(),
                    retry_eligible: true,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::sim::SimJurisdiction;
    use alloy::primitives::U256;

    #[tokio::test]
    async fn confirmed_batch_reports_receipt() {
        let sim = SimJurisdiction::default();
        let entity = B256::from([1u8; 32]);
        sim.fund_reserves_sync(entity, 1, U256::from(100u64));

        let mut batch = JBatch::default();
        batch.nonce = 1;
        let pending = PendingBatch::new(entity, batch, vec![]);
        let submitter = BatchSubmitter::new(BatchConfig::default());

        match submitter.submit(&sim, &pending).await {
            SubmitOutcome::Confirmed(receipt) => assert!(receipt.block_number > 0),
            other => panic!("expected confirmation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stale_nonce_is_not_retry_eligible() {
        let sim = SimJurisdiction::default();
        let entity = B256::from([2u8; 32]);

        let mut batch = JBatch::default();
        batch.nonce = 1;
        let pending = PendingBatch::new(entity, batch, vec![]);
        let submitter = BatchSubmitter::new(BatchConfig::default());

        assert!(matches!(
            submitter.submit(&sim, &pending).await,
            SubmitOutcome::Confirmed(_)
        ));
        match submitter.submit(&sim, &pending).await {
            SubmitOutcome::Rejected { retry_eligible, .. } => assert!(!retry_eligible),
            other => panic!("expected rejection, got {other:?}"),
        }
    }
}
