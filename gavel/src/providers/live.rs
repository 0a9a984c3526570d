//! HTTP jurisdiction client backed by an alloy provider.

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, B256, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::Filter;
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::errors::GavelError;
use crate::types::batch::JBatch;
use crate::types::depository::{decode_event, Depository};
use crate::types::events::{EventCursor, JEventRecord};

use super::jurisdiction::{BatchReceipt, Jurisdiction};

/// A deployed Depository on a real chain.
pub struct LiveJurisdiction {
    provider: DynProvider,
    depository: Address,
}

impl LiveJurisdiction {
    /// Connect over HTTP with a transaction-signing wallet.
    pub fn connect(
        rpc_url: &str,
        depository: Address,
        wallet_key: B256,
    ) -> Result<Self, GavelError> {
        let signer = PrivateKeySigner::from_bytes(&wallet_key)
            .map_err(|e| GavelError::Rpc(format!("invalid wallet key: {e}")))?;
        let url = rpc_url
            .parse()
            .map_err(|e| GavelError::Rpc(format!("invalid RPC URL {rpc_url}: {e}")))?;
        let provider = ProviderBuilder::new()
            .wallet(EthereumWallet::from(signer))
            .connect_http(url)
            .erased();
        Ok(Self {
            provider,
            depository,
        })
    }

    fn contract(&self) -> Depository::DepositoryInstance<DynProvider> {
        Depository::new(self.depository, self.provider.clone())
    }
}

#[async_trait]
impl Jurisdiction for LiveJurisdiction {
    async fn block_number(&self) -> Result<u64, GavelError> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| GavelError::Rpc(e.to_string()))
    }

    async fn submit_batch(
        &self,
        entity: B256,
        batch: &JBatch,
        hanko: &[u8],
    ) -> Result<BatchReceipt, GavelError> {
        let bytes = batch.canonical_bytes()?;
        debug!(
            entity = %entity,
            nonce = batch.nonce,
            ops = batch.op_count(),
            "submitting batch"
        );
        let pending = self
            .contract()
            .processBatch(entity, bytes.into(), hanko.to_vec().into())
            .send()
            .await
            .map_err(|e| GavelError::Rpc(e.to_string()))?;
        let receipt = pending
            .get_receipt()
            .await
            .map_err(|e| GavelError::Rpc(e.to_string()))?;
        if !receipt.status() {
            warn!(entity = %entity, nonce = batch.nonce, "batch reverted");
            return Err(GavelError::BatchRejected(format!(
                "reverted in tx {}",
                receipt.transaction_hash
            )));
        }
        Ok(BatchReceipt {
            tx_hash: receipt.transaction_hash,
            block_number: receipt.block_number.unwrap_or_default(),
        })
    }

    async fn poll_events(&self, cursor: EventCursor) -> Result<Vec<JEventRecord>, GavelError> {
        let head = self.block_number().await?;
        if head < cursor.block_number {
            return Ok(Vec::new());
        }
        let filter = Filter::new()
            .address(self.depository)
            .from_block(cursor.block_number)
            .to_block(head);
        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(|e| GavelError::Rpc(e.to_string()))?;

        let mut records = Vec::new();
        for log in &logs {
            if let Some(rec) = decode_event(log)? {
                if rec.cursor() > cursor {
                    records.push(rec);
                }
            }
        }
        records.sort_by_key(JEventRecord::cursor);
        Ok(records)
    }

    async fn fund_reserves(
        &self,
        entity: B256,
        token_id: u64,
        amount: U256,
    ) -> Result<(), GavelError> {
        let pending = self
            .contract()
            .debugFundReserves(entity, token_id, amount)
            .send()
            .await
            .map_err(|e| GavelError::Rpc(e.to_string()))?;
        pending
            .get_receipt()
            .await
            .map_err(|e| GavelError::Rpc(e.to_string()))?;
        Ok(())
    }

    async fn register_entities(&self, board_hashes: &[B256]) -> Result<Vec<u64>, GavelError> {
        let contract = self.contract();
        let call = contract.registerNumberedEntitiesBatch(board_hashes.to_vec());
        let assigned = call
            .call()
            .await
            .map_err(|e| GavelError::Rpc(e.to_string()))?;
        let pending = call.send().await.map_err(|e| GavelError::Rpc(e.to_string()))?;
        pending
            .get_receipt()
            .await
            .map_err(|e| GavelError::Rpc(e.to_string()))?;
        Ok(assigned.into_iter().map(|n| n.to::<u64>()).collect())
    }

    async fn mine(&self, _blocks: u64) -> Result<u64, GavelError> {
        Err(GavelError::Unsupported("mine on a live jurisdiction"))
    }
}
