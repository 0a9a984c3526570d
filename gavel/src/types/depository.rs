//! Depository contract interface and event decoding for live jurisdictions.

use alloy::primitives::B256;
use alloy::rpc::types::Log;
use alloy::sol;
use alloy::sol_types::SolEventInterface;

use crate::errors::GavelError;
use crate::types::batch::SettlementDiff;
use crate::types::events::{JEvent, JEventRecord};

sol! {
    #[allow(missing_docs)]
    #[sol(rpc)]
    contract Depository {
        struct TokenDiff {
            uint64 tokenId;
            int256 leftDiff;
            int256 rightDiff;
            int256 collateralDiff;
            int256 ondeltaDiff;
        }

        event ReserveUpdated(bytes32 indexed entity, uint64 indexed tokenId, uint256 newAmount);
        event CollateralUpdated(
            bytes32 indexed leftEntity,
            bytes32 indexed rightEntity,
            uint64 tokenId,
            uint256 newCollateral,
            int256 newOndelta
        );
        event SettlementProcessed(
            bytes32 indexed leftEntity,
            bytes32 indexed rightEntity,
            uint64 nonce,
            TokenDiff[] diffs
        );
        event DisputeStarted(
            bytes32 indexed leftEntity,
            bytes32 indexed rightEntity,
            uint64 tokenId,
            uint64 disputeTimeoutBlock,
            bool challengerIsLeft,
            bytes challengerHanko
        );
        event DisputeFinalized(
            bytes32 indexed leftEntity,
            bytes32 indexed rightEntity,
            uint64 tokenId,
            int256 finalOndelta,
            uint256 finalCollateralSplit
        );

        function processBatch(bytes32 entityId, bytes calldata batch, bytes calldata hankoSignature) external;
        function debugFundReserves(bytes32 entityId, uint64 tokenId, uint256 amount) external;
        function registerNumberedEntitiesBatch(bytes32[] calldata boardHashes) external returns (uint256[] memory assigned);
        function disputeTimeoutBlocks() external view returns (uint64);
    }
}

fn token_diffs(diffs: Vec<Depository::TokenDiff>) -> Vec<SettlementDiff> {
    diffs
        .into_iter()
        .map(|d| SettlementDiff {
            token_id: d.tokenId,
            left_diff: d.leftDiff,
            right_diff: d.rightDiff,
            collateral_diff: d.collateralDiff,
            ondelta_diff: d.ondeltaDiff,
        })
        .collect()
}

/// Decode one RPC log into a [`JEventRecord`]. Logs emitted by other
/// contracts (or unknown Depository events) decode to `None`.
pub fn decode_event(log: &Log) -> Result<Option<JEventRecord>, GavelError> {
    let decoded = match Depository::DepositoryEvents::decode_log(&log.inner) {
        Ok(ev) => ev,
        Err(_) => return Ok(None),
    };

    let block_number = log
        .block_number
        .ok_or_else(|| GavelError::EventDecode("log missing block number".into()))?;
    let log_index = log
        .log_index
        .ok_or_else(|| GavelError::EventDecode("log missing index".into()))?
        as u32;

    let event = match decoded.data {
        Depository::DepositoryEvents::ReserveUpdated(ev) => JEvent::ReserveUpdated {
            entity: B256::from(ev.entity),
            token_id: ev.tokenId,
            new_amount: ev.newAmount,
        },
        Depository::DepositoryEvents::CollateralUpdated(ev) => JEvent::CollateralUpdated {
            left: B256::from(ev.leftEntity),
            right: B256::from(ev.rightEntity),
            token_id: ev.tokenId,
            new_collateral: ev.newCollateral,
            new_ondelta: ev.newOndelta,
        },
        Depository::DepositoryEvents::SettlementProcessed(ev) => JEvent::SettlementProcessed {
            left: B256::from(ev.leftEntity),
            right: B256::from(ev.rightEntity),
            nonce: ev.nonce,
            diffs: token_diffs(ev.diffs),
        },
        Depository::DepositoryEvents::DisputeStarted(ev) => JEvent::DisputeStarted {
            left: B256::from(ev.leftEntity),
            right: B256::from(ev.rightEntity),
            token_id: ev.tokenId,
            dispute_timeout_block: ev.disputeTimeoutBlock,
            challenger_is_left: ev.challengerIsLeft,
            challenger_hanko: ev.challengerHanko.to_vec(),
        },
        Depository::DepositoryEvents::DisputeFinalized(ev) => JEvent::DisputeFinalized {
            left: B256::from(ev.leftEntity),
            right: B256::from(ev.rightEntity),
            token_id: ev.tokenId,
            final_ondelta: ev.finalOndelta,
            final_collateral_split: ev.finalCollateralSplit,
        },
    };

    Ok(Some(JEventRecord {
        block_number,
        log_index,
        event,
    }))
}
