//! Finalized chain events, the only inputs the core accepts from a
//! jurisdiction.

use alloy::primitives::{B256, I256, U256};
use serde::{Deserialize, Serialize};

use super::batch::SettlementDiff;

/// Position in a jurisdiction's event stream. Cursors are exclusive: polling
/// from a cursor yields strictly later events.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct EventCursor {
    pub block_number: u64,
    pub log_index: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JEvent {
    ReserveUpdated {
        entity: B256,
        token_id: u64,
        new_amount: U256,
    },
    CollateralUpdated {
        left: B256,
        right: B256,
        token_id: u64,
        new_collateral: U256,
        new_ondelta: I256,
    },
    SettlementProcessed {
        left: B256,
        right: B256,
        nonce: u64,
        diffs: Vec<SettlementDiff>,
    },
    DisputeStarted {
        left: B256,
        right: B256,
        token_id: u64,
        dispute_timeout_block: u64,
        challenger_is_left: bool,
        challenger_hanko: Vec<u8>,
    },
    DisputeFinalized {
        left: B256,
        right: B256,
        token_id: u64,
        final_ondelta: I256,
        final_collateral_split: U256,
    },
}

/// An event pinned to its unique chain position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JEventRecord {
    pub block_number: u64,
    pub log_index: u32,
    pub event: JEvent,
}

impl JEventRecord {
    pub fn cursor(&self) -> EventCursor {
        EventCursor {
            block_number: self.block_number,
            log_index: self.log_index,
        }
    }
}
