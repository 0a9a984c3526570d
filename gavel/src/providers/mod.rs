pub mod batcher;
pub mod jurisdiction;
pub mod live;
pub mod nonce;
pub mod sim;

pub use batcher::{BatchConfig, BatchSubmitter, PendingBatch, SubmitOutcome};
pub use jurisdiction::{BatchReceipt, Jurisdiction};
pub use live::LiveJurisdiction;
pub use nonce::EntityNonces;
pub use sim::SimJurisdiction;

pub use crate::types::events::EventCursor;
