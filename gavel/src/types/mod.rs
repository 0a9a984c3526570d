pub mod batch;
pub mod depository;
pub mod events;
pub mod hanko;

pub use batch::{
    CollateralToReserveOp, DisputeFinalizeOp, DisputeStartOp, JBatch, ProofClaim,
    ReserveToCollateralOp, RevealedDelta, SettlementDiff, SettlementOp,
};
pub use events::{EventCursor, JEvent, JEventRecord};
pub use hanko::{Hanko, HankoSig, ValidatorMember, ValidatorSet};
