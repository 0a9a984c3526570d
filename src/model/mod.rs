pub mod account;
pub mod delta;
pub mod entity;
pub mod ids;
pub mod offer;
pub mod workspace;

pub use account::{
    AccountFrame, AccountInput, AccountMachine, AccountStatus, AccountTx, DisputeRecord,
    PendingAccountFrame, ProofHeader,
};
pub use delta::{Delta, DerivedDelta};
pub use entity::{
    BatchRecord, BatchStatus, ConsensusMode, EntityState, EntityTx, HubConfig, JBatchState,
    RebalancePolicy, ValidatorConfig,
};
pub use ids::{is_left, ordered_pair, replica_key, EntityId, SignerId, TokenId};
pub use offer::SwapOffer;
pub use workspace::{SettlementWorkspace, WorkspaceOp, WorkspaceStatus};
