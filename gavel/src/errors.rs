use thiserror::Error;

#[derive(Error, Debug)]
pub enum GavelError {
    #[error("stale batch nonce: got {got}, last confirmed {last_confirmed}")]
    StaleNonce { got: u64, last_confirmed: u64 },

    #[error("batch rejected by jurisdiction: {0}")]
    BatchRejected(String),

    #[error("insufficient reserve: entity {entity}, token {token_id}, have {have}, need {need}")]
    InsufficientReserve {
        entity: String,
        token_id: u64,
        have: String,
        need: String,
    },

    #[error("unknown edge {left}/{right}")]
    UnknownEdge { left: String, right: String },

    #[error("dispute error: {0}")]
    Dispute(String),

    #[error("proof mismatch: {0}")]
    ProofMismatch(String),

    #[error("conservation violated in settlement diff for token {token_id}")]
    ConservationViolated { token_id: u64 },

    #[error("hanko verification failed: {0}")]
    HankoInvalid(String),

    #[error("signer error: {0}")]
    Signer(#[from] crate::signers::signer::SignerError),

    #[error("network error: {0}")]
    Network(String),

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("event decode error: {0}")]
    EventDecode(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("operation not supported by this jurisdiction: {0}")]
    Unsupported(&'static str),

    #[error("submission timed out after {0} ms")]
    Timeout(u64),
}
