//! Canonical hashing.
//!
//! Every consensus artifact (entity frames, account frames, proof headers,
//! state roots) is hashed as keccak256 over its canonical MessagePack
//! encoding. Struct fields encode in declaration order, maps are BTree-backed,
//! so both sides of every handshake derive byte-identical digests.

use alloy::primitives::{keccak256, B256};
use serde::Serialize;

use crate::errors::EngineError;

/// Canonical byte encoding of any serializable value.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, EngineError> {
    rmp_serde::to_vec(value).map_err(|e| EngineError::Encoding(e.to_string()))
}

/// keccak256 over the canonical encoding.
pub fn digest<T: Serialize>(value: &T) -> Result<B256, EngineError> {
    Ok(keccak256(canonical_bytes(value)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_across_calls() {
        let v = (1u64, "abc", vec![3u8, 4, 5]);
        assert_eq!(digest(&v).unwrap(), digest(&v).unwrap());
        assert_ne!(digest(&v).unwrap(), digest(&(2u64, "abc", vec![3u8, 4, 5])).unwrap());
    }
}
