//! Signer abstraction for validator keys.

use alloy::primitives::{keccak256, Address, Signature, B256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SignerError {
    #[error("invalid private key: {0}")]
    InvalidKey(String),

    #[error("signing failed: {0}")]
    SigningFailed(String),
}

/// Anything that can contribute a validator signature to a hanko.
pub trait HankoSigner: Send + Sync {
    /// Signer id within the entity's validator set.
    fn signer_id(&self) -> &str;

    /// Address the jurisdiction has registered for this signer.
    fn address(&self) -> Address;

    /// Sign a 32-byte canonical digest (no message prefixing).
    fn sign_digest(&self, digest: B256) -> Result<Signature, SignerError>;
}

/// In-process ECDSA signer.
#[derive(Debug, Clone)]
pub struct LocalSigner {
    id: String,
    inner: PrivateKeySigner,
}

impl LocalSigner {
    pub fn from_key(id: impl Into<String>, key: B256) -> Result<Self, SignerError> {
        let inner = PrivateKeySigner::from_bytes(&key)
            .map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        Ok(Self {
            id: id.into(),
            inner,
        })
    }

    /// Deterministic scenario key: derived from the runtime seed, the entity
    /// id, and the signer id. Production keys are provisioned externally.
    pub fn from_seed(seed: u64, entity: B256, id: &str) -> Self {
        let mut material = Vec::with_capacity(8 + 32 + id.len());
        material.extend_from_slice(&seed.to_be_bytes());
        material.extend_from_slice(entity.as_slice());
        material.extend_from_slice(id.as_bytes());
        let mut key = keccak256(&material);
        // keccak output is a valid secp256k1 scalar for all practical seeds;
        // rehash on the degenerate cases rather than panic.
        let inner = loop {
            match PrivateKeySigner::from_bytes(&key) {
                Ok(s) => break s,
                Err(_) => key = keccak256(key.as_slice()),
            }
        };
        Self {
            id: id.to_string(),
            inner,
        }
    }
}

impl HankoSigner for LocalSigner {
    fn signer_id(&self) -> &str {
        &self.id
    }

    fn address(&self) -> Address {
        self.inner.address()
    }

    fn sign_digest(&self, digest: B256) -> Result<Signature, SignerError> {
        self.inner
            .sign_hash_sync(&digest)
            .map_err(|e| SignerError::SigningFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_derivation_is_deterministic() {
        let entity = B256::from([3u8; 32]);
        let a = LocalSigner::from_seed(42, entity, "s1");
        let b = LocalSigner::from_seed(42, entity, "s1");
        assert_eq!(a.address(), b.address());

        let c = LocalSigner::from_seed(42, entity, "s2");
        assert_ne!(a.address(), c.address());

        let d = LocalSigner::from_seed(43, entity, "s1");
        assert_ne!(a.address(), d.address());
    }

    #[test]
    fn signature_recovers() {
        let entity = B256::from([8u8; 32]);
        let s = LocalSigner::from_seed(7, entity, "val");
        let digest = keccak256(b"hello");
        let sig = s.sign_digest(digest).unwrap();
        assert_eq!(
            sig.recover_address_from_prehash(&digest).unwrap(),
            s.address()
        );
    }
}
