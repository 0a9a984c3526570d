//! Hanko construction and verification.
//!
//! A hanko is an entity's threshold signature: an ordered list of ECDSA
//! signatures from the entity's validator set over a single canonical digest.
//! The jurisdiction contract accepts a payload whenever the recovered signer
//! weight reaches the entity's registered threshold; this module mirrors that
//! check client-side.

use alloy::primitives::{Address, Signature, B256};
use serde::{Deserialize, Serialize};

use crate::errors::GavelError;

/// One validator's contribution to a hanko.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HankoSig {
    /// Signer id within the entity's validator set.
    pub signer: String,
    pub signature: Signature,
}

/// Threshold signature over a canonical digest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hanko {
    pub signatures: Vec<HankoSig>,
}

impl Hanko {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(signer: impl Into<String>, signature: Signature) -> Self {
        Self {
            signatures: vec![HankoSig {
                signer: signer.into(),
                signature,
            }],
        }
    }

    pub fn push(&mut self, signer: impl Into<String>, signature: Signature) {
        self.signatures.push(HankoSig {
            signer: signer.into(),
            signature,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    /// Canonical wire encoding (what goes into batch ops and on-chain blobs).
    pub fn encode(&self) -> Result<Vec<u8>, GavelError> {
        rmp_serde::to_vec(self).map_err(|e| GavelError::Serialize(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, GavelError> {
        rmp_serde::from_slice(bytes).map_err(|e| GavelError::Serialize(e.to_string()))
    }

    /// Sum of shares of set members whose signature recovers over `digest`.
    ///
    /// Unknown signers and signatures that recover to the wrong address
    /// contribute zero weight; duplicates count once.
    pub fn weight(&self, digest: B256, set: &ValidatorSet) -> u64 {
        let mut counted: Vec<&str> = Vec::new();
        let mut total = 0u64;
        for hs in &self.signatures {
            if counted.iter().any(|s| *s == hs.signer.as_str()) {
                continue;
            }
            let Some(member) = set.member(&hs.signer) else {
                continue;
            };
            match hs.signature.recover_address_from_prehash(&digest) {
                Ok(addr) if addr == member.address => {
                    counted.push(&hs.signer);
                    total += member.shares;
                }
                _ => {}
            }
        }
        total
    }

    pub fn verify(&self, digest: B256, set: &ValidatorSet) -> bool {
        self.weight(digest, set) >= set.threshold
    }
}

/// A registered validator of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatorMember {
    pub signer: String,
    pub address: Address,
    pub shares: u64,
}

/// The validator set the jurisdiction knows for an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatorSet {
    pub threshold: u64,
    pub members: Vec<ValidatorMember>,
}

impl ValidatorSet {
    pub fn member(&self, signer: &str) -> Option<&ValidatorMember> {
        self.members.iter().find(|m| m.signer == signer)
    }

    pub fn total_shares(&self) -> u64 {
        self.members.iter().map(|m| m.shares).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signers::signer::{HankoSigner, LocalSigner};
    use alloy::primitives::keccak256;

    fn set_of(signers: &[&LocalSigner], threshold: u64) -> ValidatorSet {
        ValidatorSet {
            threshold,
            members: signers
                .iter()
                .map(|s| ValidatorMember {
                    signer: s.signer_id().to_string(),
                    address: s.address(),
                    shares: 1,
                })
                .collect(),
        }
    }

    #[test]
    fn threshold_weight() {
        let entity = B256::from([7u8; 32]);
        let s1 = LocalSigner::from_seed(1, entity, "s1");
        let s2 = LocalSigner::from_seed(1, entity, "s2");
        let s3 = LocalSigner::from_seed(1, entity, "s3");
        let set = set_of(&[&s1, &s2, &s3], 2);

        let digest = keccak256(b"payload");
        let mut hanko = Hanko::new();
        hanko.push("s1", s1.sign_digest(digest).unwrap());
        assert!(!hanko.verify(digest, &set));

        hanko.push("s2", s2.sign_digest(digest).unwrap());
        assert!(hanko.verify(digest, &set));

        // Duplicate signatures count once.
        let mut dup = Hanko::new();
        let sig = s1.sign_digest(digest).unwrap();
        dup.push("s1", sig);
        dup.push("s1", sig);
        assert_eq!(dup.weight(digest, &set), 1);
    }

    #[test]
    fn wrong_digest_has_no_weight() {
        let entity = B256::from([9u8; 32]);
        let s1 = LocalSigner::from_seed(3, entity, "s1");
        let set = set_of(&[&s1], 1);

        let digest = keccak256(b"a");
        let other = keccak256(b"b");
        let hanko = Hanko::single("s1", s1.sign_digest(digest).unwrap());
        assert!(hanko.verify(digest, &set));
        assert!(!hanko.verify(other, &set));
    }

    #[test]
    fn encode_roundtrip() {
        let entity = B256::from([1u8; 32]);
        let s1 = LocalSigner::from_seed(5, entity, "s1");
        let digest = keccak256(b"x");
        let hanko = Hanko::single("s1", s1.sign_digest(digest).unwrap());
        let bytes = hanko.encode().unwrap();
        assert_eq!(Hanko::decode(&bytes).unwrap(), hanko);
    }
}
