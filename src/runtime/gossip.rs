//! Peer transport.
//!
//! The runtime hands envelopes for non-local signers to a gossip
//! implementation; anything received is verified against the declared
//! sender's registered address and deduplicated by `(from, nonce)` before it
//! reaches the network inbox. In-process deployments use the loopback
//! implementation below; relays and sockets implement the same trait.

use std::collections::{BTreeMap, BTreeSet};

use alloy::primitives::{Address, Signature};
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::hash;
use crate::model::entity::EntityInput;
use crate::model::ids::{EntityId, SignerId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: SignerId,
    pub to: SignerId,
    pub entity_id: EntityId,
    pub payload: EntityInput,
    pub nonce: u64,
    pub signature: Signature,
}

impl Envelope {
    pub fn signing_digest(
        from: &str,
        to: &str,
        entity_id: EntityId,
        payload: &EntityInput,
        nonce: u64,
    ) -> Result<alloy::primitives::B256, EngineError> {
        hash::digest(&(from, to, entity_id, payload, nonce))
    }
}

pub trait Gossip: Send {
    /// Deliver an envelope toward its recipient. At-most-once after
    /// signature verification; duplicates and forgeries are dropped.
    fn send(&mut self, envelope: Envelope);

    /// Envelopes that arrived for the local process, in order.
    fn drain(&mut self) -> Vec<Envelope>;
}

/// Loopback gossip with sender registry, dedup, and signature checks.
#[derive(Debug, Default)]
pub struct InProcessGossip {
    addresses: BTreeMap<SignerId, Address>,
    seen: BTreeSet<(SignerId, u64)>,
    queue: Vec<Envelope>,
}

impl InProcessGossip {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, signer: SignerId, address: Address) {
        self.addresses.insert(signer, address);
    }

    fn verify(&self, envelope: &Envelope) -> bool {
        let Some(expected) = self.addresses.get(&envelope.from) else {
            return false;
        };
        let Ok(digest) = Envelope::signing_digest(
            &envelope.from,
            &envelope.to,
            envelope.entity_id,
            &envelope.payload,
            envelope.nonce,
        ) else {
            return false;
        };
        envelope
            .signature
            .recover_address_from_prehash(&digest)
            .map(|a| a == *expected)
            .unwrap_or(false)
    }
}

impl Gossip for InProcessGossip {
    fn send(&mut self, envelope: Envelope) {
        let key = (envelope.from.clone(), envelope.nonce);
        if self.seen.contains(&key) {
            return;
        }
        if !self.verify(&envelope) {
            return;
        }
        self.seen.insert(key);
        self.queue.push(envelope);
    }

    fn drain(&mut self) -> Vec<Envelope> {
        std::mem::take(&mut self.queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::B256;
    use gavel::signers::signer::{HankoSigner, LocalSigner};

    fn envelope(signer: &LocalSigner, nonce: u64) -> Envelope {
        let entity = B256::from([1u8; 32]);
        let payload = EntityInput::AddTx {
            tx: crate::model::entity::EntityTx::MintReserves {
                token_id: 1,
                amount: alloy::primitives::U256::from(5u64),
            },
        };
        let digest =
            Envelope::signing_digest(signer.signer_id(), "s2", entity, &payload, nonce).unwrap();
        Envelope {
            from: signer.signer_id().to_string(),
            to: "s2".into(),
            entity_id: entity,
            payload,
            nonce,
            signature: signer.sign_digest(digest).unwrap(),
        }
    }

    #[test]
    fn duplicate_envelopes_are_dropped() {
        let signer = LocalSigner::from_seed(1, B256::from([1u8; 32]), "s1");
        let mut gossip = InProcessGossip::new();
        gossip.register("s1".into(), signer.address());

        gossip.send(envelope(&signer, 7));
        gossip.send(envelope(&signer, 7));
        assert_eq!(gossip.drain().len(), 1);
    }

    #[test]
    fn unverifiable_senders_are_dropped() {
        let signer = LocalSigner::from_seed(1, B256::from([1u8; 32]), "s1");
        let rogue = LocalSigner::from_seed(2, B256::from([1u8; 32]), "s1");
        let mut gossip = InProcessGossip::new();
        gossip.register("s1".into(), signer.address());

        // Signed with the wrong key for the declared signer.
        gossip.send(envelope(&rogue, 1));
        assert!(gossip.drain().is_empty());

        gossip.send(envelope(&signer, 2));
        assert_eq!(gossip.drain().len(), 1);
    }
}
