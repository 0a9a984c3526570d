//! Per-entity batch nonce tracking.
//!
//! The Depository stores the last accepted batch nonce per entity and rejects
//! anything not strictly greater. The client side mirrors that: `next_nonce`
//! is a pure read (`last confirmed + 1`) and the counter only advances when
//! the jurisdiction confirms the batch, so a rejected or timed-out batch can
//! be retried with the same nonce.

use std::collections::BTreeMap;

use alloy::primitives::B256;
use parking_lot::Mutex;

#[derive(Debug, Default)]
pub struct EntityNonces {
    last_confirmed: Mutex<BTreeMap<B256, u64>>,
}

impl EntityNonces {
    pub fn new() -> Self {
        Self::default()
    }

    /// The nonce the entity's next batch must carry.
    pub fn next_nonce(&self, entity: B256) -> u64 {
        self.last_confirmed(entity) + 1
    }

    pub fn last_confirmed(&self, entity: B256) -> u64 {
        self.last_confirmed
            .lock()
            .get(&entity)
            .copied()
            .unwrap_or(0)
    }

    /// Record a confirmed batch. Out-of-order confirmations never move the
    /// counter backwards.
    pub fn confirm(&self, entity: B256, nonce: u64) {
        let mut map = self.last_confirmed.lock();
        let entry = map.entry(entity).or_insert(0);
        if nonce > *entry {
            *entry = nonce;
        }
    }

    pub fn is_stale(&self, entity: B256, nonce: u64) -> bool {
        nonce <= self.last_confirmed(entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_advances_only_on_confirm() {
        let nonces = EntityNonces::new();
        let e = B256::from([1u8; 32]);

        assert_eq!(nonces.next_nonce(e), 1);
        assert_eq!(nonces.next_nonce(e), 1);

        nonces.confirm(e, 1);
        assert_eq!(nonces.next_nonce(e), 2);
        assert!(nonces.is_stale(e, 1));

        // Late duplicate confirmation is a no-op.
        nonces.confirm(e, 1);
        assert_eq!(nonces.next_nonce(e), 2);
    }

    #[test]
    fn entities_are_isolated() {
        let nonces = EntityNonces::new();
        let a = B256::from([1u8; 32]);
        let b = B256::from([2u8; 32]);

        nonces.confirm(a, 5);
        assert_eq!(nonces.next_nonce(a), 6);
        assert_eq!(nonces.next_nonce(b), 1);
    }
}
