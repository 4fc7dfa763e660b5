//! Bounded, time-expiring index of outstanding challenge nonces.
//!
//! `issue` draws a fresh nonce from the OS RNG and records its insertion
//! time; `consume` atomically removes it and reports whether it was both
//! present and young enough. Removal on consume makes every nonce
//! one-shot, which is what rejects replayed attestation bundles.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::RngCore;

use auditord_types::{CHALLENGE_EXPIRY_SECS, CHALLENGE_LENGTH, MAX_PENDING_CHALLENGES};

/// Process-wide index of outstanding challenges.
pub struct ChallengeIndex {
    entries: DashMap<[u8; CHALLENGE_LENGTH], Instant>,
    expiry: Duration,
    capacity: usize,
}

impl ChallengeIndex {
    /// Index with the production expiry window and capacity.
    pub fn new() -> Self {
        Self::with_limits(Duration::from_secs(CHALLENGE_EXPIRY_SECS), MAX_PENDING_CHALLENGES)
    }

    /// Index with explicit limits. Capacity must be nonzero.
    pub fn with_limits(expiry: Duration, capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            entries: DashMap::new(),
            expiry,
            capacity,
        }
    }

    /// Draw a fresh 32-byte nonce and record it as outstanding.
    pub fn issue(&self) -> [u8; CHALLENGE_LENGTH] {
        let mut nonce = [0u8; CHALLENGE_LENGTH];
        OsRng.fill_bytes(&mut nonce);

        if self.entries.len() >= self.capacity {
            self.evict();
        }
        self.entries.insert(nonce, Instant::now());
        nonce
    }

    /// Atomically remove `nonce`, returning true iff it was outstanding
    /// and inserted within the expiry window. A second consume of the
    /// same nonce always returns false.
    pub fn consume(&self, nonce: &[u8; CHALLENGE_LENGTH]) -> bool {
        match self.entries.remove(nonce) {
            Some((_, inserted)) => inserted.elapsed() <= self.expiry,
            None => false,
        }
    }

    /// Number of outstanding nonces.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop expired entries; if nothing expired, drop the oldest entry
    /// so the index stays within its capacity under challenge floods.
    fn evict(&self) {
        let expiry = self.expiry;
        self.entries.retain(|_, inserted| inserted.elapsed() <= expiry);

        if self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|entry| *entry.value())
                .map(|entry| *entry.key());
            if let Some(key) = oldest {
                self.entries.remove(&key);
            }
        }
    }
}

impl Default for ChallengeIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_is_one_shot() {
        let index = ChallengeIndex::new();
        let nonce = index.issue();
        assert!(index.consume(&nonce));
        assert!(!index.consume(&nonce));
    }

    #[test]
    fn unknown_nonce_rejected() {
        let index = ChallengeIndex::new();
        assert!(!index.consume(&[7u8; CHALLENGE_LENGTH]));
    }

    #[test]
    fn expired_nonce_rejected_without_eviction() {
        let index = ChallengeIndex::with_limits(Duration::from_millis(10), 16);
        let nonce = index.issue();
        std::thread::sleep(Duration::from_millis(30));
        // Still resident, but past its window.
        assert_eq!(index.len(), 1);
        assert!(!index.consume(&nonce));
    }

    #[test]
    fn capacity_is_bounded() {
        let index = ChallengeIndex::with_limits(Duration::from_secs(60), 8);
        for _ in 0..100 {
            index.issue();
        }
        assert!(index.len() <= 8);
    }

    #[test]
    fn eviction_prefers_expired_entries() {
        let index = ChallengeIndex::with_limits(Duration::from_millis(5), 4);
        for _ in 0..4 {
            index.issue();
        }
        std::thread::sleep(Duration::from_millis(20));
        // All four are expired; the next issue sweeps them out.
        let fresh = index.issue();
        assert_eq!(index.len(), 1);
        assert!(index.consume(&fresh));
    }

    #[test]
    fn nonces_are_distinct() {
        let index = ChallengeIndex::new();
        let a = index.issue();
        let b = index.issue();
        assert_ne!(a, b);
    }
}
