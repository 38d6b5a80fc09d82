// Key-epoch manager: per-epoch key derivation, frame counters, switch guard.
// Numan Thabit 2025

use ahash::AHashMap;
use hkdf::Hkdf;
use sha2::Sha256;

use super::aead::{MleKey, KEY_LEN};
use crate::types::Millis;

/// Info label for deriving per-epoch envelope keys.
pub const INFO_MLE_KEY: &[u8] = b"numimesh/mle-key";

/// After adopting a new epoch, further peer-driven adoption is refused for
/// this long. Authoritative adoption bypasses the guard.
pub const KEY_SWITCH_GUARD: Millis = 624 * 60 * 60 * 1000;

const TEMP_KEY_CACHE_MAX: usize = 4;

/// Holds the network master key and tracks the current key epoch.
///
/// Keys for epochs other than the current one are derived on demand and kept
/// in a small cache; they exist only to decrypt traffic during epoch
/// transition windows.
pub struct KeyManager {
    master_key: [u8; KEY_LEN],
    current_epoch: u32,
    current_key: MleKey,
    temp_keys: AHashMap<u32, MleKey>,
    frame_counter: u32,
    guard_until: Option<Millis>,
}

impl KeyManager {
    pub fn new(master_key: [u8; KEY_LEN], epoch: u32) -> Self {
        let current_key = derive_key(&master_key, epoch);
        Self {
            master_key,
            current_epoch: epoch,
            current_key,
            temp_keys: AHashMap::new(),
            frame_counter: 0,
            guard_until: None,
        }
    }

    pub fn current_epoch(&self) -> u32 {
        self.current_epoch
    }

    pub fn current_key(&self) -> &MleKey {
        &self.current_key
    }

    /// Returns the key for `epoch`, deriving a temporary key when it is not
    /// the current one.
    pub fn key_for_epoch(&mut self, epoch: u32) -> MleKey {
        if epoch == self.current_epoch {
            return self.current_key.clone();
        }
        if let Some(key) = self.temp_keys.get(&epoch) {
            return key.clone();
        }
        let key = derive_key(&self.master_key, epoch);
        if self.temp_keys.len() >= TEMP_KEY_CACHE_MAX {
            self.temp_keys.clear();
        }
        self.temp_keys.insert(epoch, key.clone());
        key
    }

    /// Peer-driven epoch adoption. Refused while the switch guard is active
    /// or when `epoch` does not move forward.
    pub fn adopt_epoch(&mut self, epoch: u32, now: Millis) -> bool {
        if epoch <= self.current_epoch {
            return false;
        }
        if matches!(self.guard_until, Some(until) if now < until) {
            return false;
        }
        self.switch_to(epoch, now);
        true
    }

    /// Authoritative epoch adoption: bypasses the switch guard.
    pub fn force_epoch(&mut self, epoch: u32, now: Millis) {
        if epoch > self.current_epoch {
            self.switch_to(epoch, now);
        }
    }

    fn switch_to(&mut self, epoch: u32, now: Millis) {
        self.current_epoch = epoch;
        self.current_key = derive_key(&self.master_key, epoch);
        self.temp_keys.clear();
        self.frame_counter = 0;
        self.guard_until = Some(now.saturating_add(KEY_SWITCH_GUARD));
    }

    /// Returns the counter to stamp on the next outbound message and
    /// advances it.
    pub fn next_frame_counter(&mut self) -> u32 {
        let counter = self.frame_counter;
        self.frame_counter = self.frame_counter.wrapping_add(1);
        counter
    }

    pub fn frame_counter(&self) -> u32 {
        self.frame_counter
    }

    /// Restores a persisted counter (already margin-adjusted by the caller).
    pub fn set_frame_counter(&mut self, counter: u32) {
        self.frame_counter = counter;
    }
}

fn derive_key(master_key: &[u8; KEY_LEN], epoch: u32) -> MleKey {
    let hk = Hkdf::<Sha256>::new(Some(&epoch.to_be_bytes()), master_key);
    let mut okm = [0u8; KEY_LEN];
    // 16 bytes always fits the HKDF output bound.
    hk.expand(INFO_MLE_KEY, &mut okm)
        .unwrap_or_else(|_| unreachable!("hkdf output length"));
    MleKey(okm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_keys_are_deterministic_and_distinct() {
        let mut mgr = KeyManager::new([0x55; KEY_LEN], 10);
        let k10 = mgr.key_for_epoch(10);
        let k11 = mgr.key_for_epoch(11);
        assert_eq!(k10, *KeyManager::new([0x55; KEY_LEN], 10).current_key());
        assert_ne!(k10, k11);
        assert_eq!(k11, mgr.key_for_epoch(11));
    }

    #[test]
    fn adoption_moves_forward_only() {
        let mut mgr = KeyManager::new([1; KEY_LEN], 5);
        assert!(!mgr.adopt_epoch(5, 0));
        assert!(!mgr.adopt_epoch(4, 0));
        assert!(mgr.adopt_epoch(6, 0));
        assert_eq!(mgr.current_epoch(), 6);
    }

    #[test]
    fn switch_guard_blocks_peer_adoption_but_not_force() {
        let mut mgr = KeyManager::new([1; KEY_LEN], 5);
        assert!(mgr.adopt_epoch(6, 1_000));
        assert!(!mgr.adopt_epoch(7, 2_000));
        mgr.force_epoch(7, 2_000);
        assert_eq!(mgr.current_epoch(), 7);
        assert!(mgr.adopt_epoch(8, 2_000 + KEY_SWITCH_GUARD));
    }

    #[test]
    fn epoch_switch_resets_frame_counter() {
        let mut mgr = KeyManager::new([1; KEY_LEN], 5);
        assert_eq!(mgr.next_frame_counter(), 0);
        assert_eq!(mgr.next_frame_counter(), 1);
        assert!(mgr.adopt_epoch(6, 0));
        assert_eq!(mgr.next_frame_counter(), 0);
    }
}
