//! Fuzzy-hash store: near-duplicate fingerprints with expiry.
//!
//! Lives in the same pool directory and uses the same mapped-table mechanism
//! as the statfiles, with the two payload words holding metadata and the
//! expiry timestamp. Expired entries are reclaimed by a periodic sweep, not
//! on every lookup, so lookup latency stays flat.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::error::StatfileError;
use crate::statfile::{normalize_key, RawTable};

const FUZZY_MAGIC: u64 = 0x315a_5a55_4656_564d; // "MVFUZZ1"

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuzzyMeta {
    /// Caller-defined flag bits (list identity, block vs. tag).
    pub flags: u32,
    /// Caller-defined value (typically an added score, fixed-point).
    pub value: u32,
}

impl FuzzyMeta {
    fn pack(self) -> u64 {
        ((self.flags as u64) << 32) | self.value as u64
    }

    fn unpack(word: u64) -> Self {
        FuzzyMeta {
            flags: (word >> 32) as u32,
            value: word as u32,
        }
    }
}

pub struct FuzzyStore {
    table: RawTable,
    write_lock: Mutex<()>,
}

impl FuzzyStore {
    pub fn open_or_create(path: &Path, size_bytes: u64) -> Result<Self, StatfileError> {
        let table = RawTable::open_or_create(path, FUZZY_MAGIC, size_bytes)?;
        Ok(FuzzyStore {
            table,
            write_lock: Mutex::new(()),
        })
    }

    pub fn store(&self, hash: u64, meta: FuzzyMeta, ttl_secs: u64) -> Result<(), StatfileError> {
        let expire_at = unix_now().saturating_add(ttl_secs);
        let _g = self.write_lock.lock();
        self.table.with_exclusive_lock(|t| {
            let key = normalize_key(hash);
            match t.find_or_claim(key) {
                Some((off, false)) => t.write_slot(off, meta.pack(), expire_at),
                Some((off, true)) => t.insert_slot(off, key, meta.pack(), expire_at),
                None => log::warn!("fuzzy store full, dropping hash"),
            }
            t.bump_rev();
        })
    }

    /// Present and unexpired. Expired entries linger until the next sweep
    /// but are filtered here so callers never act on one.
    pub fn lookup(&self, hash: u64) -> Option<FuzzyMeta> {
        let (meta, expire_at) = self.table.lookup(normalize_key(hash))?;
        if expire_at <= unix_now() {
            return None;
        }
        Some(FuzzyMeta::unpack(meta))
    }

    /// Reclaim entries whose ttl elapsed before `now`. Returns how many
    /// were removed.
    pub fn expire_sweep(&self, now: u64) -> Result<u64, StatfileError> {
        let _g = self.write_lock.lock();
        let mut expired = 0;
        self.table.with_exclusive_lock(|t| {
            for off in t.live_slots() {
                let (_, expire_at) = t.read_slot(off);
                if expire_at <= now {
                    t.remove_slot(off);
                    expired += 1;
                }
            }
            if expired > 0 {
                t.bump_rev();
            }
        })?;
        if expired > 0 {
            log::info!("fuzzy sweep expired {expired} hashes");
        }
        Ok(expired)
    }

    pub fn len(&self) -> u64 {
        self.table.info().used
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> (tempfile::TempDir, FuzzyStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FuzzyStore::open_or_create(&dir.path().join("fuzzy.db"), 64 * 1024).unwrap();
        (dir, store)
    }

    #[test]
    fn store_and_lookup() {
        let (_dir, store) = open_store();
        let meta = FuzzyMeta {
            flags: 1,
            value: 950,
        };
        store.store(0xDEAD_BEEF, meta, 3600).unwrap();
        assert_eq!(store.lookup(0xDEAD_BEEF), Some(meta));
        assert_eq!(store.lookup(0xCAFE), None);
    }

    #[test]
    fn sweep_removes_expired_keeps_fresh() {
        let (_dir, store) = open_store();
        let meta = FuzzyMeta { flags: 0, value: 1 };
        store.store(10, meta, 0).unwrap(); // expires immediately
        store.store(20, meta, 3600).unwrap();
        assert_eq!(store.len(), 2);

        let removed = store.expire_sweep(unix_now() + 1).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.lookup(10), None);
        assert_eq!(store.lookup(20), Some(meta));
    }

    #[test]
    fn expired_entry_is_hidden_before_sweep() {
        let (_dir, store) = open_store();
        store
            .store(33, FuzzyMeta { flags: 0, value: 5 }, 0)
            .unwrap();
        // Still occupying a slot, but lookup filters it.
        assert_eq!(store.lookup(33), None);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn restore_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fuzzy.db");
        let meta = FuzzyMeta {
            flags: 2,
            value: 42,
        };
        {
            let store = FuzzyStore::open_or_create(&path, 64 * 1024).unwrap();
            store.store(777, meta, 3600).unwrap();
        }
        let store = FuzzyStore::open_or_create(&path, 64 * 1024).unwrap();
        assert_eq!(store.lookup(777), Some(meta));
    }

    #[test]
    fn slot_reuse_after_expiry() {
        let (_dir, store) = open_store();
        store
            .store(55, FuzzyMeta { flags: 0, value: 1 }, 0)
            .unwrap();
        store.expire_sweep(unix_now() + 1).unwrap();
        // Same hash can be stored again into the reclaimed slot.
        let meta = FuzzyMeta { flags: 9, value: 9 };
        store.store(55, meta, 3600).unwrap();
        assert_eq!(store.lookup(55), Some(meta));
        assert_eq!(store.len(), 1);
    }
}
