//! Process-wide scan statistics, shared by every worker. Plain atomic
//! increments so workers never contend; the controller's `stat` command
//! reads a snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ServerStats {
    pub messages_scanned: AtomicU64,
    pub messages_spam: AtomicU64,
    pub messages_ham: AtomicU64,
    pub connections_count: AtomicU64,
    pub control_connections_count: AtomicU64,
    pub messages_learned: AtomicU64,
    pub fuzzy_hashes: AtomicU64,
    pub fuzzy_hashes_expired: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub messages_scanned: u64,
    pub messages_spam: u64,
    pub messages_ham: u64,
    pub connections_count: u64,
    pub control_connections_count: u64,
    pub messages_learned: u64,
    pub fuzzy_hashes: u64,
    pub fuzzy_hashes_expired: u64,
}

impl ServerStats {
    pub fn new() -> Self {
        ServerStats::default()
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            messages_scanned: self.messages_scanned.load(Ordering::Relaxed),
            messages_spam: self.messages_spam.load(Ordering::Relaxed),
            messages_ham: self.messages_ham.load(Ordering::Relaxed),
            connections_count: self.connections_count.load(Ordering::Relaxed),
            control_connections_count: self.control_connections_count.load(Ordering::Relaxed),
            messages_learned: self.messages_learned.load(Ordering::Relaxed),
            fuzzy_hashes: self.fuzzy_hashes.load(Ordering::Relaxed),
            fuzzy_hashes_expired: self.fuzzy_hashes_expired.load(Ordering::Relaxed),
        }
    }
}
