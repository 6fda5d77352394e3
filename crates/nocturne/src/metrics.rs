// src/metrics.rs
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Server-wide counters, updated from the reactor and the workers.
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct ServerStats {
    pub accepted: AtomicU64,
    /// Accepted and immediately closed because the table was full.
    pub rejected: AtomicU64,
    pub closed: AtomicU64,
    pub requests: AtomicU64,
    pub bad_requests: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub active_conns: AtomicUsize,
}

/// Point-in-time copy of [`ServerStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub rejected: u64,
    pub closed: u64,
    pub requests: u64,
    pub bad_requests: u64,
    pub bytes_sent: u64,
    pub active_conns: usize,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.active_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_closed(&self) {
        self.closed.fetch_add(1, Ordering::Relaxed);
        self.active_conns.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add_closed(&self, n: usize) {
        self.closed.fetch_add(n as u64, Ordering::Relaxed);
        self.active_conns.fetch_sub(n, Ordering::Relaxed);
    }

    pub fn inc_req(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_bad_req(&self) {
        self.bad_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            bad_requests: self.bad_requests.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            active_conns: self.active_conns.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = ServerStats::new();
        stats.inc_accepted();
        stats.inc_accepted();
        stats.inc_req();
        stats.inc_bad_req();
        stats.add_bytes(128);
        stats.inc_closed();
        stats.inc_rejected();

        let snap = stats.snapshot();
        assert_eq!(snap.accepted, 2);
        assert_eq!(snap.active_conns, 1);
        assert_eq!(snap.closed, 1);
        assert_eq!(snap.rejected, 1);
        assert_eq!(snap.requests, 1);
        assert_eq!(snap.bad_requests, 1);
        assert_eq!(snap.bytes_sent, 128);
    }
}
