//! Shared run counters and the final report.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Counters shared by every role.
///
/// Updates are relaxed: each counter is independent and the totals are
/// only read after the run quiesces (or for a best-effort report).
#[derive(Debug, Default)]
pub struct Stats {
    sent: AtomicU64,
    stamped: AtomicU64,
    valid: AtomicU64,
    duplicates: AtomicU64,
    misses: AtomicU64,
    short_payloads: AtomicU64,
    stale_ids: AtomicU64,
    missing_stamps: AtomicU64,
    uncorrelated: AtomicU64,
    expired: AtomicU64,
    latency_nanos: AtomicI64,
}

impl Stats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A probe left the socket.
    pub fn probe_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    /// A transmit timestamp was recorded in the ledger.
    pub fn timestamp_stored(&self) {
        self.stamped.fetch_add(1, Ordering::Relaxed);
    }

    /// A reply completed a fresh round trip; folds the latency into the
    /// running sum.
    pub fn round_trip(&self, latency_nanos: i64) {
        self.valid.fetch_add(1, Ordering::Relaxed);
        self.latency_nanos.fetch_add(latency_nanos, Ordering::Relaxed);
    }

    /// A reply arrived for a slot already marked received.
    pub fn duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    /// A full result pipe swallowed a batch.
    pub fn result_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// A datagram was too short to carry a probe identifier.
    pub fn short_payload(&self) {
        self.short_payloads.fetch_add(1, Ordering::Relaxed);
    }

    /// An identifier pointed at a slot that has moved on, or fell outside
    /// the identifier space.
    pub fn stale_id(&self) {
        self.stale_ids.fetch_add(1, Ordering::Relaxed);
    }

    /// A notification arrived without a timestamp control message.
    pub fn missing_stamp(&self) {
        self.missing_stamps.fetch_add(1, Ordering::Relaxed);
    }

    /// A reply overtook its own transmit timestamp.
    pub fn uncorrelated(&self) {
        self.uncorrelated.fetch_add(1, Ordering::Relaxed);
    }

    /// A round trip exceeded the latency window.
    pub fn expired(&self) {
        self.expired.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of all counters.
    #[must_use]
    pub fn report(&self) -> Report {
        Report {
            sent: self.sent.load(Ordering::Relaxed),
            stamped: self.stamped.load(Ordering::Relaxed),
            valid: self.valid.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            short_payloads: self.short_payloads.load(Ordering::Relaxed),
            stale_ids: self.stale_ids.load(Ordering::Relaxed),
            missing_stamps: self.missing_stamps.load(Ordering::Relaxed),
            uncorrelated: self.uncorrelated.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            latency_nanos: self.latency_nanos.load(Ordering::Relaxed),
        }
    }
}

/// Final counters, frozen at shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Report {
    pub sent: u64,
    pub stamped: u64,
    pub valid: u64,
    pub duplicates: u64,
    pub misses: u64,
    pub short_payloads: u64,
    pub stale_ids: u64,
    pub missing_stamps: u64,
    pub uncorrelated: u64,
    pub expired: u64,
    /// Sum of all valid round-trip latencies.
    pub latency_nanos: i64,
}

impl Report {
    /// Mean round-trip latency in nanoseconds; `None` without valid
    /// replies.
    #[must_use]
    pub fn mean_latency_nanos(&self) -> Option<i64> {
        if self.valid == 0 {
            None
        } else {
            Some(self.latency_nanos / self.valid as i64)
        }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} packets sent", self.sent)?;
        writeln!(f, "{} timestamps stored", self.stamped)?;
        writeln!(f, "{} packets received", self.valid)?;
        writeln!(f, "{} duplicate packets", self.duplicates)?;
        writeln!(f, "{} result misses", self.misses)?;
        if let Some(mean) = self.mean_latency_nanos() {
            writeln!(
                f,
                "average round trip latency: {}.{:06} ms",
                mean / 1_000_000,
                (mean % 1_000_000).unsigned_abs()
            )?;
        }
        Ok(())
    }
}
