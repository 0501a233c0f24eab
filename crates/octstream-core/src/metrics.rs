//! Server-wide streaming metrics.
//!
//! The core only writes to a [`StreamMetrics`] sink. [`StreamCounters`] is the
//! bundled implementation: lock-free counters plus a coarse latency histogram
//! per phase, read out with [`StreamCounters::snapshot_and_reset`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Timed stages of one distributor cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Waiting for the tree read lock.
    LockWait,
    /// Inside the tree encoder.
    Encode,
    /// Finalizing the assembler and writing into the outbound packet.
    CompressAndWrite,
    /// Handing packets to the transport.
    PacketSend,
    /// One iteration of the packing loop.
    Inside,
    /// The whole packing loop.
    Loop,
}

impl Phase {
    pub const COUNT: usize = 6;

    pub const ALL: [Phase; Self::COUNT] = [
        Phase::LockWait,
        Phase::Encode,
        Phase::CompressAndWrite,
        Phase::PacketSend,
        Phase::Inside,
        Phase::Loop,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Write-only metrics sink injected into every distributor.
pub trait StreamMetrics: Send + Sync {
    /// One wire unit went out.
    fn record_packet_sent(&self, bytes: usize, wasted_bytes: usize);

    /// A phase took `elapsed`.
    fn record_phase(&self, phase: Phase, elapsed: Duration);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl StreamMetrics for NoopMetrics {
    fn record_packet_sent(&self, _bytes: usize, _wasted_bytes: usize) {}

    fn record_phase(&self, _phase: Phase, _elapsed: Duration) {}
}

// ---------------------------------------------------------------------------
// PhaseHistogram
// ---------------------------------------------------------------------------

/// Upper bounds of the histogram buckets in microseconds. The last bucket is
/// open-ended.
pub const BUCKET_BOUNDS_USECS: [u64; 5] = [10, 100, 1_000, 10_000, 100_000];

const BUCKETS: usize = BUCKET_BOUNDS_USECS.len() + 1;

struct PhaseHistogram {
    count: AtomicU64,
    total_usecs: AtomicU64,
    max_usecs: AtomicU64,
    buckets: [AtomicU64; BUCKETS],
}

impl PhaseHistogram {
    fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            total_usecs: AtomicU64::new(0),
            max_usecs: AtomicU64::new(0),
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    fn record(&self, usecs: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_usecs.fetch_add(usecs, Ordering::Relaxed);
        self.max_usecs.fetch_max(usecs, Ordering::Relaxed);
        let bucket = BUCKET_BOUNDS_USECS
            .iter()
            .position(|&bound| usecs < bound)
            .unwrap_or(BUCKETS - 1);
        self.buckets[bucket].fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot_and_reset(&self) -> PhaseSnapshot {
        PhaseSnapshot {
            count: self.count.swap(0, Ordering::Relaxed),
            total_usecs: self.total_usecs.swap(0, Ordering::Relaxed),
            max_usecs: self.max_usecs.swap(0, Ordering::Relaxed),
            buckets: std::array::from_fn(|i| self.buckets[i].swap(0, Ordering::Relaxed)),
        }
    }
}

/// One phase's timings over a measurement period.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseSnapshot {
    pub count: u64,
    pub total_usecs: u64,
    pub max_usecs: u64,
    /// Sample counts per bucket of [`BUCKET_BOUNDS_USECS`].
    pub buckets: [u64; BUCKETS],
}

impl PhaseSnapshot {
    /// Mean duration in microseconds, 0 when nothing was recorded.
    pub fn average_usecs(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.total_usecs as f64 / self.count as f64
    }
}

// ---------------------------------------------------------------------------
// StreamCounters
// ---------------------------------------------------------------------------

/// Live counters shared by every worker on the server.
pub struct StreamCounters {
    pub bytes_sent: AtomicU64,
    pub packets_sent: AtomicU64,
    /// Unused space in uncompressed packets.
    pub wasted_bytes: AtomicU64,
    phases: [PhaseHistogram; Phase::COUNT],
}

impl StreamCounters {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self {
            bytes_sent: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            wasted_bytes: AtomicU64::new(0),
            phases: std::array::from_fn(|_| PhaseHistogram::new()),
        }
    }

    /// Snapshot and reset all counters (swap with 0).
    pub fn snapshot_and_reset(&self) -> CountersSnapshot {
        CountersSnapshot {
            bytes_sent: self.bytes_sent.swap(0, Ordering::Relaxed),
            packets_sent: self.packets_sent.swap(0, Ordering::Relaxed),
            wasted_bytes: self.wasted_bytes.swap(0, Ordering::Relaxed),
            phases: std::array::from_fn(|i| self.phases[i].snapshot_and_reset()),
        }
    }
}

impl Default for StreamCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamMetrics for StreamCounters {
    fn record_packet_sent(&self, bytes: usize, wasted_bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.wasted_bytes
            .fetch_add(wasted_bytes as u64, Ordering::Relaxed);
    }

    fn record_phase(&self, phase: Phase, elapsed: Duration) {
        self.phases[phase.index()].record(elapsed.as_micros() as u64);
    }
}

/// Point-in-time copy of [`StreamCounters`].
#[derive(Debug, Clone, Default)]
pub struct CountersSnapshot {
    pub bytes_sent: u64,
    pub packets_sent: u64,
    pub wasted_bytes: u64,
    phases: [PhaseSnapshot; Phase::COUNT],
}

impl CountersSnapshot {
    pub fn phase(&self, phase: Phase) -> &PhaseSnapshot {
        &self.phases[phase.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_counters_snapshot_and_reset() {
        let counters = StreamCounters::new();
        counters.record_packet_sent(1000, 450);
        counters.record_packet_sent(200, 0);

        let snapshot = counters.snapshot_and_reset();
        assert_eq!(snapshot.bytes_sent, 1200);
        assert_eq!(snapshot.packets_sent, 2);
        assert_eq!(snapshot.wasted_bytes, 450);

        let empty = counters.snapshot_and_reset();
        assert_eq!(empty.packets_sent, 0);
    }

    #[test]
    fn test_phase_histogram_buckets() {
        let counters = StreamCounters::new();
        counters.record_phase(Phase::Encode, Duration::from_micros(5));
        counters.record_phase(Phase::Encode, Duration::from_micros(50));
        counters.record_phase(Phase::Encode, Duration::from_millis(500));
        counters.record_phase(Phase::LockWait, Duration::from_micros(1));

        let snapshot = counters.snapshot_and_reset();
        let encode = snapshot.phase(Phase::Encode);
        assert_eq!(encode.count, 3);
        assert_eq!(encode.max_usecs, 500_000);
        assert_eq!(encode.buckets, [1, 1, 0, 0, 0, 1]);
        assert_eq!(snapshot.phase(Phase::LockWait).count, 1);
        assert_eq!(snapshot.phase(Phase::PacketSend).count, 0);
        assert_eq!(snapshot.phase(Phase::PacketSend).average_usecs(), 0.0);
    }

    #[test]
    fn test_phase_average() {
        let counters = StreamCounters::new();
        counters.record_phase(Phase::Inside, Duration::from_micros(10));
        counters.record_phase(Phase::Inside, Duration::from_micros(30));
        let snapshot = counters.snapshot_and_reset();
        assert_eq!(snapshot.phase(Phase::Inside).average_usecs(), 20.0);
    }
}
