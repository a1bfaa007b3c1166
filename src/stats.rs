//! Arena and pool statistics, generalized from the teacher's byte-oriented
//! `StatCount`/`StatCounter` to the segment-oriented counters this crate
//! needs.

use core::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// A running count with peak tracking, mirroring the teacher's
/// `StatCount` (`allocated`/`freed`/`peak`/`current`).
#[derive(Default)]
pub struct StatCount {
    allocated: AtomicI64,
    freed: AtomicI64,
    peak: AtomicI64,
    current: AtomicI64,
}

impl StatCount {
    fn update(&self, amount: i64) {
        if amount == 0 {
            return;
        }
        let current = self.current.fetch_add(amount, Ordering::Relaxed) + amount;
        let mut peak = self.peak.load(Ordering::Relaxed);
        while current > peak {
            match self
                .peak
                .compare_exchange_weak(peak, current, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(observed) => peak = observed,
            }
        }
        if amount > 0 {
            self.allocated.fetch_add(amount, Ordering::Relaxed);
        } else {
            self.freed.fetch_add(-amount, Ordering::Relaxed);
        }
    }

    pub fn increase(&self, amount: i64) {
        self.update(amount);
    }

    pub fn decrease(&self, amount: i64) {
        self.update(-amount);
    }

    pub fn current(&self) -> i64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn peak(&self) -> i64 {
        self.peak.load(Ordering::Relaxed)
    }
}

/// A plain monotonic counter, mirroring the teacher's `StatCounter`.
#[derive(Default)]
pub struct StatCounter {
    total: AtomicU64,
}

impl StatCounter {
    pub fn increment(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

/// Per-arena statistics, queryable via `Arena::stats`.
#[derive(Default)]
pub struct ArenaStats {
    /// Bytes currently tracked as ALLOCATED across all segments.
    pub allocated_bytes: StatCount,
    /// Bytes currently tracked as FREE across all segments.
    pub free_bytes: StatCount,
    /// Number of live segment records (SPAN + FREE + ALLOCATED).
    pub segments: StatCount,
    /// Number of `xalloc` calls that succeeded.
    pub alloc_calls: StatCounter,
    /// Number of `xalloc` calls that returned `NoSpace`.
    pub alloc_failures: StatCounter,
    /// Number of `xfree` calls.
    pub free_calls: StatCounter,
    /// Number of free-size-index buckets probed across all `xalloc` calls
    /// (cheap way to confirm instant-fit stays O(1) in tests).
    pub bucket_probes: StatCounter,
}

/// Process-global segment-pool statistics.
#[derive(Default)]
pub struct PoolStats {
    /// Number of `repopulate()` calls that reached out to the page supplier.
    pub refills: StatCounter,
    /// Number of segment records currently on loan to arenas.
    pub in_use: StatCount,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_count_tracks_peak() {
        let s = StatCount::default();
        s.increase(10);
        s.increase(5);
        s.decrease(3);
        assert_eq!(s.current(), 12);
        assert_eq!(s.peak(), 15);
    }

    #[test]
    fn stat_counter_increments() {
        let c = StatCounter::default();
        c.increment();
        c.increment();
        assert_eq!(c.get(), 2);
    }
}
