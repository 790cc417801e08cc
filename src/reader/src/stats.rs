use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters recording how reader requests were served.
///
/// Purely diagnostic: nothing in the read path depends on these values, and
/// they are never persisted with the reader.
#[derive(Debug, Default)]
pub struct ReaderStats {
    cache_hits: AtomicU64,
    refills: AtomicU64,
    bypasses: AtomicU64,
    sequential_reads: AtomicU64,
}

impl ReaderStats {
    #[inline]
    pub(crate) fn incr_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn incr_refill(&self) {
        self.refills.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn incr_bypass(&self) {
        self.bypasses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn incr_sequential_read(&self) {
        self.sequential_reads.fetch_add(1, Ordering::Relaxed);
    }

    /// Immutable snapshot of the current counters.
    pub fn snapshot(&self) -> ReaderStatsSnapshot {
        ReaderStatsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            refills: self.refills.load(Ordering::Relaxed),
            bypasses: self.bypasses.load(Ordering::Relaxed),
            sequential_reads: self.sequential_reads.load(Ordering::Relaxed),
        }
    }
}

/// Immutable snapshot of [`ReaderStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ReaderStatsSnapshot {
    /// Requests served entirely from the cached window.
    pub cache_hits: u64,
    /// Requests that replaced the cached window via a range fetch.
    pub refills: u64,
    /// Requests streamed directly into the caller's buffer.
    pub bypasses: u64,
    /// Sequential reads from the long-lived stream.
    pub sequential_reads: u64,
}

impl fmt::Display for ReaderStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cache_hits: {}, refills: {}, bypasses: {}, sequential_reads: {}",
            self.cache_hits, self.refills, self.bypasses, self.sequential_reads
        )
    }
}
