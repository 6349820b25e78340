//! Dispatch outcome counters.

use core::sync::atomic::{AtomicU64, Ordering};

/// Outcome categories, each counted once per dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatKind {
    /// A scalar read reached a device.
    Read,
    /// A scalar write reached a device.
    Write,
    /// A string read completed (fully or partially).
    StringRead,
    /// A string write completed (fully or partially).
    StringWrite,
    /// A read was filled with all ones.
    UnhandledRead,
    /// A write was discarded.
    UnhandledWrite,
    /// The operation was deferred to the capable tier.
    Deferred,
    /// The operation raised a guest fault.
    Fault,
    /// The range was found in the executor's cache.
    CacheHit,
    /// The range needed a registry lookup.
    CacheMiss,
    /// A write was accepted in the constrained tier for later commit.
    WriteQueued,
    /// A queued write was committed in the capable tier.
    WriteCommitted,
}

const NR_KINDS: usize = 12;

/// Plain copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoStatsSnapshot {
    /// Completed scalar reads.
    pub reads: u64,
    /// Completed scalar writes.
    pub writes: u64,
    /// Completed string reads.
    pub string_reads: u64,
    /// Completed string writes.
    pub string_writes: u64,
    /// Reads nothing answered for.
    pub unhandled_reads: u64,
    /// Writes nothing answered for.
    pub unhandled_writes: u64,
    /// Operations sent back to the capable tier.
    pub deferred: u64,
    /// Operations that raised a guest fault.
    pub faults: u64,
    /// Ranges found in an executor cache.
    pub cache_hits: u64,
    /// Ranges resolved through the registry.
    pub cache_misses: u64,
    /// Constrained-tier writes queued for commit.
    pub writes_queued: u64,
    /// Queued writes committed in the capable tier.
    pub writes_committed: u64,
}

/// Lock-free counters shared by every executor of a bus.
///
/// Counting never affects dispatch; all updates are relaxed.
#[derive(Debug, Default)]
pub struct IoStats {
    counters: [AtomicU64; NR_KINDS],
}

impl IoStats {
    /// Create zeroed counters.
    pub const fn new() -> Self {
        Self {
            counters: [const { AtomicU64::new(0) }; NR_KINDS],
        }
    }

    #[inline]
    pub(crate) fn bump(&self, kind: IoStatKind) {
        self.counters[kind as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Current value of one counter.
    pub fn get(&self, kind: IoStatKind) -> u64 {
        self.counters[kind as usize].load(Ordering::Relaxed)
    }

    /// Reads every counter.
    pub fn snapshot(&self) -> IoStatsSnapshot {
        IoStatsSnapshot {
            reads: self.get(IoStatKind::Read),
            writes: self.get(IoStatKind::Write),
            string_reads: self.get(IoStatKind::StringRead),
            string_writes: self.get(IoStatKind::StringWrite),
            unhandled_reads: self.get(IoStatKind::UnhandledRead),
            unhandled_writes: self.get(IoStatKind::UnhandledWrite),
            deferred: self.get(IoStatKind::Deferred),
            faults: self.get(IoStatKind::Fault),
            cache_hits: self.get(IoStatKind::CacheHit),
            cache_misses: self.get(IoStatKind::CacheMiss),
            writes_queued: self.get(IoStatKind::WriteQueued),
            writes_committed: self.get(IoStatKind::WriteCommitted),
        }
    }

    /// Zero every counter.
    pub fn reset(&self) {
        for c in &self.counters {
            c.store(0, Ordering::Relaxed);
        }
    }
}
