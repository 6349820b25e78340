//! Per-executor dispatch cache.
//!
//! Each executor remembers the last range it resolved for reads and,
//! separately, for writes. Entries are weak: they carry the range bounds
//! they were resolved for and a [`RangeRef`] whose generation is checked
//! against the registry on every use, so a removed range is never touched
//! even though nobody sweeps the caches on removal.

use crate::addr::IoAddress;
use crate::range::IoRange;
use crate::registry::{RangeRef, RangeRegistry};

/// Which access the entry serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AccessKind {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    /// Raw bounds the entry was resolved for; the key check.
    start: u64,
    end: u64,
    handle: RangeRef,
}

impl CacheEntry {
    fn matches(&self, raw: u64) -> bool {
        raw >= self.start && raw < self.end
    }
}

/// One-entry-per-operation-kind range cache.
#[derive(Debug, Default, Clone)]
pub struct DispatchCache {
    read: Option<CacheEntry>,
    write: Option<CacheEntry>,
}

impl DispatchCache {
    /// Create an empty cache.
    pub const fn new() -> Self {
        Self {
            read: None,
            write: None,
        }
    }

    /// Drop both entries.
    pub fn clear(&mut self) {
        self.read = None;
        self.write = None;
    }

    /// Returns `true` if neither entry is populated.
    pub fn is_empty(&self) -> bool {
        self.read.is_none() && self.write.is_none()
    }

    fn slot(&mut self, kind: AccessKind) -> &mut Option<CacheEntry> {
        match kind {
            AccessKind::Read => &mut self.read,
            AccessKind::Write => &mut self.write,
        }
    }

    /// Resolves `addr`, trying the cached entry first and falling back to
    /// [`RangeRegistry::find`]. A successful registry lookup refreshes the
    /// entry. The `bool` reports a cache hit.
    pub(crate) fn lookup_or_resolve<'r, A: IoAddress>(
        &mut self,
        kind: AccessKind,
        registry: &'r RangeRegistry<A>,
        addr: A,
    ) -> Option<(&'r IoRange<A>, bool)> {
        let raw = addr.to_raw();
        let slot = self.slot(kind);

        if let Some(entry) = *slot {
            if entry.matches(raw) {
                if let Some(range) = registry.get(entry.handle) {
                    return Some((range, true));
                }
                // Range was removed behind our back.
                *slot = None;
            }
        }

        let (handle, range) = registry.find(addr)?;
        *slot = Some(CacheEntry {
            start: range.start_raw(),
            end: range.end_raw(),
            handle,
        });
        Some((range, false))
    }
}
