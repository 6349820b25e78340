//! Per-vCPU dispatch state.

use axaddrspace::device::AccessWidth;

use crate::addr::{IoAddress, IoSpaceKind};
use crate::cache::DispatchCache;
use crate::status::ExecTier;

/// A write accepted in the constrained tier whose device callback still has
/// to run in the capable tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingWrite {
    /// Space the write targets.
    pub space: IoSpaceKind,
    /// Raw address inside that space.
    pub addr: u64,
    /// Access width.
    pub width: AccessWidth,
    /// Value to write.
    pub value: usize,
}

/// Dispatch state owned by one virtual CPU executor.
///
/// The executor is passed by `&mut` into every dispatch call, so its caches
/// are never shared between threads. The guest-execution loop updates the
/// tier on every transition with [`IoExecutor::enter_tier`].
#[derive(Debug)]
pub struct IoExecutor {
    id: usize,
    tier: ExecTier,
    caches: [DispatchCache; 2],
    pending_write: Option<PendingWrite>,
}

impl IoExecutor {
    /// Create the state for executor `id`, starting in `tier`.
    pub const fn new(id: usize, tier: ExecTier) -> Self {
        Self {
            id,
            tier,
            caches: [DispatchCache::new(), DispatchCache::new()],
            pending_write: None,
        }
    }

    /// The executor (vCPU) id.
    pub fn id(&self) -> usize {
        self.id
    }

    /// The tier this executor is currently running in.
    #[inline]
    pub fn current_tier(&self) -> ExecTier {
        self.tier
    }

    /// Records a tier transition.
    pub fn enter_tier(&mut self, tier: ExecTier) {
        if self.tier != tier {
            trace!("vcpu {}: {:?} -> {:?}", self.id, self.tier, tier);
        }
        self.tier = tier;
    }

    /// The dispatch cache for space `A`.
    pub fn cache<A: IoAddress>(&mut self) -> &mut DispatchCache {
        &mut self.caches[A::KIND as usize]
    }

    /// The write waiting to be committed in the capable tier, if any.
    pub fn pending_write(&self) -> Option<&PendingWrite> {
        self.pending_write.as_ref()
    }

    /// Returns `true` if a pending write must be committed before the guest
    /// resumes.
    pub fn has_pending_write(&self) -> bool {
        self.pending_write.is_some()
    }

    pub(crate) fn set_pending_write(&mut self, write: PendingWrite) -> bool {
        if self.pending_write.is_some() {
            return false;
        }
        self.pending_write = Some(write);
        true
    }

    pub(crate) fn take_pending_write(&mut self, space: IoSpaceKind) -> Option<PendingWrite> {
        match self.pending_write {
            Some(w) if w.space == space => self.pending_write.take(),
            _ => None,
        }
    }
}
