//! The dispatch engine.
//!
//! Every operation follows the same shape: resolve the range under the
//! shared registry lock, copy out the device and user data, release the
//! lock, then call the device under its serialization lock. The registry
//! lock is never held across device code, so a callback may attach or
//! detach ranges (e.g. to remap itself).

use alloc::{sync::Arc, vec::Vec};

use axaddrspace::{GuestPhysAddr, device::{AccessWidth, Port}};
use axerrno::AxResult;
use spin::{RwLock, RwLockReadGuard};

use crate::addr::{IoAddress, all_ones, assert_width};
use crate::cache::AccessKind;
use crate::config::IoBusConfig;
use crate::device::IoDevice;
use crate::executor::{IoExecutor, PendingWrite};
use crate::gate::{IoPermissionSource, check_port_access};
use crate::range::{IoRange, RangeInfo};
use crate::registry::{RangeRef, RangeRegistry};
use crate::stats::{IoStatKind, IoStats};
use crate::status::{DispatchResult, ExecTier, GuestFaultSink, IoResult, IoStatus};

/// What dispatch needs from a resolved range, copied out of the registry.
struct Target<A: IoAddress> {
    device: Arc<IoDevice<A>>,
    user_data: usize,
}

/// Routes accesses in one address space to the devices attached to it.
pub struct IoBus<A: IoAddress> {
    config: IoBusConfig,
    registry: RwLock<RangeRegistry<A>>,
    stats: IoStats,
}

/// Port I/O bus.
pub type PortIoBus = IoBus<Port>;

/// MMIO bus.
pub type MmioBus = IoBus<GuestPhysAddr>;

impl<A: IoAddress> Default for IoBus<A> {
    fn default() -> Self {
        Self::new(IoBusConfig::default())
    }
}

impl<A: IoAddress> IoBus<A> {
    /// Create an empty bus.
    pub fn new(config: IoBusConfig) -> Self {
        Self {
            config,
            registry: RwLock::new(RangeRegistry::new()),
            stats: IoStats::new(),
        }
    }

    /// The bus configuration.
    pub fn config(&self) -> &IoBusConfig {
        &self.config
    }

    /// Dispatch counters.
    pub fn stats(&self) -> &IoStats {
        &self.stats
    }

    #[cfg(test)]
    pub(crate) fn registry_lock(&self) -> &RwLock<RangeRegistry<A>> {
        &self.registry
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Attaches `range`. Fails with `AlreadyExists` if it overlaps an
    /// attached range and `InvalidInput` if it is empty or out of space.
    ///
    /// Takes the registry lock exclusively, so it must be called from the
    /// capable tier.
    pub fn attach(&self, range: IoRange<A>) -> AxResult<RangeRef> {
        let (base, len, name) = (range.base().to_raw(), range.len(), range.name());
        match self.registry.write().register(range) {
            Ok(handle) => {
                debug!("{} {base:#x}+{len:#x} {name:?}: attached", A::SPACE);
                Ok(handle)
            }
            Err(err) => {
                warn!("{} {base:#x}+{len:#x} {name:?}: attach failed: {err}", A::SPACE);
                Err(err.into())
            }
        }
    }

    /// Detaches the range starting exactly at `base` and returns it.
    ///
    /// Once this returns no dispatch from any executor can reach the range:
    /// cached handles to it fail their generation check.
    pub fn detach(&self, base: A) -> AxResult<IoRange<A>> {
        let removed = self.registry.write().deregister(base);
        match removed {
            Ok(range) => {
                debug!("detached {range:?}");
                Ok(range)
            }
            Err(err) => {
                warn!("failed to detach {} {:#x}: {err}", A::SPACE, base.to_raw());
                Err(err.into())
            }
        }
    }

    /// Detaches every range served by `device` (hot-unplug). Returns how
    /// many ranges were removed.
    pub fn detach_device(&self, device: &Arc<IoDevice<A>>) -> usize {
        let mut registry = self.registry.write();
        let bases: Vec<A> = registry
            .iter()
            .filter(|r| Arc::ptr_eq(r.device(), device))
            .map(|r| r.base())
            .collect();
        for &base in &bases {
            match registry.deregister(base) {
                Ok(range) => debug!("detached {range:?}"),
                Err(err) => warn!("failed to detach {} {:#x}: {err}", A::SPACE, base.to_raw()),
            }
        }
        bases.len()
    }

    /// Snapshot of all attached ranges in ascending address order.
    pub fn ranges(&self) -> Vec<RangeInfo<A>> {
        self.registry.read().iter().map(RangeInfo::from).collect()
    }

    /// The range containing `addr`, if any. Bypasses executor caches.
    pub fn lookup(&self, addr: A) -> Option<RangeInfo<A>> {
        self.registry
            .read()
            .find(addr)
            .map(|(_, range)| RangeInfo::from(range))
    }

    // ========================================================================
    // Resolution
    // ========================================================================

    /// The constrained tier must not block, so it only tries the lock.
    fn lock_registry(&self, tier: ExecTier) -> Option<RwLockReadGuard<'_, RangeRegistry<A>>> {
        match tier {
            ExecTier::Constrained => self.registry.try_read(),
            ExecTier::Capable => Some(self.registry.read()),
        }
    }

    /// Resolves `addr` to a dispatch target. Never calls device code.
    fn resolve(&self, exec: &mut IoExecutor, kind: AccessKind, addr: A) -> DispatchResult<Target<A>> {
        let tier = exec.current_tier();

        // A queued write must reach its device before anything that follows.
        if tier.is_constrained() && exec.has_pending_write() {
            return DispatchResult::DeferToCapableTier;
        }

        let Some(registry) = self.lock_registry(tier) else {
            trace!("{} {:#x}: registry contended", A::SPACE, addr.to_raw());
            return DispatchResult::DeferToCapableTier;
        };

        let found = if self.config.dispatch_cache {
            exec.cache::<A>().lookup_or_resolve(kind, &registry, addr)
        } else {
            registry.find(addr).map(|(_, range)| (range, false))
        };
        let Some((range, hit)) = found else {
            return DispatchResult::Unhandled;
        };
        self.stats.bump(if hit {
            IoStatKind::CacheHit
        } else {
            IoStatKind::CacheMiss
        });

        if tier.is_constrained() && !range.valid_in_constrained_tier() {
            return DispatchResult::DeferToCapableTier;
        }

        DispatchResult::Success(Target {
            device: range.device().clone(),
            user_data: range.user_data(),
        })
    }

    fn note_unknown(&self, op: &str, addr: A, size: usize) {
        if self.config.trace_unknown {
            warn!("{} {op} of unclaimed {:#x}/{size}", A::SPACE, addr.to_raw());
        }
    }

    /// Counts a deferral or fault; other outcomes are counted by the caller.
    fn note_exit<T>(&self, res: &DispatchResult<T>, addr: A) {
        match res {
            DispatchResult::DeferToCapableTier => {
                self.stats.bump(IoStatKind::Deferred);
                debug!("{} {:#x}: deferred to capable tier", A::SPACE, addr.to_raw());
            }
            DispatchResult::Fault(fault) => {
                self.stats.bump(IoStatKind::Fault);
                debug!("{} {:#x}: guest fault {fault:?}", A::SPACE, addr.to_raw());
            }
            _ => {}
        }
    }

    // ========================================================================
    // Scalar Dispatch
    // ========================================================================

    /// Reads `width` bytes at `addr`.
    ///
    /// An address nothing answers for reads as all ones (`0xFF`, `0xFFFF`,
    /// `0xFFFF_FFFF`, ...), whether no range is attached or the device
    /// reports the sub-address unused.
    pub fn read(&self, exec: &mut IoExecutor, addr: A, width: AccessWidth) -> DispatchResult<usize> {
        let size = assert_width::<A>(width);
        let flushed = self.flush_pending_write(exec);
        if !flushed.is_success() {
            return flushed.map(|_| 0);
        }
        let tier = exec.current_tier();

        let res = match self.resolve(exec, AccessKind::Read, addr) {
            DispatchResult::Success(target) => match target.device.serialize(tier) {
                Some(_serial) => {
                    let res = target.device.ops().handle_in(target.user_data, addr, width);
                    target.device.stats().add_reads(1);
                    DispatchResult::from(res)
                }
                None => DispatchResult::DeferToCapableTier,
            },
            other => other.map(|_| 0),
        };

        match res {
            DispatchResult::Success(val) => {
                self.stats.bump(IoStatKind::Read);
                DispatchResult::Success(val)
            }
            DispatchResult::Unhandled => {
                self.stats.bump(IoStatKind::UnhandledRead);
                self.note_unknown("read", addr, size);
                DispatchResult::Success(all_ones(size))
            }
            exit => {
                self.note_exit(&exit, addr);
                exit
            }
        }
    }

    /// Writes `width` bytes of `val` at `addr`. Writes nothing answers for
    /// are dropped.
    ///
    /// With [`IoBusConfig::commit_deferred_writes`] a write that would defer
    /// in the constrained tier is queued on the executor instead and
    /// reported as done; see [`IoBus::commit_pending_write`].
    pub fn write(&self, exec: &mut IoExecutor, addr: A, width: AccessWidth, val: usize) -> DispatchResult {
        let size = assert_width::<A>(width);
        let flushed = self.flush_pending_write(exec);
        if !flushed.is_success() {
            return flushed;
        }
        let tier = exec.current_tier();

        let res = match self.resolve(exec, AccessKind::Write, addr) {
            DispatchResult::Success(target) => match target.device.serialize(tier) {
                Some(_serial) => {
                    let res = target.device.ops().handle_out(target.user_data, addr, width, val);
                    target.device.stats().add_writes(1);
                    DispatchResult::from(res)
                }
                None => DispatchResult::DeferToCapableTier,
            },
            other => other.map(|_| ()),
        };

        match res {
            DispatchResult::Success(()) => {
                self.stats.bump(IoStatKind::Write);
                DispatchResult::Success(())
            }
            DispatchResult::Unhandled => {
                self.stats.bump(IoStatKind::UnhandledWrite);
                self.note_unknown("write", addr, size);
                DispatchResult::Success(())
            }
            DispatchResult::DeferToCapableTier
                if tier.is_constrained()
                    && self.config.commit_deferred_writes
                    && exec.set_pending_write(PendingWrite {
                        space: A::KIND,
                        addr: addr.to_raw(),
                        width,
                        value: val,
                    }) =>
            {
                self.stats.bump(IoStatKind::WriteQueued);
                trace!("{} {:#x}: write queued for commit", A::SPACE, addr.to_raw());
                DispatchResult::Success(())
            }
            exit => {
                self.note_exit(&exit, addr);
                exit
            }
        }
    }

    /// Performs the write queued on `exec` for this address space, if any.
    ///
    /// Must run in the capable tier before the guest resumes; in the
    /// constrained tier the write stays queued and this defers. Every
    /// capable-tier dispatch on this bus commits it first as well, so a
    /// replayed access never overtakes it.
    pub fn commit_pending_write(&self, exec: &mut IoExecutor) -> DispatchResult {
        if exec.current_tier().is_constrained() {
            return match exec.pending_write() {
                Some(w) if w.space == A::KIND => DispatchResult::DeferToCapableTier,
                _ => DispatchResult::Success(()),
            };
        }
        let Some(w) = exec.take_pending_write(A::KIND) else {
            return DispatchResult::Success(());
        };
        let res = self.write(exec, A::from_raw(w.addr), w.width, w.value);
        match res {
            DispatchResult::Success(()) => self.stats.bump(IoStatKind::WriteCommitted),
            // Still owed to the device.
            DispatchResult::DeferToCapableTier => {
                exec.set_pending_write(w);
            }
            _ => {}
        }
        res
    }

    /// Commits a queued write for this space ahead of a capable-tier
    /// dispatch. Anything but `Success` must be returned to the caller.
    fn flush_pending_write(&self, exec: &mut IoExecutor) -> DispatchResult {
        match exec.pending_write() {
            Some(w) if !exec.current_tier().is_constrained() && w.space == A::KIND => {
                self.commit_pending_write(exec)
            }
            _ => DispatchResult::Success(()),
        }
    }

    // ========================================================================
    // String Dispatch
    // ========================================================================

    /// Reads `count` units of `width` bytes from `addr` into `buf`.
    ///
    /// Returns the outcome and the number of units *not* transferred. The
    /// transferred units always occupy the leading slots of `buf`, so a
    /// deferred transfer resumes at unit `count - remaining`.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than `count * width`.
    pub fn read_string(
        &self,
        exec: &mut IoExecutor,
        addr: A,
        width: AccessWidth,
        buf: &mut [u8],
        count: usize,
    ) -> (DispatchResult, usize) {
        let size = assert_width::<A>(width);
        let buf = string_window(buf, count, size);
        if count == 0 {
            return (DispatchResult::Success(()), 0);
        }
        let flushed = self.flush_pending_write(exec);
        if !flushed.is_success() {
            return (flushed, count);
        }
        let tier = exec.current_tier();

        let (res, remaining) = match self.resolve(exec, AccessKind::Read, addr) {
            DispatchResult::Success(target) => match target.device.serialize(tier) {
                Some(_serial) => {
                    let (res, remaining) = read_units(&target, addr, width, buf, count);
                    target.device.stats().add_reads((count - remaining) as u64);
                    (res, remaining)
                }
                None => (DispatchResult::DeferToCapableTier, count),
            },
            other => (other.map(|_| ()), count),
        };

        match res {
            DispatchResult::Unhandled => {
                self.stats.bump(IoStatKind::UnhandledRead);
                self.note_unknown("string read", addr, size);
                buf.fill(0xFF);
                (DispatchResult::Success(()), 0)
            }
            DispatchResult::Success(()) => {
                self.stats.bump(IoStatKind::StringRead);
                (res, remaining)
            }
            exit => {
                self.note_exit(&exit, addr);
                (exit, remaining)
            }
        }
    }

    /// Writes `count` units of `width` bytes from `buf` to `addr`; the
    /// counterpart of [`IoBus::read_string`].
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than `count * width`.
    pub fn write_string(
        &self,
        exec: &mut IoExecutor,
        addr: A,
        width: AccessWidth,
        buf: &[u8],
        count: usize,
    ) -> (DispatchResult, usize) {
        let size = assert_width::<A>(width);
        assert!(buf.len() >= count * size, "string buffer too short");
        let buf = &buf[..count * size];
        if count == 0 {
            return (DispatchResult::Success(()), 0);
        }
        let flushed = self.flush_pending_write(exec);
        if !flushed.is_success() {
            return (flushed, count);
        }
        let tier = exec.current_tier();

        let (res, remaining) = match self.resolve(exec, AccessKind::Write, addr) {
            DispatchResult::Success(target) => match target.device.serialize(tier) {
                Some(_serial) => {
                    let (res, remaining) = write_units(&target, addr, width, buf, count);
                    target.device.stats().add_writes((count - remaining) as u64);
                    (res, remaining)
                }
                None => (DispatchResult::DeferToCapableTier, count),
            },
            other => (other.map(|_| ()), count),
        };

        match res {
            DispatchResult::Unhandled => {
                self.stats.bump(IoStatKind::UnhandledWrite);
                self.note_unknown("string write", addr, size);
                (DispatchResult::Success(()), 0)
            }
            DispatchResult::Success(()) => {
                self.stats.bump(IoStatKind::StringWrite);
                (res, remaining)
            }
            exit => {
                self.note_exit(&exit, addr);
                (exit, remaining)
            }
        }
    }
}

/// The first `count` units of `buf`.
fn string_window(buf: &mut [u8], count: usize, size: usize) -> &mut [u8] {
    assert!(buf.len() >= count * size, "string buffer too short");
    &mut buf[..count * size]
}

/// Runs a string read against a device whose serialization lock is held:
/// the bulk callback first, then one scalar callback per remaining unit.
fn read_units<A: IoAddress>(
    target: &Target<A>,
    addr: A,
    width: AccessWidth,
    buf: &mut [u8],
    count: usize,
) -> (DispatchResult, usize) {
    let size = width.size();
    let ops = target.device.ops();

    let mut remaining = count;
    let mut status: IoResult = ops.handle_in_string(target.user_data, addr, buf, &mut remaining, width);
    remaining = remaining.min(count);

    while status.is_ok() && remaining > 0 {
        let done = count - remaining;
        let unit = &mut buf[done * size..(done + 1) * size];
        match ops.handle_in(target.user_data, addr, width) {
            Ok(val) => unit.copy_from_slice(&val.to_le_bytes()[..size]),
            Err(IoStatus::Unused) => unit.fill(0xFF),
            Err(err) => {
                status = Err(err);
                break;
            }
        }
        remaining -= 1;
    }

    match status {
        // The device has nothing here: the rest reads as all ones.
        Err(IoStatus::Unused) => {
            buf[(count - remaining) * size..].fill(0xFF);
            (DispatchResult::Success(()), 0)
        }
        other => (other.into(), remaining),
    }
}

/// Write-side counterpart of [`read_units`].
fn write_units<A: IoAddress>(
    target: &Target<A>,
    addr: A,
    width: AccessWidth,
    buf: &[u8],
    count: usize,
) -> (DispatchResult, usize) {
    let size = width.size();
    let ops = target.device.ops();

    let mut remaining = count;
    let mut status: IoResult = ops.handle_out_string(target.user_data, addr, buf, &mut remaining, width);
    remaining = remaining.min(count);

    while status.is_ok() && remaining > 0 {
        let done = count - remaining;
        let mut bytes = [0u8; core::mem::size_of::<usize>()];
        bytes[..size].copy_from_slice(&buf[done * size..(done + 1) * size]);
        match ops.handle_out(target.user_data, addr, width, usize::from_le_bytes(bytes)) {
            Ok(()) | Err(IoStatus::Unused) => {}
            Err(err) => {
                status = Err(err);
                break;
            }
        }
        remaining -= 1;
    }

    match status {
        Err(IoStatus::Unused) => (DispatchResult::Success(()), 0),
        other => (other.into(), remaining),
    }
}

// ============================================================================
// Guest-Facing Port I/O
// ============================================================================

impl IoBus<Port> {
    /// Emulates `IN`: privilege gate, dispatch, and fault delivery.
    pub fn emulate_in<P, S>(
        &self,
        exec: &mut IoExecutor,
        perm: &P,
        sink: &mut S,
        port: Port,
        width: AccessWidth,
    ) -> DispatchResult<usize>
    where
        P: IoPermissionSource + ?Sized,
        S: GuestFaultSink + ?Sized,
    {
        match check_port_access(perm, port, width) {
            DispatchResult::Success(()) => self.read(exec, port, width).inject_fault(sink),
            denied => self.gate_exit(denied, port).map(|_| 0).inject_fault(sink),
        }
    }

    /// Emulates `OUT`.
    pub fn emulate_out<P, S>(
        &self,
        exec: &mut IoExecutor,
        perm: &P,
        sink: &mut S,
        port: Port,
        width: AccessWidth,
        val: usize,
    ) -> DispatchResult
    where
        P: IoPermissionSource + ?Sized,
        S: GuestFaultSink + ?Sized,
    {
        match check_port_access(perm, port, width) {
            DispatchResult::Success(()) => self.write(exec, port, width, val).inject_fault(sink),
            denied => self.gate_exit(denied, port).inject_fault(sink),
        }
    }

    /// Emulates `INS`, returning the number of units not yet transferred.
    pub fn emulate_ins<P, S>(
        &self,
        exec: &mut IoExecutor,
        perm: &P,
        sink: &mut S,
        port: Port,
        width: AccessWidth,
        buf: &mut [u8],
        count: usize,
    ) -> (DispatchResult, usize)
    where
        P: IoPermissionSource + ?Sized,
        S: GuestFaultSink + ?Sized,
    {
        match check_port_access(perm, port, width) {
            DispatchResult::Success(()) => {
                let (res, remaining) = self.read_string(exec, port, width, buf, count);
                (res.inject_fault(sink), remaining)
            }
            denied => (self.gate_exit(denied, port).inject_fault(sink), count),
        }
    }

    /// Emulates `OUTS`, returning the number of units not yet transferred.
    pub fn emulate_outs<P, S>(
        &self,
        exec: &mut IoExecutor,
        perm: &P,
        sink: &mut S,
        port: Port,
        width: AccessWidth,
        buf: &[u8],
        count: usize,
    ) -> (DispatchResult, usize)
    where
        P: IoPermissionSource + ?Sized,
        S: GuestFaultSink + ?Sized,
    {
        match check_port_access(perm, port, width) {
            DispatchResult::Success(()) => {
                let (res, remaining) = self.write_string(exec, port, width, buf, count);
                (res.inject_fault(sink), remaining)
            }
            denied => (self.gate_exit(denied, port).inject_fault(sink), count),
        }
    }

    fn gate_exit(&self, res: DispatchResult, port: Port) -> DispatchResult {
        self.note_exit(&res, port);
        res
    }
}
