//! The device callback ABI and the per-device record.

use alloc::{string::String, sync::Arc};
use core::sync::atomic::{AtomicU64, Ordering};

use axaddrspace::device::AccessWidth;
use spin::{Mutex, MutexGuard};

use crate::addr::IoAddress;
use crate::status::{ExecTier, IoResult};

/// [`IoDeviceOps`] is the trait that every emulated device behind the
/// dispatch engine implements.
///
/// # Thread Safety
///
/// The engine wraps each device in an [`IoDevice`] whose serialization lock
/// is held for the duration of every callback, so at most one callback per
/// device runs at a time no matter how many vCPUs dispatch into it.
///
/// # String Transfers
///
/// The string callbacks are optional. The default implementations transfer
/// nothing, which makes the engine fall back to the scalar callbacks, one
/// unit at a time.
pub trait IoDeviceOps<A: IoAddress>: Send + Sync {
    /// Handles a scalar read.
    ///
    /// `user_data` is the opaque value the range was attached with.
    fn handle_in(&self, user_data: usize, addr: A, width: AccessWidth) -> IoResult<usize>;

    /// Handles a scalar write.
    fn handle_out(&self, user_data: usize, addr: A, width: AccessWidth, val: usize) -> IoResult;

    /// Handles a string read into `buf`, which holds `*count` units of
    /// `width` bytes each.
    ///
    /// The device fills units from the start of `buf` and decrements
    /// `*count` by the number of units it transferred. It may stop early,
    /// e.g. to defer or because of an internal limit.
    fn handle_in_string(
        &self,
        _user_data: usize,
        _addr: A,
        _buf: &mut [u8],
        _count: &mut usize,
        _width: AccessWidth,
    ) -> IoResult {
        Ok(())
    }

    /// Handles a string write from `buf`; the counterpart of
    /// [`IoDeviceOps::handle_in_string`].
    fn handle_out_string(
        &self,
        _user_data: usize,
        _addr: A,
        _buf: &[u8],
        _count: &mut usize,
        _width: AccessWidth,
    ) -> IoResult {
        Ok(())
    }
}

/// Per-device access counters.
#[derive(Debug, Default)]
pub struct DeviceStats {
    reads: AtomicU64,
    writes: AtomicU64,
}

impl DeviceStats {
    /// Number of read callbacks invoked (string units count individually).
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of write callbacks invoked (string units count individually).
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub(crate) fn add_reads(&self, n: u64) {
        self.reads.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_writes(&self, n: u64) {
        self.writes.fetch_add(n, Ordering::Relaxed);
    }
}

/// A device instance as seen by the dispatch engine.
///
/// Owns the device's serialization lock. Ranges hold an `Arc` to it, so the
/// device always outlives its ranges.
pub struct IoDevice<A: IoAddress> {
    name: String,
    ops: Arc<dyn IoDeviceOps<A>>,
    serial: Mutex<()>,
    stats: DeviceStats,
}

impl<A: IoAddress> IoDevice<A> {
    /// Wraps `ops` into a device record named `name`.
    pub fn new(name: impl Into<String>, ops: Arc<dyn IoDeviceOps<A>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            ops,
            serial: Mutex::new(()),
            stats: DeviceStats::default(),
        })
    }

    /// The device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The callback implementation.
    pub fn ops(&self) -> &dyn IoDeviceOps<A> {
        self.ops.as_ref()
    }

    /// Access counters of this device.
    pub fn stats(&self) -> &DeviceStats {
        &self.stats
    }

    /// Acquires the serialization lock according to the tier rules: the
    /// constrained tier only tries, the capable tier spins until it gets it.
    pub(crate) fn serialize(&self, tier: ExecTier) -> Option<MutexGuard<'_, ()>> {
        match tier {
            ExecTier::Constrained => self.serial.try_lock(),
            ExecTier::Capable => Some(self.serial.lock()),
        }
    }
}

impl<A: IoAddress> core::fmt::Debug for IoDevice<A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IoDevice")
            .field("name", &self.name)
            .field("stats", &self.stats)
            .finish()
    }
}
