//! Address range records.

use alloc::sync::Arc;

use crate::addr::IoAddress;
use crate::device::IoDevice;

/// A contiguous block of I/O space bound to one device.
///
/// Created by the device-lifecycle manager and handed to the bus on
/// attach; from then on the registry owns it.
#[derive(Clone)]
pub struct IoRange<A: IoAddress> {
    name: &'static str,
    base: A,
    len: u64,
    device: Arc<IoDevice<A>>,
    user_data: usize,
    constrained_ok: bool,
}

impl<A: IoAddress> IoRange<A> {
    /// Creates a range of `len` addresses starting at `base`, served by
    /// `device`. The range is capable-tier only until
    /// [`IoRange::with_constrained_tier`] says otherwise.
    pub fn new(base: A, len: u64, device: Arc<IoDevice<A>>) -> Self {
        Self {
            name: "default",
            base,
            len,
            device,
            user_data: 0,
            constrained_ok: false,
        }
    }

    /// Set the range name (for debugging).
    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Set the opaque value passed to every callback of this range.
    pub fn with_user_data(mut self, user_data: usize) -> Self {
        self.user_data = user_data;
        self
    }

    /// Declare whether the callbacks may run in the constrained tier.
    pub fn with_constrained_tier(mut self, valid: bool) -> Self {
        self.constrained_ok = valid;
        self
    }

    /// The range name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// First address of the range.
    pub fn base(&self) -> A {
        self.base
    }

    /// Number of addresses covered.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns `true` for a zero-length range, which can never be attached.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The device serving the range.
    pub fn device(&self) -> &Arc<IoDevice<A>> {
        &self.device
    }

    /// The opaque callback argument.
    pub fn user_data(&self) -> usize {
        self.user_data
    }

    /// Whether the callbacks may run in the constrained tier.
    pub fn valid_in_constrained_tier(&self) -> bool {
        self.constrained_ok
    }

    #[inline]
    pub(crate) fn start_raw(&self) -> u64 {
        self.base.to_raw()
    }

    /// Exclusive end, as a raw offset.
    #[inline]
    pub(crate) fn end_raw(&self) -> u64 {
        self.base.to_raw().saturating_add(self.len)
    }

    /// Check if the raw address falls within this range.
    #[inline]
    pub(crate) fn contains_raw(&self, raw: u64) -> bool {
        raw >= self.start_raw() && raw < self.end_raw()
    }

    /// Check if the address falls within this range.
    #[inline]
    pub fn contains(&self, addr: A) -> bool {
        self.contains_raw(addr.to_raw())
    }
}

impl<A: IoAddress> core::fmt::Debug for IoRange<A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{} {:#x}..{:#x} {:?} -> {}",
            A::SPACE,
            self.start_raw(),
            self.end_raw(),
            self.name,
            self.device.name()
        )
    }
}

/// Snapshot of a registered range, for introspection.
#[derive(Debug, Clone)]
pub struct RangeInfo<A: IoAddress> {
    /// Range name.
    pub name: &'static str,
    /// First address.
    pub base: A,
    /// Number of addresses.
    pub len: u64,
    /// The serving device.
    pub device: Arc<IoDevice<A>>,
    /// Whether the callbacks may run in the constrained tier.
    pub valid_in_constrained_tier: bool,
}

impl<A: IoAddress> From<&IoRange<A>> for RangeInfo<A> {
    fn from(range: &IoRange<A>) -> Self {
        Self {
            name: range.name,
            base: range.base,
            len: range.len,
            device: range.device.clone(),
            valid_in_constrained_tier: range.constrained_ok,
        }
    }
}
