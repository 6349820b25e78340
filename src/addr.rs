//! Address spaces that the dispatch engine can route.

use core::fmt::Debug;

use axaddrspace::{GuestPhysAddr, device::{AccessWidth, Port}};

/// The kinds of I/O space an executor dispatches into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoSpaceKind {
    /// x86 port I/O.
    Port = 0,
    /// Memory-mapped I/O.
    Mmio = 1,
}

/// An I/O address space (port I/O, MMIO).
///
/// The engine only needs a total order on addresses and the widest access
/// the space accepts; everything else is opaque and passed through to the
/// device callbacks unchanged.
pub trait IoAddress: Copy + Debug + Send + Sync + 'static {
    /// Short name of the space, used in log messages.
    const SPACE: &'static str;

    /// Which space this is; selects the executor's cache.
    const KIND: IoSpaceKind;

    /// Widest access accepted by this space, in bytes.
    const MAX_ACCESS_SIZE: usize;

    /// Number of addressable units in the space (exclusive upper bound).
    const LIMIT: u64;

    /// Converts the address into a raw offset inside the space.
    fn to_raw(self) -> u64;

    /// Builds an address from a raw offset inside the space.
    fn from_raw(raw: u64) -> Self;
}

impl IoAddress for Port {
    const SPACE: &'static str = "pio";
    const KIND: IoSpaceKind = IoSpaceKind::Port;
    const MAX_ACCESS_SIZE: usize = 4;
    const LIMIT: u64 = 0x1_0000;

    #[inline]
    fn to_raw(self) -> u64 {
        self.number() as u64
    }

    #[inline]
    fn from_raw(raw: u64) -> Self {
        Port::new(raw as u16)
    }
}

impl IoAddress for GuestPhysAddr {
    const SPACE: &'static str = "mmio";
    const KIND: IoSpaceKind = IoSpaceKind::Mmio;
    const MAX_ACCESS_SIZE: usize = 8;
    const LIMIT: u64 = u64::MAX;

    #[inline]
    fn to_raw(self) -> u64 {
        self.as_usize() as u64
    }

    #[inline]
    fn from_raw(raw: u64) -> Self {
        GuestPhysAddr::from(raw as usize)
    }
}

/// Checks that `width` is a legal access for the address space `A`.
///
/// A bad width is a bug in the instruction decoder, not something the guest
/// can cause, so it is fatal.
#[inline]
#[track_caller]
pub(crate) fn assert_width<A: IoAddress>(width: AccessWidth) -> usize {
    let size = width.size();
    assert!(
        size <= A::MAX_ACCESS_SIZE && size <= core::mem::size_of::<usize>(),
        "invalid {} access width: {} bytes",
        A::SPACE,
        size
    );
    size
}

/// The value read from a location nothing answers for: every bit set,
/// sized to the access.
#[inline]
pub const fn all_ones(size: usize) -> usize {
    if size >= core::mem::size_of::<usize>() {
        usize::MAX
    } else {
        (1usize << (size * 8)) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_ones_matches_width() {
        assert_eq!(all_ones(1), 0xFF);
        assert_eq!(all_ones(2), 0xFFFF);
        assert_eq!(all_ones(4), 0xFFFF_FFFF);
        assert_eq!(all_ones(core::mem::size_of::<usize>()), usize::MAX);
    }

    #[test]
    fn port_raw_conversion() {
        let port = Port::from_raw(0x3F8);
        assert_eq!(port.number(), 0x3F8);
        assert_eq!(port.to_raw(), 0x3F8);
    }

    #[test]
    #[should_panic]
    fn qword_port_access_is_fatal() {
        assert_width::<Port>(AccessWidth::Qword);
    }
}
