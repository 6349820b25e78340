//! Port I/O and MMIO dispatch engine for emulated devices in ArceOS hypervisor.
//!
//! This crate routes a vCPU's I/O accesses to the emulated device that owns
//! the address, across two execution tiers:
//! - the *constrained* tier, which must never block and may only call
//!   handlers marked valid for it, and
//! - the *capable* tier, which can do anything.
//!
//! Anything the constrained tier cannot finish comes back as
//! [`DispatchResult::DeferToCapableTier`] before any device code has run,
//! so replaying the identical operation in the capable tier is always safe.
//!
//! This crate contains:
//! - [`IoDeviceOps`] trait: The callback ABI that emulated devices implement.
//! - [`IoDevice`]: The device record carrying the per-device serialization lock.
//! - [`IoRange`] and [`RangeRegistry`]: Non-overlapping address ranges with log-time lookup.
//! - [`DispatchCache`] and [`IoExecutor`]: Per-vCPU dispatch state.
//! - [`IoBus`]: The dispatch engine ([`PortIoBus`], [`MmioBus`]).
//! - [`check_port_access`]: The I/O privilege gate.
//!
//! # Example
//!
//! ```rust,ignore
//! let bus = PortIoBus::new(IoBusConfig::default());
//! let uart = IoDevice::new("uart", Arc::new(Uart16550::new()));
//! bus.attach(IoRange::new(Port::new(0x3F8), 8, uart).with_constrained_tier(true))?;
//!
//! let mut exec = IoExecutor::new(vcpu_id, ExecTier::Constrained);
//! match bus.emulate_in(&mut exec, &guest, &mut injector, port, AccessWidth::Byte) {
//!     DispatchResult::Success(val) => vcpu.set_al(val as u8),
//!     DispatchResult::DeferToCapableTier => return VmExit::Replay,
//!     _ => {} // faults have already been queued on `injector`
//! }
//! ```

#![no_std]

extern crate alloc;
#[macro_use]
extern crate log;

#[cfg(test)]
extern crate std;

mod addr;
mod bus;
mod cache;
mod config;
mod device;
mod executor;
mod gate;
mod range;
mod registry;
mod stats;
mod status;

pub use addr::{IoAddress, IoSpaceKind, all_ones};
pub use bus::{IoBus, MmioBus, PortIoBus};
pub use cache::DispatchCache;
pub use config::{IoBusConfig, IoRangeConfig};
pub use device::{DeviceStats, IoDevice, IoDeviceOps};
pub use executor::{IoExecutor, PendingWrite};
pub use gate::{CpuMode, IoPermissionSource, TaskSegment, TssKind, check_port_access};
pub use range::{IoRange, RangeInfo};
pub use registry::{RangeError, RangeRef, RangeRegistry};
pub use stats::{IoStatKind, IoStats, IoStatsSnapshot};
pub use status::{
    DispatchResult, ExecTier, FaultKind, GuestFault, GuestFaultSink, IoResult, IoStatus,
};
