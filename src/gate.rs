//! The I/O privilege gate.
//!
//! Runs before a port access is dispatched and decides whether the guest's
//! current privilege level may touch the port at all. When CPL > IOPL in
//! protected mode, or always in virtual-8086 mode, the I/O permission
//! bitmap in the current task-state segment decides.

use axaddrspace::device::{AccessWidth, Port};

use crate::addr::assert_width;
use crate::status::{DispatchResult, GuestFault, IoResult, IoStatus};

/// Offset of the I/O map base field inside a 32/64-bit TSS.
const TSS_IOMAP_BASE_OFFSET: u64 = 0x66;

/// Smallest limit a 32-bit TSS may have.
const TSS32_MIN_LIMIT: u32 = 0x67;

/// Guest CPU operating mode, as far as I/O permission checks care.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuMode {
    /// Real mode: no I/O restrictions.
    Real,
    /// Virtual-8086 mode: every access goes through the bitmap.
    Virtual8086,
    /// 16/32-bit protected mode.
    Protected,
    /// 64-bit long mode.
    Long,
}

/// Type of the task segment currently loaded in TR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TssKind {
    /// 16-bit TSS; has no I/O permission bitmap.
    Tss16,
    /// 32-bit (or 64-bit in long mode) TSS, available or busy.
    Tss32,
}

/// The current task segment as described by the hidden TR state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskSegment {
    /// Linear base address.
    pub base: u64,
    /// Byte-granular limit (inclusive).
    pub limit: u32,
    /// Segment type.
    pub kind: TssKind,
}

/// Everything the gate needs from the descriptor-table subsystem and guest
/// memory.
///
/// A read may fail with a guest fault (e.g. `#PF` while reading the TSS) or
/// with [`IoStatus::DeferToCapableTier`](crate::IoStatus) when the caller
/// cannot touch guest memory in its tier; the gate passes either through
/// untouched.
pub trait IoPermissionSource {
    /// Current operating mode.
    fn cpu_mode(&self) -> CpuMode;
    /// Current privilege level (0-3).
    fn cpl(&self) -> u8;
    /// EFLAGS.IOPL (0-3).
    fn iopl(&self) -> u8;
    /// The task segment currently loaded in TR.
    fn task_segment(&self) -> IoResult<TaskSegment>;
    /// Reads a little-endian u16 at a guest linear address.
    ///
    /// `Err(IoStatus::Unused)` means the TSS is unreadable and denies the
    /// access.
    fn read_u16(&self, linear: u64) -> IoResult<u16>;
}

/// Checks whether the guest may access `width` bytes at `port`.
///
/// Returns `Success(())` when the access is allowed and
/// `Fault(#GP(0))` when it is not; the caller injects the fault.
pub fn check_port_access<S: IoPermissionSource + ?Sized>(
    src: &S,
    port: Port,
    width: AccessWidth,
) -> DispatchResult {
    let size = assert_width::<Port>(width);

    match src.cpu_mode() {
        CpuMode::Real => return DispatchResult::Success(()),
        CpuMode::Protected | CpuMode::Long if src.cpl() <= src.iopl() => {
            return DispatchResult::Success(());
        }
        _ => {}
    }

    match check_bitmap(src, port.number(), size) {
        Ok(true) => DispatchResult::Success(()),
        Ok(false) => {
            debug!(
                "I/O permission denied: port {:#x}/{} cpl {} iopl {}",
                port.number(),
                size,
                src.cpl(),
                src.iopl()
            );
            DispatchResult::Fault(GuestFault::gp0())
        }
        // No readable bitmap.
        Err(IoStatus::Unused) => DispatchResult::Fault(GuestFault::gp0()),
        Err(status) => status.into(),
    }
}

/// Consults the TSS I/O permission bitmap. `Ok(false)` means `#GP(0)`.
fn check_bitmap<S: IoPermissionSource + ?Sized>(src: &S, port: u16, size: usize) -> IoResult<bool> {
    let tss = src.task_segment()?;
    if tss.kind != TssKind::Tss32 || tss.limit < TSS32_MIN_LIMIT {
        trace!("no usable I/O bitmap: {tss:?}");
        return Ok(false);
    }

    let map_base = src.read_u16(tss.base.wrapping_add(TSS_IOMAP_BASE_OFFSET))? as u64;
    let first_byte = map_base + (port as u64 >> 3);
    // Both bytes of the word must lie inside the segment.
    if first_byte + 1 > tss.limit as u64 {
        trace!("I/O bitmap byte {first_byte:#x} beyond TSS limit {:#x}", tss.limit);
        return Ok(false);
    }

    let bits = src.read_u16(tss.base.wrapping_add(first_byte))?;
    let mask = ((1u16 << size) - 1) << (port & 7);
    Ok(bits & mask == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{FaultKind, IoStatus};
    use alloc::{vec, vec::Vec};

    const TSS_BASE: u64 = 0x1000;

    /// A guest with a 32-bit TSS whose bitmap starts at 0x68 and covers
    /// ports 0..0x400.
    struct Guest {
        base: u64,
        mode: CpuMode,
        cpl: u8,
        iopl: u8,
        kind: TssKind,
        limit: u32,
        mem: Vec<u8>,
        fail_reads: Option<IoStatus>,
    }

    impl Guest {
        fn new(mode: CpuMode, cpl: u8, iopl: u8) -> Self {
            let mut mem = vec![0u8; 0x68 + 0x80 + 1];
            mem[0x66..0x68].copy_from_slice(&0x68u16.to_le_bytes());
            // The byte after the bitmap must have all bits set.
            let last = mem.len() - 1;
            mem[last] = 0xFF;
            Self {
                base: TSS_BASE,
                mode,
                cpl,
                iopl,
                kind: TssKind::Tss32,
                limit: (mem.len() - 1) as u32,
                mem,
                fail_reads: None,
            }
        }

        fn deny(&mut self, port: u16) {
            self.mem[0x68 + (port as usize >> 3)] |= 1 << (port & 7);
        }
    }

    impl IoPermissionSource for Guest {
        fn cpu_mode(&self) -> CpuMode {
            self.mode
        }

        fn cpl(&self) -> u8 {
            self.cpl
        }

        fn iopl(&self) -> u8 {
            self.iopl
        }

        fn task_segment(&self) -> IoResult<TaskSegment> {
            Ok(TaskSegment {
                base: self.base,
                limit: self.limit,
                kind: self.kind,
            })
        }

        fn read_u16(&self, linear: u64) -> IoResult<u16> {
            if let Some(status) = self.fail_reads {
                return Err(status);
            }
            let off = linear.wrapping_sub(self.base) as usize;
            Ok(u16::from_le_bytes([self.mem[off], self.mem[off + 1]]))
        }
    }

    fn gp0() -> DispatchResult {
        DispatchResult::Fault(GuestFault::gp0())
    }

    #[test]
    fn real_mode_and_sufficient_privilege_skip_bitmap() {
        let mut g = Guest::new(CpuMode::Real, 3, 0);
        g.deny(0x60);
        assert_eq!(check_port_access(&g, Port::new(0x60), AccessWidth::Byte), DispatchResult::Success(()));

        let mut g = Guest::new(CpuMode::Protected, 0, 0);
        g.deny(0x60);
        assert_eq!(check_port_access(&g, Port::new(0x60), AccessWidth::Byte), DispatchResult::Success(()));
    }

    #[test]
    fn bitmap_decides_for_user_mode() {
        let mut g = Guest::new(CpuMode::Protected, 3, 0);
        g.deny(0x61);
        assert_eq!(check_port_access(&g, Port::new(0x60), AccessWidth::Byte), DispatchResult::Success(()));
        assert_eq!(check_port_access(&g, Port::new(0x61), AccessWidth::Byte), gp0());
        // A word access at 0x60 covers 0x61.
        assert_eq!(check_port_access(&g, Port::new(0x60), AccessWidth::Word), gp0());
    }

    #[test]
    fn access_straddling_bitmap_bytes() {
        let mut g = Guest::new(CpuMode::Long, 3, 0);
        g.deny(0x80);
        assert_eq!(check_port_access(&g, Port::new(0x7C), AccessWidth::Dword), DispatchResult::Success(()));
        assert_eq!(check_port_access(&g, Port::new(0x7E), AccessWidth::Dword), gp0());
    }

    #[test]
    fn v86_always_checks_bitmap() {
        let mut g = Guest::new(CpuMode::Virtual8086, 3, 3);
        assert_eq!(check_port_access(&g, Port::new(0x3F8), AccessWidth::Byte), DispatchResult::Success(()));
        g.deny(0x3F8);
        assert_eq!(check_port_access(&g, Port::new(0x3F8), AccessWidth::Byte), gp0());
    }

    #[test]
    fn unusable_tss_faults() {
        let mut g = Guest::new(CpuMode::Protected, 3, 0);
        g.kind = TssKind::Tss16;
        assert_eq!(check_port_access(&g, Port::new(0x60), AccessWidth::Byte), gp0());

        let mut g = Guest::new(CpuMode::Protected, 3, 0);
        g.limit = 0x60;
        assert_eq!(check_port_access(&g, Port::new(0x60), AccessWidth::Byte), gp0());

        // Ports past the end of the bitmap.
        let g = Guest::new(CpuMode::Protected, 3, 0);
        assert_eq!(check_port_access(&g, Port::new(0x8000), AccessWidth::Byte), gp0());
    }

    #[test]
    fn read_failures_propagate() {
        let mut g = Guest::new(CpuMode::Protected, 3, 0);
        g.fail_reads = Some(IoStatus::DeferToCapableTier);
        assert_eq!(
            check_port_access(&g, Port::new(0x60), AccessWidth::Byte),
            DispatchResult::DeferToCapableTier
        );

        let pf = GuestFault::with_code(FaultKind::PageFault, 0);
        g.fail_reads = Some(IoStatus::Fault(pf));
        assert_eq!(
            check_port_access(&g, Port::new(0x60), AccessWidth::Byte),
            DispatchResult::Fault(pf)
        );
    }

    #[test]
    fn tss_near_top_of_address_space() {
        let mut g = Guest::new(CpuMode::Long, 3, 0);
        g.base = 0xFFFF_FFFF_FFFF_FFC0;
        g.deny(0x61);
        assert_eq!(check_port_access(&g, Port::new(0x60), AccessWidth::Byte), DispatchResult::Success(()));
        assert_eq!(check_port_access(&g, Port::new(0x61), AccessWidth::Byte), gp0());
    }

    #[test]
    fn unreadable_tss_denies() {
        let mut g = Guest::new(CpuMode::Protected, 3, 0);
        g.fail_reads = Some(IoStatus::Unused);
        assert_eq!(check_port_access(&g, Port::new(0x60), AccessWidth::Byte), gp0());
    }
}
