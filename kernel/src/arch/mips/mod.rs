//! MIPS (Malta board) hardware access.
//!
//! The exception vector, `tlb_out`, `env_pop_tf` and the clock reset live in
//! the boot assembly stub; this module declares their C ABI and implements
//! the pieces reachable from plain code (kseg addressing, the UART).

use crate::mm::layout::{PhysAddr, VirtAddr};
use crate::trap::TrapFrame;

/// Base of the unmapped cached kernel segment.
const KSEG0: u32 = 0x8000_0000;
/// Base of the unmapped uncached segment (device access).
const KSEG1: u32 = 0xA000_0000;

/// Malta serial port data register (kseg1).
const UART_DATA: u32 = KSEG1 + 0x1800_03F8;
/// Malta serial port line-status register.
const UART_LSR: u32 = KSEG1 + 0x1800_03FD;
const LSR_DATA_READY: u8 = 0x01;
const LSR_TX_EMPTY: u8 = 0x20;

extern "C" {
    /// Drop the matching TLB entry for `entryhi`, if any. Assembly stub.
    fn tlb_out(entryhi: u32);
    /// Restore a trap frame and `eret` to user mode with `asid` live in
    /// EntryHi. Assembly stub; never returns.
    fn env_pop_tf(tf: *const TrapFrame, asid: u32) -> !;
    /// Re-arm the CP0 Count/Compare timer. Assembly stub.
    fn reset_kclock();
    /// End of the kernel image, from the linker script.
    static __kernel_end: u8;
}

/// Nothing to set up: physical memory is reached through kseg0.
pub fn phys_init(_limit: usize) {}

/// Kernel virtual address of a physical address.
pub fn frame_ptr(pa: PhysAddr) -> *mut u8 {
    (KSEG0 + pa.as_u32()) as *mut u8
}

/// First physical address past the kernel image.
pub fn kernel_end() -> PhysAddr {
    // SAFETY: __kernel_end is a linker-script symbol; only its address is
    // taken, never its value.
    let end = unsafe { &__kernel_end as *const u8 as u32 };
    PhysAddr::new(end - KSEG0)
}

/// Spin forever with interrupts implicitly off (we never re-enable them).
pub fn halt() -> ! {
    loop {
        core::hint::spin_loop();
    }
}

/// Restore `tf` and enter user mode under `asid`.
///
/// # Safety
///
/// `tf` must point at a fully initialized trap frame whose status word has
/// user mode set, and the address space tagged `asid` must be current.
pub unsafe fn ret_to_user(tf: *const TrapFrame, asid: u32) -> ! {
    // SAFETY: forwarded to the assembly stub under the caller's contract.
    unsafe { env_pop_tf(tf, asid) }
}

pub mod console {
    use super::{UART_DATA, UART_LSR, LSR_DATA_READY, LSR_TX_EMPTY};

    /// Write one byte to the serial console.
    pub fn putchar(c: u8) {
        // SAFETY: fixed Malta UART registers in kseg1; uncached MMIO access.
        unsafe {
            while core::ptr::read_volatile(UART_LSR as *const u8) & LSR_TX_EMPTY == 0 {
                core::hint::spin_loop();
            }
            core::ptr::write_volatile(UART_DATA as *mut u8, c);
        }
    }

    /// Read one byte from the serial console, if available.
    pub fn getchar() -> Option<u8> {
        // SAFETY: fixed Malta UART registers in kseg1; uncached MMIO access.
        unsafe {
            if core::ptr::read_volatile(UART_LSR as *const u8) & LSR_DATA_READY != 0 {
                Some(core::ptr::read_volatile(UART_DATA as *const u8))
            } else {
                None
            }
        }
    }
}

pub mod tlb {
    use super::VirtAddr;

    /// EntryHi VPN2 mask: one TLB entry maps an even/odd page pair.
    const VPN2_MASK: u32 = !0x1FFF;

    /// Drop any TLB entry covering `(asid, va)`.
    pub fn invalidate(asid: u32, va: VirtAddr) {
        // SAFETY: tlb_out probes and clears a single entry; safe at any
        // point where the kernel owns the CPU.
        unsafe { super::tlb_out((va.as_u32() & VPN2_MASK) | (asid & 0xFF)) }
    }

}

pub mod timer {
    /// Program the first timer tick.
    pub fn init() {
        // SAFETY: stub resets CP0 Count/Compare; no memory is touched.
        unsafe { super::reset_kclock() }
    }

    /// Acknowledge a timer interrupt and arm the next one.
    pub fn ack() {
        // SAFETY: as for `init`.
        unsafe { super::reset_kclock() }
    }
}
