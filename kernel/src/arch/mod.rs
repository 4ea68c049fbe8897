//! Hardware access layer.
//!
//! Everything the kernel needs from the machine goes through this module:
//! physical-memory access, the console device, the TLB, the timer, and the
//! return-to-user path. On the MIPS target these reach real hardware (partly
//! through the boot assembly stub); on the host they are backed by a test
//! shim so the rest of the kernel runs under the standard test harness.

#[cfg(target_arch = "mips")]
mod mips;
#[cfg(target_arch = "mips")]
pub use mips::{console, frame_ptr, halt, kernel_end, phys_init, ret_to_user, timer, tlb};

#[cfg(not(target_arch = "mips"))]
mod host;
#[cfg(not(target_arch = "mips"))]
pub use host::{console, frame_ptr, halt, kernel_end, phys_init, ret_to_user, timer, tlb};

/// CP0 Status: interrupt enable.
pub const STATUS_IE: u32 = 1 << 0;
/// CP0 Status: exception level.
pub const STATUS_EXL: u32 = 1 << 1;
/// CP0 Status: user mode.
pub const STATUS_UM: u32 = 1 << 4;
/// CP0 Status: timer interrupt mask bit.
pub const STATUS_IM7: u32 = 1 << 15;

/// Status word installed in a fresh Env: user mode, interrupts on, timer
/// interrupt unmasked.
pub const STATUS_USER_DEFAULT: u32 = STATUS_IM7 | STATUS_UM | STATUS_IE;
