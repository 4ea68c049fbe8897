//! Exception dispatch.
//!
//! A single vectored entry in the assembly stub saves the register file to
//! the kernel stack and calls `handle_trap`; `do_trap` decides whether the
//! trapped Env resumes or the scheduler picks another one.

use core::mem::size_of;

use crate::arch;
use crate::env;
use crate::mm::layout::{VirtAddr, PAGE_SIZE};
use crate::sched;

/// Register index names for the saved register file.
pub mod reg {
    pub const ZERO: usize = 0;
    pub const AT: usize = 1;
    pub const V0: usize = 2;
    pub const V1: usize = 3;
    pub const A0: usize = 4;
    pub const A1: usize = 5;
    pub const A2: usize = 6;
    pub const A3: usize = 7;
    pub const K0: usize = 26;
    pub const K1: usize = 27;
    pub const GP: usize = 28;
    pub const SP: usize = 29;
    pub const FP: usize = 30;
    pub const RA: usize = 31;
}

/// Snapshot of user state at exception entry. k0/k1 slots exist but are
/// kernel scratch and never live across a trap.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct TrapFrame {
    pub regs: [u32; 32],
    pub status: u32,
    pub hi: u32,
    pub lo: u32,
    pub badvaddr: u32,
    pub cause: u32,
    pub epc: u32,
}

impl TrapFrame {
    pub const fn zeroed() -> Self {
        TrapFrame {
            regs: [0; 32],
            status: 0,
            hi: 0,
            lo: 0,
            badvaddr: 0,
            cause: 0,
            epc: 0,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: TrapFrame is repr(C) plain words with no padding.
        unsafe { core::slice::from_raw_parts(self as *const Self as *const u8, size_of::<Self>()) }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as for `as_bytes`; any bit pattern is a valid TrapFrame.
        unsafe { core::slice::from_raw_parts_mut(self as *mut Self as *mut u8, size_of::<Self>()) }
    }
}

impl core::fmt::Display for TrapFrame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for (i, chunk) in self.regs.chunks(4).enumerate() {
            writeln!(
                f,
                "${:02}: {:08x} {:08x} {:08x} {:08x}",
                i * 4,
                chunk[0],
                chunk[1],
                chunk[2],
                chunk[3]
            )?;
        }
        writeln!(f, "status:   {:08x}", self.status)?;
        writeln!(f, "badvaddr: {:08x}", self.badvaddr)?;
        writeln!(f, "cause:    {:08x}", self.cause)?;
        write!(f, "epc:      {:08x}", self.epc)
    }
}

/// Exception codes from the CP0 Cause register.
const EXC_INT: u32 = 0;
const EXC_MOD: u32 = 1;
const EXC_TLBL: u32 = 2;
const EXC_TLBS: u32 = 3;
const EXC_SYS: u32 = 8;

fn exc_code(cause: u32) -> u32 {
    (cause >> 2) & 0x1F
}

/// What the trap path should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Return to the trapped Env with the (possibly updated) trap frame.
    Resume,
    /// Hand the CPU to the scheduler.
    Reschedule { yielding: bool },
}

/// Dispatch one exception.
pub fn do_trap(tf: &mut TrapFrame) -> Disposition {
    match exc_code(tf.cause) {
        EXC_INT => {
            arch::timer::ack();
            save_current(tf);
            Disposition::Reschedule { yielding: false }
        }
        EXC_SYS => crate::syscall::dispatch(tf),
        EXC_MOD | EXC_TLBL | EXC_TLBS => do_page_fault(tf),
        code => {
            log::warn!("unhandled exception {} at epc {:#x}", code, tf.epc);
            fatal(tf)
        }
    }
}

/// Stash the live trap frame into the current Env so a later `env_run` can
/// restore it. No-op when the current Env died during this trap.
pub(crate) fn save_current(tf: &TrapFrame) {
    if let Some(cur) = sched::current() {
        let _ = env::store_tf(cur, tf);
    }
}

/// Deliver a page fault to the Env's user-space upcall, or destroy it.
///
/// The whole trap frame is pushed onto the Env's exception stack (below the
/// live frame when the fault happened inside the handler itself), `a0`
/// points at the pushed frame, and execution resumes at the registered
/// entry. The handler returns by passing the frame to `set_trapframe`.
fn do_page_fault(tf: &mut TrapFrame) -> Disposition {
    let Some(cur) = sched::current() else {
        panic!("page fault with no current env, badvaddr {:#x}", tf.badvaddr);
    };
    let Ok((entry, xstack_top, space)) = env::fault_state(cur) else {
        return fatal(tf);
    };
    if entry == 0 || xstack_top < PAGE_SIZE as u32 {
        log::warn!(
            "env {:08x}: page fault at {:#x} with no handler",
            cur.0,
            tf.badvaddr
        );
        return fatal(tf);
    }

    let sp = tf.regs[reg::SP];
    let nested = sp >= xstack_top - PAGE_SIZE as u32 && sp < xstack_top;
    let base = if nested { sp } else { xstack_top };
    let new_sp = base - size_of::<TrapFrame>() as u32;

    if space.write_bytes(VirtAddr::new(new_sp), tf.as_bytes()).is_err() {
        log::warn!("env {:08x}: exception stack not mapped", cur.0);
        return fatal(tf);
    }

    tf.regs[reg::SP] = new_sp;
    tf.regs[reg::A0] = new_sp;
    tf.epc = entry;
    Disposition::Resume
}

/// Dump state and destroy the offending Env. With no current Env the fault
/// is the kernel's own and unrecoverable.
fn fatal(tf: &mut TrapFrame) -> Disposition {
    match sched::current() {
        Some(cur) => {
            crate::println!("{}", tf);
            let _ = env::destroy(cur);
            Disposition::Reschedule { yielding: false }
        }
        None => panic!("fatal trap in kernel context:\n{}", tf),
    }
}

/// Entry point called by the exception stub with the saved frame.
#[cfg(target_os = "none")]
#[no_mangle]
pub extern "C" fn handle_trap(tf: *mut TrapFrame) -> ! {
    // SAFETY: the stub hands us the frame it just stored on the kernel
    // stack; it stays valid until we leave via eret.
    let tf = unsafe { &mut *tf };
    match do_trap(tf) {
        Disposition::Resume => {
            let asid = crate::mm::current_space().map(|s| s.asid).unwrap_or(0);
            // SAFETY: resuming the frame we entered with, under the same
            // address space.
            unsafe { arch::ret_to_user(tf, asid) }
        }
        Disposition::Reschedule { yielding } => match sched::schedule(yielding) {
            Some(next) => sched::run(next),
            None => {
                crate::println!("no runnable envs, halting");
                arch::halt()
            }
        },
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::env::{self, EnvId, EnvStatus};
    use crate::mm::layout::{UTEXT, UXSTACKTOP};
    use crate::mm::{frame, PteFlags};
    use crate::test_support;

    const EXC_MOD_CAUSE: u32 = EXC_MOD << 2;

    fn runnable_env() -> EnvId {
        let id = env::alloc(EnvId(0)).unwrap();
        env::with_env(id, false, |e| e.status = EnvStatus::Runnable).unwrap();
        sched::push(id);
        id
    }

    #[test]
    fn fault_without_handler_destroys_env() {
        let _k = test_support::boot(8 * 1024 * 1024);
        let id = runnable_env();
        sched::schedule(false);

        let mut tf = TrapFrame::zeroed();
        tf.cause = EXC_MOD_CAUSE;
        tf.badvaddr = UTEXT;
        let disp = do_trap(&mut tf);
        assert_eq!(disp, Disposition::Reschedule { yielding: false });
        assert!(env::resolve(id, false).is_err(), "offender must be gone");
    }

    #[test]
    fn fault_with_handler_pushes_frame_and_redirects() {
        let _k = test_support::boot(8 * 1024 * 1024);
        let id = runnable_env();
        sched::schedule(false);

        // Register a handler and map the exception stack page.
        let space = env::space_of(id, false).unwrap();
        let xstack_page = frame::alloc(true).unwrap();
        space
            .insert(
                xstack_page,
                VirtAddr::new(UXSTACKTOP - PAGE_SIZE as u32),
                PteFlags::WRITABLE | PteFlags::USER,
            )
            .unwrap();
        env::with_env(id, false, |e| {
            e.fault_entry = 0x0041_0000;
            e.fault_stack = UXSTACKTOP;
        })
        .unwrap();

        let mut tf = TrapFrame::zeroed();
        tf.cause = EXC_MOD_CAUSE;
        tf.badvaddr = UTEXT + 0x123;
        tf.epc = 0x0040_0400;
        tf.regs[reg::SP] = 0x7000_0000;
        let faulting = tf;

        assert_eq!(do_trap(&mut tf), Disposition::Resume);
        assert_eq!(tf.epc, 0x0041_0000);
        let pushed_at = tf.regs[reg::SP];
        assert_eq!(tf.regs[reg::A0], pushed_at);
        assert_eq!(pushed_at, UXSTACKTOP - size_of::<TrapFrame>() as u32);

        // The pushed frame is the faulting one, byte for byte.
        let mut stored = TrapFrame::zeroed();
        space
            .read_bytes(VirtAddr::new(pushed_at), stored.as_bytes_mut())
            .unwrap();
        assert_eq!(stored.epc, faulting.epc);
        assert_eq!(stored.badvaddr, faulting.badvaddr);
        assert_eq!(stored.regs, faulting.regs);
    }

    #[test]
    fn nested_fault_pushes_below_live_frame() {
        let _k = test_support::boot(8 * 1024 * 1024);
        let id = runnable_env();
        sched::schedule(false);

        let space = env::space_of(id, false).unwrap();
        let xstack_page = frame::alloc(true).unwrap();
        space
            .insert(
                xstack_page,
                VirtAddr::new(UXSTACKTOP - PAGE_SIZE as u32),
                PteFlags::WRITABLE | PteFlags::USER,
            )
            .unwrap();
        env::with_env(id, false, |e| {
            e.fault_entry = 0x0041_0000;
            e.fault_stack = UXSTACKTOP;
        })
        .unwrap();

        // Simulate faulting inside the handler: sp already on the
        // exception stack.
        let live_sp = UXSTACKTOP - size_of::<TrapFrame>() as u32;
        let mut tf = TrapFrame::zeroed();
        tf.cause = EXC_MOD_CAUSE;
        tf.badvaddr = UTEXT;
        tf.regs[reg::SP] = live_sp;

        assert_eq!(do_trap(&mut tf), Disposition::Resume);
        assert_eq!(tf.regs[reg::SP], live_sp - size_of::<TrapFrame>() as u32);
    }
}
