//! Fork: copy-on-write duplication of the caller, built entirely on
//! `exofork`, `mem_map`, and the page-fault upcall.

use super::{syscall, va_flags};
use crate::env::{EnvId, EnvStatus};
use crate::error::Result;
use crate::mm::layout::{VirtAddr, PAGE_SIZE, PDMAP, UCOW, USTACKTOP, UXSTACKTOP};
use crate::mm::PteFlags;
use crate::trap::TrapFrame;

/// How one page travels across a fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DupPolicy {
    /// `LIBRARY` pages stay shared; both sides see writes.
    Shared,
    /// Writable (or already-COW) pages become COW on both sides.
    Cow,
    /// Genuinely read-only pages are mapped with their existing perms.
    ReadOnly,
}

pub fn duppage_policy(flags: PteFlags) -> DupPolicy {
    if flags.contains(PteFlags::LIBRARY) {
        DupPolicy::Shared
    } else if flags.intersects(PteFlags::WRITABLE | PteFlags::COW) {
        DupPolicy::Cow
    } else {
        DupPolicy::ReadOnly
    }
}

/// Map one parent page into `child`, downgrading to COW where the policy
/// says so. The child is mapped before the parent is downgraded, so a
/// preemption between the two cannot lose a write.
fn duppage(child: EnvId, va: VirtAddr, flags: PteFlags) -> Result<()> {
    let shared = flags & PteFlags::MAPPABLE;
    match duppage_policy(flags) {
        DupPolicy::Shared | DupPolicy::ReadOnly => {
            syscall::mem_map(EnvId::CURRENT, va, child, va, shared)
        }
        DupPolicy::Cow => {
            let cow = (shared - PteFlags::WRITABLE) | PteFlags::COW;
            syscall::mem_map(EnvId::CURRENT, va, child, va, cow)?;
            syscall::mem_map(EnvId::CURRENT, va, EnvId::CURRENT, va, cow)
        }
    }
}

/// The COW page-fault upcall. Validates the fault, copies the page through
/// the `UCOW` scratch slot, remaps it writable, and resumes the faulting
/// instruction by restoring the pushed trap frame.
pub extern "C" fn cow_entry(tf: *mut TrapFrame) -> ! {
    // SAFETY: the kernel passes the frame it pushed onto the exception
    // stack; it stays valid for the duration of the upcall.
    let tf = unsafe { &mut *tf };
    let va = VirtAddr::new(tf.badvaddr).page_align_down();
    let Some(flags) = va_flags(va) else {
        syscall::user_panic("cow fault on unmapped page");
    };
    if !flags.contains(PteFlags::COW) {
        syscall::user_panic("write fault on non-cow page");
    }

    let writable = ((flags & PteFlags::MAPPABLE) - PteFlags::COW) | PteFlags::WRITABLE;
    let copy = || -> Result<()> {
        syscall::mem_alloc(EnvId::CURRENT, VirtAddr::new(UCOW), PteFlags::WRITABLE | PteFlags::USER)?;
        // SAFETY: both pages are mapped in this Env; UCOW was just
        // allocated writable.
        unsafe {
            core::ptr::copy_nonoverlapping(
                va.as_u32() as *const u8,
                UCOW as *mut u8,
                PAGE_SIZE,
            );
        }
        syscall::mem_map(EnvId::CURRENT, VirtAddr::new(UCOW), EnvId::CURRENT, va, writable)?;
        syscall::mem_unmap(EnvId::CURRENT, VirtAddr::new(UCOW))
    };
    if let Err(e) = copy() {
        syscall::user_panic(e.as_str());
    }

    let _ = syscall::set_trapframe(EnvId::CURRENT, tf);
    unreachable!("set_trapframe on self returned");
}

/// Ensure this Env has the COW handler and an exception stack installed.
fn install_handler(id: EnvId) -> Result<()> {
    syscall::mem_alloc(
        id,
        VirtAddr::new(UXSTACKTOP - PAGE_SIZE as u32),
        PteFlags::WRITABLE | PteFlags::USER,
    )?;
    syscall::set_fault_handler(id, cow_entry, UXSTACKTOP)
}

/// Duplicate the caller. Returns the child id in the parent and
/// `EnvId(0)` in the child; physical pages are shared copy-on-write until
/// either side writes.
pub fn fork() -> Result<EnvId> {
    install_handler(EnvId::CURRENT)?;

    let child = syscall::exofork()?;
    if child == EnvId(0) {
        // Child: resumed from the duplicated frame once the parent made us
        // runnable.
        return Ok(EnvId(0));
    }

    // Walk every mapped page below the regular stack top and hand it to
    // the child. The exception stack is recreated fresh instead.
    let mut va = 0u32;
    while va < USTACKTOP {
        let page = VirtAddr::new(va);
        if !dir_present(page) {
            // An absent directory entry skips 4 MiB at once.
            va = (va & !(PDMAP - 1)) + PDMAP;
            continue;
        }
        if let Some(flags) = va_flags(page) {
            duppage(child, page, flags)?;
        }
        va += PAGE_SIZE as u32;
    }

    install_handler(child)?;
    syscall::set_env_status(child, EnvStatus::Runnable)?;
    Ok(child)
}

/// Whether the directory entry covering `va` is present (cheap 4 MiB skip).
fn dir_present(va: VirtAddr) -> bool {
    // SAFETY: UVPT directory view is mapped read-only in every user Env.
    unsafe { (*super::vpd().add(va.pdx())).is_valid() }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn policy_matrix() {
        let w = PteFlags::VALID | PteFlags::USER | PteFlags::WRITABLE;
        let cow = PteFlags::VALID | PteFlags::USER | PteFlags::COW;
        let lib = PteFlags::VALID | PteFlags::USER | PteFlags::WRITABLE | PteFlags::LIBRARY;
        let ro = PteFlags::VALID | PteFlags::USER;

        assert_eq!(duppage_policy(w), DupPolicy::Cow);
        assert_eq!(duppage_policy(cow), DupPolicy::Cow, "already-COW stays COW");
        assert_eq!(duppage_policy(lib), DupPolicy::Shared, "LIBRARY beats WRITABLE");
        assert_eq!(duppage_policy(ro), DupPolicy::ReadOnly);
    }
}
