//! User-space runtime.
//!
//! The library user programs link against: syscall wrappers, fork/spawn,
//! IPC helpers, the fd layer with its device table, the file-server client
//! and server loop, and pipes. Code here runs in user mode and sees the
//! kernel only through the syscall gateway and the three read-only windows
//! (`UENVS`, `UPAGES`, `UVPT`).

pub mod console;
pub mod entry;
pub mod fd;
pub mod file;
pub mod fork;
pub mod fsipc;
pub mod fsserv;
pub mod ipc;
pub mod pipe;
pub mod spawn;
pub mod syscall;
pub mod wait;

use crate::env::{Env, NENV};
use crate::mm::frame::FrameInfo;
use crate::mm::layout::{VirtAddr, PDSHIFT, PGSHIFT, UENVS, UPAGES, UVPT};
use crate::mm::{Pte, PteFlags};

/// The Env table window.
pub fn envs() -> *const Env {
    UENVS as *const Env
}

/// Descriptor in `slot` (live or not; callers re-check the id field).
pub fn env_slot(slot: usize) -> *const Env {
    // SAFETY: UENVS maps the whole NENV-entry table read-only; the index is
    // masked into range.
    unsafe { envs().add(slot & (NENV - 1)) }
}

/// The caller's own descriptor.
pub fn cur_env() -> *const Env {
    env_slot(syscall::getenvid().slot())
}

/// Times the caller has been scheduled; two equal reads bracket a
/// preemption-free window.
pub fn cur_runs() -> u32 {
    // SAFETY: reading own descriptor through the read-only window.
    unsafe { core::ptr::read_volatile(core::ptr::addr_of!((*cur_env()).runs)) }
}

/// The page-table self-map: PTE of any user page, indexed by VPN.
fn vpt() -> *const Pte {
    UVPT as *const Pte
}

/// The directory half of the self-map, indexed by PDX.
fn vpd() -> *const Pte {
    (UVPT + ((UVPT >> PDSHIFT) << PGSHIFT)) as *const Pte
}

/// Flags of the mapping covering `va`, if the page is mapped.
///
/// Only meaningful inside a user Env, where the `UVPT` window exists.
pub fn va_flags(va: VirtAddr) -> Option<PteFlags> {
    // SAFETY: both windows are mapped read-only in every user Env; indices
    // derive from the address being asked about.
    unsafe {
        let pde = *vpd().add(va.pdx());
        if !pde.is_valid() {
            return None;
        }
        let pte = *vpt().add(va.vpn());
        if pte.is_valid() {
            Some(pte.flags())
        } else {
            None
        }
    }
}

/// The frame-table window.
fn pages() -> *const FrameInfo {
    UPAGES as *const FrameInfo
}

/// Number of mappings of the frame backing `va`, or 0 if unmapped. Pipes
/// use this to detect a closed peer.
pub fn pageref(va: VirtAddr) -> u32 {
    // SAFETY: UVPT gives the PTE, UPAGES the refcount; both windows are
    // read-only views maintained by the kernel.
    unsafe {
        let pde = *vpd().add(va.pdx());
        if !pde.is_valid() {
            return 0;
        }
        let pte = *vpt().add(va.vpn());
        if !pte.is_valid() {
            return 0;
        }
        (*pages().add(pte.frame().0 as usize)).refcount
    }
}
