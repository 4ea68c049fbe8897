//! Blocking IPC wrappers.
//!
//! The kernel primitive is try-send; the cooperative convention is to spin
//! around `yield` until the receiver parks itself.

use super::{cur_env, syscall};
use crate::env::EnvId;
use crate::error::Error;
use crate::mm::PteFlags;

/// Send `value` (plus the page at `src_va` when non-zero) to `to`,
/// retrying until the receiver is ready. Panics on anything other than
/// "not receiving": a vanished peer is unrecoverable for the protocols
/// built on this.
pub fn send(to: EnvId, value: u32, src_va: u32, perm: PteFlags) {
    loop {
        match syscall::ipc_try_send(to, value, src_va, perm) {
            Ok(()) => return,
            Err(Error::IpcNotRecv) => syscall::yield_now(),
            Err(e) => syscall::user_panic(e.as_str()),
        }
    }
}

/// Park until a sender delivers. Returns `(value, sender, perms)`; a gifted
/// page, if any, is mapped at `dest_va`.
pub fn recv(dest_va: u32) -> (u32, EnvId, PteFlags) {
    if let Err(e) = syscall::ipc_recv(dest_va) {
        syscall::user_panic(e.as_str());
    }
    let me = cur_env();
    // SAFETY: reading own descriptor through the read-only window, after
    // the kernel completed the delivery.
    unsafe {
        let ipc = core::ptr::addr_of!((*me).ipc);
        (
            core::ptr::read_volatile(core::ptr::addr_of!((*ipc).value)),
            EnvId(core::ptr::read_volatile(core::ptr::addr_of!((*ipc).from_env))),
            PteFlags::from_bits_truncate(core::ptr::read_volatile(core::ptr::addr_of!(
                (*ipc).perm
            ))),
        )
    }
}
