//! Waiting for a child: a polling loop over the Env-table window.

use super::{env_slot, syscall};
use crate::env::{EnvId, EnvStatus};
use crate::error::{Error, Result};

/// Snapshot `(id, status, exit_status)` of a slot in one inspection.
fn snapshot(slot: usize) -> (u32, u32, i32) {
    let e = env_slot(slot);
    // SAFETY: reading through the read-only UENVS window; fields may change
    // between reads, which the caller compensates for by re-checking the id.
    unsafe {
        (
            core::ptr::read_volatile(core::ptr::addr_of!((*e).id)).0,
            core::ptr::read_volatile(core::ptr::addr_of!((*e).status)) as u32,
            core::ptr::read_volatile(core::ptr::addr_of!((*e).exit_status)),
        )
    }
}

/// Block (by yielding) until `child` exits, then return its exit status.
///
/// Identifier reuse is closed out by re-reading the id after observing the
/// FREE status: a recycled slot no longer carries `child`'s id and reports
/// `BadEnv` instead of another Env's exit status.
pub fn wait(child: EnvId) -> Result<i32> {
    let slot = child.slot();
    loop {
        let (id, status, exit_status) = snapshot(slot);
        if id != child.0 {
            return Err(Error::BadEnv);
        }
        if status == EnvStatus::Free as u32 {
            let (id_again, _, _) = snapshot(slot);
            if id_again == child.0 {
                return Ok(exit_status);
            }
            return Err(Error::BadEnv);
        }
        syscall::yield_now();
    }
}
