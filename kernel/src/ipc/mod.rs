//! Synchronous IPC: one word of data plus an optional page gift.
//!
//! There is no message queue. A receiver parks itself with `recv`; exactly
//! one sender's `try_send` lands in that window, every other sender sees
//! `IpcNotRecv` and is expected to retry around a `yield`.

use crate::env::{self, EnvId, EnvStatus};
use crate::error::{Error, Result};
use crate::mm::layout::{VirtAddr, UTOP};
use crate::mm::PteFlags;
use crate::sched;
use crate::trap::reg;

/// Per-Env receive state, embedded in the descriptor (user code reads the
/// delivered value and sender through the `UENVS` window).
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct IpcState {
    /// Non-zero while the Env is parked in `ipc_recv`.
    pub receiving: u32,
    /// Where the receiver wants a gifted page mapped; 0 declines the gift.
    pub dest_va: u32,
    /// Delivered word.
    pub value: u32,
    /// Sender id of the last delivery.
    pub from_env: u32,
    /// Permissions the gift was mapped with.
    pub perm: u32,
}

impl IpcState {
    pub const fn cleared() -> Self {
        IpcState {
            receiving: 0,
            dest_va: 0,
            value: 0,
            from_env: 0,
            perm: 0,
        }
    }
}

/// A `dest_va`/`src_va` of zero means "no page transfer".
fn wants_page(va: u32) -> bool {
    va != 0
}

fn check_transfer_va(va: u32) -> Result<VirtAddr> {
    let va = VirtAddr::new(va);
    if va.as_u32() >= UTOP || !va.is_page_aligned() {
        return Err(Error::Inval);
    }
    Ok(va)
}

/// Park `cur` waiting for a send. The caller is responsible for saving the
/// trap frame and rescheduling; the sender patches the saved `v0`.
pub fn recv(cur: EnvId, dest_va: u32) -> Result<()> {
    if wants_page(dest_va) {
        check_transfer_va(dest_va)?;
    }
    env::with_env(cur, false, |e| {
        e.ipc.receiving = 1;
        e.ipc.dest_va = dest_va;
        e.status = EnvStatus::NotRunnable;
    })?;
    sched::remove(cur);
    Ok(())
}

/// Deliver `value` (and, when both sides asked for it, the mapping at
/// `src_va`) to `dst`, waking it. Fails with `IpcNotRecv` unless `dst` is
/// parked in `recv`; the sender needs no permission over `dst`.
pub fn try_send(cur: EnvId, dst: EnvId, value: u32, src_va: u32, perm: PteFlags) -> Result<()> {
    let gift = if wants_page(src_va) {
        let va = check_transfer_va(src_va)?;
        let space = env::space_of(cur, false)?;
        let (frame, _) = space.lookup(va).ok_or(Error::Inval)?;
        Some(frame)
    } else {
        None
    };

    let dst = env::resolve(dst, false)?;
    let (dest_va, dst_space) = env::with_env(dst, false, |e| {
        if e.ipc.receiving == 0 {
            return Err(Error::IpcNotRecv);
        }
        e.ipc.receiving = 0;
        e.ipc.value = value;
        e.ipc.from_env = cur.0;
        e.ipc.perm = perm.bits();
        e.status = EnvStatus::Runnable;
        // The receiver's ipc_recv returns 0; it reads the payload from its
        // own descriptor.
        e.tf.regs[reg::V0] = 0;
        Ok((e.ipc.dest_va, e.space))
    })??;

    // Requeue the receiver before attempting the mapping: a failed gift
    // still counts as a delivery.
    sched::push(dst);
    if let Some(frame) = gift {
        if wants_page(dest_va) {
            dst_space.insert(frame, VirtAddr::new(dest_va), perm)?;
        }
    }
    Ok(())
}
