//! Typed wrappers over the syscall trap gateway.

use crate::env::{EnvId, EnvStatus};
use crate::error::{from_syscall, Result};
use crate::mm::layout::VirtAddr;
use crate::mm::PteFlags;
use crate::syscall::SyscallNo;
use crate::trap::TrapFrame;

#[cfg(target_arch = "mips")]
extern "C" {
    /// Trap gateway in the boot stub: moves the number into `v0`, shifts
    /// the register arguments down into `a0..a3`, leaves the fifth at
    /// `16(sp)`, and executes `syscall`.
    fn msyscall(no: u32, a0: u32, a1: u32, a2: u32, a3: u32, a4: u32) -> i32;
}

/// The runtime only executes on the MIPS target; host builds compile it for
/// unit-testing the pure pieces.
#[cfg(not(target_arch = "mips"))]
unsafe fn msyscall(_no: u32, _a0: u32, _a1: u32, _a2: u32, _a3: u32, _a4: u32) -> i32 {
    unreachable!("user runtime requires the MIPS target");
}

fn raw(no: SyscallNo, a0: u32, a1: u32, a2: u32, a3: u32, a4: u32) -> i32 {
    // SAFETY: the gateway preserves the C ABI and returns the kernel's v0.
    unsafe { msyscall(no as u32, a0, a1, a2, a3, a4) }
}

pub fn putchar(c: u8) {
    raw(SyscallNo::Putchar, c as u32, 0, 0, 0, 0);
}

pub fn print(buf: &[u8]) -> Result<()> {
    from_syscall(raw(
        SyscallNo::PrintConsole,
        buf.as_ptr() as u32,
        buf.len() as u32,
        0,
        0,
        0,
    ))?;
    Ok(())
}

pub fn getenvid() -> EnvId {
    EnvId(raw(SyscallNo::GetEnvId, 0, 0, 0, 0, 0) as u32)
}

pub fn yield_now() {
    raw(SyscallNo::Yield, 0, 0, 0, 0, 0);
}

pub fn env_destroy(id: EnvId) -> Result<()> {
    from_syscall(raw(SyscallNo::EnvDestroy, id.0, 0, 0, 0, 0))?;
    Ok(())
}

/// Register `entry` as the page-fault upcall with its exception stack
/// topping out at `xstack_top`.
pub fn set_fault_handler(
    id: EnvId,
    entry: extern "C" fn(*mut TrapFrame) -> !,
    xstack_top: u32,
) -> Result<()> {
    from_syscall(raw(
        SyscallNo::SetFaultHandler,
        id.0,
        entry as usize as u32,
        xstack_top,
        0,
        0,
    ))?;
    Ok(())
}

pub fn mem_alloc(id: EnvId, va: VirtAddr, perm: PteFlags) -> Result<()> {
    from_syscall(raw(SyscallNo::MemAlloc, id.0, va.as_u32(), perm.bits(), 0, 0))?;
    Ok(())
}

pub fn mem_map(
    src: EnvId,
    src_va: VirtAddr,
    dst: EnvId,
    dst_va: VirtAddr,
    perm: PteFlags,
) -> Result<()> {
    from_syscall(raw(
        SyscallNo::MemMap,
        src.0,
        src_va.as_u32(),
        dst.0,
        dst_va.as_u32(),
        perm.bits(),
    ))?;
    Ok(())
}

pub fn mem_unmap(id: EnvId, va: VirtAddr) -> Result<()> {
    from_syscall(raw(SyscallNo::MemUnmap, id.0, va.as_u32(), 0, 0, 0))?;
    Ok(())
}

/// Returns the child id in the parent and `EnvId(0)` in the child.
pub fn exofork() -> Result<EnvId> {
    Ok(EnvId(from_syscall(raw(SyscallNo::Exofork, 0, 0, 0, 0, 0))?))
}

pub fn set_env_status(id: EnvId, status: EnvStatus) -> Result<()> {
    from_syscall(raw(SyscallNo::SetEnvStatus, id.0, status as u32, 0, 0, 0))?;
    Ok(())
}

/// Overwrite `id`'s saved trap frame. Targeting yourself restores straight
/// into `tf` and does not return.
pub fn set_trapframe(id: EnvId, tf: &TrapFrame) -> Result<()> {
    from_syscall(raw(
        SyscallNo::SetTrapframe,
        id.0,
        tf as *const TrapFrame as u32,
        0,
        0,
        0,
    ))?;
    Ok(())
}

/// Report an unrecoverable user error; the kernel halts with the message.
pub fn user_panic(msg: &str) -> ! {
    let mut buf = [0u8; 128];
    let n = core::cmp::min(msg.len(), buf.len() - 1);
    buf[..n].copy_from_slice(&msg.as_bytes()[..n]);
    raw(SyscallNo::Panic, buf.as_ptr() as u32, 0, 0, 0, 0);
    unreachable!("sys_panic returned");
}

pub fn ipc_try_send(dst: EnvId, value: u32, src_va: u32, perm: PteFlags) -> Result<()> {
    from_syscall(raw(
        SyscallNo::IpcTrySend,
        dst.0,
        value,
        src_va,
        perm.bits(),
        0,
    ))?;
    Ok(())
}

pub fn ipc_recv(dest_va: u32) -> Result<()> {
    from_syscall(raw(SyscallNo::IpcRecv, dest_va, 0, 0, 0, 0))?;
    Ok(())
}

pub fn read_char() -> u8 {
    raw(SyscallNo::ReadChar, 0, 0, 0, 0, 0) as u8
}

pub fn exit(status: i32) -> ! {
    raw(SyscallNo::Exit, status as u32, 0, 0, 0, 0);
    unreachable!("sys_exit returned");
}
