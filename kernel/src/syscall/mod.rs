//! System-call dispatch.
//!
//! The syscall number arrives in `v0`, arguments in `a0..a3` with the fifth
//! at `16(sp)` on the caller's stack; the result goes back in `v0` as a
//! non-negative value or a negated error code. `epc` is advanced past the
//! `syscall` instruction before any handler runs, so a blocked or forked Env
//! resumes after the call site.

mod io;
mod ipc;
mod mem;
mod process;

use crate::env::{self, EnvId};
use crate::error::{Error, Result};
use crate::mm::layout::VirtAddr;
use crate::sched;
use crate::trap::{self, reg, Disposition, TrapFrame};

/// Numbered system calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SyscallNo {
    Putchar = 0,
    PrintConsole = 1,
    GetEnvId = 2,
    Yield = 3,
    EnvDestroy = 4,
    SetFaultHandler = 5,
    MemAlloc = 6,
    MemMap = 7,
    MemUnmap = 8,
    Exofork = 9,
    SetEnvStatus = 10,
    SetTrapframe = 11,
    Panic = 12,
    IpcTrySend = 13,
    IpcRecv = 14,
    ReadChar = 15,
    Exit = 16,
}

impl TryFrom<u32> for SyscallNo {
    type Error = ();

    fn try_from(no: u32) -> core::result::Result<Self, ()> {
        Ok(match no {
            0 => Self::Putchar,
            1 => Self::PrintConsole,
            2 => Self::GetEnvId,
            3 => Self::Yield,
            4 => Self::EnvDestroy,
            5 => Self::SetFaultHandler,
            6 => Self::MemAlloc,
            7 => Self::MemMap,
            8 => Self::MemUnmap,
            9 => Self::Exofork,
            10 => Self::SetEnvStatus,
            11 => Self::SetTrapframe,
            12 => Self::Panic,
            13 => Self::IpcTrySend,
            14 => Self::IpcRecv,
            15 => Self::ReadChar,
            16 => Self::Exit,
            _ => return Err(()),
        })
    }
}

/// What a handler asks the trap layer to do.
pub(crate) enum SysResult {
    /// Write the value into the caller's `v0` and resume it.
    Value(i32),
    /// Resume without touching `v0` (a restored trap frame carries its own).
    Raw,
    /// Voluntary reschedule; the caller stays runnable.
    Yield,
    /// The caller parked itself (IPC receive).
    Block,
    /// The caller destroyed itself; never resumes.
    Dead,
}

pub(crate) type HandlerResult = Result<SysResult>;

/// The running Env, which every syscall implicitly names.
pub(crate) fn current_env() -> Result<EnvId> {
    sched::current().ok_or(Error::BadEnv)
}

/// Fetch the fifth argument from the caller's stack.
fn read_arg5(tf: &TrapFrame) -> Result<u32> {
    let space = env::space_of(current_env()?, false)?;
    space.read_u32(VirtAddr::new(tf.regs[reg::SP].wrapping_add(16)))
}

/// Decode and run one system call.
pub fn dispatch(tf: &mut TrapFrame) -> Disposition {
    tf.epc = tf.epc.wrapping_add(4);

    let no = tf.regs[reg::V0];
    let (a0, a1, a2, a3) = (
        tf.regs[reg::A0],
        tf.regs[reg::A1],
        tf.regs[reg::A2],
        tf.regs[reg::A3],
    );

    let result = match SyscallNo::try_from(no) {
        Err(()) => Err(Error::NoSys),
        Ok(call) => handle(call, tf, a0, a1, a2, a3),
    };

    match result {
        Ok(SysResult::Value(v)) => {
            tf.regs[reg::V0] = v as u32;
            Disposition::Resume
        }
        Ok(SysResult::Raw) => Disposition::Resume,
        Ok(SysResult::Yield) => {
            tf.regs[reg::V0] = 0;
            trap::save_current(tf);
            Disposition::Reschedule { yielding: true }
        }
        Ok(SysResult::Block) => {
            // The saved v0 is patched by the sender on delivery.
            trap::save_current(tf);
            Disposition::Reschedule { yielding: false }
        }
        Ok(SysResult::Dead) => Disposition::Reschedule { yielding: false },
        Err(e) => {
            tf.regs[reg::V0] = e.to_errno() as u32;
            Disposition::Resume
        }
    }
}

fn handle(
    call: SyscallNo,
    tf: &mut TrapFrame,
    a0: u32,
    a1: u32,
    a2: u32,
    a3: u32,
) -> HandlerResult {
    match call {
        SyscallNo::Putchar => io::sys_putchar(a0),
        SyscallNo::PrintConsole => io::sys_print(a0, a1),
        SyscallNo::GetEnvId => process::sys_getenvid(),
        SyscallNo::Yield => Ok(SysResult::Yield),
        SyscallNo::EnvDestroy => process::sys_env_destroy(a0),
        SyscallNo::SetFaultHandler => process::sys_set_fault_handler(a0, a1, a2),
        SyscallNo::MemAlloc => mem::sys_mem_alloc(a0, a1, a2),
        SyscallNo::MemMap => {
            let a4 = read_arg5(tf)?;
            mem::sys_mem_map(a0, a1, a2, a3, a4)
        }
        SyscallNo::MemUnmap => mem::sys_mem_unmap(a0, a1),
        SyscallNo::Exofork => process::sys_exofork(tf),
        SyscallNo::SetEnvStatus => process::sys_set_env_status(a0, a1),
        SyscallNo::SetTrapframe => process::sys_set_trapframe(a0, a1, tf),
        SyscallNo::Panic => io::sys_panic(a0),
        SyscallNo::IpcTrySend => ipc::sys_ipc_try_send(a0, a1, a2, a3),
        SyscallNo::IpcRecv => ipc::sys_ipc_recv(a0),
        SyscallNo::ReadChar => io::sys_read_char(),
        SyscallNo::Exit => process::sys_exit(a0),
    }
}

#[cfg(all(test, not(target_os = "none")))]
pub(crate) mod tests_support {
    use super::*;
    use crate::test_support;

    /// Issue a syscall as the current Env and return the value left in v0.
    pub(crate) fn call(no: SyscallNo, args: [u32; 4]) -> i32 {
        let mut tf = test_support::syscall_tf(no as u32, args);
        dispatch(&mut tf);
        tf.regs[reg::V0] as i32
    }

    /// Five-argument form; the fifth goes where the ABI puts it, on the
    /// caller's stack.
    pub(crate) fn call5(no: SyscallNo, args: [u32; 4], arg5: u32) -> i32 {
        let mut tf = test_support::syscall_tf(no as u32, args);
        let space = env::space_of(current_env().unwrap(), false).unwrap();
        space
            .write_u32(VirtAddr::new(tf.regs[reg::SP] + 16), arg5)
            .unwrap();
        dispatch(&mut tf);
        tf.regs[reg::V0] as i32
    }
}
