//! IPC system calls. The mechanics live in `crate::ipc`.

use super::{current_env, mem, HandlerResult, SysResult};
use crate::env::EnvId;
use crate::ipc;
use crate::mm::PteFlags;

/// Park the caller until a sender delivers. Returns `Block`; the delivered
/// value is read from the caller's descriptor once it resumes.
pub(super) fn sys_ipc_recv(dest_va: u32) -> HandlerResult {
    ipc::recv(current_env()?, dest_va)?;
    Ok(SysResult::Block)
}

/// One delivery attempt. The permission bits are only meaningful (and only
/// validated) when a page travels along.
pub(super) fn sys_ipc_try_send(dst: u32, value: u32, src_va: u32, perm: u32) -> HandlerResult {
    let perm = if src_va != 0 {
        mem::check_perm(perm)?
    } else {
        PteFlags::empty()
    };
    ipc::try_send(current_env()?, EnvId(dst), value, src_va, perm)?;
    Ok(SysResult::Value(0))
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::env::{self, EnvStatus};
    use crate::error::Error;
    use crate::syscall::tests_support::call;
    use crate::syscall::SyscallNo;
    use crate::test_support;
    use crate::trap::{reg, Disposition};

    /// Three senders race for one receive window; exactly the first retry
    /// after `ipc_recv` wins.
    #[test]
    fn receive_exclusivity() {
        let _k = test_support::boot(8 * 1024 * 1024);
        let r = test_support::fresh_runnable_env();
        let s1 = test_support::fresh_runnable_env();
        let s2 = test_support::fresh_runnable_env();
        let s3 = test_support::fresh_runnable_env();

        // R has not called ipc_recv yet: everybody loses.
        for (i, s) in [s1, s2, s3].iter().enumerate() {
            test_support::run_as(*s);
            assert_eq!(
                call(SyscallNo::IpcTrySend, [r.0, i as u32 + 1, 0, 0]),
                Error::IpcNotRecv.to_errno()
            );
        }

        // R parks itself.
        test_support::run_as(r);
        let mut tf = test_support::syscall_tf(SyscallNo::IpcRecv as u32, [0, 0, 0, 0]);
        assert_eq!(
            crate::syscall::dispatch(&mut tf),
            Disposition::Reschedule { yielding: false }
        );

        // S1 retries and wins; S2's retry loses again.
        test_support::run_as(s1);
        assert_eq!(call(SyscallNo::IpcTrySend, [r.0, 1, 0, 0]), 0);
        test_support::run_as(s2);
        assert_eq!(
            call(SyscallNo::IpcTrySend, [r.0, 2, 0, 0]),
            Error::IpcNotRecv.to_errno()
        );

        env::with_env(r, false, |e| {
            assert_eq!(e.status, EnvStatus::Runnable);
            assert_eq!(e.ipc.value, 1);
            assert_eq!(e.ipc.from_env, s1.0);
            assert_eq!(e.tf.regs[reg::V0], 0, "receiver's ipc_recv returns 0");
        })
        .unwrap();
    }
}
