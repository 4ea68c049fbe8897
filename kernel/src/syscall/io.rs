//! Console system calls.

use super::{current_env, HandlerResult, SysResult};
use crate::arch;
use crate::env;
use crate::error::Error;
use crate::mm::layout::{user_range_ok, VirtAddr};

pub(super) fn sys_putchar(c: u32) -> HandlerResult {
    arch::console::putchar(c as u8);
    Ok(SysResult::Value(0))
}

/// Write `len` bytes from the caller's memory to the console.
pub(super) fn sys_print(va: u32, len: u32) -> HandlerResult {
    let va = VirtAddr::new(va);
    if !user_range_ok(va, len as usize) {
        return Err(Error::Inval);
    }
    let space = env::space_of(current_env()?, false)?;

    let mut chunk = [0u8; 128];
    let mut done = 0usize;
    while done < len as usize {
        let n = core::cmp::min(chunk.len(), len as usize - done);
        space.read_bytes(va.add(done as u32), &mut chunk[..n])?;
        for &b in &chunk[..n] {
            arch::console::putchar(b);
        }
        done += n;
    }
    Ok(SysResult::Value(0))
}

/// Kernel panic carrying a user-supplied NUL-terminated message. Treated as
/// an unrecoverable bug, exactly like a kernel assertion.
pub(super) fn sys_panic(msg_va: u32) -> HandlerResult {
    let mut buf = [0u8; 128];
    let text = current_env()
        .and_then(|cur| env::space_of(cur, false))
        .and_then(|space| {
            let n = space.read_cstr(VirtAddr::new(msg_va), buf.len(), &mut buf)?;
            Ok(n)
        })
        .ok()
        .and_then(|n| core::str::from_utf8(&buf[..n]).ok())
        .unwrap_or("<unreadable>");
    panic!("user panic: {}", text);
}

/// Read one console byte for the shell. Blocks by polling on real hardware;
/// on the host an empty input queue reads as 0 so tests never hang.
pub(super) fn sys_read_char() -> HandlerResult {
    loop {
        if let Some(c) = arch::console::getchar() {
            return Ok(SysResult::Value(c as i32));
        }
        if cfg!(not(target_os = "none")) {
            return Ok(SysResult::Value(0));
        }
        core::hint::spin_loop();
    }
}
