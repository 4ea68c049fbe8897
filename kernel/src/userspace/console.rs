//! Console device: reads poll the keyboard syscall, writes stream to the
//! kernel console.

use super::fd::{Dev, Fd, Stat, O_RDWR};
use super::{fd, syscall};
use crate::env::EnvId;
use crate::error::Result;
use crate::mm::PteFlags;

pub const DEV_CONS: Dev = Dev {
    id: b'c' as u32,
    name: "cons",
    read: Some(cons_read),
    write: Some(cons_write),
    stat: Some(cons_stat),
    close: cons_close,
};

/// Open an fd speaking to the console.
pub fn opencons() -> Result<usize> {
    let i = fd::fd_alloc()?;
    syscall::mem_alloc(
        EnvId::CURRENT,
        fd::fd_va(i),
        PteFlags::WRITABLE | PteFlags::USER | PteFlags::LIBRARY,
    )?;
    // SAFETY: the fd page was just mapped writable in this Env.
    let f = unsafe { &mut *(fd::fd_va(i).as_u32() as *mut Fd) };
    f.dev_id = DEV_CONS.id;
    f.omode = O_RDWR;
    f.offset = 0;
    Ok(i)
}

fn cons_read(_fd: &mut Fd, buf: &mut [u8], _offset: u32) -> Result<usize> {
    if buf.is_empty() {
        return Ok(0);
    }
    buf[0] = syscall::read_char();
    Ok(1)
}

fn cons_write(_fd: &mut Fd, buf: &[u8], _offset: u32) -> Result<usize> {
    syscall::print(buf)?;
    Ok(buf.len())
}

fn cons_stat(_fd: &Fd, stat: &mut Stat) -> Result<()> {
    *stat = Stat::zeroed();
    stat.name[..5].copy_from_slice(b"cons:");
    Ok(())
}

fn cons_close(_fd: &mut Fd) -> Result<()> {
    Ok(())
}
