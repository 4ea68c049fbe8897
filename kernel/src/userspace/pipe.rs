//! Pipes: two fds over one shared ring-buffer page.
//!
//! Reader and writer run in lockstep around `yield`; a closed peer is
//! detected by comparing mapping counts of the fd page and the buffer page
//! (when the fd page's count catches up with the buffer's, the other end is
//! gone). The two counts are read back-to-back and validated against the
//! Env run counter so a preemption between the reads cannot fake a close.

use super::fd::{Dev, Fd, Stat, O_RDONLY, O_WRONLY};
use super::{cur_runs, fd, pageref, syscall};
use crate::env::EnvId;
use crate::error::Result;
use crate::mm::PteFlags;

/// Ring capacity in bytes.
pub const PIPE_BUF: usize = 32;

/// The shared page. `rpos`/`wpos` only grow; the ring index is the value
/// modulo `PIPE_BUF`.
#[repr(C)]
pub struct Pipe {
    pub rpos: u32,
    pub wpos: u32,
    pub buf: [u8; PIPE_BUF],
}

impl Pipe {
    pub const fn new() -> Self {
        Pipe {
            rpos: 0,
            wpos: 0,
            buf: [0; PIPE_BUF],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rpos == self.wpos
    }

    pub fn is_full(&self) -> bool {
        self.wpos - self.rpos >= PIPE_BUF as u32
    }

    pub fn push(&mut self, byte: u8) -> bool {
        if self.is_full() {
            return false;
        }
        self.buf[self.wpos as usize % PIPE_BUF] = byte;
        self.wpos += 1;
        true
    }

    pub fn pop(&mut self) -> Option<u8> {
        if self.is_empty() {
            return None;
        }
        let byte = self.buf[self.rpos as usize % PIPE_BUF];
        self.rpos += 1;
        Some(byte)
    }
}

impl Default for Pipe {
    fn default() -> Self {
        Self::new()
    }
}

pub const DEV_PIPE: Dev = Dev {
    id: b'p' as u32,
    name: "pipe",
    read: Some(pipe_read),
    write: Some(pipe_write),
    stat: Some(pipe_stat),
    close: pipe_close,
};

const PIPE_PERM: PteFlags = PteFlags::WRITABLE
    .union(PteFlags::USER)
    .union(PteFlags::LIBRARY);

/// Create a pipe; returns `(read_fd, write_fd)`.
pub fn pipe() -> Result<(usize, usize)> {
    let rd = fd::fd_alloc()?;
    syscall::mem_alloc(EnvId::CURRENT, fd::fd_va(rd), PIPE_PERM)?;
    let wr = match fd::fd_alloc() {
        Ok(wr) => wr,
        Err(e) => {
            let _ = syscall::mem_unmap(EnvId::CURRENT, fd::fd_va(rd));
            return Err(e);
        }
    };
    syscall::mem_alloc(EnvId::CURRENT, fd::fd_va(wr), PIPE_PERM)?;

    // One buffer page, visible through both data windows.
    syscall::mem_alloc(EnvId::CURRENT, fd::data_va(rd), PIPE_PERM)?;
    syscall::mem_map(
        EnvId::CURRENT,
        fd::data_va(rd),
        EnvId::CURRENT,
        fd::data_va(wr),
        PIPE_PERM,
    )?;

    // SAFETY: both fd pages were just mapped writable.
    unsafe {
        let r = &mut *(fd::fd_va(rd).as_u32() as *mut Fd);
        r.dev_id = DEV_PIPE.id;
        r.omode = O_RDONLY;
        r.offset = 0;
        let w = &mut *(fd::fd_va(wr).as_u32() as *mut Fd);
        w.dev_id = DEV_PIPE.id;
        w.omode = O_WRONLY;
        w.offset = 0;
    }
    Ok((rd, wr))
}

fn pipe_of(fd: &Fd) -> *mut Pipe {
    fd::data_va(fd::fd_index(fd)).as_u32() as *mut Pipe
}

/// True when the other end's fd page is gone: every remaining mapping of
/// the buffer page belongs to holders of this fd page.
fn pipe_is_closed(fd: &Fd) -> bool {
    let fd_page = fd::fd_va(fd::fd_index(fd));
    let buf_page = fd::data_va(fd::fd_index(fd));
    loop {
        let runs = cur_runs();
        let fd_refs = pageref(fd_page);
        let buf_refs = pageref(buf_page);
        if runs == cur_runs() {
            return fd_refs == buf_refs;
        }
        // Preempted between the two reads; sample again.
    }
}

fn pipe_read(fd: &mut Fd, buf: &mut [u8], _offset: u32) -> Result<usize> {
    // SAFETY: the buffer page is mapped LIBRARY-shared in this Env.
    let p = unsafe { &mut *pipe_of(fd) };
    let mut n = 0;
    while n < buf.len() {
        match p.pop() {
            Some(byte) => {
                buf[n] = byte;
                n += 1;
            }
            None if n > 0 => break,
            None => {
                if pipe_is_closed(fd) {
                    return Ok(0);
                }
                syscall::yield_now();
            }
        }
    }
    Ok(n)
}

fn pipe_write(fd: &mut Fd, buf: &[u8], _offset: u32) -> Result<usize> {
    // SAFETY: as in `pipe_read`.
    let p = unsafe { &mut *pipe_of(fd) };
    let mut n = 0;
    while n < buf.len() {
        if p.push(buf[n]) {
            n += 1;
        } else {
            if pipe_is_closed(fd) {
                return Ok(n);
            }
            syscall::yield_now();
        }
    }
    Ok(n)
}

fn pipe_stat(fd: &Fd, stat: &mut Stat) -> Result<()> {
    // SAFETY: as in `pipe_read`; read-only use.
    let p = unsafe { &*pipe_of(fd) };
    *stat = Stat::zeroed();
    stat.name[..5].copy_from_slice(b"pipe:");
    stat.size = p.wpos - p.rpos;
    Ok(())
}

fn pipe_close(fd: &mut Fd) -> Result<()> {
    let i = fd::fd_index(fd);
    syscall::mem_unmap(EnvId::CURRENT, fd::data_va(i))
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn ring_wraps_and_tracks_fullness() {
        let mut p = Pipe::new();
        assert!(p.is_empty());
        assert_eq!(p.pop(), None);

        for i in 0..PIPE_BUF {
            assert!(p.push(i as u8), "byte {} must fit", i);
        }
        assert!(p.is_full());
        assert!(!p.push(0xFF), "full ring rejects writes");

        for i in 0..PIPE_BUF {
            assert_eq!(p.pop(), Some(i as u8));
        }
        assert!(p.is_empty());

        // Positions keep counting up; indexing wraps.
        for round in 0..3u32 {
            for i in 0..(PIPE_BUF / 2) {
                assert!(p.push((round as usize * i) as u8));
            }
            for _ in 0..(PIPE_BUF / 2) {
                assert!(p.pop().is_some());
            }
        }
        assert_eq!(p.rpos, p.wpos);
        assert!(p.rpos > PIPE_BUF as u32, "positions are monotonic");
    }
}
