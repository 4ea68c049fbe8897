//! File descriptors.
//!
//! An fd is a small integer naming a page at `FDTABLE + i * PAGE_SIZE` and
//! a 4 MiB data window at `FILEBASE + i * PDMAP`. Devices dispatch through
//! a per-device function table keyed by a device id byte. Fd pages are
//! mapped `LIBRARY` so fork/spawn peers share seek offsets.

use super::{console, file, pipe, syscall, va_flags};
use crate::env::EnvId;
use crate::error::{Error, Result};
use crate::mm::layout::{VirtAddr, FDTABLE, FILEBASE, PAGE_SIZE, PDMAP};
use crate::mm::PteFlags;

/// Per-process fd limit.
pub const MAXFD: usize = 32;
/// Longest file name the fd layer carries around.
pub const MAXNAMELEN: usize = 128;

/// Open modes.
pub const O_RDONLY: u32 = 0;
pub const O_WRONLY: u32 = 0x01;
pub const O_RDWR: u32 = 0x02;
pub const O_ACCMODE: u32 = 0x03;
pub const O_CREAT: u32 = 0x100;
pub const O_TRUNC: u32 = 0x200;

/// Descriptor header at the base of every fd page; device state follows.
#[derive(Debug)]
#[repr(C)]
pub struct Fd {
    pub dev_id: u32,
    pub offset: u32,
    pub omode: u32,
}

#[repr(C)]
pub struct Stat {
    pub name: [u8; MAXNAMELEN],
    pub size: u32,
    pub is_dir: u32,
}

impl Stat {
    pub fn zeroed() -> Self {
        Stat {
            name: [0; MAXNAMELEN],
            size: 0,
            is_dir: 0,
        }
    }
}

/// A device in the dispatch table. Entries are `None` where the device
/// cannot perform the operation.
pub struct Dev {
    pub id: u32,
    pub name: &'static str,
    pub read: Option<fn(&mut Fd, &mut [u8], u32) -> Result<usize>>,
    pub write: Option<fn(&mut Fd, &[u8], u32) -> Result<usize>>,
    pub stat: Option<fn(&Fd, &mut Stat) -> Result<()>>,
    pub close: fn(&mut Fd) -> Result<()>,
}

/// All known devices.
pub fn dev_lookup(dev_id: u32) -> Result<&'static Dev> {
    for dev in [&file::DEV_FILE, &pipe::DEV_PIPE, &console::DEV_CONS] {
        if dev.id == dev_id {
            return Ok(dev);
        }
    }
    Err(Error::Inval)
}

/// Address of fd page `i`.
pub const fn fd_va(i: usize) -> VirtAddr {
    VirtAddr::new(FDTABLE + (i * PAGE_SIZE) as u32)
}

/// Base of the data window belonging to fd `i`.
pub const fn data_va(i: usize) -> VirtAddr {
    VirtAddr::new(FILEBASE + (i as u32) * PDMAP)
}

/// Index of the fd page containing `fd`.
pub fn fd_index(fd: &Fd) -> usize {
    ((fd as *const Fd as u32 - FDTABLE) / PAGE_SIZE as u32) as usize
}

/// First fd slot whose page is unmapped.
pub fn fd_alloc() -> Result<usize> {
    for i in 0..MAXFD {
        if va_flags(fd_va(i)).is_none() {
            return Ok(i);
        }
    }
    Err(Error::MaxOpen)
}

/// The descriptor in slot `i`, if the page is mapped.
pub fn fd_lookup(i: usize) -> Result<*mut Fd> {
    if i >= MAXFD || va_flags(fd_va(i)).is_none() {
        return Err(Error::Inval);
    }
    Ok(fd_va(i).as_u32() as *mut Fd)
}

pub fn read(fdnum: usize, buf: &mut [u8]) -> Result<usize> {
    // SAFETY: fd_lookup verified the page is mapped; the runtime is the
    // only writer inside this Env.
    let fd = unsafe { &mut *fd_lookup(fdnum)? };
    if fd.omode & O_ACCMODE == O_WRONLY {
        return Err(Error::Inval);
    }
    let dev = dev_lookup(fd.dev_id)?;
    let read_fn = dev.read.ok_or(Error::Inval)?;
    let n = read_fn(fd, buf, fd.offset)?;
    fd.offset += n as u32;
    Ok(n)
}

pub fn write(fdnum: usize, buf: &[u8]) -> Result<usize> {
    // SAFETY: as in `read`.
    let fd = unsafe { &mut *fd_lookup(fdnum)? };
    if fd.omode & O_ACCMODE == O_RDONLY {
        return Err(Error::Inval);
    }
    let dev = dev_lookup(fd.dev_id)?;
    let write_fn = dev.write.ok_or(Error::Inval)?;
    let n = write_fn(fd, buf, fd.offset)?;
    fd.offset += n as u32;
    Ok(n)
}

pub fn seek(fdnum: usize, offset: u32) -> Result<()> {
    // SAFETY: as in `read`.
    let fd = unsafe { &mut *fd_lookup(fdnum)? };
    fd.offset = offset;
    Ok(())
}

pub fn fstat(fdnum: usize, stat: &mut Stat) -> Result<()> {
    // SAFETY: as in `read`.
    let fd = unsafe { &mut *fd_lookup(fdnum)? };
    let dev = dev_lookup(fd.dev_id)?;
    let stat_fn = dev.stat.ok_or(Error::Inval)?;
    stat_fn(fd, stat)
}

/// Close slot `i`: device teardown, then drop the fd page itself.
pub fn close(i: usize) -> Result<()> {
    // SAFETY: as in `read`.
    let fd = unsafe { &mut *fd_lookup(i)? };
    let dev = dev_lookup(fd.dev_id)?;
    let r = (dev.close)(fd);
    let _ = syscall::mem_unmap(EnvId::CURRENT, fd_va(i));
    r
}

/// Close everything that is open; exit path.
pub fn close_all() {
    for i in 0..MAXFD {
        if fd_lookup(i).is_ok() {
            let _ = close(i);
        }
    }
}

/// Duplicate `old` onto `new`: share the fd page and every mapped page of
/// the data window, so both descriptors move one seek offset.
pub fn dup(old: usize, new: usize) -> Result<usize> {
    fd_lookup(old)?;
    if new >= MAXFD {
        return Err(Error::Inval);
    }
    let _ = close(new);

    let share = |src: VirtAddr, dst: VirtAddr| -> Result<()> {
        if let Some(flags) = va_flags(src) {
            syscall::mem_map(
                EnvId::CURRENT,
                src,
                EnvId::CURRENT,
                dst,
                flags & PteFlags::MAPPABLE,
            )?;
        }
        Ok(())
    };
    share(fd_va(old), fd_va(new))?;
    for page in 0..(PDMAP as usize / PAGE_SIZE) {
        let off = (page * PAGE_SIZE) as u32;
        share(data_va(old).add(off), data_va(new).add(off))?;
    }
    Ok(new)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn window_arithmetic() {
        assert_eq!(fd_va(0).as_u32(), FDTABLE);
        assert_eq!(fd_va(3).as_u32(), FDTABLE + 3 * PAGE_SIZE as u32);
        assert_eq!(data_va(0).as_u32(), FILEBASE);
        assert_eq!(data_va(2).as_u32(), FILEBASE + 2 * PDMAP);
        // Windows stay inside user space and clear of each other.
        assert!(fd_va(MAXFD - 1).as_u32() < FILEBASE);
        assert!(data_va(MAXFD - 1).as_u32() + PDMAP <= crate::mm::layout::UTOP);
    }

    #[test]
    fn device_table_is_keyed_by_id() {
        assert_eq!(dev_lookup(file::DEV_FILE.id).unwrap().name, "file");
        assert_eq!(dev_lookup(pipe::DEV_PIPE.id).unwrap().name, "pipe");
        assert_eq!(dev_lookup(console::DEV_CONS.id).unwrap().name, "cons");
        assert!(dev_lookup(0xBEEF).is_err());
    }
}
