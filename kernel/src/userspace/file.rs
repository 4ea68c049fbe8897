//! File-server files as memory-mapped fds.
//!
//! `open` pulls every block of the file into the fd's data window with
//! `map` page gifts; reads and writes are then plain memory copies. The
//! server observes the seek offset and size through the `LIBRARY`-shared
//! `FileFd` page it gifted back at open time.

use super::fd::{self, Dev, Fd, Stat, O_ACCMODE, O_RDONLY};
use super::{fsipc, syscall};
use crate::env::EnvId;
use crate::error::{Error, Result};
use crate::mm::layout::PAGE_SIZE;

/// Regular file / directory kind tags, mirrored from the server's volume.
pub const FTYPE_REG: u32 = 0;
pub const FTYPE_DIR: u32 = 1;

/// File metadata as the server reports it.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct File {
    pub name: [u8; fd::MAXNAMELEN],
    pub size: u32,
    pub kind: u32,
}

impl File {
    pub fn zeroed() -> Self {
        File {
            name: [0; fd::MAXNAMELEN],
            size: 0,
            kind: FTYPE_REG,
        }
    }
}

/// The fd-page layout for file descriptors: the generic header followed by
/// the server-shared state.
#[repr(C)]
pub struct FileFd {
    pub fd: Fd,
    pub fileid: u32,
    pub file: File,
}

pub const DEV_FILE: Dev = Dev {
    id: b'f' as u32,
    name: "file",
    read: Some(file_read),
    write: Some(file_write),
    stat: Some(file_stat),
    close: file_close,
};

fn filefd(fd: &Fd) -> &FileFd {
    // SAFETY: file fds are created by `open`, which placed a FileFd at the
    // base of this fd page.
    unsafe { &*(fd as *const Fd as *const FileFd) }
}

fn filefd_mut(fd: &mut Fd) -> &mut FileFd {
    // SAFETY: as in `filefd`; the page is mapped writable.
    unsafe { &mut *(fd as *mut Fd as *mut FileFd) }
}

/// Open `path`, map its contents, and return the fd number.
pub fn open(path: &str, mode: u32) -> Result<usize> {
    let fdnum = fd::fd_alloc()?;
    fsipc::open(path, mode, fdnum)?;

    // SAFETY: the server just gifted the FileFd page into this slot.
    let ffd = unsafe { &*(fd::fd_va(fdnum).as_u32() as *const FileFd) };
    let fileid = ffd.fileid;
    let size = ffd.file.size;

    let data = fd::data_va(fdnum);
    let mut offset = 0;
    while offset < size {
        if let Err(e) = fsipc::map(fileid, offset, data.add(offset)) {
            let _ = fd::close(fdnum);
            return Err(e);
        }
        offset += PAGE_SIZE as u32;
    }
    Ok(fdnum)
}

/// Resize an open file, growing or shrinking the mapped window to match.
pub fn ftruncate(fdnum: usize, size: u32) -> Result<()> {
    // SAFETY: fd_lookup verified the page.
    let fd = unsafe { &mut *fd::fd_lookup(fdnum)? };
    truncate_inner(fd, fdnum, size)
}

fn truncate_inner(fd: &mut Fd, fdnum: usize, size: u32) -> Result<()> {
    if fd.omode & O_ACCMODE == O_RDONLY {
        return Err(Error::Inval);
    }
    let ffd = filefd_mut(fd);
    let old_size = ffd.file.size;
    let fileid = ffd.fileid;

    fsipc::set_size(fileid, size)?;
    ffd.file.size = size;

    let data = fd::data_va(fdnum);
    let mut off = round_up(old_size);
    while off < size {
        fsipc::map(fileid, off, data.add(off))?;
        off += PAGE_SIZE as u32;
    }
    let mut off = round_up(size);
    while off < old_size {
        syscall::mem_unmap(EnvId::CURRENT, data.add(off))?;
        off += PAGE_SIZE as u32;
    }
    Ok(())
}

fn round_up(n: u32) -> u32 {
    (n + PAGE_SIZE as u32 - 1) & !(PAGE_SIZE as u32 - 1)
}

fn data_ptr(fd: &Fd) -> *mut u8 {
    fd::data_va(fd::fd_index(fd)).as_u32() as *mut u8
}

/// Memory-mapped read: a bounded copy out of the data window.
fn file_read(fd: &mut Fd, buf: &mut [u8], offset: u32) -> Result<usize> {
    let size = filefd(fd).file.size;
    if offset >= size {
        return Ok(0);
    }
    let n = core::cmp::min(buf.len(), (size - offset) as usize);
    // SAFETY: `open`/`ftruncate` keep [0, size) of the window mapped.
    unsafe {
        core::ptr::copy_nonoverlapping(data_ptr(fd).add(offset as usize), buf.as_mut_ptr(), n);
    }
    Ok(n)
}

/// Memory-mapped write, growing the file when it runs past the end.
fn file_write(fd: &mut Fd, buf: &[u8], offset: u32) -> Result<usize> {
    let end = offset + buf.len() as u32;
    if end > filefd(fd).file.size {
        let fdnum = fd::fd_index(fd);
        truncate_inner(fd, fdnum, end)?;
    }
    // SAFETY: the window now covers [0, end).
    unsafe {
        core::ptr::copy_nonoverlapping(buf.as_ptr(), data_ptr(fd).add(offset as usize), buf.len());
    }
    Ok(buf.len())
}

fn file_stat(fd: &Fd, stat: &mut Stat) -> Result<()> {
    let ffd = filefd(fd);
    *stat = Stat::zeroed();
    stat.name = ffd.file.name;
    stat.size = ffd.file.size;
    stat.is_dir = (ffd.file.kind == FTYPE_DIR) as u32;
    Ok(())
}

/// Flush: report every page dirty, close the server side, drop the window.
fn file_close(fd: &mut Fd) -> Result<()> {
    let ffd = filefd(fd);
    let fileid = ffd.fileid;
    let size = ffd.file.size;
    let writable = fd.omode & O_ACCMODE != O_RDONLY;

    let mut off = 0;
    while off < size {
        if writable {
            fsipc::dirty(fileid, off)?;
        }
        off += PAGE_SIZE as u32;
    }
    fsipc::close(fileid)?;

    let data = fd::data_va(fd::fd_index(fd));
    let mut off = 0;
    while off < size {
        syscall::mem_unmap(EnvId::CURRENT, data.add(off))?;
        off += PAGE_SIZE as u32;
    }
    Ok(())
}

/// Delete by path.
pub fn remove(path: &str) -> Result<()> {
    fsipc::remove(path)
}

/// Flush the whole volume.
pub fn sync() -> Result<()> {
    fsipc::sync()
}

/// Convenience: read a whole file into a caller buffer.
pub fn readn(fdnum: usize, buf: &mut [u8]) -> Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = fd::read(fdnum, &mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}
