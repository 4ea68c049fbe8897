//! File-server wire protocol and client stubs.
//!
//! Requests travel as a page gift: the client fills the page at
//! `FSIPC_BUF`, sends it with the request code as the IPC value, and parks
//! in `ipc_recv`. The reply is a status word; `open` and `map` replies
//! additionally gift a page (the shared `FileFd` slot, or a file block)
//! mapped at the va the client chose.

use super::{fd, ipc, syscall, va_flags};
use crate::env::EnvId;
use crate::error::{from_syscall, Error, Result};
use crate::mm::layout::{VirtAddr, FSIPC_BUF};
use crate::mm::PteFlags;

/// Longest path accepted on the wire.
pub const MAXPATHLEN: usize = 128;

/// Request codes.
pub const FSREQ_OPEN: u32 = 1;
pub const FSREQ_MAP: u32 = 2;
pub const FSREQ_SET_SIZE: u32 = 3;
pub const FSREQ_CLOSE: u32 = 4;
pub const FSREQ_DIRTY: u32 = 5;
pub const FSREQ_REMOVE: u32 = 6;
pub const FSREQ_SYNC: u32 = 7;

/// A decoded request, borrowing path bytes from the request page.
#[derive(Debug, PartialEq, Eq)]
pub enum Request<'a> {
    Open { path: &'a str, omode: u32 },
    Map { fileid: u32, offset: u32 },
    SetSize { fileid: u32, size: u32 },
    Close { fileid: u32 },
    Dirty { fileid: u32, offset: u32 },
    Remove { path: &'a str },
    Sync,
}

fn word(bytes: &[u8], offset: usize) -> Result<u32> {
    let end = offset.checked_add(4).ok_or(Error::Inval)?;
    let chunk = bytes.get(offset..end).ok_or(Error::Inval)?;
    Ok(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
}

fn path(bytes: &[u8]) -> Result<&str> {
    let field = bytes.get(..MAXPATHLEN).ok_or(Error::Inval)?;
    let len = field.iter().position(|&b| b == 0).ok_or(Error::BadPath)?;
    core::str::from_utf8(&field[..len]).map_err(|_| Error::BadPath)
}

/// Parse the request page as seen by the server.
pub fn decode(code: u32, bytes: &[u8]) -> Result<Request<'_>> {
    match code {
        FSREQ_OPEN => Ok(Request::Open {
            path: path(bytes)?,
            omode: word(bytes, MAXPATHLEN)?,
        }),
        FSREQ_MAP => Ok(Request::Map {
            fileid: word(bytes, 0)?,
            offset: word(bytes, 4)?,
        }),
        FSREQ_SET_SIZE => Ok(Request::SetSize {
            fileid: word(bytes, 0)?,
            size: word(bytes, 4)?,
        }),
        FSREQ_CLOSE => Ok(Request::Close {
            fileid: word(bytes, 0)?,
        }),
        FSREQ_DIRTY => Ok(Request::Dirty {
            fileid: word(bytes, 0)?,
            offset: word(bytes, 4)?,
        }),
        FSREQ_REMOVE => Ok(Request::Remove { path: path(bytes)? }),
        FSREQ_SYNC => Ok(Request::Sync),
        _ => Err(Error::Inval),
    }
}

/// The file server is the second Env the kernel launches at boot.
fn fs_env() -> EnvId {
    let e = super::env_slot(1);
    // SAFETY: reading the id field through the read-only window.
    EnvId(unsafe { core::ptr::read_volatile(core::ptr::addr_of!((*e).id)).0 })
}

/// The request page, mapped on first use.
fn req_page() -> Result<*mut u8> {
    let va = VirtAddr::new(FSIPC_BUF);
    if va_flags(va).is_none() {
        syscall::mem_alloc(EnvId::CURRENT, va, PteFlags::WRITABLE | PteFlags::USER)?;
    }
    Ok(FSIPC_BUF as *mut u8)
}

/// Gift the request page to the server and wait for the status reply.
fn call(code: u32, dest_va: u32) -> Result<u32> {
    ipc::send(fs_env(), code, FSIPC_BUF, PteFlags::WRITABLE | PteFlags::USER);
    let (status, _, _) = ipc::recv(dest_va);
    from_syscall(status as i32)
}

fn put_words(page: *mut u8, words: &[u32]) {
    for (i, w) in words.iter().enumerate() {
        // SAFETY: the request page is one writable page; i stays tiny.
        unsafe { (page as *mut u32).add(i).write(*w) };
    }
}

fn put_path(page: *mut u8, p: &str) -> Result<()> {
    if p.len() >= MAXPATHLEN {
        return Err(Error::BadPath);
    }
    // SAFETY: MAXPATHLEN bytes at the base of the writable request page.
    unsafe {
        core::ptr::write_bytes(page, 0, MAXPATHLEN);
        core::ptr::copy_nonoverlapping(p.as_ptr(), page, p.len());
    }
    Ok(())
}

/// Open `path`; the server maps the shared `FileFd` page at fd slot
/// `fdnum`'s page.
pub fn open(p: &str, omode: u32, fdnum: usize) -> Result<()> {
    let page = req_page()?;
    put_path(page, p)?;
    // SAFETY: omode word sits right after the path field, in the page.
    unsafe { (page.add(MAXPATHLEN) as *mut u32).write(omode) };
    call(FSREQ_OPEN, fd::fd_va(fdnum).as_u32())?;
    Ok(())
}

/// Pull one file block into this space at `dest_va`.
pub fn map(fileid: u32, offset: u32, dest_va: VirtAddr) -> Result<()> {
    let page = req_page()?;
    put_words(page, &[fileid, offset]);
    call(FSREQ_MAP, dest_va.as_u32())?;
    Ok(())
}

pub fn set_size(fileid: u32, size: u32) -> Result<()> {
    let page = req_page()?;
    put_words(page, &[fileid, size]);
    call(FSREQ_SET_SIZE, 0)?;
    Ok(())
}

pub fn close(fileid: u32) -> Result<()> {
    let page = req_page()?;
    put_words(page, &[fileid]);
    call(FSREQ_CLOSE, 0)?;
    Ok(())
}

/// Tell the server a block was written and needs write-back.
pub fn dirty(fileid: u32, offset: u32) -> Result<()> {
    let page = req_page()?;
    put_words(page, &[fileid, offset]);
    call(FSREQ_DIRTY, 0)?;
    Ok(())
}

pub fn remove(p: &str) -> Result<()> {
    let page = req_page()?;
    put_path(page, p)?;
    call(FSREQ_REMOVE, 0)?;
    Ok(())
}

pub fn sync() -> Result<()> {
    let _ = req_page()?;
    call(FSREQ_SYNC, 0)?;
    Ok(())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn open_request(pathname: &str, omode: u32) -> [u8; MAXPATHLEN + 4] {
        let mut buf = [0u8; MAXPATHLEN + 4];
        buf[..pathname.len()].copy_from_slice(pathname.as_bytes());
        buf[MAXPATHLEN..].copy_from_slice(&omode.to_le_bytes());
        buf
    }

    #[test]
    fn decode_round_trips_each_family() {
        let open = open_request("/motd", 0x102);
        assert_eq!(
            decode(FSREQ_OPEN, &open).unwrap(),
            Request::Open {
                path: "/motd",
                omode: 0x102
            }
        );

        let mut two = [0u8; 8];
        two[..4].copy_from_slice(&7u32.to_le_bytes());
        two[4..].copy_from_slice(&0x3000u32.to_le_bytes());
        assert_eq!(
            decode(FSREQ_MAP, &two).unwrap(),
            Request::Map {
                fileid: 7,
                offset: 0x3000
            }
        );
        assert_eq!(
            decode(FSREQ_DIRTY, &two).unwrap(),
            Request::Dirty {
                fileid: 7,
                offset: 0x3000
            }
        );
        assert_eq!(
            decode(FSREQ_SET_SIZE, &two).unwrap(),
            Request::SetSize {
                fileid: 7,
                size: 0x3000
            }
        );
        assert_eq!(decode(FSREQ_CLOSE, &two).unwrap(), Request::Close { fileid: 7 });
        assert_eq!(decode(FSREQ_SYNC, &[]).unwrap(), Request::Sync);
        assert_eq!(decode(99, &two), Err(Error::Inval));
    }

    #[test]
    fn malformed_requests_are_rejected() {
        // Path with no terminator.
        let mut raw = [0x41u8; MAXPATHLEN + 4];
        raw[MAXPATHLEN..].copy_from_slice(&0u32.to_le_bytes());
        assert_eq!(decode(FSREQ_OPEN, &raw), Err(Error::BadPath));

        // Truncated body.
        assert_eq!(decode(FSREQ_MAP, &[1, 2]), Err(Error::Inval));
        assert_eq!(decode(FSREQ_OPEN, &[0u8; 16]), Err(Error::Inval));
    }
}
