//! File-server side of the fsipc protocol.
//!
//! The server Env owns the disk through a `FileVolume` (the block driver
//! and on-disk layout live behind that trait) and answers one request at a
//! time: receive the gifted request page, dispatch, reply with a status
//! word and possibly a page gift of its own.

use super::fd::{Fd, O_ACCMODE};
use super::file::{File, FileFd, DEV_FILE};
use super::fsipc::{self, Request};
use super::{ipc, syscall};
use crate::env::EnvId;
use crate::error::{Error, Result};
use crate::mm::layout::{VirtAddr, PAGE_SIZE};
use crate::mm::PteFlags;

/// Where the server maps incoming request pages.
pub const REQVA: u32 = 0x4FFF_F000;
/// Base of the server's per-open `FileFd` pages.
pub const FILEFD_BASE: u32 = 0x5000_0000;
/// Server-wide open-file limit.
pub const MAXOPEN: usize = 512;

/// The disk-owning backend. Block pages handed out by `block_page` must be
/// page-aligned vas in the server's own space, stable until `close`.
pub trait FileVolume {
    /// Look `path` up (honoring `O_CREAT`/`O_TRUNC` in `omode`); returns a
    /// volume-unique file id.
    fn open(&mut self, path: &str, omode: u32) -> Result<u32>;
    /// Metadata snapshot for a live file id.
    fn meta(&mut self, fileid: u32) -> Result<File>;
    /// Va of the block holding `offset`, mapping it in if needed.
    fn block_page(&mut self, fileid: u32, offset: u32) -> Result<u32>;
    fn set_size(&mut self, fileid: u32, size: u32) -> Result<()>;
    fn mark_dirty(&mut self, fileid: u32, offset: u32) -> Result<()>;
    fn close(&mut self, fileid: u32) -> Result<()>;
    fn remove(&mut self, path: &str) -> Result<()>;
    fn sync(&mut self) -> Result<()>;
}

/// Reply to one request: a status word, plus an optional page gift.
pub struct Reply {
    pub status: i32,
    pub gift: Option<(u32, PteFlags)>,
}

impl Reply {
    fn ok() -> Self {
        Reply {
            status: 0,
            gift: None,
        }
    }

    fn err(e: Error) -> Self {
        Reply {
            status: e.to_errno(),
            gift: None,
        }
    }
}

const SHARE_PERM: PteFlags = PteFlags::WRITABLE
    .union(PteFlags::USER)
    .union(PteFlags::LIBRARY);

#[derive(Clone, Copy)]
struct OpenSlot {
    fileid: u32,
}

/// The serving state: the volume plus the table of gifted `FileFd` pages.
pub struct Server<V: FileVolume> {
    volume: V,
    open_tab: [Option<OpenSlot>; MAXOPEN],
}

impl<V: FileVolume> Server<V> {
    pub fn new(volume: V) -> Self {
        Server {
            volume,
            open_tab: [None; MAXOPEN],
        }
    }

    /// Request loop; never returns. Runs as the dedicated file-server Env.
    pub fn serve(&mut self) -> ! {
        loop {
            let (code, whom, _perm) = ipc::recv(REQVA);
            // SAFETY: the sender's request page was just mapped at REQVA.
            let bytes = unsafe { core::slice::from_raw_parts(REQVA as *const u8, PAGE_SIZE) };
            let reply = self.dispatch(code, bytes);
            let _ = syscall::mem_unmap(EnvId::CURRENT, VirtAddr::new(REQVA));
            match reply.gift {
                Some((va, perm)) => ipc::send(whom, reply.status as u32, va, perm),
                None => ipc::send(whom, reply.status as u32, 0, PteFlags::empty()),
            }
        }
    }

    /// Decode and execute one request. Pure with respect to IPC, which is
    /// what makes the protocol testable off-target.
    pub fn dispatch(&mut self, code: u32, bytes: &[u8]) -> Reply {
        let req = match fsipc::decode(code, bytes) {
            Ok(req) => req,
            Err(e) => return Reply::err(e),
        };
        let result = match req {
            Request::Open { path, omode } => self.do_open(path, omode),
            Request::Map { fileid, offset } => self.do_map(fileid, offset),
            Request::SetSize { fileid, size } => self.volume.set_size(fileid, size).map(|()| Reply::ok()),
            Request::Close { fileid } => self.do_close(fileid),
            Request::Dirty { fileid, offset } => {
                self.volume.mark_dirty(fileid, offset).map(|()| Reply::ok())
            }
            Request::Remove { path } => self.volume.remove(path).map(|()| Reply::ok()),
            Request::Sync => self.volume.sync().map(|()| Reply::ok()),
        };
        result.unwrap_or_else(Reply::err)
    }

    /// Open: allocate an open slot, build the shared `FileFd` page, and
    /// gift it to the client.
    fn do_open(&mut self, path: &str, omode: u32) -> Result<Reply> {
        let slot = self
            .open_tab
            .iter()
            .position(|s| s.is_none())
            .ok_or(Error::MaxOpen)?;
        let fileid = self.volume.open(path, omode)?;
        let meta = self.volume.meta(fileid)?;

        let ff_va = VirtAddr::new(FILEFD_BASE + (slot * PAGE_SIZE) as u32);
        syscall::mem_alloc(EnvId::CURRENT, ff_va, SHARE_PERM)?;
        // SAFETY: the FileFd page was just mapped writable.
        unsafe {
            *(ff_va.as_u32() as *mut FileFd) = FileFd {
                fd: Fd {
                    dev_id: DEV_FILE.id,
                    offset: 0,
                    omode: omode & O_ACCMODE,
                },
                fileid,
                file: meta,
            };
        }
        self.open_tab[slot] = Some(OpenSlot { fileid });
        Ok(Reply {
            status: 0,
            gift: Some((ff_va.as_u32(), SHARE_PERM)),
        })
    }

    fn do_map(&mut self, fileid: u32, offset: u32) -> Result<Reply> {
        let va = self.volume.block_page(fileid, offset)?;
        Ok(Reply {
            status: 0,
            gift: Some((va, SHARE_PERM)),
        })
    }

    fn do_close(&mut self, fileid: u32) -> Result<Reply> {
        self.volume.close(fileid)?;
        for slot in self.open_tab.iter_mut() {
            if matches!(slot, Some(s) if s.fileid == fileid) {
                *slot = None;
            }
        }
        Ok(Reply::ok())
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::string::String;
    use alloc::vec;
    use alloc::vec::Vec;

    use super::*;
    use crate::userspace::fsipc::{FSREQ_CLOSE, FSREQ_DIRTY, FSREQ_MAP, FSREQ_REMOVE, FSREQ_SYNC};

    /// A volume that records calls and serves one file with two blocks.
    #[derive(Default)]
    struct MockVolume {
        dirties: Vec<(u32, u32)>,
        closed: bool,
        synced: bool,
        removed: Option<String>,
    }

    impl FileVolume for MockVolume {
        fn open(&mut self, _path: &str, _omode: u32) -> Result<u32> {
            Ok(1)
        }
        fn meta(&mut self, _fileid: u32) -> Result<File> {
            Ok(File::zeroed())
        }
        fn block_page(&mut self, fileid: u32, offset: u32) -> Result<u32> {
            if fileid != 1 {
                return Err(Error::NotFound);
            }
            if offset >= 2 * PAGE_SIZE as u32 {
                return Err(Error::NoDisk);
            }
            Ok(0x6100_0000 + offset)
        }
        fn set_size(&mut self, _fileid: u32, _size: u32) -> Result<()> {
            Ok(())
        }
        fn mark_dirty(&mut self, fileid: u32, offset: u32) -> Result<()> {
            self.dirties.push((fileid, offset));
            Ok(())
        }
        fn close(&mut self, _fileid: u32) -> Result<()> {
            self.closed = true;
            Ok(())
        }
        fn remove(&mut self, path: &str) -> Result<()> {
            self.removed = Some(String::from(path));
            Ok(())
        }
        fn sync(&mut self) -> Result<()> {
            self.synced = true;
            Ok(())
        }
    }

    fn words(a: u32, b: u32) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[..4].copy_from_slice(&a.to_le_bytes());
        buf[4..].copy_from_slice(&b.to_le_bytes());
        buf
    }

    #[test]
    fn map_replies_with_a_block_gift() {
        let mut server = Server::new(MockVolume::default());
        let reply = server.dispatch(FSREQ_MAP, &words(1, PAGE_SIZE as u32));
        assert_eq!(reply.status, 0);
        let (va, perm) = reply.gift.expect("map must gift a page");
        assert_eq!(va, 0x6100_0000 + PAGE_SIZE as u32);
        assert!(perm.contains(PteFlags::LIBRARY));

        // Out-of-range block: NoDisk, no gift.
        let reply = server.dispatch(FSREQ_MAP, &words(1, 8 * PAGE_SIZE as u32));
        assert_eq!(reply.status, Error::NoDisk.to_errno());
        assert!(reply.gift.is_none());

        // Unknown file.
        let reply = server.dispatch(FSREQ_MAP, &words(9, 0));
        assert_eq!(reply.status, Error::NotFound.to_errno());
    }

    #[test]
    fn bookkeeping_requests_reach_the_volume() {
        let mut server = Server::new(MockVolume::default());

        assert_eq!(server.dispatch(FSREQ_DIRTY, &words(1, 0x1000)).status, 0);
        assert_eq!(server.volume.dirties, vec![(1, 0x1000)]);

        assert_eq!(server.dispatch(FSREQ_CLOSE, &words(1, 0)).status, 0);
        assert!(server.volume.closed);

        let mut remove = [0u8; fsipc::MAXPATHLEN];
        remove[..4].copy_from_slice(b"/old");
        assert_eq!(server.dispatch(FSREQ_REMOVE, &remove).status, 0);
        assert_eq!(server.volume.removed.as_deref(), Some("/old"));

        assert_eq!(server.dispatch(FSREQ_SYNC, &[]).status, 0);
        assert!(server.volume.synced);

        // Garbage request code.
        assert_eq!(server.dispatch(42, &[]).status, Error::Inval.to_errno());
    }
}
