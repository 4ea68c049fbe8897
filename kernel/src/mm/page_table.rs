//! Two-level page tables and address spaces.
//!
//! Page directories and page tables are ordinary physical frames holding
//! 1024 entries each, reached through `arch::frame_ptr`. An `AddressSpace`
//! is a handle `{pgdir, asid}`; operations mutate the underlying frames, so
//! they take `&self` — exclusivity comes from the single-threaded kernel,
//! not the borrow checker.

use bitflags::bitflags;

use super::frame::{self, FrameId};
use super::layout::{PhysAddr, VirtAddr, NPTENTRIES, PAGE_SIZE, PDSHIFT, PGSHIFT, ULIM, UTOP, UVPT};
use crate::arch;
use crate::error::{Error, Result};

bitflags! {
    /// Software-visible permission bits, stored in the low 12 bits of a PTE.
    /// `arch::mips::tlb` strips what the hardware must not see.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        /// Copy-on-write: write faults turn the mapping into a private copy.
        const COW = 1 << 0;
        /// Shared across fork; both sides observe writes.
        const LIBRARY = 1 << 1;
        /// Written to (consulted by the file-server write-back path).
        const DIRTY = 1 << 2;
        /// Writes allowed.
        const WRITABLE = 1 << 3;
        /// User access allowed.
        const USER = 1 << 4;
        /// TLB entries live across address-space switches.
        const GLOBAL = 1 << 5;
        /// Entry is live.
        const VALID = 1 << 6;
    }
}

impl PteFlags {
    /// The exact subset user requests may carry through `mem_alloc`,
    /// `mem_map` and IPC page gifts.
    pub const MAPPABLE: PteFlags = PteFlags::COW
        .union(PteFlags::LIBRARY)
        .union(PteFlags::DIRTY)
        .union(PteFlags::WRITABLE)
        .union(PteFlags::USER);
}

/// One page-table (or page-directory) entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pte(u32);

impl Pte {
    pub const EMPTY: Pte = Pte(0);

    pub const fn new(frame: FrameId, flags: PteFlags) -> Self {
        Pte((frame.0 << PGSHIFT) | flags.bits())
    }

    pub const fn frame(self) -> FrameId {
        FrameId(self.0 >> PGSHIFT)
    }

    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & (PAGE_SIZE as u32 - 1))
    }

    pub fn is_valid(self) -> bool {
        self.flags().contains(PteFlags::VALID)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

/// Pointer to the entry array held in `frame`.
fn entries(frame: FrameId) -> *mut Pte {
    arch::frame_ptr(frame.base_addr()) as *mut Pte
}

/// Read entry `index` of the table in `frame`.
fn read_entry(frame: FrameId, index: usize) -> Pte {
    debug_assert!(index < NPTENTRIES);
    // SAFETY: every page-table frame holds NPTENTRIES entries; index is in
    // range.
    unsafe { *entries(frame).add(index) }
}

/// Overwrite entry `index` of the table in `frame`.
fn write_entry(frame: FrameId, index: usize, pte: Pte) {
    debug_assert!(index < NPTENTRIES);
    // SAFETY: as for `read_entry`; single-threaded kernel.
    unsafe { *entries(frame).add(index) = pte }
}

/// A handle to one environment's page directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct AddressSpace {
    pub pgdir: FrameId,
    pub asid: u32,
}

impl AddressSpace {
    /// Build a fresh address space: shared kernel-window directory entries
    /// copied from the boot template, plus the `UVPT` self-map.
    pub fn new(asid: u32) -> Result<Self> {
        let pgdir = frame::alloc(true)?;
        frame::inc_ref(pgdir);
        let space = AddressSpace { pgdir, asid };

        let template = super::template_pgdir();
        for pdx in VirtAddr::new(UTOP).pdx()..VirtAddr::new(ULIM).pdx() {
            write_entry(pgdir, pdx, read_entry(template, pdx));
        }
        // User code reads its own page tables through this recursive slot.
        write_entry(
            pgdir,
            VirtAddr::new(UVPT).pdx(),
            Pte::new(pgdir, PteFlags::VALID | PteFlags::USER),
        );
        Ok(space)
    }

    /// Descend to the PTE for `va`, optionally allocating the page table.
    /// Returns `None` when the table is absent and `create` is false.
    pub fn walk(&self, va: VirtAddr, create: bool) -> Result<Option<*mut Pte>> {
        let pde = read_entry(self.pgdir, va.pdx());
        let table = if pde.is_valid() {
            pde.frame()
        } else if !create {
            return Ok(None);
        } else {
            let table = frame::alloc(true)?;
            frame::inc_ref(table);
            write_entry(
                self.pgdir,
                va.pdx(),
                Pte::new(table, PteFlags::VALID | PteFlags::WRITABLE | PteFlags::USER),
            );
            table
        };
        // SAFETY: `table` holds a page table; ptx is in range.
        Ok(Some(unsafe { entries(table).add(va.ptx()) }))
    }

    /// Current mapping of `va`, if any.
    pub fn lookup(&self, va: VirtAddr) -> Option<(FrameId, Pte)> {
        let ptep = self.walk(va, false).expect("walk without create cannot fail")?;
        // SAFETY: walk returned a live PTE slot.
        let pte = unsafe { *ptep };
        if pte.is_valid() {
            Some((pte.frame(), pte))
        } else {
            None
        }
    }

    /// Map `frame` at `va` with `perm | VALID`.
    ///
    /// Re-mapping the same frame only updates the permission bits; a
    /// different resident frame is removed first.
    pub fn insert(&self, frame_id: FrameId, va: VirtAddr, perm: PteFlags) -> Result<()> {
        let flags = perm | PteFlags::VALID;
        if let Some((resident, _)) = self.lookup(va) {
            if resident == frame_id {
                let ptep = self.walk(va, false)?.expect("looked-up PTE must exist");
                // SAFETY: ptep from walk; see module discipline.
                unsafe { *ptep = Pte::new(frame_id, flags) };
                arch::tlb::invalidate(self.asid, va);
                return Ok(());
            }
            self.remove(va);
        }
        let ptep = self.walk(va, true)?.expect("walk with create returns a slot");
        frame::inc_ref(frame_id);
        // SAFETY: ptep from walk; see module discipline.
        unsafe { *ptep = Pte::new(frame_id, flags) };
        arch::tlb::invalidate(self.asid, va);
        Ok(())
    }

    /// Unmap `va` if mapped, dropping one reference on its frame.
    pub fn remove(&self, va: VirtAddr) {
        if let Some(ptep) = self.walk(va, false).expect("walk without create cannot fail") {
            // SAFETY: ptep from walk.
            let pte = unsafe { *ptep };
            if pte.is_valid() {
                frame::dec_ref(pte.frame());
                // SAFETY: ptep from walk.
                unsafe { *ptep = Pte::EMPTY };
                arch::tlb::invalidate(self.asid, va);
            }
        }
    }

    /// Copy out of this space into `buf`, re-walking at every page boundary.
    /// Fails with `Inval` if any page of the range is unmapped.
    pub fn read_bytes(&self, va: VirtAddr, buf: &mut [u8]) -> Result<()> {
        self.for_each_chunk(va, buf.len(), |frame, page_off, dst_off, n| {
            // SAFETY: source is n bytes inside a mapped frame; destination
            // is inside `buf`.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    arch::frame_ptr(frame.base_addr()).add(page_off),
                    buf.as_mut_ptr().add(dst_off),
                    n,
                );
            }
        })
    }

    /// Copy `bytes` into this space. Fails with `Inval` on an unmapped page.
    pub fn write_bytes(&self, va: VirtAddr, bytes: &[u8]) -> Result<()> {
        self.for_each_chunk(va, bytes.len(), |frame, page_off, src_off, n| {
            // SAFETY: destination is n bytes inside a mapped frame; source
            // is inside `bytes`.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    bytes.as_ptr().add(src_off),
                    arch::frame_ptr(frame.base_addr()).add(page_off),
                    n,
                );
            }
        })
    }

    fn for_each_chunk(
        &self,
        va: VirtAddr,
        len: usize,
        mut chunk: impl FnMut(FrameId, usize, usize, usize),
    ) -> Result<()> {
        let mut done = 0;
        while done < len {
            let cur = va.add(done as u32);
            let page_off = cur.page_offset();
            let n = core::cmp::min(PAGE_SIZE - page_off, len - done);
            let (frame, _) = self.lookup(cur.page_align_down()).ok_or(Error::Inval)?;
            chunk(frame, page_off, done, n);
            done += n;
        }
        Ok(())
    }

    /// Read one aligned word.
    pub fn read_u32(&self, va: VirtAddr) -> Result<u32> {
        if va.0 & 3 != 0 {
            return Err(Error::Inval);
        }
        let mut buf = [0u8; 4];
        self.read_bytes(va, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Write one aligned word.
    pub fn write_u32(&self, va: VirtAddr, value: u32) -> Result<()> {
        if va.0 & 3 != 0 {
            return Err(Error::Inval);
        }
        self.write_bytes(va, &value.to_le_bytes())
    }

    /// Read a NUL-terminated string of at most `cap` bytes.
    pub fn read_cstr(&self, va: VirtAddr, cap: usize, buf: &mut [u8]) -> Result<usize> {
        let mut len = 0;
        while len < cap && len < buf.len() {
            let mut byte = [0u8; 1];
            self.read_bytes(va.add(len as u32), &mut byte)?;
            if byte[0] == 0 {
                break;
            }
            buf[len] = byte[0];
            len += 1;
        }
        Ok(len)
    }

    /// Tear down every user mapping, returning page tables and the directory
    /// to the allocator. The shared kernel windows above `UTOP` are left
    /// untouched (they belong to the boot template).
    pub fn destroy_user(&self) {
        for pdx in 0..VirtAddr::new(UTOP).pdx() {
            let pde = read_entry(self.pgdir, pdx);
            if !pde.is_valid() {
                continue;
            }
            let table = pde.frame();
            for ptx in 0..NPTENTRIES {
                let pte = read_entry(table, ptx);
                if pte.is_valid() {
                    frame::dec_ref(pte.frame());
                    write_entry(table, ptx, Pte::EMPTY);
                    let va = VirtAddr::new(((pdx as u32) << PDSHIFT) | ((ptx as u32) << PGSHIFT));
                    arch::tlb::invalidate(self.asid, va);
                }
            }
            frame::dec_ref(table);
            write_entry(self.pgdir, pdx, Pte::EMPTY);
        }
        frame::dec_ref(self.pgdir);
    }

    pub fn pgdir_pa(&self) -> PhysAddr {
        self.pgdir.base_addr()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::layout::UTEXT;
    use crate::test_support;

    fn fresh_space() -> AddressSpace {
        AddressSpace::new(1).expect("address space creation")
    }

    #[test]
    fn insert_lookup_remove() {
        let _k = test_support::boot(8 * 1024 * 1024);
        let space = fresh_space();
        let va = VirtAddr::new(UTEXT);
        let f = frame::alloc(true).unwrap();

        space.insert(f, va, PteFlags::WRITABLE | PteFlags::USER).unwrap();
        assert_eq!(frame::ref_count(f), 1);
        let (mapped, pte) = space.lookup(va).expect("mapping must be visible");
        assert_eq!(mapped, f);
        assert!(pte.flags().contains(PteFlags::VALID | PteFlags::WRITABLE | PteFlags::USER));

        space.remove(va);
        assert!(space.lookup(va).is_none());
        // Last reference gone: frame returned to the free list.
        assert_eq!(frame::ref_count(f), 0);
    }

    #[test]
    fn reinsert_same_frame_updates_perms_only() {
        let _k = test_support::boot(8 * 1024 * 1024);
        let space = fresh_space();
        let va = VirtAddr::new(UTEXT);
        let f = frame::alloc(true).unwrap();

        space.insert(f, va, PteFlags::WRITABLE | PteFlags::USER).unwrap();
        space.insert(f, va, PteFlags::USER | PteFlags::COW).unwrap();
        assert_eq!(frame::ref_count(f), 1, "same-frame re-insert must not recount");
        let (_, pte) = space.lookup(va).unwrap();
        assert!(pte.flags().contains(PteFlags::COW));
        assert!(!pte.flags().contains(PteFlags::WRITABLE));
    }

    #[test]
    fn insert_replaces_different_frame() {
        let _k = test_support::boot(8 * 1024 * 1024);
        let space = fresh_space();
        let va = VirtAddr::new(UTEXT);
        let a = frame::alloc(true).unwrap();
        let b = frame::alloc(true).unwrap();

        space.insert(a, va, PteFlags::USER).unwrap();
        space.insert(b, va, PteFlags::USER).unwrap();
        assert_eq!(space.lookup(va).unwrap().0, b);
        assert_eq!(frame::ref_count(a), 0, "displaced frame must be released");
        assert_eq!(frame::ref_count(b), 1);
    }

    #[test]
    fn rw_helpers_cross_page_boundaries() {
        let _k = test_support::boot(8 * 1024 * 1024);
        let space = fresh_space();
        let base = VirtAddr::new(UTEXT);
        for i in 0..2u32 {
            let f = frame::alloc(true).unwrap();
            space
                .insert(f, base.add(i * PAGE_SIZE as u32), PteFlags::WRITABLE | PteFlags::USER)
                .unwrap();
        }
        let va = base.add(PAGE_SIZE as u32 - 2);
        space.write_bytes(va, b"straddle").unwrap();
        let mut readback = [0u8; 8];
        space.read_bytes(va, &mut readback).unwrap();
        assert_eq!(&readback, b"straddle");

        // A hole in the range is an error.
        let hole = base.add(3 * PAGE_SIZE as u32 - 2);
        assert_eq!(space.write_bytes(hole, b"xx"), Err(Error::Inval));
    }

    #[test]
    fn destroy_returns_every_frame() {
        let _k = test_support::boot(8 * 1024 * 1024);
        let before = frame::free_count();
        let space = fresh_space();
        for i in 0..5u32 {
            let f = frame::alloc(true).unwrap();
            space
                .insert(f, VirtAddr::new(UTEXT + i * PAGE_SIZE as u32), PteFlags::WRITABLE | PteFlags::USER)
                .unwrap();
        }
        space.destroy_user();
        assert_eq!(frame::free_count(), before);
    }
}
