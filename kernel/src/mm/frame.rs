//! Physical frame allocator.
//!
//! Frame metadata lives in a boot-allocated region of physical memory (so it
//! can be mapped read-only into user space at `UPAGES`), linked into a free
//! list by index. A frame is on the free list iff its reference count is
//! zero; pinned frames (kernel image, boot allocations) carry a permanent
//! count of one.

use core::mem::size_of;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use spin::Mutex;

use super::layout::{PhysAddr, PAGE_SIZE, PGSHIFT};
use crate::arch;
use crate::error::{Error, Result};

/// Index of one physical page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct FrameId(pub u32);

impl FrameId {
    pub const fn base_addr(self) -> PhysAddr {
        PhysAddr::new(self.0 << PGSHIFT)
    }

    pub const fn of_addr(pa: PhysAddr) -> Self {
        Self(pa.pfn())
    }
}

/// Per-frame bookkeeping, visible read-only to user space at `UPAGES`.
#[repr(C)]
pub struct FrameInfo {
    /// Number of page-table entries pointing at this frame (plus one for
    /// pinned frames).
    pub refcount: u32,
    /// Free-list link; `NO_FRAME` when not free.
    next_free: u32,
}

const NO_FRAME: u32 = u32::MAX;

/// Detected physical page count.
static NPAGES: AtomicUsize = AtomicUsize::new(0);

/// Boot bump pointer; serves pre-VM allocations, frozen by `init`.
static BOOT_FREEMEM: AtomicU32 = AtomicU32::new(0);
static BOOT_FROZEN: AtomicBool = AtomicBool::new(true);

/// Record the RAM size reported by the bootloader and reset the boot bump
/// allocator to the end of the kernel image.
pub fn detect_memory(ram_low_size: usize) {
    arch::phys_init(ram_low_size);
    NPAGES.store(ram_low_size / PAGE_SIZE, Ordering::Relaxed);
    BOOT_FREEMEM.store(arch::kernel_end().page_align_up().as_u32(), Ordering::Relaxed);
    BOOT_FROZEN.store(false, Ordering::Relaxed);
    log::info!(
        "physical memory: {} KiB, {} pages",
        ram_low_size / 1024,
        NPAGES.load(Ordering::Relaxed)
    );
}

/// Number of physical pages under management.
pub fn npages() -> usize {
    NPAGES.load(Ordering::Relaxed)
}

/// Allocate `size` bytes of page-aligned physical memory from the boot bump
/// allocator. Only legal between `detect_memory` and `init`.
pub fn boot_alloc(size: usize) -> PhysAddr {
    assert!(!BOOT_FROZEN.load(Ordering::Relaxed), "boot allocator is frozen");
    let rounded = (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    let pa = PhysAddr::new(BOOT_FREEMEM.fetch_add(rounded as u32, Ordering::Relaxed));
    assert!(
        (pa.as_u32() as usize + rounded) <= npages() * PAGE_SIZE,
        "boot allocation exceeds physical memory"
    );
    // SAFETY: the region was just carved off the bump pointer and is not yet
    // reachable from anywhere else.
    unsafe {
        core::ptr::write_bytes(arch::frame_ptr(pa), 0, rounded);
    }
    pa
}

/// The allocator proper. All mutation happens behind `FRAME_ALLOCATOR`.
pub struct FrameAllocator {
    table: *mut FrameInfo,
    table_pa: PhysAddr,
    npages: usize,
    free_head: u32,
    free_count: usize,
}

// SAFETY: the table pointer targets boot-owned physical memory accessed only
// while the enclosing Mutex is held.
unsafe impl Send for FrameAllocator {}

static FRAME_ALLOCATOR: Mutex<FrameAllocator> = Mutex::new(FrameAllocator {
    table: core::ptr::null_mut(),
    table_pa: PhysAddr::new(0),
    npages: 0,
    free_head: NO_FRAME,
    free_count: 0,
});

impl FrameAllocator {
    fn check(&self, frame: FrameId) {
        assert!((frame.0 as usize) < self.npages, "frame {} out of range", frame.0);
    }

    fn info(&mut self, frame: FrameId) -> &mut FrameInfo {
        self.check(frame);
        // SAFETY: index checked; exclusive access is guaranteed by the
        // allocator Mutex.
        unsafe { &mut *self.table.add(frame.0 as usize) }
    }

    fn info_ref(&self, frame: FrameId) -> &FrameInfo {
        self.check(frame);
        // SAFETY: as in `info`.
        unsafe { &*self.table.add(frame.0 as usize) }
    }

    fn push_free(&mut self, frame: FrameId) {
        let head = self.free_head;
        let info = self.info(frame);
        debug_assert_eq!(info.refcount, 0);
        info.next_free = head;
        self.free_head = frame.0;
        self.free_count += 1;
    }

    fn pop_free(&mut self) -> Option<FrameId> {
        if self.free_head == NO_FRAME {
            return None;
        }
        let frame = FrameId(self.free_head);
        let next = self.info(frame).next_free;
        self.info(frame).next_free = NO_FRAME;
        self.free_head = next;
        self.free_count -= 1;
        Some(frame)
    }
}

/// Build the frame table, pin everything below the boot watermark, and put
/// the remaining frames on the free list in ascending order. Freezes the
/// boot allocator.
pub fn init() {
    let npages = npages();
    let table_pa = boot_alloc(npages * size_of::<FrameInfo>());
    BOOT_FROZEN.store(true, Ordering::Relaxed);

    let first_free = PhysAddr::new(BOOT_FREEMEM.load(Ordering::Relaxed))
        .page_align_up()
        .pfn() as usize;

    let mut alloc = FRAME_ALLOCATOR.lock();
    *alloc = FrameAllocator {
        table: arch::frame_ptr(table_pa) as *mut FrameInfo,
        table_pa,
        npages,
        free_head: NO_FRAME,
        free_count: 0,
    };
    for pfn in 0..npages {
        let frame = FrameId(pfn as u32);
        if pfn < first_free {
            let info = alloc.info(frame);
            info.refcount = 1;
            info.next_free = NO_FRAME;
        } else {
            alloc.push_free(frame);
        }
    }
    log::info!("frame allocator: {} of {} pages free", alloc.free_count, npages);
}

/// Take a frame off the free list. Its reference count is zero; the caller
/// is expected to map it (or hand it back with `free`).
pub fn alloc(zero: bool) -> Result<FrameId> {
    let frame = FRAME_ALLOCATOR.lock().pop_free().ok_or(Error::NoMemory)?;
    if zero {
        // SAFETY: the frame was just unlinked from the free list, so nothing
        // maps it yet.
        unsafe {
            core::ptr::write_bytes(arch::frame_ptr(frame.base_addr()), 0, PAGE_SIZE);
        }
    }
    Ok(frame)
}

/// Return a never-mapped frame to the free list (error unwinding only).
pub fn free(frame: FrameId) {
    let mut alloc = FRAME_ALLOCATOR.lock();
    assert_eq!(alloc.info_ref(frame).refcount, 0, "freeing a referenced frame");
    alloc.push_free(frame);
}

/// Account one more mapping of `frame`.
pub fn inc_ref(frame: FrameId) {
    FRAME_ALLOCATOR.lock().info(frame).refcount += 1;
}

/// Account one fewer mapping of `frame`; the last drop returns it to the
/// free list. Underflow is a kernel bug.
pub fn dec_ref(frame: FrameId) {
    let mut alloc = FRAME_ALLOCATOR.lock();
    let info = alloc.info(frame);
    assert!(info.refcount > 0, "refcount underflow on frame {}", frame.0);
    info.refcount -= 1;
    if info.refcount == 0 {
        alloc.push_free(frame);
    }
}

/// Current reference count of `frame`.
pub fn ref_count(frame: FrameId) -> u32 {
    FRAME_ALLOCATOR.lock().info_ref(frame).refcount
}

/// Number of frames on the free list.
pub fn free_count() -> usize {
    FRAME_ALLOCATOR.lock().free_count
}

/// Physical location and size of the frame table, for the `UPAGES` window.
pub fn table_region() -> (PhysAddr, usize) {
    let alloc = FRAME_ALLOCATOR.lock();
    (alloc.table_pa, alloc.npages * size_of::<FrameInfo>())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::vec::Vec;

    use super::*;
    use crate::test_support;

    #[test]
    fn alloc_free_round_trip() {
        let _k = test_support::boot(4 * 1024 * 1024);
        let before = free_count();
        let frame = alloc(true).expect("fresh allocator must have frames");
        assert_eq!(free_count(), before - 1);
        assert_eq!(ref_count(frame), 0);

        inc_ref(frame);
        assert_eq!(ref_count(frame), 1);
        dec_ref(frame);
        // Last reference dropped: frame is back on the free list.
        assert_eq!(free_count(), before);
    }

    #[test]
    fn alloc_zeroes_when_asked() {
        let _k = test_support::boot(4 * 1024 * 1024);
        let frame = alloc(false).unwrap();
        // Scribble, give it back, and re-request zeroed.
        // SAFETY: frame is unmapped; test owns it.
        unsafe {
            core::ptr::write_bytes(arch::frame_ptr(frame.base_addr()), 0xAB, PAGE_SIZE);
        }
        free(frame);
        let frame2 = alloc(true).unwrap();
        assert_eq!(frame2, frame, "free list is LIFO");
        // SAFETY: as above.
        let byte = unsafe { *arch::frame_ptr(frame2.base_addr()) };
        assert_eq!(byte, 0);
        free(frame2);
    }

    #[test]
    fn exhaustion_reports_no_memory() {
        let _k = test_support::boot(4 * 1024 * 1024);
        let mut taken = Vec::new();
        while let Ok(f) = super::alloc(false) {
            taken.push(f);
        }
        assert_eq!(super::alloc(false), Err(Error::NoMemory));
        assert_eq!(free_count(), 0);
        for f in taken {
            free(f);
        }
    }
}
