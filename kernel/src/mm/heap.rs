//! Kernel heap.
//!
//! The bare-metal target carves the heap out of a static arena inside the
//! kernel image; host builds use the system allocator (see `lib.rs`).

#[cfg(target_os = "none")]
mod arena {
    use linked_list_allocator::LockedHeap;

    /// 512 KiB is plenty: the heap only holds the run queue and transient
    /// buffers; page tables and user memory come from the frame allocator.
    const HEAP_BYTES: usize = 512 * 1024;

    #[repr(align(4096))]
    struct Arena([u8; HEAP_BYTES]);

    static mut ARENA: Arena = Arena([0; HEAP_BYTES]);

    #[global_allocator]
    static ALLOCATOR: LockedHeap = LockedHeap::empty();

    /// Point the allocator at the arena. Must run once, before the first
    /// allocation.
    pub fn init() {
        // SAFETY: called once at boot on a single CPU; the arena is not
        // referenced anywhere else.
        unsafe {
            let arena = core::ptr::addr_of_mut!(ARENA);
            ALLOCATOR.lock().init((*arena).0.as_mut_ptr(), HEAP_BYTES);
        }
    }
}

#[cfg(target_os = "none")]
pub use arena::init;

#[cfg(not(target_os = "none"))]
pub fn init() {}
