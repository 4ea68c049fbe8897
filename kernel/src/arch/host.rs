//! Host-side test shim.
//!
//! Physical memory is one heap allocation; the console is captured to
//! buffers the tests can inspect and feed. TLB and timer operations are
//! no-ops, and the return-to-user path is unreachable.

extern crate alloc;

use alloc::vec;
use alloc::vec::Vec;

use spin::{Mutex, Once};

use crate::mm::layout::{PhysAddr, VirtAddr};
use crate::trap::TrapFrame;

/// All host tests share one fixed-size physical memory image, sized to hold
/// the largest RAM any test detects.
const PHYS_MEM_BYTES: usize = 64 * 1024 * 1024;

struct PhysBacking {
    base: usize,
}

// SAFETY: the backing region is only dereferenced through `frame_ptr`, under
// the single-threaded-kernel discipline the callers already uphold (tests
// serialize on the boot lock).
unsafe impl Send for PhysBacking {}
unsafe impl Sync for PhysBacking {}

static PHYS: Once<PhysBacking> = Once::new();

/// Allocate the backing region. Idempotent; the size argument is only
/// checked against the fixed capacity.
pub fn phys_init(limit: usize) {
    assert!(limit <= PHYS_MEM_BYTES, "test RAM exceeds host backing");
    PHYS.call_once(|| {
        let buf: Vec<u8> = vec![0; PHYS_MEM_BYTES];
        PhysBacking {
            base: Vec::leak(buf).as_mut_ptr() as usize,
        }
    });
}

/// Pointer to the byte backing physical address `pa`.
pub fn frame_ptr(pa: PhysAddr) -> *mut u8 {
    let backing = PHYS.get().expect("physical memory not initialized");
    assert!((pa.as_u32() as usize) < PHYS_MEM_BYTES, "pa out of range: {pa}");
    (backing.base + pa.as_u32() as usize) as *mut u8
}

/// Pretend the kernel image occupies the first 256 KiB of RAM.
pub fn kernel_end() -> PhysAddr {
    PhysAddr::new(0x0004_0000)
}

/// On the host a halt is always a bug in the scenario under test.
pub fn halt() -> ! {
    panic!("kernel halted");
}

/// Never reachable on the host.
///
/// # Safety
///
/// Never returns successfully; see the MIPS implementation for the real
/// contract.
pub unsafe fn ret_to_user(_tf: *const TrapFrame, _asid: u32) -> ! {
    unreachable!("ret_to_user on the host");
}

pub mod console {
    use super::*;

    static OUTPUT: Mutex<Vec<u8>> = Mutex::new(Vec::new());
    static INPUT: Mutex<Vec<u8>> = Mutex::new(Vec::new());

    pub fn putchar(c: u8) {
        OUTPUT.lock().push(c);
    }

    pub fn getchar() -> Option<u8> {
        let mut input = INPUT.lock();
        if input.is_empty() {
            None
        } else {
            Some(input.remove(0))
        }
    }

    /// Drain everything written so far (test observation point).
    pub fn take_output() -> Vec<u8> {
        core::mem::take(&mut *OUTPUT.lock())
    }

    /// Queue bytes for `getchar` (test injection point).
    pub fn push_input(bytes: &[u8]) {
        INPUT.lock().extend_from_slice(bytes);
    }
}

pub mod tlb {
    use super::VirtAddr;

    pub fn invalidate(_asid: u32, _va: VirtAddr) {}
}

pub mod timer {
    pub fn init() {}
    pub fn ack() {}
}
