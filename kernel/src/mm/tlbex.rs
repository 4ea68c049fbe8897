//! TLB refill.
//!
//! The assembly refill vector calls `do_tlb_refill` with the faulting
//! address and the live ASID. A successful walk hands back the even/odd
//! EntryLo pair for `tlbwr`; a miss makes the stub re-raise the exception
//! into the general trap path, which delivers the user fault upcall.

use super::layout::{VirtAddr, PAGE_SIZE};
use super::page_table::{Pte, PteFlags};
use super::AddressSpace;

/// EntryLo cache attribute: cacheable, noncoherent, write-back.
const ENTRYLO_CACHEABLE: u32 = 3 << 3;
const ENTRYLO_DIRTY: u32 = 1 << 2;
const ENTRYLO_VALID: u32 = 1 << 1;
const ENTRYLO_GLOBAL: u32 = 1 << 0;

/// Convert a software PTE into a hardware EntryLo word.
///
/// `COW` and `LIBRARY` never reach the TLB; the hardware dirty (write-
/// enable) bit is set only for writable non-COW pages, so COW writes fault
/// as TLB-mod.
pub fn pte_to_entrylo(pte: Pte) -> u32 {
    let flags = pte.flags();
    if !flags.contains(PteFlags::VALID) {
        return 0;
    }
    let mut lo = (pte.frame().0 << 6) | ENTRYLO_CACHEABLE | ENTRYLO_VALID;
    if flags.contains(PteFlags::WRITABLE) && !flags.contains(PteFlags::COW) {
        lo |= ENTRYLO_DIRTY;
    }
    if flags.contains(PteFlags::GLOBAL) {
        lo |= ENTRYLO_GLOBAL;
    }
    lo
}

/// Walk `space` for the page pair covering `va`. Returns `None` when the
/// faulting page itself has no valid mapping.
pub fn refill_lookup(space: &AddressSpace, va: VirtAddr) -> Option<[u32; 2]> {
    let even = VirtAddr::new(va.as_u32() & !(2 * PAGE_SIZE as u32 - 1));
    let odd = even.add(PAGE_SIZE as u32);

    let entry_of = |page: VirtAddr| space.lookup(page).map(|(_, pte)| pte_to_entrylo(pte));
    let pair = [entry_of(even).unwrap_or(0), entry_of(odd).unwrap_or(0)];

    let faulting_is_odd = va.as_u32() & PAGE_SIZE as u32 != 0;
    if pair[faulting_is_odd as usize] == 0 {
        return None;
    }
    Some(pair)
}

/// C-ABI entry used by the refill stub. Writes the EntryLo pair through
/// `out` and returns 1, or returns 0 to escalate to the general handler.
///
/// # Safety
///
/// `out` must point at two writable words.
#[no_mangle]
pub unsafe extern "C" fn do_tlb_refill(out: *mut u32, badva: u32, _asid: u32) -> u32 {
    let Some(space) = super::current_space() else {
        return 0;
    };
    match refill_lookup(&space, VirtAddr::new(badva)) {
        Some(pair) => {
            // SAFETY: caller provides two writable words.
            unsafe {
                *out = pair[0];
                *out.add(1) = pair[1];
            }
            1
        }
        None => 0,
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::layout::UTEXT;
    use crate::mm::{frame, AddressSpace};
    use crate::test_support;

    #[test]
    fn entrylo_strips_software_bits() {
        let f = frame::FrameId(0x1234);
        let writable = Pte::new(f, PteFlags::VALID | PteFlags::WRITABLE | PteFlags::USER);
        let lo = pte_to_entrylo(writable);
        assert_eq!(lo >> 6, 0x1234);
        assert_ne!(lo & ENTRYLO_DIRTY, 0);

        // A COW page must not be hardware-writable, or the write would not
        // fault.
        let cow = Pte::new(f, PteFlags::VALID | PteFlags::WRITABLE | PteFlags::COW);
        assert_eq!(pte_to_entrylo(cow) & ENTRYLO_DIRTY, 0);

        assert_eq!(pte_to_entrylo(Pte::EMPTY), 0);
    }

    #[test]
    fn refill_resolves_mapped_pages_only() {
        let _k = test_support::boot(8 * 1024 * 1024);
        let space = AddressSpace::new(1).unwrap();
        let va = VirtAddr::new(UTEXT);
        let f = frame::alloc(true).unwrap();
        space.insert(f, va, PteFlags::WRITABLE | PteFlags::USER).unwrap();

        let pair = refill_lookup(&space, va).expect("mapped page must refill");
        assert_ne!(pair[0], 0);
        assert_eq!(pair[1], 0, "odd partner is unmapped");

        // The odd page of the same pair has no mapping: escalate.
        assert!(refill_lookup(&space, va.add(PAGE_SIZE as u32)).is_none());
    }
}
