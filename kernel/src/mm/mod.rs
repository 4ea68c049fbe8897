//! Memory management: layout constants, the frame allocator, page tables,
//! the kernel heap, and the TLB refill path.

pub mod frame;
pub mod heap;
pub mod layout;
pub mod page_table;
pub mod tlbex;

use spin::Mutex;

pub use frame::{FrameId, FrameInfo};
pub use layout::{PhysAddr, VirtAddr, PAGE_SIZE};
pub use page_table::{AddressSpace, Pte, PteFlags};

use layout::{UENVS, UPAGES, PAGE_SIZE as PG};
use crate::error::Result;

/// Boot template page directory: the kernel windows every address space
/// shares. `None` until `init` runs.
static TEMPLATE: Mutex<Option<FrameId>> = Mutex::new(None);

/// Address space of the running Env, consulted by the TLB refill path.
static CURRENT_SPACE: Mutex<Option<AddressSpace>> = Mutex::new(None);

pub(crate) fn template_pgdir() -> FrameId {
    let template = *TEMPLATE.lock();
    template.expect("mm::init has not run")
}

/// Record the address space about to run.
pub fn set_current_space(space: AddressSpace) {
    *CURRENT_SPACE.lock() = Some(space);
}

/// Address space of the running Env.
pub fn current_space() -> Option<AddressSpace> {
    *CURRENT_SPACE.lock()
}

/// Build the boot template directory: the Env table mapped read-only at
/// `UENVS` and the frame table read-only at `UPAGES`. Every address space
/// copies these directory entries at creation.
pub fn init(env_region: (PhysAddr, usize)) -> Result<()> {
    let pgdir = frame::alloc(true)?;
    frame::inc_ref(pgdir);
    let template = AddressSpace { pgdir, asid: 0 };

    map_window(&template, VirtAddr::new(UENVS), env_region)?;
    map_window(&template, VirtAddr::new(UPAGES), frame::table_region())?;

    *TEMPLATE.lock() = Some(pgdir);
    *CURRENT_SPACE.lock() = None;
    log::info!("kernel windows mapped at {:#x} and {:#x}", UENVS, UPAGES);
    Ok(())
}

fn map_window(template: &AddressSpace, base: VirtAddr, region: (PhysAddr, usize)) -> Result<()> {
    let (pa, bytes) = region;
    debug_assert_eq!(pa.page_offset(), 0);
    let pages = (bytes + PG - 1) / PG;
    for i in 0..pages {
        template.insert(
            FrameId(pa.pfn() + i as u32),
            base.add((i * PG) as u32),
            PteFlags::USER | PteFlags::GLOBAL,
        )?;
    }
    Ok(())
}
