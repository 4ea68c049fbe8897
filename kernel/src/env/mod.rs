//! Environments: the process-like schedulable unit.
//!
//! The Env table lives in a boot-allocated stretch of physical frames so it
//! can be mapped read-only into every address space at `UENVS`; user code
//! (notably `wait`) observes status transitions through that window.
//!
//! Identifiers encode `(generation << 11) | slot`; the generation counter
//! is global and monotonic, so no two Env lifetimes ever share an id.

pub mod elf;

extern crate alloc;

use alloc::vec::Vec;
use core::mem::size_of;

use spin::Mutex;

use crate::arch;
use crate::error::{Error, Result};
use crate::ipc::IpcState;
use crate::mm::frame;
use crate::mm::layout::{PhysAddr, USTACKTOP};
use crate::mm::AddressSpace;
use crate::sched;
use crate::trap::{reg, TrapFrame};

/// Capacity of the Env table.
pub const NENV: usize = 1024;
/// log2(NENV); the slot occupies this many low id bits (plus one spare).
pub const LOG2NENV: u32 = 10;
/// Number of TLB address-space tags. Bounds the number of live Envs.
pub const NASID: usize = 256;

/// Stable Env identifier. Zero is the "current Env" sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct EnvId(pub u32);

impl EnvId {
    pub const CURRENT: EnvId = EnvId(0);

    /// Table slot named by this id.
    pub const fn slot(self) -> usize {
        self.0 as usize & (NENV - 1)
    }
}

impl core::fmt::Display for EnvId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EnvStatus {
    Free = 0,
    Runnable = 1,
    NotRunnable = 2,
}

/// One environment descriptor. `repr(C)` because user space reads these
/// through the `UENVS` window.
#[repr(C)]
pub struct Env {
    pub id: EnvId,
    pub parent_id: EnvId,
    pub status: EnvStatus,
    /// Scheduling quantum in timer ticks.
    pub priority: u32,
    /// Ticks left before the scheduler rotates this Env out.
    pub quantum_left: u32,
    /// Times this Env has been scheduled; user code uses it to detect
    /// having been preempted between two reads.
    pub runs: u32,
    pub tf: TrapFrame,
    pub space: AddressSpace,
    pub ipc: IpcState,
    /// User-space page-fault upcall entry; 0 when unregistered.
    pub fault_entry: u32,
    /// Top of the user exception stack for the upcall.
    pub fault_stack: u32,
    pub exit_status: i32,
}

struct EnvTable {
    base: *mut Env,
    region: (PhysAddr, usize),
    /// Free slot stack, popped in ascending slot order.
    free_slots: Vec<u16>,
    asid_bitmap: [u32; NASID / 32],
    next_gen: u32,
}

// SAFETY: `base` points into boot-owned physical memory; access is
// serialized by the enclosing Mutex and the single-threaded kernel.
unsafe impl Send for EnvTable {}

static ENV_TABLE: Mutex<EnvTable> = Mutex::new(EnvTable {
    base: core::ptr::null_mut(),
    region: (PhysAddr::new(0), 0),
    free_slots: Vec::new(),
    asid_bitmap: [0; NASID / 32],
    next_gen: 0,
});

impl EnvTable {
    fn alloc_asid(&mut self) -> Option<u32> {
        for asid in 0..NASID {
            let (word, bit) = (asid / 32, asid % 32);
            if self.asid_bitmap[word] & (1 << bit) == 0 {
                self.asid_bitmap[word] |= 1 << bit;
                return Some(asid as u32);
            }
        }
        None
    }

    fn free_asid(&mut self, asid: u32) {
        let (word, bit) = (asid as usize / 32, asid as usize % 32);
        debug_assert!(self.asid_bitmap[word] & (1 << bit) != 0);
        self.asid_bitmap[word] &= !(1 << bit);
    }
}

/// Allocate the Env table region and reset all bookkeeping. Must run while
/// the boot allocator is live.
pub fn init() {
    let bytes = NENV * size_of::<Env>();
    let pa = frame::boot_alloc(bytes);
    let mut table = ENV_TABLE.lock();
    table.base = arch::frame_ptr(pa) as *mut Env;
    table.region = (pa, bytes);
    table.free_slots.clear();
    for slot in (0..NENV as u16).rev() {
        table.free_slots.push(slot);
    }
    table.asid_bitmap = [0; NASID / 32];
    table.next_gen = 0;
    log::info!("env table: {} slots, {} KiB", NENV, bytes / 1024);
}

/// Physical location of the Env table, for the `UENVS` window.
pub fn table_region() -> (PhysAddr, usize) {
    ENV_TABLE.lock().region
}

/// Run `f` with exclusive access to the descriptor in `slot`.
fn with_slot<R>(slot: usize, f: impl FnOnce(&mut Env) -> R) -> R {
    let table = ENV_TABLE.lock();
    assert!(!table.base.is_null(), "env table not initialized");
    // SAFETY: slot < NENV by construction; the table lock serializes all
    // descriptor access and callers never nest into the table.
    let env = unsafe { &mut *table.base.add(slot) };
    f(env)
}

/// Resolve an id to a live Env, applying the self-or-parent permission rule
/// when `check_perm` is set. Id 0 resolves to the current Env.
pub fn resolve(id: EnvId, check_perm: bool) -> Result<EnvId> {
    let cur = sched::current();
    let target = if id.0 == 0 { cur.ok_or(Error::BadEnv)? } else { id };
    with_slot(target.slot(), |e| {
        if e.status == EnvStatus::Free || e.id != target {
            return Err(Error::BadEnv);
        }
        if check_perm {
            let cur = cur.ok_or(Error::BadEnv)?;
            if target != cur && e.parent_id != cur {
                return Err(Error::BadEnv);
            }
        }
        Ok(target)
    })
}

/// Resolve `id` and run `f` on its descriptor.
pub fn with_env<R>(id: EnvId, check_perm: bool, f: impl FnOnce(&mut Env) -> R) -> Result<R> {
    let target = resolve(id, check_perm)?;
    Ok(with_slot(target.slot(), f))
}

/// Address space handle of `id`.
pub fn space_of(id: EnvId, check_perm: bool) -> Result<AddressSpace> {
    with_env(id, check_perm, |e| e.space)
}

pub fn priority_of(id: EnvId) -> Result<u32> {
    with_env(id, false, |e| e.priority)
}

/// Upcall registration and space, for the page-fault path.
pub(crate) fn fault_state(id: EnvId) -> Result<(u32, u32, AddressSpace)> {
    with_env(id, false, |e| (e.fault_entry, e.fault_stack, e.space))
}

/// Save a live trap frame into the descriptor.
pub(crate) fn store_tf(id: EnvId, tf: &TrapFrame) -> Result<()> {
    with_env(id, false, |e| e.tf = *tf)
}

/// Pointer to the saved trap frame, for the restore path. Stable: the table
/// is never moved.
pub(crate) fn tf_ptr(id: EnvId) -> Result<*const TrapFrame> {
    with_env(id, false, |e| &e.tf as *const TrapFrame)
}

/// Scheduler-side peek that must not re-enter the scheduler: reads status
/// and remaining quantum if `id` is still the Env it names.
pub(crate) fn peek_sched(id: EnvId) -> Option<(EnvStatus, u32)> {
    with_slot(id.slot(), |e| {
        if e.id == id && e.status != EnvStatus::Free {
            Some((e.status, e.quantum_left))
        } else {
            None
        }
    })
}

/// Scheduler-side field update; silently skips a recycled slot.
pub(crate) fn sched_touch(id: EnvId, f: impl FnOnce(&mut Env)) {
    with_slot(id.slot(), |e| {
        if e.id == id && e.status != EnvStatus::Free {
            f(e);
        }
    });
}

/// Take a slot and an ASID, build the address space, and install the default
/// descriptor state: user mode with interrupts on, `sp` just below
/// `USTACKTOP` with room for `argc`/`argv`, not yet runnable.
pub fn alloc(parent: EnvId) -> Result<EnvId> {
    let (slot, asid, id) = {
        let mut table = ENV_TABLE.lock();
        let slot = table.free_slots.pop().ok_or(Error::NoFreeEnv)?;
        let Some(asid) = table.alloc_asid() else {
            table.free_slots.push(slot);
            return Err(Error::NoFreeEnv);
        };
        table.next_gen += 1;
        let id = EnvId((table.next_gen << (LOG2NENV + 1)) | slot as u32);
        (slot as usize, asid, id)
    };

    let space = match AddressSpace::new(asid) {
        Ok(space) => space,
        Err(err) => {
            let mut table = ENV_TABLE.lock();
            table.free_slots.push(slot as u16);
            table.free_asid(asid);
            return Err(err);
        }
    };

    with_slot(slot, |e| {
        e.id = id;
        e.parent_id = parent;
        e.status = EnvStatus::NotRunnable;
        e.priority = 1;
        e.quantum_left = 0;
        e.runs = 0;
        e.tf = TrapFrame::zeroed();
        e.tf.status = arch::STATUS_USER_DEFAULT;
        e.tf.regs[reg::SP] = USTACKTOP - 8;
        e.space = space;
        e.ipc = IpcState::cleared();
        e.fault_entry = 0;
        e.fault_stack = 0;
        e.exit_status = 0;
    });
    log::debug!("env {} allocated, parent {}", id, parent);
    Ok(id)
}

/// Allocate an Env, load `image` into it, and put it on the run queue.
pub fn create(image: &[u8], priority: u32) -> Result<EnvId> {
    let id = alloc(EnvId(0))?;
    let space = space_of(id, false)?;
    let entry = match elf::load(&space, image) {
        Ok(entry) => entry,
        Err(err) => {
            let _ = destroy(id);
            return Err(err);
        }
    };
    with_env(id, false, |e| {
        e.priority = priority.max(1);
        e.tf.epc = entry;
        e.status = EnvStatus::Runnable;
    })?;
    sched::push(id);
    log::info!("env {} created, entry {:#x}, priority {}", id, entry, priority);
    Ok(id)
}

/// Raw `(id, status, exit_status)` snapshot of a slot, freed or not — what
/// user code sees through the `UENVS` window.
#[cfg(not(target_os = "none"))]
pub(crate) fn slot_snapshot(slot: usize) -> (u32, u32, i32) {
    with_slot(slot & (NENV - 1), |e| (e.id.0, e.status as u32, e.exit_status))
}

/// Tear an Env down: release every user mapping (and with them the page
/// tables and directory), recycle the ASID and the slot, and detach it from
/// the scheduler. The id and exit status stay readable in the freed slot
/// until reuse, which is what user-level `wait` relies on.
pub fn destroy(id: EnvId) -> Result<()> {
    let target = resolve(id, false)?;
    let slot = target.slot();

    let space = {
        let mut table = ENV_TABLE.lock();
        // SAFETY: as in `with_slot`; the lock is held.
        let e = unsafe { &mut *table.base.add(slot) };
        if e.status == EnvStatus::Free || e.id != target {
            return Err(Error::BadEnv);
        }
        let space = e.space;
        e.status = EnvStatus::Free;
        e.ipc = IpcState::cleared();
        table.free_asid(space.asid);
        table.free_slots.push(slot as u16);
        space
    };

    space.destroy_user();
    sched::on_destroyed(target);
    log::debug!("env {} destroyed", target);
    Ok(())
}
