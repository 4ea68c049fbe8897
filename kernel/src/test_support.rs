//! Shared fixtures for host-side tests.
//!
//! Kernel state is process-global, so tests serialize on a boot lock and
//! every test starts from a freshly initialized kernel.

extern crate alloc;

use alloc::vec::Vec;

use spin::{Mutex, MutexGuard};

use crate::env::{self, EnvId, EnvStatus};
use crate::mm::frame;
use crate::mm::layout::{VirtAddr, PAGE_SIZE, USTACKTOP};
use crate::mm::PteFlags;
use crate::sched;
use crate::trap::{reg, TrapFrame};

static BOOT_LOCK: Mutex<()> = Mutex::new(());

/// Holds the kernel exclusively for the duration of one test.
pub struct KernelGuard {
    _guard: MutexGuard<'static, ()>,
}

/// Serialize on the boot lock and reboot the kernel with `ram` bytes of
/// physical memory.
pub fn boot(ram: usize) -> KernelGuard {
    let guard = BOOT_LOCK.lock();
    crate::logger::init();
    sched::reset();
    crate::init::boot_common(ram);
    crate::arch::console::take_output();
    while crate::arch::console::getchar().is_some() {}
    KernelGuard { _guard: guard }
}

/// Allocate a runnable Env with a mapped user stack page, queued for
/// scheduling.
pub fn fresh_runnable_env() -> EnvId {
    let id = env::alloc(EnvId(0)).unwrap();
    let space = env::space_of(id, false).unwrap();
    let stack = frame::alloc(true).unwrap();
    space
        .insert(
            stack,
            VirtAddr::new(USTACKTOP - PAGE_SIZE as u32),
            PteFlags::WRITABLE | PteFlags::USER,
        )
        .unwrap();
    env::with_env(id, false, |e| e.status = EnvStatus::Runnable).unwrap();
    sched::push(id);
    id
}

/// Make `id` the running Env, as if the scheduler had just picked it.
pub fn run_as(id: EnvId) {
    sched::adopt(id);
}

/// A trap frame as the syscall gateway would leave it: number in `v0`,
/// arguments in `a0..a3`, `sp` inside the test stack page.
pub fn syscall_tf(no: u32, args: [u32; 4]) -> TrapFrame {
    let mut tf = TrapFrame::zeroed();
    tf.regs[reg::V0] = no;
    tf.regs[reg::A0] = args[0];
    tf.regs[reg::A1] = args[1];
    tf.regs[reg::A2] = args[2];
    tf.regs[reg::A3] = args[3];
    tf.regs[reg::SP] = USTACKTOP - 64;
    tf.epc = 0x0040_1000;
    tf
}

/// Raw `(id, status, exit_status)` view of a table slot, including freed
/// ones — the same bytes user-level `wait` reads through `UENVS`.
pub fn read_slot_raw(slot: usize) -> (u32, u32, i32) {
    env::slot_snapshot(slot)
}

/// Hand-assembled little-endian ELF32 MIPS executable with one PT_LOAD
/// segment at `vaddr` carrying `data` (plus a page of zeroed memsz tail).
pub fn tiny_elf(vaddr: u32, data: &[u8]) -> Vec<u8> {
    let mut image = Vec::new();

    // e_ident
    image.extend_from_slice(&[0x7F, b'E', b'L', b'F', 1, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    image.extend_from_slice(&2u16.to_le_bytes()); // e_type = ET_EXEC
    image.extend_from_slice(&8u16.to_le_bytes()); // e_machine = EM_MIPS
    image.extend_from_slice(&1u32.to_le_bytes()); // e_version
    image.extend_from_slice(&vaddr.to_le_bytes()); // e_entry
    image.extend_from_slice(&52u32.to_le_bytes()); // e_phoff
    image.extend_from_slice(&0u32.to_le_bytes()); // e_shoff
    image.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    image.extend_from_slice(&52u16.to_le_bytes()); // e_ehsize
    image.extend_from_slice(&32u16.to_le_bytes()); // e_phentsize
    image.extend_from_slice(&1u16.to_le_bytes()); // e_phnum
    image.extend_from_slice(&0u16.to_le_bytes()); // e_shentsize
    image.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
    image.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx

    // One PT_LOAD program header; file data lives right after it.
    let offset = 52u32 + 32;
    image.extend_from_slice(&1u32.to_le_bytes()); // p_type = PT_LOAD
    image.extend_from_slice(&offset.to_le_bytes()); // p_offset
    image.extend_from_slice(&vaddr.to_le_bytes()); // p_vaddr
    image.extend_from_slice(&vaddr.to_le_bytes()); // p_paddr
    image.extend_from_slice(&(data.len() as u32).to_le_bytes()); // p_filesz
    image.extend_from_slice(&(data.len() as u32 + 64).to_le_bytes()); // p_memsz
    image.extend_from_slice(&6u32.to_le_bytes()); // p_flags = PF_R | PF_W
    image.extend_from_slice(&(PAGE_SIZE as u32).to_le_bytes()); // p_align

    image.extend_from_slice(data);
    image
}
