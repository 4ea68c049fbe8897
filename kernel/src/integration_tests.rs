//! Cross-module scenarios, driven through the syscall layer with the
//! scheduler's notion of the current Env under test control.

use crate::env::{self, EnvId, EnvStatus};
use crate::error::Error;
use crate::mm::layout::{VirtAddr, PAGE_SIZE, UCOW, UTEXT, UXSTACKTOP};
use crate::mm::{frame, PteFlags};
use crate::sched;
use crate::syscall::tests_support::{call, call5};
use crate::syscall::SyscallNo;
use crate::test_support::{self, fresh_runnable_env, run_as, syscall_tf};
use crate::trap::{reg, Disposition, TrapFrame};

const WU: u32 = PteFlags::WRITABLE.bits() | PteFlags::USER.bits();

fn cow_bits() -> u32 {
    (PteFlags::USER | PteFlags::COW).bits()
}

/// Boot-to-first-program: an Env created from an ELF image is picked by the
/// scheduler with its entry point in `epc`.
#[test]
fn create_schedules_the_loaded_program() {
    let _k = test_support::boot(8 * 1024 * 1024);
    let image = test_support::tiny_elf(UTEXT, b"\x00\x00\x00\x00");
    let id = env::create(&image, 2).expect("image must load");

    assert_eq!(sched::schedule(false), Some(id));
    env::with_env(id, false, |e| {
        assert_eq!(e.tf.epc, UTEXT);
        assert_eq!(e.priority, 2);
        assert_eq!(e.status, EnvStatus::Runnable);
    })
    .unwrap();
}

/// After a fork-style COW split, a write in the child (resolved through
/// the fault upcall protocol) is invisible to the parent.
#[test]
fn fork_cow_write_isolates_parent_and_child() {
    let _k = test_support::boot(8 * 1024 * 1024);
    let parent = fresh_runnable_env();
    run_as(parent);
    let va = VirtAddr::new(0x0040_0000);

    // Parent allocates a writable page and stores 0x42.
    assert_eq!(call(SyscallNo::MemAlloc, [0, va.as_u32(), WU, 0]), 0);
    let parent_space = env::space_of(parent, false).unwrap();
    parent_space.write_bytes(va, &[0x42]).unwrap();

    // exofork, then duppage both sides to COW (what user fork() does).
    let mut tf = syscall_tf(SyscallNo::Exofork as u32, [0; 4]);
    crate::syscall::dispatch(&mut tf);
    let child = EnvId(tf.regs[reg::V0]);
    assert_eq!(call5(SyscallNo::MemMap, [0, va.as_u32(), child.0, va.as_u32()], cow_bits()), 0);
    assert_eq!(call5(SyscallNo::MemMap, [0, va.as_u32(), 0, va.as_u32()], cow_bits()), 0);

    let shared = parent_space.lookup(va).unwrap().0;
    assert_eq!(frame::ref_count(shared), 2, "one frame, two mappings");

    // Child reads 0x42 through the shared frame.
    let child_space = env::space_of(child, false).unwrap();
    let mut byte = [0u8; 1];
    child_space.read_bytes(va, &mut byte).unwrap();
    assert_eq!(byte[0], 0x42);

    // Child attempts a store: the kernel delivers the fault upcall.
    assert_eq!(call(SyscallNo::SetEnvStatus, [child.0, 1, 0, 0]), 0);
    run_as(child);
    assert_eq!(call(SyscallNo::MemAlloc, [0, UXSTACKTOP - PAGE_SIZE as u32, WU, 0]), 0);
    assert_eq!(
        call(SyscallNo::SetFaultHandler, [0, 0x0041_0000, UXSTACKTOP, 0]),
        0
    );
    let mut fault = TrapFrame::zeroed();
    fault.cause = 1 << 2; // TLB mod
    fault.badvaddr = va.as_u32() + 1;
    fault.regs[reg::SP] = 0x7000_0000;
    assert_eq!(crate::trap::do_trap(&mut fault), Disposition::Resume);
    assert_eq!(fault.epc, 0x0041_0000, "resumes in the COW handler");

    // The handler's published protocol: copy through UCOW, remap writable.
    assert_eq!(call(SyscallNo::MemAlloc, [0, UCOW, WU, 0]), 0);
    let mut page = [0u8; PAGE_SIZE];
    child_space.read_bytes(va, &mut page).unwrap();
    child_space.write_bytes(VirtAddr::new(UCOW), &page).unwrap();
    assert_eq!(call5(SyscallNo::MemMap, [0, UCOW, 0, va.as_u32()], WU), 0);
    assert_eq!(call(SyscallNo::MemUnmap, [0, UCOW, 0, 0]), 0);

    // The store retries and lands in the private copy.
    child_space.write_bytes(va, &[0x55]).unwrap();

    let mut parent_byte = [0u8; 1];
    parent_space.read_bytes(va, &mut parent_byte).unwrap();
    assert_eq!(parent_byte[0], 0x42, "parent keeps its original byte");
    let mut child_byte = [0u8; 1];
    child_space.read_bytes(va, &mut child_byte).unwrap();
    assert_eq!(child_byte[0], 0x55);

    let parent_frame = parent_space.lookup(va).unwrap().0;
    let child_frame = child_space.lookup(va).unwrap().0;
    assert_ne!(parent_frame, child_frame, "pages diverged on write");
    assert_eq!(frame::ref_count(parent_frame), 1);
    assert_eq!(frame::ref_count(child_frame), 1);
}

/// A page gift, end to end through dispatch: the frame's bytes appear at
/// the receiver's chosen window.
#[test]
fn ipc_page_gift_through_dispatch() {
    let _k = test_support::boot(8 * 1024 * 1024);
    let a = fresh_runnable_env();
    let b = fresh_runnable_env();
    let src = 0x0040_0000u32;
    let dst = 0x0050_0000u32;

    run_as(a);
    assert_eq!(call(SyscallNo::MemAlloc, [0, src, WU, 0]), 0);
    env::space_of(a, false)
        .unwrap()
        .write_bytes(VirtAddr::new(src), b"hi\0\0")
        .unwrap();

    // B parks in recv; the scheduler moves on without it.
    run_as(b);
    let mut tf = syscall_tf(SyscallNo::IpcRecv as u32, [dst, 0, 0, 0]);
    assert_eq!(
        crate::syscall::dispatch(&mut tf),
        Disposition::Reschedule { yielding: false }
    );
    assert_eq!(sched::schedule(false), Some(a), "only A stays runnable");

    run_as(a);
    assert_eq!(call(SyscallNo::IpcTrySend, [b.0, 7, src, WU]), 0);

    env::with_env(b, false, |e| {
        assert_eq!(e.ipc.value, 7);
        assert_eq!(e.ipc.from_env, a.0);
        assert_eq!(e.tf.regs[reg::V0], 0, "B's ipc_recv returns 0");
        assert_eq!(e.status, EnvStatus::Runnable);
    })
    .unwrap();

    let mut got = [0u8; 4];
    env::space_of(b, false)
        .unwrap()
        .read_bytes(VirtAddr::new(dst), &mut got)
        .unwrap();
    assert_eq!(&got, b"hi\0\0");
}

/// Destroying an Env returns exactly its private frames; LIBRARY-shared
/// frames survive with the peer.
#[test]
fn destroy_returns_private_frames_only() {
    let _k = test_support::boot(8 * 1024 * 1024);
    let peer = fresh_runnable_env();
    let victim = fresh_runnable_env();
    let lib_bits = (PteFlags::WRITABLE | PteFlags::USER | PteFlags::LIBRARY).bits();

    run_as(victim);
    // Three private pages, one LIBRARY page shared with the peer. The
    // victim's own stack page (mapped by the fixture) is private too.
    for i in 0..3u32 {
        assert_eq!(
            call(SyscallNo::MemAlloc, [0, UTEXT + i * PAGE_SIZE as u32, WU, 0]),
            0
        );
    }
    let shared_va = UTEXT + 16 * PAGE_SIZE as u32;
    assert_eq!(call(SyscallNo::MemAlloc, [0, shared_va, lib_bits, 0]), 0);
    let shared_frame = env::space_of(victim, false)
        .unwrap()
        .lookup(VirtAddr::new(shared_va))
        .unwrap()
        .0;

    // Gift the shared page to the peer the way the fd layer does.
    run_as(peer);
    let mut tf = syscall_tf(SyscallNo::IpcRecv as u32, [shared_va, 0, 0, 0]);
    crate::syscall::dispatch(&mut tf);
    run_as(victim);
    assert_eq!(call(SyscallNo::IpcTrySend, [peer.0, 1, shared_va, lib_bits]), 0);
    assert_eq!(frame::ref_count(shared_frame), 2);

    let free_before = frame::free_count();
    let mut tf = syscall_tf(SyscallNo::EnvDestroy as u32, [0, 0, 0, 0]);
    assert_eq!(
        crate::syscall::dispatch(&mut tf),
        Disposition::Reschedule { yielding: false }
    );

    assert_eq!(env::resolve(victim, false), Err(Error::BadEnv));
    // Private frames: 3 data pages + stack page + page tables + directory.
    // The audit that matters: the shared frame stayed with the peer, and
    // everything else the victim held came back.
    assert!(frame::free_count() > free_before);
    assert_eq!(frame::ref_count(shared_frame), 1, "peer still holds the LIBRARY page");

    // Re-destroying by the stale id also fails.
    run_as(peer);
    assert_eq!(
        call(SyscallNo::EnvDestroy, [victim.0, 0, 0, 0]),
        Error::BadEnv.to_errno()
    );
}

/// Round-trip law: alloc + unmap restores the free-frame count even when
/// the page table itself had to be allocated.
#[test]
fn refcount_conservation_across_the_syscall_surface() {
    let _k = test_support::boot(8 * 1024 * 1024);
    let id = fresh_runnable_env();
    run_as(id);

    let distant = 0x0100_0000u32; // forces a fresh page table
    let before = frame::free_count();
    assert_eq!(call(SyscallNo::MemAlloc, [0, distant, WU, 0]), 0);
    assert_eq!(call(SyscallNo::MemUnmap, [0, distant, 0, 0]), 0);
    // The data frame returned; the page-table frame stays (owned by the
    // directory entry) until destroy.
    assert_eq!(frame::free_count(), before - 1);

    let mut tf = syscall_tf(SyscallNo::EnvDestroy as u32, [0, 0, 0, 0]);
    crate::syscall::dispatch(&mut tf);
}
