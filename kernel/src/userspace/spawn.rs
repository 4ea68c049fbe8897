//! Spawn: start a program from the file server in a fresh Env.
//!
//! Everything happens in user space: the image is read through a mapped
//! fd, segments are staged page by page through `UTEMP` and handed to the
//! child with `mem_map`, the argument page is built below `USTACKTOP`, and
//! the child's trap frame is pointed at the entry before it is made
//! runnable.

use elf::abi::{PF_W, PT_LOAD};
use elf::endian::LittleEndian;
use elf::ElfBytes;

use super::fd::{self, O_RDONLY};
use super::file::FileFd;
use super::{file, syscall, va_flags};
use crate::env::{EnvId, EnvStatus};
use crate::error::{Error, Result};
use crate::mm::layout::{VirtAddr, PAGE_SIZE, PDMAP, USTACKTOP, UTEMP};
use crate::mm::PteFlags;
use crate::trap::{reg, TrapFrame};

/// Argument page contents plus the initial stack pointer and argv address
/// (both child addresses). Kept pure so the layout is testable.
pub struct ArgPage {
    pub page: [u8; PAGE_SIZE],
    pub sp: u32,
    pub argv: u32,
    pub argc: u32,
}

/// Lay out `args` in the page that will sit at `[USTACKTOP - PAGE_SIZE,
/// USTACKTOP)`: string bytes at the top, the argv pointer array below them,
/// and `argc`/`argv` words at the initial `sp`.
pub fn build_arg_page(args: &[&str]) -> Result<ArgPage> {
    let base = USTACKTOP - PAGE_SIZE as u32;
    let mut page = [0u8; PAGE_SIZE];

    let strings: usize = args.iter().map(|a| a.len() + 1).sum();
    let argv_bytes = 4 * (args.len() + 1);
    if strings + argv_bytes + 8 > PAGE_SIZE / 2 {
        return Err(Error::Inval);
    }

    // Strings, NUL-terminated, packed against the top of the page.
    let mut str_off = PAGE_SIZE - strings;
    str_off &= !3;
    let argv_off = str_off - argv_bytes;
    let sp_off = argv_off - 8;

    let mut cursor = str_off;
    for (i, arg) in args.iter().enumerate() {
        page[cursor..cursor + arg.len()].copy_from_slice(arg.as_bytes());
        page[cursor + arg.len()] = 0;
        let ptr = base + cursor as u32;
        page[argv_off + 4 * i..argv_off + 4 * i + 4].copy_from_slice(&ptr.to_le_bytes());
        cursor += arg.len() + 1;
    }
    // argv[argc] stays NULL (page is zeroed).

    let argv = base + argv_off as u32;
    page[sp_off..sp_off + 4].copy_from_slice(&(args.len() as u32).to_le_bytes());
    page[sp_off + 4..sp_off + 8].copy_from_slice(&argv.to_le_bytes());

    Ok(ArgPage {
        page,
        sp: base + sp_off as u32,
        argv,
        argc: args.len() as u32,
    })
}

/// Stage one page of bytes into the child at `dst` via `UTEMP`.
fn push_page(child: EnvId, dst: VirtAddr, bytes: &[u8], perm: PteFlags) -> Result<()> {
    let temp = VirtAddr::new(UTEMP);
    syscall::mem_alloc(EnvId::CURRENT, temp, PteFlags::WRITABLE | PteFlags::USER)?;
    // SAFETY: UTEMP was just mapped writable; bytes fit in one page.
    unsafe {
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), UTEMP as *mut u8, bytes.len());
    }
    syscall::mem_map(EnvId::CURRENT, temp, child, dst, perm)?;
    syscall::mem_unmap(EnvId::CURRENT, temp)
}

fn load_segments(child: EnvId, image: &[u8]) -> Result<u32> {
    let elf_file =
        ElfBytes::<LittleEndian>::minimal_parse(image).map_err(|_| Error::NotExecutable)?;
    let segments = elf_file.segments().ok_or(Error::NotExecutable)?;

    for phdr in segments.iter() {
        if phdr.p_type != PT_LOAD {
            continue;
        }
        let vaddr = phdr.p_vaddr as u32;
        let offset = phdr.p_offset as usize;
        let filesz = phdr.p_filesz as usize;
        let memsz = phdr.p_memsz as usize;
        if filesz > memsz || offset + filesz > image.len() || vaddr & (PAGE_SIZE as u32 - 1) != 0 {
            return Err(Error::NotExecutable);
        }

        let mut perm = PteFlags::USER;
        if phdr.p_flags & PF_W != 0 {
            perm |= PteFlags::WRITABLE;
        }

        let mut done = 0;
        while done < memsz {
            let n = core::cmp::min(PAGE_SIZE, memsz - done);
            let copied = filesz.saturating_sub(done).min(n);
            push_page(
                child,
                VirtAddr::new(vaddr + done as u32),
                &image[offset + done..offset + done + copied],
                perm,
            )?;
            done += n;
        }
    }
    Ok(elf_file.ehdr.e_entry as u32)
}

/// Share every `LIBRARY` page (fd table, open file windows, pipes) with the
/// child, so spawned programs inherit open descriptors.
fn share_library_pages(child: EnvId) -> Result<()> {
    let mut va = 0u32;
    while va < USTACKTOP {
        let page = VirtAddr::new(va);
        if !dir_present(page) {
            va = (va & !(PDMAP - 1)) + PDMAP;
            continue;
        }
        if let Some(flags) = va_flags(page) {
            if flags.contains(PteFlags::LIBRARY) {
                syscall::mem_map(EnvId::CURRENT, page, child, page, flags & PteFlags::MAPPABLE)?;
            }
        }
        va += PAGE_SIZE as u32;
    }
    Ok(())
}

fn dir_present(va: VirtAddr) -> bool {
    // SAFETY: UVPT directory view is read-only mapped in user Envs.
    unsafe { (*super::vpd().add(va.pdx())).is_valid() }
}

/// Run `path` with `args` in a new Env; returns its id.
pub fn spawn(path: &str, args: &[&str]) -> Result<EnvId> {
    let fdnum = file::open(path, O_RDONLY)?;
    let result = spawn_from_fd(fdnum, args);
    let _ = fd::close(fdnum);
    result
}

fn spawn_from_fd(fdnum: usize, args: &[&str]) -> Result<EnvId> {
    // SAFETY: open mapped the FileFd page and the whole file at the data
    // window.
    let (size, image) = unsafe {
        let ffd = &*(fd::fd_va(fdnum).as_u32() as *const FileFd);
        let size = ffd.file.size as usize;
        (size, core::slice::from_raw_parts(fd::data_va(fdnum).as_u32() as *const u8, size))
    };
    if size == 0 {
        return Err(Error::NotExecutable);
    }

    let child = syscall::exofork()?;
    // The child never runs this code: it stays NOT_RUNNABLE until its trap
    // frame has been replaced below.

    let arg_page = build_arg_page(args)?;
    push_page(
        child,
        VirtAddr::new(USTACKTOP - PAGE_SIZE as u32),
        &arg_page.page,
        PteFlags::WRITABLE | PteFlags::USER,
    )?;

    let entry = load_segments(child, image)?;
    share_library_pages(child)?;

    // Point the child at the program: entry pc, argument stack, argc/argv
    // in the argument registers.
    let child_slot = super::env_slot(child.slot());
    // SAFETY: reading the child's saved frame through the UENVS window.
    let mut tf: TrapFrame = unsafe { core::ptr::read_volatile(core::ptr::addr_of!((*child_slot).tf)) };
    tf.epc = entry;
    tf.regs[reg::SP] = arg_page.sp;
    tf.regs[reg::A0] = arg_page.argc;
    tf.regs[reg::A1] = arg_page.argv;
    syscall::set_trapframe(child, &tf)?;

    syscall::set_env_status(child, EnvStatus::Runnable)?;
    Ok(child)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn arg_page_layout() {
        let ap = build_arg_page(&["prog", "-x", "file.txt"]).unwrap();
        let base = USTACKTOP - PAGE_SIZE as u32;
        assert_eq!(ap.argc, 3);
        assert!(ap.sp >= base && ap.sp < USTACKTOP);
        assert_eq!(ap.sp % 4, 0);

        // sp points at [argc][argv].
        let off = (ap.sp - base) as usize;
        let argc = u32::from_le_bytes(ap.page[off..off + 4].try_into().unwrap());
        let argv = u32::from_le_bytes(ap.page[off + 4..off + 8].try_into().unwrap());
        assert_eq!(argc, 3);
        assert_eq!(argv, ap.argv);

        // Each argv entry points at its NUL-terminated string; the array is
        // NULL-terminated.
        let argv_off = (argv - base) as usize;
        for (i, expect) in ["prog", "-x", "file.txt"].iter().enumerate() {
            let p = u32::from_le_bytes(
                ap.page[argv_off + 4 * i..argv_off + 4 * i + 4].try_into().unwrap(),
            );
            let s_off = (p - base) as usize;
            assert_eq!(&ap.page[s_off..s_off + expect.len()], expect.as_bytes());
            assert_eq!(ap.page[s_off + expect.len()], 0);
        }
        let terminator =
            u32::from_le_bytes(ap.page[argv_off + 12..argv_off + 16].try_into().unwrap());
        assert_eq!(terminator, 0);
    }

    #[test]
    fn arg_page_rejects_oversized_argument_lists() {
        let long = ["x"; 600];
        assert_eq!(build_arg_page(&long).err(), Some(Error::Inval));
    }

    #[test]
    fn empty_args_still_form_a_stack() {
        let ap = build_arg_page(&[]).unwrap();
        let base = USTACKTOP - PAGE_SIZE as u32;
        let off = (ap.sp - base) as usize;
        let argc = u32::from_le_bytes(ap.page[off..off + 4].try_into().unwrap());
        assert_eq!(argc, 0);
    }
}
