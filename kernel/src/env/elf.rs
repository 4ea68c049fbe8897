//! Program-image loading.
//!
//! Walks the PT_LOAD segments of a little-endian MIPS executable and
//! materializes them in a target address space: zeroed frames mapped per
//! page, file bytes copied through the page tables, bss left zero.

use elf::abi::{EM_MIPS, ET_EXEC, PF_W, PT_LOAD};
use elf::endian::LittleEndian;
use elf::ElfBytes;

use crate::error::{Error, Result};
use crate::mm::layout::{user_range_ok, VirtAddr, PAGE_SIZE};
use crate::mm::{frame, AddressSpace, PteFlags};

/// Load `image` into `space`; returns the entry point.
pub fn load(space: &AddressSpace, image: &[u8]) -> Result<u32> {
    let file =
        ElfBytes::<LittleEndian>::minimal_parse(image).map_err(|_| Error::NotExecutable)?;
    if file.ehdr.e_machine != EM_MIPS || file.ehdr.e_type != ET_EXEC {
        return Err(Error::NotExecutable);
    }
    let segments = file.segments().ok_or(Error::NotExecutable)?;
    for phdr in segments.iter() {
        if phdr.p_type != PT_LOAD {
            continue;
        }
        load_segment(
            space,
            image,
            phdr.p_vaddr as u32,
            phdr.p_offset as usize,
            phdr.p_filesz as usize,
            phdr.p_memsz as usize,
            phdr.p_flags,
        )?;
    }
    Ok(file.ehdr.e_entry as u32)
}

fn load_segment(
    space: &AddressSpace,
    image: &[u8],
    vaddr: u32,
    offset: usize,
    filesz: usize,
    memsz: usize,
    p_flags: u32,
) -> Result<()> {
    if filesz > memsz || offset.checked_add(filesz).map_or(true, |end| end > image.len()) {
        return Err(Error::NotExecutable);
    }
    if !user_range_ok(VirtAddr::new(vaddr), memsz) {
        return Err(Error::NotExecutable);
    }

    let mut perm = PteFlags::USER;
    if p_flags & PF_W != 0 {
        perm |= PteFlags::WRITABLE;
    }

    let start = VirtAddr::new(vaddr).page_align_down();
    let end = (vaddr as usize + memsz + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    let pages = (end - start.as_usize()) / PAGE_SIZE;
    for i in 0..pages {
        let page = start.add((i * PAGE_SIZE) as u32);
        if space.lookup(page).is_none() {
            let f = frame::alloc(true)?;
            space.insert(f, page, perm)?;
        }
    }

    space.write_bytes(VirtAddr::new(vaddr), &image[offset..offset + filesz])
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::test_support;

    #[test]
    fn rejects_garbage_images() {
        let _k = test_support::boot(8 * 1024 * 1024);
        let space = AddressSpace::new(1).unwrap();
        assert_eq!(load(&space, b"not an elf"), Err(Error::NotExecutable));
        assert_eq!(load(&space, &[]), Err(Error::NotExecutable));
    }

    #[test]
    fn loads_a_minimal_executable() {
        let _k = test_support::boot(8 * 1024 * 1024);
        let space = AddressSpace::new(1).unwrap();
        let image = test_support::tiny_elf(0x0040_0000, b"\x01\x02\x03\x04hello");
        let entry = load(&space, &image).expect("well-formed image must load");
        assert_eq!(entry, 0x0040_0000);

        let mut data = [0u8; 9];
        space
            .read_bytes(VirtAddr::new(0x0040_0000), &mut data)
            .unwrap();
        assert_eq!(&data, b"\x01\x02\x03\x04hello");

        // bss tail beyond filesz stays zero.
        let mut tail = [0xFFu8; 4];
        space
            .read_bytes(VirtAddr::new(0x0040_0000 + 9), &mut tail)
            .unwrap();
        assert_eq!(tail, [0, 0, 0, 0]);
    }
}
