//! Memory-mapping system calls.

use super::{HandlerResult, SysResult};
use crate::env::{self, EnvId};
use crate::error::{Error, Result};
use crate::mm::frame;
use crate::mm::layout::{VirtAddr, UTEMP, UTOP};
use crate::mm::PteFlags;

/// A user-controllable mapping target: page aligned, inside
/// `[UTEMP, UTOP)`. Everything below `UTEMP` stays a null-pointer trap.
fn check_va(va: u32) -> Result<VirtAddr> {
    let va = VirtAddr::new(va);
    if va.as_u32() < UTEMP || va.as_u32() >= UTOP || !va.is_page_aligned() {
        return Err(Error::Inval);
    }
    Ok(va)
}

/// Accept exactly the software-visible permission subset.
pub(super) fn check_perm(perm: u32) -> Result<PteFlags> {
    let perm = PteFlags::from_bits(perm).ok_or(Error::Inval)?;
    if !PteFlags::MAPPABLE.contains(perm) {
        return Err(Error::Inval);
    }
    Ok(perm)
}

/// Map a fresh zero page at `va` in `envid`'s space.
pub(super) fn sys_mem_alloc(envid: u32, va: u32, perm: u32) -> HandlerResult {
    let va = check_va(va)?;
    let perm = check_perm(perm)?;
    let target = env::resolve(EnvId(envid), true)?;
    let space = env::space_of(target, false)?;

    let f = frame::alloc(true)?;
    if let Err(e) = space.insert(f, va, perm) {
        frame::free(f);
        return Err(e);
    }
    Ok(SysResult::Value(0))
}

/// Copy the mapping at `(src_envid, src_va)` to `(dst_envid, dst_va)` with
/// new permissions. The frame itself is shared, not copied.
pub(super) fn sys_mem_map(
    src_envid: u32,
    src_va: u32,
    dst_envid: u32,
    dst_va: u32,
    perm: u32,
) -> HandlerResult {
    let src_va = check_va(src_va)?;
    let dst_va = check_va(dst_va)?;
    let perm = check_perm(perm)?;

    let src = env::resolve(EnvId(src_envid), true)?;
    let dst = env::resolve(EnvId(dst_envid), true)?;

    let src_space = env::space_of(src, false)?;
    let (f, _) = src_space.lookup(src_va).ok_or(Error::Inval)?;

    let dst_space = env::space_of(dst, false)?;
    dst_space.insert(f, dst_va, perm)?;
    Ok(SysResult::Value(0))
}

/// Drop the mapping at `va` in `envid`'s space, if any.
pub(super) fn sys_mem_unmap(envid: u32, va: u32) -> HandlerResult {
    let va = check_va(va)?;
    let target = env::resolve(EnvId(envid), true)?;
    env::space_of(target, false)?.remove(va);
    Ok(SysResult::Value(0))
}
