//! Environment-lifecycle system calls.

use core::mem::size_of;

use super::{current_env, HandlerResult, SysResult};
use crate::env::{self, EnvId, EnvStatus};
use crate::error::{Error, Result};
use crate::mm::layout::{user_range_ok, VirtAddr, UTOP};
use crate::sched;
use crate::trap::{reg, TrapFrame};

pub(super) fn sys_getenvid() -> HandlerResult {
    Ok(SysResult::Value(current_env()?.0 as i32))
}

/// Destroy `envid` (self or child). Destroying the caller never returns.
pub(super) fn sys_env_destroy(envid: u32) -> HandlerResult {
    let target = env::resolve(EnvId(envid), true)?;
    let was_current = sched::current() == Some(target);
    env::destroy(target)?;
    if was_current {
        Ok(SysResult::Dead)
    } else {
        Ok(SysResult::Value(0))
    }
}

/// Record an exit status, then destroy the caller. Never returns.
pub(super) fn sys_exit(status: u32) -> HandlerResult {
    let cur = current_env()?;
    env::with_env(cur, false, |e| e.exit_status = status as i32)?;
    env::destroy(cur)?;
    Ok(SysResult::Dead)
}

/// Register the page-fault upcall entry and exception-stack top.
pub(super) fn sys_set_fault_handler(envid: u32, entry: u32, xstack_top: u32) -> HandlerResult {
    if entry >= UTOP || xstack_top > UTOP {
        return Err(Error::Inval);
    }
    let target = env::resolve(EnvId(envid), true)?;
    env::with_env(target, false, |e| {
        e.fault_entry = entry;
        e.fault_stack = xstack_top;
    })?;
    Ok(SysResult::Value(0))
}

/// Allocate a child whose saved trap frame is a copy of the caller's with
/// `v0` forced to zero: the child observes `exofork() == 0` once it runs.
pub(super) fn sys_exofork(tf: &TrapFrame) -> HandlerResult {
    let cur = current_env()?;
    let child = env::alloc(cur)?;
    let priority = env::priority_of(cur)?;
    env::with_env(child, false, |e| {
        e.tf = *tf;
        e.tf.regs[reg::V0] = 0;
        e.priority = priority;
        e.status = EnvStatus::NotRunnable;
    })?;
    Ok(SysResult::Value(child.0 as i32))
}

fn status_from(raw: u32) -> Result<EnvStatus> {
    match raw {
        1 => Ok(EnvStatus::Runnable),
        2 => Ok(EnvStatus::NotRunnable),
        _ => Err(Error::Inval),
    }
}

/// Move an Env between RUNNABLE and NOT_RUNNABLE, keeping the run queue in
/// step.
pub(super) fn sys_set_env_status(envid: u32, status: u32) -> HandlerResult {
    let status = status_from(status)?;
    let target = env::resolve(EnvId(envid), true)?;
    let old = env::with_env(target, false, |e| {
        let old = e.status;
        e.status = status;
        old
    })?;
    if old != status {
        match status {
            EnvStatus::Runnable => sched::push(target),
            _ => sched::remove(target),
        }
    }
    Ok(SysResult::Value(0))
}

/// Overwrite an Env's saved trap frame with one read from the caller's
/// memory. Targeting the caller itself replaces the live frame and resumes
/// straight into it (this is how the fault upcall returns).
pub(super) fn sys_set_trapframe(envid: u32, tf_va: u32, live: &mut TrapFrame) -> HandlerResult {
    let va = VirtAddr::new(tf_va);
    if !user_range_ok(va, size_of::<TrapFrame>()) || tf_va & 3 != 0 {
        return Err(Error::Inval);
    }
    let target = env::resolve(EnvId(envid), true)?;

    let mut new_tf = TrapFrame::zeroed();
    let caller_space = env::space_of(current_env()?, false)?;
    caller_space.read_bytes(va, new_tf.as_bytes_mut())?;

    if sched::current() == Some(target) {
        *live = new_tf;
        Ok(SysResult::Raw)
    } else {
        env::with_env(target, false, |e| e.tf = new_tf)?;
        Ok(SysResult::Value(0))
    }
}
