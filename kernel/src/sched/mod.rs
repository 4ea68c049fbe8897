//! Round-robin scheduler with priority-sized quanta.
//!
//! One queue holds every runnable Env, the running one at its head. An Env
//! keeps the CPU for `priority` timer ticks, then rotates to the tail.
//! `schedule` is the pure decision; `run` performs the address-space switch
//! and the return to user mode.

extern crate alloc;

use alloc::collections::VecDeque;

use spin::Mutex;

use crate::env::{self, EnvId, EnvStatus};
use crate::mm;

struct Scheduler {
    queue: VecDeque<EnvId>,
    current: Option<EnvId>,
}

static SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler {
    queue: VecDeque::new(),
    current: None,
});

/// The running Env, if any.
pub fn current() -> Option<EnvId> {
    SCHEDULER.lock().current
}

/// Append `id` to the run queue if it is not already queued.
pub fn push(id: EnvId) {
    let mut s = SCHEDULER.lock();
    if !s.queue.contains(&id) {
        s.queue.push_back(id);
    }
}

/// Detach `id` from the run queue (blocking on IPC receive).
pub fn remove(id: EnvId) {
    let mut s = SCHEDULER.lock();
    s.queue.retain(|&e| e != id);
}

/// Forget a destroyed Env entirely.
pub fn on_destroyed(id: EnvId) {
    let mut s = SCHEDULER.lock();
    s.queue.retain(|&e| e != id);
    if s.current == Some(id) {
        s.current = None;
    }
}

/// Pick the Env to run for the next tick.
///
/// The current Env keeps the CPU while it stays runnable with quantum left
/// and did not yield; otherwise it rotates to the tail (if still runnable)
/// and the head takes over with a fresh quantum. `None` means the queue is
/// empty and the machine should halt.
pub fn schedule(yielding: bool) -> Option<EnvId> {
    let mut s = SCHEDULER.lock();

    if let Some(cur) = s.current {
        match env::peek_sched(cur) {
            Some((EnvStatus::Runnable, quantum)) if quantum > 0 && !yielding => {
                env::sched_touch(cur, |e| e.quantum_left -= 1);
                return Some(cur);
            }
            Some((EnvStatus::Runnable, _)) => {
                // Quantum spent or voluntary yield: rotate to the tail.
                s.queue.retain(|&e| e != cur);
                s.queue.push_back(cur);
            }
            _ => {
                // Blocked or gone; it already left the queue.
                s.current = None;
            }
        }
    }

    let next = *s.queue.front()?;
    s.current = Some(next);
    env::sched_touch(next, |e| {
        // This entry consumes the first tick of the fresh quantum.
        e.quantum_left = e.priority.saturating_sub(1);
        e.runs = e.runs.wrapping_add(1);
    });
    Some(next)
}

/// Switch to `id`'s address space and resume its saved trap frame.
pub fn run(id: EnvId) -> ! {
    let space = env::space_of(id, false).expect("scheduling a dead env");
    let tf = env::tf_ptr(id).expect("scheduling a dead env");
    mm::set_current_space(space);
    // SAFETY: `tf` points into the Env table, valid until the next trap;
    // the space was just made current.
    unsafe { crate::arch::ret_to_user(tf, space.asid) }
}

/// Drop all scheduler state (test boots).
#[cfg(not(target_os = "none"))]
pub(crate) fn reset() {
    let mut s = SCHEDULER.lock();
    s.queue.clear();
    s.current = None;
}

/// Make `id` the running Env directly, as if it had just been picked
/// (test boots drive syscalls from arbitrary Envs this way).
#[cfg(not(target_os = "none"))]
pub(crate) fn adopt(id: EnvId) {
    let mut s = SCHEDULER.lock();
    if !s.queue.contains(&id) {
        s.queue.push_back(id);
    }
    s.current = Some(id);
}
