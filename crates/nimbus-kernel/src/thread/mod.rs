//! Kernel threads.
//!
//! There is no preemption inside the kernel: a thread runs until it traps,
//! and the manager only ever switches contexts at trap boundaries. A context
//! switch saves the machine register file and the address-space state
//! (folding live TLB entries back into the page table) into the outgoing
//! thread, and publishes the incoming thread's state to the machine.

pub mod scheduler;
pub mod tcb;

use crate::memory::addrspace::AddrSpace;
use log::{debug, info};
use nimbus_vm::{Machine, NUM_TOTAL_REGS, RET_VAL_REG};
use scheduler::{RoundRobinScheduler, Scheduler};
use std::collections::BTreeMap;
use tcb::{Tcb, ThreadState};

pub use crate::types::ThreadId;

pub struct ThreadManager {
    pub threads: BTreeMap<ThreadId, Tcb>,
    pub scheduler: Box<dyn Scheduler>,
    pub current: Option<ThreadId>,
    next_id: u32,
}

impl Default for ThreadManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadManager {
    pub fn new() -> Self {
        Self {
            threads: BTreeMap::new(),
            scheduler: Box::new(RoundRobinScheduler::new()),
            current: None,
            next_id: 1,
        }
    }

    /// Create a ready thread and wire up the parent/child links.
    pub fn spawn(
        &mut self,
        space: AddrSpace,
        user_regs: [i32; NUM_TOTAL_REGS],
        parent: Option<ThreadId>,
    ) -> ThreadId {
        let id = ThreadId::new(self.next_id).expect("thread ids start at 1");
        self.next_id += 1;
        let mut tcb = Tcb::new(id, space, user_regs);
        tcb.parent = parent;
        if let Some(p) = parent {
            self.threads
                .get_mut(&p)
                .expect("parent exists")
                .children
                .insert(id);
        }
        self.threads.insert(id, tcb);
        self.scheduler.enqueue(id);
        debug!("spawned thread {}", id.val());
        id
    }

    pub fn current_tcb(&mut self) -> &mut Tcb {
        let id = self.current.expect("no current thread");
        self.threads.get_mut(&id).expect("current thread exists")
    }

    fn save_current(&mut self, machine: &mut Machine) {
        if let Some(id) = self.current {
            let tcb = self.threads.get_mut(&id).expect("current thread exists");
            tcb.user_regs = machine.registers;
            tcb.space.save_state(machine);
        }
    }

    /// Pick the next ready thread and publish its state to the machine.
    /// Stale ids left in the queue by reaped threads are skipped. Returns
    /// false when nothing is runnable.
    pub fn switch_to_next(&mut self, machine: &mut Machine) -> bool {
        while let Some(next) = self.scheduler.schedule() {
            if let Some(tcb) = self.threads.get_mut(&next) {
                if tcb.state == ThreadState::Ready {
                    tcb.state = ThreadState::Running;
                    machine.registers = tcb.user_regs;
                    tcb.space.restore_state(machine);
                    self.current = Some(next);
                    debug!("switched to thread {}", next.val());
                    return true;
                }
            }
        }
        self.current = None;
        false
    }

    /// Voluntarily give up the CPU; the caller stays ready and may be
    /// rescheduled immediately if nothing else is runnable.
    pub fn yield_current(&mut self, machine: &mut Machine) {
        if let Some(id) = self.current {
            self.save_current(machine);
            let tcb = self.threads.get_mut(&id).expect("current thread exists");
            tcb.state = ThreadState::Ready;
            self.scheduler.enqueue(id);
        }
        self.switch_to_next(machine);
    }

    /// Park the current thread (join, lock wait). Returns false when no
    /// other thread is runnable, i.e. the system would sleep forever.
    pub fn block_current(&mut self, machine: &mut Machine) -> bool {
        if let Some(id) = self.current {
            self.save_current(machine);
            let tcb = self.threads.get_mut(&id).expect("current thread exists");
            tcb.state = ThreadState::Blocked;
            self.current = None;
        }
        self.switch_to_next(machine)
    }

    /// Make a parked thread ready, optionally delivering a syscall result
    /// into its saved r2.
    pub fn wake(&mut self, id: ThreadId, retval: Option<i32>) {
        if let Some(tcb) = self.threads.get_mut(&id) {
            if tcb.state == ThreadState::Blocked {
                if let Some(v) = retval {
                    tcb.user_regs[RET_VAL_REG] = v;
                }
                tcb.state = ThreadState::Ready;
                self.scheduler.enqueue(id);
            }
        }
    }

    /// Remove a finished thread and detach it from its parent.
    pub fn reap(&mut self, id: ThreadId) -> Option<i32> {
        let tcb = self.threads.remove(&id)?;
        if let Some(p) = tcb.parent {
            if let Some(parent) = self.threads.get_mut(&p) {
                parent.children.remove(&id);
            }
        }
        tcb.exit_status
    }

    /// Terminate the current thread: record the status, wake joiners with
    /// it, orphan the children, and switch away. A thread that was already
    /// joined (or has no parent) is reaped immediately; otherwise it lingers
    /// as a zombie until the parent joins. Returns false when nothing is
    /// left to run.
    pub fn finish_current(&mut self, machine: &mut Machine, status: i32) -> bool {
        let id = self.current.take().expect("no current thread to finish");
        info!("thread {} exits with status {status}", id.val());

        let (waiters, children) = {
            let tcb = self.threads.get_mut(&id).expect("current thread exists");
            tcb.state = ThreadState::Finished;
            tcb.exit_status = Some(status);
            (
                tcb.join_waiters.broadcast(),
                std::mem::take(&mut tcb.children),
            )
        };

        for child in children {
            if let Some(child_tcb) = self.threads.get_mut(&child) {
                child_tcb.parent = None;
                if child_tcb.state == ThreadState::Finished {
                    self.threads.remove(&child);
                }
            }
        }

        let joined = !waiters.is_empty();
        for waiter in waiters {
            self.wake(waiter, Some(status));
        }

        let orphan = self.threads.get(&id).expect("still present").parent.is_none();
        if joined || orphan {
            self.reap(id);
        }

        self.switch_to_next(machine)
    }
}
