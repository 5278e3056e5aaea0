use crate::fs::open_file::OpenFile;
use crate::fs::FD_COUNT;
use crate::memory::addrspace::AddrSpace;
use crate::sync::Condition;
use crate::types::ThreadId;
use nimbus_vm::NUM_TOTAL_REGS;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Ready,
    Running,
    Blocked,
    Finished,
}

/// What a file-descriptor slot is bound to.
#[derive(Debug)]
pub enum FileDescriptor {
    Console,
    File(OpenFile),
}

/// Per-thread kernel state: the saved user register file, the address
/// space, descriptors, and the parent/child bookkeeping join relies on.
pub struct Tcb {
    pub id: ThreadId,
    pub state: ThreadState,
    pub user_regs: [i32; NUM_TOTAL_REGS],
    pub space: AddrSpace,
    pub fds: Vec<Option<FileDescriptor>>,
    pub parent: Option<ThreadId>,
    pub children: BTreeSet<ThreadId>,
    /// Threads parked in Join on this thread, broadcast on exit.
    pub join_waiters: Condition,
    pub exit_status: Option<i32>,
}

impl Tcb {
    pub fn new(id: ThreadId, space: AddrSpace, user_regs: [i32; NUM_TOTAL_REGS]) -> Self {
        let mut fds: Vec<Option<FileDescriptor>> = (0..FD_COUNT).map(|_| None).collect();
        fds[0] = Some(FileDescriptor::Console);
        fds[1] = Some(FileDescriptor::Console);
        Self {
            id,
            state: ThreadState::Ready,
            user_regs,
            space,
            fds,
            parent: None,
            children: BTreeSet::new(),
            join_waiters: Condition::new(),
            exit_status: None,
        }
    }

    /// First free descriptor slot past the console pair.
    pub fn alloc_fd(&self) -> Option<usize> {
        (2..self.fds.len()).find(|&i| self.fds[i].is_none())
    }
}
