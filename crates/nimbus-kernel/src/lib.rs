//! The Nimbus kernel: the trap handler bound into the simulated machine.
//!
//! User programs reach the kernel two ways: the `syscall` instruction, and
//! page faults raised by the MMU. Both arrive through
//! [`nimbus_vm::TrapHandler::handle_exception`]. Syscalls decode their
//! number and arguments from the register file, run against the file
//! system, the thread manager, or the console, answer in r2, and advance
//! the PC; page faults are serviced and the faulting instruction retries.

pub mod console;
pub mod error;
pub mod fs;
pub mod memory;
pub mod sync;
pub mod syscall;
pub mod thread;
pub mod types;

use console::Console;
use error::KernelError;
use fs::open_file::TableRef;
use fs::FileSystem;
use log::{debug, error, warn};
use memory::addrspace::AddrSpace;
use memory::paging;
use nimbus_vm::{Disk, ExceptionType, Flow, Machine, TrapError, TrapHandler};
use syscall::Syscall;
use thread::tcb::FileDescriptor;
use thread::{ThreadId, ThreadManager};

/// What a file descriptor resolves to, with the open-table reference
/// extracted so no borrow on the thread table is held.
enum FdKind {
    Missing,
    Console,
    File(TableRef),
}

pub struct Kernel {
    pub threads: ThreadManager,
    pub fs: FileSystem,
    pub console: Console,
}

impl Kernel {
    /// Bring the kernel up on a disk, formatting it first when asked.
    pub fn new(disk: Disk, format: bool) -> Result<Self, KernelError> {
        let fs = if format {
            FileSystem::format(disk)?
        } else {
            FileSystem::mount(disk)?
        };
        Ok(Self {
            threads: ThreadManager::new(),
            fs,
            console: Console::stdout(),
        })
    }

    /// Load an executable from the file system into a fresh thread.
    pub fn exec_program(
        &mut self,
        machine: &mut Machine,
        path: &str,
        parent: Option<ThreadId>,
    ) -> Result<ThreadId, KernelError> {
        let mut executable = self.fs.open(path)?;
        let space = AddrSpace::new(self.fs.disk_mut(), &mut executable, machine);
        self.fs.close(executable);
        let space = space?;
        let regs = space.initial_registers();
        Ok(self.threads.spawn(space, regs, parent))
    }

    /// Spawn the first user program and make it current. The caller then
    /// enters `machine.run(&mut kernel)`.
    pub fn start_initial(&mut self, machine: &mut Machine, path: &str) -> Result<ThreadId, KernelError> {
        let tid = self.exec_program(machine, path, None)?;
        self.threads.switch_to_next(machine);
        Ok(tid)
    }

    fn dispatch_syscall(&mut self, machine: &mut Machine) -> Result<Flow, KernelError> {
        let call = match Syscall::from_registers(machine) {
            Ok(call) => call,
            Err(e) => {
                warn!("{e}");
                Syscall::finish(machine, -1);
                return Ok(Flow::Continue);
            }
        };
        debug!(
            "thread {:?}: {call:?}",
            self.threads.current.map(|t| t.val())
        );

        match call {
            Syscall::Halt => Ok(Flow::Halt),
            Syscall::Exit { status } => Ok(self.sys_exit(machine, status)),
            Syscall::Create { path_ptr } => self.sys_create(machine, path_ptr),
            Syscall::Open { path_ptr } => self.sys_open(machine, path_ptr),
            Syscall::Close { fd } => self.sys_close(machine, fd),
            Syscall::Read { buf_ptr, size, fd } => self.sys_read(machine, buf_ptr, size, fd),
            Syscall::Write { buf_ptr, size, fd } => self.sys_write(machine, buf_ptr, size, fd),
            Syscall::Fork { entry_pc } => self.sys_fork(machine, entry_pc),
            Syscall::Exec { path_ptr } => self.sys_exec(machine, path_ptr),
            Syscall::Join { tid } => self.sys_join(machine, tid),
            Syscall::Yield => {
                Syscall::finish(machine, 0);
                self.threads.yield_current(machine);
                Ok(Flow::Continue)
            }
        }
    }

    fn sys_exit(&mut self, machine: &mut Machine, status: i32) -> Flow {
        let fds = std::mem::take(&mut self.threads.current_tcb().fds);
        for descriptor in fds.into_iter().flatten() {
            if let FileDescriptor::File(file) = descriptor {
                self.fs.close(file);
            }
        }
        if self.threads.finish_current(machine, status) {
            Flow::Continue
        } else {
            Flow::Halt
        }
    }

    fn sys_create(&mut self, machine: &mut Machine, path_ptr: u32) -> Result<Flow, KernelError> {
        let path = paging::read_user_string(machine, path_ptr)?;
        let result = match self.fs.create(&path, 0, nimbus_fs::FileKind::Regular) {
            Ok(()) => 0,
            Err(e) => {
                debug!("create {path} failed: {e}");
                -1
            }
        };
        Syscall::finish(machine, result);
        Ok(Flow::Continue)
    }

    fn sys_open(&mut self, machine: &mut Machine, path_ptr: u32) -> Result<Flow, KernelError> {
        let path = paging::read_user_string(machine, path_ptr)?;
        match self.fs.open(&path) {
            Ok(file) => {
                let tcb = self.threads.current_tcb();
                match tcb.alloc_fd() {
                    Some(fd) => {
                        tcb.fds[fd] = Some(FileDescriptor::File(file));
                        Syscall::finish(machine, fd as i32);
                    }
                    None => {
                        debug!("open {path}: descriptor table is full");
                        self.fs.close(file);
                        Syscall::finish(machine, -1);
                    }
                }
            }
            Err(e) => {
                debug!("open {path} failed: {e}");
                Syscall::finish(machine, -1);
            }
        }
        Ok(Flow::Continue)
    }

    fn sys_close(&mut self, machine: &mut Machine, fd: u32) -> Result<Flow, KernelError> {
        let fd = fd as usize;
        let tcb = self.threads.current_tcb();
        // 0 and 1 stay bound to the console for the thread's lifetime.
        let result = if fd < 2 || fd >= tcb.fds.len() {
            -1
        } else {
            match tcb.fds[fd].take() {
                Some(FileDescriptor::File(file)) => {
                    self.fs.close(file);
                    0
                }
                Some(FileDescriptor::Console) => 0,
                None => -1,
            }
        };
        Syscall::finish(machine, result);
        Ok(Flow::Continue)
    }

    /// Classify a descriptor without holding a borrow on the thread table.
    fn fd_kind(&mut self, fd: u32) -> FdKind {
        let tcb = self.threads.current_tcb();
        match tcb.fds.get(fd as usize) {
            Some(Some(FileDescriptor::Console)) => FdKind::Console,
            Some(Some(FileDescriptor::File(file))) => {
                FdKind::File(file.table_ref.expect("facade-opened files are registered"))
            }
            _ => FdKind::Missing,
        }
    }

    /// Take the per-name lock or park the caller. `false` means parked: the
    /// PC was not advanced, so the woken thread re-issues the syscall.
    fn lock_or_park(
        &mut self,
        machine: &mut Machine,
        table_ref: TableRef,
    ) -> Result<bool, KernelError> {
        let tid = self.threads.current.expect("syscall without current thread");
        if self.fs.try_lock(table_ref, tid)? {
            return Ok(true);
        }
        debug!("thread {} waits for a file lock", tid.val());
        if !self.threads.block_current(machine) {
            error!("every thread is parked on a file lock; halting");
        }
        Ok(false)
    }

    /// Flow after a park: keep running whoever was switched in, or halt if
    /// nothing is runnable.
    fn parked_flow(&self) -> Flow {
        if self.threads.current.is_some() {
            Flow::Continue
        } else {
            Flow::Halt
        }
    }

    fn unlock_and_wake(&mut self, table_ref: TableRef) {
        let tid = self.threads.current.expect("syscall without current thread");
        if let Some(next) = self.fs.unlock(table_ref, tid) {
            self.threads.wake(next, None);
        }
    }

    fn sys_read(
        &mut self,
        machine: &mut Machine,
        buf_ptr: u32,
        size: u32,
        fd: u32,
    ) -> Result<Flow, KernelError> {
        match self.fd_kind(fd) {
            FdKind::Missing => {
                Syscall::finish(machine, -1);
                Ok(Flow::Continue)
            }
            FdKind::Console => {
                let data = self.console.read(size as usize);
                paging::copy_to_user(machine, buf_ptr, &data)?;
                Syscall::finish(machine, data.len() as i32);
                Ok(Flow::Continue)
            }
            FdKind::File(table_ref) => {
                if !self.lock_or_park(machine, table_ref)? {
                    return Ok(self.parked_flow());
                }
                let mut data = vec![0u8; size as usize];
                let n = {
                    let Kernel { threads, fs, .. } = self;
                    let tcb = threads.current_tcb();
                    let Some(Some(FileDescriptor::File(file))) = tcb.fds.get_mut(fd as usize)
                    else {
                        unreachable!("fd classified as file above");
                    };
                    fs.read_seq(file, &mut data)
                };
                self.unlock_and_wake(table_ref);
                paging::copy_to_user(machine, buf_ptr, &data[..n])?;
                Syscall::finish(machine, n as i32);
                Ok(Flow::Continue)
            }
        }
    }

    fn sys_write(
        &mut self,
        machine: &mut Machine,
        buf_ptr: u32,
        size: u32,
        fd: u32,
    ) -> Result<Flow, KernelError> {
        match self.fd_kind(fd) {
            FdKind::Missing => {
                Syscall::finish(machine, -1);
                Ok(Flow::Continue)
            }
            FdKind::Console => {
                let data = paging::copy_from_user(machine, buf_ptr, size as usize)?;
                self.console.write(&data);
                Syscall::finish(machine, data.len() as i32);
                Ok(Flow::Continue)
            }
            FdKind::File(table_ref) => {
                if !self.lock_or_park(machine, table_ref)? {
                    return Ok(self.parked_flow());
                }
                let data = paging::copy_from_user(machine, buf_ptr, size as usize)?;
                let written = {
                    let Kernel { threads, fs, .. } = self;
                    let tcb = threads.current_tcb();
                    let Some(Some(FileDescriptor::File(file))) = tcb.fds.get_mut(fd as usize)
                    else {
                        unreachable!("fd classified as file above");
                    };
                    fs.write_seq(file, &data)
                };
                self.unlock_and_wake(table_ref);
                let result = match written {
                    Ok(n) => n as i32,
                    Err(e) => {
                        debug!("write on fd {fd} failed: {e}");
                        -1
                    }
                };
                Syscall::finish(machine, result);
                Ok(Flow::Continue)
            }
        }
    }

    fn sys_fork(&mut self, machine: &mut Machine, entry_pc: u32) -> Result<Flow, KernelError> {
        let parent = self.threads.current.expect("syscall without current thread");
        let space = {
            let parent_tcb = self.threads.threads.get(&parent).expect("current thread exists");
            parent_tcb.space.fork_copy(machine)
        };
        let space = match space {
            Ok(space) => space,
            Err(KernelError::Machine(e)) => {
                debug!("fork failed: {e}");
                Syscall::finish(machine, -1);
                return Ok(Flow::Continue);
            }
            Err(e) => return Err(e),
        };

        // Child: parent's registers at the syscall, restarted at entry_pc.
        let mut regs = machine.registers;
        regs[nimbus_vm::PC_REG] = entry_pc as i32;
        regs[nimbus_vm::NEXT_PC_REG] = entry_pc.wrapping_add(4) as i32;
        regs[nimbus_vm::RET_VAL_REG] = 0;

        let child = self.threads.spawn(space, regs, Some(parent));
        Syscall::finish(machine, child.val() as i32);
        Ok(Flow::Continue)
    }

    fn sys_exec(&mut self, machine: &mut Machine, path_ptr: u32) -> Result<Flow, KernelError> {
        let path = paging::read_user_string(machine, path_ptr)?;
        let parent = self.threads.current;
        let result = match self.exec_program(machine, &path, parent) {
            Ok(tid) => tid.val() as i32,
            Err(e) => {
                debug!("exec {path} failed: {e}");
                -1
            }
        };
        Syscall::finish(machine, result);
        Ok(Flow::Continue)
    }

    fn sys_join(&mut self, machine: &mut Machine, tid: i32) -> Result<Flow, KernelError> {
        let me = self.threads.current.expect("syscall without current thread");
        let target = match ThreadId::new(tid.max(0) as u32) {
            Some(t) => t,
            None => {
                Syscall::finish(machine, -1);
                return Ok(Flow::Continue);
            }
        };
        // A thread may join only its own children.
        let is_child = self
            .threads
            .threads
            .get(&me)
            .expect("current thread exists")
            .children
            .contains(&target);
        if !is_child {
            Syscall::finish(machine, -1);
            return Ok(Flow::Continue);
        }

        let finished = self
            .threads
            .threads
            .get(&target)
            .map(|t| t.exit_status)
            .expect("children stay in the table until joined");
        if let Some(status) = finished {
            self.threads.reap(target);
            Syscall::finish(machine, status);
            return Ok(Flow::Continue);
        }

        // Park until the child exits; its status lands in our saved r2.
        self.threads
            .threads
            .get_mut(&target)
            .expect("checked above")
            .join_waiters
            .wait(me);
        machine.advance_pc();
        if self.threads.block_current(machine) {
            Ok(Flow::Continue)
        } else {
            error!("join deadlock: nothing left to run");
            Ok(Flow::Halt)
        }
    }
}

impl TrapHandler for Kernel {
    fn handle_exception(
        &mut self,
        which: ExceptionType,
        machine: &mut Machine,
    ) -> Result<Flow, TrapError> {
        match which {
            ExceptionType::Syscall => self
                .dispatch_syscall(machine)
                .map_err(|e| TrapError::Fatal(e.to_string())),
            ExceptionType::PageFault => {
                paging::service_page_fault(machine)
                    .map_err(|e| TrapError::Fatal(e.to_string()))?;
                Ok(Flow::Continue)
            }
            other => Err(TrapError::Unhandled(other)),
        }
    }
}
