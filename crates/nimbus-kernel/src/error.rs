use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("no such file or directory: {0}")]
    NotFound(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("file already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("directory is full")]
    DirectoryFull,

    #[error("open-file table is full")]
    OpenTableFull,

    #[error("no free sectors left on disk")]
    NoFreeSectors,

    #[error("file would exceed the maximum file size")]
    FileTooLarge,

    #[error("corrupted file header in sector {0}")]
    BadHeader(u32),

    #[error("stale open-file handle")]
    StaleHandle,
}

#[derive(Debug, Error)]
pub enum KernelError {
    #[error(transparent)]
    Fs(#[from] FsError),

    #[error("bad executable: {0}")]
    BadExecutable(String),

    #[error("program does not fit in an address space")]
    ProgramTooLarge,

    #[error(transparent)]
    Machine(#[from] nimbus_vm::MachineError),

    #[error("virtual address {0:#x} outside the address space")]
    BadVirtualAddress(u32),

    #[error("unexpected fault while touching user memory: {0}")]
    UserAccess(nimbus_vm::MachineFault),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SyscallError {
    #[error("unknown syscall number {0}")]
    UnknownSyscall(i32),
}
