use crate::trap::{ExceptionType, TrapError};
use thiserror::Error;

/// A failed memory access. Faults are not errors in the usual sense: the
/// kernel services them and the access is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MachineFault {
    #[error("page fault at {vaddr:#x}")]
    PageFault { vaddr: u32 },

    #[error("write to read-only page at {vaddr:#x}")]
    ReadOnly { vaddr: u32 },

    #[error("misaligned access at {vaddr:#x}")]
    AddressError { vaddr: u32 },

    #[error("physical address {paddr:#x} outside the process window")]
    BusError { paddr: u32 },
}

impl MachineFault {
    pub fn exception(self) -> ExceptionType {
        match self {
            MachineFault::PageFault { .. } => ExceptionType::PageFault,
            MachineFault::ReadOnly { .. } => ExceptionType::ReadOnly,
            MachineFault::AddressError { .. } => ExceptionType::AddressError,
            MachineFault::BusError { .. } => ExceptionType::BusError,
        }
    }
}

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("trap error: {0}")]
    Trap(#[from] TrapError),

    #[error("out of physical memory windows")]
    OutOfMemoryWindows,

    #[error("out of mock-disk windows")]
    OutOfBackingStore,
}
