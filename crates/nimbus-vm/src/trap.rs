use crate::machine::Machine;
use thiserror::Error;

/// Why the machine transferred control to the kernel. The set mirrors the
/// MIPS exception causes the simulator can raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionType {
    /// `syscall` instruction executed in user mode.
    Syscall,
    /// No valid translation for the faulting address.
    PageFault,
    /// Store to a page mapped read-only.
    ReadOnly,
    /// Translated address fell outside the process's memory window.
    BusError,
    /// Misaligned load/store.
    AddressError,
    /// Signed arithmetic overflow.
    Overflow,
    /// Undecodable instruction word.
    IllegalInstruction,
}

/// What the run loop should do after a trap was serviced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Halt,
}

#[derive(Debug, Error)]
pub enum TrapError {
    #[error("unhandled exception: {0:?}")]
    Unhandled(ExceptionType),

    #[error("kernel fault: {0}")]
    Fatal(String),
}

/// Implemented by the kernel: services an exception raised mid-instruction.
/// Faulting instructions are retried, so the handler must either repair the
/// cause (page faults) or advance the PC itself (syscalls).
pub trait TrapHandler {
    fn handle_exception(
        &mut self,
        which: ExceptionType,
        machine: &mut Machine,
    ) -> Result<Flow, TrapError>;
}
