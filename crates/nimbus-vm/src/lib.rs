pub mod cpu;
pub mod disk;
pub mod error;
pub mod instruction;
pub mod machine;
pub mod trap;

pub use cpu::*;
pub use disk::*;
pub use error::*;
pub use instruction::*;
pub use machine::*;
pub use trap::*;

/// A virtual page is exactly one disk sector; the backing store moves pages
/// with single-sector granularity.
pub const PAGE_SIZE: usize = nimbus_fs::SECTOR_SIZE;

/// General-purpose MIPS registers.
pub const NUM_GP_REGS: usize = 32;
/// Full register file: 32 GP registers plus the simulator specials below.
pub const NUM_TOTAL_REGS: usize = 40;

/// r2 carries syscall numbers in and results out.
pub const RET_VAL_REG: usize = 2;
/// r4-r7 carry up to four syscall arguments.
pub const ARG_1_REG: usize = 4;
pub const ARG_2_REG: usize = 5;
pub const ARG_3_REG: usize = 6;
pub const ARG_4_REG: usize = 7;
/// r29, the user stack pointer.
pub const STACK_REG: usize = 29;
/// r31, the link register written by jal/jalr.
pub const RET_ADDR_REG: usize = 31;

pub const HI_REG: usize = 32;
pub const LO_REG: usize = 33;
pub const PC_REG: usize = 34;
pub const NEXT_PC_REG: usize = 35;
pub const PREV_PC_REG: usize = 36;
/// Faulting virtual address, latched on every failed translation.
pub const BAD_VADDR_REG: usize = 39;

/// Software-managed translation cache entries.
pub const TLB_SIZE: usize = 4;

/// Physical frames reserved for each process.
pub const PHYS_PAGES_PER_THREAD: usize = 32;
/// Virtual pages addressable by each process.
pub const VIRTUAL_PAGES_PER_THREAD: usize = 128;
/// Full virtual image of one process, in bytes.
pub const VIRTUAL_MEMORY_PER_THREAD: usize = VIRTUAL_PAGES_PER_THREAD * PAGE_SIZE;

/// Upper bound on concurrently live address spaces; windows are never
/// reclaimed, so this bounds both memories.
pub const MAX_MACHINE_THREADS: usize = 16;
/// Bytes of simulated physical memory.
pub const MEMORY_SIZE: usize = MAX_MACHINE_THREADS * PHYS_PAGES_PER_THREAD * PAGE_SIZE;
/// Bytes of mock-disk backing store.
pub const MOCK_DISK_SIZE: usize = MAX_MACHINE_THREADS * VIRTUAL_MEMORY_PER_THREAD;

/// Bytes of user stack reserved above the loaded segments.
pub const USER_STACK_SIZE: usize = 1024;
