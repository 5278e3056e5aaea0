//! Per-process virtual memory.
//!
//! An address space owns a frame table of `PHYS_PAGES_PER_THREAD` entries
//! (indexed by physical frame, recording which virtual page currently
//! occupies it), a window of physical memory, and a window of the mock disk
//! holding the process's full virtual image. Pages are demand-loaded: the
//! loader only populates the backing store, and every table entry starts
//! invalid.

use crate::error::KernelError;
use crate::fs::open_file::OpenFile;
use crate::fs::synch_disk::SynchDisk;
use crate::memory::noff::NoffHeader;
use log::debug;
use nimbus_vm::{
    Machine, TranslationEntry, NEXT_PC_REG, NUM_TOTAL_REGS, PAGE_SIZE, PC_REG,
    PHYS_PAGES_PER_THREAD, STACK_REG, USER_STACK_SIZE, VIRTUAL_MEMORY_PER_THREAD,
    VIRTUAL_PAGES_PER_THREAD,
};

pub struct AddrSpace {
    /// Frame table; empty while the space is published to the machine.
    page_table: Vec<TranslationEntry>,
    noff: NoffHeader,
    memory_offset: usize,
    disk_offset: usize,
    next_victim: usize,
}

fn fresh_table() -> Vec<TranslationEntry> {
    (0..PHYS_PAGES_PER_THREAD)
        .map(|frame| TranslationEntry {
            virtual_page: 0,
            physical_page: frame as u32,
            valid: false,
            use_bit: false,
            dirty: false,
            read_only: false,
        })
        .collect()
}

impl AddrSpace {
    /// Build an address space from a NOFF executable: reserve the two
    /// windows, copy the code and initialized-data segments into the backing
    /// store at their virtual addresses, and leave every page invalid for
    /// demand loading.
    pub fn new(
        disk: &mut SynchDisk,
        executable: &mut OpenFile,
        machine: &mut Machine,
    ) -> Result<Self, KernelError> {
        let mut header_bytes = [0u8; NoffHeader::SIZE];
        if executable.read_at(disk, &mut header_bytes, 0) < NoffHeader::SIZE {
            return Err(KernelError::BadExecutable("truncated NOFF header".into()));
        }
        let noff = NoffHeader::parse(&header_bytes)?;

        let total = noff.code.size as u64
            + noff.init_data.size as u64
            + noff.uninit_data.size as u64
            + USER_STACK_SIZE as u64;
        if total > VIRTUAL_MEMORY_PER_THREAD as u64 {
            return Err(KernelError::ProgramTooLarge);
        }
        for seg in [&noff.code, &noff.init_data, &noff.uninit_data] {
            if seg.size != 0
                && seg.virtual_addr as u64 + seg.size as u64 > VIRTUAL_MEMORY_PER_THREAD as u64
            {
                return Err(KernelError::BadExecutable(
                    "segment outside the address space".into(),
                ));
            }
        }

        let (memory_offset, disk_offset) = machine.alloc_windows()?;
        debug!(
            "address space: {} code + {} init + {} uninit bytes, backing at {disk_offset:#x}",
            noff.code.size, noff.init_data.size, noff.uninit_data.size
        );

        for seg in [&noff.code, &noff.init_data] {
            if seg.size == 0 {
                continue;
            }
            let mut buf = vec![0u8; seg.size as usize];
            if executable.read_at(disk, &mut buf, seg.in_file_addr) < buf.len() {
                return Err(KernelError::BadExecutable("truncated segment".into()));
            }
            let at = disk_offset + seg.virtual_addr as usize;
            machine.mock_disk[at..at + buf.len()].copy_from_slice(&buf);
        }
        // The uninitialized segment needs no copy: fresh windows are zeroed.

        Ok(Self {
            page_table: fresh_table(),
            noff,
            memory_offset,
            disk_offset,
            next_victim: 0,
        })
    }

    /// Register file for the first run: everything zero, PC at the entry
    /// point, the stack just shy of the top of the address space.
    pub fn initial_registers(&self) -> [i32; NUM_TOTAL_REGS] {
        let mut regs = [0i32; NUM_TOTAL_REGS];
        regs[PC_REG] = 0;
        regs[NEXT_PC_REG] = 4;
        regs[STACK_REG] = (VIRTUAL_PAGES_PER_THREAD * PAGE_SIZE - 16) as i32;
        regs
    }

    /// Context-switch save: fold live TLB entries into the page table,
    /// invalidate them, and take the published state back.
    pub fn save_state(&mut self, machine: &mut Machine) {
        machine.flush_tlb();
        self.page_table = std::mem::take(&mut machine.page_table);
        self.next_victim = machine.next_victim;
    }

    /// Context-switch restore: publish the frame table and window offsets
    /// for the MMU and the page-fault path.
    pub fn restore_state(&mut self, machine: &mut Machine) {
        machine.page_table = std::mem::take(&mut self.page_table);
        machine.memory_offset = self.memory_offset;
        machine.disk_offset = self.disk_offset;
        machine.next_victim = self.next_victim;
    }

    /// Clone this (currently running) address space for fork: a fresh pair
    /// of windows whose backing store equals the parent's logical memory at
    /// this moment. Resident dirty pages are folded in on top of the copied
    /// image; the child's pages all start invalid.
    pub fn fork_copy(&self, machine: &mut Machine) -> Result<AddrSpace, KernelError> {
        let (memory_offset, disk_offset) = machine.alloc_windows()?;

        machine.sync_tlb();
        machine
            .mock_disk
            .copy_within(self.disk_offset..self.disk_offset + VIRTUAL_MEMORY_PER_THREAD, disk_offset);
        for frame in 0..PHYS_PAGES_PER_THREAD {
            let entry = machine.page_table[frame];
            if entry.valid && entry.dirty {
                let bytes = machine.main_memory[machine.frame_range(frame)].to_vec();
                let at = disk_offset + entry.virtual_page as usize * PAGE_SIZE;
                machine.mock_disk[at..at + PAGE_SIZE].copy_from_slice(&bytes);
            }
        }

        Ok(AddrSpace {
            page_table: fresh_table(),
            noff: self.noff,
            memory_offset,
            disk_offset,
            next_victim: 0,
        })
    }
}
