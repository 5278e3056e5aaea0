use crate::error::{MachineError, MachineFault};
use crate::{
    BAD_VADDR_REG, MEMORY_SIZE, MOCK_DISK_SIZE, NEXT_PC_REG, NUM_TOTAL_REGS, PAGE_SIZE, PC_REG,
    PHYS_PAGES_PER_THREAD, PREV_PC_REG, TLB_SIZE, VIRTUAL_MEMORY_PER_THREAD,
};
use std::ops::Range;

/// One virtual-to-physical page mapping. `physical_page` is a frame index
/// within the owning process's window, not a machine-wide frame number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TranslationEntry {
    pub virtual_page: u32,
    pub physical_page: u32,
    pub valid: bool,
    pub use_bit: bool,
    pub dirty: bool,
    pub read_only: bool,
}

/// The simulated machine: register file, software-managed TLB, physical
/// memory, and the flat mock disk used as paging backing store.
///
/// `page_table`, `memory_offset`, `disk_offset` and `next_victim` are the
/// running process's published state; the kernel swaps them on context
/// switch. Translation consults the TLB only: a miss is a page fault even
/// when the page table holds a valid mapping.
pub struct Machine {
    pub registers: [i32; NUM_TOTAL_REGS],
    pub tlb: [TranslationEntry; TLB_SIZE],
    pub page_table: Vec<TranslationEntry>,
    pub memory_offset: usize,
    pub disk_offset: usize,
    pub main_memory: Vec<u8>,
    pub mock_disk: Vec<u8>,
    pub used_memory: usize,
    pub used_mock_disk: usize,
    /// FIFO hand for frame eviction, owned by the running process.
    pub next_victim: usize,
    tlb_victim: usize,
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine {
    pub fn new() -> Self {
        Self {
            registers: [0; NUM_TOTAL_REGS],
            tlb: [TranslationEntry::default(); TLB_SIZE],
            page_table: Vec::new(),
            memory_offset: 0,
            disk_offset: 0,
            main_memory: vec![0; MEMORY_SIZE],
            mock_disk: vec![0; MOCK_DISK_SIZE],
            used_memory: 0,
            used_mock_disk: 0,
            next_victim: 0,
            tlb_victim: 0,
        }
    }

    pub fn read_reg(&self, reg: usize) -> i32 {
        self.registers[reg]
    }

    /// r0 is hard-wired zero; writes to it are dropped.
    pub fn write_reg(&mut self, reg: usize, value: i32) {
        if reg != 0 {
            self.registers[reg] = value;
        }
    }

    /// Step the PC pair past the instruction that just completed.
    pub fn advance_pc(&mut self) {
        self.registers[PREV_PC_REG] = self.registers[PC_REG];
        self.registers[PC_REG] = self.registers[NEXT_PC_REG];
        self.registers[NEXT_PC_REG] += 4;
    }

    /// Reserve a physical-frame window and a backing-store window for a new
    /// address space. Windows are bump-allocated and never reclaimed.
    pub fn alloc_windows(&mut self) -> Result<(usize, usize), MachineError> {
        let phys_bytes = PHYS_PAGES_PER_THREAD * PAGE_SIZE;
        if self.used_memory + phys_bytes > self.main_memory.len() {
            return Err(MachineError::OutOfMemoryWindows);
        }
        if self.used_mock_disk + VIRTUAL_MEMORY_PER_THREAD > self.mock_disk.len() {
            return Err(MachineError::OutOfBackingStore);
        }
        let memory_offset = self.used_memory;
        let disk_offset = self.used_mock_disk;
        self.used_memory += phys_bytes;
        self.used_mock_disk += VIRTUAL_MEMORY_PER_THREAD;
        Ok((memory_offset, disk_offset))
    }

    /// Byte range of frame `frame` inside the running process's window.
    pub fn frame_range(&self, frame: usize) -> Range<usize> {
        let start = self.memory_offset + frame * PAGE_SIZE;
        start..start + PAGE_SIZE
    }

    /// Byte range of virtual page `vpn` in the running process's backing
    /// store.
    pub fn backing_range(&self, vpn: usize) -> Range<usize> {
        let start = self.disk_offset + vpn * PAGE_SIZE;
        start..start + PAGE_SIZE
    }

    fn translate(&mut self, vaddr: u32, size: usize, writing: bool) -> Result<usize, MachineFault> {
        match size {
            1 => {}
            2 if vaddr % 2 == 0 => {}
            4 if vaddr % 4 == 0 => {}
            _ => return Err(MachineFault::AddressError { vaddr }),
        }

        let vpn = vaddr as usize / PAGE_SIZE;
        let offset = vaddr as usize % PAGE_SIZE;

        let slot = self
            .tlb
            .iter()
            .position(|e| e.valid && e.virtual_page as usize == vpn)
            .ok_or(MachineFault::PageFault { vaddr })?;

        if writing && self.tlb[slot].read_only {
            return Err(MachineFault::ReadOnly { vaddr });
        }
        self.tlb[slot].use_bit = true;
        if writing {
            self.tlb[slot].dirty = true;
        }

        let frame = self.tlb[slot].physical_page as usize;
        let paddr = self.memory_offset + frame * PAGE_SIZE + offset;
        if frame >= PHYS_PAGES_PER_THREAD || paddr + size > self.main_memory.len() {
            return Err(MachineFault::BusError {
                paddr: paddr as u32,
            });
        }
        Ok(paddr)
    }

    /// Read `size` bytes (1, 2, or 4) at a user virtual address. The raw
    /// value is zero-extended; sign extension is the CPU's business. A fault
    /// latches the address in `BAD_VADDR_REG` so the kernel can service it
    /// and the caller retry.
    pub fn read_mem(&mut self, vaddr: u32, size: usize) -> Result<u32, MachineFault> {
        let paddr = self.translate(vaddr, size, false).inspect_err(|_| {
            self.registers[BAD_VADDR_REG] = vaddr as i32;
        })?;
        let bytes = &self.main_memory[paddr..paddr + size];
        let mut value = 0u32;
        for (i, &b) in bytes.iter().enumerate() {
            value |= (b as u32) << (8 * i);
        }
        Ok(value)
    }

    /// Write `size` bytes (1, 2, or 4) at a user virtual address.
    pub fn write_mem(&mut self, vaddr: u32, size: usize, value: u32) -> Result<(), MachineFault> {
        let paddr = self.translate(vaddr, size, true).inspect_err(|_| {
            self.registers[BAD_VADDR_REG] = vaddr as i32;
        })?;
        for i in 0..size {
            self.main_memory[paddr + i] = (value >> (8 * i)) as u8;
        }
        Ok(())
    }

    /// Install a translation, preferring an invalid slot and otherwise
    /// evicting round-robin. An evicted live entry is folded back into the
    /// page table first so its use/dirty bits survive.
    pub fn prime_tlb(&mut self, entry: TranslationEntry) {
        let slot = match self.tlb.iter().position(|e| !e.valid) {
            Some(free) => free,
            None => {
                let victim = self.tlb_victim;
                self.tlb_victim = (self.tlb_victim + 1) % TLB_SIZE;
                let old = self.tlb[victim];
                self.page_table[old.physical_page as usize] = old;
                victim
            }
        };
        self.tlb[slot] = entry;
    }

    /// Fold every valid TLB entry back into the page table and invalidate
    /// it. Called when the owning process is switched out.
    pub fn flush_tlb(&mut self) {
        for i in 0..TLB_SIZE {
            if self.tlb[i].valid {
                self.page_table[self.tlb[i].physical_page as usize] = self.tlb[i];
                self.tlb[i].valid = false;
            }
        }
    }

    /// Fold valid TLB entries into the page table without invalidating them.
    /// Used when the page table must be observed up to date mid-run (fork,
    /// eviction of a possibly-cached victim).
    pub fn sync_tlb(&mut self) {
        for i in 0..TLB_SIZE {
            if self.tlb[i].valid {
                self.page_table[self.tlb[i].physical_page as usize] = self.tlb[i];
            }
        }
    }

    /// Drop any TLB entry mapping `vpn` without folding it back. Used after
    /// the underlying frame has been repurposed.
    pub fn invalidate_tlb_entry(&mut self, vpn: usize) {
        for e in &mut self.tlb {
            if e.valid && e.virtual_page as usize == vpn {
                e.valid = false;
            }
        }
    }
}
