//! Page-fault service and the user-boundary copy loops built on it.

use crate::error::KernelError;
use log::trace;
use nimbus_vm::{
    Machine, MachineFault, TranslationEntry, BAD_VADDR_REG, PAGE_SIZE, PHYS_PAGES_PER_THREAD,
    VIRTUAL_PAGES_PER_THREAD,
};

/// Bring the faulting page into a frame of the running process.
///
/// A page that is resident but missing from the TLB just gets its entry
/// re-primed. Otherwise a frame is chosen (any invalid one first, then FIFO
/// among the process's frames), the victim is written back to the backing
/// store if dirty, and the faulting page is loaded in its place.
pub fn service_page_fault(machine: &mut Machine) -> Result<(), KernelError> {
    let bad_vaddr = machine.registers[BAD_VADDR_REG] as u32;
    let vpn = bad_vaddr as usize / PAGE_SIZE;
    if vpn >= VIRTUAL_PAGES_PER_THREAD {
        return Err(KernelError::BadVirtualAddress(bad_vaddr));
    }

    if let Some(frame) = machine
        .page_table
        .iter()
        .position(|e| e.valid && e.virtual_page as usize == vpn)
    {
        trace!("page fault at {bad_vaddr:#x}: vpn {vpn} resident in frame {frame}");
        let entry = machine.page_table[frame];
        machine.prime_tlb(entry);
        return Ok(());
    }

    let frame = match machine.page_table.iter().position(|e| !e.valid) {
        Some(free) => free,
        None => {
            let victim = machine.next_victim;
            machine.next_victim = (victim + 1) % PHYS_PAGES_PER_THREAD;
            victim
        }
    };

    if machine.page_table[frame].valid {
        // The victim's freshest use/dirty bits may be cached in the TLB.
        machine.sync_tlb();
        let victim = machine.page_table[frame];
        machine.invalidate_tlb_entry(victim.virtual_page as usize);
        if victim.dirty {
            trace!(
                "evicting dirty vpn {} from frame {frame}",
                victim.virtual_page
            );
            let bytes = machine.main_memory[machine.frame_range(frame)].to_vec();
            let at = machine.backing_range(victim.virtual_page as usize);
            machine.mock_disk[at].copy_from_slice(&bytes);
        }
    }

    let bytes = machine.mock_disk[machine.backing_range(vpn)].to_vec();
    let frame_at = machine.frame_range(frame);
    machine.main_memory[frame_at].copy_from_slice(&bytes);

    let entry = TranslationEntry {
        virtual_page: vpn as u32,
        physical_page: frame as u32,
        valid: true,
        use_bit: true,
        dirty: false,
        read_only: false,
    };
    machine.page_table[frame] = entry;
    machine.prime_tlb(entry);
    trace!("page fault at {bad_vaddr:#x}: loaded vpn {vpn} into frame {frame}");
    Ok(())
}

/// Read one byte of user memory, servicing page faults until the access
/// goes through.
pub fn read_user_byte(machine: &mut Machine, addr: u32) -> Result<u8, KernelError> {
    loop {
        match machine.read_mem(addr, 1) {
            Ok(v) => return Ok(v as u8),
            Err(MachineFault::PageFault { .. }) => service_page_fault(machine)?,
            Err(fault) => return Err(KernelError::UserAccess(fault)),
        }
    }
}

/// Write one byte of user memory, servicing page faults until the access
/// goes through.
pub fn write_user_byte(machine: &mut Machine, addr: u32, value: u8) -> Result<(), KernelError> {
    loop {
        match machine.write_mem(addr, 1, value as u32) {
            Ok(()) => return Ok(()),
            Err(MachineFault::PageFault { .. }) => service_page_fault(machine)?,
            Err(fault) => return Err(KernelError::UserAccess(fault)),
        }
    }
}

/// Copy a null-terminated string out of user memory.
pub fn read_user_string(machine: &mut Machine, mut addr: u32) -> Result<String, KernelError> {
    let mut bytes = Vec::new();
    loop {
        let b = read_user_byte(machine, addr)?;
        if b == 0 {
            break;
        }
        bytes.push(b);
        addr += 1;
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Copy a buffer out of user memory, byte by byte.
pub fn copy_from_user(machine: &mut Machine, addr: u32, len: usize) -> Result<Vec<u8>, KernelError> {
    let mut bytes = Vec::with_capacity(len);
    for i in 0..len {
        bytes.push(read_user_byte(machine, addr + i as u32)?);
    }
    Ok(bytes)
}

/// Copy a buffer into user memory, byte by byte.
pub fn copy_to_user(machine: &mut Machine, addr: u32, bytes: &[u8]) -> Result<(), KernelError> {
    for (i, &b) in bytes.iter().enumerate() {
        write_user_byte(machine, addr + i as u32, b)?;
    }
    Ok(())
}
