//! Instruction fetch/execute loop.
//!
//! The PC pair models MIPS delayed branches: `PC_REG` is the instruction to
//! execute, `NEXT_PC_REG` the one after it. Branches and jumps only replace
//! `NEXT_PC_REG`, so the instruction in the delay slot always runs. An
//! instruction that faults is not retired: the kernel services the fault and
//! the same PC is fetched again.

use crate::error::{MachineError, MachineFault};
use crate::instruction::Instruction;
use crate::machine::Machine;
use crate::trap::{ExceptionType, Flow, TrapHandler};
use crate::{HI_REG, LO_REG, NEXT_PC_REG, PC_REG, PREV_PC_REG, RET_ADDR_REG};
use log::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    Exception(ExceptionType),
}

fn fault_outcome(fault: MachineFault) -> StepOutcome {
    StepOutcome::Exception(fault.exception())
}

impl Machine {
    /// Execute one instruction, or report the exception it raised. On an
    /// exception the PC pair is left untouched so the instruction retries
    /// after the kernel has serviced the cause.
    pub fn step(&mut self) -> StepOutcome {
        let pc = self.registers[PC_REG] as u32;
        let word = match self.read_mem(pc, 4) {
            Ok(w) => w,
            Err(f) => return fault_outcome(f),
        };
        let instr = match Instruction::decode(word) {
            Ok(i) => i,
            Err(_) => return StepOutcome::Exception(ExceptionType::IllegalInstruction),
        };
        trace!("pc={pc:#x} {instr:?}");

        let delay_slot = self.registers[NEXT_PC_REG] as u32;
        // Where NEXT_PC goes after retirement; branches overwrite this.
        let mut next_target = delay_slot.wrapping_add(4);
        let branch_dest = |offset: i32| delay_slot.wrapping_add((offset as u32) << 2);
        let jump_dest = |target: u32| (delay_slot & 0xf000_0000) | (target << 2);

        match instr {
            Instruction::Addi { rs, rt, imm } => {
                match self.read_reg(rs).checked_add(imm) {
                    Some(v) => self.write_reg(rt, v),
                    None => return StepOutcome::Exception(ExceptionType::Overflow),
                }
            }
            Instruction::Addiu { rs, rt, imm } => {
                self.write_reg(rt, self.read_reg(rs).wrapping_add(imm));
            }
            Instruction::Slti { rs, rt, imm } => {
                self.write_reg(rt, (self.read_reg(rs) < imm) as i32);
            }
            Instruction::Sltiu { rs, rt, imm } => {
                self.write_reg(rt, ((self.read_reg(rs) as u32) < imm as u32) as i32);
            }
            Instruction::Andi { rs, rt, imm } => {
                self.write_reg(rt, (self.read_reg(rs) as u32 & imm) as i32);
            }
            Instruction::Ori { rs, rt, imm } => {
                self.write_reg(rt, (self.read_reg(rs) as u32 | imm) as i32);
            }
            Instruction::Xori { rs, rt, imm } => {
                self.write_reg(rt, (self.read_reg(rs) as u32 ^ imm) as i32);
            }
            Instruction::Lui { rt, imm } => {
                self.write_reg(rt, (imm << 16) as i32);
            }

            Instruction::Add { rs, rt, rd } => {
                match self.read_reg(rs).checked_add(self.read_reg(rt)) {
                    Some(v) => self.write_reg(rd, v),
                    None => return StepOutcome::Exception(ExceptionType::Overflow),
                }
            }
            Instruction::Addu { rs, rt, rd } => {
                self.write_reg(rd, self.read_reg(rs).wrapping_add(self.read_reg(rt)));
            }
            Instruction::Sub { rs, rt, rd } => {
                match self.read_reg(rs).checked_sub(self.read_reg(rt)) {
                    Some(v) => self.write_reg(rd, v),
                    None => return StepOutcome::Exception(ExceptionType::Overflow),
                }
            }
            Instruction::Subu { rs, rt, rd } => {
                self.write_reg(rd, self.read_reg(rs).wrapping_sub(self.read_reg(rt)));
            }
            Instruction::And { rs, rt, rd } => {
                self.write_reg(rd, self.read_reg(rs) & self.read_reg(rt));
            }
            Instruction::Or { rs, rt, rd } => {
                self.write_reg(rd, self.read_reg(rs) | self.read_reg(rt));
            }
            Instruction::Xor { rs, rt, rd } => {
                self.write_reg(rd, self.read_reg(rs) ^ self.read_reg(rt));
            }
            Instruction::Nor { rs, rt, rd } => {
                self.write_reg(rd, !(self.read_reg(rs) | self.read_reg(rt)));
            }
            Instruction::Slt { rs, rt, rd } => {
                self.write_reg(rd, (self.read_reg(rs) < self.read_reg(rt)) as i32);
            }
            Instruction::Sltu { rs, rt, rd } => {
                self.write_reg(
                    rd,
                    ((self.read_reg(rs) as u32) < self.read_reg(rt) as u32) as i32,
                );
            }
            Instruction::Sll { rt, rd, shamt } => {
                self.write_reg(rd, ((self.read_reg(rt) as u32) << shamt) as i32);
            }
            Instruction::Srl { rt, rd, shamt } => {
                self.write_reg(rd, ((self.read_reg(rt) as u32) >> shamt) as i32);
            }
            Instruction::Sra { rt, rd, shamt } => {
                self.write_reg(rd, self.read_reg(rt) >> shamt);
            }
            Instruction::Sllv { rs, rt, rd } => {
                let sh = self.read_reg(rs) as u32 & 0x1f;
                self.write_reg(rd, ((self.read_reg(rt) as u32) << sh) as i32);
            }
            Instruction::Srlv { rs, rt, rd } => {
                let sh = self.read_reg(rs) as u32 & 0x1f;
                self.write_reg(rd, ((self.read_reg(rt) as u32) >> sh) as i32);
            }
            Instruction::Srav { rs, rt, rd } => {
                let sh = self.read_reg(rs) as u32 & 0x1f;
                self.write_reg(rd, self.read_reg(rt) >> sh);
            }
            Instruction::Mult { rs, rt } => {
                let product = self.read_reg(rs) as i64 * self.read_reg(rt) as i64;
                self.registers[HI_REG] = (product >> 32) as i32;
                self.registers[LO_REG] = product as i32;
            }
            Instruction::Multu { rs, rt } => {
                let product =
                    (self.read_reg(rs) as u32 as u64) * (self.read_reg(rt) as u32 as u64);
                self.registers[HI_REG] = (product >> 32) as i32;
                self.registers[LO_REG] = product as i32;
            }
            Instruction::Div { rs, rt } => {
                let (a, b) = (self.read_reg(rs), self.read_reg(rt));
                if b != 0 {
                    self.registers[LO_REG] = a.wrapping_div(b);
                    self.registers[HI_REG] = a.wrapping_rem(b);
                }
            }
            Instruction::Divu { rs, rt } => {
                let (a, b) = (self.read_reg(rs) as u32, self.read_reg(rt) as u32);
                if b != 0 {
                    self.registers[LO_REG] = (a / b) as i32;
                    self.registers[HI_REG] = (a % b) as i32;
                }
            }
            Instruction::Mfhi { rd } => self.write_reg(rd, self.registers[HI_REG]),
            Instruction::Mflo { rd } => self.write_reg(rd, self.registers[LO_REG]),

            Instruction::Lb { base, rt, offset } => {
                let addr = (self.read_reg(base) as u32).wrapping_add(offset as u32);
                match self.read_mem(addr, 1) {
                    Ok(v) => self.write_reg(rt, v as u8 as i8 as i32),
                    Err(f) => return fault_outcome(f),
                }
            }
            Instruction::Lbu { base, rt, offset } => {
                let addr = (self.read_reg(base) as u32).wrapping_add(offset as u32);
                match self.read_mem(addr, 1) {
                    Ok(v) => self.write_reg(rt, v as i32),
                    Err(f) => return fault_outcome(f),
                }
            }
            Instruction::Lh { base, rt, offset } => {
                let addr = (self.read_reg(base) as u32).wrapping_add(offset as u32);
                match self.read_mem(addr, 2) {
                    Ok(v) => self.write_reg(rt, v as u16 as i16 as i32),
                    Err(f) => return fault_outcome(f),
                }
            }
            Instruction::Lhu { base, rt, offset } => {
                let addr = (self.read_reg(base) as u32).wrapping_add(offset as u32);
                match self.read_mem(addr, 2) {
                    Ok(v) => self.write_reg(rt, v as i32),
                    Err(f) => return fault_outcome(f),
                }
            }
            Instruction::Lw { base, rt, offset } => {
                let addr = (self.read_reg(base) as u32).wrapping_add(offset as u32);
                match self.read_mem(addr, 4) {
                    Ok(v) => self.write_reg(rt, v as i32),
                    Err(f) => return fault_outcome(f),
                }
            }
            Instruction::Sb { base, rt, offset } => {
                let addr = (self.read_reg(base) as u32).wrapping_add(offset as u32);
                if let Err(f) = self.write_mem(addr, 1, self.read_reg(rt) as u32) {
                    return fault_outcome(f);
                }
            }
            Instruction::Sh { base, rt, offset } => {
                let addr = (self.read_reg(base) as u32).wrapping_add(offset as u32);
                if let Err(f) = self.write_mem(addr, 2, self.read_reg(rt) as u32) {
                    return fault_outcome(f);
                }
            }
            Instruction::Sw { base, rt, offset } => {
                let addr = (self.read_reg(base) as u32).wrapping_add(offset as u32);
                if let Err(f) = self.write_mem(addr, 4, self.read_reg(rt) as u32) {
                    return fault_outcome(f);
                }
            }

            Instruction::Beq { rs, rt, offset } => {
                if self.read_reg(rs) == self.read_reg(rt) {
                    next_target = branch_dest(offset);
                }
            }
            Instruction::Bne { rs, rt, offset } => {
                if self.read_reg(rs) != self.read_reg(rt) {
                    next_target = branch_dest(offset);
                }
            }
            Instruction::Blez { rs, offset } => {
                if self.read_reg(rs) <= 0 {
                    next_target = branch_dest(offset);
                }
            }
            Instruction::Bgtz { rs, offset } => {
                if self.read_reg(rs) > 0 {
                    next_target = branch_dest(offset);
                }
            }
            Instruction::Bltz { rs, offset } => {
                if self.read_reg(rs) < 0 {
                    next_target = branch_dest(offset);
                }
            }
            Instruction::Bgez { rs, offset } => {
                if self.read_reg(rs) >= 0 {
                    next_target = branch_dest(offset);
                }
            }

            Instruction::J { target } => next_target = jump_dest(target),
            Instruction::Jal { target } => {
                self.write_reg(RET_ADDR_REG, pc.wrapping_add(8) as i32);
                next_target = jump_dest(target);
            }
            Instruction::Jr { rs } => next_target = self.read_reg(rs) as u32,
            Instruction::Jalr { rs, rd } => {
                let dest = self.read_reg(rs) as u32;
                self.write_reg(rd, pc.wrapping_add(8) as i32);
                next_target = dest;
            }

            // The kernel decodes the call and advances the PC itself.
            Instruction::Syscall => return StepOutcome::Exception(ExceptionType::Syscall),
        }

        self.registers[PREV_PC_REG] = pc as i32;
        self.registers[PC_REG] = delay_slot as i32;
        self.registers[NEXT_PC_REG] = next_target as i32;
        StepOutcome::Continue
    }

    /// Run until the handler halts the machine or reports a fatal error.
    pub fn run(&mut self, handler: &mut dyn TrapHandler) -> Result<(), MachineError> {
        loop {
            match self.step() {
                StepOutcome::Continue => {}
                StepOutcome::Exception(which) => match handler.handle_exception(which, self)? {
                    Flow::Continue => {}
                    Flow::Halt => return Ok(()),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::TranslationEntry;
    use crate::trap::TrapError;
    use crate::{NEXT_PC_REG, PAGE_SIZE, PC_REG, PHYS_PAGES_PER_THREAD, RET_VAL_REG};

    /// Halts on the first syscall, recording r2.
    struct HaltOnSyscall {
        seen: Option<i32>,
    }

    impl TrapHandler for HaltOnSyscall {
        fn handle_exception(
            &mut self,
            which: ExceptionType,
            machine: &mut Machine,
        ) -> Result<Flow, TrapError> {
            match which {
                ExceptionType::Syscall => {
                    self.seen = Some(machine.read_reg(RET_VAL_REG));
                    Ok(Flow::Halt)
                }
                other => Err(TrapError::Unhandled(other)),
            }
        }
    }

    fn machine_with_program(words: &[u32]) -> Machine {
        let mut m = Machine::new();
        let (mem, disk) = m.alloc_windows().unwrap();
        m.memory_offset = mem;
        m.disk_offset = disk;
        m.page_table = vec![TranslationEntry::default(); PHYS_PAGES_PER_THREAD];
        // Identity-map the first pages so fetch never faults in these tests,
        // leaving one TLB slot free for the fault-service test.
        for vpn in 0..TLB_SIZE - 1 {
            m.prime_tlb(TranslationEntry {
                virtual_page: vpn as u32,
                physical_page: vpn as u32,
                valid: true,
                ..Default::default()
            });
        }
        for (i, &w) in words.iter().enumerate() {
            m.write_mem((i * 4) as u32, 4, w).unwrap();
        }
        m.registers[PC_REG] = 0;
        m.registers[NEXT_PC_REG] = 4;
        m
    }

    use crate::TLB_SIZE;

    #[test]
    fn straight_line_arithmetic_retires_in_order() {
        // addiu $2,$0,5 ; addiu $3,$0,7 ; addu $4,$2,$3 ; syscall
        let mut m = machine_with_program(&[0x2402_0005, 0x2403_0007, 0x0043_2021, 0x0000_000c]);
        let mut handler = HaltOnSyscall { seen: None };
        m.run(&mut handler).unwrap();
        assert_eq!(m.read_reg(4), 12);
        assert_eq!(handler.seen, Some(5));
        // PC still names the syscall instruction; the kernel advances it.
        assert_eq!(m.registers[PC_REG], 12);
    }

    #[test]
    fn branch_executes_its_delay_slot() {
        // beq $0,$0,+2 ; addiu $2,$0,1 (delay slot) ; addiu $2,$2,100 (skipped)
        // target: syscall
        let mut m = machine_with_program(&[0x1000_0002, 0x2402_0001, 0x2442_0064, 0x0000_000c]);
        let mut handler = HaltOnSyscall { seen: None };
        m.run(&mut handler).unwrap();
        assert_eq!(handler.seen, Some(1));
    }

    #[test]
    fn signed_overflow_raises_without_retiring() {
        // lui $2,0x7fff ; ori $2,$2,0xffff ; addi $2,$2,1
        let mut m = machine_with_program(&[0x3c02_7fff, 0x3442_ffff, 0x2042_0001, 0x0000_000c]);
        assert_eq!(m.step(), StepOutcome::Continue);
        assert_eq!(m.step(), StepOutcome::Continue);
        assert_eq!(
            m.step(),
            StepOutcome::Exception(ExceptionType::Overflow)
        );
        assert_eq!(m.read_reg(2), i32::MAX);
        // Faulting instruction was not retired.
        assert_eq!(m.registers[PC_REG], 8);
    }

    #[test]
    fn load_faults_on_unmapped_page_and_retries_after_service() {
        let far = (PHYS_PAGES_PER_THREAD * PAGE_SIZE) as u32 + 0x100;
        // lui $8, far>>16 ; ori $8,$8,far&0xffff ; lw $2,0($8) ; syscall
        let hi = far >> 16;
        let lo = far & 0xffff;
        let mut m = machine_with_program(&[
            0x3c08_0000 | hi,
            0x3508_0000 | lo,
            0x8d02_0000,
            0x0000_000c,
        ]);
        assert_eq!(m.step(), StepOutcome::Continue);
        assert_eq!(m.step(), StepOutcome::Continue);
        assert_eq!(m.step(), StepOutcome::Exception(ExceptionType::PageFault));
        // Service: map the page, then the same instruction succeeds.
        m.prime_tlb(TranslationEntry {
            virtual_page: far / PAGE_SIZE as u32,
            physical_page: 6,
            valid: true,
            ..Default::default()
        });
        assert_eq!(m.step(), StepOutcome::Continue);
    }
}
