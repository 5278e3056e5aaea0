//! Support for the scenario tests: a hand assembler for the MIPS subset and
//! a bootstrapped kernel with a program installed in the file system.

// Each test binary uses a different slice of these helpers.
#![allow(dead_code)]

use nimbus_fs::FileKind;
use nimbus_kernel::console::Console;
use nimbus_kernel::memory::noff::{NoffHeader, Segment};
use nimbus_kernel::Kernel;
use nimbus_vm::{Disk, Machine};

pub const SYSCALL: u32 = 0x0000_000c;

pub fn addiu(rt: u32, rs: u32, imm: i32) -> u32 {
    (0x09 << 26) | (rs << 21) | (rt << 16) | (imm as u32 & 0xffff)
}

pub fn addu(rd: u32, rs: u32, rt: u32) -> u32 {
    (rs << 21) | (rt << 16) | (rd << 11) | 0x21
}

pub fn lw(rt: u32, base: u32, offset: i32) -> u32 {
    (0x23 << 26) | (base << 21) | (rt << 16) | (offset as u32 & 0xffff)
}

pub fn sw(rt: u32, base: u32, offset: i32) -> u32 {
    (0x2b << 26) | (base << 21) | (rt << 16) | (offset as u32 & 0xffff)
}

pub fn bne(rs: u32, rt: u32, offset: i32) -> u32 {
    (0x05 << 26) | (rs << 21) | (rt << 16) | (offset as u32 & 0xffff)
}

/// Build a NOFF image: code at virtual 0, optional data segment.
pub fn build_noff(code: &[u32], data: &[u8], data_vaddr: u32) -> Vec<u8> {
    let code_bytes: Vec<u8> = code.iter().flat_map(|w| w.to_le_bytes()).collect();
    let header = NoffHeader {
        code: Segment {
            virtual_addr: 0,
            in_file_addr: NoffHeader::SIZE as u32,
            size: code_bytes.len() as u32,
        },
        init_data: Segment {
            virtual_addr: data_vaddr,
            in_file_addr: (NoffHeader::SIZE + code_bytes.len()) as u32,
            size: data.len() as u32,
        },
        uninit_data: Segment::default(),
    };
    let mut image = header.encode().to_vec();
    image.extend_from_slice(&code_bytes);
    image.extend_from_slice(data);
    image
}

/// Format a disk, install `image` as /prog, and start it with a buffered
/// console.
pub fn boot(image: &[u8]) -> (Machine, Kernel) {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut kernel = Kernel::new(Disk::new(), true).expect("format succeeds");
    kernel.console = Console::buffered();
    install(&mut kernel, "/prog", image);

    let mut machine = Machine::new();
    kernel
        .start_initial(&mut machine, "/prog")
        .expect("program loads");
    (machine, kernel)
}

/// Copy a NOFF image into the file system under `path`.
pub fn install(kernel: &mut Kernel, path: &str, image: &[u8]) {
    kernel
        .fs
        .create(path, image.len() as u32, FileKind::Regular)
        .expect("create the executable");
    let mut file = kernel.fs.open(path).expect("open the executable");
    kernel
        .fs
        .write_at(&mut file, image, 0)
        .expect("write the executable");
    kernel.fs.close(file);
}
