//! Process-lifecycle scenarios: programs run on the simulated CPU, enter
//! the kernel through the syscall path, and drive the file system, the
//! console, and fork/exec/join.

mod common;

use common::{addiu, addu, boot, build_noff, install, SYSCALL};
use nimbus_kernel::syscall::{
    SC_CLOSE, SC_CREATE, SC_EXEC, SC_EXIT, SC_FORK, SC_HALT, SC_JOIN, SC_OPEN, SC_READ, SC_WRITE,
    SC_YIELD,
};

#[test]
fn halt_stops_the_machine() {
    let image = build_noff(
        &[
            addiu(8, 0, 5),
            addiu(9, 0, 7),
            addu(10, 8, 9),
            addiu(2, 0, SC_HALT),
            SYSCALL,
        ],
        &[],
        0x100,
    );
    let (mut machine, mut kernel) = boot(&image);
    machine.run(&mut kernel).expect("clean halt");
    assert_eq!(machine.read_reg(10), 12);
}

#[test]
fn console_write_reaches_the_console() {
    let image = build_noff(
        &[
            addiu(2, 0, SC_WRITE),
            addiu(4, 0, 0x100), // buffer
            addiu(5, 0, 3),     // size
            addiu(6, 0, 1),     // stdout
            SYSCALL,
            addiu(2, 0, SC_HALT),
            SYSCALL,
        ],
        b"Hi\n",
        0x100,
    );
    let (mut machine, mut kernel) = boot(&image);
    machine.run(&mut kernel).expect("clean halt");
    assert_eq!(kernel.console.take_output(), b"Hi\n");
}

#[test]
fn file_io_through_syscalls() {
    // create("/f"); fd = open("/f"); write(fd, "hello"); close(fd); halt.
    let image = build_noff(
        &[
            addiu(2, 0, SC_CREATE),
            addiu(4, 0, 0x100),
            SYSCALL,
            addiu(2, 0, SC_OPEN),
            addiu(4, 0, 0x100),
            SYSCALL,
            addu(16, 2, 0), // save fd
            addiu(2, 0, SC_WRITE),
            addiu(4, 0, 0x108),
            addiu(5, 0, 5),
            addu(6, 16, 0),
            SYSCALL,
            addiu(2, 0, SC_CLOSE),
            addu(4, 16, 0),
            SYSCALL,
            addiu(2, 0, SC_HALT),
            SYSCALL,
        ],
        b"/f\0\0\0\0\0\0hello",
        0x100,
    );
    let (mut machine, mut kernel) = boot(&image);
    machine.run(&mut kernel).expect("clean halt");
    // fd 2 is the first slot past the console pair.
    assert_eq!(machine.read_reg(16), 2);
    assert_eq!(kernel.fs.cat("/f").unwrap(), b"hello");
}

#[test]
fn file_read_copies_into_user_memory() {
    // fd = open("/in"); read(fd, buf, 6); write(stdout, buf, 6); halt.
    let image = build_noff(
        &[
            addiu(2, 0, SC_OPEN),
            addiu(4, 0, 0x100),
            SYSCALL,
            addu(16, 2, 0),
            addiu(2, 0, SC_READ),
            addiu(4, 0, 0x200),
            addiu(5, 0, 6),
            addu(6, 16, 0),
            SYSCALL,
            addu(17, 2, 0), // bytes read
            addiu(2, 0, SC_WRITE),
            addiu(4, 0, 0x200),
            addiu(5, 0, 6),
            addiu(6, 0, 1),
            SYSCALL,
            addiu(2, 0, SC_HALT),
            SYSCALL,
        ],
        b"/in\0",
        0x100,
    );
    let (mut machine, mut kernel) = boot(&image);
    install(&mut kernel, "/in", b"sector");
    machine.run(&mut kernel).expect("clean halt");
    assert_eq!(machine.read_reg(17), 6);
    assert_eq!(kernel.console.take_output(), b"sector");
}

#[test]
fn fork_then_join_observes_the_exit_status() {
    const CHILD: i32 = 60; // byte offset of the child's first instruction
    let image = build_noff(
        &[
            /* 0  */ addiu(2, 0, SC_FORK),
            /* 4  */ addiu(4, 0, CHILD),
            /* 8  */ SYSCALL,
            /* 12 */ addu(16, 2, 0), // child tid
            /* 16 */ addiu(2, 0, SC_WRITE),
            /* 20 */ addiu(4, 0, 0x100), // "P"
            /* 24 */ addiu(5, 0, 1),
            /* 28 */ addiu(6, 0, 1),
            /* 32 */ SYSCALL,
            /* 36 */ addiu(2, 0, SC_JOIN),
            /* 40 */ addu(4, 16, 0),
            /* 44 */ SYSCALL,
            /* 48 */ addu(17, 2, 0), // child's exit status
            /* 52 */ addiu(2, 0, SC_HALT),
            /* 56 */ SYSCALL,
            // child:
            /* 60 */ addiu(2, 0, SC_WRITE),
            /* 64 */ addiu(4, 0, 0x101), // "C"
            /* 68 */ addiu(5, 0, 1),
            /* 72 */ addiu(6, 0, 1),
            /* 76 */ SYSCALL,
            /* 80 */ addiu(2, 0, SC_EXIT),
            /* 84 */ addiu(4, 0, 42),
            /* 88 */ SYSCALL,
        ],
        b"PC",
        0x100,
    );
    let (mut machine, mut kernel) = boot(&image);
    machine.run(&mut kernel).expect("clean halt");

    // Parent wrote before blocking in join, child wrote before exiting, and
    // join returned the child's status.
    assert_eq!(kernel.console.take_output(), b"PC");
    assert_eq!(machine.read_reg(17), 42);
    // The child tid the parent saw is a real id, not 0.
    assert!(machine.read_reg(16) > 0);
}

#[test]
fn yield_round_robins_between_forked_threads() {
    const CHILD: i32 = 48;
    let image = build_noff(
        &[
            /* 0  */ addiu(2, 0, SC_FORK),
            /* 4  */ addiu(4, 0, CHILD),
            /* 8  */ SYSCALL,
            /* 12 */ addiu(2, 0, SC_WRITE), // "A"
            /* 16 */ addiu(4, 0, 0x100),
            /* 20 */ addiu(5, 0, 1),
            /* 24 */ addiu(6, 0, 1),
            /* 28 */ SYSCALL,
            /* 32 */ addiu(2, 0, SC_YIELD),
            /* 36 */ SYSCALL,
            /* 40 */ addiu(2, 0, SC_WRITE), // second "A": r4-r6 survived the switch
            /* 44 */ SYSCALL,
            // The parent falls through into the child body and exits there.
            /* 48 */ addiu(2, 0, SC_WRITE), // child: "B"
            /* 52 */ addiu(4, 0, 0x101),
            /* 56 */ addiu(5, 0, 1),
            /* 60 */ addiu(6, 0, 1),
            /* 64 */ SYSCALL,
            /* 68 */ addiu(2, 0, SC_YIELD),
            /* 72 */ SYSCALL,
            /* 76 */ addiu(2, 0, SC_EXIT),
            /* 80 */ addiu(4, 0, 0),
            /* 84 */ SYSCALL,
        ],
        b"AB",
        0x100,
    );
    let (mut machine, mut kernel) = boot(&image);
    machine.run(&mut kernel).expect("clean halt");
    // Parent: A, yield; child: B, yield; parent: A, then falls into the
    // child body at 48 and writes B before exiting: "ABAB". The register
    // file (r4-r6 across the parent's yield) survived both switches.
    assert_eq!(kernel.console.take_output(), b"ABAB");
}

#[test]
fn exec_spawns_a_program_from_the_file_system() {
    let child_image = build_noff(
        &[
            addiu(2, 0, SC_WRITE),
            addiu(4, 0, 0x100),
            addiu(5, 0, 1),
            addiu(6, 0, 1),
            SYSCALL,
            addiu(2, 0, SC_EXIT),
            addiu(4, 0, 7),
            SYSCALL,
        ],
        b"X",
        0x100,
    );
    let image = build_noff(
        &[
            addiu(2, 0, SC_EXEC),
            addiu(4, 0, 0x100), // "/child"
            SYSCALL,
            addu(16, 2, 0),
            addiu(2, 0, SC_JOIN),
            addu(4, 16, 0),
            SYSCALL,
            addu(17, 2, 0),
            addiu(2, 0, SC_HALT),
            SYSCALL,
        ],
        b"/child\0",
        0x100,
    );
    let (mut machine, mut kernel) = boot(&image);
    install(&mut kernel, "/child", &child_image);
    machine.run(&mut kernel).expect("clean halt");
    assert_eq!(kernel.console.take_output(), b"X");
    assert_eq!(machine.read_reg(17), 7);
}

#[test]
fn exec_of_a_missing_program_returns_minus_one() {
    let image = build_noff(
        &[
            addiu(2, 0, SC_EXEC),
            addiu(4, 0, 0x100),
            SYSCALL,
            addu(16, 2, 0),
            addiu(2, 0, SC_HALT),
            SYSCALL,
        ],
        b"/nope\0",
        0x100,
    );
    let (mut machine, mut kernel) = boot(&image);
    machine.run(&mut kernel).expect("clean halt");
    assert_eq!(machine.read_reg(16), -1);
}

#[test]
fn join_of_a_stranger_returns_minus_one() {
    let image = build_noff(
        &[
            addiu(2, 0, SC_JOIN),
            addiu(4, 0, 1234),
            SYSCALL,
            addu(16, 2, 0),
            addiu(2, 0, SC_HALT),
            SYSCALL,
        ],
        &[],
        0x100,
    );
    let (mut machine, mut kernel) = boot(&image);
    machine.run(&mut kernel).expect("clean halt");
    assert_eq!(machine.read_reg(16), -1);
}

#[test]
fn exit_of_the_last_thread_halts_the_machine() {
    let image = build_noff(
        &[addiu(2, 0, SC_EXIT), addiu(4, 0, 3), SYSCALL],
        &[],
        0x100,
    );
    let (mut machine, mut kernel) = boot(&image);
    machine.run(&mut kernel).expect("exit halts cleanly");
}

#[test]
fn open_of_a_missing_file_returns_minus_one() {
    let image = build_noff(
        &[
            addiu(2, 0, SC_OPEN),
            addiu(4, 0, 0x100),
            SYSCALL,
            addu(16, 2, 0),
            addiu(2, 0, SC_HALT),
            SYSCALL,
        ],
        b"/absent\0",
        0x100,
    );
    let (mut machine, mut kernel) = boot(&image);
    machine.run(&mut kernel).expect("clean halt");
    assert_eq!(machine.read_reg(16), -1);
}
