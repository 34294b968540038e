//! Device syscalls and arbitration through the syscall surface: claims are
//! per-ASID, grants are exclusive, and releases invoke the driver hook.

mod common;

use aurora_os::constants::{DEV_BUZZER, DEV_LED, DEV_SEG, DEV_SWITCH};
use aurora_os::{sysno, SyscallOutcome};
use common::*;

/// Stage a claim vector on the caller's stack and issue the claim syscall.
fn claim_from_current(kernel: &mut aurora_os::Kernel, max: &[u32]) -> SyscallOutcome {
    let base = USTACKTOP - 512;
    for (i, &word) in max.iter().enumerate() {
        kernel.user_store_u32(base + (i as u32) * 4, word).unwrap();
    }
    kernel.syscall(sysno::SYS_CLAIM, [base, max.len() as u32, 0, 0])
}

#[test]
fn led_is_a_single_slot_resource() {
    let mut kernel = boot();
    kernel.install_program("p", trivial_program()).unwrap();
    let a = kernel.env_create("p", 1).unwrap();
    let _b = kernel.env_create("p", 1).unwrap();

    kernel.tick();
    assert_eq!(kernel.current_env(), Some(a));
    assert_eq!(claim_from_current(&mut kernel, &[1, 0]), SyscallOutcome::Ret(1));
    assert_eq!(
        kernel.syscall(sysno::SYS_REQUIRE, [DEV_LED, 1, 0, 0]),
        SyscallOutcome::Ret(1)
    );
    kernel.syscall(sysno::SYS_SET_LEDS, [0x00aa_aa55, 0, 0, 0]);
    assert_eq!(kernel.device_read(DEV_LED).unwrap(), 0x00aa_aa55);

    // The second env cannot even claim one unit while A holds it; the
    // request is over the remaining availability.
    kernel.syscall(sysno::SYS_YIELD, [0; 4]);
    assert_eq!(claim_from_current(&mut kernel, &[1, 0]), SyscallOutcome::Ret(1));
    assert_eq!(
        kernel.syscall(sysno::SYS_REQUIRE, [DEV_LED, 1, 0, 0]),
        SyscallOutcome::Ret(0)
    );

    // A releases and exits, which drops its claim; B's retry is granted.
    kernel.syscall(sysno::SYS_YIELD, [0; 4]);
    assert_eq!(
        kernel.syscall(sysno::SYS_RELEASE, [DEV_LED, 1, 0, 0]),
        SyscallOutcome::Ret(1)
    );
    assert_eq!(kernel.syscall(sysno::SYS_EXIT, [0; 4]), SyscallOutcome::Exited);
    assert_eq!(
        kernel.syscall(sysno::SYS_REQUIRE, [DEV_LED, 1, 0, 0]),
        SyscallOutcome::Ret(1)
    );
}

#[test]
fn seven_seg_digits_write_and_blank_on_release() {
    let mut kernel = boot();
    kernel.install_program("p", trivial_program()).unwrap();
    let env = kernel.env_create("p", 1).unwrap();
    kernel.tick();
    assert_eq!(kernel.current_env(), Some(env));

    assert_eq!(claim_from_current(&mut kernel, &[0, 4]), SyscallOutcome::Ret(1));
    assert_eq!(
        kernel.syscall(sysno::SYS_REQUIRE, [DEV_SEG, 4, 0, 0]),
        SyscallOutcome::Ret(1)
    );
    for digit in 0..4u32 {
        assert_eq!(
            kernel.syscall(sysno::SYS_WRITE_BY_NUM, [DEV_SEG, digit, 0xA, 0]),
            SyscallOutcome::Ret(1)
        );
    }
    assert_eq!(
        kernel.syscall(sysno::SYS_READ_BY_NUM, [DEV_SEG, 2, 0, 0]),
        SyscallOutcome::Ret(0xA)
    );
    // Out-of-range digit is refused without killing the caller.
    assert_eq!(
        kernel.syscall(sysno::SYS_WRITE_BY_NUM, [DEV_SEG, 9, 1, 0]),
        SyscallOutcome::Ret(0)
    );

    // Release blanks the display.
    assert_eq!(
        kernel.syscall(sysno::SYS_RELEASE, [DEV_SEG, 4, 0, 0]),
        SyscallOutcome::Ret(1)
    );
    assert_eq!(
        kernel.syscall(sysno::SYS_READ_BY_NUM, [DEV_SEG, 2, 0, 0]),
        SyscallOutcome::Ret(0)
    );
}

#[test]
fn register_only_devices_need_no_claim() {
    let mut kernel = boot();
    kernel.install_program("p", trivial_program()).unwrap();
    kernel.env_create("p", 1).unwrap();
    kernel.tick();

    kernel.syscall(sysno::SYS_SET_BUZZER, [0x0106, 0, 0, 0]);
    assert_eq!(kernel.device_read(DEV_BUZZER).unwrap(), 0x0106);

    kernel.device_write(DEV_SWITCH, 0b1011).unwrap();
    assert_eq!(
        kernel.syscall(sysno::SYS_GET_SWITCHES, [0; 4]),
        SyscallOutcome::Ret(0b1011)
    );

    // Requiring a zero-capacity device is denied, not fatal.
    assert_eq!(
        kernel.syscall(sysno::SYS_REQUIRE, [DEV_BUZZER, 1, 0, 0]),
        SyscallOutcome::Ret(0)
    );
}

#[test]
fn console_input_flows_through_getchar() {
    let mut kernel = boot();
    kernel.install_program("p", trivial_program()).unwrap();
    kernel.env_create("p", 1).unwrap();
    kernel.tick();

    kernel.console_mut().push_input(b'q');
    assert_eq!(
        kernel.syscall(sysno::SYS_GETCHAR, [0; 4]),
        SyscallOutcome::Ret(u32::from(b'q'))
    );
    // Empty buffer reads as NUL.
    assert_eq!(kernel.syscall(sysno::SYS_GETCHAR, [0; 4]), SyscallOutcome::Ret(0));
}

#[test]
fn illegal_syscall_number_terminates_the_caller() {
    let mut kernel = boot();
    kernel.install_program("p", trivial_program()).unwrap();
    let a = kernel.env_create("p", 1).unwrap();
    kernel.tick();
    assert_eq!(kernel.current_env(), Some(a));

    assert_eq!(kernel.syscall(999, [0; 4]), SyscallOutcome::Killed);
    assert_eq!(kernel.current_env(), None);
    assert_eq!(kernel.runnable_head(), None);
}

#[test]
fn bad_pointer_argument_terminates_the_caller() {
    let mut kernel = boot();
    kernel.install_program("p", trivial_program()).unwrap();
    let a = kernel.env_create("p", 1).unwrap();
    kernel.tick();
    assert_eq!(kernel.current_env(), Some(a));

    // Unmapped user address as a string pointer.
    assert_eq!(
        kernel.syscall(sysno::SYS_PUTS, [0x0100_0000, 16, 0, 0]),
        SyscallOutcome::Killed
    );
    assert_eq!(kernel.current_env(), None);
}
