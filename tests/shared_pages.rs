//! Shared-page registry: two environments attach the same key and see the
//! same frame; teardown returns the frame to its registry-only count.

mod common;

use aurora_os::{sysno, SyscallOutcome};
use common::*;

#[test]
fn same_key_attaches_the_same_frame() {
    let mut kernel = boot();
    kernel.install_program("prog", trivial_program()).unwrap();

    let a = kernel.env_create_share("prog", 1, 1).unwrap();
    let b = kernel.env_create_share("prog", 1, 1).unwrap();

    let va_a = kernel.heap_pc_of(a).unwrap() - PGSIZE;
    let va_b = kernel.heap_pc_of(b).unwrap() - PGSIZE;
    let frame_a = kernel.frame_at(a, va_a).unwrap();
    let frame_b = kernel.frame_at(b, va_b).unwrap();
    assert_eq!(frame_a, frame_b);

    // Registry retention plus two attachments.
    assert_eq!(kernel.frame_refcount(frame_a), 3);

    // A write through A's mapping is visible through B's.
    kernel.tick();
    assert_eq!(kernel.current_env(), Some(a));
    kernel.user_store_u32(va_a, 0xdead_beef).unwrap();
    assert_eq!(kernel.read_u32_in(b, va_b), Some(0xdead_beef));

    // Both envs exit; the frame drops back to the registry-only count and
    // stays off the free list.
    assert_eq!(kernel.syscall(sysno::SYS_EXIT, [0; 4]), SyscallOutcome::Exited);
    assert_eq!(kernel.current_env(), Some(b));
    assert_eq!(kernel.syscall(sysno::SYS_EXIT, [0; 4]), SyscallOutcome::Exited);

    assert_eq!(kernel.runnable_head(), None);
    assert_eq!(kernel.frame_refcount(frame_a), 1);
    assert!(!kernel.frame_is_free(frame_a));
}

#[test]
fn different_keys_attach_different_frames() {
    let mut kernel = boot();
    kernel.install_program("prog", trivial_program()).unwrap();

    let a = kernel.env_create_share("prog", 7, 1).unwrap();
    let b = kernel.env_create_share("prog", 8, 1).unwrap();

    let frame_a = kernel.frame_at(a, kernel.heap_pc_of(a).unwrap() - PGSIZE).unwrap();
    let frame_b = kernel.frame_at(b, kernel.heap_pc_of(b).unwrap() - PGSIZE).unwrap();
    assert_ne!(frame_a, frame_b);
    assert_eq!(kernel.frame_refcount(frame_a), 2);
}

#[test]
fn repeated_attach_bumps_the_pointer() {
    let mut kernel = boot();
    kernel.install_program("prog", trivial_program()).unwrap();
    let a = kernel.env_create("prog", 1).unwrap();

    let first = kernel.attach_shared_to(a, 1).unwrap();
    let second = kernel.attach_shared_to(a, 2).unwrap();
    assert_eq!(first, UTOP);
    assert_eq!(second, UTOP + PGSIZE);
    assert_eq!(kernel.heap_pc_of(a).unwrap(), UTOP + 2 * PGSIZE);
}
