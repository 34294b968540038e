//! Creation failure paths and thread creation through the public surface.

mod common;

use aurora_os::{sysno, KernelError, SyscallOutcome};
use common::*;

#[test]
fn bad_magic_image_is_rejected_without_consuming_anything() {
    let mut kernel = boot();
    let mut image = trivial_program();
    image[3] = b'X';
    kernel.install_program("broken", image).unwrap();

    assert_eq!(
        kernel.env_create("broken", 1).err(),
        Some(KernelError::ElfInvalid)
    );
    assert_eq!(kernel.runnable_head(), None);

    // The slot was rolled back: the next creation still gets slot zero.
    kernel.install_program("ok", trivial_program()).unwrap();
    let id = kernel.env_create("ok", 1).unwrap();
    assert_eq!(id.slot(), 0);
}

#[test]
fn truncated_segment_is_rejected() {
    let mut kernel = boot();
    let mut image = trivial_program();
    let cut = image.len() - 8;
    image.truncate(cut);
    kernel.install_program("short", image).unwrap();
    assert_eq!(
        kernel.env_create("short", 1).err(),
        Some(KernelError::ElfSegmentOverrun)
    );
    assert_eq!(kernel.runnable_head(), None);
}

#[test]
fn unknown_program_name_fails_cleanly() {
    let mut kernel = boot();
    assert_eq!(
        kernel.env_create("nonesuch", 1).err(),
        Some(KernelError::FileNotFound)
    );
}

#[test]
fn pthread_create_shares_memory_and_gets_a_fresh_stack() {
    let mut kernel = boot();
    kernel.install_program("p", trivial_program()).unwrap();
    let parent = kernel.env_create("p", 1).unwrap();
    kernel.tick();
    assert_eq!(kernel.current_env(), Some(parent));

    // Leave a mark in the parent's data page.
    kernel.user_store_u32(0x0040_0010, 0x5555_aaaa).unwrap();

    let outcome = kernel.syscall(sysno::SYS_PTHREAD_CREATE, [0x0040_0000, 42, 0, 0]);
    let child_id = match outcome {
        SyscallOutcome::Ret(id) if id != 0 => aurora_os::EnvId(id),
        other => panic!("pthread_create failed: {:?}", other),
    };

    // The child sees the parent's data through the shared mapping.
    assert_eq!(kernel.read_u32_in(child_id, 0x0040_0010), Some(0x5555_aaaa));
    // Same frame, not a copy.
    assert_eq!(
        kernel.frame_at(parent, 0x0040_0010),
        kernel.frame_at(child_id, 0x0040_0010)
    );
    // The child's stack region is unmapped until first touch.
    assert_eq!(kernel.frame_at(child_id, USTACKTOP - PGSIZE), None);

    // Entry point and argument register.
    let tf = kernel.envs().get(child_id.slot()).trapframe();
    assert_eq!(tf.cp0_epc, 0x0040_0000);
    assert_eq!(tf.regs[4], 42);

    // The child is on the ring and runs after the parent's slice.
    kernel.tick();
    assert_eq!(kernel.current_env(), Some(child_id));
}

#[test]
fn env_create_arg_plants_the_argument_registers() {
    let mut kernel = boot();
    kernel.install_program("p", trivial_program()).unwrap();
    let id = kernel.env_create_arg("p", 1, 0x1234).unwrap();
    let tf = kernel.envs().get(id.slot()).trapframe();
    assert_eq!(tf.regs[4], 1);
    assert_eq!(tf.regs[5], 0x1234);
    assert_eq!(tf.regs[29], USTACKTOP);
    assert_eq!(tf.regs[31], 0x9000_0000);
}

#[test]
fn exhausting_memory_fails_creation_without_a_panic() {
    let mut kernel = boot();
    kernel.install_program("p", trivial_program()).unwrap();
    // Fill the frame pool with environments until creation fails.
    let mut made = 0;
    loop {
        match kernel.env_create("p", 1) {
            Ok(_) => made += 1,
            Err(KernelError::OutOfMemory) | Err(KernelError::NoFreeEnv) => break,
            Err(other) => panic!("unexpected error: {}", other),
        }
        if made > 8192 {
            panic!("creation never failed");
        }
    }
    assert!(made > 0);
}
