//! Memory-layout and machine constants.
//!
//! The virtual space is the classic 32-bit split: user text/data/bss grow up
//! from zero, the user stack grows down from `USTACKTOP`, shared attachments
//! occupy the window `[UTOP, UVPT)`, and everything at or above `ULIM` is
//! kernel territory reached through the direct window at `KERNBASE`.

pub const PGSIZE: u32 = 4096;
pub const PGSHIFT: u32 = 12;
pub const NPDENTRIES: usize = 1024;
pub const NPTENTRIES: usize = 1024;
/// Bytes of virtual space covered by one directory entry.
pub const PDMAP: u32 = (NPTENTRIES as u32) * PGSIZE;
pub const PDSHIFT: u32 = 22;

pub const KERNBASE: u32 = 0x8000_0000;
pub const ULIM: u32 = KERNBASE;
/// Kernel-only self-map slot (above `ULIM`).
pub const VPT: u32 = ULIM + PDMAP;
/// User-readable self-map slot.
pub const UVPT: u32 = ULIM - PDMAP;
/// Top of ordinary user space. The window [UTOP, UVPT) holds shared-page
/// attachments, bump-mapped upward from UTOP.
pub const UTOP: u32 = UVPT - 2 * PDMAP;
/// Two pages of unbacked room between the stack top and UTOP.
pub const USTACKTOP: u32 = UTOP - 2 * PGSIZE;

/// Physical memory on the board (256 MiB DDR).
pub const DDR_SIZE: u32 = 0x1000_0000;
/// End of the kernel image plus boot-time structures; the boot bump
/// allocator starts here and `page_init` seals everything below it.
pub const KERN_IMAGE_END: u32 = 0x0040_0000;
/// Staged ELF images may not exceed this (the loader scratch window is
/// carved from the top of DDR).
pub const MAX_FILE_SIZE: u32 = 0x100_0000;
/// Read granularity of the filesystem collaborator.
pub const FS_READ_CHUNK: u32 = 4096;

pub const LOG2NENV: u32 = 10;
pub const NENV: usize = 1 << LOG2NENV;

/// Entries in the software-managed TLB.
pub const NTLB: usize = 16;
/// ASID is an 8-bit hardware tag.
pub const ASID_MASK: u32 = 0xff;

/// Initial CP0 status word for a user trap frame: user mode, interrupts
/// enabled on eret, timer interrupt unmasked.
pub const USER_CP0_STATUS: u32 = 0x1000_7c01;
/// Returning from a user `main` lands here; the stub issues the exit
/// syscall.
pub const EXIT_STUB: u32 = 0x9000_0000;

// Conventional MIPS register numbers used by the kernel.
pub const REG_V0: usize = 2;
pub const REG_A0: usize = 4;
pub const REG_A1: usize = 5;
pub const REG_T9: usize = 25;
pub const REG_SP: usize = 29;
pub const REG_RA: usize = 31;

pub const CONSBUFSIZE: usize = 512;

/// Driver table size; slots without a registered driver reject all I/O.
pub const NDEV: usize = 10;
/// Bounded claimant table of the resource arbiter.
pub const NCLAIMANTS: usize = 4;

pub const DEV_LED: u32 = 0;
pub const DEV_SEG: u32 = 1;
pub const DEV_BUZZER: u32 = 2;
pub const DEV_SWITCH: u32 = 3;

pub(crate) fn round_up_u32(x: u32, base: u32) -> u32 {
    ((x - 1 + base) / base) * base
}

pub(crate) fn round_down_u32(x: u32, base: u32) -> u32 {
    (x / base) * base
}
