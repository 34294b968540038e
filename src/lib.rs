//! Core of a small educational operating system for a 32-bit MIPS-class
//! board with a software-managed TLB: physical memory and two-level paging,
//! ASID-tagged TLB refill, environment lifecycle with a circular runnable
//! ring, an ELF32 loader with the MIPS dynamic-linking GOT fixup, and a
//! banker's-algorithm arbiter for the board peripherals.
//!
//! The machine itself is explicit state: RAM is an arena, page tables live
//! in its frames, and the TLB and MMU context registers are fields of
//! [`Kernel`]. Tests boot private kernels and drive them through the same
//! trap, tick and syscall entry points the hardware would use.

#![no_std]

extern crate alloc;

pub mod arbiter;
pub mod console;
pub mod constants;
mod elf;
mod error;
pub mod env;
pub mod fs;
mod kernel;
pub mod pmap;
mod sched;
pub mod syscall;
pub mod tlb;
pub mod trap;

pub use crate::env::{Env, EnvId, EnvStatus, EnvTable};
pub use crate::error::KernelError;
pub use crate::kernel::Kernel;
pub use crate::pmap::{PageDirectory, PhysAddr, PtePerm, VirtAddr};
pub use crate::syscall::{consts as sysno, SyscallOutcome};
pub use crate::trap::{Exception, Trapframe};
