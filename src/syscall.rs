//! Fixed syscall number table and dispatch.
//!
//! Numbers are assigned by the table in `consts`; anything out of range
//! terminates the caller. Pointer arguments are validated against the
//! caller's page tables before the kernel dereferences them, and a failed
//! check also terminates the caller.

use alloc::string::String;
use alloc::vec::Vec;

use log::warn;

use crate::constants::*;
use crate::error::KernelError;
use crate::kernel::Kernel;
use crate::pmap::{copy_from_user, PtePerm, VirtAddr};

pub mod consts {
    pub const SYS_PUTS: u32 = 0;
    pub const SYS_GETCHAR: u32 = 1;
    pub const SYS_SET_LEDS: u32 = 2;
    pub const SYS_GET_SWITCHES: u32 = 3;
    pub const SYS_SET_BUZZER: u32 = 4;
    pub const SYS_CLAIM: u32 = 5;
    pub const SYS_REQUIRE: u32 = 6;
    pub const SYS_RELEASE: u32 = 7;
    pub const SYS_WRITE_BY_NUM: u32 = 8;
    pub const SYS_READ_BY_NUM: u32 = 9;
    pub const SYS_PTHREAD_CREATE: u32 = 10;
    pub const SYS_ENV_CREATE: u32 = 11;
    pub const SYS_YIELD: u32 = 12;
    pub const SYS_EXIT: u32 = 13;
    pub const NSYSCALLS: u32 = 14;
}

/// How a syscall left the calling environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallOutcome {
    /// Normal return; the value goes to the caller's `v0`.
    Ret(u32),
    /// The caller exited (exit syscall); a successor may be running now.
    Exited,
    /// The caller was terminated for a bad request.
    Killed,
}

use consts::*;

/// Read and UTF-8-validate a user string argument.
fn user_str(kernel: &Kernel, va: u32, len: u32) -> Result<String, KernelError> {
    let cur = kernel.envs.cur().ok_or(KernelError::BadEnv)?;
    let pgdir = cur.pgdir();
    pgdir
        .user_mem_check(&kernel.mem, VirtAddr(va), len, PtePerm::U | PtePerm::R)
        .map_err(|_| KernelError::InvalidEnv)?;
    let mut buf = alloc::vec![0u8; len as usize];
    copy_from_user(&kernel.mem, pgdir, VirtAddr(va), &mut buf)?;
    String::from_utf8(buf).map_err(|_| KernelError::InvalidEnv)
}

/// Read a user `u32` vector argument.
fn user_u32s(kernel: &Kernel, va: u32, count: u32) -> Result<Vec<u32>, KernelError> {
    if count as usize > NDEV {
        return Err(KernelError::InvalidEnv);
    }
    let cur = kernel.envs.cur().ok_or(KernelError::BadEnv)?;
    let pgdir = cur.pgdir();
    pgdir
        .user_mem_check(&kernel.mem, VirtAddr(va), count * 4, PtePerm::U | PtePerm::R)
        .map_err(|_| KernelError::InvalidEnv)?;
    let mut buf = alloc::vec![0u8; (count * 4) as usize];
    copy_from_user(&kernel.mem, pgdir, VirtAddr(va), &mut buf)?;
    Ok(buf
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Dispatch by call number. Argument-validation failures and unknown
/// numbers terminate the caller.
pub(crate) fn dispatch(kernel: &mut Kernel, no: u32, args: [u32; 4]) -> SyscallOutcome {
    if no >= NSYSCALLS {
        warn!("illegal syscall num: {}", no);
        kernel.destroy_current();
        return SyscallOutcome::Killed;
    }
    match syscall_body(kernel, no, args) {
        Ok(outcome) => outcome,
        Err(err) => {
            match no {
                // The arbiter reports denial to the caller; nothing dies.
                SYS_CLAIM | SYS_REQUIRE | SYS_RELEASE | SYS_WRITE_BY_NUM | SYS_READ_BY_NUM => {
                    SyscallOutcome::Ret(0)
                }
                // Creation failures surface post-boot as an error value.
                SYS_ENV_CREATE | SYS_PTHREAD_CREATE => {
                    warn!("create syscall failed: {}", err);
                    SyscallOutcome::Ret(0)
                }
                _ => {
                    warn!("syscall {} terminated caller: {}", no, err);
                    kernel.destroy_current();
                    SyscallOutcome::Killed
                }
            }
        }
    }
}

fn syscall_body(
    kernel: &mut Kernel,
    no: u32,
    args: [u32; 4],
) -> Result<SyscallOutcome, KernelError> {
    let asid = kernel
        .envs
        .cur()
        .ok_or(KernelError::BadEnv)?
        .id()
        .asid();

    let ret = match no {
        SYS_PUTS => {
            let s = user_str(kernel, args[0], args[1])?;
            kernel.console.puts(s.as_bytes());
            0
        }
        SYS_GETCHAR => u32::from(kernel.console.getc().unwrap_or(0)),
        SYS_SET_LEDS => {
            kernel.devices.get_mut(DEV_LED)?.write(args[0]);
            0
        }
        SYS_GET_SWITCHES => kernel.devices.get(DEV_SWITCH)?.read(),
        SYS_SET_BUZZER => {
            kernel.devices.get_mut(DEV_BUZZER)?.write(args[0]);
            0
        }
        SYS_CLAIM => {
            let max = user_u32s(kernel, args[0], args[1])?;
            kernel.banker.claim(asid, &max)?;
            1
        }
        SYS_REQUIRE => {
            let (dev, n) = (args[0], args[1]);
            kernel.devices.get(dev)?;
            kernel.banker.request(asid, dev, n)?;
            kernel.devices.get_mut(dev)?.require(n);
            1
        }
        SYS_RELEASE => {
            let (dev, n) = (args[0], args[1]);
            kernel.banker.release(asid, dev, n)?;
            kernel.devices.get_mut(dev)?.release(n);
            1
        }
        SYS_WRITE_BY_NUM => {
            kernel
                .devices
                .get_mut(args[0])?
                .write_by_num(args[1], args[2] as u8)?;
            1
        }
        SYS_READ_BY_NUM => u32::from(kernel.devices.get(args[0])?.read_by_num(args[1])?),
        SYS_PTHREAD_CREATE => {
            let id = kernel.pthread_create(VirtAddr(args[0]), args[1])?;
            id.0
        }
        SYS_ENV_CREATE => {
            let name = user_str(kernel, args[0], args[1])?;
            let id = kernel.env_create(&name, 1)?;
            id.0
        }
        SYS_YIELD => {
            kernel.sched_yield();
            0
        }
        SYS_EXIT => {
            kernel.destroy_current();
            return Ok(SyscallOutcome::Exited);
        }
        _ => unreachable!("checked against NSYSCALLS"),
    };
    Ok(SyscallOutcome::Ret(ret))
}
