//! Trap frames and cause decoding.
//!
//! The frame carries all thirty-two general registers plus the CP0 state the
//! kernel saves on entry. Dispatch itself lives on the kernel root, which
//! owns every subsystem a handler can touch; this module defines the frame,
//! the exception codes and their names.

use crate::constants::*;
use crate::pmap::VirtAddr;

/// Saved register state of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trapframe {
    pub regs: [u32; 32],
    pub cp0_status: u32,
    pub hi: u32,
    pub lo: u32,
    pub cp0_badvaddr: u32,
    pub cp0_cause: u32,
    pub cp0_epc: u32,
}

impl Trapframe {
    pub(crate) fn new() -> Trapframe {
        Trapframe {
            regs: [0; 32],
            cp0_status: 0,
            hi: 0,
            lo: 0,
            cp0_badvaddr: 0,
            cp0_cause: 0,
            cp0_epc: 0,
        }
    }

    /// Initial frame for a fresh user environment: user-mode status word,
    /// stack pointer at the stack top, return address on the exit stub so
    /// falling off `main` becomes a controlled exit syscall.
    pub(crate) fn new_for_user() -> Trapframe {
        let mut tf = Trapframe::new();
        tf.cp0_status = USER_CP0_STATUS;
        tf.regs[REG_SP] = USTACKTOP;
        tf.regs[REG_RA] = EXIT_STUB;
        tf
    }

    pub(crate) fn set_entry_point(&mut self, va: VirtAddr) {
        self.cp0_epc = va.0;
        // PIC prologues recover the global pointer from t9.
        self.regs[REG_T9] = va.0;
    }
}

/// Exception codes of the cause register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    Interrupt,
    TlbModified,
    TlbLoadMiss,
    TlbStoreMiss,
    AddressErrorLoad,
    AddressErrorStore,
    Syscall,
    ReservedInstruction,
    Other(u32),
}

impl Exception {
    pub(crate) fn from_cause(cause: u32) -> Exception {
        match (cause >> 2) & 0x1f {
            0 => Exception::Interrupt,
            1 => Exception::TlbModified,
            2 => Exception::TlbLoadMiss,
            3 => Exception::TlbStoreMiss,
            4 => Exception::AddressErrorLoad,
            5 => Exception::AddressErrorStore,
            8 => Exception::Syscall,
            10 => Exception::ReservedInstruction,
            code => Exception::Other(code),
        }
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            Exception::Interrupt => "interrupt",
            Exception::TlbModified => "tlb modified",
            Exception::TlbLoadMiss => "tlb load miss",
            Exception::TlbStoreMiss => "tlb store miss",
            Exception::AddressErrorLoad => "address error on load",
            Exception::AddressErrorStore => "address error on store",
            Exception::Syscall => "system call",
            Exception::ReservedInstruction => "reserved instruction",
            Exception::Other(_) => "(unknown exception)",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_frame_initial_state() {
        let tf = Trapframe::new_for_user();
        assert_eq!(tf.cp0_status, USER_CP0_STATUS);
        assert_eq!(tf.regs[REG_SP], USTACKTOP);
        assert_eq!(tf.regs[REG_RA], EXIT_STUB);
    }

    #[test]
    fn entry_point_also_lands_in_t9() {
        let mut tf = Trapframe::new_for_user();
        tf.set_entry_point(VirtAddr(0x0040_0120));
        assert_eq!(tf.cp0_epc, 0x0040_0120);
        assert_eq!(tf.regs[REG_T9], 0x0040_0120);
    }

    #[test]
    fn cause_decoding() {
        assert_eq!(Exception::from_cause(2 << 2), Exception::TlbLoadMiss);
        assert_eq!(Exception::from_cause(3 << 2), Exception::TlbStoreMiss);
        assert_eq!(Exception::from_cause(1 << 2), Exception::TlbModified);
        assert_eq!(Exception::from_cause(8 << 2), Exception::Syscall);
        assert_eq!(Exception::from_cause(10 << 2), Exception::ReservedInstruction);
        assert_eq!(Exception::from_cause(13 << 2), Exception::Other(13));
    }
}
