//! The software-managed TLB and the MMU context registers.
//!
//! Entries are tagged with an 8-bit ASID so a context switch only has to
//! rewrite the context register and the EntryHi ASID field; entries of other
//! address spaces stay resident. Refill picks victims round-robin, the way
//! the write-random register walks on the real part.

use log::trace;

use crate::constants::*;
use crate::pmap::{PageDirectory, PhysMem, Pte, PtePerm, VirtAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Asid(pub u8);

impl Asid {
    /// Kernel addresses are tagged with ASID zero.
    pub(crate) const KERNEL: Asid = Asid(0);
}

/// One TLB line: virtual page number plus ASID on the match side, frame and
/// permission bits on the output side.
#[derive(Debug, Clone, Copy)]
struct TlbEntry {
    vpn: u32,
    asid: Asid,
    pte: Pte,
    valid: bool,
}

impl TlbEntry {
    const fn invalid() -> TlbEntry {
        TlbEntry {
            vpn: 0,
            asid: Asid(0),
            pte: Pte::empty(),
            valid: false,
        }
    }
}

/// What a lookup through the TLB produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TlbLookup {
    /// Translation hit with sufficient permission.
    Hit(Pte),
    /// Entry present but the page is clean and the access is a store.
    Modified,
    /// No matching entry.
    Miss,
}

/// MMU state: the context register holding the active directory, the current
/// ASID, and the entry array.
pub struct Mmu {
    context: PageDirectory,
    asid: Asid,
    entries: [TlbEntry; NTLB],
    next_victim: usize,
}

impl Mmu {
    pub(crate) fn new(boot_pgdir: PageDirectory) -> Mmu {
        Mmu {
            context: boot_pgdir,
            asid: Asid::KERNEL,
            entries: [TlbEntry::invalid(); NTLB],
            next_victim: 0,
        }
    }

    pub(crate) fn context(&self) -> PageDirectory {
        self.context
    }

    pub(crate) fn asid(&self) -> Asid {
        self.asid
    }

    /// Install a new directory and ASID pair; done on every context switch.
    pub(crate) fn set_context(&mut self, pgdir: PageDirectory, asid: Asid) {
        self.context = pgdir;
        self.asid = asid;
    }

    /// Run `f` with the MMU temporarily switched to another address space,
    /// restoring the previous directory and ASID on every exit path.
    pub(crate) fn with_address_space<R>(
        &mut self,
        pgdir: PageDirectory,
        asid: Asid,
        f: impl FnOnce(&mut Mmu) -> R,
    ) -> R {
        let saved = (self.context, self.asid);
        self.set_context(pgdir, asid);
        let r = f(self);
        self.set_context(saved.0, saved.1);
        r
    }

    fn probe(&self, vpn: u32, asid: Asid) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.valid && e.vpn == vpn && e.asid == asid)
    }

    /// Look up `va` under the current ASID for the given kind of access.
    pub(crate) fn lookup(&self, va: VirtAddr, write: bool) -> TlbLookup {
        let asid = if va.0 >= ULIM { Asid::KERNEL } else { self.asid };
        match self.probe(va.vpn(), asid) {
            None => TlbLookup::Miss,
            Some(i) => {
                let pte = self.entries[i].pte;
                if write && !pte.perm().contains(PtePerm::D) {
                    TlbLookup::Modified
                } else {
                    TlbLookup::Hit(pte)
                }
            }
        }
    }

    /// Refill after a miss: walk the active directory and install the leaf
    /// at the round-robin victim index. Returns `false` when no valid leaf
    /// exists, which escalates to the page-fault handler.
    pub(crate) fn refill(&mut self, mem: &mut PhysMem, va: VirtAddr) -> bool {
        let pgdir = self.context;
        let pte = match pgdir.lookup(mem, va.round_down(PGSIZE)) {
            Some((_, pte)) => pte,
            None => return false,
        };
        let asid = if va.0 >= ULIM { Asid::KERNEL } else { self.asid };
        let victim = self.next_victim;
        self.next_victim = (self.next_victim + 1) % NTLB;
        trace!(
            "tlb refill: va={:#010x} asid={} -> index {}",
            va.0,
            asid.0,
            victim
        );
        self.entries[victim] = TlbEntry {
            vpn: va.vpn(),
            asid,
            pte,
            valid: true,
        };
        true
    }

    /// Probe for `(va, asid)` and overwrite a match with an invalid entry.
    /// A miss is a no-op.
    pub(crate) fn invalidate(&mut self, va: VirtAddr, asid: Asid) {
        if let Some(i) = self.probe(va.vpn(), asid) {
            trace!(
                "tlb invalidate: va={:#010x} asid={} index {}",
                va.0,
                asid.0,
                i
            );
            self.entries[i] = TlbEntry::invalid();
        }
    }

    #[cfg(test)]
    pub(crate) fn resident(&self, va: VirtAddr, asid: Asid) -> bool {
        self.probe(va.vpn(), asid).is_some()
    }
}
