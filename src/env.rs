//! The environment table: allocation, address-space bring-up, the runnable
//! ring, thread creation by page-table sharing, and teardown.
//!
//! An environment id packs a monotonically increasing generation above the
//! slot index, so a reused slot never reproduces an old id. The low eight
//! bits double as the hardware ASID.
//!
//! Every environment is on exactly one of the free list and the runnable
//! ring, threaded through the same `link` field.

use log::{debug, info};

use crate::constants::*;
use crate::error::KernelError;
use crate::pmap::{PageDirectory, Pdx, PhysAddr, PhysMem, Pte, PtePerm, SharedRegistry, VirtAddr};
use crate::tlb::{Asid, Mmu};
use crate::trap::Trapframe;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvId(pub u32);

impl EnvId {
    const INVALID: EnvId = EnvId(0xffff_ffff);

    /// Low `LOG2NENV + 1` bits hold the slot index.
    pub fn slot(self) -> usize {
        (self.0 & ((1 << (LOG2NENV + 1)) - 1)) as usize
    }

    /// The TLB tag is the low eight bits of the id.
    pub fn asid(self) -> Asid {
        Asid((self.0 & ASID_MASK) as u8)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvStatus {
    Free,
    Runnable,
}

/// Process control block.
pub struct Env {
    pub(crate) tf: Trapframe,
    pub(crate) id: EnvId,
    pub(crate) parent_id: EnvId,
    pub(crate) status: EnvStatus,
    pub(crate) priority: u32,
    pub(crate) runs: u32,
    pub(crate) pgdir: PageDirectory,
    /// Successor on whichever of the free list and the runnable ring this
    /// environment is on.
    link: Option<usize>,
    /// Bump pointer for shared attachments; grows upward from the user top.
    pub(crate) heap_pc: VirtAddr,
}

impl Env {
    pub fn id(&self) -> EnvId {
        self.id
    }

    pub fn status(&self) -> EnvStatus {
        self.status
    }

    pub fn runs(&self) -> u32 {
        self.runs
    }

    pub fn heap_pc(&self) -> VirtAddr {
        self.heap_pc
    }

    pub fn pgdir(&self) -> PageDirectory {
        self.pgdir
    }

    /// Physical address of the page directory, as loaded into the MMU
    /// context register.
    pub fn cr3(&self) -> PhysAddr {
        self.pgdir.paddr()
    }

    pub fn trapframe(&self) -> &Trapframe {
        &self.tf
    }

    pub(crate) fn trapframe_mut(&mut self) -> &mut Trapframe {
        &mut self.tf
    }
}

/// What `env_free` left behind for the caller to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FreeOutcome {
    /// The freed environment was current; dispatch this ring head next.
    Dispatch(usize),
    /// The freed environment was current and the ring is empty.
    Idle,
}

pub struct EnvTable {
    envs: alloc::vec::Vec<Env>,
    free_head: Option<usize>,
    run_head: Option<usize>,
    run_tail: Option<usize>,
    cur: Option<usize>,
    next_gen: u32,
}

impl EnvTable {
    /// Link every slot onto the free list in high-to-low order so slot zero
    /// is handed out first.
    pub(crate) fn new() -> EnvTable {
        let mut envs = alloc::vec::Vec::with_capacity(NENV);
        for _ in 0..NENV {
            envs.push(Env {
                tf: Trapframe::new(),
                id: EnvId::INVALID,
                parent_id: EnvId(0),
                status: EnvStatus::Free,
                priority: 1,
                runs: 0,
                pgdir: PageDirectory(PhysAddr(0)),
                link: None,
                heap_pc: VirtAddr(UTOP),
            });
        }
        let mut table = EnvTable {
            envs,
            free_head: None,
            run_head: None,
            run_tail: None,
            cur: None,
            next_gen: 0,
        };
        for i in (0..NENV).rev() {
            table.envs[i].link = table.free_head;
            table.free_head = Some(i);
        }
        table
    }

    fn mkenvid(&mut self, slot: usize) -> EnvId {
        self.next_gen += 1;
        EnvId((self.next_gen << (LOG2NENV + 1)) | slot as u32)
    }

    pub fn get(&self, idx: usize) -> &Env {
        &self.envs[idx]
    }

    pub(crate) fn get_mut(&mut self, idx: usize) -> &mut Env {
        &mut self.envs[idx]
    }

    pub fn cur_idx(&self) -> Option<usize> {
        self.cur
    }

    pub fn cur(&self) -> Option<&Env> {
        self.cur.map(|i| &self.envs[i])
    }

    pub(crate) fn cur_mut(&mut self) -> Option<&mut Env> {
        let cur = self.cur?;
        Some(&mut self.envs[cur])
    }

    pub fn runnable_head(&self) -> Option<usize> {
        self.run_head
    }

    pub fn runnable_tail(&self) -> Option<usize> {
        self.run_tail
    }

    pub(crate) fn link_of(&self, idx: usize) -> Option<usize> {
        self.envs[idx].link
    }

    /// Translate an id to a slot. Id zero means the current environment.
    /// With `checkperm` the target must be the caller or an immediate child.
    pub(crate) fn envid2env(&self, id: EnvId, checkperm: bool) -> Result<usize, KernelError> {
        if id.0 == 0 {
            return self.cur.ok_or(KernelError::BadEnv);
        }
        let slot = id.slot();
        if slot >= NENV {
            return Err(KernelError::BadEnv);
        }
        let env = &self.envs[slot];
        if env.status == EnvStatus::Free || env.id != id {
            return Err(KernelError::BadEnv);
        }
        if checkperm {
            let cur = self.cur.ok_or(KernelError::BadEnv)?;
            let cur_id = self.envs[cur].id;
            if slot != cur && env.parent_id != cur_id {
                return Err(KernelError::BadEnv);
            }
        }
        Ok(slot)
    }

    /// Bring up the kernel part of a fresh address space: a zeroed directory
    /// with the kernel entries copied from the boot directory and the two
    /// self-map slots installed.
    fn env_setup_vm(
        mem: &mut PhysMem,
        boot_pgdir: PageDirectory,
    ) -> Result<PageDirectory, KernelError> {
        let pgdir = PageDirectory::alloc(mem)?;
        let first_kernel = VirtAddr(UTOP).pdx().0;
        for i in first_kernel..NPDENTRIES {
            let pde = boot_pgdir.pde(mem, Pdx(i));
            if pde.is_valid() {
                pgdir.set_pde(mem, Pdx(i), pde);
            }
        }
        pgdir.install_self_maps(mem);
        Ok(pgdir)
    }

    /// Pop a free slot and initialize it: fresh address space, user trap
    /// frame with the stack pointer at the stack top and the return address
    /// on the exit stub, runnable status, and a new id.
    pub(crate) fn env_alloc(
        &mut self,
        mem: &mut PhysMem,
        boot_pgdir: PageDirectory,
        parent_id: EnvId,
    ) -> Result<usize, KernelError> {
        let idx = self.free_head.ok_or(KernelError::NoFreeEnv)?;
        let pgdir = Self::env_setup_vm(mem, boot_pgdir)?;
        self.free_head = self.envs[idx].link;

        let id = self.mkenvid(idx);
        let env = &mut self.envs[idx];
        env.id = id;
        env.parent_id = parent_id;
        env.status = EnvStatus::Runnable;
        env.priority = 1;
        env.runs = 0;
        env.pgdir = pgdir;
        env.link = None;
        env.heap_pc = VirtAddr(UTOP);
        env.tf = Trapframe::new_for_user();
        debug!("env_alloc: id {:#010x} slot {}", id.0, idx);
        Ok(idx)
    }

    /// `env_alloc` plus a command-line argument planted in the first two
    /// argument registers.
    pub(crate) fn env_alloc_arg(
        &mut self,
        mem: &mut PhysMem,
        boot_pgdir: PageDirectory,
        parent_id: EnvId,
        arg: u32,
    ) -> Result<usize, KernelError> {
        let idx = self.env_alloc(mem, boot_pgdir, parent_id)?;
        let env = &mut self.envs[idx];
        env.tf.regs[REG_A0] = 1;
        env.tf.regs[REG_A1] = arg;
        Ok(idx)
    }

    /// Map the initial user-stack frame one page below the stack top.
    pub(crate) fn map_initial_stack(
        &mut self,
        mem: &mut PhysMem,
        mmu: &mut Mmu,
        idx: usize,
    ) -> Result<(), KernelError> {
        let pgdir = self.envs[idx].pgdir;
        let ppn = mem.page_alloc(true)?;
        pgdir.insert(
            mem,
            mmu,
            ppn,
            VirtAddr(USTACKTOP - PGSIZE),
            PtePerm::R | PtePerm::W | PtePerm::U,
        )?;
        mem.page_free(ppn);
        Ok(())
    }

    /// Splice onto the tail of the runnable ring, preserving circularity.
    pub(crate) fn append_runnable(&mut self, idx: usize) {
        match self.run_head {
            None => {
                self.envs[idx].link = Some(idx);
                self.run_head = Some(idx);
                self.run_tail = Some(idx);
            }
            Some(head) => {
                self.envs[idx].link = Some(head);
                let tail = self.run_tail.expect("ring with head but no tail");
                self.envs[tail].link = Some(idx);
                self.run_tail = Some(idx);
            }
        }
    }

    /// Remove from the ring. One element empties the ring; removing the
    /// head advances it; removing the tail pulls it back to the
    /// predecessor.
    fn unlink_runnable(&mut self, idx: usize) {
        let head = match self.run_head {
            None => return,
            Some(h) => h,
        };
        if head == idx && self.envs[idx].link == Some(idx) {
            self.run_head = None;
            self.run_tail = None;
            self.envs[idx].link = None;
            return;
        }
        // Find the predecessor on the ring.
        let mut pred = head;
        while self.envs[pred].link != Some(idx) {
            pred = match self.envs[pred].link {
                Some(next) if next != head => next,
                _ => return, // not on the ring
            };
        }
        let succ = self.envs[idx].link.expect("ring member without link");
        self.envs[pred].link = Some(succ);
        if self.run_head == Some(idx) {
            self.run_head = Some(succ);
        }
        if self.run_tail == Some(idx) {
            self.run_tail = Some(pred);
        }
        self.envs[idx].link = None;
    }

    /// Context switch: account the dispatch, install the directory and the
    /// ASID.
    pub(crate) fn env_run(&mut self, mmu: &mut Mmu, idx: usize) {
        let env = &mut self.envs[idx];
        env.runs += 1;
        let pgdir = env.pgdir;
        let asid = env.id.asid();
        self.cur = Some(idx);
        mmu.set_context(pgdir, asid);
        debug!(
            "env_run: id {:#010x} runs {} epc {:#010x}",
            self.envs[idx].id.0, self.envs[idx].runs, self.envs[idx].tf.cp0_epc
        );
    }

    /// Attach the shared frame for `key` at the environment's bump pointer
    /// and advance the pointer one page. The mapping is created dirty so the
    /// first store needs no further fault.
    pub(crate) fn attach_shared(
        &mut self,
        mem: &mut PhysMem,
        mmu: &mut Mmu,
        shared: &mut SharedRegistry,
        idx: usize,
        key: u32,
    ) -> Result<VirtAddr, KernelError> {
        let ppn = shared.get_or_create(mem, key)?;
        let env = &mut self.envs[idx];
        let va = env.heap_pc;
        let pgdir = env.pgdir;
        pgdir.insert(
            mem,
            mmu,
            ppn,
            va,
            PtePerm::R | PtePerm::W | PtePerm::U | PtePerm::D,
        )?;
        self.envs[idx].heap_pc = va + PGSIZE;
        debug!("attach_shared: key {} at va {:#010x}", key, va.0);
        Ok(va)
    }

    /// Share the parent's user pages into `child` and then strip the stack
    /// region, in that order, so the reference-count arithmetic stays
    /// uniform: one increment per copied mapping, all stack-region mappings
    /// removed again by the sweep.
    pub(crate) fn copy_curenv(
        &mut self,
        mem: &mut PhysMem,
        mmu: &mut Mmu,
        child: usize,
        parent: usize,
        func: VirtAddr,
        arg: u32,
    ) -> Result<(), KernelError> {
        let parent_pgdir = self.envs[parent].pgdir;
        let child_pgdir = self.envs[child].pgdir;

        for pdeno in 0..VirtAddr(UTOP).pdx().0 {
            let pde = parent_pgdir.pde(mem, Pdx(pdeno));
            if !pde.is_valid() {
                continue;
            }
            let table_pa = pde.addr();
            for pteno in 0..NPTENTRIES {
                let pte = Pte(mem.read_u32(table_pa + (pteno as u32) * 4));
                if !pte.is_valid() {
                    continue;
                }
                let va = VirtAddr(((pdeno as u32) << PDSHIFT) | ((pteno as u32) << PGSHIFT));
                child_pgdir.insert(
                    mem,
                    mmu,
                    pte.addr().ppn(),
                    va,
                    PtePerm::R | PtePerm::W | PtePerm::U,
                )?;
            }
        }

        // Fresh stack: walk down from the stack-top slot and unmap every
        // contiguous mapped slot, so first access demand-allocates.
        let mut pdeno = VirtAddr(USTACKTOP).pdx().0;
        loop {
            if !child_pgdir.pde(mem, Pdx(pdeno)).is_valid() {
                break;
            }
            child_pgdir.remove_pde(mem, mmu, Pdx(pdeno));
            if pdeno == 0 {
                break;
            }
            pdeno -= 1;
        }

        let tf = &mut self.envs[child].tf;
        tf.set_entry_point(func);
        tf.regs[REG_A0] = arg;
        Ok(())
    }

    /// Unmap user space and the shared-attach window, release the page
    /// tables and the directory frame, and put the slot back on the free
    /// list. The self-map slots and the kernel entries above them stay out
    /// of refcounting.
    fn release_address_space(&mut self, mem: &mut PhysMem, mmu: &mut Mmu, idx: usize) {
        let pgdir = self.envs[idx].pgdir;
        for pdeno in 0..VirtAddr(UVPT).pdx().0 {
            let pde = pgdir.pde(mem, Pdx(pdeno));
            if pde.is_valid() {
                pgdir.remove_pde(mem, mmu, Pdx(pdeno));
            }
        }
        // Directory frame: the cr3 retention was its allocation reference.
        mem.page_free(pgdir.ppn());

        let env = &mut self.envs[idx];
        env.status = EnvStatus::Free;
        env.id = EnvId::INVALID;
        env.pgdir = PageDirectory(PhysAddr(0));
        env.link = self.free_head;
        self.free_head = Some(idx);
    }

    /// Roll back an allocation that never reached the runnable ring, e.g.
    /// when program loading fails after the slot was handed out.
    pub(crate) fn abort_alloc(&mut self, mem: &mut PhysMem, mmu: &mut Mmu, idx: usize) {
        debug!("abort env {:#010x}", self.envs[idx].id.0);
        self.release_address_space(mem, mmu, idx);
    }

    /// Free the current environment: unmap everything user-visible, release
    /// the page tables and the directory, fix up the ring, and return the
    /// slot to the free list. Only the current environment may be freed;
    /// stale TLB entries under other ASIDs are not broadcast.
    pub(crate) fn env_free(
        &mut self,
        mem: &mut PhysMem,
        mmu: &mut Mmu,
        idx: usize,
    ) -> Result<FreeOutcome, KernelError> {
        if self.cur != Some(idx) {
            return Err(KernelError::BadEnv);
        }
        let env_id = self.envs[idx].id;
        info!("free env {:#010x}", env_id.0);

        self.unlink_runnable(idx);
        self.release_address_space(mem, mmu, idx);

        self.cur = None;
        match self.run_head {
            Some(head) => Ok(FreeOutcome::Dispatch(head)),
            None => {
                info!("all processes finished, system idle");
                Ok(FreeOutcome::Idle)
            }
        }
    }

    /// Walk the ring from the head; used by invariant checks in tests.
    #[cfg(test)]
    pub(crate) fn ring_members(&self) -> alloc::vec::Vec<usize> {
        let mut out = alloc::vec::Vec::new();
        let head = match self.run_head {
            None => return out,
            Some(h) => h,
        };
        let mut cur = head;
        loop {
            out.push(cur);
            cur = self.envs[cur].link.expect("ring member without link");
            if cur == head {
                break;
            }
        }
        out
    }
}
