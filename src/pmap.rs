//! Physical memory management and the two-level page-table engine.
//!
//! Physical RAM is an explicit arena owned by [`PhysMem`], with one
//! [`PageInfo`] per frame. A frame is either on the free list with a
//! reference count of zero, or off the free list with a count of at least
//! one; `page_free` panics on anything else.
//!
//! Page tables live inside frames of the arena, so a directory really does
//! self-map: the two designated directory slots carry the directory's own
//! physical address. Directory operations take the arena and the MMU by
//! reference, the way the walk/insert/remove family is meant to be called
//! from trap context.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::ops::{Add, AddAssign, Sub};

use bitflags::bitflags;
use log::{debug, trace};

use crate::constants::*;
use crate::error::KernelError;
use crate::tlb::Mmu;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtAddr(pub u32);

impl VirtAddr {
    pub(crate) fn round_up(self, size: u32) -> VirtAddr {
        VirtAddr(round_up_u32(self.0, size))
    }

    pub(crate) fn round_down(self, size: u32) -> VirtAddr {
        VirtAddr(round_down_u32(self.0, size))
    }

    pub(crate) fn is_aligned(self) -> bool {
        self.0 % PGSIZE == 0
    }

    pub(crate) fn pdx(self) -> Pdx {
        Pdx(((self.0 >> PDSHIFT) & 0x3ff) as usize)
    }

    pub(crate) fn ptx(self) -> Ptx {
        Ptx(((self.0 >> PGSHIFT) & 0x3ff) as usize)
    }

    pub(crate) fn page_offset(self) -> u32 {
        self.0 & (PGSIZE - 1)
    }

    pub(crate) fn vpn(self) -> u32 {
        self.0 >> PGSHIFT
    }
}

impl Add<u32> for VirtAddr {
    type Output = VirtAddr;

    fn add(self, rhs: u32) -> VirtAddr {
        VirtAddr(self.0 + rhs)
    }
}

impl AddAssign<u32> for VirtAddr {
    fn add_assign(&mut self, rhs: u32) {
        self.0 += rhs;
    }
}

impl Sub<u32> for VirtAddr {
    type Output = VirtAddr;

    fn sub(self, rhs: u32) -> VirtAddr {
        VirtAddr(self.0 - rhs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysAddr(pub u32);

impl PhysAddr {
    pub(crate) fn ppn(self) -> Ppn {
        Ppn(self.0 >> PGSHIFT)
    }

    pub(crate) fn is_aligned(self) -> bool {
        self.0 % PGSIZE == 0
    }
}

impl Add<u32> for PhysAddr {
    type Output = PhysAddr;

    fn add(self, rhs: u32) -> PhysAddr {
        PhysAddr(self.0 + rhs)
    }
}

/// Physical page number; index into the `pages` array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Ppn(pub u32);

impl Ppn {
    pub(crate) fn pa(self) -> PhysAddr {
        PhysAddr(self.0 << PGSHIFT)
    }
}

/// First-level index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Pdx(pub(crate) usize);

/// Second-level index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Ptx(pub(crate) usize);

bitflags! {
    /// Permission bits in the low half-word of a page-table entry. Kernel
    /// mappings omit `U`; `D` doubles as the hardware write-enable the way
    /// the TLB wants it.
    pub struct PtePerm: u32 {
        const V = 1 << 0;
        const R = 1 << 1;
        const W = 1 << 2;
        const U = 1 << 3;
        const D = 1 << 4;
    }
}

/// Second-level entry: frame address plus permission bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pte(pub u32);

impl Pte {
    pub(crate) fn new(pa: PhysAddr, perm: PtePerm) -> Pte {
        Pte(pa.0 | perm.bits())
    }

    pub(crate) const fn empty() -> Pte {
        Pte(0)
    }

    pub(crate) fn is_valid(self) -> bool {
        self.0 & PtePerm::V.bits() != 0
    }

    pub(crate) fn addr(self) -> PhysAddr {
        PhysAddr(self.0 & !(PGSIZE - 1))
    }

    pub(crate) fn perm(self) -> PtePerm {
        PtePerm::from_bits_truncate(self.0 & (PGSIZE - 1))
    }
}

/// First-level entry: page-table-page address plus a valid bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Pde(pub(crate) u32);

impl Pde {
    fn new(pa: PhysAddr, perm: PtePerm) -> Pde {
        Pde(pa.0 | perm.bits())
    }

    pub(crate) fn is_valid(self) -> bool {
        self.0 & PtePerm::V.bits() != 0
    }

    pub(crate) fn addr(self) -> PhysAddr {
        PhysAddr(self.0 & !(PGSIZE - 1))
    }
}

/// One record per physical frame: reference count plus the free-list link.
#[derive(Debug, Clone, Copy)]
struct PageInfo {
    link: Option<u32>,
    refcount: u16,
}

/// The physical memory of the machine: the RAM arena, the frame records and
/// the free list, plus the boot-time bump allocator that runs before the
/// free list exists.
pub struct PhysMem {
    ram: Vec<u8>,
    pages: Vec<PageInfo>,
    free_list: Option<u32>,
    freemem: u32,
    reserved_from: Option<u32>,
    sealed: bool,
}

impl PhysMem {
    pub(crate) fn new(maxpa: u32) -> PhysMem {
        assert!(
            maxpa >= KERN_IMAGE_END + 2 * PGSIZE,
            "physical memory smaller than the kernel image"
        );
        assert_eq!(maxpa % PGSIZE, 0, "maxpa must be page aligned");
        let npages = (maxpa / PGSIZE) as usize;
        PhysMem {
            ram: alloc::vec![0u8; maxpa as usize],
            pages: alloc::vec![
                PageInfo {
                    link: None,
                    refcount: 0,
                };
                npages
            ],
            free_list: None,
            freemem: KERN_IMAGE_END,
            reserved_from: None,
            sealed: false,
        }
    }

    /// Keep every frame from `pa` upward off the free list; used for the
    /// loader staging window at the top of memory.
    pub(crate) fn reserve_top(&mut self, pa: u32) {
        assert!(!self.sealed, "reserve_top after page_init");
        self.reserved_from = Some(pa / PGSIZE);
    }

    pub(crate) fn maxpa(&self) -> u32 {
        self.ram.len() as u32
    }

    pub(crate) fn npages(&self) -> usize {
        self.pages.len()
    }

    /// Boot-time bump allocator over the region from the kernel-image end to
    /// the memory ceiling. Only valid before `page_init` seals the free
    /// list.
    pub(crate) fn boot_alloc(&mut self, n: u32, align: u32, clear: bool) -> PhysAddr {
        assert!(!self.sealed, "boot_alloc after page_init");
        self.freemem = round_up_u32(self.freemem, align);
        let alloced = self.freemem;
        self.freemem += round_up_u32(n, align);
        if self.freemem >= self.maxpa() {
            panic!("boot_alloc: out of memory");
        }
        if clear {
            let range = alloced as usize..self.freemem as usize;
            for b in &mut self.ram[range] {
                *b = 0;
            }
        }
        PhysAddr(alloced)
    }

    /// Seal the bump allocator and build the free list. Frames below the
    /// bump pointer stay off the list with a reference count of one. The
    /// list is threaded so that the lowest free frame is allocated first,
    /// keeping early allocations clear of the staging window at the top of
    /// memory.
    pub(crate) fn page_init(&mut self) {
        self.freemem = round_up_u32(self.freemem, PGSIZE);
        let first_free = (self.freemem / PGSIZE) as usize;
        for i in 0..first_free {
            self.pages[i].refcount = 1;
        }
        let ceiling = match self.reserved_from {
            Some(r) => (r as usize).max(first_free).min(self.npages()),
            None => self.npages(),
        };
        for i in ceiling..self.npages() {
            self.pages[i].refcount = 1;
        }
        self.free_list = None;
        for i in (first_free..ceiling).rev() {
            self.pages[i].refcount = 0;
            self.pages[i].link = self.free_list;
            self.free_list = Some(i as u32);
        }
        self.sealed = true;
        debug!(
            "page_init: free memory from page {} to {}",
            first_free,
            ceiling.saturating_sub(1)
        );
    }

    /// Pop a frame off the free list with a reference count of one. The
    /// count stands for the caller's reference; mappings made with `insert`
    /// add their own, and callers that only wanted the mapping drop theirs
    /// with `page_free`.
    pub(crate) fn page_alloc(&mut self, zero: bool) -> Result<Ppn, KernelError> {
        let head = match self.free_list {
            None => return Err(KernelError::OutOfMemory),
            Some(head) => head,
        };
        self.free_list = self.pages[head as usize].link;
        self.pages[head as usize].link = None;
        self.pages[head as usize].refcount = 1;
        let ppn = Ppn(head);
        if zero {
            self.zero_page(ppn);
        }
        Ok(ppn)
    }

    /// Drop one reference; the frame returns to the head of the free list
    /// when the count reaches zero.
    pub(crate) fn page_free(&mut self, ppn: Ppn) {
        let page = &mut self.pages[ppn.0 as usize];
        if page.refcount == 0 {
            panic!("page_free: page {:?} already free", ppn);
        }
        page.refcount -= 1;
        if page.refcount == 0 {
            page.link = self.free_list;
            self.free_list = Some(ppn.0);
        }
    }

    pub(crate) fn page_incref(&mut self, ppn: Ppn) {
        self.pages[ppn.0 as usize].refcount += 1;
    }

    pub(crate) fn refcount(&self, ppn: Ppn) -> u16 {
        self.pages[ppn.0 as usize].refcount
    }

    pub(crate) fn is_free(&self, ppn: Ppn) -> bool {
        self.pages[ppn.0 as usize].refcount == 0
    }

    fn zero_page(&mut self, ppn: Ppn) {
        let base = ppn.pa().0 as usize;
        for b in &mut self.ram[base..base + PGSIZE as usize] {
            *b = 0;
        }
    }

    pub(crate) fn read_u32(&self, pa: PhysAddr) -> u32 {
        let i = pa.0 as usize;
        u32::from_le_bytes([self.ram[i], self.ram[i + 1], self.ram[i + 2], self.ram[i + 3]])
    }

    pub(crate) fn write_u32(&mut self, pa: PhysAddr, val: u32) {
        let i = pa.0 as usize;
        self.ram[i..i + 4].copy_from_slice(&val.to_le_bytes());
    }

    pub(crate) fn read_u8(&self, pa: PhysAddr) -> u8 {
        self.ram[pa.0 as usize]
    }

    pub(crate) fn read_bytes(&self, pa: PhysAddr, buf: &mut [u8]) {
        let i = pa.0 as usize;
        buf.copy_from_slice(&self.ram[i..i + buf.len()]);
    }

    pub(crate) fn write_bytes(&mut self, pa: PhysAddr, bytes: &[u8]) {
        let i = pa.0 as usize;
        self.ram[i..i + bytes.len()].copy_from_slice(bytes);
    }

    pub(crate) fn read_range(&self, pa: PhysAddr, len: usize) -> Vec<u8> {
        let i = pa.0 as usize;
        self.ram[i..i + len].to_vec()
    }

    pub(crate) fn zero_range(&mut self, pa: PhysAddr, len: usize) {
        let i = pa.0 as usize;
        for b in &mut self.ram[i..i + len] {
            *b = 0;
        }
    }
}

/// Handle to a page-table entry inside the arena; read and written through
/// `PhysMem` so the entry the hardware would walk is the entry we edit.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PteSlot {
    pa: PhysAddr,
}

impl PteSlot {
    pub(crate) fn get(self, mem: &PhysMem) -> Pte {
        Pte(mem.read_u32(self.pa))
    }

    pub(crate) fn set(self, mem: &mut PhysMem, pte: Pte) {
        mem.write_u32(self.pa, pte.0);
    }
}

/// Handle to a page directory: the physical address of its frame. All
/// operations walk through the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageDirectory(pub(crate) PhysAddr);

impl PageDirectory {
    /// Allocate a zeroed directory frame. The allocation reference stands
    /// for the owner's `cr3` retention.
    pub(crate) fn alloc(mem: &mut PhysMem) -> Result<PageDirectory, KernelError> {
        let ppn = mem.page_alloc(true)?;
        Ok(PageDirectory(ppn.pa()))
    }

    pub(crate) fn paddr(self) -> PhysAddr {
        self.0
    }

    pub(crate) fn ppn(self) -> Ppn {
        self.0.ppn()
    }

    fn pde_pa(self, pdx: Pdx) -> PhysAddr {
        self.0 + (pdx.0 as u32) * 4
    }

    pub(crate) fn pde(self, mem: &PhysMem, pdx: Pdx) -> Pde {
        Pde(mem.read_u32(self.pde_pa(pdx)))
    }

    pub(crate) fn set_pde(self, mem: &mut PhysMem, pdx: Pdx, pde: Pde) {
        mem.write_u32(self.pde_pa(pdx), pde.0);
    }

    /// Install the self-map slots: the kernel-only one and the user-readable
    /// one. These entries hold the directory's own frame address and stay
    /// out of leaf reference counting.
    pub(crate) fn install_self_maps(self, mem: &mut PhysMem) {
        self.set_pde(mem, VirtAddr(VPT).pdx(), Pde::new(self.0, PtePerm::V));
        self.set_pde(
            mem,
            VirtAddr(UVPT).pdx(),
            Pde::new(self.0, PtePerm::V | PtePerm::R | PtePerm::U),
        );
    }

    /// Return the slot of the page-table entry for `va`, allocating the
    /// page-table page when `create` is set. With `create` clear a missing
    /// table yields `None`.
    pub(crate) fn walk(
        self,
        mem: &mut PhysMem,
        va: VirtAddr,
        create: bool,
    ) -> Result<Option<PteSlot>, KernelError> {
        let pdx = va.pdx();
        let pde = self.pde(mem, pdx);
        let table_pa = if pde.is_valid() {
            pde.addr()
        } else {
            if !create {
                return Ok(None);
            }
            // The allocation reference stands for the directory-entry
            // retention of the new table page.
            let ppn = mem.page_alloc(true)?;
            self.set_pde(mem, pdx, Pde::new(ppn.pa(), PtePerm::V));
            ppn.pa()
        };
        Ok(Some(PteSlot {
            pa: table_pa + (va.ptx().0 as u32) * 4,
        }))
    }

    /// Return the frame mapped at `va`, or `None` when nothing valid is
    /// there.
    pub(crate) fn lookup(self, mem: &mut PhysMem, va: VirtAddr) -> Option<(Ppn, Pte)> {
        match self.walk(mem, va, false) {
            Ok(Some(slot)) => {
                let pte = slot.get(mem);
                if pte.is_valid() {
                    Some((pte.addr().ppn(), pte))
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Map `ppn` at `va` with `perm | V`. An existing mapping of another
    /// frame is removed first; re-mapping the same frame only updates the
    /// permissions. The frame gains one reference per mapping.
    pub(crate) fn insert(
        self,
        mem: &mut PhysMem,
        mmu: &mut Mmu,
        ppn: Ppn,
        va: VirtAddr,
        perm: PtePerm,
    ) -> Result<(), KernelError> {
        let slot = self
            .walk(mem, va, true)?
            .expect("walk with create returned no slot");
        let old = slot.get(mem);
        let new = Pte::new(ppn.pa(), perm | PtePerm::V);

        if old.is_valid() && old.addr() == ppn.pa() {
            slot.set(mem, new);
            self.flush(mmu, va);
            return Ok(());
        }

        // Take the mapping reference before removing the old entry so that
        // the frame cannot hit zero in between.
        mem.page_incref(ppn);
        if old.is_valid() {
            Self::remove_slot(self, mem, mmu, va, slot);
        }
        slot.set(mem, new);
        trace!(
            "page_insert: va={:#010x} -> pa={:#010x}, perm={:?}, ref={}",
            va.0,
            ppn.pa().0,
            perm,
            mem.refcount(ppn)
        );
        self.flush(mmu, va);
        Ok(())
    }

    /// Unmap `va`; a no-op when nothing is mapped. Drops the frame's mapping
    /// reference and invalidates the TLB entry.
    pub(crate) fn remove(self, mem: &mut PhysMem, mmu: &mut Mmu, va: VirtAddr) {
        if let Ok(Some(slot)) = self.walk(mem, va, false) {
            if slot.get(mem).is_valid() {
                Self::remove_slot(self, mem, mmu, va, slot);
            }
        }
    }

    fn remove_slot(self, mem: &mut PhysMem, mmu: &mut Mmu, va: VirtAddr, slot: PteSlot) {
        let pte = slot.get(mem);
        trace!("page_remove: va={:#010x} pa={:#010x}", va.0, pte.addr().0);
        slot.set(mem, Pte::empty());
        mem.page_free(pte.addr().ppn());
        self.flush(mmu, va);
    }

    /// Unmap every leaf of the table behind `pdx`, then release the table
    /// page itself and clear the entry.
    pub(crate) fn remove_pde(self, mem: &mut PhysMem, mmu: &mut Mmu, pdx: Pdx) {
        let pde = self.pde(mem, pdx);
        if !pde.is_valid() {
            return;
        }
        let table_pa = pde.addr();
        for i in 0..NPTENTRIES {
            let slot = PteSlot {
                pa: table_pa + (i as u32) * 4,
            };
            if slot.get(mem).is_valid() {
                let va = VirtAddr(((pdx.0 as u32) << PDSHIFT) | ((i as u32) << PGSHIFT));
                Self::remove_slot(self, mem, mmu, va, slot);
            }
        }
        self.set_pde(mem, pdx, Pde(0));
        mem.page_free(table_pa.ppn());
    }

    /// Flush `(va, asid)` only when this directory is the active one; stale
    /// entries under other ASIDs are the documented teardown limitation.
    fn flush(self, mmu: &mut Mmu, va: VirtAddr) {
        if mmu.context() == self {
            let asid = mmu.asid();
            mmu.invalidate(va, asid);
        }
    }

    /// Read-only translation; follows the two levels without allocating.
    pub(crate) fn va2pa(self, mem: &PhysMem, va: VirtAddr) -> Option<PhysAddr> {
        let pde = self.pde(mem, va.pdx());
        if !pde.is_valid() {
            return None;
        }
        let pte = Pte(mem.read_u32(pde.addr() + (va.ptx().0 as u32) * 4));
        if !pte.is_valid() {
            return None;
        }
        Some(pte.addr() + va.page_offset())
    }

    /// Check that user code may access `[va, va+len)` with `perm | V`. Every
    /// page of the range must be below the self-map window and mapped with
    /// at least `perm`. On failure returns the first offending address.
    pub(crate) fn user_mem_check(
        self,
        mem: &PhysMem,
        va: VirtAddr,
        len: u32,
        perm: PtePerm,
    ) -> Result<(), VirtAddr> {
        let start = va.round_down(PGSIZE);
        let end = (va + len).round_up(PGSIZE);
        let mut cur = start;
        while cur < end {
            if cur.0 >= UVPT {
                return Err(if cur < va { va } else { cur });
            }
            let pde = self.pde(mem, cur.pdx());
            if !pde.is_valid() {
                return Err(if cur < va { va } else { cur });
            }
            let pte = Pte(mem.read_u32(pde.addr() + (cur.ptx().0 as u32) * 4));
            if !pte.is_valid() || !pte.perm().contains(perm) {
                return Err(if cur < va { va } else { cur });
            }
            cur += PGSIZE;
        }
        Ok(())
    }

    /// Map `[va, va+size)` to `[pa, pa+size)` with `perm | V`, allocating
    /// table pages from the boot bump allocator. Used only while the free
    /// list does not exist yet.
    pub(crate) fn boot_map_segment(
        self,
        mem: &mut PhysMem,
        va: VirtAddr,
        size: u32,
        pa: PhysAddr,
        perm: PtePerm,
    ) {
        assert!(va.is_aligned(), "boot_map_segment: va not page aligned");
        assert!(pa.is_aligned(), "boot_map_segment: pa not page aligned");
        assert_eq!(size % PGSIZE, 0, "boot_map_segment: size not page aligned");
        for i in 0..size / PGSIZE {
            let cur_va = va + i * PGSIZE;
            let cur_pa = pa + i * PGSIZE;
            let pdx = cur_va.pdx();
            let pde = self.pde(mem, pdx);
            let table_pa = if pde.is_valid() {
                pde.addr()
            } else {
                let table = mem.boot_alloc(PGSIZE, PGSIZE, true);
                self.set_pde(mem, pdx, Pde::new(table, PtePerm::V));
                table
            };
            let slot = PteSlot {
                pa: table_pa + (cur_va.ptx().0 as u32) * 4,
            };
            slot.set(mem, Pte::new(cur_pa, perm | PtePerm::V));
        }
    }
}

/// Why the faulting instruction touched memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessIntent {
    Read,
    Write,
}

/// A fault the handler could not satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FaultKind {
    /// The access itself was illegal; the environment dies.
    Kill(&'static str),
    /// No frame left to map. Fatal on the user fault path, where the
    /// faulting instruction cannot be retried without one; an error on the
    /// kernel install path.
    OutOfMemory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PageFault {
    pub(crate) va: VirtAddr,
    pub(crate) kind: FaultKind,
}

impl PageFault {
    fn kill(va: VirtAddr, reason: &'static str) -> PageFault {
        PageFault {
            va,
            kind: FaultKind::Kill(reason),
        }
    }
}

/// Service a miss on the active address space: check the reserved range,
/// honor an existing mapping (setting the dirty bit on write), or map a
/// fresh zero frame with permissions derived from the intent.
pub(crate) fn handle_page_fault(
    mem: &mut PhysMem,
    mmu: &mut Mmu,
    va: VirtAddr,
    intent: AccessIntent,
    user_mode: bool,
) -> Result<PhysAddr, PageFault> {
    let pgdir = mmu.context();
    trace!(
        "page fault: va={:#010x} intent={:?} user={}",
        va.0,
        intent,
        user_mode
    );

    if user_mode && va.0 >= UTOP {
        return Err(PageFault::kill(va, "user access to kernel-reserved region"));
    }

    if let Ok(Some(slot)) = pgdir.walk(mem, va, false) {
        let pte = slot.get(mem);
        if pte.is_valid() {
            let perm = pte.perm();
            if intent == AccessIntent::Write && !perm.contains(PtePerm::W) {
                if user_mode {
                    return Err(PageFault::kill(va, "write to read-only page"));
                }
                panic!("kernel write to read-only mapping at {:#010x}", va.0);
            }
            if user_mode && !perm.contains(PtePerm::U) {
                return Err(PageFault::kill(va, "user access to kernel page"));
            }
            if intent == AccessIntent::Write && !perm.contains(PtePerm::D) {
                slot.set(mem, Pte::new(pte.addr(), perm | PtePerm::D));
                let asid = mmu.asid();
                mmu.invalidate(va, asid);
            }
            return Ok(pte.addr() + va.page_offset());
        }
    }

    let oom = PageFault {
        va,
        kind: FaultKind::OutOfMemory,
    };
    let ppn = mem.page_alloc(true).map_err(|_| oom)?;
    let mut perm = PtePerm::R;
    if va.0 < ULIM {
        perm |= PtePerm::U;
    }
    if intent == AccessIntent::Write {
        perm |= PtePerm::W | PtePerm::D;
    }
    if pgdir.insert(mem, mmu, ppn, va.round_down(PGSIZE), perm).is_err() {
        // Roll the orphaned frame back before reporting.
        mem.page_free(ppn);
        return Err(oom);
    }
    // The mapping now holds the only reference.
    mem.page_free(ppn);
    debug!(
        "page fault served: va={:#010x} -> pa={:#010x} perm={:?}",
        va.0,
        ppn.pa().0,
        perm
    );
    Ok(ppn.pa() + va.page_offset())
}

/// Copy bytes into the active address space, taking the store-fault path for
/// every unmapped page, so installs into a fresh directory land their frames
/// there.
pub(crate) fn copy_to_user(
    mem: &mut PhysMem,
    mmu: &mut Mmu,
    dst: VirtAddr,
    src: &[u8],
) -> Result<(), KernelError> {
    let mut va = dst;
    let mut off = 0usize;
    while off < src.len() {
        let in_page = (PGSIZE - va.page_offset()) as usize;
        let n = in_page.min(src.len() - off);
        let pa = handle_page_fault(mem, mmu, va, AccessIntent::Write, false)
            .map_err(install_fault)?;
        mem.write_bytes(pa, &src[off..off + n]);
        va += n as u32;
        off += n;
    }
    Ok(())
}

fn install_fault(fault: PageFault) -> KernelError {
    match fault.kind {
        FaultKind::OutOfMemory => KernelError::OutOfMemory,
        FaultKind::Kill(_) => KernelError::InvalidEnv,
    }
}

/// Zero a range of the active address space with the same fault-driven
/// mapping behavior as `copy_to_user`.
pub(crate) fn memset_user(
    mem: &mut PhysMem,
    mmu: &mut Mmu,
    dst: VirtAddr,
    len: u32,
) -> Result<(), KernelError> {
    let mut va = dst;
    let mut remaining = len;
    while remaining > 0 {
        let in_page = PGSIZE - va.page_offset();
        let n = in_page.min(remaining);
        let pa = handle_page_fault(mem, mmu, va, AccessIntent::Write, false)
            .map_err(install_fault)?;
        mem.zero_range(pa, n as usize);
        va += n;
        remaining -= n;
    }
    Ok(())
}

/// Read bytes from a mapped range of the given directory without faulting;
/// unmapped pages are an error. Used for syscall argument transfer after
/// `user_mem_check`.
pub(crate) fn copy_from_user(
    mem: &PhysMem,
    pgdir: PageDirectory,
    src: VirtAddr,
    buf: &mut [u8],
) -> Result<(), KernelError> {
    let mut va = src;
    let mut off = 0usize;
    while off < buf.len() {
        let in_page = (PGSIZE - va.page_offset()) as usize;
        let n = in_page.min(buf.len() - off);
        let pa = pgdir.va2pa(mem, va).ok_or(KernelError::InvalidEnv)?;
        mem.read_bytes(pa, &mut buf[off..off + n]);
        va += n as u32;
        off += n;
    }
    Ok(())
}

/// Registry of shared frames keyed by integer. An entry is created on first
/// attach and retained for the kernel's lifetime; its reference count tracks
/// the registry retention plus live attachments.
pub(crate) struct SharedRegistry {
    entries: BTreeMap<u32, Ppn>,
}

impl SharedRegistry {
    pub(crate) fn new() -> SharedRegistry {
        SharedRegistry {
            entries: BTreeMap::new(),
        }
    }

    /// Look up `key`, allocating a fresh zeroed frame on a miss. The frame's
    /// allocation reference becomes the registry retention.
    pub(crate) fn get_or_create(
        &mut self,
        mem: &mut PhysMem,
        key: u32,
    ) -> Result<Ppn, KernelError> {
        if let Some(&ppn) = self.entries.get(&key) {
            trace!("shared registry: found key {} -> {:?}", key, ppn);
            return Ok(ppn);
        }
        let ppn = mem.page_alloc(true)?;
        self.entries.insert(key, ppn);
        debug!("shared registry: created key {} -> {:?}", key, ppn);
        Ok(ppn)
    }

    pub(crate) fn get(&self, key: u32) -> Option<Ppn> {
        self.entries.get(&key).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tlb::Mmu;

    const TEST_MEM: u32 = KERN_IMAGE_END + 64 * PGSIZE;

    fn fresh() -> (PhysMem, Mmu, PageDirectory) {
        let mut mem = PhysMem::new(TEST_MEM);
        mem.page_init();
        let pgdir = PageDirectory::alloc(&mut mem).unwrap();
        let mmu = Mmu::new(pgdir);
        (mem, mmu, pgdir)
    }

    #[test]
    fn alloc_free_round_trip() {
        let (mut mem, _, _) = fresh();
        let ppn = mem.page_alloc(true).unwrap();
        assert_eq!(mem.refcount(ppn), 1);
        assert!(!mem.is_free(ppn));
        mem.page_free(ppn);
        assert!(mem.is_free(ppn));
        // The freed frame comes back first.
        let again = mem.page_alloc(false).unwrap();
        assert_eq!(again, ppn);
    }

    #[test]
    fn alloc_exhaustion_reports_oom() {
        let (mut mem, _, _) = fresh();
        let mut held = alloc::vec::Vec::new();
        loop {
            match mem.page_alloc(false) {
                Ok(ppn) => held.push(ppn),
                Err(e) => {
                    assert_eq!(e, KernelError::OutOfMemory);
                    break;
                }
            }
        }
        // The failed allocation must not have disturbed anything: every held
        // frame still carries exactly one reference.
        for ppn in held {
            assert_eq!(mem.refcount(ppn), 1);
        }
    }

    #[test]
    #[should_panic(expected = "already free")]
    fn double_free_panics() {
        let (mut mem, _, _) = fresh();
        let ppn = mem.page_alloc(false).unwrap();
        mem.page_free(ppn);
        mem.page_free(ppn);
    }

    #[test]
    fn insert_lookup_remove() {
        let (mut mem, mut mmu, pgdir) = fresh();
        let va = VirtAddr(0x0040_0000);
        let ppn = mem.page_alloc(true).unwrap();
        pgdir
            .insert(&mut mem, &mut mmu, ppn, va, PtePerm::R | PtePerm::W | PtePerm::U)
            .unwrap();
        mem.page_free(ppn); // the mapping keeps the frame alive
        assert_eq!(mem.refcount(ppn), 1);

        let (found, pte) = pgdir.lookup(&mut mem, va).unwrap();
        assert_eq!(found, ppn);
        assert!(pte.perm().contains(PtePerm::V | PtePerm::R | PtePerm::W | PtePerm::U));

        pgdir.remove(&mut mem, &mut mmu, va);
        assert!(pgdir.lookup(&mut mem, va).is_none());
        assert!(mem.is_free(ppn));
    }

    #[test]
    fn reinsert_same_frame_keeps_refcount() {
        let (mut mem, mut mmu, pgdir) = fresh();
        let va = VirtAddr(0x1000);
        let ppn = mem.page_alloc(true).unwrap();
        pgdir
            .insert(&mut mem, &mut mmu, ppn, va, PtePerm::R | PtePerm::U)
            .unwrap();
        mem.page_free(ppn);
        assert_eq!(mem.refcount(ppn), 1);

        pgdir
            .insert(&mut mem, &mut mmu, ppn, va, PtePerm::R | PtePerm::W | PtePerm::U)
            .unwrap();
        assert_eq!(mem.refcount(ppn), 1);
        let (_, pte) = pgdir.lookup(&mut mem, va).unwrap();
        assert!(pte.perm().contains(PtePerm::W));
    }

    #[test]
    fn insert_replaces_old_mapping() {
        let (mut mem, mut mmu, pgdir) = fresh();
        let va = VirtAddr(0x2000);
        let a = mem.page_alloc(true).unwrap();
        let b = mem.page_alloc(true).unwrap();
        pgdir.insert(&mut mem, &mut mmu, a, va, PtePerm::R | PtePerm::U).unwrap();
        mem.page_free(a);
        pgdir.insert(&mut mem, &mut mmu, b, va, PtePerm::R | PtePerm::U).unwrap();
        mem.page_free(b);
        // The replaced frame went back to the free list, the new one is
        // held by the mapping alone.
        assert!(mem.is_free(a));
        assert_eq!(mem.refcount(b), 1);
        assert_eq!(pgdir.lookup(&mut mem, va).unwrap().0, b);
    }

    #[test]
    fn mapping_refcounts_balance() {
        let (mut mem, mut mmu, pgdir) = fresh();
        let ppn = mem.page_alloc(true).unwrap();
        for i in 0..4u32 {
            pgdir
                .insert(&mut mem, &mut mmu, ppn, VirtAddr(i * PGSIZE), PtePerm::R | PtePerm::U)
                .unwrap();
        }
        mem.page_free(ppn);
        assert_eq!(mem.refcount(ppn), 4);
        for i in 0..4u32 {
            pgdir.remove(&mut mem, &mut mmu, VirtAddr(i * PGSIZE));
        }
        assert!(mem.is_free(ppn));
    }

    #[test]
    fn fault_handler_allocates_zeroed_frame() {
        let (mut mem, mut mmu, pgdir) = fresh();
        let va = VirtAddr(USTACKTOP - PGSIZE - 4);
        let pa = handle_page_fault(&mut mem, &mut mmu, va, AccessIntent::Write, true).unwrap();
        let (ppn, pte) = pgdir.lookup(&mut mem, va).unwrap();
        assert_eq!(mem.refcount(ppn), 1);
        assert!(pte
            .perm()
            .contains(PtePerm::V | PtePerm::R | PtePerm::W | PtePerm::U | PtePerm::D));
        assert_eq!(pa, ppn.pa() + va.page_offset());
        assert_eq!(mem.read_u32(ppn.pa()), 0);
    }

    #[test]
    fn fault_in_reserved_region_kills_user() {
        let (mut mem, mut mmu, _) = fresh();
        let res = handle_page_fault(&mut mem, &mut mmu, VirtAddr(UTOP + 8), AccessIntent::Read, true);
        assert!(res.is_err());
    }

    #[test]
    fn shared_registry_returns_same_frame() {
        let (mut mem, _, _) = fresh();
        let mut reg = SharedRegistry::new();
        let a = reg.get_or_create(&mut mem, 1).unwrap();
        let b = reg.get_or_create(&mut mem, 1).unwrap();
        assert_eq!(a, b);
        assert_eq!(mem.refcount(a), 1);
        let c = reg.get_or_create(&mut mem, 2).unwrap();
        assert_ne!(a, c);
    }
}
