//! The kernel root: machine state plus every subsystem, wired together the
//! way the boot path brings them up.
//!
//! All mutation flows through `&mut Kernel`, which is what the handlers'
//! run-to-completion discipline amounts to in this rendition: a trap entry
//! cannot be reentered while a previous one is still borrowing the world.
//!
//! The public surface corresponds to the machine's entry points: the timer
//! tick, the trap dispatcher, simulated user loads and stores, syscalls,
//! and the boot-time program registry.

use alloc::vec::Vec;

use log::{info, warn};

use crate::arbiter::{Banker, Buzzer, DeviceDriver, DeviceTable, Led, SevenSeg, Switches};
use crate::console::Console;
use crate::constants::*;
use crate::elf;
use crate::env::{EnvId, EnvTable};
use crate::error::KernelError;
use crate::fs::FileRegistry;
use crate::pmap::{
    handle_page_fault, AccessIntent, FaultKind, PageDirectory, PhysAddr, PhysMem, PtePerm,
    SharedRegistry, VirtAddr,
};
use crate::sched::Scheduler;
use crate::syscall::{self, SyscallOutcome};
use crate::tlb::{Asid, Mmu, TlbLookup};
use crate::trap::Exception;

pub struct Kernel {
    pub(crate) mem: PhysMem,
    pub(crate) mmu: Mmu,
    pub(crate) envs: EnvTable,
    pub(crate) sched: Scheduler,
    pub(crate) shared: SharedRegistry,
    pub(crate) console: Console,
    pub(crate) devices: DeviceTable,
    pub(crate) banker: Banker,
    pub(crate) fs: FileRegistry,
    boot_pgdir: PageDirectory,
    staging_base: PhysAddr,
}

impl Kernel {
    /// Bring the machine up: detect memory, build the boot directory and
    /// the kernel window, seal the frame free list, and initialize every
    /// table. `maxpa` is the physical memory ceiling.
    pub fn boot(maxpa: u32) -> Kernel {
        let mut mem = PhysMem::new(maxpa);
        info!(
            "physical memory: {}K available, {} pages",
            maxpa / 1024,
            mem.npages()
        );

        // vm_init: boot directory plus the kernel-image window.
        let boot_pgdir = PageDirectory(mem.boot_alloc(PGSIZE, PGSIZE, true));
        boot_pgdir.boot_map_segment(
            &mut mem,
            VirtAddr(KERNBASE),
            KERN_IMAGE_END,
            PhysAddr(0),
            PtePerm::R | PtePerm::W,
        );

        // The loader scratch window sits at the top of DDR, off limits to
        // the frame allocator. Small configurations get a proportionally
        // smaller window rather than losing their frame pool.
        let scratch = core::cmp::min(MAX_FILE_SIZE, (maxpa - KERN_IMAGE_END) / 2);
        let staging_base = PhysAddr(round_down_u32(maxpa - scratch, PGSIZE));
        mem.reserve_top(staging_base.0);
        mem.page_init();

        let mut devices = DeviceTable::new();
        let mut banker = Banker::new();
        let led = Led::new();
        banker.register_resource(DEV_LED, led.capacity());
        devices.register(DEV_LED, alloc::boxed::Box::new(led));
        let seg = SevenSeg::new();
        banker.register_resource(DEV_SEG, seg.capacity());
        devices.register(DEV_SEG, alloc::boxed::Box::new(seg));
        devices.register(DEV_BUZZER, alloc::boxed::Box::new(Buzzer::new()));
        devices.register(DEV_SWITCH, alloc::boxed::Box::new(Switches::new()));

        Kernel {
            mmu: Mmu::new(boot_pgdir),
            mem,
            envs: EnvTable::new(),
            sched: Scheduler::new(),
            shared: SharedRegistry::new(),
            console: Console::new(),
            devices,
            banker,
            fs: FileRegistry::new(),
            boot_pgdir,
            staging_base,
        }
    }

    /// Register a program image under a name, as if it sat in the FAT
    /// filesystem.
    pub fn install_program(&mut self, name: &str, image: Vec<u8>) -> Result<(), KernelError> {
        self.fs.install(name, image)
    }

    // ----- environment creation ------------------------------------------

    /// Create an environment running `name` with default priority.
    pub fn env_create_default(&mut self, name: &str) -> Result<EnvId, KernelError> {
        self.create_env(name, 1, None, None)
    }

    /// Create an environment running `name` with the given priority and
    /// splice it onto the runnable ring.
    pub fn env_create(&mut self, name: &str, priority: u32) -> Result<EnvId, KernelError> {
        self.create_env(name, priority, None, None)
    }

    /// `env_create` with an argument planted in the argument registers.
    pub fn env_create_arg(
        &mut self,
        name: &str,
        priority: u32,
        arg: u32,
    ) -> Result<EnvId, KernelError> {
        self.create_env(name, priority, Some(arg), None)
    }

    /// `env_create` plus a shared-page attachment at the environment's bump
    /// pointer.
    pub fn env_create_share(
        &mut self,
        name: &str,
        key: u32,
        priority: u32,
    ) -> Result<EnvId, KernelError> {
        self.create_env(name, priority, None, Some(key))
    }

    fn create_env(
        &mut self,
        name: &str,
        priority: u32,
        arg: Option<u32>,
        share_key: Option<u32>,
    ) -> Result<EnvId, KernelError> {
        let parent = EnvId(0);
        let idx = match arg {
            Some(arg) => self
                .envs
                .env_alloc_arg(&mut self.mem, self.boot_pgdir, parent, arg)?,
            None => self.envs.env_alloc(&mut self.mem, self.boot_pgdir, parent)?,
        };
        self.envs.get_mut(idx).priority = priority.max(1);

        if let Err(err) = self.load_program(idx, name) {
            self.envs.abort_alloc(&mut self.mem, &mut self.mmu, idx);
            return Err(err);
        }
        if let Some(key) = share_key {
            if let Err(err) =
                self.envs
                    .attach_shared(&mut self.mem, &mut self.mmu, &mut self.shared, idx, key)
            {
                self.envs.abort_alloc(&mut self.mem, &mut self.mmu, idx);
                return Err(err);
            }
        }
        self.envs.append_runnable(idx);
        let id = self.envs.get(idx).id();
        info!("env_create: {} as {:#010x} priority {}", name, id.0, priority);
        Ok(id)
    }

    /// Thread creation: a new environment sharing the caller's user pages
    /// except for the stack region, entered at `func` with `arg` in the
    /// first argument register.
    pub fn pthread_create(&mut self, func: VirtAddr, arg: u32) -> Result<EnvId, KernelError> {
        let parent = self.envs.cur_idx().ok_or(KernelError::BadEnv)?;
        let parent_id = self.envs.get(parent).id();
        let idx = self
            .envs
            .env_alloc(&mut self.mem, self.boot_pgdir, parent_id)?;
        if let Err(err) = self
            .envs
            .copy_curenv(&mut self.mem, &mut self.mmu, idx, parent, func, arg)
        {
            self.envs.abort_alloc(&mut self.mem, &mut self.mmu, idx);
            return Err(err);
        }
        self.envs.append_runnable(idx);
        Ok(self.envs.get(idx).id())
    }

    /// Stage a file into the DDR scratch window and hand back its bytes.
    fn stage_into(
        mem: &mut PhysMem,
        fs: &mut FileRegistry,
        staging_base: PhysAddr,
        name: &str,
    ) -> Result<Vec<u8>, KernelError> {
        fs.mount();
        let mut file = fs.open(name)?;
        let size = file.size();
        if staging_base.0 + size > mem.maxpa() {
            return Err(KernelError::FileNotFound);
        }
        let mut off = 0u32;
        loop {
            let chunk = file.read_chunk();
            if chunk.is_empty() {
                break;
            }
            mem.write_bytes(staging_base + off, chunk);
            off += chunk.len() as u32;
        }
        info!("loaded {} bytes of {} at {:#010x}", size, name, staging_base.0);
        Ok(mem.read_range(staging_base, size as usize))
    }

    /// Map the initial stack, stage the ELF image, and install it into the
    /// target environment under a temporary context/ASID switch so
    /// fault-driven mappings land in the new space.
    fn load_program(&mut self, idx: usize, name: &str) -> Result<(), KernelError> {
        self.envs.map_initial_stack(&mut self.mem, &mut self.mmu, idx)?;

        let Kernel {
            mem,
            mmu,
            envs,
            fs,
            staging_base,
            ..
        } = self;
        let image = Self::stage_into(mem, fs, *staging_base, name)?;
        let pgdir = envs.get(idx).pgdir();
        let asid = envs.get(idx).id().asid();
        let staging = *staging_base;

        let loaded = mmu.with_address_space(pgdir, asid, |mmu| {
            let loaded = elf::load_image(mem, mmu, &image, 0)?;
            if loaded.needs_link {
                let mut resolve =
                    |mem: &mut PhysMem, mmu: &mut Mmu, lib: &str| -> Result<elf::DynLib, KernelError> {
                        let lib_image = Self::stage_into(mem, fs, staging, lib)?;
                        elf::load_library(mem, mmu, &lib_image)
                    };
                elf::link_dynamic(mem, mmu, &image, &mut resolve)?;
            }
            Ok(loaded)
        })?;

        envs.get_mut(idx)
            .trapframe_mut()
            .set_entry_point(loaded.entry);
        Ok(())
    }

    // ----- scheduling and teardown ---------------------------------------

    /// Timer tick: burn the running environment's slice and rotate the ring
    /// on expiry.
    pub fn tick(&mut self) {
        self.sched.tick(&mut self.envs, &mut self.mmu);
    }

    /// Voluntary yield with the slice forcibly expired.
    pub fn sched_yield(&mut self) {
        self.sched.sched_yield(&mut self.envs, &mut self.mmu);
    }

    /// Terminate the current environment; dispatches the ring's new head or
    /// leaves the machine idle.
    pub(crate) fn destroy_current(&mut self) {
        let cur = match self.envs.cur_idx() {
            Some(cur) => cur,
            None => return,
        };
        // The arbiter binding dies with the environment; outstanding
        // allocations are the caller's to release beforehand.
        self.banker.task_exit(self.envs.get(cur).id().asid());
        let outcome = self
            .envs
            .env_free(&mut self.mem, &mut self.mmu, cur)
            .expect("current env must be freeable");
        // The freed directory may be reused at once; fall back to the boot
        // directory until the next dispatch.
        self.mmu.set_context(self.boot_pgdir, Asid::KERNEL);
        self.sched.after_free(&mut self.envs, &mut self.mmu, outcome);
    }

    // ----- trap surface ---------------------------------------------------

    /// Hardware trap entry: decode the cause register and route.
    pub fn trap(&mut self, cause: u32, badvaddr: u32) {
        let exception = Exception::from_cause(cause);
        match exception {
            Exception::Interrupt => self.tick(),
            Exception::TlbLoadMiss => self.fault(badvaddr, AccessIntent::Read),
            Exception::TlbStoreMiss | Exception::TlbModified => {
                self.fault(badvaddr, AccessIntent::Write)
            }
            Exception::AddressErrorLoad | Exception::AddressErrorStore => {
                let (epc, status) = match self.envs.cur() {
                    Some(env) => (env.trapframe().cp0_epc, env.trapframe().cp0_status),
                    None => (0, 0),
                };
                warn!(
                    "address error: epc={:#010x} badvaddr={:#010x} status={:#010x}",
                    epc, badvaddr, status
                );
                self.destroy_current();
            }
            Exception::Syscall => {
                let (no, args) = match self.envs.cur() {
                    Some(env) => {
                        let tf = env.trapframe();
                        (
                            tf.regs[REG_V0],
                            [tf.regs[4], tf.regs[5], tf.regs[6], tf.regs[7]],
                        )
                    }
                    None => return,
                };
                match syscall::dispatch(self, no, args) {
                    SyscallOutcome::Ret(v) => {
                        if let Some(env) = self.envs.cur_mut() {
                            let tf = env.trapframe_mut();
                            tf.regs[REG_V0] = v;
                            tf.cp0_epc = tf.cp0_epc.wrapping_add(4);
                        }
                    }
                    SyscallOutcome::Exited | SyscallOutcome::Killed => {}
                }
            }
            Exception::ReservedInstruction | Exception::Other(_) => {
                let epc = self.envs.cur().map(|e| e.trapframe().cp0_epc).unwrap_or(0);
                warn!("{} at epc {:#010x}", exception.name(), epc);
                self.destroy_current();
            }
        }
    }

    fn fault(&mut self, badvaddr: u32, intent: AccessIntent) {
        let _ = self.service_fault(VirtAddr(badvaddr), intent);
    }

    /// Syscall entry used directly by harness code standing in for user
    /// text.
    pub fn syscall(&mut self, no: u32, args: [u32; 4]) -> SyscallOutcome {
        syscall::dispatch(self, no, args)
    }

    // ----- simulated user memory accesses ---------------------------------

    /// One user-mode access to `va`: TLB lookup, refill on miss, page fault
    /// on an absent mapping, then the retry the hardware would perform.
    /// Returns the physical address the access hits. On a fatal fault the
    /// environment is terminated.
    pub fn user_access(&mut self, va: u32, write: bool) -> Result<u32, KernelError> {
        if va >= ULIM {
            warn!("address error: user access to {:#010x}", va);
            self.destroy_current();
            return Err(KernelError::InvalidEnv);
        }
        let va = VirtAddr(va);
        let intent = if write {
            AccessIntent::Write
        } else {
            AccessIntent::Read
        };
        // Miss, refill, modified-fault, refill again: a handful of trips at
        // most.
        for _ in 0..8 {
            match self.mmu.lookup(va, write) {
                TlbLookup::Hit(pte) => {
                    return Ok((pte.addr() + va.page_offset()).0);
                }
                TlbLookup::Modified => {
                    if self.service_fault(va, AccessIntent::Write).is_err() {
                        return Err(KernelError::InvalidEnv);
                    }
                }
                TlbLookup::Miss => {
                    if self.mmu.refill(&mut self.mem, va) {
                        continue;
                    }
                    if self.service_fault(va, intent).is_err() {
                        return Err(KernelError::InvalidEnv);
                    }
                }
            }
        }
        Err(KernelError::InvalidEnv)
    }

    /// User-mode fault service. An unmappable access terminates the
    /// environment; running out of frames here is fatal, since the faulting
    /// instruction cannot be retried without one.
    fn service_fault(&mut self, va: VirtAddr, intent: AccessIntent) -> Result<(), ()> {
        match handle_page_fault(&mut self.mem, &mut self.mmu, va, intent, true) {
            Ok(_) => Ok(()), // the faulting instruction restarts
            Err(fault) => match fault.kind {
                FaultKind::Kill(reason) => {
                    warn!("fatal fault at {:#010x}: {}", fault.va.0, reason);
                    self.destroy_current();
                    Err(())
                }
                FaultKind::OutOfMemory => {
                    panic!("page fault at {:#010x}: out of memory", fault.va.0)
                }
            },
        }
    }

    pub fn user_load_u32(&mut self, va: u32) -> Result<u32, KernelError> {
        let pa = self.user_access(va, false)?;
        Ok(self.mem.read_u32(PhysAddr(pa)))
    }

    pub fn user_store_u32(&mut self, va: u32, val: u32) -> Result<(), KernelError> {
        let pa = self.user_access(va, true)?;
        self.mem.write_u32(PhysAddr(pa), val);
        Ok(())
    }

    // ----- inspection ----------------------------------------------------

    pub fn transcript(&self) -> &[u8] {
        self.console.transcript()
    }

    pub fn console_mut(&mut self) -> &mut Console {
        &mut self.console
    }

    pub fn envs(&self) -> &EnvTable {
        &self.envs
    }

    pub fn current_env(&self) -> Option<EnvId> {
        self.envs.cur().map(|e| e.id())
    }

    pub fn runnable_head(&self) -> Option<EnvId> {
        self.envs.runnable_head().map(|i| self.envs.get(i).id())
    }

    fn env_index(&self, id: EnvId) -> Option<usize> {
        self.envs.envid2env(id, false).ok()
    }

    /// Frame number mapped at `va` in the given environment, if any.
    pub fn frame_at(&self, id: EnvId, va: u32) -> Option<u32> {
        let idx = self.env_index(id)?;
        let pgdir = self.envs.get(idx).pgdir();
        pgdir.va2pa(&self.mem, VirtAddr(va)).map(|pa| pa.ppn().0)
    }

    pub fn frame_refcount(&self, ppn: u32) -> u16 {
        self.mem.refcount(crate::pmap::Ppn(ppn))
    }

    pub fn frame_is_free(&self, ppn: u32) -> bool {
        self.mem.is_free(crate::pmap::Ppn(ppn))
    }

    /// Kernel-side read of one word through an environment's page tables.
    pub fn read_u32_in(&self, id: EnvId, va: u32) -> Option<u32> {
        let idx = self.env_index(id)?;
        let pgdir = self.envs.get(idx).pgdir();
        let pa = pgdir.va2pa(&self.mem, VirtAddr(va))?;
        Some(self.mem.read_u32(pa))
    }

    pub fn heap_pc_of(&self, id: EnvId) -> Option<u32> {
        let idx = self.env_index(id)?;
        Some(self.envs.get(idx).heap_pc().0)
    }

    /// Attach the shared frame for `key` into an environment, returning the
    /// user address it landed at.
    pub fn attach_shared_to(&mut self, id: EnvId, key: u32) -> Result<u32, KernelError> {
        let idx = self.env_index(id).ok_or(KernelError::BadEnv)?;
        let va = self.envs.attach_shared(
            &mut self.mem,
            &mut self.mmu,
            &mut self.shared,
            idx,
            key,
        )?;
        Ok(va.0)
    }

    pub fn device_write(&mut self, dev: u32, val: u32) -> Result<(), KernelError> {
        self.devices.get_mut(dev)?.write(val);
        Ok(())
    }

    pub fn device_read(&self, dev: u32) -> Result<u32, KernelError> {
        Ok(self.devices.get(dev)?.read())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::consts::*;

    const TEST_MEM: u32 = 16 * 1024 * 1024;

    /// An image with a valid header and no loadable segments.
    fn headers_only_elf(entry: u32) -> Vec<u8> {
        let mut image = alloc::vec![0u8; 52];
        image[0] = 0x7f;
        image[1] = b'E';
        image[2] = b'L';
        image[3] = b'F';
        image[4] = 1;
        image[5] = 1;
        image[24..28].copy_from_slice(&entry.to_le_bytes());
        image[28..32].copy_from_slice(&52u32.to_le_bytes());
        image[42..44].copy_from_slice(&32u16.to_le_bytes());
        image
    }

    fn booted_with_env() -> Kernel {
        let mut kernel = Kernel::boot(TEST_MEM);
        kernel
            .install_program("init", headers_only_elf(0x0040_0000))
            .unwrap();
        kernel.env_create("init", 1).unwrap();
        kernel.trap(0, 0); // timer interrupt dispatches the ring head
        assert!(kernel.current_env().is_some());
        kernel
    }

    #[test]
    fn store_miss_trap_maps_a_frame() {
        let mut kernel = booted_with_env();
        let env = kernel.current_env().unwrap();
        let va = 0x0001_0000;
        assert!(kernel.frame_at(env, va).is_none());
        kernel.trap(3 << 2, va); // TLB store miss
        assert!(kernel.frame_at(env, va).is_some());
        // The same environment is still running; the instruction retries.
        assert_eq!(kernel.current_env(), Some(env));
    }

    #[test]
    fn syscall_trap_reads_the_frame_and_writes_v0() {
        let mut kernel = booted_with_env();
        kernel.console.push_input(b'z');
        {
            let cur = kernel.envs.cur_idx().unwrap();
            let tf = kernel.envs.get_mut(cur).trapframe_mut();
            tf.regs[REG_V0] = SYS_GETCHAR;
            tf.cp0_epc = 0x0040_0008;
        }
        kernel.trap(8 << 2, 0);
        let tf = kernel.envs.cur().unwrap().trapframe();
        assert_eq!(tf.regs[REG_V0], u32::from(b'z'));
        assert_eq!(tf.cp0_epc, 0x0040_000c);
    }

    #[test]
    fn illegal_instruction_trap_kills() {
        let mut kernel = booted_with_env();
        kernel.trap(10 << 2, 0);
        assert_eq!(kernel.current_env(), None);
        assert_eq!(kernel.runnable_head(), None);
    }

    #[test]
    fn address_error_trap_kills() {
        let mut kernel = booted_with_env();
        kernel.trap(4 << 2, 0x8000_0004);
        assert_eq!(kernel.current_env(), None);
    }

    #[test]
    fn modified_fault_on_the_clean_stack_page_sets_the_dirty_bit() {
        let mut kernel = booted_with_env();
        let env = kernel.current_env().unwrap();
        // The initial stack page is mapped writable but clean.
        let va = USTACKTOP - PGSIZE;
        let (_, pte_before) = {
            let idx = kernel.envs.cur_idx().unwrap();
            let pgdir = kernel.envs.get(idx).pgdir();
            pgdir.lookup(&mut kernel.mem, VirtAddr(va)).unwrap()
        };
        assert!(pte_before.perm().contains(PtePerm::W));
        assert!(!pte_before.perm().contains(PtePerm::D));

        kernel.trap(1 << 2, va); // modified fault on the first store
        let (_, pte_after) = {
            let idx = kernel.envs.cur_idx().unwrap();
            let pgdir = kernel.envs.get(idx).pgdir();
            pgdir.lookup(&mut kernel.mem, VirtAddr(va)).unwrap()
        };
        assert!(pte_after.perm().contains(PtePerm::D));
        assert_eq!(kernel.current_env(), Some(env));
    }
}
