//! Device driver table and the banker's-algorithm resource arbiter.
//!
//! Each peripheral registers a driver with I/O callbacks and a claimable
//! capacity. Only devices with nonzero capacity take part in arbitration;
//! the rest expose their registers without claim bookkeeping. Claimants are
//! keyed by ASID through a small bounded table.
//!
//! A request is granted only if the system stays safe afterwards. The
//! safety pass walks a value copy of the state: the tentative grant is
//! charged against `available` and the claimant's `need`, and a claimant
//! found able to finish hands back its committed allocation. A request that
//! leaves no finishing order is rejected and the state reverts untouched.

use alloc::boxed::Box;

use log::{debug, trace, warn};

use crate::constants::*;
use crate::error::KernelError;
use crate::tlb::Asid;

/// Callbacks a peripheral provides. Register-only devices keep the no-op
/// defaults for the claim hooks.
pub trait DeviceDriver {
    fn name(&self) -> &'static str;

    /// Units the arbiter may hand out; zero keeps the device out of
    /// arbitration.
    fn capacity(&self) -> u32 {
        0
    }

    /// Called when the arbiter commits a grant of `n` units.
    fn require(&mut self, _n: u32) {}

    /// Called when `n` units are handed back.
    fn release(&mut self, _n: u32) {}

    fn read(&self) -> u32 {
        0
    }

    fn write(&mut self, _val: u32) {}

    fn write_byte(&mut self, b: u8) {
        self.write(b as u32);
    }

    fn write_by_num(&mut self, _idx: u32, _val: u8) -> Result<(), KernelError> {
        Err(KernelError::ResourceDenied)
    }

    fn read_by_num(&self, _idx: u32) -> Result<u8, KernelError> {
        Err(KernelError::ResourceDenied)
    }
}

/// 24 discrete LEDs behind one mask register; claimed as a single unit.
pub struct Led {
    mask: u32,
}

impl Led {
    pub fn new() -> Led {
        Led { mask: 0 }
    }
}

impl DeviceDriver for Led {
    fn name(&self) -> &'static str {
        "led"
    }

    fn capacity(&self) -> u32 {
        1
    }

    fn read(&self) -> u32 {
        self.mask
    }

    fn write(&mut self, val: u32) {
        self.mask = val & 0x00ff_ffff;
    }
}

/// Four seven-segment digits with per-digit value registers and an enable
/// mask. Digits are individually claimable.
pub struct SevenSeg {
    digits: [u8; 4],
    enable: u32,
}

impl SevenSeg {
    pub fn new() -> SevenSeg {
        SevenSeg {
            digits: [0; 4],
            enable: 0,
        }
    }
}

impl DeviceDriver for SevenSeg {
    fn name(&self) -> &'static str {
        "seven-seg"
    }

    fn capacity(&self) -> u32 {
        4
    }

    fn require(&mut self, _n: u32) {
        self.enable = 0xf;
    }

    fn release(&mut self, _n: u32) {
        // Released digits go blank.
        self.digits = [0; 4];
        self.enable = 0;
    }

    fn read(&self) -> u32 {
        u32::from_le_bytes(self.digits)
    }

    fn write(&mut self, val: u32) {
        self.digits = val.to_le_bytes();
    }

    fn write_by_num(&mut self, idx: u32, val: u8) -> Result<(), KernelError> {
        let slot = self
            .digits
            .get_mut(idx as usize)
            .ok_or(KernelError::ResourceDenied)?;
        *slot = val;
        Ok(())
    }

    fn read_by_num(&self, idx: u32) -> Result<u8, KernelError> {
        self.digits
            .get(idx as usize)
            .copied()
            .ok_or(KernelError::ResourceDenied)
    }
}

/// Buzzer frequency divisor; zero is silence.
pub struct Buzzer {
    divisor: u32,
}

impl Buzzer {
    pub fn new() -> Buzzer {
        Buzzer { divisor: 0 }
    }
}

impl DeviceDriver for Buzzer {
    fn name(&self) -> &'static str {
        "buzzer"
    }

    fn read(&self) -> u32 {
        self.divisor
    }

    fn write(&mut self, val: u32) {
        self.divisor = val;
    }
}

/// Switch bank input register. Writes model the physical toggles moving.
pub struct Switches {
    state: u32,
}

impl Switches {
    pub fn new() -> Switches {
        Switches { state: 0 }
    }
}

impl DeviceDriver for Switches {
    fn name(&self) -> &'static str {
        "switches"
    }

    fn read(&self) -> u32 {
        self.state
    }

    fn write(&mut self, val: u32) {
        self.state = val;
    }
}

/// Driver slots indexed by device number.
pub struct DeviceTable {
    slots: [Option<Box<dyn DeviceDriver>>; NDEV],
}

impl DeviceTable {
    pub(crate) fn new() -> DeviceTable {
        DeviceTable {
            slots: Default::default(),
        }
    }

    pub(crate) fn register(&mut self, dev: u32, driver: Box<dyn DeviceDriver>) {
        debug!("register device {} as {}", driver.name(), dev);
        self.slots[dev as usize] = Some(driver);
    }

    pub(crate) fn get(&self, dev: u32) -> Result<&dyn DeviceDriver, KernelError> {
        self.slots
            .get(dev as usize)
            .and_then(|s| s.as_deref())
            .ok_or(KernelError::DeviceUnregistered)
    }

    pub(crate) fn get_mut(&mut self, dev: u32) -> Result<&mut (dyn DeviceDriver + 'static), KernelError> {
        match self.slots.get_mut(dev as usize) {
            Some(Some(driver)) => Ok(driver.as_mut()),
            _ => Err(KernelError::DeviceUnregistered),
        }
    }
}

/// Arbiter state: per-device totals plus the classic banker vectors per
/// claimant slot.
pub struct Banker {
    total: [u32; NDEV],
    available: [u32; NDEV],
    max: [[u32; NDEV]; NCLAIMANTS],
    allocation: [[u32; NDEV]; NCLAIMANTS],
    need: [[u32; NDEV]; NCLAIMANTS],
    done: [bool; NCLAIMANTS],
    asid_of: [Option<Asid>; NCLAIMANTS],
}

impl Banker {
    pub(crate) fn new() -> Banker {
        Banker {
            total: [0; NDEV],
            available: [0; NDEV],
            max: [[0; NDEV]; NCLAIMANTS],
            allocation: [[0; NDEV]; NCLAIMANTS],
            need: [[0; NDEV]; NCLAIMANTS],
            done: [false; NCLAIMANTS],
            asid_of: [None; NCLAIMANTS],
        }
    }

    /// Called at driver registration time for claimable devices.
    pub(crate) fn register_resource(&mut self, dev: u32, capacity: u32) {
        self.total[dev as usize] = capacity;
        self.available[dev as usize] = capacity;
    }

    pub(crate) fn available(&self, dev: u32) -> u32 {
        self.available[dev as usize]
    }

    pub(crate) fn allocation_of(&self, asid: Asid, dev: u32) -> u32 {
        match self.find_slot(asid) {
            Some(k) => self.allocation[k][dev as usize],
            None => 0,
        }
    }

    fn find_slot(&self, asid: Asid) -> Option<usize> {
        self.asid_of.iter().position(|&a| a == Some(asid))
    }

    /// Find the caller's claimant slot, binding a fresh one on first
    /// contact.
    fn claimant_slot(&mut self, asid: Asid) -> Result<usize, KernelError> {
        if let Some(k) = self.find_slot(asid) {
            return Ok(k);
        }
        let k = self
            .asid_of
            .iter()
            .position(|a| a.is_none())
            .ok_or(KernelError::ResourceDenied)?;
        self.asid_of[k] = Some(asid);
        Ok(k)
    }

    /// Declare the caller's maximum demand per device. Resets any previous
    /// bookkeeping for the slot.
    pub(crate) fn claim(&mut self, asid: Asid, max: &[u32]) -> Result<(), KernelError> {
        let k = self.claimant_slot(asid)?;
        for dev in 0..NDEV {
            let m = max.get(dev).copied().unwrap_or(0);
            if m > self.total[dev] {
                return Err(KernelError::ResourceDenied);
            }
            self.max[k][dev] = m;
            self.allocation[k][dev] = 0;
            self.need[k][dev] = m;
        }
        self.done[k] = false;
        debug!("claim: asid {} bound to slot {}", asid.0, k);
        Ok(())
    }

    /// Grant `n` units of `dev` if the resulting state is safe; otherwise
    /// leave everything untouched.
    pub(crate) fn request(&mut self, asid: Asid, dev: u32, n: u32) -> Result<(), KernelError> {
        let dev = dev as usize;
        if dev >= NDEV || self.total[dev] == 0 {
            return Err(KernelError::ResourceDenied);
        }
        let k = self.claimant_slot(asid)?;
        if n > self.need[k][dev] || n > self.available[dev] {
            trace!(
                "request denied outright: n={} need={} available={}",
                n,
                self.need[k][dev],
                self.available[dev]
            );
            return Err(KernelError::ResourceDenied);
        }

        // Tentative copy: the grant is charged against available and need;
        // allocation stays the committed view the safety walk releases.
        let mut work = self.available;
        let mut need = self.need;
        let mut done = self.done;
        work[dev] -= n;
        need[k][dev] -= n;

        if !self.is_safe(&mut work, &need, &mut done) {
            warn!("request denied as unsafe: asid {} dev {} n {}", asid.0, dev, n);
            return Err(KernelError::ResourceDenied);
        }

        self.available[dev] -= n;
        self.allocation[k][dev] += n;
        self.need[k][dev] -= n;
        debug!("request granted: asid {} dev {} n {}", asid.0, dev, n);
        Ok(())
    }

    /// Dijkstra's check: repeatedly find a claimant whose remaining need
    /// fits in the work vector and let it finish, handing its allocation
    /// back. Safe iff everyone finishes.
    fn is_safe(
        &self,
        work: &mut [u32; NDEV],
        need: &[[u32; NDEV]; NCLAIMANTS],
        done: &mut [bool; NCLAIMANTS],
    ) -> bool {
        loop {
            let mut advanced = false;
            for k in 0..NCLAIMANTS {
                if done[k] || self.asid_of[k].is_none() {
                    continue;
                }
                if (0..NDEV).all(|d| need[k][d] <= work[d]) {
                    for d in 0..NDEV {
                        work[d] += self.allocation[k][d];
                    }
                    done[k] = true;
                    advanced = true;
                }
            }
            if !advanced {
                break;
            }
        }
        (0..NCLAIMANTS).all(|k| done[k] || self.asid_of[k].is_none())
    }

    /// Hand back `n` units of `dev`.
    pub(crate) fn release(&mut self, asid: Asid, dev: u32, n: u32) -> Result<(), KernelError> {
        let dev = dev as usize;
        if dev >= NDEV || self.total[dev] == 0 {
            return Err(KernelError::ResourceDenied);
        }
        let k = self.find_slot(asid).ok_or(KernelError::ResourceDenied)?;
        if n > self.allocation[k][dev] {
            return Err(KernelError::ResourceDenied);
        }
        self.allocation[k][dev] -= n;
        self.available[dev] += n;
        self.need[k][dev] += n;
        debug!("release: asid {} dev {} n {}", asid.0, dev, n);
        Ok(())
    }

    /// Drop the ASID binding. Outstanding allocations are not reclaimed;
    /// callers release explicitly before exit.
    pub(crate) fn task_exit(&mut self, asid: Asid) {
        if let Some(k) = self.find_slot(asid) {
            self.asid_of[k] = None;
        }
    }
}
