//! Time-slice accounting over the runnable ring.
//!
//! Ring order is scheduling order: the timer tick burns the remaining
//! slice, and on expiry the cursor advances to the current environment's
//! successor and recharges from its priority. A voluntary yield is the same
//! path with the slice forced to zero.

use log::trace;

use crate::env::{EnvTable, FreeOutcome};
use crate::tlb::Mmu;

pub(crate) struct Scheduler {
    time_slice_remaining: u32,
}

impl Scheduler {
    pub(crate) fn new() -> Scheduler {
        Scheduler {
            time_slice_remaining: 0,
        }
    }

    /// Dispatch `idx` and recharge the slice from its priority.
    pub(crate) fn dispatch(&mut self, envs: &mut EnvTable, mmu: &mut Mmu, idx: usize) {
        self.time_slice_remaining = envs.get(idx).priority;
        envs.env_run(mmu, idx);
    }

    /// Timer tick. Returns true when a context switch happened.
    pub(crate) fn tick(&mut self, envs: &mut EnvTable, mmu: &mut Mmu) -> bool {
        let cur = match envs.cur_idx() {
            Some(cur) => cur,
            None => {
                // Nothing running; pick up the ring head if there is one.
                return match envs.runnable_head() {
                    Some(head) => {
                        self.dispatch(envs, mmu, head);
                        true
                    }
                    None => false,
                };
            }
        };

        if self.time_slice_remaining > 1 {
            self.time_slice_remaining -= 1;
            trace!("tick: {} slice(s) left", self.time_slice_remaining);
            return false;
        }
        self.advance(envs, mmu, cur)
    }

    /// Voluntary yield: the slice is forcibly expired.
    pub(crate) fn sched_yield(&mut self, envs: &mut EnvTable, mmu: &mut Mmu) -> bool {
        match envs.cur_idx() {
            Some(cur) => self.advance(envs, mmu, cur),
            None => match envs.runnable_head() {
                Some(head) => {
                    self.dispatch(envs, mmu, head);
                    true
                }
                None => false,
            },
        }
    }

    fn advance(&mut self, envs: &mut EnvTable, mmu: &mut Mmu, cur: usize) -> bool {
        let next = envs
            .link_of(cur)
            .or_else(|| envs.runnable_head())
            .expect("current env on an empty ring");
        self.dispatch(envs, mmu, next);
        true
    }

    /// After the current environment was freed: run the ring's new head, or
    /// idle with the timer cleared.
    pub(crate) fn after_free(
        &mut self,
        envs: &mut EnvTable,
        mmu: &mut Mmu,
        outcome: FreeOutcome,
    ) {
        self.time_slice_remaining = 0;
        if let FreeOutcome::Dispatch(next) = outcome {
            self.dispatch(envs, mmu, next);
        }
    }
}
