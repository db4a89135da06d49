//! Hot counting and penalties for bytecode locations.
//!
//! A location is any hot-counting instruction (`FORL`, `ITERL`, `LOOP`, `FUNCF`). Locations don't
//! carry state of their own: counters live in a small hashed table keyed by the instruction's
//! address, so colliding locations share a counter. A location moves through the following
//! states:
//!
//! ```text
//!   Counting ──hot──▶ Recording ──ok──▶ Compiled (bytecode patched to a J-op)
//!      ▲                  │
//!      └──── penalty ─────┤
//!                         └── penalty exceeds PENALTY_MAX ──▶ Blacklisted (patched to an I-op)
//! ```

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{compile::TraceError, vm::bc::Pc};

/// The number of hot counters. Must be a power of two.
pub(crate) const HOTCOUNT_SIZE: usize = 64;

/// The number of penalty slots. Must be a power of two.
pub(crate) const PENALTY_SLOTS: usize = 64;
/// The starting penalty of a location.
pub(crate) const PENALTY_MIN: u16 = 36 * 2;
/// A location whose penalty exceeds this is blacklisted.
pub(crate) const PENALTY_MAX: u32 = 60000;
/// The number of random bits added to a doubled penalty.
const PENALTY_RNDBITS: u32 = 4;

/// The hashed hot counter table.
pub(crate) struct HotCounts {
    counts: [u16; HOTCOUNT_SIZE],
}

impl HotCounts {
    pub(crate) fn new(start: u16) -> Self {
        Self {
            counts: [start; HOTCOUNT_SIZE],
        }
    }

    fn idx(pc: Pc) -> usize {
        (pc.addr() >> 2) & (HOTCOUNT_SIZE - 1)
    }

    /// Reset every counter to `start`.
    pub(crate) fn reset(&mut self, start: u16) {
        self.counts = [start; HOTCOUNT_SIZE];
    }

    #[cfg(test)]
    pub(crate) fn get(&self, pc: Pc) -> u16 {
        self.counts[Self::idx(pc)]
    }

    pub(crate) fn set(&mut self, pc: Pc, v: u16) {
        self.counts[Self::idx(pc)] = v;
    }

    /// Decrement the counter of `pc` by `dec`. Returns `true` if the counter underflowed, in which
    /// case the location is hot; the counter is then left at its wrapped value and the caller is
    /// expected to reset it.
    pub(crate) fn count(&mut self, pc: Pc, dec: u16) -> bool {
        let c = &mut self.counts[Self::idx(pc)];
        let (v, underflow) = c.overflowing_sub(dec);
        *c = v;
        underflow
    }
}

/// One entry of the penalty cache.
#[derive(Clone, Copy, Debug)]
pub(crate) struct HotPenalty {
    /// The address of the penalised location (0 if the slot is free).
    pc: usize,
    val: u16,
    /// The reason of the most recent abort.
    reason: Option<TraceError>,
}

/// What should happen to a location after a failed trace attempt?
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Penalty {
    /// Try again after the hot counter, which must be set to this value, runs out.
    Retry(u16),
    /// Never try again.
    Blacklist,
}

/// A round-robin cache of recently penalised locations.
pub(crate) struct PenaltyCache {
    slots: [HotPenalty; PENALTY_SLOTS],
    next: usize,
    rng: StdRng,
}

impl PenaltyCache {
    pub(crate) fn new() -> Self {
        Self {
            slots: [HotPenalty {
                pc: 0,
                val: 0,
                reason: None,
            }; PENALTY_SLOTS],
            next: 0,
            rng: StdRng::seed_from_u64(0x756a_7274),
        }
    }

    /// A small random number, used to desynchronise retries of colliding locations.
    pub(crate) fn random(&mut self, bits: u32) -> u16 {
        self.rng.gen_range(0..(1u16 << bits))
    }

    /// Penalise the location at `pc` for aborting with `reason`.
    pub(crate) fn penalize(&mut self, pc: Pc, reason: TraceError) -> Penalty {
        let addr = pc.addr();
        let val = match self.slots.iter().position(|x| x.pc == addr) {
            Some(i) => {
                let val = u32::from(self.slots[i].val) * 2 + u32::from(self.random(PENALTY_RNDBITS));
                if val > PENALTY_MAX {
                    self.slots[i].pc = 0;
                    return Penalty::Blacklist;
                }
                self.slots[i].val = val as u16;
                self.slots[i].reason = Some(reason);
                val as u16
            }
            None => {
                let i = self.next;
                self.next = (i + 1) & (PENALTY_SLOTS - 1);
                self.slots[i] = HotPenalty {
                    pc: addr,
                    val: PENALTY_MIN,
                    reason: Some(reason),
                };
                PENALTY_MIN
            }
        };
        Penalty::Retry(val)
    }

    /// The current penalty of the location at `pc`, if it has one.
    pub(crate) fn get(&self, pc: Pc) -> Option<(u16, TraceError)> {
        self.slots
            .iter()
            .find(|x| x.pc == pc.addr())
            .and_then(|x| x.reason.clone().map(|r| (x.val, r)))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::Cell;
    use crate::vm::bc::{BcIns, Op};

    #[test]
    fn counting() {
        let ins = [Cell::new(BcIns::ad(Op::Loop, 0, 0))];
        let pc = Pc::new(&ins[0]);
        let mut hc = HotCounts::new(5);
        assert!(!hc.count(pc, 2));
        assert!(!hc.count(pc, 2));
        assert_eq!(hc.get(pc), 1);
        assert!(hc.count(pc, 2));
        hc.reset(5);
        assert_eq!(hc.get(pc), 5);
    }

    #[test]
    fn penalties_escalate_to_blacklist() {
        let ins = [Cell::new(BcIns::ad(Op::Loop, 0, 0))];
        let pc = Pc::new(&ins[0]);
        let mut pcache = PenaltyCache::new();
        assert_eq!(
            pcache.penalize(pc, TraceError::LoopUnroll),
            Penalty::Retry(PENALTY_MIN)
        );
        let mut prev = u32::from(PENALTY_MIN);
        let mut n = 1;
        loop {
            match pcache.penalize(pc, TraceError::LoopUnroll) {
                Penalty::Retry(v) => {
                    assert!(u32::from(v) >= prev * 2 && u32::from(v) < prev * 2 + 16);
                    prev = u32::from(v);
                }
                Penalty::Blacklist => break,
            }
            n += 1;
        }
        // 72 doubles past 60000 in ten steps.
        assert_eq!(n, 10);
        assert!(pcache.get(pc).is_none());
    }
}
