//! Registers and the bookkeeping of the backwards register allocator.
//!
//! The allocator itself is driven by the assembler (see [super::lower]): it walks the trace from
//! the last instruction to the first, allocating a register for a value the first time it sees a
//! use of it and freeing the register again once it reaches the value's definition. This module
//! only knows which register holds which value: emitting the spill stores and reloads that
//! eviction implies is the assembler's job.

use iced_x86::Register;
use strum::{EnumCount, FromRepr};

use crate::compile::jit_ir::InstIdx;

#[derive(Clone, Copy, Debug, EnumCount, FromRepr, PartialEq, Eq, Hash)]
// The values of the general purpose registers are their hardware encodings; `Reg::hw` relies on
// that.
#[repr(u8)]
pub(crate) enum Reg {
    RAX = 0,
    RCX,
    RDX,
    RBX,
    RSP,
    RBP,
    RSI,
    RDI,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,

    XMM0,
    XMM1,
    XMM2,
    XMM3,
    XMM4,
    XMM5,
    XMM6,
    XMM7,
    XMM8,
    XMM9,
    XMM10,
    XMM11,
    XMM12,
    XMM13,
    XMM14,
    XMM15,
}

/// Holds the base of the frame the trace is currently executing in.
pub(crate) const BASE: Reg = Reg::R14;
/// Holds the [crate::compile::exit::JitContext].
pub(crate) const CTX: Reg = Reg::R15;
/// Never allocated: used for immediates and addresses within a single instruction sequence.
pub(crate) const SCRATCH: Reg = Reg::R11;
pub(crate) const FSCRATCH: Reg = Reg::XMM15;

/// The System V argument registers.
pub(crate) const GP_ARGS: [Reg; 6] = [Reg::RDI, Reg::RSI, Reg::RDX, Reg::RCX, Reg::R8, Reg::R9];
pub(crate) const FP_ARGS: [Reg; 8] = [
    Reg::XMM0,
    Reg::XMM1,
    Reg::XMM2,
    Reg::XMM3,
    Reg::XMM4,
    Reg::XMM5,
    Reg::XMM6,
    Reg::XMM7,
];

impl Reg {
    pub(crate) fn is_fp(self) -> bool {
        (self as u8) >= (Reg::XMM0 as u8)
    }

    pub(crate) fn is_gp(self) -> bool {
        !self.is_fp()
    }

    /// The number of this register within its class: the hardware encoding for general purpose
    /// registers, `n` for `XMMn`.
    pub(crate) fn hw(self) -> usize {
        if self.is_fp() {
            usize::from(self as u8 - Reg::XMM0 as u8)
        } else {
            usize::from(self as u8)
        }
    }

    pub(crate) fn gp(n: usize) -> Reg {
        assert!(n < 16);
        Reg::from_repr(n as u8).unwrap()
    }

    pub(crate) fn fp(n: usize) -> Reg {
        assert!(n < 16);
        Reg::from_repr(Reg::XMM0 as u8 + n as u8).unwrap()
    }

    pub(crate) fn to_reg32(self) -> Register {
        match self {
            Reg::RAX => Register::EAX,
            Reg::RCX => Register::ECX,
            Reg::RDX => Register::EDX,
            Reg::RBX => Register::EBX,
            Reg::RSP => Register::ESP,
            Reg::RBP => Register::EBP,
            Reg::RSI => Register::ESI,
            Reg::RDI => Register::EDI,
            Reg::R8 => Register::R8D,
            Reg::R9 => Register::R9D,
            Reg::R10 => Register::R10D,
            Reg::R11 => Register::R11D,
            Reg::R12 => Register::R12D,
            Reg::R13 => Register::R13D,
            Reg::R14 => Register::R14D,
            Reg::R15 => Register::R15D,
            x => unreachable!("{x:?}"),
        }
    }

    pub(crate) fn to_reg64(self) -> Register {
        match self {
            Reg::RAX => Register::RAX,
            Reg::RCX => Register::RCX,
            Reg::RDX => Register::RDX,
            Reg::RBX => Register::RBX,
            Reg::RSP => Register::RSP,
            Reg::RBP => Register::RBP,
            Reg::RSI => Register::RSI,
            Reg::RDI => Register::RDI,
            Reg::R8 => Register::R8,
            Reg::R9 => Register::R9,
            Reg::R10 => Register::R10,
            Reg::R11 => Register::R11,
            Reg::R12 => Register::R12,
            Reg::R13 => Register::R13,
            Reg::R14 => Register::R14,
            Reg::R15 => Register::R15,
            x => unreachable!("{x:?}"),
        }
    }

    pub(crate) fn to_xmm(self) -> Register {
        match self {
            Reg::XMM0 => Register::XMM0,
            Reg::XMM1 => Register::XMM1,
            Reg::XMM2 => Register::XMM2,
            Reg::XMM3 => Register::XMM3,
            Reg::XMM4 => Register::XMM4,
            Reg::XMM5 => Register::XMM5,
            Reg::XMM6 => Register::XMM6,
            Reg::XMM7 => Register::XMM7,
            Reg::XMM8 => Register::XMM8,
            Reg::XMM9 => Register::XMM9,
            Reg::XMM10 => Register::XMM10,
            Reg::XMM11 => Register::XMM11,
            Reg::XMM12 => Register::XMM12,
            Reg::XMM13 => Register::XMM13,
            Reg::XMM14 => Register::XMM14,
            Reg::XMM15 => Register::XMM15,
            x => unreachable!("{x:?}"),
        }
    }
}

/// A set of [Reg]s.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct RegSet(u32);

impl RegSet {
    pub(crate) const fn empty() -> Self {
        RegSet(0)
    }

    pub(crate) const fn of(regs: &[Reg]) -> Self {
        let mut bits = 0;
        let mut i = 0;
        while i < regs.len() {
            bits |= 1 << regs[i] as u8;
            i += 1;
        }
        RegSet(bits)
    }

    pub(crate) fn contains(self, r: Reg) -> bool {
        self.0 & (1 << r as u8) != 0
    }

    pub(crate) fn with(self, r: Reg) -> Self {
        RegSet(self.0 | (1 << r as u8))
    }

    pub(crate) fn without(self, r: Reg) -> Self {
        RegSet(self.0 & !(1 << r as u8))
    }

    pub(crate) fn union(self, other: RegSet) -> Self {
        RegSet(self.0 | other.0)
    }

    pub(crate) fn intersect(self, other: RegSet) -> Self {
        RegSet(self.0 & other.0)
    }

    pub(crate) fn minus(self, other: RegSet) -> Self {
        RegSet(self.0 & !other.0)
    }

    /// The lowest numbered register in the set.
    pub(crate) fn first(self) -> Option<Reg> {
        if self.0 == 0 {
            None
        } else {
            Reg::from_repr(self.0.trailing_zeros() as u8)
        }
    }

    pub(crate) fn iter(self) -> impl Iterator<Item = Reg> {
        (0..Reg::COUNT as u8)
            .filter(move |i| self.0 & (1 << i) != 0)
            .filter_map(Reg::from_repr)
    }
}

/// The general purpose registers values can be allocated to.
pub(crate) const GP_ALLOC: RegSet = RegSet::of(&[
    Reg::RAX,
    Reg::RCX,
    Reg::RDX,
    Reg::RBX,
    Reg::RBP,
    Reg::RSI,
    Reg::RDI,
    Reg::R8,
    Reg::R9,
    Reg::R10,
    Reg::R12,
    Reg::R13,
]);

/// The floating point registers values can be allocated to.
pub(crate) const FP_ALLOC: RegSet = RegSet::of(&[
    Reg::XMM0,
    Reg::XMM1,
    Reg::XMM2,
    Reg::XMM3,
    Reg::XMM4,
    Reg::XMM5,
    Reg::XMM6,
    Reg::XMM7,
    Reg::XMM8,
    Reg::XMM9,
    Reg::XMM10,
    Reg::XMM11,
    Reg::XMM12,
    Reg::XMM13,
    Reg::XMM14,
]);

/// The registers a call-out may clobber.
pub(crate) const CALLER_SAVED: RegSet = RegSet::of(&[
    Reg::RAX,
    Reg::RCX,
    Reg::RDX,
    Reg::RSI,
    Reg::RDI,
    Reg::R8,
    Reg::R9,
    Reg::R10,
    Reg::R11,
    Reg::XMM0,
    Reg::XMM1,
    Reg::XMM2,
    Reg::XMM3,
    Reg::XMM4,
    Reg::XMM5,
    Reg::XMM6,
    Reg::XMM7,
    Reg::XMM8,
    Reg::XMM9,
    Reg::XMM10,
    Reg::XMM11,
    Reg::XMM12,
    Reg::XMM13,
    Reg::XMM14,
    Reg::XMM15,
]);

/// Where a value lives.
///
/// During assembly `reg` is the register currently holding the value (if any). Once the
/// assembler has passed a value's definition, `reg` is the register the definition wrote, and
/// `spill` the slot it was additionally stored to. Exits read a value from its spill slot if it
/// has one, since a spilled value's register may be reused after its definition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct RegSp {
    pub(crate) reg: Option<Reg>,
    pub(crate) spill: Option<u16>,
}

/// Which instruction occupies each register.
pub(crate) struct RegState {
    occupant: [Option<InstIdx>; Reg::COUNT],
    free: RegSet,
    /// Registers which may not be evicted while the current instruction is assembled.
    blocked: RegSet,
}

impl RegState {
    pub(crate) fn new() -> Self {
        RegState {
            occupant: [None; Reg::COUNT],
            free: GP_ALLOC.union(FP_ALLOC),
            blocked: RegSet::empty(),
        }
    }

    pub(crate) fn occupant(&self, r: Reg) -> Option<InstIdx> {
        self.occupant[r as usize]
    }

    #[cfg(test)]
    pub(crate) fn is_free(&self, r: Reg) -> bool {
        self.free.contains(r)
    }

    /// The registers currently holding values.
    pub(crate) fn used(&self) -> RegSet {
        GP_ALLOC.union(FP_ALLOC).minus(self.free)
    }

    pub(crate) fn take(&mut self, r: Reg, i: InstIdx) {
        debug_assert!(self.free.contains(r), "{r:?} is not free");
        self.free = self.free.without(r);
        self.occupant[r as usize] = Some(i);
    }

    pub(crate) fn release(&mut self, r: Reg) {
        self.free = self.free.with(r);
        self.occupant[r as usize] = None;
    }

    pub(crate) fn block(&mut self, r: Reg) {
        self.blocked = self.blocked.with(r);
    }

    pub(crate) fn unblock_all(&mut self) {
        self.blocked = RegSet::empty();
    }

    /// Pick a register of `class` for a value, avoiding `exclude`. A free register is preferred,
    /// `hint` first. Otherwise the register holding the earliest defined value is returned along
    /// with that value, which the caller must evict. Values defined earlier are used later, going
    /// backwards, and so are the cheapest to reload.
    pub(crate) fn pick(
        &self,
        class: RegSet,
        exclude: RegSet,
        hint: Option<Reg>,
    ) -> Option<(Reg, Option<InstIdx>)> {
        let cands = class.minus(exclude);
        if let Some(h) = hint {
            if cands.contains(h) && self.free.contains(h) {
                return Some((h, None));
            }
        }
        if let Some(r) = cands.intersect(self.free).first() {
            return Some((r, None));
        }
        cands
            .minus(self.blocked)
            .iter()
            .filter_map(|r| self.occupant[r as usize].map(|i| (r, i)))
            .min_by_key(|(_, i)| *i)
            .map(|(r, i)| (r, Some(i)))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encodings() {
        assert_eq!(Reg::R14.hw(), 14);
        assert_eq!(Reg::XMM3.hw(), 3);
        assert_eq!(Reg::gp(7), Reg::RDI);
        assert_eq!(Reg::fp(15), Reg::XMM15);
        assert!(Reg::XMM0.is_fp() && Reg::RAX.is_gp());
        assert_eq!(Reg::R11.to_reg64(), Register::R11);
        assert_eq!(Reg::XMM2.to_xmm(), Register::XMM2);
    }

    #[test]
    fn fixed_registers_are_never_allocated() {
        for r in [BASE, CTX, SCRATCH, FSCRATCH, Reg::RSP] {
            assert!(!GP_ALLOC.contains(r) && !FP_ALLOC.contains(r));
        }
        assert!(CALLER_SAVED.contains(SCRATCH));
        assert!(!CALLER_SAVED.contains(Reg::RBX));
        assert_eq!(GP_ALLOC.iter().count(), 12);
    }

    #[test]
    fn picking() {
        let mut rs = RegState::new();
        let (r, v) = rs.pick(GP_ALLOC, RegSet::empty(), None).unwrap();
        assert_eq!((r, v), (Reg::RAX, None));
        let (r, _) = rs.pick(GP_ALLOC, RegSet::empty(), Some(Reg::R12)).unwrap();
        assert_eq!(r, Reg::R12);
        // Fill every register: the earliest defined value is evicted first.
        for (n, r) in GP_ALLOC.iter().enumerate() {
            rs.take(r, InstIdx::from_usize(20 - n));
        }
        let (r, v) = rs.pick(GP_ALLOC, RegSet::empty(), None).unwrap();
        assert_eq!((r, v), (Reg::R13, Some(InstIdx::from_usize(9))));
        rs.block(Reg::R13);
        let (r, _) = rs.pick(GP_ALLOC, RegSet::empty(), None).unwrap();
        assert_eq!(r, Reg::R12);
        rs.unblock_all();
        rs.release(Reg::RCX);
        assert!(rs.is_free(Reg::RCX));
        assert_eq!(rs.occupant(Reg::RAX), Some(InstIdx::from_usize(20)));
        assert!(!rs.used().contains(Reg::RCX));
    }
}
