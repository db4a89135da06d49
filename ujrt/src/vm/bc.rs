//! The bytecode format.
//!
//! An instruction is one 32 bit word laid out as `op:8 | a:8 | c:8 | b:8` (low to high). The
//! upper 16 bits can alternatively be read as a single `d` operand. Jump offsets are stored in `d`
//! biased by [BCBIAS_J] and are relative to the instruction following the jump.
//!
//! Calls use two slots per frame: for `CALL A ...` the callee is in slot `A`, slot `A+1` receives
//! the frame link and arguments start at slot `A+2`, which becomes the callee's base. Results are
//! written back starting at slot `A`.

use std::{cell::Cell, fmt, ptr::NonNull};
use strum::{Display, EnumCount, FromRepr};

use crate::vm::{
    heap::Heap,
    obj::{KGc, Proto},
    value::GcPtr,
};

/// The bias of jump offsets stored in the `d` operand.
pub const BCBIAS_J: u32 = 0x8000;

/// Bytecode opcodes.
///
/// The order of opcodes matters: the `I*` (blacklisted) and `J*` (trace entry) variants of each
/// hot-counting instruction follow it immediately, so the variants can be computed arithmetically.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Display, EnumCount, FromRepr, PartialEq, Eq, Hash)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Op {
    // Comparisons, each followed by a `JMP` taken if the comparison holds.
    IsLt,
    IsGe,
    IsLe,
    IsGt,
    IsEqV,
    IsNeV,
    IsEqS,
    IsNeS,
    IsEqN,
    IsNeN,
    IsEqP,
    IsNeP,
    // Truthiness tests of slot `D`, followed by a `JMP`.
    IsT,
    IsF,
    // Unary operations `A = op D`.
    Mov,
    Not,
    Unm,
    Len,
    // Binary arithmetic. `VN`: `A = B op num[C]`, `NV`: `A = num[C] op B`, `VV`: `A = B op C`.
    AddVN,
    SubVN,
    MulVN,
    DivVN,
    ModVN,
    AddNV,
    SubNV,
    MulNV,
    DivNV,
    ModNV,
    AddVV,
    SubVV,
    MulVV,
    DivVV,
    ModVV,
    Pow,
    Cat,
    // Constants.
    KStr,
    KShort,
    KNum,
    KPri,
    KNil,
    // Globals: `A = G[str[D]]` and `G[str[D]] = A`.
    GGet,
    GSet,
    // Tables.
    TNew,
    TGetV,
    TGetS,
    TGetB,
    TSetV,
    TSetS,
    TSetB,
    // Closures: `A = closure(proto[D])`.
    FNew,
    // Calls.
    CallM,
    Call,
    CallT,
    IterC,
    Varg,
    // Returns.
    RetM,
    Ret,
    Ret0,
    Ret1,
    // Loops and branches.
    ForI,
    ForL,
    IForL,
    JForL,
    IterL,
    IIterL,
    JIterL,
    Loop,
    ILoop,
    JLoop,
    Jmp,
    // Function headers.
    FuncF,
    IFuncF,
    JFuncF,
    FuncV,
}

impl Op {
    /// Is this one of the comparison instructions which must be followed by a `JMP`?
    pub fn is_comparison(self) -> bool {
        (self as u8) <= (Op::IsF as u8)
    }

    pub fn is_ret(self) -> bool {
        matches!(self, Op::RetM | Op::Ret | Op::Ret0 | Op::Ret1)
    }

    /// The blacklisted (never hot counted) variant of a hot-counting instruction.
    pub fn blacklisted(self) -> Option<Op> {
        match self {
            Op::ForL | Op::JForL => Some(Op::IForL),
            Op::IterL | Op::JIterL => Some(Op::IIterL),
            Op::Loop | Op::JLoop => Some(Op::ILoop),
            Op::FuncF | Op::JFuncF => Some(Op::IFuncF),
            _ => None,
        }
    }

    /// The trace-entry variant of a hot-counting instruction.
    pub fn jit_variant(self) -> Option<Op> {
        match self {
            Op::ForL => Some(Op::JForL),
            Op::IterL => Some(Op::JIterL),
            Op::Loop => Some(Op::JLoop),
            Op::FuncF => Some(Op::JFuncF),
            _ => None,
        }
    }
}

/// A single bytecode instruction.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BcIns(pub u32);

impl BcIns {
    pub fn abc(op: Op, a: u8, b: u8, c: u8) -> Self {
        BcIns(op as u32 | (a as u32) << 8 | (c as u32) << 16 | (b as u32) << 24)
    }

    pub fn ad(op: Op, a: u8, d: u16) -> Self {
        BcIns(op as u32 | (a as u32) << 8 | (d as u32) << 16)
    }

    /// Create a jump-style instruction with the (unbiased) offset `j`.
    pub fn aj(op: Op, a: u8, j: i32) -> Self {
        BcIns::ad(op, a, (j + BCBIAS_J as i32) as u16)
    }

    /// Return this instruction's opcode.
    ///
    /// # Panics
    ///
    /// If the opcode byte is not a valid [Op].
    pub fn op(self) -> Op {
        let b = (self.0 & 0xff) as u8;
        Op::from_repr(b).unwrap_or_else(|| panic!("invalid opcode {b:#x}"))
    }

    pub fn a(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn b(self) -> u8 {
        (self.0 >> 24) as u8
    }

    pub fn c(self) -> u8 {
        (self.0 >> 16) as u8
    }

    pub fn d(self) -> u16 {
        (self.0 >> 16) as u16
    }

    /// The jump offset of this instruction.
    pub fn j(self) -> i32 {
        self.d() as i32 - BCBIAS_J as i32
    }

    /// Return a copy of this instruction with the opcode replaced by `op`.
    pub fn with_op(self, op: Op) -> Self {
        BcIns((self.0 & !0xff) | op as u32)
    }

    /// Return a copy of this instruction with the `d` operand replaced by `d`.
    pub fn with_d(self, d: u16) -> Self {
        BcIns((self.0 & 0xffff) | (d as u32) << 16)
    }
}

impl fmt::Debug for BcIns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match Op::from_repr((self.0 & 0xff) as u8) {
            Some(op) => write!(f, "{op} {} {} {} (d={})", self.a(), self.b(), self.c(), self.d()),
            None => write!(f, "<invalid {:#x}>", self.0),
        }
    }
}

/// A pointer to an instruction inside a [Proto]'s bytecode.
///
/// Instructions are stored in [Cell]s since the JIT patches hot-counting instructions in place.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pc(NonNull<Cell<BcIns>>);

impl Pc {
    pub(crate) fn new(p: &Cell<BcIns>) -> Self {
        Pc(NonNull::from(p))
    }

    pub(crate) fn from_addr(addr: usize) -> Option<Self> {
        NonNull::new(addr as *mut Cell<BcIns>).map(Pc)
    }

    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Read the instruction at this `Pc`.
    pub fn get(self) -> BcIns {
        unsafe { self.0.as_ref() }.get()
    }

    /// Patch the instruction at this `Pc`.
    pub fn set(self, ins: BcIns) {
        unsafe { self.0.as_ref() }.set(ins)
    }

    /// Return the `Pc` `n` instructions away. The caller must ensure the result stays within the
    /// same bytecode array.
    pub fn offset(self, n: isize) -> Pc {
        Pc(unsafe { NonNull::new_unchecked(self.0.as_ptr().offset(n)) })
    }

    pub fn next(self) -> Pc {
        self.offset(1)
    }

    pub fn prev(self) -> Pc {
        self.offset(-1)
    }

    /// The target of the jump instruction at this `Pc`.
    pub fn jump_target(self) -> Pc {
        self.offset(1 + self.get().j() as isize)
    }

    /// The distance, in instructions, from `other` to `self`.
    pub fn diff(self, other: Pc) -> isize {
        (self.addr() as isize - other.addr() as isize) / std::mem::size_of::<BcIns>() as isize
    }
}

impl fmt::Debug for Pc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pc@{:#x}", self.addr())
    }
}

/// A forward jump waiting for its target.
#[derive(Debug)]
pub struct Fixup(usize);

/// Builds a [Proto] one instruction at a time. This is the only way to produce bytecode: there is
/// no parser.
pub struct ProtoBuilder {
    name: String,
    numparams: u8,
    framesize: u8,
    is_vararg: bool,
    bc: Vec<BcIns>,
    knum: Vec<f64>,
    kgc: Vec<KGc>,
}

impl ProtoBuilder {
    pub fn new(name: &str, numparams: u8, framesize: u8) -> Self {
        ProtoBuilder {
            name: name.to_owned(),
            numparams,
            framesize,
            is_vararg: false,
            bc: vec![BcIns::ad(Op::FuncF, framesize, 0)],
            knum: Vec::new(),
            kgc: Vec::new(),
        }
    }

    /// Mark the function as taking a variable number of arguments.
    pub fn vararg(mut self) -> Self {
        self.is_vararg = true;
        self.bc[0] = BcIns::ad(Op::FuncV, self.framesize, 0);
        self
    }

    /// The index the next emitted instruction will have.
    pub fn here(&self) -> usize {
        self.bc.len()
    }

    pub fn abc(&mut self, op: Op, a: u8, b: u8, c: u8) -> &mut Self {
        self.bc.push(BcIns::abc(op, a, b, c));
        self
    }

    pub fn ad(&mut self, op: Op, a: u8, d: u16) -> &mut Self {
        self.bc.push(BcIns::ad(op, a, d));
        self
    }

    /// Emit a jump-style instruction whose target will be provided later by [Self::patch_here].
    pub fn jmp_fwd(&mut self, op: Op, a: u8) -> Fixup {
        self.bc.push(BcIns::aj(op, a, 0));
        Fixup(self.bc.len() - 1)
    }

    /// Make the jump recorded in `fx` target the next instruction to be emitted.
    pub fn patch_here(&mut self, fx: Fixup) {
        let j = self.bc.len() as i32 - (fx.0 as i32 + 1);
        self.bc[fx.0] = self.bc[fx.0].with_d((j + BCBIAS_J as i32) as u16);
    }

    /// Emit a jump-style instruction targeting the instruction at index `target`.
    pub fn jmp_to(&mut self, op: Op, a: u8, target: usize) -> &mut Self {
        let j = target as i32 - (self.bc.len() as i32 + 1);
        self.bc.push(BcIns::aj(op, a, j));
        self
    }

    /// Intern a number constant, returning its index.
    pub fn knum(&mut self, n: f64) -> u16 {
        let bits = n.to_bits();
        if let Some(i) = self.knum.iter().position(|x| x.to_bits() == bits) {
            return i as u16;
        }
        self.knum.push(n);
        (self.knum.len() - 1) as u16
    }

    /// Intern a string constant, returning its index.
    pub fn kstr(&mut self, heap: &mut Heap, s: &str) -> u16 {
        let s = heap.intern(s);
        if let Some(i) = self
            .kgc
            .iter()
            .position(|x| matches!(x, KGc::Str(y) if *y == s))
        {
            return i as u16;
        }
        self.kgc.push(KGc::Str(s));
        (self.kgc.len() - 1) as u16
    }

    /// Add a child prototype, returning its index for use by `FNEW`.
    pub fn kproto(&mut self, p: GcPtr<Proto>) -> u16 {
        self.kgc.push(KGc::Proto(p));
        (self.kgc.len() - 1) as u16
    }

    pub fn finish(self, heap: &mut Heap) -> GcPtr<Proto> {
        heap.new_proto(Proto::new(
            self.name,
            self.numparams,
            self.framesize,
            self.is_vararg,
            self.bc,
            self.knum,
            self.kgc,
        ))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn operand_layout() {
        let i = BcIns::abc(Op::AddVV, 1, 2, 3);
        assert_eq!(i.op(), Op::AddVV);
        assert_eq!((i.a(), i.b(), i.c()), (1, 2, 3));
        assert_eq!(i.d(), 3 | 2 << 8);
        let j = BcIns::aj(Op::Jmp, 0, -5);
        assert_eq!(j.j(), -5);
        assert_eq!(j.with_op(Op::Loop).j(), -5);
    }

    #[test]
    fn variants() {
        assert_eq!(Op::ForL.jit_variant(), Some(Op::JForL));
        assert_eq!(Op::JForL.blacklisted(), Some(Op::IForL));
        assert!(Op::IsF.is_comparison());
        assert!(!Op::Mov.is_comparison());
    }

    #[test]
    fn forward_and_backward_jumps() {
        let mut heap = Heap::new();
        let mut b = ProtoBuilder::new("f", 0, 2);
        let top = b.here();
        let fx = b.jmp_fwd(Op::Jmp, 0);
        b.ad(Op::KPri, 0, 0);
        b.patch_here(fx);
        b.jmp_to(Op::Jmp, 0, top);
        let p = b.finish(&mut heap);
        let pc = p.pc_at(1);
        assert_eq!(pc.jump_target(), p.pc_at(3));
        assert_eq!(p.pc_at(3).jump_target(), p.pc_at(1));
    }
}
