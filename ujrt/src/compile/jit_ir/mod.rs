//! The JIT IR.
//!
//! A trace is a linear sequence of [Inst]s in SSA form. Each instruction has an [Opcode], a result
//! type [Ty], a guard flag and up to two operands. An operand ([Opnd]) is either nothing, a small
//! literal (e.g. a stack slot number or a field identifier), or a reference ([Operand]) to an
//! earlier instruction or to an interned constant. Instructions and constants live in two
//! separate stores, so "is this a constant?" is answered by the [Operand] discriminant.
//!
//! Guards are ordinary instructions with [Inst::guard] set: if the condition they encode does not
//! hold at run-time, the trace exits through the most recent snapshot taken before the guard.
//!
//! Alongside the instructions, the IR keeps some side tables which are only meaningful before
//! assembly:
//!
//!   * a chain per opcode linking each instruction to the previous instruction with the same
//!     opcode, used by CSE;
//!   * the most recent instruction writing to each kind of memory (see [super::effects]), used to
//!     bound load CSE and store-to-load forwarding;
//!   * a byte of hints per instruction set by the optimisation passes.

use index_vec::IndexVec;
use indexmap::IndexSet;
use std::fmt;
use strum::{Display, EnumCount, FromRepr};

use super::{
    calls::CallId,
    effects::{Effects, EFFECT_BITS},
    CompilationError, TraceError,
};
use crate::{
    params::OptFlags,
    vm::{
        obj::{Str, FUNC_PROTO_OFF, STR_LEN_OFF, TAB_ARRAY_OFF, TAB_ASIZE_OFF, TAB_HSIZE_OFF, TAB_META_OFF},
        value::{Tag, TValue},
    },
};

mod fold;
mod well_formed;

index_vec::define_index_type! {
    /// The index of an instruction in a trace.
    pub(crate) struct InstIdx = u32;
}

index_vec::define_index_type! {
    /// The index of a constant in a trace's constant pool.
    pub(crate) struct ConstIdx = u32;
}

/// The type of an IR value.
///
/// `Nil`, `False` and `True` are types with exactly one value each: a typed load of a slot known
/// to hold `true` needs no payload.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Display, EnumCount, FromRepr, PartialEq, Eq, Hash)]
pub(crate) enum Ty {
    #[strum(serialize = "nil")]
    Nil,
    #[strum(serialize = "fal")]
    False,
    #[strum(serialize = "tru")]
    True,
    #[strum(serialize = "num")]
    Num,
    #[strum(serialize = "int")]
    Int,
    #[strum(serialize = "str")]
    Str,
    #[strum(serialize = "tab")]
    Tab,
    #[strum(serialize = "fun")]
    Func,
    #[strum(serialize = "ptr")]
    Ptr,
    #[strum(serialize = "---")]
    Void,
    /// An untyped 16 byte value, produced by loads which are only ever copied elsewhere.
    #[strum(serialize = "tv")]
    TValue,
}

impl Ty {
    pub(crate) fn from_tag(tag: Tag) -> Ty {
        match tag {
            Tag::Nil => Ty::Nil,
            Tag::False => Ty::False,
            Tag::True => Ty::True,
            Tag::Num => Ty::Num,
            Tag::Str => Ty::Str,
            Tag::Tab => Ty::Tab,
            Tag::Func => Ty::Func,
            Tag::FrameLua | Tag::FrameVarg | Tag::FrameC => Ty::Ptr,
        }
    }

    /// The tag values of this type have when stored in a [TValue], if they can be stored.
    pub(crate) fn tag(self) -> Option<Tag> {
        match self {
            Ty::Nil => Some(Tag::Nil),
            Ty::False => Some(Tag::False),
            Ty::True => Some(Tag::True),
            Ty::Num => Some(Tag::Num),
            Ty::Str => Some(Tag::Str),
            Ty::Tab => Some(Tag::Tab),
            Ty::Func => Some(Tag::Func),
            Ty::Int | Ty::Ptr | Ty::Void | Ty::TValue => None,
        }
    }

    /// Is this one of the primitive types with a single value?
    pub(crate) fn is_pri(self) -> bool {
        matches!(self, Ty::Nil | Ty::False | Ty::True)
    }

    /// Are values of this type held in floating point registers?
    pub(crate) fn is_fp(self) -> bool {
        self == Ty::Num
    }

    /// Are values of this type references to heap objects?
    pub(crate) fn is_gc(self) -> bool {
        matches!(self, Ty::Str | Ty::Tab | Ty::Func)
    }
}

/// A constant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum Const {
    /// The value of a primitive type.
    Pri(Ty),
    Int(i64),
    /// A number, stored as its bit pattern so that constants can be hashed.
    Num(u64),
    /// A reference to a heap object of the given type.
    Gc(Ty, usize),
    Ptr(usize),
    /// A frame link, as stored in the slot below a frame's base.
    Link(Tag, u64),
}

impl Const {
    pub(crate) fn ty(&self) -> Ty {
        match self {
            Const::Pri(ty) | Const::Gc(ty, _) => *ty,
            Const::Int(_) => Ty::Int,
            Const::Num(_) => Ty::Num,
            Const::Ptr(_) | Const::Link(..) => Ty::Ptr,
        }
    }

    pub(crate) fn as_num(&self) -> Option<f64> {
        match self {
            Const::Num(b) => Some(f64::from_bits(*b)),
            _ => None,
        }
    }

    pub(crate) fn as_int(&self) -> Option<i64> {
        match self {
            Const::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// The 64 bit payload of this constant as it would be held in a register.
    pub(crate) fn bits(&self) -> u64 {
        match self {
            Const::Pri(_) => 0,
            Const::Int(i) => *i as u64,
            Const::Num(b) | Const::Link(_, b) => *b,
            Const::Gc(_, p) | Const::Ptr(p) => *p as u64,
        }
    }

    /// This constant as a stack value, if it can be one.
    pub(crate) fn to_tvalue(&self) -> Option<TValue> {
        match self {
            Const::Link(tag, u) => Some(TValue::from_raw(*u, *tag)),
            Const::Int(i) => Some(TValue::num(*i as f64)),
            _ => self.ty().tag().map(|t| TValue::from_raw(self.bits(), t)),
        }
    }
}

/// A reference to a value: either an instruction or a constant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) enum Operand {
    Var(InstIdx),
    Const(ConstIdx),
}

impl Operand {
    pub(crate) fn is_const(self) -> bool {
        matches!(self, Operand::Const(_))
    }

    pub(crate) fn as_var(self) -> Option<InstIdx> {
        match self {
            Operand::Var(i) => Some(i),
            Operand::Const(_) => None,
        }
    }
}

/// An instruction operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum Opnd {
    None,
    Ref(Operand),
    Lit(u32),
}

impl Opnd {
    pub(crate) fn as_ref(self) -> Option<Operand> {
        match self {
            Opnd::Ref(x) => Some(x),
            _ => None,
        }
    }

    pub(crate) fn as_var(self) -> Option<InstIdx> {
        self.as_ref().and_then(Operand::as_var)
    }

    /// The literal of this operand.
    ///
    /// # Panics
    ///
    /// If this operand is not a literal.
    pub(crate) fn lit(self) -> u32 {
        match self {
            Opnd::Lit(x) => x,
            _ => panic!("operand {self:?} is not a literal"),
        }
    }
}

impl From<Operand> for Opnd {
    fn from(x: Operand) -> Self {
        Opnd::Ref(x)
    }
}

/// IR opcodes. The order of the comparison opcodes matters: [Opcode::invert] relies on it.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Display, EnumCount, FromRepr, PartialEq, Eq, Hash)]
#[strum(serialize_all = "UPPERCASE")]
pub(crate) enum Opcode {
    Nop,
    // Guarded comparisons. For numbers, the `U` variants are "unordered or ...", i.e. they also
    // hold if either operand is NaN; for integers they are unsigned comparisons.
    Lt,
    Ge,
    Le,
    Gt,
    Ult,
    Uge,
    Ule,
    Ugt,
    Eq,
    Ne,
    /// Array bounds check: `op2 < op1` (unsigned).
    Abc,
    /// Return to a lower frame: guard the frame link and shift the trace's base down.
    Retf,
    // Markers.
    Loop,
    Phi,
    /// A value inherited from the parent trace.
    PVal,
    // Arithmetic.
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    Abs,
    Min,
    Max,
    Fpmath,
    Conv,
    // Memory.
    SLoad,
    FLoad,
    Aref,
    Href,
    NewRef,
    ALoad,
    HLoad,
    AStore,
    HStore,
    // Allocation and calls.
    TNew,
    TBar,
    Call,
    CArg,
}

impl Opcode {
    /// Is this one of the guarded comparisons?
    pub(crate) fn is_comparison(self) -> bool {
        (self as u8) >= (Opcode::Lt as u8) && (self as u8) <= (Opcode::Ne as u8)
    }

    /// The comparison which holds exactly when `self` doesn't, for operands of type `ty`.
    pub(crate) fn invert(self, ty: Ty) -> Opcode {
        match (self, ty.is_fp()) {
            (Opcode::Eq, _) => Opcode::Ne,
            (Opcode::Ne, _) => Opcode::Eq,
            (Opcode::Lt, true) => Opcode::Uge,
            (Opcode::Ge, true) => Opcode::Ult,
            (Opcode::Le, true) => Opcode::Ugt,
            (Opcode::Gt, true) => Opcode::Ule,
            (Opcode::Ult, true) => Opcode::Ge,
            (Opcode::Uge, true) => Opcode::Lt,
            (Opcode::Ule, true) => Opcode::Gt,
            (Opcode::Ugt, true) => Opcode::Le,
            (Opcode::Lt, false) => Opcode::Ge,
            (Opcode::Ge, false) => Opcode::Lt,
            (Opcode::Le, false) => Opcode::Gt,
            (Opcode::Gt, false) => Opcode::Le,
            (Opcode::Ult, false) => Opcode::Uge,
            (Opcode::Uge, false) => Opcode::Ult,
            (Opcode::Ule, false) => Opcode::Ugt,
            (Opcode::Ugt, false) => Opcode::Ule,
            _ => panic!("{self} is not a comparison"),
        }
    }

    pub(crate) fn is_store(self) -> bool {
        matches!(self, Opcode::AStore | Opcode::HStore)
    }

    /// Must this instruction be kept even if its result is unused? Guards are also always kept,
    /// but that is a property of an [Inst], not of its opcode.
    pub(crate) fn has_side_effects(self) -> bool {
        matches!(
            self,
            Opcode::Retf
                | Opcode::Loop
                | Opcode::Phi
                | Opcode::NewRef
                | Opcode::AStore
                | Opcode::HStore
                | Opcode::TBar
        )
    }
}

/// The fields [Opcode::FLoad] can load.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Display, FromRepr, PartialEq, Eq)]
#[strum(serialize_all = "snake_case")]
pub(crate) enum Field {
    TabArray,
    TabAsize,
    TabMeta,
    TabHsize,
    StrLen,
    FuncProto,
}

impl Field {
    pub(crate) fn offset(self) -> i32 {
        match self {
            Field::TabArray => TAB_ARRAY_OFF,
            Field::TabAsize => TAB_ASIZE_OFF,
            Field::TabMeta => TAB_META_OFF,
            Field::TabHsize => TAB_HSIZE_OFF,
            Field::StrLen => STR_LEN_OFF,
            Field::FuncProto => FUNC_PROTO_OFF,
        }
    }

    pub(crate) fn ty(self) -> Ty {
        match self {
            Field::TabArray | Field::TabMeta | Field::FuncProto => Ty::Ptr,
            Field::TabAsize | Field::TabHsize | Field::StrLen => Ty::Int,
        }
    }
}

/// The operations of [Opcode::Fpmath].
#[repr(u8)]
#[derive(Clone, Copy, Debug, Display, FromRepr, PartialEq, Eq)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum FpMath {
    Floor,
    Ceil,
    Sqrt,
}

/// The conversions of [Opcode::Conv]. A guarded `NumToInt` checks that the conversion is exact.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Display, FromRepr, PartialEq, Eq)]
pub(crate) enum ConvKind {
    #[strum(serialize = "int.num")]
    IntToNum,
    #[strum(serialize = "num.int")]
    NumToInt,
}

/// [Opcode::SLoad] flags.
pub(crate) const SLOAD_TYPECHECK: u32 = 1;
/// The slot is never written on trace.
pub(crate) const SLOAD_READONLY: u32 = 2;

/// Instruction hints.
pub(crate) const HINT_SINK: u8 = 1;
pub(crate) const HINT_MOVTV: u8 = 2;
pub(crate) const HINT_KEEPGUARD: u8 = 4;
pub(crate) const HINT_PHI: u8 = 8;
/// A scratch mark for use within a single pass.
pub(crate) const HINT_MARK: u8 = 16;
/// An [Opcode::Abc] covering a loop's induction variable: loop optimisation may drop it from the
/// loop body if the array size is invariant.
pub(crate) const HINT_SCEV: u8 = 32;

/// An IR instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct Inst {
    pub(crate) op: Opcode,
    pub(crate) ty: Ty,
    pub(crate) guard: bool,
    pub(crate) a: Opnd,
    pub(crate) b: Opnd,
}

impl Inst {
    pub(crate) fn new(op: Opcode, ty: Ty, a: Opnd, b: Opnd) -> Self {
        Inst {
            op,
            ty,
            guard: false,
            a,
            b,
        }
    }

    pub(crate) fn guarded(op: Opcode, ty: Ty, a: Opnd, b: Opnd) -> Self {
        Inst {
            op,
            ty,
            guard: true,
            a,
            b,
        }
    }

    pub(crate) fn nop() -> Self {
        Inst::new(Opcode::Nop, Ty::Void, Opnd::None, Opnd::None)
    }

    /// The references this instruction makes to other values.
    pub(crate) fn refs(&self) -> impl Iterator<Item = Operand> {
        [self.a.as_ref(), self.b.as_ref()].into_iter().flatten()
    }

    /// The instructions this instruction refers to.
    pub(crate) fn vars(&self) -> impl Iterator<Item = InstIdx> {
        [self.a.as_var(), self.b.as_var()].into_iter().flatten()
    }

    /// Must this instruction be kept even if its result is unused?
    pub(crate) fn is_kept(&self) -> bool {
        self.guard || self.op.has_side_effects() || self.op == Opcode::Call && !self.call_id().is_pure()
    }

    /// The call-out of a [Opcode::Call].
    ///
    /// # Panics
    ///
    /// If `self` is not a call or carries an invalid call identifier.
    pub(crate) fn call_id(&self) -> CallId {
        assert_eq!(self.op, Opcode::Call);
        CallId::from_repr(self.b.lit() as u8).unwrap()
    }

    pub(crate) fn field(&self) -> Field {
        Field::from_repr(self.b.lit() as u8).unwrap()
    }

    /// The memory this instruction reads.
    pub(crate) fn read_effects(&self) -> Effects {
        match self.op {
            Opcode::FLoad => Effects::none().add_field(),
            Opcode::ALoad => Effects::none().add_array(),
            Opcode::HLoad => Effects::none().add_hash(),
            Opcode::Href => Effects::none().add_hash().add_field(),
            Opcode::Call => self.call_id().info().reads,
            _ => Effects::none(),
        }
    }

    /// The memory this instruction writes.
    pub(crate) fn write_effects(&self) -> Effects {
        match self.op {
            Opcode::AStore => Effects::none().add_array(),
            Opcode::HStore => Effects::none().add_array().add_hash(),
            Opcode::NewRef => Effects::all(),
            Opcode::Call => self.call_id().info().writes,
            _ => Effects::none(),
        }
    }
}

/// The maximum number of instructions in any trace, independent of the `maxrecord` parameter.
const MAX_INSTS: usize = 65000;

/// The instructions and constants of a trace.
#[derive(Clone)]
pub(crate) struct JitIr {
    insts: IndexVec<InstIdx, Inst>,
    consts: IndexSet<Const>,
    /// For each instruction, the previous instruction with the same opcode.
    prev: IndexVec<InstIdx, Option<InstIdx>>,
    /// For each opcode, the most recent instruction with that opcode.
    heads: [Option<InstIdx>; Opcode::COUNT],
    hints: IndexVec<InstIdx, u8>,
    /// For each effect bit, the most recent instruction writing to that kind of memory.
    last_write: [Option<InstIdx>; EFFECT_BITS],
    maxinsts: usize,
    maxconsts: usize,
    pub(crate) opt: OptFlags,
    /// Has a guard been emitted since this flag was last cleared?
    pub(crate) guardemit: bool,
}

impl JitIr {
    pub(crate) fn new(maxinsts: usize, maxconsts: usize, opt: OptFlags) -> Self {
        let mut ir = JitIr {
            insts: IndexVec::new(),
            consts: IndexSet::new(),
            prev: IndexVec::new(),
            heads: [None; Opcode::COUNT],
            hints: IndexVec::new(),
            last_write: [None; EFFECT_BITS],
            maxinsts: maxinsts.min(MAX_INSTS),
            maxconsts,
            opt,
            guardemit: false,
        };
        // The primitive constants always have the same indexes, which lets the recorder compare
        // them by reference.
        for ty in [Ty::Nil, Ty::False, Ty::True] {
            ir.consts.insert(Const::Pri(ty));
        }
        ir
    }

    pub(crate) fn len(&self) -> usize {
        self.insts.len()
    }

    /// The index the next instruction will be pushed at.
    pub(crate) fn next_idx(&self) -> InstIdx {
        self.insts.next_idx()
    }

    pub(crate) fn inst(&self, i: InstIdx) -> &Inst {
        &self.insts[i]
    }

    pub(crate) fn insts(&self) -> impl DoubleEndedIterator<Item = (InstIdx, &Inst)> {
        self.insts.iter_enumerated()
    }

    /// Replace instruction `i`. The opcode chains are not updated: callers that change opcodes
    /// must call [Self::rebuild_chains] when they're done.
    pub(crate) fn replace(&mut self, i: InstIdx, inst: Inst) {
        self.insts[i] = inst;
    }

    pub(crate) fn num_consts(&self) -> usize {
        self.consts.len()
    }

    pub(crate) fn konst(&self, c: ConstIdx) -> &Const {
        self.consts
            .get_index(c.index())
            .unwrap_or_else(|| panic!("no constant {c:?}"))
    }

    /// If `x` is a constant, return it.
    pub(crate) fn const_of(&self, x: Operand) -> Option<&Const> {
        match x {
            Operand::Const(c) => Some(self.konst(c)),
            Operand::Var(_) => None,
        }
    }

    /// The type of the value `x`.
    pub(crate) fn ty_of(&self, x: Operand) -> Ty {
        match x {
            Operand::Var(i) => self.insts[i].ty,
            Operand::Const(c) => self.konst(c).ty(),
        }
    }

    /// Intern `c`.
    pub(crate) fn intern(&mut self, c: Const) -> Result<Operand, CompilationError> {
        let (i, new) = self.consts.insert_full(c);
        if new && self.consts.len() > self.maxconsts {
            return Err(TraceError::TraceTooManyConsts.into());
        }
        Ok(Operand::Const(ConstIdx::from_usize(i)))
    }

    /// The constant of the primitive type `ty`. These never fail to intern.
    pub(crate) fn kpri(ty: Ty) -> Operand {
        Operand::Const(ConstIdx::from_usize(match ty {
            Ty::Nil => 0,
            Ty::False => 1,
            Ty::True => 2,
            _ => panic!("{ty} is not a primitive type"),
        }))
    }

    pub(crate) fn knum(&mut self, n: f64) -> Result<Operand, CompilationError> {
        self.intern(Const::Num(n.to_bits()))
    }

    pub(crate) fn kint(&mut self, i: i64) -> Result<Operand, CompilationError> {
        self.intern(Const::Int(i))
    }

    pub(crate) fn kgc(&mut self, ty: Ty, addr: usize) -> Result<Operand, CompilationError> {
        self.intern(Const::Gc(ty, addr))
    }

    pub(crate) fn kptr(&mut self, addr: usize) -> Result<Operand, CompilationError> {
        self.intern(Const::Ptr(addr))
    }

    /// Append `inst` without attempting to fold or CSE it.
    pub(crate) fn push(&mut self, inst: Inst) -> Result<InstIdx, CompilationError> {
        if self.insts.len() >= self.maxinsts {
            return Err(TraceError::RecordLen.into());
        }
        if self.insts.len() >= InstIdx::MAX_INDEX {
            return Err(CompilationError::LimitExceeded(
                "instruction index overflow".into(),
            ));
        }
        let i = self.insts.push(inst);
        self.prev.push(self.heads[inst.op as usize]);
        self.heads[inst.op as usize] = Some(i);
        self.hints.push(0);
        if inst.op != Opcode::Nop {
            for b in inst.write_effects().bits() {
                self.last_write[b] = Some(i);
            }
        }
        if inst.guard {
            self.guardemit = true;
        }
        Ok(i)
    }

    /// Iterate backwards over the instructions with opcode `op`, starting with the most recent.
    pub(crate) fn chain(&self, op: Opcode) -> ChainIter<'_> {
        ChainIter {
            ir: self,
            cur: self.heads[op as usize],
        }
    }

    /// The most recent instruction which may write memory that `effects` reads.
    pub(crate) fn last_write(&self, effects: Effects) -> Option<InstIdx> {
        effects.bits().filter_map(|b| self.last_write[b]).max()
    }

    /// Rebuild the opcode chains and write tracking after instructions have been rewritten.
    pub(crate) fn rebuild_chains(&mut self) {
        self.heads = [None; Opcode::COUNT];
        self.last_write = [None; EFFECT_BITS];
        for (i, inst) in self.insts.iter_enumerated() {
            self.prev[i] = self.heads[inst.op as usize];
            self.heads[inst.op as usize] = Some(i);
            if inst.op != Opcode::Nop {
                for b in inst.write_effects().bits() {
                    self.last_write[b] = Some(i);
                }
            }
        }
    }

    /// Remove every instruction from `len` onwards.
    pub(crate) fn truncate(&mut self, len: usize) {
        self.insts.truncate(len);
        self.prev.truncate(len);
        self.hints.truncate(len);
        self.rebuild_chains();
    }

    pub(crate) fn hint(&self, i: InstIdx, h: u8) -> bool {
        self.hints[i] & h != 0
    }

    pub(crate) fn set_hint(&mut self, i: InstIdx, h: u8) {
        self.hints[i] |= h;
    }

    pub(crate) fn clear_hint(&mut self, i: InstIdx, h: u8) {
        self.hints[i] &= !h;
    }

    /// Clear hint `h` from every instruction.
    pub(crate) fn clear_hints(&mut self, h: u8) {
        for x in self.hints.iter_mut() {
            *x &= !h;
        }
    }

    /// The most recent [Opcode::Loop] instruction, if any.
    pub(crate) fn loop_idx(&self) -> Option<InstIdx> {
        self.heads[Opcode::Loop as usize]
    }

    /// Format `x` for display.
    pub(crate) fn display_operand(&self, x: Operand) -> String {
        match x {
            Operand::Var(i) => format!("{:04}", i.index()),
            Operand::Const(c) => match self.konst(c) {
                Const::Pri(ty) => match ty {
                    Ty::Nil => "nil".into(),
                    Ty::False => "false".into(),
                    _ => "true".into(),
                },
                Const::Int(i) => format!("{i}"),
                Const::Num(b) => {
                    let n = f64::from_bits(*b);
                    if n.is_sign_negative() {
                        format!("{n}")
                    } else {
                        format!("+{n}")
                    }
                }
                Const::Gc(Ty::Str, p) => {
                    // String constants are GC roots of the trace and so are still alive.
                    let s = unsafe { &*(*p as *const Str) };
                    format!("{:?}", s.as_str())
                }
                Const::Gc(ty, p) => format!("{ty}:{p:#x}"),
                Const::Ptr(p) => format!("[{p:#x}]"),
                Const::Link(tag, u) => format!("link:{tag:?}:{u:#x}"),
            },
        }
    }

    /// Format instruction `i` for display.
    pub(crate) fn display_inst(&self, i: InstIdx) -> String {
        let inst = &self.insts[i];
        let mut s = format!(
            "{:04} {} {:>3} {:<6}",
            i.index(),
            if inst.guard { ">" } else { " " },
            inst.ty.to_string(),
            inst.op.to_string()
        );
        for (n, x) in [inst.a, inst.b].into_iter().enumerate() {
            match x {
                Opnd::None => (),
                Opnd::Ref(x) => {
                    s.push(' ');
                    s.push_str(&self.display_operand(x));
                }
                Opnd::Lit(l) => {
                    s.push(' ');
                    s.push_str(&self.display_lit(inst.op, n, l));
                }
            }
        }
        let hints = self.hints[i];
        if hints & (HINT_SINK | HINT_MOVTV | HINT_PHI) != 0 {
            s.push_str("  ;");
            if hints & HINT_SINK != 0 {
                s.push_str(" sink");
            }
            if hints & HINT_MOVTV != 0 {
                s.push_str(" movtv");
            }
            if hints & HINT_PHI != 0 {
                s.push_str(" phi");
            }
        }
        s.trim_end().to_owned()
    }

    fn display_lit(&self, op: Opcode, n: usize, l: u32) -> String {
        match (op, n) {
            (Opcode::SLoad, 0) | (Opcode::PVal, 0) | (Opcode::Retf, 1) => format!("#{l}"),
            (Opcode::SLoad, _) => {
                let mut f = String::new();
                if l & SLOAD_TYPECHECK != 0 {
                    f.push('T');
                }
                if l & SLOAD_READONLY != 0 {
                    f.push('R');
                }
                f
            }
            (Opcode::FLoad, _) => Field::from_repr(l as u8)
                .map(|x| x.to_string())
                .unwrap_or_else(|| format!("?{l}")),
            (Opcode::Fpmath, _) => FpMath::from_repr(l as u8)
                .map(|x| x.to_string())
                .unwrap_or_else(|| format!("?{l}")),
            (Opcode::Conv, _) => ConvKind::from_repr(l as u8)
                .map(|x| x.to_string())
                .unwrap_or_else(|| format!("?{l}")),
            (Opcode::Call, _) => CallId::from_repr(l as u8)
                .map(|x| x.to_string())
                .unwrap_or_else(|| format!("?{l}")),
            _ => format!("#{l}"),
        }
    }
}

impl fmt::Display for JitIr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, inst) in self.insts.iter_enumerated() {
            if inst.op != Opcode::Nop {
                writeln!(f, "{}", self.display_inst(i))?;
            }
        }
        Ok(())
    }
}

pub(crate) struct ChainIter<'a> {
    ir: &'a JitIr,
    cur: Option<InstIdx>,
}

impl Iterator for ChainIter<'_> {
    type Item = InstIdx;

    fn next(&mut self) -> Option<InstIdx> {
        let i = self.cur?;
        self.cur = self.ir.prev[i];
        Some(i)
    }
}

/// 64 bit constants referenced by machine code.
///
/// Machine code loads numbers from memory, so once a number's address has been baked into code
/// it must never move. Numbers are therefore stored in fixed-size chunks which are chained
/// together but never reallocated.
pub(crate) struct K64 {
    chunks: Vec<Box<[u64; K64_CHUNK]>>,
    used: usize,
    map: std::collections::HashMap<u64, *const u64>,
}

const K64_CHUNK: usize = 64;

impl K64 {
    pub(crate) fn new() -> Self {
        K64 {
            chunks: Vec::new(),
            used: K64_CHUNK,
            map: std::collections::HashMap::new(),
        }
    }

    /// Return a stable address holding `bits`.
    pub(crate) fn get(&mut self, bits: u64) -> *const u64 {
        if let Some(p) = self.map.get(&bits) {
            return *p;
        }
        if self.used == K64_CHUNK {
            self.chunks.push(Box::new([0; K64_CHUNK]));
            self.used = 0;
        }
        let chunk = self.chunks.last_mut().unwrap();
        chunk[self.used] = bits;
        let p = &chunk[self.used] as *const u64;
        self.used += 1;
        self.map.insert(bits, p);
        p
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    /// Forget every constant. Only safe once no machine code refers to any of them.
    pub(crate) fn clear(&mut self) {
        self.chunks.clear();
        self.used = K64_CHUNK;
        self.map.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ir() -> JitIr {
        JitIr::new(100, 10, OptFlags::default())
    }

    #[test]
    fn constants_are_interned() {
        let mut ir = ir();
        let a = ir.knum(1.5).unwrap();
        let b = ir.knum(1.5).unwrap();
        assert_eq!(a, b);
        assert!(a.is_const());
        assert_ne!(ir.knum(-0.0).unwrap(), ir.knum(0.0).unwrap());
        assert_eq!(ir.ty_of(JitIr::kpri(Ty::True)), Ty::True);
        assert_eq!(ir.const_of(JitIr::kpri(Ty::Nil)), Some(&Const::Pri(Ty::Nil)));
        for i in 0..4 {
            ir.kint(i).unwrap();
        }
        assert!(matches!(
            ir.kint(100),
            Err(CompilationError::TraceError(TraceError::TraceTooManyConsts))
        ));
    }

    #[test]
    fn chains() {
        let mut ir = ir();
        let s0 = ir
            .push(Inst::guarded(Opcode::SLoad, Ty::Num, Opnd::Lit(2), Opnd::Lit(SLOAD_TYPECHECK)))
            .unwrap();
        let s1 = ir
            .push(Inst::guarded(Opcode::SLoad, Ty::Num, Opnd::Lit(3), Opnd::Lit(SLOAD_TYPECHECK)))
            .unwrap();
        let add = ir
            .push(Inst::new(
                Opcode::Add,
                Ty::Num,
                Opnd::Ref(Operand::Var(s0)),
                Opnd::Ref(Operand::Var(s1)),
            ))
            .unwrap();
        assert_eq!(ir.chain(Opcode::SLoad).collect::<Vec<_>>(), vec![s1, s0]);
        assert_eq!(ir.chain(Opcode::Add).collect::<Vec<_>>(), vec![add]);
        assert!(ir.guardemit);
        ir.replace(s1, Inst::nop());
        ir.rebuild_chains();
        assert_eq!(ir.chain(Opcode::SLoad).collect::<Vec<_>>(), vec![s0]);
    }

    #[test]
    fn comparison_inversion() {
        for op in [Opcode::Lt, Opcode::Ge, Opcode::Le, Opcode::Gt, Opcode::Eq] {
            for ty in [Ty::Num, Ty::Int] {
                assert_eq!(op.invert(ty).invert(ty), op);
            }
        }
        assert_eq!(Opcode::Lt.invert(Ty::Num), Opcode::Uge);
        assert_eq!(Opcode::Lt.invert(Ty::Int), Opcode::Ge);
        assert!(Opcode::Ne.is_comparison());
        assert!(!Opcode::Abc.is_comparison());
    }

    #[test]
    fn k64_addresses_are_stable() {
        let mut k = K64::new();
        let p = k.get(1.5f64.to_bits());
        for i in 0..1000u64 {
            k.get(i);
        }
        assert_eq!(k.get(1.5f64.to_bits()), p);
        assert_eq!(unsafe { *p }, 1.5f64.to_bits());
        assert_eq!(k.len(), 1001);
    }

    #[test]
    fn display() {
        let mut ir = ir();
        let s = ir
            .push(Inst::guarded(Opcode::SLoad, Ty::Num, Opnd::Lit(2), Opnd::Lit(SLOAD_TYPECHECK)))
            .unwrap();
        let k = ir.knum(1.0).unwrap();
        ir.push(Inst::new(Opcode::Add, Ty::Num, Opnd::Ref(Operand::Var(s)), Opnd::Ref(k)))
            .unwrap();
        assert_eq!(
            ir.to_string(),
            "0000 > num SLOAD  #2 T\n0001   num ADD    0000 +1\n"
        );
    }
}
