//! Folding, common subexpression elimination and load forwarding.
//!
//! Every instruction the recorder (or the loop optimiser) wants to add goes through
//! [JitIr::emit]. Emission happens in two stages:
//!
//!   1. [simplify]: a context-free rewrite which only looks at the instruction and, where it
//!      helps, at the instructions its operands refer to. It repeatedly applies local rules until
//!      none applies, so its output is always a fixpoint: simplifying an already simplified
//!      instruction is a no-op.
//!   2. CSE and forwarding: the instruction is looked up in the chain of earlier instructions with
//!      the same opcode. For loads, the search is bounded by the last instruction which may have
//!      written the memory the load reads; a load from a reference just stored to is forwarded
//!      the stored value.

use super::{
    Const, ConvKind, Field, FpMath, Inst, InstIdx, JitIr, Opcode, Operand, Opnd, Ty,
};
use crate::{
    compile::{effects::Effects, CompilationError, TraceError},
    params::Opt,
};

/// The result of simplifying an instruction.
#[derive(Debug, PartialEq)]
pub(crate) enum Simplified {
    /// The instruction should be emitted as given.
    Inst(Inst),
    /// The instruction is redundant: its value is the given operand.
    Operand(Operand),
}

/// Mirror a comparison so that its operands can be swapped.
fn mirror(op: Opcode) -> Opcode {
    match op {
        Opcode::Lt => Opcode::Gt,
        Opcode::Gt => Opcode::Lt,
        Opcode::Le => Opcode::Ge,
        Opcode::Ge => Opcode::Le,
        Opcode::Ult => Opcode::Ugt,
        Opcode::Ugt => Opcode::Ult,
        Opcode::Ule => Opcode::Uge,
        Opcode::Uge => Opcode::Ule,
        x => x,
    }
}

fn eval_num_cmp(op: Opcode, a: f64, b: f64) -> bool {
    match op {
        Opcode::Lt => a < b,
        Opcode::Ge => a >= b,
        Opcode::Le => a <= b,
        Opcode::Gt => a > b,
        Opcode::Ult => !(a >= b),
        Opcode::Uge => !(a < b),
        Opcode::Ule => !(a > b),
        Opcode::Ugt => !(a <= b),
        Opcode::Eq => a == b,
        Opcode::Ne => a != b,
        _ => unreachable!(),
    }
}

fn eval_int_cmp(op: Opcode, a: i64, b: i64) -> bool {
    let (ua, ub) = (a as u64, b as u64);
    match op {
        Opcode::Lt => a < b,
        Opcode::Ge => a >= b,
        Opcode::Le => a <= b,
        Opcode::Gt => a > b,
        Opcode::Ult => ua < ub,
        Opcode::Uge => ua >= ub,
        Opcode::Ule => ua <= ub,
        Opcode::Ugt => ua > ub,
        Opcode::Eq => a == b,
        Opcode::Ne => a != b,
        _ => unreachable!(),
    }
}

/// One step of simplification.
enum Step {
    /// No rule applies.
    Done,
    /// A rule rewrote the instruction.
    Again(Inst),
    Operand(Operand),
}

/// Simplify `inst`. This never looks at anything other than `inst` and the instructions and
/// constants it references, and may intern new constants.
pub(crate) fn simplify(ir: &mut JitIr, mut inst: Inst) -> Result<Simplified, CompilationError> {
    loop {
        match step(ir, inst)? {
            Step::Done => return Ok(Simplified::Inst(inst)),
            Step::Again(x) => inst = x,
            Step::Operand(x) => return Ok(Simplified::Operand(x)),
        }
    }
}

fn step(ir: &mut JitIr, inst: Inst) -> Result<Step, CompilationError> {
    let ka = inst.a.as_ref().and_then(|x| ir.const_of(x).copied());
    let kb = inst.b.as_ref().and_then(|x| ir.const_of(x).copied());
    let op = inst.op;

    // Commutative operations and comparisons keep constants on the right.
    if ka.is_some() && kb.is_none() && inst.b.as_ref().is_some() {
        match op {
            Opcode::Add | Opcode::Mul | Opcode::Eq | Opcode::Ne => {
                return Ok(Step::Again(Inst { a: inst.b, b: inst.a, ..inst }));
            }
            _ if op.is_comparison() => {
                return Ok(Step::Again(Inst {
                    op: mirror(op),
                    a: inst.b,
                    b: inst.a,
                    ..inst
                }));
            }
            _ => (),
        }
    }

    match op {
        Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Min | Opcode::Max => {
            match (ka, kb, inst.ty) {
                (Some(Const::Num(x)), Some(Const::Num(y)), Ty::Num) => {
                    let (x, y) = (f64::from_bits(x), f64::from_bits(y));
                    let r = match op {
                        Opcode::Add => x + y,
                        Opcode::Sub => x - y,
                        Opcode::Mul => x * y,
                        Opcode::Div => x / y,
                        Opcode::Min => {
                            if y < x {
                                y
                            } else {
                                x
                            }
                        }
                        _ => {
                            if y > x {
                                y
                            } else {
                                x
                            }
                        }
                    };
                    return Ok(Step::Operand(ir.knum(r)?));
                }
                (Some(Const::Int(x)), Some(Const::Int(y)), Ty::Int)
                    if matches!(op, Opcode::Add | Opcode::Sub | Opcode::Mul) =>
                {
                    let r = match op {
                        Opcode::Add => x.wrapping_add(y),
                        Opcode::Sub => x.wrapping_sub(y),
                        _ => x.wrapping_mul(y),
                    };
                    return Ok(Step::Operand(ir.kint(r)?));
                }
                (None, Some(k), _) => {
                    // `x + 0` is not folded for numbers: `-0 + 0` is `+0`.
                    let identity = match (op, k) {
                        (Opcode::Sub, Const::Num(y)) => y == 0f64.to_bits(),
                        (Opcode::Mul | Opcode::Div, Const::Num(y)) => y == 1f64.to_bits(),
                        (Opcode::Add | Opcode::Sub, Const::Int(0)) => true,
                        (Opcode::Mul, Const::Int(1)) => true,
                        _ => false,
                    };
                    if identity {
                        if let Opnd::Ref(a) = inst.a {
                            return Ok(Step::Operand(a));
                        }
                    }
                }
                _ => (),
            }
        }
        Opcode::Neg | Opcode::Abs => {
            if let Some(Const::Num(x)) = ka {
                let x = f64::from_bits(x);
                let r = if op == Opcode::Neg { -x } else { x.abs() };
                return Ok(Step::Operand(ir.knum(r)?));
            }
            if op == Opcode::Neg {
                if let Some(i) = inst.a.as_var() {
                    let inner = *ir.inst(i);
                    if inner.op == Opcode::Neg {
                        if let Opnd::Ref(x) = inner.a {
                            return Ok(Step::Operand(x));
                        }
                    }
                }
            }
        }
        Opcode::Fpmath => {
            if let Some(Const::Num(x)) = ka {
                let x = f64::from_bits(x);
                let r = match FpMath::from_repr(inst.b.lit() as u8) {
                    Some(FpMath::Floor) => x.floor(),
                    Some(FpMath::Ceil) => x.ceil(),
                    Some(FpMath::Sqrt) => x.sqrt(),
                    None => return Ok(Step::Done),
                };
                return Ok(Step::Operand(ir.knum(r)?));
            }
        }
        Opcode::Conv => {
            let kind = ConvKind::from_repr(inst.b.lit() as u8);
            match (kind, ka) {
                (Some(ConvKind::IntToNum), Some(Const::Int(i))) => {
                    return Ok(Step::Operand(ir.knum(i as f64)?));
                }
                (Some(ConvKind::NumToInt), Some(Const::Num(b))) => {
                    let n = f64::from_bits(b);
                    let i = n as i64;
                    if inst.guard && (i as f64 != n || (n == 0.0 && n.is_sign_negative())) {
                        return Err(TraceError::GuardAlwaysFails.into());
                    }
                    return Ok(Step::Operand(ir.kint(i)?));
                }
                (Some(ConvKind::NumToInt), None) => {
                    if let Some(i) = inst.a.as_var() {
                        let inner = *ir.inst(i);
                        if inner.op == Opcode::Conv
                            && ConvKind::from_repr(inner.b.lit() as u8) == Some(ConvKind::IntToNum)
                        {
                            if let Opnd::Ref(x) = inner.a {
                                return Ok(Step::Operand(x));
                            }
                        }
                    }
                }
                _ => (),
            }
        }
        Opcode::Abc => {
            if let (Some(Const::Int(asize)), Some(Const::Int(idx))) = (ka, kb) {
                if (idx as u64) < (asize as u64) {
                    return Ok(Step::Operand(JitIr::kpri(Ty::True)));
                }
                return Err(TraceError::GuardAlwaysFails.into());
            }
        }
        Opcode::TBar => {
            if let Some(i) = inst.a.as_var() {
                if ir.inst(i).op == Opcode::TNew {
                    return Ok(Step::Operand(JitIr::kpri(Ty::Nil)));
                }
            }
        }
        _ if op.is_comparison() => {
            let holds = match (ka, kb) {
                (Some(Const::Num(x)), Some(Const::Num(y))) => {
                    Some(eval_num_cmp(op, f64::from_bits(x), f64::from_bits(y)))
                }
                (Some(Const::Int(x)), Some(Const::Int(y))) => Some(eval_int_cmp(op, x, y)),
                (Some(x), Some(y)) if matches!(op, Opcode::Eq | Opcode::Ne) => {
                    Some((x == y) == (op == Opcode::Eq))
                }
                (None, None) if inst.a == inst.b && inst.ty != Ty::Num => match op {
                    Opcode::Eq | Opcode::Le | Opcode::Ge | Opcode::Ule | Opcode::Uge => Some(true),
                    _ => Some(false),
                },
                _ => None,
            };
            match holds {
                Some(true) => return Ok(Step::Operand(JitIr::kpri(Ty::True))),
                Some(false) => return Err(TraceError::GuardAlwaysFails.into()),
                None => (),
            }
        }
        _ => (),
    }
    Ok(Step::Done)
}

impl JitIr {
    /// Emit `inst`, folding it and reusing an equivalent earlier instruction where possible.
    pub(crate) fn emit(&mut self, inst: Inst) -> Result<Operand, CompilationError> {
        let inst = if self.opt.has(Opt::Fold) {
            match simplify(self, inst)? {
                Simplified::Inst(x) => x,
                Simplified::Operand(x) => return Ok(x),
            }
        } else {
            inst
        };
        if self.opt.has(Opt::Cse) {
            if let Some(x) = self.forward(&inst)? {
                return Ok(x);
            }
            if let Some(i) = self.cse(&inst) {
                return Ok(Operand::Var(i));
            }
        }
        Ok(Operand::Var(self.push(inst)?))
    }

    /// Emit an instruction with two operands.
    pub(crate) fn emit2(
        &mut self,
        op: Opcode,
        ty: Ty,
        a: Operand,
        b: Operand,
    ) -> Result<Operand, CompilationError> {
        self.emit(Inst::new(op, ty, Opnd::Ref(a), Opnd::Ref(b)))
    }

    /// Emit a guard with two operands.
    pub(crate) fn guard2(
        &mut self,
        op: Opcode,
        ty: Ty,
        a: Operand,
        b: Operand,
    ) -> Result<Operand, CompilationError> {
        self.emit(Inst::guarded(op, ty, Opnd::Ref(a), Opnd::Ref(b)))
    }

    /// Look for an earlier instruction identical to `inst` whose value is still valid.
    fn cse(&self, inst: &Inst) -> Option<InstIdx> {
        let bound = match inst.op {
            Opcode::Nop
            | Opcode::SLoad
            | Opcode::PVal
            | Opcode::Retf
            | Opcode::Loop
            | Opcode::Phi
            | Opcode::AStore
            | Opcode::HStore
            | Opcode::NewRef
            | Opcode::TNew
            | Opcode::TBar
            | Opcode::CArg => return None,
            Opcode::Call if !inst.call_id().is_pure() => return None,
            // A hash slot stays put until a key is added to its table.
            Opcode::Href => self.last_write(Effects::none().add_field()),
            _ => self.last_write(inst.read_effects()),
        };
        self.chain(inst.op)
            .take_while(|i| bound.map(|b| *i > b).unwrap_or(true))
            .find(|i| self.inst(*i) == inst)
    }

    /// If `inst` is a load whose value is already known, return that value.
    fn forward(&mut self, inst: &Inst) -> Result<Option<Operand>, CompilationError> {
        match inst.op {
            Opcode::ALoad | Opcode::HLoad => {
                let store_op = if inst.op == Opcode::ALoad {
                    Opcode::AStore
                } else {
                    Opcode::HStore
                };
                if let Some(w) = self.last_write(inst.read_effects()) {
                    let st = *self.inst(w);
                    if st.op == store_op && st.a == inst.a {
                        if let Opnd::Ref(v) = st.b {
                            if self.ty_of(v) == inst.ty || inst.ty == Ty::TValue {
                                return Ok(Some(v));
                            }
                        }
                    }
                }
                Ok(None)
            }
            Opcode::FLoad => {
                let tnew = match inst.a.as_var() {
                    Some(i) if self.inst(i).op == Opcode::TNew => i,
                    _ => return Ok(None),
                };
                if self
                    .last_write(Effects::none().add_field())
                    .map(|w| w > tnew)
                    .unwrap_or(false)
                {
                    return Ok(None);
                }
                let t = *self.inst(tnew);
                Ok(match inst.field() {
                    Field::TabAsize => Some(self.kint(i64::from(t.a.lit()))?),
                    // Tables are created with an empty hash part; its size is a capacity hint.
                    Field::TabHsize => Some(self.kint(0)?),
                    Field::TabMeta => Some(self.kptr(0)?),
                    _ => None,
                })
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{compile::jit_ir::SLOAD_TYPECHECK, params::OptFlags};

    fn ir() -> JitIr {
        JitIr::new(1000, 100, OptFlags::default())
    }

    fn sload(ir: &mut JitIr, slot: u32, ty: Ty) -> Operand {
        Operand::Var(
            ir.push(Inst::guarded(
                Opcode::SLoad,
                ty,
                Opnd::Lit(slot),
                Opnd::Lit(SLOAD_TYPECHECK),
            ))
            .unwrap(),
        )
    }

    #[test]
    fn constant_arithmetic() {
        let mut ir = ir();
        let a = ir.knum(2.0).unwrap();
        let b = ir.knum(3.5).unwrap();
        let r = ir.emit2(Opcode::Mul, Ty::Num, a, b).unwrap();
        assert_eq!(ir.const_of(r).and_then(|x| x.as_num()), Some(7.0));
        let r = ir.emit2(Opcode::Min, Ty::Num, a, b).unwrap();
        assert_eq!(ir.const_of(r).and_then(|x| x.as_num()), Some(2.0));
        assert_eq!(ir.len(), 0);
    }

    #[test]
    fn identities() {
        let mut ir = ir();
        let x = sload(&mut ir, 2, Ty::Num);
        let zero = ir.knum(0.0).unwrap();
        let one = ir.knum(1.0).unwrap();
        assert_eq!(ir.emit2(Opcode::Sub, Ty::Num, x, zero).unwrap(), x);
        assert_eq!(ir.emit2(Opcode::Mul, Ty::Num, one, x).unwrap(), x);
        // `x + 0` must stay: it turns `-0` into `+0`.
        let add = ir.emit2(Opcode::Add, Ty::Num, x, zero).unwrap();
        assert_ne!(add, x);
        let n1 = ir
            .emit(Inst::new(Opcode::Neg, Ty::Num, Opnd::Ref(x), Opnd::None))
            .unwrap();
        let n2 = ir
            .emit(Inst::new(Opcode::Neg, Ty::Num, Opnd::Ref(n1), Opnd::None))
            .unwrap();
        assert_eq!(n2, x);
    }

    #[test]
    fn comparisons() {
        let mut ir = ir();
        let x = sload(&mut ir, 2, Ty::Num);
        let k = ir.knum(10.0).unwrap();
        // The constant moves to the right, mirroring the comparison.
        let g = ir.guard2(Opcode::Lt, Ty::Num, k, x).unwrap();
        let gi = *ir.inst(g.as_var().unwrap());
        assert_eq!(gi.op, Opcode::Gt);
        assert_eq!(gi.a, Opnd::Ref(x));
        let k2 = ir.knum(11.0).unwrap();
        assert_eq!(
            ir.guard2(Opcode::Lt, Ty::Num, k, k2).unwrap(),
            JitIr::kpri(Ty::True)
        );
        assert!(matches!(
            ir.guard2(Opcode::Gt, Ty::Num, k, k2),
            Err(CompilationError::TraceError(TraceError::GuardAlwaysFails))
        ));
        // `x == x` may not hold for numbers.
        assert!(ir.guard2(Opcode::Eq, Ty::Num, x, x).unwrap().as_var().is_some());
        let s = sload(&mut ir, 3, Ty::Str);
        assert_eq!(
            ir.guard2(Opcode::Eq, Ty::Str, s, s).unwrap(),
            JitIr::kpri(Ty::True)
        );
    }

    #[test]
    fn simplify_is_idempotent() {
        let mut ir = ir();
        let x = sload(&mut ir, 2, Ty::Num);
        let y = sload(&mut ir, 3, Ty::Num);
        let k = ir.knum(4.0).unwrap();
        let insts = [
            Inst::new(Opcode::Add, Ty::Num, Opnd::Ref(k), Opnd::Ref(x)),
            Inst::guarded(Opcode::Ge, Ty::Num, Opnd::Ref(k), Opnd::Ref(y)),
            Inst::new(Opcode::Div, Ty::Num, Opnd::Ref(x), Opnd::Ref(y)),
            Inst::new(Opcode::Conv, Ty::Int, Opnd::Ref(x), Opnd::Lit(ConvKind::NumToInt as u32)),
        ];
        for inst in insts {
            let once = match simplify(&mut ir, inst).unwrap() {
                Simplified::Inst(i) => i,
                Simplified::Operand(_) => continue,
            };
            assert_eq!(simplify(&mut ir, once).unwrap(), Simplified::Inst(once));
        }
    }

    #[test]
    fn cse() {
        let mut ir = ir();
        let x = sload(&mut ir, 2, Ty::Num);
        let y = sload(&mut ir, 3, Ty::Num);
        let a1 = ir.emit2(Opcode::Add, Ty::Num, x, y).unwrap();
        let a2 = ir.emit2(Opcode::Add, Ty::Num, x, y).unwrap();
        assert_eq!(a1, a2);
        let s = ir.emit2(Opcode::Sub, Ty::Num, x, y).unwrap();
        assert_ne!(a1, s);
        let mut noopt = JitIr::new(1000, 100, OptFlags::none());
        let x = sload(&mut noopt, 2, Ty::Num);
        let a1 = noopt.emit2(Opcode::Add, Ty::Num, x, x).unwrap();
        let a2 = noopt.emit2(Opcode::Add, Ty::Num, x, x).unwrap();
        assert_ne!(a1, a2);
    }

    #[test]
    fn store_forwarding() {
        let mut ir = ir();
        let t = sload(&mut ir, 2, Ty::Tab);
        let arr = ir
            .emit(Inst::new(
                Opcode::FLoad,
                Ty::Ptr,
                Opnd::Ref(t),
                Opnd::Lit(Field::TabArray as u32),
            ))
            .unwrap();
        let idx = ir.kint(1).unwrap();
        let aref = ir.emit2(Opcode::Aref, Ty::Ptr, arr, idx).unwrap();
        let v = sload(&mut ir, 3, Ty::Num);
        let load = Inst::guarded(Opcode::ALoad, Ty::Num, Opnd::Ref(aref), Opnd::None);
        let l1 = ir.emit(load).unwrap();
        assert_eq!(ir.emit(load).unwrap(), l1);
        ir.emit(Inst::new(Opcode::AStore, Ty::Void, Opnd::Ref(aref), Opnd::Ref(v)))
            .unwrap();
        assert_eq!(ir.emit(load).unwrap(), v);
        // A store of a different type is not forwarded to a typed load.
        let s = sload(&mut ir, 4, Ty::Str);
        ir.emit(Inst::new(Opcode::AStore, Ty::Void, Opnd::Ref(aref), Opnd::Ref(s)))
            .unwrap();
        let l2 = ir.emit(load).unwrap();
        assert_ne!(l2, l1);
        assert_ne!(l2, v);
    }

    #[test]
    fn new_table_fields() {
        let mut ir = ir();
        let t = ir
            .emit(Inst::new(Opcode::TNew, Ty::Tab, Opnd::Lit(3), Opnd::Lit(0)))
            .unwrap();
        let asize = ir
            .emit(Inst::new(
                Opcode::FLoad,
                Ty::Int,
                Opnd::Ref(t),
                Opnd::Lit(Field::TabAsize as u32),
            ))
            .unwrap();
        assert_eq!(ir.const_of(asize).and_then(|x| x.as_int()), Some(3));
        let bar = ir
            .emit(Inst::new(Opcode::TBar, Ty::Void, Opnd::Ref(t), Opnd::None))
            .unwrap();
        assert_eq!(bar, JitIr::kpri(Ty::Nil));
    }
}
