//! Basic well-formedness checks for the JIT IR. These help debug incorrectly formed IR and
//! document what the assembler may assume.
//!
//! After calling [JitIr::assert_well_formed] one can safely assume:
//!
//!   * Every operand references a strictly earlier instruction, or a constant, and never a
//!     [Opcode::Nop].
//!   * Arithmetic instructions have operands of their own type, which is [Ty::Num] or [Ty::Int].
//!   * Comparisons, [Opcode::Abc] and [Opcode::Retf] are guards; comparisons compare operands of
//!     the same type.
//!   * [Opcode::Conv]s convert between [Ty::Int] and [Ty::Num] in the direction their kind says.
//!   * There is at most one [Opcode::Loop], and every [Opcode::Phi] follows it.

use super::{ConvKind, InstIdx, JitIr, Opcode, Opnd, Ty};

impl JitIr {
    pub(crate) fn assert_well_formed(&self) {
        let mut seen_loop = None;
        for (iidx, inst) in self.insts() {
            if inst.op == Opcode::Nop {
                continue;
            }
            for x in inst.vars() {
                if x >= iidx {
                    panic!(
                        "Instruction at position {} references a later instruction\n  {}",
                        iidx.index(),
                        self.display_inst(iidx)
                    );
                }
                if self.inst(x).op == Opcode::Nop {
                    panic!(
                        "Instruction at position {} references a removed instruction\n  {}",
                        iidx.index(),
                        self.display_inst(iidx)
                    );
                }
            }
            match inst.op {
                Opcode::Add
                | Opcode::Sub
                | Opcode::Mul
                | Opcode::Div
                | Opcode::Min
                | Opcode::Max => {
                    if !matches!(inst.ty, Ty::Num | Ty::Int) {
                        self.bad(iidx, "arithmetic on a non-numeric type");
                    }
                    for x in inst.refs() {
                        if self.ty_of(x) != inst.ty {
                            self.bad(iidx, "operand type differs from the result type");
                        }
                    }
                }
                Opcode::Neg | Opcode::Abs | Opcode::Fpmath => {
                    if inst.ty != Ty::Num || inst.a.as_ref().map(|x| self.ty_of(x)) != Some(Ty::Num)
                    {
                        self.bad(iidx, "float operation on a non-float operand");
                    }
                }
                Opcode::Conv => {
                    let (from, to) = match ConvKind::from_repr(inst.b.lit() as u8) {
                        Some(ConvKind::IntToNum) => (Ty::Int, Ty::Num),
                        Some(ConvKind::NumToInt) => (Ty::Num, Ty::Int),
                        None => self.bad(iidx, "unknown conversion"),
                    };
                    if inst.ty != to || inst.a.as_ref().map(|x| self.ty_of(x)) != Some(from) {
                        self.bad(iidx, "conversion between the wrong types");
                    }
                }
                Opcode::Abc | Opcode::Retf => {
                    if !inst.guard {
                        self.bad(iidx, "unguarded check");
                    }
                }
                Opcode::Loop => {
                    if seen_loop.is_some() {
                        self.bad(iidx, "more than one LOOP");
                    }
                    seen_loop = Some(iidx);
                }
                Opcode::Phi => {
                    if seen_loop.is_none() {
                        self.bad(iidx, "PHI before LOOP");
                    }
                    if !matches!((inst.a, inst.b), (Opnd::Ref(_), Opnd::Ref(_))) {
                        self.bad(iidx, "PHI without two operands");
                    }
                }
                op if op.is_comparison() => {
                    if !inst.guard {
                        self.bad(iidx, "unguarded comparison");
                    }
                    let tys = inst.refs().map(|x| self.ty_of(x)).collect::<Vec<_>>();
                    if tys.len() != 2 || tys[0] != tys[1] {
                        self.bad(iidx, "comparison of different types");
                    }
                }
                _ => (),
            }
        }
    }

    fn bad(&self, iidx: InstIdx, msg: &str) -> ! {
        panic!(
            "Instruction at position {} is malformed: {msg}\n  {}",
            iidx.index(),
            self.display_inst(iidx)
        );
    }
}

#[cfg(test)]
mod test {
    use super::super::{Inst, Operand, SLOAD_TYPECHECK};
    use super::*;
    use crate::params::OptFlags;

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
    fn well_formed() {
        let mut ir = JitIr::new(100, 100, OptFlags::none());
        let x = sload(&mut ir, 2, Ty::Num);
        let y = sload(&mut ir, 3, Ty::Num);
        ir.emit2(Opcode::Add, Ty::Num, x, y).unwrap();
        ir.guard2(Opcode::Lt, Ty::Num, x, y).unwrap();
        ir.assert_well_formed();
    }

    #[test]
    #[should_panic(expected = "operand type differs")]
    fn mixed_arithmetic() {
        let mut ir = JitIr::new(100, 100, OptFlags::none());
        let x = sload(&mut ir, 2, Ty::Num);
        let k = ir.kint(1).unwrap();
        ir.emit2(Opcode::Add, Ty::Num, x, k).unwrap();
        ir.assert_well_formed();
    }

    #[test]
    #[should_panic(expected = "references a removed instruction")]
    fn reference_to_nop() {
        let mut ir = JitIr::new(100, 100, OptFlags::none());
        let x = sload(&mut ir, 2, Ty::Num);
        ir.emit2(Opcode::Add, Ty::Num, x, x).unwrap();
        ir.replace(x.as_var().unwrap(), Inst::nop());
        ir.assert_well_formed();
    }
}
