// Dead code elimination.
//
// Everything a snapshot refers to may be needed by an exit, so snapshot entries are the roots.
// A single backwards pass then keeps every instruction which is used by a kept instruction or must
// be kept for its own sake (guards, stores, calls with side effects and so on), and turns the rest
// into `NOP`s.

use crate::compile::{
    jit_ir::{Inst, InstIdx, Operand, HINT_MARK},
    trace::TraceIr,
};

pub(crate) fn dce(tir: &mut TraceIr) {
    let ir = &mut tir.ir;
    for e in &tir.snapmap {
        if let Operand::Var(i) = e.val {
            ir.set_hint(i, HINT_MARK);
        }
    }
    for i in (0..ir.len()).rev().map(InstIdx::from_usize) {
        let inst = *ir.inst(i);
        if !ir.hint(i, HINT_MARK) && !inst.is_kept() {
            ir.replace(i, Inst::nop());
            continue;
        }
        ir.clear_hint(i, HINT_MARK);
        for x in inst.vars() {
            ir.set_hint(x, HINT_MARK);
        }
    }
    ir.rebuild_chains();
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::compile::{
        jit_ir::{Opcode, Ty},
        opt::test_util::{assert_ir, setup, sload, tir},
        snap::AbstractStack,
    };

    #[test]
    fn unused_values_are_removed() {
        let (_heap, pc) = setup();
        let mut tir = tir(pc);
        let mut st = AbstractStack::new();
        tir.snapshot_add(&st, pc, 10, false).unwrap();
        let x = sload(&mut tir, 2, Ty::Num);
        let y = sload(&mut tir, 3, Ty::Num);
        let k = tir.ir.knum(2.0).unwrap();
        // Only used by a dead instruction.
        let dead1 = tir.ir.emit2(Opcode::Mul, Ty::Num, y, k).unwrap();
        tir.ir.emit2(Opcode::Add, Ty::Num, dead1, k).unwrap();
        let live = tir.ir.emit2(Opcode::Add, Ty::Num, x, k).unwrap();
        st.set(1, live).unwrap();
        tir.snapshot_add(&st, pc, 10, false).unwrap();
        dce(&mut tir);
        assert_ir(
            &tir,
            "----        SNAP   #0 [ ]
             {{x}} > num SLOAD  #2 T
             {{y}} > num SLOAD  #3 T
             {{live}}   num ADD    {{x}} +2
             ----        SNAP   #1 [ 3:{{live}} ]",
        );
        // The chains no longer see the removed instructions.
        assert_eq!(tir.ir.chain(Opcode::Mul).count(), 0);
        assert_eq!(tir.ir.chain(Opcode::Add).count(), 1);
        assert!(!tir.ir.hint(live.as_var().unwrap(), HINT_MARK));
    }

    #[test]
    fn guards_keep_their_operands() {
        let (_heap, pc) = setup();
        let mut tir = tir(pc);
        let st = AbstractStack::new();
        tir.snapshot_add(&st, pc, 10, false).unwrap();
        let x = sload(&mut tir, 2, Ty::Num);
        let k = tir.ir.knum(1.0).unwrap();
        let y = tir.ir.emit2(Opcode::Sub, Ty::Num, x, k).unwrap();
        tir.ir.guard2(Opcode::Lt, Ty::Num, y, k).unwrap();
        dce(&mut tir);
        assert_ir(
            &tir,
            "...
             {{x}} > num SLOAD  #2 T
             {{y}}   num SUB    {{x}} +1
             {{_}} > num LT     {{y}} +1",
        );
    }
}
