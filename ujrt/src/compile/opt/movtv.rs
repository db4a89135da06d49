// Untyped moves.
//
// A value loaded from a stack slot or a table only to be stored into a table needs neither its type
// checked nor its payload unboxed: the assembler can copy the whole tagged value instead. This pass
// finds such load/store pairs and marks the load with [HINT_MOVTV], turning it into an unguarded
// load of type [Ty::TValue]. A load marked [HINT_KEEPGUARD] keeps its type check, because the
// recorder relied on its type (usually its nil-ness) when it recorded what came next.

use vob::Vob;

use crate::compile::{
    jit_ir::{InstIdx, Opcode, Operand, Opnd, Ty, HINT_KEEPGUARD, HINT_MOVTV, HINT_PHI, HINT_SINK},
    trace::TraceIr,
};

pub(crate) fn movtv(tir: &mut TraceIr) {
    let ir = &tir.ir;
    let n = ir.len();
    let mut nuses = vec![0u32; n];
    let mut user = vec![None; n];
    for (i, inst) in ir.insts() {
        for x in inst.vars() {
            nuses[x.index()] += 1;
            user[x.index()] = Some(i);
        }
    }
    let mut in_snap = Vob::from_elem(false, n);
    for e in &tir.snapmap {
        if let Operand::Var(x) = e.val {
            in_snap.set(x.index(), true);
        }
    }
    let loop_idx = ir.loop_idx();
    let in_body = |i: InstIdx| loop_idx.map(|l| i > l).unwrap_or(false);

    let mut moves = Vec::new();
    for (i, inst) in ir.insts() {
        if !matches!(inst.op, Opcode::SLoad | Opcode::ALoad | Opcode::HLoad)
            || nuses[i.index()] != 1
            || in_snap[i.index()]
            || ir.hint(i, HINT_SINK | HINT_PHI)
        {
            continue;
        }
        let s = match user[i.index()] {
            Some(s) => s,
            None => continue,
        };
        let st = ir.inst(s);
        if !st.op.is_store()
            || st.b != Opnd::Ref(Operand::Var(i))
            || ir.hint(s, HINT_SINK)
            || in_body(i) != in_body(s)
        {
            continue;
        }
        let reads = inst.read_effects();
        let clobbered = (i.index() + 1..s.index()).map(InstIdx::from_usize).any(|j| {
            let x = ir.inst(j);
            x.op == Opcode::Retf || x.write_effects().interferes(reads)
        });
        if !clobbered {
            moves.push(i);
        }
    }

    for i in moves {
        tir.ir.set_hint(i, HINT_MOVTV);
        if !tir.ir.hint(i, HINT_KEEPGUARD) {
            let mut inst = *tir.ir.inst(i);
            inst.guard = false;
            inst.ty = Ty::TValue;
            tir.ir.replace(i, inst);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::compile::{
        jit_ir::{Field, Inst},
        opt::test_util::{assert_ir, setup, sload, tir},
        snap::AbstractStack,
    };

    fn aref(tir: &mut TraceIr, t: Operand, idx: i64) -> Operand {
        let arr = tir
            .ir
            .emit(Inst::new(
                Opcode::FLoad,
                Ty::Ptr,
                Opnd::Ref(t),
                Opnd::Lit(Field::TabArray as u32),
            ))
            .unwrap();
        let k = tir.ir.kint(idx).unwrap();
        tir.ir.emit2(Opcode::Aref, Ty::Ptr, arr, k).unwrap()
    }

    fn store(tir: &mut TraceIr, r: Operand, v: Operand) {
        tir.ir
            .emit(Inst::new(Opcode::AStore, Ty::Void, Opnd::Ref(r), Opnd::Ref(v)))
            .unwrap();
    }

    #[test]
    fn slot_to_table_copies_are_untyped() {
        let (_heap, pc) = setup();
        let mut tir = tir(pc);
        let st = AbstractStack::new();
        tir.snapshot_add(&st, pc, 10, false).unwrap();
        let t = sload(&mut tir, 2, Ty::Tab);
        let x = sload(&mut tir, 3, Ty::Num);
        let r = aref(&mut tir, t, 0);
        store(&mut tir, r, x);
        movtv(&mut tir);
        assert_ir(
            &tir,
            "...
             {{t}} > tab SLOAD  #2 T
             {{x}}    tv SLOAD  #3 T  ; movtv
             ...
             {{s}}   --- ASTORE {{r}} {{x}}",
        );
        // The table is used as an address, not stored, so it stays typed.
        assert!(!tir.ir.hint(t.as_var().unwrap(), HINT_MOVTV));
    }

    #[test]
    fn snapshot_values_stay_typed() {
        let (_heap, pc) = setup();
        let mut tir = tir(pc);
        let mut st = AbstractStack::new();
        tir.snapshot_add(&st, pc, 10, false).unwrap();
        let t = sload(&mut tir, 2, Ty::Tab);
        let x = sload(&mut tir, 3, Ty::Num);
        st.set(2, x).unwrap();
        tir.snapshot_add(&st, pc, 10, false).unwrap();
        let r = aref(&mut tir, t, 0);
        store(&mut tir, r, x);
        movtv(&mut tir);
        let x = x.as_var().unwrap();
        assert!(!tir.ir.hint(x, HINT_MOVTV));
        assert_eq!(tir.ir.inst(x).ty, Ty::Num);
    }

    #[test]
    fn kept_guards_survive() {
        let (_heap, pc) = setup();
        let mut tir = tir(pc);
        let st = AbstractStack::new();
        tir.snapshot_add(&st, pc, 10, false).unwrap();
        let t = sload(&mut tir, 2, Ty::Tab);
        let r1 = aref(&mut tir, t, 0);
        let l = tir
            .ir
            .emit(Inst::guarded(Opcode::ALoad, Ty::Num, Opnd::Ref(r1), Opnd::None))
            .unwrap();
        tir.ir.set_hint(l.as_var().unwrap(), HINT_KEEPGUARD);
        let r2 = aref(&mut tir, t, 1);
        store(&mut tir, r2, l);
        movtv(&mut tir);
        let l = l.as_var().unwrap();
        assert!(tir.ir.hint(l, HINT_MOVTV));
        assert!(tir.ir.inst(l).guard);
        assert_eq!(tir.ir.inst(l).ty, Ty::Num);
    }

    #[test]
    fn intervening_stores_block_moves() {
        let (_heap, pc) = setup();
        let mut tir = tir(pc);
        let st = AbstractStack::new();
        tir.snapshot_add(&st, pc, 10, false).unwrap();
        let t = sload(&mut tir, 2, Ty::Tab);
        let x = sload(&mut tir, 3, Ty::Num);
        let r1 = aref(&mut tir, t, 0);
        let l = tir
            .ir
            .emit(Inst::guarded(Opcode::ALoad, Ty::Num, Opnd::Ref(r1), Opnd::None))
            .unwrap();
        let r2 = aref(&mut tir, t, 1);
        store(&mut tir, r2, x);
        let r3 = aref(&mut tir, t, 2);
        store(&mut tir, r3, l);
        movtv(&mut tir);
        assert!(!tir.ir.hint(l.as_var().unwrap(), HINT_MOVTV));
        // `x` is copied without anything in between.
        assert!(tir.ir.hint(x.as_var().unwrap(), HINT_MOVTV));
    }
}
