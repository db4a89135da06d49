// Allocation sinking.
//
// A table allocated on trace which is only ever stored into (with constant keys) and otherwise
// only referenced by snapshots need not exist while the trace runs: its allocation and stores are
// "sunk" into the exits which need it, where [crate::compile::snap::restore] rebuilds the table
// from the snapshot. Sunk instructions carry [HINT_SINK] and generate no code.
//
// Anything else a table is used for (a load, a call argument, a comparison, a PHI, being stored
// into a table which is not itself sunk, being written back to the stack at the end of the trace)
// makes it escape.

use index_vec::{index_vec, IndexVec};
use vob::Vob;

use crate::compile::{
    jit_ir::{Field, InstIdx, JitIr, Opcode, Operand, HINT_SINK},
    trace::{TraceIr, TraceLink},
};

pub(crate) fn sink(tir: &mut TraceIr) {
    let ir = &tir.ir;
    let n = ir.len();
    let loop_idx = ir.loop_idx();
    let in_body = |i: InstIdx| loop_idx.map(|l| i > l).unwrap_or(false);
    let is_tnew = |ir: &JitIr, i: InstIdx| ir.inst(i).op == Opcode::TNew;

    // The table each array or hash slot reference points into, if that table is a candidate.
    let mut owner: IndexVec<InstIdx, Option<InstIdx>> = index_vec![None; n];
    let mut escaped = Vob::from_elem(false, n);
    // (table, value) pairs where a candidate value is stored into a candidate table.
    let mut nested = Vec::new();

    for (i, inst) in ir.insts() {
        // A use at `i` of candidate `t` which would otherwise be fine.
        let mut uses = Vec::new();
        match inst.op {
            Opcode::FLoad if inst.field() == Field::TabArray => {
                if let Some(t) = inst.a.as_var().filter(|t| is_tnew(ir, *t)) {
                    owner[i] = Some(t);
                    uses.push(t);
                }
            }
            Opcode::Aref => {
                let t = inst.a.as_var().and_then(|arr| owner[arr]);
                let k = inst.b.as_ref().and_then(|k| ir.const_of(k)).and_then(|k| k.as_int());
                match (t, k) {
                    (Some(t), Some(k)) if k >= 0 && (k as u64) < u64::from(ir.inst(t).a.lit()) => {
                        owner[i] = Some(t);
                        uses.push(t);
                    }
                    (Some(t), _) => {
                        escaped.set(t.index(), true);
                    }
                    _ => (),
                }
            }
            Opcode::NewRef => {
                let t = inst.a.as_var().filter(|t| is_tnew(ir, *t));
                let k = inst.b.as_ref().and_then(|k| ir.const_of(k)).and_then(|k| k.to_tvalue());
                match (t, k) {
                    (Some(t), Some(_)) => {
                        owner[i] = Some(t);
                        uses.push(t);
                    }
                    (Some(t), None) => {
                        escaped.set(t.index(), true);
                    }
                    _ => (),
                }
            }
            Opcode::AStore | Opcode::HStore => {
                let want = if inst.op == Opcode::AStore {
                    Opcode::Aref
                } else {
                    Opcode::NewRef
                };
                let rt = inst.a.as_var().and_then(|r| owner[r].map(|t| (r, t)));
                match rt {
                    Some((r, t)) if ir.inst(r).op == want => uses.push(t),
                    Some((_, t)) => {
                        escaped.set(t.index(), true);
                    }
                    None => (),
                }
                let t = rt.map(|(_, t)| t);
                if let Some(v) = inst.b.as_var().filter(|v| is_tnew(ir, *v)) {
                    match t {
                        Some(t) => nested.push((t, v)),
                        None => {
                            escaped.set(v.index(), true);
                        }
                    }
                }
            }
            _ => {
                for x in inst.vars() {
                    if is_tnew(ir, x) {
                        escaped.set(x.index(), true);
                    } else if let Some(t) = owner[x] {
                        escaped.set(t.index(), true);
                    }
                }
            }
        }
        for t in uses {
            if in_body(i) && !in_body(t) {
                escaped.set(t.index(), true);
            }
        }
    }

    // Whatever the last snapshot holds is written back to the stack unless the trace ends by
    // exiting through it, or by looping via PHIs.
    let last_escapes = !matches!(
        (tir.link, loop_idx),
        (TraceLink::Interp | TraceLink::Return | TraceLink::DownRec | TraceLink::Stitch, _)
            | (TraceLink::Loop, Some(_))
    );
    for (k, snap) in tir.snaps.iter().enumerate() {
        for e in &tir.snapmap[snap.mapofs..snap.mapofs + snap.nent] {
            if let Operand::Var(x) = e.val {
                if !is_tnew(ir, x) {
                    continue;
                }
                if (k + 1 == tir.snaps.len() && last_escapes) || (in_body(snap.iref) && !in_body(x))
                {
                    escaped.set(x.index(), true);
                }
            }
        }
    }

    // A table stored into an escaping table escapes with it.
    let mut changed = true;
    while changed {
        changed = false;
        for (t, v) in &nested {
            if escaped[t.index()] && !escaped[v.index()] {
                escaped.set(v.index(), true);
                changed = true;
            }
        }
    }

    let mut sunk = Vec::new();
    for (i, inst) in ir.insts() {
        let t = match inst.op {
            Opcode::TNew => Some(i),
            Opcode::AStore | Opcode::HStore => inst.a.as_var().and_then(|r| owner[r]),
            _ => owner[i],
        };
        if let Some(t) = t {
            if !escaped[t.index()] {
                sunk.push(i);
            }
        }
    }
    for i in sunk {
        tir.ir.set_hint(i, HINT_SINK);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::compile::{
        jit_ir::{Inst, Opnd, Ty},
        opt::test_util::{setup, sload, tir},
        snap::AbstractStack,
    };

    /// Allocate a table with an array part of `asize` and store `v` at index 1 and key `k`.
    fn fill(tir: &mut TraceIr, asize: u32, k: Operand, v: Operand) -> (Operand, Vec<InstIdx>) {
        let ir = &mut tir.ir;
        let t = ir
            .emit(Inst::new(Opcode::TNew, Ty::Tab, Opnd::Lit(asize), Opnd::Lit(0)))
            .unwrap();
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
        let st1 = ir
            .emit(Inst::new(Opcode::AStore, Ty::Void, Opnd::Ref(aref), Opnd::Ref(v)))
            .unwrap();
        let nref = ir
            .emit(Inst::new(Opcode::NewRef, Ty::Ptr, Opnd::Ref(t), Opnd::Ref(k)))
            .unwrap();
        let st2 = ir
            .emit(Inst::new(Opcode::HStore, Ty::Void, Opnd::Ref(nref), Opnd::Ref(v)))
            .unwrap();
        let all = [t, arr, aref, st1, nref, st2]
            .iter()
            .map(|x| x.as_var().unwrap())
            .collect();
        (t, all)
    }

    #[test]
    fn snapshot_only_tables_are_sunk() {
        let (mut heap, pc) = setup();
        let mut tir = tir(pc);
        let mut st = AbstractStack::new();
        tir.snapshot_add(&st, pc, 10, false).unwrap();
        let x = sload(&mut tir, 2, Ty::Num);
        let k = tir.ir.kgc(Ty::Str, heap.intern("k").addr()).unwrap();
        let (t, insts) = fill(&mut tir, 4, k, x);
        st.set(1, t).unwrap();
        tir.snapshot_add(&st, pc, 10, false).unwrap();
        let zero = tir.ir.knum(0.0).unwrap();
        tir.ir.guard2(Opcode::Gt, Ty::Num, x, zero).unwrap();
        tir.link = TraceLink::Interp;
        sink(&mut tir);
        for i in insts {
            assert!(tir.ir.hint(i, HINT_SINK), "{}", tir.ir.display_inst(i));
        }
        assert!(!tir.ir.hint(x.as_var().unwrap(), HINT_SINK));
        assert!(tir.to_string().contains("TNEW"));
    }

    #[test]
    fn escaping_tables_are_not_sunk() {
        let (mut heap, pc) = setup();
        let mut tir = tir(pc);
        let mut st = AbstractStack::new();
        tir.snapshot_add(&st, pc, 10, false).unwrap();
        let x = sload(&mut tir, 2, Ty::Num);
        let k = tir.ir.kgc(Ty::Str, heap.intern("k").addr()).unwrap();
        let (inner, inner_insts) = fill(&mut tir, 2, k, x);
        // The outer table holds the inner one and is live at the end of the trace.
        let (outer, outer_insts) = fill(&mut tir, 2, k, inner);
        st.set(1, outer).unwrap();
        tir.snapshot_add(&st, pc, 10, false).unwrap();
        tir.link = TraceLink::Root(1);
        sink(&mut tir);
        for i in inner_insts.into_iter().chain(outer_insts) {
            assert!(!tir.ir.hint(i, HINT_SINK), "{}", tir.ir.display_inst(i));
        }
    }

    #[test]
    fn out_of_bounds_stores_escape() {
        let (mut heap, pc) = setup();
        let mut tir = tir(pc);
        let mut st = AbstractStack::new();
        tir.snapshot_add(&st, pc, 10, false).unwrap();
        let x = sload(&mut tir, 2, Ty::Num);
        let k = tir.ir.kgc(Ty::Str, heap.intern("k").addr()).unwrap();
        // Index 1 is outside an array part of size 1.
        let (t, insts) = fill(&mut tir, 1, k, x);
        st.set(1, t).unwrap();
        tir.snapshot_add(&st, pc, 10, false).unwrap();
        tir.link = TraceLink::Interp;
        sink(&mut tir);
        assert!(!tir.ir.hint(insts[0], HINT_SINK));
    }
}
