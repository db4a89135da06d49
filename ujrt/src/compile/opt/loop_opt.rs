//! Loop optimisation by copy-substitution.
//!
//! A trace which loops back to its own start is recorded as a single iteration. This pass copies
//! that iteration (the *pre-roll*) after a `LOOP` instruction, substituting each instruction's
//! operands with their copies. Every copy goes through [JitIr::emit], so folding and CSE see both
//! iterations at once: an instruction whose operands are the same in both iterations CSEs to its
//! pre-roll version, which hoists it out of the loop body without any explicit invariant code
//! motion.
//!
//! Stack slots are the only way values flow between iterations. A slot load in the body is
//! substituted with the value the loop snapshot says the slot holds at the end of the pre-roll.
//! Where a pre-roll value `x` is used by the body and its body copy `x'` differs, `PHI x x'` ties
//! them together: at the back-edge, `x'` becomes the next iteration's `x`.
//!
//! If the types of a slot at the start and end of an iteration differ, the loop is not type
//! stable and the pass fails with [TraceError::TypeInstable]. [undo] then removes everything the
//! pass added, and the trace instead loops by jumping back to its own start.

use index_vec::IndexVec;
use vob::Vob;

use crate::{
    compile::{
        jit_ir::{Inst, InstIdx, Opcode, Operand, Opnd, Ty, HINT_PHI, HINT_SCEV},
        snap::{SnapEntry, Snapshot},
        trace::TraceIr,
        CompilationError, TraceError,
    },
    params::{Opt, OptFlags},
};
use std::cell::Cell;

pub(crate) fn loop_opt(tir: &mut TraceIr, opt: OptFlags) -> Result<(), CompilationError> {
    if tir.is_side() || tir.snaps.is_empty() || tir.ir.loop_idx().is_some() {
        return Err(TraceError::TypeInstable.into());
    }
    match unroll(tir, opt) {
        Err(CompilationError::TraceError(TraceError::GuardAlwaysFails)) => {
            Err(TraceError::TypeInstable.into())
        }
        r => r,
    }
}

/// Remove the `LOOP` instruction and everything after it, along with the loop body's snapshots.
pub(crate) fn undo(tir: &mut TraceIr) {
    if let Some(l) = tir.ir.loop_idx() {
        let keep = tir
            .snaps
            .iter()
            .position(|s| s.iref > l)
            .unwrap_or(tir.snaps.len());
        if let Some(s) = tir.snaps.get(keep) {
            tir.snapmap.truncate(s.mapofs);
        }
        tir.snaps.truncate(keep);
        tir.ir.truncate(l.index());
    }
    tir.ir.clear_hints(HINT_PHI);
}

fn unroll(tir: &mut TraceIr, opt: OptFlags) -> Result<(), CompilationError> {
    let loopsnap = tir.snaps.len() - 1;
    let loopmap = tir.snap_entries(loopsnap).to_vec();
    let invar = tir.ir.next_idx();
    tir.ir
        .push(Inst::new(Opcode::Loop, Ty::Void, Opnd::None, Opnd::None))?;

    let mut subst: IndexVec<InstIdx, Operand> =
        (0..invar.index()).map(|i| Operand::Var(InstIdx::from_usize(i))).collect();
    let sub = |subst: &IndexVec<InstIdx, Operand>, x: Opnd| match x {
        Opnd::Ref(Operand::Var(i)) => Opnd::Ref(subst[i]),
        x => x,
    };
    let mut snapno = 0;
    for i in (0..invar.index()).map(InstIdx::from_usize) {
        while snapno < loopsnap && tir.snaps[snapno].iref <= i {
            copy_snap(tir, snapno, &loopmap, &subst);
            snapno += 1;
        }
        let inst = *tir.ir.inst(i);
        match inst.op {
            Opcode::Nop => continue,
            Opcode::SLoad => {
                let v = loopmap
                    .iter()
                    .find(|e| u32::from(e.slot) == inst.a.lit())
                    .map(|e| e.val)
                    .unwrap_or(Operand::Var(i));
                if tir.ir.ty_of(v) != inst.ty {
                    return Err(TraceError::TypeInstable.into());
                }
                subst[i] = v;
            }
            Opcode::PVal | Opcode::Retf | Opcode::Loop | Opcode::Phi => {
                return Err(TraceError::TypeInstable.into());
            }
            // The bounds check on the loop's start value holds for every later iteration.
            Opcode::Abc if tir.ir.hint(i, HINT_SCEV) && opt.has(Opt::Abc) => (),
            _ => {
                let copy = Inst {
                    a: sub(&subst, inst.a),
                    b: sub(&subst, inst.b),
                    ..inst
                };
                subst[i] = tir.ir.emit(copy)?;
            }
        }
    }
    while snapno < loopsnap {
        copy_snap(tir, snapno, &loopmap, &subst);
        snapno += 1;
    }

    // Pre-roll values the body uses which change from one iteration to the next need PHIs.
    let mut used = Vob::from_elem(false, invar.index());
    for (_, inst) in tir.ir.insts().skip(invar.index() + 1) {
        for x in inst.vars().filter(|x| *x < invar) {
            used.set(x.index(), true);
        }
    }
    for snap in &tir.snaps[loopsnap + 1..] {
        for e in &tir.snapmap[snap.mapofs..snap.mapofs + snap.nent] {
            if let Operand::Var(x) = e.val {
                if x < invar {
                    used.set(x.index(), true);
                }
            }
        }
    }
    let phis = used
        .iter_set_bits(..)
        .map(InstIdx::from_usize)
        .filter(|x| subst[*x] != Operand::Var(*x))
        .collect::<Vec<_>>();
    for left in phis {
        let right = subst[left];
        let ty = tir.ir.inst(left).ty;
        if tir.ir.ty_of(right) != ty {
            return Err(TraceError::TypeInstable.into());
        }
        tir.ir.push(Inst::new(
            Opcode::Phi,
            ty,
            Opnd::Ref(Operand::Var(left)),
            Opnd::Ref(right),
        ))?;
        tir.ir.set_hint(left, HINT_PHI);
        if let Operand::Var(r) = right {
            tir.ir.set_hint(r, HINT_PHI);
        }
    }
    Ok(())
}

/// Copy pre-roll snapshot `snapno` to the current end of the loop body. Slots the snapshot does
/// not mention hold whatever they held at the start of the iteration, which is what the loop
/// snapshot says.
fn copy_snap(
    tir: &mut TraceIr,
    snapno: usize,
    loopmap: &[SnapEntry],
    subst: &IndexVec<InstIdx, Operand>,
) {
    let iref = tir.ir.next_idx();
    let snap = &tir.snaps[snapno];
    let (nslots, baseslot, pc) = (snap.nslots, snap.baseslot, snap.pc);
    let mut ents = tir
        .snap_entries(snapno)
        .iter()
        .map(|e| SnapEntry {
            val: match e.val {
                Operand::Var(x) => subst[x],
                k => k,
            },
            ..*e
        })
        .collect::<Vec<_>>();
    for e in loopmap {
        if e.slot < nslots && !ents.iter().any(|x| x.slot == e.slot) {
            ents.push(*e);
        }
    }
    ents.sort_by_key(|e| e.slot);

    // A snapshot no instruction refers to is replaced.
    if let Some(last) = tir.snaps.last() {
        if last.iref == iref && last.iref > tir.ir.loop_idx().unwrap_or(iref) {
            let last = tir.snaps.pop().unwrap();
            tir.snapmap.truncate(last.mapofs);
        }
    }
    let mapofs = tir.snapmap.len();
    tir.snapmap.extend_from_slice(&ents);
    tir.snaps.push(Snapshot {
        mapofs,
        nent: ents.len(),
        nslots,
        baseslot,
        iref,
        pc,
        count: Cell::new(0),
    });
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::compile::{
        opt::test_util::{assert_ir, setup, sload, tir},
        snap::AbstractStack,
        trace::TraceLink,
    };

    #[test]
    fn loop_carried_values_get_phis() {
        let (_heap, pc) = setup();
        let mut tir = tir(pc);
        let mut st = AbstractStack::new();
        st.maxslot = 3;
        tir.snapshot_add(&st, pc, 10, false).unwrap();
        let i0 = sload(&mut tir, 2, Ty::Num);
        let s0 = sload(&mut tir, 3, Ty::Num);
        let n = sload(&mut tir, 4, Ty::Num);
        let s1 = tir.ir.emit2(Opcode::Add, Ty::Num, s0, i0).unwrap();
        let one = tir.ir.knum(1.0).unwrap();
        let i1 = tir.ir.emit2(Opcode::Add, Ty::Num, i0, one).unwrap();
        st.set(0, i1).unwrap();
        st.set(1, s1).unwrap();
        st.set(2, n).unwrap();
        tir.snapshot_add(&st, pc, 10, false).unwrap();
        tir.ir.guard2(Opcode::Le, Ty::Num, i1, n).unwrap();
        tir.snapshot_add(&st, pc, 10, false).unwrap();
        tir.link = TraceLink::Loop;

        loop_opt(&mut tir, OptFlags::default()).unwrap();
        tir.ir.assert_well_formed();
        assert_ir(
            &tir,
            "...
             {{i0}} > num SLOAD  #2 T
             {{s0}} > num SLOAD  #3 T
             {{n}} > num SLOAD  #4 T
             {{s1}}   num ADD    {{s0}} {{i0}}  ; phi
             {{i1}}   num ADD    {{i0}} +1  ; phi
             ----        SNAP   #1 [ 2:{{i1}} 3:{{s1}} ]
             {{g1}} > num LE     {{i1}} {{n}}
             ----        SNAP   #2 [ 2:{{i1}} 3:{{s1}} ]
             {{l}}   --- LOOP
             ----        SNAP   #3 [ 2:{{i1}} 3:{{s1}} ]
             {{s2}}   num ADD    {{s1}} {{i1}}  ; phi
             {{i2}}   num ADD    {{i1}} +1  ; phi
             ----        SNAP   #4 [ 2:{{i2}} 3:{{s2}} ]
             {{g2}} > num LE     {{i2}} {{n}}
             {{p1}}   num PHI    {{s1}} {{s2}}
             {{p2}}   num PHI    {{i1}} {{i2}}",
        );
    }

    #[test]
    fn type_instability_is_undone() {
        let (mut heap, pc) = setup();
        let mut tir = tir(pc);
        let mut st = AbstractStack::new();
        tir.snapshot_add(&st, pc, 10, false).unwrap();
        let x = sload(&mut tir, 2, Ty::Num);
        let k = tir.ir.knum(0.0).unwrap();
        tir.ir.guard2(Opcode::Gt, Ty::Num, x, k).unwrap();
        let s = heap.intern("s");
        let ks = tir.ir.kgc(Ty::Str, s.addr()).unwrap();
        st.set(0, ks).unwrap();
        tir.snapshot_add(&st, pc, 10, false).unwrap();
        let len = tir.ir.len();
        let nsnaps = tir.snaps.len();
        tir.link = TraceLink::Loop;

        assert!(matches!(
            loop_opt(&mut tir, OptFlags::default()),
            Err(CompilationError::TraceError(TraceError::TypeInstable))
        ));
        undo(&mut tir);
        assert_eq!(tir.ir.len(), len);
        assert_eq!(tir.snaps.len(), nsnaps);
        assert_eq!(tir.ir.loop_idx(), None);
        tir.ir.assert_well_formed();
    }
}
