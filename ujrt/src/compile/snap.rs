//! Snapshots: what the interpreter's stack looks like at a given point of a trace.
//!
//! A snapshot maps stack slots to the IR values they hold. Slots are numbered relative to the
//! trace's base pointer: slot `s` lives at `base + (s - 2) * 16`, so slots 0 and 1 are the
//! function and frame link of the frame the trace started in, and slot 2 is that frame's first
//! slot. Slots whose value is the unmodified value already in memory are left out.
//!
//! When a guard fails, [restore] writes the values of the guard's snapshot back to the stack and
//! tells the interpreter where to resume. When a side trace starts at a guard, [replay] seeds the
//! side trace with the parent's values at that guard.

use std::{cell::Cell, fmt::Write};
use vob::Vob;

use super::{
    exit::JitContext,
    jit_ir::{Const, Inst, InstIdx, JitIr, Opcode, Operand, Opnd, Ty, HINT_SINK},
    trace::{Trace, TraceIr},
    CompilationError, TraceError,
};
use crate::vm::{
    bc::{Op, Pc},
    heap::Heap,
    value::TValue,
    ExitState,
};

/// The slot holds a frame's function or link.
pub(crate) const SNAP_FRAME: u8 = 1;

/// The maximum number of slots a trace may touch.
pub(crate) const MAX_SLOTS: usize = 250;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SnapEntry {
    pub(crate) slot: u16,
    pub(crate) flags: u8,
    pub(crate) val: Operand,
}

#[derive(Debug)]
pub(crate) struct Snapshot {
    /// The offset of this snapshot's first entry in the trace's snapshot map.
    pub(crate) mapofs: usize,
    pub(crate) nent: usize,
    /// The number of slots valid at this point, including frame slots.
    pub(crate) nslots: u16,
    /// The slot of the current frame's base.
    pub(crate) baseslot: u16,
    /// The first instruction this snapshot covers.
    pub(crate) iref: InstIdx,
    /// Where the interpreter resumes.
    pub(crate) pc: Pc,
    /// How often has this exit been taken?
    pub(crate) count: Cell<u16>,
}

/// The recorder's view of the stack.
pub(crate) struct AbstractStack {
    /// The value of each slot, if known on trace.
    pub(crate) slots: Vec<Option<Operand>>,
    pub(crate) baseslot: usize,
    /// The number of slots of the current frame which may hold live values.
    pub(crate) maxslot: usize,
    /// The base slots of the frames above the trace's starting frame.
    pub(crate) frames: Vec<usize>,
}

impl AbstractStack {
    pub(crate) fn new() -> Self {
        AbstractStack {
            slots: vec![None; MAX_SLOTS],
            baseslot: 2,
            maxslot: 0,
            frames: Vec::new(),
        }
    }

    /// The value of slot `s` of the current frame.
    pub(crate) fn get(&self, s: usize) -> Option<Operand> {
        self.slots.get(self.baseslot + s).copied().flatten()
    }

    pub(crate) fn set(&mut self, s: usize, v: Operand) -> Result<(), CompilationError> {
        let i = self.baseslot + s;
        if i >= MAX_SLOTS {
            return Err(TraceError::StackOverflow.into());
        }
        self.slots[i] = Some(v);
        if s >= self.maxslot {
            self.maxslot = s + 1;
        }
        Ok(())
    }

    fn is_frame_slot(&self, s: usize) -> bool {
        self.frames.iter().any(|b| s + 2 == *b || s + 1 == *b)
    }
}

impl TraceIr {
    /// Take a snapshot of `st` with the interpreter resuming at `pc`.
    ///
    /// If no instruction, or (when `merge` is set) no guard, has been emitted since the last
    /// snapshot, that snapshot is replaced instead. Snapshot #0 is never replaced, since its `pc`
    /// is the trace's start.
    pub(crate) fn snapshot_add(
        &mut self,
        st: &AbstractStack,
        pc: Pc,
        maxsnap: usize,
        merge: bool,
    ) -> Result<(), CompilationError> {
        if let Some(last) = self.snaps.last() {
            if last.iref.index() == self.ir.len() || (merge && !self.ir.guardemit) {
                if self.snaps.len() == 1 {
                    self.ir.push(Inst::nop())?;
                } else {
                    let last = self.snaps.pop().unwrap();
                    self.snapmap.truncate(last.mapofs);
                }
            }
        }
        if self.snaps.len() >= maxsnap {
            return Err(TraceError::SnapshotOverflow.into());
        }
        self.ir.guardemit = false;
        let nslots = st.baseslot + st.maxslot;
        let retf = self.ir.chain(Opcode::Retf).next();
        let mapofs = self.snapmap.len();
        for s in 0..nslots {
            let v = match st.slots[s] {
                Some(v) => v,
                None => continue,
            };
            if let Operand::Var(i) = v {
                let inst = self.ir.inst(i);
                // An unmodified slot is already correct in memory.
                if inst.op == Opcode::SLoad
                    && inst.a.lit() as usize == s
                    && retf.map(|r| i > r).unwrap_or(true)
                {
                    continue;
                }
            }
            self.snapmap.push(SnapEntry {
                slot: s as u16,
                flags: if st.is_frame_slot(s) { SNAP_FRAME } else { 0 },
                val: v,
            });
        }
        self.snaps.push(Snapshot {
            mapofs,
            nent: self.snapmap.len() - mapofs,
            nslots: nslots as u16,
            baseslot: st.baseslot as u16,
            iref: self.ir.next_idx(),
            pc,
            count: Cell::new(0),
        });
        Ok(())
    }

    /// The entries of snapshot `snapno`.
    pub(crate) fn snap_entries(&self, snapno: usize) -> &[SnapEntry] {
        let snap = &self.snaps[snapno];
        &self.snapmap[snap.mapofs..snap.mapofs + snap.nent]
    }

    /// Remove the entries of the most recent snapshot for slots of the current frame which are
    /// not live at its `pc`.
    pub(crate) fn snap_shrink(&mut self, maxslot: usize) {
        let (mapofs, nent, pc, baseslot) = match self.snaps.last() {
            Some(s) => (s.mapofs, s.nent, s.pc, usize::from(s.baseslot)),
            None => return,
        };
        let live = usedef(pc, maxslot);
        let mut kept = Vec::with_capacity(nent);
        for e in &self.snapmap[mapofs..mapofs + nent] {
            let s = usize::from(e.slot);
            if s < baseslot || live.get(s - baseslot).unwrap_or(false) {
                kept.push(*e);
            }
        }
        self.snapmap.truncate(mapofs);
        self.snapmap.extend_from_slice(&kept);
        let snap = self.snaps.last_mut().unwrap();
        snap.nent = kept.len();
    }

    /// Format the snapshots for display.
    pub(crate) fn display_snaps(&self) -> String {
        let mut s = String::new();
        for (i, snap) in self.snaps.iter().enumerate() {
            write!(s, "SNAP #{i} ").ok();
            self.fmt_snap(&mut s, snap);
            s.push('\n');
        }
        s
    }

    pub(crate) fn fmt_snap(&self, out: &mut String, snap: &Snapshot) {
        out.push('[');
        for e in &self.snapmap[snap.mapofs..snap.mapofs + snap.nent] {
            let sep = if e.flags & SNAP_FRAME != 0 { "|" } else { "" };
            write!(out, " {}:{sep}{}", e.slot, self.ir.display_operand(e.val)).ok();
        }
        out.push_str(" ]");
    }
}

/// Which of the first `maxslot` slots of the current frame may be read before being written when
/// execution continues at `pc`? The analysis scans forward over straight-line code and gives up
/// (treating everything not yet written as live) at the first branch.
pub(crate) fn usedef(pc: Pc, maxslot: usize) -> Vob {
    // `live[s]`: read before written. `def[s]`: written before read.
    let mut live = Vob::from_elem(false, maxslot);
    let mut def = Vob::from_elem(false, maxslot);
    let use_ = |live: &mut Vob, def: &Vob, s: usize| {
        if s < maxslot && !def[s] {
            live.set(s, true);
        }
    };
    let def_ = |live: &Vob, def: &mut Vob, s: usize| {
        if s < maxslot && !live[s] {
            def.set(s, true);
        }
    };
    // Everything not yet written is live.
    let rest_live = |live: &mut Vob, def: &Vob| {
        for s in 0..maxslot {
            if !def[s] {
                live.set(s, true);
            }
        }
    };
    let mut pc = pc;
    for _ in 0..USEDEF_MAX {
        let ins = pc.get();
        let (a, b, c, d) = (
            usize::from(ins.a()),
            usize::from(ins.b()),
            usize::from(ins.c()),
            usize::from(ins.d()),
        );
        match ins.op() {
            Op::IsLt | Op::IsGe | Op::IsLe | Op::IsGt | Op::IsEqV | Op::IsNeV => {
                use_(&mut live, &def, a);
                use_(&mut live, &def, d);
                rest_live(&mut live, &def);
                return live;
            }
            Op::IsEqS | Op::IsNeS | Op::IsEqN | Op::IsNeN | Op::IsEqP | Op::IsNeP => {
                use_(&mut live, &def, a);
                rest_live(&mut live, &def);
                return live;
            }
            Op::IsT | Op::IsF => {
                use_(&mut live, &def, d);
                rest_live(&mut live, &def);
                return live;
            }
            Op::Mov | Op::Not | Op::Unm | Op::Len => {
                use_(&mut live, &def, d);
                def_(&live, &mut def, a);
            }
            Op::AddVN | Op::SubVN | Op::MulVN | Op::DivVN | Op::ModVN | Op::AddNV | Op::SubNV
            | Op::MulNV | Op::DivNV | Op::ModNV => {
                use_(&mut live, &def, b);
                def_(&live, &mut def, a);
            }
            Op::AddVV | Op::SubVV | Op::MulVV | Op::DivVV | Op::ModVV | Op::Pow => {
                use_(&mut live, &def, b);
                use_(&mut live, &def, c);
                def_(&live, &mut def, a);
            }
            Op::Cat => {
                for s in b..=c {
                    use_(&mut live, &def, s);
                }
                def_(&live, &mut def, a);
            }
            Op::KStr | Op::KShort | Op::KNum | Op::KPri | Op::GGet | Op::TNew | Op::FNew => {
                def_(&live, &mut def, a);
            }
            Op::KNil => {
                for s in a..=d {
                    def_(&live, &mut def, s);
                }
            }
            Op::GSet => use_(&mut live, &def, a),
            Op::TGetV => {
                use_(&mut live, &def, b);
                use_(&mut live, &def, c);
                def_(&live, &mut def, a);
            }
            Op::TGetS | Op::TGetB => {
                use_(&mut live, &def, b);
                def_(&live, &mut def, a);
            }
            Op::TSetV => {
                use_(&mut live, &def, a);
                use_(&mut live, &def, b);
                use_(&mut live, &def, c);
            }
            Op::TSetS | Op::TSetB => {
                use_(&mut live, &def, a);
                use_(&mut live, &def, b);
            }
            Op::Call => {
                // The callee and its arguments are read; everything from the callee's slot
                // upwards is then overwritten by the call.
                use_(&mut live, &def, a);
                for s in a + 2..a + 1 + c {
                    use_(&mut live, &def, s);
                }
                for s in a..maxslot {
                    def_(&live, &mut def, s);
                }
                rest_live(&mut live, &def);
                return live;
            }
            Op::CallT => {
                use_(&mut live, &def, a);
                for s in a + 2..a + 1 + d {
                    use_(&mut live, &def, s);
                }
                return live;
            }
            Op::Ret => {
                for s in a..(a + d).saturating_sub(1) {
                    use_(&mut live, &def, s);
                }
                return live;
            }
            Op::Ret1 => {
                use_(&mut live, &def, a);
                return live;
            }
            Op::Ret0 => return live,
            Op::IterC => {
                for s in a - 3..a {
                    use_(&mut live, &def, s);
                }
                rest_live(&mut live, &def);
                return live;
            }
            Op::ForI => {
                for s in a..a + 3 {
                    use_(&mut live, &def, s);
                }
                rest_live(&mut live, &def);
                return live;
            }
            Op::Jmp => pc = pc.jump_target().prev(),
            _ => {
                rest_live(&mut live, &def);
                return live;
            }
        }
        pc = pc.next();
    }
    rest_live(&mut live, &def);
    live
}

/// How many instructions [usedef] looks at before giving up.
const USEDEF_MAX: usize = 256;

/// Seed the side trace `child` with the values of `parent`'s snapshot `snapno`.
///
/// Each value computed on the parent trace becomes a [Opcode::PVal] of the child, which the
/// assembler arranges to find wherever the parent left it. A value stored in several slots is
/// only inherited once.
pub(crate) fn replay(
    parent: &Trace,
    snapno: usize,
    child: &mut TraceIr,
    st: &mut AbstractStack,
) -> Result<(), CompilationError> {
    let ptir = &parent.tir;
    let snap = &ptir.snaps[snapno];
    st.baseslot = usize::from(snap.baseslot);
    st.maxslot = usize::from(snap.nslots) - st.baseslot;
    // A small bloom filter over parent references avoids searching for duplicates in the common
    // case of a reference being seen for the first time.
    let mut seen = 0u64;
    let mut pvals: Vec<(InstIdx, Operand)> = Vec::new();
    for e in ptir.snap_entries(snapno) {
        let v = match e.val {
            Operand::Const(c) => child.ir.intern(*ptir.ir.konst(c))?,
            Operand::Var(pref) => {
                if ptir.ir.hint(pref, HINT_SINK) {
                    return Err(TraceError::SunkReplay.into());
                }
                let bit = 1u64 << (pref.index() & 63);
                let dup = if seen & bit != 0 {
                    pvals.iter().find(|(p, _)| *p == pref).map(|(_, v)| *v)
                } else {
                    None
                };
                match dup {
                    Some(v) => v,
                    None => {
                        seen |= bit;
                        let ty = ptir.ir.inst(pref).ty;
                        let v = Operand::Var(child.ir.push(Inst::new(
                            Opcode::PVal,
                            ty,
                            Opnd::Lit(pref.index() as u32),
                            Opnd::None,
                        ))?);
                        pvals.push((pref, v));
                        v
                    }
                }
            }
        };
        let s = usize::from(e.slot);
        st.slots[s] = Some(v);
        // Frame links are always recorded, so they tell us where the inlined frames start.
        if e.flags & SNAP_FRAME != 0 && ptir.snap_link_slot(e) {
            st.frames.push(s + 1);
        }
    }
    st.frames.sort_unstable();
    Ok(())
}

impl TraceIr {
    /// Is snapshot entry `e` a frame link (as opposed to a frame's function)?
    fn snap_link_slot(&self, e: &SnapEntry) -> bool {
        matches!(e.val, Operand::Const(c) if matches!(self.ir.konst(c), Const::Link(..)))
    }
}

/// Read the raw 64 bit value of instruction `i` of `trace` at an exit.
fn exit_value(trace: &Trace, ctx: &JitContext, i: InstIdx) -> u64 {
    let rs = trace.regsp[i];
    if let Some(s) = rs.spill {
        ctx.spill[usize::from(s)]
    } else if let Some(r) = rs.reg {
        ctx.reg(r)
    } else {
        panic!(
            "no location for {} at exit",
            trace.tir.ir.display_inst(i)
        )
    }
}

/// The value of `x` at an exit of `trace`, as it would be stored on the stack.
fn exit_tvalue(
    trace: &Trace,
    ctx: &JitContext,
    heap: &mut Heap,
    x: Operand,
    snap_iref: InstIdx,
) -> TValue {
    let ir = &trace.tir.ir;
    match x {
        Operand::Const(c) => ir
            .konst(c)
            .to_tvalue()
            .unwrap_or_else(|| panic!("constant {} has no stack representation", ir.display_operand(x))),
        Operand::Var(i) => {
            let inst = ir.inst(i);
            if ir.hint(i, HINT_SINK) {
                return unsink(trace, ctx, heap, i, snap_iref);
            }
            match inst.ty {
                Ty::Nil => TValue::NIL,
                Ty::False => TValue::bool(false),
                Ty::True => TValue::bool(true),
                Ty::Int => TValue::num(exit_value(trace, ctx, i) as i64 as f64),
                ty => match ty.tag() {
                    Some(tag) => TValue::from_raw(exit_value(trace, ctx, i), tag),
                    None => panic!("{} has no stack representation", ir.display_inst(i)),
                },
            }
        }
    }
}

/// Materialise the sunk table allocated by instruction `tnew`, applying the sunk stores made to it
/// before `snap_iref`.
fn unsink(trace: &Trace, ctx: &JitContext, heap: &mut Heap, tnew: InstIdx, snap_iref: InstIdx) -> TValue {
    let ir = &trace.tir.ir;
    let t = ir.inst(tnew);
    let (asize, hsize) = (t.a.lit() as usize, t.b.lit() as usize);
    let tab = heap.new_table(asize, hsize);
    for (i, st) in ir.insts() {
        if i >= snap_iref {
            break;
        }
        if !st.op.is_store() || !ir.hint(i, HINT_SINK) {
            continue;
        }
        let (key, owner) = match sunk_store_target(ir, st) {
            Some(x) => x,
            None => continue,
        };
        if owner != tnew {
            continue;
        }
        let v = match st.b {
            Opnd::Ref(v) => exit_tvalue(trace, ctx, heap, v, snap_iref),
            _ => continue,
        };
        // Sunk stores only use constant keys which are neither nil nor NaN.
        tab.as_mut().set(&key, v).ok();
    }
    TValue::tab(tab)
}

/// If `st` is a store to a sunk table, return its (constant) key and the table's allocation.
pub(crate) fn sunk_store_target(ir: &JitIr, st: &Inst) -> Option<(TValue, InstIdx)> {
    let r = ir.inst(st.a.as_var()?);
    match r.op {
        Opcode::Aref => {
            let arr = ir.inst(r.a.as_var()?);
            let idx = ir.const_of(r.b.as_ref()?)?.as_int()?;
            Some((TValue::num(idx as f64), arr.a.as_var()?))
        }
        Opcode::NewRef => {
            let key = ir.const_of(r.b.as_ref()?)?.to_tvalue()?;
            Some((key, r.a.as_var()?))
        }
        _ => None,
    }
}

/// Restore the interpreter's state from snapshot `snapno` of `trace`, after a guard failed.
///
/// `stack_base` is the stack index the trace's base pointer pointed to at the exit.
pub(crate) fn restore(
    trace: &Trace,
    snapno: usize,
    ctx: &JitContext,
    stack: &mut [TValue],
    stack_base: usize,
    heap: &mut Heap,
) -> ExitState {
    let tir = &trace.tir;
    let snap = &tir.snaps[snapno];
    for e in tir.snap_entries(snapno) {
        let v = exit_tvalue(trace, ctx, heap, e.val, snap.iref);
        stack[stack_base + usize::from(e.slot) - 2] = v;
    }
    let base = stack_base + usize::from(snap.baseslot) - 2;
    let ins = snap.pc.get();
    let nslots = usize::from(snap.nslots);
    let frame_top = |n: usize| nslots.saturating_sub(usize::from(snap.baseslot) + n);
    let multres = match ins.op() {
        Op::CallM => frame_top(usize::from(ins.a()) + 2 + usize::from(ins.c())),
        Op::RetM => frame_top(usize::from(ins.a()) + usize::from(ins.d())),
        _ => 0,
    };
    ExitState {
        pc: snap.pc,
        base,
        multres,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        compile::jit_ir::SLOAD_TYPECHECK,
        params::OptFlags,
        vm::{bc::ProtoBuilder, heap::Heap},
    };

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
    fn unmodified_slots_are_omitted() {
        let mut heap = Heap::new();
        let mut b = ProtoBuilder::new("f", 0, 4);
        b.ad(Op::Ret0, 0, 1);
        let p = b.finish(&mut heap);
        let mut tir = TraceIr::new(p.pc_at(1), 100, 100, OptFlags::default());
        let mut st = AbstractStack::new();
        let x = sload(&mut tir.ir, 2, Ty::Num);
        st.set(0, x).unwrap();
        let k = tir.ir.knum(1.0).unwrap();
        let y = tir.ir.emit2(Opcode::Add, Ty::Num, x, k).unwrap();
        st.set(1, y).unwrap();
        st.set(2, x).unwrap();
        tir.snapshot_add(&st, p.pc_at(1), 10, false).unwrap();
        let es = tir.snap_entries(0);
        assert_eq!(es.len(), 2);
        assert_eq!((es[0].slot, es[0].val), (3, y));
        // Slot 4 holds slot 2's value, which is not in memory there.
        assert_eq!((es[1].slot, es[1].val), (4, x));
        assert_eq!(tir.snaps[0].nslots, 5);
    }

    #[test]
    fn merging() {
        let mut heap = Heap::new();
        let mut b = ProtoBuilder::new("f", 0, 4);
        b.ad(Op::Ret0, 0, 1);
        let p = b.finish(&mut heap);
        let pc = p.pc_at(1);
        let mut tir = TraceIr::new(pc, 100, 100, OptFlags::default());
        let st = AbstractStack::new();
        tir.snapshot_add(&st, pc, 10, false).unwrap();
        // Snapshot #0 is preserved by padding with a NOP.
        tir.snapshot_add(&st, pc, 10, false).unwrap();
        assert_eq!(tir.snaps.len(), 2);
        assert_eq!(tir.ir.len(), 1);
        // No instruction since snapshot #1: it's replaced.
        tir.snapshot_add(&st, pc, 10, false).unwrap();
        assert_eq!(tir.snaps.len(), 2);
        // No guard since snapshot #1 and merging requested: replaced.
        let x = sload(&mut tir.ir, 2, Ty::Num);
        tir.ir.guardemit = false;
        tir.ir.emit2(Opcode::Add, Ty::Num, x, x).unwrap();
        tir.snapshot_add(&st, pc, 10, true).unwrap();
        assert_eq!(tir.snaps.len(), 2);
        // A guard in between: kept.
        let k = tir.ir.knum(0.0).unwrap();
        tir.ir.guard2(Opcode::Lt, Ty::Num, x, k).unwrap();
        tir.snapshot_add(&st, pc, 10, true).unwrap();
        assert_eq!(tir.snaps.len(), 3);
        assert!(matches!(
            {
                tir.ir.guard2(Opcode::Gt, Ty::Num, x, k).unwrap();
                tir.snapshot_add(&st, pc, 3, true)
            },
            Err(CompilationError::TraceError(TraceError::SnapshotOverflow))
        ));
    }

    #[test]
    fn usedef_straight_line() {
        let mut heap = Heap::new();
        let mut b = ProtoBuilder::new("f", 0, 6);
        // 1: slot0 = slot1 + slot2; 2: slot3 = 1; 3: slot4 = slot3; 4: return slot0
        b.abc(Op::AddVV, 0, 1, 2);
        b.ad(Op::KShort, 3, 1);
        b.ad(Op::Mov, 4, 3);
        b.ad(Op::Ret1, 0, 2);
        let p = b.finish(&mut heap);
        let live = usedef(p.pc_at(1), 6);
        assert_eq!(
            live.iter().collect::<Vec<_>>(),
            vec![false, true, true, false, false, false]
        );
        // A branch makes everything not yet written live.
        let mut b = ProtoBuilder::new("g", 0, 4);
        b.ad(Op::KShort, 0, 1);
        b.ad(Op::IsT, 0, 1);
        b.jmp_to(Op::Jmp, 0, 0);
        let p = b.finish(&mut heap);
        let live = usedef(p.pc_at(1), 4);
        assert_eq!(live.iter().collect::<Vec<_>>(), vec![false, true, true, true]);
    }
}
