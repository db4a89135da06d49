//! Traces: recorded IR ([TraceIr]) and compiled traces ([Trace]).

use index_vec::IndexVec;
use smallvec::SmallVec;
use std::{cell::Cell, fmt};

use super::{
    asm::regalloc::RegSp,
    jit_ir::{InstIdx, JitIr, Opcode},
    snap::{SnapEntry, Snapshot},
};
use crate::{
    params::OptFlags,
    vm::bc::{BcIns, Pc},
};

/// How a trace ends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceLink {
    /// Jump to the start of another root trace.
    Root(u16),
    /// Loop back to the trace's own start.
    Loop,
    /// Tail-recursion: jump to the trace's own start at the same frame depth.
    TailRec,
    /// Up-recursion: jump to the trace's own start in a deeper frame.
    UpRec,
    /// Down-recursion: the trace returned to a lower frame of the function it started in once
    /// too often. Only side traces return below their start, and a side trace can't be
    /// re-entered without its parent, so this exits to the interpreter like [TraceLink::Return].
    DownRec,
    /// Exit to the interpreter.
    Interp,
    /// Exit to the interpreter at a return instruction.
    Return,
    /// Continue in the interpreter after a builtin call. Never produced: the recorder aborts
    /// with [super::TraceError::Stitch] instead.
    Stitch,
}

impl fmt::Display for TraceLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceLink::Root(n) => write!(f, "root {n}"),
            TraceLink::Loop => write!(f, "loop"),
            TraceLink::TailRec => write!(f, "tail-recursion"),
            TraceLink::UpRec => write!(f, "up-recursion"),
            TraceLink::DownRec => write!(f, "down-recursion"),
            TraceLink::Interp => write!(f, "interpreter"),
            TraceLink::Return => write!(f, "return"),
            TraceLink::Stitch => write!(f, "stitch"),
        }
    }
}

/// A trace's IR and snapshots: everything the recorder produces and the optimiser rewrites.
pub(crate) struct TraceIr {
    pub(crate) ir: JitIr,
    pub(crate) snaps: Vec<Snapshot>,
    pub(crate) snapmap: Vec<SnapEntry>,
    /// The first instruction the trace covers.
    pub(crate) startpc: Pc,
    pub(crate) link: TraceLink,
    /// For side traces: the parent trace and the exit this trace is attached to.
    pub(crate) parent: Option<(u16, u16)>,
    /// The highest slot any snapshot or frame of the trace touches.
    pub(crate) topslot: usize,
}

impl TraceIr {
    pub(crate) fn new(startpc: Pc, maxinsts: usize, maxconsts: usize, opt: OptFlags) -> Self {
        TraceIr {
            ir: JitIr::new(maxinsts, maxconsts, opt),
            snaps: Vec::new(),
            snapmap: Vec::new(),
            startpc,
            link: TraceLink::Interp,
            parent: None,
            topslot: 0,
        }
    }

    /// The snapshot a guard at `i` exits through: the last one taken at or before `i`.
    pub(crate) fn snap_for(&self, i: InstIdx) -> usize {
        match self.snaps.iter().rposition(|s| s.iref <= i) {
            Some(x) => x,
            None => 0,
        }
    }

    /// Is this a side trace?
    pub(crate) fn is_side(&self) -> bool {
        self.parent.is_some()
    }
}

impl fmt::Display for TraceIr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut snapno = 0;
        for (i, inst) in self.ir.insts() {
            while snapno < self.snaps.len() && self.snaps[snapno].iref <= i {
                let mut s = String::new();
                self.fmt_snap(&mut s, &self.snaps[snapno]);
                writeln!(f, "----        SNAP   #{snapno} {s}")?;
                snapno += 1;
            }
            if inst.op != Opcode::Nop {
                writeln!(f, "{}", self.ir.display_inst(i))?;
            }
        }
        for (k, snap) in self.snaps.iter().enumerate().skip(snapno) {
            let mut s = String::new();
            self.fmt_snap(&mut s, snap);
            writeln!(f, "----        SNAP   #{k} {s}")?;
        }
        Ok(())
    }
}

/// A compiled trace.
pub(crate) struct Trace {
    pub(crate) traceno: u16,
    pub(crate) tir: TraceIr,
    /// Where each instruction's value lives: this is what exits read values from.
    pub(crate) regsp: IndexVec<InstIdx, RegSp>,
    /// The address of the trace's first instruction.
    pub(crate) mcode: usize,
    pub(crate) szmcode: usize,
    /// For each snapshot, the addresses of the 32 bit displacements of the jumps which exit
    /// through it. Linking a side trace rewrites these.
    pub(crate) exits: Vec<SmallVec<[usize; 2]>>,
    /// The address of each snapshot's exit stub.
    pub(crate) stubs: Vec<usize>,
    /// The number of spill slots in use when the trace runs, including those of its parents.
    pub(crate) nspill: u16,
    /// The root trace of this trace's tree (itself, for root traces).
    pub(crate) root: u16,
    /// For root traces: the number of side traces in the tree.
    pub(crate) nchild: Cell<u16>,
    /// For each snapshot, the side trace attached to it, or 0.
    pub(crate) links: Vec<Cell<u16>>,
    /// The instruction the trace was started from, before it was patched.
    pub(crate) startins: BcIns,
    /// For root traces: the bytecode patched to enter the trace.
    pub(crate) patchpc: Option<Pc>,
    /// Heap objects the trace's code refers to.
    pub(crate) gcroots: Vec<usize>,
    /// Has this trace been flushed? Flushed traces can still be running, and their exits still
    /// work, but nothing enters them any more.
    pub(crate) flushed: Cell<bool>,
}

impl Trace {
    pub(crate) fn is_root(&self) -> bool {
        self.root == self.traceno
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        compile::{
            jit_ir::{Inst, Opnd, Ty, SLOAD_TYPECHECK},
            snap::AbstractStack,
        },
        vm::{
            bc::{Op, ProtoBuilder},
            heap::Heap,
        },
    };

    #[test]
    fn link_names() {
        assert_eq!(TraceLink::Root(3).to_string(), "root 3");
        assert_eq!(TraceLink::UpRec.to_string(), "up-recursion");
    }

    #[test]
    fn guards_find_their_snapshot() {
        let mut heap = Heap::new();
        let mut b = ProtoBuilder::new("f", 0, 4);
        b.ad(Op::Ret0, 0, 1);
        let p = b.finish(&mut heap);
        let pc = p.pc_at(1);
        let mut tir = TraceIr::new(pc, 100, 100, OptFlags::default());
        let st = AbstractStack::new();
        tir.snapshot_add(&st, pc, 10, false).unwrap();
        let x = tir
            .ir
            .push(Inst::guarded(Opcode::SLoad, Ty::Num, Opnd::Lit(2), Opnd::Lit(SLOAD_TYPECHECK)))
            .unwrap();
        tir.snapshot_add(&st, pc, 10, false).unwrap();
        let k = tir.ir.knum(1.0).unwrap();
        let g = tir
            .ir
            .guard2(Opcode::Lt, Ty::Num, crate::compile::jit_ir::Operand::Var(x), k)
            .unwrap();
        assert_eq!(tir.snap_for(x), 0);
        assert_eq!(tir.snap_for(g.as_var().unwrap()), 1);
        let s = tir.to_string();
        assert!(s.starts_with("----        SNAP   #0 [ ]\n0000 > num SLOAD  #2 T\n"));
    }
}
