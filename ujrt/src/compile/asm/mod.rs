//! The x86_64 assembler.
//!
//! Traces are assembled in a single backwards pass over the IR, which does register allocation at
//! the same time as it emits code (see [regalloc]). Walking backwards means that the first use of
//! a value the assembler sees is its last use at run-time, so a register can be allocated there
//! and freed again at the value's definition. When no register is free, the value defined
//! earliest is evicted: the assembler emits a reload from a spill slot at the point of eviction
//! and the value's definition stores it to that slot as well as to its register.
//!
//! Code is laid out as follows, from low to high addresses:
//!
//! ```text
//!   [parent values -> this trace's registers]   (side traces only)
//!   [stack check]
//!   [body]
//!   [tail: loop back-edge, jump to another trace, or exit]
//!   [exit stubs, one per snapshot]
//! ```
//!
//! Loops need more care than straight-line code, since values flow around the back-edge: a value
//! defined before the `LOOP` instruction and used after it must be in the same place on every
//! iteration. Such values, and the left-hand side of every `PHI`, are *pinned* to a register for
//! the whole loop body; if there aren't enough registers, invariants and `PHI`s are left in their
//! spill slot and reloaded into a temporary register at each use instead. At the end of the body,
//! the values computed by the iteration are stored to the spill slots of spilled `PHI`s, then
//! moved into the registers of the remaining `PHI`s' left-hand sides.

use index_vec::IndexVec;
use iced_x86::{Code, Instruction};
use smallvec::SmallVec;
use std::mem;
use vob::Vob;

use crate::{
    compile::{
        exit::{emit_stub, exit_number, spill_disp, CTX_HEAP, CTX_STACK_LIMIT, MAX_SPILL},
        jit_ir::{
            Const, Inst, InstIdx, JitIr, Opcode, Operand, Ty, HINT_MOVTV, HINT_SINK, K64,
        },
        snap::sunk_store_target,
        trace::{Trace, TraceIr, TraceLink},
        CompilationError, ResourceError,
    },
    log::{log_ir, should_log_ir, IRPhase},
};

mod lower;
pub(crate) mod mcode;
pub(crate) mod regalloc;
pub(crate) mod x64;

use mcode::Mcode;
use regalloc::{
    Reg, RegSet, RegSp, RegState, BASE, CTX, FP_ALLOC, FSCRATCH, GP_ALLOC, SCRATCH,
};
use x64::{mem, set_rel32, X64};

/// The number of registers of each class the loop body keeps free for temporaries when pinning
/// loop invariants.
const LOOP_RESERVE: usize = 4;

/// The result of assembling a trace.
pub(crate) struct Assembled {
    pub(crate) regsp: IndexVec<InstIdx, RegSp>,
    /// The address of the trace's first instruction.
    pub(crate) mcode: usize,
    pub(crate) szmcode: usize,
    pub(crate) exits: Vec<SmallVec<[usize; 2]>>,
    pub(crate) stubs: Vec<usize>,
    pub(crate) nspill: u16,
    /// The disassembly, if requested.
    pub(crate) log: Option<String>,
}

/// Assemble `tir` as trace `traceno`.
///
/// `parent` is the trace a side trace is attached to. `link_target` is the entry address of the
/// root trace a [TraceLink::Root] trace jumps to. If the current machine code area is full, a new
/// one is allocated and assembly is retried once.
pub(crate) fn assemble(
    tir: &TraceIr,
    traceno: u16,
    parent: Option<&Trace>,
    link_target: Option<usize>,
    mc: &mut Mcode,
    k64: &mut K64,
) -> Result<Assembled, CompilationError> {
    let log = should_log_ir(IRPhase::Asm);
    let a = match assemble_in(tir, traceno, parent, link_target, mc, k64, log) {
        Err(CompilationError::ResourceExhausted(ResourceError::McodeOverflow)) => {
            mc.new_area()?;
            assemble_in(tir, traceno, parent, link_target, mc, k64, log)?
        }
        r => r?,
    };
    if let Some(s) = &a.log {
        log_ir(&format!(
            "--- Begin jit-asm trace {traceno} ---\n{s}\n--- End jit-asm ---\n"
        ));
    }
    Ok(a)
}

/// Assemble into the current machine code area.
fn assemble_in(
    tir: &TraceIr,
    traceno: u16,
    parent: Option<&Trace>,
    link_target: Option<usize>,
    mc: &mut Mcode,
    k64: &mut K64,
    log: bool,
) -> Result<Assembled, CompilationError> {
    let area = mc.current()?;
    let (limit, top) = area.free();
    let handler = area.glue.handler;
    let a = {
        let _g = area.unprotect();
        let mut asm = Assembler::new(tir, traceno, parent, X64::new(limit, top, log), k64, handler);
        asm.run(link_target)?;
        let pos = asm.x.pos();
        Assembled {
            log: asm.x.take_log(),
            regsp: asm.regsp,
            mcode: pos,
            szmcode: top - pos,
            exits: asm.exits,
            stubs: asm.stubs,
            nspill: asm.nspill,
        }
    };
    mc.current()?.commit(a.mcode);
    Ok(a)
}

/// Code that must run immediately before the instruction being assembled, set up while its
/// operands are allocated.
#[derive(Clone, Copy, Debug)]
enum Setup {
    /// Reload a value which lives in a spill slot for the whole loop body.
    Reload(Reg, u16),
    /// Materialise a constant.
    Const(Reg, Const),
}

/// The source of a move into a register.
#[derive(Clone, Copy, Debug)]
enum Src {
    Reg(Reg),
    Spill(u16),
    Const(Const),
    /// The heap pointer held in the JIT context.
    Heap,
}

/// The register class values of type `ty` live in, if they live in registers at all.
fn class_of(ty: Ty) -> Option<RegSet> {
    match ty {
        Ty::Num => Some(FP_ALLOC),
        Ty::Int | Ty::Str | Ty::Tab | Ty::Func | Ty::Ptr => Some(GP_ALLOC),
        Ty::Nil | Ty::False | Ty::True | Ty::Void | Ty::TValue => None,
    }
}

pub(super) struct Assembler<'a> {
    tir: &'a TraceIr,
    ir: &'a JitIr,
    traceno: u16,
    parent: Option<&'a Trace>,
    x: X64,
    k64: &'a mut K64,
    handler: usize,
    rs: RegState,
    regsp: IndexVec<InstIdx, RegSp>,
    /// The next free spill slot.
    nspill: u16,
    stubs: Vec<usize>,
    exits: Vec<SmallVec<[usize; 2]>>,
    /// Registers which may never be evicted: loop-carried values and pinned invariants.
    pinned: RegSet,
    /// Loop invariants and `PHI`s which live in their spill slot throughout the loop body.
    spill_only: Vob,
    /// For each sunk allocation, the sunk stores to it.
    sunk_stores: Vec<(InstIdx, InstIdx)>,
    /// The instruction being assembled.
    cur: InstIdx,
    setup: Vec<Setup>,
    /// Registers to free once the current instruction is assembled.
    release: SmallVec<[Reg; 4]>,
}

impl<'a> Assembler<'a> {
    fn new(
        tir: &'a TraceIr,
        traceno: u16,
        parent: Option<&'a Trace>,
        x: X64,
        k64: &'a mut K64,
        handler: usize,
    ) -> Self {
        let ir = &tir.ir;
        let mut sunk_stores = Vec::new();
        for (i, inst) in ir.insts() {
            if inst.op.is_store() && ir.hint(i, HINT_SINK) {
                if let Some((_, owner)) = sunk_store_target(ir, inst) {
                    sunk_stores.push((owner, i));
                }
            }
        }
        Assembler {
            tir,
            ir,
            traceno,
            parent,
            x,
            k64,
            handler,
            rs: RegState::new(),
            regsp: IndexVec::from_vec(vec![RegSp::default(); ir.len()]),
            nspill: parent.map(|p| p.nspill).unwrap_or(0),
            stubs: vec![0; tir.snaps.len()],
            exits: vec![SmallVec::new(); tir.snaps.len()],
            pinned: RegSet::empty(),
            spill_only: Vob::from_elem(false, ir.len()),
            sunk_stores,
            cur: ir.next_idx(),
            setup: Vec::new(),
            release: SmallVec::new(),
        }
    }

    fn run(&mut self, link_target: Option<usize>) -> Result<(), CompilationError> {
        let nsnaps = self.tir.snaps.len();
        if nsnaps == 0 {
            panic!("trace {} has no snapshots", self.traceno);
        }
        if nsnaps > usize::from(u16::MAX) {
            return Err(ResourceError::ExitLimit.into());
        }
        for snapno in (0..nsnaps).rev() {
            self.stubs[snapno] =
                emit_stub(&mut self.x, exit_number(self.traceno, snapno), self.handler)?;
        }

        let mut loop_fixup = None;
        let mut start_fixup = None;
        match (self.tir.link, self.ir.loop_idx()) {
            (TraceLink::Loop, Some(l)) => loop_fixup = Some(self.loop_tail(l)?),
            (TraceLink::Interp | TraceLink::Return | TraceLink::DownRec | TraceLink::Stitch, _) => {
                self.exit_tail()?
            }
            (TraceLink::Root(_), _) => {
                let target = link_target.unwrap_or_else(|| panic!("no root trace to link to"));
                self.stack_tail(Some(target))?;
            }
            (_, _) => start_fixup = self.stack_tail(None)?,
        }

        let ir = self.ir;
        for (i, inst) in ir.insts().rev() {
            match inst.op {
                Opcode::Loop => {
                    if let Some(at) = loop_fixup.take() {
                        set_rel32(at, self.x.pos())?;
                    }
                    self.leave_loop();
                    continue;
                }
                Opcode::PVal => continue,
                _ => (),
            }
            if self.skip(i, inst) {
                continue;
            }
            self.cur = i;
            self.lower(i, inst)?;
            self.finish_inst()?;
            self.x.comment(&ir.display_inst(i));
        }

        self.cur = ir.next_idx();
        self.stack_check()?;
        self.finish_inst()?;
        if let Some(parent) = self.parent {
            self.parent_moves(parent)?;
        }
        if let Some(at) = start_fixup {
            set_rel32(at, self.x.pos())?;
        }
        Ok(())
    }

    /// Does instruction `i` need no code?
    fn skip(&self, i: InstIdx, inst: &Inst) -> bool {
        match inst.op {
            Opcode::Nop | Opcode::CArg | Opcode::Phi => true,
            _ if self.ir.hint(i, HINT_SINK) => true,
            Opcode::SLoad | Opcode::ALoad | Opcode::HLoad if self.ir.hint(i, HINT_MOVTV) => {
                !inst.guard
            }
            _ => !inst.is_kept() && !self.is_used(i),
        }
    }

    fn is_used(&self, i: InstIdx) -> bool {
        let rsp = self.regsp[i];
        rsp.reg.is_some() || rsp.spill.is_some()
    }

    // Register allocation.

    fn spill_slot(&mut self, i: InstIdx) -> Result<u16, CompilationError> {
        if let Some(s) = self.regsp[i].spill {
            return Ok(s);
        }
        let s = self.fresh_slot()?;
        self.regsp[i].spill = Some(s);
        Ok(s)
    }

    /// A spill slot not associated with any value.
    fn fresh_slot(&mut self) -> Result<u16, CompilationError> {
        if usize::from(self.nspill) >= MAX_SPILL {
            return Err(ResourceError::SpillOverflow.into());
        }
        self.nspill += 1;
        Ok(self.nspill - 1)
    }

    /// Evict value `v` from register `r`. Going backwards, the code emitted so far expects `v`
    /// in `r`, so a reload is emitted; `v`'s definition will store it to its spill slot.
    fn evict(&mut self, r: Reg, v: InstIdx) -> Result<(), CompilationError> {
        let s = self.spill_slot(v)?;
        self.x.load(r, mem(CTX, spill_disp(s)))?;
        self.rs.release(r);
        self.regsp[v].reg = None;
        Ok(())
    }

    /// Find a register of `class`, evicting a value if necessary. The register is not taken.
    fn alloc_reg(
        &mut self,
        class: RegSet,
        exclude: RegSet,
        hint: Option<Reg>,
    ) -> Result<Reg, CompilationError> {
        match self.rs.pick(class, exclude.union(self.pinned), hint) {
            Some((r, None)) => Ok(r),
            Some((r, Some(v))) => {
                self.evict(r, v)?;
                Ok(r)
            }
            None => Err(ResourceError::RegisterPressure.into()),
        }
    }

    /// A register of `class` for use only by the current instruction.
    fn temp(&mut self, class: RegSet) -> Result<Reg, CompilationError> {
        let r = self.alloc_reg(class, RegSet::empty(), None)?;
        self.rs.take(r, self.cur);
        self.rs.block(r);
        self.release.push(r);
        Ok(r)
    }

    /// The register holding `i` at this point, allocating one if this is (going backwards) the
    /// first use of `i`.
    fn use_var(&mut self, i: InstIdx, hint: Option<Reg>) -> Result<Reg, CompilationError> {
        if let Some(r) = self.regsp[i].reg {
            self.rs.block(r);
            return Ok(r);
        }
        let ty = self.ir.inst(i).ty;
        let class =
            class_of(ty).unwrap_or_else(|| panic!("{} has no register", self.ir.display_inst(i)));
        if self.spill_only.get(i.index()).unwrap_or(false) {
            let s = self.regsp[i].spill.unwrap_or_else(|| panic!("no spill slot"));
            let r = self.alloc_reg(class, RegSet::empty(), hint)?;
            self.rs.take(r, self.cur);
            self.rs.block(r);
            self.release.push(r);
            self.setup.push(Setup::Reload(r, s));
            return Ok(r);
        }
        let r = self.alloc_reg(class, RegSet::empty(), hint)?;
        self.rs.take(r, i);
        self.rs.block(r);
        self.regsp[i].reg = Some(r);
        Ok(r)
    }

    /// The value of `x` in a register of `class`. Constants (and values of primitive types) are
    /// materialised in a temporary register.
    fn reg(&mut self, x: Operand, class: RegSet) -> Result<Reg, CompilationError> {
        match x {
            Operand::Var(i) if class_of(self.ir.inst(i).ty).is_some() => self.use_var(i, None),
            _ => {
                let c = self.const_value(x);
                let r = self.temp(class)?;
                self.setup.push(Setup::Const(r, c));
                Ok(r)
            }
        }
    }

    /// The constant `x` stands for: either a constant or a value of a primitive type.
    fn const_value(&self, x: Operand) -> Const {
        match x {
            Operand::Const(c) => *self.ir.konst(c),
            Operand::Var(i) => Const::Pri(self.ir.inst(i).ty),
        }
    }

    /// The register instruction `i` defines its result in, or `None` if its result is unused.
    /// Must be called before the instruction's operands are allocated.
    fn dest(&mut self, i: InstIdx) -> Result<Option<Reg>, CompilationError> {
        let rsp = self.regsp[i];
        let d = match (rsp.reg, rsp.spill) {
            (Some(d), _) => d,
            (None, Some(_)) => {
                let class = class_of(self.ir.inst(i).ty)
                    .unwrap_or_else(|| panic!("{} has no register", self.ir.display_inst(i)));
                let r = self.alloc_reg(class, RegSet::empty(), None)?;
                self.rs.take(r, i);
                self.regsp[i].reg = Some(r);
                r
            }
            (None, None) => return Ok(None),
        };
        self.rs.block(d);
        self.release.push(d);
        self.pinned = self.pinned.without(d);
        if let Some(s) = rsp.spill {
            self.x.store(mem(CTX, spill_disp(s)), d)?;
        }
        Ok(Some(d))
    }

    /// As [Self::dest], but an unused result gets a temporary register.
    fn dest_reg(&mut self, i: InstIdx, class: RegSet) -> Result<Reg, CompilationError> {
        match self.dest(i)? {
            Some(d) => Ok(d),
            None => self.temp(class),
        }
    }

    /// Emit the set-up code of the instruction just assembled and free its registers.
    fn finish_inst(&mut self) -> Result<(), CompilationError> {
        for s in mem::take(&mut self.setup) {
            match s {
                Setup::Reload(r, slot) => self.x.load(r, mem(CTX, spill_disp(slot)))?,
                Setup::Const(r, c) => self.load_const(r, c)?,
            }
        }
        for r in mem::take(&mut self.release) {
            self.rs.release(r);
        }
        self.rs.unblock_all();
        Ok(())
    }

    /// Load constant `c` into `r`.
    fn load_const(&mut self, r: Reg, c: Const) -> Result<(), CompilationError> {
        let bits = c.bits();
        if r.is_gp() {
            self.x.mov_ri(r, bits)
        } else if bits == 0 {
            self.x.op_xx(Code::Xorps_xmm_xmmm128, r, r)
        } else {
            let p = self.k64.get(bits);
            self.x.load(r, mem(SCRATCH, 0))?;
            self.x.mov_ri(SCRATCH, p as u64)
        }
    }

    /// Make sure every value snapshot `snapno` refers to has a location.
    fn snap_alloc(&mut self, snapno: usize) -> Result<(), CompilationError> {
        let iref = self.tir.snaps[snapno].iref;
        for e in self.tir.snap_entries(snapno) {
            if let Operand::Var(v) = e.val {
                self.snap_alloc_ref(v, iref)?;
            }
        }
        Ok(())
    }

    fn snap_alloc_ref(&mut self, v: InstIdx, iref: InstIdx) -> Result<(), CompilationError> {
        if self.ir.hint(v, HINT_SINK) {
            // The exit rebuilds the allocation from the values of its sunk stores.
            let stores = self
                .sunk_stores
                .iter()
                .filter(|(owner, st)| *owner == v && *st < iref)
                .map(|(_, st)| *st)
                .collect::<SmallVec<[InstIdx; 8]>>();
            for st in stores {
                if let Some(x) = self.ir.inst(st).b.as_var() {
                    self.snap_alloc_ref(x, iref)?;
                }
            }
            return Ok(());
        }
        let class = match class_of(self.ir.inst(v).ty) {
            Some(c) => c,
            None => return Ok(()),
        };
        if !self.is_used(v) {
            let r = self.alloc_reg(class, RegSet::empty(), None)?;
            self.rs.take(r, v);
            self.regsp[v].reg = Some(r);
        }
        Ok(())
    }

    /// Emit a branch to the exit of the snapshot guarding instruction `i`, taken if `cc` holds.
    fn guard_exit(&mut self, i: InstIdx, cc: x64::Cond) -> Result<(), CompilationError> {
        let snapno = self.tir.snap_for(i);
        let at = self.x.jcc(cc, self.stubs[snapno])?;
        self.exits[snapno].push(at);
        Ok(())
    }

    /// Emit moves which copy every `src` into its `dst` as if all happened at once. Sources are
    /// read before any destination register is written.
    fn parallel_move(&mut self, moves: &[(Reg, Src)]) -> Result<(), CompilationError> {
        let mut pending = moves
            .iter()
            .filter_map(|(d, s)| match s {
                Src::Reg(s) if s != d => Some((*d, *s)),
                _ => None,
            })
            .collect::<Vec<_>>();
        // Work out the order of register moves in program order first.
        let mut seq = Vec::with_capacity(pending.len());
        while !pending.is_empty() {
            match pending
                .iter()
                .position(|(d, _)| !pending.iter().any(|(_, s)| s == d))
            {
                Some(k) => seq.push(pending.remove(k)),
                None => {
                    // Only cycles are left: break one through a scratch register.
                    let d = pending[0].0;
                    let tmp = if d.is_fp() { FSCRATCH } else { SCRATCH };
                    seq.push((tmp, d));
                    for m in pending.iter_mut() {
                        if m.1 == d {
                            m.1 = tmp;
                        }
                    }
                }
            }
        }
        // Loads from memory and constants come after all register moves.
        for (d, s) in moves {
            match s {
                Src::Reg(_) => (),
                Src::Spill(slot) => self.x.load(*d, mem(CTX, spill_disp(*slot)))?,
                Src::Const(c) => self.load_const(*d, *c)?,
                Src::Heap => self.x.load(*d, mem(CTX, CTX_HEAP))?,
            }
        }
        for (d, s) in seq.into_iter().rev() {
            self.x.mov_rr(d, s)?;
        }
        Ok(())
    }

    // The start and end of the trace.

    /// The stack check at the start of the trace: exit through snapshot #0 if the slots the trace
    /// touches extend beyond the stack limit.
    fn stack_check(&mut self) -> Result<(), CompilationError> {
        self.snap_alloc(0)?;
        let top = (self.tir.topslot as i32 - 1) * 16;
        let at = self.x.jcc(x64::Cond::A, self.stubs[0])?;
        self.exits[0].push(at);
        self.x.push_inst(Instruction::with2(
            Code::Cmp_r64_rm64,
            SCRATCH.to_reg64(),
            mem(CTX, CTX_STACK_LIMIT),
        ))?;
        self.x.push_inst(Instruction::with2(
            Code::Lea_r64_m,
            SCRATCH.to_reg64(),
            mem(BASE, top),
        ))?;
        self.x.comment("stack check");
        Ok(())
    }

    /// Move the values a side trace inherits from wherever its parent left them to wherever this
    /// trace expects them.
    fn parent_moves(&mut self, parent: &Trace) -> Result<(), CompilationError> {
        let mut moves = Vec::new();
        let mut stores = Vec::new();
        let ir = self.ir;
        for (i, inst) in ir.insts() {
            if inst.op != Opcode::PVal {
                if inst.op == Opcode::Nop {
                    continue;
                }
                break;
            }
            let rsp = self.regsp[i];
            let pref = InstIdx::from_usize(inst.a.lit() as usize);
            let prsp = parent.regsp[pref];
            let src = match (prsp.spill, prsp.reg) {
                (Some(s), _) => Src::Spill(s),
                (None, Some(r)) => Src::Reg(r),
                (None, None) => panic!(
                    "{} of trace {} has no location",
                    parent.tir.ir.display_inst(pref),
                    parent.traceno
                ),
            };
            if let Some(s) = rsp.spill {
                stores.push((s, src));
            }
            if let Some(r) = rsp.reg {
                moves.push((r, src));
            }
        }
        self.parallel_move(&moves)?;
        // Stores to this trace's spill slots come first: they only read registers and parent
        // spill slots.
        for (s, src) in stores.into_iter().rev() {
            let m = mem(CTX, spill_disp(s));
            match src {
                Src::Reg(r) => self.x.store(m, r)?,
                Src::Spill(ps) => {
                    self.x.store(m, SCRATCH)?;
                    self.x.load(SCRATCH, mem(CTX, spill_disp(ps)))?;
                }
                Src::Const(_) | Src::Heap => unreachable!(),
            }
        }
        self.x.comment("parent values");
        Ok(())
    }

    /// End the trace by exiting through its last snapshot. A side trace attached to that exit
    /// replaces the jump to the exit stub.
    fn exit_tail(&mut self) -> Result<(), CompilationError> {
        let snapno = self.tir.snaps.len() - 1;
        self.snap_alloc(snapno)?;
        let at = self.x.jmp(self.stubs[snapno])?;
        self.exits[snapno].push(at);
        self.x.comment("exit");
        Ok(())
    }

    /// End the trace by writing its last snapshot back to the stack, moving [BASE] to the frame
    /// the snapshot is in and jumping to `target`, or to the trace's own start if `target` is
    /// `None`, in which case the address of the jump's displacement is returned.
    fn stack_tail(&mut self, target: Option<usize>) -> Result<Option<usize>, CompilationError> {
        let snapno = self.tir.snaps.len() - 1;
        let fixup = match target {
            Some(t) => {
                self.x.jmp(t)?;
                None
            }
            None => Some(self.x.jmp_fixup("->start")?),
        };
        let snap = &self.tir.snaps[snapno];
        let delta = (i32::from(snap.baseslot) - 2) * 16;
        if delta != 0 {
            self.x.op_ri(Code::Add_rm64_imm32, BASE, delta)?;
        }
        for e in self.tir.snap_entries(snapno) {
            self.store_tv(BASE, (i32::from(e.slot) - 2) * 16, e.val)?;
            self.finish_inst()?;
        }
        self.x.comment("write back");
        Ok(fixup)
    }

    /// Values defined before `LOOP` which the loop body needs, in order of definition.
    fn loop_invariants(&self, l: InstIdx) -> Vec<InstIdx> {
        let ir = self.ir;
        let mut inv = Vob::from_elem(false, l.index());
        let mut add = |x: InstIdx, inv: &mut Vob| {
            if x < l {
                inv.set(x.index(), true);
            }
        };
        for (_, inst) in ir.insts().skip(l.index() + 1) {
            if inst.op == Opcode::Nop || inst.op == Opcode::Phi {
                continue;
            }
            if inst.op.is_store() {
                if let Some(v) = inst.b.as_var() {
                    if ir.hint(v, HINT_MOVTV) {
                        if let Some(r) = ir.inst(v).a.as_var() {
                            add(r, &mut inv);
                        }
                    }
                }
            }
            for x in inst.vars() {
                add(x, &mut inv);
            }
        }
        for (snapno, snap) in self.tir.snaps.iter().enumerate() {
            if snap.iref <= l {
                continue;
            }
            for e in self.tir.snap_entries(snapno) {
                if let Operand::Var(x) = e.val {
                    add(x, &mut inv);
                }
            }
        }
        inv.iter_set_bits(..)
            .map(InstIdx::from_usize)
            .filter(|x| {
                !ir.hint(*x, HINT_SINK)
                    && !ir.hint(*x, HINT_MOVTV)
                    && class_of(ir.inst(*x).ty).is_some()
            })
            .collect()
    }

    /// The end of a loop: move the values of this iteration into the registers of the `PHI`s'
    /// left-hand sides and jump back to the start of the loop body. Returns the address of the
    /// jump's displacement.
    fn loop_tail(&mut self, l: InstIdx) -> Result<usize, CompilationError> {
        let ir = self.ir;
        let phis = ir
            .insts()
            .skip(l.index() + 1)
            .filter(|(_, inst)| inst.op == Opcode::Phi)
            .filter_map(|(_, inst)| Some((inst.a.as_var()?, inst.b.as_ref()?)))
            .filter(|(left, _)| class_of(ir.inst(*left).ty).is_some())
            .collect::<Vec<_>>();

        // A PHI whose left-hand side is another PHI's right-hand side must stay in a register:
        // the stores to spilled PHIs below happen before the register moves read their sources.
        let mut spilled = Vec::new();
        for (left, right) in &phis {
            let class = class_of(ir.inst(*left).ty).unwrap_or(GP_ALLOC);
            let npinned = self.pinned.intersect(class).iter().count();
            let is_src = phis.iter().any(|(_, r)| r.as_var() == Some(*left));
            if npinned + LOOP_RESERVE >= class.iter().count() && !is_src {
                let slot = self.spill_slot(*left)?;
                self.spill_only.set(left.index(), true);
                spilled.push((slot, *right, class));
                continue;
            }
            let r = self.alloc_reg(class, RegSet::empty(), None)?;
            self.rs.take(r, *left);
            self.regsp[*left].reg = Some(r);
            self.pinned = self.pinned.with(r);
        }

        for v in self.loop_invariants(l) {
            if self.regsp[v].reg.is_some() || self.spill_only.get(v.index()).unwrap_or(false) {
                continue;
            }
            let class = class_of(ir.inst(v).ty).unwrap_or(GP_ALLOC);
            let npinned = self.pinned.intersect(class).iter().count();
            if npinned + LOOP_RESERVE < class.iter().count() {
                let r = self.alloc_reg(class, RegSet::empty(), None)?;
                self.rs.take(r, v);
                self.regsp[v].reg = Some(r);
                self.pinned = self.pinned.with(r);
            } else {
                self.spill_slot(v)?;
                self.spill_only.set(v.index(), true);
            }
        }

        let at = self.x.jmp_fixup("->loop")?;
        let mut moves = Vec::with_capacity(phis.len());
        for (left, right) in &phis {
            let Some(dst) = self.regsp[*left].reg else {
                continue;
            };
            let src = match *right {
                Operand::Var(r) if class_of(ir.inst(r).ty).is_some() => {
                    if self.spill_only.get(r.index()).unwrap_or(false) {
                        Src::Spill(self.regsp[r].spill.unwrap_or_default())
                    } else {
                        Src::Reg(self.use_var(r, Some(dst))?)
                    }
                }
                x => Src::Const(self.const_value(x)),
            };
            moves.push((dst, src));
        }
        self.parallel_move(&moves)?;
        for (slot, right, class) in spilled {
            let r = self.reg(right, class)?;
            self.x.store(mem(CTX, spill_disp(slot)), r)?;
        }
        self.finish_inst()?;
        self.x.comment("loop back-edge");
        Ok(at)
    }

    /// Leaving the loop body going backwards: invariants are now ordinary values. Only the
    /// registers of `PHI` left-hand sides stay pinned, until their definitions.
    fn leave_loop(&mut self) {
        let ir = self.ir;
        let mut pinned = RegSet::empty();
        for (_, inst) in ir.insts().rev() {
            if inst.op != Opcode::Phi {
                break;
            }
            if let Some(r) = inst.a.as_var().and_then(|l| self.regsp[l].reg) {
                pinned = pinned.with(r);
            }
        }
        self.pinned = pinned;
        self.spill_only = Vob::from_elem(false, ir.len());
        self.x.comment("loop");
    }
}

#[cfg(all(test, target_arch = "x86_64", target_os = "linux"))]
mod test {
    use super::*;
    use crate::{
        compile::{
            exit::{enter, JitContext},
            jit_ir::{Opnd, SLOAD_TYPECHECK},
            snap::AbstractStack,
        },
        params::OptFlags,
        vm::{
            bc::{Op, Pc, ProtoBuilder},
            heap::Heap,
            value::TValue,
        },
    };
    use regex::Regex;

    /// A heap and a `pc` for snapshots to resume at. The heap owns the prototype `pc` points
    /// into, so it must outlive the test.
    fn setup() -> (Heap, Pc) {
        let mut heap = Heap::new();
        let mut b = ProtoBuilder::new("f", 0, 4);
        b.ad(Op::Ret0, 0, 1);
        let p = b.finish(&mut heap);
        (heap, p.pc_at(1))
    }

    fn sload(tir: &mut TraceIr, slot: u32) -> Operand {
        Operand::Var(
            tir.ir
                .push(Inst::guarded(
                    Opcode::SLoad,
                    Ty::Num,
                    Opnd::Lit(slot),
                    Opnd::Lit(SLOAD_TYPECHECK),
                ))
                .unwrap(),
        )
    }

    /// Run the trace at `code` with its base at slot 2 of `stack`, returning the exit number and
    /// the context.
    fn run(mc: &Mcode, code: usize, stack: &mut [TValue]) -> (u64, Box<JitContext>) {
        let mut ctx = JitContext::new();
        ctx.stack_limit = stack.as_ptr() as usize + stack.len() * 16;
        let glue = mc.glue_for(code).unwrap();
        let e = unsafe { enter(glue.trampoline, &mut ctx, stack.as_mut_ptr().add(2), code) };
        (e, ctx)
    }

    fn value_at_exit(a: &Assembled, ctx: &JitContext, x: Operand) -> f64 {
        let rsp = a.regsp[x.as_var().unwrap()];
        let bits = match (rsp.spill, rsp.reg) {
            (Some(s), _) => ctx.spill[usize::from(s)],
            (None, Some(r)) => ctx.reg(r),
            (None, None) => panic!("no location"),
        };
        f64::from_bits(bits)
    }

    #[test]
    fn straight_line_exit() {
        let (_heap, pc) = setup();
        let mut tir = TraceIr::new(pc, 100, 100, OptFlags::default());
        let mut st = AbstractStack::new();
        tir.snapshot_add(&st, pc, 10, false).unwrap();
        let x = sload(&mut tir, 2);
        let y = sload(&mut tir, 3);
        let sum = tir.ir.emit2(Opcode::Add, Ty::Num, x, y).unwrap();
        st.set(2, sum).unwrap();
        tir.snapshot_add(&st, pc, 10, false).unwrap();
        let k = tir.ir.knum(100.0).unwrap();
        tir.ir.guard2(Opcode::Gt, Ty::Num, sum, k).unwrap();
        tir.snapshot_add(&st, pc, 10, false).unwrap();
        tir.topslot = 5;

        let mut mc = Mcode::new(page_size::get(), page_size::get() * 4);
        let mut k64 = K64::new();
        let a = assemble_in(&tir, 1, None, None, &mut mc, &mut k64, true).unwrap();
        let log = a.log.as_deref().unwrap();
        assert!(Regex::new(r"(?m)^  addsd xmm\d+, xmm\d+$").unwrap().is_match(log));
        assert!(log.contains("; stack check"));

        let mut stack = vec![TValue::NIL; 8];
        stack[2] = TValue::num(1.5);
        stack[3] = TValue::num(2.0);
        let (e, ctx) = run(&mc, a.mcode, &mut stack);
        // 3.5 > 100 fails: the guard exits through snapshot #1.
        assert_eq!(e, u64::from(exit_number(1, 1)));
        assert_eq!(value_at_exit(&a, &ctx, sum), 3.5);

        // A type mismatch exits through snapshot #0.
        stack[3] = TValue::bool(true);
        let (e, _) = run(&mc, a.mcode, &mut stack);
        assert_eq!(e, u64::from(exit_number(1, 0)));
    }

    #[test]
    fn loop_with_phi() {
        let (_heap, pc) = setup();
        let mut tir = TraceIr::new(pc, 100, 100, OptFlags::default());
        let mut st = AbstractStack::new();
        tir.snapshot_add(&st, pc, 10, false).unwrap();
        let i0 = sload(&mut tir, 2);
        tir.snapshot_add(&st, pc, 10, false).unwrap();
        tir.ir
            .push(Inst::new(Opcode::Loop, Ty::Void, Opnd::None, Opnd::None))
            .unwrap();
        let one = tir.ir.knum(1.0).unwrap();
        let i1 = tir.ir.emit2(Opcode::Add, Ty::Num, i0, one).unwrap();
        st.set(0, i1).unwrap();
        tir.snapshot_add(&st, pc, 10, false).unwrap();
        let ten = tir.ir.knum(10.0).unwrap();
        tir.ir.guard2(Opcode::Lt, Ty::Num, i1, ten).unwrap();
        tir.ir
            .push(Inst::new(Opcode::Phi, Ty::Num, Opnd::Ref(i0), Opnd::Ref(i1)))
            .unwrap();
        tir.link = TraceLink::Loop;
        tir.topslot = 3;

        let mut mc = Mcode::new(page_size::get(), page_size::get() * 4);
        let mut k64 = K64::new();
        let a = assemble_in(&tir, 2, None, None, &mut mc, &mut k64, true).unwrap();
        assert!(a.log.as_deref().unwrap().contains("; loop back-edge"));
        // The loop-carried value lives in one register for the whole loop.
        let rsp = a.regsp[i0.as_var().unwrap()];
        assert_eq!(rsp.spill, None);

        let mut stack = vec![TValue::NIL; 8];
        stack[2] = TValue::num(0.0);
        let (e, ctx) = run(&mc, a.mcode, &mut stack);
        assert_eq!(e, u64::from(exit_number(2, 2)));
        assert_eq!(value_at_exit(&a, &ctx, i1), 10.0);
        assert_eq!(f64::from_bits(ctx.reg(rsp.reg.unwrap())), 9.0);
    }

    #[test]
    fn loop_carried_values_spill_under_pressure() {
        let (_heap, pc) = setup();
        let mut tir = TraceIr::new(pc, 1000, 1000, OptFlags::default());
        let mut st = AbstractStack::new();
        tir.snapshot_add(&st, pc, 10, false).unwrap();
        let i0 = sload(&mut tir, 2);
        let accs = (3..23).map(|s| sload(&mut tir, s)).collect::<Vec<_>>();
        tir.snapshot_add(&st, pc, 10, false).unwrap();
        tir.ir
            .push(Inst::new(Opcode::Loop, Ty::Void, Opnd::None, Opnd::None))
            .unwrap();
        let one = tir.ir.knum(1.0).unwrap();
        let i1 = tir.ir.emit2(Opcode::Add, Ty::Num, i0, one).unwrap();
        st.set(0, i1).unwrap();
        let mut nexts = Vec::new();
        for (k, a) in accs.iter().enumerate() {
            let inc = tir.ir.knum(k as f64 + 1.0).unwrap();
            let a1 = tir.ir.emit2(Opcode::Add, Ty::Num, *a, inc).unwrap();
            st.set(k + 1, a1).unwrap();
            nexts.push(a1);
        }
        tir.snapshot_add(&st, pc, 10, false).unwrap();
        let ten = tir.ir.knum(10.0).unwrap();
        tir.ir.guard2(Opcode::Lt, Ty::Num, i1, ten).unwrap();
        let pairs = accs.iter().copied().zip(nexts.iter().copied());
        for (l, r) in [(i0, i1)].into_iter().chain(pairs) {
            tir.ir
                .push(Inst::new(Opcode::Phi, Ty::Num, Opnd::Ref(l), Opnd::Ref(r)))
                .unwrap();
        }
        tir.link = TraceLink::Loop;
        tir.topslot = 30;

        let mut mc = Mcode::new(page_size::get() * 4, page_size::get() * 4);
        let mut k64 = K64::new();
        let a = assemble_in(&tir, 4, None, None, &mut mc, &mut k64, false).unwrap();
        // Some of the accumulators can't have a register of their own.
        assert!(accs.iter().any(|x| {
            let rsp = a.regsp[x.as_var().unwrap()];
            rsp.reg.is_none() && rsp.spill.is_some()
        }));

        let mut stack = vec![TValue::NIL; 64];
        for s in 2..23 {
            stack[s] = TValue::num(0.0);
        }
        let (e, ctx) = run(&mc, a.mcode, &mut stack);
        assert_eq!(e, u64::from(exit_number(4, 2)));
        assert_eq!(value_at_exit(&a, &ctx, i1), 10.0);
        for (k, x) in nexts.iter().enumerate() {
            assert_eq!(value_at_exit(&a, &ctx, *x), 10.0 * (k as f64 + 1.0));
        }
    }

    #[test]
    fn spills_under_pressure() {
        let (_heap, pc) = setup();
        let mut tir = TraceIr::new(pc, 1000, 1000, OptFlags::default());
        let mut st = AbstractStack::new();
        tir.snapshot_add(&st, pc, 10, false).unwrap();
        let x = sload(&mut tir, 2);
        // More values live at the end of the trace than there are registers.
        let mut vals = Vec::new();
        for n in 1..=40 {
            let k = tir.ir.knum(f64::from(n)).unwrap();
            let v = tir.ir.emit2(Opcode::Add, Ty::Num, x, k).unwrap();
            st.set(n as usize, v).unwrap();
            vals.push(v);
        }
        tir.snapshot_add(&st, pc, 10, false).unwrap();
        tir.topslot = 44;

        let mut mc = Mcode::new(page_size::get() * 4, page_size::get() * 4);
        let mut k64 = K64::new();
        let a = assemble_in(&tir, 3, None, None, &mut mc, &mut k64, false).unwrap();
        assert!(a.nspill > 0);
        assert!(vals
            .iter()
            .any(|v| a.regsp[v.as_var().unwrap()].spill.is_some()));

        let mut stack = vec![TValue::NIL; 64];
        stack[2] = TValue::num(0.5);
        let (e, ctx) = run(&mc, a.mcode, &mut stack);
        assert_eq!(e, u64::from(exit_number(3, 1)));
        for (n, v) in vals.iter().enumerate() {
            assert_eq!(value_at_exit(&a, &ctx, *v), n as f64 + 1.5);
        }
    }
}
