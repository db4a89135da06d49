//! The trace recorder.
//!
//! The interpreter hands the recorder every instruction it is about to execute (see
//! [crate::mt::MT::record_ins]), together with the interpreter's state at that point. The recorder
//! emits IR which, given the same types and control flow, computes the same thing, guarding every
//! assumption it makes on the way. The recorder's model of the stack is an [AbstractStack]: each
//! slot holds the IR value it currently has on trace, or nothing if the slot hasn't been touched,
//! in which case the first read emits a typed [Opcode::SLoad].
//!
//! Calls to Lua functions are inlined: the callee's frame is pushed onto the abstract stack and
//! recording simply continues in the callee. Returns pop those frames again. Side traces may also
//! return below the frame they started in, which emits a [Opcode::Retf].

mod ffrecord;
mod indexed;

use smallvec::SmallVec;
use std::rc::Rc;

use super::{
    calls::CallId,
    jit_ir::{
        Const, ConvKind, Field, FpMath, Inst, JitIr, Opcode, Operand, Opnd, Ty, HINT_KEEPGUARD,
        SLOAD_TYPECHECK,
    },
    snap::{replay, AbstractStack, MAX_SLOTS},
    trace::{Trace, TraceIr, TraceLink},
    CompilationError, TraceError,
};
use crate::{
    location::PenaltyCache,
    params::{JitParams, OptFlags},
    vm::{
        bc::{BcIns, Op, Pc},
        builtins::fmt_num,
        interp::{for_continues, pri, proto_of, tnew_sizes},
        obj::{Closure, Str},
        value::{GcPtr, Tag, TValue},
        Vm, VmState,
    },
};

/// The state of a trace being recorded.
pub(crate) struct Recorder {
    pub(crate) tir: TraceIr,
    st: AbstractStack,
    params: JitParams,
    opt: OptFlags,
    /// The bytecode location which is patched to enter the trace, for root traces.
    pub(crate) patchpc: Option<Pc>,
    /// The instruction at `patchpc` before it is patched.
    pub(crate) startins: BcIns,
    loopunroll: i32,
    /// The number of tail calls to the function the trace started in.
    tailcalled: u32,
    /// An instruction temporarily restored so that the interpreter doesn't enter another trace
    /// while we record through it.
    unpatch: Option<(Pc, BcIns)>,
    /// Is the next instruction the first of the trace?
    first: bool,
    /// The number of frames returned from below the trace's starting frame.
    retdepth: usize,
    /// The number of slots the base has moved down by returns below the starting frame.
    retdelta: usize,
    /// The prototypes of the functions returned to below the starting frame.
    retprotos: Vec<usize>,
    /// The `A` operand of the `FORL` a root trace started at.
    forl: Option<usize>,
    /// A trace which should be flushed if recording is abandoned.
    pub(crate) flush_on_abort: Option<u16>,
}

impl Recorder {
    /// Start recording a root trace at the hot location `vs.pc`.
    pub(crate) fn new_root(
        vs: &VmState,
        params: &JitParams,
        opt: OptFlags,
    ) -> Result<Self, CompilationError> {
        let pc = vs.pc;
        let ins = pc.get();
        let startpc = match ins.op() {
            Op::ForL | Op::IterL => pc.jump_target(),
            _ => pc.next(),
        };
        let mut rec = Recorder::new(startpc, params, opt);
        rec.st.maxslot = usize::from(proto_of(vs.stack, vs.base).framesize);
        rec.tir.topslot = rec.st.baseslot + rec.st.maxslot;
        rec.tir
            .snapshot_add(&rec.st, startpc, params.maxsnap() as usize, false)?;
        rec.patchpc = Some(pc);
        rec.startins = ins;
        if ins.op() == Op::ForL {
            rec.forl = Some(usize::from(ins.a()));
        }
        Ok(rec)
    }

    /// Start recording a side trace from exit `snapno` of `parent`.
    pub(crate) fn new_side(
        parent: &Trace,
        snapno: usize,
        params: &JitParams,
        opt: OptFlags,
    ) -> Result<Self, CompilationError> {
        let pc = parent.tir.snaps[snapno].pc;
        let mut rec = Recorder::new(pc, params, opt);
        rec.tir.parent = Some((parent.traceno, snapno as u16));
        replay(parent, snapno, &mut rec.tir, &mut rec.st)?;
        rec.tir.topslot = rec.st.baseslot + rec.st.maxslot;
        rec.tir
            .snapshot_add(&rec.st, pc, params.maxsnap() as usize, false)?;
        Ok(rec)
    }

    fn new(startpc: Pc, params: &JitParams, opt: OptFlags) -> Self {
        Recorder {
            tir: TraceIr::new(
                startpc,
                params.maxrecord() as usize,
                params.maxirconst() as usize,
                opt,
            ),
            st: AbstractStack::new(),
            params: params.clone(),
            opt,
            patchpc: None,
            startins: BcIns(0),
            loopunroll: params.loopunroll() as i32,
            tailcalled: 0,
            unpatch: None,
            first: true,
            retdepth: 0,
            retdelta: 0,
            retprotos: Vec::new(),
            forl: None,
            flush_on_abort: None,
        }
    }

    /// Undo any temporary bytecode patch.
    pub(crate) fn repatch(&mut self) {
        if let Some((pc, ins)) = self.unpatch.take() {
            pc.set(ins);
        }
    }

    /// Record the instruction at `vs.pc`. Returns how the trace ends if this instruction ended it.
    pub(crate) fn record(
        &mut self,
        vs: &mut VmState,
        traces: &[Option<Rc<Trace>>],
        penalties: &PenaltyCache,
    ) -> Result<Option<TraceLink>, CompilationError> {
        self.repatch();
        let pc = vs.pc;
        let ins = pc.get();
        let op = ins.op();
        if self.first {
            if pc != self.tir.startpc {
                return Err(TraceError::LoopLeft.into());
            }
            self.first = false;
        } else if !matches!(op, Op::FuncF | Op::IFuncF | Op::JFuncF | Op::FuncV) {
            self.snapshot(pc, true)?;
        }

        let a = usize::from(ins.a());
        let d = usize::from(ins.d());
        match op {
            Op::IsLt | Op::IsGe | Op::IsLe | Op::IsGt => {
                let (x, y) = (self.slot(vs, a)?, self.slot(vs, d)?);
                let (xv, yv) = (vs.slot(a as isize), vs.slot(d as isize));
                let (xn, yn) = match (xv.as_num(), yv.as_num()) {
                    (Some(xn), Some(yn)) => (xn, yn),
                    _ => return Err(TraceError::NotYetImplemented(op).into()),
                };
                let (cmp, cond) = match op {
                    Op::IsLt => (Opcode::Lt, xn < yn),
                    Op::IsGe => (Opcode::Ge, xn >= yn),
                    Op::IsLe => (Opcode::Le, xn <= yn),
                    _ => (Opcode::Gt, xn > yn),
                };
                let guard = if cond { cmp } else { cmp.invert(Ty::Num) };
                self.branch(pc, cond, guard, Ty::Num, x, y)?;
            }
            Op::IsEqV | Op::IsNeV | Op::IsEqS | Op::IsNeS | Op::IsEqN | Op::IsNeN
            | Op::IsEqP | Op::IsNeP => {
                let x = self.slot(vs, a)?;
                let xv = vs.slot(a as isize);
                let proto = proto_of(vs.stack, vs.base);
                let (y, yv) = match op {
                    Op::IsEqV | Op::IsNeV => (self.slot(vs, d)?, vs.slot(d as isize)),
                    Op::IsEqS | Op::IsNeS => {
                        let s = proto.kstr(ins.d());
                        (self.tir.ir.kgc(Ty::Str, s.addr())?, TValue::str(s))
                    }
                    Op::IsEqN | Op::IsNeN => {
                        let n = proto.knum(ins.d());
                        (self.tir.ir.knum(n)?, TValue::num(n))
                    }
                    _ => {
                        let v = pri(ins.d());
                        (JitIr::kpri(Ty::from_tag(v.tag())), v)
                    }
                };
                let eq = xv.raw_eq(&yv);
                let cond = if matches!(op, Op::IsEqV | Op::IsEqS | Op::IsEqN | Op::IsEqP) {
                    eq
                } else {
                    !eq
                };
                let ty = Ty::from_tag(xv.tag());
                // Values of different types, or of the same single-valued type, compare
                // statically once their types are known.
                if ty == Ty::from_tag(yv.tag()) && !ty.is_pri() {
                    let guard = if eq { Opcode::Eq } else { Opcode::Ne };
                    self.branch(pc, cond, guard, ty, x, y)?;
                }
            }
            Op::IsT | Op::IsF => {
                self.slot(vs, d)?;
            }
            Op::Mov => {
                let v = self.slot(vs, d)?;
                self.st.set(a, v)?;
            }
            Op::Not => {
                self.slot(vs, d)?;
                let ty = if vs.slot(d as isize).is_truthy() {
                    Ty::False
                } else {
                    Ty::True
                };
                self.st.set(a, JitIr::kpri(ty))?;
            }
            Op::Unm => {
                let x = self.slot(vs, d)?;
                if !vs.slot(d as isize).is_num() {
                    return Err(TraceError::BadType.into());
                }
                let r = self
                    .tir
                    .ir
                    .emit(Inst::new(Opcode::Neg, Ty::Num, Opnd::Ref(x), Opnd::None))?;
                self.st.set(a, r)?;
            }
            Op::Len => {
                let x = self.slot(vs, d)?;
                let v = vs.slot(d as isize);
                let r = match v.tag() {
                    Tag::Str => self.str_len(x, v)?,
                    Tag::Tab => self.call_out(CallId::TabLen, Ty::Num, &[x])?,
                    _ => return Err(TraceError::BadType.into()),
                };
                self.st.set(a, r)?;
            }
            Op::AddVN | Op::SubVN | Op::MulVN | Op::DivVN | Op::ModVN | Op::AddNV
            | Op::SubNV | Op::MulNV | Op::DivNV | Op::ModNV | Op::AddVV | Op::SubVV
            | Op::MulVV | Op::DivVV | Op::ModVV | Op::Pow => {
                let b = usize::from(ins.b());
                let c = usize::from(ins.c());
                let proto = proto_of(vs.stack, vs.base);
                let (x, xv, y, yv) = match op {
                    Op::AddVN | Op::SubVN | Op::MulVN | Op::DivVN | Op::ModVN => {
                        let n = proto.knum(u16::from(ins.c()));
                        let k = self.tir.ir.knum(n)?;
                        (self.slot(vs, b)?, vs.slot(b as isize), k, TValue::num(n))
                    }
                    Op::AddNV | Op::SubNV | Op::MulNV | Op::DivNV | Op::ModNV => {
                        let n = proto.knum(u16::from(ins.c()));
                        let k = self.tir.ir.knum(n)?;
                        (k, TValue::num(n), self.slot(vs, b)?, vs.slot(b as isize))
                    }
                    _ => (
                        self.slot(vs, b)?,
                        vs.slot(b as isize),
                        self.slot(vs, c)?,
                        vs.slot(c as isize),
                    ),
                };
                if !xv.is_num() || !yv.is_num() {
                    return Err(TraceError::BadType.into());
                }
                let r = self.arith(op, x, y)?;
                self.st.set(a, r)?;
            }
            Op::Cat => {
                let r = self.cat(vs, usize::from(ins.b()), usize::from(ins.c()))?;
                self.st.set(a, r)?;
            }
            Op::KStr => {
                let s = proto_of(vs.stack, vs.base).kstr(ins.d());
                let k = self.tir.ir.kgc(Ty::Str, s.addr())?;
                self.st.set(a, k)?;
            }
            Op::KShort => {
                let k = self.tir.ir.knum(f64::from(ins.d() as i16))?;
                self.st.set(a, k)?;
            }
            Op::KNum => {
                let k = self.tir.ir.knum(proto_of(vs.stack, vs.base).knum(ins.d()))?;
                self.st.set(a, k)?;
            }
            Op::KPri => {
                self.st.set(a, JitIr::kpri(Ty::from_tag(pri(ins.d()).tag())))?;
            }
            Op::KNil => {
                for s in a..=d {
                    self.st.set(s, JitIr::kpri(Ty::Nil))?;
                }
            }
            Op::GGet | Op::GSet => {
                let s = proto_of(vs.stack, vs.base).kstr(ins.d());
                let k = self.tir.ir.kgc(Ty::Str, s.addr())?;
                let t = self.tir.ir.kgc(Ty::Tab, vs.globals.addr())?;
                let globals = vs.globals;
                if op == Op::GGet {
                    let r = self.index_get(vs, t, globals, k, TValue::str(s))?;
                    self.st.set(a, r)?;
                } else {
                    let v = self.slot(vs, a)?;
                    let vv = vs.slot(a as isize);
                    self.index_set(vs, t, globals, k, TValue::str(s), v, vv)?;
                }
            }
            Op::TNew => {
                let (asize, hsize) = tnew_sizes(ins.d());
                let r = self.tir.ir.emit(Inst::new(
                    Opcode::TNew,
                    Ty::Tab,
                    Opnd::Lit(asize as u32),
                    Opnd::Lit(hsize as u32),
                ))?;
                self.st.set(a, r)?;
            }
            Op::TGetV | Op::TGetS | Op::TGetB | Op::TSetV | Op::TSetS | Op::TSetB => {
                let b = usize::from(ins.b());
                let t = self.slot(vs, b)?;
                let tab = match vs.slot(b as isize).as_tab() {
                    Some(tab) => tab,
                    None => return Err(TraceError::BadType.into()),
                };
                let (k, kv) = match op {
                    Op::TGetV | Op::TSetV => {
                        let c = usize::from(ins.c());
                        (self.slot(vs, c)?, vs.slot(c as isize))
                    }
                    Op::TGetS | Op::TSetS => {
                        let s = proto_of(vs.stack, vs.base).kstr(u16::from(ins.c()));
                        (self.tir.ir.kgc(Ty::Str, s.addr())?, TValue::str(s))
                    }
                    _ => {
                        let n = f64::from(ins.c());
                        (self.tir.ir.knum(n)?, TValue::num(n))
                    }
                };
                if matches!(op, Op::TGetV | Op::TGetS | Op::TGetB) {
                    let r = self.index_get(vs, t, tab, k, kv)?;
                    self.st.set(a, r)?;
                } else {
                    let v = self.slot(vs, a)?;
                    let vv = vs.slot(a as isize);
                    self.index_set(vs, t, tab, k, kv, v, vv)?;
                }
            }
            Op::FNew | Op::CallM | Op::Varg | Op::RetM | Op::FuncV => {
                return Err(TraceError::NotYetImplemented(op).into());
            }
            Op::Call | Op::IterC | Op::CallT => return self.call(vs, pc, ins),
            Op::Ret | Op::Ret0 | Op::Ret1 => {
                let n = match op {
                    Op::Ret => d - 1,
                    Op::Ret0 => 0,
                    _ => 1,
                };
                let mut rs = SmallVec::<[Operand; 8]>::new();
                for i in 0..n {
                    rs.push(self.slot(vs, a + i)?);
                }
                return self.ret_values(vs, pc, &rs);
            }
            Op::ForI => {
                self.for_loop(vs, pc, ins)?;
            }
            Op::ForL => {
                let cont = self.for_loop(vs, pc, ins)?;
                return self.loop_end(pc, cont, penalties);
            }
            Op::IterL => {
                let v = self.slot(vs, a)?;
                let cont = !vs.slot(a as isize).is_nil();
                if cont {
                    self.st.set(a - 1, v)?;
                }
                return self.loop_end(pc, cont, penalties);
            }
            Op::Loop => return self.loop_end(pc, true, penalties),
            Op::JForL | Op::JIterL | Op::JLoop => {
                if !self.tir.is_side() {
                    return Err(TraceError::InnerLoop.into());
                }
                let cont = match op {
                    Op::JForL => self.for_loop(vs, pc, ins)?,
                    Op::JIterL => {
                        let v = self.slot(vs, a)?;
                        let cont = !vs.slot(a as isize).is_nil();
                        if cont {
                            self.st.set(a - 1, v)?;
                        }
                        cont
                    }
                    _ => true,
                };
                if cont {
                    let target = if op == Op::JLoop {
                        pc.next()
                    } else {
                        pc.jump_target()
                    };
                    return self.stop(TraceLink::Root(ins.d()), target);
                }
            }
            Op::IForL | Op::IIterL | Op::ILoop | Op::IFuncF => {
                return Err(TraceError::BlacklistedSite.into());
            }
            Op::Jmp => (),
            Op::FuncF => {
                self.fill_params(vs)?;
                return self.check_call_unroll(vs, pc, None);
            }
            Op::JFuncF => {
                self.fill_params(vs)?;
                let t = traces
                    .get(ins.d() as usize)
                    .and_then(|t| t.as_ref())
                    .ok_or_else(|| {
                        CompilationError::Fatal(format!("no trace {}", ins.d()).into())
                    })?;
                if t.tir.link == TraceLink::Return {
                    // The function's trace returns to the interpreter, so it can't be linked to:
                    // record through the function instead.
                    if let Some(l) = self.check_call_unroll(vs, pc, Some(ins.d()))? {
                        return Ok(Some(l));
                    }
                    self.unpatch = Some((pc, ins));
                    pc.set(t.startins);
                } else {
                    return self.stop(TraceLink::Root(ins.d()), pc.next());
                }
            }
        }
        Ok(None)
    }

    /// Take a snapshot of the current state, resuming at `pc`.
    fn snapshot(&mut self, pc: Pc, merge: bool) -> Result<(), CompilationError> {
        self.tir
            .snapshot_add(&self.st, pc, self.params.maxsnap() as usize, merge)?;
        self.topslot(self.st.baseslot + self.st.maxslot);
        Ok(())
    }

    fn topslot(&mut self, s: usize) {
        self.tir.topslot = self.tir.topslot.max(s.saturating_sub(self.retdelta));
    }

    /// End the trace with a final snapshot resuming at `pc`.
    fn stop(&mut self, link: TraceLink, pc: Pc) -> Result<Option<TraceLink>, CompilationError> {
        self.snapshot(pc, false)?;
        self.tir.link = link;
        Ok(Some(link))
    }

    /// The value of slot `s` of the current frame, loading it if it isn't yet known.
    fn slot(&mut self, vs: &VmState, s: usize) -> Result<Operand, CompilationError> {
        let abs = self.st.baseslot + s;
        if abs >= MAX_SLOTS {
            return Err(TraceError::StackOverflow.into());
        }
        let v = match self.st.slots[abs] {
            Some(v) => v,
            None => {
                let ty = Ty::from_tag(vs.slot(s as isize).tag());
                let v = Operand::Var(self.tir.ir.push(Inst::guarded(
                    Opcode::SLoad,
                    ty,
                    Opnd::Lit(abs as u32),
                    Opnd::Lit(SLOAD_TYPECHECK),
                ))?);
                self.st.slots[abs] = Some(v);
                v
            }
        };
        Ok(self.canon(v))
    }

    /// Replace values of single-valued types by their constants.
    fn canon(&self, v: Operand) -> Operand {
        let ty = self.tir.ir.ty_of(v);
        if ty.is_pri() {
            JitIr::kpri(ty)
        } else {
            v
        }
    }

    /// Keep the type check of load `v`, which the recording relied upon.
    fn keep_guard(&mut self, v: Operand) {
        if let Operand::Var(i) = v {
            self.tir.ir.set_hint(i, HINT_KEEPGUARD);
        }
    }

    fn fload(&mut self, x: Operand, field: Field) -> Result<Operand, CompilationError> {
        self.tir.ir.emit(Inst::new(
            Opcode::FLoad,
            field.ty(),
            Opnd::Ref(x),
            Opnd::Lit(field as u32),
        ))
    }

    /// Emit a call of `id` with `args`.
    fn call_out(
        &mut self,
        id: CallId,
        ty: Ty,
        args: &[Operand],
    ) -> Result<Operand, CompilationError> {
        let mut arg = args[0];
        for x in &args[1..] {
            arg = self.tir.ir.emit(Inst::new(
                Opcode::CArg,
                Ty::Void,
                Opnd::Ref(arg),
                Opnd::Ref(*x),
            ))?;
        }
        self.tir
            .ir
            .emit(Inst::new(Opcode::Call, ty, Opnd::Ref(arg), Opnd::Lit(id as u32)))
    }

    /// Guard `guard x y` for the comparison at `pc`, which took the branch iff `cond`.
    fn branch(
        &mut self,
        pc: Pc,
        cond: bool,
        guard: Opcode,
        ty: Ty,
        x: Operand,
        y: Operand,
    ) -> Result<(), CompilationError> {
        let exit = if cond {
            pc.offset(2)
        } else {
            pc.next().jump_target()
        };
        self.snapshot(exit, false)?;
        self.tir.snap_shrink(self.st.maxslot);
        self.tir.ir.guard2(guard, ty, x, y)?;
        Ok(())
    }

    fn str_len(&mut self, x: Operand, v: TValue) -> Result<Operand, CompilationError> {
        match (x.is_const(), v.as_str()) {
            (true, Some(s)) => self.tir.ir.knum(s.len() as f64),
            _ => {
                let n = self.fload(x, Field::StrLen)?;
                self.tir.ir.emit(Inst::new(
                    Opcode::Conv,
                    Ty::Num,
                    Opnd::Ref(n),
                    Opnd::Lit(ConvKind::IntToNum as u32),
                ))
            }
        }
    }

    fn arith(&mut self, op: Op, x: Operand, y: Operand) -> Result<Operand, CompilationError> {
        let ir = &mut self.tir.ir;
        match op {
            Op::AddVN | Op::AddNV | Op::AddVV => ir.emit2(Opcode::Add, Ty::Num, x, y),
            Op::SubVN | Op::SubNV | Op::SubVV => ir.emit2(Opcode::Sub, Ty::Num, x, y),
            Op::MulVN | Op::MulNV | Op::MulVV => ir.emit2(Opcode::Mul, Ty::Num, x, y),
            Op::DivVN | Op::DivNV | Op::DivVV => ir.emit2(Opcode::Div, Ty::Num, x, y),
            Op::ModVN | Op::ModNV | Op::ModVV => {
                // x - floor(x / y) * y
                let q = ir.emit2(Opcode::Div, Ty::Num, x, y)?;
                let f = ir.emit(Inst::new(
                    Opcode::Fpmath,
                    Ty::Num,
                    Opnd::Ref(q),
                    Opnd::Lit(FpMath::Floor as u32),
                ))?;
                let m = ir.emit2(Opcode::Mul, Ty::Num, f, y)?;
                ir.emit2(Opcode::Sub, Ty::Num, x, m)
            }
            _ => self.call_out(CallId::Pow, Ty::Num, &[x, y]),
        }
    }

    /// Concatenate slots `b..=c`. Adjacent constants are concatenated while recording.
    fn cat(&mut self, vs: &mut VmState, b: usize, c: usize) -> Result<Operand, CompilationError> {
        let mut acc: Option<(Operand, Option<GcPtr<Str>>)> = None;
        for s in b..=c {
            let r = self.slot(vs, s)?;
            let v = vs.slot(s as isize);
            let (r, k) = match v.tag() {
                Tag::Str => (r, v.as_str().filter(|_| r.is_const())),
                Tag::Num => match self.tir.ir.const_of(r).and_then(Const::as_num) {
                    Some(n) => {
                        let ks = vs.heap.intern(&fmt_num(n));
                        (self.tir.ir.kgc(Ty::Str, ks.addr())?, Some(ks))
                    }
                    None => return Err(TraceError::NotYetImplemented(Op::Cat).into()),
                },
                _ => return Err(TraceError::BadType.into()),
            };
            acc = Some(match acc {
                None => (r, k),
                Some((ra, ka)) => match (ka, k) {
                    (Some(x), Some(y)) => {
                        let ks = vs.heap.concat(x, y);
                        (self.tir.ir.kgc(Ty::Str, ks.addr())?, Some(ks))
                    }
                    _ => (self.call_out(CallId::StrConcat, Ty::Str, &[ra, r])?, None),
                },
            });
        }
        match acc {
            Some((r, _)) => Ok(r),
            None => Err(TraceError::BadType.into()),
        }
    }

    /// Record `FORI`, `FORL` or `JFORL`. Returns whether the loop continues.
    fn for_loop(&mut self, vs: &VmState, pc: Pc, ins: BcIns) -> Result<bool, CompilationError> {
        let a = usize::from(ins.a());
        let idx = self.slot(vs, a)?;
        let stop = self.slot(vs, a + 1)?;
        let step = self.slot(vs, a + 2)?;
        let (mut idxv, stopv, stepv) = match (
            vs.slot(a as isize).as_num(),
            vs.slot(a as isize + 1).as_num(),
            vs.slot(a as isize + 2).as_num(),
        ) {
            (Some(x), Some(y), Some(z)) => (x, y, z),
            _ => return Err(TraceError::BadType.into()),
        };
        if stepv == 0.0 {
            return Err(TraceError::NotYetImplemented(ins.op()).into());
        }
        let neg = stepv.is_sign_negative();
        if !step.is_const() {
            let zero = self.tir.ir.knum(0.0)?;
            let g = if neg { Opcode::Lt } else { Opcode::Ge };
            self.tir.ir.guard2(g, Ty::Num, step, zero)?;
        }
        let is_forl = ins.op() != Op::ForI;
        let nidx = if is_forl {
            idxv += stepv;
            self.tir.ir.emit2(Opcode::Add, Ty::Num, idx, step)?
        } else {
            idx
        };
        let cmp = if neg { Opcode::Ge } else { Opcode::Le };
        let cont = for_continues(idxv, stopv, stepv);
        if cont {
            let exit = if is_forl { pc.next() } else { pc.jump_target() };
            self.snapshot(exit, false)?;
            self.tir.snap_shrink(self.st.maxslot);
            self.tir.ir.guard2(cmp, Ty::Num, nidx, stop)?;
            if is_forl {
                self.st.set(a, nidx)?;
            }
            self.st.set(a + 3, nidx)?;
        } else {
            // If the loop does continue after all, the interpreter redoes the loop instruction.
            self.snapshot(pc, false)?;
            self.tir.ir.guard2(cmp.invert(Ty::Num), Ty::Num, nidx, stop)?;
        }
        Ok(cont)
    }

    /// Record the end of an iteration of the loop at `pc`.
    fn loop_end(
        &mut self,
        pc: Pc,
        cont: bool,
        penalties: &PenaltyCache,
    ) -> Result<Option<TraceLink>, CompilationError> {
        if self.patchpc == Some(pc)
            && !self.tir.is_side()
            && self.st.frames.is_empty()
            && self.retdepth == 0
        {
            if !cont {
                return Err(TraceError::LoopLeft.into());
            }
            let startpc = self.tir.startpc;
            return self.stop(TraceLink::Loop, startpc);
        }
        if cont {
            self.inner_loop(pc, penalties)?;
        }
        Ok(None)
    }

    /// Unroll an inner loop. Root traces only do so for loops which have been seen not to loop
    /// back, as the inner loop is usually better off with a trace of its own.
    fn inner_loop(&mut self, pc: Pc, penalties: &PenaltyCache) -> Result<(), CompilationError> {
        if !self.tir.is_side()
            && !matches!(penalties.get(pc), Some((_, TraceError::LoopLeft)))
        {
            return Err(TraceError::InnerLoop.into());
        }
        self.loopunroll -= 1;
        if self.loopunroll < 0 {
            return Err(TraceError::LoopUnroll.into());
        }
        Ok(())
    }

    /// Nil-fill the parameters the current function was called without.
    fn fill_params(&mut self, vs: &VmState) -> Result<(), CompilationError> {
        let p = proto_of(vs.stack, vs.base);
        for i in vs.nargs..usize::from(p.numparams) {
            self.st.set(i, JitIr::kpri(Ty::Nil))?;
        }
        Ok(())
    }

    /// Check the recursion at a function entry `pc` against the unroll limits.
    fn check_call_unroll(
        &mut self,
        vs: &VmState,
        pc: Pc,
        lnk: Option<u16>,
    ) -> Result<Option<TraceLink>, CompilationError> {
        let depth = self.st.frames.len();
        if Some(pc) == self.patchpc && depth + self.retdepth == 0 {
            self.tailcalled += 1;
            if self.tailcalled > self.params.recunroll() {
                return self.stop(TraceLink::TailRec, pc.next());
            }
            return Ok(None);
        }
        let proto = proto_of(vs.stack, vs.base).addr();
        let mut count = 0;
        let mut base = vs.base;
        for _ in 0..depth {
            base = match Vm::frame_prev(vs.stack, base) {
                Some(b) => b,
                None => break,
            };
            if proto_of(vs.stack, base).addr() == proto {
                count += 1;
            }
        }
        if Some(pc) == self.patchpc {
            if count + self.tailcalled > self.params.recunroll() {
                return self.stop(TraceLink::UpRec, pc.next());
            }
        } else if count > self.params.callunroll() {
            if lnk.is_some() {
                self.flush_on_abort = lnk;
            }
            return Err(TraceError::CallUnroll.into());
        }
        Ok(None)
    }

    /// Guard that the function being called is `f`.
    fn guard_func(&mut self, fop: Operand, f: GcPtr<Closure>) -> Result<(), CompilationError> {
        if fop.is_const() {
            return Ok(());
        }
        match f.proto() {
            Some(p) if p.closure_count.get() > 1 => {
                let fp = self.fload(fop, Field::FuncProto)?;
                let kp = self.tir.ir.kptr(p.addr())?;
                self.tir.ir.guard2(Opcode::Eq, Ty::Ptr, fp, kp)?;
            }
            _ => {
                let kf = self.tir.ir.kgc(Ty::Func, f.addr())?;
                self.tir.ir.guard2(Opcode::Eq, Ty::Func, fop, kf)?;
            }
        }
        Ok(())
    }

    /// Record `CALL`, `ITERC` or `CALLT`.
    fn call(
        &mut self,
        vs: &mut VmState,
        pc: Pc,
        ins: BcIns,
    ) -> Result<Option<TraceLink>, CompilationError> {
        let op = ins.op();
        let a = usize::from(ins.a());
        let n = match op {
            Op::Call => usize::from(ins.c()) - 1,
            Op::IterC => 2,
            _ => usize::from(ins.d()) - 1,
        };
        if op != Op::CallT && ins.b() == 0 {
            return Err(TraceError::NotYetImplemented(op).into());
        }
        // The interpreter hasn't yet copied `ITERC`'s operands.
        let (fop, fv) = if op == Op::IterC {
            let f = self.slot(vs, a - 3)?;
            let s = self.slot(vs, a - 2)?;
            let c = self.slot(vs, a - 1)?;
            self.st.set(a, f)?;
            self.st.set(a + 2, s)?;
            self.st.set(a + 3, c)?;
            (f, vs.slot(a as isize - 3))
        } else {
            (self.slot(vs, a)?, vs.slot(a as isize))
        };
        let mut args = SmallVec::<[(Operand, TValue); 8]>::new();
        for i in 0..n {
            let v = if op == Op::IterC {
                vs.slot(a as isize - 2 + i as isize)
            } else {
                vs.slot((a + 2 + i) as isize)
            };
            let r = match self.st.get(a + 2 + i) {
                Some(r) if op == Op::IterC => self.canon(r),
                _ => self.slot(vs, a + 2 + i)?,
            };
            args.push((r, v));
        }
        let f = match fv.as_func() {
            Some(f) => f,
            None => return Err(TraceError::BadType.into()),
        };
        self.guard_func(fop, f)?;

        match f.proto() {
            Some(p) => {
                if p.is_vararg {
                    return Err(TraceError::NotYetImplemented(Op::FuncV).into());
                }
                let framesize = usize::from(p.framesize);
                if op == Op::CallT {
                    if vs.slot(-1).tag() == Tag::FrameVarg {
                        return Err(TraceError::NotYetImplemented(Op::CallT).into());
                    }
                    let base = self.st.baseslot;
                    if base + framesize >= MAX_SLOTS {
                        return Err(TraceError::StackOverflow.into());
                    }
                    self.st.slots[base - 2] = Some(fop);
                    for (i, (r, _)) in args.iter().enumerate() {
                        self.st.slots[base + i] = Some(*r);
                    }
                    for s in &mut self.st.slots[base + n..] {
                        *s = None;
                    }
                    self.st.maxslot = n;
                    self.topslot(base + framesize);
                } else {
                    let link = self
                        .tir
                        .ir
                        .intern(Const::Link(Tag::FrameLua, pc.next().addr() as u64))?;
                    self.st.set(a + 1, link)?;
                    let newbase = self.st.baseslot + a + 2;
                    if newbase + framesize >= MAX_SLOTS {
                        return Err(TraceError::StackOverflow.into());
                    }
                    for s in &mut self.st.slots[newbase + n..] {
                        *s = None;
                    }
                    self.st.frames.push(newbase);
                    self.st.baseslot = newbase;
                    self.st.maxslot = n;
                    self.topslot(newbase + framesize);
                }
                Ok(None)
            }
            None => {
                let rs = self.record_ff(vs, f.ffid, &args)?;
                if op == Op::CallT {
                    return self.ret_values(vs, pc, &rs);
                }
                let want = usize::from(ins.b()) - 1;
                for i in 0..want {
                    let r = rs.get(i).copied().unwrap_or(JitIr::kpri(Ty::Nil));
                    self.st.set(a + i, r)?;
                }
                self.st.maxslot = a + want;
                Ok(None)
            }
        }
    }

    /// Return the values `rs` from the current frame.
    fn ret_values(
        &mut self,
        vs: &VmState,
        pc: Pc,
        rs: &[Operand],
    ) -> Result<Option<TraceLink>, CompilationError> {
        if let Some(fb) = self.st.frames.pop() {
            // Returning from an inlined call.
            let rpc = vs
                .slot(-1)
                .as_link_lua()
                .ok_or(TraceError::ReturnToLowerFrameNyi)?;
            let callins = rpc.prev().get();
            if callins.b() == 0 {
                return Err(TraceError::NotYetImplemented(Op::CallM).into());
            }
            let want = usize::from(callins.b()) - 1;
            for i in 0..want {
                let r = rs.get(i).copied().unwrap_or(JitIr::kpri(Ty::Nil));
                self.st.slots[fb - 2 + i] = Some(r);
            }
            for s in &mut self.st.slots[fb - 2 + want..] {
                *s = None;
            }
            self.st.baseslot = self.st.frames.last().copied().unwrap_or(2);
            self.st.maxslot = usize::from(callins.a()) + want;
            return Ok(None);
        }

        if !self.tir.is_side() {
            if self.startins.op() == Op::FuncF {
                return self.stop(TraceLink::Return, pc);
            }
            return Err(TraceError::LoopLeft.into());
        }

        let link = vs.slot(-1);
        match link.tag() {
            Tag::FrameC => self.stop(TraceLink::Return, pc),
            Tag::FrameLua => {
                let rpc = link.as_link_lua().ok_or(TraceError::ReturnToLowerFrameNyi)?;
                let cbase =
                    Vm::frame_prev(vs.stack, vs.base).ok_or(TraceError::ReturnToLowerFrameNyi)?;
                let cproto = proto_of(vs.stack, cbase);
                if cproto.jit_disabled() {
                    return Err(TraceError::CallerJitDisabled.into());
                }
                let count = self
                    .retprotos
                    .iter()
                    .filter(|p| **p == cproto.addr())
                    .count() as u32;
                if count > 0 {
                    if pc == self.tir.startpc {
                        if count + self.tailcalled > self.params.recunroll() {
                            return self.stop(TraceLink::DownRec, pc);
                        }
                    } else {
                        return Err(TraceError::DownRecursion.into());
                    }
                }
                let callins = rpc.prev().get();
                if callins.b() == 0 {
                    return Err(TraceError::NotYetImplemented(Op::CallM).into());
                }
                let ca = usize::from(callins.a());
                let want = usize::from(callins.b()) - 1;
                let krpc = self.tir.ir.kptr(rpc.addr())?;
                self.tir.ir.emit(Inst::guarded(
                    Opcode::Retf,
                    Ty::Void,
                    Opnd::Ref(krpc),
                    Opnd::Lit((ca + 2) as u32),
                ))?;
                self.retprotos.push(cproto.addr());
                self.retdepth += 1;
                self.retdelta += ca + 2;
                for s in self.st.slots.iter_mut() {
                    *s = None;
                }
                self.st.baseslot = 2;
                for i in 0..want {
                    let r = rs.get(i).copied().unwrap_or(JitIr::kpri(Ty::Nil));
                    self.st.set(ca + i, r)?;
                }
                self.st.maxslot = ca + want;
                Ok(None)
            }
            _ => Err(TraceError::ReturnToLowerFrameNyi.into()),
        }
    }
}
