//! The bytecode interpreter.

use smallvec::SmallVec;

use super::{
    bc::{BcIns, Op, Pc},
    builtins::{self, fmt_num},
    obj::Proto,
    value::{GcPtr, Tag, TValue},
    ExitState, Vm, VmError, VmState, STACK_EXTRA, STACK_SLOTS,
};

/// How many `__index`/`__newindex` tables are followed before giving up.
pub(crate) const MAX_INDEX_CHAIN: usize = 100;

/// Hot counter decrements for loops and calls.
pub(crate) const HOTCOUNT_LOOP: u16 = 2;
pub(crate) const HOTCOUNT_CALL: u16 = 1;

/// Compute the arithmetic operation of `op` on two numbers.
pub(crate) fn arith(op: Op, x: f64, y: f64) -> f64 {
    match op {
        Op::AddVN | Op::AddNV | Op::AddVV => x + y,
        Op::SubVN | Op::SubNV | Op::SubVV => x - y,
        Op::MulVN | Op::MulNV | Op::MulVV => x * y,
        Op::DivVN | Op::DivNV | Op::DivVV => x / y,
        Op::ModVN | Op::ModNV | Op::ModVV => x - (x / y).floor() * y,
        Op::Pow => x.powf(y),
        _ => unreachable!(),
    }
}

/// Does the numeric `for` loop with the given state continue?
pub(crate) fn for_continues(idx: f64, stop: f64, step: f64) -> bool {
    if step.is_sign_negative() {
        stop <= idx
    } else {
        idx <= stop
    }
}

fn type_err(op: &'static str, v: TValue) -> VmError {
    VmError::Type {
        op,
        ty: v.tag().type_name(),
    }
}

/// Evaluate an ordered comparison bytecode.
fn compare(op: Op, x: TValue, y: TValue) -> Result<bool, VmError> {
    match (x.as_num(), y.as_num(), x.as_str(), y.as_str()) {
        (Some(a), Some(b), _, _) => Ok(match op {
            Op::IsLt => a < b,
            Op::IsGe => a >= b,
            Op::IsLe => a <= b,
            Op::IsGt => a > b,
            _ => unreachable!(),
        }),
        (_, _, Some(a), Some(b)) => {
            let (a, b) = (a.as_str(), b.as_str());
            Ok(match op {
                Op::IsLt => a < b,
                Op::IsGe => a >= b,
                Op::IsLe => a <= b,
                Op::IsGt => a > b,
                _ => unreachable!(),
            })
        }
        _ => Err(VmError::Compare(
            x.tag().type_name(),
            y.tag().type_name(),
        )),
    }
}

/// The value of the primitive constant `d` of `KPRI`/`ISEQP`.
pub(crate) fn pri(d: u16) -> TValue {
    match d {
        0 => TValue::NIL,
        1 => TValue::bool(false),
        _ => TValue::bool(true),
    }
}

/// The prototype of the Lua function whose frame starts at `base`.
pub(crate) fn proto_of(stack: &[TValue], base: usize) -> GcPtr<Proto> {
    stack[base - 2]
        .as_func()
        .and_then(|f| f.proto())
        .expect("frame without a Lua function")
}

/// Decode the `D` operand of `TNEW` into array and hash sizes.
pub(crate) fn tnew_sizes(d: u16) -> (usize, usize) {
    let asize = usize::from(d & 0x7ff);
    let hbits = d >> 11;
    (asize, if hbits == 0 { 0 } else { 1 << hbits })
}

enum Returned {
    Lua { base: usize, pc: Pc, multres: usize },
    Host(Vec<TValue>),
}

impl Vm {
    /// Index `o` with `k`, following `__index` tables.
    pub(crate) fn index(&mut self, o: TValue, k: TValue) -> Result<TValue, VmError> {
        let mut t = o.as_tab().ok_or_else(|| type_err("index", o))?;
        let mmk = TValue::str(self.heap.intern("__index"));
        for _ in 0..MAX_INDEX_CHAIN {
            let v = t.get(&k);
            if !v.is_nil() {
                return Ok(v);
            }
            let h = match t.meta() {
                Some(mt) => mt.get(&mmk),
                None => return Ok(TValue::NIL),
            };
            match h.tag() {
                Tag::Nil => return Ok(TValue::NIL),
                Tag::Tab => t = h.as_tab().unwrap(),
                _ => return Err(VmError::Metamethod("__index")),
            }
        }
        Err(VmError::IndexLoop)
    }

    /// Store `v` at `o[k]`, following `__newindex` tables.
    pub(crate) fn newindex(&mut self, o: TValue, k: TValue, v: TValue) -> Result<(), VmError> {
        let mut t = o.as_tab().ok_or_else(|| type_err("index", o))?;
        let mmk = TValue::str(self.heap.intern("__newindex"));
        for _ in 0..MAX_INDEX_CHAIN {
            let h = match t.meta() {
                Some(mt) if t.get(&k).is_nil() => mt.get(&mmk),
                _ => TValue::NIL,
            };
            match h.tag() {
                Tag::Nil => {
                    t.as_mut().set(&k, v)?;
                    if v.tag() >= Tag::Str {
                        self.heap.barrier(t);
                    }
                    return Ok(());
                }
                Tag::Tab => t = h.as_tab().unwrap(),
                _ => return Err(VmError::Metamethod("__newindex")),
            }
        }
        Err(VmError::IndexLoop)
    }

    fn concat(&mut self, vs: &[TValue]) -> Result<TValue, VmError> {
        let mut s = String::new();
        for v in vs {
            match v.tag() {
                Tag::Str => s.push_str(v.as_str().unwrap().as_str()),
                Tag::Num => s.push_str(&fmt_num(f64::from_bits(v.u))),
                _ => return Err(type_err("concatenate", *v)),
            }
        }
        Ok(TValue::str(self.heap.intern(&s)))
    }

    fn check_stack(&self, base: usize, framesize: u8) -> Result<(), VmError> {
        if base + usize::from(framesize) + STACK_EXTRA >= STACK_SLOTS {
            return Err(VmError::StackOverflow);
        }
        Ok(())
    }

    /// Return `n` values starting at stack index `src` from the frame at `base`.
    fn ret(&mut self, mut base: usize, src: usize, n: usize) -> Returned {
        loop {
            let link = self.stack[base - 1];
            match link.tag() {
                Tag::FrameVarg => base -= link.u as usize,
                Tag::FrameLua => {
                    let rpc = link.as_link_lua().unwrap();
                    let callins = rpc.prev().get();
                    let dst = base - 2;
                    self.stack.copy_within(src..src + n, dst);
                    let multres = if callins.b() == 0 {
                        n
                    } else {
                        let want = usize::from(callins.b()) - 1;
                        for i in n..want {
                            self.stack[dst + i] = TValue::NIL;
                        }
                        want
                    };
                    return Returned::Lua {
                        base: dst - usize::from(callins.a()),
                        pc: rpc,
                        multres,
                    };
                }
                Tag::FrameC => return Returned::Host(self.stack[src..src + n].to_vec()),
                _ => unreachable!(),
            }
        }
    }

    /// Write builtin results `rs` to stack index `dst` for a call instruction wanting `b - 1`
    /// results. Returns the new `multres`.
    fn store_results(&mut self, dst: usize, rs: &[TValue], b: u8) -> usize {
        self.stack[dst..dst + rs.len()].copy_from_slice(rs);
        if b == 0 {
            rs.len()
        } else {
            let want = usize::from(b) - 1;
            for i in rs.len()..want {
                self.stack[dst + i] = TValue::NIL;
            }
            want
        }
    }

    /// Hand the instruction at `pc` to the trace recorder.
    fn record_hook(&mut self, pc: Pc, base: usize, nargs: usize) {
        let st = VmState {
            pc,
            base,
            stack: &self.stack,
            heap: &mut self.heap,
            globals: self.globals,
            ffc: &self.ffc,
            nargs,
        };
        self.mt.record_ins(st);
    }

    /// Count down the hot counter of `pc`, starting a trace if it underflows.
    fn hotcount(&mut self, pc: Pc, dec: u16, base: usize, nargs: usize) {
        if self.mt.hotcount(pc, dec) {
            let st = VmState {
                pc,
                base,
                stack: &self.stack,
                heap: &mut self.heap,
                globals: self.globals,
                ffc: &self.ffc,
                nargs,
            };
            self.mt.hot_start(st);
        }
    }

    fn enter_trace(&mut self, traceno: u16, base: usize) -> ExitState {
        self.mt
            .execute_trace(traceno, base, &mut self.stack, &mut self.heap)
    }

    /// Set up the frame of Lua function call at stack index `fbase` (the callee's func slot),
    /// returning the callee's base and first `Pc`, or run a builtin in place.
    fn call_setup(
        &mut self,
        fbase: usize,
        nargs: usize,
        retpc: Pc,
    ) -> Result<Option<(usize, Pc)>, VmError> {
        let fv = self.stack[fbase];
        let f = fv.as_func().ok_or_else(|| VmError::Call(fv.tag().type_name()))?;
        self.stack[fbase + 1] = TValue::link_lua(retpc);
        match f.proto() {
            Some(p) => {
                let nbase = fbase + 2;
                self.check_stack(nbase + nargs, p.framesize)?;
                Ok(Some((nbase, p.pc_at(0))))
            }
            None => Ok(None),
        }
    }

    fn call_builtin(&mut self, fbase: usize, nargs: usize) -> Result<SmallVec<[TValue; 3]>, VmError> {
        let f = self.stack[fbase].as_func().unwrap();
        let args: SmallVec<[TValue; 8]> = self.stack[fbase + 2..fbase + 2 + nargs].into();
        builtins::call(&mut self.heap, f.ffid, &self.ffc, &args)
    }

    /// Execute the function whose base is `base` from `pc` until it returns to the host.
    pub(crate) fn execute(
        &mut self,
        mut base: usize,
        mut pc: Pc,
        mut nargs: usize,
    ) -> Result<Vec<TValue>, VmError> {
        let mut multres = 0usize;
        let r = loop {
            if self.mt.is_recording() {
                self.record_hook(pc, base, nargs);
            }
            let ins = pc.get();
            let a = base + usize::from(ins.a());
            let b = base + usize::from(ins.b());
            let c = base + usize::from(ins.c());
            let d = base + usize::from(ins.d());
            match ins.op() {
                Op::IsLt | Op::IsGe | Op::IsLe | Op::IsGt => {
                    let cond = compare(ins.op(), self.stack[a], self.stack[d])?;
                    pc = if cond { pc.next().jump_target() } else { pc.offset(2) };
                    continue;
                }
                Op::IsEqV | Op::IsNeV | Op::IsEqS | Op::IsNeS | Op::IsEqN | Op::IsNeN
                | Op::IsEqP | Op::IsNeP => {
                    let y = match ins.op() {
                        Op::IsEqV | Op::IsNeV => self.stack[d],
                        Op::IsEqS | Op::IsNeS => TValue::str(proto_of(&self.stack, base).kstr(ins.d())),
                        Op::IsEqN | Op::IsNeN => TValue::num(proto_of(&self.stack, base).knum(ins.d())),
                        _ => pri(ins.d()),
                    };
                    let eq = self.stack[a].raw_eq(&y);
                    let cond = if matches!(ins.op(), Op::IsEqV | Op::IsEqS | Op::IsEqN | Op::IsEqP)
                    {
                        eq
                    } else {
                        !eq
                    };
                    pc = if cond { pc.next().jump_target() } else { pc.offset(2) };
                    continue;
                }
                Op::IsT | Op::IsF => {
                    let t = self.stack[d].is_truthy();
                    let cond = if ins.op() == Op::IsT { t } else { !t };
                    pc = if cond { pc.next().jump_target() } else { pc.offset(2) };
                    continue;
                }
                Op::Mov => self.stack[a] = self.stack[d],
                Op::Not => self.stack[a] = TValue::bool(!self.stack[d].is_truthy()),
                Op::Unm => {
                    let v = self.stack[d];
                    let n = v.as_num().ok_or_else(|| type_err("perform arithmetic on", v))?;
                    self.stack[a] = TValue::num(-n);
                }
                Op::Len => {
                    let v = self.stack[d];
                    self.stack[a] = match v.tag() {
                        Tag::Str => TValue::num(v.as_str().unwrap().len() as f64),
                        Tag::Tab => TValue::num(v.as_tab().unwrap().len() as f64),
                        _ => return Err(type_err("get length of", v)),
                    };
                }
                Op::AddVN | Op::SubVN | Op::MulVN | Op::DivVN | Op::ModVN | Op::AddNV
                | Op::SubNV | Op::MulNV | Op::DivNV | Op::ModNV | Op::AddVV | Op::SubVV
                | Op::MulVV | Op::DivVV | Op::ModVV | Op::Pow => {
                    let (x, y) = match ins.op() {
                        Op::AddVN | Op::SubVN | Op::MulVN | Op::DivVN | Op::ModVN => {
                            (self.stack[b], TValue::num(proto_of(&self.stack, base).knum(u16::from(ins.c()))))
                        }
                        Op::AddNV | Op::SubNV | Op::MulNV | Op::DivNV | Op::ModNV => {
                            (TValue::num(proto_of(&self.stack, base).knum(u16::from(ins.c()))), self.stack[b])
                        }
                        _ => (self.stack[b], self.stack[c]),
                    };
                    let xn = x.as_num().ok_or_else(|| type_err("perform arithmetic on", x))?;
                    let yn = y.as_num().ok_or_else(|| type_err("perform arithmetic on", y))?;
                    self.stack[a] = TValue::num(arith(ins.op(), xn, yn));
                }
                Op::Cat => {
                    let vs: SmallVec<[TValue; 8]> = self.stack[b..=c].into();
                    self.stack[a] = self.concat(&vs)?;
                }
                Op::KStr => self.stack[a] = TValue::str(proto_of(&self.stack, base).kstr(ins.d())),
                Op::KShort => self.stack[a] = TValue::num(f64::from(ins.d() as i16)),
                Op::KNum => self.stack[a] = TValue::num(proto_of(&self.stack, base).knum(ins.d())),
                Op::KPri => self.stack[a] = pri(ins.d()),
                Op::KNil => {
                    for i in a..=d {
                        self.stack[i] = TValue::NIL;
                    }
                }
                Op::GGet => {
                    let k = TValue::str(proto_of(&self.stack, base).kstr(ins.d()));
                    self.stack[a] = self.index(TValue::tab(self.globals), k)?;
                }
                Op::GSet => {
                    let k = TValue::str(proto_of(&self.stack, base).kstr(ins.d()));
                    self.newindex(TValue::tab(self.globals), k, self.stack[a])?;
                }
                Op::TNew => {
                    let (asize, hsize) = tnew_sizes(ins.d());
                    self.stack[a] = TValue::tab(self.heap.new_table(asize, hsize));
                }
                Op::TGetV | Op::TGetS | Op::TGetB => {
                    let k = match ins.op() {
                        Op::TGetV => self.stack[c],
                        Op::TGetS => TValue::str(proto_of(&self.stack, base).kstr(u16::from(ins.c()))),
                        _ => TValue::num(f64::from(ins.c())),
                    };
                    self.stack[a] = self.index(self.stack[b], k)?;
                }
                Op::TSetV | Op::TSetS | Op::TSetB => {
                    let k = match ins.op() {
                        Op::TSetV => self.stack[c],
                        Op::TSetS => TValue::str(proto_of(&self.stack, base).kstr(u16::from(ins.c()))),
                        _ => TValue::num(f64::from(ins.c())),
                    };
                    self.newindex(self.stack[b], k, self.stack[a])?;
                }
                Op::FNew => {
                    let p = proto_of(&self.stack, base).kproto(ins.d()).unwrap();
                    self.stack[a] = TValue::func(self.heap.new_closure(p));
                }
                Op::Call | Op::CallM => {
                    let n = if ins.op() == Op::Call {
                        usize::from(ins.c()) - 1
                    } else {
                        usize::from(ins.c()) + multres
                    };
                    match self.call_setup(a, n, pc.next())? {
                        Some((nbase, npc)) => {
                            base = nbase;
                            pc = npc;
                            nargs = n;
                            continue;
                        }
                        None => {
                            let rs = self.call_builtin(a, n)?;
                            multres = self.store_results(a, &rs, ins.b());
                        }
                    }
                }
                Op::CallT => {
                    let n = usize::from(ins.d()) - 1;
                    let fv = self.stack[a];
                    let f = fv.as_func().ok_or_else(|| VmError::Call(fv.tag().type_name()))?;
                    match f.proto() {
                        Some(p) => {
                            let link = self.stack[base - 1];
                            if link.tag() == Tag::FrameVarg {
                                base -= link.u as usize;
                            }
                            self.check_stack(base + n, p.framesize)?;
                            self.stack[base - 2] = fv;
                            self.stack.copy_within(a + 2..a + 2 + n, base);
                            pc = p.pc_at(0);
                            nargs = n;
                            continue;
                        }
                        None => {
                            let rs = self.call_builtin(a, n)?;
                            self.stack[a..a + rs.len()].copy_from_slice(&rs);
                            match self.ret(base, a, rs.len()) {
                                Returned::Lua {
                                    base: nb,
                                    pc: npc,
                                    multres: m,
                                } => {
                                    base = nb;
                                    pc = npc;
                                    multres = m;
                                    continue;
                                }
                                Returned::Host(rs) => break rs,
                            }
                        }
                    }
                }
                Op::IterC => {
                    self.stack[a] = self.stack[a - 3];
                    self.stack[a + 2] = self.stack[a - 2];
                    self.stack[a + 3] = self.stack[a - 1];
                    match self.call_setup(a, 2, pc.next())? {
                        Some((nbase, npc)) => {
                            base = nbase;
                            pc = npc;
                            nargs = 2;
                            continue;
                        }
                        None => {
                            let rs = self.call_builtin(a, 2)?;
                            multres = self.store_results(a, &rs, ins.b());
                        }
                    }
                }
                Op::Varg => {
                    let link = self.stack[base - 1];
                    let (vbase, nvarg) = if link.tag() == Tag::FrameVarg {
                        let delta = link.u as usize;
                        let np = usize::from(ins.c());
                        (base - delta + np, (delta - 2).saturating_sub(np))
                    } else {
                        (base, 0)
                    };
                    let want = if ins.b() == 0 {
                        multres = nvarg;
                        nvarg
                    } else {
                        usize::from(ins.b()) - 1
                    };
                    for i in 0..want {
                        self.stack[a + i] = if i < nvarg {
                            self.stack[vbase + i]
                        } else {
                            TValue::NIL
                        };
                    }
                }
                Op::RetM | Op::Ret | Op::Ret0 | Op::Ret1 => {
                    let n = match ins.op() {
                        Op::RetM => usize::from(ins.d()) + multres,
                        Op::Ret => usize::from(ins.d()) - 1,
                        Op::Ret0 => 0,
                        _ => 1,
                    };
                    match self.ret(base, a, n) {
                        Returned::Lua {
                            base: nb,
                            pc: npc,
                            multres: m,
                        } => {
                            base = nb;
                            pc = npc;
                            multres = m;
                            continue;
                        }
                        Returned::Host(rs) => break rs,
                    }
                }
                Op::ForI => {
                    for i in 0..3 {
                        if !self.stack[a + i].is_num() {
                            return Err(type_err("iterate with", self.stack[a + i]));
                        }
                    }
                    let idx = self.stack[a].as_num().unwrap();
                    let stop = self.stack[a + 1].as_num().unwrap();
                    let step = self.stack[a + 2].as_num().unwrap();
                    if for_continues(idx, stop, step) {
                        self.stack[a + 3] = self.stack[a];
                    } else {
                        pc = pc.jump_target();
                        continue;
                    }
                }
                Op::ForL | Op::IForL | Op::JForL => {
                    if ins.op() == Op::ForL {
                        self.hotcount(pc, HOTCOUNT_LOOP, base, nargs);
                    }
                    let idx = self.stack[a].as_num().unwrap();
                    let stop = self.stack[a + 1].as_num().unwrap();
                    let step = self.stack[a + 2].as_num().unwrap();
                    let idx = idx + step;
                    if for_continues(idx, stop, step) {
                        self.stack[a] = TValue::num(idx);
                        self.stack[a + 3] = TValue::num(idx);
                        if ins.op() == Op::JForL {
                            let e = self.enter_trace(ins.d(), base);
                            (pc, base, multres) = (e.pc, e.base, e.multres);
                        } else {
                            pc = pc.jump_target();
                        }
                        continue;
                    }
                }
                Op::IterL | Op::IIterL | Op::JIterL => {
                    if ins.op() == Op::IterL {
                        self.hotcount(pc, HOTCOUNT_LOOP, base, nargs);
                    }
                    if !self.stack[a].is_nil() {
                        self.stack[a - 1] = self.stack[a];
                        if ins.op() == Op::JIterL {
                            let e = self.enter_trace(ins.d(), base);
                            (pc, base, multres) = (e.pc, e.base, e.multres);
                        } else {
                            pc = pc.jump_target();
                        }
                        continue;
                    }
                }
                Op::Loop | Op::ILoop => {
                    if ins.op() == Op::Loop {
                        self.hotcount(pc, HOTCOUNT_LOOP, base, nargs);
                    }
                }
                Op::JLoop => {
                    let e = self.enter_trace(ins.d(), base);
                    (pc, base, multres) = (e.pc, e.base, e.multres);
                    continue;
                }
                Op::Jmp => {
                    pc = pc.jump_target();
                    continue;
                }
                Op::FuncF | Op::IFuncF | Op::JFuncF => {
                    let p = proto_of(&self.stack, base);
                    for i in nargs..usize::from(p.numparams) {
                        self.stack[base + i] = TValue::NIL;
                    }
                    match ins.op() {
                        Op::FuncF => self.hotcount(pc, HOTCOUNT_CALL, base, nargs),
                        Op::JFuncF => {
                            let e = self.enter_trace(ins.d(), base);
                            (pc, base, multres) = (e.pc, e.base, e.multres);
                            continue;
                        }
                        _ => (),
                    }
                }
                Op::FuncV => {
                    let p = proto_of(&self.stack, base);
                    let delta = nargs + 2;
                    let nbase = base + delta;
                    self.check_stack(nbase, p.framesize)?;
                    self.stack[nbase - 2] = self.stack[base - 2];
                    self.stack[nbase - 1] = TValue::link_varg(delta);
                    for i in 0..usize::from(p.numparams) {
                        if i < nargs {
                            self.stack[nbase + i] = self.stack[base + i];
                            self.stack[base + i] = TValue::NIL;
                        } else {
                            self.stack[nbase + i] = TValue::NIL;
                        }
                    }
                    base = nbase;
                }
            }
            pc = pc.next();
        };
        Ok(r)
    }
}

impl Vm {
    /// The stack index of the base of the frame below the frame at `base`, skipping vararg
    /// frames, or `None` if `base` is the outermost frame.
    pub(crate) fn frame_prev(stack: &[TValue], mut base: usize) -> Option<usize> {
        loop {
            let link = stack[base - 1];
            match link.tag() {
                Tag::FrameVarg => base -= link.u as usize,
                Tag::FrameLua => {
                    let callins: BcIns = link.as_link_lua()?.prev().get();
                    return Some(base - 2 - usize::from(callins.a()));
                }
                _ => return None,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        params::{JitParams, OptFlags},
        vm::bc::ProtoBuilder,
    };

    fn vm() -> Vm {
        Vm::with_params(false, JitParams::default(), OptFlags::default())
    }

    /// `function(n) local s = 0; for i = 1, n do s = s + i end; return s end`
    #[test]
    fn numeric_for() {
        let mut vm = vm();
        let mut b = ProtoBuilder::new("sum", 1, 6);
        b.ad(Op::KShort, 1, 0);
        b.ad(Op::KShort, 2, 1);
        b.ad(Op::Mov, 3, 0);
        b.ad(Op::KShort, 4, 1);
        let fori = b.jmp_fwd(Op::ForI, 2);
        let body = b.here();
        b.abc(Op::AddVV, 1, 1, 5);
        b.jmp_to(Op::ForL, 2, body);
        b.patch_here(fori);
        b.ad(Op::Ret1, 1, 2);
        let p = b.finish(&mut vm.heap);
        let f = vm.closure(p);
        let r = vm.call(f, &[TValue::num(10.0)]).unwrap();
        assert_eq!(r[0].as_num(), Some(55.0));
    }

    /// Calls, varargs and multiple results.
    #[test]
    fn calls_and_varargs() {
        let mut vm = vm();
        // function(...) return ... end
        let mut b = ProtoBuilder::new("id", 0, 4).vararg();
        b.abc(Op::Varg, 0, 0, 0);
        b.ad(Op::RetM, 0, 0);
        let id = b.finish(&mut vm.heap);
        // function(f) return f(1, 2, 3) end, adjusted to two results
        let mut b = ProtoBuilder::new("caller", 1, 8);
        b.ad(Op::Mov, 1, 0);
        b.ad(Op::KShort, 3, 1);
        b.ad(Op::KShort, 4, 2);
        b.ad(Op::KShort, 5, 3);
        b.abc(Op::Call, 1, 3, 4);
        b.ad(Op::Ret, 1, 3);
        let caller = b.finish(&mut vm.heap);
        let idf = vm.closure(id);
        let cf = vm.closure(caller);
        let r = vm.call(cf, &[TValue::func(idf)]).unwrap();
        assert_eq!(r.len(), 2);
        assert_eq!(r[0].as_num(), Some(1.0));
        assert_eq!(r[1].as_num(), Some(2.0));
    }

    #[test]
    fn index_chain() {
        let mut vm = vm();
        let base = vm.heap.new_table(0, 0);
        let k = TValue::str(vm.heap.intern("x"));
        base.as_mut().set(&k, TValue::num(7.0)).unwrap();
        let meta = vm.heap.new_table(0, 0);
        let ik = TValue::str(vm.heap.intern("__index"));
        meta.as_mut().set(&ik, TValue::tab(base)).unwrap();
        let t = vm.heap.new_table(0, 0);
        t.as_mut().set_meta(Some(meta));
        assert_eq!(vm.index(TValue::tab(t), k).unwrap().as_num(), Some(7.0));
        meta.as_mut().set(&ik, TValue::tab(t)).unwrap();
        base.as_mut().set_meta(Some(meta));
        let missing = TValue::str(vm.heap.intern("y"));
        assert!(matches!(
            vm.index(TValue::tab(t), missing),
            Err(VmError::IndexLoop)
        ));
    }
}
