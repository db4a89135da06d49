//! The meta-tracer: decides when to record traces, drives them through the compiler, links them
//! into the bytecode and runs them.

use std::{
    cell::Cell,
    error::Error,
    mem,
    rc::Rc,
    sync::atomic::{AtomicBool, Ordering},
};

use strum::Display;

use crate::{
    compile::{
        asm::{
            assemble,
            mcode::{Mcode, PatchGuard},
            regalloc::BASE,
            x64::set_rel32,
        },
        exit::{enter, split_exit, JitContext},
        jit_ir::{Const, ConstIdx, K64},
        optimise,
        record::Recorder,
        snap::restore,
        trace::{Trace, TraceIr, TraceLink},
        CompilationError, ResourceError, TraceError,
    },
    location::{HotCounts, Penalty, PenaltyCache},
    log::{
        stats::{JitStats, Stats, TimingState},
        Log, Verbosity,
    },
    params::{JitParams, OptFlags, ParamError},
    vm::{bc::Pc, heap::Heap, value::TValue, ExitState, VmState},
};

/// The states of the trace compiler.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum JitState {
    /// Not doing anything: the interpreter is counting.
    Idle,
    /// Setting up a recorder.
    Start,
    /// Recording the bytecode the interpreter executes.
    Record,
    /// Recording has finished and the trace is being optimised.
    End,
    /// Generating machine code.
    Asm,
    /// Cleaning up after a failed trace.
    Abort,
}

/// A summary of a compiled trace.
#[derive(Debug)]
pub struct TraceInfo {
    pub traceno: u16,
    /// For side traces, the parent trace and the snapshot the side trace is attached to.
    pub parent: Option<(u16, usize)>,
    pub link: TraceLink,
    pub nins: usize,
    pub nsnaps: usize,
    pub szmcode: usize,
    /// How many times the trace's exits have been taken.
    pub exits: u32,
    pub flushed: bool,
    /// The trace's IR in its textual form.
    pub ir: String,
}

/// The meta-tracer. Each [crate::vm::Vm] owns one.
pub struct MT {
    jit: bool,
    params: JitParams,
    opt: OptFlags,
    log: Log,
    stats: Stats,
    hotcounts: HotCounts,
    penalties: PenaltyCache,
    /// Indexed by trace number: slot 0 is never used. Flushed traces stay here (their code may
    /// still be reached through other traces' links) until everything is flushed.
    traces: Vec<Option<Rc<Trace>>>,
    state: JitState,
    recorder: Option<Recorder>,
    mcode: Mcode,
    k64: K64,
    ctx: Box<JitContext>,
    abort: AtomicBool,
}

impl MT {
    /// Create a meta-tracer configured from the `UJ_JIT_PARAMS`, `UJ_JIT_OPT` and `UJD_LOG*`
    /// environment variables.
    pub fn new() -> Result<Self, Box<dyn Error>> {
        let params = JitParams::from_env()?;
        let opt = OptFlags::from_env()?;
        let jit = cfg!(all(target_arch = "x86_64", target_os = "linux"));
        let mut mt = Self::with_params(jit, params, opt);
        mt.log = Log::new()?;
        Ok(mt)
    }

    /// Create a meta-tracer with explicit settings. If `jit` is false, nothing is ever recorded.
    pub fn with_params(jit: bool, params: JitParams, opt: OptFlags) -> Self {
        let hotcounts = HotCounts::new(hotcount_start(&params));
        let mcode = Mcode::new(params.sizemcode(), params.maxmcode());
        Self {
            jit,
            params,
            opt,
            log: Log::with_level(Verbosity::Error),
            stats: Stats::new(),
            hotcounts,
            penalties: PenaltyCache::new(),
            traces: vec![None],
            state: JitState::Idle,
            recorder: None,
            mcode,
            k64: K64::new(),
            ctx: JitContext::new(),
            abort: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> JitState {
        self.state
    }

    pub fn params(&self) -> &JitParams {
        &self.params
    }

    pub fn stats(&self) -> JitStats {
        self.stats.get()
    }

    /// Set parameter `name` to `val`. Only allowed while no trace is being compiled.
    pub fn set_param(&mut self, name: &str, val: u32) -> Result<(), ParamError> {
        if self.state != JitState::Idle {
            return Err(ParamError::NotIdle);
        }
        self.params.set(name, val)?;
        self.mcode
            .set_limits(self.params.sizemcode(), self.params.maxmcode());
        self.hotcounts.reset(hotcount_start(&self.params));
        Ok(())
    }

    /// Parse optimisation flags (e.g. `-fold,+sink`) and apply them on top of the current ones.
    pub fn set_opt(&mut self, flags: &str) -> Result<(), ParamError> {
        if self.state != JitState::Idle {
            return Err(ParamError::NotIdle);
        }
        self.opt.parse(flags)
    }

    /// Ask for the trace being recorded to be abandoned. If nothing is being recorded, the next
    /// trace is. The flag is checked between recorded instructions and between compilation
    /// phases.
    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::Relaxed);
    }

    /// The number of trace numbers in use, including those of flushed traces.
    pub fn num_traces(&self) -> usize {
        self.traces.len() - 1
    }

    pub fn trace_info(&self, traceno: u16) -> Option<TraceInfo> {
        let t = self.traces.get(usize::from(traceno))?.as_ref()?;
        Some(TraceInfo {
            traceno,
            parent: t.tir.parent.map(|(p, s)| (p, usize::from(s))),
            link: t.tir.link,
            nins: t.tir.ir.len(),
            nsnaps: t.tir.snaps.len(),
            szmcode: t.szmcode,
            exits: t.tir.snaps.iter().map(|s| u32::from(s.count.get())).sum(),
            flushed: t.flushed.get(),
            ir: t.tir.to_string(),
        })
    }

    pub(crate) fn is_recording(&self) -> bool {
        self.recorder.is_some()
    }

    fn set_state(&mut self, state: JitState) {
        if self.state != state {
            self.log.log(
                Verbosity::JITStateChange,
                &format!("jit-state: {} -> {state}", self.state),
            );
            self.state = state;
        }
    }

    /// Count down the hot counter of `pc` by `dec`. Returns true if a trace should be started.
    pub(crate) fn hotcount(&mut self, pc: Pc, dec: u16) -> bool {
        if !self.jit || self.recorder.is_some() {
            return false;
        }
        self.hotcounts.count(pc, dec)
    }

    /// `vs.pc` has become hot: start recording a root trace from it.
    pub(crate) fn hot_start(&mut self, vs: VmState) {
        self.hotcounts.set(vs.pc, hotcount_start(&self.params));
        if !self.jit || self.recorder.is_some() {
            return;
        }
        let disabled = vs
            .slot(-2)
            .as_func()
            .and_then(|f| f.proto())
            .map(|p| p.jit_disabled())
            .unwrap_or(true);
        if disabled {
            return;
        }
        self.set_state(JitState::Start);
        match Recorder::new_root(&vs, &self.params, self.opt) {
            Ok(rec) => self.start(rec, &format!("{:?}", vs.pc)),
            Err(e) => {
                self.log
                    .log(Verbosity::Warning, &format!("trace not started: {e}"));
                self.set_state(JitState::Idle);
            }
        }
    }

    fn start(&mut self, rec: Recorder, site: &str) {
        self.stats.trace_started();
        self.stats.timing_state(TimingState::Recording);
        self.log
            .log(Verbosity::JITEvent, &format!("start-tracing: {site}"));
        self.recorder = Some(rec);
        self.set_state(JitState::Record);
    }

    /// Record the instruction the interpreter is about to execute.
    pub(crate) fn record_ins(&mut self, mut vs: VmState) {
        let mut rec = match self.recorder.take() {
            Some(rec) => rec,
            None => return,
        };
        let r = if self.abort.swap(false, Ordering::Relaxed) {
            Err(TraceError::AsyncAbort.into())
        } else {
            rec.record(&mut vs, &self.traces, &self.penalties)
        };
        let r = match r {
            Ok(None) => {
                self.recorder = Some(rec);
                return;
            }
            Ok(Some(_)) => self.finish(&mut rec, vs.heap),
            Err(e) => Err(e),
        };
        match r {
            Ok(traceno) => {
                self.stats.trace_compiled();
                self.log.log(
                    Verbosity::JITEvent,
                    &format!("stop-tracing: trace {traceno} ({})", self.traces_link(traceno)),
                );
            }
            Err(e) => self.abort(rec, e, vs.heap),
        }
        self.stats.timing_state(TimingState::Interpreting);
        self.set_state(JitState::Idle);
    }

    fn traces_link(&self, traceno: u16) -> String {
        match &self.traces[usize::from(traceno)] {
            Some(t) => t.tir.link.to_string(),
            None => String::new(),
        }
    }

    fn check_abort(&self) -> Result<(), CompilationError> {
        if self.abort.swap(false, Ordering::Relaxed) {
            Err(TraceError::AsyncAbort.into())
        } else {
            Ok(())
        }
    }

    /// Compile the trace `rec` has finished recording and link it in.
    fn finish(&mut self, rec: &mut Recorder, heap: &mut Heap) -> Result<u16, CompilationError> {
        self.set_state(JitState::End);
        self.stats.timing_state(TimingState::Compiling);
        rec.repatch();
        let traceno = self.traces.len();
        if traceno > self.params.maxtrace() as usize {
            return Err(TraceError::TooManyTraces.into());
        }
        let traceno = traceno as u16;
        optimise(&mut rec.tir, self.opt)?;
        self.check_abort()?;

        self.set_state(JitState::Asm);
        let link_target = match rec.tir.link {
            TraceLink::Root(n) => match self.live_trace(n) {
                Some(t) => Some(t.mcode),
                None => return Err(TraceError::LoopLeft.into()),
            },
            _ => None,
        };
        let parent = match rec.tir.parent {
            Some((p, s)) => match self.live_trace(p) {
                Some(t) => Some((t, usize::from(s))),
                None => return Err(TraceError::LoopLeft.into()),
            },
            None => None,
        };
        let a = assemble(
            &rec.tir,
            traceno,
            parent.as_ref().map(|(t, _)| &**t),
            link_target,
            &mut self.mcode,
            &mut self.k64,
        )?;
        self.check_abort()?;
        if let Some((p, snapno)) = &parent {
            for &at in &p.exits[*snapno] {
                let _g = PatchGuard::new(at, 4);
                set_rel32(at, a.mcode)?;
            }
        }

        let startpc = rec.tir.startpc;
        let tir = mem::replace(&mut rec.tir, TraceIr::new(startpc, 0, 0, self.opt));
        let gcroots = (0..tir.ir.num_consts())
            .filter_map(|i| match tir.ir.konst(ConstIdx::from_usize(i)) {
                Const::Gc(_, addr) => Some(*addr),
                _ => None,
            })
            .collect::<Vec<_>>();
        for &r in &gcroots {
            heap.add_root(r);
        }
        let nsnaps = tir.snaps.len();
        let root = match &parent {
            Some((p, _)) => p.root,
            None => traceno,
        };
        let trace = Trace {
            traceno,
            tir,
            regsp: a.regsp,
            mcode: a.mcode,
            szmcode: a.szmcode,
            exits: a.exits,
            stubs: a.stubs,
            nspill: a.nspill,
            root,
            nchild: Cell::new(0),
            links: vec![Cell::new(0); nsnaps],
            startins: rec.startins,
            patchpc: rec.patchpc,
            gcroots,
            flushed: Cell::new(false),
        };

        match &parent {
            Some((p, snapno)) => {
                p.links[*snapno].set(traceno);
                if let Some(r) = self.live_trace(root) {
                    r.nchild.set(r.nchild.get() + 1);
                }
            }
            None => {
                if let (Some(pc), Some(op)) = (trace.patchpc, trace.startins.op().jit_variant()) {
                    pc.set(trace.startins.with_op(op).with_d(traceno));
                }
            }
        }
        self.traces.push(Some(Rc::new(trace)));
        Ok(traceno)
    }

    /// A trace which hasn't been flushed.
    fn live_trace(&self, traceno: u16) -> Option<Rc<Trace>> {
        self.traces
            .get(usize::from(traceno))?
            .as_ref()
            .filter(|t| !t.flushed.get())
            .cloned()
    }

    fn abort(&mut self, mut rec: Recorder, e: CompilationError, heap: &mut Heap) {
        self.set_state(JitState::Abort);
        rec.repatch();
        self.stats.trace_aborted();
        let site = match rec.patchpc {
            Some(pc) => format!("{pc:?}"),
            None => match rec.tir.parent {
                Some((p, s)) => format!("trace {p} exit {s}"),
                None => String::new(),
            },
        };
        self.log
            .log(Verbosity::JITEvent, &format!("trace-aborted: {site}: {e}"));
        match &e {
            CompilationError::Fatal(_) => {
                self.log.log(Verbosity::Error, &format!("{e}"));
                panic!("{e}");
            }
            CompilationError::ResourceExhausted(ResourceError::McodeLimit)
            | CompilationError::TraceError(TraceError::TooManyTraces) => self.flushall(heap),
            _ => (),
        }
        if let Some(n) = rec.flush_on_abort {
            self.flush(n, heap);
        }
        // Side traces aren't penalised: their exit counts limit how often they're retried.
        if let (Some(pc), Some(reason)) = (rec.patchpc, e.penalty_reason()) {
            self.penalize(pc, rec.startins, reason);
        }
    }

    fn penalize(&mut self, pc: Pc, startins: crate::vm::bc::BcIns, reason: TraceError) {
        match self.penalties.penalize(pc, reason) {
            Penalty::Retry(v) => self.hotcounts.set(pc, v),
            Penalty::Blacklist => {
                if let Some(op) = startins.op().blacklisted() {
                    pc.set(startins.with_op(op));
                }
                self.stats.blacklisted();
                self.log
                    .log(Verbosity::JITEvent, &format!("blacklisted: {pc:?}"));
            }
        }
    }

    /// Flush trace `traceno`: nothing enters it any more. Flushing a root trace flushes its side
    /// traces with it; flushing a side trace points its parent's exit back at the interpreter.
    pub fn flush(&mut self, traceno: u16, heap: &mut Heap) {
        let t = match self.live_trace(traceno) {
            Some(t) => t,
            None => return,
        };
        let mut n = 0;
        if t.is_root() {
            if let Some(pc) = t.patchpc {
                let cur = pc.get();
                if Some(cur.op()) == t.startins.op().jit_variant() && cur.d() == traceno {
                    pc.set(t.startins);
                }
            }
            for s in self.traces.iter().flatten() {
                if s.root == traceno && !s.flushed.get() {
                    flush_one(s, heap);
                    n += 1;
                }
            }
        } else {
            if let Some((pno, snapno)) = t.tir.parent {
                if let Some(p) = self.live_trace(pno) {
                    let snapno = usize::from(snapno);
                    for &at in &p.exits[snapno] {
                        let _g = PatchGuard::new(at, 4);
                        // The stub is in the same area as the jump, so it's always in range.
                        if let Err(e) = set_rel32(at, p.stubs[snapno]) {
                            panic!("can't restore exit {snapno} of trace {pno}: {e}");
                        }
                    }
                    p.links[snapno].set(0);
                }
            }
            flush_one(&t, heap);
            n += 1;
        }
        self.stats.traces_flushed(n);
        self.log
            .log(Verbosity::JITEvent, &format!("trace-flushed: {traceno}"));
    }

    /// Throw away every trace and all machine code and start counting from scratch.
    pub fn flushall(&mut self, heap: &mut Heap) {
        if let Some(rec) = self.recorder.take() {
            self.abort(rec, TraceError::AsyncAbort.into(), heap);
        }
        let mut n = 0;
        for t in self.traces.drain(..).flatten() {
            if t.flushed.get() {
                continue;
            }
            if let Some(pc) = t.patchpc {
                let cur = pc.get();
                if Some(cur.op()) == t.startins.op().jit_variant() && cur.d() == t.traceno {
                    pc.set(t.startins);
                }
            }
            flush_one(&t, heap);
            n += 1;
        }
        self.traces.push(None);
        self.hotcounts.reset(hotcount_start(&self.params));
        self.mcode.flush();
        self.k64.clear();
        self.stats.traces_flushed(n);
        self.stats.flushed_all();
        self.log.log(Verbosity::JITEvent, "flush-all");
    }

    /// Run trace `traceno` with its frame at stack index `base` until it exits, then rebuild the
    /// interpreter's state from the exit's snapshot.
    pub(crate) fn execute_trace(
        &mut self,
        traceno: u16,
        base: usize,
        stack: &mut [TValue],
        heap: &mut Heap,
    ) -> ExitState {
        let t = match &self.traces[usize::from(traceno)] {
            Some(t) => Rc::clone(t),
            None => panic!("entering missing trace {traceno}"),
        };
        let glue = match self.mcode.glue_for(t.mcode) {
            Some(g) => g,
            None => panic!("trace {traceno} has no code area"),
        };
        self.stats.trace_executed();
        self.stats.timing_state(TimingState::JitExecuting);
        self.ctx.heap = heap as *mut Heap;
        self.ctx.stack_limit = stack.as_ptr() as usize + stack.len() * mem::size_of::<TValue>();
        let exitno = unsafe {
            enter(
                glue.trampoline,
                &mut self.ctx,
                stack.as_mut_ptr().add(base),
                t.mcode,
            )
        };
        self.stats.timing_state(TimingState::Deopting);
        let (exit_traceno, snapno) = split_exit(exitno);
        let et = match &self.traces[usize::from(exit_traceno)] {
            Some(t) => Rc::clone(t),
            None => panic!("exit from missing trace {exit_traceno}"),
        };
        let stack_base =
            (self.ctx.reg(BASE) as usize - stack.as_ptr() as usize) / mem::size_of::<TValue>();
        let es = restore(&et, snapno, &self.ctx, stack, stack_base, heap);
        self.stats.exit_taken();
        self.stats.timing_state(TimingState::Interpreting);
        self.exit_hot(&et, snapno);
        es
    }

    /// Count an exit through `snapno` of `t`, starting a side trace from it once it's hot.
    fn exit_hot(&mut self, t: &Rc<Trace>, snapno: usize) {
        let snap = &t.tir.snaps[snapno];
        let count = snap.count.get().saturating_add(1);
        snap.count.set(count);
        let hotexit = self.params.hotexit();
        if !self.jit
            || self.recorder.is_some()
            || t.flushed.get()
            || t.links[snapno].get() != 0
            || u32::from(count) < hotexit
        {
            return;
        }
        // Past this point the exit stays with the interpreter.
        if u32::from(count) > hotexit + self.params.tryside() {
            return;
        }
        let nchild = match self.live_trace(t.root) {
            Some(r) => r.nchild.get(),
            None => return,
        };
        if u32::from(nchild) >= self.params.maxside() {
            return;
        }
        self.set_state(JitState::Start);
        match Recorder::new_side(t, snapno, &self.params, self.opt) {
            Ok(rec) => self.start(rec, &format!("trace {} exit {snapno}", t.traceno)),
            Err(e) => {
                self.log
                    .log(Verbosity::Warning, &format!("side trace not started: {e}"));
                self.set_state(JitState::Idle);
            }
        }
    }
}

impl Drop for MT {
    fn drop(&mut self) {
        self.stats.output();
    }
}

/// Loops count down by 2 and calls by 1, so this gives `hotloop` loop iterations.
fn hotcount_start(params: &JitParams) -> u16 {
    (params.hotloop() * 2 - 1).min(u32::from(u16::MAX)) as u16
}

fn flush_one(t: &Trace, heap: &mut Heap) {
    t.flushed.set(true);
    for &r in &t.gcroots {
        heap.remove_root(r);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::vm::{
        bc::{Op, ProtoBuilder},
        obj::Closure,
        value::{GcPtr, TValue},
        Vm,
    };

    fn jit() -> bool {
        cfg!(all(target_arch = "x86_64", target_os = "linux"))
    }

    /// `local s = 0; for i = 1, n do s = s + i end; return s`
    fn sum_loop(vm: &mut Vm) -> GcPtr<Closure> {
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
        let p = b.finish(vm.heap());
        vm.closure(p)
    }

    #[test]
    fn loops_get_compiled() {
        if !jit() {
            return;
        }
        let mut vm = Vm::with_params(true, JitParams::default(), OptFlags::default());
        let f = sum_loop(&mut vm);
        let r = vm.call(f, &[TValue::num(1000.0)]).unwrap();
        assert_eq!(r, vec![TValue::num(500500.0)]);
        let s = vm.mt().stats();
        assert_eq!(s.traces_compiled, 1);
        assert_eq!(s.traces_aborted, 0);
        let info = vm.mt().trace_info(1).unwrap();
        assert_eq!(info.link, TraceLink::Loop);
        assert!(info.parent.is_none());
        assert!(info.szmcode > 0);
        assert!(info.ir.contains("LOOP"));
        // The loop exits once, through its loop-condition guard.
        assert_eq!(info.exits, 1);
    }

    #[test]
    fn disabled_jit_never_records() {
        let mut vm = Vm::with_params(false, JitParams::default(), OptFlags::default());
        let f = sum_loop(&mut vm);
        let r = vm.call(f, &[TValue::num(1000.0)]).unwrap();
        assert_eq!(r, vec![TValue::num(500500.0)]);
        assert_eq!(vm.mt().stats().traces_started, 0);
        assert_eq!(vm.mt().num_traces(), 0);
    }

    #[test]
    fn params_change_only_when_idle() {
        let mut mt = MT::with_params(false, JitParams::default(), OptFlags::default());
        mt.set_param("hotloop", 7).unwrap();
        assert_eq!(mt.params().hotloop(), 7);
        assert!(matches!(
            mt.set_param("nosuchparam", 1),
            Err(ParamError::UnknownParam(_))
        ));
        mt.state = JitState::Record;
        assert!(matches!(mt.set_param("hotloop", 9), Err(ParamError::NotIdle)));
        assert!(matches!(mt.set_opt("-fold"), Err(ParamError::NotIdle)));
        assert_eq!(mt.params().hotloop(), 7);
    }

    #[test]
    fn flushing_restores_the_bytecode() {
        if !jit() {
            return;
        }
        let mut vm = Vm::with_params(true, JitParams::default(), OptFlags::default());
        let f = sum_loop(&mut vm);
        vm.call(f, &[TValue::num(1000.0)]).unwrap();
        let p = f.proto().unwrap();
        assert_eq!(p.pc_at(7).get().op(), Op::JForL);
        let roots = vm.heap().root_count();
        vm.flush_traces();
        assert_eq!(p.pc_at(7).get().op(), Op::ForL);
        assert!(vm.heap().root_count() <= roots);
        let s = vm.mt().stats();
        assert_eq!((s.traces_flushed, s.flushes), (1, 1));
        assert_eq!(vm.mt().num_traces(), 0);

        // Counting starts again from scratch.
        let r = vm.call(f, &[TValue::num(1000.0)]).unwrap();
        assert_eq!(r, vec![TValue::num(500500.0)]);
        assert_eq!(vm.mt().stats().traces_compiled, 2);
    }

    #[test]
    fn requested_aborts_abandon_the_next_trace() {
        if !jit() {
            return;
        }
        let mut vm = Vm::with_params(true, JitParams::default(), OptFlags::default());
        let f = sum_loop(&mut vm);
        vm.mt_mut().set_param("hotloop", 1).unwrap();
        vm.mt_mut().request_abort();
        let r = vm.call(f, &[TValue::num(10.0)]).unwrap();
        assert_eq!(r, vec![TValue::num(55.0)]);
        let s = vm.mt().stats();
        assert_eq!(s.traces_aborted, 1);
        assert_eq!(s.blacklisted, 0);
        // The abort doesn't penalise the loop, so the next attempt goes ahead.
        assert_eq!(s.traces_compiled, 1);
        assert_eq!(vm.mt().state(), JitState::Idle);
    }
}
