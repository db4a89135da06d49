//! Run the same bytecode with and without the JIT and check that both agree.

#![cfg(all(target_arch = "x86_64", target_os = "linux"))]

use rand::{rngs::StdRng, Rng, SeedableRng};
use ujrt::{
    params::{JitParams, OptFlags},
    vm::{
        bc::{Op, ProtoBuilder},
        obj::Closure,
        value::{GcPtr, TValue},
        Vm,
    },
    JitStats, TraceLink,
};

type Build = fn(&mut Vm) -> GcPtr<Closure>;

fn vm(jit: bool) -> Vm {
    Vm::with_params(jit, JitParams::default(), OptFlags::default())
}

/// Run `build`'s function on `args` with the JIT off and on, check the results match and return
/// the JIT VM for inspection.
fn compare(build: Build, args: &[TValue]) -> Vm {
    let mut interp = vm(false);
    let f = build(&mut interp);
    let expected = interp.call(f, args).unwrap();
    let mut jit = vm(true);
    let f = build(&mut jit);
    let got = jit.call(f, args).unwrap();
    assert_eq!(got, expected);
    jit
}

fn stats(vm: &Vm) -> JitStats {
    vm.mt().stats()
}

/// `local s = 0; for i = 1, n do s = s + i end; return s`
fn sum(vm: &mut Vm) -> GcPtr<Closure> {
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

/// ```text
/// local t = {}
/// for i = 1, n do t[i] = i * 2 end
/// local s = 0
/// for i = 1, n do s = s + t[i] end
/// return s
/// ```
fn tables(vm: &mut Vm) -> GcPtr<Closure> {
    let mut b = ProtoBuilder::new("tables", 1, 8);
    let two = b.knum(2.0) as u8;
    b.ad(Op::TNew, 1, 0);
    b.ad(Op::KShort, 3, 1);
    b.ad(Op::Mov, 4, 0);
    b.ad(Op::KShort, 5, 1);
    let fori = b.jmp_fwd(Op::ForI, 3);
    let body = b.here();
    b.abc(Op::MulVN, 7, 6, two);
    b.abc(Op::TSetV, 7, 1, 6);
    b.jmp_to(Op::ForL, 3, body);
    b.patch_here(fori);
    b.ad(Op::KShort, 2, 0);
    b.ad(Op::KShort, 3, 1);
    b.ad(Op::Mov, 4, 0);
    b.ad(Op::KShort, 5, 1);
    let fori = b.jmp_fwd(Op::ForI, 3);
    let body = b.here();
    b.abc(Op::TGetV, 7, 1, 6);
    b.abc(Op::AddVV, 2, 2, 7);
    b.jmp_to(Op::ForL, 3, body);
    b.patch_here(fori);
    b.ad(Op::Ret1, 2, 2);
    let p = b.finish(vm.heap());
    vm.closure(p)
}

/// ```text
/// local s = 0
/// for i = 1, n do
///   if i % 4 == 0 then s = s + i else s = s - 1 end
/// end
/// return s
/// ```
fn branchy(vm: &mut Vm) -> GcPtr<Closure> {
    let mut b = ProtoBuilder::new("branchy", 1, 8);
    let four = b.knum(4.0);
    let zero = b.knum(0.0);
    let one = b.knum(1.0);
    b.ad(Op::KShort, 1, 0);
    b.ad(Op::KShort, 2, 1);
    b.ad(Op::Mov, 3, 0);
    b.ad(Op::KShort, 4, 1);
    let fori = b.jmp_fwd(Op::ForI, 2);
    let body = b.here();
    b.abc(Op::ModVN, 6, 5, four as u8);
    b.ad(Op::IsEqN, 6, zero);
    let then = b.jmp_fwd(Op::Jmp, 0);
    b.abc(Op::SubVN, 1, 1, one as u8);
    let next = b.jmp_fwd(Op::Jmp, 0);
    b.patch_here(then);
    b.abc(Op::AddVV, 1, 1, 5);
    b.patch_here(next);
    b.jmp_to(Op::ForL, 2, body);
    b.patch_here(fori);
    b.ad(Op::Ret1, 1, 2);
    let p = b.finish(vm.heap());
    vm.closure(p)
}

/// ```text
/// function(t, n)
///   local s = 0
///   for i = 1, n do
///     local x = t[i]
///     if x < 0.5 then s = s + x else s = s - 1 end
///   end
///   return s
/// end
/// ```
fn threshold_sum(vm: &mut Vm) -> GcPtr<Closure> {
    let mut b = ProtoBuilder::new("threshold_sum", 2, 10);
    let half = b.knum(0.5);
    let one = b.knum(1.0) as u8;
    b.ad(Op::KShort, 2, 0);
    b.ad(Op::KShort, 3, 1);
    b.ad(Op::Mov, 4, 1);
    b.ad(Op::KShort, 5, 1);
    let fori = b.jmp_fwd(Op::ForI, 3);
    let body = b.here();
    b.abc(Op::TGetV, 7, 0, 6);
    b.ad(Op::KNum, 8, half);
    b.ad(Op::IsGe, 7, 8);
    let other = b.jmp_fwd(Op::Jmp, 0);
    b.abc(Op::AddVV, 2, 2, 7);
    let next = b.jmp_fwd(Op::Jmp, 0);
    b.patch_here(other);
    b.abc(Op::SubVN, 2, 2, one);
    b.patch_here(next);
    b.jmp_to(Op::ForL, 3, body);
    b.patch_here(fori);
    b.ad(Op::Ret1, 2, 2);
    let p = b.finish(vm.heap());
    vm.closure(p)
}

/// `for i = 1, n do g = g + i end; return g`
fn globals(vm: &mut Vm) -> GcPtr<Closure> {
    vm.set_global("g", TValue::num(0.0));
    let mut b = ProtoBuilder::new("globals", 1, 8);
    let g = b.kstr(vm.heap(), "g");
    b.ad(Op::KShort, 2, 1);
    b.ad(Op::Mov, 3, 0);
    b.ad(Op::KShort, 4, 1);
    let fori = b.jmp_fwd(Op::ForI, 2);
    let body = b.here();
    b.ad(Op::GGet, 6, g);
    b.abc(Op::AddVV, 6, 6, 5);
    b.ad(Op::GSet, 6, g);
    b.jmp_to(Op::ForL, 2, body);
    b.patch_here(fori);
    b.ad(Op::GGet, 1, g);
    b.ad(Op::Ret1, 1, 2);
    let p = b.finish(vm.heap());
    vm.closure(p)
}

/// ```text
/// function fib(n)
///   if n < 2 then return n end
///   return fib(n - 1) + fib(n - 2)
/// end
/// ```
fn fib(vm: &mut Vm) -> GcPtr<Closure> {
    let mut b = ProtoBuilder::new("fib", 1, 8);
    let name = b.kstr(vm.heap(), "fib");
    let one = b.knum(1.0) as u8;
    let two = b.knum(2.0) as u8;
    b.ad(Op::KShort, 1, 2);
    b.ad(Op::IsLt, 0, 1);
    let small = b.jmp_fwd(Op::Jmp, 0);
    b.ad(Op::GGet, 1, name);
    b.abc(Op::SubVN, 3, 0, one);
    b.abc(Op::Call, 1, 2, 2);
    b.ad(Op::GGet, 2, name);
    b.abc(Op::SubVN, 4, 0, two);
    b.abc(Op::Call, 2, 2, 2);
    b.abc(Op::AddVV, 1, 1, 2);
    b.ad(Op::Ret1, 1, 2);
    b.patch_here(small);
    b.ad(Op::Ret1, 0, 2);
    let p = b.finish(vm.heap());
    let f = vm.closure(p);
    vm.set_global("fib", TValue::func(f));
    f
}

#[test]
fn numeric_loop() {
    let vm = compare(sum, &[TValue::num(10000.0)]);
    let s = stats(&vm);
    assert_eq!(s.traces_compiled, 1);
    assert_eq!(vm.mt().trace_info(1).unwrap().link, TraceLink::Loop);
}

#[test]
fn short_loops_stay_interpreted() {
    let vm = compare(sum, &[TValue::num(10.0)]);
    assert_eq!(stats(&vm).traces_started, 0);
}

#[test]
fn table_loops() {
    let vm = compare(tables, &[TValue::num(5000.0)]);
    assert!(stats(&vm).traces_compiled >= 1);
}

#[test]
fn hot_exits_grow_side_traces() {
    let vm = compare(branchy, &[TValue::num(5000.0)]);
    let s = stats(&vm);
    assert!(s.traces_compiled >= 2, "{s:?}");
    let side = (1..=vm.mt().num_traces() as u16)
        .filter_map(|t| vm.mt().trace_info(t))
        .find(|t| t.parent.is_some())
        .expect("no side trace");
    assert_eq!(side.parent.map(|(p, _)| p), Some(1));
    assert_eq!(side.link, TraceLink::Root(1));
}

#[test]
fn flushed_side_traces_hand_their_exit_back() {
    let mut vm = vm(true);
    let f = branchy(&mut vm);
    let expected = vm.call(f, &[TValue::num(5000.0)]).unwrap();
    let side = (1..=vm.mt().num_traces() as u16)
        .filter_map(|t| vm.mt().trace_info(t))
        .find(|t| t.parent.map(|(p, _)| p) == Some(1))
        .expect("no side trace");
    let (_, snapno) = side.parent.unwrap();
    vm.flush_trace(side.traceno);
    assert!(vm.mt().trace_info(side.traceno).unwrap().flushed);
    assert!(!vm.mt().trace_info(1).unwrap().flushed);

    // The parent's exit leads to the interpreter again: it's taken on most iterations, not just
    // once when the loop finishes. The exit is already past `hotexit`, so with no more tries it
    // doesn't grow a new side trace.
    vm.mt_mut().set_param("tryside", 0).unwrap();
    let before = vm.mt().trace_info(1).unwrap().exits;
    assert_eq!(vm.call(f, &[TValue::num(5000.0)]).unwrap(), expected);
    let after = vm.mt().trace_info(1).unwrap().exits;
    assert!(after - before > 100, "exit {snapno}: {before} -> {after}");
    assert_eq!(stats(&vm).traces_flushed, 1);
}

#[test]
fn global_loops() {
    let mut vm = compare(globals, &[TValue::num(3000.0)]);
    assert_eq!(vm.get_global("g").as_num(), Some(4501500.0));
    assert!(stats(&vm).traces_compiled >= 1);
}

#[test]
fn recursion() {
    compare(fib, &[TValue::num(20.0)]);
}

#[test]
fn flushing_between_runs() {
    let mut vm = vm(true);
    let f = sum(&mut vm);
    let first = vm.call(f, &[TValue::num(2000.0)]).unwrap();
    vm.flush_traces();
    let second = vm.call(f, &[TValue::num(2000.0)]).unwrap();
    assert_eq!(first, second);
    assert_eq!(first, vec![TValue::num(2001000.0)]);
    let s = stats(&vm);
    assert_eq!(s.flushes, 1);
    assert_eq!(s.traces_compiled, 2);
}

#[test]
fn aborting_loops_get_blacklisted() {
    // `for i = 1, n do local f = function() end end`: closure creation always aborts.
    let mut vm = vm(true);
    let mut inner = ProtoBuilder::new("inner", 0, 2);
    inner.ad(Op::Ret0, 0, 1);
    let inner = inner.finish(vm.heap());
    let mut b = ProtoBuilder::new("closures", 1, 8);
    let k = b.kproto(inner);
    b.ad(Op::KShort, 1, 1);
    b.ad(Op::Mov, 2, 0);
    b.ad(Op::KShort, 3, 1);
    let fori = b.jmp_fwd(Op::ForI, 1);
    let body = b.here();
    b.ad(Op::FNew, 5, k);
    let forl = b.here();
    b.jmp_to(Op::ForL, 1, body);
    b.patch_here(fori);
    b.ad(Op::Ret0, 0, 1);
    let p = b.finish(vm.heap());
    let f = vm.closure(p);
    vm.call(f, &[TValue::num(200000.0)]).unwrap();
    let s = stats(&vm);
    assert_eq!(s.blacklisted, 1, "{s:?}");
    assert!(s.traces_aborted > 1);
    assert_eq!(s.traces_compiled, 0);
    assert_eq!(p.pc_at(forl).get().op(), Op::IForL);
}

#[test]
fn unoptimised_traces_agree() {
    for build in [sum as Build, tables, branchy] {
        let mut interp = vm(false);
        let f = build(&mut interp);
        let expected = interp.call(f, &[TValue::num(3000.0)]).unwrap();
        let mut jit = Vm::with_params(true, JitParams::default(), OptFlags::none());
        let f = build(&mut jit);
        assert_eq!(jit.call(f, &[TValue::num(3000.0)]).unwrap(), expected);
        assert!(stats(&jit).traces_compiled >= 1);
    }
}

#[test]
fn low_thresholds() {
    let mut jit = vm(true);
    jit.mt_mut().set_param("hotloop", 1).unwrap();
    jit.mt_mut().set_param("hotexit", 1).unwrap();
    let f = branchy(&mut jit);
    let got = jit.call(f, &[TValue::num(500.0)]).unwrap();
    let mut interp = vm(false);
    let f = branchy(&mut interp);
    assert_eq!(got, interp.call(f, &[TValue::num(500.0)]).unwrap());
}

#[test]
fn random_exits_restore_the_interpreter_state() {
    for seed in 0..8 {
        let mut rng = StdRng::seed_from_u64(seed);
        let len = rng.gen_range(100..2000);
        let xs = (0..len).map(|_| rng.gen::<f64>()).collect::<Vec<_>>();
        let run = |jit: bool| {
            let mut vm = vm(jit);
            let f = threshold_sum(&mut vm);
            let t = vm.heap().new_table(len + 1, 0);
            for (i, x) in xs.iter().enumerate() {
                t.as_mut().set_int(i as u64 + 1, TValue::num(*x));
            }
            let r = vm
                .call(f, &[TValue::tab(t), TValue::num(len as f64)])
                .unwrap();
            (r, stats(&vm))
        };
        let (expected, _) = run(false);
        let (got, s) = run(true);
        assert_eq!(got, expected, "seed {seed}");
        assert!(s.exits > 0, "seed {seed}: {s:?}");
    }
}
