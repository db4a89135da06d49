//! Recording of calls to builtin functions.
//!
//! Each builtin the trace compiler understands is recorded as the IR its effect amounts to, using
//! the argument values the interpreter is about to pass it to specialise. A builtin which isn't
//! understood aborts the trace.

use smallvec::{smallvec, SmallVec};

use super::Recorder;
use crate::{
    compile::{
        calls::CallId,
        jit_ir::{FpMath, Inst, JitIr, Opcode, Operand, Opnd, Ty},
        CompilationError, TraceError,
    },
    vm::{builtins::FfId, value::TValue, VmState},
};

pub(super) type FfResults = SmallVec<[Operand; 3]>;

impl Recorder {
    /// Record a call of builtin `ffid` with `args`, returning the operands of its results.
    pub(super) fn record_ff(
        &mut self,
        vs: &mut VmState,
        ffid: FfId,
        args: &[(Operand, TValue)],
    ) -> Result<FfResults, CompilationError> {
        let arg = |i: usize| args.get(i).copied();
        let num_arg = |i: usize| match arg(i) {
            Some((r, v)) if v.is_num() => Ok(r),
            _ => Err(CompilationError::from(TraceError::BadType)),
        };
        match ffid {
            FfId::Assert => match arg(0) {
                // The argument's type has been checked, which is enough to know it's truthy.
                Some((_, v)) if v.is_truthy() => Ok(args.iter().map(|(r, _)| *r).collect()),
                _ => Err(TraceError::NotYetImplementedFf(ffid).into()),
            },
            FfId::Type => {
                let (_, v) = arg(0).ok_or(TraceError::NotYetImplementedFf(ffid))?;
                let s = vs.heap.intern(v.tag().type_name());
                Ok(smallvec![self.tir.ir.kgc(Ty::Str, s.addr())?])
            }
            FfId::MathFloor | FfId::MathCeil | FfId::MathSqrt => {
                let x = num_arg(0)?;
                let f = match ffid {
                    FfId::MathFloor => FpMath::Floor,
                    FfId::MathCeil => FpMath::Ceil,
                    _ => FpMath::Sqrt,
                };
                let r = self.tir.ir.emit(Inst::new(
                    Opcode::Fpmath,
                    Ty::Num,
                    Opnd::Ref(x),
                    Opnd::Lit(f as u32),
                ))?;
                Ok(smallvec![r])
            }
            FfId::MathAbs => {
                let x = num_arg(0)?;
                let r = self
                    .tir
                    .ir
                    .emit(Inst::new(Opcode::Abs, Ty::Num, Opnd::Ref(x), Opnd::None))?;
                Ok(smallvec![r])
            }
            FfId::MathMin | FfId::MathMax => {
                let op = if ffid == FfId::MathMin {
                    Opcode::Min
                } else {
                    Opcode::Max
                };
                let mut r = num_arg(0)?;
                for i in 1..args.len() {
                    let x = num_arg(i)?;
                    r = self.tir.ir.emit2(op, Ty::Num, r, x)?;
                }
                Ok(smallvec![r])
            }
            FfId::StrLen => match arg(0) {
                Some((s, v)) if v.is_str() => Ok(smallvec![self.str_len(s, v)?]),
                _ => Err(TraceError::BadType.into()),
            },
            FfId::StrSub => {
                let s = match arg(0) {
                    Some((s, v)) if v.is_str() => s,
                    _ => return Err(TraceError::BadType.into()),
                };
                let i = num_arg(1)?;
                let j = if args.len() > 2 {
                    num_arg(2)?
                } else {
                    self.tir.ir.knum(-1.0)?
                };
                Ok(smallvec![self.call_out(CallId::StrSub, Ty::Str, &[s, i, j])?])
            }
            FfId::Rawget => {
                let (t, tv) = arg(0).ok_or(TraceError::BadType)?;
                let tab = tv.as_tab().ok_or(TraceError::BadType)?;
                let (k, kv) = arg(1).unwrap_or((JitIr::kpri(Ty::Nil), TValue::NIL));
                if kv.is_nil() || kv.as_num().map(f64::is_nan).unwrap_or(false) {
                    return Ok(smallvec![JitIr::kpri(Ty::Nil)]);
                }
                let (r, _) = self.raw_get(vs, t, tab, k, kv)?;
                Ok(smallvec![self.canon(r)])
            }
            FfId::Tostring => match arg(0) {
                Some((s, v)) if v.is_str() => Ok(smallvec![s]),
                _ => Err(TraceError::NotYetImplementedFf(ffid).into()),
            },
            FfId::Pairs | FfId::Ipairs => {
                let t = match arg(0) {
                    Some((t, v)) if v.is_tab() => t,
                    _ => return Err(TraceError::BadType.into()),
                };
                let (f, init) = if ffid == FfId::Pairs {
                    (vs.ffc.next, JitIr::kpri(Ty::Nil))
                } else {
                    (vs.ffc.ipairs_aux, self.tir.ir.knum(0.0)?)
                };
                let f = self.tir.ir.kgc(Ty::Func, f.addr())?;
                Ok(smallvec![f, t, init])
            }
            FfId::IpairsAux => {
                let (t, tv) = arg(0).ok_or(TraceError::BadType)?;
                let tab = tv.as_tab().ok_or(TraceError::BadType)?;
                let i = num_arg(1)?;
                let iv = args[1].1.as_num().unwrap_or(0.0) + 1.0;
                let one = self.tir.ir.knum(1.0)?;
                let i1 = self.tir.ir.emit2(Opcode::Add, Ty::Num, i, one)?;
                let (r, v) = self.raw_get(vs, t, tab, i1, TValue::num(iv))?;
                if v.is_nil() {
                    self.keep_guard(r);
                    Ok(smallvec![])
                } else {
                    Ok(smallvec![i1, self.canon(r)])
                }
            }
            // Both change state the trace would need to re-read from scratch.
            FfId::Setmetatable | FfId::TableInsert => Err(TraceError::Stitch.into()),
            FfId::Lua | FfId::Next | FfId::StrByte => {
                Err(TraceError::NotYetImplementedFf(ffid).into())
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::super::test::Harness;
    use super::*;
    use crate::{
        compile::{jit_ir::Const, record::Recorder},
        params::{JitParams, OptFlags},
        vm::{
            bc::{Op, ProtoBuilder},
            obj::Proto,
            value::GcPtr,
        },
    };

    /// Look up a builtin by its dotted name.
    fn builtin(h: &mut Harness, name: &str) -> TValue {
        match name.split_once('.') {
            Some((lib, key)) => {
                let lib = TValue::str(h.heap.intern(lib));
                let key = TValue::str(h.heap.intern(key));
                h.globals.get(&lib).as_tab().unwrap().get(&key)
            }
            None => {
                let key = TValue::str(h.heap.intern(name));
                h.globals.get(&key)
            }
        }
    }

    /// `local r1, ..., rN = f(x1, ..., xM)` with `f` in slot 0.
    fn call_proto(h: &mut Harness, nargs: u8, nres: u8) -> GcPtr<Proto> {
        let mut b = ProtoBuilder::new("call", 0, 8);
        b.abc(Op::Call, 0, nres + 1, nargs + 1);
        b.ad(Op::Ret0, 0, 1);
        b.finish(&mut h.heap)
    }

    /// Record a call of `name` with `args`.
    fn record_call(
        h: &mut Harness,
        name: &str,
        args: &[TValue],
        nres: u8,
    ) -> Result<Recorder, CompilationError> {
        let p = call_proto(h, args.len() as u8, nres);
        h.enter(p, &[]);
        let f = builtin(h, name);
        h.set(0, f);
        for (i, v) in args.iter().enumerate() {
            h.set(2 + i, *v);
        }
        let mut rec =
            Recorder::new_root(&h.state(p.pc_at(0)), &JitParams::default(), OptFlags::default())
                .unwrap();
        h.record(&mut rec, p.pc_at(1))?;
        Ok(rec)
    }

    fn op_of(rec: &Recorder, s: usize) -> Opcode {
        rec.tir.ir.inst(rec.st.get(s).unwrap().as_var().unwrap()).op
    }

    #[test]
    fn math_functions() {
        let mut h = Harness::new();
        let rec = record_call(&mut h, "math.floor", &[TValue::num(2.5)], 1).unwrap();
        let r = rec.st.get(0).unwrap().as_var().unwrap();
        let x = rec.tir.ir.inst(r);
        assert_eq!((x.op, x.ty), (Opcode::Fpmath, Ty::Num));
        assert_eq!(x.b.lit(), FpMath::Floor as u32);

        let args = [TValue::num(3.0), TValue::num(1.0), TValue::num(2.0)];
        let rec = record_call(&mut h, "math.max", &args, 1).unwrap();
        assert_eq!(op_of(&rec, 0), Opcode::Max);
        assert_eq!(rec.tir.ir.chain(Opcode::Max).count(), 2);
    }

    #[test]
    fn type_is_constant() {
        let mut h = Harness::new();
        let rec = record_call(&mut h, "type", &[TValue::num(1.0)], 1).unwrap();
        let s = h.heap.intern("number");
        let r = rec.st.get(0).unwrap();
        assert!(matches!(rec.tir.ir.const_of(r), Some(Const::Gc(Ty::Str, a)) if *a == s.addr()));
    }

    #[test]
    fn ipairs_steps_through_the_array() {
        let mut h = Harness::new();
        let t = h.heap.new_table(4, 0);
        t.as_mut().set_int(1, TValue::num(7.0));
        // The iterator isn't a global: it's only reachable through `ipairs`.
        let p = call_proto(&mut h, 2, 2);
        h.enter(p, &[]);
        let aux = TValue::func(h.ffc.ipairs_aux);
        h.set(0, aux);
        h.set(2, TValue::tab(t));
        h.set(3, TValue::num(0.0));
        let mut rec =
            Recorder::new_root(&h.state(p.pc_at(0)), &JitParams::default(), OptFlags::default())
                .unwrap();
        h.record(&mut rec, p.pc_at(1)).unwrap();
        assert_eq!(op_of(&rec, 0), Opcode::Add);
        assert_eq!(op_of(&rec, 1), Opcode::ALoad);
    }

    #[test]
    fn unsupported_builtins_abort() {
        let mut h = Harness::new();
        let t = TValue::tab(h.heap.new_table(0, 0));
        let mt = TValue::tab(h.heap.new_table(0, 0));
        assert!(matches!(
            record_call(&mut h, "setmetatable", &[t, mt], 1),
            Err(CompilationError::TraceError(TraceError::Stitch))
        ));
        assert!(matches!(
            record_call(&mut h, "assert", &[TValue::bool(false)], 1),
            Err(CompilationError::TraceError(TraceError::NotYetImplementedFf(FfId::Assert)))
        ));
    }
}
