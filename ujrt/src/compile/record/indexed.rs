//! Recording of table loads and stores, including `__index`/`__newindex` chains.

use super::Recorder;
use crate::{
    compile::{
        effects::Effects,
        jit_ir::{ConvKind, Field, Inst, JitIr, Opcode, Operand, Opnd, Ty, HINT_SCEV},
        CompilationError, TraceError,
    },
    params::Opt,
    vm::{
        interp::MAX_INDEX_CHAIN,
        obj::{num_as_index, Table},
        value::{GcPtr, Tag, TValue},
        VmState,
    },
};

/// Where a key's value lives.
enum SlotRef {
    /// In the array part, at the address given by an [Opcode::Aref].
    Array(Operand),
    /// In the hash part, at the address given by an [Opcode::Href] or [Opcode::NewRef].
    Hash(Operand),
    /// Nowhere: the key is known not to be in the table.
    Absent,
}

impl Recorder {
    fn slot_ref(
        &mut self,
        vs: &VmState,
        t: Operand,
        tab: GcPtr<Table>,
        k: Operand,
        kv: TValue,
    ) -> Result<SlotRef, CompilationError> {
        if let Some(i) = kv.as_num().and_then(num_as_index) {
            if i < tab.asize() as u64 {
                return Ok(SlotRef::Array(self.array_ref(vs, t, k, i)?));
            }
        }
        if let Some(r) = self.tnew_ref(t, tab, k, kv)? {
            return Ok(r);
        }
        Ok(SlotRef::Hash(self.tir.ir.emit2(Opcode::Href, Ty::Ptr, t, k)?))
    }

    fn array_ref(
        &mut self,
        vs: &VmState,
        t: Operand,
        k: Operand,
        i: u64,
    ) -> Result<Operand, CompilationError> {
        let asize = self.fload(t, Field::TabAsize)?;
        let ki = if k.is_const() {
            self.tir.ir.kint(i as i64)?
        } else {
            self.tir.ir.emit(Inst::guarded(
                Opcode::Conv,
                Ty::Int,
                Opnd::Ref(k),
                Opnd::Lit(ConvKind::NumToInt as u32),
            ))?
        };
        if let Some(stop) = self.scev_stop(vs, k)? {
            // The index is the loop variable of the loop the trace starts at: checking its start
            // and stop values covers every iteration.
            self.tir.ir.guard2(Opcode::Abc, Ty::Int, asize, stop)?;
            let g = self.tir.ir.guard2(Opcode::Abc, Ty::Int, asize, ki)?;
            if let Operand::Var(g) = g {
                self.tir.ir.set_hint(g, HINT_SCEV);
            }
        } else {
            self.tir.ir.guard2(Opcode::Abc, Ty::Int, asize, ki)?;
        }
        let arr = self.fload(t, Field::TabArray)?;
        self.tir.ir.emit2(Opcode::Aref, Ty::Ptr, arr, ki)
    }

    /// If `k` is the visible loop variable of an ascending `FORL` loop the trace started at,
    /// return the loop's stop value as an integer.
    fn scev_stop(
        &mut self,
        vs: &VmState,
        k: Operand,
    ) -> Result<Option<Operand>, CompilationError> {
        let a = match self.forl {
            Some(a) if self.opt.has(Opt::Abc) && self.st.frames.is_empty() => a,
            _ => return Ok(None),
        };
        match k.as_var().map(|i| *self.tir.ir.inst(i)) {
            Some(x) if x.op == Opcode::SLoad && x.a.lit() as usize == 2 + a + 3 => (),
            _ => return Ok(None),
        }
        let (stop, step) = match (
            vs.slot(a as isize + 1).as_num(),
            vs.slot(a as isize + 2).as_num(),
        ) {
            (Some(stop), Some(step)) => (stop, step),
            _ => return Ok(None),
        };
        let stopi = match num_as_index(stop) {
            Some(i) if !step.is_sign_negative() => i,
            _ => return Ok(None),
        };
        let rstop = self.slot(vs, a + 1)?;
        match rstop {
            Operand::Const(_) => Ok(Some(self.tir.ir.kint(stopi as i64)?)),
            Operand::Var(i) => {
                let x = self.tir.ir.inst(i);
                if x.op != Opcode::SLoad || x.a.lit() as usize != 2 + a + 1 {
                    return Ok(None);
                }
                Ok(Some(self.tir.ir.emit(Inst::guarded(
                    Opcode::Conv,
                    Ty::Int,
                    Opnd::Ref(rstop),
                    Opnd::Lit(ConvKind::NumToInt as u32),
                ))?))
            }
        }
    }

    /// Look `k` up in a table allocated on trace without calling out to the table code. A
    /// constant key either has been stored by an earlier [Opcode::NewRef] or, if every key
    /// stored so far is a constant, can't be in the table.
    fn tnew_ref(
        &mut self,
        t: Operand,
        tab: GcPtr<Table>,
        k: Operand,
        kv: TValue,
    ) -> Result<Option<SlotRef>, CompilationError> {
        match t.as_var() {
            Some(i) if self.tir.ir.inst(i).op == Opcode::TNew && k.is_const() => (),
            _ => return Ok(None),
        }
        let mut all_const = true;
        for nr in self.tir.ir.chain(Opcode::NewRef) {
            let x = self.tir.ir.inst(nr);
            if x.a != Opnd::Ref(t) {
                continue;
            }
            if x.b == Opnd::Ref(k) {
                // A numeric key may have been appended to the array part, which a later append
                // can move.
                if self.tir.ir.ty_of(k) != Ty::Num
                    || self.tir.ir.last_write(Effects::all()) == Some(nr)
                {
                    return Ok(Some(SlotRef::Hash(Operand::Var(nr))));
                }
                return Ok(None);
            }
            if !x.b.as_ref().map(Operand::is_const).unwrap_or(false) {
                all_const = false;
            }
        }
        if all_const && tab.get(&kv).is_nil() {
            return Ok(Some(SlotRef::Absent));
        }
        Ok(None)
    }

    /// Raw load of key `k` from table `t`, returning the (uncanonicalised) value and the value
    /// the interpreter will see.
    pub(super) fn raw_get(
        &mut self,
        vs: &VmState,
        t: Operand,
        tab: GcPtr<Table>,
        k: Operand,
        kv: TValue,
    ) -> Result<(Operand, TValue), CompilationError> {
        let (k, kv) = self.norm_key(k, kv)?;
        let v = tab.get(&kv);
        let ty = Ty::from_tag(v.tag());
        let r = match self.slot_ref(vs, t, tab, k, kv)? {
            SlotRef::Array(r) => self
                .tir
                .ir
                .emit(Inst::guarded(Opcode::ALoad, ty, Opnd::Ref(r), Opnd::None))?,
            SlotRef::Hash(r) => self
                .tir
                .ir
                .emit(Inst::guarded(Opcode::HLoad, ty, Opnd::Ref(r), Opnd::None))?,
            SlotRef::Absent => JitIr::kpri(Ty::Nil),
        };
        Ok((r, v))
    }

    /// `-0` and `+0` are the same key.
    fn norm_key(&mut self, k: Operand, kv: TValue) -> Result<(Operand, TValue), CompilationError> {
        if k.is_const() && kv.as_num() == Some(0.0) {
            return Ok((self.tir.ir.knum(0.0)?, TValue::num(0.0)));
        }
        Ok((k, kv))
    }

    /// Guard the metatable of `t` and return it.
    fn meta_guard(
        &mut self,
        t: Operand,
        tab: GcPtr<Table>,
    ) -> Result<Option<GcPtr<Table>>, CompilationError> {
        let mt = tab.meta();
        let rm = self.fload(t, Field::TabMeta)?;
        let km = self.tir.ir.kptr(mt.map(|m| m.addr()).unwrap_or(0))?;
        self.tir.ir.guard2(Opcode::Eq, Ty::Ptr, rm, km)?;
        Ok(mt)
    }

    /// Record `t[k]`, following `__index` tables.
    pub(super) fn index_get(
        &mut self,
        vs: &mut VmState,
        mut t: Operand,
        mut tab: GcPtr<Table>,
        k: Operand,
        kv: TValue,
    ) -> Result<Operand, CompilationError> {
        let mms = vs.heap.intern("__index");
        let mmk = self.tir.ir.kgc(Ty::Str, mms.addr())?;
        for _ in 0..MAX_INDEX_CHAIN {
            let (r, v) = self.raw_get(vs, t, tab, k, kv)?;
            if !v.is_nil() {
                return Ok(self.canon(r));
            }
            self.keep_guard(r);
            let mt = match self.meta_guard(t, tab)? {
                Some(mt) => mt,
                None => return Ok(JitIr::kpri(Ty::Nil)),
            };
            let rmt = self.tir.ir.kgc(Ty::Tab, mt.addr())?;
            let (h, hv) = self.raw_get(vs, rmt, mt, mmk, TValue::str(mms))?;
            match hv.tag() {
                Tag::Nil => {
                    self.keep_guard(h);
                    return Ok(JitIr::kpri(Ty::Nil));
                }
                Tag::Tab => {
                    t = h;
                    tab = hv.as_tab().ok_or(TraceError::BadType)?;
                }
                _ => return Err(TraceError::NoMetamethod.into()),
            }
        }
        Err(TraceError::IndexLoop.into())
    }

    /// Record `t[k] = v`, following `__newindex` tables.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn index_set(
        &mut self,
        vs: &mut VmState,
        mut t: Operand,
        mut tab: GcPtr<Table>,
        k: Operand,
        kv: TValue,
        v: Operand,
        vv: TValue,
    ) -> Result<(), CompilationError> {
        if kv.is_nil() || kv.as_num().map(f64::is_nan).unwrap_or(false) {
            return Err(TraceError::StoreNilKey.into());
        }
        let (k, kv) = self.norm_key(k, kv)?;
        let mms = vs.heap.intern("__newindex");
        let mmk = self.tir.ir.kgc(Ty::Str, mms.addr())?;
        for _ in 0..MAX_INDEX_CHAIN {
            let mt = self.meta_guard(t, tab)?;
            let old = tab.get(&kv);
            if let Some(mt) = mt {
                if old.is_nil() {
                    let rmt = self.tir.ir.kgc(Ty::Tab, mt.addr())?;
                    let (h, hv) = self.raw_get(vs, rmt, mt, mmk, TValue::str(mms))?;
                    match hv.tag() {
                        Tag::Tab => {
                            // `__newindex` only applies while the key is absent.
                            let (r, _) = self.raw_get(vs, t, tab, k, kv)?;
                            self.keep_guard(r);
                            t = h;
                            tab = hv.as_tab().ok_or(TraceError::BadType)?;
                            continue;
                        }
                        Tag::Nil => self.keep_guard(h),
                        _ => return Err(TraceError::NoMetamethod.into()),
                    }
                }
            }
            return self.raw_set(vs, t, tab, k, kv, v, vv, mt.is_some());
        }
        Err(TraceError::IndexLoop.into())
    }

    /// Raw store of `v` at key `k` of `t`. If `t` has a metatable, the key's old value must stay
    /// non-nil for the store to bypass `__newindex`.
    #[allow(clippy::too_many_arguments)]
    fn raw_set(
        &mut self,
        vs: &VmState,
        t: Operand,
        tab: GcPtr<Table>,
        k: Operand,
        kv: TValue,
        v: Operand,
        vv: TValue,
        has_meta: bool,
    ) -> Result<(), CompilationError> {
        let old = tab.get(&kv);
        let check_old = has_meta && !old.is_nil();
        let oty = Ty::from_tag(old.tag());
        let dst = match self.slot_ref(vs, t, tab, k, kv)? {
            SlotRef::Array(r) => {
                if check_old {
                    let l = self
                        .tir
                        .ir
                        .emit(Inst::guarded(Opcode::ALoad, oty, Opnd::Ref(r), Opnd::None))?;
                    self.keep_guard(l);
                }
                Some(r)
            }
            SlotRef::Hash(r) if self.is_href(r) => {
                let niltv = self.tir.ir.kptr(vs.heap.niltv() as usize)?;
                if tab.as_mut().slot(&kv).is_some() {
                    self.tir.ir.guard2(Opcode::Ne, Ty::Ptr, r, niltv)?;
                    if check_old {
                        let l = self
                            .tir
                            .ir
                            .emit(Inst::guarded(Opcode::HLoad, oty, Opnd::Ref(r), Opnd::None))?;
                        self.keep_guard(l);
                    }
                    Some(r)
                } else {
                    self.tir.ir.guard2(Opcode::Eq, Ty::Ptr, r, niltv)?;
                    self.newref(t, k, vv)?
                }
            }
            SlotRef::Hash(r) => Some(r),
            SlotRef::Absent => self.newref(t, k, vv)?,
        };
        if let Some(r) = dst {
            let op = match r.as_var().map(|i| self.tir.ir.inst(i).op) {
                Some(Opcode::Aref) => Opcode::AStore,
                _ => Opcode::HStore,
            };
            self.tir
                .ir
                .emit(Inst::new(op, Ty::Void, Opnd::Ref(r), Opnd::Ref(v)))?;
            if Ty::from_tag(vv.tag()).is_gc() {
                self.tir
                    .ir
                    .emit(Inst::new(Opcode::TBar, Ty::Void, Opnd::Ref(t), Opnd::None))?;
            }
        }
        Ok(())
    }

    fn is_href(&self, r: Operand) -> bool {
        matches!(r.as_var().map(|i| self.tir.ir.inst(i).op), Some(Opcode::Href))
    }

    /// Create the slot for a key which isn't in the table yet. Storing `nil` there is a no-op.
    fn newref(
        &mut self,
        t: Operand,
        k: Operand,
        vv: TValue,
    ) -> Result<Option<Operand>, CompilationError> {
        if vv.is_nil() {
            return Ok(None);
        }
        Ok(Some(self.tir.ir.emit(Inst::new(
            Opcode::NewRef,
            Ty::Ptr,
            Opnd::Ref(t),
            Opnd::Ref(k),
        ))?))
    }
}

#[cfg(test)]
mod test {
    use super::super::test::Harness;
    use super::*;
    use crate::{
        compile::{jit_ir::HINT_KEEPGUARD, record::Recorder, trace::TraceLink},
        params::{JitParams, OptFlags},
        vm::bc::{Op, ProtoBuilder},
    };

    #[test]
    fn globals_are_hash_loads() {
        let mut h = Harness::new();
        let mut b = ProtoBuilder::new("g", 0, 2);
        let kx = b.kstr(&mut h.heap, "x");
        b.ad(Op::GGet, 0, kx);
        b.ad(Op::Ret1, 0, 2);
        let p = b.finish(&mut h.heap);
        let x = TValue::str(h.heap.intern("x"));
        h.globals.as_mut().set(&x, TValue::num(4.0)).unwrap();
        h.enter(p, &[]);
        let mut rec =
            Recorder::new_root(&h.state(p.pc_at(0)), &JitParams::default(), OptFlags::default())
                .unwrap();
        h.record(&mut rec, p.pc_at(1)).unwrap();
        let r = rec.st.get(0).unwrap();
        let l = rec.tir.ir.inst(r.as_var().unwrap());
        assert_eq!((l.op, l.ty, l.guard), (Opcode::HLoad, Ty::Num, true));
        assert_eq!(rec.tir.ir.chain(Opcode::Href).count(), 1);
    }

    #[test]
    fn missing_keys_follow_index_tables() {
        let mut h = Harness::new();
        let base = h.heap.new_table(0, 0);
        let x = TValue::str(h.heap.intern("x"));
        base.as_mut().set(&x, TValue::num(7.0)).unwrap();
        let meta = h.heap.new_table(0, 0);
        let ik = TValue::str(h.heap.intern("__index"));
        meta.as_mut().set(&ik, TValue::tab(base)).unwrap();
        let t = h.heap.new_table(0, 0);
        t.as_mut().set_meta(Some(meta));

        let mut b = ProtoBuilder::new("get", 1, 2);
        let kx = b.kstr(&mut h.heap, "x");
        b.abc(Op::TGetS, 1, 0, kx as u8);
        b.ad(Op::Ret1, 1, 2);
        let p = b.finish(&mut h.heap);
        h.enter(p, &[TValue::tab(t)]);
        let mut rec =
            Recorder::new_root(&h.state(p.pc_at(0)), &JitParams::default(), OptFlags::default())
                .unwrap();
        h.record(&mut rec, p.pc_at(1)).unwrap();
        let r = rec.st.get(1).unwrap();
        let l = rec.tir.ir.inst(r.as_var().unwrap());
        assert_eq!((l.op, l.ty), (Opcode::HLoad, Ty::Num));
        // The miss in `t` must stay a miss.
        let miss = rec
            .tir
            .ir
            .chain(Opcode::HLoad)
            .find(|i| rec.tir.ir.inst(*i).ty == Ty::Nil)
            .unwrap();
        assert!(rec.tir.ir.hint(miss, HINT_KEEPGUARD));
        // The metatable is guarded.
        assert!(rec.tir.ir.chain(Opcode::Eq).count() >= 1);
    }

    #[test]
    fn array_stores_and_loads() {
        let mut h = Harness::new();
        let t = h.heap.new_table(4, 0);
        let mut b = ProtoBuilder::new("set", 2, 3);
        b.abc(Op::TSetV, 1, 0, 1);
        b.abc(Op::TGetV, 2, 0, 1);
        b.ad(Op::Ret1, 2, 2);
        let p = b.finish(&mut h.heap);
        h.enter(p, &[TValue::tab(t), TValue::num(2.0)]);
        let mut rec =
            Recorder::new_root(&h.state(p.pc_at(0)), &JitParams::default(), OptFlags::default())
                .unwrap();
        h.record(&mut rec, p.pc_at(1)).unwrap();
        t.as_mut().set_int(2, TValue::num(2.0));
        h.record(&mut rec, p.pc_at(2)).unwrap();
        assert_eq!(rec.tir.ir.chain(Opcode::AStore).count(), 1);
        // The load is forwarded from the store.
        assert_eq!(rec.tir.ir.chain(Opcode::ALoad).count(), 0);
        assert_eq!(rec.st.get(2), rec.st.get(1));
        // Storing a number needs no write barrier.
        assert_eq!(rec.tir.ir.chain(Opcode::TBar).count(), 0);
    }

    #[test]
    fn new_tables_know_their_keys() {
        let mut h = Harness::new();
        let mut b = ProtoBuilder::new("new", 1, 3);
        let kx = b.kstr(&mut h.heap, "x");
        b.ad(Op::TNew, 1, 0);
        b.abc(Op::TSetS, 0, 1, kx as u8);
        b.abc(Op::TGetS, 2, 1, kx as u8);
        b.ad(Op::Ret1, 2, 2);
        let p = b.finish(&mut h.heap);
        h.enter(p, &[TValue::num(1.0)]);
        let mut rec =
            Recorder::new_root(&h.state(p.pc_at(0)), &JitParams::default(), OptFlags::default())
                .unwrap();
        h.record(&mut rec, p.pc_at(1)).unwrap();
        let t = h.heap.new_table(0, 0);
        h.set(1, TValue::tab(t));
        h.record(&mut rec, p.pc_at(2)).unwrap();
        let x = TValue::str(h.heap.intern("x"));
        t.as_mut().set(&x, TValue::num(1.0)).unwrap();
        h.record(&mut rec, p.pc_at(3)).unwrap();
        // Neither the store nor the load needed a hash lookup.
        assert_eq!(rec.tir.ir.chain(Opcode::Href).count(), 0);
        assert_eq!(rec.tir.ir.chain(Opcode::NewRef).count(), 1);
        assert_eq!(rec.st.get(2), rec.st.get(0));
    }

    #[test]
    fn nil_keys_abort() {
        let mut h = Harness::new();
        let t = h.heap.new_table(0, 0);
        let mut b = ProtoBuilder::new("set", 2, 3);
        b.abc(Op::TSetV, 0, 0, 1);
        b.ad(Op::Ret0, 0, 1);
        let p = b.finish(&mut h.heap);
        h.enter(p, &[TValue::tab(t), TValue::NIL]);
        let mut rec =
            Recorder::new_root(&h.state(p.pc_at(0)), &JitParams::default(), OptFlags::default())
                .unwrap();
        assert!(matches!(
            h.record(&mut rec, p.pc_at(1)),
            Err(CompilationError::TraceError(TraceError::StoreNilKey))
        ));
    }

    /// `function(t, n) local s = 0; for i = 1, n do s = s + t[i] end; return s end`, recorded
    /// over its second iteration.
    fn record_array_sum(h: &mut Harness) -> Recorder {
        let mut b = ProtoBuilder::new("asum", 2, 8);
        b.ad(Op::KShort, 2, 0);
        b.ad(Op::KShort, 3, 1);
        b.ad(Op::Mov, 4, 1);
        b.ad(Op::KShort, 5, 1);
        let fori = b.jmp_fwd(Op::ForI, 3);
        let body = b.here();
        b.abc(Op::TGetV, 7, 0, 6);
        b.abc(Op::AddVV, 2, 2, 7);
        b.jmp_to(Op::ForL, 3, body);
        b.patch_here(fori);
        b.ad(Op::Ret1, 2, 2);
        let p = b.finish(&mut h.heap);
        let t = h.heap.new_table(11, 0);
        for i in 1..=10 {
            t.as_mut().set_int(i, TValue::num(i as f64));
        }
        h.enter(p, &[TValue::tab(t), TValue::num(10.0)]);
        let vals = [1.0, 1.0, 10.0, 1.0, 1.0, 1.0];
        for (s, n) in vals.into_iter().enumerate() {
            h.set(s + 2, TValue::num(n));
        }
        let mut rec =
            Recorder::new_root(&h.state(p.pc_at(8)), &JitParams::default(), OptFlags::default())
                .unwrap();
        h.set(3, TValue::num(2.0));
        h.set(6, TValue::num(2.0));
        assert_eq!(h.record(&mut rec, p.pc_at(6)).unwrap(), None);
        h.set(7, TValue::num(2.0));
        assert_eq!(h.record(&mut rec, p.pc_at(7)).unwrap(), None);
        h.set(2, TValue::num(3.0));
        assert_eq!(h.record(&mut rec, p.pc_at(8)).unwrap(), Some(TraceLink::Loop));
        rec
    }

    #[test]
    fn array_loops_hoist_their_bounds_checks() {
        let mut h = Harness::new();
        let mut rec = record_array_sum(&mut h);
        crate::compile::optimise(&mut rec.tir, OptFlags::default()).unwrap();
        let ir = &rec.tir.ir;
        let l = ir.loop_idx().unwrap();
        let abcs = ir.chain(Opcode::Abc).collect::<Vec<_>>();
        assert!(!abcs.is_empty(), "{}", rec.tir);
        assert!(abcs.iter().all(|i| *i < l), "{}", rec.tir);
        assert!(ir.chain(Opcode::ALoad).any(|i| i > l), "{}", rec.tir);
        assert!(ir.chain(Opcode::Phi).count() >= 1);
    }

    #[test]
    fn recording_is_deterministic() {
        let mut h = Harness::new();
        let a = record_array_sum(&mut h);
        let b = record_array_sum(&mut h);
        assert_eq!(a.tir.to_string(), b.tir.to_string());
    }
}
