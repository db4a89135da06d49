//! Lowering of individual IR instructions.
//!
//! Every lowering follows the same pattern, which the backwards register allocator relies on:
//! first the destination register is fixed (emitting the store to its spill slot, if any), then
//! registers are allocated for the operands, and only then is the instruction's code emitted, last
//! instruction first. Anything that must run before the instruction (reloading spill-only values,
//! materialising constants) is queued as a [super::Setup] and emitted by
//! [Assembler::finish_inst].

use iced_x86::{Code, Instruction};
use smallvec::SmallVec;

use super::{
    class_of,
    regalloc::{Reg, CALLER_SAVED, FP_ALLOC, FP_ARGS, FSCRATCH, GP_ALLOC, GP_ARGS, SCRATCH},
    x64::{mem, Cond},
    Assembler, Src, BASE, CTX,
};
use crate::{
    compile::{
        calls::{key_tag, ArgClass, CallId},
        exit::spill_disp,
        jit_ir::{ConvKind, Const, FpMath, Inst, InstIdx, Opcode, Operand, Opnd, Ty, HINT_MOVTV},
        CompilationError,
    },
    vm::value::Tag,
};

/// An argument of a call-out.
#[derive(Clone, Copy, Debug)]
enum Arg {
    Heap,
    Imm(u64),
    Val(Operand),
}

fn opnd(x: Opnd) -> Operand {
    x.as_ref()
        .unwrap_or_else(|| panic!("expected a reference, got {x:?}"))
}

impl Assembler<'_> {
    pub(super) fn lower(&mut self, i: InstIdx, inst: &Inst) -> Result<(), CompilationError> {
        if inst.guard {
            self.snap_alloc(self.tir.snap_for(i))?;
        }
        match inst.op {
            op if op.is_comparison() => self.cmp(i, inst),
            Opcode::Abc => self.abc(i, inst),
            Opcode::Retf => self.retf(i, inst),
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Min | Opcode::Max => {
                self.arith(i, inst)
            }
            Opcode::Neg | Opcode::Abs => self.sign(i, inst),
            Opcode::Fpmath => self.fpmath(i, inst),
            Opcode::Conv => self.conv(i, inst),
            Opcode::SLoad => {
                let disp = (inst.a.lit() as i32 - 2) * 16;
                self.load_tv(i, inst, None, disp)
            }
            Opcode::ALoad | Opcode::HLoad => self.load_tv(i, inst, Some(opnd(inst.a)), 0),
            Opcode::FLoad => {
                let d = self.dest_reg(i, GP_ALLOC)?;
                let obj = self.reg(opnd(inst.a), GP_ALLOC)?;
                self.x.load(d, mem(obj, inst.field().offset()))
            }
            Opcode::Aref => self.aref(i, inst),
            Opcode::AStore | Opcode::HStore => {
                let r = self.reg(opnd(inst.a), GP_ALLOC)?;
                self.store_tv(r, 0, opnd(inst.b))
            }
            Opcode::Href => {
                let key = opnd(inst.b);
                let tag = key_tag(self.ir.ty_of(key));
                self.call(
                    i,
                    CallId::TabHref,
                    &[Arg::Heap, Arg::Val(opnd(inst.a)), Arg::Val(key), Arg::Imm(tag)],
                )
            }
            Opcode::NewRef => {
                let key = opnd(inst.b);
                let tag = key_tag(self.ir.ty_of(key));
                self.call(
                    i,
                    CallId::TabNewRef,
                    &[Arg::Val(opnd(inst.a)), Arg::Val(key), Arg::Imm(tag)],
                )
            }
            Opcode::TNew => self.call(
                i,
                CallId::TabNew,
                &[
                    Arg::Heap,
                    Arg::Imm(u64::from(inst.a.lit())),
                    Arg::Imm(u64::from(inst.b.lit())),
                ],
            ),
            Opcode::TBar => self.call(i, CallId::TabBarrier, &[Arg::Heap, Arg::Val(opnd(inst.a))]),
            Opcode::Call => {
                let id = inst.call_id();
                let mut args = SmallVec::<[Arg; 6]>::new();
                if id.info().heap {
                    args.push(Arg::Heap);
                }
                self.call_args(inst.a, &mut args);
                self.call(i, id, &args)
            }
            Opcode::Nop
            | Opcode::Loop
            | Opcode::Phi
            | Opcode::PVal
            | Opcode::CArg
            | Opcode::Lt
            | Opcode::Ge
            | Opcode::Le
            | Opcode::Gt
            | Opcode::Ult
            | Opcode::Uge
            | Opcode::Ule
            | Opcode::Ugt
            | Opcode::Eq
            | Opcode::Ne => unreachable!("{}", self.ir.display_inst(i)),
        }
    }

    /// If `x` is a constant which fits in a sign extended 32 bit immediate, return it.
    fn imm32(&self, x: Operand) -> Option<i32> {
        match self.ir.const_of(x)? {
            Const::Num(_) => None,
            c => i32::try_from(c.bits() as i64).ok(),
        }
    }

    fn cmp(&mut self, i: InstIdx, inst: &Inst) -> Result<(), CompilationError> {
        let (a, b) = (opnd(inst.a), opnd(inst.b));
        if self.ir.ty_of(a).is_fp() {
            let ra = self.reg(a, FP_ALLOC)?;
            let rb = self.reg(b, FP_ALLOC)?;
            // `ucomisd x, y` sets the flags like an unsigned comparison of x and y, with
            // unordered operands looking like x < y and x == y at the same time.
            let (swap, exit) = match inst.op {
                Opcode::Lt => (true, Cond::BE),
                Opcode::Ge => (false, Cond::B),
                Opcode::Le => (true, Cond::B),
                Opcode::Gt => (false, Cond::BE),
                Opcode::Ult => (false, Cond::AE),
                Opcode::Uge => (true, Cond::A),
                Opcode::Ule => (false, Cond::A),
                Opcode::Ugt => (true, Cond::AE),
                _ => (false, Cond::NE),
            };
            match inst.op {
                Opcode::Eq => {
                    self.guard_exit(i, Cond::P)?;
                    self.guard_exit(i, Cond::NE)?;
                }
                Opcode::Ne => {
                    let skip = self.x.pos();
                    self.guard_exit(i, Cond::E)?;
                    self.x.jcc_short(Cond::P, skip)?;
                }
                _ => self.guard_exit(i, exit)?,
            }
            let (x, y) = if swap { (rb, ra) } else { (ra, rb) };
            self.x.op_xx(Code::Ucomisd_xmm_xmmm64, x, y)
        } else {
            let cc = match inst.op {
                Opcode::Lt => Cond::L,
                Opcode::Ge => Cond::GE,
                Opcode::Le => Cond::LE,
                Opcode::Gt => Cond::G,
                Opcode::Ult => Cond::B,
                Opcode::Uge => Cond::AE,
                Opcode::Ule => Cond::BE,
                Opcode::Ugt => Cond::A,
                Opcode::Eq => Cond::E,
                _ => Cond::NE,
            };
            let ra = self.reg(a, GP_ALLOC)?;
            match self.imm32(b) {
                Some(k) => {
                    self.guard_exit(i, cc.negate())?;
                    self.x.op_ri(Code::Cmp_rm64_imm32, ra, k)
                }
                None => {
                    let rb = self.reg(b, GP_ALLOC)?;
                    self.guard_exit(i, cc.negate())?;
                    self.x.op_rr(Code::Cmp_r64_rm64, ra, rb)
                }
            }
        }
    }

    /// `ABC asize, idx`: exit unless `idx < asize`, unsigned.
    fn abc(&mut self, i: InstIdx, inst: &Inst) -> Result<(), CompilationError> {
        let (asize, idx) = (opnd(inst.a), opnd(inst.b));
        if let Some(k) = self.imm32(idx) {
            let ra = self.reg(asize, GP_ALLOC)?;
            self.guard_exit(i, Cond::BE)?;
            self.x.op_ri(Code::Cmp_rm64_imm32, ra, k)
        } else if let Some(k) = self.imm32(asize) {
            let ri = self.reg(idx, GP_ALLOC)?;
            self.guard_exit(i, Cond::AE)?;
            self.x.op_ri(Code::Cmp_rm64_imm32, ri, k)
        } else {
            let ra = self.reg(asize, GP_ALLOC)?;
            let ri = self.reg(idx, GP_ALLOC)?;
            self.guard_exit(i, Cond::AE)?;
            self.x.op_rr(Code::Cmp_r64_rm64, ri, ra)
        }
    }

    /// `RETF pc, n`: exit unless the current frame returns to `pc`, then move [BASE] down `n`
    /// slots to the caller's frame.
    fn retf(&mut self, i: InstIdx, inst: &Inst) -> Result<(), CompilationError> {
        let pc = self.const_value(opnd(inst.a)).bits();
        let delta = inst.b.lit() as i32 * 16;
        if delta != 0 {
            self.x.op_ri(Code::Sub_rm64_imm32, BASE, delta)?;
        }
        self.guard_exit(i, Cond::NE)?;
        self.x.push_inst(Instruction::with2(
            Code::Cmp_rm64_r64,
            mem(BASE, -16),
            SCRATCH.to_reg64(),
        ))?;
        self.x.mov_ri(SCRATCH, pc)
    }

    fn arith(&mut self, i: InstIdx, inst: &Inst) -> Result<(), CompilationError> {
        let (a, b) = (opnd(inst.a), opnd(inst.b));
        if inst.ty.is_fp() {
            let d = self.dest_reg(i, FP_ALLOC)?;
            let ra = self.reg(a, FP_ALLOC)?;
            let rb = self.reg(b, FP_ALLOC)?;
            // MIN and MAX return their second operand if the comparison fails, NaNs included.
            let (code, first, second) = match inst.op {
                Opcode::Add => (Code::Addsd_xmm_xmmm64, ra, rb),
                Opcode::Sub => (Code::Subsd_xmm_xmmm64, ra, rb),
                Opcode::Mul => (Code::Mulsd_xmm_xmmm64, ra, rb),
                Opcode::Div => (Code::Divsd_xmm_xmmm64, ra, rb),
                Opcode::Min => (Code::Minsd_xmm_xmmm64, rb, ra),
                Opcode::Max => (Code::Maxsd_xmm_xmmm64, rb, ra),
                op => unreachable!("{op}"),
            };
            self.x.op_xx(code, d, second)?;
            self.x.mov_rr(d, first)
        } else {
            let d = self.dest_reg(i, GP_ALLOC)?;
            let ra = self.reg(a, GP_ALLOC)?;
            match self.imm32(b) {
                Some(k) if inst.op == Opcode::Mul => self.x.push_inst(Instruction::with3(
                    Code::Imul_r64_rm64_imm32,
                    d.to_reg64(),
                    ra.to_reg64(),
                    k,
                )),
                Some(k) => {
                    let code = match inst.op {
                        Opcode::Add => Code::Add_rm64_imm32,
                        Opcode::Sub => Code::Sub_rm64_imm32,
                        op => unreachable!("{op} on integers"),
                    };
                    self.x.op_ri(code, d, k)?;
                    self.x.mov_rr(d, ra)
                }
                None => {
                    let rb = self.reg(b, GP_ALLOC)?;
                    let code = match inst.op {
                        Opcode::Add => Code::Add_r64_rm64,
                        Opcode::Sub => Code::Sub_r64_rm64,
                        Opcode::Mul => Code::Imul_r64_rm64,
                        op => unreachable!("{op} on integers"),
                    };
                    self.x.op_rr(code, d, rb)?;
                    self.x.mov_rr(d, ra)
                }
            }
        }
    }

    /// NEG and ABS flip or clear the sign bit.
    fn sign(&mut self, i: InstIdx, inst: &Inst) -> Result<(), CompilationError> {
        let d = self.dest_reg(i, FP_ALLOC)?;
        let ra = self.reg(opnd(inst.a), FP_ALLOC)?;
        let (code, mask) = match inst.op {
            Opcode::Neg => (Code::Xorps_xmm_xmmm128, 0x8000_0000_0000_0000),
            _ => (Code::Andps_xmm_xmmm128, 0x7fff_ffff_ffff_ffff),
        };
        self.x.op_xx(code, d, FSCRATCH)?;
        self.x.mov_rr(d, ra)?;
        self.x.mov_rr(FSCRATCH, SCRATCH)?;
        self.x.mov_ri(SCRATCH, mask)
    }

    fn fpmath(&mut self, i: InstIdx, inst: &Inst) -> Result<(), CompilationError> {
        let d = self.dest_reg(i, FP_ALLOC)?;
        let ra = self.reg(opnd(inst.a), FP_ALLOC)?;
        let round = |mode: u32| {
            Instruction::with3(Code::Roundsd_xmm_xmmm64_imm8, d.to_xmm(), ra.to_xmm(), mode)
        };
        match FpMath::from_repr(inst.b.lit() as u8) {
            Some(FpMath::Floor) => self.x.push_inst(round(9)),
            Some(FpMath::Ceil) => self.x.push_inst(round(10)),
            Some(FpMath::Sqrt) => self.x.op_xx(Code::Sqrtsd_xmm_xmmm64, d, ra),
            None => unreachable!(),
        }
    }

    fn conv(&mut self, i: InstIdx, inst: &Inst) -> Result<(), CompilationError> {
        match ConvKind::from_repr(inst.b.lit() as u8) {
            Some(ConvKind::IntToNum) => {
                let d = self.dest_reg(i, FP_ALLOC)?;
                let ra = self.reg(opnd(inst.a), GP_ALLOC)?;
                self.x.push_inst(Instruction::with2(
                    Code::Cvtsi2sd_xmm_rm64,
                    d.to_xmm(),
                    ra.to_reg64(),
                ))
            }
            Some(ConvKind::NumToInt) => {
                let d = self.dest_reg(i, GP_ALLOC)?;
                let ra = self.reg(opnd(inst.a), FP_ALLOC)?;
                if inst.guard {
                    // Convert back and compare: exit if the number wasn't an integer.
                    self.guard_exit(i, Cond::P)?;
                    self.guard_exit(i, Cond::NE)?;
                    self.x.op_xx(Code::Ucomisd_xmm_xmmm64, FSCRATCH, ra)?;
                    self.x.push_inst(Instruction::with2(
                        Code::Cvtsi2sd_xmm_rm64,
                        FSCRATCH.to_xmm(),
                        d.to_reg64(),
                    ))?;
                }
                self.x.push_inst(Instruction::with2(
                    Code::Cvttsd2si_r64_xmmm64,
                    d.to_reg64(),
                    ra.to_xmm(),
                ))
            }
            None => unreachable!(),
        }
    }

    /// A typed load of the value at `[base + disp]`, where `base` is [BASE] if `None`. Guarded
    /// loads check the tag first. Loads whose value is only ever copied load nothing.
    fn load_tv(
        &mut self,
        i: InstIdx,
        inst: &Inst,
        base: Option<Operand>,
        disp: i32,
    ) -> Result<(), CompilationError> {
        let payload = !self.ir.hint(i, HINT_MOVTV) && class_of(inst.ty).is_some();
        let d = if payload { self.dest(i)? } else { None };
        let b = match base {
            Some(x) => self.reg(x, GP_ALLOC)?,
            None => BASE,
        };
        if let Some(d) = d {
            self.x.load(d, mem(b, disp))?;
        }
        if inst.guard {
            let tag = inst
                .ty
                .tag()
                .unwrap_or_else(|| panic!("type check of {}", self.ir.display_inst(i)));
            self.guard_exit(i, Cond::NE)?;
            self.x.push_inst(Instruction::with2(
                Code::Cmp_rm64_imm32,
                mem(b, disp + 8),
                tag as i32,
            ))?;
        }
        Ok(())
    }

    /// `AREF arr, idx`: the address of element `idx` of the array part `arr`.
    fn aref(&mut self, i: InstIdx, inst: &Inst) -> Result<(), CompilationError> {
        let d = self.dest_reg(i, GP_ALLOC)?;
        let arr = self.reg(opnd(inst.a), GP_ALLOC)?;
        let idx = opnd(inst.b);
        match self.imm32(idx).and_then(|k| k.checked_mul(16)) {
            Some(disp) => self.x.push_inst(Instruction::with2(
                Code::Lea_r64_m,
                d.to_reg64(),
                mem(arr, disp),
            )),
            None => {
                let ri = self.reg(idx, GP_ALLOC)?;
                self.x.op_rr(Code::Add_r64_rm64, d, arr)?;
                self.x.push_inst(Instruction::with2(Code::Shl_rm64_imm8, d.to_reg64(), 4u32))?;
                self.x.mov_rr(d, ri)
            }
        }
    }

    /// The register and displacement of the memory an untyped load reads.
    fn movtv_src(&mut self, l: InstIdx) -> Result<(Reg, i32), CompilationError> {
        let inst = *self.ir.inst(l);
        match inst.op {
            Opcode::SLoad => Ok((BASE, (inst.a.lit() as i32 - 2) * 16)),
            _ => Ok((self.reg(opnd(inst.a), GP_ALLOC)?, 0)),
        }
    }

    /// Store `v` as a tagged value at `[base + disp]`. Integers are stored as numbers.
    pub(super) fn store_tv(
        &mut self,
        base: Reg,
        disp: i32,
        v: Operand,
    ) -> Result<(), CompilationError> {
        let ir = self.ir;
        if let Operand::Var(l) = v {
            if ir.hint(l, HINT_MOVTV) {
                let (src, sdisp) = self.movtv_src(l)?;
                self.x.push_inst(Instruction::with2(
                    Code::Movups_xmmm128_xmm,
                    mem(base, disp),
                    FSCRATCH.to_xmm(),
                ))?;
                return self.x.push_inst(Instruction::with2(
                    Code::Movups_xmm_xmmm128,
                    FSCRATCH.to_xmm(),
                    mem(src, sdisp),
                ));
            }
        }
        let ty = ir.ty_of(v);
        let tag = match ir.const_of(v) {
            Some(Const::Link(tag, _)) => *tag,
            _ if ty == Ty::Int => Tag::Num,
            _ => ty
                .tag()
                .unwrap_or_else(|| panic!("{} can't be stored", ir.display_operand(v))),
        };
        let src = match v {
            Operand::Var(x) if class_of(ty).is_some() => Some(self.use_var(x, None)?),
            _ => None,
        };
        let m = mem(base, disp);
        self.x.store_i32(mem(base, disp + 8), tag as i32)?;
        match src {
            Some(r) if ty == Ty::Int => {
                self.x.store(m, FSCRATCH)?;
                self.x.push_inst(Instruction::with2(
                    Code::Cvtsi2sd_xmm_rm64,
                    FSCRATCH.to_xmm(),
                    r.to_reg64(),
                ))
            }
            Some(r) => self.x.store(m, r),
            None => {
                let bits = match self.const_value(v) {
                    Const::Int(n) => (n as f64).to_bits(),
                    c => c.bits(),
                };
                match i32::try_from(bits as i64) {
                    Ok(k) => self.x.store_i32(m, k),
                    Err(_) => {
                        self.x.store(m, SCRATCH)?;
                        self.x.mov_ri(SCRATCH, bits)
                    }
                }
            }
        }
    }

    /// Flatten the argument chain of a [Opcode::Call].
    fn call_args(&self, x: Opnd, out: &mut SmallVec<[Arg; 6]>) {
        match x {
            Opnd::Ref(Operand::Var(c)) if self.ir.inst(c).op == Opcode::CArg => {
                let carg = self.ir.inst(c);
                self.call_args(carg.a, out);
                self.call_args(carg.b, out);
            }
            Opnd::Ref(x) => out.push(Arg::Val(x)),
            _ => (),
        }
    }

    /// Call out to `id`. Values live across the call in registers the call clobbers are evicted,
    /// except pinned values, which are saved and restored around the call.
    fn call(&mut self, i: InstIdx, id: CallId, args: &[Arg]) -> Result<(), CompilationError> {
        let ci = id.info();
        debug_assert_eq!(ci.args.len(), args.len(), "{id}");
        let ret = if ci.ret.is_fp() { Reg::XMM0 } else { Reg::RAX };
        let rsp = self.regsp[i];
        if let Some(d) = rsp.reg {
            self.rs.release(d);
            self.pinned = self.pinned.without(d);
        }

        let mut saves = SmallVec::<[(Reg, u16); 4]>::new();
        for r in self.rs.used().intersect(CALLER_SAVED).iter() {
            if self.pinned.contains(r) {
                let s = self.fresh_slot()?;
                self.x.load(r, mem(CTX, spill_disp(s)))?;
                saves.push((r, s));
            } else if let Some(v) = self.rs.occupant(r) {
                self.evict(r, v)?;
            }
        }
        if ci.ret != Ty::Void {
            if let Some(d) = rsp.reg {
                self.x.mov_rr(d, ret)?;
            }
            if let Some(s) = rsp.spill {
                self.x.store(mem(CTX, spill_disp(s)), ret)?;
            }
        }
        self.x
            .push_inst(Instruction::with1(Code::Call_rm64, SCRATCH.to_reg64()))?;
        self.x.mov_ri(SCRATCH, ci.addr as u64)?;

        let (mut ngp, mut nfp) = (0, 0);
        let mut moves = SmallVec::<[(Reg, Src); 6]>::new();
        for (arg, class) in args.iter().zip(ci.args) {
            let areg = match class {
                ArgClass::Gp => {
                    ngp += 1;
                    GP_ARGS[ngp - 1]
                }
                ArgClass::Fp => {
                    nfp += 1;
                    FP_ARGS[nfp - 1]
                }
            };
            let src = match *arg {
                Arg::Heap => Src::Heap,
                Arg::Imm(k) => Src::Const(Const::Int(k as i64)),
                Arg::Val(Operand::Var(v)) if class_of(self.ir.inst(v).ty).is_some() => {
                    Src::Reg(self.use_var(v, Some(areg))?)
                }
                Arg::Val(x) => Src::Const(self.const_value(x)),
            };
            moves.push((areg, src));
        }
        self.parallel_move(&moves)?;
        for (r, s) in saves {
            self.x.store(mem(CTX, spill_disp(s)), r)?;
        }
        self.x.comment(&format!("call {id}"));
        Ok(())
    }
}
