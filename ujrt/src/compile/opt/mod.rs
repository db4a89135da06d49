// Whole-trace optimisation passes.
//
// Folding, CSE and load forwarding happen as instructions are emitted (see
// [super::jit_ir::fold]). The passes in this module run once recording has finished, in the order
// [super::optimise] calls them: dead code elimination, loop optimisation, allocation sinking and
// finally the MOVTV pass which turns typed load/store pairs into untyped copies.

pub(crate) mod dce;
pub(crate) mod loop_opt;
pub(crate) mod movtv;
pub(crate) mod sink;

#[cfg(test)]
pub(crate) mod test_util {
    use crate::{
        compile::{
            jit_ir::{Inst, Opcode, Operand, Opnd, Ty, SLOAD_TYPECHECK},
            trace::TraceIr,
        },
        params::OptFlags,
        vm::{
            bc::{Op, Pc, ProtoBuilder},
            heap::Heap,
        },
    };
    use fm::FMBuilder;
    use regex::Regex;

    /// A heap and a `pc` for snapshots to resume at. The heap owns the prototype `pc` points
    /// into, so it must outlive the test.
    pub(crate) fn setup() -> (Heap, Pc) {
        let mut heap = Heap::new();
        let mut b = ProtoBuilder::new("f", 0, 8);
        b.ad(Op::Ret0, 0, 1);
        let p = b.finish(&mut heap);
        (heap, p.pc_at(1))
    }

    pub(crate) fn tir(pc: Pc) -> TraceIr {
        TraceIr::new(pc, 1000, 100, OptFlags::default())
    }

    pub(crate) fn sload(tir: &mut TraceIr, slot: u32, ty: Ty) -> Operand {
        Operand::Var(
            tir.ir
                .push(Inst::guarded(
                    Opcode::SLoad,
                    ty,
                    Opnd::Lit(slot),
                    Opnd::Lit(SLOAD_TYPECHECK),
                ))
                .unwrap(),
        )
    }

    /// Check the textual form of `tir` against the `fm` pattern `ptn`. `{{x}}` names a number
    /// which must be the same wherever `x` is used.
    pub(crate) fn assert_ir(tir: &TraceIr, ptn: &str) {
        let fmm = FMBuilder::new(ptn)
            .unwrap()
            .name_matcher(Regex::new(r"\{\{.+?\}\}").unwrap(), Regex::new(r"[0-9]+").unwrap())
            .build()
            .unwrap();
        if let Err(e) = fmm.matches(&tir.to_string()) {
            panic!("{e}");
        }
    }
}
