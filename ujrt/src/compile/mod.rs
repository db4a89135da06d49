//! The trace compiler: recording, optimisation and assembly of traces.
//!
//! A trace is built in three phases, each of which can fail with a [CompilationError]:
//!
//!   1. [record]: bytecode executed by the interpreter is turned, instruction by instruction,
//!      into [jit_ir] instructions plus [snap]shots describing how to get back to the
//!      interpreter at each guard.
//!   2. [opt]: whole-trace passes (dead code elimination, loop optimisation, sinking and untyped
//!      copy hints).
//!   3. [asm]: the IR is turned into x86_64 machine code in a backwards pass.
//!
//! [optimise] and [asm::assemble] are the glue between these phases: the trace compiler state
//! machine in [crate::mt] calls them once recording has finished.

use std::error::Error;
use strum::EnumCount;
use thiserror::Error;

use crate::{
    log::{log_ir, should_log_ir, IRPhase},
    params::{Opt, OptFlags},
    vm::{bc::Op, builtins::FfId},
};

pub(crate) mod asm;
pub(crate) mod calls;
mod effects;
pub(crate) mod exit;
pub(crate) mod jit_ir;
pub(crate) mod opt;
pub(crate) mod record;
pub(crate) mod snap;
pub(crate) mod trace;

use trace::{TraceIr, TraceLink};

/// Why recording a trace was abandoned. None of these are errors from the user's point of view:
/// they all lead to the location being penalised and the interpreter carrying on.
#[derive(Clone, Copy, Debug, EnumCount, Error, PartialEq, Eq)]
pub(crate) enum TraceError {
    #[error("trace too long")]
    RecordLen,
    #[error("trace too deep")]
    StackOverflow,
    #[error("too many snapshots")]
    SnapshotOverflow,
    #[error("blacklisted")]
    BlacklistedSite,
    #[error("NYI: bytecode {0}")]
    NotYetImplemented(Op),
    #[error("NYI: builtin {0}")]
    NotYetImplementedFf(FfId),
    #[error("leaving loop in root trace")]
    LoopLeft,
    #[error("inner loop in root trace")]
    InnerLoop,
    #[error("loop unroll limit reached")]
    LoopUnroll,
    #[error("call unroll limit reached")]
    CallUnroll,
    #[error("down-recursion, restarting")]
    DownRecursion,
    #[error("NYI: metamethod")]
    NoMetamethod,
    #[error("loop in index chain")]
    IndexLoop,
    #[error("table index is nil or NaN")]
    StoreNilKey,
    #[error("bad argument type")]
    BadType,
    #[error("NYI: return to lower frame")]
    ReturnToLowerFrameNyi,
    #[error("caller has JIT disabled")]
    CallerJitDisabled,
    #[error("guard would always fail")]
    GuardAlwaysFails,
    #[error("too many constants")]
    TraceTooManyConsts,
    #[error("too many traces")]
    TooManyTraces,
    #[error("aborted on request")]
    AsyncAbort,
    #[error("type instability in loop")]
    TypeInstable,
    #[error("NYI: trace stitching")]
    Stitch,
    #[error("NYI: side trace from an exit with sunk allocations")]
    SunkReplay,
}

/// A resource the assembler ran out of.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub(crate) enum ResourceError {
    #[error("too many spill slots")]
    SpillOverflow,
    #[error("too many values live in registers at once")]
    RegisterPressure,
    /// The current machine code area is full. Assembly can be retried in a fresh area.
    #[error("machine code area full")]
    McodeOverflow,
    /// All the machine code memory the JIT may use is in use.
    #[error("machine code limit reached")]
    McodeLimit,
    #[error("too many exits")]
    ExitLimit,
}

/// A failure to compile a trace.
#[derive(Debug, Error)]
pub(crate) enum CompilationError {
    /// Recording was abandoned: the location will be penalised.
    #[error("{0}")]
    TraceError(TraceError),
    /// The assembler ran out of a resource.
    #[error("{0}")]
    ResourceExhausted(ResourceError),
    /// An index space in the IR or snapshot store overflowed.
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),
    /// Something went wrong which can't be recovered from.
    #[error("fatal: {0}")]
    Fatal(Box<dyn Error>),
}

impl From<TraceError> for CompilationError {
    fn from(e: TraceError) -> Self {
        CompilationError::TraceError(e)
    }
}

impl From<ResourceError> for CompilationError {
    fn from(e: ResourceError) -> Self {
        CompilationError::ResourceExhausted(e)
    }
}

impl CompilationError {
    /// The [TraceError] to penalise the starting location with.
    pub(crate) fn penalty_reason(&self) -> Option<TraceError> {
        match self {
            CompilationError::TraceError(TraceError::AsyncAbort) => None,
            CompilationError::TraceError(e) => Some(*e),
            CompilationError::ResourceExhausted(_) | CompilationError::LimitExceeded(_) => {
                Some(TraceError::RecordLen)
            }
            CompilationError::Fatal(_) => None,
        }
    }
}

/// Run the whole-trace optimisation passes over a freshly recorded trace.
///
/// If loop optimisation fails because the loop is not type stable, the trace is turned into one
/// which simply jumps back to its own start.
pub(crate) fn optimise(tir: &mut TraceIr, opt: OptFlags) -> Result<(), CompilationError> {
    if should_log_ir(IRPhase::PreOpt) {
        log_ir(&format!("--- Begin jit-pre-opt ---\n{tir}--- End jit-pre-opt ---\n"));
    }
    if opt.has(Opt::Dce) {
        opt::dce::dce(tir);
    }
    if tir.link == TraceLink::Loop && opt.has(Opt::Loop) {
        match opt::loop_opt::loop_opt(tir, opt) {
            Ok(()) => (),
            Err(CompilationError::TraceError(TraceError::TypeInstable)) => {
                opt::loop_opt::undo(tir);
            }
            Err(e) => return Err(e),
        }
    }
    if opt.has(Opt::Sink) {
        opt::sink::sink(tir);
    }
    if opt.has(Opt::Movtv) {
        opt::movtv::movtv(tir);
    }
    tir.ir.assert_well_formed();
    if should_log_ir(IRPhase::PostOpt) {
        log_ir(&format!("--- Begin jit-post-opt ---\n{tir}--- End jit-post-opt ---\n"));
    }
    if should_log_ir(IRPhase::Snapshots) {
        log_ir(&format!(
            "--- Begin jit-snapshots ---\n{}--- End jit-snapshots ---\n",
            tir.display_snaps()
        ));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn penalties() {
        let e = CompilationError::from(TraceError::LoopUnroll);
        assert_eq!(e.penalty_reason(), Some(TraceError::LoopUnroll));
        assert_eq!(
            CompilationError::from(TraceError::AsyncAbort).penalty_reason(),
            None
        );
        assert_eq!(
            CompilationError::from(ResourceError::SpillOverflow).to_string(),
            "too many spill slots"
        );
        assert_eq!(
            TraceError::NotYetImplemented(Op::Cat).to_string(),
            "NYI: bytecode CAT"
        );
        assert!(TraceError::COUNT > 20);
    }
}
